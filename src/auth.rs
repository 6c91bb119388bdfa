// Authentication - HS256 App Tokens With Single-Use Replay Protection
// Per-app HMAC keys resolved by kid; jti uniqueness enforced by the database

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use jsonwebtoken::{decode, decode_header, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::core::{is_unique_violation, BillingError, BillingResult};
use crate::secrets::{SecretStatus, SecretStore};

pub const AUDIENCE: &str = "billing-service";

pub const DEFAULT_SCOPES: &[&str] = &["usage:write", "billing:read", "entitlements:read"];

/// Claims carried by app-signed tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub iss: String,
    pub aud: String,
    pub sub: String,
    #[serde(rename = "appId")]
    pub app_id: Uuid,
    #[serde(rename = "teamId", skip_serializing_if = "Option::is_none")]
    pub team_id: Option<Uuid>,
    #[serde(rename = "userId", skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub scopes: Vec<String>,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
    pub kid: String,
    /// Accepted but not enforced; reserved for per-request binding.
    #[serde(rename = "reqHash", skip_serializing_if = "Option::is_none")]
    pub req_hash: Option<String>,
}

impl Claims {
    pub fn issuer_for(app_id: Uuid) -> String {
        format!("app:{app_id}")
    }
}

/// Sign a token for an app the way client SDKs do. Scopes default to the
/// standard triple when empty.
pub fn sign_jwt(secret: &str, mut claims: Claims) -> BillingResult<String> {
    if claims.scopes.is_empty() {
        claims.scopes = DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect();
    }

    let mut header = Header::new(Algorithm::HS256);
    header.kid = Some(claims.kid.clone());

    encode(&header, &claims, &EncodingKey::from_secret(secret.as_bytes()))
        .map_err(|e| BillingError::Crypto(format!("failed to sign token: {e}")))
}

// Token verification plus admin-key checking
pub struct AuthService {
    db_pool: PgPool,
    secrets: Arc<SecretStore>,
    admin_api_key: String,
}

impl AuthService {
    pub fn new(db_pool: PgPool, secrets: Arc<SecretStore>, admin_api_key: String) -> Self {
        Self {
            db_pool,
            secrets,
            admin_api_key,
        }
    }

    /// Full bearer-token verification pipeline. Fails fast with 401-mapped
    /// errors; on success the jti has been consumed and the claims are safe to
    /// attach to the request.
    pub async fn verify_bearer(&self, token: &str) -> BillingResult<Claims> {
        let header = decode_header(token)
            .map_err(|_| BillingError::Unauthorized("Malformed token".to_string()))?;

        if header.alg != Algorithm::HS256 {
            return Err(BillingError::Unauthorized(
                "Unsupported token algorithm".to_string(),
            ));
        }
        let kid = header
            .kid
            .ok_or_else(|| BillingError::Unauthorized("Token has no kid".to_string()))?;

        let resolved = self
            .secrets
            .resolve(&kid)
            .await?
            .ok_or_else(|| BillingError::Unauthorized("Unknown signing key".to_string()))?;
        if resolved.status != SecretStatus::Active {
            return Err(BillingError::Unauthorized(
                "Signing key has been revoked".to_string(),
            ));
        }

        let claims = decode_claims(token, &resolved.secret)?;

        let now = Utc::now().timestamp();
        if claims.iss != Claims::issuer_for(claims.app_id) {
            return Err(BillingError::Unauthorized("Invalid issuer".to_string()));
        }
        if claims.iat > now {
            return Err(BillingError::Unauthorized(
                "Token issued in the future".to_string(),
            ));
        }
        if claims.jti.is_empty() {
            return Err(BillingError::Unauthorized("Token has no jti".to_string()));
        }
        if claims.kid != kid {
            return Err(BillingError::Unauthorized(
                "Token kid does not match header".to_string(),
            ));
        }
        if claims.app_id != resolved.app_id {
            return Err(BillingError::Unauthorized(
                "Token appId does not match signing key".to_string(),
            ));
        }
        if claims.sub.is_empty() {
            return Err(BillingError::Unauthorized("Token has no subject".to_string()));
        }

        self.consume_jti(&claims).await?;

        Ok(claims)
    }

    /// The jti unique index is the replay-protection serialization point; no
    /// in-memory cache is consulted.
    async fn consume_jti(&self, claims: &Claims) -> BillingResult<()> {
        let expires_at = Utc
            .timestamp_opt(claims.exp, 0)
            .single()
            .ok_or_else(|| BillingError::Unauthorized("Invalid exp claim".to_string()))?;

        let inserted = sqlx::query("INSERT INTO jti_usage (jti, expires_at) VALUES ($1, $2)")
            .bind(&claims.jti)
            .bind(expires_at)
            .execute(&self.db_pool)
            .await;

        match inserted {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(BillingError::Unauthorized(
                "Token has already been used".to_string(),
            )),
            Err(e) => Err(e.into()),
        }
    }

    /// Constant-time admin key comparison.
    pub fn check_admin_key(&self, provided: &str) -> bool {
        ring::constant_time::verify_slices_are_equal(
            provided.as_bytes(),
            self.admin_api_key.as_bytes(),
        )
        .is_ok()
    }
}

/// Decode and validate the signed portion of a token: signature (constant-time
/// inside the library), audience, expiry with zero leeway.
pub fn decode_claims(token: &str, secret: &str) -> BillingResult<Claims> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_audience(&[AUDIENCE]);
    validation.validate_exp = true;
    validation.leeway = 0;
    validation.set_required_spec_claims(&["exp", "aud"]);

    let data = decode::<Claims>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation)
        .map_err(|e| BillingError::Unauthorized(short_token_error(&e)))?;

    Ok(data.claims)
}

fn short_token_error(err: &jsonwebtoken::errors::Error) -> String {
    use jsonwebtoken::errors::ErrorKind;
    match err.kind() {
        ErrorKind::ExpiredSignature => "Token expired".to_string(),
        ErrorKind::InvalidSignature => "Invalid signature".to_string(),
        ErrorKind::InvalidAudience => "Invalid audience".to_string(),
        ErrorKind::Json(_) | ErrorKind::MissingRequiredClaim(_) => {
            "Malformed claims".to_string()
        }
        _ => "Invalid token".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn claims_for(app_id: Uuid, kid: &str, jti: &str) -> Claims {
        let now = Utc::now().timestamp();
        Claims {
            iss: Claims::issuer_for(app_id),
            aud: AUDIENCE.to_string(),
            sub: format!("app:{app_id}"),
            app_id,
            team_id: None,
            user_id: None,
            scopes: vec![],
            iat: now,
            exp: now + 300,
            jti: jti.to_string(),
            kid: kid.to_string(),
            req_hash: None,
        }
    }

    #[test]
    fn test_sign_then_decode_preserves_claims() {
        let app_id = Uuid::new_v4();
        let token = sign_jwt("s3cret", claims_for(app_id, "kid_abc", "jti-1")).unwrap();

        let decoded = decode_claims(&token, "s3cret").unwrap();
        assert_eq!(decoded.app_id, app_id);
        assert_eq!(decoded.iss, format!("app:{app_id}"));
        assert_eq!(decoded.aud, AUDIENCE);
        assert_eq!(decoded.jti, "jti-1");
        assert_eq!(decoded.kid, "kid_abc");
        // unset scopes were defaulted at signing time
        assert_eq!(decoded.scopes, DEFAULT_SCOPES.to_vec());

        let header = decode_header(&token).unwrap();
        assert_eq!(header.alg, Algorithm::HS256);
        assert_eq!(header.kid.as_deref(), Some("kid_abc"));
    }

    #[test]
    fn test_decode_rejects_wrong_secret() {
        let token = sign_jwt("right", claims_for(Uuid::new_v4(), "k", "j")).unwrap();
        let err = decode_claims(&token, "wrong").unwrap_err();
        assert_matches!(err, BillingError::Unauthorized(m) if m == "Invalid signature");
    }

    #[test]
    fn test_decode_rejects_expired() {
        let mut claims = claims_for(Uuid::new_v4(), "k", "j");
        claims.iat -= 600;
        claims.exp = claims.iat + 60;
        let token = sign_jwt("s", claims).unwrap();
        let err = decode_claims(&token, "s").unwrap_err();
        assert_matches!(err, BillingError::Unauthorized(m) if m == "Token expired");
    }

    #[test]
    fn test_decode_rejects_wrong_audience() {
        let mut claims = claims_for(Uuid::new_v4(), "k", "j");
        claims.aud = "someone-else".to_string();
        let token = sign_jwt("s", claims).unwrap();
        let err = decode_claims(&token, "s").unwrap_err();
        assert_matches!(err, BillingError::Unauthorized(m) if m == "Invalid audience");
    }

    #[test]
    fn test_decode_rejects_tampered_payload() {
        let token = sign_jwt("s", claims_for(Uuid::new_v4(), "k", "j")).unwrap();
        let mut parts: Vec<String> = token.split('.').map(str::to_string).collect();
        // flip a character inside the payload segment
        let mut payload: Vec<u8> = parts[1].clone().into_bytes();
        payload[0] = if payload[0] == b'A' { b'B' } else { b'A' };
        parts[1] = String::from_utf8(payload).unwrap();
        let tampered = parts.join(".");

        assert!(decode_claims(&tampered, "s").is_err());
    }

    #[test]
    fn test_issuer_format() {
        let app_id = Uuid::new_v4();
        assert_eq!(Claims::issuer_for(app_id), format!("app:{app_id}"));
    }
}
