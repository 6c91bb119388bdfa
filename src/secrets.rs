// App Secret Management - HMAC Signing Keys Encrypted At Rest
// AES-256-GCM sealed secrets, minted once and revocable per kid

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::Serialize;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::core::{BillingError, BillingResult};

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// AES-256-GCM cipher for secrets at rest. Stored form is
/// `hex(iv):hex(tag):hex(ciphertext)`.
#[derive(Clone)]
pub struct SecretCipher {
    cipher: Aes256Gcm,
}

impl SecretCipher {
    pub fn new(key: &[u8; 32]) -> BillingResult<Self> {
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|_| BillingError::Crypto("invalid AES-256 key length".to_string()))?;
        Ok(Self { cipher })
    }

    pub fn encrypt(&self, plaintext: &str) -> BillingResult<String> {
        let mut iv = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut iv);

        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&iv), plaintext.as_bytes())
            .map_err(|_| BillingError::Crypto("AES-GCM encryption failed".to_string()))?;

        // aes-gcm appends the 16-byte tag to the ciphertext
        let split = sealed.len() - TAG_LEN;
        let (ciphertext, tag) = sealed.split_at(split);

        Ok(format!(
            "{}:{}:{}",
            hex::encode(iv),
            hex::encode(tag),
            hex::encode(ciphertext)
        ))
    }

    pub fn decrypt(&self, stored: &str) -> BillingResult<String> {
        let parts: Vec<&str> = stored.split(':').collect();
        if parts.len() != 3 {
            return Err(BillingError::Crypto(
                "stored secret is not iv:tag:ciphertext".to_string(),
            ));
        }

        let iv = hex::decode(parts[0])
            .map_err(|_| BillingError::Crypto("stored secret iv is not hex".to_string()))?;
        let tag = hex::decode(parts[1])
            .map_err(|_| BillingError::Crypto("stored secret tag is not hex".to_string()))?;
        let ciphertext = hex::decode(parts[2])
            .map_err(|_| BillingError::Crypto("stored secret body is not hex".to_string()))?;

        if iv.len() != NONCE_LEN || tag.len() != TAG_LEN {
            return Err(BillingError::Crypto(
                "stored secret has malformed iv or tag".to_string(),
            ));
        }

        let mut sealed = ciphertext;
        sealed.extend_from_slice(&tag);

        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&iv), sealed.as_ref())
            .map_err(|_| BillingError::Crypto("AES-GCM decryption failed".to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|_| BillingError::Crypto("decrypted secret is not UTF-8".to_string()))
    }
}

/// The one response that ever carries the plaintext secret.
#[derive(Debug, Clone, Serialize)]
pub struct MintedSecret {
    pub kid: String,
    pub secret: String,
    pub app_id: Uuid,
}

/// A kid resolved for token verification.
#[derive(Debug, Clone)]
pub struct ResolvedSecret {
    pub kid: String,
    pub app_id: Uuid,
    pub status: SecretStatus,
    pub secret: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretStatus {
    Active,
    Revoked,
}

impl SecretStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Revoked => "REVOKED",
        }
    }

    pub fn parse(s: &str) -> BillingResult<Self> {
        match s {
            "ACTIVE" => Ok(Self::Active),
            "REVOKED" => Ok(Self::Revoked),
            other => Err(BillingError::Internal(format!(
                "invalid secret status: {other}"
            ))),
        }
    }
}

// Secret lifecycle over Postgres
pub struct SecretStore {
    db_pool: PgPool,
    cipher: SecretCipher,
}

impl SecretStore {
    pub fn new(db_pool: PgPool, cipher: SecretCipher) -> Self {
        Self { db_pool, cipher }
    }

    /// Mint a fresh HMAC secret for an app. The plaintext is returned exactly
    /// once; only the AES-GCM sealed form is persisted.
    pub async fn mint(&self, app_id: Uuid) -> BillingResult<MintedSecret> {
        let app_exists = sqlx::query("SELECT id FROM apps WHERE id = $1")
            .bind(app_id)
            .fetch_optional(&self.db_pool)
            .await?;
        if app_exists.is_none() {
            return Err(BillingError::AppNotFound(app_id));
        }

        let kid = format!("kid_{}", random_hex(12));
        let secret = format!("whsec_{}", random_hex(32));
        let ciphertext = self.cipher.encrypt(&secret)?;

        sqlx::query(
            r#"
            INSERT INTO app_secrets (kid, app_id, secret_ciphertext, status)
            VALUES ($1, $2, $3, 'ACTIVE')
            "#,
        )
        .bind(&kid)
        .bind(app_id)
        .bind(&ciphertext)
        .execute(&self.db_pool)
        .await?;

        tracing::info!(%app_id, kid, "🔑 Minted app secret");

        Ok(MintedSecret {
            kid,
            secret,
            app_id,
        })
    }

    pub async fn revoke(&self, app_id: Uuid, kid: &str) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE app_secrets
            SET status = 'REVOKED', revoked_at = NOW()
            WHERE kid = $1 AND app_id = $2 AND status = 'ACTIVE'
            "#,
        )
        .bind(kid)
        .bind(app_id)
        .execute(&self.db_pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::Validation(vec![crate::core::FieldIssue::new(
                "kid",
                "unknown, revoked, or not owned by this app",
            )]));
        }

        tracing::info!(%app_id, kid, "🔒 Revoked app secret");
        Ok(())
    }

    /// Resolve a kid for JWT verification, decrypting the stored secret.
    /// Returns `None` when the kid does not exist at all.
    pub async fn resolve(&self, kid: &str) -> BillingResult<Option<ResolvedSecret>> {
        let row = sqlx::query(
            "SELECT kid, app_id, secret_ciphertext, status FROM app_secrets WHERE kid = $1",
        )
        .bind(kid)
        .fetch_optional(&self.db_pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let status = SecretStatus::parse(row.try_get::<String, _>("status")?.as_str())?;
        let secret = self.cipher.decrypt(row.try_get::<String, _>("secret_ciphertext")?.as_str())?;

        Ok(Some(ResolvedSecret {
            kid: row.try_get("kid")?,
            app_id: row.try_get("app_id")?,
            status,
            secret,
        }))
    }

    pub async fn revoked_at(&self, kid: &str) -> BillingResult<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT revoked_at FROM app_secrets WHERE kid = $1")
            .bind(kid)
            .fetch_optional(&self.db_pool)
            .await?;
        Ok(row.and_then(|r| r.try_get("revoked_at").ok()))
    }
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> SecretCipher {
        SecretCipher::new(&[7u8; 32]).unwrap()
    }

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let c = cipher();
        let stored = c.encrypt("whsec_super_secret").unwrap();
        assert_eq!(c.decrypt(&stored).unwrap(), "whsec_super_secret");
    }

    #[test]
    fn test_stored_form_is_iv_tag_ciphertext() {
        let c = cipher();
        let stored = c.encrypt("s").unwrap();
        let parts: Vec<&str> = stored.split(':').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), NONCE_LEN * 2);
        assert_eq!(parts[1].len(), TAG_LEN * 2);
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let c = cipher();
        let stored = c.encrypt("payload-to-protect").unwrap();
        let parts: Vec<&str> = stored.split(':').collect();

        let mut body: Vec<u8> = hex::decode(parts[2]).unwrap();
        body[0] ^= 0xff;
        let tampered = format!("{}:{}:{}", parts[0], parts[1], hex::encode(body));
        assert!(c.decrypt(&tampered).is_err());
    }

    #[test]
    fn test_tampered_iv_fails() {
        let c = cipher();
        let stored = c.encrypt("payload").unwrap();
        let parts: Vec<&str> = stored.split(':').collect();

        let mut iv: Vec<u8> = hex::decode(parts[0]).unwrap();
        iv[0] ^= 0x01;
        let tampered = format!("{}:{}:{}", hex::encode(iv), parts[1], parts[2]);
        assert!(c.decrypt(&tampered).is_err());
    }

    #[test]
    fn test_tampered_tag_fails() {
        let c = cipher();
        let stored = c.encrypt("payload").unwrap();
        let parts: Vec<&str> = stored.split(':').collect();

        let mut tag: Vec<u8> = hex::decode(parts[1]).unwrap();
        tag[15] ^= 0x80;
        let tampered = format!("{}:{}:{}", parts[0], hex::encode(tag), parts[2]);
        assert!(c.decrypt(&tampered).is_err());
    }

    #[test]
    fn test_wrong_key_fails() {
        let stored = cipher().encrypt("payload").unwrap();
        let other = SecretCipher::new(&[8u8; 32]).unwrap();
        assert!(other.decrypt(&stored).is_err());
    }

    #[test]
    fn test_malformed_stored_form_rejected() {
        let c = cipher();
        assert!(c.decrypt("nocolons").is_err());
        assert!(c.decrypt("aa:bb").is_err());
        assert!(c.decrypt("zz:zz:zz").is_err());
    }
}
