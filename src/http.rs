// HTTP Layer - Error Mapping, Correlation IDs, Auth Middleware
// Typed service errors become structured JSON bodies with request correlation

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::auth::Claims;
use crate::core::{BillingError, BillingEngine};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<BillingEngine>,
}

/// Correlation id attached to every request's extensions.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Wire-facing error: status plus the structured body.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: Value,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

fn status_for(err: &BillingError) -> StatusCode {
    use BillingError::*;
    match err {
        Validation(_) | BatchTooLarge(_) | UnknownEventType(_) | PayloadSchema { .. }
        | MissingTeamAndUser | UserNotFound(_) | PersonalTeamNotFound(_)
        | BillingEntityNotFound(_) | WebhookSignature(_) => StatusCode::BAD_REQUEST,
        Unauthorized(_) => StatusCode::UNAUTHORIZED,
        Forbidden(_) => StatusCode::FORBIDDEN,
        AppNotFound(_) | TeamNotFound(_) | PlanNotFound(_) | ContractNotFound(_)
        | BundleNotFound(_) | InvoiceNotFound(_) => StatusCode::NOT_FOUND,
        ActiveContractExists(_) | DuplicateLedgerEntry(_) => StatusCode::CONFLICT,
        Stripe(_) => StatusCode::BAD_GATEWAY,
        Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        Database(_) | Config(_) | Crypto(_) | NoPriceBookFound { .. } | NoMatchingRule { .. }
        | InvalidRule(_) | Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_code(err: &BillingError) -> &'static str {
    use BillingError::*;
    match err {
        Validation(_) => "ValidationError",
        BatchTooLarge(_) => "BatchTooLarge",
        UnknownEventType(_) => "UnknownEventType",
        PayloadSchema { .. } => "PayloadValidationError",
        MissingTeamAndUser => "MissingTeamAndUser",
        UserNotFound(_) => "UserNotFound",
        PersonalTeamNotFound(_) => "PersonalTeamNotFound",
        BillingEntityNotFound(_) => "BillingEntityNotFound",
        Unauthorized(_) => "Unauthorized",
        Forbidden(_) => "Forbidden",
        AppNotFound(_) => "AppNotFound",
        TeamNotFound(_) => "TeamNotFound",
        PlanNotFound(_) => "PlanNotFound",
        ContractNotFound(_) => "ContractNotFound",
        BundleNotFound(_) => "BundleNotFound",
        InvoiceNotFound(_) => "InvoiceNotFound",
        ActiveContractExists(_) => "ActiveContractExists",
        DuplicateLedgerEntry(_) => "DuplicateLedgerEntry",
        NoPriceBookFound { .. } => "NoPriceBookFound",
        NoMatchingRule { .. } => "NoMatchingRule",
        InvalidRule(_) => "InvalidRule",
        WebhookSignature(_) => "WebhookSignatureError",
        Stripe(_) => "UpstreamError",
        Timeout(_) => "Timeout",
        Database(_) | Config(_) | Crypto(_) | Internal(_) => "InternalError",
    }
}

/// Build the `{error, message, statusCode, requestId, ...}` body. Server-side
/// failures are logged here and surfaced without internals.
pub fn api_error(err: &BillingError, request_id: &str) -> ApiError {
    let status = status_for(err);

    if status.is_server_error() {
        tracing::error!(request_id, error = %err, "request failed");
    }

    let message = if status.is_server_error() {
        "Internal server error".to_string()
    } else {
        err.to_string()
    };

    let mut body = json!({
        "error": error_code(err),
        "message": message,
        "statusCode": status.as_u16(),
        "requestId": request_id,
    });

    match err {
        BillingError::Validation(issues) => {
            body["issues"] = json!(issues);
        }
        BillingError::UnknownEventType(event_type) => {
            body["eventType"] = json!(event_type);
        }
        BillingError::PayloadSchema { event_type, errors } => {
            body["eventType"] = json!(event_type);
            body["validationErrors"] = json!(errors);
        }
        _ => {}
    }

    ApiError { status, body }
}

pub fn request_id_of(request: &Request) -> String {
    request
        .extensions()
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Echo an inbound correlation id or mint one; stamp it on request extensions
/// and the response header.
pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    request.extensions_mut().insert(RequestId(request_id.clone()));

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Bearer-token authentication for tenant routes. Verified claims land in the
/// request extensions for the handlers' app-scope check.
pub async fn jwt_auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let request_id = request_id_of(&request);

    let token = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string);

    let Some(token) = token else {
        return api_error(
            &BillingError::Unauthorized("Missing bearer token".to_string()),
            &request_id,
        )
        .into_response();
    };

    match state.engine.auth.verify_bearer(&token).await {
        Ok(claims) => {
            request.extensions_mut().insert(claims);
            next.run(request).await
        }
        Err(err) => api_error(&err, &request_id).into_response(),
    }
}

/// Static-key authentication for the admin surface.
pub async fn admin_auth_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let request_id = request_id_of(&request);

    let provided = request
        .headers()
        .get("x-admin-api-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    if !state.engine.auth.check_admin_key(provided) {
        return api_error(
            &BillingError::Forbidden("Invalid admin API key".to_string()),
            &request_id,
        )
        .into_response();
    }

    next.run(request).await
}

/// Tenant tokens only reach resources of their own app.
pub fn ensure_app_scope(claims: &Claims, app_id: Uuid) -> Result<(), BillingError> {
    if claims.app_id == app_id {
        Ok(())
    } else {
        Err(BillingError::Forbidden(
            "Token is not scoped to this app".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::FieldIssue;

    #[test]
    fn test_status_mapping_follows_taxonomy() {
        assert_eq!(
            status_for(&BillingError::Validation(vec![])),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(status_for(&BillingError::BatchTooLarge(1001)), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_for(&BillingError::Unauthorized("x".into())),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status_for(&BillingError::Forbidden("x".into())),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status_for(&BillingError::TeamNotFound(Uuid::new_v4())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&BillingError::ActiveContractExists(Uuid::new_v4())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&BillingError::NoPriceBookFound {
                app_id: Uuid::new_v4(),
                kind: "CUSTOMER".into()
            }),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status_for(&BillingError::WebhookSignature("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&BillingError::Stripe("x".into())),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_error_body_shape() {
        let err = BillingError::UnknownEventType("gpu.sample.v1".to_string());
        let api = api_error(&err, "req-123");
        assert_eq!(api.body["error"], json!("UnknownEventType"));
        assert_eq!(api.body["statusCode"], json!(400));
        assert_eq!(api.body["requestId"], json!("req-123"));
        assert_eq!(api.body["eventType"], json!("gpu.sample.v1"));
    }

    #[test]
    fn test_validation_body_carries_issues() {
        let err = BillingError::Validation(vec![FieldIssue::new("timestamp", "bad")]);
        let api = api_error(&err, "req-1");
        assert_eq!(api.body["issues"][0]["field"], json!("timestamp"));
    }

    #[test]
    fn test_payload_schema_body_carries_field_errors() {
        let err = BillingError::PayloadSchema {
            event_type: "llm.tokens.v1".to_string(),
            errors: vec![FieldIssue::new("inputTokens", "must be a non-negative integer")],
        };
        let api = api_error(&err, "req-1");
        assert_eq!(api.body["eventType"], json!("llm.tokens.v1"));
        assert_eq!(
            api.body["validationErrors"][0]["field"],
            json!("inputTokens")
        );
    }

    #[test]
    fn test_server_errors_do_not_leak_details() {
        let err = BillingError::Internal("connection string with password".to_string());
        let api = api_error(&err, "req-1");
        assert_eq!(api.body["message"], json!("Internal server error"));
    }

    #[test]
    fn test_app_scope_check() {
        let app_id = Uuid::new_v4();
        let claims = Claims {
            iss: Claims::issuer_for(app_id),
            aud: crate::auth::AUDIENCE.to_string(),
            sub: "team:1".to_string(),
            app_id,
            team_id: None,
            user_id: None,
            scopes: vec![],
            iat: 0,
            exp: 0,
            jti: "j".to_string(),
            kid: "k".to_string(),
            req_hash: None,
        };
        assert!(ensure_app_scope(&claims, app_id).is_ok());
        assert!(ensure_app_scope(&claims, Uuid::new_v4()).is_err());
    }
}
