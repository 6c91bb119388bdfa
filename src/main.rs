// Billing Server - Main Application Entry Point
// HTTP surface for ingestion, entitlements, checkout, webhooks, and admin operations

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Extension, Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use billing_engine::admin::{
    ContractOverrideInput, CreateAppRequest, CreateBundleRequest, CreateContractRequest,
};
use billing_engine::checkout::{SubscriptionCheckoutRequest, TopupCheckoutRequest};
use billing_engine::http::{
    admin_auth_middleware, api_error, ensure_app_scope, jwt_auth_middleware,
    request_id_middleware, ApiError, AppState, RequestId,
};
use billing_engine::ingest::EventEnvelope;
use billing_engine::invoice::GenerateInvoiceRequest;
use billing_engine::ledger::{AccountType, EntryFilter, EntryType};
use billing_engine::teams::{AddMemberRequest, CreateTeamRequest, CreateUserRequest};
use billing_engine::{initialize_billing_engine, jobs, BillingError, Claims};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let filter = tracing_subscriber::EnvFilter::try_from_env("LOG_LEVEL")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(filter)
        .init();

    info!("🚀 Starting billing server");

    let engine = Arc::new(initialize_billing_engine().await?);
    let scheduler = jobs::start_scheduler(engine.clone()).await?;

    let state = AppState {
        engine: engine.clone(),
    };
    let app = create_router(state);

    let port = engine.config.port;
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("💰 Billing server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // LIFO teardown: scheduler first, pool last
    jobs::stop_scheduler(scheduler).await;
    engine.shutdown().await;

    Ok(())
}

fn create_router(state: AppState) -> Router {
    // tenant surface, bearer-token authenticated
    let tenant_routes = Router::new()
        .route("/v1/apps/:app_id/users", post(create_user))
        .route("/v1/apps/:app_id/teams", post(create_team))
        .route("/v1/apps/:app_id/teams/:team_id/users", post(add_team_member))
        .route("/v1/apps/:app_id/usage/events", post(ingest_usage))
        .route(
            "/v1/apps/:app_id/teams/:team_id/entitlements",
            get(get_entitlements),
        )
        .route(
            "/v1/apps/:app_id/teams/:team_id/checkout/subscription",
            post(create_subscription_checkout),
        )
        .route(
            "/v1/apps/:app_id/teams/:team_id/topup/checkout",
            post(create_topup_checkout),
        )
        .route("/v1/apps/:app_id/teams/:team_id/ledger", get(get_ledger))
        .route("/v1/apps/:app_id/teams/:team_id/wallet", get(get_wallet_balance))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            jwt_auth_middleware,
        ));

    // admin surface, static-key authenticated
    let admin_routes = Router::new()
        .route("/v1/admin/apps", post(create_app))
        .route("/v1/admin/apps/:app_id/secrets", post(mint_app_secret))
        .route(
            "/v1/admin/apps/:app_id/secrets/:kid",
            delete(revoke_app_secret),
        )
        .route("/v1/admin/invoices/:invoice_id/pay", post(mark_invoice_paid))
        .route("/v1/bundles", post(create_bundle))
        .route("/v1/contracts", post(create_contract))
        .route("/v1/contracts/:contract_id/status", post(set_contract_status))
        .route(
            "/v1/contracts/:contract_id/overrides",
            post(upsert_contract_override),
        )
        .route("/v1/invoices/generate", post(generate_invoice))
        .route("/v1/invoices/:invoice_id", get(get_invoice))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            admin_auth_middleware,
        ));

    // unauthenticated: health probe and the signature-verified webhook
    let open_routes = Router::new()
        .route("/healthz", get(health_check))
        .route("/v1/stripe/webhook", post(stripe_webhook));

    Router::new()
        .merge(tenant_routes)
        .merge(admin_routes)
        .merge(open_routes)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods(Any)
                        .allow_headers(Any),
                )
                .layer(middleware::from_fn(request_id_middleware)),
        )
        .with_state(state)
}

// Health check: 200 only when the database answers
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    match sqlx::query("SELECT 1").execute(&state.engine.db_pool).await {
        Ok(_) => (
            StatusCode::OK,
            Json(json!({"status": "ok", "service": "billing-engine"})),
        ),
        Err(e) => {
            tracing::error!(error = %e, "health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"status": "unavailable"})),
            )
        }
    }
}

// ---- tenant handlers ----

async fn create_user(
    State(state): State<AppState>,
    Path(app_id): Path<Uuid>,
    Extension(request_id): Extension<RequestId>,
    Extension(claims): Extension<Claims>,
    Json(body): Json<CreateUserRequest>,
) -> Result<Json<Value>, ApiError> {
    ensure_app_scope(&claims, app_id).map_err(|e| api_error(&e, &request_id.0))?;
    state
        .engine
        .provisioning
        .create_user(app_id, body)
        .await
        .map(|user| Json(json!(user)))
        .map_err(|e| api_error(&e, &request_id.0))
}

async fn create_team(
    State(state): State<AppState>,
    Path(app_id): Path<Uuid>,
    Extension(request_id): Extension<RequestId>,
    Extension(claims): Extension<Claims>,
    Json(body): Json<CreateTeamRequest>,
) -> Result<Json<Value>, ApiError> {
    ensure_app_scope(&claims, app_id).map_err(|e| api_error(&e, &request_id.0))?;
    state
        .engine
        .provisioning
        .create_team(app_id, body)
        .await
        .map(|team| Json(json!(team)))
        .map_err(|e| api_error(&e, &request_id.0))
}

async fn add_team_member(
    State(state): State<AppState>,
    Path((app_id, team_id)): Path<(Uuid, Uuid)>,
    Extension(request_id): Extension<RequestId>,
    Extension(claims): Extension<Claims>,
    Json(body): Json<AddMemberRequest>,
) -> Result<Json<Value>, ApiError> {
    ensure_app_scope(&claims, app_id).map_err(|e| api_error(&e, &request_id.0))?;
    state
        .engine
        .provisioning
        .add_member(app_id, team_id, body)
        .await
        .map(|member_id| Json(json!({"memberId": member_id})))
        .map_err(|e| api_error(&e, &request_id.0))
}

async fn ingest_usage(
    State(state): State<AppState>,
    Path(app_id): Path<Uuid>,
    Extension(request_id): Extension<RequestId>,
    Extension(claims): Extension<Claims>,
    Json(batch): Json<Vec<EventEnvelope>>,
) -> Result<Json<Value>, ApiError> {
    ensure_app_scope(&claims, app_id).map_err(|e| api_error(&e, &request_id.0))?;
    state
        .engine
        .ingestion
        .ingest_batch(app_id, batch)
        .await
        .map(|report| Json(json!(report)))
        .map_err(|e| api_error(&e, &request_id.0))
}

async fn get_entitlements(
    State(state): State<AppState>,
    Path((app_id, team_id)): Path<(Uuid, Uuid)>,
    Extension(request_id): Extension<RequestId>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Value>, ApiError> {
    ensure_app_scope(&claims, app_id).map_err(|e| api_error(&e, &request_id.0))?;
    state
        .engine
        .entitlements
        .resolve(app_id, team_id)
        .await
        .map(|resolved| Json(json!(resolved)))
        .map_err(|e| api_error(&e, &request_id.0))
}

async fn create_subscription_checkout(
    State(state): State<AppState>,
    Path((app_id, team_id)): Path<(Uuid, Uuid)>,
    Extension(request_id): Extension<RequestId>,
    Extension(claims): Extension<Claims>,
    Json(body): Json<SubscriptionCheckoutRequest>,
) -> Result<Json<Value>, ApiError> {
    ensure_app_scope(&claims, app_id).map_err(|e| api_error(&e, &request_id.0))?;
    state
        .engine
        .checkout
        .create_subscription_checkout(app_id, team_id, body)
        .await
        .map(|session| Json(json!(session)))
        .map_err(|e| api_error(&e, &request_id.0))
}

async fn create_topup_checkout(
    State(state): State<AppState>,
    Path((app_id, team_id)): Path<(Uuid, Uuid)>,
    Extension(request_id): Extension<RequestId>,
    Extension(claims): Extension<Claims>,
    Json(body): Json<TopupCheckoutRequest>,
) -> Result<Json<Value>, ApiError> {
    ensure_app_scope(&claims, app_id).map_err(|e| api_error(&e, &request_id.0))?;
    state
        .engine
        .checkout
        .create_topup_checkout(app_id, team_id, body)
        .await
        .map(|session| Json(json!(session)))
        .map_err(|e| api_error(&e, &request_id.0))
}

#[derive(Debug, Deserialize)]
struct LedgerQuery {
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    #[serde(rename = "type")]
    entry_type: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn get_ledger(
    State(state): State<AppState>,
    Path((app_id, team_id)): Path<(Uuid, Uuid)>,
    Extension(request_id): Extension<RequestId>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<LedgerQuery>,
) -> Result<Json<Value>, ApiError> {
    ensure_app_scope(&claims, app_id).map_err(|e| api_error(&e, &request_id.0))?;

    let entry_type = query
        .entry_type
        .as_deref()
        .map(EntryType::parse)
        .transpose()
        .map_err(|_| {
            api_error(
                &BillingError::Validation(vec![billing_engine::FieldIssue::new(
                    "type",
                    "is not a ledger entry type",
                )]),
                &request_id.0,
            )
        })?;

    let result: Result<Json<Value>, BillingError> = async {
        let bill_to_id =
            billing_engine::teams::billing_entity_for_team(&state.engine.db_pool, team_id).await?;
        let page = state
            .engine
            .ledger
            .get_entries(
                app_id,
                bill_to_id,
                EntryFilter {
                    from: query.from,
                    to: query.to,
                    entry_type,
                    limit: query.limit,
                    offset: query.offset,
                },
            )
            .await?;
        Ok(Json(json!(page)))
    }
    .await;

    result.map_err(|e| api_error(&e, &request_id.0))
}

async fn get_wallet_balance(
    State(state): State<AppState>,
    Path((app_id, team_id)): Path<(Uuid, Uuid)>,
    Extension(request_id): Extension<RequestId>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Value>, ApiError> {
    ensure_app_scope(&claims, app_id).map_err(|e| api_error(&e, &request_id.0))?;

    let result: Result<Json<Value>, BillingError> = async {
        let team = billing_engine::teams::load_team(&state.engine.db_pool, team_id).await?;
        let bill_to_id =
            billing_engine::teams::billing_entity_for_team(&state.engine.db_pool, team_id).await?;
        let balance = state
            .engine
            .ledger
            .get_balance(app_id, bill_to_id, AccountType::Wallet)
            .await?;
        Ok(Json(json!({
            "teamId": team_id,
            "balanceMinor": balance,
            "currency": team.default_currency,
        })))
    }
    .await;

    result.map_err(|e| api_error(&e, &request_id.0))
}

// ---- webhook ----

async fn stripe_webhook(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            api_error(
                &BillingError::WebhookSignature("missing stripe-signature header".to_string()),
                &request_id.0,
            )
        })?;

    state
        .engine
        .webhooks
        .process(&body, signature)
        .await
        .map(Json)
        .map_err(|e| api_error(&e, &request_id.0))
}

// ---- admin handlers ----

async fn create_app(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Json(body): Json<CreateAppRequest>,
) -> Result<Json<Value>, ApiError> {
    state
        .engine
        .admin
        .create_app(body)
        .await
        .map(|app| Json(json!(app)))
        .map_err(|e| api_error(&e, &request_id.0))
}

async fn mint_app_secret(
    State(state): State<AppState>,
    Path(app_id): Path<Uuid>,
    Extension(request_id): Extension<RequestId>,
) -> Result<Json<Value>, ApiError> {
    state
        .engine
        .admin
        .mint_secret(app_id)
        .await
        .map(|minted| Json(json!(minted)))
        .map_err(|e| api_error(&e, &request_id.0))
}

async fn revoke_app_secret(
    State(state): State<AppState>,
    Path((app_id, kid)): Path<(Uuid, String)>,
    Extension(request_id): Extension<RequestId>,
) -> Result<Json<Value>, ApiError> {
    state
        .engine
        .admin
        .revoke_secret(app_id, &kid)
        .await
        .map(|_| Json(json!({"revoked": true, "kid": kid})))
        .map_err(|e| api_error(&e, &request_id.0))
}

async fn create_bundle(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Json(body): Json<CreateBundleRequest>,
) -> Result<Json<Value>, ApiError> {
    state
        .engine
        .admin
        .create_bundle(body)
        .await
        .map(|bundle_id| Json(json!({"bundleId": bundle_id})))
        .map_err(|e| api_error(&e, &request_id.0))
}

async fn create_contract(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Json(body): Json<CreateContractRequest>,
) -> Result<Json<Value>, ApiError> {
    state
        .engine
        .admin
        .create_contract(body)
        .await
        .map(|contract_id| Json(json!({"contractId": contract_id})))
        .map_err(|e| api_error(&e, &request_id.0))
}

#[derive(Debug, Deserialize)]
struct ContractStatusRequest {
    status: String,
}

async fn set_contract_status(
    State(state): State<AppState>,
    Path(contract_id): Path<Uuid>,
    Extension(request_id): Extension<RequestId>,
    Json(body): Json<ContractStatusRequest>,
) -> Result<Json<Value>, ApiError> {
    state
        .engine
        .admin
        .set_contract_status(contract_id, &body.status)
        .await
        .map(|_| Json(json!({"contractId": contract_id, "status": body.status})))
        .map_err(|e| api_error(&e, &request_id.0))
}

async fn upsert_contract_override(
    State(state): State<AppState>,
    Path(contract_id): Path<Uuid>,
    Extension(request_id): Extension<RequestId>,
    Json(body): Json<ContractOverrideInput>,
) -> Result<Json<Value>, ApiError> {
    state
        .engine
        .admin
        .upsert_contract_override(contract_id, body)
        .await
        .map(|override_id| Json(json!({"overrideId": override_id})))
        .map_err(|e| api_error(&e, &request_id.0))
}

async fn generate_invoice(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Json(body): Json<GenerateInvoiceRequest>,
) -> Result<Json<Value>, ApiError> {
    state
        .engine
        .invoices
        .generate_invoice(body)
        .await
        .map(|invoice_id| Json(json!({"invoiceId": invoice_id})))
        .map_err(|e| api_error(&e, &request_id.0))
}

async fn get_invoice(
    State(state): State<AppState>,
    Path(invoice_id): Path<Uuid>,
    Extension(request_id): Extension<RequestId>,
) -> Result<Json<Value>, ApiError> {
    state
        .engine
        .invoices
        .get_invoice(invoice_id)
        .await
        .map(|detail| Json(json!(detail)))
        .map_err(|e| api_error(&e, &request_id.0))
}

async fn mark_invoice_paid(
    State(state): State<AppState>,
    Path(invoice_id): Path<Uuid>,
    Extension(request_id): Extension<RequestId>,
) -> Result<Json<Value>, ApiError> {
    state
        .engine
        .invoices
        .mark_paid(invoice_id)
        .await
        .map(|invoice| Json(json!(invoice)))
        .map_err(|e| api_error(&e, &request_id.0))
}

// Graceful shutdown on SIGINT/SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("💤 Billing server shutting down gracefully...");
}
