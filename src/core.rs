// Billing Engine Core - Configuration, Error Taxonomy, Schema Bootstrap
// Central wiring for the multi-tenant metered billing service

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

use crate::admin::AdminService;
use crate::auth::AuthService;
use crate::checkout::{CheckoutService, CustomerService};
use crate::entitlements::EntitlementService;
use crate::ingest::IngestionService;
use crate::invoice::InvoiceService;
use crate::ledger::LedgerService;
use crate::pricing::PricingService;
use crate::schema::SchemaRegistry;
use crate::secrets::{SecretCipher, SecretStore};
use crate::stripe::StripeClient;
use crate::teams::ProvisioningService;
use crate::wallet::WalletService;
use crate::webhooks::WebhookReconciler;

/// A single field-level validation failure, surfaced in 400 bodies.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldIssue {
    pub field: String,
    pub message: String,
}

impl FieldIssue {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

// Core billing engine error types
#[derive(thiserror::Error, Debug)]
pub enum BillingError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Validation failed")]
    Validation(Vec<FieldIssue>),

    #[error("Batch of {0} events exceeds the maximum of 1000")]
    BatchTooLarge(usize),

    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    #[error("Payload failed schema validation for {event_type}")]
    PayloadSchema {
        event_type: String,
        errors: Vec<FieldIssue>,
    },

    #[error("Event carries neither teamId nor userId")]
    MissingTeamAndUser,

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("No personal team found for user {0}")]
    PersonalTeamNotFound(String),

    #[error("No billing entity for team {0}")]
    BillingEntityNotFound(Uuid),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("App not found: {0}")]
    AppNotFound(Uuid),

    #[error("Team not found: {0}")]
    TeamNotFound(Uuid),

    #[error("Plan not found: {0}")]
    PlanNotFound(String),

    #[error("Contract not found: {0}")]
    ContractNotFound(Uuid),

    #[error("Bundle not found: {0}")]
    BundleNotFound(Uuid),

    #[error("Invoice not found: {0}")]
    InvoiceNotFound(Uuid),

    #[error("An active contract already exists for billing entity {0}")]
    ActiveContractExists(Uuid),

    #[error("Duplicate ledger entry for idempotency key {0}")]
    DuplicateLedgerEntry(String),

    #[error("No {kind} price book in effect for app {app_id}")]
    NoPriceBookFound { app_id: Uuid, kind: String },

    #[error("No pricing rule matched {event_type} for app {app_id}")]
    NoMatchingRule { app_id: Uuid, event_type: String },

    #[error("Invalid pricing rule: {0}")]
    InvalidRule(String),

    #[error("Invalid webhook signature: {0}")]
    WebhookSignature(String),

    #[error("Stripe API error: {0}")]
    Stripe(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type BillingResult<T> = Result<T, BillingError>;

/// Flatten `validator` derive output into the wire-facing issue list.
pub fn validation_error(errors: &validator::ValidationErrors) -> BillingError {
    let mut issues = Vec::new();
    for (field, failures) in errors.field_errors() {
        for failure in failures {
            let message = failure
                .message
                .as_ref()
                .map(|m| m.to_string())
                .unwrap_or_else(|| format!("failed {} validation", failure.code));
            issues.push(FieldIssue::new(field.to_string(), message));
        }
    }
    if issues.is_empty() {
        issues.push(FieldIssue::new("body", "request failed validation"));
    }
    BillingError::Validation(issues)
}

/// True when the error is a Postgres unique-constraint violation (SQLSTATE 23505).
/// Unique indexes are the serialization points for every idempotency mechanism
/// in this service, so most writers branch on this.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some("23505"),
        _ => false,
    }
}

// Service configuration, loaded once at startup
#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub database_url: String,
    pub port: u16,
    pub secrets_encryption_key: [u8; 32],
    pub admin_api_key: String,
    pub stripe_secret_key: String,
    pub stripe_webhook_secret: String,
    pub stripe_api_base: String,
}

impl BillingConfig {
    pub fn from_env() -> BillingResult<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| BillingError::Config("DATABASE_URL not set".to_string()))?;

        let key_hex = std::env::var("SECRETS_ENCRYPTION_KEY")
            .map_err(|_| BillingError::Config("SECRETS_ENCRYPTION_KEY not set".to_string()))?;
        let secrets_encryption_key = Self::parse_encryption_key(&key_hex)?;

        let admin_api_key = std::env::var("ADMIN_API_KEY")
            .map_err(|_| BillingError::Config("ADMIN_API_KEY not set".to_string()))?;

        let stripe_secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?;

        let stripe_webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?;

        let port = std::env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8080);

        let stripe_api_base = std::env::var("STRIPE_API_BASE")
            .unwrap_or_else(|_| "https://api.stripe.com".to_string());

        Ok(Self {
            database_url,
            port,
            secrets_encryption_key,
            admin_api_key,
            stripe_secret_key,
            stripe_webhook_secret,
            stripe_api_base,
        })
    }

    fn parse_encryption_key(key_hex: &str) -> BillingResult<[u8; 32]> {
        if key_hex.len() != 64 {
            return Err(BillingError::Config(
                "SECRETS_ENCRYPTION_KEY must be 64 hex characters".to_string(),
            ));
        }
        let bytes = hex::decode(key_hex)
            .map_err(|_| BillingError::Config("SECRETS_ENCRYPTION_KEY is not valid hex".to_string()))?;
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        Ok(key)
    }
}

// Main billing engine: owns the pool and every domain service
#[derive(Clone)]
pub struct BillingEngine {
    pub config: BillingConfig,
    pub db_pool: PgPool,
    pub auth: Arc<AuthService>,
    pub secrets: Arc<SecretStore>,
    pub schema_registry: Arc<SchemaRegistry>,
    pub ingestion: Arc<IngestionService>,
    pub pricing: Arc<PricingService>,
    pub entitlements: Arc<EntitlementService>,
    pub ledger: Arc<LedgerService>,
    pub stripe: Arc<StripeClient>,
    pub customers: Arc<CustomerService>,
    pub checkout: Arc<CheckoutService>,
    pub webhooks: Arc<WebhookReconciler>,
    pub invoices: Arc<InvoiceService>,
    pub wallet: Arc<WalletService>,
    pub provisioning: Arc<ProvisioningService>,
    pub admin: Arc<AdminService>,
}

impl BillingEngine {
    pub async fn new(config: BillingConfig) -> BillingResult<Self> {
        tracing::info!("🚀 Initializing billing engine components");

        let db_pool = PgPoolOptions::new()
            .max_connections(20)
            .connect(&config.database_url)
            .await?;

        Self::setup_database(&db_pool).await?;

        let cipher = SecretCipher::new(&config.secrets_encryption_key)?;
        let secrets = Arc::new(SecretStore::new(db_pool.clone(), cipher));
        let auth = Arc::new(AuthService::new(
            db_pool.clone(),
            secrets.clone(),
            config.admin_api_key.clone(),
        ));

        let schema_registry = Arc::new(SchemaRegistry::with_builtin_schemas());

        let stripe = Arc::new(StripeClient::new(
            config.stripe_secret_key.clone(),
            config.stripe_webhook_secret.clone(),
            config.stripe_api_base.clone(),
        ));

        let ledger = Arc::new(LedgerService::new(db_pool.clone()));
        let entitlements = Arc::new(EntitlementService::new(db_pool.clone()));

        let wallet = Arc::new(WalletService::new(
            db_pool.clone(),
            ledger.clone(),
            stripe.clone(),
        ));
        let pricing = Arc::new(PricingService::new(db_pool.clone(), wallet.clone()));

        let ingestion = Arc::new(IngestionService::new(
            db_pool.clone(),
            schema_registry.clone(),
            pricing.clone(),
        ));

        let customers = Arc::new(CustomerService::new(db_pool.clone(), stripe.clone()));
        let checkout = Arc::new(CheckoutService::new(
            db_pool.clone(),
            stripe.clone(),
            customers.clone(),
        ));

        let webhooks = Arc::new(WebhookReconciler::new(
            db_pool.clone(),
            stripe.clone(),
            ledger.clone(),
            entitlements.clone(),
        ));

        let invoices = Arc::new(InvoiceService::new(db_pool.clone(), ledger.clone()));
        let provisioning = Arc::new(ProvisioningService::new(db_pool.clone()));
        let admin = Arc::new(AdminService::new(
            db_pool.clone(),
            secrets.clone(),
            entitlements.clone(),
        ));

        tracing::info!("✅ Billing engine initialized");

        Ok(Self {
            config,
            db_pool,
            auth,
            secrets,
            schema_registry,
            ingestion,
            pricing,
            entitlements,
            ledger,
            stripe,
            customers,
            checkout,
            webhooks,
            invoices,
            wallet,
            provisioning,
            admin,
        })
    }

    /// Close held resources in LIFO order. The scheduler is stopped by the
    /// caller before this runs.
    pub async fn shutdown(&self) {
        self.db_pool.close().await;
        tracing::info!("💤 Database pool closed");
    }

    // Bootstrap the relational schema. Every statement is idempotent, so the
    // service can restart against a live database.
    async fn setup_database(pool: &PgPool) -> BillingResult<()> {
        tracing::info!("📊 Setting up billing database schema");

        for statement in SCHEMA_DDL {
            sqlx::query(statement).execute(pool).await?;
        }

        tracing::info!("✅ Billing database schema ready");
        Ok(())
    }
}

const SCHEMA_DDL: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS apps (
        id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        name VARCHAR NOT NULL,
        status VARCHAR NOT NULL DEFAULT 'ACTIVE',
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS app_secrets (
        kid VARCHAR PRIMARY KEY,
        app_id UUID NOT NULL REFERENCES apps(id),
        secret_ciphertext TEXT NOT NULL,
        status VARCHAR NOT NULL DEFAULT 'ACTIVE',
        revoked_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_app_secrets_app ON app_secrets(app_id)",
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        app_id UUID NOT NULL REFERENCES apps(id),
        external_ref VARCHAR NOT NULL,
        email VARCHAR,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        UNIQUE (app_id, external_ref)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS teams (
        id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        app_id UUID NOT NULL REFERENCES apps(id),
        name VARCHAR NOT NULL,
        kind VARCHAR NOT NULL DEFAULT 'STANDARD',
        owner_user_id UUID,
        billing_mode VARCHAR NOT NULL DEFAULT 'SUBSCRIPTION',
        default_currency VARCHAR(3) NOT NULL DEFAULT 'USD',
        external_customer_id VARCHAR,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_teams_app ON teams(app_id)",
    "CREATE INDEX IF NOT EXISTS idx_teams_owner ON teams(owner_user_id)",
    r#"
    CREATE TABLE IF NOT EXISTS billing_entities (
        id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        type VARCHAR NOT NULL DEFAULT 'TEAM',
        team_id UUID NOT NULL UNIQUE REFERENCES teams(id),
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS team_members (
        id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        team_id UUID NOT NULL REFERENCES teams(id),
        user_id UUID NOT NULL REFERENCES users(id),
        role VARCHAR NOT NULL DEFAULT 'MEMBER',
        status VARCHAR NOT NULL DEFAULT 'ACTIVE',
        started_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        ended_at TIMESTAMPTZ,
        UNIQUE (team_id, user_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS external_team_refs (
        id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        app_id UUID NOT NULL REFERENCES apps(id),
        external_team_id VARCHAR NOT NULL,
        billing_team_id UUID NOT NULL REFERENCES teams(id),
        UNIQUE (app_id, external_team_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS plans (
        id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        app_id UUID NOT NULL REFERENCES apps(id),
        code VARCHAR NOT NULL,
        name VARCHAR NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        UNIQUE (app_id, code)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS stripe_product_maps (
        id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        plan_id UUID NOT NULL REFERENCES plans(id),
        kind VARCHAR NOT NULL,
        stripe_product_id VARCHAR NOT NULL,
        stripe_price_id VARCHAR NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_product_maps_plan ON stripe_product_maps(plan_id)",
    r#"
    CREATE TABLE IF NOT EXISTS addons (
        id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        app_id UUID NOT NULL REFERENCES apps(id),
        code VARCHAR NOT NULL,
        name VARCHAR NOT NULL,
        UNIQUE (app_id, code)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS team_addons (
        id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        team_id UUID NOT NULL REFERENCES teams(id),
        addon_id UUID NOT NULL REFERENCES addons(id),
        quantity INTEGER NOT NULL DEFAULT 1,
        UNIQUE (team_id, addon_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS team_subscriptions (
        id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        team_id UUID NOT NULL REFERENCES teams(id),
        plan_id UUID NOT NULL REFERENCES plans(id),
        stripe_subscription_id VARCHAR NOT NULL UNIQUE,
        status VARCHAR NOT NULL,
        current_period_start TIMESTAMPTZ,
        current_period_end TIMESTAMPTZ,
        seats_quantity INTEGER NOT NULL DEFAULT 1,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_team_subscriptions_team ON team_subscriptions(team_id)",
    r#"
    CREATE TABLE IF NOT EXISTS bundles (
        id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        name VARCHAR NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS bundle_apps (
        id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        bundle_id UUID NOT NULL REFERENCES bundles(id),
        app_id UUID NOT NULL REFERENCES apps(id),
        default_feature_flags JSONB NOT NULL DEFAULT '{}',
        UNIQUE (bundle_id, app_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS bundle_meter_policies (
        id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        bundle_id UUID NOT NULL REFERENCES bundles(id),
        app_id UUID NOT NULL REFERENCES apps(id),
        meter_key VARCHAR NOT NULL,
        limit_type VARCHAR NOT NULL DEFAULT 'NONE',
        included_amount BIGINT,
        enforcement VARCHAR NOT NULL DEFAULT 'NONE',
        overage_billing VARCHAR NOT NULL DEFAULT 'NONE',
        UNIQUE (bundle_id, app_id, meter_key)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS contracts (
        id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        bill_to_id UUID NOT NULL REFERENCES billing_entities(id),
        bundle_id UUID NOT NULL REFERENCES bundles(id),
        status VARCHAR NOT NULL DEFAULT 'DRAFT',
        currency VARCHAR(3) NOT NULL DEFAULT 'USD',
        billing_period VARCHAR NOT NULL DEFAULT 'MONTHLY',
        terms_days INTEGER NOT NULL DEFAULT 30,
        pricing_mode VARCHAR NOT NULL DEFAULT 'FIXED',
        starts_at TIMESTAMPTZ NOT NULL,
        ends_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_contracts_one_active
     ON contracts(bill_to_id) WHERE status = 'ACTIVE'",
    r#"
    CREATE TABLE IF NOT EXISTS contract_overrides (
        id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        contract_id UUID NOT NULL REFERENCES contracts(id),
        app_id UUID NOT NULL REFERENCES apps(id),
        meter_key VARCHAR NOT NULL,
        limit_type VARCHAR,
        included_amount BIGINT,
        enforcement VARCHAR,
        overage_billing VARCHAR,
        feature_flags JSONB NOT NULL DEFAULT '{}',
        UNIQUE (contract_id, app_id, meter_key)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS contract_rate_cards (
        id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        contract_id UUID NOT NULL REFERENCES contracts(id),
        kind VARCHAR NOT NULL,
        effective_from TIMESTAMPTZ NOT NULL,
        effective_to TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS price_books (
        id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        app_id UUID NOT NULL REFERENCES apps(id),
        kind VARCHAR NOT NULL,
        version INTEGER NOT NULL,
        currency VARCHAR(3) NOT NULL DEFAULT 'USD',
        effective_from TIMESTAMPTZ NOT NULL,
        effective_to TIMESTAMPTZ,
        UNIQUE (app_id, kind, version)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS price_rules (
        id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        price_book_id UUID NOT NULL REFERENCES price_books(id),
        priority INTEGER NOT NULL DEFAULT 0,
        match_conditions JSONB NOT NULL DEFAULT '{}',
        rule JSONB NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_price_rules_book ON price_rules(price_book_id)",
    r#"
    CREATE TABLE IF NOT EXISTS usage_events (
        id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        app_id UUID NOT NULL REFERENCES apps(id),
        team_id UUID NOT NULL REFERENCES teams(id),
        bill_to_id UUID NOT NULL REFERENCES billing_entities(id),
        user_id UUID,
        event_type VARCHAR NOT NULL,
        timestamp TIMESTAMPTZ NOT NULL,
        idempotency_key VARCHAR NOT NULL,
        payload JSONB NOT NULL DEFAULT '{}',
        source VARCHAR NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        UNIQUE (app_id, idempotency_key)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_usage_events_team ON usage_events(team_id, timestamp)",
    r#"
    CREATE TABLE IF NOT EXISTS billable_line_items (
        id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        usage_event_id UUID NOT NULL REFERENCES usage_events(id),
        app_id UUID NOT NULL REFERENCES apps(id),
        team_id UUID NOT NULL REFERENCES teams(id),
        bill_to_id UUID NOT NULL REFERENCES billing_entities(id),
        price_book_id UUID NOT NULL REFERENCES price_books(id),
        price_rule_id UUID NOT NULL REFERENCES price_rules(id),
        book_kind VARCHAR NOT NULL,
        event_type VARCHAR NOT NULL,
        event_timestamp TIMESTAMPTZ NOT NULL,
        amount_minor BIGINT NOT NULL,
        currency VARCHAR(3) NOT NULL,
        inputs_snapshot JSONB NOT NULL DEFAULT '{}',
        wallet_debited_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_line_items_billto
     ON billable_line_items(bill_to_id, book_kind, event_timestamp)",
    "CREATE INDEX IF NOT EXISTS idx_line_items_wallet_pending
     ON billable_line_items(team_id, app_id) WHERE wallet_debited_at IS NULL",
    r#"
    CREATE TABLE IF NOT EXISTS ledger_accounts (
        id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        app_id UUID NOT NULL REFERENCES apps(id),
        bill_to_id UUID NOT NULL REFERENCES billing_entities(id),
        type VARCHAR NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        UNIQUE (app_id, bill_to_id, type)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ledger_entries (
        id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        app_id UUID NOT NULL REFERENCES apps(id),
        bill_to_id UUID NOT NULL REFERENCES billing_entities(id),
        ledger_account_id UUID NOT NULL REFERENCES ledger_accounts(id),
        type VARCHAR NOT NULL,
        amount_minor BIGINT NOT NULL,
        currency VARCHAR(3) NOT NULL,
        reference_type VARCHAR NOT NULL DEFAULT 'MANUAL',
        reference_id VARCHAR,
        idempotency_key VARCHAR NOT NULL UNIQUE,
        metadata JSONB NOT NULL DEFAULT '{}',
        timestamp TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_ledger_entries_account
     ON ledger_entries(ledger_account_id, timestamp)",
    "CREATE INDEX IF NOT EXISTS idx_ledger_entries_billto
     ON ledger_entries(app_id, bill_to_id, timestamp)",
    r#"
    CREATE TABLE IF NOT EXISTS invoices (
        id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        bill_to_id UUID NOT NULL REFERENCES billing_entities(id),
        contract_id UUID REFERENCES contracts(id),
        period_start TIMESTAMPTZ NOT NULL,
        period_end TIMESTAMPTZ NOT NULL,
        status VARCHAR NOT NULL DEFAULT 'DRAFT',
        subtotal_minor BIGINT NOT NULL DEFAULT 0,
        tax_minor BIGINT NOT NULL DEFAULT 0,
        total_minor BIGINT NOT NULL DEFAULT 0,
        currency VARCHAR(3) NOT NULL DEFAULT 'USD',
        external_ref VARCHAR,
        issued_at TIMESTAMPTZ,
        due_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_invoices_contract_period
     ON invoices(contract_id, period_start, period_end) WHERE contract_id IS NOT NULL",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_invoices_billto_period
     ON invoices(bill_to_id, period_start, period_end) WHERE contract_id IS NULL",
    r#"
    CREATE TABLE IF NOT EXISTS invoice_line_items (
        id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        invoice_id UUID NOT NULL REFERENCES invoices(id),
        app_id UUID,
        type VARCHAR NOT NULL,
        description VARCHAR NOT NULL,
        quantity BIGINT NOT NULL DEFAULT 1,
        unit_price_minor BIGINT NOT NULL DEFAULT 0,
        amount_minor BIGINT NOT NULL DEFAULT 0,
        usage_summary JSONB,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_invoice_line_items_invoice
     ON invoice_line_items(invoice_id)",
    r#"
    CREATE TABLE IF NOT EXISTS webhook_events (
        event_id VARCHAR PRIMARY KEY,
        event_type VARCHAR NOT NULL,
        processed_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS jti_usage (
        jti VARCHAR PRIMARY KEY,
        expires_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS wallet_configs (
        id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        team_id UUID NOT NULL REFERENCES teams(id),
        app_id UUID NOT NULL REFERENCES apps(id),
        auto_top_up_enabled BOOLEAN NOT NULL DEFAULT false,
        threshold_minor BIGINT NOT NULL DEFAULT 0,
        top_up_amount_minor BIGINT NOT NULL DEFAULT 0,
        currency VARCHAR(3) NOT NULL DEFAULT 'USD',
        UNIQUE (team_id, app_id)
    )
    "#,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encryption_key_parses_64_hex_chars() {
        let key_hex = "ab".repeat(32);
        let key = BillingConfig::parse_encryption_key(&key_hex).unwrap();
        assert_eq!(key, [0xabu8; 32]);
    }

    #[test]
    fn test_encryption_key_rejects_wrong_length() {
        assert!(BillingConfig::parse_encryption_key("abcd").is_err());
        assert!(BillingConfig::parse_encryption_key(&"ab".repeat(33)).is_err());
    }

    #[test]
    fn test_encryption_key_rejects_non_hex() {
        let key_hex = "zz".repeat(32);
        assert!(BillingConfig::parse_encryption_key(&key_hex).is_err());
    }
}
