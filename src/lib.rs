// Billing Engine - Multi-Tenant Metered Billing Service
// Usage pricing, entitlement cascades, append-only ledger, period close

pub mod admin;
pub mod auth;
pub mod checkout;
pub mod core;
pub mod entitlements;
pub mod http;
pub mod ingest;
pub mod invoice;
pub mod jobs;
pub mod ledger;
pub mod pricing;
pub mod schema;
pub mod secrets;
pub mod stripe;
pub mod teams;
pub mod wallet;
pub mod webhooks;

// Core engine components
pub use crate::core::{BillingConfig, BillingEngine, BillingError, BillingResult, FieldIssue};

// Domain services
pub use admin::AdminService;
pub use auth::{sign_jwt, AuthService, Claims};
pub use checkout::{CheckoutService, CustomerService};
pub use entitlements::{EntitlementService, MeterPolicy, ResolvedEntitlements};
pub use ingest::{IngestionService, UsageEvent};
pub use invoice::{InvoiceService, PricingMode};
pub use ledger::{AccountType, EntryType, LedgerService, NewLedgerEntry};
pub use pricing::{PricingService, RuleSpec};
pub use schema::SchemaRegistry;
pub use secrets::{SecretCipher, SecretStore};
pub use stripe::StripeClient;
pub use teams::{BillingMode, ProvisioningService};
pub use wallet::WalletService;
pub use webhooks::WebhookReconciler;

/// Load configuration from the environment and bring up the full engine.
pub async fn initialize_billing_engine() -> BillingResult<BillingEngine> {
    let config = BillingConfig::from_env()?;
    let engine = BillingEngine::new(config).await?;

    tracing::info!("💰 Billing engine ready");
    Ok(engine)
}
