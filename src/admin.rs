// Admin Surface - App, Secret, Bundle and Contract Lifecycle
// Key-authenticated management operations behind /v1/admin and /v1/contracts

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{PgPool, Row};
use uuid::Uuid;
use validator::Validate;

use crate::core::{is_unique_violation, validation_error, BillingError, BillingResult, FieldIssue};
use crate::entitlements::EntitlementService;
use crate::invoice::{BillingPeriod, PricingMode};
use crate::secrets::{MintedSecret, SecretStore};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct App {
    pub id: Uuid,
    pub name: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateAppRequest {
    #[validate(length(min = 1, max = 255, message = "must be 1-255 characters"))]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateBundleRequest {
    #[validate(length(min = 1, max = 255, message = "must be 1-255 characters"))]
    pub name: String,
    #[serde(default)]
    pub apps: Vec<BundleAppInput>,
    #[serde(default)]
    pub meter_policies: Vec<BundlePolicyInput>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleAppInput {
    pub app_id: Uuid,
    #[serde(default)]
    pub default_feature_flags: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundlePolicyInput {
    pub app_id: Uuid,
    pub meter_key: String,
    pub limit_type: String,
    pub included_amount: Option<i64>,
    pub enforcement: String,
    pub overage_billing: String,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateContractRequest {
    pub team_id: Uuid,
    pub bundle_id: Uuid,
    #[validate(length(min = 3, max = 3, message = "must be a 3-letter currency code"))]
    pub currency: Option<String>,
    pub billing_period: BillingPeriod,
    #[validate(range(min = 1, message = "must be at least 1"))]
    pub terms_days: i32,
    pub pricing_mode: PricingMode,
    pub starts_at: DateTime<Utc>,
    pub ends_at: Option<DateTime<Utc>>,
    /// DRAFT unless explicitly activated at creation.
    #[serde(default)]
    pub activate: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractOverrideInput {
    pub app_id: Uuid,
    pub meter_key: String,
    pub limit_type: Option<String>,
    pub included_amount: Option<i64>,
    pub enforcement: Option<String>,
    pub overage_billing: Option<String>,
    #[serde(default)]
    pub feature_flags: Value,
}

// Administrative lifecycle operations
pub struct AdminService {
    db_pool: PgPool,
    secrets: Arc<SecretStore>,
    entitlements: Arc<EntitlementService>,
}

impl AdminService {
    pub fn new(
        db_pool: PgPool,
        secrets: Arc<SecretStore>,
        entitlements: Arc<EntitlementService>,
    ) -> Self {
        Self {
            db_pool,
            secrets,
            entitlements,
        }
    }

    pub async fn create_app(&self, request: CreateAppRequest) -> BillingResult<App> {
        request.validate().map_err(|e| validation_error(&e))?;

        let row = sqlx::query(
            r#"
            INSERT INTO apps (name, status) VALUES ($1, 'ACTIVE')
            RETURNING id, name, status, created_at
            "#,
        )
        .bind(&request.name)
        .fetch_one(&self.db_pool)
        .await?;

        let app = App {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            status: row.try_get("status")?,
            created_at: row.try_get("created_at")?,
        };

        tracing::info!(app_id = %app.id, name = app.name, "🏗️ Created app");
        Ok(app)
    }

    pub async fn mint_secret(&self, app_id: Uuid) -> BillingResult<MintedSecret> {
        self.secrets.mint(app_id).await
    }

    pub async fn revoke_secret(&self, app_id: Uuid, kid: &str) -> BillingResult<()> {
        self.secrets.revoke(app_id, kid).await
    }

    pub async fn create_bundle(&self, request: CreateBundleRequest) -> BillingResult<Uuid> {
        request.validate().map_err(|e| validation_error(&e))?;

        let bundle_id = Uuid::new_v4();
        let mut tx = self.db_pool.begin().await?;

        sqlx::query("INSERT INTO bundles (id, name) VALUES ($1, $2)")
            .bind(bundle_id)
            .bind(&request.name)
            .execute(&mut *tx)
            .await?;

        for app in &request.apps {
            let flags = if app.default_feature_flags.is_object() {
                app.default_feature_flags.clone()
            } else {
                Value::Object(serde_json::Map::new())
            };
            sqlx::query(
                r#"
                INSERT INTO bundle_apps (bundle_id, app_id, default_feature_flags)
                VALUES ($1, $2, $3)
                "#,
            )
            .bind(bundle_id)
            .bind(app.app_id)
            .bind(flags)
            .execute(&mut *tx)
            .await?;
        }

        for policy in &request.meter_policies {
            sqlx::query(
                r#"
                INSERT INTO bundle_meter_policies
                    (bundle_id, app_id, meter_key, limit_type, included_amount,
                     enforcement, overage_billing)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(bundle_id)
            .bind(policy.app_id)
            .bind(&policy.meter_key)
            .bind(&policy.limit_type)
            .bind(policy.included_amount)
            .bind(&policy.enforcement)
            .bind(&policy.overage_billing)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        tracing::info!(%bundle_id, name = request.name, "📦 Created bundle");
        Ok(bundle_id)
    }

    /// Create an enterprise contract against a team's billing entity. The
    /// partial unique index keeps one ACTIVE contract per billing entity;
    /// violating it maps to a 409.
    pub async fn create_contract(&self, request: CreateContractRequest) -> BillingResult<Uuid> {
        request.validate().map_err(|e| validation_error(&e))?;

        let bill_to_id =
            crate::teams::billing_entity_for_team(&self.db_pool, request.team_id).await?;

        let bundle = sqlx::query("SELECT id FROM bundles WHERE id = $1")
            .bind(request.bundle_id)
            .fetch_optional(&self.db_pool)
            .await?;
        if bundle.is_none() {
            return Err(BillingError::BundleNotFound(request.bundle_id));
        }

        let status = if request.activate { "ACTIVE" } else { "DRAFT" };
        let currency = request.currency.clone().unwrap_or_else(|| "USD".to_string());
        let contract_id = Uuid::new_v4();

        let inserted = sqlx::query(
            r#"
            INSERT INTO contracts
                (id, bill_to_id, bundle_id, status, currency, billing_period,
                 terms_days, pricing_mode, starts_at, ends_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(contract_id)
        .bind(bill_to_id)
        .bind(request.bundle_id)
        .bind(status)
        .bind(&currency)
        .bind(request.billing_period.as_str())
        .bind(request.terms_days)
        .bind(request.pricing_mode.as_str())
        .bind(request.starts_at)
        .bind(request.ends_at)
        .execute(&self.db_pool)
        .await;

        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(BillingError::ActiveContractExists(bill_to_id));
            }
            Err(e) => return Err(e.into()),
        }

        if request.activate {
            self.entitlements.refresh(request.team_id);
        }

        tracing::info!(%contract_id, team_id = %request.team_id, status, "📝 Created contract");
        Ok(contract_id)
    }

    /// Contract status transitions; activation collides with any existing
    /// ACTIVE contract via the partial unique index.
    pub async fn set_contract_status(&self, contract_id: Uuid, status: &str) -> BillingResult<()> {
        if !matches!(status, "DRAFT" | "ACTIVE" | "PAUSED" | "ENDED") {
            return Err(BillingError::Validation(vec![FieldIssue::new(
                "status",
                "must be one of DRAFT, ACTIVE, PAUSED, ENDED",
            )]));
        }

        let updated = sqlx::query(
            r#"
            UPDATE contracts SET status = $2 WHERE id = $1
            RETURNING bill_to_id
            "#,
        )
        .bind(contract_id)
        .bind(status)
        .fetch_optional(&self.db_pool)
        .await;

        let row = match updated {
            Ok(row) => row.ok_or(BillingError::ContractNotFound(contract_id))?,
            Err(e) if is_unique_violation(&e) => {
                return Err(BillingError::ActiveContractExists(contract_id));
            }
            Err(e) => return Err(e.into()),
        };

        let bill_to_id: Uuid = row.try_get("bill_to_id")?;
        if let Some(team_id) = self.team_for_billing_entity(bill_to_id).await? {
            self.entitlements.refresh(team_id);
        }

        Ok(())
    }

    pub async fn upsert_contract_override(
        &self,
        contract_id: Uuid,
        input: ContractOverrideInput,
    ) -> BillingResult<Uuid> {
        let contract = sqlx::query("SELECT id FROM contracts WHERE id = $1")
            .bind(contract_id)
            .fetch_optional(&self.db_pool)
            .await?;
        if contract.is_none() {
            return Err(BillingError::ContractNotFound(contract_id));
        }

        let flags = if input.feature_flags.is_object() {
            input.feature_flags.clone()
        } else {
            Value::Object(serde_json::Map::new())
        };

        let row = sqlx::query(
            r#"
            INSERT INTO contract_overrides
                (contract_id, app_id, meter_key, limit_type, included_amount,
                 enforcement, overage_billing, feature_flags)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (contract_id, app_id, meter_key)
            DO UPDATE SET
                limit_type = EXCLUDED.limit_type,
                included_amount = EXCLUDED.included_amount,
                enforcement = EXCLUDED.enforcement,
                overage_billing = EXCLUDED.overage_billing,
                feature_flags = EXCLUDED.feature_flags
            RETURNING id
            "#,
        )
        .bind(contract_id)
        .bind(input.app_id)
        .bind(&input.meter_key)
        .bind(&input.limit_type)
        .bind(input.included_amount)
        .bind(&input.enforcement)
        .bind(&input.overage_billing)
        .bind(flags)
        .fetch_one(&self.db_pool)
        .await?;

        Ok(row.try_get("id")?)
    }

    async fn team_for_billing_entity(&self, bill_to_id: Uuid) -> BillingResult<Option<Uuid>> {
        let row = sqlx::query("SELECT team_id FROM billing_entities WHERE id = $1")
            .bind(bill_to_id)
            .fetch_optional(&self.db_pool)
            .await?;
        row.map(|r| Ok(r.try_get("team_id")?)).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_app_request_validation() {
        assert!(CreateAppRequest { name: String::new() }.validate().is_err());
        assert!(CreateAppRequest {
            name: "Metered SaaS".to_string()
        }
        .validate()
        .is_ok());
    }

    #[test]
    fn test_contract_request_terms_days_floor() {
        let request = CreateContractRequest {
            team_id: Uuid::new_v4(),
            bundle_id: Uuid::new_v4(),
            currency: None,
            billing_period: BillingPeriod::Monthly,
            terms_days: 0,
            pricing_mode: PricingMode::Fixed,
            starts_at: Utc::now(),
            ends_at: None,
            activate: false,
        };
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_contract_request_deserializes_wire_shape() {
        let request: CreateContractRequest = serde_json::from_value(serde_json::json!({
            "teamId": Uuid::new_v4().to_string(),
            "bundleId": Uuid::new_v4().to_string(),
            "billingPeriod": "QUARTERLY",
            "termsDays": 45,
            "pricingMode": "MIN_COMMIT_TRUEUP",
            "startsAt": "2026-01-01T00:00:00Z",
            "activate": true,
        }))
        .unwrap();
        assert_eq!(request.billing_period, BillingPeriod::Quarterly);
        assert_eq!(request.pricing_mode, PricingMode::MinCommitTrueup);
        assert!(request.activate);
    }
}
