// Checkout - Lazy External Customers and Stripe-Hosted Sessions
// One customers.create per team ever, no matter how many callers race

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use uuid::Uuid;
use validator::Validate;

use crate::core::{validation_error, BillingError, BillingResult, FieldIssue};
use crate::stripe::{CheckoutSessionParams, SessionLineItem, StripeClient};
use crate::teams;

const PENDING_PREFIX: &str = "pending:";
const POLL_INTERVAL: Duration = Duration::from_millis(100);
const MAX_POLL_ITERATIONS: u32 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProductKind {
    Base,
    Seat,
    Addon,
    Overage,
    Topup,
}

impl ProductKind {
    pub fn parse(s: &str) -> BillingResult<Self> {
        match s {
            "BASE" => Ok(Self::Base),
            "SEAT" => Ok(Self::Seat),
            "ADDON" => Ok(Self::Addon),
            "OVERAGE" => Ok(Self::Overage),
            "TOPUP" => Ok(Self::Topup),
            other => Err(BillingError::Internal(format!(
                "invalid product map kind: {other}"
            ))),
        }
    }
}

// Lazy, race-safe external customer creation
pub struct CustomerService {
    db_pool: PgPool,
    stripe: Arc<StripeClient>,
}

enum PollOutcome {
    Real(String),
    RolledBack,
}

impl CustomerService {
    pub fn new(db_pool: PgPool, stripe: Arc<StripeClient>) -> Self {
        Self { db_pool, stripe }
    }

    /// Return the team's external customer id, creating it on first use. The
    /// claim is a compare-and-swap on the NULL column, so exactly one caller
    /// ever reaches the external create API; everyone else polls until the
    /// real id lands or the claim is rolled back.
    pub async fn get_or_create_external_customer(
        &self,
        team_id: Uuid,
        app_id: Option<Uuid>,
    ) -> BillingResult<String> {
        loop {
            let team = teams::load_team(&self.db_pool, team_id).await?;

            match &team.external_customer_id {
                Some(id) if !id.starts_with(PENDING_PREFIX) => return Ok(id.clone()),
                Some(_) => match self.poll_for_real_id(team_id).await? {
                    PollOutcome::Real(id) => return Ok(id),
                    PollOutcome::RolledBack => continue,
                },
                None => {
                    if self.try_claim(team_id).await? {
                        return self.create_against_claim(&team, app_id).await;
                    }
                    // another caller claimed first
                    match self.poll_for_real_id(team_id).await? {
                        PollOutcome::Real(id) => return Ok(id),
                        PollOutcome::RolledBack => continue,
                    }
                }
            }
        }
    }

    async fn try_claim(&self, team_id: Uuid) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE teams
            SET external_customer_id = $2
            WHERE id = $1 AND external_customer_id IS NULL
            "#,
        )
        .bind(team_id)
        .bind(format!("{PENDING_PREFIX}{team_id}"))
        .execute(&self.db_pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn create_against_claim(
        &self,
        team: &teams::Team,
        app_id: Option<Uuid>,
    ) -> BillingResult<String> {
        let mut metadata = vec![("teamId".to_string(), team.id.to_string())];
        if let Some(app_id) = app_id {
            metadata.push(("appId".to_string(), app_id.to_string()));
        }

        match self.stripe.create_customer(&team.name, &metadata).await {
            Ok(customer) => {
                sqlx::query("UPDATE teams SET external_customer_id = $2 WHERE id = $1")
                    .bind(team.id)
                    .bind(&customer.id)
                    .execute(&self.db_pool)
                    .await?;

                tracing::info!(team_id = %team.id, customer_id = customer.id, "💳 Created external customer");
                Ok(customer.id)
            }
            Err(e) => {
                // release the claim so a later caller can retry
                sqlx::query(
                    "UPDATE teams SET external_customer_id = NULL
                     WHERE id = $1 AND external_customer_id = $2",
                )
                .bind(team.id)
                .bind(format!("{PENDING_PREFIX}{}", team.id))
                .execute(&self.db_pool)
                .await?;
                Err(e)
            }
        }
    }

    async fn poll_for_real_id(&self, team_id: Uuid) -> BillingResult<PollOutcome> {
        for _ in 0..MAX_POLL_ITERATIONS {
            tokio::time::sleep(POLL_INTERVAL).await;

            let team = teams::load_team(&self.db_pool, team_id).await?;
            match &team.external_customer_id {
                Some(id) if !id.starts_with(PENDING_PREFIX) => {
                    return Ok(PollOutcome::Real(id.clone()))
                }
                Some(_) => continue,
                None => return Ok(PollOutcome::RolledBack),
            }
        }

        Err(BillingError::Timeout(format!(
            "external customer creation for team {team_id} still pending after 5s"
        )))
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionCheckoutRequest {
    #[validate(length(min = 1, max = 64, message = "must be 1-64 characters"))]
    pub plan_code: String,
    #[validate(url(message = "must be a URL"))]
    pub success_url: String,
    #[validate(url(message = "must be a URL"))]
    pub cancel_url: String,
    #[validate(range(min = 1, message = "must be at least 1"))]
    pub seats: Option<i64>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct TopupCheckoutRequest {
    #[validate(range(min = 1, message = "must be a positive minor amount"))]
    pub amount_minor: i64,
    #[validate(length(min = 3, max = 3, message = "must be a 3-letter currency code"))]
    pub currency: Option<String>,
    #[validate(url(message = "must be a URL"))]
    pub success_url: String,
    #[validate(url(message = "must be a URL"))]
    pub cancel_url: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutResponse {
    pub url: String,
    pub session_id: String,
}

// Checkout session orchestration
pub struct CheckoutService {
    db_pool: PgPool,
    stripe: Arc<StripeClient>,
    customers: Arc<CustomerService>,
}

impl CheckoutService {
    pub fn new(db_pool: PgPool, stripe: Arc<StripeClient>, customers: Arc<CustomerService>) -> Self {
        Self {
            db_pool,
            stripe,
            customers,
        }
    }

    pub async fn create_subscription_checkout(
        &self,
        app_id: Uuid,
        team_id: Uuid,
        request: SubscriptionCheckoutRequest,
    ) -> BillingResult<CheckoutResponse> {
        request.validate().map_err(|e| validation_error(&e))?;

        let team = teams::load_team(&self.db_pool, team_id).await?;
        if team.app_id != app_id {
            return Err(BillingError::TeamNotFound(team_id));
        }

        let plan_row = sqlx::query("SELECT id FROM plans WHERE app_id = $1 AND code = $2")
            .bind(app_id)
            .bind(&request.plan_code)
            .fetch_optional(&self.db_pool)
            .await?
            .ok_or_else(|| BillingError::PlanNotFound(request.plan_code.clone()))?;
        let plan_id: Uuid = plan_row.try_get("id")?;

        let customer = self
            .customers
            .get_or_create_external_customer(team_id, Some(app_id))
            .await?;

        let map_rows = sqlx::query(
            "SELECT kind, stripe_price_id FROM stripe_product_maps WHERE plan_id = $1",
        )
        .bind(plan_id)
        .fetch_all(&self.db_pool)
        .await?;

        let mut line_items = Vec::new();
        for row in map_rows {
            let kind = ProductKind::parse(row.try_get::<String, _>("kind")?.as_str())?;
            let price_id: String = row.try_get("stripe_price_id")?;
            // only recurring components belong on a subscription session
            let quantity = match kind {
                ProductKind::Base => 1,
                ProductKind::Seat => request.seats.unwrap_or(1),
                _ => continue,
            };
            line_items.push(SessionLineItem::Price { price_id, quantity });
        }

        if line_items.is_empty() {
            return Err(BillingError::Validation(vec![FieldIssue::new(
                "planCode",
                "plan has no subscription products configured",
            )]));
        }

        let session = self
            .stripe
            .create_checkout_session(&CheckoutSessionParams {
                mode: "subscription",
                customer,
                line_items,
                success_url: request.success_url,
                cancel_url: request.cancel_url,
                metadata: vec![
                    ("teamId".to_string(), team_id.to_string()),
                    ("appId".to_string(), app_id.to_string()),
                    ("planId".to_string(), plan_id.to_string()),
                ],
                payment_intent_metadata: vec![],
            })
            .await?;

        let url = session
            .url
            .ok_or_else(|| BillingError::Stripe("checkout session has no url".to_string()))?;

        Ok(CheckoutResponse {
            url,
            session_id: session.id,
        })
    }

    pub async fn create_topup_checkout(
        &self,
        app_id: Uuid,
        team_id: Uuid,
        request: TopupCheckoutRequest,
    ) -> BillingResult<CheckoutResponse> {
        request.validate().map_err(|e| validation_error(&e))?;

        let team = teams::load_team(&self.db_pool, team_id).await?;
        if team.app_id != app_id {
            return Err(BillingError::TeamNotFound(team_id));
        }

        let currency = request
            .currency
            .clone()
            .unwrap_or_else(|| team.default_currency.clone());

        let customer = self
            .customers
            .get_or_create_external_customer(team_id, Some(app_id))
            .await?;

        let session = self
            .stripe
            .create_checkout_session(&CheckoutSessionParams {
                mode: "payment",
                customer,
                line_items: vec![SessionLineItem::Dynamic {
                    name: "Wallet top-up".to_string(),
                    currency,
                    amount_minor: request.amount_minor,
                    quantity: 1,
                }],
                success_url: request.success_url,
                cancel_url: request.cancel_url,
                metadata: vec![
                    ("teamId".to_string(), team_id.to_string()),
                    ("appId".to_string(), app_id.to_string()),
                ],
                payment_intent_metadata: vec![
                    ("type".to_string(), "wallet_topup".to_string()),
                    ("teamId".to_string(), team_id.to_string()),
                    ("appId".to_string(), app_id.to_string()),
                ],
            })
            .await?;

        let url = session
            .url
            .ok_or_else(|| BillingError::Stripe("checkout session has no url".to_string()))?;

        Ok(CheckoutResponse {
            url,
            session_id: session.id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_marker_detection() {
        let pending = format!("{PENDING_PREFIX}{}", Uuid::new_v4());
        assert!(pending.starts_with(PENDING_PREFIX));
        assert!(!"cus_412".starts_with(PENDING_PREFIX));
    }

    #[test]
    fn test_poll_window_is_five_seconds() {
        let total = POLL_INTERVAL * MAX_POLL_ITERATIONS;
        assert_eq!(total, Duration::from_secs(5));
    }

    #[test]
    fn test_product_kind_parse() {
        assert_eq!(ProductKind::parse("BASE").unwrap(), ProductKind::Base);
        assert_eq!(ProductKind::parse("SEAT").unwrap(), ProductKind::Seat);
        assert!(ProductKind::parse("FLAT").is_err());
    }

    #[test]
    fn test_subscription_checkout_request_validation() {
        let bad = SubscriptionCheckoutRequest {
            plan_code: String::new(),
            success_url: "not a url".to_string(),
            cancel_url: "https://app.example/cancel".to_string(),
            seats: Some(0),
        };
        let err = bad.validate().unwrap_err();
        let fields = err.field_errors();
        assert!(fields.contains_key("plan_code"));
        assert!(fields.contains_key("success_url"));
        assert!(fields.contains_key("seats"));
    }

    #[test]
    fn test_topup_request_requires_positive_amount() {
        let bad = TopupCheckoutRequest {
            amount_minor: 0,
            currency: None,
            success_url: "https://app.example/ok".to_string(),
            cancel_url: "https://app.example/no".to_string(),
        };
        assert!(bad.validate().is_err());
    }
}
