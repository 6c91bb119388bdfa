// Webhook Reconciler - Verified, Deduplicated Stripe Callback Processing
// Signature over raw bytes, dedup by event id, duplicate ledger writes swallowed

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::core::{is_unique_violation, BillingError, BillingResult};
use crate::entitlements::EntitlementService;
use crate::ledger::{AccountType, EntryType, LedgerService, NewLedgerEntry, ReferenceType};
use crate::stripe::{map_subscription_status, StripeClient, StripeEvent};
use crate::teams;

/// Sum of subscription item quantities, defaulting to one seat.
pub fn seats_from_subscription(subscription: &Value) -> i64 {
    let total: i64 = subscription["items"]["data"]
        .as_array()
        .map(|items| {
            items
                .iter()
                .map(|item| item["quantity"].as_i64().unwrap_or(0))
                .sum()
        })
        .unwrap_or(0);

    if total > 0 {
        total
    } else {
        1
    }
}

/// Stripe sends epoch seconds; the domain stores instants.
pub fn ts_from_epoch_seconds(value: &Value) -> Option<DateTime<Utc>> {
    value
        .as_i64()
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
}

/// A checkout session references its subscription either as a bare id or an
/// expanded object; normalize to `(id, detail object)`.
pub fn subscription_ref(session: &Value) -> Option<(String, Value)> {
    match &session["subscription"] {
        Value::String(id) => Some((id.clone(), Value::Null)),
        Value::Object(_) => session["subscription"]["id"]
            .as_str()
            .map(|id| (id.to_string(), session["subscription"].clone())),
        _ => None,
    }
}

fn metadata_uuid(object: &Value, key: &str) -> Option<Uuid> {
    object["metadata"][key]
        .as_str()
        .and_then(|raw| Uuid::parse_str(raw).ok())
}

// Reconciler over Postgres and the ledger
pub struct WebhookReconciler {
    db_pool: PgPool,
    stripe: Arc<StripeClient>,
    ledger: Arc<LedgerService>,
    entitlements: Arc<EntitlementService>,
}

impl WebhookReconciler {
    pub fn new(
        db_pool: PgPool,
        stripe: Arc<StripeClient>,
        ledger: Arc<LedgerService>,
        entitlements: Arc<EntitlementService>,
    ) -> Self {
        Self {
            db_pool,
            stripe,
            ledger,
            entitlements,
        }
    }

    /// The full webhook pipeline. The signature covers the raw bytes, so the
    /// body must arrive unparsed.
    pub async fn process(&self, raw_body: &[u8], sig_header: &str) -> BillingResult<Value> {
        self.stripe
            .verify_signature(raw_body, sig_header)
            .map_err(|_| {
                BillingError::WebhookSignature("Invalid webhook signature".to_string())
            })?;

        let event = StripeEvent::from_bytes(raw_body)?;

        if !self.mark_seen(&event).await? {
            tracing::info!(event_id = event.id, "🔁 Duplicate webhook event, skipping");
            return Ok(json!({"received": true}));
        }

        tracing::info!(event_id = event.id, event_type = event.event_type, "📨 Stripe webhook");

        match event.event_type.as_str() {
            "checkout.session.completed" => self.on_checkout_completed(&event).await?,
            "customer.subscription.updated" => self.on_subscription_updated(&event).await?,
            "customer.subscription.deleted" => self.on_subscription_deleted(&event).await?,
            "invoice.paid" => self.on_invoice_paid(&event).await?,
            "invoice.payment_failed" => self.on_invoice_payment_failed(&event).await?,
            "payment_intent.succeeded" => self.on_payment_intent_succeeded(&event).await?,
            other => {
                tracing::debug!(event_type = other, "Unhandled webhook event type");
            }
        }

        Ok(json!({"received": true}))
    }

    /// Dedup by event id; false means this event was already processed.
    async fn mark_seen(&self, event: &StripeEvent) -> BillingResult<bool> {
        let inserted = sqlx::query(
            "INSERT INTO webhook_events (event_id, event_type) VALUES ($1, $2)",
        )
        .bind(&event.id)
        .bind(&event.event_type)
        .execute(&self.db_pool)
        .await;

        match inserted {
            Ok(_) => Ok(true),
            Err(e) if is_unique_violation(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn on_checkout_completed(&self, event: &StripeEvent) -> BillingResult<()> {
        let session = &event.data.object;

        if session["mode"].as_str() != Some("subscription") {
            return Ok(());
        }

        let Some(team_id) = metadata_uuid(session, "teamId") else {
            tracing::warn!(event_id = event.id, "checkout session has no teamId metadata");
            return Ok(());
        };
        let Some(plan_id) = metadata_uuid(session, "planId") else {
            tracing::warn!(event_id = event.id, "checkout session has no planId metadata");
            return Ok(());
        };
        let Some((subscription_id, detail)) = subscription_ref(session) else {
            tracing::warn!(event_id = event.id, "checkout session has no subscription");
            return Ok(());
        };

        let status = map_subscription_status(detail["status"].as_str().unwrap_or("active"));
        let period_start = ts_from_epoch_seconds(&detail["current_period_start"]);
        let period_end = ts_from_epoch_seconds(&detail["current_period_end"]);
        let seats = seats_from_subscription(&detail);

        sqlx::query(
            r#"
            INSERT INTO team_subscriptions
                (team_id, plan_id, stripe_subscription_id, status,
                 current_period_start, current_period_end, seats_quantity)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (stripe_subscription_id)
            DO UPDATE SET
                status = EXCLUDED.status,
                current_period_start = EXCLUDED.current_period_start,
                current_period_end = EXCLUDED.current_period_end,
                seats_quantity = EXCLUDED.seats_quantity,
                updated_at = NOW()
            "#,
        )
        .bind(team_id)
        .bind(plan_id)
        .bind(&subscription_id)
        .bind(status)
        .bind(period_start)
        .bind(period_end)
        .bind(seats as i32)
        .execute(&self.db_pool)
        .await?;

        if let Some(app_id) = metadata_uuid(session, "appId") {
            let bill_to_id = teams::billing_entity_for_team(&self.db_pool, team_id).await?;
            let amount = session["amount_total"].as_i64().unwrap_or(0);
            let currency = session["currency"]
                .as_str()
                .unwrap_or("usd")
                .to_uppercase();

            self.record_entry_swallowing_duplicate(NewLedgerEntry {
                app_id,
                bill_to_id,
                account_type: AccountType::Revenue,
                entry_type: EntryType::SubscriptionCharge,
                amount_minor: amount,
                currency,
                reference_type: ReferenceType::Manual,
                reference_id: session["id"].as_str().map(str::to_string),
                idempotency_key: format!("checkout:{}", event.id),
                metadata: json!({
                    "stripeSubscriptionId": subscription_id,
                    "planId": plan_id,
                }),
            })
            .await?;
        }

        self.entitlements.refresh(team_id);
        Ok(())
    }

    async fn on_subscription_updated(&self, event: &StripeEvent) -> BillingResult<()> {
        let subscription = &event.data.object;
        let Some(subscription_id) = subscription["id"].as_str() else {
            return Ok(());
        };

        let status = map_subscription_status(subscription["status"].as_str().unwrap_or("active"));
        let period_start = ts_from_epoch_seconds(&subscription["current_period_start"]);
        let period_end = ts_from_epoch_seconds(&subscription["current_period_end"]);
        let seats = seats_from_subscription(subscription);

        let updated = sqlx::query(
            r#"
            UPDATE team_subscriptions
            SET status = $2,
                current_period_start = COALESCE($3, current_period_start),
                current_period_end = COALESCE($4, current_period_end),
                seats_quantity = $5,
                updated_at = NOW()
            WHERE stripe_subscription_id = $1
            RETURNING team_id
            "#,
        )
        .bind(subscription_id)
        .bind(status)
        .bind(period_start)
        .bind(period_end)
        .bind(seats as i32)
        .fetch_optional(&self.db_pool)
        .await?;

        if let Some(row) = updated {
            self.entitlements.refresh(row.try_get("team_id")?);
        }
        Ok(())
    }

    async fn on_subscription_deleted(&self, event: &StripeEvent) -> BillingResult<()> {
        let subscription = &event.data.object;
        let Some(subscription_id) = subscription["id"].as_str() else {
            return Ok(());
        };

        let updated = sqlx::query(
            r#"
            UPDATE team_subscriptions
            SET status = 'CANCELED', updated_at = NOW()
            WHERE stripe_subscription_id = $1
            RETURNING team_id
            "#,
        )
        .bind(subscription_id)
        .fetch_optional(&self.db_pool)
        .await?;

        if let Some(row) = updated {
            self.entitlements.refresh(row.try_get("team_id")?);
        }
        Ok(())
    }

    async fn on_invoice_paid(&self, event: &StripeEvent) -> BillingResult<()> {
        let invoice = &event.data.object;
        let Some(subscription_id) = invoice["subscription"].as_str() else {
            return Ok(());
        };

        let Some(context) = self.subscription_context(subscription_id).await? else {
            tracing::warn!(
                event_id = event.id,
                subscription_id,
                "invoice.paid for unknown subscription"
            );
            return Ok(());
        };

        let amount = invoice["amount_paid"].as_i64().unwrap_or(0);
        let currency = invoice["currency"].as_str().unwrap_or("usd").to_uppercase();

        self.record_entry_swallowing_duplicate(NewLedgerEntry {
            app_id: context.app_id,
            bill_to_id: context.bill_to_id,
            account_type: AccountType::Revenue,
            entry_type: EntryType::SubscriptionCharge,
            amount_minor: amount,
            currency,
            reference_type: ReferenceType::StripeInvoice,
            reference_id: invoice["id"].as_str().map(str::to_string),
            idempotency_key: format!("invoice_paid:{}", event.id),
            metadata: json!({"stripeSubscriptionId": subscription_id}),
        })
        .await?;

        Ok(())
    }

    async fn on_invoice_payment_failed(&self, event: &StripeEvent) -> BillingResult<()> {
        let invoice = &event.data.object;
        let Some(subscription_id) = invoice["subscription"].as_str() else {
            return Ok(());
        };

        let Some(context) = self.subscription_context(subscription_id).await? else {
            return Ok(());
        };

        let currency = invoice["currency"].as_str().unwrap_or("usd").to_uppercase();

        self.record_entry_swallowing_duplicate(NewLedgerEntry {
            app_id: context.app_id,
            bill_to_id: context.bill_to_id,
            account_type: AccountType::AccountsReceivable,
            entry_type: EntryType::Adjustment,
            amount_minor: 0,
            currency,
            reference_type: ReferenceType::StripeInvoice,
            reference_id: invoice["id"].as_str().map(str::to_string),
            idempotency_key: format!("invoice_failed:{}", event.id),
            metadata: json!({
                "stripeSubscriptionId": subscription_id,
                "amountDue": invoice["amount_due"].as_i64().unwrap_or(0),
            }),
        })
        .await?;

        self.entitlements.refresh(context.team_id);
        Ok(())
    }

    async fn on_payment_intent_succeeded(&self, event: &StripeEvent) -> BillingResult<()> {
        let intent = &event.data.object;

        if intent["metadata"]["type"].as_str() != Some("wallet_topup") {
            return Ok(());
        }

        let Some(team_id) = metadata_uuid(intent, "teamId") else {
            tracing::warn!(event_id = event.id, "wallet topup intent has no teamId");
            return Ok(());
        };
        let Some(app_id) = metadata_uuid(intent, "appId") else {
            tracing::warn!(event_id = event.id, "wallet topup intent has no appId");
            return Ok(());
        };

        let bill_to_id = teams::billing_entity_for_team(&self.db_pool, team_id).await?;
        let amount = intent["amount"].as_i64().unwrap_or(0);
        let currency = intent["currency"].as_str().unwrap_or("usd").to_uppercase();

        self.record_entry_swallowing_duplicate(NewLedgerEntry {
            app_id,
            bill_to_id,
            account_type: AccountType::Wallet,
            entry_type: EntryType::Topup,
            amount_minor: amount,
            currency,
            reference_type: ReferenceType::StripePaymentIntent,
            reference_id: intent["id"].as_str().map(str::to_string),
            idempotency_key: format!("topup:{}", event.id),
            metadata: json!({
                "trigger": intent["metadata"]["trigger"].as_str().unwrap_or("manual"),
            }),
        })
        .await?;

        tracing::info!(%team_id, %app_id, amount, "💰 Wallet topup credited");
        Ok(())
    }

    async fn record_entry_swallowing_duplicate(&self, entry: NewLedgerEntry) -> BillingResult<()> {
        match self.ledger.create_entry(entry).await {
            Ok(_) => Ok(()),
            Err(BillingError::DuplicateLedgerEntry(key)) => {
                tracing::info!(idempotency_key = key, "Ledger entry already recorded");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn subscription_context(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionContext>> {
        let row = sqlx::query(
            r#"
            SELECT ts.team_id, p.app_id, be.id AS bill_to_id
            FROM team_subscriptions ts
            JOIN plans p ON p.id = ts.plan_id
            JOIN billing_entities be ON be.team_id = ts.team_id
            WHERE ts.stripe_subscription_id = $1
            "#,
        )
        .bind(stripe_subscription_id)
        .fetch_optional(&self.db_pool)
        .await?;

        row.map(|row| {
            Ok(SubscriptionContext {
                team_id: row.try_get("team_id")?,
                app_id: row.try_get("app_id")?,
                bill_to_id: row.try_get("bill_to_id")?,
            })
        })
        .transpose()
    }
}

struct SubscriptionContext {
    team_id: Uuid,
    app_id: Uuid,
    bill_to_id: Uuid,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_seats_sum_over_items() {
        let subscription = json!({
            "items": {"data": [
                {"quantity": 2},
                {"quantity": 3},
            ]}
        });
        assert_eq!(seats_from_subscription(&subscription), 5);
    }

    #[test]
    fn test_seats_default_to_one() {
        assert_eq!(seats_from_subscription(&json!({})), 1);
        assert_eq!(seats_from_subscription(&json!({"items": {"data": []}})), 1);
        assert_eq!(
            seats_from_subscription(&json!({"items": {"data": [{"quantity": 0}]}})),
            1
        );
    }

    #[test]
    fn test_epoch_second_conversion() {
        let ts = ts_from_epoch_seconds(&json!(1_700_000_000)).unwrap();
        assert_eq!(ts.timestamp(), 1_700_000_000);
        assert!(ts_from_epoch_seconds(&json!(null)).is_none());
        assert!(ts_from_epoch_seconds(&json!("soon")).is_none());
    }

    #[test]
    fn test_subscription_ref_from_bare_id() {
        let session = json!({"subscription": "sub_123"});
        let (id, detail) = subscription_ref(&session).unwrap();
        assert_eq!(id, "sub_123");
        assert!(detail.is_null());
    }

    #[test]
    fn test_subscription_ref_from_expanded_object() {
        let session = json!({
            "subscription": {
                "id": "sub_456",
                "status": "trialing",
                "current_period_start": 1_700_000_000,
            }
        });
        let (id, detail) = subscription_ref(&session).unwrap();
        assert_eq!(id, "sub_456");
        assert_eq!(detail["status"], json!("trialing"));
    }

    #[test]
    fn test_subscription_ref_absent() {
        assert!(subscription_ref(&json!({})).is_none());
        assert!(subscription_ref(&json!({"subscription": null})).is_none());
    }

    #[test]
    fn test_metadata_uuid_parsing() {
        let id = Uuid::new_v4();
        let object = json!({"metadata": {"teamId": id.to_string(), "appId": "not-a-uuid"}});
        assert_eq!(metadata_uuid(&object, "teamId"), Some(id));
        assert_eq!(metadata_uuid(&object, "appId"), None);
        assert_eq!(metadata_uuid(&object, "planId"), None);
    }
}
