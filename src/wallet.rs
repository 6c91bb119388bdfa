// Wallet Debiter - Immediate and Batched Debits Against Prepaid Balances
// Deterministic idempotency keys make every debit path rerunnable

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::core::{BillingError, BillingResult};
use crate::ledger::{AccountType, EntryType, LedgerService, NewLedgerEntry, ReferenceType};
use crate::pricing::{BookKind, LineItemRecord};
use crate::stripe::StripeClient;
use crate::teams::{self, BillingMode};

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct WalletRunSummary {
    pub groups: u32,
    pub debited_items: u32,
    pub skipped_groups: u32,
}

/// Deterministic key for a batch debit: the sorted line-item ids pin the key
/// to the exact set being debited, so a rerun collides instead of double
/// charging.
pub fn batch_idempotency_key(team_id: Uuid, app_id: Uuid, line_item_ids: &[Uuid]) -> String {
    let mut ids: Vec<String> = line_item_ids.iter().map(|id| id.to_string()).collect();
    ids.sort();
    format!("wallet-batch:{team_id}:{app_id}:{}", ids.join(","))
}

pub fn immediate_idempotency_key(line_item_id: Uuid) -> String {
    format!("wallet-debit:{line_item_id}")
}

// Wallet debits over the ledger
pub struct WalletService {
    db_pool: PgPool,
    ledger: Arc<LedgerService>,
    stripe: Arc<StripeClient>,
}

impl WalletService {
    pub fn new(db_pool: PgPool, ledger: Arc<LedgerService>, stripe: Arc<StripeClient>) -> Self {
        Self {
            db_pool,
            ledger,
            stripe,
        }
    }

    /// Debit one CUSTOMER line item synchronously after pricing. Skips (never
    /// fails) when the item is already debited, is not customer-facing, or the
    /// team is not wallet-mode.
    pub async fn debit_immediate(&self, line_item_id: Uuid) -> BillingResult<()> {
        let row = sqlx::query(
            r#"
            SELECT id, usage_event_id, app_id, team_id, bill_to_id, book_kind, event_type,
                   amount_minor, currency, wallet_debited_at
            FROM billable_line_items
            WHERE id = $1
            "#,
        )
        .bind(line_item_id)
        .fetch_optional(&self.db_pool)
        .await?
        .ok_or_else(|| BillingError::Internal(format!("line item {line_item_id} not found")))?;

        let item = LineItemRecord::from_row(&row)?;

        if item.wallet_debited_at.is_some() || item.book_kind != BookKind::Customer {
            return Ok(());
        }

        let team = teams::load_team(&self.db_pool, item.team_id).await?;
        if team.billing_mode != BillingMode::Wallet {
            return Ok(());
        }

        let debit = self
            .ledger
            .create_entry(NewLedgerEntry {
                app_id: item.app_id,
                bill_to_id: item.bill_to_id,
                account_type: AccountType::Wallet,
                entry_type: EntryType::UsageCharge,
                amount_minor: -item.amount_minor,
                currency: item.currency.clone(),
                reference_type: ReferenceType::UsageEvent,
                reference_id: Some(item.usage_event_id.to_string()),
                idempotency_key: immediate_idempotency_key(item.id),
                metadata: json!({
                    "lineItemId": item.id,
                    "eventType": item.event_type,
                }),
            })
            .await;

        match debit {
            Ok(_) | Err(BillingError::DuplicateLedgerEntry(_)) => {}
            Err(e) => return Err(e),
        }

        sqlx::query("UPDATE billable_line_items SET wallet_debited_at = NOW() WHERE id = $1")
            .bind(item.id)
            .execute(&self.db_pool)
            .await?;

        self.check_and_trigger_auto_topup(item.app_id, item.team_id)
            .await;

        Ok(())
    }

    /// Daily sweep: one aggregate debit per `(team, app)` group of not-yet
    /// debited CUSTOMER line items belonging to wallet-mode teams.
    pub async fn debit_batch(&self) -> BillingResult<WalletRunSummary> {
        let rows = sqlx::query(
            r#"
            SELECT id, usage_event_id, app_id, team_id, bill_to_id, book_kind, event_type,
                   amount_minor, currency, wallet_debited_at
            FROM billable_line_items
            WHERE wallet_debited_at IS NULL AND book_kind = 'CUSTOMER'
            ORDER BY created_at
            "#,
        )
        .fetch_all(&self.db_pool)
        .await?;

        let mut groups: BTreeMap<(Uuid, Uuid), Vec<LineItemRecord>> = BTreeMap::new();
        for row in rows {
            let item = LineItemRecord::from_row(&row)?;
            groups
                .entry((item.team_id, item.app_id))
                .or_default()
                .push(item);
        }

        let mut summary = WalletRunSummary::default();

        for ((team_id, app_id), items) in groups {
            summary.groups += 1;

            let team = teams::load_team(&self.db_pool, team_id).await?;
            if team.billing_mode != BillingMode::Wallet {
                summary.skipped_groups += 1;
                continue;
            }

            let total: i64 = items.iter().map(|i| i.amount_minor).sum();
            let ids: Vec<Uuid> = items.iter().map(|i| i.id).collect();
            let currency = items[0].currency.clone();
            let bill_to_id = items[0].bill_to_id;

            let debit = self
                .ledger
                .create_entry(NewLedgerEntry {
                    app_id,
                    bill_to_id,
                    account_type: AccountType::Wallet,
                    entry_type: EntryType::UsageCharge,
                    amount_minor: -total,
                    currency,
                    reference_type: ReferenceType::Manual,
                    reference_id: None,
                    idempotency_key: batch_idempotency_key(team_id, app_id, &ids),
                    metadata: json!({
                        "lineItemCount": ids.len(),
                        "lineItemIds": ids,
                    }),
                })
                .await;

            match debit {
                Ok(_) | Err(BillingError::DuplicateLedgerEntry(_)) => {}
                Err(e) => return Err(e),
            }

            sqlx::query(
                "UPDATE billable_line_items SET wallet_debited_at = NOW() WHERE id = ANY($1)",
            )
            .bind(&ids)
            .execute(&self.db_pool)
            .await?;

            summary.debited_items += ids.len() as u32;
        }

        tracing::info!(
            groups = summary.groups,
            debited_items = summary.debited_items,
            skipped_groups = summary.skipped_groups,
            "💸 Wallet batch debit complete"
        );

        Ok(summary)
    }

    /// Fire a non-interactive topup payment intent when the wallet balance
    /// has dropped below the configured threshold. Failures are logged, never
    /// propagated: the debit that triggered the check already happened.
    pub async fn check_and_trigger_auto_topup(&self, app_id: Uuid, team_id: Uuid) {
        if let Err(e) = self.try_auto_topup(app_id, team_id).await {
            tracing::error!(%team_id, %app_id, error = %e, "❌ Auto-topup trigger failed");
        }
    }

    async fn try_auto_topup(&self, app_id: Uuid, team_id: Uuid) -> BillingResult<()> {
        let config_row = sqlx::query(
            r#"
            SELECT auto_top_up_enabled, threshold_minor, top_up_amount_minor, currency
            FROM wallet_configs
            WHERE team_id = $1 AND app_id = $2
            "#,
        )
        .bind(team_id)
        .bind(app_id)
        .fetch_optional(&self.db_pool)
        .await?;

        let Some(config) = config_row else {
            return Ok(());
        };
        if !config.try_get::<bool, _>("auto_top_up_enabled")? {
            return Ok(());
        }

        let threshold: i64 = config.try_get("threshold_minor")?;
        let topup_amount: i64 = config.try_get("top_up_amount_minor")?;
        let currency: String = config.try_get("currency")?;

        let bill_to_id = teams::billing_entity_for_team(&self.db_pool, team_id).await?;
        let balance = self
            .ledger
            .get_balance(app_id, bill_to_id, AccountType::Wallet)
            .await?;
        if balance >= threshold {
            return Ok(());
        }

        let team = teams::load_team(&self.db_pool, team_id).await?;
        let customer = team
            .external_customer_id
            .filter(|id| !id.starts_with("pending:"))
            .ok_or_else(|| {
                BillingError::Stripe("team has no external customer for auto-topup".to_string())
            })?;

        let intent = self
            .stripe
            .create_payment_intent(
                topup_amount,
                &currency,
                &customer,
                &[
                    ("type".to_string(), "wallet_topup".to_string()),
                    ("trigger".to_string(), "auto_topup".to_string()),
                    ("teamId".to_string(), team_id.to_string()),
                    ("appId".to_string(), app_id.to_string()),
                ],
            )
            .await?;

        tracing::info!(
            %team_id,
            %app_id,
            intent_id = intent.id,
            balance,
            threshold,
            "🔋 Auto-topup payment intent issued"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_key_is_order_independent() {
        let team = Uuid::new_v4();
        let app = Uuid::new_v4();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        assert_eq!(
            batch_idempotency_key(team, app, &[a, b]),
            batch_idempotency_key(team, app, &[b, a]),
        );
    }

    #[test]
    fn test_batch_key_changes_with_item_set() {
        let team = Uuid::new_v4();
        let app = Uuid::new_v4();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        assert_ne!(
            batch_idempotency_key(team, app, &[a]),
            batch_idempotency_key(team, app, &[a, b]),
        );
    }

    #[test]
    fn test_immediate_key_format() {
        let id = Uuid::new_v4();
        assert_eq!(
            immediate_idempotency_key(id),
            format!("wallet-debit:{id}")
        );
    }
}
