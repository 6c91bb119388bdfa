// Ledger - Idempotent Append-Only Monetary Entries
// Advisory-locked writers, balances derived from history alone

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::core::{is_unique_violation, BillingError, BillingResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountType {
    Wallet,
    AccountsReceivable,
    Revenue,
    Cogs,
    Tax,
}

impl AccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Wallet => "WALLET",
            Self::AccountsReceivable => "ACCOUNTS_RECEIVABLE",
            Self::Revenue => "REVENUE",
            Self::Cogs => "COGS",
            Self::Tax => "TAX",
        }
    }

    pub fn parse(s: &str) -> BillingResult<Self> {
        match s {
            "WALLET" => Ok(Self::Wallet),
            "ACCOUNTS_RECEIVABLE" => Ok(Self::AccountsReceivable),
            "REVENUE" => Ok(Self::Revenue),
            "COGS" => Ok(Self::Cogs),
            "TAX" => Ok(Self::Tax),
            other => Err(BillingError::Internal(format!(
                "invalid account type: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryType {
    Topup,
    SubscriptionCharge,
    UsageCharge,
    Refund,
    Adjustment,
    InvoicePayment,
    CogsAccrual,
}

impl EntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Topup => "TOPUP",
            Self::SubscriptionCharge => "SUBSCRIPTION_CHARGE",
            Self::UsageCharge => "USAGE_CHARGE",
            Self::Refund => "REFUND",
            Self::Adjustment => "ADJUSTMENT",
            Self::InvoicePayment => "INVOICE_PAYMENT",
            Self::CogsAccrual => "COGS_ACCRUAL",
        }
    }

    pub fn parse(s: &str) -> BillingResult<Self> {
        match s {
            "TOPUP" => Ok(Self::Topup),
            "SUBSCRIPTION_CHARGE" => Ok(Self::SubscriptionCharge),
            "USAGE_CHARGE" => Ok(Self::UsageCharge),
            "REFUND" => Ok(Self::Refund),
            "ADJUSTMENT" => Ok(Self::Adjustment),
            "INVOICE_PAYMENT" => Ok(Self::InvoicePayment),
            "COGS_ACCRUAL" => Ok(Self::CogsAccrual),
            other => Err(BillingError::Internal(format!("invalid entry type: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReferenceType {
    StripeInvoice,
    StripePaymentIntent,
    UsageEvent,
    Manual,
}

impl ReferenceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StripeInvoice => "STRIPE_INVOICE",
            Self::StripePaymentIntent => "STRIPE_PAYMENT_INTENT",
            Self::UsageEvent => "USAGE_EVENT",
            Self::Manual => "MANUAL",
        }
    }

    pub fn parse(s: &str) -> BillingResult<Self> {
        match s {
            "STRIPE_INVOICE" => Ok(Self::StripeInvoice),
            "STRIPE_PAYMENT_INTENT" => Ok(Self::StripePaymentIntent),
            "USAGE_EVENT" => Ok(Self::UsageEvent),
            "MANUAL" => Ok(Self::Manual),
            other => Err(BillingError::Internal(format!(
                "invalid reference type: {other}"
            ))),
        }
    }
}

/// One immutable monetary delta. Credits are positive, debits negative,
/// relative to the account's natural direction.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub id: Uuid,
    pub app_id: Uuid,
    pub bill_to_id: Uuid,
    pub ledger_account_id: Uuid,
    #[serde(rename = "type")]
    pub entry_type: EntryType,
    pub amount_minor: i64,
    pub currency: String,
    pub reference_type: ReferenceType,
    pub reference_id: Option<String>,
    pub idempotency_key: String,
    pub metadata: Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewLedgerEntry {
    pub app_id: Uuid,
    pub bill_to_id: Uuid,
    pub account_type: AccountType,
    pub entry_type: EntryType,
    pub amount_minor: i64,
    pub currency: String,
    pub reference_type: ReferenceType,
    pub reference_id: Option<String>,
    pub idempotency_key: String,
    pub metadata: Value,
}

#[derive(Debug, Clone, Default)]
pub struct EntryFilter {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub entry_type: Option<EntryType>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryPage {
    pub entries: Vec<LedgerEntry>,
    pub total: i64,
}

/// Advisory-lock key: first eight bytes of SHA-256 over the account
/// coordinates, as a big-endian i64. Concurrent writers to one account
/// serialize on this key.
pub fn account_lock_key(app_id: Uuid, bill_to_id: Uuid, account_type: AccountType) -> i64 {
    let mut hasher = Sha256::new();
    hasher.update(app_id.as_bytes());
    hasher.update(bill_to_id.as_bytes());
    hasher.update(account_type.as_str().as_bytes());
    let digest = hasher.finalize();

    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(prefix)
}

// Ledger over Postgres
pub struct LedgerService {
    db_pool: PgPool,
}

impl LedgerService {
    pub fn new(db_pool: PgPool) -> Self {
        Self { db_pool }
    }

    /// Read-then-insert with conflict fallback, so concurrent creators of the
    /// same account converge on one row.
    pub async fn get_or_create_account(
        &self,
        app_id: Uuid,
        bill_to_id: Uuid,
        account_type: AccountType,
    ) -> BillingResult<Uuid> {
        let select =
            "SELECT id FROM ledger_accounts WHERE app_id = $1 AND bill_to_id = $2 AND type = $3";

        if let Some(row) = sqlx::query(select)
            .bind(app_id)
            .bind(bill_to_id)
            .bind(account_type.as_str())
            .fetch_optional(&self.db_pool)
            .await?
        {
            return Ok(row.try_get("id")?);
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO ledger_accounts (app_id, bill_to_id, type)
            VALUES ($1, $2, $3)
            ON CONFLICT (app_id, bill_to_id, type) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(app_id)
        .bind(bill_to_id)
        .bind(account_type.as_str())
        .fetch_optional(&self.db_pool)
        .await?;

        if let Some(row) = inserted {
            return Ok(row.try_get("id")?);
        }

        // lost the race; the row exists now
        let row = sqlx::query(select)
            .bind(app_id)
            .bind(bill_to_id)
            .bind(account_type.as_str())
            .fetch_one(&self.db_pool)
            .await?;
        Ok(row.try_get("id")?)
    }

    /// Append one entry. The transaction takes the per-account advisory lock
    /// before inserting so each account observes a sequential history. A
    /// duplicate idempotency key surfaces as `DuplicateLedgerEntry`; callers
    /// that rerun work (webhooks, period close, wallet debits) swallow it.
    pub async fn create_entry(&self, input: NewLedgerEntry) -> BillingResult<Uuid> {
        let account_id = self
            .get_or_create_account(input.app_id, input.bill_to_id, input.account_type)
            .await?;

        let mut tx = self.db_pool.begin().await?;

        let lock_key = account_lock_key(input.app_id, input.bill_to_id, input.account_type);
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(lock_key)
            .execute(&mut *tx)
            .await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO ledger_entries
                (app_id, bill_to_id, ledger_account_id, type, amount_minor, currency,
                 reference_type, reference_id, idempotency_key, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING id
            "#,
        )
        .bind(input.app_id)
        .bind(input.bill_to_id)
        .bind(account_id)
        .bind(input.entry_type.as_str())
        .bind(input.amount_minor)
        .bind(&input.currency)
        .bind(input.reference_type.as_str())
        .bind(&input.reference_id)
        .bind(&input.idempotency_key)
        .bind(&input.metadata)
        .fetch_one(&mut *tx)
        .await;

        let entry_id: Uuid = match inserted {
            Ok(row) => row.try_get("id")?,
            Err(e) if is_unique_violation(&e) => {
                tx.rollback().await?;
                return Err(BillingError::DuplicateLedgerEntry(input.idempotency_key));
            }
            Err(e) => {
                tx.rollback().await?;
                return Err(e.into());
            }
        };

        tx.commit().await?;

        tracing::debug!(
            %entry_id,
            entry_type = input.entry_type.as_str(),
            amount_minor = input.amount_minor,
            "📒 Ledger entry recorded"
        );

        Ok(entry_id)
    }

    /// Balance is the sum over entries; there is no cached balance column.
    pub async fn get_balance(
        &self,
        app_id: Uuid,
        bill_to_id: Uuid,
        account_type: AccountType,
    ) -> BillingResult<i64> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(e.amount_minor), 0)::bigint AS balance
            FROM ledger_entries e
            JOIN ledger_accounts a ON a.id = e.ledger_account_id
            WHERE a.app_id = $1 AND a.bill_to_id = $2 AND a.type = $3
            "#,
        )
        .bind(app_id)
        .bind(bill_to_id)
        .bind(account_type.as_str())
        .fetch_one(&self.db_pool)
        .await?;

        Ok(row.try_get("balance")?)
    }

    pub async fn get_entries(
        &self,
        app_id: Uuid,
        bill_to_id: Uuid,
        filter: EntryFilter,
    ) -> BillingResult<EntryPage> {
        let limit = filter.limit.unwrap_or(50).clamp(1, 500);
        let offset = filter.offset.unwrap_or(0).max(0);
        let entry_type = filter.entry_type.map(|t| t.as_str().to_string());

        let rows = sqlx::query(
            r#"
            SELECT id, app_id, bill_to_id, ledger_account_id, type, amount_minor, currency,
                   reference_type, reference_id, idempotency_key, metadata, timestamp
            FROM ledger_entries
            WHERE app_id = $1 AND bill_to_id = $2
              AND ($3::timestamptz IS NULL OR timestamp >= $3)
              AND ($4::timestamptz IS NULL OR timestamp < $4)
              AND ($5::varchar IS NULL OR type = $5)
            ORDER BY timestamp DESC
            LIMIT $6 OFFSET $7
            "#,
        )
        .bind(app_id)
        .bind(bill_to_id)
        .bind(filter.from)
        .bind(filter.to)
        .bind(&entry_type)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.db_pool)
        .await?;

        let total_row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total
            FROM ledger_entries
            WHERE app_id = $1 AND bill_to_id = $2
              AND ($3::timestamptz IS NULL OR timestamp >= $3)
              AND ($4::timestamptz IS NULL OR timestamp < $4)
              AND ($5::varchar IS NULL OR type = $5)
            "#,
        )
        .bind(app_id)
        .bind(bill_to_id)
        .bind(filter.from)
        .bind(filter.to)
        .bind(&entry_type)
        .fetch_one(&self.db_pool)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            entries.push(Self::entry_from_row(&row)?);
        }

        Ok(EntryPage {
            entries,
            total: total_row.try_get("total")?,
        })
    }

    fn entry_from_row(row: &sqlx::postgres::PgRow) -> BillingResult<LedgerEntry> {
        Ok(LedgerEntry {
            id: row.try_get("id")?,
            app_id: row.try_get("app_id")?,
            bill_to_id: row.try_get("bill_to_id")?,
            ledger_account_id: row.try_get("ledger_account_id")?,
            entry_type: EntryType::parse(row.try_get::<String, _>("type")?.as_str())?,
            amount_minor: row.try_get("amount_minor")?,
            currency: row.try_get("currency")?,
            reference_type: ReferenceType::parse(
                row.try_get::<String, _>("reference_type")?.as_str(),
            )?,
            reference_id: row.try_get("reference_id")?,
            idempotency_key: row.try_get("idempotency_key")?,
            metadata: row.try_get("metadata")?,
            timestamp: row.try_get("timestamp")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_key_is_deterministic() {
        let app = Uuid::new_v4();
        let bill_to = Uuid::new_v4();
        let a = account_lock_key(app, bill_to, AccountType::Wallet);
        let b = account_lock_key(app, bill_to, AccountType::Wallet);
        assert_eq!(a, b);
    }

    #[test]
    fn test_lock_key_differs_per_account_type() {
        let app = Uuid::new_v4();
        let bill_to = Uuid::new_v4();
        let wallet = account_lock_key(app, bill_to, AccountType::Wallet);
        let ar = account_lock_key(app, bill_to, AccountType::AccountsReceivable);
        assert_ne!(wallet, ar);
    }

    #[test]
    fn test_lock_key_differs_per_bill_to() {
        let app = Uuid::new_v4();
        let a = account_lock_key(app, Uuid::new_v4(), AccountType::Revenue);
        let b = account_lock_key(app, Uuid::new_v4(), AccountType::Revenue);
        assert_ne!(a, b);
    }

    #[test]
    fn test_account_type_round_trip() {
        for t in [
            AccountType::Wallet,
            AccountType::AccountsReceivable,
            AccountType::Revenue,
            AccountType::Cogs,
            AccountType::Tax,
        ] {
            assert_eq!(AccountType::parse(t.as_str()).unwrap(), t);
        }
        assert!(AccountType::parse("PETTY_CASH").is_err());
    }

    #[test]
    fn test_entry_type_round_trip() {
        for t in [
            EntryType::Topup,
            EntryType::SubscriptionCharge,
            EntryType::UsageCharge,
            EntryType::Refund,
            EntryType::Adjustment,
            EntryType::InvoicePayment,
            EntryType::CogsAccrual,
        ] {
            assert_eq!(EntryType::parse(t.as_str()).unwrap(), t);
        }
    }

    #[test]
    fn test_reference_type_round_trip() {
        for t in [
            ReferenceType::StripeInvoice,
            ReferenceType::StripePaymentIntent,
            ReferenceType::UsageEvent,
            ReferenceType::Manual,
        ] {
            assert_eq!(ReferenceType::parse(t.as_str()).unwrap(), t);
        }
    }
}
