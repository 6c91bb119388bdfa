// Pricing Engine - Rule Matching and Tier Arithmetic Over Versioned Price Books
// Each usage event prices into exactly two line items: COGS and CUSTOMER

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::core::{BillingError, BillingResult};
use crate::ingest::UsageEvent;
use crate::teams::BillingMode;
use crate::wallet::WalletService;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookKind {
    Cogs,
    Customer,
}

impl BookKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cogs => "COGS",
            Self::Customer => "CUSTOMER",
        }
    }

    pub fn parse(s: &str) -> BillingResult<Self> {
        match s {
            "COGS" => Ok(Self::Cogs),
            "CUSTOMER" => Ok(Self::Customer),
            other => Err(BillingError::Internal(format!("invalid book kind: {other}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PriceBook {
    pub id: Uuid,
    pub app_id: Uuid,
    pub kind: BookKind,
    pub version: i32,
    pub currency: String,
    pub effective_from: DateTime<Utc>,
    pub effective_to: Option<DateTime<Utc>>,
}

/// A pricing rule body, validated out of its JSON column before evaluation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleSpec {
    Flat {
        amount: f64,
    },
    PerUnit {
        field: String,
        #[serde(rename = "unitPrice")]
        unit_price: f64,
    },
    Tiered {
        field: String,
        tiers: Vec<Tier>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tier {
    #[serde(rename = "upTo")]
    pub up_to: Option<i64>,
    #[serde(rename = "unitPrice")]
    pub unit_price: f64,
}

#[derive(Debug, Clone)]
pub struct PriceRule {
    pub id: Uuid,
    pub price_book_id: Uuid,
    pub priority: i32,
    pub match_conditions: Value,
    pub rule: RuleSpec,
}

/// Outcome of evaluating one rule against one payload.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub amount_minor: i64,
    pub snapshot: Value,
}

/// A persisted billable line item, as read back by the wallet debiter.
#[derive(Debug, Clone)]
pub struct LineItemRecord {
    pub id: Uuid,
    pub usage_event_id: Uuid,
    pub app_id: Uuid,
    pub team_id: Uuid,
    pub bill_to_id: Uuid,
    pub book_kind: BookKind,
    pub event_type: String,
    pub amount_minor: i64,
    pub currency: String,
    pub wallet_debited_at: Option<DateTime<Utc>>,
}

impl LineItemRecord {
    pub fn from_row(row: &sqlx::postgres::PgRow) -> BillingResult<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            usage_event_id: row.try_get("usage_event_id")?,
            app_id: row.try_get("app_id")?,
            team_id: row.try_get("team_id")?,
            bill_to_id: row.try_get("bill_to_id")?,
            book_kind: BookKind::parse(row.try_get::<String, _>("book_kind")?.as_str())?,
            event_type: row.try_get("event_type")?,
            amount_minor: row.try_get("amount_minor")?,
            currency: row.try_get("currency")?,
            wallet_debited_at: row.try_get("wallet_debited_at")?,
        })
    }
}

/// Render a JSON scalar the way the match language compares it: string values
/// verbatim, everything else via its JSON rendering.
fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// A rule matches when every key of its match map is satisfied: `eventType`
/// compares against the event's type, any other key against the stringified
/// payload field. `*` matches anything.
pub fn rule_matches(conditions: &Value, event_type: &str, payload: &Value) -> bool {
    let Some(map) = conditions.as_object() else {
        return false;
    };

    for (key, expected) in map {
        let expected = scalar_to_string(expected);
        if expected == "*" {
            continue;
        }

        let actual = if key == "eventType" {
            event_type.to_string()
        } else {
            match payload.get(key) {
                Some(v) => scalar_to_string(v),
                None => return false,
            }
        };

        if actual != expected {
            return false;
        }
    }

    true
}

/// Coerce a payload field to a finite quantity, the way the rule language
/// reads numbers (numeric strings included).
fn numeric_field(payload: &Value, field: &str) -> BillingResult<f64> {
    let value = payload.get(field).ok_or_else(|| {
        BillingError::InvalidRule(format!("payload field '{field}' is missing"))
    })?;

    let quantity = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };

    match quantity {
        Some(q) if q.is_finite() => Ok(q),
        _ => Err(BillingError::InvalidRule(format!(
            "payload field '{field}' is not a finite number"
        ))),
    }
}

/// Evaluate one rule against one payload, producing the minor amount and the
/// audit snapshot fragment that makes the computation reproducible.
pub fn evaluate_rule(rule: &RuleSpec, payload: &Value) -> BillingResult<Evaluation> {
    match rule {
        RuleSpec::Flat { amount } => {
            let amount_minor = amount.round() as i64;
            Ok(Evaluation {
                amount_minor,
                snapshot: json!({
                    "ruleType": "flat",
                    "computedAmount": amount_minor,
                    "payload": payload,
                }),
            })
        }

        RuleSpec::PerUnit { field, unit_price } => {
            let quantity = numeric_field(payload, field)?;
            let amount_minor = (quantity * unit_price).round() as i64;
            Ok(Evaluation {
                amount_minor,
                snapshot: json!({
                    "ruleType": "per_unit",
                    "field": field,
                    "quantity": quantity,
                    "unitPrice": unit_price,
                    "computedAmount": amount_minor,
                    "payload": payload,
                }),
            })
        }

        RuleSpec::Tiered { field, tiers } => {
            if tiers.is_empty() {
                return Err(BillingError::InvalidRule(
                    "tiered rule has no tiers".to_string(),
                ));
            }

            let quantity = numeric_field(payload, field)?;
            let mut remaining = quantity.max(0.0);
            let mut prev_up_to: f64 = 0.0;
            let mut amount_minor: i64 = 0;
            let mut breakdown = Vec::with_capacity(tiers.len());

            // Graduated walk: each tier charges the quantity falling inside
            // its band, rounded per tier.
            for tier in tiers {
                if remaining <= 0.0 {
                    break;
                }
                let capacity = match tier.up_to {
                    Some(up_to) => (up_to as f64 - prev_up_to).max(0.0),
                    None => remaining,
                };
                let take = remaining.min(capacity);
                let subtotal = (take * tier.unit_price).round() as i64;

                amount_minor += subtotal;
                remaining -= take;
                if let Some(up_to) = tier.up_to {
                    prev_up_to = up_to as f64;
                }

                breakdown.push(json!({
                    "upTo": tier.up_to,
                    "unitPrice": tier.unit_price,
                    "quantity": take,
                    "subtotal": subtotal,
                }));
            }

            Ok(Evaluation {
                amount_minor,
                snapshot: json!({
                    "ruleType": "tiered",
                    "field": field,
                    "quantity": quantity,
                    "tiers": breakdown,
                    "computedAmount": amount_minor,
                    "payload": payload,
                }),
            })
        }
    }
}

// Pricing service: book selection, rule matching, line-item persistence
pub struct PricingService {
    db_pool: PgPool,
    wallet: Arc<WalletService>,
}

impl PricingService {
    pub fn new(db_pool: PgPool, wallet: Arc<WalletService>) -> Self {
        Self { db_pool, wallet }
    }

    /// Price one persisted usage event into its COGS and CUSTOMER line items,
    /// persisted atomically. Wallet-mode teams are debited immediately for the
    /// CUSTOMER side.
    pub async fn price_event(&self, event: &UsageEvent) -> BillingResult<(Uuid, Uuid)> {
        let cogs = self.evaluate_for_kind(event, BookKind::Cogs).await?;
        let customer = self.evaluate_for_kind(event, BookKind::Customer).await?;

        let cogs_id = Uuid::new_v4();
        let customer_id = Uuid::new_v4();

        let mut tx = self.db_pool.begin().await?;
        for (line_id, priced) in [(cogs_id, &cogs), (customer_id, &customer)] {
            sqlx::query(
                r#"
                INSERT INTO billable_line_items
                    (id, usage_event_id, app_id, team_id, bill_to_id, price_book_id,
                     price_rule_id, book_kind, event_type, event_timestamp,
                     amount_minor, currency, inputs_snapshot)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                "#,
            )
            .bind(line_id)
            .bind(event.id)
            .bind(event.app_id)
            .bind(event.team_id)
            .bind(event.bill_to_id)
            .bind(priced.book.id)
            .bind(priced.rule_id)
            .bind(priced.book.kind.as_str())
            .bind(&event.event_type)
            .bind(event.timestamp)
            .bind(priced.evaluation.amount_minor)
            .bind(&priced.book.currency)
            .bind(&priced.evaluation.snapshot)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        tracing::debug!(
            event_id = %event.id,
            cogs_minor = cogs.evaluation.amount_minor,
            customer_minor = customer.evaluation.amount_minor,
            "💱 Priced usage event"
        );

        if self.team_billing_mode(event.team_id).await? == BillingMode::Wallet {
            self.wallet.debit_immediate(customer_id).await?;
        }

        Ok((cogs_id, customer_id))
    }

    async fn evaluate_for_kind(
        &self,
        event: &UsageEvent,
        kind: BookKind,
    ) -> BillingResult<PricedLine> {
        let book = self
            .select_book(event.app_id, kind, event.timestamp)
            .await?
            .ok_or_else(|| BillingError::NoPriceBookFound {
                app_id: event.app_id,
                kind: kind.as_str().to_string(),
            })?;

        let rules = self.load_rules(book.id).await?;
        let matched = rules
            .iter()
            .find(|r| rule_matches(&r.match_conditions, &event.event_type, &event.payload))
            .ok_or_else(|| BillingError::NoMatchingRule {
                app_id: event.app_id,
                event_type: event.event_type.clone(),
            })?;

        let evaluation = evaluate_rule(&matched.rule, &event.payload)?;

        Ok(PricedLine {
            rule_id: matched.id,
            book,
            evaluation,
        })
    }

    /// Highest-version book whose `[effective_from, effective_to)` window
    /// contains the timestamp. A book expiring exactly at `ts` is excluded.
    pub async fn select_book(
        &self,
        app_id: Uuid,
        kind: BookKind,
        ts: DateTime<Utc>,
    ) -> BillingResult<Option<PriceBook>> {
        let row = sqlx::query(
            r#"
            SELECT id, app_id, kind, version, currency, effective_from, effective_to
            FROM price_books
            WHERE app_id = $1 AND kind = $2
              AND effective_from <= $3
              AND (effective_to IS NULL OR effective_to > $3)
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .bind(app_id)
        .bind(kind.as_str())
        .bind(ts)
        .fetch_optional(&self.db_pool)
        .await?;

        row.map(|row| {
            Ok(PriceBook {
                id: row.try_get("id")?,
                app_id: row.try_get("app_id")?,
                kind: BookKind::parse(row.try_get::<String, _>("kind")?.as_str())?,
                version: row.try_get("version")?,
                currency: row.try_get("currency")?,
                effective_from: row.try_get("effective_from")?,
                effective_to: row.try_get("effective_to")?,
            })
        })
        .transpose()
    }

    async fn load_rules(&self, price_book_id: Uuid) -> BillingResult<Vec<PriceRule>> {
        let rows = sqlx::query(
            r#"
            SELECT id, price_book_id, priority, match_conditions, rule
            FROM price_rules
            WHERE price_book_id = $1
            ORDER BY priority DESC
            "#,
        )
        .bind(price_book_id)
        .fetch_all(&self.db_pool)
        .await?;

        let mut rules = Vec::with_capacity(rows.len());
        for row in rows {
            let raw: Value = row.try_get("rule")?;
            let rule: RuleSpec = serde_json::from_value(raw)
                .map_err(|e| BillingError::InvalidRule(format!("unparseable rule body: {e}")))?;
            rules.push(PriceRule {
                id: row.try_get("id")?,
                price_book_id: row.try_get("price_book_id")?,
                priority: row.try_get("priority")?,
                match_conditions: row.try_get("match_conditions")?,
                rule,
            });
        }
        Ok(rules)
    }

    async fn team_billing_mode(&self, team_id: Uuid) -> BillingResult<BillingMode> {
        let row = sqlx::query("SELECT billing_mode FROM teams WHERE id = $1")
            .bind(team_id)
            .fetch_optional(&self.db_pool)
            .await?
            .ok_or(BillingError::TeamNotFound(team_id))?;
        BillingMode::parse(row.try_get::<String, _>("billing_mode")?.as_str())
    }
}

struct PricedLine {
    rule_id: Uuid,
    book: PriceBook,
    evaluation: Evaluation,
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    fn tiered_tokens_rule() -> RuleSpec {
        RuleSpec::Tiered {
            field: "inputTokens".to_string(),
            tiers: vec![
                Tier { up_to: Some(1000), unit_price: 0.01 },
                Tier { up_to: Some(5000), unit_price: 0.005 },
                Tier { up_to: None, unit_price: 0.002 },
            ],
        }
    }

    #[test]
    fn test_tiered_graduated_walk() {
        // 1000 at 0.01 + 2000 at 0.005 = 10 + 10
        let eval = evaluate_rule(&tiered_tokens_rule(), &json!({"inputTokens": 3000})).unwrap();
        assert_eq!(eval.amount_minor, 20);
    }

    #[test]
    fn test_tiered_exhausts_all_bands() {
        // 1000*0.01 + 4000*0.005 + 5000*0.002 = 10 + 20 + 10
        let eval = evaluate_rule(&tiered_tokens_rule(), &json!({"inputTokens": 10_000})).unwrap();
        assert_eq!(eval.amount_minor, 40);
    }

    #[test]
    fn test_tiered_boundary_equals_sum_of_capacities() {
        let rule = RuleSpec::Tiered {
            field: "n".to_string(),
            tiers: vec![
                Tier { up_to: Some(10), unit_price: 2.0 },
                Tier { up_to: Some(30), unit_price: 1.0 },
            ],
        };
        // exactly 10*2 + 20*1
        let eval = evaluate_rule(&rule, &json!({"n": 30})).unwrap();
        assert_eq!(eval.amount_minor, 40);
    }

    #[test]
    fn test_tiered_rounds_per_tier() {
        let rule = RuleSpec::Tiered {
            field: "n".to_string(),
            tiers: vec![
                Tier { up_to: Some(3), unit_price: 0.5 },
                Tier { up_to: None, unit_price: 0.5 },
            ],
        };
        // 3*0.5 rounds to 2 and 1*0.5 rounds to 1: per-tier rounding, not 4*0.5
        let eval = evaluate_rule(&rule, &json!({"n": 4})).unwrap();
        assert_eq!(eval.amount_minor, 3);
    }

    #[test]
    fn test_tiered_snapshot_breakdown() {
        let eval = evaluate_rule(&tiered_tokens_rule(), &json!({"inputTokens": 3000})).unwrap();
        let tiers = eval.snapshot["tiers"].as_array().unwrap();
        assert_eq!(tiers.len(), 2);
        assert_eq!(tiers[0]["quantity"], json!(1000.0));
        assert_eq!(tiers[0]["subtotal"], json!(10));
        assert_eq!(tiers[1]["quantity"], json!(2000.0));
        assert_eq!(eval.snapshot["computedAmount"], json!(20));
    }

    #[test]
    fn test_per_unit_pricing() {
        let rule = RuleSpec::PerUnit {
            field: "bytesUsed".to_string(),
            unit_price: 0.25,
        };
        let eval = evaluate_rule(&rule, &json!({"bytesUsed": 10})).unwrap();
        assert_eq!(eval.amount_minor, 3); // 2.5 rounds away from zero
        assert_eq!(eval.snapshot["ruleType"], json!("per_unit"));
        assert_eq!(eval.snapshot["quantity"], json!(10.0));
    }

    #[test]
    fn test_per_unit_accepts_numeric_strings() {
        let rule = RuleSpec::PerUnit {
            field: "count".to_string(),
            unit_price: 5.0,
        };
        let eval = evaluate_rule(&rule, &json!({"count": "4"})).unwrap();
        assert_eq!(eval.amount_minor, 20);
    }

    #[test]
    fn test_per_unit_missing_field_is_invalid_rule() {
        let rule = RuleSpec::PerUnit {
            field: "absent".to_string(),
            unit_price: 1.0,
        };
        let err = evaluate_rule(&rule, &json!({"other": 1})).unwrap_err();
        assert_matches!(err, BillingError::InvalidRule(_));
    }

    #[test]
    fn test_per_unit_non_numeric_field_is_invalid_rule() {
        let rule = RuleSpec::PerUnit {
            field: "count".to_string(),
            unit_price: 1.0,
        };
        let err = evaluate_rule(&rule, &json!({"count": {"nested": true}})).unwrap_err();
        assert_matches!(err, BillingError::InvalidRule(_));
    }

    #[test]
    fn test_flat_rounds() {
        let eval = evaluate_rule(&RuleSpec::Flat { amount: 99.6 }, &json!({})).unwrap();
        assert_eq!(eval.amount_minor, 100);
    }

    #[test]
    fn test_match_on_event_type_and_payload_field() {
        let conditions = json!({"eventType": "llm.tokens.v1", "model": "large"});
        assert!(rule_matches(
            &conditions,
            "llm.tokens.v1",
            &json!({"model": "large"})
        ));
        assert!(!rule_matches(
            &conditions,
            "llm.tokens.v1",
            &json!({"model": "small"})
        ));
        assert!(!rule_matches(
            &conditions,
            "llm.image.v1",
            &json!({"model": "large"})
        ));
    }

    #[test]
    fn test_match_wildcard() {
        let conditions = json!({"eventType": "*", "provider": "*"});
        assert!(rule_matches(
            &conditions,
            "anything.v1",
            &json!({"provider": "whatever"})
        ));
        // wildcard on a payload key does not require the key to exist
        assert!(rule_matches(&conditions, "anything.v1", &json!({})));
    }

    #[test]
    fn test_match_stringifies_payload_values() {
        let conditions = json!({"count": "3"});
        assert!(rule_matches(&conditions, "e.v1", &json!({"count": 3})));
        assert!(!rule_matches(&conditions, "e.v1", &json!({"count": 4})));
    }

    #[test]
    fn test_match_missing_payload_key_fails() {
        let conditions = json!({"model": "large"});
        assert!(!rule_matches(&conditions, "e.v1", &json!({})));
    }

    #[test]
    fn test_rule_spec_json_round_trip() {
        let parsed: RuleSpec = serde_json::from_value(json!({
            "type": "tiered",
            "field": "inputTokens",
            "tiers": [
                {"upTo": 1000, "unitPrice": 0.01},
                {"upTo": null, "unitPrice": 0.002},
            ],
        }))
        .unwrap();
        assert_eq!(
            parsed,
            RuleSpec::Tiered {
                field: "inputTokens".to_string(),
                tiers: vec![
                    Tier { up_to: Some(1000), unit_price: 0.01 },
                    Tier { up_to: None, unit_price: 0.002 },
                ],
            }
        );
    }
}
