// Usage Ingestion - Batched, Idempotent Event Intake
// Envelope validation, schema checks, team/bill-to resolution, duplicate counting

use std::sync::Arc;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::core::{is_unique_violation, BillingError, BillingResult, FieldIssue};
use crate::pricing::PricingService;
use crate::schema::SchemaRegistry;
use crate::teams;

pub const MAX_BATCH_SIZE: usize = 1000;

static EVENT_TYPE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z][a-z0-9]*(\.[a-z][a-z0-9]*)*\.v\d+$").expect("event type regex")
});

/// One event as submitted by a tenant.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    #[serde(default)]
    pub idempotency_key: String,
    #[serde(default)]
    pub event_type: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub team_id: Option<Uuid>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default = "empty_object")]
    pub payload: Value,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

/// One persisted usage event, the pricing engine's input.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageEvent {
    pub id: Uuid,
    pub app_id: Uuid,
    pub team_id: Uuid,
    pub bill_to_id: Uuid,
    pub user_id: Option<Uuid>,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub idempotency_key: String,
    pub payload: Value,
    pub source: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct IngestReport {
    pub accepted: u32,
    pub duplicates: u32,
}

/// Envelope validation: every structural failure for one event, collected.
pub fn validate_envelope(envelope: &EventEnvelope) -> Vec<FieldIssue> {
    let mut issues = Vec::new();

    if envelope.idempotency_key.is_empty() || envelope.idempotency_key.len() > 255 {
        issues.push(FieldIssue::new(
            "idempotencyKey",
            "must be 1-255 characters",
        ));
    }
    if !EVENT_TYPE_RE.is_match(&envelope.event_type) {
        issues.push(FieldIssue::new(
            "eventType",
            "must match pattern name.segments.vN (e.g. llm.tokens.v1)",
        ));
    }
    if parse_timestamp(&envelope.timestamp).is_none() {
        issues.push(FieldIssue::new("timestamp", "must be an ISO-8601 instant"));
    }
    if envelope.source.is_empty() {
        issues.push(FieldIssue::new("source", "must not be empty"));
    }
    if !envelope.payload.is_object() {
        issues.push(FieldIssue::new("payload", "must be a JSON object"));
    }

    issues
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

// Ingestion over Postgres; prices accepted events synchronously
pub struct IngestionService {
    db_pool: PgPool,
    registry: Arc<SchemaRegistry>,
    pricing: Arc<PricingService>,
}

impl IngestionService {
    pub fn new(
        db_pool: PgPool,
        registry: Arc<SchemaRegistry>,
        pricing: Arc<PricingService>,
    ) -> Self {
        Self {
            db_pool,
            registry,
            pricing,
        }
    }

    /// Ingest a batch of 1..=1000 events. Processing is best-effort linear:
    /// events already accepted stay accepted if a later one fails. The unique
    /// `(app_id, idempotency_key)` index turns resubmissions into duplicates,
    /// never errors.
    pub async fn ingest_batch(
        &self,
        app_id: Uuid,
        batch: Vec<EventEnvelope>,
    ) -> BillingResult<IngestReport> {
        if batch.is_empty() {
            return Err(BillingError::Validation(vec![FieldIssue::new(
                "events",
                "batch must contain at least one event",
            )]));
        }
        if batch.len() > MAX_BATCH_SIZE {
            return Err(BillingError::BatchTooLarge(batch.len()));
        }

        let mut report = IngestReport::default();

        for envelope in batch {
            match self.ingest_one(app_id, envelope).await? {
                IngestOutcome::Accepted => report.accepted += 1,
                IngestOutcome::Duplicate => report.duplicates += 1,
            }
        }

        tracing::info!(
            %app_id,
            accepted = report.accepted,
            duplicates = report.duplicates,
            "📥 Ingested usage batch"
        );

        Ok(report)
    }

    async fn ingest_one(
        &self,
        app_id: Uuid,
        envelope: EventEnvelope,
    ) -> BillingResult<IngestOutcome> {
        let issues = validate_envelope(&envelope);
        if !issues.is_empty() {
            return Err(BillingError::Validation(issues));
        }
        if envelope.team_id.is_none() && envelope.user_id.is_none() {
            return Err(BillingError::MissingTeamAndUser);
        }

        self.registry
            .validate_payload(&envelope.event_type, &envelope.payload)?;

        let (team_id, resolved_user_id) = self.resolve_team(app_id, &envelope).await?;
        let bill_to_id = teams::billing_entity_for_team(&self.db_pool, team_id).await?;

        // validated above
        let timestamp = parse_timestamp(&envelope.timestamp)
            .ok_or_else(|| BillingError::Internal("timestamp revalidation failed".to_string()))?;

        let event = UsageEvent {
            id: Uuid::new_v4(),
            app_id,
            team_id,
            bill_to_id,
            user_id: resolved_user_id,
            event_type: envelope.event_type,
            timestamp,
            idempotency_key: envelope.idempotency_key,
            payload: envelope.payload,
            source: envelope.source,
        };

        let inserted = sqlx::query(
            r#"
            INSERT INTO usage_events
                (id, app_id, team_id, bill_to_id, user_id, event_type, timestamp,
                 idempotency_key, payload, source)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(event.id)
        .bind(event.app_id)
        .bind(event.team_id)
        .bind(event.bill_to_id)
        .bind(event.user_id)
        .bind(&event.event_type)
        .bind(event.timestamp)
        .bind(&event.idempotency_key)
        .bind(&event.payload)
        .bind(&event.source)
        .execute(&self.db_pool)
        .await;

        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => return Ok(IngestOutcome::Duplicate),
            Err(e) => return Err(e.into()),
        }

        self.pricing.price_event(&event).await?;

        Ok(IngestOutcome::Accepted)
    }

    /// Resolve the billing team: an explicit teamId wins; otherwise the
    /// event's userId must name a user whose unique personal team we bill.
    async fn resolve_team(
        &self,
        app_id: Uuid,
        envelope: &EventEnvelope,
    ) -> BillingResult<(Uuid, Option<Uuid>)> {
        use sqlx::Row;

        if let Some(team_id) = envelope.team_id {
            let team = teams::load_team(&self.db_pool, team_id).await?;
            if team.app_id != app_id {
                return Err(BillingError::TeamNotFound(team_id));
            }
            return Ok((team_id, None));
        }

        let external_ref = envelope
            .user_id
            .as_deref()
            .ok_or(BillingError::MissingTeamAndUser)?;

        let user_row = sqlx::query("SELECT id FROM users WHERE app_id = $1 AND external_ref = $2")
            .bind(app_id)
            .bind(external_ref)
            .fetch_optional(&self.db_pool)
            .await?
            .ok_or_else(|| BillingError::UserNotFound(external_ref.to_string()))?;
        let user_id: Uuid = user_row.try_get("id")?;

        let team_row = sqlx::query(
            "SELECT id FROM teams WHERE app_id = $1 AND owner_user_id = $2 AND kind = 'PERSONAL'",
        )
        .bind(app_id)
        .bind(user_id)
        .fetch_optional(&self.db_pool)
        .await?
        .ok_or_else(|| BillingError::PersonalTeamNotFound(external_ref.to_string()))?;

        Ok((team_row.try_get("id")?, Some(user_id)))
    }
}

enum IngestOutcome {
    Accepted,
    Duplicate,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid_envelope() -> EventEnvelope {
        EventEnvelope {
            idempotency_key: "evt-1".to_string(),
            event_type: "llm.tokens.v1".to_string(),
            timestamp: "2026-03-01T12:00:00Z".to_string(),
            source: "api".to_string(),
            team_id: Some(Uuid::new_v4()),
            user_id: None,
            payload: json!({"inputTokens": 10}),
        }
    }

    #[test]
    fn test_valid_envelope_has_no_issues() {
        assert!(validate_envelope(&valid_envelope()).is_empty());
    }

    #[test]
    fn test_event_type_pattern() {
        for ok in ["llm.tokens.v1", "storage.sample.v12", "a.v1", "a0.b9.c.v2"] {
            assert!(EVENT_TYPE_RE.is_match(ok), "{ok} should match");
        }
        for bad in [
            "llm.tokens",
            "Llm.tokens.v1",
            "llm..tokens.v1",
            "llm.tokens.v",
            "llm.tokens.V1",
            "9llm.tokens.v1",
            "",
        ] {
            assert!(!EVENT_TYPE_RE.is_match(bad), "{bad} should not match");
        }
    }

    #[test]
    fn test_envelope_issue_collection() {
        let envelope = EventEnvelope {
            idempotency_key: String::new(),
            event_type: "Bad Type".to_string(),
            timestamp: "yesterday".to_string(),
            source: String::new(),
            team_id: None,
            user_id: Some("u1".to_string()),
            payload: json!([1, 2, 3]),
        };
        let issues = validate_envelope(&envelope);
        let fields: Vec<&str> = issues.iter().map(|i| i.field.as_str()).collect();
        assert_eq!(
            fields,
            vec!["idempotencyKey", "eventType", "timestamp", "source", "payload"]
        );
    }

    #[test]
    fn test_timestamp_parsing() {
        assert!(parse_timestamp("2026-03-01T12:00:00Z").is_some());
        assert!(parse_timestamp("2026-03-01T12:00:00+02:00").is_some());
        assert!(parse_timestamp("2026-03-01").is_none());
        assert!(parse_timestamp("not a time").is_none());
    }

    #[test]
    fn test_envelope_deserializes_from_wire_shape() {
        let envelope: EventEnvelope = serde_json::from_value(json!({
            "idempotencyKey": "evt-9",
            "eventType": "storage.sample.v1",
            "timestamp": "2026-03-01T00:00:00Z",
            "source": "agent",
            "payload": {"bytesUsed": 1024},
        }))
        .unwrap();
        assert_eq!(envelope.idempotency_key, "evt-9");
        assert!(envelope.team_id.is_none());
        assert!(validate_envelope(&envelope).is_empty());
    }
}
