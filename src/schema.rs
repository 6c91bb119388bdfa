// Usage Event Schema Registry - Versioned Payload Shapes
// Process-local, seeded at startup, tolerant of unknown fields

use std::collections::HashMap;
use std::sync::RwLock;

use serde::Serialize;
use serde_json::Value;

use crate::core::{BillingError, BillingResult, FieldIssue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaStatus {
    Active,
    Deprecated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    NonNegativeInt,
    PositiveInt,
}

#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
}

impl FieldSpec {
    const fn required(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            required: true,
        }
    }

    const fn optional(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            required: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchemaEntry {
    pub event_type: String,
    pub version: u32,
    pub status: SchemaStatus,
    pub description: String,
    pub fields: Vec<FieldSpec>,
}

// Registry of event-type payload schemas. Validation is a tolerant reader:
// unknown payload fields pass untouched.
pub struct SchemaRegistry {
    schemas: RwLock<HashMap<String, SchemaEntry>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self {
            schemas: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_builtin_schemas() -> Self {
        let registry = Self::new();
        for entry in builtin_schemas() {
            registry.register(entry);
        }
        registry
    }

    /// Extension point. Replaces any existing entry for the same event type.
    pub fn register(&self, entry: SchemaEntry) {
        self.schemas
            .write()
            .expect("schema registry lock poisoned")
            .insert(entry.event_type.clone(), entry);
    }

    pub fn contains(&self, event_type: &str) -> bool {
        self.schemas
            .read()
            .expect("schema registry lock poisoned")
            .contains_key(event_type)
    }

    /// Validate a payload against the registered shape. Unknown event types
    /// and field-level failures map to the 400-class errors of the ingest
    /// surface.
    pub fn validate_payload(&self, event_type: &str, payload: &Value) -> BillingResult<()> {
        let schemas = self.schemas.read().expect("schema registry lock poisoned");
        let entry = schemas
            .get(event_type)
            .ok_or_else(|| BillingError::UnknownEventType(event_type.to_string()))?;

        let mut errors = Vec::new();

        let Some(object) = payload.as_object() else {
            return Err(BillingError::PayloadSchema {
                event_type: event_type.to_string(),
                errors: vec![FieldIssue::new("payload", "must be a JSON object")],
            });
        };

        for field in &entry.fields {
            match object.get(field.name) {
                None => {
                    if field.required {
                        errors.push(FieldIssue::new(field.name, "is required"));
                    }
                }
                Some(value) => check_field(field, value, &mut errors),
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(BillingError::PayloadSchema {
                event_type: event_type.to_string(),
                errors,
            })
        }
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::with_builtin_schemas()
    }
}

fn check_field(field: &FieldSpec, value: &Value, errors: &mut Vec<FieldIssue>) {
    match field.kind {
        FieldKind::Text => {
            if !value.is_string() {
                errors.push(FieldIssue::new(field.name, "must be a string"));
            }
        }
        FieldKind::NonNegativeInt => match value.as_i64() {
            Some(n) if n >= 0 => {}
            _ => errors.push(FieldIssue::new(field.name, "must be a non-negative integer")),
        },
        FieldKind::PositiveInt => match value.as_i64() {
            Some(n) if n > 0 => {}
            _ => errors.push(FieldIssue::new(field.name, "must be a positive integer")),
        },
    }
}

fn builtin_schemas() -> Vec<SchemaEntry> {
    use FieldKind::{NonNegativeInt, PositiveInt, Text};

    vec![
        SchemaEntry {
            event_type: "llm.tokens.v1".to_string(),
            version: 1,
            status: SchemaStatus::Active,
            description: "LLM token consumption sample".to_string(),
            fields: vec![
                FieldSpec::required("provider", Text),
                FieldSpec::required("model", Text),
                FieldSpec::required("inputTokens", NonNegativeInt),
                FieldSpec::required("outputTokens", NonNegativeInt),
                FieldSpec::optional("cachedTokens", NonNegativeInt),
            ],
        },
        SchemaEntry {
            event_type: "llm.image.v1".to_string(),
            version: 1,
            status: SchemaStatus::Active,
            description: "LLM image generation sample".to_string(),
            fields: vec![
                FieldSpec::required("provider", Text),
                FieldSpec::required("model", Text),
                FieldSpec::required("width", PositiveInt),
                FieldSpec::required("height", PositiveInt),
                FieldSpec::required("count", PositiveInt),
            ],
        },
        SchemaEntry {
            event_type: "storage.sample.v1".to_string(),
            version: 1,
            status: SchemaStatus::Active,
            description: "Storage occupancy sample".to_string(),
            fields: vec![FieldSpec::required("bytesUsed", NonNegativeInt)],
        },
        SchemaEntry {
            event_type: "bandwidth.sample.v1".to_string(),
            version: 1,
            status: SchemaStatus::Active,
            description: "Bandwidth transfer sample".to_string(),
            fields: vec![
                FieldSpec::required("bytesIn", NonNegativeInt),
                FieldSpec::required("bytesOut", NonNegativeInt),
                FieldSpec::optional("bytesOutInternal", NonNegativeInt),
            ],
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builtin_schemas_seeded() {
        let registry = SchemaRegistry::with_builtin_schemas();
        for event_type in [
            "llm.tokens.v1",
            "llm.image.v1",
            "storage.sample.v1",
            "bandwidth.sample.v1",
        ] {
            assert!(registry.contains(event_type), "{event_type} missing");
        }
    }

    #[test]
    fn test_valid_payload_passes() {
        let registry = SchemaRegistry::with_builtin_schemas();
        let payload = json!({
            "provider": "anthropic",
            "model": "large",
            "inputTokens": 1200,
            "outputTokens": 450,
        });
        assert!(registry.validate_payload("llm.tokens.v1", &payload).is_ok());
    }

    #[test]
    fn test_unknown_fields_are_tolerated() {
        let registry = SchemaRegistry::with_builtin_schemas();
        let payload = json!({
            "bytesUsed": 0,
            "region": "eu-west-1",
            "shard": 7,
        });
        assert!(registry
            .validate_payload("storage.sample.v1", &payload)
            .is_ok());
    }

    #[test]
    fn test_unknown_event_type_rejected() {
        let registry = SchemaRegistry::with_builtin_schemas();
        let err = registry
            .validate_payload("gpu.sample.v1", &json!({}))
            .unwrap_err();
        assert!(matches!(err, BillingError::UnknownEventType(t) if t == "gpu.sample.v1"));
    }

    #[test]
    fn test_field_errors_are_collected() {
        let registry = SchemaRegistry::with_builtin_schemas();
        let payload = json!({
            "provider": "anthropic",
            "inputTokens": -3,
            "outputTokens": "many",
        });
        let err = registry
            .validate_payload("llm.tokens.v1", &payload)
            .unwrap_err();

        let BillingError::PayloadSchema { event_type, errors } = err else {
            panic!("expected PayloadSchema");
        };
        assert_eq!(event_type, "llm.tokens.v1");
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["model", "inputTokens", "outputTokens"]);
    }

    #[test]
    fn test_positive_int_rejects_zero() {
        let registry = SchemaRegistry::with_builtin_schemas();
        let payload = json!({
            "provider": "p", "model": "m", "width": 0, "height": 512, "count": 1,
        });
        let err = registry.validate_payload("llm.image.v1", &payload).unwrap_err();
        let BillingError::PayloadSchema { errors, .. } = err else {
            panic!("expected PayloadSchema");
        };
        assert_eq!(errors[0].field, "width");
    }

    #[test]
    fn test_optional_field_validated_when_present() {
        let registry = SchemaRegistry::with_builtin_schemas();
        let payload = json!({
            "bytesIn": 10, "bytesOut": 20, "bytesOutInternal": -1,
        });
        let err = registry
            .validate_payload("bandwidth.sample.v1", &payload)
            .unwrap_err();
        let BillingError::PayloadSchema { errors, .. } = err else {
            panic!("expected PayloadSchema");
        };
        assert_eq!(errors[0].field, "bytesOutInternal");
    }

    #[test]
    fn test_register_extension_point() {
        let registry = SchemaRegistry::with_builtin_schemas();
        registry.register(SchemaEntry {
            event_type: "gpu.sample.v1".to_string(),
            version: 1,
            status: SchemaStatus::Active,
            description: "GPU seconds".to_string(),
            fields: vec![FieldSpec::required("gpuSeconds", FieldKind::NonNegativeInt)],
        });
        assert!(registry
            .validate_payload("gpu.sample.v1", &json!({"gpuSeconds": 3}))
            .is_ok());
    }
}
