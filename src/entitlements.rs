// Entitlement Resolver - Layered Override Cascade Per (App, Team)
// Bundle defaults under contract overrides, field by field; plans as fallback

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::core::{BillingError, BillingResult};
use crate::teams;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LimitType {
    None,
    Included,
    Unlimited,
    HardCap,
}

impl LimitType {
    pub fn parse(s: &str) -> BillingResult<Self> {
        match s {
            "NONE" => Ok(Self::None),
            "INCLUDED" => Ok(Self::Included),
            "UNLIMITED" => Ok(Self::Unlimited),
            "HARD_CAP" => Ok(Self::HardCap),
            other => Err(BillingError::Internal(format!("invalid limit type: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Enforcement {
    None,
    Soft,
    Hard,
}

impl Enforcement {
    pub fn parse(s: &str) -> BillingResult<Self> {
        match s {
            "NONE" => Ok(Self::None),
            "SOFT" => Ok(Self::Soft),
            "HARD" => Ok(Self::Hard),
            other => Err(BillingError::Internal(format!(
                "invalid enforcement: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OverageBilling {
    None,
    PerUnit,
    Tiered,
    Custom,
}

impl OverageBilling {
    pub fn parse(s: &str) -> BillingResult<Self> {
        match s {
            "NONE" => Ok(Self::None),
            "PER_UNIT" => Ok(Self::PerUnit),
            "TIERED" => Ok(Self::Tiered),
            "CUSTOM" => Ok(Self::Custom),
            other => Err(BillingError::Internal(format!(
                "invalid overage billing: {other}"
            ))),
        }
    }
}

/// Effective policy for one meter key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeterPolicy {
    pub limit_type: LimitType,
    pub included_amount: Option<i64>,
    pub enforcement: Enforcement,
    pub overage_billing: OverageBilling,
}

impl Default for MeterPolicy {
    fn default() -> Self {
        Self {
            limit_type: LimitType::None,
            included_amount: None,
            enforcement: Enforcement::None,
            overage_billing: OverageBilling::None,
        }
    }
}

/// A contract override row: present fields replace, absent fields inherit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyOverride {
    pub limit_type: Option<LimitType>,
    pub included_amount: Option<i64>,
    pub enforcement: Option<Enforcement>,
    pub overage_billing: Option<OverageBilling>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedEntitlements {
    pub features: HashMap<String, bool>,
    pub meters: HashMap<String, MeterPolicy>,
    pub billing_mode: String,
    pub billable: bool,
    pub plan_code: Option<String>,
    pub plan_name: Option<String>,
}

impl ResolvedEntitlements {
    fn defaults(billing_mode: &str) -> Self {
        Self {
            features: HashMap::new(),
            meters: HashMap::new(),
            billing_mode: billing_mode.to_string(),
            billable: false,
            plan_code: None,
            plan_name: None,
        }
    }
}

/// Merge one meter key: the zero-policy default, then the bundle policy, then
/// each override field that is actually set.
pub fn merge_policy(bundle: Option<&MeterPolicy>, overlay: Option<&PolicyOverride>) -> MeterPolicy {
    let mut effective = bundle.copied().unwrap_or_default();

    if let Some(overlay) = overlay {
        if let Some(limit_type) = overlay.limit_type {
            effective.limit_type = limit_type;
        }
        if let Some(included) = overlay.included_amount {
            effective.included_amount = Some(included);
        }
        if let Some(enforcement) = overlay.enforcement {
            effective.enforcement = enforcement;
        }
        if let Some(overage) = overlay.overage_billing {
            effective.overage_billing = overage;
        }
    }

    effective
}

/// Cascade over the union of meter keys from both layers.
pub fn merge_meters(
    bundle: &HashMap<String, MeterPolicy>,
    overrides: &HashMap<String, PolicyOverride>,
) -> HashMap<String, MeterPolicy> {
    let mut keys: Vec<&String> = bundle.keys().chain(overrides.keys()).collect();
    keys.sort();
    keys.dedup();

    keys.into_iter()
        .map(|key| {
            (
                key.clone(),
                merge_policy(bundle.get(key), overrides.get(key)),
            )
        })
        .collect()
}

/// Feature flags: bundle defaults, then each override entry replaces.
pub fn merge_features(
    defaults: &HashMap<String, bool>,
    overrides: &[HashMap<String, bool>],
) -> HashMap<String, bool> {
    let mut features = defaults.clone();
    for layer in overrides {
        for (flag, enabled) in layer {
            features.insert(flag.clone(), *enabled);
        }
    }
    features
}

fn flags_from_json(value: &Value) -> HashMap<String, bool> {
    value
        .as_object()
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_bool().map(|b| (k.clone(), b)))
                .collect()
        })
        .unwrap_or_default()
}

// Entitlement resolution over Postgres
pub struct EntitlementService {
    db_pool: PgPool,
    refresh_calls: AtomicU64,
}

impl EntitlementService {
    pub fn new(db_pool: PgPool) -> Self {
        Self {
            db_pool,
            refresh_calls: AtomicU64::new(0),
        }
    }

    pub async fn resolve(&self, app_id: Uuid, team_id: Uuid) -> BillingResult<ResolvedEntitlements> {
        let team = teams::load_team(&self.db_pool, team_id).await?;
        let bill_to_id = teams::billing_entity_for_team(&self.db_pool, team_id).await?;

        if let Some(contract) = self.active_contract(bill_to_id).await? {
            return self.resolve_enterprise(app_id, &team, &contract).await;
        }

        self.resolve_subscription(app_id, &team).await
    }

    async fn active_contract(&self, bill_to_id: Uuid) -> BillingResult<Option<ActiveContract>> {
        let row = sqlx::query(
            "SELECT id, bundle_id FROM contracts WHERE bill_to_id = $1 AND status = 'ACTIVE'",
        )
        .bind(bill_to_id)
        .fetch_optional(&self.db_pool)
        .await?;

        row.map(|row| {
            Ok(ActiveContract {
                id: row.try_get("id")?,
                bundle_id: row.try_get("bundle_id")?,
            })
        })
        .transpose()
    }

    async fn resolve_enterprise(
        &self,
        app_id: Uuid,
        team: &teams::Team,
        contract: &ActiveContract,
    ) -> BillingResult<ResolvedEntitlements> {
        let bundle_app = sqlx::query(
            "SELECT default_feature_flags FROM bundle_apps WHERE bundle_id = $1 AND app_id = $2",
        )
        .bind(contract.bundle_id)
        .bind(app_id)
        .fetch_optional(&self.db_pool)
        .await?;

        // the contract's bundle does not cover this app at all
        let Some(bundle_app) = bundle_app else {
            return Ok(ResolvedEntitlements::defaults(team.billing_mode.as_str()));
        };
        let default_flags = flags_from_json(&bundle_app.try_get::<Value, _>("default_feature_flags")?);

        let policy_rows = sqlx::query(
            r#"
            SELECT meter_key, limit_type, included_amount, enforcement, overage_billing
            FROM bundle_meter_policies
            WHERE bundle_id = $1 AND app_id = $2
            "#,
        )
        .bind(contract.bundle_id)
        .bind(app_id)
        .fetch_all(&self.db_pool)
        .await?;

        let mut bundle_policies = HashMap::new();
        for row in policy_rows {
            let key: String = row.try_get("meter_key")?;
            bundle_policies.insert(
                key,
                MeterPolicy {
                    limit_type: LimitType::parse(row.try_get::<String, _>("limit_type")?.as_str())?,
                    included_amount: row.try_get("included_amount")?,
                    enforcement: Enforcement::parse(
                        row.try_get::<String, _>("enforcement")?.as_str(),
                    )?,
                    overage_billing: OverageBilling::parse(
                        row.try_get::<String, _>("overage_billing")?.as_str(),
                    )?,
                },
            );
        }

        let override_rows = sqlx::query(
            r#"
            SELECT meter_key, limit_type, included_amount, enforcement, overage_billing,
                   feature_flags
            FROM contract_overrides
            WHERE contract_id = $1 AND app_id = $2
            ORDER BY meter_key
            "#,
        )
        .bind(contract.id)
        .bind(app_id)
        .fetch_all(&self.db_pool)
        .await?;

        let mut overrides = HashMap::new();
        let mut override_flag_layers = Vec::new();
        for row in override_rows {
            let key: String = row.try_get("meter_key")?;
            overrides.insert(
                key,
                PolicyOverride {
                    limit_type: row
                        .try_get::<Option<String>, _>("limit_type")?
                        .map(|s| LimitType::parse(&s))
                        .transpose()?,
                    included_amount: row.try_get("included_amount")?,
                    enforcement: row
                        .try_get::<Option<String>, _>("enforcement")?
                        .map(|s| Enforcement::parse(&s))
                        .transpose()?,
                    overage_billing: row
                        .try_get::<Option<String>, _>("overage_billing")?
                        .map(|s| OverageBilling::parse(&s))
                        .transpose()?,
                },
            );
            override_flag_layers.push(flags_from_json(&row.try_get::<Value, _>("feature_flags")?));
        }

        Ok(ResolvedEntitlements {
            features: merge_features(&default_flags, &override_flag_layers),
            meters: merge_meters(&bundle_policies, &overrides),
            billing_mode: "ENTERPRISE_CONTRACT".to_string(),
            billable: true,
            plan_code: None,
            plan_name: None,
        })
    }

    async fn resolve_subscription(
        &self,
        app_id: Uuid,
        team: &teams::Team,
    ) -> BillingResult<ResolvedEntitlements> {
        let row = sqlx::query(
            r#"
            SELECT p.code, p.name
            FROM team_subscriptions ts
            JOIN plans p ON p.id = ts.plan_id
            WHERE ts.team_id = $1 AND ts.status = 'ACTIVE' AND p.app_id = $2
            LIMIT 1
            "#,
        )
        .bind(team.id)
        .bind(app_id)
        .fetch_optional(&self.db_pool)
        .await?;

        let Some(row) = row else {
            return Ok(ResolvedEntitlements::defaults(team.billing_mode.as_str()));
        };

        Ok(ResolvedEntitlements {
            features: HashMap::new(),
            meters: HashMap::new(),
            billing_mode: team.billing_mode.as_str().to_string(),
            billable: true,
            plan_code: Some(row.try_get("code")?),
            plan_name: Some(row.try_get("name")?),
        })
    }

    /// Hook invoked after contract status changes and subscription webhooks.
    /// Recomputation is lazy in v1, so this only records the signal.
    pub fn refresh(&self, team_id: Uuid) {
        self.refresh_calls.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(%team_id, "🔁 Entitlement refresh requested");
    }

    pub fn refresh_count(&self) -> u64 {
        self.refresh_calls.load(Ordering::Relaxed)
    }
}

struct ActiveContract {
    id: Uuid,
    bundle_id: Uuid,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle_policy() -> MeterPolicy {
        MeterPolicy {
            limit_type: LimitType::Included,
            included_amount: Some(1_000_000),
            enforcement: Enforcement::Soft,
            overage_billing: OverageBilling::PerUnit,
        }
    }

    #[test]
    fn test_full_override_replaces_every_field() {
        let overlay = PolicyOverride {
            limit_type: Some(LimitType::HardCap),
            included_amount: Some(5_000_000),
            enforcement: Some(Enforcement::Hard),
            overage_billing: Some(OverageBilling::Tiered),
        };
        let merged = merge_policy(Some(&bundle_policy()), Some(&overlay));
        assert_eq!(
            merged,
            MeterPolicy {
                limit_type: LimitType::HardCap,
                included_amount: Some(5_000_000),
                enforcement: Enforcement::Hard,
                overage_billing: OverageBilling::Tiered,
            }
        );
    }

    #[test]
    fn test_partial_override_inherits_unset_fields() {
        let overlay = PolicyOverride {
            limit_type: Some(LimitType::Unlimited),
            ..Default::default()
        };
        let merged = merge_policy(Some(&bundle_policy()), Some(&overlay));
        assert_eq!(
            merged,
            MeterPolicy {
                limit_type: LimitType::Unlimited,
                included_amount: Some(1_000_000),
                enforcement: Enforcement::Soft,
                overage_billing: OverageBilling::PerUnit,
            }
        );
    }

    #[test]
    fn test_override_without_bundle_layers_on_zero_policy() {
        let overlay = PolicyOverride {
            limit_type: Some(LimitType::HardCap),
            included_amount: Some(100),
            ..Default::default()
        };
        let merged = merge_policy(None, Some(&overlay));
        assert_eq!(merged.limit_type, LimitType::HardCap);
        assert_eq!(merged.included_amount, Some(100));
        assert_eq!(merged.enforcement, Enforcement::None);
        assert_eq!(merged.overage_billing, OverageBilling::None);
    }

    #[test]
    fn test_merge_meters_unions_key_sets() {
        let mut bundle = HashMap::new();
        bundle.insert("llm.tokens.v1".to_string(), bundle_policy());

        let mut overrides = HashMap::new();
        overrides.insert(
            "llm.image.v1".to_string(),
            PolicyOverride {
                limit_type: Some(LimitType::HardCap),
                ..Default::default()
            },
        );

        let merged = merge_meters(&bundle, &overrides);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged["llm.tokens.v1"], bundle_policy());
        assert_eq!(merged["llm.image.v1"].limit_type, LimitType::HardCap);
    }

    #[test]
    fn test_merge_features_override_wins() {
        let mut defaults = HashMap::new();
        defaults.insert("sso".to_string(), false);
        defaults.insert("audit_log".to_string(), true);

        let mut layer = HashMap::new();
        layer.insert("sso".to_string(), true);
        layer.insert("priority_support".to_string(), true);

        let merged = merge_features(&defaults, &[layer]);
        assert_eq!(merged["sso"], true);
        assert_eq!(merged["audit_log"], true);
        assert_eq!(merged["priority_support"], true);
    }

    #[test]
    fn test_flags_from_json_ignores_non_bools() {
        let flags = flags_from_json(&serde_json::json!({
            "a": true, "b": false, "c": "yes", "d": 1,
        }));
        assert_eq!(flags.len(), 2);
        assert_eq!(flags["a"], true);
        assert_eq!(flags["b"], false);
    }

    #[test]
    fn test_default_policy_is_all_none() {
        let policy = MeterPolicy::default();
        assert_eq!(policy.limit_type, LimitType::None);
        assert_eq!(policy.included_amount, None);
        assert_eq!(policy.enforcement, Enforcement::None);
        assert_eq!(policy.overage_billing, OverageBilling::None);
    }
}
