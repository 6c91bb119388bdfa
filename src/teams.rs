// Team & User Provisioning - Billing Subjects and Their Monetary Recipients
// Idempotent creation keyed on tenant-supplied external references

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use uuid::Uuid;
use validator::Validate;

use crate::core::{is_unique_violation, validation_error, BillingError, BillingResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TeamKind {
    Personal,
    Standard,
}

impl TeamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Personal => "PERSONAL",
            Self::Standard => "STANDARD",
        }
    }

    pub fn parse(s: &str) -> BillingResult<Self> {
        match s {
            "PERSONAL" => Ok(Self::Personal),
            "STANDARD" => Ok(Self::Standard),
            other => Err(BillingError::Internal(format!("invalid team kind: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BillingMode {
    Subscription,
    Wallet,
    Hybrid,
}

impl BillingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Subscription => "SUBSCRIPTION",
            Self::Wallet => "WALLET",
            Self::Hybrid => "HYBRID",
        }
    }

    pub fn parse(s: &str) -> BillingResult<Self> {
        match s {
            "SUBSCRIPTION" => Ok(Self::Subscription),
            "WALLET" => Ok(Self::Wallet),
            "HYBRID" => Ok(Self::Hybrid),
            other => Err(BillingError::Internal(format!(
                "invalid billing mode: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemberRole {
    Owner,
    Admin,
    Member,
}

impl MemberRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Owner => "OWNER",
            Self::Admin => "ADMIN",
            Self::Member => "MEMBER",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Team {
    pub id: Uuid,
    pub app_id: Uuid,
    pub name: String,
    pub kind: TeamKind,
    pub owner_user_id: Option<Uuid>,
    pub billing_mode: BillingMode,
    pub default_currency: String,
    pub external_customer_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Team {
    pub fn from_row(row: &sqlx::postgres::PgRow) -> BillingResult<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            app_id: row.try_get("app_id")?,
            name: row.try_get("name")?,
            kind: TeamKind::parse(row.try_get::<String, _>("kind")?.as_str())?,
            owner_user_id: row.try_get("owner_user_id")?,
            billing_mode: BillingMode::parse(row.try_get::<String, _>("billing_mode")?.as_str())?,
            default_currency: row.try_get("default_currency")?,
            external_customer_id: row.try_get("external_customer_id")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

pub async fn load_team(pool: &PgPool, team_id: Uuid) -> BillingResult<Team> {
    let row = sqlx::query(
        r#"
        SELECT id, app_id, name, kind, owner_user_id, billing_mode,
               default_currency, external_customer_id, created_at
        FROM teams WHERE id = $1
        "#,
    )
    .bind(team_id)
    .fetch_optional(pool)
    .await?
    .ok_or(BillingError::TeamNotFound(team_id))?;

    Team::from_row(&row)
}

/// Every team bills through exactly one billing entity.
pub async fn billing_entity_for_team(pool: &PgPool, team_id: Uuid) -> BillingResult<Uuid> {
    let row = sqlx::query("SELECT id FROM billing_entities WHERE team_id = $1")
        .bind(team_id)
        .fetch_optional(pool)
        .await?
        .ok_or(BillingError::BillingEntityNotFound(team_id))?;
    Ok(row.try_get("id")?)
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateUserRequest {
    #[validate(length(min = 1, max = 255, message = "must be 1-255 characters"))]
    pub external_ref: String,
    #[validate(email(message = "must be a valid email address"))]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionedUser {
    pub user_id: Uuid,
    pub team_id: Uuid,
    pub bill_to_id: Uuid,
    pub created: bool,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateTeamRequest {
    #[validate(length(min = 1, max = 255, message = "must be 1-255 characters"))]
    pub name: String,
    pub billing_mode: Option<BillingMode>,
    #[validate(length(min = 3, max = 3, message = "must be a 3-letter currency code"))]
    pub default_currency: Option<String>,
    #[validate(length(min = 1, max = 255, message = "must be 1-255 characters"))]
    pub external_team_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionedTeam {
    pub team_id: Uuid,
    pub bill_to_id: Uuid,
    pub created: bool,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AddMemberRequest {
    #[validate(length(min = 1, max = 255, message = "must be 1-255 characters"))]
    pub external_ref: String,
    pub role: Option<MemberRole>,
}

// Provisioning over Postgres
pub struct ProvisioningService {
    db_pool: PgPool,
}

impl ProvisioningService {
    pub fn new(db_pool: PgPool) -> Self {
        Self { db_pool }
    }

    /// Create user + personal team + billing entity + owner membership in one
    /// transaction, idempotently on `(app_id, external_ref)`.
    pub async fn create_user(
        &self,
        app_id: Uuid,
        request: CreateUserRequest,
    ) -> BillingResult<ProvisionedUser> {
        request.validate().map_err(|e| validation_error(&e))?;

        if let Some(existing) = self.find_user(app_id, &request.external_ref).await? {
            return Ok(existing);
        }

        let user_id = Uuid::new_v4();
        let team_id = Uuid::new_v4();
        let bill_to_id = Uuid::new_v4();
        let team_name = request
            .email
            .clone()
            .unwrap_or_else(|| request.external_ref.clone());

        let mut tx = self.db_pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO users (id, app_id, external_ref, email) VALUES ($1, $2, $3, $4)",
        )
        .bind(user_id)
        .bind(app_id)
        .bind(&request.external_ref)
        .bind(&request.email)
        .execute(&mut *tx)
        .await;

        if let Err(e) = inserted {
            tx.rollback().await?;
            if is_unique_violation(&e) {
                // concurrent creator won; converge on their rows
                return self
                    .find_user(app_id, &request.external_ref)
                    .await?
                    .ok_or_else(|| BillingError::UserNotFound(request.external_ref.clone()));
            }
            return Err(e.into());
        }

        sqlx::query(
            r#"
            INSERT INTO teams (id, app_id, name, kind, owner_user_id, billing_mode)
            VALUES ($1, $2, $3, 'PERSONAL', $4, 'SUBSCRIPTION')
            "#,
        )
        .bind(team_id)
        .bind(app_id)
        .bind(&team_name)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO billing_entities (id, type, team_id) VALUES ($1, 'TEAM', $2)")
            .bind(bill_to_id)
            .bind(team_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "INSERT INTO team_members (team_id, user_id, role, status) VALUES ($1, $2, 'OWNER', 'ACTIVE')",
        )
        .bind(team_id)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(%app_id, %user_id, %team_id, "👤 Provisioned user with personal team");

        Ok(ProvisionedUser {
            user_id,
            team_id,
            bill_to_id,
            created: true,
        })
    }

    async fn find_user(
        &self,
        app_id: Uuid,
        external_ref: &str,
    ) -> BillingResult<Option<ProvisionedUser>> {
        let row = sqlx::query(
            r#"
            SELECT u.id AS user_id, t.id AS team_id, be.id AS bill_to_id
            FROM users u
            JOIN teams t ON t.owner_user_id = u.id AND t.kind = 'PERSONAL'
            JOIN billing_entities be ON be.team_id = t.id
            WHERE u.app_id = $1 AND u.external_ref = $2
            "#,
        )
        .bind(app_id)
        .bind(external_ref)
        .fetch_optional(&self.db_pool)
        .await?;

        row.map(|row| {
            Ok(ProvisionedUser {
                user_id: row.try_get("user_id")?,
                team_id: row.try_get("team_id")?,
                bill_to_id: row.try_get("bill_to_id")?,
                created: false,
            })
        })
        .transpose()
    }

    /// Create a standard team and its billing entity. With an
    /// `external_team_id`, the call is idempotent: the tenant's own team id
    /// maps to one billing team forever.
    pub async fn create_team(
        &self,
        app_id: Uuid,
        request: CreateTeamRequest,
    ) -> BillingResult<ProvisionedTeam> {
        request.validate().map_err(|e| validation_error(&e))?;

        if let Some(external_id) = &request.external_team_id {
            if let Some(existing) = self.find_by_external_ref(app_id, external_id).await? {
                return Ok(existing);
            }
        }

        let team_id = Uuid::new_v4();
        let bill_to_id = Uuid::new_v4();
        let billing_mode = request.billing_mode.unwrap_or(BillingMode::Subscription);
        let currency = request
            .default_currency
            .clone()
            .unwrap_or_else(|| "USD".to_string());

        let mut tx = self.db_pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO teams (id, app_id, name, kind, billing_mode, default_currency)
            VALUES ($1, $2, $3, 'STANDARD', $4, $5)
            "#,
        )
        .bind(team_id)
        .bind(app_id)
        .bind(&request.name)
        .bind(billing_mode.as_str())
        .bind(&currency)
        .execute(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO billing_entities (id, type, team_id) VALUES ($1, 'TEAM', $2)")
            .bind(bill_to_id)
            .bind(team_id)
            .execute(&mut *tx)
            .await?;

        if let Some(external_id) = &request.external_team_id {
            let mapped = sqlx::query(
                r#"
                INSERT INTO external_team_refs (app_id, external_team_id, billing_team_id)
                VALUES ($1, $2, $3)
                "#,
            )
            .bind(app_id)
            .bind(external_id)
            .bind(team_id)
            .execute(&mut *tx)
            .await;

            if let Err(e) = mapped {
                tx.rollback().await?;
                if is_unique_violation(&e) {
                    return self
                        .find_by_external_ref(app_id, external_id)
                        .await?
                        .ok_or_else(|| {
                            BillingError::Internal("external team ref vanished".to_string())
                        });
                }
                return Err(e.into());
            }
        }

        tx.commit().await?;

        tracing::info!(%app_id, %team_id, "🏢 Provisioned team");

        Ok(ProvisionedTeam {
            team_id,
            bill_to_id,
            created: true,
        })
    }

    async fn find_by_external_ref(
        &self,
        app_id: Uuid,
        external_team_id: &str,
    ) -> BillingResult<Option<ProvisionedTeam>> {
        let row = sqlx::query(
            r#"
            SELECT r.billing_team_id AS team_id, be.id AS bill_to_id
            FROM external_team_refs r
            JOIN billing_entities be ON be.team_id = r.billing_team_id
            WHERE r.app_id = $1 AND r.external_team_id = $2
            "#,
        )
        .bind(app_id)
        .bind(external_team_id)
        .fetch_optional(&self.db_pool)
        .await?;

        row.map(|row| {
            Ok(ProvisionedTeam {
                team_id: row.try_get("team_id")?,
                bill_to_id: row.try_get("bill_to_id")?,
                created: false,
            })
        })
        .transpose()
    }

    /// Add a member, or reactivate a removed one (status flips back to ACTIVE
    /// and `ended_at` clears).
    pub async fn add_member(
        &self,
        app_id: Uuid,
        team_id: Uuid,
        request: AddMemberRequest,
    ) -> BillingResult<Uuid> {
        request.validate().map_err(|e| validation_error(&e))?;

        let team = load_team(&self.db_pool, team_id).await?;
        if team.app_id != app_id {
            return Err(BillingError::TeamNotFound(team_id));
        }

        let user_row = sqlx::query("SELECT id FROM users WHERE app_id = $1 AND external_ref = $2")
            .bind(app_id)
            .bind(&request.external_ref)
            .fetch_optional(&self.db_pool)
            .await?
            .ok_or_else(|| BillingError::UserNotFound(request.external_ref.clone()))?;
        let user_id: Uuid = user_row.try_get("id")?;

        let role = request.role.unwrap_or(MemberRole::Member);

        let row = sqlx::query(
            r#"
            INSERT INTO team_members (team_id, user_id, role, status)
            VALUES ($1, $2, $3, 'ACTIVE')
            ON CONFLICT (team_id, user_id)
            DO UPDATE SET status = 'ACTIVE', ended_at = NULL, role = EXCLUDED.role
            RETURNING id
            "#,
        )
        .bind(team_id)
        .bind(user_id)
        .bind(role.as_str())
        .fetch_one(&self.db_pool)
        .await?;

        Ok(row.try_get("id")?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_billing_mode_round_trip() {
        for mode in [
            BillingMode::Subscription,
            BillingMode::Wallet,
            BillingMode::Hybrid,
        ] {
            assert_eq!(BillingMode::parse(mode.as_str()).unwrap(), mode);
        }
        assert!(BillingMode::parse("PREPAID").is_err());
    }

    #[test]
    fn test_create_user_request_validation() {
        let bad = CreateUserRequest {
            external_ref: String::new(),
            email: Some("not-an-email".to_string()),
        };
        let err = bad.validate().unwrap_err();
        assert!(err.field_errors().contains_key("external_ref"));
        assert!(err.field_errors().contains_key("email"));

        let good = CreateUserRequest {
            external_ref: "usr_42".to_string(),
            email: Some("dev@example.com".to_string()),
        };
        assert!(good.validate().is_ok());
    }

    #[test]
    fn test_create_team_request_currency_length() {
        let bad = CreateTeamRequest {
            name: "Acme".to_string(),
            billing_mode: None,
            default_currency: Some("US".to_string()),
            external_team_id: None,
        };
        assert!(bad.validate().is_err());
    }
}
