//! Postgres-backed token store.
//!
//! Flow Overview:
//! 1) Transitions run as one `UPDATE ... WHERE id = $1 AND status = ANY($2) RETURNING *`.
//! 2) When no row comes back, a point read tells the caller whether the token
//!    is missing or lost the race, and to what state.
//! 3) Usage is the same pattern keyed on `status = 'active' AND expires_at > $2`.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};
use tracing::Instrument;
use uuid::Uuid;

use super::{StoreError, TokenStore, Transition, TransitionOutcome, UsageOutcome};
use crate::engine::{
    BoxFuture,
    types::{ElevationStatus, ElevationToken, Market, parse_scopes},
};

const UNIQUE_VIOLATION: &str = "23505";

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

#[derive(Clone, Debug)]
pub struct PgTokenStore {
    pool: PgPool,
}

impl PgTokenStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn query_span(operation: &'static str, statement: &'static str) -> tracing::Span {
    tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = operation,
        db.statement = statement
    )
}

fn status_list(transition: &Transition) -> Vec<&'static str> {
    transition
        .from_states()
        .iter()
        .map(|status| status.as_str())
        .collect()
}

fn token_from_row(row: &PgRow) -> Result<ElevationToken, StoreError> {
    let status: String = row.try_get("status")?;
    let status = ElevationStatus::from_str(&status)
        .ok_or_else(|| StoreError::Backend(format!("unknown token status: {status}")))?;
    let market: String = row.try_get("market")?;
    let market = Market::parse(&market).map_err(|err| StoreError::Backend(err.to_string()))?;
    let scopes: Vec<String> = row.try_get("granted_scopes")?;
    let granted_scopes =
        parse_scopes(&scopes).map_err(|err| StoreError::Backend(err.to_string()))?;

    Ok(ElevationToken {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        tenant_id: row.try_get("tenant_id")?,
        market,
        granted_scopes,
        status,
        created_at: row.try_get("created_at")?,
        expires_at: row.try_get("expires_at")?,
        duration_seconds: row.try_get("duration_seconds")?,
        approval_deadline: row.try_get("approval_deadline")?,
        approver_id: row.try_get("approver_id")?,
        approved_at: row.try_get("approved_at")?,
        decision_reason: row.try_get("decision_reason")?,
        revoked_at: row.try_get("revoked_at")?,
        revoked_by: row.try_get("revoked_by")?,
        revocation_reason: row.try_get("revocation_reason")?,
        justification: row.try_get("justification")?,
        emergency_requested: row.try_get("emergency_requested")?,
        emergency_auto_approved: row.try_get("emergency_auto_approved")?,
        credential_hash: row.try_get("credential_hash")?,
        use_count: row.try_get("use_count")?,
        last_used_at: row.try_get("last_used_at")?,
        policy_version: row.try_get("policy_version")?,
    })
}

impl PgTokenStore {
    async fn fetch(&self, id: Uuid) -> Result<Option<ElevationToken>, StoreError> {
        let query = "SELECT * FROM elevation_tokens WHERE id = $1";
        let row = sqlx::query(query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", query))
            .await?;
        row.as_ref().map(token_from_row).transpose()
    }

    async fn apply_transition(
        &self,
        id: Uuid,
        transition: &Transition,
    ) -> Result<Option<PgRow>, StoreError> {
        let from = status_list(transition);
        let target = transition.target().as_str();
        let row = match transition {
            Transition::Approve {
                approver_id,
                at,
                expires_at,
            } => {
                let query = r"
                    UPDATE elevation_tokens
                    SET status = $3, approver_id = $4, approved_at = $5, expires_at = $6
                    WHERE id = $1 AND status = ANY($2)
                    RETURNING *
                ";
                sqlx::query(query)
                    .bind(id)
                    .bind(&from)
                    .bind(target)
                    .bind(approver_id)
                    .bind(at)
                    .bind(expires_at)
                    .fetch_optional(&self.pool)
                    .instrument(query_span("UPDATE", query))
                    .await?
            }
            Transition::Deny {
                approver_id,
                reason,
            } => {
                let query = r"
                    UPDATE elevation_tokens
                    SET status = $3, approver_id = $4, decision_reason = $5
                    WHERE id = $1 AND status = ANY($2)
                    RETURNING *
                ";
                sqlx::query(query)
                    .bind(id)
                    .bind(&from)
                    .bind(target)
                    .bind(approver_id)
                    .bind(reason)
                    .fetch_optional(&self.pool)
                    .instrument(query_span("UPDATE", query))
                    .await?
            }
            Transition::Expire => {
                let query = r"
                    UPDATE elevation_tokens
                    SET status = $3
                    WHERE id = $1 AND status = ANY($2)
                    RETURNING *
                ";
                sqlx::query(query)
                    .bind(id)
                    .bind(&from)
                    .bind(target)
                    .fetch_optional(&self.pool)
                    .instrument(query_span("UPDATE", query))
                    .await?
            }
            Transition::Revoke {
                revoked_by,
                at,
                reason,
            } => {
                let query = r"
                    UPDATE elevation_tokens
                    SET status = $3, revoked_at = $4, revoked_by = $5, revocation_reason = $6
                    WHERE id = $1 AND status = ANY($2)
                    RETURNING *
                ";
                sqlx::query(query)
                    .bind(id)
                    .bind(&from)
                    .bind(target)
                    .bind(at)
                    .bind(revoked_by)
                    .bind(reason)
                    .fetch_optional(&self.pool)
                    .instrument(query_span("UPDATE", query))
                    .await?
            }
        };
        Ok(row)
    }
}

impl TokenStore for PgTokenStore {
    fn insert<'a>(&'a self, token: &'a ElevationToken) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let query = r"
                INSERT INTO elevation_tokens (
                    id, user_id, tenant_id, market, granted_scopes, status,
                    created_at, expires_at, duration_seconds, approval_deadline,
                    justification, emergency_requested, emergency_auto_approved,
                    credential_hash, policy_version
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ";
            let scopes: Vec<&str> = token.granted_scopes.iter().map(|s| s.as_str()).collect();
            let result = sqlx::query(query)
                .bind(token.id)
                .bind(&token.user_id)
                .bind(&token.tenant_id)
                .bind(token.market.as_str())
                .bind(&scopes)
                .bind(token.status.as_str())
                .bind(token.created_at)
                .bind(token.expires_at)
                .bind(token.duration_seconds)
                .bind(token.approval_deadline)
                .bind(&token.justification)
                .bind(token.emergency_requested)
                .bind(token.emergency_auto_approved)
                .bind(&token.credential_hash)
                .bind(token.policy_version)
                .execute(&self.pool)
                .instrument(query_span("INSERT", query))
                .await;

            match result {
                Ok(_) => Ok(()),
                Err(err)
                    if err
                        .as_database_error()
                        .and_then(|db| db.code())
                        .is_some_and(|code| code == UNIQUE_VIOLATION) =>
                {
                    Err(StoreError::Duplicate(token.id))
                }
                Err(err) => Err(err.into()),
            }
        })
    }

    fn get(&self, id: Uuid) -> BoxFuture<'_, Result<Option<ElevationToken>, StoreError>> {
        Box::pin(self.fetch(id))
    }

    fn get_by_credential<'a>(
        &'a self,
        credential_hash: &'a str,
    ) -> BoxFuture<'a, Result<Option<ElevationToken>, StoreError>> {
        Box::pin(async move {
            let query = "SELECT * FROM elevation_tokens WHERE credential_hash = $1 LIMIT 1";
            let row = sqlx::query(query)
                .bind(credential_hash)
                .fetch_optional(&self.pool)
                .instrument(query_span("SELECT", query))
                .await?;
            row.as_ref().map(token_from_row).transpose()
        })
    }

    fn transition(
        &self,
        id: Uuid,
        transition: Transition,
    ) -> BoxFuture<'_, Result<TransitionOutcome, StoreError>> {
        Box::pin(async move {
            if let Some(row) = self.apply_transition(id, &transition).await? {
                return Ok(TransitionOutcome::Applied(token_from_row(&row)?));
            }
            let current = self.fetch(id).await?.ok_or(StoreError::NotFound)?;
            Ok(TransitionOutcome::Conflict(current))
        })
    }

    fn record_use(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<UsageOutcome, StoreError>> {
        Box::pin(async move {
            let query = r"
                UPDATE elevation_tokens
                SET use_count = use_count + 1, last_used_at = $2
                WHERE id = $1 AND status = 'active' AND expires_at > $2
                RETURNING *
            ";
            let row = sqlx::query(query)
                .bind(id)
                .bind(at)
                .fetch_optional(&self.pool)
                .instrument(query_span("UPDATE", query))
                .await?;
            if let Some(row) = row {
                return Ok(UsageOutcome::Recorded(token_from_row(&row)?));
            }
            let current = self.fetch(id).await?.ok_or(StoreError::NotFound)?;
            Ok(UsageOutcome::Rejected(current))
        })
    }

    fn list_active<'a>(
        &'a self,
        user_id: &'a str,
        tenant_id: &'a str,
    ) -> BoxFuture<'a, Result<Vec<ElevationToken>, StoreError>> {
        Box::pin(async move {
            let query = r"
                SELECT * FROM elevation_tokens
                WHERE user_id = $1 AND tenant_id = $2 AND status = 'active'
                ORDER BY created_at DESC
            ";
            let rows = sqlx::query(query)
                .bind(user_id)
                .bind(tenant_id)
                .fetch_all(&self.pool)
                .instrument(query_span("SELECT", query))
                .await?;
            rows.iter().map(token_from_row).collect()
        })
    }

    fn list_overdue(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> BoxFuture<'_, Result<Vec<ElevationToken>, StoreError>> {
        Box::pin(async move {
            let query = r"
                SELECT * FROM elevation_tokens
                WHERE (status = 'active' AND expires_at <= $1)
                   OR (status = 'pending_approval' AND approval_deadline <= $1)
                ORDER BY created_at
                LIMIT $2
            ";
            let rows = sqlx::query(query)
                .bind(now)
                .bind(limit)
                .fetch_all(&self.pool)
                .instrument(query_span("SELECT", query))
                .await?;
            rows.iter().map(token_from_row).collect()
        })
    }

    fn ping(&self) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            let query = "SELECT 1";
            sqlx::query(query)
                .execute(&self.pool)
                .instrument(query_span("SELECT", query))
                .await?;
            Ok(())
        })
    }

    fn backend(&self) -> &'static str {
        "postgres"
    }
}
