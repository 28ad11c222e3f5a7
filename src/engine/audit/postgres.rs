//! Postgres audit log. Rows are inserted once and never updated.

use serde_json::{Map, Value};
use sqlx::{PgPool, Row, postgres::PgRow, types::Json};
use tracing::Instrument;

use super::{AuditEvent, AuditEventType, AuditQuery, AuditSeverity, AuditSink};
use crate::engine::{BoxFuture, store::StoreError, types::Market};

#[derive(Clone, Debug)]
pub struct PgAuditLog {
    pool: PgPool,
}

impl PgAuditLog {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn event_from_row(row: &PgRow) -> Result<AuditEvent, StoreError> {
    let event_type: String = row.try_get("event_type")?;
    let event_type = AuditEventType::from_str(&event_type)
        .ok_or_else(|| StoreError::Backend(format!("unknown audit event type: {event_type}")))?;
    let severity: String = row.try_get("severity")?;
    let severity = AuditSeverity::from_str(&severity)
        .ok_or_else(|| StoreError::Backend(format!("unknown audit severity: {severity}")))?;
    let market: String = row.try_get("market")?;
    let market = Market::parse(&market).map_err(|err| StoreError::Backend(err.to_string()))?;
    let Json(metadata): Json<Map<String, Value>> = row.try_get("metadata")?;

    Ok(AuditEvent {
        id: row.try_get("id")?,
        event_type,
        severity,
        elevation_id: row.try_get("elevation_id")?,
        user_id: row.try_get("user_id")?,
        tenant_id: row.try_get("tenant_id")?,
        market,
        occurred_at: row.try_get("occurred_at")?,
        metadata,
    })
}

impl AuditSink for PgAuditLog {
    fn append<'a>(&'a self, event: &'a AuditEvent) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let query = r"
                INSERT INTO elevation_audit_events (
                    id, event_type, severity, elevation_id, user_id, tenant_id,
                    market, occurred_at, metadata
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ";
            let span = tracing::info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "INSERT",
                db.statement = query
            );
            sqlx::query(query)
                .bind(event.id)
                .bind(event.event_type.as_str())
                .bind(event.severity.as_str())
                .bind(event.elevation_id)
                .bind(&event.user_id)
                .bind(&event.tenant_id)
                .bind(event.market.as_str())
                .bind(event.occurred_at)
                .bind(Json(&event.metadata))
                .execute(&self.pool)
                .instrument(span)
                .await?;
            Ok(())
        })
    }

    fn query<'a>(
        &'a self,
        query: &'a AuditQuery,
    ) -> BoxFuture<'a, Result<Vec<AuditEvent>, StoreError>> {
        Box::pin(async move {
            let statement = r"
                SELECT * FROM elevation_audit_events
                WHERE ($1::uuid IS NULL OR elevation_id = $1)
                  AND ($2::text IS NULL OR event_type = $2)
                  AND ($3::text IS NULL OR user_id = $3)
                  AND ($4::text IS NULL OR tenant_id = $4)
                  AND ($5::text IS NULL OR market = $5)
                  AND ($6::timestamptz IS NULL OR occurred_at >= $6)
                  AND ($7::timestamptz IS NULL OR occurred_at < $7)
                ORDER BY occurred_at
                LIMIT $8
            ";
            let span = tracing::info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "SELECT",
                db.statement = statement
            );
            let rows = sqlx::query(statement)
                .bind(query.elevation_id)
                .bind(query.event_type.map(AuditEventType::as_str))
                .bind(query.user_id.as_deref())
                .bind(query.tenant_id.as_deref())
                .bind(query.market.as_ref().map(Market::as_str))
                .bind(query.from)
                .bind(query.to)
                .bind(query.effective_limit())
                .fetch_all(&self.pool)
                .instrument(span)
                .await?;
            rows.iter().map(event_from_row).collect()
        })
    }
}
