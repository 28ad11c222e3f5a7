//! Regulator reporting: audit event query.

use axum::{
    Json,
    extract::{Extension, Query},
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use super::{ApiError, ErrorResponse, validation};
use crate::engine::{AuditEvent, AuditEventType, AuditQuery, ElevationEngine, Market};

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct AuditParams {
    pub elevation_id: Option<Uuid>,
    /// `elevation_requested`, `elevation_used`, `access_denied`, ...
    pub event_type: Option<String>,
    pub user_id: Option<String>,
    pub tenant_id: Option<String>,
    pub market: Option<String>,
    /// Inclusive lower bound (RFC 3339).
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound (RFC 3339).
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AuditEventResponse {
    pub id: Uuid,
    pub event_type: String,
    pub severity: String,
    pub elevation_id: Option<Uuid>,
    pub user_id: String,
    pub tenant_id: String,
    pub market: String,
    pub occurred_at: DateTime<Utc>,
    #[schema(value_type = Object)]
    pub metadata: Map<String, Value>,
}

impl From<AuditEvent> for AuditEventResponse {
    fn from(event: AuditEvent) -> Self {
        Self {
            id: event.id,
            event_type: event.event_type.as_str().to_string(),
            severity: event.severity.as_str().to_string(),
            elevation_id: event.elevation_id,
            user_id: event.user_id,
            tenant_id: event.tenant_id,
            market: event.market.to_string(),
            occurred_at: event.occurred_at,
            metadata: event.metadata,
        }
    }
}

fn into_query(params: AuditParams) -> Result<AuditQuery, ApiError> {
    let event_type = match params.event_type.as_deref() {
        Some(value) => Some(
            AuditEventType::from_str(value).ok_or_else(|| validation("unknown event_type"))?,
        ),
        None => None,
    };
    let market = params.market.as_deref().map(Market::parse).transpose()?;
    Ok(AuditQuery {
        elevation_id: params.elevation_id,
        event_type,
        user_id: params.user_id,
        tenant_id: params.tenant_id,
        market,
        from: params.from,
        to: params.to,
        limit: params.limit,
    })
}

#[utoipa::path(
    get,
    path = "/v1/audit/events",
    params(AuditParams),
    responses(
        (status = 200, description = "Matching events, oldest first.", body = [AuditEventResponse]),
        (status = 400, description = "Invalid filter.", body = ErrorResponse),
    ),
    tag = "audit"
)]
pub async fn query_events(
    engine: Extension<Arc<ElevationEngine>>,
    Query(params): Query<AuditParams>,
) -> Result<impl IntoResponse, ApiError> {
    let query = into_query(params)?;
    let events = engine.query_audit_events(&query).await?;
    let body: Vec<AuditEventResponse> = events.into_iter().map(AuditEventResponse::from).collect();
    Ok(Json(body))
}
