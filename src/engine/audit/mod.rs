//! Append-only audit trail.
//!
//! Flow Overview:
//! 1) Components build a `NewAuditEvent` describing what happened.
//! 2) `AuditRecorder::record` stamps id, time, severity and the market's
//!    compliance metadata (`policy_version`, `compliance_framework`,
//!    `retention_years`).
//! 3) The sink append is awaited, so the event is durable before the
//!    operation that produced it returns.
//!
//! Events are never updated or deleted here; retention is an external
//! data-lifecycle concern.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{fmt, sync::Arc};
use tracing::{debug, error};
use uuid::Uuid;

use super::{
    BoxFuture,
    clock::Clock,
    error::ElevationError,
    policy::PolicyStore,
    store::StoreError,
    types::Market,
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryAuditLog;
pub use postgres::PgAuditLog;

const DEFAULT_QUERY_LIMIT: i64 = 500;
const MAX_QUERY_LIMIT: i64 = 5_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    ElevationRequested,
    ElevationApproved,
    ElevationDenied,
    EmergencyAccessGranted,
    ElevationRevoked,
    ElevationExpired,
    ElevationUsed,
    AccessDenied,
    MfaChallengeIssued,
    MfaVerified,
    MfaFailed,
}

impl AuditEventType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ElevationRequested => "elevation_requested",
            Self::ElevationApproved => "elevation_approved",
            Self::ElevationDenied => "elevation_denied",
            Self::EmergencyAccessGranted => "emergency_access_granted",
            Self::ElevationRevoked => "elevation_revoked",
            Self::ElevationExpired => "elevation_expired",
            Self::ElevationUsed => "elevation_used",
            Self::AccessDenied => "access_denied",
            Self::MfaChallengeIssued => "mfa_challenge_issued",
            Self::MfaVerified => "mfa_verified",
            Self::MfaFailed => "mfa_failed",
        }
    }

    #[must_use]
    pub fn from_str(value: &str) -> Option<Self> {
        match value.trim() {
            "elevation_requested" => Some(Self::ElevationRequested),
            "elevation_approved" => Some(Self::ElevationApproved),
            "elevation_denied" => Some(Self::ElevationDenied),
            "emergency_access_granted" => Some(Self::EmergencyAccessGranted),
            "elevation_revoked" => Some(Self::ElevationRevoked),
            "elevation_expired" => Some(Self::ElevationExpired),
            // `usage` is the older name for a successful verification.
            "elevation_used" | "usage" => Some(Self::ElevationUsed),
            "access_denied" => Some(Self::AccessDenied),
            "mfa_challenge_issued" => Some(Self::MfaChallengeIssued),
            "mfa_verified" => Some(Self::MfaVerified),
            "mfa_failed" => Some(Self::MfaFailed),
            _ => None,
        }
    }

    #[must_use]
    pub const fn default_severity(self) -> AuditSeverity {
        match self {
            Self::EmergencyAccessGranted => AuditSeverity::Critical,
            Self::ElevationRevoked | Self::AccessDenied | Self::MfaFailed => AuditSeverity::Warning,
            _ => AuditSeverity::Info,
        }
    }
}

impl fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditSeverity {
    Info,
    Warning,
    Critical,
}

impl AuditSeverity {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }

    #[must_use]
    pub fn from_str(value: &str) -> Option<Self> {
        match value.trim() {
            "info" => Some(Self::Info),
            "warning" => Some(Self::Warning),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

/// Immutable audit record.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub event_type: AuditEventType,
    pub severity: AuditSeverity,
    pub elevation_id: Option<Uuid>,
    pub user_id: String,
    pub tenant_id: String,
    pub market: Market,
    pub occurred_at: DateTime<Utc>,
    pub metadata: Map<String, Value>,
}

/// An event before the recorder stamps it.
#[derive(Clone, Debug)]
pub struct NewAuditEvent {
    pub event_type: AuditEventType,
    pub severity: AuditSeverity,
    pub elevation_id: Option<Uuid>,
    pub user_id: String,
    pub tenant_id: String,
    pub market: Market,
    pub metadata: Map<String, Value>,
}

impl NewAuditEvent {
    #[must_use]
    pub fn new(event_type: AuditEventType, user_id: &str, tenant_id: &str, market: &Market) -> Self {
        Self {
            event_type,
            severity: event_type.default_severity(),
            elevation_id: None,
            user_id: user_id.to_string(),
            tenant_id: tenant_id.to_string(),
            market: market.clone(),
            metadata: Map::new(),
        }
    }

    #[must_use]
    pub fn elevation(mut self, elevation_id: Uuid) -> Self {
        self.elevation_id = Some(elevation_id);
        self
    }

    #[must_use]
    pub fn severity(mut self, severity: AuditSeverity) -> Self {
        self.severity = severity;
        self
    }

    #[must_use]
    pub fn meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Filters for `QueryAuditEvents`. Unset fields match everything.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct AuditQuery {
    pub elevation_id: Option<Uuid>,
    pub event_type: Option<AuditEventType>,
    pub user_id: Option<String>,
    pub tenant_id: Option<String>,
    pub market: Option<Market>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

impl AuditQuery {
    #[must_use]
    pub fn for_elevation(elevation_id: Uuid) -> Self {
        Self {
            elevation_id: Some(elevation_id),
            ..Self::default()
        }
    }

    /// Page size clamped to a sane window.
    #[must_use]
    pub fn effective_limit(&self) -> i64 {
        self.limit
            .unwrap_or(DEFAULT_QUERY_LIMIT)
            .clamp(1, MAX_QUERY_LIMIT)
    }

    /// `from` is inclusive, `to` exclusive.
    #[must_use]
    pub fn matches(&self, event: &AuditEvent) -> bool {
        self.elevation_id
            .is_none_or(|id| event.elevation_id == Some(id))
            && self.event_type.is_none_or(|kind| event.event_type == kind)
            && self
                .user_id
                .as_deref()
                .is_none_or(|user| event.user_id == user)
            && self
                .tenant_id
                .as_deref()
                .is_none_or(|tenant| event.tenant_id == tenant)
            && self
                .market
                .as_ref()
                .is_none_or(|market| &event.market == market)
            && self.from.is_none_or(|from| event.occurred_at >= from)
            && self.to.is_none_or(|to| event.occurred_at < to)
    }
}

/// Durable append-only storage for audit events.
pub trait AuditSink: Send + Sync {
    fn append<'a>(&'a self, event: &'a AuditEvent) -> BoxFuture<'a, Result<(), StoreError>>;

    /// Matching events ordered by `occurred_at`, oldest first.
    fn query<'a>(&'a self, query: &'a AuditQuery)
        -> BoxFuture<'a, Result<Vec<AuditEvent>, StoreError>>;
}

/// Stamps and writes audit events.
#[derive(Clone)]
pub struct AuditRecorder {
    sink: Arc<dyn AuditSink>,
    policies: Arc<PolicyStore>,
    clock: Arc<dyn Clock>,
}

impl AuditRecorder {
    #[must_use]
    pub fn new(sink: Arc<dyn AuditSink>, policies: Arc<PolicyStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            sink,
            policies,
            clock,
        }
    }

    /// Enrich and durably append one event.
    ///
    /// # Errors
    /// Returns `ElevationError::Storage` if the sink rejects the write.
    pub async fn record(&self, event: NewAuditEvent) -> Result<AuditEvent, ElevationError> {
        let snapshot = self.policies.snapshot();
        let compliance = snapshot.compliance_for(&event.market);

        let mut metadata = event.metadata;
        metadata
            .entry("policy_version")
            .or_insert_with(|| Value::from(snapshot.version));
        metadata.insert(
            "compliance_framework".to_string(),
            Value::from(compliance.framework),
        );
        metadata.insert(
            "retention_years".to_string(),
            Value::from(compliance.retention_years),
        );

        let stamped = AuditEvent {
            id: Uuid::new_v4(),
            event_type: event.event_type,
            severity: event.severity,
            elevation_id: event.elevation_id,
            user_id: event.user_id,
            tenant_id: event.tenant_id,
            market: event.market,
            occurred_at: self.clock.now(),
            metadata,
        };

        if let Err(err) = self.sink.append(&stamped).await {
            error!(
                event_type = stamped.event_type.as_str(),
                elevation_id = ?stamped.elevation_id,
                "failed to append audit event: {err}"
            );
            return Err(err.into());
        }

        debug!(
            event_type = stamped.event_type.as_str(),
            severity = stamped.severity.as_str(),
            elevation_id = ?stamped.elevation_id,
            "audit event recorded"
        );
        Ok(stamped)
    }

    /// `QueryAuditEvents(filters, timeRange)`.
    ///
    /// # Errors
    /// Returns `ElevationError::Validation` for an inverted time range, or
    /// `ElevationError::Storage` on backend failure.
    pub async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEvent>, ElevationError> {
        if let (Some(from), Some(to)) = (query.from, query.to) {
            if from > to {
                return Err(ElevationError::Validation(
                    "audit query range starts after it ends".to_string(),
                ));
            }
        }
        Ok(self.sink.query(query).await?)
    }
}

impl fmt::Debug for AuditRecorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditRecorder").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::clock::SystemClock;
    use anyhow::Result;

    fn recorder() -> (AuditRecorder, Arc<MemoryAuditLog>) {
        let sink = Arc::new(MemoryAuditLog::new());
        let recorder = AuditRecorder::new(
            sink.clone(),
            Arc::new(PolicyStore::builtin()),
            Arc::new(SystemClock),
        );
        (recorder, sink)
    }

    #[test]
    fn event_type_text_and_severity() {
        assert_eq!(
            AuditEventType::from_str("usage"),
            Some(AuditEventType::ElevationUsed)
        );
        assert_eq!(
            AuditEventType::EmergencyAccessGranted.default_severity(),
            AuditSeverity::Critical
        );
        assert_eq!(
            AuditEventType::AccessDenied.default_severity(),
            AuditSeverity::Warning
        );
    }

    #[tokio::test]
    async fn record_enriches_with_compliance_metadata() -> Result<()> {
        let (recorder, _sink) = recorder();
        let market = Market::parse("angola")?;
        let event = recorder
            .record(
                NewAuditEvent::new(AuditEventType::ElevationUsed, "user-1", "tenant-1", &market)
                    .elevation(Uuid::new_v4())
                    .meta("operation", "docker system prune"),
            )
            .await?;
        assert_eq!(event.metadata["compliance_framework"], "BNA");
        assert_eq!(event.metadata["retention_years"], 10);
        assert_eq!(event.metadata["policy_version"], 1);
        assert_eq!(event.metadata["operation"], "docker system prune");
        Ok(())
    }

    #[tokio::test]
    async fn recorded_events_are_immediately_queryable() -> Result<()> {
        let (recorder, _sink) = recorder();
        let market = Market::parse("brasil")?;
        let elevation_id = Uuid::new_v4();
        recorder
            .record(
                NewAuditEvent::new(AuditEventType::ElevationRequested, "u", "t", &market)
                    .elevation(elevation_id),
            )
            .await?;
        recorder
            .record(NewAuditEvent::new(
                AuditEventType::AccessDenied,
                "u",
                "t",
                &market,
            ))
            .await?;

        let events = recorder
            .query(&AuditQuery::for_elevation(elevation_id))
            .await?;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, AuditEventType::ElevationRequested);

        let denied = recorder
            .query(&AuditQuery {
                event_type: Some(AuditEventType::AccessDenied),
                market: Some(market.clone()),
                ..AuditQuery::default()
            })
            .await?;
        assert_eq!(denied.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn inverted_range_is_rejected() {
        let (recorder, _sink) = recorder();
        let now = Utc::now();
        let result = recorder
            .query(&AuditQuery {
                from: Some(now),
                to: Some(now - chrono::Duration::hours(1)),
                ..AuditQuery::default()
            })
            .await;
        assert!(matches!(result, Err(ElevationError::Validation(_))));
    }
}
