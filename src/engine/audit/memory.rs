//! In-process audit log.

use std::sync::{PoisonError, RwLock};

use super::{AuditEvent, AuditQuery, AuditSink};
use crate::engine::{BoxFuture, store::StoreError};

#[derive(Debug, Default)]
pub struct MemoryAuditLog {
    events: RwLock<Vec<AuditEvent>>,
}

impl MemoryAuditLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AuditSink for MemoryAuditLog {
    fn append<'a>(&'a self, event: &'a AuditEvent) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            self.events
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .push(event.clone());
            Ok(())
        })
    }

    fn query<'a>(
        &'a self,
        query: &'a AuditQuery,
    ) -> BoxFuture<'a, Result<Vec<AuditEvent>, StoreError>> {
        Box::pin(async move {
            let limit = usize::try_from(query.effective_limit()).unwrap_or(usize::MAX);
            let events = self.events.read().unwrap_or_else(PoisonError::into_inner);
            let mut matched: Vec<AuditEvent> = events
                .iter()
                .filter(|event| query.matches(event))
                .cloned()
                .collect();
            matched.sort_by(|a, b| a.occurred_at.cmp(&b.occurred_at));
            matched.truncate(limit);
            Ok(matched)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{
        audit::{AuditEventType, AuditSeverity},
        types::Market,
    };
    use anyhow::Result;
    use chrono::{Duration, Utc};
    use serde_json::Map;
    use uuid::Uuid;

    fn event(tenant: &str, at: chrono::DateTime<Utc>) -> Result<AuditEvent> {
        Ok(AuditEvent {
            id: Uuid::new_v4(),
            event_type: AuditEventType::ElevationUsed,
            severity: AuditSeverity::Info,
            elevation_id: None,
            user_id: "user-1".to_string(),
            tenant_id: tenant.to_string(),
            market: Market::parse("angola")?,
            occurred_at: at,
            metadata: Map::new(),
        })
    }

    #[tokio::test]
    async fn query_filters_by_tenant_and_time_range() -> Result<()> {
        let log = MemoryAuditLog::new();
        let now = Utc::now();
        log.append(&event("tenant-a", now - Duration::hours(2))?).await?;
        log.append(&event("tenant-a", now)?).await?;
        log.append(&event("tenant-b", now)?).await?;
        assert_eq!(log.len(), 3);

        let query = AuditQuery {
            tenant_id: Some("tenant-a".to_string()),
            from: Some(now - Duration::hours(1)),
            to: Some(now + Duration::seconds(1)),
            ..AuditQuery::default()
        };
        let events = log.query(&query).await?;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].occurred_at, now);
        Ok(())
    }

    #[tokio::test]
    async fn query_respects_limit_oldest_first() -> Result<()> {
        let log = MemoryAuditLog::new();
        let now = Utc::now();
        for offset in [3, 1, 2] {
            log.append(&event("tenant-a", now - Duration::minutes(offset))?)
                .await?;
        }
        let events = log
            .query(&AuditQuery {
                limit: Some(2),
                ..AuditQuery::default()
            })
            .await?;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].occurred_at, now - Duration::minutes(3));
        Ok(())
    }
}
