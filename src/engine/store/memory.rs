//! In-process token store for tests and single-node development.
//!
//! A single write lock around the map makes each transition a compare-and-set.

use chrono::{DateTime, Utc};
use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock},
};
use uuid::Uuid;

use super::{StoreError, TokenStore, Transition, TransitionOutcome, UsageOutcome};
use crate::engine::{
    BoxFuture,
    types::{ElevationStatus, ElevationToken},
};

#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    tokens: RwLock<HashMap<Uuid, ElevationToken>>,
}

impl MemoryTokenStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read<T>(&self, f: impl FnOnce(&HashMap<Uuid, ElevationToken>) -> T) -> T {
        let tokens = self.tokens.read().unwrap_or_else(PoisonError::into_inner);
        f(&tokens)
    }

    fn write<T>(&self, f: impl FnOnce(&mut HashMap<Uuid, ElevationToken>) -> T) -> T {
        let mut tokens = self.tokens.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut tokens)
    }
}

impl TokenStore for MemoryTokenStore {
    fn insert<'a>(&'a self, token: &'a ElevationToken) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            self.write(|tokens| {
                if tokens.contains_key(&token.id) {
                    return Err(StoreError::Duplicate(token.id));
                }
                tokens.insert(token.id, token.clone());
                Ok(())
            })
        })
    }

    fn get(&self, id: Uuid) -> BoxFuture<'_, Result<Option<ElevationToken>, StoreError>> {
        Box::pin(async move { Ok(self.read(|tokens| tokens.get(&id).cloned())) })
    }

    fn get_by_credential<'a>(
        &'a self,
        credential_hash: &'a str,
    ) -> BoxFuture<'a, Result<Option<ElevationToken>, StoreError>> {
        Box::pin(async move {
            Ok(self.read(|tokens| {
                tokens
                    .values()
                    .find(|token| token.credential_hash == credential_hash)
                    .cloned()
            }))
        })
    }

    fn transition(
        &self,
        id: Uuid,
        transition: Transition,
    ) -> BoxFuture<'_, Result<TransitionOutcome, StoreError>> {
        Box::pin(async move {
            self.write(|tokens| {
                let token = tokens.get_mut(&id).ok_or(StoreError::NotFound)?;
                if !transition.applies_to(token.status) {
                    return Ok(TransitionOutcome::Conflict(token.clone()));
                }
                transition.apply(token);
                Ok(TransitionOutcome::Applied(token.clone()))
            })
        })
    }

    fn record_use(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<UsageOutcome, StoreError>> {
        Box::pin(async move {
            self.write(|tokens| {
                let token = tokens.get_mut(&id).ok_or(StoreError::NotFound)?;
                if token.status != ElevationStatus::Active || token.is_past_expiry(at) {
                    return Ok(UsageOutcome::Rejected(token.clone()));
                }
                token.use_count += 1;
                token.last_used_at = Some(at);
                Ok(UsageOutcome::Recorded(token.clone()))
            })
        })
    }

    fn list_active<'a>(
        &'a self,
        user_id: &'a str,
        tenant_id: &'a str,
    ) -> BoxFuture<'a, Result<Vec<ElevationToken>, StoreError>> {
        Box::pin(async move {
            let mut active: Vec<ElevationToken> = self.read(|tokens| {
                tokens
                    .values()
                    .filter(|token| {
                        token.status == ElevationStatus::Active
                            && token.user_id == user_id
                            && token.tenant_id == tenant_id
                    })
                    .cloned()
                    .collect()
            });
            active.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            Ok(active)
        })
    }

    fn list_overdue(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> BoxFuture<'_, Result<Vec<ElevationToken>, StoreError>> {
        Box::pin(async move {
            let limit = usize::try_from(limit).unwrap_or(0);
            let mut overdue: Vec<ElevationToken> = self.read(|tokens| {
                tokens
                    .values()
                    .filter(|token| match token.status {
                        ElevationStatus::Active => token.is_past_expiry(now),
                        ElevationStatus::PendingApproval => token
                            .approval_deadline
                            .is_some_and(|deadline| now >= deadline),
                        _ => false,
                    })
                    .cloned()
                    .collect()
            });
            overdue.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            overdue.truncate(limit);
            Ok(overdue)
        })
    }

    fn ping(&self) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async { Ok(()) })
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::store::test_support::token;
    use anyhow::{Context, Result};
    use chrono::Duration;
    use std::sync::Arc;

    #[tokio::test]
    async fn insert_rejects_duplicates() -> Result<()> {
        let store = MemoryTokenStore::new();
        let token = token(ElevationStatus::Active, Utc::now());
        store.insert(&token).await?;
        assert!(matches!(
            store.insert(&token).await,
            Err(StoreError::Duplicate(id)) if id == token.id
        ));
        Ok(())
    }

    #[tokio::test]
    async fn lookup_by_credential_hash() -> Result<()> {
        let store = MemoryTokenStore::new();
        let token = token(ElevationStatus::Active, Utc::now());
        store.insert(&token).await?;
        let found = store
            .get_by_credential(&token.credential_hash)
            .await?
            .context("token by credential")?;
        assert_eq!(found.id, token.id);
        assert!(store.get_by_credential("nope").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_approve_and_deny_have_one_winner() -> Result<()> {
        let store = Arc::new(MemoryTokenStore::new());
        let now = Utc::now();
        let token = token(ElevationStatus::PendingApproval, now);
        store.insert(&token).await?;
        let id = token.id;

        let approve_store = store.clone();
        let approve = tokio::spawn(async move {
            approve_store
                .transition(
                    id,
                    Transition::Approve {
                        approver_id: "approver".to_string(),
                        at: now,
                        expires_at: now + Duration::minutes(30),
                    },
                )
                .await
        });
        let deny_store = store.clone();
        let deny = tokio::spawn(async move {
            deny_store
                .transition(
                    id,
                    Transition::Deny {
                        approver_id: Some("approver".to_string()),
                        reason: None,
                    },
                )
                .await
        });

        let (approved, denied) = tokio::try_join!(approve, deny)?;
        let applied = [approved?, denied?]
            .iter()
            .filter(|outcome| matches!(outcome, TransitionOutcome::Applied(_)))
            .count();
        assert_eq!(applied, 1);
        Ok(())
    }

    #[tokio::test]
    async fn usage_rejected_after_revoke_and_after_expiry() -> Result<()> {
        let store = MemoryTokenStore::new();
        let now = Utc::now();
        let revoked = token(ElevationStatus::Active, now);
        let expiring = token(ElevationStatus::Active, now);
        store.insert(&revoked).await?;
        store.insert(&expiring).await?;

        assert!(matches!(
            store.record_use(revoked.id, now).await?,
            UsageOutcome::Recorded(ref t) if t.use_count == 1
        ));
        store
            .transition(
                revoked.id,
                Transition::Revoke {
                    revoked_by: "sec".to_string(),
                    at: now,
                    reason: "done".to_string(),
                },
            )
            .await?;
        assert!(matches!(
            store.record_use(revoked.id, now).await?,
            UsageOutcome::Rejected(ref t) if t.status == ElevationStatus::Revoked
        ));

        let later = expiring.expires_at;
        assert!(matches!(
            store.record_use(expiring.id, later).await?,
            UsageOutcome::Rejected(_)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn overdue_lists_expired_and_timed_out() -> Result<()> {
        let store = MemoryTokenStore::new();
        let now = Utc::now();
        let active = token(ElevationStatus::Active, now);
        let mut pending = token(ElevationStatus::PendingApproval, now);
        pending.approval_deadline = Some(now + Duration::hours(1));
        store.insert(&active).await?;
        store.insert(&pending).await?;

        assert!(store.list_overdue(now, 10).await?.is_empty());
        let overdue = store.list_overdue(now + Duration::hours(2), 10).await?;
        assert_eq!(overdue.len(), 2);
        assert_eq!(store.list_overdue(now + Duration::hours(2), 1).await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn list_active_filters_by_user_tenant_and_status() -> Result<()> {
        let store = MemoryTokenStore::new();
        let now = Utc::now();
        let mine = token(ElevationStatus::Active, now);
        let mut other_tenant = token(ElevationStatus::Active, now);
        other_tenant.tenant_id = "tenant-angola-456".to_string();
        let pending = token(ElevationStatus::PendingApproval, now);
        for t in [&mine, &other_tenant, &pending] {
            store.insert(t).await?;
        }
        let active = store.list_active("user-1", "tenant-angola-123").await?;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, mine.id);
        Ok(())
    }
}
