//! Token persistence and the lifecycle state machine.
//!
//! Every status change goes through `TokenStore::transition`, a single-row
//! conditional update: it applies only when the stored status is one of the
//! transition's pre-states. The loser of a race gets `TransitionOutcome::Conflict`
//! carrying the state that beat it.
//!
//! `record_use` is the commit point of a successful verification. It only
//! succeeds while the token is active and unexpired, so a verification can
//! never land after a revocation has committed.

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use super::{
    BoxFuture,
    error::ElevationError,
    types::{ElevationStatus, ElevationToken},
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryTokenStore;
pub use postgres::PgTokenStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("token not found")]
    NotFound,
    #[error("token {0} already exists")]
    Duplicate(Uuid),
    #[error("{0}")]
    Backend(String),
}

impl From<StoreError> for ElevationError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => Self::TokenNotFound,
            other => Self::Storage(other.to_string()),
        }
    }
}

/// A requested status change together with the fields it stamps.
#[derive(Clone, Debug)]
pub enum Transition {
    Approve {
        approver_id: String,
        at: DateTime<Utc>,
        /// Lifetime restarts at approval.
        expires_at: DateTime<Utc>,
    },
    Deny {
        approver_id: Option<String>,
        reason: Option<String>,
    },
    Expire,
    Revoke {
        revoked_by: String,
        at: DateTime<Utc>,
        reason: String,
    },
}

impl Transition {
    /// States this transition may leave.
    #[must_use]
    pub const fn from_states(&self) -> &'static [ElevationStatus] {
        match self {
            Self::Approve { .. } | Self::Deny { .. } => &[ElevationStatus::PendingApproval],
            Self::Expire => &[ElevationStatus::Active],
            Self::Revoke { .. } => &[ElevationStatus::Active, ElevationStatus::PendingApproval],
        }
    }

    #[must_use]
    pub const fn target(&self) -> ElevationStatus {
        match self {
            Self::Approve { .. } => ElevationStatus::Active,
            Self::Deny { .. } => ElevationStatus::Denied,
            Self::Expire => ElevationStatus::Expired,
            Self::Revoke { .. } => ElevationStatus::Revoked,
        }
    }

    #[must_use]
    pub fn applies_to(&self, status: ElevationStatus) -> bool {
        self.from_states().contains(&status)
    }

    /// Mutate an in-memory record. Callers check `applies_to` first.
    pub fn apply(&self, token: &mut ElevationToken) {
        token.status = self.target();
        match self {
            Self::Approve {
                approver_id,
                at,
                expires_at,
            } => {
                token.approver_id = Some(approver_id.clone());
                token.approved_at = Some(*at);
                token.expires_at = *expires_at;
            }
            Self::Deny {
                approver_id,
                reason,
            } => {
                token.approver_id.clone_from(approver_id);
                token.decision_reason.clone_from(reason);
            }
            Self::Expire => {}
            Self::Revoke {
                revoked_by,
                at,
                reason,
            } => {
                token.revoked_at = Some(*at);
                token.revoked_by = Some(revoked_by.clone());
                token.revocation_reason = Some(reason.clone());
            }
        }
    }
}

#[derive(Clone, Debug)]
pub enum TransitionOutcome {
    /// The update won; carries the new state.
    Applied(ElevationToken),
    /// The precondition was stale; carries the current state.
    Conflict(ElevationToken),
}

#[derive(Clone, Debug)]
pub enum UsageOutcome {
    Recorded(ElevationToken),
    /// Not active or already past expiry at commit time; carries the current state.
    Rejected(ElevationToken),
}

/// Storage contract for elevation tokens.
pub trait TokenStore: Send + Sync {
    fn insert<'a>(&'a self, token: &'a ElevationToken) -> BoxFuture<'a, Result<(), StoreError>>;

    fn get(&self, id: Uuid) -> BoxFuture<'_, Result<Option<ElevationToken>, StoreError>>;

    fn get_by_credential<'a>(
        &'a self,
        credential_hash: &'a str,
    ) -> BoxFuture<'a, Result<Option<ElevationToken>, StoreError>>;

    /// Conditional status change keyed on the current status.
    fn transition(
        &self,
        id: Uuid,
        transition: Transition,
    ) -> BoxFuture<'_, Result<TransitionOutcome, StoreError>>;

    /// Conditional usage write: bumps `use_count` only while active and unexpired at `at`.
    fn record_use(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<UsageOutcome, StoreError>>;

    /// Active tokens for one user in one tenant, newest first.
    fn list_active<'a>(
        &'a self,
        user_id: &'a str,
        tenant_id: &'a str,
    ) -> BoxFuture<'a, Result<Vec<ElevationToken>, StoreError>>;

    /// Active tokens past expiry and pending tokens past their approval deadline.
    fn list_overdue(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> BoxFuture<'_, Result<Vec<ElevationToken>, StoreError>>;

    /// Backend liveness for health reporting.
    fn ping(&self) -> BoxFuture<'_, Result<(), StoreError>>;

    /// Short label for health output.
    fn backend(&self) -> &'static str;
}

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::{DateTime, Duration, Utc};
    use uuid::Uuid;

    use crate::engine::types::{ElevationStatus, ElevationToken, Market, parse_scopes};

    pub(crate) fn token(status: ElevationStatus, now: DateTime<Utc>) -> ElevationToken {
        ElevationToken {
            id: Uuid::new_v4(),
            user_id: "user-1".to_string(),
            tenant_id: "tenant-angola-123".to_string(),
            market: Market::parse("angola").unwrap_or_else(|_| unreachable!()),
            granted_scopes: parse_scopes(["docker:system"]).unwrap_or_default(),
            status,
            created_at: now,
            expires_at: now + Duration::minutes(30),
            duration_seconds: 1800,
            approval_deadline: None,
            approver_id: None,
            approved_at: None,
            decision_reason: None,
            revoked_at: None,
            revoked_by: None,
            revocation_reason: None,
            justification: "incident 42".to_string(),
            emergency_requested: false,
            emergency_auto_approved: false,
            credential_hash: format!("hash-{}", Uuid::new_v4()),
            use_count: 0,
            last_used_at: None,
            policy_version: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_only_leave_their_pre_states() {
        let now = Utc::now();
        let approve = Transition::Approve {
            approver_id: "boss".to_string(),
            at: now,
            expires_at: now,
        };
        assert!(approve.applies_to(ElevationStatus::PendingApproval));
        assert!(!approve.applies_to(ElevationStatus::Active));
        assert!(Transition::Expire.applies_to(ElevationStatus::Active));
        assert!(!Transition::Expire.applies_to(ElevationStatus::PendingApproval));

        let revoke = Transition::Revoke {
            revoked_by: "sec".to_string(),
            at: now,
            reason: "incident closed".to_string(),
        };
        for terminal in [
            ElevationStatus::Denied,
            ElevationStatus::Expired,
            ElevationStatus::Revoked,
        ] {
            assert!(!revoke.applies_to(terminal));
            assert!(!approve.applies_to(terminal));
            assert!(!Transition::Expire.applies_to(terminal));
        }
    }

    #[test]
    fn revoke_stamps_revocation_fields() {
        let now = Utc::now();
        let mut token = test_support::token(ElevationStatus::Active, now);
        Transition::Revoke {
            revoked_by: "sec".to_string(),
            at: now,
            reason: "incident closed".to_string(),
        }
        .apply(&mut token);
        assert_eq!(token.status, ElevationStatus::Revoked);
        assert_eq!(token.revoked_by.as_deref(), Some("sec"));
        assert_eq!(token.revocation_reason.as_deref(), Some("incident closed"));
        assert_eq!(token.revoked_at, Some(now));
    }

    #[test]
    fn store_not_found_maps_to_token_not_found() {
        assert!(matches!(
            ElevationError::from(StoreError::NotFound),
            ElevationError::TokenNotFound
        ));
        assert!(matches!(
            ElevationError::from(StoreError::Backend("boom".to_string())),
            ElevationError::Storage(_)
        ));
    }
}
