//! Error taxonomy surfaced to callers and hook adapters.
//!
//! The variant set is the stable vocabulary; `kind()` gives a snake_case code
//! for wire responses and audit metadata, `public_message()` a reason that is
//! safe to show an unauthorized caller.

use thiserror::Error;
use uuid::Uuid;

use super::{mfa::MfaMethod, types::ElevationStatus};

#[derive(Debug, Error)]
pub enum ElevationError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("no compliance policy registered for market {market}")]
    PolicyNotFound { market: String },
    #[error("MFA challenge {challenge_id} must be completed before resubmitting")]
    MfaRequired {
        challenge_id: Uuid,
        method: MfaMethod,
    },
    #[error("MFA challenge failed: {0}")]
    MfaChallengeFailed(String),
    #[error("elevation {elevation_id} is awaiting approval")]
    ApprovalRequired { elevation_id: Uuid },
    #[error("elevation {elevation_id} is {status}, not pending approval")]
    NotPendingApproval {
        elevation_id: Uuid,
        status: ElevationStatus,
    },
    #[error("requester cannot approve their own elevation")]
    SelfApprovalDenied,
    #[error("elevation token not found")]
    TokenNotFound,
    #[error("elevation token expired")]
    TokenExpired,
    #[error("elevation token revoked")]
    TokenRevoked,
    #[error("elevation token denied")]
    TokenDenied,
    #[error("missing scopes: {}", join_scopes(.missing))]
    InsufficientScope { missing: Vec<String> },
    #[error("tenant isolation violation: {reason}")]
    TenantIsolationViolation { reason: &'static str },
    #[error("requested duration of {requested_minutes}m exceeds policy maximum of {max_minutes}m")]
    DurationExceedsPolicy {
        requested_minutes: i64,
        max_minutes: i64,
    },
    #[error("{operation} did not complete before the deadline")]
    Timeout {
        operation: &'static str,
        elevation_id: Option<Uuid>,
    },
    #[error("storage error: {0}")]
    Storage(String),
}

/// Stable error-kind vocabulary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    PolicyNotFound,
    MfaRequired,
    MfaChallengeFailed,
    ApprovalRequired,
    NotPendingApproval,
    SelfApprovalDenied,
    TokenNotFound,
    TokenExpired,
    TokenRevoked,
    TokenDenied,
    InsufficientScope,
    TenantIsolationViolation,
    DurationExceedsPolicy,
    Timeout,
    Internal,
}

impl ErrorKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation_error",
            Self::PolicyNotFound => "policy_not_found",
            Self::MfaRequired => "mfa_required",
            Self::MfaChallengeFailed => "mfa_challenge_failed",
            Self::ApprovalRequired => "approval_required",
            Self::NotPendingApproval => "not_pending_approval",
            Self::SelfApprovalDenied => "self_approval_denied",
            Self::TokenNotFound => "token_not_found",
            Self::TokenExpired => "token_expired",
            Self::TokenRevoked => "token_revoked",
            Self::TokenDenied => "token_denied",
            Self::InsufficientScope => "insufficient_scope",
            Self::TenantIsolationViolation => "tenant_isolation_violation",
            Self::DurationExceedsPolicy => "duration_exceeds_policy",
            Self::Timeout => "timeout",
            Self::Internal => "internal_error",
        }
    }
}

impl ElevationError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::PolicyNotFound { .. } => ErrorKind::PolicyNotFound,
            Self::MfaRequired { .. } => ErrorKind::MfaRequired,
            Self::MfaChallengeFailed(_) => ErrorKind::MfaChallengeFailed,
            Self::ApprovalRequired { .. } => ErrorKind::ApprovalRequired,
            Self::NotPendingApproval { .. } => ErrorKind::NotPendingApproval,
            Self::SelfApprovalDenied => ErrorKind::SelfApprovalDenied,
            Self::TokenNotFound => ErrorKind::TokenNotFound,
            Self::TokenExpired => ErrorKind::TokenExpired,
            Self::TokenRevoked => ErrorKind::TokenRevoked,
            Self::TokenDenied => ErrorKind::TokenDenied,
            Self::InsufficientScope { .. } => ErrorKind::InsufficientScope,
            Self::TenantIsolationViolation { .. } => ErrorKind::TenantIsolationViolation,
            Self::DurationExceedsPolicy { .. } => ErrorKind::DurationExceedsPolicy,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Storage(_) => ErrorKind::Internal,
        }
    }

    /// Reason string safe for callers that are not authorized to see policy
    /// or tenant detail.
    #[must_use]
    pub fn public_message(&self) -> String {
        match self {
            Self::InsufficientScope { missing } => {
                format!("elevation required for scope {}", join_scopes(missing))
            }
            Self::TokenNotFound => "elevation required".to_string(),
            Self::TenantIsolationViolation { .. } => "access denied".to_string(),
            Self::PolicyNotFound { .. } | Self::Storage(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }

    /// Status of a token that lost a conditional transition, as the caller sees it.
    #[must_use]
    pub fn for_terminal_status(status: ElevationStatus) -> Option<Self> {
        match status {
            ElevationStatus::Revoked => Some(Self::TokenRevoked),
            ElevationStatus::Denied => Some(Self::TokenDenied),
            ElevationStatus::Expired => Some(Self::TokenExpired),
            ElevationStatus::Active | ElevationStatus::PendingApproval => None,
        }
    }
}

fn join_scopes(scopes: &[String]) -> String {
    scopes.join(", ")
}
