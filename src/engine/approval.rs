//! Approval workflow: approve, deny and approval timeout.
//!
//! Only one decision can win for a pending token. Approve and deny are both
//! conditional on `pending_approval`; the loser sees `NotPendingApproval` with
//! the state that beat it. A request left pending past its approval deadline
//! is denied with reason `approval_timeout`, either when someone next tries to
//! decide it or by the sweeper.

use serde_json::Value;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::{
    audit::{AuditEventType, AuditRecorder, NewAuditEvent},
    clock::Clock,
    deadline::Deadline,
    error::ElevationError,
    isolation::CROSS_TENANT_ACCESS,
    store::{TokenStore, Transition, TransitionOutcome},
    types::{ApproverContext, ElevationStatus, ElevationToken},
};

pub const APPROVAL_TIMEOUT_REASON: &str = "approval_timeout";

pub struct ApprovalWorkflow {
    tokens: Arc<dyn TokenStore>,
    audit: AuditRecorder,
    clock: Arc<dyn Clock>,
}

/// Denial of a decide attempt by a principal outside the token's tenant.
pub(crate) async fn record_cross_tenant(
    audit: &AuditRecorder,
    token: &ElevationToken,
    actor_id: &str,
    actor_tenant: &str,
    operation: &'static str,
) -> Result<(), ElevationError> {
    audit
        .record(
            NewAuditEvent::new(
                AuditEventType::AccessDenied,
                &token.user_id,
                &token.tenant_id,
                &token.market,
            )
            .elevation(token.id)
            .meta("reason", CROSS_TENANT_ACCESS)
            .meta("operation", operation)
            .meta("actor_id", actor_id)
            .meta("caller_tenant_id", actor_tenant),
        )
        .await?;
    Ok(())
}

/// Deny a pending token whose approval deadline has passed.
///
/// Returns the token's state afterwards and whether this call made the change.
pub(crate) async fn time_out(
    tokens: &dyn TokenStore,
    audit: &AuditRecorder,
    token: &ElevationToken,
) -> Result<(ElevationToken, bool), ElevationError> {
    let outcome = tokens
        .transition(
            token.id,
            Transition::Deny {
                approver_id: None,
                reason: Some(APPROVAL_TIMEOUT_REASON.to_string()),
            },
        )
        .await?;
    match outcome {
        TransitionOutcome::Applied(denied) => {
            audit
                .record(
                    NewAuditEvent::new(
                        AuditEventType::ElevationDenied,
                        &denied.user_id,
                        &denied.tenant_id,
                        &denied.market,
                    )
                    .elevation(denied.id)
                    .meta("reason", APPROVAL_TIMEOUT_REASON)
                    .meta("approver_id", Value::Null)
                    .meta(
                        "approval_deadline",
                        denied.approval_deadline.map(|at| at.to_rfc3339()),
                    ),
                )
                .await?;
            info!(elevation_id = %denied.id, "pending elevation timed out");
            Ok((denied, true))
        }
        TransitionOutcome::Conflict(current) => Ok((current, false)),
    }
}

impl ApprovalWorkflow {
    #[must_use]
    pub fn new(tokens: Arc<dyn TokenStore>, audit: AuditRecorder, clock: Arc<dyn Clock>) -> Self {
        Self {
            tokens,
            audit,
            clock,
        }
    }

    /// Shared preconditions for approve and deny.
    async fn load_pending(
        &self,
        context: &ApproverContext,
        elevation_id: Uuid,
        operation: &'static str,
        deadline: Deadline,
    ) -> Result<ElevationToken, ElevationError> {
        if deadline.is_elapsed() {
            return Err(ElevationError::Timeout {
                operation,
                elevation_id: Some(elevation_id),
            });
        }
        if context.approver_id.trim().is_empty() || context.tenant_id.trim().is_empty() {
            return Err(ElevationError::Validation(
                "approver_id and tenant_id are required".to_string(),
            ));
        }

        let token = self
            .tokens
            .get(elevation_id)
            .await?
            .ok_or(ElevationError::TokenNotFound)?;

        if token.tenant_id != context.tenant_id {
            warn!(%elevation_id, operation, "cross-tenant approval attempt");
            record_cross_tenant(
                &self.audit,
                &token,
                &context.approver_id,
                &context.tenant_id,
                operation,
            )
            .await?;
            return Err(ElevationError::TenantIsolationViolation {
                reason: CROSS_TENANT_ACCESS,
            });
        }

        if token.status != ElevationStatus::PendingApproval {
            return Err(ElevationError::NotPendingApproval {
                elevation_id,
                status: token.status,
            });
        }

        let now = self.clock.now();
        if token
            .approval_deadline
            .is_some_and(|approval_deadline| now >= approval_deadline)
        {
            let (current, _) = time_out(self.tokens.as_ref(), &self.audit, &token).await?;
            return Err(ElevationError::NotPendingApproval {
                elevation_id,
                status: current.status,
            });
        }
        Ok(token)
    }

    /// `ApproveElevation(approverContext, elevationID)`.
    ///
    /// # Errors
    /// Returns `TokenNotFound`, `TenantIsolationViolation`, `NotPendingApproval`
    /// or `SelfApprovalDenied`.
    #[instrument(skip(self, context, deadline), fields(approver_id = %context.approver_id))]
    pub async fn approve(
        &self,
        context: &ApproverContext,
        elevation_id: Uuid,
        deadline: Deadline,
    ) -> Result<ElevationToken, ElevationError> {
        let token = self
            .load_pending(context, elevation_id, "approve elevation", deadline)
            .await?;

        if context.approver_id == token.user_id {
            self.audit
                .record(
                    NewAuditEvent::new(
                        AuditEventType::AccessDenied,
                        &token.user_id,
                        &token.tenant_id,
                        &token.market,
                    )
                    .elevation(token.id)
                    .meta("reason", "self_approval")
                    .meta("operation", "approve elevation")
                    .meta("actor_id", context.approver_id.clone()),
                )
                .await?;
            return Err(ElevationError::SelfApprovalDenied);
        }

        let now = self.clock.now();
        let expires_at = now + chrono::Duration::seconds(token.duration_seconds);
        let outcome = self
            .tokens
            .transition(
                elevation_id,
                Transition::Approve {
                    approver_id: context.approver_id.clone(),
                    at: now,
                    expires_at,
                },
            )
            .await?;

        let approved = match outcome {
            TransitionOutcome::Applied(approved) => approved,
            TransitionOutcome::Conflict(current) => {
                return Err(ElevationError::NotPendingApproval {
                    elevation_id,
                    status: current.status,
                });
            }
        };

        self.audit
            .record(
                NewAuditEvent::new(
                    AuditEventType::ElevationApproved,
                    &approved.user_id,
                    &approved.tenant_id,
                    &approved.market,
                )
                .elevation(approved.id)
                .meta("approver_id", context.approver_id.clone())
                .meta(
                    "pending_seconds",
                    (now - approved.created_at).num_seconds(),
                )
                .meta("expires_at", approved.expires_at.to_rfc3339()),
            )
            .await?;

        info!(%elevation_id, "elevation approved");
        Ok(approved)
    }

    /// `DenyElevation(approverContext, elevationID, reason)`.
    ///
    /// # Errors
    /// Returns `TokenNotFound`, `TenantIsolationViolation` or `NotPendingApproval`.
    #[instrument(skip(self, context, reason, deadline), fields(approver_id = %context.approver_id))]
    pub async fn deny(
        &self,
        context: &ApproverContext,
        elevation_id: Uuid,
        reason: Option<String>,
        deadline: Deadline,
    ) -> Result<ElevationToken, ElevationError> {
        self.load_pending(context, elevation_id, "deny elevation", deadline)
            .await?;

        let reason = reason
            .map(|reason| reason.trim().to_string())
            .filter(|reason| !reason.is_empty());
        let outcome = self
            .tokens
            .transition(
                elevation_id,
                Transition::Deny {
                    approver_id: Some(context.approver_id.clone()),
                    reason: reason.clone(),
                },
            )
            .await?;

        let denied = match outcome {
            TransitionOutcome::Applied(denied) => denied,
            TransitionOutcome::Conflict(current) => {
                return Err(ElevationError::NotPendingApproval {
                    elevation_id,
                    status: current.status,
                });
            }
        };

        self.audit
            .record(
                NewAuditEvent::new(
                    AuditEventType::ElevationDenied,
                    &denied.user_id,
                    &denied.tenant_id,
                    &denied.market,
                )
                .elevation(denied.id)
                .meta("approver_id", context.approver_id.clone())
                .meta("reason", reason),
            )
            .await?;

        info!(%elevation_id, "elevation denied");
        Ok(denied)
    }
}
