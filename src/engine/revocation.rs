//! Explicit revocation of active or pending grants.

use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::{
    approval::record_cross_tenant,
    audit::{AuditEventType, AuditRecorder, NewAuditEvent},
    clock::Clock,
    deadline::Deadline,
    error::ElevationError,
    isolation::CROSS_TENANT_ACCESS,
    store::{TokenStore, Transition, TransitionOutcome},
    types::{ElevationToken, RevokerContext},
};

const MAX_REASON_LEN: usize = 1024;

pub struct Revoker {
    tokens: Arc<dyn TokenStore>,
    audit: AuditRecorder,
    clock: Arc<dyn Clock>,
}

impl Revoker {
    #[must_use]
    pub fn new(tokens: Arc<dyn TokenStore>, audit: AuditRecorder, clock: Arc<dyn Clock>) -> Self {
        Self {
            tokens,
            audit,
            clock,
        }
    }

    /// `RevokeElevation(revokerContext, elevationID, reason)`.
    ///
    /// Once this returns, every later `verify` of the token fails with
    /// `TokenRevoked`.
    ///
    /// # Errors
    /// Returns `Validation` for a missing reason, `TokenNotFound`,
    /// `TenantIsolationViolation`, or the terminal-state error of a token that
    /// already left `active`/`pending_approval`.
    #[instrument(skip(self, context, reason, deadline), fields(revoked_by = %context.revoked_by))]
    pub async fn revoke(
        &self,
        context: &RevokerContext,
        elevation_id: Uuid,
        reason: &str,
        deadline: Deadline,
    ) -> Result<ElevationToken, ElevationError> {
        if deadline.is_elapsed() {
            return Err(ElevationError::Timeout {
                operation: "revoke elevation",
                elevation_id: Some(elevation_id),
            });
        }
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(ElevationError::Validation(
                "revocation reason is required".to_string(),
            ));
        }
        if reason.len() > MAX_REASON_LEN {
            return Err(ElevationError::Validation(
                "revocation reason is too long".to_string(),
            ));
        }
        if context.revoked_by.trim().is_empty() || context.tenant_id.trim().is_empty() {
            return Err(ElevationError::Validation(
                "revoked_by and tenant_id are required".to_string(),
            ));
        }

        let token = self
            .tokens
            .get(elevation_id)
            .await?
            .ok_or(ElevationError::TokenNotFound)?;

        if token.tenant_id != context.tenant_id {
            warn!(%elevation_id, "cross-tenant revocation attempt");
            record_cross_tenant(
                &self.audit,
                &token,
                &context.revoked_by,
                &context.tenant_id,
                "revoke elevation",
            )
            .await?;
            return Err(ElevationError::TenantIsolationViolation {
                reason: CROSS_TENANT_ACCESS,
            });
        }

        let previous_status = token.status;
        let outcome = self
            .tokens
            .transition(
                elevation_id,
                Transition::Revoke {
                    revoked_by: context.revoked_by.clone(),
                    at: self.clock.now(),
                    reason: reason.to_string(),
                },
            )
            .await?;

        let revoked = match outcome {
            TransitionOutcome::Applied(revoked) => revoked,
            TransitionOutcome::Conflict(current) => {
                return Err(ElevationError::for_terminal_status(current.status).unwrap_or(
                    ElevationError::NotPendingApproval {
                        elevation_id,
                        status: current.status,
                    },
                ));
            }
        };

        self.audit
            .record(
                NewAuditEvent::new(
                    AuditEventType::ElevationRevoked,
                    &revoked.user_id,
                    &revoked.tenant_id,
                    &revoked.market,
                )
                .elevation(revoked.id)
                .meta("revoked_by", context.revoked_by.clone())
                .meta("reason", reason)
                .meta("previous_status", previous_status.as_str()),
            )
            .await?;

        info!(%elevation_id, "elevation revoked");
        Ok(revoked)
    }
}
