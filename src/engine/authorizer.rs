//! Scope authorizer: the verification hot path.
//!
//! Flow Overview:
//! 1) Look the token up by credential digest.
//! 2) Status must be `active`.
//! 3) `now < expires_at`, otherwise a conditional `active -> expired` write.
//! 4) Tenant isolation guard: tenant, market (unless all scopes are global),
//!    resource namespace.
//! 5) Required scopes must be a subset of the granted scopes.
//! 6) The conditional usage write commits the success; a revocation that
//!    committed first makes it fail.
//!
//! Every denial writes an `access_denied` audit event before returning. No
//! token state is cached across calls.

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::{
    audit::{AuditEventType, AuditRecorder, NewAuditEvent},
    clock::Clock,
    credential::hash_credential,
    deadline::Deadline,
    error::ElevationError,
    isolation::{IsolationContext, IsolationDecision, TenantIsolationGuard},
    policy::PolicyStore,
    store::{TokenStore, Transition, TransitionOutcome, UsageOutcome},
    types::{ElevationStatus, ElevationToken, Market, Scope, ScopeSet},
};

/// Inputs to `Verify`. Tenant and token are explicit parameters.
#[derive(Clone, Debug)]
pub struct VerificationRequest {
    pub credential: SecretString,
    pub required_scopes: ScopeSet,
    pub caller_tenant: String,
    pub caller_market: Market,
    /// Tool operation being authorized, e.g. `docker system prune`.
    pub operation: String,
    pub resource_path: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct VerificationResult {
    pub allowed: bool,
    pub elevation_id: Uuid,
    pub user_id: String,
    pub tenant_id: String,
    pub market: Market,
    pub exercised_scopes: ScopeSet,
    pub granted_scopes: ScopeSet,
    pub expires_at: DateTime<Utc>,
    pub remaining_seconds: i64,
    pub emergency: bool,
    pub use_count: i64,
}

pub struct ScopeAuthorizer {
    tokens: Arc<dyn TokenStore>,
    policies: Arc<PolicyStore>,
    audit: AuditRecorder,
    clock: Arc<dyn Clock>,
    guard: TenantIsolationGuard,
}

fn scope_list(scopes: &ScopeSet) -> Value {
    Value::from(
        scopes
            .iter()
            .map(|scope| Value::from(scope.as_str()))
            .collect::<Vec<_>>(),
    )
}

/// Expire an overdue active token exactly once.
///
/// Returns the token's state afterwards and whether this call made the change.
pub(crate) async fn expire(
    tokens: &dyn TokenStore,
    audit: &AuditRecorder,
    token: &ElevationToken,
    trigger: &'static str,
) -> Result<(ElevationToken, bool), ElevationError> {
    match tokens.transition(token.id, Transition::Expire).await? {
        TransitionOutcome::Applied(expired) => {
            audit
                .record(
                    NewAuditEvent::new(
                        AuditEventType::ElevationExpired,
                        &expired.user_id,
                        &expired.tenant_id,
                        &expired.market,
                    )
                    .elevation(expired.id)
                    .meta("expires_at", expired.expires_at.to_rfc3339())
                    .meta("trigger", trigger)
                    .meta("use_count", expired.use_count),
                )
                .await?;
            debug!(elevation_id = %expired.id, trigger, "elevation expired");
            Ok((expired, true))
        }
        TransitionOutcome::Conflict(current) => Ok((current, false)),
    }
}

impl ScopeAuthorizer {
    #[must_use]
    pub fn new(
        tokens: Arc<dyn TokenStore>,
        policies: Arc<PolicyStore>,
        audit: AuditRecorder,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            tokens,
            policies,
            audit,
            clock,
            guard: TenantIsolationGuard,
        }
    }

    /// `Verify(token, requiredScopes, callerTenant, callerMarket)`.
    ///
    /// # Errors
    /// Returns `TokenNotFound`, `ApprovalRequired`, `TokenDenied`,
    /// `TokenRevoked`, `TokenExpired`, `TenantIsolationViolation` or
    /// `InsufficientScope`, each after writing an `access_denied` event.
    #[instrument(
        skip(self, request, deadline),
        fields(
            caller_tenant = %request.caller_tenant,
            caller_market = %request.caller_market,
            operation = %request.operation
        )
    )]
    pub async fn verify(
        &self,
        request: &VerificationRequest,
        deadline: Deadline,
    ) -> Result<VerificationResult, ElevationError> {
        if deadline.is_elapsed() {
            return Err(ElevationError::Timeout {
                operation: "verify elevation",
                elevation_id: None,
            });
        }
        if request.required_scopes.is_empty() {
            return Err(ElevationError::Validation(
                "at least one required scope is needed".to_string(),
            ));
        }
        if request.caller_tenant.trim().is_empty() {
            return Err(ElevationError::Validation(
                "caller tenant is required".to_string(),
            ));
        }

        let credential_hash = hash_credential(request.credential.expose_secret());
        let Some(token) = self.tokens.get_by_credential(&credential_hash).await? else {
            self.deny_unknown(request).await?;
            return Err(ElevationError::TokenNotFound);
        };

        match token.status {
            ElevationStatus::Active => {}
            ElevationStatus::PendingApproval => {
                self.deny(&token, request, "approval_pending", None).await?;
                return Err(ElevationError::ApprovalRequired {
                    elevation_id: token.id,
                });
            }
            terminal => return self.deny_terminal(&token, request, terminal).await,
        }

        let now = self.clock.now();
        if token.is_past_expiry(now) {
            return self.deny_expired(&token, request).await;
        }

        let snapshot = self.policies.snapshot();
        let decision = self.guard.check(
            &snapshot,
            &token,
            &IsolationContext {
                caller_tenant: &request.caller_tenant,
                caller_market: &request.caller_market,
                required_scopes: &request.required_scopes,
                resource_path: request.resource_path.as_deref(),
            },
        );
        if let IsolationDecision::Deny { reason } = decision {
            warn!(elevation_id = %token.id, reason, "tenant isolation violation");
            self.deny(&token, request, reason, None).await?;
            return Err(ElevationError::TenantIsolationViolation { reason });
        }

        let missing = token.missing_scopes(&request.required_scopes);
        if !missing.is_empty() {
            let missing: Vec<String> = missing.iter().map(Scope::to_string).collect();
            self.deny(
                &token,
                request,
                "insufficient_scope",
                Some(Value::from(missing.clone())),
            )
            .await?;
            return Err(ElevationError::InsufficientScope { missing });
        }

        let used = match self.tokens.record_use(token.id, now).await? {
            UsageOutcome::Recorded(used) => used,
            UsageOutcome::Rejected(current) => {
                // Lost a race with revocation or expiry after the status read.
                return match current.status {
                    ElevationStatus::Active => self.deny_expired(&current, request).await,
                    status => self.deny_terminal(&current, request, status).await,
                };
            }
        };

        self.audit
            .record(
                NewAuditEvent::new(
                    AuditEventType::ElevationUsed,
                    &used.user_id,
                    &used.tenant_id,
                    &used.market,
                )
                .elevation(used.id)
                .meta("operation", request.operation.clone())
                .meta("scopes", scope_list(&request.required_scopes))
                .meta("resource_path", request.resource_path.clone())
                .meta("use_count", used.use_count)
                .meta("emergency", used.emergency_auto_approved),
            )
            .await?;

        Ok(VerificationResult {
            allowed: true,
            elevation_id: used.id,
            user_id: used.user_id.clone(),
            tenant_id: used.tenant_id.clone(),
            market: used.market.clone(),
            exercised_scopes: request.required_scopes.clone(),
            granted_scopes: used.granted_scopes.clone(),
            expires_at: used.expires_at,
            remaining_seconds: used.remaining(now).num_seconds(),
            emergency: used.emergency_auto_approved,
            use_count: used.use_count,
        })
    }

    async fn deny_expired(
        &self,
        token: &ElevationToken,
        request: &VerificationRequest,
    ) -> Result<VerificationResult, ElevationError> {
        let (current, _) = expire(self.tokens.as_ref(), &self.audit, token, "verify").await?;
        match current.status {
            ElevationStatus::Expired => {
                self.deny(&current, request, "token_expired", None).await?;
                Err(ElevationError::TokenExpired)
            }
            status => self.deny_terminal(&current, request, status).await,
        }
    }

    async fn deny_terminal(
        &self,
        token: &ElevationToken,
        request: &VerificationRequest,
        status: ElevationStatus,
    ) -> Result<VerificationResult, ElevationError> {
        let err = ElevationError::for_terminal_status(status).unwrap_or(
            ElevationError::ApprovalRequired {
                elevation_id: token.id,
            },
        );
        self.deny(token, request, err.kind().as_str(), None).await?;
        Err(err)
    }

    async fn deny(
        &self,
        token: &ElevationToken,
        request: &VerificationRequest,
        reason: &str,
        missing: Option<Value>,
    ) -> Result<(), ElevationError> {
        let mut event = NewAuditEvent::new(
            AuditEventType::AccessDenied,
            &token.user_id,
            &token.tenant_id,
            &token.market,
        )
        .elevation(token.id)
        .meta("reason", reason)
        .meta("operation", request.operation.clone())
        .meta("scopes", scope_list(&request.required_scopes))
        .meta("caller_tenant_id", request.caller_tenant.clone())
        .meta("caller_market", request.caller_market.as_str())
        .meta("token_status", token.status.as_str());
        if let Some(missing) = missing {
            event = event.meta("missing_scopes", missing);
        }
        if let Some(path) = &request.resource_path {
            event = event.meta("resource_path", path.clone());
        }
        self.audit.record(event).await?;
        Ok(())
    }

    async fn deny_unknown(&self, request: &VerificationRequest) -> Result<(), ElevationError> {
        self.audit
            .record(
                NewAuditEvent::new(
                    AuditEventType::AccessDenied,
                    "unknown",
                    &request.caller_tenant,
                    &request.caller_market,
                )
                .meta("reason", "token_not_found")
                .meta("operation", request.operation.clone())
                .meta("scopes", scope_list(&request.required_scopes)),
            )
            .await?;
        Ok(())
    }
}
