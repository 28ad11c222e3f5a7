//! Privilege elevation engine.
//!
//! Flow Overview:
//! 1) `request_elevation` validates, resolves policy, runs MFA and stores a
//!    token as `pending_approval` or `active`.
//! 2) `approve_elevation` / `deny_elevation` decide pending tokens.
//! 3) `verify` is the hot path tool hooks call before a privileged command.
//! 4) `revoke_elevation` ends a grant early; `sweep` expires and times out
//!    overdue tokens in the background.
//!
//! Security boundaries:
//! - Tenant ids are compared exactly on every operation; lookups across
//!   tenants fail as isolation violations without revealing the owner.
//! - Bearer credentials are only stored as SHA-256 digests.
//! - Every state change and every denial is written to the audit log before
//!   the call returns.

use chrono::Duration;
use serde::Serialize;
use std::{future::Future, pin::Pin, sync::Arc};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

pub mod approval;
pub mod audit;
pub mod authorizer;
pub mod clock;
pub mod credential;
pub mod deadline;
pub mod duration;
pub mod error;
pub mod isolation;
pub mod mfa;
pub mod notify;
pub mod policy;
pub mod processor;
pub mod revocation;
pub mod store;
pub mod types;

pub use approval::ApprovalWorkflow;
pub use audit::{AuditEvent, AuditEventType, AuditQuery, AuditRecorder, AuditSink};
pub use authorizer::{ScopeAuthorizer, VerificationRequest, VerificationResult};
pub use clock::{Clock, ManualClock, SystemClock};
pub use deadline::Deadline;
pub use error::{ElevationError, ErrorKind};
pub use mfa::{MemoryMfaVerifier, MfaLevel, MfaMethod, MfaVerifier};
pub use notify::{LogNotifier, Notifier};
pub use policy::{ComplianceRegistration, PolicySnapshot, PolicyStore};
pub use processor::RequestProcessor;
pub use revocation::Revoker;
pub use store::TokenStore;
pub use types::{
    ApproverContext, ElevationRequest, ElevationStatus, ElevationToken, IssuedElevation, Market,
    RevokerContext, Scope, ScopeSet,
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

const DEFAULT_APPROVAL_TTL_SECONDS: i64 = 24 * 60 * 60; // 24 hours
const DEFAULT_MFA_CHALLENGE_TTL_SECONDS: i64 = 300;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5000;
const DEFAULT_SWEEP_BATCH_SIZE: i64 = 500;

#[derive(Clone, Debug)]
pub struct EngineConfig {
    approval_ttl_seconds: i64,
    mfa_challenge_ttl_seconds: i64,
    request_timeout_ms: u64,
    sweep_batch_size: i64,
}

impl EngineConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            approval_ttl_seconds: DEFAULT_APPROVAL_TTL_SECONDS,
            mfa_challenge_ttl_seconds: DEFAULT_MFA_CHALLENGE_TTL_SECONDS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            sweep_batch_size: DEFAULT_SWEEP_BATCH_SIZE,
        }
    }

    #[must_use]
    pub fn with_approval_ttl_seconds(mut self, seconds: i64) -> Self {
        self.approval_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_mfa_challenge_ttl_seconds(mut self, seconds: i64) -> Self {
        self.mfa_challenge_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_request_timeout_ms(mut self, millis: u64) -> Self {
        self.request_timeout_ms = millis;
        self
    }

    #[must_use]
    pub fn with_sweep_batch_size(mut self, size: i64) -> Self {
        self.sweep_batch_size = size;
        self
    }

    #[must_use]
    pub fn approval_ttl(&self) -> Duration {
        Duration::seconds(self.approval_ttl_seconds)
    }

    #[must_use]
    pub fn mfa_challenge_ttl(&self) -> Duration {
        Duration::seconds(self.mfa_challenge_ttl_seconds)
    }

    #[must_use]
    pub fn request_timeout_ms(&self) -> u64 {
        self.request_timeout_ms
    }

    /// Deadline applied when a caller does not bring its own.
    #[must_use]
    pub fn default_deadline(&self) -> Deadline {
        if self.request_timeout_ms == 0 {
            Deadline::none()
        } else {
            Deadline::after(std::time::Duration::from_millis(self.request_timeout_ms))
        }
    }

    #[must_use]
    pub fn sweep_batch_size(&self) -> i64 {
        self.sweep_batch_size
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Tokens changed and challenges dropped by one housekeeping pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired: usize,
    pub timed_out: usize,
    pub challenges_pruned: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StorageHealth {
    pub backend: &'static str,
    pub healthy: bool,
}

/// Collaborators for an engine; anything left unset gets an in-memory default.
#[derive(Default)]
pub struct EngineBuilder {
    config: EngineConfig,
    policies: Option<Arc<PolicyStore>>,
    tokens: Option<Arc<dyn TokenStore>>,
    audit_sink: Option<Arc<dyn AuditSink>>,
    notifier: Option<Arc<dyn Notifier>>,
    clock: Option<Arc<dyn Clock>>,
    mfa: Option<Arc<dyn MfaVerifier>>,
}

impl EngineBuilder {
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_policies(mut self, policies: Arc<PolicyStore>) -> Self {
        self.policies = Some(policies);
        self
    }

    #[must_use]
    pub fn with_token_store(mut self, tokens: Arc<dyn TokenStore>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    #[must_use]
    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit_sink = Some(sink);
        self
    }

    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    #[must_use]
    pub fn with_mfa_verifier(mut self, mfa: Arc<dyn MfaVerifier>) -> Self {
        self.mfa = Some(mfa);
        self
    }

    #[must_use]
    pub fn build(self) -> ElevationEngine {
        let config = self.config;
        let policies = self
            .policies
            .unwrap_or_else(|| Arc::new(PolicyStore::builtin()));
        let tokens = self
            .tokens
            .unwrap_or_else(|| Arc::new(store::MemoryTokenStore::new()));
        let audit_sink = self
            .audit_sink
            .unwrap_or_else(|| Arc::new(audit::MemoryAuditLog::new()));
        let notifier = self.notifier.unwrap_or_else(|| Arc::new(LogNotifier));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let mfa = self.mfa.unwrap_or_else(|| {
            Arc::new(
                MemoryMfaVerifier::new(notifier.clone(), clock.clone())
                    .with_ttl(config.mfa_challenge_ttl()),
            )
        });

        let audit = AuditRecorder::new(audit_sink, policies.clone(), clock.clone());
        let processor = RequestProcessor::new(
            &config,
            policies.clone(),
            tokens.clone(),
            mfa.clone(),
            notifier,
            audit.clone(),
            clock.clone(),
        );
        let approvals = ApprovalWorkflow::new(tokens.clone(), audit.clone(), clock.clone());
        let authorizer =
            ScopeAuthorizer::new(tokens.clone(), policies.clone(), audit.clone(), clock.clone());
        let revoker = Revoker::new(tokens.clone(), audit.clone(), clock.clone());

        ElevationEngine {
            config,
            policies,
            tokens,
            mfa,
            audit,
            clock,
            processor,
            approvals,
            authorizer,
            revoker,
        }
    }
}

/// Entry points of the elevation engine. Cheap to share behind an `Arc`.
pub struct ElevationEngine {
    config: EngineConfig,
    policies: Arc<PolicyStore>,
    tokens: Arc<dyn TokenStore>,
    mfa: Arc<dyn MfaVerifier>,
    audit: AuditRecorder,
    clock: Arc<dyn Clock>,
    processor: RequestProcessor,
    approvals: ApprovalWorkflow,
    authorizer: ScopeAuthorizer,
    revoker: Revoker,
}

impl ElevationEngine {
    #[must_use]
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn policies(&self) -> &Arc<PolicyStore> {
        &self.policies
    }

    /// # Errors
    /// See [`RequestProcessor::request_elevation`].
    pub async fn request_elevation(
        &self,
        request: ElevationRequest,
        deadline: Deadline,
    ) -> Result<IssuedElevation, ElevationError> {
        self.processor.request_elevation(request, deadline).await
    }

    /// Answer an MFA challenge. `Ok(false)` means the response was wrong.
    ///
    /// # Errors
    /// Returns `MfaChallengeFailed` for unknown, expired or exhausted challenges.
    pub async fn verify_mfa_challenge(
        &self,
        challenge_id: Uuid,
        response: &str,
        deadline: Deadline,
    ) -> Result<bool, ElevationError> {
        if deadline.is_elapsed() {
            return Err(ElevationError::Timeout {
                operation: "verify mfa challenge",
                elevation_id: None,
            });
        }
        self.mfa.verify(challenge_id, response, deadline).await
    }

    /// # Errors
    /// See [`ApprovalWorkflow::approve`].
    pub async fn approve_elevation(
        &self,
        approver: &ApproverContext,
        elevation_id: Uuid,
        deadline: Deadline,
    ) -> Result<ElevationToken, ElevationError> {
        self.approvals.approve(approver, elevation_id, deadline).await
    }

    /// # Errors
    /// See [`ApprovalWorkflow::deny`].
    pub async fn deny_elevation(
        &self,
        approver: &ApproverContext,
        elevation_id: Uuid,
        reason: Option<String>,
        deadline: Deadline,
    ) -> Result<ElevationToken, ElevationError> {
        self.approvals
            .deny(approver, elevation_id, reason, deadline)
            .await
    }

    /// # Errors
    /// See [`Revoker::revoke`].
    pub async fn revoke_elevation(
        &self,
        revoker: &RevokerContext,
        elevation_id: Uuid,
        reason: &str,
        deadline: Deadline,
    ) -> Result<ElevationToken, ElevationError> {
        self.revoker
            .revoke(revoker, elevation_id, reason, deadline)
            .await
    }

    /// # Errors
    /// See [`ScopeAuthorizer::verify`].
    pub async fn verify(
        &self,
        request: &VerificationRequest,
        deadline: Deadline,
    ) -> Result<VerificationResult, ElevationError> {
        self.authorizer.verify(request, deadline).await
    }

    /// `GetElevationToken(id)` scoped to the caller's tenant.
    ///
    /// # Errors
    /// Returns `TokenNotFound`, or `TenantIsolationViolation` when the token
    /// belongs to another tenant.
    #[instrument(skip(self, deadline))]
    pub async fn get_elevation_token(
        &self,
        elevation_id: Uuid,
        tenant_id: &str,
        deadline: Deadline,
    ) -> Result<ElevationToken, ElevationError> {
        if deadline.is_elapsed() {
            return Err(ElevationError::Timeout {
                operation: "get elevation",
                elevation_id: Some(elevation_id),
            });
        }
        let token = self
            .tokens
            .get(elevation_id)
            .await?
            .ok_or(ElevationError::TokenNotFound)?;
        if token.tenant_id != tenant_id {
            return Err(ElevationError::TenantIsolationViolation {
                reason: isolation::CROSS_TENANT_ACCESS,
            });
        }
        Ok(token)
    }

    /// `ListActiveElevations(user, tenant)`; tokens already past expiry are
    /// left out even before the sweeper has marked them.
    ///
    /// # Errors
    /// Returns `Validation` for empty ids or `Storage` on backend failure.
    #[instrument(skip(self, deadline))]
    pub async fn list_active_elevations(
        &self,
        user_id: &str,
        tenant_id: &str,
        deadline: Deadline,
    ) -> Result<Vec<ElevationToken>, ElevationError> {
        if deadline.is_elapsed() {
            return Err(ElevationError::Timeout {
                operation: "list active elevations",
                elevation_id: None,
            });
        }
        if user_id.trim().is_empty() || tenant_id.trim().is_empty() {
            return Err(ElevationError::Validation(
                "user_id and tenant_id are required".to_string(),
            ));
        }
        let now = self.clock.now();
        let mut tokens = self.tokens.list_active(user_id, tenant_id).await?;
        tokens.retain(|token| !token.is_past_expiry(now));
        Ok(tokens)
    }

    /// # Errors
    /// See [`AuditRecorder::query`].
    pub async fn query_audit_events(
        &self,
        query: &AuditQuery,
    ) -> Result<Vec<AuditEvent>, ElevationError> {
        self.audit.query(query).await
    }

    /// `RegisterCompliancePolicy`; returns the new policy version.
    ///
    /// # Errors
    /// Returns `Validation` for an invalid registration.
    pub fn register_compliance_policy(
        &self,
        registration: ComplianceRegistration,
    ) -> Result<i64, ElevationError> {
        self.policies.register_compliance_policy(registration)
    }

    /// One housekeeping pass over overdue tokens.
    ///
    /// Uses the same conditional transitions as the lazy path, so racing a
    /// concurrent `verify` or approval is harmless: whoever commits first wins
    /// and the other side sees a conflict.
    ///
    /// # Errors
    /// Returns `Storage` if the overdue scan fails. Failures on single tokens
    /// are logged and skipped.
    #[instrument(skip(self))]
    pub async fn sweep(&self) -> Result<SweepReport, ElevationError> {
        let now = self.clock.now();
        let overdue = self
            .tokens
            .list_overdue(now, self.config.sweep_batch_size)
            .await?;

        let mut report = SweepReport::default();
        for token in overdue {
            match token.status {
                ElevationStatus::Active => {
                    match authorizer::expire(self.tokens.as_ref(), &self.audit, &token, "sweeper")
                        .await
                    {
                        Ok((_, true)) => report.expired += 1,
                        Ok((_, false)) => {}
                        Err(err) => warn!(elevation_id = %token.id, "sweep expire failed: {err}"),
                    }
                }
                ElevationStatus::PendingApproval => {
                    match approval::time_out(self.tokens.as_ref(), &self.audit, &token).await {
                        Ok((_, true)) => report.timed_out += 1,
                        Ok((_, false)) => {}
                        Err(err) => warn!(elevation_id = %token.id, "sweep timeout failed: {err}"),
                    }
                }
                _ => {}
            }
        }

        match self.mfa.prune().await {
            Ok(pruned) => report.challenges_pruned = pruned,
            Err(err) => warn!("mfa challenge prune failed: {err}"),
        }

        if report != SweepReport::default() {
            debug!(
                expired = report.expired,
                timed_out = report.timed_out,
                challenges_pruned = report.challenges_pruned,
                "sweep finished"
            );
        }
        Ok(report)
    }

    /// Storage backend status for the health endpoint.
    pub async fn health(&self) -> StorageHealth {
        let healthy = match self.tokens.ping().await {
            Ok(()) => true,
            Err(err) => {
                warn!("token store ping failed: {err}");
                false
            }
        };
        StorageHealth {
            backend: self.tokens.backend(),
            healthy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.approval_ttl(), Duration::hours(24));
        assert_eq!(config.mfa_challenge_ttl(), Duration::minutes(5));
        assert_eq!(config.request_timeout_ms(), 5000);
        assert_eq!(config.sweep_batch_size(), 500);
    }

    #[test]
    fn zero_timeout_means_no_deadline() {
        let deadline = EngineConfig::new()
            .with_request_timeout_ms(0)
            .default_deadline();
        assert!(!deadline.is_elapsed());
    }

    #[tokio::test]
    async fn memory_engine_reports_healthy_storage() -> Result<()> {
        let engine = ElevationEngine::builder(EngineConfig::new()).build();
        let health = engine.health().await;
        assert!(health.healthy);
        assert_eq!(health.backend, "memory");
        assert_eq!(engine.sweep().await?, SweepReport::default());
        Ok(())
    }
}
