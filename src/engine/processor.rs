//! Elevation request processor. The only component that creates tokens.
//!
//! Flow Overview:
//! 1) Validate the request; nothing is stored for an invalid request.
//! 2) Resolve the most restrictive policy for (market, tenant, scopes) from one
//!    snapshot and clamp the duration to its ceiling.
//! 3) If MFA is required, either issue a challenge bound to this request and
//!    return `MfaRequired`, or consume the verified challenge it carries.
//! 4) Decide the initial state: emergency bypass, pending approval, or active.
//! 5) Insert the token, write the audit trail, then notify approvers.

use chrono::Duration;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::{
    EngineConfig,
    audit::{AuditEventType, AuditRecorder, NewAuditEvent},
    clock::Clock,
    credential::generate_credential,
    deadline::Deadline,
    error::ElevationError,
    mfa::{MfaLevel, MfaMethod, MfaVerifier},
    notify::{Notification, Notifier},
    policy::{EffectivePolicy, PolicyStore},
    store::TokenStore,
    types::{ElevationRequest, ElevationStatus, ElevationToken, IssuedElevation, Scope},
};

const MAX_JUSTIFICATION_LEN: usize = 4096;

pub struct RequestProcessor {
    policies: Arc<PolicyStore>,
    tokens: Arc<dyn TokenStore>,
    mfa: Arc<dyn MfaVerifier>,
    notifier: Arc<dyn Notifier>,
    audit: AuditRecorder,
    clock: Arc<dyn Clock>,
    approval_ttl: Duration,
}

/// Initial state chosen for a new token.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Admission {
    EmergencyBypass,
    PendingApproval,
    Immediate,
}

fn admission(request: &ElevationRequest, effective: &EffectivePolicy) -> Admission {
    // The client flag is a request; only policy can grant the bypass.
    if request.emergency && effective.policy.allow_emergency_bypass {
        Admission::EmergencyBypass
    } else if effective.policy.requires_approval {
        Admission::PendingApproval
    } else {
        Admission::Immediate
    }
}

fn validate(request: &ElevationRequest) -> Result<(), ElevationError> {
    if request.user_id.trim().is_empty() {
        return Err(ElevationError::Validation("user_id is required".to_string()));
    }
    if request.tenant_id.trim().is_empty() {
        return Err(ElevationError::Validation(
            "tenant_id is required".to_string(),
        ));
    }
    if request.scopes.is_empty() {
        return Err(ElevationError::Validation(
            "at least one scope is required".to_string(),
        ));
    }
    let justification = request.justification.trim();
    if justification.is_empty() {
        return Err(ElevationError::Validation(
            "justification is required".to_string(),
        ));
    }
    if justification.len() > MAX_JUSTIFICATION_LEN {
        return Err(ElevationError::Validation(
            "justification is too long".to_string(),
        ));
    }
    if request
        .duration
        .is_some_and(|duration| duration <= Duration::zero())
    {
        return Err(ElevationError::Validation(
            "duration must be positive".to_string(),
        ));
    }
    Ok(())
}

/// Requested duration clamped to the policy ceiling.
///
/// # Errors
/// Returns `ElevationError::DurationExceedsPolicy` only when the ceiling is zero.
pub fn clamp_duration(
    requested: Option<Duration>,
    max_minutes: i64,
) -> Result<(Duration, bool), ElevationError> {
    if max_minutes <= 0 {
        return Err(ElevationError::DurationExceedsPolicy {
            requested_minutes: requested.map_or(0, |d| d.num_minutes()),
            max_minutes: 0,
        });
    }
    let ceiling = Duration::minutes(max_minutes);
    match requested {
        None => Ok((ceiling, false)),
        Some(duration) if duration > ceiling => Ok((ceiling, true)),
        Some(duration) => Ok((duration, false)),
    }
}

fn scope_list(scopes: impl IntoIterator<Item = impl AsRef<str>>) -> Value {
    Value::from(
        scopes
            .into_iter()
            .map(|scope| Value::from(scope.as_ref()))
            .collect::<Vec<_>>(),
    )
}

impl RequestProcessor {
    #[must_use]
    pub fn new(
        config: &EngineConfig,
        policies: Arc<PolicyStore>,
        tokens: Arc<dyn TokenStore>,
        mfa: Arc<dyn MfaVerifier>,
        notifier: Arc<dyn Notifier>,
        audit: AuditRecorder,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            policies,
            tokens,
            mfa,
            notifier,
            audit,
            clock,
            approval_ttl: config.approval_ttl(),
        }
    }

    /// `RequestElevation(request)`.
    ///
    /// # Errors
    /// Returns `Validation`, `DurationExceedsPolicy`, `MfaRequired`,
    /// `MfaChallengeFailed`, `Timeout` or `Storage`.
    #[instrument(
        skip(self, request, deadline),
        fields(
            user_id = %request.user_id,
            tenant_id = %request.tenant_id,
            market = %request.market,
            emergency = request.emergency
        )
    )]
    pub async fn request_elevation(
        &self,
        request: ElevationRequest,
        deadline: Deadline,
    ) -> Result<IssuedElevation, ElevationError> {
        if deadline.is_elapsed() {
            return Err(ElevationError::Timeout {
                operation: "request elevation",
                elevation_id: None,
            });
        }
        validate(&request)?;

        let snapshot = self.policies.snapshot();
        let effective = snapshot.resolve(&request.market, &request.tenant_id, &request.scopes);
        let (duration, duration_clamped) =
            clamp_duration(request.duration, effective.policy.max_duration_minutes)?;
        if duration_clamped {
            info!(
                requested_minutes = request.duration.map(|d| d.num_minutes()),
                max_minutes = effective.policy.max_duration_minutes,
                "requested duration clamped to policy ceiling"
            );
        }

        if effective.policy.requires_mfa {
            self.check_mfa(&request, &effective, deadline).await?;
        }

        let admission = admission(&request, &effective);
        let now = self.clock.now();
        let (credential, credential_hash) = generate_credential()?;
        let (status, approval_deadline) = match admission {
            Admission::EmergencyBypass | Admission::Immediate => (ElevationStatus::Active, None),
            Admission::PendingApproval => (
                ElevationStatus::PendingApproval,
                Some(now + self.approval_ttl),
            ),
        };

        let token = ElevationToken {
            id: Uuid::new_v4(),
            user_id: request.user_id.trim().to_string(),
            tenant_id: request.tenant_id.trim().to_string(),
            market: request.market.clone(),
            granted_scopes: request.scopes.clone(),
            status,
            created_at: now,
            expires_at: now + duration,
            duration_seconds: duration.num_seconds(),
            approval_deadline,
            approver_id: None,
            approved_at: None,
            decision_reason: None,
            revoked_at: None,
            revoked_by: None,
            revocation_reason: None,
            justification: request.justification.trim().to_string(),
            emergency_requested: request.emergency,
            emergency_auto_approved: admission == Admission::EmergencyBypass,
            credential_hash,
            use_count: 0,
            last_used_at: None,
            policy_version: effective.version,
        };

        self.tokens.insert(&token).await?;

        // Past this point the token exists; the credential must reach the caller.
        let approvers_notified = if admission == Admission::PendingApproval {
            Some(self.notify_approvers(&token, deadline).await)
        } else {
            None
        };
        self.record_issue(
            &token,
            &effective,
            duration_clamped,
            admission,
            approvers_notified,
        )
        .await?;

        info!(
            elevation_id = %token.id,
            status = token.status.as_str(),
            emergency_auto_approved = token.emergency_auto_approved,
            "elevation token issued"
        );

        Ok(IssuedElevation {
            token,
            credential,
            requires_mfa: effective.policy.requires_mfa,
            duration_clamped,
            notification_failed: approvers_notified == Some(false),
        })
    }

    async fn check_mfa(
        &self,
        request: &ElevationRequest,
        effective: &EffectivePolicy,
        deadline: Deadline,
    ) -> Result<(), ElevationError> {
        let minimum = effective.policy.minimum_mfa_level.max(MfaLevel::Basic);
        let binding = request.binding();

        let Some(challenge_id) = request.mfa_challenge_id else {
            let method = request
                .mfa_method
                .filter(|method| method.level() >= minimum)
                .unwrap_or_else(|| MfaMethod::weakest_for(minimum));
            let challenge = self
                .mfa
                .generate(&request.user_id, &binding, method, deadline)
                .await?;
            self.audit
                .record(
                    NewAuditEvent::new(
                        AuditEventType::MfaChallengeIssued,
                        &request.user_id,
                        &request.tenant_id,
                        &request.market,
                    )
                    .meta("challenge_id", challenge.id.to_string())
                    .meta("method", method.as_str())
                    .meta("scopes", scope_list(request.scopes.iter().map(Scope::as_str)))
                    .meta("policy_version", effective.version),
                )
                .await?;
            return Err(ElevationError::MfaRequired {
                challenge_id: challenge.id,
                method,
            });
        };

        let failure = |reason: String| {
            NewAuditEvent::new(
                AuditEventType::MfaFailed,
                &request.user_id,
                &request.tenant_id,
                &request.market,
            )
            .meta("challenge_id", challenge_id.to_string())
            .meta("reason", reason)
        };

        let challenge = match self
            .mfa
            .consume(challenge_id, &request.user_id, &binding)
            .await
        {
            Ok(challenge) => challenge,
            Err(err) => {
                warn!(%challenge_id, "mfa challenge rejected: {err}");
                self.audit.record(failure(err.to_string())).await?;
                return Err(err);
            }
        };

        if challenge.method.level() < minimum {
            let reason = format!(
                "method {} is below the required {} level",
                challenge.method.as_str(),
                minimum.as_str()
            );
            self.audit.record(failure(reason.clone())).await?;
            return Err(ElevationError::MfaChallengeFailed(reason));
        }

        self.audit
            .record(
                NewAuditEvent::new(
                    AuditEventType::MfaVerified,
                    &request.user_id,
                    &request.tenant_id,
                    &request.market,
                )
                .meta("challenge_id", challenge_id.to_string())
                .meta("method", challenge.method.as_str()),
            )
            .await?;
        Ok(())
    }

    async fn record_issue(
        &self,
        token: &ElevationToken,
        effective: &EffectivePolicy,
        duration_clamped: bool,
        admission: Admission,
        approvers_notified: Option<bool>,
    ) -> Result<(), ElevationError> {
        let scopes = scope_list(token.granted_scopes.iter().map(Scope::as_str));
        let base = |event_type| {
            NewAuditEvent::new(event_type, &token.user_id, &token.tenant_id, &token.market)
                .elevation(token.id)
                .meta("policy_version", token.policy_version)
        };

        self.audit
            .record(
                base(AuditEventType::ElevationRequested)
                    .meta("scopes", scopes.clone())
                    .meta("justification", token.justification.clone())
                    .meta("duration_seconds", token.duration_seconds)
                    .meta("duration_clamped", duration_clamped)
                    .meta("emergency_requested", token.emergency_requested)
                    .meta("policy_fallback", effective.fallback)
                    .meta("status", token.status.as_str())
                    .meta("approvers_notified", approvers_notified),
            )
            .await?;

        match admission {
            Admission::EmergencyBypass => {
                self.audit
                    .record(
                        base(AuditEventType::EmergencyAccessGranted)
                            .meta("scopes", scopes)
                            .meta("justification", token.justification.clone())
                            .meta("expires_at", token.expires_at.to_rfc3339()),
                    )
                    .await?;
                warn!(
                    elevation_id = %token.id,
                    user_id = %token.user_id,
                    tenant_id = %token.tenant_id,
                    "emergency elevation auto-approved"
                );
            }
            Admission::Immediate => {
                self.audit
                    .record(
                        base(AuditEventType::ElevationApproved)
                            .meta("approver_id", Value::Null)
                            .meta("automatic", true)
                            .meta("scopes", scopes),
                    )
                    .await?;
            }
            Admission::PendingApproval => {}
        }
        Ok(())
    }

    /// Hand the approval request to the notifier. `false` when delivery failed
    /// or outlived the caller's deadline; the token stays pending either way.
    async fn notify_approvers(&self, token: &ElevationToken, deadline: Deadline) -> bool {
        let notification = Notification::ApprovalRequested {
            elevation_id: token.id,
            user_id: token.user_id.clone(),
            tenant_id: token.tenant_id.clone(),
            market: token.market.to_string(),
            scopes: token.granted_scopes.clone(),
            justification: token.justification.clone(),
            emergency_requested: token.emergency_requested,
            approval_deadline: token.approval_deadline,
        };

        let delivery = deadline
            .run("approval notification", async {
                Ok(self.notifier.notify(&notification).await)
            })
            .await;

        match delivery {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                warn!(elevation_id = %token.id, "approval notification failed: {err:#}");
                false
            }
            Err(err) => {
                warn!(elevation_id = %token.id, "approval notification not delivered: {err}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{
        policy::{CompliancePolicy, ComplianceProfile},
        types::{Market, parse_scopes},
    };
    use anyhow::Result;

    fn effective(policy: CompliancePolicy) -> EffectivePolicy {
        EffectivePolicy {
            policy,
            compliance: ComplianceProfile {
                framework: "test".to_string(),
                retention_years: 1,
            },
            version: 1,
            fallback: false,
        }
    }

    fn request(emergency: bool) -> Result<ElevationRequest> {
        Ok(ElevationRequest {
            user_id: "user-1".to_string(),
            tenant_id: "tenant-1".to_string(),
            market: Market::parse("angola")?,
            scopes: parse_scopes(["docker:system"])?,
            justification: "incident".to_string(),
            duration: None,
            emergency,
            mfa_challenge_id: None,
            mfa_method: None,
        })
    }

    #[test]
    fn clamp_caps_to_ceiling() -> Result<()> {
        assert_eq!(
            clamp_duration(Some(Duration::hours(3)), 60)?,
            (Duration::minutes(60), true)
        );
        assert_eq!(
            clamp_duration(Some(Duration::minutes(15)), 60)?,
            (Duration::minutes(15), false)
        );
        assert_eq!(clamp_duration(None, 45)?, (Duration::minutes(45), false));
        Ok(())
    }

    #[test]
    fn zero_ceiling_rejects() {
        assert!(matches!(
            clamp_duration(Some(Duration::minutes(5)), 0),
            Err(ElevationError::DurationExceedsPolicy {
                requested_minutes: 5,
                max_minutes: 0
            })
        ));
    }

    #[test]
    fn emergency_flag_alone_never_grants() -> Result<()> {
        let strict = effective(CompliancePolicy {
            requires_approval: true,
            requires_mfa: false,
            minimum_mfa_level: MfaLevel::None,
            max_duration_minutes: 30,
            allow_emergency_bypass: false,
        });
        assert_eq!(admission(&request(true)?, &strict), Admission::PendingApproval);

        let bypass = effective(CompliancePolicy {
            allow_emergency_bypass: true,
            ..strict.policy.clone()
        });
        assert_eq!(admission(&request(true)?, &bypass), Admission::EmergencyBypass);
        assert_eq!(admission(&request(false)?, &bypass), Admission::PendingApproval);
        Ok(())
    }

    #[test]
    fn validation_rejects_empty_fields() -> Result<()> {
        let mut empty_scopes = request(false)?;
        empty_scopes.scopes.clear();
        assert!(matches!(
            validate(&empty_scopes),
            Err(ElevationError::Validation(_))
        ));

        let mut blank = request(false)?;
        blank.justification = "   ".to_string();
        assert!(matches!(validate(&blank), Err(ElevationError::Validation(_))));

        let mut negative = request(false)?;
        negative.duration = Some(Duration::minutes(-1));
        assert!(matches!(
            validate(&negative),
            Err(ElevationError::Validation(_))
        ));
        Ok(())
    }
}
