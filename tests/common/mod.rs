#![allow(dead_code)]

use anyhow::{Context, Result, anyhow};
use chrono::{TimeZone, Utc};
use elevation::engine::{
    BoxFuture, Deadline, ElevationEngine, ElevationError, ElevationRequest, EngineConfig,
    IssuedElevation, ManualClock, Market, VerificationRequest,
    notify::{Notification, Notifier},
    types::parse_scopes,
};
use secrecy::{ExposeSecret, SecretString};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use uuid::Uuid;

pub const ANGOLA_TENANT: &str = "tenant-angola-123";
pub const MOCAMBIQUE_TENANT: &str = "tenant-mocambique-456";

/// Keeps every MFA code and approval request instead of delivering them.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    codes: Mutex<HashMap<Uuid, String>>,
    approvals: Mutex<Vec<Uuid>>,
    approval_delay: Option<Duration>,
}

impl RecordingNotifier {
    /// Approval requests take `delay` to be accepted; MFA codes are immediate.
    pub fn with_approval_delay(delay: Duration) -> Self {
        Self {
            approval_delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn code_for(&self, challenge_id: Uuid) -> Result<String> {
        self.codes
            .lock()
            .map_err(|_| anyhow!("notifier lock poisoned"))?
            .get(&challenge_id)
            .cloned()
            .with_context(|| format!("no code delivered for challenge {challenge_id}"))
    }

    pub fn approval_requests(&self) -> Result<Vec<Uuid>> {
        Ok(self
            .approvals
            .lock()
            .map_err(|_| anyhow!("notifier lock poisoned"))?
            .clone())
    }
}

impl Notifier for RecordingNotifier {
    fn notify<'a>(&'a self, notification: &'a Notification) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            match notification {
                Notification::MfaChallenge {
                    challenge_id, code, ..
                } => {
                    self.codes
                        .lock()
                        .map_err(|_| anyhow!("notifier lock poisoned"))?
                        .insert(*challenge_id, code.expose_secret().to_string());
                }
                Notification::ApprovalRequested { elevation_id, .. } => {
                    if let Some(delay) = self.approval_delay {
                        tokio::time::sleep(delay).await;
                    }
                    self.approvals
                        .lock()
                        .map_err(|_| anyhow!("notifier lock poisoned"))?
                        .push(*elevation_id);
                }
            }
            Ok(())
        })
    }
}

pub struct Harness {
    pub engine: Arc<ElevationEngine>,
    pub notifier: Arc<RecordingNotifier>,
    pub clock: ManualClock,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::new())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self::with_notifier(config, RecordingNotifier::default())
    }

    pub fn with_notifier(config: EngineConfig, notifier: RecordingNotifier) -> Self {
        let notifier = Arc::new(notifier);
        let clock = ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0)
                .single()
                .unwrap_or_else(Utc::now),
        );
        let engine = ElevationEngine::builder(config)
            .with_notifier(notifier.clone())
            .with_clock(Arc::new(clock.clone()))
            .build();
        Self {
            engine: Arc::new(engine),
            notifier,
            clock,
        }
    }

    /// Run a request through the MFA round trip when policy asks for one.
    pub async fn issue(&self, request: ElevationRequest) -> Result<IssuedElevation> {
        match self
            .engine
            .request_elevation(request.clone(), Deadline::none())
            .await
        {
            Ok(issued) => Ok(issued),
            Err(ElevationError::MfaRequired { challenge_id, .. }) => {
                let code = self.notifier.code_for(challenge_id)?;
                let verified = self
                    .engine
                    .verify_mfa_challenge(challenge_id, &code, Deadline::none())
                    .await?;
                anyhow::ensure!(verified, "delivered code was rejected");
                Ok(self
                    .engine
                    .request_elevation(
                        ElevationRequest {
                            mfa_challenge_id: Some(challenge_id),
                            ..request
                        },
                        Deadline::none(),
                    )
                    .await?)
            }
            Err(err) => Err(err.into()),
        }
    }
}

pub fn request(
    user_id: &str,
    tenant_id: &str,
    market: &str,
    scopes: &[&str],
) -> Result<ElevationRequest> {
    Ok(ElevationRequest {
        user_id: user_id.to_string(),
        tenant_id: tenant_id.to_string(),
        market: Market::parse(market)?,
        scopes: parse_scopes(scopes)?,
        justification: "INC-4711 cleanup".to_string(),
        duration: None,
        emergency: false,
        mfa_challenge_id: None,
        mfa_method: None,
    })
}

pub fn verification(
    credential: &SecretString,
    tenant_id: &str,
    market: &str,
    scopes: &[&str],
) -> Result<VerificationRequest> {
    Ok(VerificationRequest {
        credential: credential.clone(),
        required_scopes: parse_scopes(scopes)?,
        caller_tenant: tenant_id.to_string(),
        caller_market: Market::parse(market)?,
        operation: format!("test {}", scopes.join(" ")),
        resource_path: None,
    })
}
