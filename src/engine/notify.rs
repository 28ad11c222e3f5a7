//! Outbound notifications: approval requests and MFA code delivery.
//!
//! Delivery mechanics (push, email, SMS) belong to whatever sits behind the
//! `Notifier`. The engine only hands over a message and waits, bounded by the
//! caller's deadline, for the collaborator to accept it.

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

use super::{BoxFuture, mfa::MfaMethod, types::ScopeSet};

#[derive(Clone, Debug)]
pub enum Notification {
    /// A request is waiting for an approver.
    ApprovalRequested {
        elevation_id: Uuid,
        user_id: String,
        tenant_id: String,
        market: String,
        scopes: ScopeSet,
        justification: String,
        emergency_requested: bool,
        approval_deadline: Option<DateTime<Utc>>,
    },
    /// A one-time code to deliver to the requesting user.
    MfaChallenge {
        challenge_id: Uuid,
        user_id: String,
        method: MfaMethod,
        code: SecretString,
        expires_at: DateTime<Utc>,
    },
}

impl Notification {
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ApprovalRequested { .. } => "approval_requested",
            Self::MfaChallenge { .. } => "mfa_challenge",
        }
    }
}

/// Notification delivery abstraction.
pub trait Notifier: Send + Sync {
    /// Hand the message to the delivery channel, or return an error.
    fn notify<'a>(&'a self, notification: &'a Notification) -> BoxFuture<'a, Result<()>>;
}

/// Local dev notifier that logs instead of delivering.
#[derive(Clone, Debug)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify<'a>(&'a self, notification: &'a Notification) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            match notification {
                Notification::ApprovalRequested {
                    elevation_id,
                    user_id,
                    tenant_id,
                    scopes,
                    ..
                } => {
                    info!(
                        %elevation_id,
                        user_id = %user_id,
                        tenant_id = %tenant_id,
                        scopes = scopes.len(),
                        "approval notification stub"
                    );
                }
                Notification::MfaChallenge {
                    challenge_id,
                    user_id,
                    method,
                    ..
                } => {
                    // The code itself stays out of the log.
                    info!(
                        %challenge_id,
                        user_id = %user_id,
                        method = method.as_str(),
                        "mfa challenge notification stub"
                    );
                }
            }
            Ok(())
        })
    }
}

/// Posts each notification as JSON to a webhook.
#[derive(Clone, Debug)]
pub struct WebhookNotifier {
    client: Client,
    url: Url,
}

impl WebhookNotifier {
    /// # Errors
    /// Returns an error if the URL is invalid or the HTTP client cannot be built.
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let url = Url::parse(url).with_context(|| format!("Invalid webhook URL: {url}"))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(anyhow!("Unsupported webhook scheme: {}", url.scheme()));
        }
        let client = Client::builder()
            .user_agent(crate::APP_USER_AGENT)
            .timeout(timeout)
            .build()?;
        Ok(Self { client, url })
    }
}

impl Notifier for WebhookNotifier {
    fn notify<'a>(&'a self, notification: &'a Notification) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let body = webhook_payload(notification);
            let response = self
                .client
                .post(self.url.clone())
                .json(&body)
                .send()
                .await
                .context("failed to deliver notification")?;

            if !response.status().is_success() {
                return Err(anyhow!(
                    "{} - {} delivering {}",
                    self.url,
                    response.status(),
                    notification.kind()
                ));
            }

            debug!(kind = notification.kind(), "notification delivered");
            Ok(())
        })
    }
}

fn webhook_payload(notification: &Notification) -> serde_json::Value {
    match notification {
        Notification::ApprovalRequested {
            elevation_id,
            user_id,
            tenant_id,
            market,
            scopes,
            justification,
            emergency_requested,
            approval_deadline,
        } => json!({
            "type": notification.kind(),
            "elevation_id": elevation_id,
            "user_id": user_id,
            "tenant_id": tenant_id,
            "market": market,
            "scopes": scopes,
            "justification": justification,
            "emergency_requested": emergency_requested,
            "approval_deadline": approval_deadline,
        }),
        Notification::MfaChallenge {
            challenge_id,
            user_id,
            method,
            code,
            expires_at,
        } => json!({
            "type": notification.kind(),
            "challenge_id": challenge_id,
            "user_id": user_id,
            "method": method.as_str(),
            "code": code.expose_secret(),
            "expires_at": expires_at,
        }),
    }
}
