//! Multi-factor challenges bound to a single elevation request.
//!
//! Flow Overview:
//! 1) The processor asks for a challenge when policy requires MFA and the
//!    request carries none; the challenge records the request binding digest.
//! 2) The user answers it through `verify`.
//! 3) The resubmitted request presents the challenge id; `consume` checks the
//!    binding and marks the challenge used so it cannot serve another request.
//!
//! Security boundaries:
//! - Codes are kept only as SHA-256 digests.
//! - Five wrong answers expire the challenge.

use chrono::{DateTime, Duration, Utc};
use rand::{Rng, rngs::OsRng};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    BoxFuture,
    clock::Clock,
    deadline::Deadline,
    error::ElevationError,
    notify::{Notification, Notifier},
    types::hex,
};

const DEFAULT_CHALLENGE_TTL_SECONDS: i64 = 5 * 60;
const MAX_ATTEMPTS: u32 = 5;
const CODE_DIGITS: u32 = 6;

/// Strength of a factor. Ordered weakest first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MfaLevel {
    None,
    Basic,
    Standard,
    PhishingResistant,
}

impl MfaLevel {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Basic => "basic",
            Self::Standard => "standard",
            Self::PhishingResistant => "phishing_resistant",
        }
    }

    #[must_use]
    pub fn from_str(value: &str) -> Option<Self> {
        match value.trim() {
            "none" => Some(Self::None),
            "basic" => Some(Self::Basic),
            "standard" => Some(Self::Standard),
            "phishing_resistant" => Some(Self::PhishingResistant),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MfaMethod {
    Sms,
    Email,
    Push,
    Totp,
    Webauthn,
}

impl MfaMethod {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sms => "sms",
            Self::Email => "email",
            Self::Push => "push",
            Self::Totp => "totp",
            Self::Webauthn => "webauthn",
        }
    }

    #[must_use]
    pub fn from_str(value: &str) -> Option<Self> {
        match value.trim() {
            "sms" => Some(Self::Sms),
            "email" => Some(Self::Email),
            "push" => Some(Self::Push),
            "totp" => Some(Self::Totp),
            "webauthn" => Some(Self::Webauthn),
            _ => None,
        }
    }

    #[must_use]
    pub const fn level(self) -> MfaLevel {
        match self {
            Self::Sms | Self::Email => MfaLevel::Basic,
            Self::Push | Self::Totp => MfaLevel::Standard,
            Self::Webauthn => MfaLevel::PhishingResistant,
        }
    }

    /// Weakest method that still satisfies `minimum`.
    #[must_use]
    pub const fn weakest_for(minimum: MfaLevel) -> Self {
        match minimum {
            MfaLevel::None | MfaLevel::Basic => Self::Sms,
            MfaLevel::Standard => Self::Totp,
            MfaLevel::PhishingResistant => Self::Webauthn,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeStatus {
    Pending,
    Verified,
    Expired,
}

#[derive(Clone, Debug, Serialize)]
pub struct MfaChallenge {
    pub id: Uuid,
    pub user_id: String,
    /// Digest of the elevation request this challenge belongs to.
    pub request_binding: String,
    pub method: MfaMethod,
    pub status: ChallengeStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub attempts: u32,
    pub consumed_at: Option<DateTime<Utc>>,
}

/// Issues and checks challenges.
pub trait MfaVerifier: Send + Sync {
    /// Issue a challenge for `user_id`, bound to one request, and dispatch the code.
    fn generate<'a>(
        &'a self,
        user_id: &'a str,
        request_binding: &'a str,
        method: MfaMethod,
        deadline: Deadline,
    ) -> BoxFuture<'a, Result<MfaChallenge, ElevationError>>;

    /// Check a response. `Ok(false)` is a wrong answer; errors are unknown or
    /// expired challenges.
    fn verify<'a>(
        &'a self,
        challenge_id: Uuid,
        response: &'a str,
        deadline: Deadline,
    ) -> BoxFuture<'a, Result<bool, ElevationError>>;

    /// Spend a verified challenge on the request it was issued for.
    fn consume<'a>(
        &'a self,
        challenge_id: Uuid,
        user_id: &'a str,
        request_binding: &'a str,
    ) -> BoxFuture<'a, Result<MfaChallenge, ElevationError>>;

    /// Drop challenges that can no longer be used. Returns how many were removed.
    fn prune(&self) -> BoxFuture<'_, Result<usize, ElevationError>>;
}

struct StoredChallenge {
    challenge: MfaChallenge,
    code_hash: String,
}

/// In-process verifier generating numeric one-time codes.
pub struct MemoryMfaVerifier {
    challenges: RwLock<HashMap<Uuid, StoredChallenge>>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl MemoryMfaVerifier {
    #[must_use]
    pub fn new(notifier: Arc<dyn Notifier>, clock: Arc<dyn Clock>) -> Self {
        Self {
            challenges: RwLock::new(HashMap::new()),
            notifier,
            clock,
            ttl: Duration::seconds(DEFAULT_CHALLENGE_TTL_SECONDS),
        }
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    fn generate_code() -> String {
        let max = 10_u32.pow(CODE_DIGITS);
        format!("{:0width$}", OsRng.gen_range(0..max), width = CODE_DIGITS as usize)
    }

    fn lock_error() -> ElevationError {
        ElevationError::Storage("mfa challenge table lock poisoned".to_string())
    }

    /// Number of challenges currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.challenges.read().map_or(0, |challenges| challenges.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn remove_spent(challenges: &mut HashMap<Uuid, StoredChallenge>, now: DateTime<Utc>) -> usize {
    let before = challenges.len();
    challenges.retain(|_, stored| {
        let challenge = &stored.challenge;
        challenge.consumed_at.is_none()
            && challenge.status != ChallengeStatus::Expired
            && now < challenge.expires_at
    });
    before - challenges.len()
}

fn hash_code(code: &str) -> String {
    hex(&Sha256::digest(code.trim().as_bytes()))
}

impl MfaVerifier for MemoryMfaVerifier {
    fn generate<'a>(
        &'a self,
        user_id: &'a str,
        request_binding: &'a str,
        method: MfaMethod,
        deadline: Deadline,
    ) -> BoxFuture<'a, Result<MfaChallenge, ElevationError>> {
        Box::pin(async move {
            let now = self.clock.now();
            let code = Self::generate_code();
            let challenge = MfaChallenge {
                id: Uuid::new_v4(),
                user_id: user_id.to_string(),
                request_binding: request_binding.to_string(),
                method,
                status: ChallengeStatus::Pending,
                created_at: now,
                expires_at: now + self.ttl,
                attempts: 0,
                consumed_at: None,
            };

            {
                let mut challenges = self.challenges.write().map_err(|_| Self::lock_error())?;
                remove_spent(&mut challenges, now);
                challenges.insert(
                    challenge.id,
                    StoredChallenge {
                        challenge: challenge.clone(),
                        code_hash: hash_code(&code),
                    },
                );
            }

            let notification = Notification::MfaChallenge {
                challenge_id: challenge.id,
                user_id: challenge.user_id.clone(),
                method,
                code: SecretString::from(code),
                expires_at: challenge.expires_at,
            };
            deadline
                .run("mfa challenge delivery", async {
                    self.notifier.notify(&notification).await.map_err(|err| {
                        ElevationError::MfaChallengeFailed(format!("delivery failed: {err}"))
                    })
                })
                .await?;

            debug!(challenge_id = %challenge.id, method = method.as_str(), "mfa challenge issued");
            Ok(challenge)
        })
    }

    fn verify<'a>(
        &'a self,
        challenge_id: Uuid,
        response: &'a str,
        deadline: Deadline,
    ) -> BoxFuture<'a, Result<bool, ElevationError>> {
        Box::pin(async move {
            if deadline.is_elapsed() {
                return Err(ElevationError::Timeout {
                    operation: "mfa verification",
                    elevation_id: None,
                });
            }
            let now = self.clock.now();
            let mut challenges = self.challenges.write().map_err(|_| Self::lock_error())?;
            let stored = challenges
                .get_mut(&challenge_id)
                .ok_or_else(|| ElevationError::MfaChallengeFailed("unknown challenge".to_string()))?;

            if stored.challenge.status == ChallengeStatus::Pending
                && now >= stored.challenge.expires_at
            {
                stored.challenge.status = ChallengeStatus::Expired;
            }

            match stored.challenge.status {
                ChallengeStatus::Expired => Err(ElevationError::MfaChallengeFailed(
                    "challenge expired".to_string(),
                )),
                ChallengeStatus::Verified => Ok(hash_code(response) == stored.code_hash),
                ChallengeStatus::Pending => {
                    if hash_code(response) == stored.code_hash {
                        stored.challenge.status = ChallengeStatus::Verified;
                        return Ok(true);
                    }
                    stored.challenge.attempts += 1;
                    if stored.challenge.attempts >= MAX_ATTEMPTS {
                        warn!(%challenge_id, "mfa challenge locked after repeated failures");
                        stored.challenge.status = ChallengeStatus::Expired;
                    }
                    Ok(false)
                }
            }
        })
    }

    fn consume<'a>(
        &'a self,
        challenge_id: Uuid,
        user_id: &'a str,
        request_binding: &'a str,
    ) -> BoxFuture<'a, Result<MfaChallenge, ElevationError>> {
        Box::pin(async move {
            let now = self.clock.now();
            let mut challenges = self.challenges.write().map_err(|_| Self::lock_error())?;
            let stored = challenges
                .get_mut(&challenge_id)
                .ok_or_else(|| ElevationError::MfaChallengeFailed("unknown challenge".to_string()))?;
            let challenge = &mut stored.challenge;

            if challenge.user_id != user_id || challenge.request_binding != request_binding {
                return Err(ElevationError::MfaChallengeFailed(
                    "challenge was issued for a different request".to_string(),
                ));
            }
            if challenge.consumed_at.is_some() {
                return Err(ElevationError::MfaChallengeFailed(
                    "challenge already used".to_string(),
                ));
            }
            if now >= challenge.expires_at {
                challenge.status = ChallengeStatus::Expired;
            }
            match challenge.status {
                ChallengeStatus::Verified => {
                    challenge.consumed_at = Some(now);
                    Ok(challenge.clone())
                }
                ChallengeStatus::Pending => Err(ElevationError::MfaChallengeFailed(
                    "challenge not verified".to_string(),
                )),
                ChallengeStatus::Expired => Err(ElevationError::MfaChallengeFailed(
                    "challenge expired".to_string(),
                )),
            }
        })
    }

    fn prune(&self) -> BoxFuture<'_, Result<usize, ElevationError>> {
        Box::pin(async move {
            let now = self.clock.now();
            let mut challenges = self.challenges.write().map_err(|_| Self::lock_error())?;
            let removed = remove_spent(&mut challenges, now);
            if removed > 0 {
                debug!(removed, "pruned mfa challenges");
            }
            Ok(removed)
        })
    }
}
