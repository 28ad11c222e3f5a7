//! Domain types shared by every engine component.

use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{collections::BTreeSet, fmt};
use uuid::Uuid;

use super::{error::ElevationError, mfa::MfaMethod};

// `docker:system`, `figma:delete:file`, `git:push:protected`
static SCOPE_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^[a-z0-9_-]+(:[a-z0-9_.-]+)*$").ok());

static MARKET_PATTERN: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_-]*$").ok());

/// A string naming one sensitive capability.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Scope(String);

impl Scope {
    /// Parse and validate a scope string.
    ///
    /// # Errors
    /// Returns `ElevationError::Validation` if the scope is empty or malformed.
    pub fn parse(value: &str) -> Result<Self, ElevationError> {
        let value = value.trim();
        let valid = SCOPE_PATTERN
            .as_ref()
            .is_some_and(|pattern| pattern.is_match(value));
        if valid {
            Ok(Self(value.to_string()))
        } else {
            Err(ElevationError::Validation(format!("invalid scope: {value:?}")))
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Scope {
    type Error = ElevationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Scope> for String {
    fn from(scope: Scope) -> Self {
        scope.0
    }
}

pub type ScopeSet = BTreeSet<Scope>;

/// Parse a list of scope strings into a de-duplicated set.
///
/// # Errors
/// Returns `ElevationError::Validation` on the first malformed scope.
pub fn parse_scopes<I, S>(values: I) -> Result<ScopeSet, ElevationError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    values
        .into_iter()
        .map(|value| Scope::parse(value.as_ref()))
        .collect()
}

/// A regulatory jurisdiction, normalized to lowercase.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Market(String);

impl Market {
    /// Parse and normalize a market code.
    ///
    /// # Errors
    /// Returns `ElevationError::Validation` if the code is empty or malformed.
    pub fn parse(value: &str) -> Result<Self, ElevationError> {
        let normalized = value.trim().to_lowercase();
        let valid = MARKET_PATTERN
            .as_ref()
            .is_some_and(|pattern| pattern.is_match(&normalized));
        if valid {
            Ok(Self(normalized))
        } else {
            Err(ElevationError::Validation(format!(
                "invalid market: {value:?}"
            )))
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Market {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Market {
    type Error = ElevationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Market> for String {
    fn from(market: Market) -> Self {
        market.0
    }
}

/// Persisted lifecycle state of an elevation token.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElevationStatus {
    PendingApproval,
    Active,
    Denied,
    Expired,
    Revoked,
}

impl ElevationStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PendingApproval => "pending_approval",
            Self::Active => "active",
            Self::Denied => "denied",
            Self::Expired => "expired",
            Self::Revoked => "revoked",
        }
    }

    #[must_use]
    pub fn from_str(value: &str) -> Option<Self> {
        match value.trim() {
            "pending_approval" => Some(Self::PendingApproval),
            "active" => Some(Self::Active),
            "denied" => Some(Self::Denied),
            "expired" => Some(Self::Expired),
            "revoked" => Some(Self::Revoked),
            _ => None,
        }
    }

    /// Denied, Expired and Revoked never transition again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Denied | Self::Expired | Self::Revoked)
    }
}

impl fmt::Display for ElevationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ephemeral input to the request processor.
#[derive(Clone, Debug)]
pub struct ElevationRequest {
    pub user_id: String,
    pub tenant_id: String,
    pub market: Market,
    pub scopes: ScopeSet,
    pub justification: String,
    /// `None` asks for the policy ceiling.
    pub duration: Option<Duration>,
    pub emergency: bool,
    /// Set when resubmitting after completing an MFA challenge.
    pub mfa_challenge_id: Option<Uuid>,
    pub mfa_method: Option<MfaMethod>,
}

impl ElevationRequest {
    /// Stable digest binding an MFA challenge to this exact request.
    ///
    /// Justification and duration are excluded so a resubmission may reword
    /// them; identity, tenant, market, scopes and the emergency flag may not
    /// change.
    #[must_use]
    pub fn binding(&self) -> String {
        let scopes = self
            .scopes
            .iter()
            .map(Scope::as_str)
            .collect::<Vec<_>>()
            .join(",");
        let mut hasher = Sha256::new();
        hasher.update(self.user_id.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(self.tenant_id.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(self.market.as_str().as_bytes());
        hasher.update(b"\x1f");
        hasher.update(scopes.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(if self.emergency { b"1" } else { b"0" });
        hex(&hasher.finalize())
    }
}

/// The central entity: a scope-bound, time-boxed grant.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ElevationToken {
    pub id: Uuid,
    pub user_id: String,
    pub tenant_id: String,
    pub market: Market,
    pub granted_scopes: ScopeSet,
    pub status: ElevationStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub duration_seconds: i64,
    pub approval_deadline: Option<DateTime<Utc>>,
    pub approver_id: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub decision_reason: Option<String>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revoked_by: Option<String>,
    pub revocation_reason: Option<String>,
    pub justification: String,
    pub emergency_requested: bool,
    pub emergency_auto_approved: bool,
    #[serde(skip_serializing)]
    pub credential_hash: String,
    pub use_count: i64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub policy_version: i64,
}

impl ElevationToken {
    /// True once the wall clock has reached `expires_at`.
    #[must_use]
    pub fn is_past_expiry(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Remaining lifetime, clamped at zero.
    #[must_use]
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        let remaining = self.expires_at - now;
        if remaining < Duration::zero() {
            Duration::zero()
        } else {
            remaining
        }
    }

    /// Required scopes that were not granted, in order.
    #[must_use]
    pub fn missing_scopes(&self, required: &ScopeSet) -> Vec<Scope> {
        required
            .difference(&self.granted_scopes)
            .cloned()
            .collect()
    }
}

/// Result of a successful `request_elevation`.
#[derive(Debug)]
pub struct IssuedElevation {
    pub token: ElevationToken,
    /// Bearer credential; returned once and stored only as a digest.
    pub credential: SecretString,
    pub requires_mfa: bool,
    pub duration_clamped: bool,
    /// Approvers could not be notified; the token is still pending.
    pub notification_failed: bool,
}

/// Identity of the principal approving or denying a request.
#[derive(Clone, Debug)]
pub struct ApproverContext {
    pub approver_id: String,
    pub tenant_id: String,
}

/// Identity of the principal revoking a grant.
#[derive(Clone, Debug)]
pub struct RevokerContext {
    pub revoked_by: String,
    pub tenant_id: String,
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;

    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, byte| {
        let _ = write!(out, "{byte:02x}");
        out
    })
}
