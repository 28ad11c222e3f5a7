//! Compliance policy store.
//!
//! Flow Overview:
//! 1) The store is constructed once at start-up from the built-in market table
//!    or a JSON snapshot file.
//! 2) Every evaluation takes `snapshot()` and reads only that `Arc`, so an
//!    administrative write never changes a decision halfway through.
//! 3) Administrative writes (`register_compliance_policy`, scope overrides,
//!    tenant classes, namespaces) clone the current snapshot, apply the change,
//!    bump the version and swap the pointer.
//!
//! Lookup order for one scope: (market, scope), then (market, tenant class),
//! then the market default, then the `default` market. A request naming
//! several scopes is evaluated under the most restrictive merge of their
//! policies.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    path::Path,
    sync::{Arc, PoisonError, RwLock},
};
use tracing::{info, warn};

use super::{
    error::ElevationError,
    mfa::MfaLevel,
    types::{Market, Scope, ScopeSet},
};

/// Market used when a request names a market with no registered policy.
pub const DEFAULT_MARKET: &str = "default";

const DEFAULT_FRAMEWORK: &str = "internal";
const DEFAULT_RETENTION_YEARS: u32 = 7;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompliancePolicy {
    pub requires_approval: bool,
    pub requires_mfa: bool,
    #[serde(default = "default_mfa_level")]
    pub minimum_mfa_level: MfaLevel,
    pub max_duration_minutes: i64,
    #[serde(default)]
    pub allow_emergency_bypass: bool,
}

fn default_mfa_level() -> MfaLevel {
    MfaLevel::Standard
}

impl CompliancePolicy {
    /// Approval and MFA required, short ceiling, no bypass.
    #[must_use]
    pub const fn restrictive() -> Self {
        Self {
            requires_approval: true,
            requires_mfa: true,
            minimum_mfa_level: MfaLevel::Standard,
            max_duration_minutes: 30,
            allow_emergency_bypass: false,
        }
    }

    /// Field-wise most restrictive combination of two policies.
    #[must_use]
    pub fn merge_restrictive(&self, other: &Self) -> Self {
        Self {
            requires_approval: self.requires_approval || other.requires_approval,
            requires_mfa: self.requires_mfa || other.requires_mfa,
            minimum_mfa_level: self.minimum_mfa_level.max(other.minimum_mfa_level),
            max_duration_minutes: self.max_duration_minutes.min(other.max_duration_minutes),
            allow_emergency_bypass: self.allow_emergency_bypass && other.allow_emergency_bypass,
        }
    }

    fn validate(&self, context: &str) -> Result<()> {
        if self.max_duration_minutes < 0 {
            anyhow::bail!("{context}: max_duration_minutes must not be negative");
        }
        Ok(())
    }
}

/// Regulatory profile stamped onto audit events.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ComplianceProfile {
    pub framework: String,
    pub retention_years: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketPolicy {
    pub framework: String,
    pub retention_years: u32,
    pub default: CompliancePolicy,
    #[serde(default)]
    pub scopes: BTreeMap<Scope, CompliancePolicy>,
    #[serde(default)]
    pub tenant_classes: BTreeMap<String, CompliancePolicy>,
}

impl MarketPolicy {
    fn new(framework: &str, retention_years: u32, default: CompliancePolicy) -> Self {
        Self {
            framework: framework.to_string(),
            retention_years,
            default,
            scopes: BTreeMap::new(),
            tenant_classes: BTreeMap::new(),
        }
    }

    #[must_use]
    fn with_scope(mut self, scope: &str, policy: CompliancePolicy) -> Self {
        if let Ok(scope) = Scope::parse(scope) {
            self.scopes.insert(scope, policy);
        }
        self
    }

    #[must_use]
    fn with_tenant_class(mut self, class: &str, policy: CompliancePolicy) -> Self {
        self.tenant_classes.insert(class.to_string(), policy);
        self
    }

    fn profile(&self) -> ComplianceProfile {
        ComplianceProfile {
            framework: self.framework.clone(),
            retention_years: self.retention_years,
        }
    }
}

/// An immutable, versioned view of every policy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySnapshot {
    #[serde(default = "initial_version")]
    pub version: i64,
    pub markets: BTreeMap<Market, MarketPolicy>,
    /// Scopes that skip the market check. The tenant check still applies.
    #[serde(default)]
    pub global_scopes: ScopeSet,
    /// tenant id -> tenant class
    #[serde(default)]
    pub tenant_classes: BTreeMap<String, String>,
    /// tenant id -> allowed resource path prefixes
    #[serde(default)]
    pub tenant_namespaces: BTreeMap<String, Vec<String>>,
}

fn initial_version() -> i64 {
    1
}

/// Outcome of evaluating a scope set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EffectivePolicy {
    pub policy: CompliancePolicy,
    pub compliance: ComplianceProfile,
    pub version: i64,
    /// True when the requested market had no policy and the default market was used.
    pub fallback: bool,
}

impl PolicySnapshot {
    /// Built-in policies for the markets served out of the box.
    #[must_use]
    pub fn builtin() -> Self {
        let mut markets = BTreeMap::new();
        let mut insert = |code: &str, policy: MarketPolicy| {
            if let Ok(market) = Market::parse(code) {
                markets.insert(market, policy);
            }
        };

        insert(
            "angola",
            MarketPolicy::new(
                "BNA",
                10,
                CompliancePolicy {
                    requires_approval: true,
                    requires_mfa: true,
                    minimum_mfa_level: MfaLevel::Standard,
                    max_duration_minutes: 60,
                    allow_emergency_bypass: false,
                },
            )
            .with_scope(
                "docker:system",
                CompliancePolicy {
                    requires_approval: true,
                    requires_mfa: true,
                    minimum_mfa_level: MfaLevel::Standard,
                    max_duration_minutes: 30,
                    allow_emergency_bypass: false,
                },
            )
            .with_tenant_class(
                "critical-infrastructure",
                CompliancePolicy {
                    requires_approval: true,
                    requires_mfa: true,
                    minimum_mfa_level: MfaLevel::PhishingResistant,
                    max_duration_minutes: 30,
                    allow_emergency_bypass: true,
                },
            ),
        );

        insert(
            "brasil",
            MarketPolicy::new(
                "LGPD",
                5,
                CompliancePolicy {
                    requires_approval: true,
                    requires_mfa: true,
                    minimum_mfa_level: MfaLevel::Standard,
                    max_duration_minutes: 120,
                    allow_emergency_bypass: true,
                },
            )
            .with_scope(
                "figma:delete:file",
                CompliancePolicy {
                    requires_approval: false,
                    requires_mfa: true,
                    minimum_mfa_level: MfaLevel::Basic,
                    max_duration_minutes: 30,
                    allow_emergency_bypass: true,
                },
            ),
        );

        insert(
            "mocambique",
            MarketPolicy::new(
                "Banco de Moçambique",
                10,
                CompliancePolicy {
                    requires_approval: false,
                    requires_mfa: true,
                    minimum_mfa_level: MfaLevel::Basic,
                    max_duration_minutes: 120,
                    allow_emergency_bypass: true,
                },
            )
            .with_scope(
                "figma:delete:file",
                CompliancePolicy {
                    requires_approval: false,
                    requires_mfa: false,
                    minimum_mfa_level: MfaLevel::None,
                    max_duration_minutes: 60,
                    allow_emergency_bypass: true,
                },
            )
            .with_scope(
                "docker:system",
                CompliancePolicy {
                    requires_approval: true,
                    requires_mfa: true,
                    minimum_mfa_level: MfaLevel::Standard,
                    max_duration_minutes: 60,
                    allow_emergency_bypass: true,
                },
            ),
        );

        insert(
            DEFAULT_MARKET,
            MarketPolicy::new(
                DEFAULT_FRAMEWORK,
                DEFAULT_RETENTION_YEARS,
                CompliancePolicy::restrictive(),
            ),
        );

        let global_scopes = ["git:read", "figma:read:file"]
            .into_iter()
            .filter_map(|scope| Scope::parse(scope).ok())
            .collect();

        Self {
            version: initial_version(),
            markets,
            global_scopes,
            tenant_classes: BTreeMap::new(),
            tenant_namespaces: BTreeMap::new(),
        }
    }

    /// Parse and validate a JSON snapshot.
    ///
    /// # Errors
    /// Returns an error if the document is malformed or carries invalid values.
    pub fn from_json(document: &str) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_str(document).context("failed to parse policy snapshot")?;
        snapshot.validate()?;
        Ok(snapshot)
    }

    /// Load a JSON snapshot from disk.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let document = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read policy file {}", path.display()))?;
        Self::from_json(&document)
            .with_context(|| format!("invalid policy file {}", path.display()))
    }

    fn validate(&self) -> Result<()> {
        for (market, policy) in &self.markets {
            policy.default.validate(market.as_str())?;
            for (scope, scoped) in &policy.scopes {
                scoped.validate(&format!("{market}/{scope}"))?;
            }
            for (class, classed) in &policy.tenant_classes {
                classed.validate(&format!("{market}/class:{class}"))?;
            }
        }
        for (tenant, prefixes) in &self.tenant_namespaces {
            if prefixes.iter().any(|prefix| prefix.trim().is_empty()) {
                anyhow::bail!("tenant {tenant}: namespace prefixes must not be empty");
            }
        }
        Ok(())
    }

    /// Registered policy for exactly this market.
    ///
    /// # Errors
    /// Returns `ElevationError::PolicyNotFound` when the market is unknown.
    pub fn market_policy(&self, market: &Market) -> Result<&MarketPolicy, ElevationError> {
        self.markets
            .get(market)
            .ok_or_else(|| ElevationError::PolicyNotFound {
                market: market.to_string(),
            })
    }

    fn fallback_market(&self) -> Option<&MarketPolicy> {
        Market::parse(DEFAULT_MARKET)
            .ok()
            .and_then(|market| self.markets.get(&market))
    }

    /// Compliance profile used to enrich audit events for `market`.
    #[must_use]
    pub fn compliance_for(&self, market: &Market) -> ComplianceProfile {
        self.market_policy(market)
            .ok()
            .or_else(|| self.fallback_market())
            .map_or_else(
                || ComplianceProfile {
                    framework: DEFAULT_FRAMEWORK.to_string(),
                    retention_years: DEFAULT_RETENTION_YEARS,
                },
                MarketPolicy::profile,
            )
    }

    #[must_use]
    pub fn is_global(&self, scope: &Scope) -> bool {
        self.global_scopes.contains(scope)
    }

    #[must_use]
    pub fn tenant_class(&self, tenant_id: &str) -> Option<&str> {
        self.tenant_classes.get(tenant_id).map(String::as_str)
    }

    #[must_use]
    pub fn namespaces_for(&self, tenant_id: &str) -> Option<&[String]> {
        self.tenant_namespaces.get(tenant_id).map(Vec::as_slice)
    }

    fn policy_for_scope(
        market: &MarketPolicy,
        tenant_class: Option<&str>,
        scope: &Scope,
    ) -> CompliancePolicy {
        if let Some(policy) = market.scopes.get(scope) {
            return policy.clone();
        }
        if let Some(policy) = tenant_class.and_then(|class| market.tenant_classes.get(class)) {
            return policy.clone();
        }
        market.default.clone()
    }

    /// Evaluate `scopes` for a tenant in a market.
    ///
    /// Never more permissive than the policies it merges; an unknown market
    /// falls back to the `default` market and then to
    /// `CompliancePolicy::restrictive`.
    #[must_use]
    pub fn resolve(&self, market: &Market, tenant_id: &str, scopes: &ScopeSet) -> EffectivePolicy {
        let tenant_class = self.tenant_class(tenant_id);
        let (market_policy, fallback) = match self.market_policy(market) {
            Ok(policy) => (Some(policy), false),
            Err(err) => {
                warn!(market = %market, "{err}; using default market policy");
                (self.fallback_market(), true)
            }
        };

        let Some(market_policy) = market_policy else {
            return EffectivePolicy {
                policy: CompliancePolicy::restrictive(),
                compliance: self.compliance_for(market),
                version: self.version,
                fallback: true,
            };
        };

        let policy = scopes
            .iter()
            .map(|scope| Self::policy_for_scope(market_policy, tenant_class, scope))
            .reduce(|merged, next| merged.merge_restrictive(&next))
            .unwrap_or_else(|| market_policy.default.clone());

        EffectivePolicy {
            policy,
            compliance: market_policy.profile(),
            version: self.version,
            fallback,
        }
    }
}

/// Administrative registration of a market's compliance profile.
#[derive(Clone, Debug)]
pub struct ComplianceRegistration {
    pub market: Market,
    pub framework: String,
    pub requires_approval: bool,
    pub minimum_mfa_level: MfaLevel,
    pub retention_years: u32,
}

/// Holds the current snapshot. Constructed once and shared by reference.
#[derive(Debug)]
pub struct PolicyStore {
    current: RwLock<Arc<PolicySnapshot>>,
}

impl PolicyStore {
    #[must_use]
    pub fn new(snapshot: PolicySnapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(snapshot)),
        }
    }

    #[must_use]
    pub fn builtin() -> Self {
        Self::new(PolicySnapshot::builtin())
    }

    /// Consistent view for the duration of one evaluation.
    #[must_use]
    pub fn snapshot(&self) -> Arc<PolicySnapshot> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn update<F>(&self, apply: F) -> Result<i64, ElevationError>
    where
        F: FnOnce(&mut PolicySnapshot) -> Result<(), ElevationError>,
    {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = PolicySnapshot::clone(&current);
        apply(&mut next)?;
        next.version = current.version + 1;
        let version = next.version;
        *current = Arc::new(next);
        Ok(version)
    }

    /// Create or update a market's compliance profile. Returns the new version.
    ///
    /// # Errors
    /// Returns `ElevationError::Validation` for an empty framework name.
    pub fn register_compliance_policy(
        &self,
        registration: ComplianceRegistration,
    ) -> Result<i64, ElevationError> {
        let framework = registration.framework.trim().to_string();
        if framework.is_empty() {
            return Err(ElevationError::Validation(
                "framework must not be empty".to_string(),
            ));
        }
        let version = self.update(|snapshot| {
            let entry = snapshot
                .markets
                .entry(registration.market.clone())
                .or_insert_with(|| {
                    MarketPolicy::new(&framework, 0, CompliancePolicy::restrictive())
                });
            entry.framework = framework.clone();
            entry.retention_years = registration.retention_years;
            entry.default.requires_approval = registration.requires_approval;
            entry.default.requires_mfa = registration.minimum_mfa_level > MfaLevel::None;
            entry.default.minimum_mfa_level = registration.minimum_mfa_level;
            Ok(())
        })?;
        info!(
            market = %registration.market,
            framework = %framework,
            version,
            "compliance policy registered"
        );
        Ok(version)
    }

    /// Override the policy for one scope in a registered market.
    ///
    /// # Errors
    /// Returns `ElevationError::PolicyNotFound` if the market is not registered.
    pub fn set_scope_policy(
        &self,
        market: &Market,
        scope: Scope,
        policy: CompliancePolicy,
    ) -> Result<i64, ElevationError> {
        if policy.max_duration_minutes < 0 {
            return Err(ElevationError::Validation(
                "max_duration_minutes must not be negative".to_string(),
            ));
        }
        self.update(|snapshot| {
            let entry = snapshot
                .markets
                .get_mut(market)
                .ok_or_else(|| ElevationError::PolicyNotFound {
                    market: market.to_string(),
                })?;
            entry.scopes.insert(scope, policy);
            Ok(())
        })
    }

    /// Assign a tenant to a class, or clear it with `None`.
    ///
    /// # Errors
    /// Returns `ElevationError::Validation` for an empty tenant id.
    pub fn set_tenant_class(
        &self,
        tenant_id: &str,
        class: Option<String>,
    ) -> Result<i64, ElevationError> {
        let tenant_id = non_empty_tenant(tenant_id)?;
        self.update(|snapshot| {
            match class {
                Some(class) => snapshot.tenant_classes.insert(tenant_id, class),
                None => snapshot.tenant_classes.remove(&tenant_id),
            };
            Ok(())
        })
    }

    /// Replace a tenant's resource namespace prefixes.
    ///
    /// # Errors
    /// Returns `ElevationError::Validation` for an empty tenant id or prefix.
    pub fn set_tenant_namespaces(
        &self,
        tenant_id: &str,
        prefixes: Vec<String>,
    ) -> Result<i64, ElevationError> {
        let tenant_id = non_empty_tenant(tenant_id)?;
        if prefixes.iter().any(|prefix| prefix.trim().is_empty()) {
            return Err(ElevationError::Validation(
                "namespace prefixes must not be empty".to_string(),
            ));
        }
        self.update(|snapshot| {
            snapshot.tenant_namespaces.insert(tenant_id, prefixes);
            Ok(())
        })
    }

    /// Mark or unmark a scope as market-global.
    ///
    /// # Errors
    /// Never fails today; kept fallible for parity with the other writes.
    pub fn set_global_scope(&self, scope: Scope, global: bool) -> Result<i64, ElevationError> {
        self.update(|snapshot| {
            if global {
                snapshot.global_scopes.insert(scope);
            } else {
                snapshot.global_scopes.remove(&scope);
            }
            Ok(())
        })
    }
}

fn non_empty_tenant(tenant_id: &str) -> Result<String, ElevationError> {
    let tenant_id = tenant_id.trim();
    if tenant_id.is_empty() {
        return Err(ElevationError::Validation(
            "tenant_id must not be empty".to_string(),
        ));
    }
    Ok(tenant_id.to_string())
}

impl Default for PolicyStore {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Scopes of a request that are not marked global.
#[must_use]
pub fn market_bound_scopes<'a>(snapshot: &PolicySnapshot, scopes: &'a ScopeSet) -> BTreeSet<&'a Scope> {
    scopes.iter().filter(|scope| !snapshot.is_global(scope)).collect()
}
