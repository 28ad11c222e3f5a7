//! Tenant isolation guard.
//!
//! Tenant ids must match exactly; there is no override. The market must match
//! unless every required scope is marked global in policy. When a resource
//! path is supplied it must sit inside one of the tenant's namespace prefixes,
//! and a tenant with no configured namespace is denied.

use super::{
    policy::{PolicySnapshot, market_bound_scopes},
    types::{ElevationToken, Market, ScopeSet},
};

pub const CROSS_TENANT_ACCESS: &str = "cross_tenant_access";
pub const CROSS_MARKET_ACCESS: &str = "cross_market_access";
pub const RESOURCE_OUTSIDE_NAMESPACE: &str = "resource_outside_namespace";
pub const NAMESPACE_NOT_CONFIGURED: &str = "namespace_not_configured";
pub const INVALID_RESOURCE_PATH: &str = "invalid_resource_path";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IsolationDecision {
    Allow,
    Deny { reason: &'static str },
}

impl IsolationDecision {
    #[must_use]
    pub const fn is_allowed(self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// What the caller declared about itself and its target.
#[derive(Clone, Copy, Debug)]
pub struct IsolationContext<'a> {
    pub caller_tenant: &'a str,
    pub caller_market: &'a Market,
    pub required_scopes: &'a ScopeSet,
    pub resource_path: Option<&'a str>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TenantIsolationGuard;

impl TenantIsolationGuard {
    /// `CheckIsolation`: full decision with a reason on denial.
    #[must_use]
    pub fn check(
        &self,
        snapshot: &PolicySnapshot,
        token: &ElevationToken,
        context: &IsolationContext<'_>,
    ) -> IsolationDecision {
        if token.tenant_id != context.caller_tenant {
            return IsolationDecision::Deny {
                reason: CROSS_TENANT_ACCESS,
            };
        }

        let market_bound = market_bound_scopes(snapshot, context.required_scopes);
        let all_global = !context.required_scopes.is_empty() && market_bound.is_empty();
        if !all_global && &token.market != context.caller_market {
            return IsolationDecision::Deny {
                reason: CROSS_MARKET_ACCESS,
            };
        }

        if let Some(path) = context.resource_path {
            return check_resource_path(snapshot, &token.tenant_id, path);
        }
        IsolationDecision::Allow
    }

    /// Boolean form for adapters that only need allow/deny.
    #[must_use]
    pub fn is_allowed(
        &self,
        snapshot: &PolicySnapshot,
        token: &ElevationToken,
        context: &IsolationContext<'_>,
    ) -> bool {
        self.check(snapshot, token, context).is_allowed()
    }
}

fn check_resource_path(snapshot: &PolicySnapshot, tenant_id: &str, path: &str) -> IsolationDecision {
    let path = path.trim();
    if path.is_empty()
        || path.contains('\0')
        || path.split(['/', '\\']).any(|segment| segment == "..")
    {
        return IsolationDecision::Deny {
            reason: INVALID_RESOURCE_PATH,
        };
    }

    let Some(prefixes) = snapshot.namespaces_for(tenant_id) else {
        return IsolationDecision::Deny {
            reason: NAMESPACE_NOT_CONFIGURED,
        };
    };

    if prefixes.iter().any(|prefix| within_prefix(path, prefix)) {
        IsolationDecision::Allow
    } else {
        IsolationDecision::Deny {
            reason: RESOURCE_OUTSIDE_NAMESPACE,
        }
    }
}

/// `/tenants/a` covers `/tenants/a` and `/tenants/a/x`, not `/tenants/ab`.
fn within_prefix(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim();
    if prefix.is_empty() {
        return false;
    }
    if prefix.ends_with('/') {
        return path.starts_with(prefix) || path == prefix.trim_end_matches('/');
    }
    path == prefix
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}
