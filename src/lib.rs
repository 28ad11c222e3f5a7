//! # Elevation (Privilege Elevation Engine)
//!
//! `elevation` grants time-boxed, scope-bound privilege escalation to users
//! before they invoke sensitive operations on external tool surfaces
//! (container control, local command execution, source-control mutation,
//! design-asset mutation).
//!
//! ## Lifecycle
//!
//! A request is validated, matched against the compliance policy of its market
//! and tenant, optionally gated by an MFA challenge, and then stored either as
//! `active` or `pending_approval`. Approval, denial, revocation and expiry are
//! single conditional transitions in the token store, so concurrent callers can
//! never both win.
//!
//! ## Tenant Model
//!
//! Tenants are the isolation boundary. A token issued to one tenant is never
//! honoured for another, regardless of scope breadth. Markets are regulatory
//! jurisdictions; scopes marked global in policy skip the market check but
//! never the tenant check.
//!
//! ## Audit
//!
//! Every lifecycle transition, every successful use and every denial is written
//! to the audit log before the call returns, enriched with the market's
//! compliance framework and retention period.

pub mod api;
pub mod cli;
pub mod engine;
pub mod hooks;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_commit_hash_format() {
        if GIT_COMMIT_HASH == "unknown" {
            // Acceptable in non-git build environments
            return;
        }
        assert!(
            GIT_COMMIT_HASH.chars().all(|c| c.is_ascii_hexdigit()),
            "GIT_COMMIT_HASH should be a hex string, got: {GIT_COMMIT_HASH}"
        );
        assert!(
            GIT_COMMIT_HASH.len() >= 7,
            "GIT_COMMIT_HASH should be at least 7 characters long, got: {GIT_COMMIT_HASH}"
        );
    }

    #[test]
    fn test_app_user_agent_format() {
        assert!(APP_USER_AGENT.starts_with(env!("CARGO_PKG_NAME")));
        assert!(APP_USER_AGENT.contains(env!("CARGO_PKG_VERSION")));
    }
}
