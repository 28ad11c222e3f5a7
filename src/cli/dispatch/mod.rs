use crate::cli::actions::{Action, server::Args};
use anyhow::{Context, Result};
use secrecy::SecretString;
use std::path::PathBuf;

/// # Errors
/// Returns an error if a required argument is missing.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>("port").copied().unwrap_or(8080);
    let dsn = matches
        .get_one::<String>("dsn")
        .filter(|dsn| !dsn.trim().is_empty())
        .map(|dsn| SecretString::from(dsn.clone()));
    let policy_file = matches.get_one::<PathBuf>("policy-file").cloned();
    let approval_webhook_url = matches
        .get_one::<String>("approval-webhook-url")
        .filter(|url| !url.trim().is_empty())
        .cloned();

    Ok(Action::Server(Args {
        port,
        dsn,
        policy_file,
        approval_webhook_url,
        approval_ttl_seconds: required(matches, "approval-ttl-seconds")?,
        mfa_challenge_ttl_seconds: required(matches, "mfa-challenge-ttl-seconds")?,
        request_timeout_ms: required(matches, "request-timeout-ms")?,
        sweep_interval_seconds: required(matches, "sweep-interval-seconds")?,
        sweep_batch_size: required(matches, "sweep-batch-size")?,
    }))
}

fn required<T>(matches: &clap::ArgMatches, id: &str) -> Result<T>
where
    T: Clone + Send + Sync + 'static,
{
    matches
        .get_one::<T>(id)
        .cloned()
        .with_context(|| format!("missing required argument: --{id}"))
}
