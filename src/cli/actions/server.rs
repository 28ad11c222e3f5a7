use crate::{api, engine::EngineConfig};
use anyhow::Result;
use secrecy::{ExposeSecret, SecretString};
use std::path::PathBuf;
use tracing::info;
use url::Url;

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: Option<SecretString>,
    pub policy_file: Option<PathBuf>,
    pub approval_webhook_url: Option<String>,
    pub approval_ttl_seconds: i64,
    pub mfa_challenge_ttl_seconds: i64,
    pub request_timeout_ms: u64,
    pub sweep_interval_seconds: u64,
    pub sweep_batch_size: i64,
}

impl Args {
    fn server_config(self) -> api::ServerConfig {
        let engine = EngineConfig::new()
            .with_approval_ttl_seconds(self.approval_ttl_seconds)
            .with_mfa_challenge_ttl_seconds(self.mfa_challenge_ttl_seconds)
            .with_request_timeout_ms(self.request_timeout_ms)
            .with_sweep_batch_size(self.sweep_batch_size);
        api::ServerConfig {
            port: self.port,
            dsn: self.dsn,
            policy_file: self.policy_file,
            approval_webhook_url: self.approval_webhook_url,
            sweep_interval_seconds: self.sweep_interval_seconds,
            engine,
        }
    }
}

/// Execute the server action.
/// # Errors
/// Returns an error if the engine cannot be built or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    log_startup_args(&args);
    api::new(args.server_config()).await
}

fn log_startup_args(args: &Args) {
    let entries = [
        ("listen", format!("tcp:{}", args.port)),
        (
            "dsn",
            args.dsn
                .as_ref()
                .map_or_else(|| "none (in-memory)".to_string(), |dsn| {
                    redact_dsn(dsn.expose_secret())
                }),
        ),
        (
            "policy_file",
            args.policy_file
                .as_ref()
                .map_or_else(|| "built-in".to_string(), |path| path.display().to_string()),
        ),
        (
            "approval_webhook",
            args.approval_webhook_url
                .as_deref()
                .map_or_else(|| "log".to_string(), redact_dsn),
        ),
        ("approval_ttl_seconds", args.approval_ttl_seconds.to_string()),
        (
            "mfa_challenge_ttl_seconds",
            args.mfa_challenge_ttl_seconds.to_string(),
        ),
        ("request_timeout_ms", args.request_timeout_ms.to_string()),
        (
            "sweep_interval_seconds",
            args.sweep_interval_seconds.to_string(),
        ),
        ("sweep_batch_size", args.sweep_batch_size.to_string()),
    ];
    info!("{}", startup_message("Startup configuration", &entries));
}

fn startup_message(title: &str, entries: &[(&str, String)]) -> String {
    let max_key_len = entries.iter().map(|(key, _)| key.len()).max().unwrap_or(0);
    let mut message = format!("{}\n\n{title}:", banner());
    for (key, value) in entries {
        let padding = " ".repeat(max_key_len.saturating_sub(key.len()));
        let _ =
            std::fmt::Write::write_fmt(&mut message, format_args!("\n  {key}:{padding} {value}"));
    }
    message
}

fn redact_dsn(dsn: &str) -> String {
    match Url::parse(dsn) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("REDACTED"));
            }
            parsed.to_string()
        }
        Err(_) => "invalid-url".to_string(),
    }
}

fn banner() -> String {
    let short_hash = short_commit(crate::GIT_COMMIT_HASH);
    BANNER.replace(
        "{VERSION}",
        &format!(" - {} - {}", env!("CARGO_PKG_VERSION"), short_hash),
    )
}

fn short_commit(hash: &str) -> String {
    let trimmed = hash.trim();
    trimmed.chars().take(7).collect()
}

const BANNER: &str = r"
      /\
     /  \
    / /\ \
   / /  \ \
  /_/ /\ \_\   E L E V A T I O N {VERSION}
     /  \
    /____\";
