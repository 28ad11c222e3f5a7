//! HTTP surface of the elevation engine.
//!
//! Flow Overview:
//! 1) Build the engine: Postgres stores when a DSN is configured, in-memory
//!    stores otherwise; policies from a file or the built-in markets.
//! 2) Serve the documented router with request-id, tracing and CORS layers.
//! 3) Run the housekeeping sweeper on an interval until shutdown.

use anyhow::{Context, Result};
use axum::{
    Extension, Router,
    body::Body,
    http::{HeaderName, HeaderValue, Method, Request},
    routing::options,
};
use secrecy::{ExposeSecret, SecretString};
use sqlx::postgres::PgPoolOptions;
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::{net::TcpListener, sync::watch, task::JoinHandle};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::PropagateRequestIdLayer,
    set_header::SetRequestHeaderLayer,
    trace::TraceLayer,
};
use tracing::{Span, debug_span, error, info, warn};
use ulid::Ulid;

use crate::{
    engine::{
        ElevationEngine, EngineConfig, LogNotifier, Notifier, PolicySnapshot, PolicyStore,
        audit::PgAuditLog, notify::WebhookNotifier, store::PgTokenStore,
    },
    hooks::HookRegistry,
};

pub mod handlers;
pub mod openapi;

pub use openapi::openapi;

const NOTIFIER_TIMEOUT_SECONDS: u64 = 10;

/// Everything the server needs from the command line.
#[derive(Debug)]
pub struct ServerConfig {
    pub port: u16,
    pub dsn: Option<SecretString>,
    pub policy_file: Option<PathBuf>,
    pub approval_webhook_url: Option<String>,
    pub sweep_interval_seconds: u64,
    pub engine: EngineConfig,
}

/// Router with every documented route, wired to `engine` and `hooks`.
#[must_use]
pub fn app(engine: Arc<ElevationEngine>, hooks: Arc<HookRegistry>) -> Router {
    let (router, _openapi) = openapi::api_router().split_for_parts();
    router
        .route("/health", options(handlers::health::health))
        .layer(Extension(hooks))
        .layer(Extension(engine))
}

/// Assemble the engine from configuration.
///
/// # Errors
/// Returns an error if the policy file, database or webhook cannot be set up.
pub async fn build_engine(config: &ServerConfig) -> Result<Arc<ElevationEngine>> {
    let policies = match &config.policy_file {
        Some(path) => PolicyStore::new(PolicySnapshot::load(path)?),
        None => PolicyStore::builtin(),
    };

    let notifier: Arc<dyn Notifier> = match &config.approval_webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(
            url,
            Duration::from_secs(NOTIFIER_TIMEOUT_SECONDS),
        )?),
        None => Arc::new(LogNotifier),
    };

    let mut builder = ElevationEngine::builder(config.engine.clone())
        .with_policies(Arc::new(policies))
        .with_notifier(notifier);

    if let Some(dsn) = &config.dsn {
        let pool = PgPoolOptions::new()
            .min_connections(1)
            .max_connections(10)
            .max_lifetime(Duration::from_secs(60 * 2))
            .test_before_acquire(true)
            .connect(dsn.expose_secret())
            .await
            .context("Failed to connect to database")?;
        builder = builder
            .with_token_store(Arc::new(PgTokenStore::new(pool.clone())))
            .with_audit_sink(Arc::new(PgAuditLog::new(pool)));
    } else {
        warn!("No DSN configured, elevations and audit events are kept in memory");
    }

    Ok(Arc::new(builder.build()))
}

/// Periodically expire overdue tokens until `shutdown` flips.
pub fn spawn_sweeper(
    engine: Arc<ElevationEngine>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match engine.sweep().await {
                        Ok(report) if report.expired + report.timed_out > 0 => info!(
                            expired = report.expired,
                            timed_out = report.timed_out,
                            "sweeper pass"
                        ),
                        Ok(_) => {}
                        Err(err) => error!("sweeper pass failed: {err}"),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}

/// Start the server.
///
/// # Errors
/// Returns an error if the engine cannot be built or the listener fails.
pub async fn new(config: ServerConfig) -> Result<()> {
    let engine = build_engine(&config).await?;
    let hooks = Arc::new(HookRegistry::builtin()?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = (config.sweep_interval_seconds > 0).then(|| {
        spawn_sweeper(
            engine.clone(),
            Duration::from_secs(config.sweep_interval_seconds),
            shutdown_rx,
        )
    });

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_origin(Any);

    let app = app(engine, hooks).layer(
        ServiceBuilder::new()
            .layer(SetRequestHeaderLayer::if_not_present(
                HeaderName::from_static("x-request-id"),
                |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
            ))
            .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                "x-request-id",
            )))
            .layer(TraceLayer::new_for_http().make_span_with(make_span))
            .layer(cors),
    );

    let listener = TcpListener::bind(format!("::0:{}", config.port)).await?;

    info!("Listening on [::]:{}", config.port);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {err}");
            }
            info!("Gracefully shutdown");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    if let Some(sweeper) = sweeper {
        let _ = sweeper.await;
    }

    Ok(())
}

fn make_span(request: &Request<Body>) -> Span {
    let path = request.uri().path();
    let method = request.method();
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");

    debug_span!("http-request", %method, path, request_id)
}
