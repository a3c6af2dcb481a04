//! Helpdesk Listener Service
//!
//! Consumes the job queues bound to the `jobs` exchange and runs each
//! delivery through its queue's handler.
//!
//! ## Architecture
//!
//! ```text
//! exchange "jobs" (topic)
//!   ├─ mail.*                     → mail-service   → MailHandler → mail service /send
//!   ├─ kb.* | llm.* | analytics.* → kb-jobs        → KbHandler   → KB proxy /internal/jobs/*
//!   └─ log.*                      → logger-service → LogHandler  → structured logs
//! ```
//!
//! ## Features
//!
//! - Connect-with-retry and reconnect on connection loss
//! - Explicit prefetch with bounded concurrent handlers
//! - Dead-letter queues for rejected payloads
//! - Graceful shutdown on SIGINT/SIGTERM
//! - Health and Prometheus endpoints on `HEALTH_PORT`

use core_config::{app_info, server::ServerConfig, Environment, FromEnv};
use domain_jobs::{DispatchConfig, Handlers};
use eyre::{Result, WrapErr};
use messaging::{
    health_router, init_metrics, metrics::PrometheusHandle, BrokerConfig, HealthState, JobMetrics,
    KbQueue, Listener, LogQueue, MailQueue, MetricsConfig, QueueConsumer, QueueSpec,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

const DEFAULT_HEALTH_PORT: u16 = 8081;

/// One consumer per queue, each bound to its handler.
pub fn consumers(handlers: Handlers, metrics: JobMetrics) -> Vec<QueueConsumer> {
    vec![
        QueueConsumer::new(
            QueueSpec::from_def::<MailQueue>(),
            Arc::new(handlers.mail),
            metrics.clone(),
        ),
        QueueConsumer::new(
            QueueSpec::from_def::<KbQueue>(),
            Arc::new(handlers.kb),
            metrics.clone(),
        ),
        QueueConsumer::new(
            QueueSpec::from_def::<LogQueue>(),
            Arc::new(handlers.log),
            metrics,
        ),
    ]
}

async fn start_health_server(
    health: HealthState,
    metrics: Option<PrometheusHandle>,
    config: ServerConfig,
) -> Result<()> {
    let app = health_router(health, metrics);

    let addr = config.address();
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("Failed to bind health server to {}", addr))?;

    info!(addr = %addr, "Health server listening");

    axum::serve(listener, app)
        .await
        .wrap_err("Health server failed")?;

    Ok(())
}

/// Run the listener service
///
/// # Errors
///
/// Returns an error if configuration is invalid (including a missing
/// `WORKER_TOKEN`) or the broker connection exhausts its retries.
pub async fn run() -> Result<()> {
    core_config::tracing::install_color_eyre();
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    let app_info = app_info!();
    info!(name = %app_info.name, version = %app_info.version, environment = ?environment, "Starting listener service");

    let broker_config = BrokerConfig::from_env().wrap_err("Failed to load broker configuration")?;
    let metrics_config =
        MetricsConfig::from_env().wrap_err("Failed to load metrics configuration")?;
    let dispatch_config =
        DispatchConfig::from_env().wrap_err("Failed to load downstream service configuration")?;
    let health_config = ServerConfig::from_env_with_port("HEALTH_PORT", DEFAULT_HEALTH_PORT)
        .wrap_err("Failed to load health server configuration")?;

    info!(
        prefetch = broker_config.prefetch,
        dead_letter_queues = broker_config.dead_letter_queues,
        mail_service_url = %dispatch_config.mail_service_url,
        flowise_proxy_url = %dispatch_config.flowise_proxy_url,
        http_timeout_ms = dispatch_config.http_timeout.as_millis() as u64,
        "Listener configuration loaded"
    );

    let metrics_handle = init_metrics(&metrics_config).wrap_err("Failed to install metrics recorder")?;
    let handlers =
        Handlers::from_config(&dispatch_config).wrap_err("Failed to build job handlers")?;
    let consumers = consumers(handlers, JobMetrics::from_config(&metrics_config));

    let health = HealthState::new();
    let health_for_server = health.clone();
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_for_server, metrics_handle, health_config).await {
            error!(error = %e, "Health server failed");
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    Listener::new(broker_config, consumers, health)
        .run(shutdown_rx)
        .await
        .wrap_err("Listener stopped with a fatal broker error")?;

    info!("Listener service stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating shutdown..."),
        _ = terminate => info!("Received SIGTERM, initiating shutdown..."),
    }
}
