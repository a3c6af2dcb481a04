//! Helpdesk Broker Service
//!
//! Accepts jobs over HTTP and publishes them to the `jobs` topic exchange.
//!
//! ## Architecture
//!
//! ```text
//! POST /publish/otp | /publish/log | /publish/jobs/{routing_key}
//!   ↓
//! BrokerPublisher (one connection, one channel)
//!   ↓ persistent JSON, fire-and-forget
//! exchange "jobs" (topic)
//! ```
//!
//! A supervisor task watches the channel and reconnects through the
//! connect-with-retry policy when it drops. While disconnected, publish
//! endpoints answer 503 and `/ready` fails.

pub mod routes;

use axum::Router;
use core_config::{app_info, server::ServerConfig, Environment, FromEnv};
use eyre::{Result, WrapErr};
use messaging::metrics::PrometheusHandle;
use messaging::{
    health_router, init_metrics, BrokerConfig, BrokerPublisher, HealthState, JobMetrics,
    MessagingError, MetricsConfig,
};
use std::future::{Future, IntoFuture};
use std::pin::pin;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{error, info, warn, Level};

/// How often the supervisor checks the publisher channel.
const SUPERVISE_INTERVAL: Duration = Duration::from_secs(1);

/// Run the broker service
///
/// # Errors
///
/// Returns an error if configuration is invalid, the initial broker
/// connection exhausts its retries, the listener cannot bind, or a later
/// reconnect exhausts its retries.
pub async fn run() -> Result<()> {
    core_config::tracing::install_color_eyre();
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    let app_info = app_info!();
    info!(name = %app_info.name, version = %app_info.version, environment = ?environment, "Starting broker service");

    let broker_config = BrokerConfig::from_env().wrap_err("Failed to load broker configuration")?;
    let metrics_config =
        MetricsConfig::from_env().wrap_err("Failed to load metrics configuration")?;
    let server_config = ServerConfig::from_env().wrap_err("Failed to load server configuration")?;

    let metrics_handle = init_metrics(&metrics_config).wrap_err("Failed to install metrics recorder")?;

    let publisher = BrokerPublisher::new(broker_config, JobMetrics::from_config(&metrics_config));
    publisher
        .connect()
        .await
        .wrap_err("Failed to connect to the message broker")?;

    let health = HealthState::new();
    health.set_connected(true).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let supervisor = tokio::spawn(supervise(
        publisher.clone(),
        health.clone(),
        shutdown_rx.clone(),
    ));

    let app = build_app(publisher.clone(), health, metrics_handle);

    let addr = server_config.address();
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("Failed to bind broker service to {}", addr))?;
    info!(addr = %addr, "Broker service listening");

    let mut server_shutdown = shutdown_rx.clone();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = server_shutdown.wait_for(|stop| *stop).await;
        })
        .into_future();

    serve_until_stopped(server, supervisor).await?;

    if let Err(e) = publisher.close().await {
        warn!(error = %e, "Failed to close publisher connection");
    }
    info!("Broker service stopped");
    Ok(())
}

/// Publish routes plus `/health`, `/ready` and `/metrics`.
pub fn build_app(
    publisher: BrokerPublisher,
    health: HealthState,
    metrics: Option<PrometheusHandle>,
) -> Router {
    routes::router(publisher)
        .merge(health_router(health, metrics))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
}

/// Drive the HTTP server alongside the publisher supervisor.
///
/// A supervisor that stops cleanly means shutdown was requested, so the
/// server keeps running until its graceful drain completes. A supervisor
/// error ends the service at once.
async fn serve_until_stopped<S>(
    server: S,
    supervisor: JoinHandle<Result<(), MessagingError>>,
) -> Result<()>
where
    S: Future<Output = std::io::Result<()>>,
{
    let mut server = pin!(server);

    tokio::select! {
        result = &mut server => result.wrap_err("Broker HTTP server failed")?,
        joined = supervisor => {
            joined
                .wrap_err("Publisher supervisor panicked")?
                .wrap_err("Lost the message broker")?;
            server.await.wrap_err("Broker HTTP server failed")?;
        }
    }

    Ok(())
}

/// Reconnect the publisher whenever its channel drops.
///
/// Returns `Ok` on shutdown and an error once a reconnect exhausts the retry
/// policy.
async fn supervise(
    publisher: BrokerPublisher,
    health: HealthState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), MessagingError> {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(SUPERVISE_INTERVAL) => {}
            _ = shutdown.wait_for(|stop| *stop) => return Ok(()),
        }

        if publisher.is_connected().await {
            continue;
        }

        health.set_error("publisher channel closed").await;

        let reconnected = tokio::select! {
            result = publisher.reconnect() => result,
            _ = shutdown.wait_for(|stop| *stop) => return Ok(()),
        };

        match reconnected {
            Ok(()) => {
                health.set_connected(true).await;
                info!("Publisher reconnected");
            }
            Err(e) if e.is_fatal() => {
                error!(error = %e, "Publisher reconnect exhausted");
                health.set_fatal(e.to_string()).await;
                return Err(e);
            }
            Err(e) => {
                warn!(error = %e, "Publisher reconnect failed, will retry");
                health.set_error(e.to_string()).await;
            }
        }
    }
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

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_app_serves_health_next_to_publish_routes() {
        let publisher = BrokerPublisher::new(BrokerConfig::default(), JobMetrics::default());
        let app = build_app(publisher, HealthState::new(), None);

        let health = app
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(health.status(), StatusCode::OK);

        let ready = app
            .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(ready.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_clean_supervisor_exit_waits_for_server_drain() {
        let drained = Arc::new(AtomicBool::new(false));
        let flag = drained.clone();
        let server = async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            flag.store(true, Ordering::SeqCst);
            Ok(())
        };
        let supervisor = tokio::spawn(async { Ok(()) });

        serve_until_stopped(server, supervisor).await.unwrap();
        assert!(drained.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_supervisor_error_stops_service() {
        let server = std::future::pending::<std::io::Result<()>>();
        let supervisor = tokio::spawn(async {
            Err(MessagingError::ConnectionExhausted {
                attempts: 3,
                last_error: "connection refused".to_string(),
            })
        });

        let err = serve_until_stopped(server, supervisor).await.unwrap_err();
        assert_eq!(err.to_string(), "Lost the message broker");
    }
}
