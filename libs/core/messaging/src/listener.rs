//! Consumer supervision: connect, consume every queue, reconnect on loss.

use crate::config::BrokerConfig;
use crate::connection::connect_with_retry;
use crate::consumer::QueueConsumer;
use crate::error::MessagingError;
use crate::health::HealthState;
use crate::topology::declare_exchange;
use lapin::Connection;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Runs a set of [`QueueConsumer`]s on one connection and one channel.
pub struct Listener {
    config: BrokerConfig,
    consumers: Vec<QueueConsumer>,
    health: HealthState,
}

impl Listener {
    pub fn new(config: BrokerConfig, consumers: Vec<QueueConsumer>, health: HealthState) -> Self {
        Self {
            config,
            consumers,
            health,
        }
    }

    /// Consume until `shutdown` flips to `true`.
    ///
    /// A lost connection or channel is re-established through
    /// [`connect_with_retry`] and the topology is declared again. Returns an
    /// error only when the retry policy is exhausted.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), MessagingError> {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let connection = tokio::select! {
                result = connect_with_retry(&self.config.url, &self.config.retry) => match result {
                    Ok(connection) => connection,
                    Err(e) => {
                        self.health.set_fatal(e.to_string()).await;
                        return Err(e);
                    }
                },
                _ = shutdown_requested(&mut shutdown) => return Ok(()),
            };

            match self.serve(&connection, &mut shutdown).await {
                Ok(true) => {
                    close(&connection).await;
                    info!("Listener stopped");
                    return Ok(());
                }
                Ok(false) => {}
                Err(e) if e.is_fatal() => {
                    self.health.set_fatal(e.to_string()).await;
                    return Err(e);
                }
                Err(e) => {
                    error!(error = %e, "Listener session failed");
                    self.health.set_error(e.to_string()).await;
                }
            }

            close(&connection).await;
            warn!(
                delay_ms = self.config.retry.delay.as_millis() as u64,
                "Broker connection lost, reconnecting"
            );

            tokio::select! {
                _ = tokio::time::sleep(self.config.retry.delay) => {}
                _ = shutdown_requested(&mut shutdown) => return Ok(()),
            }
        }
    }

    /// One connection's lifetime. `Ok(true)` means shutdown was requested.
    async fn serve(
        &self,
        connection: &Connection,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<bool, MessagingError> {
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| MessagingError::Connection(format!("create channel: {}", e)))?;
        declare_exchange(&channel).await?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let (started_tx, mut started_rx) = mpsc::channel(self.consumers.len().max(1));
        let mut tasks = JoinSet::new();

        for consumer in &self.consumers {
            let consumer = consumer.clone();
            let channel = channel.clone();
            let stop = stop_rx.clone();
            let started = started_tx.clone();
            let prefetch = self.config.prefetch;
            let dead_letter = self.config.dead_letter_queues;

            tasks.spawn(async move {
                let result = consumer
                    .run(&channel, prefetch, dead_letter, started, stop)
                    .await;
                (consumer.queue().to_string(), result)
            });
        }
        drop(started_tx);

        // Ready only once every queue is declared and consumed.
        let expected = self.consumers.len();
        let mut started = 0;
        if expected == 0 {
            self.health.set_connected(true).await;
        }

        let stopped = loop {
            tokio::select! {
                _ = shutdown_requested(shutdown) => break true,
                Some(()) = started_rx.recv(), if started < expected => {
                    started += 1;
                    if started == expected {
                        self.health.set_connected(true).await;
                        info!(queues = expected, "Listener consuming");
                    }
                }
                Some(joined) = tasks.join_next() => {
                    match joined {
                        Ok((queue, Err(e))) => {
                            warn!(queue = %queue, error = %e, "Consumer stopped");
                            self.health.set_error(e.to_string()).await;
                        }
                        Ok((queue, Ok(()))) => warn!(queue = %queue, "Consumer stopped"),
                        Err(e) => error!(error = %e, "Consumer task panicked"),
                    }
                    break false;
                }
            }
        };

        // Stop the remaining consumers and wait for their in-flight jobs.
        let _ = stop_tx.send(true);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((queue, Err(e))) if !stopped => {
                    warn!(queue = %queue, error = %e, "Consumer stopped")
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Consumer task panicked"),
            }
        }

        self.health.set_connected(false).await;
        Ok(stopped)
    }
}

/// Resolves once the flag is `true` or the sender is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn close(connection: &Connection) {
    if connection.status().connected() {
        if let Err(e) = connection.close(200, "shutdown").await {
            warn!(error = %e, "Closing broker connection failed");
        }
    }
}
