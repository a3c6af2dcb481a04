//! Broker publisher.

use crate::config::BrokerConfig;
use crate::connection::{connect_with_retry, redact_url};
use crate::error::MessagingError;
use crate::metrics::JobMetrics;
use crate::topology::{declare_exchange, JOBS_EXCHANGE};
use lapin::{options::BasicPublishOptions, BasicProperties, Channel, Connection};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// AMQP delivery mode for messages that survive a broker restart.
const PERSISTENT: u8 = 2;

struct PublisherState {
    connection: Connection,
    channel: Channel,
}

/// Publishes JSON jobs to the `jobs` exchange.
///
/// Owns one connection and one channel. Until [`connect`](Self::connect)
/// succeeds, and after the channel drops, [`publish`](Self::publish) fails
/// with [`MessagingError::ChannelNotReady`]. Cloning shares the connection.
#[derive(Clone)]
pub struct BrokerPublisher {
    config: BrokerConfig,
    state: Arc<RwLock<Option<PublisherState>>>,
    metrics: JobMetrics,
}

impl BrokerPublisher {
    pub fn new(config: BrokerConfig, metrics: JobMetrics) -> Self {
        Self {
            config,
            state: Arc::new(RwLock::new(None)),
            metrics,
        }
    }

    /// Connect with retry, open a channel and declare the exchange.
    ///
    /// Any previous connection is replaced wholesale.
    pub async fn connect(&self) -> Result<(), MessagingError> {
        let connection = connect_with_retry(&self.config.url, &self.config.retry).await?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| MessagingError::Connection(format!("create channel: {}", e)))?;

        declare_exchange(&channel).await?;

        let previous = self
            .state
            .write()
            .await
            .replace(PublisherState { connection, channel });

        if let Some(old) = previous {
            if old.connection.status().connected() {
                if let Err(e) = old.connection.close(200, "replaced").await {
                    debug!(error = %e, "Closing replaced connection failed");
                }
            }
        }

        info!(
            target_url = %redact_url(&self.config.url),
            exchange = JOBS_EXCHANGE,
            "Publisher ready"
        );
        Ok(())
    }

    /// Whether the channel is usable right now.
    pub async fn is_connected(&self) -> bool {
        self.state
            .read()
            .await
            .as_ref()
            .is_some_and(|s| s.connection.status().connected() && s.channel.status().connected())
    }

    /// Drop the current channel and connect again.
    pub async fn reconnect(&self) -> Result<(), MessagingError> {
        warn!("Publisher channel lost, reconnecting");
        self.state.write().await.take();
        self.connect().await
    }

    /// Publish `message` as persistent JSON under `routing_key`.
    ///
    /// Fire-and-forget: returns once the frame is handed to the channel; no
    /// publisher confirm is awaited.
    pub async fn publish<T>(&self, routing_key: &str, message: &T) -> Result<(), MessagingError>
    where
        T: Serialize + ?Sized,
    {
        let channel = self
            .state
            .read()
            .await
            .as_ref()
            .filter(|s| s.channel.status().connected())
            .map(|s| s.channel.clone())
            .ok_or(MessagingError::ChannelNotReady)?;

        let body = serde_json::to_vec(message)?;

        channel
            .basic_publish(
                JOBS_EXCHANGE,
                routing_key,
                BasicPublishOptions::default(),
                &body,
                BasicProperties::default()
                    .with_content_type("application/json".into())
                    .with_delivery_mode(PERSISTENT),
            )
            .await
            .map_err(|e| MessagingError::Publish(format!("{}: {}", routing_key, e)))?;

        self.metrics.message_published(routing_key);
        debug!(routing_key, bytes = body.len(), "Message published");
        Ok(())
    }

    /// Close the connection; publishing fails with `ChannelNotReady` afterwards.
    pub async fn close(&self) -> Result<(), MessagingError> {
        if let Some(state) = self.state.write().await.take() {
            state
                .connection
                .close(200, "shutdown")
                .await
                .map_err(|e| MessagingError::Connection(e.to_string()))?;
            info!("Publisher connection closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_before_connect_fails_with_channel_not_ready() {
        let publisher = BrokerPublisher::new(BrokerConfig::default(), JobMetrics::default());

        assert!(!publisher.is_connected().await);
        let err = publisher
            .publish("mail.otp", &serde_json::json!({"type": "SEND_OTP"}))
            .await
            .unwrap_err();
        assert!(matches!(err, MessagingError::ChannelNotReady));
    }

    #[tokio::test]
    async fn test_close_without_connection_is_noop() {
        let publisher = BrokerPublisher::new(BrokerConfig::default(), JobMetrics::default());
        publisher.close().await.unwrap();
        assert!(!publisher.is_connected().await);
    }
}
