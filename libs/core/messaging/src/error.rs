//! Error types for the broker side of the pipeline.
//!
//! Handler-level failures live in [`crate::HandlerError`]; this type covers
//! connection, topology and publish failures.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MessagingError {
    /// Every connection attempt allowed by the retry policy failed.
    /// Fatal: the owning process is expected to exit non-zero.
    #[error("connection to broker exhausted after {attempts} attempts: {last_error}")]
    ConnectionExhausted { attempts: u32, last_error: String },

    /// A single connect or channel-open failure.
    #[error("connection error: {0}")]
    Connection(String),

    /// `publish` was called before the channel was initialized, or after it dropped.
    #[error("channel not ready: call connect() before publishing")]
    ChannelNotReady,

    #[error("topology error: {0}")]
    Topology(String),

    #[error("publish error: {0}")]
    Publish(String),

    #[error("consume error: {0}")]
    Consume(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("metrics error: {0}")]
    Metrics(String),
}

impl MessagingError {
    /// Whether the error should terminate the process rather than be retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MessagingError::ConnectionExhausted { .. } | MessagingError::Metrics(_)
        )
    }
}
