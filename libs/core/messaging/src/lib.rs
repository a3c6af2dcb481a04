//! AMQP job pipeline for the helpdesk services.
//!
//! This library owns everything between an upstream HTTP request and a
//! downstream job handler:
//! - **Connection manager**: connect-with-retry with a constant backoff
//! - **Topology**: the durable `jobs` topic exchange and per-family queues
//! - **Publisher**: persistent, fire-and-forget `publish(routing_key, message)`
//! - **Dispatcher**: the per-message state machine that parses, dispatches and
//!   settles every delivery exactly once
//! - **Listener**: consumer supervision and reconnect on connection loss
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   ┌─────────────────┐   ┌─────────────────┐   ┌────────────────┐
//! │ HTTP request │──▶│ BrokerPublisher │──▶│ exchange "jobs" │──▶│  mail-service  │──┐
//! └──────────────┘   └─────────────────┘   │     (topic)     │──▶│    kb-jobs     │──┤
//!                                          └─────────────────┘──▶│ logger-service │──┤
//!                                                                └────────────────┘  │
//!                                          ┌─────────────────┐   ┌────────────────┐  │
//!                                          │   JobHandler    │◀──│ QueueConsumer  │◀─┘
//!                                          │   (adapters)    │   │   (dispatch)   │
//!                                          └─────────────────┘   └────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use messaging::{BrokerConfig, BrokerPublisher, JobMetrics, Listener, MailQueue, QueueConsumer, QueueSpec};
//!
//! let config = BrokerConfig::from_env()?;
//! let publisher = BrokerPublisher::new(config.clone(), JobMetrics::default());
//! publisher.connect().await?;
//! publisher.publish("mail.otp", &json!({"type": "SEND_OTP", "to": "a@b.com", "otp": "123456"})).await?;
//!
//! let consumer = QueueConsumer::new(QueueSpec::from_def::<MailQueue>(), Arc::new(mail_handler), JobMetrics::default());
//! Listener::new(config, vec![consumer], health).run(shutdown_rx).await?;
//! ```

mod config;
mod connection;
mod consumer;
mod dispatch;
mod error;
pub mod health;
mod listener;
pub mod metrics;
mod publisher;
mod route;
mod topology;

pub use config::{BrokerConfig, MetricsConfig, RetryPolicy};
pub use connection::{connect_with_retry, redact_url, retry_with_policy};
pub use consumer::QueueConsumer;
pub use dispatch::{
    dispatch, Disposition, FailurePolicy, HandlerError, HandlerOutcome, IncomingJob, JobHandler,
    JobReport, JobStatus,
};
pub use error::MessagingError;
pub use health::{health_router, HealthState, HealthStatus};
pub use listener::Listener;
pub use crate::metrics::{init_metrics, JobMetrics};
pub use publisher::BrokerPublisher;
pub use route::{JobRoute, KbAction};
pub use topology::{
    declare_exchange, declare_queue, KbQueue, LogQueue, MailQueue, QueueDef, QueueSpec,
    DEAD_LETTER_EXCHANGE, JOBS_EXCHANGE,
};
