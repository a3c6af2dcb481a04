//! Exchange and queue declarations.
//!
//! Every declaration is idempotent and re-run on each (re)connect, so the
//! topology exists before anything is published or bound.

use crate::dispatch::FailurePolicy;
use crate::error::MessagingError;
use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable},
    Channel, ExchangeKind,
};
use tracing::debug;

/// The single durable topic exchange all jobs are published to.
pub const JOBS_EXCHANGE: &str = "jobs";

/// Direct exchange receiving messages rejected without requeue.
pub const DEAD_LETTER_EXCHANGE: &str = "jobs.dlx";

/// Queue definition trait (type-safe constants).
///
/// ```rust,ignore
/// struct BillingQueue;
///
/// impl QueueDef for BillingQueue {
///     const QUEUE_NAME: &'static str = "billing-jobs";
///     const BINDINGS: &'static [&'static str] = &["billing.*"];
///     const ON_FAILURE: FailurePolicy = FailurePolicy::Drop;
/// }
/// ```
pub trait QueueDef {
    /// Durable queue name
    const QUEUE_NAME: &'static str;

    /// Routing-key patterns bound on the `jobs` exchange
    const BINDINGS: &'static [&'static str];

    /// What happens to a delivery whose handler fails
    const ON_FAILURE: FailurePolicy;
}

/// OTP and other transactional mail. Handler failures are requeued.
pub struct MailQueue;

impl QueueDef for MailQueue {
    const QUEUE_NAME: &'static str = "mail-service";
    const BINDINGS: &'static [&'static str] = &["mail.*"];
    const ON_FAILURE: FailurePolicy = FailurePolicy::Requeue;
}

/// Knowledge-base jobs plus the job families that have no handler yet.
///
/// KB writes are not idempotent against the vector store, so failures are
/// dropped and reported instead of redelivered.
pub struct KbQueue;

impl QueueDef for KbQueue {
    const QUEUE_NAME: &'static str = "kb-jobs";
    const BINDINGS: &'static [&'static str] = &["kb.*", "llm.*", "analytics.*"];
    const ON_FAILURE: FailurePolicy = FailurePolicy::Drop;
}

/// Application log events.
pub struct LogQueue;

impl QueueDef for LogQueue {
    const QUEUE_NAME: &'static str = "logger-service";
    const BINDINGS: &'static [&'static str] = &["log.*"];
    const ON_FAILURE: FailurePolicy = FailurePolicy::Drop;
}

/// Runtime form of a [`QueueDef`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub bindings: Vec<String>,
    pub on_failure: FailurePolicy,
}

impl QueueSpec {
    pub fn new(
        name: impl Into<String>,
        bindings: impl IntoIterator<Item = impl Into<String>>,
        on_failure: FailurePolicy,
    ) -> Self {
        Self {
            name: name.into(),
            bindings: bindings.into_iter().map(Into::into).collect(),
            on_failure,
        }
    }

    pub fn from_def<D: QueueDef>() -> Self {
        Self::new(D::QUEUE_NAME, D::BINDINGS.iter().copied(), D::ON_FAILURE)
    }

    /// Name of the companion dead-letter queue.
    pub fn dead_letter_queue(&self) -> String {
        format!("{}.dlq", self.name)
    }
}

fn durable_queue() -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable: true,
        auto_delete: false,
        exclusive: false,
        nowait: false,
        passive: false,
    }
}

fn durable_exchange() -> ExchangeDeclareOptions {
    ExchangeDeclareOptions {
        durable: true,
        auto_delete: false,
        internal: false,
        nowait: false,
        passive: false,
    }
}

/// Declare the `jobs` topic exchange.
pub async fn declare_exchange(channel: &Channel) -> Result<(), MessagingError> {
    channel
        .exchange_declare(
            JOBS_EXCHANGE,
            ExchangeKind::Topic,
            durable_exchange(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| MessagingError::Topology(format!("declare exchange {}: {}", JOBS_EXCHANGE, e)))?;

    debug!(exchange = JOBS_EXCHANGE, "Exchange declared");
    Ok(())
}

/// Declare `spec`'s durable queue and bind it to every pattern.
///
/// With `dead_letter` set, the queue routes rejected messages to
/// `<queue>.dlq` through [`DEAD_LETTER_EXCHANGE`]. Existing queues declared
/// without those arguments will refuse the redeclare, so the flag must match
/// what is already on the broker.
pub async fn declare_queue(
    channel: &Channel,
    spec: &QueueSpec,
    dead_letter: bool,
) -> Result<(), MessagingError> {
    let topology_err = |what: &str, e: lapin::Error| {
        MessagingError::Topology(format!("{} for queue {}: {}", what, spec.name, e))
    };

    let mut args = FieldTable::default();

    if dead_letter {
        let dlq = spec.dead_letter_queue();

        channel
            .exchange_declare(
                DEAD_LETTER_EXCHANGE,
                ExchangeKind::Direct,
                durable_exchange(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| topology_err("declare dead-letter exchange", e))?;

        channel
            .queue_declare(&dlq, durable_queue(), FieldTable::default())
            .await
            .map_err(|e| topology_err("declare dead-letter queue", e))?;

        channel
            .queue_bind(
                &dlq,
                DEAD_LETTER_EXCHANGE,
                &spec.name,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| topology_err("bind dead-letter queue", e))?;

        args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(DEAD_LETTER_EXCHANGE.into()),
        );
        args.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(spec.name.clone().into()),
        );
    }

    channel
        .queue_declare(&spec.name, durable_queue(), args)
        .await
        .map_err(|e| topology_err("declare queue", e))?;

    for pattern in &spec.bindings {
        channel
            .queue_bind(
                &spec.name,
                JOBS_EXCHANGE,
                pattern,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| topology_err("bind", e))?;
    }

    debug!(
        queue = %spec.name,
        bindings = ?spec.bindings,
        dead_letter,
        "Queue declared"
    );
    Ok(())
}
