//! Per-message dispatch state machine.
//!
//! ```text
//! received ──parse──▶ parsed ──handler──▶ dispatched ──▶ Ack | Requeue | Drop
//!     │
//!     └── malformed JSON ──────────────────────────────▶ Reject
//! ```
//!
//! [`dispatch`] is broker-agnostic: it takes the raw routing key and body and
//! returns a [`JobReport`] carrying the single [`Disposition`] the consumer
//! must apply. Keeping the decision separate from the lapin delivery is what
//! guarantees a message is settled exactly once.

use crate::route::JobRoute;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

/// What a queue does with a delivery whose handler failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Nack with requeue: the broker redelivers until the handler succeeds.
    Requeue,
    /// Ack anyway: the failure is logged and reported, never retried.
    Drop,
}

/// How a delivery is settled with the broker. Exactly one per message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// basic.ack after success
    Ack,
    /// basic.nack requeue=true after a retryable failure
    Requeue,
    /// basic.ack after a failure that must not be retried
    Drop,
    /// basic.nack requeue=false for payloads that can never succeed
    Reject,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Ack => "ack",
            Disposition::Requeue => "nack_requeue",
            Disposition::Drop => "ack_dropped",
            Disposition::Reject => "nack_reject",
        }
    }
}

/// Terminal status of one message, used as the `status` metric label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Success,
    Skipped,
    Failed,
    Malformed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Success => "success",
            JobStatus::Skipped => "skipped",
            JobStatus::Failed => "failed",
            JobStatus::Malformed => "malformed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed delivery handed to a [`JobHandler`].
#[derive(Debug, Clone)]
pub struct IncomingJob {
    pub correlation_id: Uuid,
    pub routing_key: String,
    pub route: JobRoute,
    pub payload: Value,
    pub redelivered: bool,
}

impl IncomingJob {
    pub fn new(routing_key: impl Into<String>, payload: Value) -> Self {
        let routing_key = routing_key.into();
        Self {
            correlation_id: Uuid::new_v4(),
            route: JobRoute::parse(&routing_key),
            routing_key,
            payload,
            redelivered: false,
        }
    }

    /// `jobId` carried by KB-style payloads.
    pub fn job_id(&self) -> Option<&str> {
        self.payload.get("jobId").and_then(Value::as_str)
    }

    /// Payload `type` discriminator, if any.
    pub fn payload_type(&self) -> Option<&str> {
        self.payload.get("type").and_then(Value::as_str)
    }
}

/// Successful handler result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// The downstream action ran.
    Completed,
    /// Nothing to do for this payload; acked without side effects.
    Skipped { reason: String },
}

impl HandlerOutcome {
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped {
            reason: reason.into(),
        }
    }
}

/// Handler failure.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The payload can never be processed; the queue's failure policy is bypassed.
    #[error("malformed payload: {0}")]
    Malformed(String),

    /// The downstream action failed; the queue's failure policy applies.
    #[error("{0}")]
    Failed(String),

    /// No handler exists for the routing key.
    #[error("Handler not implemented for routing key '{routing_key}'")]
    NotImplemented { routing_key: String },
}

impl HandlerError {
    pub fn malformed(message: impl fmt::Display) -> Self {
        Self::Malformed(message.to_string())
    }

    pub fn failed(message: impl fmt::Display) -> Self {
        Self::Failed(message.to_string())
    }
}

/// Queue-specific job handler.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &IncomingJob) -> Result<HandlerOutcome, HandlerError>;

    /// Handler name for logs.
    fn name(&self) -> &'static str;

    /// Value of the `type` metric label. Defaults to the routing key.
    fn job_type(&self, job: &IncomingJob) -> String {
        job.routing_key.clone()
    }
}

/// Everything known about a settled message.
#[derive(Debug, Clone)]
pub struct JobReport {
    pub correlation_id: Uuid,
    pub queue: String,
    pub routing_key: String,
    pub job_type: String,
    pub job_id: Option<String>,
    pub status: JobStatus,
    pub disposition: Disposition,
    pub duration: Duration,
    pub error: Option<String>,
}

/// Parse, dispatch and decide the settlement of one delivery.
pub async fn dispatch(
    queue: &str,
    on_failure: FailurePolicy,
    handler: &dyn JobHandler,
    routing_key: &str,
    body: &[u8],
    redelivered: bool,
) -> JobReport {
    let start = Instant::now();

    let payload: Value = match serde_json::from_slice(body) {
        Ok(payload) => payload,
        Err(e) => {
            return JobReport {
                correlation_id: Uuid::new_v4(),
                queue: queue.to_string(),
                routing_key: routing_key.to_string(),
                job_type: "malformed".to_string(),
                job_id: None,
                status: JobStatus::Malformed,
                disposition: Disposition::Reject,
                duration: start.elapsed(),
                error: Some(format!("invalid JSON: {}", e)),
            };
        }
    };

    let mut job = IncomingJob::new(routing_key, payload);
    job.redelivered = redelivered;

    let job_type = handler.job_type(&job);
    let job_id = job.job_id().map(str::to_string);
    let result = handler.handle(&job).await;

    let (status, disposition, error) = match result {
        Ok(HandlerOutcome::Completed) => (JobStatus::Success, Disposition::Ack, None),
        Ok(HandlerOutcome::Skipped { reason }) => {
            (JobStatus::Skipped, Disposition::Ack, Some(reason))
        }
        Err(HandlerError::Malformed(message)) => (
            JobStatus::Malformed,
            Disposition::Reject,
            Some(format!("malformed payload: {}", message)),
        ),
        Err(e) => {
            let disposition = match on_failure {
                FailurePolicy::Requeue => Disposition::Requeue,
                FailurePolicy::Drop => Disposition::Drop,
            };
            (JobStatus::Failed, disposition, Some(e.to_string()))
        }
    };

    JobReport {
        correlation_id: job.correlation_id,
        queue: queue.to_string(),
        routing_key: job.routing_key,
        job_type,
        job_id,
        status,
        disposition,
        duration: start.elapsed(),
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Handler returning a fixed result and counting calls.
    struct ScriptedHandler {
        calls: AtomicUsize,
        result: fn() -> Result<HandlerOutcome, HandlerError>,
    }

    impl ScriptedHandler {
        fn new(result: fn() -> Result<HandlerOutcome, HandlerError>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                result,
            }
        }
    }

    #[async_trait]
    impl JobHandler for ScriptedHandler {
        async fn handle(&self, _job: &IncomingJob) -> Result<HandlerOutcome, HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.result)()
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    #[tokio::test]
    async fn test_success_is_acked() {
        let handler = ScriptedHandler::new(|| Ok(HandlerOutcome::Completed));
        let report = dispatch(
            "kb-jobs",
            FailurePolicy::Drop,
            &handler,
            "kb.ingest",
            br#"{"jobId":"j-1"}"#,
            false,
        )
        .await;

        assert_eq!(report.status, JobStatus::Success);
        assert_eq!(report.disposition, Disposition::Ack);
        assert_eq!(report.job_id.as_deref(), Some("j-1"));
        assert_eq!(report.job_type, "kb.ingest");
        assert!(report.error.is_none());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_malformed_json_is_rejected_without_calling_handler() {
        for policy in [FailurePolicy::Requeue, FailurePolicy::Drop] {
            let handler = ScriptedHandler::new(|| Ok(HandlerOutcome::Completed));
            let report = dispatch("mail-service", policy, &handler, "mail.otp", b"{not json", false)
                .await;

            assert_eq!(report.status, JobStatus::Malformed);
            assert_eq!(report.disposition, Disposition::Reject);
            assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        }
    }

    #[tokio::test]
    async fn test_failure_follows_queue_policy() {
        let handler = ScriptedHandler::new(|| Err(HandlerError::failed("smtp timeout")));

        let mail = dispatch("mail-service", FailurePolicy::Requeue, &handler, "mail.otp", b"{}", false)
            .await;
        assert_eq!(mail.status, JobStatus::Failed);
        assert_eq!(mail.disposition, Disposition::Requeue);
        assert_eq!(mail.error.as_deref(), Some("smtp timeout"));

        let kb = dispatch("kb-jobs", FailurePolicy::Drop, &handler, "kb.upsert", b"{}", true).await;
        assert_eq!(kb.status, JobStatus::Failed);
        assert_eq!(kb.disposition, Disposition::Drop);
    }

    #[tokio::test]
    async fn test_handler_malformed_overrides_requeue_policy() {
        let handler = ScriptedHandler::new(|| Err(HandlerError::malformed("missing field `otp`")));
        let report = dispatch("mail-service", FailurePolicy::Requeue, &handler, "mail.otp", b"{}", false)
            .await;

        assert_eq!(report.status, JobStatus::Malformed);
        assert_eq!(report.disposition, Disposition::Reject);
    }

    #[tokio::test]
    async fn test_not_implemented_is_a_failure() {
        let handler = ScriptedHandler::new(|| {
            Err(HandlerError::NotImplemented {
                routing_key: "llm.batch".to_string(),
            })
        });
        let report = dispatch("kb-jobs", FailurePolicy::Drop, &handler, "llm.batch", b"{}", false).await;

        assert_eq!(report.status, JobStatus::Failed);
        assert_eq!(report.disposition, Disposition::Drop);
        assert!(report.error.unwrap().contains("not implemented"));
    }

    #[tokio::test]
    async fn test_skipped_is_acked() {
        let handler = ScriptedHandler::new(|| Ok(HandlerOutcome::skipped("unsupported type")));
        let report = dispatch("mail-service", FailurePolicy::Requeue, &handler, "mail.otp", b"{}", false)
            .await;

        assert_eq!(report.status, JobStatus::Skipped);
        assert_eq!(report.disposition, Disposition::Ack);
    }

    #[test]
    fn test_incoming_job_accessors() {
        let job = IncomingJob::new(
            "mail.otp",
            serde_json::json!({"type": "SEND_OTP", "jobId": 42}),
        );
        assert_eq!(job.route, JobRoute::MailOtp);
        assert_eq!(job.payload_type(), Some("SEND_OTP"));
        // Non-string ids are ignored
        assert_eq!(job.job_id(), None);
    }

    #[test]
    fn test_fresh_correlation_ids() {
        let a = IncomingJob::new("log.event", Value::Null);
        let b = IncomingJob::new("log.event", Value::Null);
        assert_ne!(a.correlation_id, b.correlation_id);
    }
}
