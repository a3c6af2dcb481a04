//! Per-queue job handlers.

use crate::adapters::{KbService, MailSender};
use crate::models::{JobStatusReport, SendOtpJob, NOT_IMPLEMENTED, SEND_OTP};
use crate::templates::OtpTemplates;
use async_trait::async_trait;
use messaging::{HandlerError, HandlerOutcome, IncomingJob, JobHandler, JobRoute};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// `mail-service` queue: renders and sends OTP mail.
pub struct MailHandler {
    sender: Arc<dyn MailSender>,
    templates: OtpTemplates,
}

impl MailHandler {
    pub fn new(sender: Arc<dyn MailSender>, templates: OtpTemplates) -> Self {
        Self { sender, templates }
    }
}

#[async_trait]
impl JobHandler for MailHandler {
    async fn handle(&self, job: &IncomingJob) -> Result<HandlerOutcome, HandlerError> {
        if job.payload_type() != Some(SEND_OTP) {
            return Ok(HandlerOutcome::skipped(format!(
                "unsupported mail type {:?}",
                job.payload_type()
            )));
        }

        let otp: SendOtpJob =
            serde_json::from_value(job.payload.clone()).map_err(HandlerError::malformed)?;
        if otp.to.trim().is_empty() || otp.otp.trim().is_empty() {
            return Err(HandlerError::malformed("`to` and `otp` must be non-empty"));
        }

        let mail = self
            .templates
            .render_otp(&otp)
            .map_err(HandlerError::failed)?;
        self.sender.send(&mail).await.map_err(HandlerError::failed)?;

        debug!(
            correlation_id = %job.correlation_id,
            purpose = ?otp.purpose,
            redelivered = job.redelivered,
            "OTP mail sent"
        );
        Ok(HandlerOutcome::Completed)
    }

    fn name(&self) -> &'static str {
        "mail"
    }

    fn job_type(&self, job: &IncomingJob) -> String {
        job.payload_type().unwrap_or("unknown").to_string()
    }
}

/// `kb-jobs` queue: forwards KB actions, reports unimplemented job families.
pub struct KbHandler {
    kb: Arc<dyn KbService>,
}

impl KbHandler {
    pub fn new(kb: Arc<dyn KbService>) -> Self {
        Self { kb }
    }

    async fn reject_unimplemented(&self, job: &IncomingJob) -> HandlerError {
        if let Some(job_id) = job.job_id() {
            let report = JobStatusReport::failed(job_id, &job.routing_key, NOT_IMPLEMENTED);
            // Best effort: the delivery is dropped either way.
            if let Err(e) = self.kb.report_status(&report).await {
                warn!(
                    correlation_id = %job.correlation_id,
                    job_id,
                    routing_key = %job.routing_key,
                    error = %e,
                    "Failed to report job status"
                );
            }
        }

        HandlerError::NotImplemented {
            routing_key: job.routing_key.clone(),
        }
    }
}

#[async_trait]
impl JobHandler for KbHandler {
    async fn handle(&self, job: &IncomingJob) -> Result<HandlerOutcome, HandlerError> {
        match &job.route {
            JobRoute::Kb(action) => {
                self.kb
                    .forward(*action, &job.payload)
                    .await
                    .map_err(HandlerError::failed)?;
                Ok(HandlerOutcome::Completed)
            }
            JobRoute::LlmBatch
            | JobRoute::AnalyticsRollup
            | JobRoute::MailOtp
            | JobRoute::LogEvent
            | JobRoute::Unknown(_) => Err(self.reject_unimplemented(job).await),
        }
    }

    fn name(&self) -> &'static str {
        "kb"
    }
}

/// `logger-service` queue: re-emits application log events as tracing events.
#[derive(Debug, Default)]
pub struct LogHandler;

#[async_trait]
impl JobHandler for LogHandler {
    async fn handle(&self, job: &IncomingJob) -> Result<HandlerOutcome, HandlerError> {
        let Value::Object(event) = &job.payload else {
            return Err(HandlerError::malformed("log event must be a JSON object"));
        };

        let field = |key: &str| event.get(key).and_then(Value::as_str).unwrap_or_default();
        let service = field("service");
        let message = field("message");
        let context = event
            .get("meta")
            .map(Value::to_string)
            .unwrap_or_default();

        match field("level").to_ascii_lowercase().as_str() {
            "error" | "fatal" => error!(target: "app_events", service, context, "{}", message),
            "warn" | "warning" => warn!(target: "app_events", service, context, "{}", message),
            "debug" | "trace" => debug!(target: "app_events", service, context, "{}", message),
            _ => info!(target: "app_events", service, context, "{}", message),
        }

        Ok(HandlerOutcome::Completed)
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{MockKbService, MockMailSender};
    use crate::error::AdapterError;
    use messaging::{dispatch, Disposition, FailurePolicy, JobStatus, KbQueue, MailQueue, QueueDef};
    use mockall::predicate::eq;
    use serde_json::json;

    fn templates() -> OtpTemplates {
        OtpTemplates::new(None, "Helpdesk").unwrap()
    }

    fn downstream_error() -> AdapterError {
        AdapterError::Status {
            url: "http://mail/send".to_string(),
            status: 503,
            body: "busy".to_string(),
        }
    }

    async fn run_mail(handler: &MailHandler, body: Value) -> messaging::JobReport {
        dispatch(
            MailQueue::QUEUE_NAME,
            MailQueue::ON_FAILURE,
            handler,
            "mail.otp",
            body.to_string().as_bytes(),
            false,
        )
        .await
    }

    async fn run_kb(handler: &KbHandler, routing_key: &str, body: Value) -> messaging::JobReport {
        dispatch(
            KbQueue::QUEUE_NAME,
            KbQueue::ON_FAILURE,
            handler,
            routing_key,
            body.to_string().as_bytes(),
            false,
        )
        .await
    }

    #[tokio::test]
    async fn test_send_otp_renders_and_sends_once() {
        let mut sender = MockMailSender::new();
        sender
            .expect_send()
            .withf(|mail| mail.to == "agent@example.com" && mail.html.contains("123456"))
            .times(1)
            .returning(|_| Ok(()));

        let handler = MailHandler::new(Arc::new(sender), templates());
        let report = run_mail(
            &handler,
            json!({"type": "SEND_OTP", "to": "agent@example.com", "otp": "123456", "purpose": "login"}),
        )
        .await;

        assert_eq!(report.status, JobStatus::Success);
        assert_eq!(report.disposition, Disposition::Ack);
        assert_eq!(report.job_type, "SEND_OTP");
        assert_eq!(report.queue, "mail-service");
    }

    #[tokio::test]
    async fn test_mail_failure_is_requeued() {
        let mut sender = MockMailSender::new();
        sender
            .expect_send()
            .times(1)
            .returning(|_| Err(downstream_error()));

        let handler = MailHandler::new(Arc::new(sender), templates());
        let report = run_mail(
            &handler,
            json!({"type": "SEND_OTP", "to": "agent@example.com", "otp": "123456"}),
        )
        .await;

        assert_eq!(report.status, JobStatus::Failed);
        assert_eq!(report.disposition, Disposition::Requeue);
        assert!(report.error.unwrap().contains("503"));
    }

    #[tokio::test]
    async fn test_unknown_mail_type_is_acked_without_sending() {
        let mut sender = MockMailSender::new();
        sender.expect_send().never();

        let handler = MailHandler::new(Arc::new(sender), templates());
        let report = run_mail(&handler, json!({"type": "WELCOME", "to": "a@b.c"})).await;

        assert_eq!(report.status, JobStatus::Skipped);
        assert_eq!(report.disposition, Disposition::Ack);
        assert_eq!(report.job_type, "WELCOME");
    }

    #[tokio::test]
    async fn test_incomplete_send_otp_is_rejected() {
        let mut sender = MockMailSender::new();
        sender.expect_send().never();

        let handler = MailHandler::new(Arc::new(sender), templates());

        let missing = run_mail(&handler, json!({"type": "SEND_OTP", "to": "a@b.c"})).await;
        assert_eq!(missing.disposition, Disposition::Reject);

        let blank = run_mail(&handler, json!({"type": "SEND_OTP", "to": "a@b.c", "otp": ""})).await;
        assert_eq!(blank.status, JobStatus::Malformed);
        assert_eq!(blank.disposition, Disposition::Reject);
    }

    #[tokio::test]
    async fn test_kb_actions_forward_exact_payload() {
        let payload = json!({"jobId": "j-1", "kbId": "kb-7", "docs": ["a.pdf"]});

        for action in messaging::KbAction::ALL {
            let mut kb = MockKbService::new();
            kb.expect_forward()
                .with(eq(action), eq(payload.clone()))
                .times(1)
                .returning(|_, _| Ok(()));
            kb.expect_report_status().never();

            let handler = KbHandler::new(Arc::new(kb));
            let report = run_kb(&handler, action.routing_key(), payload.clone()).await;

            assert_eq!(report.status, JobStatus::Success, "{}", action);
            assert_eq!(report.disposition, Disposition::Ack);
            assert_eq!(report.job_id.as_deref(), Some("j-1"));
        }
    }

    #[tokio::test]
    async fn test_kb_failure_is_dropped() {
        let mut kb = MockKbService::new();
        kb.expect_forward()
            .times(1)
            .returning(|_, _| Err(downstream_error()));

        let handler = KbHandler::new(Arc::new(kb));
        let report = run_kb(&handler, "kb.upsert", json!({"jobId": "j-2"})).await;

        assert_eq!(report.status, JobStatus::Failed);
        assert_eq!(report.disposition, Disposition::Drop);
    }

    #[tokio::test]
    async fn test_llm_batch_reports_not_implemented_once() {
        let mut kb = MockKbService::new();
        kb.expect_forward().never();
        kb.expect_report_status()
            .with(eq(JobStatusReport {
                job_id: "abc".to_string(),
                status: "failed".to_string(),
                job_type: "llm.batch".to_string(),
                error: Some("Handler not implemented".to_string()),
            }))
            .times(1)
            .returning(|_| Ok(()));

        let handler = KbHandler::new(Arc::new(kb));
        let report = run_kb(&handler, "llm.batch", json!({"jobId": "abc"})).await;

        assert_eq!(report.status, JobStatus::Failed);
        assert_eq!(report.disposition, Disposition::Drop);
    }

    #[tokio::test]
    async fn test_unknown_key_without_job_id_skips_report() {
        let mut kb = MockKbService::new();
        kb.expect_report_status().never();

        let handler = KbHandler::new(Arc::new(kb));
        let report = run_kb(&handler, "analytics.rollup", json!({"window": "1d"})).await;

        assert_eq!(report.status, JobStatus::Failed);
        assert_eq!(report.disposition, Disposition::Drop);
    }

    #[tokio::test]
    async fn test_unknown_key_still_dropped_when_report_fails() {
        let mut kb = MockKbService::new();
        kb.expect_report_status()
            .withf(|report| report.job_type == "kb.purge" && report.job_id == "r-1")
            .times(1)
            .returning(|_| Err(downstream_error()));

        let handler = KbHandler::new(Arc::new(kb));
        let report = run_kb(&handler, "kb.purge", json!({"jobId": "r-1"})).await;

        assert_eq!(report.disposition, Disposition::Drop);
        assert!(report.error.unwrap().contains("kb.purge"));
    }

    #[tokio::test]
    async fn test_log_events() {
        let handler = LogHandler;

        let ok = dispatch(
            "logger-service",
            FailurePolicy::Drop,
            &handler,
            "log.event",
            br#"{"level":"warn","service":"api","message":"slow query","meta":{"ms":900}}"#,
            false,
        )
        .await;
        assert_eq!(ok.disposition, Disposition::Ack);

        let not_object = dispatch(
            "logger-service",
            FailurePolicy::Drop,
            &handler,
            "log.event",
            b"\"just a string\"",
            false,
        )
        .await;
        assert_eq!(not_object.disposition, Disposition::Reject);
    }
}
