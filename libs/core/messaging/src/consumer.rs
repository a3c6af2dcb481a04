//! Queue consumer: pulls deliveries and runs them through [`dispatch`].

use crate::dispatch::{dispatch, Disposition, JobHandler, JobReport, JobStatus};
use crate::error::MessagingError;
use crate::metrics::JobMetrics;
use crate::topology::{declare_queue, QueueSpec};
use futures::StreamExt;
use lapin::{
    message::Delivery,
    options::{BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions},
    types::FieldTable,
    Channel,
};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Binds one queue to one [`JobHandler`].
#[derive(Clone)]
pub struct QueueConsumer {
    spec: QueueSpec,
    handler: Arc<dyn JobHandler>,
    metrics: JobMetrics,
}

impl QueueConsumer {
    pub fn new(spec: QueueSpec, handler: Arc<dyn JobHandler>, metrics: JobMetrics) -> Self {
        Self {
            spec,
            handler,
            metrics,
        }
    }

    pub fn queue(&self) -> &str {
        &self.spec.name
    }

    /// Declare the queue and consume it on `channel` until shutdown or the
    /// delivery stream ends.
    ///
    /// `started` receives one message once the consumer is registered with
    /// the broker.
    ///
    /// Each delivery runs in its own task; at most `prefetch` run at once.
    /// On shutdown the consumer is cancelled and in-flight tasks are awaited.
    /// A stream that ends for any other reason is an error so the caller can
    /// reconnect.
    pub async fn run(
        &self,
        channel: &Channel,
        prefetch: u16,
        dead_letter: bool,
        started: mpsc::Sender<()>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), MessagingError> {
        let prefetch = prefetch.max(1);

        channel
            .basic_qos(prefetch, BasicQosOptions { global: false })
            .await
            .map_err(|e| MessagingError::Consume(format!("basic_qos on {}: {}", self.spec.name, e)))?;

        declare_queue(channel, &self.spec, dead_letter).await?;

        let tag = format!("{}-{}", self.spec.name, Uuid::new_v4().simple());
        let mut deliveries = channel
            .basic_consume(
                &self.spec.name,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| MessagingError::Consume(format!("basic_consume on {}: {}", self.spec.name, e)))?;

        info!(
            queue = %self.spec.name,
            handler = self.handler.name(),
            prefetch,
            "Consumer started"
        );
        let _ = started.send(()).await;
        drop(started);

        let semaphore = Arc::new(Semaphore::new(usize::from(prefetch)));

        let result = loop {
            // Hold a permit before pulling so shutdown is never stuck behind a full pool.
            let permit = tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break Ok(()),
                permit = semaphore.clone().acquire_owned() => {
                    permit.map_err(|e| MessagingError::Consume(e.to_string()))?
                }
            };

            tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break Ok(()),
                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => {
                        let consumer = self.clone();
                        tokio::spawn(async move {
                            consumer.process(delivery).await;
                            drop(permit);
                        });
                    }
                    Some(Err(e)) => {
                        break Err(MessagingError::Consume(format!(
                            "delivery stream for {} failed: {}",
                            self.spec.name, e
                        )));
                    }
                    None => {
                        break Err(MessagingError::Consume(format!(
                            "delivery stream for {} closed",
                            self.spec.name
                        )));
                    }
                },
            }
        };

        if result.is_ok() {
            info!(queue = %self.spec.name, "Shutdown signal received, stopping consumer");
            if let Err(e) = channel.basic_cancel(&tag, BasicCancelOptions::default()).await {
                warn!(queue = %self.spec.name, error = %e, "Consumer cancel failed");
            }
        }

        // Let in-flight handlers settle their deliveries before returning.
        if let Ok(all) = semaphore.acquire_many(u32::from(prefetch)).await {
            drop(all);
        }

        result
    }

    async fn process(&self, delivery: Delivery) {
        let routing_key = delivery.routing_key.as_str();
        let report = dispatch(
            &self.spec.name,
            self.spec.on_failure,
            self.handler.as_ref(),
            routing_key,
            &delivery.data,
            delivery.redelivered,
        )
        .await;

        if let Err(e) = settle(&delivery, report.disposition).await {
            error!(
                correlation_id = %report.correlation_id,
                queue = %report.queue,
                routing_key = %report.routing_key,
                disposition = report.disposition.as_str(),
                error = %e,
                "Failed to settle delivery"
            );
        }

        self.metrics.job_completed(&report);
        log_report(&report);
    }
}

/// Broker-side outcome of a [`Disposition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Ack,
    Nack { requeue: bool },
}

fn settlement(disposition: Disposition) -> Settlement {
    match disposition {
        Disposition::Ack | Disposition::Drop => Settlement::Ack,
        Disposition::Requeue => Settlement::Nack { requeue: true },
        Disposition::Reject => Settlement::Nack { requeue: false },
    }
}

async fn settle(delivery: &Delivery, disposition: Disposition) -> Result<(), lapin::Error> {
    match settlement(disposition) {
        Settlement::Ack => delivery.ack(BasicAckOptions { multiple: false }).await,
        Settlement::Nack { requeue } => {
            delivery
                .nack(BasicNackOptions {
                    multiple: false,
                    requeue,
                })
                .await
        }
    }
}

fn log_report(report: &JobReport) {
    let duration_ms = report.duration.as_millis() as u64;
    let job_id = report.job_id.as_deref().unwrap_or("-");
    let error = report.error.as_deref().unwrap_or("");

    match report.status {
        JobStatus::Success => info!(
            correlation_id = %report.correlation_id,
            queue = %report.queue,
            routing_key = %report.routing_key,
            job_type = %report.job_type,
            job_id,
            duration_ms,
            "Job processed"
        ),
        JobStatus::Skipped => info!(
            correlation_id = %report.correlation_id,
            queue = %report.queue,
            routing_key = %report.routing_key,
            job_type = %report.job_type,
            job_id,
            duration_ms,
            reason = error,
            "Job skipped"
        ),
        JobStatus::Failed => error!(
            correlation_id = %report.correlation_id,
            queue = %report.queue,
            routing_key = %report.routing_key,
            job_type = %report.job_type,
            job_id,
            duration_ms,
            disposition = report.disposition.as_str(),
            error,
            "Job failed"
        ),
        JobStatus::Malformed => warn!(
            correlation_id = %report.correlation_id,
            queue = %report.queue,
            routing_key = %report.routing_key,
            duration_ms,
            error,
            "Malformed job rejected"
        ),
    }
}
