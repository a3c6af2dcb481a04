//! Prometheus metrics for the job pipeline.

use crate::config::MetricsConfig;
use crate::dispatch::JobReport;
use crate::error::MessagingError;
use metrics::{counter, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use once_cell::sync::OnceCell;

pub use metrics_exporter_prometheus::PrometheusHandle;

static PROMETHEUS: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder once per process.
///
/// Returns `None` when metrics are disabled; the `metrics` macros are then
/// no-ops. Later calls return the handle installed by the first one.
pub fn init_metrics(config: &MetricsConfig) -> Result<Option<PrometheusHandle>, MessagingError> {
    if !config.enabled {
        return Ok(None);
    }

    PROMETHEUS
        .get_or_try_init(|| {
            let mut builder = PrometheusBuilder::new();
            if !config.buckets.is_empty() {
                builder = builder
                    .set_buckets_for_metric(
                        Matcher::Full(JobMetrics::duration_name(&config.prefix)),
                        &config.buckets,
                    )
                    .map_err(|e| MessagingError::Metrics(e.to_string()))?;
            }
            builder
                .install_recorder()
                .map_err(|e| MessagingError::Metrics(e.to_string()))
        })
        .map(|handle| Some(handle.clone()))
}

/// Job and publish counters, labelled per queue.
#[derive(Debug, Clone, Default)]
pub struct JobMetrics {
    prefix: String,
}

impl JobMetrics {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn from_config(config: &MetricsConfig) -> Self {
        Self::new(config.prefix.clone())
    }

    fn duration_name(prefix: &str) -> String {
        format!("{}job_duration_seconds", prefix)
    }

    /// Record a settled message: `jobs_total` and `job_duration_seconds`.
    pub fn job_completed(&self, report: &JobReport) {
        counter!(
            format!("{}jobs_total", self.prefix),
            "queue" => report.queue.clone(),
            "type" => report.job_type.clone(),
            "status" => report.status.as_str()
        )
        .increment(1);

        histogram!(
            Self::duration_name(&self.prefix),
            "queue" => report.queue.clone(),
            "type" => report.job_type.clone(),
            "status" => report.status.as_str()
        )
        .record(report.duration.as_secs_f64());
    }

    /// Record a message handed to the broker.
    pub fn message_published(&self, routing_key: &str) {
        counter!(
            format!("{}published_total", self.prefix),
            "routing_key" => routing_key.to_string()
        )
        .increment(1);
    }
}
