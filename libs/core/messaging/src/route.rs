//! Routing keys understood by the pipeline.

use std::fmt;

/// Knowledge-base job actions forwarded to the KB proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KbAction {
    Ingest,
    Reprocess,
    Upsert,
    Refresh,
}

impl KbAction {
    pub const ALL: [KbAction; 4] = [
        KbAction::Ingest,
        KbAction::Reprocess,
        KbAction::Upsert,
        KbAction::Refresh,
    ];

    /// Path segment on the KB proxy (`/internal/jobs/kb/<segment>`).
    pub fn as_str(&self) -> &'static str {
        match self {
            KbAction::Ingest => "ingest",
            KbAction::Reprocess => "reprocess",
            KbAction::Upsert => "upsert",
            KbAction::Refresh => "refresh",
        }
    }

    pub fn routing_key(&self) -> &'static str {
        match self {
            KbAction::Ingest => "kb.ingest",
            KbAction::Reprocess => "kb.reprocess",
            KbAction::Upsert => "kb.upsert",
            KbAction::Refresh => "kb.refresh",
        }
    }
}

impl fmt::Display for KbAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A routing key resolved to the dispatch branch it selects.
///
/// Keys outside the known set parse to [`JobRoute::Unknown`] rather than
/// failing, so a consumer can still settle the delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum JobRoute {
    MailOtp,
    LogEvent,
    Kb(KbAction),
    LlmBatch,
    AnalyticsRollup,
    Unknown(String),
}

impl JobRoute {
    pub fn parse(routing_key: &str) -> Self {
        match routing_key {
            "mail.otp" => JobRoute::MailOtp,
            "log.event" => JobRoute::LogEvent,
            "kb.ingest" => JobRoute::Kb(KbAction::Ingest),
            "kb.reprocess" => JobRoute::Kb(KbAction::Reprocess),
            "kb.upsert" => JobRoute::Kb(KbAction::Upsert),
            "kb.refresh" => JobRoute::Kb(KbAction::Refresh),
            "llm.batch" => JobRoute::LlmBatch,
            "analytics.rollup" => JobRoute::AnalyticsRollup,
            other => JobRoute::Unknown(other.to_string()),
        }
    }

    pub fn routing_key(&self) -> &str {
        match self {
            JobRoute::MailOtp => "mail.otp",
            JobRoute::LogEvent => "log.event",
            JobRoute::Kb(action) => action.routing_key(),
            JobRoute::LlmBatch => "llm.batch",
            JobRoute::AnalyticsRollup => "analytics.rollup",
            JobRoute::Unknown(key) => key,
        }
    }

    /// Whether publishers may emit this key.
    pub fn is_known(&self) -> bool {
        !matches!(self, JobRoute::Unknown(_))
    }

    /// Recognized keys that no consumer implements yet.
    pub fn is_unimplemented(&self) -> bool {
        matches!(
            self,
            JobRoute::LlmBatch | JobRoute::AnalyticsRollup | JobRoute::Unknown(_)
        )
    }
}

impl From<&str> for JobRoute {
    fn from(routing_key: &str) -> Self {
        JobRoute::parse(routing_key)
    }
}

impl fmt::Display for JobRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.routing_key())
    }
}
