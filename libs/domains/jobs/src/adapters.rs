//! Downstream action adapters.
//!
//! Each trait is the seam the handlers depend on; the `Http*` types are the
//! production implementations posting to internal endpoints through
//! [`WorkerClient`].

use crate::client::WorkerClient;
use crate::error::AdapterError;
use crate::models::{JobStatusReport, OutgoingMail};
use async_trait::async_trait;
use messaging::KbAction;
use serde_json::Value;

/// Sends rendered mail through the mail service.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MailSender: Send + Sync {
    async fn send(&self, mail: &OutgoingMail) -> Result<(), AdapterError>;
}

/// Knowledge-base proxy: job forwarding and status reporting.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KbService: Send + Sync {
    /// Forward `payload` unchanged to the endpoint for `action`.
    async fn forward(&self, action: KbAction, payload: &Value) -> Result<(), AdapterError>;

    async fn report_status(&self, report: &JobStatusReport) -> Result<(), AdapterError>;
}

pub struct HttpMailSender {
    client: WorkerClient,
    send_url: String,
}

impl HttpMailSender {
    pub fn new(client: WorkerClient, base_url: &str) -> Self {
        Self {
            client,
            send_url: format!("{}/send", base_url.trim_end_matches('/')),
        }
    }
}

#[async_trait]
impl MailSender for HttpMailSender {
    async fn send(&self, mail: &OutgoingMail) -> Result<(), AdapterError> {
        self.client.post_json(&self.send_url, mail).await
    }
}

pub struct HttpKbService {
    client: WorkerClient,
    base_url: String,
}

impl HttpKbService {
    pub fn new(client: WorkerClient, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn action_url(&self, action: KbAction) -> String {
        format!("{}/internal/jobs/kb/{}", self.base_url, action.as_str())
    }

    fn status_url(&self) -> String {
        format!("{}/internal/jobs/status", self.base_url)
    }
}

#[async_trait]
impl KbService for HttpKbService {
    async fn forward(&self, action: KbAction, payload: &Value) -> Result<(), AdapterError> {
        self.client.post_json(&self.action_url(action), payload).await
    }

    async fn report_status(&self, report: &JobStatusReport) -> Result<(), AdapterError> {
        self.client.post_json(&self.status_url(), report).await
    }
}
