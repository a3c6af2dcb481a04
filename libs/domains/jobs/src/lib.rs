//! Helpdesk job handlers.
//!
//! Wires the three consumer queues to their downstream services:
//!
//! | Queue            | Handler        | Downstream                                  |
//! |------------------|----------------|---------------------------------------------|
//! | `mail-service`   | [`MailHandler`] | `POST {MAIL_SERVICE_URL}/send`             |
//! | `kb-jobs`        | [`KbHandler`]   | `POST {FLOWISE_PROXY_URL}/internal/jobs/*` |
//! | `logger-service` | [`LogHandler`]  | structured logs                            |

pub mod adapters;
pub mod client;
pub mod config;
pub mod error;
pub mod handlers;
pub mod models;
pub mod templates;

pub use adapters::{HttpKbService, HttpMailSender, KbService, MailSender};
pub use client::WorkerClient;
pub use config::DispatchConfig;
pub use error::{AdapterError, SetupError, TemplateError};
pub use handlers::{KbHandler, LogHandler, MailHandler};
pub use models::{JobStatusReport, OutgoingMail, SendOtpJob};
pub use templates::OtpTemplates;

use std::sync::Arc;

/// Production handlers backed by the HTTP adapters.
pub struct Handlers {
    pub mail: MailHandler,
    pub kb: KbHandler,
    pub log: LogHandler,
}

impl Handlers {
    pub fn from_config(config: &DispatchConfig) -> Result<Self, SetupError> {
        let client = WorkerClient::new(config.worker_token.clone(), config.http_timeout)?;
        let templates = OtpTemplates::new(config.mail_logo_url.clone(), config.mail_app_name.clone())?;

        Ok(Self {
            mail: MailHandler::new(
                Arc::new(HttpMailSender::new(client.clone(), &config.mail_service_url)),
                templates,
            ),
            kb: KbHandler::new(Arc::new(HttpKbService::new(client, &config.flowise_proxy_url))),
            log: LogHandler,
        })
    }
}
