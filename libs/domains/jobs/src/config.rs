//! Downstream service configuration for the job handlers.

use core_config::{env_or_default, env_parse, env_required, ConfigError, FromEnv};
use std::time::Duration;

const DEFAULT_MAIL_SERVICE_URL: &str = "http://localhost:4005";
const DEFAULT_FLOWISE_PROXY_URL: &str = "http://localhost:4002";
const DEFAULT_TIMEOUT_MS: u64 = 120_000;
const DEFAULT_APP_NAME: &str = "Helpdesk";

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Shared secret sent as `x-worker-token`
    pub worker_token: String,

    /// Base URL of the mail service (`POST /send`)
    pub mail_service_url: String,

    /// Base URL of the KB proxy (`/internal/jobs/...`)
    pub flowise_proxy_url: String,

    /// Timeout applied to every downstream request
    pub http_timeout: Duration,

    /// Logo shown in OTP emails; no logo when unset
    pub mail_logo_url: Option<String>,

    pub mail_app_name: String,
}

impl DispatchConfig {
    pub fn new(worker_token: impl Into<String>) -> Self {
        Self {
            worker_token: worker_token.into(),
            mail_service_url: DEFAULT_MAIL_SERVICE_URL.to_string(),
            flowise_proxy_url: DEFAULT_FLOWISE_PROXY_URL.to_string(),
            http_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            mail_logo_url: None,
            mail_app_name: DEFAULT_APP_NAME.to_string(),
        }
    }
}

impl FromEnv for DispatchConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let worker_token = env_required("WORKER_TOKEN")?;
        if worker_token.trim().is_empty() {
            return Err(ConfigError::MissingEnvVar("WORKER_TOKEN".to_string()));
        }

        let logo = env_or_default("MAIL_LOGO_URL", "").trim().to_string();
        let mail_logo_url = (!logo.is_empty()).then_some(logo);

        Ok(Self {
            worker_token,
            mail_service_url: trim_base(env_or_default("MAIL_SERVICE_URL", DEFAULT_MAIL_SERVICE_URL)),
            flowise_proxy_url: trim_base(env_or_default(
                "FLOWISE_PROXY_URL",
                DEFAULT_FLOWISE_PROXY_URL,
            )),
            http_timeout: Duration::from_millis(env_parse(
                "WORKER_HTTP_TIMEOUT_MS",
                DEFAULT_TIMEOUT_MS,
            )?),
            mail_logo_url,
            mail_app_name: env_or_default("MAIL_APP_NAME", DEFAULT_APP_NAME),
        })
    }
}

fn trim_base(url: String) -> String {
    url.trim_end_matches('/').to_string()
}
