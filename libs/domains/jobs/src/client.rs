//! Authenticated HTTP client for internal worker endpoints.

use crate::error::AdapterError;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

/// Header carrying the shared worker secret.
pub const WORKER_TOKEN_HEADER: &str = "x-worker-token";

/// Error bodies longer than this are cut before they reach logs.
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Clone)]
pub struct WorkerClient {
    http: Client,
    token: String,
}

impl WorkerClient {
    pub fn new(token: impl Into<String>, timeout: Duration) -> Result<Self, AdapterError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AdapterError::Client(e.to_string()))?;

        Ok(Self {
            http,
            token: token.into(),
        })
    }

    /// POST `body` as JSON; any non-2xx status is an error.
    pub async fn post_json<T>(&self, url: &str, body: &T) -> Result<(), AdapterError>
    where
        T: Serialize + ?Sized,
    {
        let response = self
            .http
            .post(url)
            .header(WORKER_TOKEN_HEADER, &self.token)
            .json(body)
            .send()
            .await
            .map_err(|source| AdapterError::Request {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        if status.is_success() {
            debug!(url, status = status.as_u16(), "Downstream call succeeded");
            return Ok(());
        }

        let mut body = response.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let mut cut = MAX_ERROR_BODY;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }

        Err(AdapterError::Status {
            url: url.to_string(),
            status: status.as_u16(),
            body,
        })
    }
}
