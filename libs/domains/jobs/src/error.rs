use thiserror::Error;

/// Failure talking to a downstream internal service.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// Network error, timeout, or an unreadable response.
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The service answered with a non-2xx status.
    #[error("{url} returned {status}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },

    #[error("HTTP client error: {0}")]
    Client(String),
}

#[derive(Debug, Error)]
#[error("template error: {0}")]
pub struct TemplateError(pub String);

/// Failure wiring the production handlers at startup.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error(transparent)]
    Template(#[from] TemplateError),
}
