//! HTTP channel handler: POSTs the queued payload to a fixed endpoint.

use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use tracing::debug;

use super::{Handler, HandlerError, HandlerFuture};

/// Classify a non-success HTTP status code.
///
/// `408`, `429` and `5xx` mean the server may accept the same payload later;
/// any other status (mostly `4xx`) means it never will.
#[must_use]
pub fn classify_status(status: u16) -> Option<HandlerError> {
    match status {
        200..=299 => None,
        408 | 429 | 500..=599 => Some(HandlerError::Transport(format!("http status {status}"))),
        _ => Some(HandlerError::Rejected(format!("http status {status}"))),
    }
}

/// Handler delivering payloads as `application/json` POST bodies.
#[derive(Debug, Clone)]
pub struct HttpHandler {
    client: reqwest::Client,
    url: String,
    bearer_token: Option<String>,
    timeout: Duration,
}

impl HttpHandler {
    /// Create a handler posting to `url`.
    #[must_use]
    pub fn new(
        client: reqwest::Client,
        url: impl Into<String>,
        bearer_token: Option<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            url: url.into(),
            bearer_token,
            timeout,
        }
    }

    /// Target endpoint.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    async fn post(&self, data: &[u8]) -> Result<(), HandlerError> {
        let mut request = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .timeout(self.timeout)
            .body(data.to_vec());
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|err| HandlerError::Transport(err.to_string()))?;

        let status = response.status().as_u16();
        debug!(url = %self.url, status, "queued payload delivered");
        classify_status(status).map_or(Ok(()), Err)
    }
}

impl Handler for HttpHandler {
    fn execute<'a>(&'a self, data: &'a [u8]) -> HandlerFuture<'a> {
        Box::pin(self.post(data))
    }
}
