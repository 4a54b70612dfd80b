//! Microsoft Graph HTTP client.
//!
//! Wraps `reqwest::Client` with bearer injection from a [`TokenSource`],
//! response classification into the [`RemoteErrorKind`] taxonomy, and a
//! retry loop with exponential backoff + jitter for the retryable kinds.
//!
//! Contract per request:
//! - every call carries a bearer token from the injected source;
//! - on a 401 the token-refresh callback is invoked **exactly once**
//!   before the call is retried; a second 401 surfaces as an auth error;
//! - rate-limit and server-transient responses are retried honoring any
//!   server-advised `Retry-After`, with capped attempts and a hard
//!   deadline;
//! - not-found, validation, conflict and fatal responses are never
//!   retried.

use std::sync::Arc;
use std::time::Duration;

use nimbus_core::config::NetworkConfig;
use nimbus_core::ports::remote::{RemoteError, RemoteErrorKind, TokenSource};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backoff::backoff_delay;

/// Base URL for Microsoft Graph API v1.0.
const GRAPH_BASE_URL: &str = "https://graph.microsoft.com/v1.0";

/// HTTP client for Graph API calls.
pub struct DriveClient {
    client: Client,
    base_url: String,
    tokens: Arc<dyn TokenSource>,
    config: NetworkConfig,
}

impl DriveClient {
    /// Creates a client against the production Graph endpoint.
    pub fn new(tokens: Arc<dyn TokenSource>, config: NetworkConfig) -> Self {
        Self {
            client: Client::new(),
            base_url: GRAPH_BASE_URL.to_string(),
            tokens,
            config,
        }
    }

    /// Creates a client with a custom base URL (used by the wiremock
    /// integration tests).
    pub fn with_base_url(
        tokens: Arc<dyn TokenSource>,
        config: NetworkConfig,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            tokens,
            config,
        }
    }

    /// Returns the base URL for API requests.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Builds an absolute URL from an API path.
    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Per-request timeout from the network config.
    fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.config.request_timeout_secs)
    }

    /// Executes a request with auth, classification, refresh-once, and
    /// retry. `build` is called once per attempt so request bodies are
    /// re-materialized after a failure.
    pub(crate) async fn execute<F>(&self, what: &str, build: F) -> Result<Response, RemoteError>
    where
        F: Fn(&Client, &str) -> RequestBuilder,
    {
        // Hard deadline over the whole retry loop, independent of the
        // per-attempt timeout.
        let deadline = Instant::now()
            + self.request_timeout() * (self.config.max_retries + 1);
        let mut attempt: u32 = 0;
        let mut refreshed = false;

        loop {
            let token = self.tokens.access_token().await?;
            let request = build(&self.client, &token);

            let outcome = tokio::time::timeout(self.request_timeout(), request.send()).await;

            let error = match outcome {
                Err(_) => RemoteError::timeout(format!("{what}: request deadline elapsed")),
                Ok(Err(e)) => classify_transport_error(what, &e),
                Ok(Ok(response)) => {
                    let status = response.status();

                    if status == StatusCode::UNAUTHORIZED && !refreshed {
                        refreshed = true;
                        debug!(what, "401 received, refreshing token once");
                        self.tokens.refresh().await?;
                        continue;
                    }

                    if status.is_success() {
                        if attempt > 0 {
                            info!(what, attempt, "request succeeded after retry");
                        }
                        return Ok(response);
                    }

                    classify_status(what, &response).await
                }
            };

            if !error.is_retryable() || attempt >= self.config.max_retries {
                if error.is_retryable() {
                    warn!(what, attempts = attempt + 1, "retry budget exhausted");
                }
                return Err(error);
            }

            let delay = error
                .retry_after()
                .unwrap_or_else(|| backoff_delay(&self.config, attempt));
            if Instant::now() + delay >= deadline {
                warn!(what, "hard deadline reached, giving up");
                return Err(error);
            }

            debug!(
                what,
                attempt,
                delay_ms = delay.as_millis() as u64,
                kind = ?error.kind(),
                "transient failure, backing off"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Reads a response body as bytes, mapping failures to network errors.
    pub(crate) async fn read_bytes(what: &str, response: Response) -> Result<Vec<u8>, RemoteError> {
        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| RemoteError::network(format!("{what}: body read failed: {e}")))
    }

    /// Reads and deserializes a JSON response body.
    pub(crate) async fn read_json<T: serde::de::DeserializeOwned>(
        what: &str,
        response: Response,
    ) -> Result<T, RemoteError> {
        response
            .json::<T>()
            .await
            .map_err(|e| RemoteError::fatal(format!("{what}: malformed response: {e}")))
    }
}

/// Maps a reqwest transport error to the taxonomy.
fn classify_transport_error(what: &str, error: &reqwest::Error) -> RemoteError {
    if error.is_timeout() {
        RemoteError::timeout(format!("{what}: {error}"))
    } else {
        RemoteError::network(format!("{what}: {error}"))
    }
}

/// Maps a non-success HTTP status to the taxonomy, consuming the body
/// for the diagnostic message.
async fn classify_status(what: &str, response: &Response) -> RemoteError {
    let status = response.status();
    let retry_after = parse_retry_after(response);
    let message = format!("{what}: HTTP {status}");

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            RemoteError::new(RemoteErrorKind::Auth, message)
        }
        StatusCode::NOT_FOUND | StatusCode::GONE => {
            RemoteError::new(RemoteErrorKind::NotFound, message)
        }
        StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => {
            RemoteError::new(RemoteErrorKind::Conflict, message)
        }
        StatusCode::INSUFFICIENT_STORAGE => {
            RemoteError::new(RemoteErrorKind::Validation, format!("{message}: quota exceeded"))
        }
        StatusCode::TOO_MANY_REQUESTS => {
            let mut err = RemoteError::new(RemoteErrorKind::RateLimit, message);
            if let Some(delay) = retry_after {
                err = err.with_retry_after(delay);
            }
            err
        }
        s if s.is_client_error() => RemoteError::new(RemoteErrorKind::Validation, message),
        s if s.is_server_error() => {
            let mut err = RemoteError::new(RemoteErrorKind::ServerTransient, message);
            if let Some(delay) = retry_after {
                err = err.with_retry_after(delay);
            }
            err
        }
        _ => RemoteError::new(RemoteErrorKind::Fatal, message),
    }
}

/// Parses a `Retry-After` header given in whole seconds.
fn parse_retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticTokens;

    #[async_trait::async_trait]
    impl TokenSource for StaticTokens {
        async fn access_token(&self) -> Result<String, RemoteError> {
            Ok("token".to_string())
        }
        async fn refresh(&self) -> Result<String, RemoteError> {
            Ok("token2".to_string())
        }
    }

    #[test]
    fn test_url_construction() {
        let client = DriveClient::with_base_url(
            Arc::new(StaticTokens),
            NetworkConfig::default(),
            "http://localhost:9999",
        );
        assert_eq!(client.url("/me/drive"), "http://localhost:9999/me/drive");
    }

    #[test]
    fn test_default_base_url() {
        let client = DriveClient::new(Arc::new(StaticTokens), NetworkConfig::default());
        assert_eq!(client.base_url(), "https://graph.microsoft.com/v1.0");
    }
}
