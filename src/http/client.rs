//! Rate-limited, retrying JSON client shared by the provider adapters.
//!
//! One [`RateLimitedClient`] is constructed per provider at process start and
//! injected into that provider's adapter. Every call:
//!
//! 1. waits on the provider's [`RateLimiter`] (concurrency + pacing),
//! 2. sends the request with a per-request timeout,
//! 3. retries network/5xx/429 failures with exponential backoff, logging each
//!    retry at `info`, and
//! 4. decodes the body as JSON.
//!
//! [`RateLimitedClient::post_json_checked`] lets a caller reject a decoded
//! body with an [`HttpError`]; the rejection goes through the same retry
//! classification as a transport failure.
//!
//! A 404 is returned to the caller untouched so adapters can map it to
//! "not found". Cancelling the client's token aborts in-flight sends and
//! pending retry sleeps with [`HttpError::Cancelled`].

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Method};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};
use url::Url;

use super::error::HttpError;
use super::rate_limiter::{DEFAULT_MAX_CONCURRENT, DEFAULT_MAX_RPS, RateLimiter, parse_retry_after};
use super::retry::{DEFAULT_MAX_RETRIES, FailureType, RetryDecision, RetryPolicy, classify_error};

/// Default per-request timeout (60 seconds).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Browser User-Agent sent with every provider request.
///
/// Both providers serve browsers first; a tool-identifying agent gets
/// challenged far more often.
pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Limits and retry settings for one provider's client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Maximum requests in flight.
    pub max_concurrent: usize,
    /// Maximum request starts per second.
    pub max_rps: u32,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Retry behavior for transient failures.
    pub retry_policy: RetryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            max_rps: DEFAULT_MAX_RPS,
            timeout: DEFAULT_TIMEOUT,
            retry_policy: RetryPolicy::with_max_retries(DEFAULT_MAX_RETRIES),
        }
    }
}

/// Builds the underlying reqwest client with the browser agent and timeout.
///
/// # Errors
///
/// Returns [`HttpError::Build`] if the TLS backend cannot be initialised.
pub fn build_http_client(timeout: Duration) -> Result<Client, HttpError> {
    Client::builder()
        .timeout(timeout)
        .gzip(true)
        .user_agent(BROWSER_USER_AGENT)
        .build()
        .map_err(HttpError::Build)
}

/// JSON client bound to one provider's limiter, retry policy and cancellation token.
#[derive(Clone)]
pub struct RateLimitedClient {
    name: &'static str,
    client: Client,
    limiter: Arc<RateLimiter>,
    retry_policy: RetryPolicy,
    cancel: CancellationToken,
}

impl std::fmt::Debug for RateLimitedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitedClient")
            .field("name", &self.name)
            .field("limiter", &self.limiter)
            .field("retry_policy", &self.retry_policy)
            .finish_non_exhaustive()
    }
}

impl RateLimitedClient {
    /// Creates a client for the named provider.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::Build`] if the HTTP client cannot be constructed.
    pub fn new(
        name: &'static str,
        config: &ClientConfig,
        cancel: CancellationToken,
    ) -> Result<Self, HttpError> {
        let client = build_http_client(config.timeout)?;
        Ok(Self {
            name,
            client,
            limiter: Arc::new(RateLimiter::new(config.max_concurrent, config.max_rps)),
            retry_policy: config.retry_policy.clone(),
            cancel,
        })
    }

    /// Issues a GET and decodes the JSON body.
    ///
    /// # Errors
    ///
    /// Returns the last [`HttpError`] once retries are exhausted, immediately
    /// for permanent failures (404 included), or [`HttpError::Cancelled`].
    #[instrument(skip(self), fields(provider = self.name))]
    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, HttpError> {
        self.execute(Method::GET, url, None, |_: &T| Ok(())).await
    }

    /// Issues a POST with a JSON body and decodes the JSON response.
    ///
    /// # Errors
    ///
    /// Same as [`RateLimitedClient::get_json`]; also fails with
    /// [`HttpError::Decode`] if `body` cannot be serialized.
    #[instrument(skip(self, body), fields(provider = self.name))]
    pub async fn post_json<B, T>(&self, url: &str, body: &B) -> Result<T, HttpError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.post_json_checked(url, body, |_: &T| Ok(())).await
    }

    /// Like [`RateLimitedClient::post_json`], but runs `check` on every
    /// decoded response.
    ///
    /// An error from `check` is classified and retried exactly like an error
    /// from the wire, so a relay can report a 5xx or 429 from its target as
    /// [`HttpError::HttpStatus`] and have it backed off.
    ///
    /// # Errors
    ///
    /// Same as [`RateLimitedClient::post_json`]; also the last error from
    /// `check` once retries are exhausted.
    #[instrument(skip(self, body, check), fields(provider = self.name))]
    pub async fn post_json_checked<B, T, F>(
        &self,
        url: &str,
        body: &B,
        check: F,
    ) -> Result<T, HttpError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
        F: Fn(&T) -> Result<(), HttpError>,
    {
        let body = serde_json::to_value(body).map_err(|e| HttpError::decode(url, e.to_string()))?;
        self.execute(Method::POST, url, Some(&body), check).await
    }

    async fn execute<T, F>(
        &self,
        method: Method,
        url: &str,
        body: Option<&serde_json::Value>,
        check: F,
    ) -> Result<T, HttpError>
    where
        T: DeserializeOwned,
        F: Fn(&T) -> Result<(), HttpError>,
    {
        if Url::parse(url).is_err() {
            return Err(HttpError::invalid_url(url));
        }

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if self.cancel.is_cancelled() {
                return Err(HttpError::cancelled(url));
            }

            let result = {
                let _permit = tokio::select! {
                    () = self.cancel.cancelled() => return Err(HttpError::cancelled(url)),
                    permit = self.limiter.acquire() => permit,
                };
                debug!(attempt, %method, url, "sending request");
                self.send_once(method.clone(), url, body).await
            };

            let error = match result {
                Ok(text) => {
                    let value: T = serde_json::from_str(&text)
                        .map_err(|e| HttpError::decode(url, e.to_string()))?;
                    match check(&value) {
                        Ok(()) => return Ok(value),
                        Err(e) => e,
                    }
                }
                Err(e) => e,
            };

            let failure_type = classify_error(&error);
            let retry_after = if failure_type == FailureType::RateLimited {
                self.retry_after_delay(&error).await
            } else {
                None
            };

            match self.retry_policy.should_retry(failure_type, attempt) {
                RetryDecision::Retry {
                    delay: backoff_delay,
                    attempt: next_attempt,
                } => {
                    let delay = retry_after.unwrap_or(backoff_delay);
                    info!(
                        provider = self.name,
                        url,
                        attempt = next_attempt,
                        max_attempts = self.retry_policy.max_attempts(),
                        delay_ms = delay.as_millis(),
                        using_retry_after = retry_after.is_some(),
                        error = %error,
                        "retrying request"
                    );
                    tokio::select! {
                        () = self.cancel.cancelled() => return Err(HttpError::cancelled(url)),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                RetryDecision::DoNotRetry { reason } => {
                    debug!(url, %reason, "not retrying request");
                    return Err(error);
                }
            }
        }
    }

    async fn send_once(
        &self,
        method: Method,
        url: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<String, HttpError> {
        let mut request = self.client.request(method, url);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = tokio::select! {
            () = self.cancel.cancelled() => return Err(HttpError::cancelled(url)),
            sent = request.send() => sent.map_err(|e| map_transport_error(url, e))?,
        };

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(std::string::ToString::to_string);
            return Err(HttpError::http_status_with_retry_after(
                url,
                status.as_u16(),
                retry_after,
            ));
        }

        tokio::select! {
            () = self.cancel.cancelled() => Err(HttpError::cancelled(url)),
            text = response.text() => text.map_err(|e| map_transport_error(url, e)),
        }
    }

    async fn retry_after_delay(&self, error: &HttpError) -> Option<Duration> {
        let HttpError::HttpStatus {
            retry_after: Some(header),
            ..
        } = error
        else {
            return None;
        };
        let delay = parse_retry_after(header)?;
        self.limiter.record_rate_limit(delay).await;
        Some(delay)
    }
}

fn map_transport_error(url: &str, error: reqwest::Error) -> HttpError {
    if error.is_timeout() {
        HttpError::timeout(url)
    } else {
        HttpError::network(url, error)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.max_concurrent, 5);
        assert_eq!(config.max_rps, 5);
        assert_eq!(config.timeout, Duration::from_secs(60));
        assert_eq!(config.retry_policy.max_attempts(), 6);
    }

    #[tokio::test]
    async fn test_invalid_url_rejected_before_sending() {
        let client =
            RateLimitedClient::new("test", &ClientConfig::default(), CancellationToken::new())
                .unwrap();
        let result: Result<serde_json::Value, _> = client.get_json("not a url").await;
        assert!(matches!(result, Err(HttpError::InvalidUrl { .. })));
    }

    #[tokio::test]
    async fn test_cancelled_token_short_circuits() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let client = RateLimitedClient::new("test", &ClientConfig::default(), cancel).unwrap();
        let result: Result<serde_json::Value, _> =
            client.get_json("http://127.0.0.1:9/never").await;
        assert!(matches!(result, Err(HttpError::Cancelled { .. })));
    }
}
