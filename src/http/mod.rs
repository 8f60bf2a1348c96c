//! Outbound HTTP plumbing shared by the provider adapters.
//!
//! # Features
//!
//! - Per-provider limiter: bounded in-flight requests plus a requests-per-second ceiling
//! - Bounded retry with exponential backoff and jitter for network/5xx/429 failures
//! - Retry-After support for rate-limited responses
//! - 60s per-request timeout and a browser User-Agent
//! - Cancellation through a caller-supplied `CancellationToken`
//!
//! # Example
//!
//! ```no_run
//! use cardex_core::http::{ClientConfig, RateLimitedClient};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = RateLimitedClient::new("chub", &ClientConfig::default(), CancellationToken::new())?;
//! let tags: serde_json::Value = client.get_json("https://api.chub.ai/tags").await?;
//! println!("{tags}");
//! # Ok(())
//! # }
//! ```

mod client;
mod error;
mod rate_limiter;
mod retry;

pub use client::{
    BROWSER_USER_AGENT, ClientConfig, DEFAULT_TIMEOUT, RateLimitedClient, build_http_client,
};
pub use error::HttpError;
pub use rate_limiter::{
    DEFAULT_MAX_CONCURRENT, DEFAULT_MAX_RPS, RatePermit, RateLimiter, parse_retry_after,
};
pub use retry::{DEFAULT_MAX_RETRIES, FailureType, RetryDecision, RetryPolicy, classify_error};
