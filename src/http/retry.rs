//! Retry logic with exponential backoff for transient provider failures.
//!
//! This module provides the [`RetryPolicy`] and [`FailureType`] types for
//! classifying request errors and determining retry behavior.
//!
//! # Overview
//!
//! When a request fails, the error is classified into a [`FailureType`]:
//! - [`FailureType::Transient`] - Temporary failures that may succeed on retry
//! - [`FailureType::Permanent`] - Failures that won't succeed regardless of retries
//! - [`FailureType::RateLimited`] - Server rate limiting (retries with backoff)
//!
//! A 404 is permanent: callers read it as "not found" and never retry it.
//!
//! # Example
//!
//! ```
//! use cardex_core::http::{HttpError, RetryDecision, RetryPolicy, classify_error};
//!
//! let policy = RetryPolicy::default();
//! let error = HttpError::http_status("https://api.chub.ai/tags", 503);
//! let failure_type = classify_error(&error);
//!
//! match policy.should_retry(failure_type, 1) {
//!     RetryDecision::Retry { delay, attempt } => {
//!         println!("Retrying in {:?} (attempt {})", delay, attempt);
//!     }
//!     RetryDecision::DoNotRetry { reason } => {
//!         println!("Not retrying: {}", reason);
//!     }
//! }
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument};

use super::HttpError;

/// Default number of retries after the initial attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default base delay for exponential backoff (1 second).
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default maximum delay cap (32 seconds).
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(32);

/// Default backoff multiplier (doubles each attempt).
const DEFAULT_BACKOFF_MULTIPLIER: f32 = 2.0;

/// Maximum jitter added to delays (500ms).
const MAX_JITTER: Duration = Duration::from_millis(500);

/// Classification of request failure types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// Temporary failure that may succeed on retry.
    ///
    /// Examples: network timeout, 5xx server errors, connection refused.
    Transient,

    /// Permanent failure that won't succeed regardless of retries.
    ///
    /// Examples: 404 Not Found, 400 Bad Request, undecodable body.
    Permanent,

    /// Server rate limiting (HTTP 429).
    RateLimited,
}

/// Decision on whether to retry a failed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry the request after the specified delay.
    Retry {
        /// How long to wait before retrying.
        delay: Duration,
        /// Which attempt number this will be (1-indexed, so first retry is attempt 2).
        attempt: u32,
    },

    /// Do not retry the request.
    DoNotRetry {
        /// Human-readable reason why retry is not attempted.
        reason: String,
    },
}

/// Configuration for retry behavior with exponential backoff.
///
/// # Default Values
///
/// - `max_attempts`: 6 (one initial attempt plus five retries)
/// - `base_delay`: 1 second
/// - `max_delay`: 32 seconds
/// - `backoff_multiplier`: 2.0
/// - `max_jitter`: 500ms
///
/// # Delay Calculation
///
/// ```text
/// delay = min(base_delay * multiplier^(attempt-1), max_delay) + jitter
/// ```
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial attempt).
    max_attempts: u32,

    /// Base delay for the first retry.
    base_delay: Duration,

    /// Maximum delay cap.
    max_delay: Duration,

    /// Multiplier applied each attempt (typically 2.0 for doubling).
    backoff_multiplier: f32,

    /// Upper bound of the random jitter added to each delay.
    max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RETRIES + 1,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_jitter: MAX_JITTER,
        }
    }
}

impl RetryPolicy {
    /// Creates a new retry policy with custom settings.
    ///
    /// Jitter is capped at half of `base_delay` (and never above 500ms), so
    /// short test policies stay short.
    ///
    /// # Arguments
    ///
    /// * `max_attempts` - Maximum attempts including initial (must be >= 1)
    /// * `base_delay` - Base delay for first retry
    /// * `max_delay` - Maximum delay cap
    /// * `backoff_multiplier` - Multiplier for exponential increase
    #[must_use]
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f32,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            backoff_multiplier,
            max_jitter: (base_delay / 2).min(MAX_JITTER),
        }
    }

    /// Creates a policy allowing `max_retries` retries after the first attempt,
    /// using defaults for other settings.
    #[must_use]
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_attempts: max_retries.saturating_add(1),
            ..Self::default()
        }
    }

    /// Returns the maximum number of attempts configured.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Determines whether to retry a failed request.
    ///
    /// `attempt` is the attempt number that just failed (1-indexed).
    #[instrument(skip(self), fields(max_attempts = self.max_attempts))]
    pub fn should_retry(&self, failure_type: FailureType, attempt: u32) -> RetryDecision {
        if failure_type == FailureType::Permanent {
            return RetryDecision::DoNotRetry {
                reason: "permanent failure - retry would not help".to_string(),
            };
        }

        if attempt >= self.max_attempts {
            debug!(attempt, max = self.max_attempts, "max attempts reached");
            return RetryDecision::DoNotRetry {
                reason: format!("max attempts ({}) exhausted", self.max_attempts),
            };
        }

        let delay = self.calculate_delay(attempt);

        debug!(
            attempt,
            next_attempt = attempt + 1,
            delay_ms = delay.as_millis(),
            "will retry"
        );

        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let multiplier = f64::from(self.backoff_multiplier);

        let exponent = f64::from(attempt.saturating_sub(1));
        let delay_ms = base_ms * multiplier.powf(exponent);

        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);

        Duration::from_millis(capped_ms as u64) + self.calculate_jitter()
    }

    #[allow(clippy::cast_possible_truncation)]
    fn calculate_jitter(&self) -> Duration {
        let max_ms = self.max_jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        let mut rng = rand::thread_rng();
        Duration::from_millis(rng.gen_range(0..=max_ms))
    }
}

/// Classifies a request error into a failure type for retry decisions.
///
/// | Error | Type |
/// |-------|------|
/// | HTTP 408, 5xx | Transient |
/// | HTTP 429 | RateLimited |
/// | other HTTP 4xx (404 included) | Permanent |
/// | Timeout | Transient |
/// | Network (most) | Transient |
/// | Network (TLS) | Permanent |
/// | Decode, InvalidUrl, Build | Permanent |
/// | Cancelled | Permanent |
#[instrument]
pub fn classify_error(error: &HttpError) -> FailureType {
    match error {
        HttpError::HttpStatus { status, .. } => classify_http_status(*status),
        HttpError::Timeout { .. } => FailureType::Transient,
        HttpError::Network { source, .. } => {
            if is_tls_error(source) {
                FailureType::Permanent
            } else {
                FailureType::Transient
            }
        }
        HttpError::Decode { .. }
        | HttpError::InvalidUrl { .. }
        | HttpError::Cancelled { .. }
        | HttpError::Build(_) => FailureType::Permanent,
    }
}

#[allow(clippy::match_same_arms)]
fn classify_http_status(status: u16) -> FailureType {
    match status {
        404 => FailureType::Permanent,   // Not Found
        408 => FailureType::Transient,   // Request Timeout
        429 => FailureType::RateLimited, // Too Many Requests
        status if (400..500).contains(&status) => FailureType::Permanent,
        status if (500..600).contains(&status) => FailureType::Transient,
        _ => FailureType::Permanent,
    }
}

fn is_tls_error(error: &reqwest::Error) -> bool {
    let error_string = error.to_string().to_lowercase();
    error_string.contains("certificate")
        || error_string.contains("tls")
        || error_string.contains("ssl")
        || error_string.contains("handshake")
}
