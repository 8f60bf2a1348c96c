//! Per-provider request pacing and concurrency limiting.
//!
//! This module provides the [`RateLimiter`] struct which every outbound call
//! to a provider passes through. It enforces two ceilings at once:
//!
//! - at most `max_concurrent` requests in flight, and
//! - at most `max_rps` request starts per second.
//!
//! One limiter instance is shared by all tasks talking to the same provider,
//! so a bulk ingest cannot overwhelm it or trip its anti-abuse defenses.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use cardex_core::http::RateLimiter;
//!
//! # async fn example() {
//! let limiter = Arc::new(RateLimiter::new(5, 5));
//!
//! let permit = limiter.acquire().await;
//! // ... send the request while holding the permit
//! drop(permit);
//! # }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

/// Default maximum in-flight requests per provider.
pub const DEFAULT_MAX_CONCURRENT: usize = 5;

/// Default maximum request starts per second per provider.
pub const DEFAULT_MAX_RPS: u32 = 5;

/// Warning threshold for cumulative pacing delay (30 seconds).
const CUMULATIVE_DELAY_WARNING_THRESHOLD: Duration = Duration::from_secs(30);

/// Maximum Retry-After value (1 hour) to prevent excessive delays.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Shared limiter for one provider.
///
/// `RateLimiter` is `Send + Sync`; wrap it in `Arc` and hand clones to every
/// task that issues requests.
#[derive(Debug)]
pub struct RateLimiter {
    /// Minimum spacing between request starts (`1s / max_rps`).
    interval: Duration,

    /// Bounds the number of requests in flight.
    in_flight: Arc<Semaphore>,

    /// Earliest instant the next request may start.
    /// `None` until the first request, which proceeds immediately.
    next_slot: Mutex<Option<Instant>>,

    /// Cumulative delay applied by this limiter (in milliseconds).
    cumulative_delay_ms: AtomicU64,
}

/// Proof that a request may be in flight. Dropping it frees the slot.
#[derive(Debug)]
pub struct RatePermit {
    _permit: Option<OwnedSemaphorePermit>,
}

impl RateLimiter {
    /// Creates a limiter with the given concurrency and requests-per-second
    /// ceilings. Zero values are raised to one.
    #[must_use]
    #[instrument(level = "debug")]
    pub fn new(max_concurrent: usize, max_rps: u32) -> Self {
        let max_rps = max_rps.max(1);
        debug!("creating rate limiter");
        Self {
            interval: Duration::from_secs(1) / max_rps,
            in_flight: Arc::new(Semaphore::new(max_concurrent.max(1))),
            next_slot: Mutex::new(None),
            cumulative_delay_ms: AtomicU64::new(0),
        }
    }

    /// Waits for a free in-flight slot, then for the next pacing slot.
    ///
    /// Pacing slots are reserved in arrival order while holding the lock only
    /// long enough to book one, so concurrent waiters sleep in parallel.
    #[instrument(level = "debug", skip(self))]
    pub async fn acquire(&self) -> RatePermit {
        let permit = match Arc::clone(&self.in_flight).acquire_owned().await {
            Ok(permit) => Some(permit),
            Err(_) => {
                warn!("rate limiter semaphore closed - proceeding without a concurrency slot");
                None
            }
        };

        let start_at = {
            let mut next_slot = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = match *next_slot {
                Some(slot) if slot > now => slot,
                _ => now,
            };
            *next_slot = Some(slot + self.interval);
            slot
        };

        let delay = start_at.saturating_duration_since(Instant::now());
        if !delay.is_zero() {
            let cumulative = self.add_cumulative_delay(delay);
            debug!(
                delay_ms = delay.as_millis(),
                cumulative_ms = cumulative.as_millis(),
                "applying rate limit delay"
            );
            if cumulative >= CUMULATIVE_DELAY_WARNING_THRESHOLD {
                warn!(
                    cumulative_delay_secs = cumulative.as_secs(),
                    "excessive rate limiting - consider reducing request volume"
                );
            }
            tokio::time::sleep_until(start_at).await;
        }

        RatePermit { _permit: permit }
    }

    /// Records a server-mandated delay (from a Retry-After header).
    ///
    /// Pushes the next pacing slot out so every task sharing this limiter
    /// backs off, not just the one that was told to.
    #[instrument(level = "debug", skip(self))]
    pub async fn record_rate_limit(&self, delay: Duration) {
        let resume_at = Instant::now() + delay;
        {
            let mut next_slot = self.next_slot.lock().await;
            if next_slot.is_none_or(|slot| slot < resume_at) {
                *next_slot = Some(resume_at);
            }
        }

        let cumulative = self.add_cumulative_delay(delay);
        debug!(
            delay_ms = delay.as_millis(),
            cumulative_ms = cumulative.as_millis(),
            "recorded server rate limit"
        );
        if cumulative >= CUMULATIVE_DELAY_WARNING_THRESHOLD {
            warn!(
                cumulative_delay_secs = cumulative.as_secs(),
                "excessive server rate limiting - provider may be under heavy load"
            );
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn add_cumulative_delay(&self, delay: Duration) -> Duration {
        let delay_ms = delay.as_millis() as u64;
        let new_total = self
            .cumulative_delay_ms
            .fetch_add(delay_ms, Ordering::SeqCst)
            + delay_ms;
        Duration::from_millis(new_total)
    }
}

/// Parses a Retry-After header value into a Duration.
///
/// Supports two formats as per RFC 7231:
/// - Integer seconds: `Retry-After: 120`
/// - HTTP-date: `Retry-After: Wed, 21 Oct 2025 07:28:00 GMT`
///
/// Returns `None` if the value cannot be parsed. Caps excessive values at 1 hour.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use cardex_core::http::parse_retry_after;
///
/// assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
/// assert_eq!(parse_retry_after("0"), Some(Duration::ZERO));
/// assert_eq!(parse_retry_after("invalid"), None);
/// ```
#[must_use]
#[instrument(level = "debug")]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        if seconds < 0 {
            debug!(seconds, "negative Retry-After value, ignoring");
            return None;
        }

        #[allow(clippy::cast_sign_loss)]
        let duration = Duration::from_secs(seconds as u64);
        if duration > MAX_RETRY_AFTER {
            warn!(
                seconds,
                max_seconds = MAX_RETRY_AFTER.as_secs(),
                "Retry-After exceeds maximum, capping at 1 hour"
            );
            return Some(MAX_RETRY_AFTER);
        }
        return Some(duration);
    }

    let Ok(datetime) = httpdate::parse_http_date(header_value) else {
        debug!(header_value, "unparseable Retry-After value");
        return None;
    };

    match datetime.duration_since(std::time::SystemTime::now()) {
        Ok(duration) if duration > MAX_RETRY_AFTER => Some(MAX_RETRY_AFTER),
        Ok(duration) => Some(duration),
        Err(_) => {
            debug!(header_value, "Retry-After date is in the past, returning zero");
            Some(Duration::ZERO)
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    // ==================== RateLimiter Tests ====================

    #[test]
    fn test_rate_limiter_interval_from_rps() {
        let limiter = RateLimiter::new(5, 5);
        assert_eq!(limiter.interval, Duration::from_millis(200));
        assert_eq!(limiter.in_flight.available_permits(), 5);
    }

    #[test]
    fn test_rate_limiter_zero_values_raised_to_one() {
        let limiter = RateLimiter::new(0, 0);
        assert_eq!(limiter.interval, Duration::from_secs(1));
        assert_eq!(limiter.in_flight.available_permits(), 1);
    }

    #[tokio::test]
    async fn test_first_acquire_is_immediate() {
        tokio::time::pause();
        let limiter = RateLimiter::new(5, 5);
        let start = Instant::now();
        let _permit = limiter.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(1));
    }

    #[tokio::test]
    async fn test_sequential_acquires_are_paced() {
        tokio::time::pause();
        let limiter = RateLimiter::new(5, 5);
        let start = Instant::now();
        for _ in 0..3 {
            drop(limiter.acquire().await);
        }
        assert!(start.elapsed() >= Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_concurrent_acquires_share_pacing() {
        tokio::time::pause();
        let limiter = Arc::new(RateLimiter::new(10, 5));
        let start = Instant::now();

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move {
                    let _permit = limiter.acquire().await;
                    Instant::now()
                })
            })
            .collect();

        let mut latest = start;
        for handle in handles {
            latest = latest.max(handle.await.unwrap());
        }
        // Five starts at 5 rps: the last one begins 800ms after the first.
        assert!(latest.duration_since(start) >= Duration::from_millis(800));
    }

    #[tokio::test]
    async fn test_concurrency_bounded_by_permits() {
        let limiter = RateLimiter::new(2, 1000);
        let mut held = Vec::new();
        for _ in 0..2 {
            held.push(limiter.acquire().await);
        }
        assert_eq!(limiter.in_flight.available_permits(), 0);

        let blocked =
            tokio::time::timeout(Duration::from_millis(50), limiter.acquire()).await;
        assert!(blocked.is_err(), "acquire should wait while all slots are held");

        held.pop();
        let freed = tokio::time::timeout(Duration::from_millis(50), limiter.acquire()).await;
        assert!(freed.is_ok());
    }

    #[tokio::test]
    async fn test_record_rate_limit_delays_next_acquire() {
        tokio::time::pause();
        let limiter = RateLimiter::new(5, 5);
        limiter.record_rate_limit(Duration::from_secs(2)).await;
        let start = Instant::now();
        let _permit = limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    // ==================== Retry-After Tests ====================

    #[test]
    fn test_parse_retry_after_seconds() {
        assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
        assert_eq!(parse_retry_after(" 5 "), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_parse_retry_after_negative_and_garbage() {
        assert_eq!(parse_retry_after("-1"), None);
        assert_eq!(parse_retry_after("soon"), None);
    }

    #[test]
    fn test_parse_retry_after_capped() {
        assert_eq!(parse_retry_after("999999"), Some(MAX_RETRY_AFTER));
    }

    #[test]
    fn test_parse_retry_after_past_date_is_zero() {
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"),
            Some(Duration::ZERO)
        );
    }
}
