//! Error types for outbound provider requests.
//!
//! Every failure carries the URL it happened on so retry logs and batch
//! reports can point at the exact call.

use thiserror::Error;

/// Errors that can occur while talking to a provider.
#[derive(Debug, Error)]
pub enum HttpError {
    /// Network-level error (DNS resolution, connection refused, TLS errors, etc.)
    #[error("network error requesting {url}: {source}")]
    Network {
        /// The URL that failed.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out before completion.
    #[error("timeout requesting {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// HTTP error response (4xx client errors, 5xx server errors).
    #[error("HTTP {status} requesting {url}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
        /// The Retry-After header value, if present (for 429 responses).
        retry_after: Option<String>,
    },

    /// The response body was not the JSON shape the caller asked for.
    #[error("failed to decode response from {url}: {message}")]
    Decode {
        /// The URL whose body failed to decode.
        url: String,
        /// Decoder message.
        message: String,
    },

    /// The provided URL is malformed or invalid.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// The call was aborted through the client's cancellation token.
    #[error("request to {url} cancelled")]
    Cancelled {
        /// The URL whose request was aborted.
        url: String,
    },

    /// The underlying HTTP client could not be constructed.
    #[error("failed to build HTTP client: {0}")]
    Build(#[source] reqwest::Error),
}

impl HttpError {
    /// Creates a network error from a reqwest error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after: None,
        }
    }

    /// Creates an HTTP status error with a Retry-After header value.
    pub fn http_status_with_retry_after(
        url: impl Into<String>,
        status: u16,
        retry_after: Option<String>,
    ) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates a decode error.
    pub fn decode(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Decode {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates a cancellation error.
    pub fn cancelled(url: impl Into<String>) -> Self {
        Self::Cancelled { url: url.into() }
    }

    /// Returns true when the provider answered 404.
    ///
    /// Adapters map this to "record not found" instead of an error.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::HttpStatus { status: 404, .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_error_display() {
        let error = HttpError::http_status("https://api.chub.ai/tags", 503);
        assert_eq!(error.to_string(), "HTTP 503 requesting https://api.chub.ai/tags");
    }

    #[test]
    fn test_is_not_found_only_for_404() {
        assert!(HttpError::http_status("https://x.test/a", 404).is_not_found());
        assert!(!HttpError::http_status("https://x.test/a", 410).is_not_found());
        assert!(!HttpError::timeout("https://x.test/a").is_not_found());
    }

    #[test]
    fn test_decode_error_display_names_url() {
        let error = HttpError::decode("https://x.test/a", "expected value");
        assert!(error.to_string().contains("https://x.test/a"));
        assert!(error.to_string().contains("expected value"));
    }
}
