//! Errors raised by provider adapters.

use thiserror::Error;

use crate::http::{FailureType, HttpError, classify_error};
use crate::model::ProviderKind;

/// A provider call that did not yield a usable payload.
///
/// "Not found" is not an error: adapters return `Ok(None)` for it.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Transport failure after the client's retries were exhausted.
    #[error("{provider} request failed: {source}")]
    Http {
        /// Provider the call was made to.
        provider: ProviderKind,
        /// The underlying request error.
        #[source]
        source: HttpError,
    },

    /// The provider answered, but not with the structure we need.
    #[error("malformed payload from {provider} at {url}: {reason}")]
    MalformedUpstream {
        /// Provider the payload came from.
        provider: ProviderKind,
        /// Target URL of the call.
        url: String,
        /// What was missing or undecodable.
        reason: String,
    },
}

impl ProviderError {
    /// Wraps a request error.
    ///
    /// Decode failures are reported as malformed payloads, not transport errors.
    pub fn http(provider: ProviderKind, source: HttpError) -> Self {
        match source {
            HttpError::Decode { url, message } => Self::MalformedUpstream {
                provider,
                url,
                reason: message,
            },
            source => Self::Http { provider, source },
        }
    }

    /// Creates a malformed-payload error.
    pub fn malformed(
        provider: ProviderKind,
        url: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::MalformedUpstream {
            provider,
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Returns true for payload-shape failures.
    #[must_use]
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::MalformedUpstream { .. })
    }

    /// Returns true when the failure was network/5xx/429 and may clear up later.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http { source, .. } => matches!(
                classify_error(source),
                FailureType::Transient | FailureType::RateLimited
            ),
            Self::MalformedUpstream { .. } => false,
        }
    }

    /// Returns true when the call was aborted by cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Self::Http {
                source: HttpError::Cancelled { .. },
                ..
            }
        )
    }
}
