//! Fetch-path error conditions callers need to distinguish.
//!
//! Everything else in the crate uses `anyhow::Result`; these variants exist
//! because a caller reacts differently to a misconfiguration than to an
//! upstream HTTP failure.

use thiserror::Error;

/// Errors surfaced by [`crate::fetch::FetchOrchestrator`].
#[derive(Debug, Error)]
pub enum FetchError {
    /// Caching is enabled but no timestamp extractor was configured.
    /// This is a misconfiguration, not a runtime condition.
    #[error(
        "caching is enabled but no `get_timestamp` extractor is configured; \
         cached entries cannot be ordered without a server timestamp"
    )]
    MissingTimestampExtractor,

    /// The configured extractor produced no timestamp for a response that
    /// was about to be cached. A response that cannot be ordered must not
    /// enter the cache.
    #[error("response for '{url}' produced no server timestamp")]
    NoTimestamp { url: String },

    /// HTTP failure, propagated to the caller unmodified. No cache
    /// mutation occurs.
    #[error("request to '{url}' failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The server answered with a non-success status.
    #[error("request to '{url}' returned status {status}")]
    Status { url: String, status: u16 },
}
