//! Crate error type.
//!
//! This module defines [`ProxyError`] and the [`ProxyResult`] alias used across the crate.
//!
//! Implementation note: origin-transport variants are string-based to avoid exposing a specific
//! HTTP client error type in the public API.

use std::io;

/// Result type used by this crate.
pub type ProxyResult<T> = Result<T, ProxyError>;

/// Unified error type for the `media-cache-proxy` crate.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// A generic error with a message.
    #[error("{0}")]
    Message(String),

    /// Binding the listener socket failed.
    #[error("bind failed on port {port}: {source}")]
    Bind {
        /// Port we attempted to bind.
        port: u16,
        /// Underlying socket error.
        #[source]
        source: io::Error,
    },

    /// The periodic self-dial did not complete.
    #[error("health check failed: {0}")]
    HealthCheck(String),

    /// The origin could not be reached (connect/read failure).
    #[error("origin unreachable: {0}")]
    OriginUnreachable(String),

    /// The origin produced a malformed response.
    #[error("origin protocol error: {0}")]
    OriginProtocol(String),

    /// The origin answered with a non-success status that is relayed to the client.
    #[error("origin returned {status} for {url}")]
    OriginStatus {
        /// HTTP status code.
        status: u16,
        /// URL that failed.
        url: String,
    },

    /// The requested byte range cannot be satisfied.
    #[error("range not satisfiable: bytes={start}-{end}")]
    RangeNotSatisfiable {
        /// First requested byte.
        start: u64,
        /// Last requested byte, rendered empty when open-ended.
        end: String,
    },

    /// Malformed or oversized client request.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Errors related to invalid or unsupported playlist contents.
    #[error("invalid playlist: {0}")]
    InvalidPlaylist(String),

    /// The client closed its socket mid-response.
    #[error("client disconnected")]
    ClientDisconnect,

    /// Operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// Request timed out.
    #[error("request timeout for {0}")]
    Timeout(String),

    /// I/O error.
    ///
    /// Uses the concrete `std::io::Error` to preserve error kinds and sources.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProxyError {
    /// Convenience helper to construct a simple message error.
    pub fn msg(msg: impl Into<String>) -> Self {
        ProxyError::Message(msg.into())
    }

    /// Convenience helper for timeout errors.
    pub fn timeout(target: impl Into<String>) -> Self {
        ProxyError::Timeout(target.into())
    }

    /// Convenience helper for invalid playlist errors.
    pub fn invalid_playlist(msg: impl Into<String>) -> Self {
        ProxyError::InvalidPlaylist(msg.into())
    }

    /// Convenience helper to create `ProxyError::Io` with a specific `io::ErrorKind`.
    pub fn io_kind(kind: io::ErrorKind, msg: impl Into<String>) -> Self {
        ProxyError::Io(io::Error::new(kind, msg.into()))
    }

    /// URL parse error (mapped as an `InvalidInput` I/O error).
    pub fn url_parse(e: url::ParseError) -> Self {
        ProxyError::io_kind(io::ErrorKind::InvalidInput, format!("invalid URL: {e}"))
    }

    /// Playlist parse error coming from `hls_m3u8`.
    pub fn playlist_parse<E>(e: E) -> Self
    where
        E: std::fmt::Display,
    {
        ProxyError::invalid_playlist(format!("hls_m3u8 parse error: {e}"))
    }

    /// Origin status error for a URL.
    pub fn origin_status(status: u16, url: impl Into<String>) -> Self {
        ProxyError::OriginStatus {
            status,
            url: url.into(),
        }
    }

    /// Unsatisfiable range, rendering an open end as the empty string.
    pub fn range_not_satisfiable(start: u64, end: Option<u64>) -> Self {
        ProxyError::RangeNotSatisfiable {
            start,
            end: end.map(|e| e.to_string()).unwrap_or_default(),
        }
    }

    /// True when the error is worth retrying against the origin.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProxyError::OriginUnreachable(_) | ProxyError::Timeout(_) | ProxyError::Io(_)
        )
    }
}
