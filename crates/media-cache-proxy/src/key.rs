//! Cache key derivation.
//!
//! This module centralizes how URLs become stable cache identifiers:
//!
//! - [`fingerprint`] — the 128-bit hex digest addressing one remote resource,
//!   optionally salted by a caller-supplied cache id so identical URLs can be
//!   partitioned into separate namespaces.
//! - [`playlist_key`] — the digest of an absolute playlist URL; descendants of
//!   an HLS master share the master's key for group cancellation.
//! - [`SegmentKey`] — `(fingerprint, start, end)` addressing one cached window.
//!
//! Canonicalization lowercases the scheme and host and removes default ports;
//! path and query are preserved verbatim. This keeps `http://HOST/a` and
//! `http://host:80/a` in the same cache slot without touching case-sensitive
//! paths.
//!
//! This module does not perform any IO.

use std::collections::HashMap;
use std::fmt;

use url::Url;

use crate::error::{ProxyError, ProxyResult};

/// Canonical form of a URL used as hash input.
///
/// Lowercases scheme and host, drops default ports, keeps path + query verbatim.
pub fn canonicalize(url: &Url) -> String {
    let scheme = url.scheme().to_ascii_lowercase();
    let host = url.host_str().unwrap_or_default().to_ascii_lowercase();

    let mut out = format!("{scheme}://{host}");
    if let Some(port) = url.port() {
        // `Url::port()` already yields `None` for scheme-default ports.
        out.push(':');
        out.push_str(&port.to_string());
    }
    out.push_str(url.path());
    if let Some(query) = url.query() {
        out.push('?');
        out.push_str(query);
    }
    out
}

/// Compute the fingerprint for a resource URL.
///
/// When `headers` carries a non-empty value under `cache_id_header`, it is
/// appended to the hashed input, partitioning the cache by caller identity.
pub fn fingerprint(url: &Url, headers: Option<&HashMap<String, String>>, cache_id_header: &str) -> String {
    let mut input = canonicalize(url);
    if let Some(headers) = headers {
        let wanted = cache_id_header.to_ascii_lowercase();
        if let Some(id) = headers.get(&wanted).filter(|v| !v.is_empty()) {
            input.push_str(id);
        }
    }
    format!("{:x}", md5::compute(input.as_bytes()))
}

/// Parse and fingerprint a raw URL string.
pub fn fingerprint_str(
    url: &str,
    headers: Option<&HashMap<String, String>>,
    cache_id_header: &str,
) -> ProxyResult<String> {
    let parsed = Url::parse(url).map_err(ProxyError::url_parse)?;
    Ok(fingerprint(&parsed, headers, cache_id_header))
}

/// Key for a playlist: digest of the absolute URL alone, no salting.
///
/// All playlists and segments beneath an HLS master share the master's
/// playlist key as their `hls_key`.
pub fn playlist_key(url: &str) -> String {
    format!("{:x}", md5::compute(url.as_bytes()))
}

/// Address of one cached window: `(fingerprint, start, end)`.
///
/// `end` is inclusive; `None` means "to EOF". The `Display` form doubles as
/// the on-disk layout `<fingerprint>/<start>-<end-or-empty>`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SegmentKey {
    pub fingerprint: String,
    pub start: u64,
    pub end: Option<u64>,
}

impl SegmentKey {
    pub fn new(fingerprint: impl Into<String>, start: u64, end: Option<u64>) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            start,
            end,
        }
    }

    /// Filename component: `<start>-<end-or-empty>`.
    pub fn file_name(&self) -> String {
        match self.end {
            Some(end) => format!("{}-{}", self.start, end),
            None => format!("{}-", self.start),
        }
    }

    /// Parse a filename back into `(start, end)`.
    ///
    /// Returns `None` for names that do not follow the `<start>-<end?>` shape,
    /// so stray files in the cache tree are skipped rather than indexed.
    pub fn range_from_file_name(name: &str) -> Option<(u64, Option<u64>)> {
        let (start, end) = name.split_once('-')?;
        let start = start.parse::<u64>().ok()?;
        let end = if end.is_empty() {
            None
        } else {
            Some(end.parse::<u64>().ok()?)
        };
        Some((start, end))
    }
}

impl fmt::Display for SegmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.fingerprint, self.file_name())
    }
}
