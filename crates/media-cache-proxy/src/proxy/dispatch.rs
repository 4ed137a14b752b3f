//! Per-request handler selection.
//!
//! One variant per handler; the rules are URL-shaped plus the knowledge the
//! HLS pipeline has accumulated (URLs referenced by a rewritten playlist are
//! known segments, URLs already served as playlists stay playlists even
//! without an `.m3u8` extension).

use url::Url;

/// Handler chosen for one request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestKind {
    /// HLS master or media playlist: fetch, rewrite, cache.
    HlsPlaylist,
    /// Media segment below a known playlist: ranged pipeline with the
    /// playlist's tree key attached.
    HlsSegment,
    /// Any byte-addressable resource (progressive MP4 and friends).
    ByteRange,
    /// Non-HTTP scheme: stream the origin verbatim, no caching.
    PassThrough,
}

const SEGMENT_EXTENSIONS: &[&str] = &["ts", "aac", "m4s", "mp4", "m4a", "vtt"];

/// Classify a resolved origin URL.
///
/// `known_playlist` and `known_segment` come from the HLS pipeline's
/// bookkeeping of previously rewritten playlists.
pub fn classify(origin: &Url, known_playlist: bool, known_segment: bool) -> RequestKind {
    if origin.scheme() != "http" && origin.scheme() != "https" {
        return RequestKind::PassThrough;
    }

    if known_playlist || has_extension(origin, &["m3u8"]) || query_flag(origin, "m3u8") {
        return RequestKind::HlsPlaylist;
    }

    if known_segment && has_extension(origin, SEGMENT_EXTENSIONS) {
        return RequestKind::HlsSegment;
    }

    RequestKind::ByteRange
}

fn has_extension(url: &Url, extensions: &[&str]) -> bool {
    let path = url.path();
    let Some((_, ext)) = path.rsplit_once('.') else {
        return false;
    };
    extensions.iter().any(|e| ext.eq_ignore_ascii_case(e))
}

fn query_flag(url: &Url, name: &str) -> bool {
    url.query_pairs().any(|(k, v)| k == name && v == "true")
}
