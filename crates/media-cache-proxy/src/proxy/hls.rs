//! HLS playlist pipeline.
//!
//! Playlists are fetched once, validated with `hls_m3u8`, and rewritten
//! textually so every referenced URI (variant playlists, media segments,
//! encryption keys, init maps) flows back through the proxy as
//! `http://<proxy>/<escaped-origin>?origin=<escaped-origin>`. Tag lines that
//! carry no URI (`#EXTINF`, `#EXT-X-BYTERANGE`, …) are preserved verbatim.
//!
//! The raw playlist text is stored in the segment cache under its playlist
//! key, so a cold start can regenerate the rewritten form without refetching;
//! the rewritten text itself is kept in memory. Every resource beneath one
//! master shares the master's playlist key as its `hls_key`, which is what
//! group cancellation by master URL hangs off.
//!
//! Rewriting is idempotent: URIs that already point at the proxy are left
//! untouched, so feeding a rewritten playlist back through produces identical
//! text.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use url::Url;

use crate::cache::{CachedSegment, SegmentCache};
use crate::error::{ProxyError, ProxyResult};
use crate::fetch::HttpFetcher;
use crate::key::{self, SegmentKey};
use crate::proxy::request::write_simple_response;

const PLAYLIST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";

/// What a rewritten URI refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RefKind {
    /// A variant or media playlist below a master.
    Playlist,
    /// A media segment, key, or init map.
    Segment,
}

pub struct HlsPipeline {
    cache: Arc<SegmentCache>,
    fetcher: HttpFetcher,
    state: Mutex<HlsState>,
}

#[derive(Default)]
struct HlsState {
    /// Rewritten playlist text by playlist key.
    rewritten: HashMap<String, String>,
    /// Known playlist URL → tree key (the master's playlist key).
    playlists: HashMap<String, String>,
    /// Known segment/key/init URL → tree key.
    segments: HashMap<String, String>,
}

impl HlsPipeline {
    pub fn new(cache: Arc<SegmentCache>, fetcher: HttpFetcher) -> Self {
        Self {
            cache,
            fetcher,
            state: Mutex::new(HlsState::default()),
        }
    }

    pub fn is_known_playlist(&self, url: &str) -> bool {
        self.lock().playlists.contains_key(url)
    }

    pub fn is_known_segment(&self, url: &str) -> bool {
        self.lock().segments.contains_key(url)
    }

    /// Tree key for a segment URL referenced by a rewritten playlist.
    pub fn segment_hls_key(&self, url: &str) -> Option<String> {
        self.lock().segments.get(url).cloned()
    }

    /// Serve one playlist request, fetching and rewriting on a cold cache.
    pub async fn serve_playlist(
        &self,
        client: &mut TcpStream,
        origin: &Url,
        headers: &HashMap<String, String>,
        proxy_addr: SocketAddr,
    ) -> ProxyResult<()> {
        let url_str = origin.as_str().to_string();
        let playlist_key = key::playlist_key(&url_str);
        // A playlist referenced by a master inherits the master's tree key;
        // a master (or a directly requested playlist) roots its own tree.
        let hls_key = self
            .lock()
            .playlists
            .get(&url_str)
            .cloned()
            .unwrap_or_else(|| playlist_key.clone());

        let cached_body = self.lock().rewritten.get(&playlist_key).cloned();
        if let Some(body) = cached_body {
            trace!(url = %url_str, "rewritten playlist served from memory");
            return write_simple_response(client, 200, PLAYLIST_CONTENT_TYPE, body.as_bytes())
                .await
                .map_err(ProxyError::from);
        }

        let raw = match self.load_raw(origin, headers, &playlist_key).await {
            Ok(raw) => raw,
            Err(ProxyError::OriginStatus { status, .. }) => {
                write_simple_response(client, status, "text/plain", b"").await?;
                return Ok(());
            }
            Err(e) => {
                debug!(url = %url_str, error = %e, "playlist fetch failed");
                write_simple_response(client, 502, "text/plain", b"").await?;
                return Ok(());
            }
        };

        let rewritten = match self.rewrite_and_register(&raw, origin, proxy_addr, &hls_key) {
            Ok(rewritten) => rewritten,
            Err(e) => {
                debug!(url = %url_str, error = %e, "playlist rewrite failed");
                write_simple_response(client, 502, "text/plain", b"").await?;
                return Ok(());
            }
        };

        {
            let mut state = self.lock();
            state.playlists.insert(url_str.clone(), hls_key.clone());
            state.rewritten.insert(playlist_key, rewritten.clone());
        }

        write_simple_response(client, 200, PLAYLIST_CONTENT_TYPE, rewritten.as_bytes())
            .await
            .map_err(ProxyError::from)
    }

    /// Raw playlist text: cache first, then the origin.
    async fn load_raw(
        &self,
        origin: &Url,
        headers: &HashMap<String, String>,
        playlist_key: &str,
    ) -> ProxyResult<String> {
        let cache_key = SegmentKey::new(playlist_key.to_string(), 0, None);
        if let Some(cached) = self.cache.get(&cache_key) {
            return String::from_utf8(cached.data.to_vec())
                .map_err(|e| ProxyError::invalid_playlist(format!("invalid UTF-8: {e}")));
        }

        let cancel = CancellationToken::new();
        let (bytes, _content_type) = self.fetcher.fetch_small(origin, headers, &cancel).await?;
        let text = std::str::from_utf8(&bytes)
            .map_err(|e| ProxyError::invalid_playlist(format!("invalid UTF-8: {e}")))?
            .to_string();

        let total = bytes.len() as u64;
        if let Err(e) = self.cache.put(
            &cache_key,
            CachedSegment {
                data: bytes,
                total_bytes: total,
            },
        ) {
            debug!(url = %origin, error = %e, "raw playlist cache write failed");
        }
        Ok(text)
    }

    /// Validate, rewrite, and record the references of one playlist.
    fn rewrite_and_register(
        &self,
        raw: &str,
        base: &Url,
        proxy_addr: SocketAddr,
        hls_key: &str,
    ) -> ProxyResult<String> {
        let is_master = classify_playlist(raw)?;
        let (rewritten, refs) = rewrite_playlist(raw, base, proxy_addr, is_master)?;

        let mut state = self.lock();
        for (url, kind) in refs {
            match kind {
                RefKind::Playlist => {
                    state.playlists.insert(url, hls_key.to_string());
                }
                RefKind::Segment => {
                    state.segments.insert(url, hls_key.to_string());
                }
            }
        }
        Ok(rewritten)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HlsState> {
        self.state
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

/// Validate the playlist with `hls_m3u8` and report whether it is a master.
fn classify_playlist(raw: &str) -> ProxyResult<bool> {
    if hls_m3u8::MasterPlaylist::try_from(raw).is_ok() {
        return Ok(true);
    }
    match hls_m3u8::MediaPlaylist::try_from(raw) {
        Ok(_) => Ok(false),
        Err(e) => Err(ProxyError::playlist_parse(e)),
    }
}

/// Rewrite every URI of a playlist to route through the proxy.
///
/// Returns the rewritten text plus the absolute origin URL and kind of every
/// reference encountered.
fn rewrite_playlist(
    raw: &str,
    base: &Url,
    proxy_addr: SocketAddr,
    is_master: bool,
) -> ProxyResult<(String, Vec<(String, RefKind)>)> {
    let mut out = String::with_capacity(raw.len() * 2);
    let mut refs = Vec::new();

    for line in raw.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            out.push_str(line);
        } else if let Some(rest) = trimmed.strip_prefix('#') {
            if has_uri_attribute(rest) {
                let kind = if rest.starts_with("EXT-X-MEDIA")
                    || rest.starts_with("EXT-X-I-FRAME-STREAM-INF")
                {
                    RefKind::Playlist
                } else {
                    RefKind::Segment
                };
                out.push_str(&rewrite_uri_attribute(line, base, proxy_addr, kind, &mut refs)?);
            } else {
                // Tags without URIs (EXTINF, EXT-X-BYTERANGE, …) verbatim.
                out.push_str(line);
            }
        } else {
            // A bare URI line: variant playlist in a master, segment in a
            // media playlist.
            let kind = if is_master {
                RefKind::Playlist
            } else {
                RefKind::Segment
            };
            out.push_str(&rewrite_uri(trimmed, base, proxy_addr, kind, &mut refs)?);
        }
        out.push('\n');
    }

    Ok((out, refs))
}

fn has_uri_attribute(tag: &str) -> bool {
    (tag.starts_with("EXT-X-KEY")
        || tag.starts_with("EXT-X-SESSION-KEY")
        || tag.starts_with("EXT-X-MAP")
        || tag.starts_with("EXT-X-MEDIA")
        || tag.starts_with("EXT-X-I-FRAME-STREAM-INF"))
        && tag.contains("URI=\"")
}

fn rewrite_uri_attribute(
    line: &str,
    base: &Url,
    proxy_addr: SocketAddr,
    kind: RefKind,
    refs: &mut Vec<(String, RefKind)>,
) -> ProxyResult<String> {
    let Some(start) = line.find("URI=\"") else {
        return Ok(line.to_string());
    };
    let value_start = start + "URI=\"".len();
    let Some(value_len) = line[value_start..].find('"') else {
        return Ok(line.to_string());
    };
    let uri = &line[value_start..value_start + value_len];
    let rewritten = rewrite_uri(uri, base, proxy_addr, kind, refs)?;
    Ok(format!(
        "{}{}{}",
        &line[..value_start],
        rewritten,
        &line[value_start + value_len..]
    ))
}

fn rewrite_uri(
    uri: &str,
    base: &Url,
    proxy_addr: SocketAddr,
    kind: RefKind,
    refs: &mut Vec<(String, RefKind)>,
) -> ProxyResult<String> {
    let proxy_prefix = format!("http://{proxy_addr}/");
    if uri.starts_with(&proxy_prefix) {
        // Already routed through us; rewriting is idempotent.
        return Ok(uri.to_string());
    }

    let absolute = base.join(uri).map_err(ProxyError::url_parse)?;
    refs.push((absolute.as_str().to_string(), kind));

    let escaped = utf8_percent_encode(absolute.as_str(), NON_ALPHANUMERIC).to_string();
    Ok(format!("{proxy_prefix}{escaped}?origin={escaped}"))
}
