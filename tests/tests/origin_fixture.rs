//! Local in-memory origin server used by the integration tests.
//!
//! Serves deterministic byte patterns with proper `Range` support, plus a few
//! purposely misbehaving endpoints: one that ignores `Range`, one that drops
//! the connection mid-body, and one that trickles bytes forever. An HLS tree
//! (master + two variants + segments) rounds it out. All tests run against
//! this fixture; nothing touches the external network.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub const VIDEO_LEN: u64 = 200_000;
pub const SEGMENT_LEN: u64 = 100_000;
pub const DRIP_LEN: u64 = 1_000_000;

/// Deterministic body pattern: byte i of a resource is `(seed + i) % 251`.
pub fn pattern(seed: u64, len: u64) -> Bytes {
    (0..len).map(|i| ((seed + i) % 251) as u8).collect()
}

#[derive(Clone, Default)]
pub struct Counters {
    hits: Arc<Mutex<HashMap<String, usize>>>,
}

impl Counters {
    fn record(&self, path: &str) {
        *self
            .hits
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_insert(0) += 1;
    }

    pub fn hits(&self, path: &str) -> usize {
        self.hits.lock().unwrap().get(path).copied().unwrap_or(0)
    }
}

#[derive(Clone)]
struct FixtureState {
    counters: Counters,
    flaky_attempts: Arc<AtomicUsize>,
}

pub struct OriginFixture {
    pub addr: SocketAddr,
    pub counters: Counters,
    flaky_attempts: Arc<AtomicUsize>,
}

impl OriginFixture {
    pub async fn start() -> Self {
        let counters = Counters::default();
        let flaky_attempts = Arc::new(AtomicUsize::new(0));
        let state = FixtureState {
            counters: counters.clone(),
            flaky_attempts: Arc::clone(&flaky_attempts),
        };

        let app = Router::new()
            .route("/v.mp4", get(ranged_video))
            .route("/drip.mp4", get(drip_video))
            .route("/plain.mp4", get(plain_video))
            .route("/flaky.bin", get(flaky))
            .route("/slow.bin", get(slow))
            .route("/master.m3u8", get(master_playlist))
            .route("/low/index.m3u8", get(low_playlist))
            .route("/hi/index.m3u8", get(hi_playlist))
            .route("/low/{segment}", get(low_segment))
            .with_state(state);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            counters,
            flaky_attempts,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    pub fn flaky_attempts(&self) -> usize {
        self.flaky_attempts.load(Ordering::SeqCst)
    }
}

fn parse_range(headers: &HeaderMap, len: u64) -> Option<(u64, u64)> {
    let value = headers.get("range")?.to_str().ok()?;
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start = start.parse::<u64>().ok()?;
    let end = match end {
        "" => len - 1,
        e => e.parse::<u64>().ok()?.min(len - 1),
    };
    (start <= end && start < len).then_some((start, end))
}

fn serve_ranged(headers: &HeaderMap, seed: u64, len: u64, content_type: &str) -> Response {
    let body = pattern(seed, len);
    match parse_range(headers, len) {
        Some((start, end)) => Response::builder()
            .status(StatusCode::PARTIAL_CONTENT)
            .header("Content-Type", content_type)
            .header("Content-Range", format!("bytes {start}-{end}/{len}"))
            .header("Content-Length", (end - start + 1).to_string())
            .body(Body::from(body.slice(start as usize..=end as usize)))
            .unwrap(),
        None => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", content_type)
            .header("Content-Length", len.to_string())
            .body(Body::from(body))
            .unwrap(),
    }
}

async fn ranged_video(State(state): State<FixtureState>, headers: HeaderMap) -> Response {
    state.counters.record("/v.mp4");
    serve_ranged(&headers, 7, VIDEO_LEN, "video/mp4")
}

/// Honors `Range`, but drips the body out in small delayed chunks so tests
/// can disconnect a client mid-stream deterministically.
async fn drip_video(State(state): State<FixtureState>, headers: HeaderMap) -> Response {
    state.counters.record("/drip.mp4");
    let body = pattern(13, DRIP_LEN);
    let (status, slice, builder) = match parse_range(&headers, DRIP_LEN) {
        Some((start, end)) => (
            StatusCode::PARTIAL_CONTENT,
            body.slice(start as usize..=end as usize),
            Response::builder()
                .header("Content-Range", format!("bytes {start}-{end}/{DRIP_LEN}")),
        ),
        None => (StatusCode::OK, body, Response::builder()),
    };

    let len = slice.len();
    let stream = futures_util::stream::unfold((slice, 0usize), |(body, offset)| async move {
        if offset >= body.len() {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        let end = (offset + 50_000).min(body.len());
        let chunk = body.slice(offset..end);
        Some((Ok::<Bytes, io::Error>(chunk), (body, end)))
    });

    builder
        .status(status)
        .header("Content-Type", "video/mp4")
        .header("Content-Length", len.to_string())
        .body(Body::from_stream(stream))
        .unwrap()
}

/// Ignores `Range` entirely: always a 200 with the whole body.
async fn plain_video(State(state): State<FixtureState>) -> Response {
    state.counters.record("/plain.mp4");
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "video/mp4")
        .header("Content-Length", VIDEO_LEN.to_string())
        .body(Body::from(pattern(7, VIDEO_LEN)))
        .unwrap()
}

/// Sends a few bytes, then drops the connection.
async fn flaky(State(state): State<FixtureState>, headers: HeaderMap) -> Response {
    state.counters.record("/flaky.bin");
    state.flaky_attempts.fetch_add(1, Ordering::SeqCst);
    let start = parse_range(&headers, VIDEO_LEN).map(|(s, _)| s).unwrap_or(0);
    let head = pattern(11, VIDEO_LEN).slice(start as usize..(start as usize + 10).min(VIDEO_LEN as usize));
    let stream = futures_util::stream::iter(vec![
        Ok::<Bytes, io::Error>(head),
        Err(io::Error::new(io::ErrorKind::ConnectionReset, "fixture drop")),
    ]);
    Response::builder()
        .status(StatusCode::PARTIAL_CONTENT)
        .header("Content-Range", format!("bytes {start}-{}/{VIDEO_LEN}", VIDEO_LEN - 1))
        .body(Body::from_stream(stream))
        .unwrap()
}

/// Trickles one byte every 200 ms, effectively forever.
async fn slow(State(state): State<FixtureState>) -> Response {
    state.counters.record("/slow.bin");
    let stream = futures_util::stream::unfold(0u64, |i| async move {
        if i >= 100_000 {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        Some((Ok::<Bytes, io::Error>(Bytes::from(vec![(i % 251) as u8])), i + 1))
    });
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/octet-stream")
        .body(Body::from_stream(stream))
        .unwrap()
}

async fn master_playlist(State(state): State<FixtureState>) -> impl IntoResponse {
    state.counters.record("/master.m3u8");
    let body = "#EXTM3U\n\
#EXT-X-STREAM-INF:BANDWIDTH=800000,RESOLUTION=640x360\n\
low/index.m3u8\n\
#EXT-X-STREAM-INF:BANDWIDTH=2500000,RESOLUTION=1280x720\n\
hi/index.m3u8\n";
    ([("Content-Type", "application/vnd.apple.mpegurl")], body)
}

fn media_playlist_body() -> &'static str {
    "#EXTM3U\n\
#EXT-X-VERSION:3\n\
#EXT-X-TARGETDURATION:6\n\
#EXT-X-MEDIA-SEQUENCE:0\n\
#EXTINF:6.0,\n\
seg-0.ts\n\
#EXTINF:6.0,\n\
seg-1.ts\n\
#EXT-X-ENDLIST\n"
}

async fn low_playlist(State(state): State<FixtureState>) -> impl IntoResponse {
    state.counters.record("/low/index.m3u8");
    (
        [("Content-Type", "application/vnd.apple.mpegurl")],
        media_playlist_body(),
    )
}

async fn hi_playlist(State(state): State<FixtureState>) -> impl IntoResponse {
    state.counters.record("/hi/index.m3u8");
    (
        [("Content-Type", "application/vnd.apple.mpegurl")],
        media_playlist_body(),
    )
}

async fn low_segment(
    State(state): State<FixtureState>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    state.counters.record(uri.path());
    // seg-0.ts seeds differently from seg-1.ts.
    let seed = if uri.path().ends_with("seg-1.ts") { 101 } else { 100 };
    serve_ranged(&headers, seed, SEGMENT_LEN, "video/mp2t")
}

// ----------------------------
// Raw HTTP client helpers
// ----------------------------

pub struct RawResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

/// Issue one GET against `addr` with a raw socket and read the whole
/// close-delimited response.
pub async fn http_get(
    addr: SocketAddr,
    target: &str,
    extra_headers: &[(&str, &str)],
) -> RawResponse {
    let mut request = format!("GET {target} HTTP/1.1\r\nHost: {addr}\r\n");
    for (name, value) in extra_headers {
        request.push_str(&format!("{name}: {value}\r\n"));
    }
    request.push_str("\r\n");

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    parse_response(&raw)
}

/// Send arbitrary bytes and return the parsed response (for malformed-request
/// tests).
pub async fn http_raw(addr: SocketAddr, payload: &[u8]) -> RawResponse {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(payload).await.unwrap();
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    parse_response(&raw)
}

fn parse_response(raw: &[u8]) -> RawResponse {
    let head_end = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("no response head");
    let head = std::str::from_utf8(&raw[..head_end]).unwrap();
    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap();
    let status = status_line
        .split_whitespace()
        .nth(1)
        .unwrap()
        .parse::<u16>()
        .unwrap();
    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_ascii_lowercase(), value.trim().to_string()))
        .collect();
    RawResponse {
        status,
        headers,
        body: raw[head_end + 4..].to_vec(),
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    condition()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "media_cache_proxy=debug".into()),
        )
        .with_test_writer()
        .try_init();
}
