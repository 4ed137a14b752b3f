//! End-to-end proxy tests.
//!
//! Every test drives the real server over a raw socket against the local
//! origin fixture: cold and warm ranged serving, boundary ranges, the
//! non-ranging-origin fallback, request validation, port fallback, and the
//! HLS rewrite flow.

mod origin_fixture;
mod setup;

use std::time::Duration;

use media_cache_proxy::{key, Engine, Priority, TaskStatus};
use origin_fixture::{
    http_get, http_raw, init_tracing, pattern, wait_until, OriginFixture, DRIP_LEN, SEGMENT_LEN,
    VIDEO_LEN,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const CACHE_ID_HEADER: &str = "Custom-Cache-ID";

fn video_config(tag: &str) -> media_cache_proxy::ProxyConfig {
    // One window == the whole fixture video, no pre-fetch: task counts in
    // assertions stay exact.
    setup::base_config(tag)
        .segment_size(VIDEO_LEN)
        .first_segment_size(VIDEO_LEN)
        .cache_segments(1)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cold_range_request_then_warm_cache_hit() {
    init_tracing();
    let origin = OriginFixture::start().await;
    let engine = Engine::init(video_config("cold-warm"));
    let proxy = engine.wait_ready().await.unwrap();

    let origin_url = origin.url("/v.mp4");
    let target = format!("/{origin_url}");

    // Cold: one fetch task, full first window streamed through.
    let response = http_get(proxy, &target, &[("Range", "bytes=0-199999")]).await;
    assert_eq!(response.status, 206);
    assert_eq!(response.body.len(), VIDEO_LEN as usize);
    assert_eq!(response.body, pattern(7, VIDEO_LEN).to_vec());
    assert_eq!(
        response.header("content-range"),
        Some(format!("bytes 0-199999/{VIDEO_LEN}").as_str())
    );

    // The window lands on disk under its fingerprint once the worker commits.
    let fingerprint = key::fingerprint_str(&origin_url, None, CACHE_ID_HEADER).unwrap();
    let cached_file = engine
        .cache()
        .root()
        .join("videos")
        .join(&fingerprint)
        .join("0-199999");
    assert!(
        wait_until(Duration::from_secs(5), || cached_file.exists()).await,
        "cached window file never appeared"
    );
    assert_eq!(engine.task_count(), 1);
    let origin_hits = origin.counters.hits("/v.mp4");

    // Warm: prefix range is a pure cache hit, zero new tasks, zero origin hits.
    let response = http_get(proxy, &target, &[("Range", "bytes=0-49999")]).await;
    assert_eq!(response.status, 206);
    assert_eq!(response.body.len(), 50_000);
    assert_eq!(&response.body[..], &pattern(7, VIDEO_LEN)[..50_000]);
    assert_eq!(engine.task_count(), 1);
    assert_eq!(origin.counters.hits("/v.mp4"), origin_hits);

    engine.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn full_request_without_range_returns_200() {
    init_tracing();
    let origin = OriginFixture::start().await;
    let engine = Engine::init(video_config("full-200"));
    let proxy = engine.wait_ready().await.unwrap();

    let response = http_get(proxy, &format!("/{}", origin.url("/v.mp4")), &[]).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, pattern(7, VIDEO_LEN).to_vec());

    engine.close();
}

#[rstest::rstest]
#[case::single_byte("one-byte", 5, 5)]
#[case::exact_window_boundary("win-exact", 0, VIDEO_LEN - 1)]
#[case::mid_window("win-mid", 100_000, 149_999)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn boundary_ranges_have_exact_content_range(
    #[case] tag: &str,
    #[case] start: u64,
    #[case] end: u64,
) {
    init_tracing();
    let origin = OriginFixture::start().await;
    let engine = Engine::init(video_config(tag));
    let proxy = engine.wait_ready().await.unwrap();

    let response = http_get(
        proxy,
        &format!("/{}", origin.url("/v.mp4")),
        &[("Range", format!("bytes={start}-{end}").as_str())],
    )
    .await;
    assert_eq!(response.status, 206);
    let expected = &pattern(7, VIDEO_LEN)[start as usize..=end as usize];
    assert_eq!(response.body, expected);
    assert_eq!(
        response.header("content-range"),
        Some(format!("bytes {start}-{end}/{VIDEO_LEN}").as_str())
    );
    assert_eq!(
        response.header("content-length"),
        Some((end - start + 1).to_string().as_str())
    );

    engine.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn range_past_eof_is_not_satisfiable() {
    init_tracing();
    let origin = OriginFixture::start().await;
    let engine = Engine::init(video_config("eof-416"));
    let proxy = engine.wait_ready().await.unwrap();

    let response = http_get(
        proxy,
        &format!("/{}", origin.url("/v.mp4")),
        &[("Range", "bytes=300000-")],
    )
    .await;
    assert_eq!(response.status, 416);
    assert_eq!(
        response.header("content-range"),
        Some(format!("bytes */{VIDEO_LEN}").as_str())
    );

    engine.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn non_ranging_origin_still_serves_partial_content() {
    init_tracing();
    let origin = OriginFixture::start().await;
    let engine = Engine::init(video_config("plain-origin"));
    let proxy = engine.wait_ready().await.unwrap();

    let origin_url = origin.url("/plain.mp4");
    let response = http_get(
        proxy,
        &format!("/{origin_url}"),
        &[("Range", "bytes=0-49999")],
    )
    .await;
    assert_eq!(response.status, 206);
    assert_eq!(response.body.len(), 50_000);
    assert_eq!(&response.body[..], &pattern(7, VIDEO_LEN)[..50_000]);

    // The single streaming pass cached the whole resource window.
    assert!(
        wait_until(Duration::from_secs(5), || {
            engine.is_cached(&origin_url, None, 1).unwrap_or(false)
        })
        .await
    );

    engine.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rejects_non_get_and_headerless_requests() {
    init_tracing();
    let engine = Engine::init(setup::base_config("reject"));
    let proxy = engine.wait_ready().await.unwrap();

    let response = http_raw(proxy, b"POST /x HTTP/1.1\r\nHost: h\r\n\r\n").await;
    assert_eq!(response.status, 405);

    let response = http_raw(proxy, b"GET /x HTTP/1.1\r\n\r\n").await;
    assert_eq!(response.status, 400);

    engine.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn port_in_use_falls_back_to_next_free_port() {
    init_tracing();
    // Occupy a port, then ask the engine for exactly that one.
    let blocker = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
    let taken = blocker.local_addr().unwrap().port();

    let engine = Engine::init(
        setup::base_config("portfb").port(taken),
    );
    let addr = engine.wait_ready().await.unwrap();
    assert!(addr.port() > taken, "expected fallback past {taken}, got {}", addr.port());

    engine.close();
    drop(blocker);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn hls_master_and_segments_route_through_the_proxy() {
    init_tracing();
    let origin = OriginFixture::start().await;
    let engine = Engine::init(
        setup::base_config("hls")
            .segment_size(SEGMENT_LEN)
            .first_segment_size(SEGMENT_LEN)
            .cache_segments(1),
    );
    let proxy = engine.wait_ready().await.unwrap();
    let proxy_prefix = format!("http://{proxy}/");

    // Master playlist: every variant URI points back at us with its origin.
    let master_url = origin.url("/master.m3u8");
    let response = http_get(proxy, &format!("/{master_url}"), &[]).await;
    assert_eq!(response.status, 200);
    assert_eq!(
        response.header("content-type"),
        Some("application/vnd.apple.mpegurl")
    );
    let master_body = String::from_utf8(response.body).unwrap();
    let variant_lines: Vec<&str> = master_body
        .lines()
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .collect();
    assert_eq!(variant_lines.len(), 2);
    for line in &variant_lines {
        assert!(line.starts_with(&proxy_prefix), "line: {line}");
        assert!(line.contains("origin="), "line: {line}");
    }

    // Variant playlist through the proxy: segments rewritten the same way.
    let variant_target = variant_lines[0]
        .strip_prefix(&format!("http://{proxy}"))
        .unwrap();
    let response = http_get(proxy, variant_target, &[]).await;
    assert_eq!(response.status, 200);
    let media_body = String::from_utf8(response.body).unwrap();
    let segment_lines: Vec<&str> = media_body
        .lines()
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .collect();
    assert_eq!(segment_lines.len(), 2);
    assert!(segment_lines.iter().all(|l| l.starts_with(&proxy_prefix)));

    // First segment: proxied bytes match the origin exactly.
    let segment_target = segment_lines[0]
        .strip_prefix(&format!("http://{proxy}"))
        .unwrap();
    let response = http_get(proxy, segment_target, &[]).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, pattern(100, SEGMENT_LEN).to_vec());

    // Second fetch of the master is served from the rewritten-playlist cache.
    let origin_hits = origin.counters.hits("/master.m3u8");
    let response = http_get(proxy, &format!("/{master_url}"), &[]).await;
    assert_eq!(response.status, 200);
    assert_eq!(origin.counters.hits("/master.m3u8"), origin_hits);

    engine.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn prefetch_enqueues_low_priority_windows_within_horizon() {
    init_tracing();
    let origin = OriginFixture::start().await;
    // 50 KB windows over the 200 KB video, two windows of pre-fetch ahead.
    let engine = Engine::init(
        setup::base_config("prefetch")
            .segment_size(50_000)
            .first_segment_size(50_000)
            .cache_segments(3),
    );
    let proxy = engine.wait_ready().await.unwrap();

    let url = origin.url("/v.mp4");
    let response = http_get(proxy, &format!("/{url}"), &[("Range", "bytes=0-49999")]).await;
    assert_eq!(response.status, 206);
    assert_eq!(response.body.len(), 50_000);

    // The served window is a high-priority fetch; the next
    // `cache_segments - 1` windows were enqueued at low priority, and
    // nothing past the horizon was touched.
    let tasks = engine.pool().tasks_snapshot();
    let priority_of = |start: u64| tasks.iter().find(|t| t.start == start).map(|t| t.priority);
    assert_eq!(priority_of(0), Some(Priority::High));
    assert_eq!(priority_of(50_000), Some(Priority::Low));
    assert_eq!(priority_of(100_000), Some(Priority::Low));
    assert_eq!(priority_of(150_000), None);

    // The pre-fetched windows land in the cache; the one past the horizon
    // does not.
    assert!(
        wait_until(Duration::from_secs(10), || {
            engine.is_cached(&url, None, 3).unwrap_or(false)
        })
        .await
    );
    assert!(!engine.is_cached(&url, None, 4).unwrap());

    engine.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn client_disconnect_lets_horizon_fetches_finish() {
    init_tracing();
    let origin = OriginFixture::start().await;
    // 100 KB windows over the 1 MB drip resource, one window of pre-fetch.
    let engine = Engine::init(
        setup::base_config("disconnect")
            .segment_size(100_000)
            .first_segment_size(100_000)
            .cache_segments(2),
    );
    let proxy = engine.wait_ready().await.unwrap();
    let url = origin.url("/drip.mp4");

    // Request the whole resource, read just the start, then drop the socket
    // while the origin is still dripping.
    let mut stream = tokio::net::TcpStream::connect(proxy).await.unwrap();
    let request = format!(
        "GET /{url} HTTP/1.1\r\nHost: {proxy}\r\nRange: bytes=0-{}\r\n\r\n",
        DRIP_LEN - 1
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut buf = [0u8; 1024];
    let _ = stream.read(&mut buf).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    drop(stream);

    // In-flight fetches are not cancelled by the disconnect; they run to
    // completion and feed the cache.
    assert!(
        wait_until(Duration::from_secs(15), || engine.active_task_count() == 0).await,
        "tasks never settled after the disconnect"
    );
    let tasks = engine.pool().tasks_snapshot();
    assert!(!tasks.is_empty());
    assert!(
        tasks
            .iter()
            .all(|t| matches!(t.status(), TaskStatus::Completed | TaskStatus::Finished)),
        "a fetch within the horizon was cancelled or failed"
    );

    // The window walk stopped at the disconnect: every enqueued fetch lies
    // within one pre-fetch horizon of the client's position. Windows the
    // client actually received are marked `Finished`; the walk can be at
    // most one window past the last of those, and pre-fetch at most
    // `cache_segments - 1` windows past the walk.
    let window_index = |start: u64| start / 100_000;
    let max_any = tasks.iter().map(|t| window_index(t.start)).max().unwrap();
    let max_finished = tasks
        .iter()
        .filter(|t| t.status() == TaskStatus::Finished)
        .map(|t| window_index(t.start))
        .max();
    let horizon = max_finished.map_or(1, |served| served + 2);
    assert!(
        max_any <= horizon,
        "pre-fetch ran past the horizon: window {max_any} vs allowed {horizon}"
    );
    assert!(
        tasks.len() < 10,
        "disconnect did not stop the window walk ({} tasks)",
        tasks.len()
    );

    // What was fetched is cached for the next client.
    assert!(engine.is_cached(&url, None, 1).unwrap());

    engine.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn custom_cache_id_partitions_cached_videos() {
    init_tracing();
    let origin = OriginFixture::start().await;
    let engine = Engine::init(video_config("cache-id"));
    let proxy = engine.wait_ready().await.unwrap();

    let origin_url = origin.url("/v.mp4");
    let target = format!("/{origin_url}");

    http_get(proxy, &target, &[("Range", "bytes=0-999")]).await;
    http_get(
        proxy,
        &target,
        &[("Range", "bytes=0-999"), (CACHE_ID_HEADER, "user-b")],
    )
    .await;

    let mut headers = std::collections::HashMap::new();
    headers.insert(CACHE_ID_HEADER.to_ascii_lowercase(), "user-b".to_string());
    let plain = key::fingerprint_str(&origin_url, None, CACHE_ID_HEADER).unwrap();
    let salted = key::fingerprint_str(&origin_url, Some(&headers), CACHE_ID_HEADER).unwrap();
    assert_ne!(plain, salted);

    assert!(
        wait_until(Duration::from_secs(5), || {
            let videos = engine.cached_videos();
            videos.iter().any(|v| v.key == plain) && videos.iter().any(|v| v.key == salted)
        })
        .await,
        "both cache namespaces should appear in the registry"
    );

    engine.close();
}
