//! Pre-cache, task-pool, and cancellation tests.

mod origin_fixture;
mod setup;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use media_cache_proxy::{key, Engine, Priority, TaskRequest, TaskStatus, Url};
use origin_fixture::{init_tracing, wait_until, OriginFixture, VIDEO_LEN};

const WINDOW: u64 = 50_000;

fn precache_config(tag: &str) -> media_cache_proxy::ProxyConfig {
    setup::base_config(tag)
        .segment_size(WINDOW)
        .first_segment_size(WINDOW)
        .cache_segments(1)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn precache_byte_warms_windows_and_dedupes() {
    init_tracing();
    let origin = OriginFixture::start().await;
    let engine = Engine::init(precache_config("precache-byte"));
    engine.wait_ready().await.unwrap();

    let url = origin.url("/v.mp4");

    // 120 KB rounds up to three 50 KB windows.
    let first = engine
        .precache_byte(&url, None, 120_000, 1, 3, true, true)
        .unwrap();
    assert!(first.is_some(), "first run should return a progress stream");

    // An immediately repeated call for the same fingerprint is suppressed.
    let second = engine
        .precache_byte(&url, None, 120_000, 1, 3, true, true)
        .unwrap();
    assert!(second.is_none(), "duplicate run should be deduped");

    // Progress events flow on the stream.
    let mut progress = first.unwrap();
    let event = tokio::time::timeout(Duration::from_secs(10), progress.recv())
        .await
        .expect("no progress event in time")
        .expect("progress stream closed without events");
    assert!(!event.fingerprint.is_empty());

    // Completion makes the covered windows resident.
    assert!(
        wait_until(Duration::from_secs(10), || {
            engine.is_cached(&url, None, 3).unwrap_or(false)
        })
        .await,
        "pre-cached windows never became resident"
    );

    // Once the run ended, a new one is allowed again.
    assert!(
        wait_until(Duration::from_secs(5), || {
            engine
                .precache_byte(&url, None, 120_000, 1, 3, true, true)
                .ok()
                .flatten()
                .is_some()
        })
        .await
    );

    engine.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn precache_by_segment_count_warms_the_head() {
    init_tracing();
    let origin = OriginFixture::start().await;
    let engine = Engine::init(precache_config("precache-seg"));
    engine.wait_ready().await.unwrap();

    let url = origin.url("/v.mp4");
    engine.precache(&url, None, 2, true, false).unwrap();

    assert!(
        wait_until(Duration::from_secs(10), || {
            engine.is_cached(&url, None, 2).unwrap_or(false)
        })
        .await
    );
    assert!(!engine.is_cached(&url, None, 4).unwrap());

    engine.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn origin_failure_retries_with_backoff_then_fails() {
    init_tracing();
    let origin = OriginFixture::start().await;
    let engine = Engine::init(precache_config("retry-fail"));
    engine.wait_ready().await.unwrap();

    let started = Instant::now();
    let status = engine
        .pool()
        .execute_task(TaskRequest {
            uri: Url::parse(&origin.url("/flaky.bin")).unwrap(),
            headers: HashMap::new(),
            hls_key: None,
            start: 0,
            end: Some(VIDEO_LEN - 1),
            priority: Priority::High,
            dispatch: true,
        })
        .await;

    assert_eq!(status, TaskStatus::Failed);
    // Initial attempt plus three retries.
    assert_eq!(origin.flaky_attempts(), 4);
    // Backoff 0.2s + 0.4s + 0.8s between attempts.
    assert!(
        started.elapsed() >= Duration::from_millis(1300),
        "retries finished suspiciously fast: {:?}",
        started.elapsed()
    );

    engine.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_by_master_url_tears_down_the_tree() {
    init_tracing();
    let origin = OriginFixture::start().await;
    let engine = Engine::init(precache_config("cancel-tree"));
    engine.wait_ready().await.unwrap();

    let master_url = origin.url("/master.m3u8");
    let hls_key = key::playlist_key(&master_url);

    // Three in-flight downloads sharing the master's tree key.
    let mut tasks = Vec::new();
    for i in 0..3 {
        let (task, created) = engine.pool().add_task(TaskRequest {
            uri: Url::parse(&origin.url(&format!("/slow.bin?stream={i}"))).unwrap(),
            headers: HashMap::new(),
            hls_key: Some(hls_key.clone()),
            start: 0,
            end: None,
            priority: Priority::High,
            dispatch: true,
        });
        assert!(created);
        tasks.push(task);
    }

    assert!(
        wait_until(Duration::from_secs(5), || {
            tasks.iter().all(|t| t.status() == TaskStatus::Downloading)
        })
        .await,
        "downloads never started"
    );

    let count_before = engine.task_count();
    assert_eq!(count_before, 3);
    let mut count_rx = engine.task_count_stream();

    let cancelled = engine.cancel_video_tasks(&master_url, None).unwrap();
    assert_eq!(cancelled, 3);

    // All three reach their silent terminal state within a chunk boundary.
    assert!(
        wait_until(Duration::from_secs(2), || {
            tasks.iter().all(|t| t.status() == TaskStatus::Cancelled)
        })
        .await
    );
    assert_eq!(engine.task_count(), 0);

    // One aggregate task-count update for the whole batch.
    count_rx.changed().await.unwrap();
    assert_eq!(*count_rx.borrow(), 0);

    // Cancelling again is a no-op.
    assert_eq!(engine.cancel_video_tasks(&master_url, None).unwrap(), 0);

    engine.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pause_parks_and_resume_restarts_a_download() {
    init_tracing();
    let origin = OriginFixture::start().await;
    let engine = Engine::init(precache_config("pause-resume"));
    engine.wait_ready().await.unwrap();

    let url = origin.url("/slow.bin");
    let (task, _) = engine.pool().add_task(TaskRequest {
        uri: Url::parse(&url).unwrap(),
        headers: HashMap::new(),
        hls_key: None,
        start: 0,
        end: None,
        priority: Priority::High,
        dispatch: true,
    });

    assert!(
        wait_until(Duration::from_secs(5), || {
            task.status() == TaskStatus::Downloading
        })
        .await
    );

    engine.pool().pause_video_tasks(&task.fingerprint);
    assert!(
        wait_until(Duration::from_secs(2), || task.status() == TaskStatus::Paused).await,
        "task never parked"
    );

    engine.pool().resume_video_tasks(&task.fingerprint);
    assert!(
        wait_until(Duration::from_secs(2), || {
            task.status() == TaskStatus::Downloading
        })
        .await,
        "task never resumed"
    );

    engine.cancel_video_tasks(&url, None).unwrap();
    assert!(
        wait_until(Duration::from_secs(2), || {
            task.status() == TaskStatus::Cancelled
        })
        .await
    );

    engine.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_submissions_coalesce_onto_one_task() {
    init_tracing();
    let origin = OriginFixture::start().await;
    let engine = Engine::init(precache_config("coalesce"));
    engine.wait_ready().await.unwrap();

    let request = TaskRequest {
        uri: Url::parse(&origin.url("/slow.bin")).unwrap(),
        headers: HashMap::new(),
        hls_key: None,
        start: 0,
        end: None,
        priority: Priority::High,
        dispatch: true,
    };

    let (first, created_first) = engine.pool().add_task(request.clone());
    let (second, created_second) = engine.pool().add_task(request);
    assert!(created_first);
    assert!(!created_second);
    assert_eq!(first.id, second.id);
    assert_eq!(engine.task_count(), 1);

    engine.cancel_video_tasks(&origin.url("/slow.bin"), None).unwrap();
    engine.close();
}
