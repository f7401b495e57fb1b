//! Spool watcher integration tests: stability discipline, startup backlog,
//! journal suppression.

use santamon_agent::config::SpoolConfig;
use santamon_agent::spool::SpoolWatcher;
use santamon_agent::state::StateStore;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct Harness {
    _dir: tempfile::TempDir,
    spool_dir: PathBuf,
    store: Arc<StateStore>,
    cfg: SpoolConfig,
}

fn harness(stability_wait: Duration, check_interval: Duration, channel_buffer: usize) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let spool_dir = dir.path().join("spool");
    let store = Arc::new(
        StateStore::open(&dir.path().join("state.db"), false, 1000).unwrap(),
    );
    let cfg = SpoolConfig {
        spool_dir: spool_dir.clone(),
        archive_dir: None,
        stability_wait,
        check_interval,
        max_pending_files: 10_000,
        channel_buffer,
        ..Default::default()
    };
    Harness {
        _dir: dir,
        spool_dir,
        store,
        cfg,
    }
}

fn start(
    h: &Harness,
    cancel: &CancellationToken,
) -> (mpsc::Receiver<PathBuf>, tokio::task::JoinHandle<()>) {
    let watcher = Arc::new(SpoolWatcher::new(&h.cfg, h.store.clone()).unwrap());
    let (tx, rx) = mpsc::channel(h.cfg.channel_buffer);
    let cancel = cancel.clone();
    let handle = tokio::spawn(async move {
        watcher.run(tx, cancel).await;
    });
    (rx, handle)
}

#[tokio::test]
async fn test_new_file_emitted_once_after_stability() {
    let h = harness(
        Duration::from_millis(300),
        Duration::from_millis(50),
        16,
    );
    let cancel = CancellationToken::new();
    let (mut rx, handle) = start(&h, &cancel);

    // Let the watcher start before publishing.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let file = h.spool_dir.join("new").join("event.bin");
    std::fs::write(&file, b"payload").unwrap();
    let written = Instant::now();

    let path = tokio::time::timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("timed out waiting for stable file")
        .expect("channel closed");
    assert_eq!(path, file);
    assert!(
        written.elapsed() >= Duration::from_millis(300),
        "emitted before the stability wait: {:?}",
        written.elapsed()
    );

    // Untouched file: no second emission.
    let extra = tokio::time::timeout(Duration::from_millis(500), rx.recv()).await;
    assert!(extra.is_err(), "file emitted more than once");

    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_modified_file_waits_for_quiet_period() {
    let h = harness(
        Duration::from_millis(400),
        Duration::from_millis(50),
        16,
    );
    let cancel = CancellationToken::new();
    let (mut rx, handle) = start(&h, &cancel);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let file = h.spool_dir.join("new").join("busy.bin");
    // Keep rewriting; the watcher must hold the file back.
    for i in 0..3 {
        if i > 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        std::fs::write(&file, format!("chunk{}", i)).unwrap();
    }
    let last_write = Instant::now();

    let path = tokio::time::timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("timed out")
        .expect("channel closed");
    assert_eq!(path, file);
    assert!(
        last_write.elapsed() >= Duration::from_millis(350),
        "emitted {:?} after last write, wanted >= ~400ms",
        last_write.elapsed()
    );

    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_startup_backlog_drains_through_tiny_channel() {
    let h = harness(Duration::from_millis(30), Duration::from_millis(20), 1);
    let new_dir = h.spool_dir.join("new");
    std::fs::create_dir_all(&new_dir).unwrap();

    const FILES: usize = 1000;
    for i in 0..FILES {
        std::fs::write(new_dir.join(format!("f{:04}.bin", i)), b"x").unwrap();
    }
    // All files are stable before the watcher starts.
    tokio::time::sleep(Duration::from_millis(60)).await;

    let cancel = CancellationToken::new();
    let (mut rx, handle) = start(&h, &cancel);

    let mut seen = std::collections::HashSet::new();
    let deadline = Instant::now() + Duration::from_secs(20);
    while seen.len() < FILES {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let path = tokio::time::timeout(remaining, rx.recv())
            .await
            .unwrap_or_else(|_| panic!("timed out with {}/{} files", seen.len(), FILES))
            .expect("channel closed early");
        assert!(seen.insert(path), "duplicate delivery");
    }

    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_journaled_files_suppressed() {
    let h = harness(Duration::from_millis(30), Duration::from_millis(20), 16);
    let new_dir = h.spool_dir.join("new");
    std::fs::create_dir_all(&new_dir).unwrap();

    let processed = new_dir.join("done.bin");
    let fresh = new_dir.join("fresh.bin");
    std::fs::write(&processed, b"x").unwrap();
    std::fs::write(&fresh, b"y").unwrap();
    h.store.mark_processed(&processed, 1).unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;

    let cancel = CancellationToken::new();
    let (mut rx, handle) = start(&h, &cancel);

    let path = tokio::time::timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("timed out")
        .expect("channel closed");
    assert_eq!(path, fresh);

    let extra = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
    assert!(extra.is_err(), "journaled file was re-emitted");

    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_cancellation_closes_channel() {
    let h = harness(Duration::from_millis(50), Duration::from_millis(20), 4);
    let cancel = CancellationToken::new();
    let (mut rx, handle) = start(&h, &cancel);
    tokio::time::sleep(Duration::from_millis(50)).await;

    cancel.cancel();
    handle.await.unwrap();
    assert!(rx.recv().await.is_none(), "channel must close on cancel");
}
