//! Shipper integration tests against an in-process HTTP backend.

use santamon_agent::config::{RetryConfig, ShipperConfig};
use santamon_agent::shipper::{BreakerState, Shipper};
use santamon_agent::signal::signal_id;
use santamon_agent::state::StateStore;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use warp::http::StatusCode;
use warp::Filter;

/// Backend stub: answers with statuses from a script, then 200 forever.
/// Returns the bound port and the request counter.
async fn spawn_backend(script: Vec<u16>) -> (u16, Arc<AtomicUsize>) {
    let counter = Arc::new(AtomicUsize::new(0));
    let counter_clone = counter.clone();
    let script = Arc::new(script);

    let route = warp::post()
        .and(warp::path("signals"))
        .and(warp::body::json::<serde_json::Value>())
        .map(move |_body: serde_json::Value| {
            let n = counter_clone.fetch_add(1, Ordering::SeqCst);
            let status = script
                .get(n)
                .copied()
                .map(|s| StatusCode::from_u16(s).unwrap())
                .unwrap_or(StatusCode::OK);
            warp::reply::with_status("", status)
        });

    let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);
    (addr.port(), counter)
}

fn queued_signal(store: &StateStore, rule_id: &str) {
    let ts = chrono::Utc::now();
    let id = signal_id(rule_id, ts, "test-host", "/usr/bin/curl");
    let json = serde_json::json!({
        "id": id,
        "ts": ts.to_rfc3339(),
        "host_id": "test-host",
        "rule_id": rule_id,
        "rule_description": "",
        "status": "open",
        "severity": "high",
        "title": "Test",
        "tags": [],
        "context": {},
    });
    store.enqueue_signal(&id, &json.to_string()).unwrap();
}

fn shipper_config(port: u16, max_attempts: u32) -> ShipperConfig {
    ShipperConfig {
        endpoint: format!("http://127.0.0.1:{}/signals", port),
        api_key: "0123456789abcdef0123".into(),
        batch_size: 100,
        flush_interval: Duration::from_secs(3600),
        timeout: Duration::from_secs(5),
        retry: RetryConfig {
            max_attempts,
            backoff: "exponential".into(),
            initial: Duration::from_millis(10),
            max: Duration::from_millis(50),
        },
        flush_on_enqueue: Some(false),
        tls_skip_verify: false,
        heartbeat: Default::default(),
    }
}

fn open_store() -> (tempfile::TempDir, Arc<StateStore>) {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(
        StateStore::open(&dir.path().join("state.db"), false, 1000).unwrap(),
    );
    (dir, store)
}

#[tokio::test]
async fn test_batch_retried_until_delivered() {
    // Five 503s, then success: same batch delivered on the sixth attempt.
    let (port, counter) = spawn_backend(vec![503, 503, 503, 503, 503]).await;
    let (_dir, store) = open_store();
    queued_signal(&store, "retry-rule");

    let shipper = Shipper::new(shipper_config(port, 10), "test-host", store.clone()).unwrap();
    shipper.flush_now(&CancellationToken::new()).await;

    assert_eq!(counter.load(Ordering::SeqCst), 6);
    assert_eq!(store.queued_count().unwrap(), 0, "queue must drain on ack");
    assert_eq!(shipper.breaker_state(), BreakerState::Closed);
}

#[tokio::test]
async fn test_poison_batch_dropped() {
    let (port, counter) = spawn_backend(vec![400]).await;
    let (_dir, store) = open_store();
    queued_signal(&store, "poison-rule");

    let shipper = Shipper::new(shipper_config(port, 5), "test-host", store.clone()).unwrap();
    shipper.flush_now(&CancellationToken::new()).await;

    // No retries for a malformed-batch rejection; queue drained by drop.
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!(store.queued_count().unwrap(), 0);
}

#[tokio::test]
async fn test_auth_failure_keeps_queue() {
    let (port, counter) = spawn_backend(vec![401, 401, 401, 401, 401, 401, 401, 401]).await;
    let (_dir, store) = open_store();
    queued_signal(&store, "auth-rule");

    let shipper = Shipper::new(shipper_config(port, 2), "test-host", store.clone()).unwrap();
    shipper.flush_now(&CancellationToken::new()).await;

    assert_eq!(counter.load(Ordering::SeqCst), 2);
    assert_eq!(
        store.queued_count().unwrap(),
        1,
        "auth failures must not drop signals"
    );
}

#[tokio::test]
async fn test_breaker_opens_after_repeated_failed_cycles() {
    // Backend that always fails.
    let (port, _counter) = spawn_backend(vec![500; 64]).await;
    let (_dir, store) = open_store();
    queued_signal(&store, "down-rule");

    let shipper = Shipper::new(shipper_config(port, 1), "test-host", store.clone()).unwrap();
    let cancel = CancellationToken::new();
    for _ in 0..3 {
        shipper.flush_now(&cancel).await;
    }
    assert_eq!(shipper.breaker_state(), BreakerState::Open);
    assert_eq!(store.queued_count().unwrap(), 1);

    // While open, flushes are skipped entirely.
    let before = _counter.load(Ordering::SeqCst);
    shipper.flush_now(&cancel).await;
    assert_eq!(_counter.load(Ordering::SeqCst), before);
}

#[tokio::test]
async fn test_network_error_is_retryable() {
    // Nothing is listening on this port.
    let (_dir, store) = open_store();
    queued_signal(&store, "unreachable");

    let mut cfg = shipper_config(1, 2);
    cfg.endpoint = "http://127.0.0.1:1/signals".into();
    cfg.timeout = Duration::from_millis(200);

    let shipper = Shipper::new(cfg, "test-host", store.clone()).unwrap();
    shipper.flush_now(&CancellationToken::new()).await;
    assert_eq!(store.queued_count().unwrap(), 1);
}

#[tokio::test]
async fn test_queue_survives_across_shippers() {
    // A failed delivery stays queued; a later (recovered) shipper drains it.
    let (_dir, store) = open_store();
    queued_signal(&store, "persistent");

    let mut down = shipper_config(1, 1);
    down.endpoint = "http://127.0.0.1:1/signals".into();
    down.timeout = Duration::from_millis(200);
    let shipper = Shipper::new(down, "test-host", store.clone()).unwrap();
    shipper.flush_now(&CancellationToken::new()).await;
    assert_eq!(store.queued_count().unwrap(), 1);

    let (port, _) = spawn_backend(vec![]).await;
    let shipper = Shipper::new(shipper_config(port, 3), "test-host", store.clone()).unwrap();
    shipper.flush_now(&CancellationToken::new()).await;
    assert_eq!(store.queued_count().unwrap(), 0);
}
