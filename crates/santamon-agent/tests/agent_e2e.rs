//! End-to-end: spool file -> watcher -> decoder -> engine -> shipper ->
//! in-process backend.

use santamon_agent::config::{
    AgentConfig, Config, RetryConfig, RulesConfig, ShipperConfig, SpoolConfig, StateConfig,
};
use santamon_agent::pipeline;
use santamon_agent::spool::decoder::encode_record;
use santamon_agent::state::StateStore;
use santamon_core::telemetry::{
    EventPayload, Execution, FileInfo, ProcessInfo, ProcessInfoLight, TelemetryRecord,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use warp::Filter;

async fn spawn_backend() -> (u16, Arc<Mutex<Vec<serde_json::Value>>>) {
    let received: Arc<Mutex<Vec<serde_json::Value>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();

    let route = warp::post()
        .and(warp::path("signals"))
        .and(warp::body::json::<serde_json::Value>())
        .map(move |body: serde_json::Value| {
            if let Some(signals) = body.get("signals").and_then(|s| s.as_array()) {
                sink.lock().unwrap().extend(signals.iter().cloned());
            }
            warp::reply::json(&serde_json::json!({"status": "ok"}))
        });

    let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);
    (addr.port(), received)
}

fn curl_record() -> TelemetryRecord {
    TelemetryRecord {
        machine_id: "machine-1".into(),
        boot_session_uuid: "boot-1".into(),
        event_time: Some(chrono::Utc::now()),
        processed_time: None,
        event: EventPayload::Execution(Execution {
            instigator: Some(ProcessInfoLight {
                executable: Some(FileInfo {
                    path: "/bin/sh".into(),
                    hash: None,
                }),
                ..Default::default()
            }),
            target: Some(ProcessInfo {
                executable: Some(FileInfo {
                    path: "/usr/bin/curl".into(),
                    hash: None,
                }),
                ..Default::default()
            }),
            ..Default::default()
        }),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_spool_file_becomes_backend_signal() {
    let dir = tempfile::tempdir().unwrap();
    let spool_dir = dir.path().join("spool");
    let archive_dir = dir.path().join("archive");
    let rules_path = dir.path().join("rules.yaml");
    let db_path = dir.path().join("state.db");

    std::fs::write(
        &rules_path,
        r#"
rules:
  - id: net-tool
    title: Network tool execution
    expr: 'kind == "execution" && execution.target.executable.path in ["/usr/bin/curl", "/usr/bin/wget"]'
    severity: high
    enabled: true
"#,
    )
    .unwrap();

    let (port, received) = spawn_backend().await;

    let cfg = Config {
        agent: AgentConfig {
            id: "test-host".into(),
            state_dir: dir.path().to_path_buf(),
            log_level: "warn".into(),
            workers: 1,
        },
        spool: SpoolConfig {
            spool_dir: spool_dir.clone(),
            archive_dir: Some(archive_dir.clone()),
            stability_wait: Duration::from_millis(50),
            check_interval: Duration::from_millis(20),
            ..Default::default()
        },
        rules: RulesConfig { path: rules_path },
        state: StateConfig {
            db_path: db_path.clone(),
            ..Default::default()
        },
        shipper: ShipperConfig {
            endpoint: format!("http://127.0.0.1:{}/signals", port),
            api_key: "0123456789abcdef0123".into(),
            flush_on_enqueue: Some(true),
            retry: RetryConfig {
                max_attempts: 3,
                backoff: "exponential".into(),
                initial: Duration::from_millis(20),
                max: Duration::from_millis(100),
            },
            heartbeat: santamon_agent::config::HeartbeatConfig {
                enabled: false,
                interval: None,
            },
            ..Default::default()
        },
    };
    cfg.validate(false).unwrap();

    let cancel = CancellationToken::new();
    let agent = {
        let cfg = cfg.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { pipeline::run(cfg, cancel).await })
    };

    // Publish one telemetry file after the agent is up.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let new_dir = spool_dir.join("new");
    std::fs::create_dir_all(&new_dir).unwrap();
    std::fs::write(new_dir.join("evt-0001.bin"), encode_record(&curl_record())).unwrap();

    // Wait for the backend to receive the signal.
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    loop {
        if !received.lock().unwrap().is_empty() {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "backend never received a signal"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    cancel.cancel();
    agent.await.unwrap().unwrap();

    let signals = received.lock().unwrap().clone();
    assert_eq!(signals.len(), 1, "exactly one signal expected");
    let signal = &signals[0];
    assert_eq!(signal["rule_id"], "net-tool");
    assert_eq!(signal["severity"], "high");
    assert_eq!(signal["host_id"], "test-host");
    assert_eq!(signal["status"], "open");
    assert_eq!(signal["context"]["target_path"], "/usr/bin/curl");
    assert_eq!(signal["context"]["actor_path"], "/bin/sh");
    assert_eq!(signal["context"]["kind"], "execution");

    // The spool file was archived and the queue drained.
    assert!(!new_dir.join("evt-0001.bin").exists());
    assert!(archive_dir.join("evt-0001.bin").exists());
    let store = StateStore::open(&db_path, false, 10_000).unwrap();
    assert_eq!(store.queued_count().unwrap(), 0);
}
