//! Detection scenarios run through the full evaluation path:
//! view -> engine -> correlation/baseline -> signal generator.

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use santamon_agent::baseline::BaselineProcessor;
use santamon_agent::correlation::WindowManager;
use santamon_agent::engine::Engine;
use santamon_agent::signal::{Generator, Signal};
use santamon_agent::state::StateStore;
use santamon_agent::view::EventView;
use santamon_core::rules::RuleSet;
use santamon_core::telemetry::{
    EventPayload, Execution, FileAccess, FileInfo, HashInfo, PathTarget, PolicyDecision,
    ProcessInfo, ProcessInfoLight, TelemetryRecord,
};
use santamon_core::Value;
use std::sync::Arc;

fn execution(target: &str, instigator: &str, at: DateTime<Utc>) -> TelemetryRecord {
    TelemetryRecord {
        machine_id: "machine-1".into(),
        boot_session_uuid: "boot-1".into(),
        event_time: Some(at),
        processed_time: None,
        event: EventPayload::Execution(Execution {
            instigator: Some(ProcessInfoLight {
                executable: Some(FileInfo {
                    path: instigator.into(),
                    hash: None,
                }),
                ..Default::default()
            }),
            target: Some(ProcessInfo {
                executable: Some(FileInfo {
                    path: target.into(),
                    hash: Some(HashInfo {
                        hash: "f00d".into(),
                    }),
                }),
                ..Default::default()
            }),
            ..Default::default()
        }),
    }
}

fn file_access(instigator: &str, policy: &str, at: DateTime<Utc>) -> TelemetryRecord {
    TelemetryRecord {
        machine_id: "machine-1".into(),
        boot_session_uuid: "boot-1".into(),
        event_time: Some(at),
        processed_time: None,
        event: EventPayload::FileAccess(FileAccess {
            instigator: Some(ProcessInfo {
                executable: Some(FileInfo {
                    path: instigator.into(),
                    hash: None,
                }),
                ..Default::default()
            }),
            target: Some(PathTarget {
                path: "/Users/a/Library/Cookies".into(),
            }),
            policy_name: policy.into(),
            policy_decision: PolicyDecision::Denied,
        }),
    }
}

fn open_store() -> (tempfile::TempDir, Arc<StateStore>) {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(
        StateStore::open(&dir.path().join("state.db"), false, 10_000).unwrap(),
    );
    (dir, store)
}

#[test]
fn test_network_tool_rule_produces_one_signal() {
    let set: RuleSet = serde_yaml::from_str(
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
    let engine = Engine::compile(&set, Utc::now()).unwrap();
    let generator = Generator::new("host-1", None);

    let record = execution(
        "/usr/bin/curl",
        "/bin/sh",
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
    );
    let view = EventView::new(&record);

    let matches = engine.evaluate(&view);
    assert_eq!(matches.len(), 1);

    let signal = generator.from_rule_match(&matches[0], &view);
    assert_eq!(signal.severity.as_str(), "high");
    assert_eq!(
        signal.context.get("target_path"),
        Some(&Value::Str("/usr/bin/curl".into()))
    );
    assert_eq!(
        signal.context.get("actor_path"),
        Some(&Value::Str("/bin/sh".into()))
    );

    // A non-matching target produces nothing.
    let other = execution("/usr/bin/true", "/bin/sh", Utc::now());
    let view = EventView::new(&other);
    assert!(engine.evaluate(&view).is_empty());
}

#[test]
fn test_credential_sweep_correlation() {
    let set: RuleSet = serde_yaml::from_str(
        r#"
correlations:
  - id: cred-sweep
    title: Sensitive file sweep
    expr: 'kind == "file_access"'
    window: 5m
    group_by: ["file_access.instigator.executable.path"]
    count_distinct: "file_access.policy_name"
    threshold: 3
    severity: critical
    enabled: true
"#,
    )
    .unwrap();
    let engine = Engine::compile(&set, Utc::now()).unwrap();
    let (_dir, store) = open_store();
    let wm = WindowManager::new(store, 1000);
    let generator = Generator::new("host-1", None);

    let base = Utc::now() - ChronoDuration::seconds(50);
    let mut signals: Vec<Signal> = Vec::new();
    for (i, policy) in ["ChromeCookies", "SSHPrivateKeys", "KeychainDB"]
        .iter()
        .enumerate()
    {
        let record = file_access(
            "/usr/bin/python3",
            policy,
            base + ChronoDuration::seconds(20 * i as i64),
        );
        let view = EventView::new(&record);
        for m in wm.process(&view, engine.correlations()).unwrap() {
            signals.push(generator.from_window_match(&m));
        }
    }

    assert_eq!(signals.len(), 1);
    let signal = &signals[0];
    assert!(signal.tags.contains(&"correlation".to_string()));
    assert_eq!(signal.context.get("event_count"), Some(&Value::Int(3)));
    assert_eq!(
        signal.context.get("actor_path"),
        Some(&Value::Str("/usr/bin/python3".into()))
    );
    assert_eq!(
        signal.context.get("kind"),
        Some(&Value::Str("file_access".into()))
    );
}

#[test]
fn test_baseline_emits_once_for_duplicate_executions() {
    let set: RuleSet = serde_yaml::from_str(
        r#"
baselines:
  - id: new-binary
    title: Never-seen binary
    expr: 'kind == "execution"'
    track:
      - execution.target.executable.path
      - execution.target.executable.hash.hash
    severity: medium
    enabled: true
"#,
    )
    .unwrap();
    let engine = Engine::compile(&set, Utc::now()).unwrap();
    let (_dir, store) = open_store();
    let bp = BaselineProcessor::new(store);
    let generator = Generator::new("host-1", None);

    let record = execution("/opt/new/tool", "/bin/zsh", Utc::now());

    let mut signals = Vec::new();
    for _ in 0..2 {
        let view = EventView::new(&record);
        for m in bp.process(&view, engine.baselines(), &engine).unwrap() {
            signals.push(generator.from_baseline_match(&m, &view));
        }
    }

    assert_eq!(signals.len(), 1, "identical pattern must emit exactly once");
    assert!(signals[0].tags.contains(&"baseline".to_string()));
}

#[test]
fn test_signal_ids_deterministic_across_runs() {
    let set: RuleSet = serde_yaml::from_str(
        r#"
rules:
  - id: net-tool
    title: Network tool execution
    expr: 'kind == "execution"'
    severity: high
    enabled: true
baselines:
  - id: new-binary
    title: Never-seen binary
    expr: 'kind == "execution"'
    track: [execution.target.executable.path]
    severity: medium
    enabled: true
"#,
    )
    .unwrap();

    let stream: Vec<TelemetryRecord> = (0..3)
        .map(|i| {
            execution(
                "/usr/bin/curl",
                "/bin/sh",
                Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, i).unwrap(),
            )
        })
        .collect();

    let run = || -> Vec<String> {
        let engine = Engine::compile(&set, Utc::now()).unwrap();
        let (_dir, store) = open_store();
        let bp = BaselineProcessor::new(store);
        let generator = Generator::new("host-1", None);

        let mut ids = Vec::new();
        for record in &stream {
            let view = EventView::new(record);
            for m in engine.evaluate(&view) {
                ids.push(generator.from_rule_match(&m, &view).id);
            }
            for m in bp.process(&view, engine.baselines(), &engine).unwrap() {
                ids.push(generator.from_baseline_match(&m, &view).id);
            }
        }
        ids
    };

    let first = run();
    let second = run();
    assert_eq!(first, second, "same stream and host must yield same ids");
    assert_eq!(first.len(), 4); // 3 rule matches + 1 baseline
}
