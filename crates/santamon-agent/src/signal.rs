//! Signal generation
//!
//! Turns rule, correlation and baseline matches into deterministic,
//! context-enriched detection records. The signal id is a truncated hash
//! over rule, timestamp, host and a target identifier, so the backend can
//! deduplicate retried deliveries.

use crate::baseline::BaselineMatch;
use crate::correlation::WindowMatch;
use crate::engine::Match;
use crate::lineage::{self, Key, LineageCache};
use crate::view::EventView;
use chrono::{DateTime, SecondsFormat, Utc};
use indexmap::IndexMap;
use santamon_core::rules::Severity;
use santamon_core::telemetry::{extract_field, strip_event_prefix, EventPayload, TelemetryRecord};
use santamon_core::Value;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Maximum nodes attached under `process_tree`.
const PROCESS_TREE_DEPTH: usize = 8;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub id: String,
    pub ts: DateTime<Utc>,
    pub host_id: String,
    pub rule_id: String,
    pub rule_description: String,
    pub status: String,
    pub severity: Severity,
    pub title: String,
    pub tags: Vec<String>,
    pub context: IndexMap<String, Value>,
}

pub struct Generator {
    host_id: String,
    lineage: Option<Arc<LineageCache>>,
}

impl Generator {
    pub fn new(host_id: impl Into<String>, lineage: Option<Arc<LineageCache>>) -> Self {
        Self {
            host_id: host_id.into(),
            lineage,
        }
    }

    /// Signal from a simple-rule match.
    pub fn from_rule_match(&self, m: &Match<'_>, view: &EventView) -> Signal {
        let record = view.record();
        let ts = m.timestamp.unwrap_or_else(Utc::now);

        let mut identifier = record.target_sha256().to_string();
        if identifier.is_empty() {
            identifier = record.target_path().to_string();
        }
        let id = signal_id(&m.rule.id, ts, &self.host_id, &identifier);

        let mut context = IndexMap::new();
        append_record_context(&mut context, record);

        if m.rule.include_event {
            context.insert("event".to_string(), view.map().clone());
        }

        for field in &m.rule.extra_context {
            if field.is_empty() {
                continue;
            }
            let clean = strip_event_prefix(field);

            // argv stays a list instead of flattening to a string.
            if clean == "execution.args" {
                if let Some(args) = view.map().get("execution").and_then(|e| e.get("args")) {
                    context.insert(clean.to_string(), args.clone());
                    continue;
                }
            }

            let value = extract_field(view.map(), clean);
            if !value.is_empty() {
                context.insert(clean.to_string(), Value::Str(value));
            }
        }

        if m.rule.include_process_tree {
            if let Some(tree) = self.process_tree(record) {
                context.insert("process_tree".to_string(), tree);
            }
        }

        Signal {
            id,
            ts,
            host_id: self.host_id.clone(),
            rule_id: m.rule.id.clone(),
            rule_description: m.rule.description.trim().to_string(),
            status: "open".to_string(),
            severity: m.rule.severity,
            title: m.rule.title.clone(),
            tags: m.rule.tags.clone(),
            context,
        }
    }

    /// Signal from a correlation window match. The group key is the stable
    /// identifier; context mirrors single-event signals via a sample event.
    pub fn from_window_match(&self, m: &WindowMatch<'_>) -> Signal {
        let now = Utc::now();
        let id = signal_id(&m.rule.id, now, &self.host_id, &m.group_key);

        let mut context = IndexMap::new();
        context.insert("group_key".to_string(), Value::Str(m.group_key.clone()));
        context.insert("event_count".to_string(), Value::Int(m.count as i64));
        context.insert(
            "window_type".to_string(),
            Value::Str("correlation".to_string()),
        );

        if let Some(sample) = m.events.last() {
            context.insert("sample_event".to_string(), sample.clone());

            let first_of = |paths: &[&str]| -> String {
                paths
                    .iter()
                    .map(|p| extract_field(sample, p))
                    .find(|v| !v.is_empty())
                    .unwrap_or_default()
            };

            let actor_path = first_of(&[
                "execution.instigator.executable.path",
                "file_access.instigator.executable.path",
            ]);
            if !actor_path.is_empty() {
                context.insert("actor_path".to_string(), Value::Str(actor_path));
            }
            let actor_team = first_of(&[
                "execution.instigator.code_signature.team_id",
                "file_access.instigator.code_signature.team_id",
            ]);
            if !actor_team.is_empty() {
                context.insert("actor_team".to_string(), Value::Str(actor_team));
            }
            let actor_signing_id = first_of(&[
                "execution.instigator.code_signature.signing_id",
                "file_access.instigator.code_signature.signing_id",
            ]);
            if !actor_signing_id.is_empty() {
                context.insert(
                    "actor_signing_id".to_string(),
                    Value::Str(actor_signing_id),
                );
            }
            let target_path = first_of(&[
                "execution.target.executable.path",
                "file_access.target.path",
            ]);
            if !target_path.is_empty() {
                context.insert("target_path".to_string(), Value::Str(target_path));
            }
            let target_sha = extract_field(sample, "execution.target.executable.hash.hash");
            if !target_sha.is_empty() {
                context.insert("target_sha256".to_string(), Value::Str(target_sha));
            }
            let decision = first_of(&["execution.decision", "file_access.policy_decision"]);
            if !decision.is_empty() {
                context.insert("decision".to_string(), Value::Str(decision));
            }
            let kind = extract_field(sample, "kind");
            if !kind.is_empty() {
                context.insert("kind".to_string(), Value::Str(kind));
            }
        }

        let mut tags = m.rule.tags.clone();
        tags.push("correlation".to_string());

        Signal {
            id,
            ts: now,
            host_id: self.host_id.clone(),
            rule_id: m.rule.id.clone(),
            rule_description: m.rule.description.trim().to_string(),
            status: "open".to_string(),
            severity: m.rule.severity,
            title: m.rule.title.clone(),
            tags,
            context,
        }
    }

    /// Signal from a baseline first-seen match; the pattern is the stable
    /// identifier.
    pub fn from_baseline_match(&self, m: &BaselineMatch<'_>, view: &EventView) -> Signal {
        let ts = m.timestamp.unwrap_or_else(Utc::now);
        let id = signal_id(&m.rule.id, ts, &self.host_id, &m.pattern);

        let mut context = IndexMap::new();
        context.insert("pattern".to_string(), Value::Str(m.pattern.clone()));
        context.insert("in_learning".to_string(), Value::Bool(m.in_learning));
        append_record_context(&mut context, view.record());

        let mut tags = m.rule.tags.clone();
        tags.push("baseline".to_string());

        Signal {
            id,
            ts,
            host_id: self.host_id.clone(),
            rule_id: m.rule.id.clone(),
            rule_description: m.rule.description.trim().to_string(),
            status: "open".to_string(),
            severity: m.rule.severity,
            title: m.rule.title.clone(),
            tags,
            context,
        }
    }

    fn process_tree(&self, record: &TelemetryRecord) -> Option<Value> {
        let cache = self.lineage.as_ref()?;
        let EventPayload::Execution(exec) = &record.event else {
            return None;
        };
        let id = exec.target.as_ref()?.id.as_ref()?;
        let key = Key::from_process_id(&record.boot_session_uuid, Some(id));
        let chain = cache.lineage(&key, PROCESS_TREE_DEPTH);
        if chain.is_empty() {
            return None;
        }
        Some(lineage::serialize(&chain))
    }
}

/// Deterministic signal id: first 16 bytes of
/// `sha256(rule_id|ts|host|identifier)`, hex-encoded.
pub fn signal_id(rule_id: &str, ts: DateTime<Utc>, host: &str, identifier: &str) -> String {
    let data = format!(
        "{}|{}|{}|{}",
        rule_id,
        ts.to_rfc3339_opts(SecondsFormat::Secs, true),
        host,
        identifier
    );
    let digest = Sha256::digest(data.as_bytes());
    digest[..16].iter().map(|b| format!("{:02x}", b)).collect()
}

fn append_record_context(context: &mut IndexMap<String, Value>, record: &TelemetryRecord) {
    let mut put = |key: &str, value: &str| {
        if !value.is_empty() {
            context.insert(key.to_string(), Value::Str(value.to_string()));
        }
    };
    put("actor_path", record.actor_path());
    put("actor_team", record.actor_team());
    put("actor_signing_id", record.actor_signing_id());
    put("target_path", record.target_path());
    put("target_team", record.target_team());
    put("target_sha256", record.target_sha256());
    put("decision", record.decision_label());
    context.insert(
        "kind".to_string(),
        Value::Str(record.kind().to_string()),
    );
}
