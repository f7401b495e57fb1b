//! Process-lineage cache
//!
//! A bounded, TTL-evicted map of process nodes keyed by
//! `(boot_session_uuid, pid, pid_version)`, updated from execution events.
//! Parent links never cross boot sessions; the walker carries a seen-set so
//! cyclic parent links terminate.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use rustc_hash::FxHashSet;
use santamon_core::telemetry::{EventPayload, Execution, ProcessId, TelemetryRecord};
use santamon_core::Value;
use std::sync::RwLock;
use std::time::Duration;

/// Identifies a process within one boot session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Key {
    pub boot_uuid: String,
    pub pid: i32,
    pub pid_version: i32,
}

impl Key {
    pub fn is_zero(&self) -> bool {
        self.boot_uuid.is_empty() && self.pid == 0 && self.pid_version == 0
    }

    pub fn from_process_id(boot_uuid: &str, id: Option<&ProcessId>) -> Self {
        match id {
            Some(id) => Self {
                boot_uuid: boot_uuid.to_string(),
                pid: id.pid,
                pid_version: id.pidversion,
            },
            None => Self::default(),
        }
    }
}

/// Execution-time information about one process.
#[derive(Debug, Clone)]
pub struct Node {
    pub key: Key,
    pub parent: Key,
    pub responsible: Key,
    pub path: String,
    pub user: String,
    pub uid: i32,
    pub group: String,
    pub gid: i32,
    pub session_id: i32,
    pub args: Vec<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct LineageConfig {
    pub max_entries: usize,
    pub ttl: Duration,
}

impl Default for LineageConfig {
    fn default() -> Self {
        Self {
            max_entries: 50_000,
            ttl: Duration::from_secs(3600),
        }
    }
}

pub struct LineageCache {
    nodes: RwLock<FxHashMap<Key, Node>>,
    max_entries: usize,
    ttl: Duration,
}

impl LineageCache {
    pub fn new(cfg: LineageConfig) -> Self {
        Self {
            nodes: RwLock::new(FxHashMap::default()),
            max_entries: cfg.max_entries.max(1),
            ttl: cfg.ttl,
        }
    }

    /// Record or update a node from an execution event.
    pub fn upsert_from_execution(&self, record: &TelemetryRecord) {
        let EventPayload::Execution(exec) = &record.event else {
            return;
        };
        let Some(target) = &exec.target else { return };
        let Some(id) = &target.id else { return };

        let boot = &record.boot_session_uuid;
        let key = Key::from_process_id(boot, Some(id));
        let now = Utc::now();

        let node = Node {
            key: key.clone(),
            parent: parent_key(boot, exec),
            responsible: Key::from_process_id(boot, target.responsible_id.as_ref()),
            path: target
                .executable
                .as_ref()
                .map(|e| e.path.clone())
                .unwrap_or_default(),
            user: target
                .effective_user
                .as_ref()
                .map(|u| u.name.clone())
                .unwrap_or_default(),
            uid: target.effective_user.as_ref().map(|u| u.uid).unwrap_or(0),
            group: target
                .effective_group
                .as_ref()
                .map(|g| g.name.clone())
                .unwrap_or_default(),
            gid: target.effective_group.as_ref().map(|g| g.gid).unwrap_or(0),
            session_id: target.session_id,
            args: exec
                .args
                .iter()
                .map(|a| String::from_utf8_lossy(a).into_owned())
                .collect(),
            start_time: target.start_time,
            created_at: now,
        };

        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());

        // TTL sweep on write keeps growth bounded without a timer.
        if !self.ttl.is_zero() {
            let cutoff = now
                - chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::zero());
            nodes.retain(|_, n| n.created_at >= cutoff);
        }
        if nodes.len() >= self.max_entries {
            if let Some(oldest) = nodes
                .iter()
                .min_by_key(|(_, n)| n.created_at)
                .map(|(k, _)| k.clone())
            {
                nodes.remove(&oldest);
            }
        }

        nodes.insert(key, node);
    }

    /// Ancestor chain starting at `key` (depth 0) and following parent
    /// links outward. Stops on a missing parent, a zero key, a cycle, or
    /// the depth cap. Unknown keys yield an empty chain.
    pub fn lineage(&self, key: &Key, max_depth: usize) -> Vec<Node> {
        let max_depth = if max_depth == 0 { 8 } else { max_depth };
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        if nodes.is_empty() {
            return Vec::new();
        }

        let mut chain = Vec::with_capacity(max_depth);
        let mut seen: FxHashSet<Key> = FxHashSet::default();
        let mut current = nodes.get(key);

        while let Some(node) = current {
            if chain.len() >= max_depth {
                break;
            }
            chain.push(node.clone());
            seen.insert(node.key.clone());

            if node.parent.is_zero() {
                break;
            }
            match nodes.get(&node.parent) {
                Some(next) if !seen.contains(&next.key) => current = Some(next),
                _ => break,
            }
        }

        chain
    }

    pub fn len(&self) -> usize {
        self.nodes.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Serialize a chain for signal context: `target` at depth 0, `parent` at
/// depth 1, `ancestor` beyond.
pub fn serialize(chain: &[Node]) -> Value {
    let out: Vec<Value> = chain
        .iter()
        .enumerate()
        .map(|(depth, node)| {
            let relation = match depth {
                0 => "target",
                1 => "parent",
                _ => "ancestor",
            };
            let mut m = IndexMap::new();
            m.insert("relation".to_string(), Value::Str(relation.to_string()));
            m.insert("depth".to_string(), Value::Int(depth as i64));
            m.insert("pid".to_string(), Value::Int(node.key.pid as i64));
            m.insert(
                "pidversion".to_string(),
                Value::Int(node.key.pid_version as i64),
            );
            m.insert("path".to_string(), Value::Str(node.path.clone()));
            m.insert("user".to_string(), Value::Str(node.user.clone()));
            m.insert("uid".to_string(), Value::Int(node.uid as i64));
            m.insert("group".to_string(), Value::Str(node.group.clone()));
            m.insert("gid".to_string(), Value::Int(node.gid as i64));
            m.insert(
                "session_id".to_string(),
                Value::Int(node.session_id as i64),
            );
            m.insert("start_time".to_string(), node.start_time.into());
            if !node.args.is_empty() {
                m.insert(
                    "args".to_string(),
                    Value::Array(node.args.iter().cloned().map(Value::Str).collect()),
                );
            }
            Value::Map(m)
        })
        .collect();
    Value::Array(out)
}

/// Prefer the target's recorded parent; fall back to the instigator.
fn parent_key(boot: &str, exec: &Execution) -> Key {
    if let Some(parent) = exec.target.as_ref().and_then(|t| t.parent_id.as_ref()) {
        return Key::from_process_id(boot, Some(parent));
    }
    if let Some(inst) = exec.instigator.as_ref().and_then(|i| i.id.as_ref()) {
        return Key::from_process_id(boot, Some(inst));
    }
    Key::default()
}
