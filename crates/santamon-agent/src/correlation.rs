//! Correlation window manager
//!
//! Rolling time windows over the state store. Each matching event is
//! appended to its `(rule, group)` bucket; the bucket is then re-read,
//! filtered to the window (keyed on the event's own timestamp, not arrival
//! time), truncated to `max_events`, and counted. Crossing the threshold
//! fires a match and clears the bucket atomically.

use crate::engine::{CompiledCorrelation, WarnLimiter};
use crate::state::{StateStore, StorageError};
use crate::view::EventView;
use chrono::{DateTime, Utc};
use santamon_core::rules::CorrelationRule;
use santamon_core::telemetry::{extract_field, strip_event_prefix};
use santamon_core::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Group key for correlation rules without `group_by` fields.
pub const GLOBAL_GROUP: &str = "_global";

pub struct WindowMatch<'a> {
    pub rule: &'a CorrelationRule,
    pub count: usize,
    pub events: Vec<Value>,
    pub group_key: String,
}

pub struct WindowManager {
    store: Arc<StateStore>,
    max_events: usize,
    limiter: WarnLimiter,
}

impl WindowManager {
    pub fn new(store: Arc<StateStore>, max_events: usize) -> Self {
        Self {
            store,
            max_events,
            limiter: WarnLimiter::default(),
        }
    }

    /// Evaluate an event against the compiled correlation rules.
    pub fn process<'a>(
        &self,
        view: &EventView,
        correlations: &'a [CompiledCorrelation],
    ) -> Result<Vec<WindowMatch<'a>>, StorageError> {
        if correlations.is_empty() {
            return Ok(Vec::new());
        }

        let mut matches = Vec::new();
        let now = Utc::now();

        for compiled in correlations {
            match compiled.program.eval_bool(view.activation()) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    if self.limiter.should_log(&compiled.rule.id) {
                        warn!(rule_id = %compiled.rule.id, error = %e,
                              "correlation filter evaluation error");
                    }
                    continue;
                }
            }

            let rule = &compiled.rule;
            let group_key = group_key(view.map(), &rule.group_by);

            self.store.store_window_event(
                &rule.id,
                &group_key,
                view.record().event_time,
                view.map(),
            )?;

            let stored = self.store.get_window_events(&rule.id, &group_key)?;
            let mut recent: Vec<Value> = stored
                .into_iter()
                .filter(|evt| within_window(evt, now, rule.window))
                .collect();

            if self.max_events > 0 && recent.len() > self.max_events {
                recent.drain(..recent.len() - self.max_events);
            }

            let count = count_events(&recent, rule);

            if count >= rule.threshold as usize {
                self.store.replace_window_events(&rule.id, &group_key, None)?;
                matches.push(WindowMatch {
                    rule,
                    count,
                    events: recent,
                    group_key,
                });
            } else {
                self.store
                    .replace_window_events(&rule.id, &group_key, Some(&recent))?;
            }
        }

        Ok(matches)
    }

    /// Drop stored events older than each rule's window, and all state for
    /// rules no longer loaded.
    pub fn gc(&self, correlations: &[CompiledCorrelation]) -> Result<u64, StorageError> {
        let now = Utc::now();
        let retention: Vec<(String, DateTime<Utc>)> = correlations
            .iter()
            .map(|c| {
                let window = chrono::Duration::from_std(c.rule.window)
                    .unwrap_or_else(|_| chrono::Duration::zero());
                (c.rule.id.clone(), now - window)
            })
            .collect();
        self.store.gc_windows(&retention)
    }
}

/// Build the group key from the event map: `field=value` segments joined by
/// `|`, or `_global` when the rule has no grouping fields.
pub fn group_key(event: &Value, group_by: &[String]) -> String {
    if group_by.is_empty() {
        return GLOBAL_GROUP.to_string();
    }
    let parts: Vec<String> = group_by
        .iter()
        .map(|field| {
            let clean = strip_event_prefix(field);
            format!("{}={}", clean, extract_field(event, clean))
        })
        .collect();
    parts.join("|")
}

fn count_events(events: &[Value], rule: &CorrelationRule) -> usize {
    match &rule.count_distinct {
        Some(field) => {
            let clean = strip_event_prefix(field);
            let mut seen = HashSet::new();
            for evt in events {
                let value = extract_field(evt, clean);
                if !value.is_empty() {
                    seen.insert(value);
                }
            }
            seen.len()
        }
        None => events.len(),
    }
}

/// An event with no usable `event_time` is always outside the window.
fn within_window(event: &Value, now: DateTime<Utc>, window: Duration) -> bool {
    if window.is_zero() {
        return true;
    }
    let Some(ts) = event.get("event_time").and_then(|v| v.as_timestamp()) else {
        return false;
    };
    let age = now.signed_duration_since(ts);
    age <= chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::zero())
}
