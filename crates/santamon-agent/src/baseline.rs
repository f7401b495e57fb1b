//! Baseline tracker: first-seen pattern deduplication
//!
//! A baseline rule fires at most once per unique tracked pattern over the
//! lifetime of the state store (subject to LRU eviction). The first-seen
//! check is a single storage transaction, so concurrent evaluators cannot
//! both observe "first".

use crate::engine::{CompiledBaseline, Engine, WarnLimiter};
use crate::state::{StateStore, StorageError};
use crate::view::EventView;
use chrono::{DateTime, Utc};
use santamon_core::rules::BaselineRule;
use santamon_core::telemetry::{extract_field, strip_event_prefix};
use santamon_core::Value;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct BaselineMatch<'a> {
    pub rule: &'a BaselineRule,
    pub pattern: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub in_learning: bool,
}

pub struct BaselineProcessor {
    store: Arc<StateStore>,
    limiter: WarnLimiter,
}

impl BaselineProcessor {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self {
            store,
            limiter: WarnLimiter::default(),
        }
    }

    pub fn process<'a>(
        &self,
        view: &EventView,
        baselines: &'a [CompiledBaseline],
        engine: &Engine,
    ) -> Result<Vec<BaselineMatch<'a>>, StorageError> {
        if baselines.is_empty() {
            return Ok(Vec::new());
        }

        let mut matches = Vec::new();

        for compiled in baselines {
            match compiled.program.eval_bool(view.activation()) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    if self.limiter.should_log(&compiled.rule.id) {
                        warn!(rule_id = %compiled.rule.id, error = %e,
                              "baseline filter evaluation error");
                    }
                    continue;
                }
            }

            let rule = &compiled.rule;
            let pattern = extract_pattern(view.map(), &rule.track);

            if self.store.is_first_seen(&rule.id, &pattern)? {
                let in_learning = engine.in_learning_period(rule);
                if in_learning {
                    debug!(rule_id = %rule.id, pattern = %pattern,
                           "baseline match during learning period");
                }
                matches.push(BaselineMatch {
                    rule,
                    pattern,
                    timestamp: view.record().event_time,
                    in_learning,
                });
            }
        }

        Ok(matches)
    }
}

/// Build the uniqueness pattern from tracked fields: `field=value` segments
/// joined by `|`. Field names are included so patterns stay readable in
/// signals.
pub fn extract_pattern(event: &Value, track: &[String]) -> String {
    let parts: Vec<String> = track
        .iter()
        .map(|field| {
            let clean = strip_event_prefix(field);
            format!("{}={}", clean, extract_field(event, clean))
        })
        .collect();
    parts.join("|")
}
