//! Rule engine: loading, compilation and simple-rule evaluation
//!
//! A compiled `Engine` is immutable and shared behind an `Arc`; hot reload
//! swaps the whole engine so evaluators never observe a half-installed rule
//! set. Evaluation errors are rate-limited to one log line per rule per
//! minute and always count as no-match.

use crate::view::EventView;
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use santamon_core::rules::{BaselineRule, CorrelationRule, Rule, RuleError, RuleSet};
use santamon_expr::{compile, CompileError, Env, EvalError, Program};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to read rules from {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("duplicate rule ID {id}: found in both {} and {}", first.display(), second.display())]
    DuplicateAcrossFiles {
        id: String,
        first: PathBuf,
        second: PathBuf,
    },

    #[error(transparent)]
    Invalid(#[from] RuleError),

    #[error("failed to compile rule {id}: {source}")]
    Compile {
        id: String,
        #[source]
        source: CompileError,
    },
}

pub struct CompiledRule {
    pub rule: Rule,
    pub program: Program,
}

pub struct CompiledCorrelation {
    pub rule: CorrelationRule,
    pub program: Program,
}

pub struct CompiledBaseline {
    pub rule: BaselineRule,
    pub program: Program,
}

/// A simple-rule match, borrowing the rule it fired for.
pub struct Match<'a> {
    pub rule: &'a Rule,
    pub timestamp: Option<DateTime<Utc>>,
}

/// One warning per key per minute.
pub struct WarnLimiter {
    last: Mutex<FxHashMap<String, Instant>>,
    interval: Duration,
}

impl Default for WarnLimiter {
    fn default() -> Self {
        Self {
            last: Mutex::new(FxHashMap::default()),
            interval: Duration::from_secs(60),
        }
    }
}

impl WarnLimiter {
    pub fn should_log(&self, key: &str) -> bool {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        match last.get(key) {
            Some(at) if now.duration_since(*at) < self.interval => false,
            _ => {
                last.insert(key.to_string(), now);
                true
            }
        }
    }
}

pub struct Engine {
    rules: Vec<CompiledRule>,
    correlations: Vec<CompiledCorrelation>,
    baselines: Vec<CompiledBaseline>,
    start_time: DateTime<Utc>,
    limiter: WarnLimiter,
}

impl Engine {
    /// Compile every enabled rule in the set. Disabled rules are never
    /// compiled. `start_time` anchors baseline learning periods and is kept
    /// across hot reloads.
    pub fn compile(ruleset: &RuleSet, start_time: DateTime<Utc>) -> Result<Self, EngineError> {
        let env = Env::detection();
        let compile_one = |id: &str, expr: &str| -> Result<Program, EngineError> {
            compile(expr, &env).map_err(|source| EngineError::Compile {
                id: id.to_string(),
                source,
            })
        };

        let mut rules = Vec::new();
        for rule in ruleset.rules.iter().filter(|r| r.enabled) {
            rules.push(CompiledRule {
                program: compile_one(&rule.id, &rule.expr)?,
                rule: rule.clone(),
            });
        }

        let mut correlations = Vec::new();
        for corr in ruleset.correlations.iter().filter(|c| c.enabled) {
            correlations.push(CompiledCorrelation {
                program: compile_one(&corr.id, &corr.expr)?,
                rule: corr.clone(),
            });
        }

        let mut baselines = Vec::new();
        for baseline in ruleset.baselines.iter().filter(|b| b.enabled) {
            baselines.push(CompiledBaseline {
                program: compile_one(&baseline.id, &baseline.expr)?,
                rule: baseline.clone(),
            });
        }

        Ok(Self {
            rules,
            correlations,
            baselines,
            start_time,
            limiter: WarnLimiter::default(),
        })
    }

    /// Evaluate every simple rule against the event, in insertion order.
    /// Rules that error are skipped.
    pub fn evaluate<'a>(&'a self, view: &EventView) -> Vec<Match<'a>> {
        let mut matches = Vec::new();
        for compiled in &self.rules {
            match compiled.program.eval_bool(view.activation()) {
                Ok(true) => matches.push(Match {
                    rule: &compiled.rule,
                    timestamp: view.record().event_time,
                }),
                Ok(false) => {}
                Err(e) => self.warn_eval(&compiled.rule.id, &e),
            }
        }
        matches
    }

    pub fn correlations(&self) -> &[CompiledCorrelation] {
        &self.correlations
    }

    pub fn baselines(&self) -> &[CompiledBaseline] {
        &self.baselines
    }

    pub fn rule_count(&self) -> (usize, usize, usize) {
        (
            self.rules.len(),
            self.correlations.len(),
            self.baselines.len(),
        )
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    /// Whether a baseline rule is still inside its learning period.
    pub fn in_learning_period(&self, baseline: &BaselineRule) -> bool {
        match baseline.learning_period {
            Some(period) => {
                let elapsed = Utc::now().signed_duration_since(self.start_time);
                elapsed < chrono::Duration::from_std(period).unwrap_or(chrono::Duration::zero())
            }
            None => false,
        }
    }

    pub fn warn_eval(&self, rule_id: &str, error: &EvalError) {
        if self.limiter.should_log(rule_id) {
            warn!(rule_id, error = %error, "rule evaluation error");
        }
    }
}

/// Load rules from a file or a directory tree of YAML files, auto-detected.
pub fn load_rules(path: &Path) -> Result<RuleSet, EngineError> {
    let meta = std::fs::metadata(path).map_err(|source| EngineError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let ruleset = if meta.is_dir() {
        load_rules_dir(path)?
    } else {
        load_rules_file(path)?
    };
    ruleset.validate()?;
    Ok(ruleset)
}

fn load_rules_file(path: &Path) -> Result<RuleSet, EngineError> {
    let raw = std::fs::read_to_string(path).map_err(|source| EngineError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&raw).map_err(|source| EngineError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn load_rules_dir(dir: &Path) -> Result<RuleSet, EngineError> {
    let mut merged = RuleSet::default();
    let mut id_to_file: FxHashMap<String, PathBuf> = FxHashMap::default();

    let mut stack = vec![dir.to_path_buf()];
    let mut files = Vec::new();
    while let Some(current) = stack.pop() {
        let entries = std::fs::read_dir(&current).map_err(|source| EngineError::Io {
            path: current.clone(),
            source,
        })?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("yaml") | Some("yml")
            ) {
                files.push(path);
            }
        }
    }
    // Deterministic merge order regardless of directory iteration order.
    files.sort();

    for path in files {
        let ruleset = load_rules_file(&path)?;
        for id in ruleset.ids() {
            if let Some(first) = id_to_file.get(id) {
                return Err(EngineError::DuplicateAcrossFiles {
                    id: id.to_string(),
                    first: first.clone(),
                    second: path.clone(),
                });
            }
            id_to_file.insert(id.to_string(), path.clone());
        }
        merged.merge(ruleset);
    }

    Ok(merged)
}
