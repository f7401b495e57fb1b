//! Detection rule definitions and validation
//!
//! Rule files are YAML with three top-level sections: `rules` (simple),
//! `correlations` (time-window) and `baselines` (first-seen). IDs must be
//! unique across all three sections of the loaded set.

use crate::duration::{serde_dur, serde_opt_dur};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Valid rule severities, lowest to highest.
pub const SEVERITIES: &[&str] = &["low", "medium", "high", "critical"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("{0} is required")]
    Required(&'static str),

    #[error("invalid severity (must be low/medium/high/critical)")]
    InvalidSeverity,

    #[error("{field} field {index} is empty")]
    EmptyField { field: &'static str, index: usize },

    #[error("duplicate rule ID: {0}")]
    DuplicateId(String),

    #[error("correlation threshold must be greater than 0")]
    NonPositiveThreshold,

    #[error("invalid rule {id}: {source}")]
    InvalidRule {
        id: String,
        #[source]
        source: Box<RuleError>,
    },
}

/// A simple per-event detection rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub expr: String,
    pub severity: Severity,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub enabled: bool,
    /// Extra dotted field paths copied into the signal context.
    #[serde(default)]
    pub extra_context: Vec<String>,
    /// Attach the full flattened event map under `event`.
    #[serde(default)]
    pub include_event: bool,
    /// Attach the process ancestor chain for execution events.
    #[serde(default)]
    pub include_process_tree: bool,
}

/// A time-window correlation rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationRule {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub expr: String,
    #[serde(with = "serde_dur")]
    pub window: Duration,
    #[serde(default)]
    pub group_by: Vec<String>,
    #[serde(default)]
    pub count_distinct: Option<String>,
    pub threshold: u32,
    pub severity: Severity,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub enabled: bool,
}

/// A first-seen baseline rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineRule {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub expr: String,
    /// Fields forming the uniqueness pattern.
    pub track: Vec<String>,
    pub severity: Severity,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub enabled: bool,
    /// Matches inside this window after agent start are flagged low-confidence.
    #[serde(default, with = "serde_opt_dur")]
    pub learning_period: Option<Duration>,
}

/// The merged contents of one or more rule files.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub correlations: Vec<CorrelationRule>,
    #[serde(default)]
    pub baselines: Vec<BaselineRule>,
}

impl RuleSet {
    /// Merge another set into this one. Duplicate checking happens in
    /// `validate`, or in the loader when source files are known.
    pub fn merge(&mut self, other: RuleSet) {
        self.rules.extend(other.rules);
        self.correlations.extend(other.correlations);
        self.baselines.extend(other.baselines);
    }

    /// All rule IDs across the three sections, in declaration order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.rules
            .iter()
            .map(|r| r.id.as_str())
            .chain(self.correlations.iter().map(|c| c.id.as_str()))
            .chain(self.baselines.iter().map(|b| b.id.as_str()))
    }

    pub fn validate(&self) -> Result<(), RuleError> {
        let mut seen = std::collections::HashSet::new();

        for rule in &self.rules {
            if !seen.insert(rule.id.clone()) {
                return Err(RuleError::DuplicateId(rule.id.clone()));
            }
            rule.validate().map_err(|e| RuleError::InvalidRule {
                id: rule.id.clone(),
                source: Box::new(e),
            })?;
        }

        for corr in &self.correlations {
            if !seen.insert(corr.id.clone()) {
                return Err(RuleError::DuplicateId(corr.id.clone()));
            }
            corr.validate().map_err(|e| RuleError::InvalidRule {
                id: corr.id.clone(),
                source: Box::new(e),
            })?;
        }

        for baseline in &self.baselines {
            if !seen.insert(baseline.id.clone()) {
                return Err(RuleError::DuplicateId(baseline.id.clone()));
            }
            baseline.validate().map_err(|e| RuleError::InvalidRule {
                id: baseline.id.clone(),
                source: Box::new(e),
            })?;
        }

        Ok(())
    }
}

impl Rule {
    pub fn validate(&self) -> Result<(), RuleError> {
        if self.id.is_empty() {
            return Err(RuleError::Required("rule ID"));
        }
        if self.title.is_empty() {
            return Err(RuleError::Required("rule title"));
        }
        if self.expr.is_empty() {
            return Err(RuleError::Required("rule expression"));
        }
        Ok(())
    }
}

impl CorrelationRule {
    pub fn validate(&self) -> Result<(), RuleError> {
        if self.id.is_empty() {
            return Err(RuleError::Required("correlation ID"));
        }
        if self.title.is_empty() {
            return Err(RuleError::Required("correlation title"));
        }
        if self.expr.is_empty() {
            return Err(RuleError::Required("correlation expression"));
        }
        if self.window.is_zero() {
            return Err(RuleError::Required("correlation window"));
        }
        if self.threshold == 0 {
            return Err(RuleError::NonPositiveThreshold);
        }
        for (i, field) in self.group_by.iter().enumerate() {
            if field.is_empty() {
                return Err(RuleError::EmptyField {
                    field: "group_by",
                    index: i,
                });
            }
        }
        Ok(())
    }
}

impl BaselineRule {
    pub fn validate(&self) -> Result<(), RuleError> {
        if self.id.is_empty() {
            return Err(RuleError::Required("baseline ID"));
        }
        if self.title.is_empty() {
            return Err(RuleError::Required("baseline title"));
        }
        if self.expr.is_empty() {
            return Err(RuleError::Required("baseline expression"));
        }
        if self.track.is_empty() {
            return Err(RuleError::Required("baseline track fields"));
        }
        for (i, field) in self.track.iter().enumerate() {
            if field.is_empty() {
                return Err(RuleError::EmptyField {
                    field: "track",
                    index: i,
                });
            }
        }
        Ok(())
    }
}
