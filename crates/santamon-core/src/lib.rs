//! Santamon Core - Foundational types for the Santamon detection agent
//!
//! This crate provides the telemetry record model, the runtime value type
//! shared with the expression engine, and the detection rule definitions.

pub mod ast;
pub mod duration;
pub mod rules;
pub mod telemetry;
pub mod value;

pub use ast::{BinOp, Expr, UnaryOp};
pub use rules::{BaselineRule, CorrelationRule, Rule, RuleError, RuleSet, Severity};
pub use telemetry::{EventPayload, TelemetryBatch, TelemetryRecord};
pub use value::Value;
