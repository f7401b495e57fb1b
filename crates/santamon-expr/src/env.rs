//! Variable environment for expression compilation

use rustc_hash::FxHashMap;
use santamon_core::telemetry::{enum_constants, EVENT_KINDS};

/// Static type of an expression, as known at compile time. `Dyn` covers
/// event payload fields, whose shape depends on the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ty {
    Bool,
    Int,
    Float,
    Str,
    Timestamp,
    Duration,
    List,
    Map,
    Null,
    Dyn,
}

impl Ty {
    pub fn name(&self) -> &'static str {
        match self {
            Ty::Bool => "bool",
            Ty::Int => "int",
            Ty::Float => "float",
            Ty::Str => "str",
            Ty::Timestamp => "timestamp",
            Ty::Duration => "duration",
            Ty::List => "list",
            Ty::Map => "map",
            Ty::Null => "null",
            Ty::Dyn => "dyn",
        }
    }

    pub fn is_dyn(&self) -> bool {
        matches!(self, Ty::Dyn)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Ty::Int | Ty::Float | Ty::Dyn)
    }
}

/// The set of variables an expression may reference, with their types.
#[derive(Debug, Clone, Default)]
pub struct Env {
    vars: FxHashMap<String, Ty>,
}

impl Env {
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard detection environment: record metadata, one dynamic
    /// variable per event kind, decoded argv, and every enum constant.
    pub fn detection() -> Self {
        let mut env = Self::new();
        env.declare("kind", Ty::Str);
        env.declare("machine_id", Ty::Str);
        env.declare("boot_session_uuid", Ty::Str);
        env.declare("event_time", Ty::Timestamp);
        env.declare("processed_time", Ty::Timestamp);
        env.declare("decoded_args", Ty::List);
        for kind in EVENT_KINDS {
            env.declare(kind, Ty::Dyn);
        }
        for (name, _) in enum_constants() {
            env.declare(name, Ty::Int);
        }
        env
    }

    pub fn declare(&mut self, name: &str, ty: Ty) {
        self.vars.insert(name.to_string(), ty);
    }

    pub fn lookup(&self, name: &str) -> Option<Ty> {
        self.vars.get(name).copied()
    }
}
