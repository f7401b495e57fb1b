//! Runtime evaluation of compiled programs
//!
//! Evaluation is synchronous, allocation-light and reentrant: a `Program`
//! holds no mutable state, so one compiled rule set is shared read-only
//! across worker threads. `&&` and `||` short-circuit left to right, which
//! is what lets rules guard payload access with a `kind == ...` prefix.

use crate::compile::Program;
use crate::error::EvalError;
use rustc_hash::FxHashMap;
use santamon_core::ast::{BinOp, Expr, UnaryOp};
use santamon_core::telemetry::enum_constants;
use santamon_core::Value;
use std::cmp::Ordering;

/// Per-event variable bindings.
#[derive(Debug, Clone, Default)]
pub struct Activation {
    vars: FxHashMap<String, Value>,
}

impl Activation {
    pub fn new() -> Self {
        Self::default()
    }

    /// An activation pre-populated with every named enum constant.
    pub fn with_enum_constants() -> Self {
        let mut act = Self::new();
        for (name, code) in enum_constants() {
            act.vars.insert((*name).to_string(), Value::Int(*code));
        }
        act
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.vars.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }
}

impl Program {
    /// Evaluate to a raw value.
    pub fn eval(&self, activation: &Activation) -> Result<Value, EvalError> {
        eval_expr(self.ast(), activation)
    }

    /// Evaluate to a boolean; a non-boolean result is an error the caller
    /// logs and treats as no-match.
    pub fn eval_bool(&self, activation: &Activation) -> Result<bool, EvalError> {
        match self.eval(activation)? {
            Value::Bool(b) => Ok(b),
            other => Err(EvalError::NonBoolean(other.type_name())),
        }
    }
}

fn eval_expr(expr: &Expr, act: &Activation) -> Result<Value, EvalError> {
    match expr {
        Expr::Null => Ok(Value::Null),
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::Int(n) => Ok(Value::Int(*n)),
        Expr::Float(f) => Ok(Value::Float(*f)),
        Expr::Str(s) => Ok(Value::Str(s.clone())),
        Expr::Duration(ns) => Ok(Value::Duration(*ns)),
        Expr::List(items) => {
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                values.push(eval_expr(item, act)?);
            }
            Ok(Value::Array(values))
        }
        Expr::Ident(name) => act
            .get(name)
            .cloned()
            .ok_or_else(|| EvalError::UnknownVariable(name.clone())),
        Expr::Member { expr: base, member } => {
            let value = eval_expr(base, act)?;
            match value {
                Value::Map(map) => map
                    .get(member)
                    .cloned()
                    .ok_or_else(|| EvalError::NoSuchField(field_path(base, member))),
                Value::Null => Err(EvalError::NullAccess(field_path(base, member))),
                other => Err(EvalError::TypeMismatch {
                    op: ".",
                    left: other.type_name(),
                    right: "map",
                }),
            }
        }
        Expr::Index { expr: base, index } => {
            let value = eval_expr(base, act)?;
            let idx = eval_expr(index, act)?;
            match (value, idx) {
                (Value::Array(items), Value::Int(i)) => {
                    if i < 0 || i as usize >= items.len() {
                        Err(EvalError::IndexOutOfRange(i))
                    } else {
                        Ok(items[i as usize].clone())
                    }
                }
                (Value::Map(map), Value::Str(key)) => map
                    .get(&key)
                    .cloned()
                    .ok_or(EvalError::NoSuchField(key)),
                (v, i) => Err(EvalError::TypeMismatch {
                    op: "[]",
                    left: v.type_name(),
                    right: i.type_name(),
                }),
            }
        }
        Expr::Unary { op, expr } => {
            let value = eval_expr(expr, act)?;
            match op {
                UnaryOp::Not => match value {
                    Value::Bool(b) => Ok(Value::Bool(!b)),
                    other => Err(EvalError::TypeMismatch {
                        op: "!",
                        left: other.type_name(),
                        right: "bool",
                    }),
                },
                UnaryOp::Neg => match value {
                    Value::Int(n) => Ok(Value::Int(-n)),
                    Value::Float(f) => Ok(Value::Float(-f)),
                    other => Err(EvalError::TypeMismatch {
                        op: "-",
                        left: other.type_name(),
                        right: "number",
                    }),
                },
            }
        }
        Expr::Binary { op, left, right } => eval_binary(*op, left, right, act),
        Expr::Call { func, args } => eval_call(func, args, act),
        Expr::Method {
            receiver,
            method,
            args,
        } => eval_method(receiver, method, args, act),
    }
}

fn eval_binary(op: BinOp, left: &Expr, right: &Expr, act: &Activation) -> Result<Value, EvalError> {
    // Short-circuit logic first; everything else evaluates both sides.
    match op {
        BinOp::And => {
            if !as_bool(eval_expr(left, act)?, "&&")? {
                return Ok(Value::Bool(false));
            }
            return Ok(Value::Bool(as_bool(eval_expr(right, act)?, "&&")?));
        }
        BinOp::Or => {
            if as_bool(eval_expr(left, act)?, "||")? {
                return Ok(Value::Bool(true));
            }
            return Ok(Value::Bool(as_bool(eval_expr(right, act)?, "||")?));
        }
        _ => {}
    }

    let lv = eval_expr(left, act)?;
    let rv = eval_expr(right, act)?;
    let mismatch = |op: &'static str, l: &Value, r: &Value| EvalError::TypeMismatch {
        op,
        left: l.type_name(),
        right: r.type_name(),
    };

    match op {
        BinOp::Eq => Ok(Value::Bool(values_equal(&lv, &rv))),
        BinOp::NotEq => Ok(Value::Bool(!values_equal(&lv, &rv))),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ord = compare_values(&lv, &rv).ok_or_else(|| mismatch(op.symbol(), &lv, &rv))?;
            let result = match op {
                BinOp::Lt => ord == Ordering::Less,
                BinOp::Le => ord != Ordering::Greater,
                BinOp::Gt => ord == Ordering::Greater,
                _ => ord != Ordering::Less,
            };
            Ok(Value::Bool(result))
        }
        BinOp::In => match &rv {
            Value::Array(items) => Ok(Value::Bool(items.iter().any(|i| values_equal(&lv, i)))),
            Value::Map(map) => match &lv {
                Value::Str(key) => Ok(Value::Bool(map.contains_key(key))),
                _ => Err(mismatch("in", &lv, &rv)),
            },
            _ => Err(mismatch("in", &lv, &rv)),
        },
        BinOp::Add => match (&lv, &rv) {
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a + b)),
            (Value::Str(a), Value::Str(b)) => Ok(Value::Str(format!("{}{}", a, b))),
            (Value::Duration(a), Value::Duration(b)) => Ok(Value::Duration(a + b)),
            (Value::Timestamp(ts), Value::Duration(d))
            | (Value::Duration(d), Value::Timestamp(ts)) => Ok(Value::Timestamp(
                *ts + chrono::Duration::nanoseconds(*d as i64),
            )),
            _ => match (lv.as_float(), rv.as_float()) {
                (Some(a), Some(b)) => Ok(Value::Float(a + b)),
                _ => Err(mismatch("+", &lv, &rv)),
            },
        },
        BinOp::Sub => match (&lv, &rv) {
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a - b)),
            (Value::Timestamp(a), Value::Timestamp(b)) => {
                let nanos = a
                    .signed_duration_since(*b)
                    .num_nanoseconds()
                    .unwrap_or(i64::MAX);
                Ok(Value::Duration(nanos.max(0) as u64))
            }
            (Value::Timestamp(ts), Value::Duration(d)) => Ok(Value::Timestamp(
                *ts - chrono::Duration::nanoseconds(*d as i64),
            )),
            (Value::Duration(a), Value::Duration(b)) => {
                Ok(Value::Duration(a.saturating_sub(*b)))
            }
            _ => match (lv.as_float(), rv.as_float()) {
                (Some(a), Some(b)) => Ok(Value::Float(a - b)),
                _ => Err(mismatch("-", &lv, &rv)),
            },
        },
        BinOp::Mul => match (&lv, &rv) {
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a * b)),
            _ => match (lv.as_float(), rv.as_float()) {
                (Some(a), Some(b)) => Ok(Value::Float(a * b)),
                _ => Err(mismatch("*", &lv, &rv)),
            },
        },
        BinOp::Div => match (&lv, &rv) {
            (Value::Int(_), Value::Int(0)) => Err(EvalError::DivisionByZero),
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a / b)),
            _ => match (lv.as_float(), rv.as_float()) {
                (Some(_), Some(b)) if b == 0.0 => Err(EvalError::DivisionByZero),
                (Some(a), Some(b)) => Ok(Value::Float(a / b)),
                _ => Err(mismatch("/", &lv, &rv)),
            },
        },
        BinOp::Mod => match (&lv, &rv) {
            (Value::Int(_), Value::Int(0)) => Err(EvalError::DivisionByZero),
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a % b)),
            _ => Err(mismatch("%", &lv, &rv)),
        },
        BinOp::And | BinOp::Or => unreachable!("handled above"),
    }
}

fn eval_call(func: &str, args: &[Expr], act: &Activation) -> Result<Value, EvalError> {
    match func {
        "size" => {
            let value = eval_expr(&args[0], act)?;
            let len = match &value {
                Value::Str(s) => s.chars().count(),
                Value::Array(a) => a.len(),
                Value::Map(m) => m.len(),
                other => {
                    return Err(EvalError::TypeMismatch {
                        op: "size",
                        left: other.type_name(),
                        right: "str/list/map",
                    })
                }
            };
            Ok(Value::Int(len as i64))
        }
        "has" => {
            // Presence check never errors: a missing parent means absent.
            let present = matches!(eval_expr(&args[0], act), Ok(v) if v != Value::Null);
            Ok(Value::Bool(present))
        }
        other => Err(EvalError::UnknownVariable(other.to_string())),
    }
}

fn eval_method(
    receiver: &Expr,
    method: &str,
    args: &[Expr],
    act: &Activation,
) -> Result<Value, EvalError> {
    let recv = eval_expr(receiver, act)?;
    let arg = eval_expr(&args[0], act)?;

    let mismatch = |op: &'static str| EvalError::TypeMismatch {
        op,
        left: recv.type_name(),
        right: arg.type_name(),
    };

    match method {
        "contains" => match (&recv, &arg) {
            (Value::Str(s), Value::Str(needle)) => Ok(Value::Bool(s.contains(needle.as_str()))),
            (Value::Array(items), needle) => {
                Ok(Value::Bool(items.iter().any(|i| values_equal(i, needle))))
            }
            _ => Err(mismatch("contains")),
        },
        "starts_with" | "startsWith" => match (&recv, &arg) {
            (Value::Str(s), Value::Str(prefix)) => {
                Ok(Value::Bool(s.starts_with(prefix.as_str())))
            }
            _ => Err(mismatch("starts_with")),
        },
        "ends_with" | "endsWith" => match (&recv, &arg) {
            (Value::Str(s), Value::Str(suffix)) => Ok(Value::Bool(s.ends_with(suffix.as_str()))),
            _ => Err(mismatch("ends_with")),
        },
        other => Err(EvalError::UnknownVariable(other.to_string())),
    }
}

fn as_bool(value: Value, op: &'static str) -> Result<bool, EvalError> {
    match value {
        Value::Bool(b) => Ok(b),
        other => Err(EvalError::TypeMismatch {
            op,
            left: other.type_name(),
            right: "bool",
        }),
    }
}

/// Equality with Int/Float cross-promotion; null equals only null.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Int(x), Value::Float(y)) | (Value::Float(y), Value::Int(x)) => *x as f64 == *y,
        _ => a == b,
    }
}

fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Some(x.cmp(y)),
        (Value::Str(x), Value::Str(y)) => Some(x.cmp(y)),
        (Value::Timestamp(x), Value::Timestamp(y)) => Some(x.cmp(y)),
        (Value::Duration(x), Value::Duration(y)) => Some(x.cmp(y)),
        _ => {
            let (x, y) = (a.as_float()?, b.as_float()?);
            x.partial_cmp(&y)
        }
    }
}

fn field_path(base: &Expr, member: &str) -> String {
    match base.as_path() {
        Some(mut path) => {
            path.push('.');
            path.push_str(member);
            path
        }
        None => member.to_string(),
    }
}
