//! Compile- and eval-time errors for the expression language

use thiserror::Error;

/// Errors produced while compiling an expression.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CompileError {
    #[error("unexpected character at offset {0}")]
    Lex(usize),

    #[error("parse error at offset {offset}: {message}")]
    Parse { offset: usize, message: String },

    #[error("unknown identifier: {0}")]
    UnknownIdent(String),

    #[error("unknown function: {0}")]
    UnknownFunction(String),

    #[error("unknown method: {0}")]
    UnknownMethod(String),

    #[error("operator {op} not defined for {left} and {right}")]
    BadOperands {
        op: &'static str,
        left: &'static str,
        right: &'static str,
    },

    #[error("operator {op} not defined for {operand}")]
    BadOperand {
        op: &'static str,
        operand: &'static str,
    },

    #[error("has() requires a field access argument")]
    BadHasArgument,

    #[error("{func}() takes {expected} argument(s), got {got}")]
    BadArity {
        func: String,
        expected: usize,
        got: usize,
    },

    #[error("expression must return a boolean, got {0}")]
    NotBoolean(&'static str),
}

/// Errors produced while evaluating a compiled program. All of these are
/// treated as no-match by the rule engine.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EvalError {
    #[error("unknown variable: {0}")]
    UnknownVariable(String),

    #[error("no such field: {0}")]
    NoSuchField(String),

    #[error("field access on null: {0}")]
    NullAccess(String),

    #[error("operator {op} not supported for {left} and {right}")]
    TypeMismatch {
        op: &'static str,
        left: &'static str,
        right: &'static str,
    },

    #[error("division by zero")]
    DivisionByZero,

    #[error("index {0} out of range")]
    IndexOutOfRange(i64),

    #[error("expression returned {0}, expected bool")]
    NonBoolean(&'static str),
}
