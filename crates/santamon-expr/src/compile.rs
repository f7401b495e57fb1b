//! Expression compilation: parse, resolve identifiers, check the result type
//!
//! The checker runs a light bottom-up inference. Payload fields type as
//! `Dyn`, so most type errors surface at evaluation time; what the checker
//! guarantees is that every identifier is declared and that the expression
//! can produce a boolean at all.

use crate::env::{Env, Ty};
use crate::error::CompileError;
use crate::parser::parse;
use santamon_core::ast::{BinOp, Expr, UnaryOp};

/// A compiled, immutable expression program.
#[derive(Debug, Clone)]
pub struct Program {
    source: String,
    ast: Expr,
}

impl Program {
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn ast(&self) -> &Expr {
        &self.ast
    }
}

/// Compile an expression against an environment.
pub fn compile(source: &str, env: &Env) -> Result<Program, CompileError> {
    let ast = parse(source)?;
    let ty = infer(&ast, env)?;
    if !matches!(ty, Ty::Bool | Ty::Dyn) {
        return Err(CompileError::NotBoolean(ty.name()));
    }
    Ok(Program {
        source: source.to_string(),
        ast,
    })
}

fn infer(expr: &Expr, env: &Env) -> Result<Ty, CompileError> {
    match expr {
        Expr::Null => Ok(Ty::Null),
        Expr::Bool(_) => Ok(Ty::Bool),
        Expr::Int(_) => Ok(Ty::Int),
        Expr::Float(_) => Ok(Ty::Float),
        Expr::Str(_) => Ok(Ty::Str),
        Expr::Duration(_) => Ok(Ty::Duration),
        Expr::List(items) => {
            for item in items {
                infer(item, env)?;
            }
            Ok(Ty::List)
        }
        Expr::Ident(name) => env
            .lookup(name)
            .ok_or_else(|| CompileError::UnknownIdent(name.clone())),
        Expr::Member { expr, .. } => {
            let base = infer(expr, env)?;
            match base {
                Ty::Dyn | Ty::Map => Ok(Ty::Dyn),
                other => Err(CompileError::BadOperand {
                    op: ".",
                    operand: other.name(),
                }),
            }
        }
        Expr::Index { expr, index } => {
            let base = infer(expr, env)?;
            let idx = infer(index, env)?;
            if !matches!(base, Ty::List | Ty::Map | Ty::Dyn) {
                return Err(CompileError::BadOperand {
                    op: "[]",
                    operand: base.name(),
                });
            }
            if !matches!(idx, Ty::Int | Ty::Str | Ty::Dyn) {
                return Err(CompileError::BadOperand {
                    op: "[]",
                    operand: idx.name(),
                });
            }
            Ok(Ty::Dyn)
        }
        Expr::Unary { op, expr } => {
            let operand = infer(expr, env)?;
            match op {
                UnaryOp::Not => match operand {
                    Ty::Bool | Ty::Dyn => Ok(Ty::Bool),
                    other => Err(CompileError::BadOperand {
                        op: "!",
                        operand: other.name(),
                    }),
                },
                UnaryOp::Neg => match operand {
                    Ty::Int => Ok(Ty::Int),
                    Ty::Float => Ok(Ty::Float),
                    Ty::Dyn => Ok(Ty::Dyn),
                    other => Err(CompileError::BadOperand {
                        op: "-",
                        operand: other.name(),
                    }),
                },
            }
        }
        Expr::Binary { op, left, right } => {
            let lt = infer(left, env)?;
            let rt = infer(right, env)?;
            infer_binary(*op, lt, rt)
        }
        Expr::Call { func, args } => infer_call(func, args, env),
        Expr::Method {
            receiver,
            method,
            args,
        } => infer_method(receiver, method, args, env),
    }
}

fn infer_binary(op: BinOp, lt: Ty, rt: Ty) -> Result<Ty, CompileError> {
    let mismatch = || CompileError::BadOperands {
        op: op.symbol(),
        left: lt.name(),
        right: rt.name(),
    };

    match op {
        BinOp::And | BinOp::Or => {
            if matches!(lt, Ty::Bool | Ty::Dyn) && matches!(rt, Ty::Bool | Ty::Dyn) {
                Ok(Ty::Bool)
            } else {
                Err(mismatch())
            }
        }
        // Equality is defined across all types (null included).
        BinOp::Eq | BinOp::NotEq => Ok(Ty::Bool),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let orderable = |t: Ty| {
                matches!(
                    t,
                    Ty::Int | Ty::Float | Ty::Str | Ty::Timestamp | Ty::Duration | Ty::Dyn
                )
            };
            if orderable(lt) && orderable(rt) {
                Ok(Ty::Bool)
            } else {
                Err(mismatch())
            }
        }
        BinOp::In => {
            if matches!(rt, Ty::List | Ty::Map | Ty::Dyn) {
                Ok(Ty::Bool)
            } else {
                Err(mismatch())
            }
        }
        BinOp::Add => match (lt, rt) {
            (Ty::Int, Ty::Int) => Ok(Ty::Int),
            (Ty::Str, Ty::Str) => Ok(Ty::Str),
            (Ty::Duration, Ty::Duration) => Ok(Ty::Duration),
            (Ty::Timestamp, Ty::Duration) | (Ty::Duration, Ty::Timestamp) => Ok(Ty::Timestamp),
            _ if lt.is_numeric() && rt.is_numeric() => {
                if lt.is_dyn() || rt.is_dyn() {
                    Ok(Ty::Dyn)
                } else {
                    Ok(Ty::Float)
                }
            }
            (Ty::Dyn, _) | (_, Ty::Dyn) => Ok(Ty::Dyn),
            _ => Err(mismatch()),
        },
        BinOp::Sub => match (lt, rt) {
            (Ty::Int, Ty::Int) => Ok(Ty::Int),
            (Ty::Timestamp, Ty::Timestamp) => Ok(Ty::Duration),
            (Ty::Timestamp, Ty::Duration) => Ok(Ty::Timestamp),
            (Ty::Duration, Ty::Duration) => Ok(Ty::Duration),
            _ if lt.is_numeric() && rt.is_numeric() => {
                if lt.is_dyn() || rt.is_dyn() {
                    Ok(Ty::Dyn)
                } else {
                    Ok(Ty::Float)
                }
            }
            (Ty::Dyn, _) | (_, Ty::Dyn) => Ok(Ty::Dyn),
            _ => Err(mismatch()),
        },
        BinOp::Mul | BinOp::Div | BinOp::Mod => {
            if lt.is_numeric() && rt.is_numeric() {
                if lt.is_dyn() || rt.is_dyn() {
                    Ok(Ty::Dyn)
                } else if lt == Ty::Int && rt == Ty::Int {
                    Ok(Ty::Int)
                } else {
                    Ok(Ty::Float)
                }
            } else {
                Err(mismatch())
            }
        }
    }
}

fn infer_call(func: &str, args: &[Expr], env: &Env) -> Result<Ty, CompileError> {
    match func {
        "size" => {
            expect_arity(func, args, 1)?;
            let arg = infer(&args[0], env)?;
            if matches!(arg, Ty::Str | Ty::List | Ty::Map | Ty::Dyn) {
                Ok(Ty::Int)
            } else {
                Err(CompileError::BadOperand {
                    op: "size",
                    operand: arg.name(),
                })
            }
        }
        "has" => {
            expect_arity(func, args, 1)?;
            if !matches!(&args[0], Expr::Member { .. }) {
                return Err(CompileError::BadHasArgument);
            }
            // The argument is a field access; its base must still resolve.
            infer(&args[0], env)?;
            Ok(Ty::Bool)
        }
        other => Err(CompileError::UnknownFunction(other.to_string())),
    }
}

fn infer_method(
    receiver: &Expr,
    method: &str,
    args: &[Expr],
    env: &Env,
) -> Result<Ty, CompileError> {
    let recv = infer(receiver, env)?;
    match method {
        "contains" => {
            expect_arity(method, args, 1)?;
            infer(&args[0], env)?;
            if matches!(recv, Ty::Str | Ty::List | Ty::Dyn) {
                Ok(Ty::Bool)
            } else {
                Err(CompileError::BadOperand {
                    op: "contains",
                    operand: recv.name(),
                })
            }
        }
        "starts_with" | "startsWith" | "ends_with" | "endsWith" => {
            expect_arity(method, args, 1)?;
            let arg = infer(&args[0], env)?;
            if matches!(recv, Ty::Str | Ty::Dyn) && matches!(arg, Ty::Str | Ty::Dyn) {
                Ok(Ty::Bool)
            } else {
                Err(CompileError::BadOperand {
                    op: "starts_with",
                    operand: recv.name(),
                })
            }
        }
        other => Err(CompileError::UnknownMethod(other.to_string())),
    }
}

fn expect_arity(func: &str, args: &[Expr], expected: usize) -> Result<(), CompileError> {
    if args.len() != expected {
        return Err(CompileError::BadArity {
            func: func.to_string(),
            expected,
            got: args.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> Env {
        Env::detection()
    }

    #[test]
    fn test_compile_boolean_expression() {
        compile(r#"kind == "execution""#, &env()).unwrap();
        compile(
            r#"kind == "execution" && execution.target.executable.path in ["/usr/bin/curl", "/usr/bin/wget"]"#,
            &env(),
        )
        .unwrap();
    }

    #[test]
    fn test_compile_enum_constant_comparison() {
        compile("execution.decision == DECISION_DENY", &env()).unwrap();
        compile(
            "file_access.policy_decision == POLICY_DECISION_DENIED",
            &env(),
        )
        .unwrap();
    }

    #[test]
    fn test_rejects_non_boolean() {
        assert!(matches!(
            compile("kind", &env()),
            Err(CompileError::NotBoolean("str"))
        ));
        assert!(matches!(
            compile("1 + 2", &env()),
            Err(CompileError::NotBoolean("int"))
        ));
    }

    #[test]
    fn test_rejects_unknown_identifier() {
        assert!(matches!(
            compile("no_such_variable == 1", &env()),
            Err(CompileError::UnknownIdent(name)) if name == "no_such_variable"
        ));
    }

    #[test]
    fn test_rejects_unknown_function() {
        assert!(matches!(
            compile("frobnicate(kind)", &env()),
            Err(CompileError::UnknownFunction(_))
        ));
    }

    #[test]
    fn test_rejects_member_on_scalar() {
        assert!(compile("kind.path == \"x\"", &env()).is_err());
    }

    #[test]
    fn test_dyn_fields_pass_through() {
        // Payload fields are dynamic; the checker cannot prove them boolean
        // but must accept them.
        compile("execution.target.is_platform_binary", &env()).unwrap();
    }

    #[test]
    fn test_timestamp_arithmetic() {
        compile("processed_time - event_time < 5m", &env()).unwrap();
    }

    #[test]
    fn test_string_methods() {
        compile(
            r#"execution.target.executable.path.starts_with("/tmp/")"#,
            &env(),
        )
        .unwrap();
        compile(r#"kind.contains("exec")"#, &env()).unwrap();
    }

    #[test]
    fn test_has_requires_member() {
        compile("has(execution.target)", &env()).unwrap();
        assert!(matches!(
            compile("has(kind)", &env()),
            Err(CompileError::BadHasArgument)
        ));
    }

    #[test]
    fn test_size_function() {
        compile("size(decoded_args) > 2", &env()).unwrap();
    }
}
