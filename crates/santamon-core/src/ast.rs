//! Expression AST for the rule language
//!
//! Produced by the parser in `santamon-expr`, evaluated against an event
//! activation. The shapes here are deliberately small: rule expressions are
//! boolean filters, not programs.

/// Binary operators, loosest-binding last.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Or,
    And,
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl BinOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinOp::Or => "||",
            BinOp::And => "&&",
            BinOp::Eq => "==",
            BinOp::NotEq => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::In => "in",
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

/// An expression node.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// Duration literal in nanoseconds (`5m`, `30s`).
    Duration(u64),
    List(Vec<Expr>),
    Ident(String),
    Member {
        expr: Box<Expr>,
        member: String,
    },
    Index {
        expr: Box<Expr>,
        index: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// Free function call (`size(x)`, `has(a.b)`).
    Call {
        func: String,
        args: Vec<Expr>,
    },
    /// Method call on a receiver (`s.contains("x")`).
    Method {
        receiver: Box<Expr>,
        method: String,
        args: Vec<Expr>,
    },
}

impl Expr {
    /// Render the dotted path of a pure member chain (`a.b.c`), if this
    /// expression is one.
    pub fn as_path(&self) -> Option<String> {
        match self {
            Expr::Ident(name) => Some(name.clone()),
            Expr::Member { expr, member } => {
                let mut base = expr.as_path()?;
                base.push('.');
                base.push_str(member);
                Some(base)
            }
            _ => None,
        }
    }
}
