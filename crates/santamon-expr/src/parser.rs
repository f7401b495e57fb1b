//! Recursive-descent parser for rule expressions
//!
//! Precedence, loosest first: `||`, `&&`, comparisons / `in`, additive,
//! multiplicative, unary, postfix (member / method / index).

use crate::error::CompileError;
use crate::lexer::{tokenize, Token};
use santamon_core::ast::{BinOp, Expr, UnaryOp};

pub fn parse(source: &str) -> Result<Expr, CompileError> {
    let tokens = tokenize(source).map_err(CompileError::Lex)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if let Some((tok, offset)) = parser.peek_with_offset() {
        return Err(CompileError::Parse {
            offset,
            message: format!("unexpected trailing token {}", tok),
        });
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn peek_with_offset(&self) -> Option<(&Token, usize)> {
        self.tokens.get(self.pos).map(|(t, o)| (t, *o))
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|(_, o)| *o)
            .or_else(|| self.tokens.last().map(|(_, o)| *o + 1))
            .unwrap_or(0)
    }

    fn error(&self, message: impl Into<String>) -> CompileError {
        CompileError::Parse {
            offset: self.offset(),
            message: message.into(),
        }
    }

    fn expect(&mut self, expected: &Token, what: &str) -> Result<(), CompileError> {
        match self.peek() {
            Some(tok) if tok == expected => {
                self.pos += 1;
                Ok(())
            }
            Some(tok) => Err(self.error(format!("expected {}, found {}", what, tok))),
            None => Err(self.error(format!("expected {}, found end of input", what))),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::OrOr) {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Binary {
                op: BinOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_cmp()?;
        while self.peek() == Some(&Token::AndAnd) {
            self.advance();
            let right = self.parse_cmp()?;
            left = Expr::Binary {
                op: BinOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    /// Comparisons are non-associative: `a == b == c` is rejected.
    fn parse_cmp(&mut self) -> Result<Expr, CompileError> {
        let left = self.parse_add()?;
        let op = match self.peek() {
            Some(Token::EqEq) => BinOp::Eq,
            Some(Token::NotEq) => BinOp::NotEq,
            Some(Token::Lt) => BinOp::Lt,
            Some(Token::Le) => BinOp::Le,
            Some(Token::Gt) => BinOp::Gt,
            Some(Token::Ge) => BinOp::Ge,
            Some(Token::In) => BinOp::In,
            _ => return Ok(left),
        };
        self.advance();
        let right = self.parse_add()?;
        Ok(Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    fn parse_add(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_mul()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_mul()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
    }

    fn parse_mul(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                Some(Token::Percent) => BinOp::Mod,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, CompileError> {
        match self.peek() {
            Some(Token::Bang) => {
                self.advance();
                let expr = self.parse_unary()?;
                Ok(Expr::Unary {
                    op: UnaryOp::Not,
                    expr: Box::new(expr),
                })
            }
            Some(Token::Minus) => {
                self.advance();
                let expr = self.parse_unary()?;
                Ok(Expr::Unary {
                    op: UnaryOp::Neg,
                    expr: Box::new(expr),
                })
            }
            _ => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> Result<Expr, CompileError> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.advance();
                    let name = match self.advance() {
                        Some(Token::Ident(name)) => name,
                        Some(tok) => {
                            return Err(self.error(format!("expected field name, found {}", tok)))
                        }
                        None => return Err(self.error("expected field name after '.'")),
                    };
                    if self.peek() == Some(&Token::LParen) {
                        self.advance();
                        let args = self.parse_args()?;
                        expr = Expr::Method {
                            receiver: Box::new(expr),
                            method: name,
                            args,
                        };
                    } else {
                        expr = Expr::Member {
                            expr: Box::new(expr),
                            member: name,
                        };
                    }
                }
                Some(Token::LBracket) => {
                    self.advance();
                    let index = self.parse_or()?;
                    self.expect(&Token::RBracket, "']'")?;
                    expr = Expr::Index {
                        expr: Box::new(expr),
                        index: Box::new(index),
                    };
                }
                _ => return Ok(expr),
            }
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, CompileError> {
        match self.advance() {
            Some(Token::Int(v)) => Ok(Expr::Int(v)),
            Some(Token::Float(v)) => Ok(Expr::Float(v)),
            Some(Token::Duration(ns)) => Ok(Expr::Duration(ns)),
            Some(Token::Str(s)) => Ok(Expr::Str(s)),
            Some(Token::True) => Ok(Expr::Bool(true)),
            Some(Token::False) => Ok(Expr::Bool(false)),
            Some(Token::Null) => Ok(Expr::Null),
            Some(Token::Ident(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    self.advance();
                    let args = self.parse_args()?;
                    Ok(Expr::Call { func: name, args })
                } else {
                    Ok(Expr::Ident(name))
                }
            }
            Some(Token::LParen) => {
                let expr = self.parse_or()?;
                self.expect(&Token::RParen, "')'")?;
                Ok(expr)
            }
            Some(Token::LBracket) => {
                let mut items = Vec::new();
                if self.peek() == Some(&Token::RBracket) {
                    self.advance();
                    return Ok(Expr::List(items));
                }
                loop {
                    items.push(self.parse_or()?);
                    match self.peek() {
                        Some(Token::Comma) => {
                            self.advance();
                        }
                        Some(Token::RBracket) => {
                            self.advance();
                            return Ok(Expr::List(items));
                        }
                        Some(tok) => {
                            return Err(self.error(format!("expected ',' or ']', found {}", tok)))
                        }
                        None => return Err(self.error("unterminated list literal")),
                    }
                }
            }
            Some(tok) => Err(self.error(format!("unexpected token {}", tok))),
            None => Err(self.error("unexpected end of input")),
        }
    }

    fn parse_args(&mut self) -> Result<Vec<Expr>, CompileError> {
        let mut args = Vec::new();
        if self.peek() == Some(&Token::RParen) {
            self.advance();
            return Ok(args);
        }
        loop {
            args.push(self.parse_or()?);
            match self.peek() {
                Some(Token::Comma) => {
                    self.advance();
                }
                Some(Token::RParen) => {
                    self.advance();
                    return Ok(args);
                }
                Some(tok) => return Err(self.error(format!("expected ',' or ')', found {}", tok))),
                None => return Err(self.error("unterminated argument list")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precedence_and_over_or() {
        let e = parse("a || b && c").unwrap();
        match e {
            Expr::Binary { op: BinOp::Or, right, .. } => {
                assert!(matches!(*right, Expr::Binary { op: BinOp::And, .. }));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_member_chain_and_comparison() {
        let e = parse(r#"execution.target.executable.path == "/usr/bin/curl""#).unwrap();
        match e {
            Expr::Binary { op: BinOp::Eq, left, .. } => {
                assert_eq!(
                    left.as_path().as_deref(),
                    Some("execution.target.executable.path")
                );
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_in_list() {
        let e = parse(r#"x in ["a", "b"]"#).unwrap();
        assert!(matches!(e, Expr::Binary { op: BinOp::In, .. }));
    }

    #[test]
    fn test_method_call() {
        let e = parse(r#"path.starts_with("/tmp/")"#).unwrap();
        match e {
            Expr::Method { method, args, .. } => {
                assert_eq!(method, "starts_with");
                assert_eq!(args.len(), 1);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_free_function() {
        let e = parse("size(decoded_args) > 2").unwrap();
        match e {
            Expr::Binary { op: BinOp::Gt, left, .. } => {
                assert!(matches!(*left, Expr::Call { .. }));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_unary_binds_tighter_than_cmp() {
        let e = parse("!a == b").unwrap();
        match e {
            Expr::Binary { op: BinOp::Eq, left, .. } => {
                assert!(matches!(*left, Expr::Unary { op: UnaryOp::Not, .. }));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_chained_comparison_rejected() {
        assert!(parse("a == b == c").is_err());
    }

    #[test]
    fn test_trailing_garbage_rejected() {
        assert!(parse("a == b extra").is_err());
    }

    #[test]
    fn test_index_access() {
        let e = parse("decoded_args[0] == \"curl\"").unwrap();
        match e {
            Expr::Binary { left, .. } => assert!(matches!(*left, Expr::Index { .. })),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_empty_input_rejected() {
        assert!(parse("").is_err());
    }
}
