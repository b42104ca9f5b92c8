//! `${...}` expression language for sequence-flow conditions and task input
//! mappings. A small hand-rolled recursive-descent parser/evaluator rather
//! than an external expression-language crate.

use crate::error::{EngineError, Result};
use crate::types::Variable;
use chrono::DateTime;
use std::collections::BTreeMap;
use std::iter::Peekable;
use std::str::Chars;

/// Evaluate a `${...}`-wrapped expression against a flat variable scope,
/// already resolved with parent-scope fallback by the caller.
pub fn evaluate(expr: &str, scope: &BTreeMap<String, Variable>) -> Result<Value> {
    let inner = unwrap_braces(expr)?;
    let tokens = Lexer::new(inner).lex()?;
    let mut parser = Parser {
        tokens: tokens.into_iter().peekable(),
        source: expr,
    };
    let ast = parser.parse_expr()?;
    if parser.tokens.peek().is_some() {
        return Err(EngineError::ExprSyntax {
            expr: expr.to_string(),
            reason: "trailing tokens after expression".to_string(),
        });
    }
    eval_node(&ast, scope, expr)
}

/// Evaluate and coerce to bool for gateway/flow condition use: non-boolean
/// and null results are treated as not-taken, never an error.
pub fn evaluate_condition(expr: &str, scope: &BTreeMap<String, Variable>) -> Result<bool> {
    Ok(matches!(evaluate(expr, scope)?, Value::Bool(true)))
}

fn unwrap_braces(expr: &str) -> Result<&str> {
    let trimmed = expr.trim();
    trimmed
        .strip_prefix("${")
        .and_then(|s| s.strip_suffix('}'))
        .ok_or_else(|| EngineError::ExprSyntax {
            expr: expr.to_string(),
            reason: "expected `${...}` wrapper".to_string(),
        })
}

// ─── Values ──────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
}

impl Value {
    fn truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0,
            Value::Str(s) => !s.is_empty(),
        }
    }
}

impl From<&Variable> for Value {
    fn from(v: &Variable) -> Self {
        match v {
            Variable::String(s) => Value::Str(s.clone()),
            Variable::Integer(i) => Value::Number(*i as f64),
            Variable::Float(f) => Value::Number(*f),
            Variable::Boolean(b) => Value::Bool(*b),
            Variable::Date(d) => Value::Str(d.to_rfc3339()),
            Variable::Json(j) => match j {
                serde_json::Value::Null => Value::Null,
                serde_json::Value::Bool(b) => Value::Bool(*b),
                serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
                serde_json::Value::String(s) => Value::Str(s.clone()),
                other => Value::Str(other.to_string()),
            },
        }
    }
}

// ─── Lexer ───────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Not,
    LParen,
    RParen,
    Dot,
    True,
    False,
    Null,
}

struct Lexer<'a> {
    chars: Peekable<Chars<'a>>,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            chars: src.chars().peekable(),
        }
    }

    fn lex(mut self) -> Result<Vec<Token>> {
        let mut out = Vec::new();
        while let Some(&c) = self.chars.peek() {
            match c {
                c if c.is_whitespace() => {
                    self.chars.next();
                }
                '(' => {
                    self.chars.next();
                    out.push(Token::LParen);
                }
                ')' => {
                    self.chars.next();
                    out.push(Token::RParen);
                }
                '.' => {
                    self.chars.next();
                    out.push(Token::Dot);
                }
                '=' => {
                    self.chars.next();
                    self.expect('=')?;
                    out.push(Token::Eq);
                }
                '!' => {
                    self.chars.next();
                    if self.chars.peek() == Some(&'=') {
                        self.chars.next();
                        out.push(Token::Ne);
                    } else {
                        out.push(Token::Not);
                    }
                }
                '<' => {
                    self.chars.next();
                    if self.chars.peek() == Some(&'=') {
                        self.chars.next();
                        out.push(Token::Le);
                    } else {
                        out.push(Token::Lt);
                    }
                }
                '>' => {
                    self.chars.next();
                    if self.chars.peek() == Some(&'=') {
                        self.chars.next();
                        out.push(Token::Ge);
                    } else {
                        out.push(Token::Gt);
                    }
                }
                '&' => {
                    self.chars.next();
                    self.expect('&')?;
                    out.push(Token::And);
                }
                '|' => {
                    self.chars.next();
                    self.expect('|')?;
                    out.push(Token::Or);
                }
                '\'' | '"' => {
                    let quote = c;
                    self.chars.next();
                    let mut s = String::new();
                    loop {
                        match self.chars.next() {
                            Some(ch) if ch == quote => break,
                            Some(ch) => s.push(ch),
                            None => {
                                return Err(EngineError::ExprSyntax {
                                    expr: String::new(),
                                    reason: "unterminated string literal".to_string(),
                                })
                            }
                        }
                    }
                    out.push(Token::Str(s));
                }
                c if c.is_ascii_digit() => {
                    let mut s = String::new();
                    while let Some(&d) = self.chars.peek() {
                        if d.is_ascii_digit() || d == '.' {
                            s.push(d);
                            self.chars.next();
                        } else {
                            break;
                        }
                    }
                    let n: f64 = s.parse().map_err(|_| EngineError::ExprSyntax {
                        expr: String::new(),
                        reason: format!("bad number literal `{s}`"),
                    })?;
                    out.push(Token::Number(n));
                }
                c if c.is_alphabetic() || c == '_' => {
                    let mut s = String::new();
                    while let Some(&d) = self.chars.peek() {
                        if d.is_alphanumeric() || d == '_' {
                            s.push(d);
                            self.chars.next();
                        } else {
                            break;
                        }
                    }
                    out.push(match s.as_str() {
                        "true" => Token::True,
                        "false" => Token::False,
                        "null" => Token::Null,
                        "and" => Token::And,
                        "or" => Token::Or,
                        "not" => Token::Not,
                        _ => Token::Ident(s),
                    });
                }
                other => {
                    return Err(EngineError::ExprSyntax {
                        expr: String::new(),
                        reason: format!("unexpected character `{other}`"),
                    })
                }
            }
        }
        Ok(out)
    }

    fn expect(&mut self, c: char) -> Result<()> {
        if self.chars.next() == Some(c) {
            Ok(())
        } else {
            Err(EngineError::ExprSyntax {
                expr: String::new(),
                reason: format!("expected `{c}`"),
            })
        }
    }
}

// ─── AST / parser ────────────────────────────────────────────────

#[derive(Debug)]
enum Ast {
    Lit(Value),
    Path(Vec<String>),
    Not(Box<Ast>),
    Cmp(Box<Ast>, CmpOp, Box<Ast>),
    Logic(Box<Ast>, LogicOp, Box<Ast>),
}

#[derive(Debug, Clone, Copy)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy)]
enum LogicOp {
    And,
    Or,
}

struct Parser<'a, I: Iterator<Item = Token>> {
    tokens: Peekable<I>,
    source: &'a str,
}

impl<'a, I: Iterator<Item = Token>> Parser<'a, I> {
    fn err(&self, reason: impl Into<String>) -> EngineError {
        EngineError::ExprSyntax {
            expr: self.source.to_string(),
            reason: reason.into(),
        }
    }

    fn parse_expr(&mut self) -> Result<Ast> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Ast> {
        let mut left = self.parse_and()?;
        while matches!(self.tokens.peek(), Some(Token::Or)) {
            self.tokens.next();
            let right = self.parse_and()?;
            left = Ast::Logic(Box::new(left), LogicOp::Or, Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Ast> {
        let mut left = self.parse_cmp()?;
        while matches!(self.tokens.peek(), Some(Token::And)) {
            self.tokens.next();
            let right = self.parse_cmp()?;
            left = Ast::Logic(Box::new(left), LogicOp::And, Box::new(right));
        }
        Ok(left)
    }

    fn parse_cmp(&mut self) -> Result<Ast> {
        let left = self.parse_unary()?;
        let op = match self.tokens.peek() {
            Some(Token::Eq) => CmpOp::Eq,
            Some(Token::Ne) => CmpOp::Ne,
            Some(Token::Lt) => CmpOp::Lt,
            Some(Token::Le) => CmpOp::Le,
            Some(Token::Gt) => CmpOp::Gt,
            Some(Token::Ge) => CmpOp::Ge,
            _ => return Ok(left),
        };
        self.tokens.next();
        let right = self.parse_unary()?;
        Ok(Ast::Cmp(Box::new(left), op, Box::new(right)))
    }

    fn parse_unary(&mut self) -> Result<Ast> {
        if matches!(self.tokens.peek(), Some(Token::Not)) {
            self.tokens.next();
            return Ok(Ast::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Ast> {
        match self.tokens.next() {
            Some(Token::True) => Ok(Ast::Lit(Value::Bool(true))),
            Some(Token::False) => Ok(Ast::Lit(Value::Bool(false))),
            Some(Token::Null) => Ok(Ast::Lit(Value::Null)),
            Some(Token::Number(n)) => Ok(Ast::Lit(Value::Number(n))),
            Some(Token::Str(s)) => Ok(Ast::Lit(Value::Str(s))),
            Some(Token::LParen) => {
                let inner = self.parse_expr()?;
                match self.tokens.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(self.err("expected `)`")),
                }
            }
            Some(Token::Ident(name)) => {
                let mut path = vec![name];
                while matches!(self.tokens.peek(), Some(Token::Dot)) {
                    self.tokens.next();
                    match self.tokens.next() {
                        Some(Token::Ident(part)) => path.push(part),
                        _ => return Err(self.err("expected identifier after `.`")),
                    }
                }
                Ok(Ast::Path(path))
            }
            other => Err(self.err(format!("unexpected token {other:?}"))),
        }
    }
}

fn eval_node(ast: &Ast, scope: &BTreeMap<String, Variable>, expr: &str) -> Result<Value> {
    match ast {
        Ast::Lit(v) => Ok(v.clone()),
        Ast::Path(path) => resolve_path(path, scope, expr),
        Ast::Not(inner) => Ok(Value::Bool(!eval_node(inner, scope, expr)?.truthy())),
        Ast::Logic(l, op, r) => {
            let lv = eval_node(l, scope, expr)?.truthy();
            match op {
                LogicOp::And if !lv => Ok(Value::Bool(false)),
                LogicOp::Or if lv => Ok(Value::Bool(true)),
                _ => Ok(Value::Bool(eval_node(r, scope, expr)?.truthy())),
            }
        }
        Ast::Cmp(l, op, r) => {
            let lv = eval_node(l, scope, expr)?;
            let rv = eval_node(r, scope, expr)?;
            compare(&lv, *op, &rv, expr)
        }
    }
}

/// An undefined top-level identifier, or dotted property access through a
/// variable that isn't a JSON object, is an `EXPR_EVAL` error. A key that is
/// simply absent from within an actual JSON object yields `Null`.
fn resolve_path(path: &[String], scope: &BTreeMap<String, Variable>, expr: &str) -> Result<Value> {
    let Some((head, rest)) = path.split_first() else {
        return Ok(Value::Null);
    };
    let Some(var) = scope.get(head) else {
        return Err(EngineError::ExprEval(format!("undefined identifier `{head}` in `{expr}`")));
    };
    if rest.is_empty() {
        return Ok(Value::from(var));
    }
    let Variable::Json(mut current) = var.clone() else {
        return Err(EngineError::ExprEval(format!(
            "`{head}` is not an object, cannot access `.{}` in `{expr}`",
            rest.join(".")
        )));
    };
    for part in rest {
        match current.get(part) {
            Some(next) => current = next.clone(),
            None => return Ok(Value::Null),
        }
    }
    Ok(Value::from(&Variable::Json(current)))
}

fn compare(l: &Value, op: CmpOp, r: &Value, expr: &str) -> Result<Value> {
    use CmpOp::*;
    if matches!(op, Eq | Ne) {
        let eq = values_equal(l, r);
        return Ok(Value::Bool(if matches!(op, Eq) { eq } else { !eq }));
    }

    let ordering = match (l, r) {
        (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
        (Value::Str(a), Value::Str(b)) => match (DateTime::parse_from_rfc3339(a), DateTime::parse_from_rfc3339(b)) {
            (Ok(da), Ok(db)) => da.partial_cmp(&db),
            _ => a.partial_cmp(b),
        },
        (Value::Number(a), Value::Str(b)) => match b.parse::<f64>() {
            Ok(b) => a.partial_cmp(&b),
            Err(_) => {
                return Err(EngineError::ExprEval(format!(
                    "cannot order-compare {l:?} and {r:?} in `{expr}`"
                )))
            }
        },
        (Value::Str(a), Value::Number(b)) => match a.parse::<f64>() {
            Ok(a) => a.partial_cmp(b),
            Err(_) => {
                return Err(EngineError::ExprEval(format!(
                    "cannot order-compare {l:?} and {r:?} in `{expr}`"
                )))
            }
        },
        _ => {
            return Err(EngineError::ExprEval(format!(
                "cannot order-compare {l:?} and {r:?} in `{expr}`"
            )))
        }
    };
    let ordering = ordering.ok_or_else(|| EngineError::ExprEval(format!("incomparable values in `{expr}`")))?;
    let result = match op {
        Lt => ordering.is_lt(),
        Le => ordering.is_le(),
        Gt => ordering.is_gt(),
        Ge => ordering.is_ge(),
        Eq | Ne => unreachable!(),
    };
    Ok(Value::Bool(result))
}

fn values_equal(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Number(a), Value::Number(b)) => a == b,
        (Value::Str(a), Value::Str(b)) => a == b,
        _ => false,
    }
}
