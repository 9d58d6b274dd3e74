//! Expression Evaluator (C4): a pragmatic FEEL subset used for sequence-flow
//! guards, correlation-key expressions, and script/business-rule tasks.
//! Variable references, literals, comparisons, and boolean connectives —
//! deliberately not a full FEEL grammar.

use std::fmt;

use crate::error::EngineError;
use crate::model::{Value, VariableMap};

/// A compiled expression ready for repeated evaluation against different scopes.
pub trait Expression: Send + Sync {
    fn evaluate(&self, variables: &VariableMap) -> Result<Value, EngineError>;
}

/// Parse and evaluate `expr` against `variables` in one shot. The engine never
/// caches ASTs across calls — expressions in this subset are cheap enough
/// that a dedicated compilation cache would be premature.
pub fn evaluate(expr: &str, variables: &VariableMap) -> Result<Value, EngineError> {
    let trimmed = expr.trim();
    let ast = parse(trimmed).map_err(EngineError::ExpressionError)?;
    eval(&ast, variables)
}

/// Evaluate `expr` and coerce the result to a `bool`, as required for
/// sequence-flow guards (§3 `condition_expr`, §4.3 gateway semantics).
pub fn evaluate_bool(expr: &str, variables: &VariableMap) -> Result<bool, EngineError> {
    match evaluate(expr, variables)? {
        Value::Bool(b) => Ok(b),
        other => Err(EngineError::ExpressionError(format!(
            "expression did not evaluate to a boolean: {other}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Ast {
    Literal(Value),
    Var(String),
    Not(Box<Ast>),
    And(Box<Ast>, Box<Ast>),
    Or(Box<Ast>, Box<Ast>),
    Cmp(CmpOp, Box<Ast>, Box<Ast>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CmpOp::Eq => "=",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Number(f64),
    Str(String),
    True,
    False,
    Null,
    And,
    Or,
    Not,
    Op(CmpOp),
    LParen,
    RParen,
}

fn tokenize(src: &str) -> Result<Vec<Tok>, String> {
    let chars: Vec<char> = src.chars().collect();
    let mut i = 0;
    let mut toks = Vec::new();

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        match c {
            '(' => {
                toks.push(Tok::LParen);
                i += 1;
            }
            ')' => {
                toks.push(Tok::RParen);
                i += 1;
            }
            '=' => {
                toks.push(Tok::Op(CmpOp::Eq));
                i += 1;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                toks.push(Tok::Op(CmpOp::Ne));
                i += 2;
            }
            '<' if chars.get(i + 1) == Some(&'=') => {
                toks.push(Tok::Op(CmpOp::Le));
                i += 2;
            }
            '<' => {
                toks.push(Tok::Op(CmpOp::Lt));
                i += 1;
            }
            '>' if chars.get(i + 1) == Some(&'=') => {
                toks.push(Tok::Op(CmpOp::Ge));
                i += 2;
            }
            '>' => {
                toks.push(Tok::Op(CmpOp::Gt));
                i += 1;
            }
            '"' | '\'' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                while i < chars.len() && chars[i] != quote {
                    s.push(chars[i]);
                    i += 1;
                }
                if i >= chars.len() {
                    return Err("unterminated string literal".into());
                }
                i += 1;
                toks.push(Tok::Str(s));
            }
            c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).map(|c| c.is_ascii_digit()).unwrap_or(false)) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text.parse::<f64>().map_err(|_| format!("invalid number literal: {text}"))?;
                toks.push(Tok::Number(n));
            }
            c if c.is_alphabetic() || c == '_' || c == '.' => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                toks.push(match text.as_str() {
                    "and" => Tok::And,
                    "or" => Tok::Or,
                    "not" => Tok::Not,
                    "true" => Tok::True,
                    "false" => Tok::False,
                    "null" => Tok::Null,
                    _ => Tok::Ident(text),
                });
            }
            other => return Err(format!("unexpected character '{other}'")),
        }
    }
    Ok(toks)
}

// ---------------------------------------------------------------------------
// Recursive-descent parser: or_expr := and_expr ('or' and_expr)*
//                           and_expr := not_expr ('and' not_expr)*
//                           not_expr := 'not' not_expr | cmp_expr
//                           cmp_expr := atom (OP atom)?
// ---------------------------------------------------------------------------

struct Parser {
    toks: Vec<Tok>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos)
    }

    fn advance(&mut self) -> Option<Tok> {
        let t = self.toks.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn parse_or(&mut self) -> Result<Ast, String> {
        let mut lhs = self.parse_and()?;
        while matches!(self.peek(), Some(Tok::Or)) {
            self.advance();
            let rhs = self.parse_and()?;
            lhs = Ast::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Ast, String> {
        let mut lhs = self.parse_not()?;
        while matches!(self.peek(), Some(Tok::And)) {
            self.advance();
            let rhs = self.parse_not()?;
            lhs = Ast::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_not(&mut self) -> Result<Ast, String> {
        if matches!(self.peek(), Some(Tok::Not)) {
            self.advance();
            let inner = self.parse_not()?;
            return Ok(Ast::Not(Box::new(inner)));
        }
        self.parse_cmp()
    }

    fn parse_cmp(&mut self) -> Result<Ast, String> {
        let lhs = self.parse_atom()?;
        if let Some(Tok::Op(op)) = self.peek().cloned() {
            self.advance();
            let rhs = self.parse_atom()?;
            return Ok(Ast::Cmp(op, Box::new(lhs), Box::new(rhs)));
        }
        Ok(lhs)
    }

    fn parse_atom(&mut self) -> Result<Ast, String> {
        match self.advance().ok_or("unexpected end of expression")? {
            Tok::LParen => {
                let inner = self.parse_or()?;
                match self.advance() {
                    Some(Tok::RParen) => Ok(inner),
                    _ => Err("expected closing parenthesis".into()),
                }
            }
            Tok::Ident(name) => Ok(Ast::Var(name)),
            Tok::Number(n) => Ok(Ast::Literal(serde_json::json!(n))),
            Tok::Str(s) => Ok(Ast::Literal(serde_json::json!(s))),
            Tok::True => Ok(Ast::Literal(Value::Bool(true))),
            Tok::False => Ok(Ast::Literal(Value::Bool(false))),
            Tok::Null => Ok(Ast::Literal(Value::Null)),
            other => Err(format!("unexpected token: {other:?}")),
        }
    }
}

fn parse(src: &str) -> Result<Ast, String> {
    if src.is_empty() {
        return Err("empty expression".into());
    }
    let toks = tokenize(src)?;
    let mut parser = Parser { toks, pos: 0 };
    let ast = parser.parse_or()?;
    if parser.pos != parser.toks.len() {
        return Err("trailing tokens after expression".into());
    }
    Ok(ast)
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

fn eval(ast: &Ast, vars: &VariableMap) -> Result<Value, EngineError> {
    match ast {
        Ast::Literal(v) => Ok(v.clone()),
        Ast::Var(path) => Ok(lookup(path, vars).unwrap_or(Value::Null)),
        Ast::Not(inner) => {
            let v = eval(inner, vars)?;
            as_bool(&v).map(|b| Value::Bool(!b))
        }
        Ast::And(l, r) => {
            let lv = as_bool(&eval(l, vars)?)?;
            if !lv {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(as_bool(&eval(r, vars)?)?))
        }
        Ast::Or(l, r) => {
            let lv = as_bool(&eval(l, vars)?)?;
            if lv {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(as_bool(&eval(r, vars)?)?))
        }
        Ast::Cmp(op, l, r) => {
            let lv = eval(l, vars)?;
            let rv = eval(r, vars)?;
            compare(*op, &lv, &rv).map(Value::Bool)
        }
    }
}

/// Dotted-path lookup into nested JSON objects (`order.total`).
fn lookup(path: &str, vars: &VariableMap) -> Option<Value> {
    let mut parts = path.split('.');
    let root = parts.next()?;
    let mut current = vars.get(root)?.clone();
    for part in parts {
        current = current.as_object()?.get(part)?.clone();
    }
    Some(current)
}

fn as_bool(v: &Value) -> Result<bool, EngineError> {
    v.as_bool()
        .ok_or_else(|| EngineError::ExpressionError(format!("expected boolean, got {v}")))
}

fn compare(op: CmpOp, l: &Value, r: &Value) -> Result<bool, EngineError> {
    match op {
        CmpOp::Eq => Ok(l == r),
        CmpOp::Ne => Ok(l != r),
        _ => {
            let (lf, rf) = match (l.as_f64(), r.as_f64()) {
                (Some(lf), Some(rf)) => (lf, rf),
                _ => match (l.as_str(), r.as_str()) {
                    (Some(ls), Some(rs)) => {
                        return Ok(match op {
                            CmpOp::Lt => ls < rs,
                            CmpOp::Le => ls <= rs,
                            CmpOp::Gt => ls > rs,
                            CmpOp::Ge => ls >= rs,
                            CmpOp::Eq | CmpOp::Ne => unreachable!(),
                        })
                    }
                    _ => {
                        return Err(EngineError::ExpressionError(format!(
                            "cannot compare {l} {op} {r}: incompatible types"
                        )))
                    }
                },
            };
            Ok(match op {
                CmpOp::Lt => lf < rf,
                CmpOp::Le => lf <= rf,
                CmpOp::Gt => lf > rf,
                CmpOp::Ge => lf >= rf,
                CmpOp::Eq | CmpOp::Ne => unreachable!(),
            })
        }
    }
}
