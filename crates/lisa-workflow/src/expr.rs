//! Condition expressions.
//!
//! A deliberately small expression language for step guards and conditional
//! branches.  Identifiers resolve only against the workflow's variables;
//! there is no function call, assignment or access to anything else.
//!
//! ```text
//! expr     := or
//! or       := and ( "||" and )*
//! and      := unary ( "&&" unary )*
//! unary    := "!" unary | compare
//! compare  := additive ( ("=="|"!="|"<"|"<="|">"|">=") additive )?
//! additive := primary ( ("+"|"-") primary )*
//! primary  := number | string | true | false | null
//!           | "-" primary
//!           | ident ( "." ident | "[" expr "]" )*
//!           | "(" expr ")"
//! ```
//!
//! Unknown identifiers evaluate to `null`.  `.length` works on strings and
//! arrays.  Truthiness: `null`, `false`, `0`, `""` and `[]` are false.

use std::cmp::Ordering;

use serde_json::{Number, Value};

use crate::error::{Result, WorkflowError};
use crate::workflow::Variables;

/// Nesting limit for parenthesized and indexed sub-expressions.
const MAX_DEPTH: usize = 64;

// ---------------------------------------------------------------------------
// Evaluator seam
// ---------------------------------------------------------------------------

/// Evaluates guard and branch conditions against workflow variables.
pub trait ConditionEvaluator: Send + Sync {
    /// Evaluate `expression` to a boolean.
    fn evaluate(&self, expression: &str, variables: &Variables) -> Result<bool>;
}

/// The built-in evaluator for the grammar above.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExprEvaluator;

impl ConditionEvaluator for ExprEvaluator {
    fn evaluate(&self, expression: &str, variables: &Variables) -> Result<bool> {
        evaluate(expression, variables).map(|v| truthy(&v))
    }
}

/// Parse and evaluate `expression`, returning its value.
pub fn evaluate(expression: &str, variables: &Variables) -> Result<Value> {
    let expr = parse(expression)?;
    eval(&expr, variables)
}

/// Parse `expression` into an AST without evaluating it.
pub fn parse(expression: &str) -> Result<Expr> {
    let tokens = lex(expression)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let expr = parser.expr()?;
    match parser.peek() {
        None => Ok(expr),
        Some(tok) => Err(WorkflowError::evaluation(format!(
            "unexpected token {tok:?} in `{expression}`"
        ))),
    }
}

/// JavaScript-style truthiness.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(_) => true,
    }
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Str(String),
    Ident(String),
    True,
    False,
    Null,
    OrOr,
    AndAnd,
    Bang,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Minus,
    Dot,
    LBracket,
    RBracket,
    LParen,
    RParen,
}

fn lex(src: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            c if c.is_whitespace() => i += 1,
            '|' if next == Some('|') => {
                tokens.push(Token::OrOr);
                i += 2;
            }
            '&' if next == Some('&') => {
                tokens.push(Token::AndAnd);
                i += 2;
            }
            '=' if next == Some('=') => {
                tokens.push(Token::Eq);
                i += if chars.get(i + 2) == Some(&'=') { 3 } else { 2 };
            }
            '!' if next == Some('=') => {
                tokens.push(Token::Ne);
                i += if chars.get(i + 2) == Some(&'=') { 3 } else { 2 };
            }
            '!' => {
                tokens.push(Token::Bang);
                i += 1;
            }
            '<' if next == Some('=') => {
                tokens.push(Token::Le);
                i += 2;
            }
            '>' if next == Some('=') => {
                tokens.push(Token::Ge);
                i += 2;
            }
            '<' => {
                tokens.push(Token::Lt);
                i += 1;
            }
            '>' => {
                tokens.push(Token::Gt);
                i += 1;
            }
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '"' | '\'' => {
                let (s, end) = lex_string(&chars, i)?;
                tokens.push(Token::Str(s));
                i = end;
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text.parse::<f64>().map_err(|_| {
                    WorkflowError::evaluation(format!("invalid number literal `{text}`"))
                })?;
                tokens.push(Token::Num(n));
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    _ => Token::Ident(word),
                });
            }
            other => {
                return Err(WorkflowError::evaluation(format!(
                    "unexpected character `{other}` at offset {i}"
                )));
            }
        }
    }
    Ok(tokens)
}

fn lex_string(chars: &[char], start: usize) -> Result<(String, usize)> {
    let quote = chars[start];
    let mut out = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        match chars[i] {
            c if c == quote => return Ok((out, i + 1)),
            '\\' => {
                let escaped = chars
                    .get(i + 1)
                    .ok_or_else(|| WorkflowError::evaluation("dangling escape in string"))?;
                out.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    'r' => '\r',
                    other => *other,
                });
                i += 2;
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    Err(WorkflowError::evaluation("unterminated string literal"))
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// Parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Var(String),
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

/// Comparison and arithmetic operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn eat(&mut self, tok: &Token) -> bool {
        if self.peek() == Some(tok) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: &Token) -> Result<()> {
        if self.eat(tok) {
            Ok(())
        } else {
            Err(WorkflowError::evaluation(format!(
                "expected {tok:?}, found {:?}",
                self.peek()
            )))
        }
    }

    fn expr(&mut self) -> Result<Expr> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(WorkflowError::evaluation("expression nested too deeply"));
        }
        let expr = self.or();
        self.depth -= 1;
        expr
    }

    fn or(&mut self) -> Result<Expr> {
        let mut lhs = self.and()?;
        while self.eat(&Token::OrOr) {
            let rhs = self.and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr> {
        let mut lhs = self.unary()?;
        while self.eat(&Token::AndAnd) {
            let rhs = self.unary()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr> {
        if self.eat(&Token::Bang) {
            self.depth += 1;
            if self.depth > MAX_DEPTH {
                return Err(WorkflowError::evaluation("expression nested too deeply"));
            }
            let inner = self.unary()?;
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.compare()
    }

    fn compare(&mut self) -> Result<Expr> {
        let lhs = self.additive()?;
        let op = match self.peek() {
            Some(Token::Eq) => BinOp::Eq,
            Some(Token::Ne) => BinOp::Ne,
            Some(Token::Lt) => BinOp::Lt,
            Some(Token::Le) => BinOp::Le,
            Some(Token::Gt) => BinOp::Gt,
            Some(Token::Ge) => BinOp::Ge,
            _ => return Ok(lhs),
        };
        self.pos += 1;
        let rhs = self.additive()?;
        Ok(Expr::Binary(op, Box::new(lhs), Box::new(rhs)))
    }

    fn additive(&mut self) -> Result<Expr> {
        let mut lhs = self.primary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.primary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn primary(&mut self) -> Result<Expr> {
        let base = match self.bump() {
            Some(Token::Num(n)) => Expr::Literal(number(n)),
            Some(Token::Str(s)) => Expr::Literal(Value::String(s)),
            Some(Token::True) => Expr::Literal(Value::Bool(true)),
            Some(Token::False) => Expr::Literal(Value::Bool(false)),
            Some(Token::Null) => Expr::Literal(Value::Null),
            Some(Token::Minus) => {
                self.depth += 1;
                if self.depth > MAX_DEPTH {
                    return Err(WorkflowError::evaluation("expression nested too deeply"));
                }
                let inner = self.primary()?;
                self.depth -= 1;
                return Ok(Expr::Neg(Box::new(inner)));
            }
            Some(Token::Ident(name)) => Expr::Var(name),
            Some(Token::LParen) => {
                let inner = self.expr()?;
                self.expect(&Token::RParen)?;
                inner
            }
            other => {
                return Err(WorkflowError::evaluation(format!(
                    "unexpected {other:?} where a value was expected"
                )));
            }
        };
        self.postfix(base)
    }

    fn postfix(&mut self, mut base: Expr) -> Result<Expr> {
        loop {
            if self.eat(&Token::Dot) {
                match self.bump() {
                    Some(Token::Ident(field)) => base = Expr::Member(Box::new(base), field),
                    other => {
                        return Err(WorkflowError::evaluation(format!(
                            "expected field name after `.`, found {other:?}"
                        )));
                    }
                }
            } else if self.eat(&Token::LBracket) {
                let index = self.expr()?;
                self.expect(&Token::RBracket)?;
                base = Expr::Index(Box::new(base), Box::new(index));
            } else {
                return Ok(base);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

fn eval(expr: &Expr, vars: &Variables) -> Result<Value> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Var(name) => Ok(vars.get(name).cloned().unwrap_or(Value::Null)),
        Expr::Member(base, field) => member(&eval(base, vars)?, field),
        Expr::Index(base, index) => index_value(&eval(base, vars)?, &eval(index, vars)?),
        Expr::Not(inner) => Ok(Value::Bool(!truthy(&eval(inner, vars)?))),
        Expr::Neg(inner) => match eval(inner, vars)?.as_f64() {
            Some(n) => Ok(number(-n)),
            None => Err(WorkflowError::evaluation("unary `-` needs a number")),
        },
        Expr::And(lhs, rhs) => {
            let l = eval(lhs, vars)?;
            if truthy(&l) { eval(rhs, vars) } else { Ok(l) }
        }
        Expr::Or(lhs, rhs) => {
            let l = eval(lhs, vars)?;
            if truthy(&l) { Ok(l) } else { eval(rhs, vars) }
        }
        Expr::Binary(op, lhs, rhs) => binary(*op, &eval(lhs, vars)?, &eval(rhs, vars)?),
    }
}

fn member(base: &Value, field: &str) -> Result<Value> {
    match base {
        Value::Null => Err(WorkflowError::evaluation(format!(
            "cannot read `{field}` of null"
        ))),
        Value::String(s) if field == "length" => Ok(Value::from(s.chars().count())),
        Value::Array(a) if field == "length" => Ok(Value::from(a.len())),
        Value::Object(map) => Ok(map.get(field).cloned().unwrap_or(Value::Null)),
        _ => Ok(Value::Null),
    }
}

fn index_value(base: &Value, index: &Value) -> Result<Value> {
    match (base, index) {
        (Value::Null, _) => Err(WorkflowError::evaluation("cannot index into null")),
        (Value::Array(a), Value::Number(n)) => Ok(n
            .as_u64()
            .and_then(|i| a.get(usize::try_from(i).ok()?))
            .cloned()
            .unwrap_or(Value::Null)),
        (Value::String(s), Value::Number(n)) => Ok(n
            .as_u64()
            .and_then(|i| s.chars().nth(usize::try_from(i).ok()?))
            .map(|c| Value::String(c.to_string()))
            .unwrap_or(Value::Null)),
        (Value::Object(map), Value::String(key)) => {
            Ok(map.get(key).cloned().unwrap_or(Value::Null))
        }
        (_, Value::String(key)) => member(base, key),
        _ => Ok(Value::Null),
    }
}

fn binary(op: BinOp, lhs: &Value, rhs: &Value) -> Result<Value> {
    match op {
        BinOp::Eq => Ok(Value::Bool(loosely_equal(lhs, rhs))),
        BinOp::Ne => Ok(Value::Bool(!loosely_equal(lhs, rhs))),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ord = compare(lhs, rhs)?;
            Ok(Value::Bool(match op {
                BinOp::Lt => ord == Ordering::Less,
                BinOp::Le => ord != Ordering::Greater,
                BinOp::Gt => ord == Ordering::Greater,
                _ => ord != Ordering::Less,
            }))
        }
        BinOp::Add => match (lhs, rhs) {
            (Value::Number(a), Value::Number(b)) => Ok(number(as_f64(a) + as_f64(b))),
            (Value::String(_), _) | (_, Value::String(_)) => {
                Ok(Value::String(format!("{}{}", text(lhs), text(rhs))))
            }
            _ => Err(WorkflowError::evaluation(format!(
                "cannot add {lhs} and {rhs}"
            ))),
        },
        BinOp::Sub => match (lhs, rhs) {
            (Value::Number(a), Value::Number(b)) => Ok(number(as_f64(a) - as_f64(b))),
            _ => Err(WorkflowError::evaluation(format!(
                "cannot subtract {rhs} from {lhs}"
            ))),
        },
    }
}

fn loosely_equal(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => as_f64(a) == as_f64(b),
        _ => lhs == rhs,
    }
}

fn compare(lhs: &Value, rhs: &Value) -> Result<Ordering> {
    match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => as_f64(a)
            .partial_cmp(&as_f64(b))
            .ok_or_else(|| WorkflowError::evaluation("cannot compare NaN")),
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        _ => Err(WorkflowError::evaluation(format!(
            "cannot order {lhs} and {rhs}"
        ))),
    }
}

fn as_f64(n: &Number) -> f64 {
    n.as_f64().unwrap_or(f64::NAN)
}

/// Integral results stay integers so `1 + 1 == 2` prints as `2`.
fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        Value::from(n as i64)
    } else {
        Number::from_f64(n).map_or(Value::Null, Value::Number)
    }
}

fn text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
