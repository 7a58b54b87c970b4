//! Expression parsing and evaluation.
//!
//! Guards and actions share one small expression language:
//!
//! - literals: `3`, `2.5`, `-1`, `"text"`, `'text'`, `true`, `false`, `null`
//! - identifiers: `command`, `device`, resolved through a [`Scope`]; unknown
//!   names evaluate to `null`
//! - `a || b`, `a && b` - logical operators (truthiness, short-circuit)
//! - `a == b`, `a != b`, `a < b`, `a <= b`, `a > b`, `a >= b`
//! - `a =~ "re"`, `a !~ "re"` - regex match against a literal pattern
//! - `a + b`, `a - b`, `a * b`, `a / b`, `a % b` - arithmetic; `+`
//!   concatenates when either side is a string
//! - `!a`, `-a` - unary operators
//! - `Name(arg, ...)` - call into the closed [`Function`] set
//! - `(expr)` - grouping
//!
//! Examples:
//! - `type == "door" && command == "open"`
//! - `State("alarm") == "armed" || level > 50`
//! - `StartTimer("kettle", 3 * 60)`

use crate::context::{display_value, Scope};
use crate::error::CoreError;
use crate::function::{Function, FunctionHost};
use regex::Regex;
use serde_json::{Number, Value};
use std::cmp::Ordering;

/// Binary operators other than the logical ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

impl BinaryOp {
    fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
        }
    }
}

/// A parsed expression.
#[derive(Debug, Clone)]
pub enum Expr {
    Literal(Value),
    Var(String),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Matches {
        subject: Box<Expr>,
        pattern: Regex,
        negated: bool,
    },
    Call(Function, Vec<Expr>),
}

impl Expr {
    /// Parses an expression.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        let source = s.trim();
        let parse_err = |reason: String| CoreError::Parse {
            expr: source.to_string(),
            reason,
        };

        if source.is_empty() {
            return Err(parse_err("empty expression".to_string()));
        }

        let mut parser = Parser::new(source);
        let expr = parser.parse_expr().map_err(parse_err)?;
        parser.skip_whitespace();
        if parser.pos < source.len() {
            return Err(parse_err(format!(
                "unexpected '{}' at offset {}",
                &source[parser.pos..],
                parser.pos
            )));
        }

        Ok(expr)
    }

    /// Evaluates the expression. Calls are dispatched to `host` in
    /// left-to-right order.
    pub fn evaluate(
        &self,
        scope: &dyn Scope,
        host: &mut dyn FunctionHost,
    ) -> Result<Value, CoreError> {
        match self {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Var(name) => Ok(scope.lookup(name).unwrap_or(Value::Null)),
            Expr::Not(inner) => {
                let value = inner.evaluate(scope, host)?;
                Ok(Value::Bool(!is_truthy(&value)))
            }
            Expr::Neg(inner) => {
                let value = inner.evaluate(scope, host)?;
                negate(&value)
            }
            Expr::And(left, right) => {
                if !is_truthy(&left.evaluate(scope, host)?) {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(is_truthy(&right.evaluate(scope, host)?)))
            }
            Expr::Or(left, right) => {
                if is_truthy(&left.evaluate(scope, host)?) {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(is_truthy(&right.evaluate(scope, host)?)))
            }
            Expr::Binary(op, left, right) => {
                let left = left.evaluate(scope, host)?;
                let right = right.evaluate(scope, host)?;
                binary(*op, &left, &right)
            }
            Expr::Matches {
                subject,
                pattern,
                negated,
            } => {
                let matched = match subject.evaluate(scope, host)? {
                    Value::String(s) => pattern.is_match(&s) != *negated,
                    _ => false,
                };
                Ok(Value::Bool(matched))
            }
            Expr::Call(function, args) => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(arg.evaluate(scope, host)?);
                }
                invoke(*function, values, scope, host)
            }
        }
    }

    /// Returns every function called anywhere in the expression.
    pub fn calls(&self) -> Vec<Function> {
        let mut out = Vec::new();
        self.collect_calls(&mut out);
        out
    }

    fn collect_calls(&self, out: &mut Vec<Function>) {
        match self {
            Expr::Literal(_) | Expr::Var(_) => {}
            Expr::Not(inner) | Expr::Neg(inner) => inner.collect_calls(out),
            Expr::And(l, r) | Expr::Or(l, r) | Expr::Binary(_, l, r) => {
                l.collect_calls(out);
                r.collect_calls(out);
            }
            Expr::Matches { subject, .. } => subject.collect_calls(out),
            Expr::Call(function, args) => {
                out.push(*function);
                for arg in args {
                    arg.collect_calls(out);
                }
            }
        }
    }
}

/// Checks arguments and dispatches a call to the host.
pub(crate) fn invoke(
    function: Function,
    mut args: Vec<Value>,
    scope: &dyn Scope,
    host: &mut dyn FunctionHost,
) -> Result<Value, CoreError> {
    function.check_arguments(&mut args)?;
    host.call(function, scope, args)
}

/// Truthiness used by `!`, `&&` and `||`.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn eval_err(reason: String) -> CoreError {
    CoreError::Eval { reason }
}

fn negate(value: &Value) -> Result<Value, CoreError> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                return i
                    .checked_neg()
                    .map(Value::from)
                    .ok_or_else(|| eval_err("integer overflow".to_string()));
            }
            float_value(-n.as_f64().unwrap_or_default())
        }
        other => Err(eval_err(format!("cannot negate {}", other))),
    }
}

fn float_value(f: f64) -> Result<Value, CoreError> {
    Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| eval_err(format!("non-finite result {}", f)))
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(a), Some(b)) => a == b,
            _ => a
                .as_f64()
                .zip(b.as_f64())
                .map(|(a, b)| (a - b).abs() < f64::EPSILON)
                .unwrap_or(false),
        },
        (Value::String(a), Value::String(b)) => a == b,
        _ => false,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn binary(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, CoreError> {
    let ordered = |pred: fn(Ordering) -> bool| {
        Ok(Value::Bool(compare(left, right).map(pred).unwrap_or(false)))
    };

    match op {
        BinaryOp::Eq => Ok(Value::Bool(values_equal(left, right))),
        BinaryOp::Ne => Ok(Value::Bool(!values_equal(left, right))),
        BinaryOp::Lt => ordered(Ordering::is_lt),
        BinaryOp::Le => ordered(Ordering::is_le),
        BinaryOp::Gt => ordered(Ordering::is_gt),
        BinaryOp::Ge => ordered(Ordering::is_ge),
        BinaryOp::Add if left.is_string() || right.is_string() => Ok(Value::String(format!(
            "{}{}",
            display_value(left),
            display_value(right)
        ))),
        _ => arithmetic(op, left, right),
    }
}

fn arithmetic(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, CoreError> {
    let (Value::Number(a), Value::Number(b)) = (left, right) else {
        return Err(eval_err(format!(
            "cannot apply '{}' to {} and {}",
            op.symbol(),
            left,
            right
        )));
    };

    if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
        if matches!(op, BinaryOp::Div | BinaryOp::Rem) && b == 0 {
            return Err(eval_err("division by zero".to_string()));
        }
        let result = match op {
            BinaryOp::Add => a.checked_add(b),
            BinaryOp::Sub => a.checked_sub(b),
            BinaryOp::Mul => a.checked_mul(b),
            BinaryOp::Div => a.checked_div(b),
            BinaryOp::Rem => a.checked_rem(b),
            _ => None,
        };
        return result
            .map(Value::from)
            .ok_or_else(|| eval_err("integer overflow".to_string()));
    }

    let (a, b) = (a.as_f64().unwrap_or_default(), b.as_f64().unwrap_or_default());
    let result = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div | BinaryOp::Rem if b == 0.0 => {
            return Err(eval_err("division by zero".to_string()))
        }
        BinaryOp::Div => a / b,
        BinaryOp::Rem => a % b,
        _ => return Err(eval_err(format!("unsupported operator '{}'", op.symbol()))),
    };
    float_value(result)
}

/// Recursive descent parser.
struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn parse_expr(&mut self) -> Result<Expr, String> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_and()?;
        self.skip_whitespace();

        while self.peek_str("||") {
            self.pos += 2;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
            self.skip_whitespace();
        }

        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_comparison()?;
        self.skip_whitespace();

        while self.peek_str("&&") {
            self.pos += 2;
            let right = self.parse_comparison()?;
            left = Expr::And(Box::new(left), Box::new(right));
            self.skip_whitespace();
        }

        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr, String> {
        let left = self.parse_additive()?;
        self.skip_whitespace();

        if self.peek_str("=~") || self.peek_str("!~") {
            let negated = self.peek_char() == Some('!');
            self.pos += 2;
            self.skip_whitespace();
            if !matches!(self.peek_char(), Some('"' | '\'')) {
                return Err("regex match requires a string literal pattern".to_string());
            }
            let source = self.parse_string()?;
            let pattern =
                Regex::new(&source).map_err(|e| format!("invalid pattern '{}': {}", source, e))?;
            return Ok(Expr::Matches {
                subject: Box::new(left),
                pattern,
                negated,
            });
        }

        // Two-character operators first so `<=` is not read as `<`.
        let op = if self.peek_str("==") {
            Some((BinaryOp::Eq, 2))
        } else if self.peek_str("!=") {
            Some((BinaryOp::Ne, 2))
        } else if self.peek_str("<=") {
            Some((BinaryOp::Le, 2))
        } else if self.peek_str(">=") {
            Some((BinaryOp::Ge, 2))
        } else if self.peek_char() == Some('<') {
            Some((BinaryOp::Lt, 1))
        } else if self.peek_char() == Some('>') {
            Some((BinaryOp::Gt, 1))
        } else {
            None
        };

        let Some((op, len)) = op else {
            return Ok(left);
        };
        self.pos += len;
        let right = self.parse_additive()?;
        Ok(Expr::Binary(op, Box::new(left), Box::new(right)))
    }

    fn parse_additive(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_multiplicative()?;
        self.skip_whitespace();

        loop {
            let op = match self.peek_char() {
                Some('+') => BinaryOp::Add,
                Some('-') => BinaryOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_multiplicative()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
            self.skip_whitespace();
        }

        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_unary()?;
        self.skip_whitespace();

        loop {
            let op = match self.peek_char() {
                Some('*') => BinaryOp::Mul,
                Some('/') => BinaryOp::Div,
                Some('%') => BinaryOp::Rem,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
            self.skip_whitespace();
        }

        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        self.skip_whitespace();

        match self.peek_char() {
            Some('!') => {
                self.pos += 1;
                let inner = self.parse_unary()?;
                Ok(Expr::Not(Box::new(inner)))
            }
            Some('-') => {
                self.pos += 1;
                let inner = self.parse_unary()?;
                if let Expr::Literal(literal @ Value::Number(_)) = &inner {
                    if let Ok(folded) = negate(literal) {
                        return Ok(Expr::Literal(folded));
                    }
                }
                Ok(Expr::Neg(Box::new(inner)))
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        self.skip_whitespace();

        match self.peek_char() {
            None => Err("unexpected end of expression".to_string()),
            Some('(') => {
                self.pos += 1;
                let expr = self.parse_expr()?;
                self.skip_whitespace();
                if self.peek_char() != Some(')') {
                    return Err("expected ')'".to_string());
                }
                self.pos += 1;
                Ok(expr)
            }
            Some('"' | '\'') => Ok(Expr::Literal(Value::String(self.parse_string()?))),
            Some(c) if c.is_ascii_digit() => self.parse_number(),
            Some(c) if c.is_ascii_alphabetic() || c == '_' => self.parse_identifier(),
            Some(c) => Err(format!("unexpected '{}' at offset {}", c, self.pos)),
        }
    }

    fn parse_identifier(&mut self) -> Result<Expr, String> {
        let start = self.pos;
        while let Some(c) = self.peek_char() {
            if c.is_ascii_alphanumeric() || c == '_' {
                self.pos += 1;
            } else {
                break;
            }
        }
        let name = &self.input[start..self.pos];

        match name {
            "true" => return Ok(Expr::Literal(Value::Bool(true))),
            "false" => return Ok(Expr::Literal(Value::Bool(false))),
            "null" => return Ok(Expr::Literal(Value::Null)),
            _ => {}
        }

        self.skip_whitespace();
        if self.peek_char() != Some('(') {
            return Ok(Expr::Var(name.to_string()));
        }

        let function =
            Function::from_name(name).ok_or_else(|| format!("unknown function '{}'", name))?;
        self.pos += 1;

        let mut args = Vec::new();
        self.skip_whitespace();
        if self.peek_char() == Some(')') {
            self.pos += 1;
            return Ok(Expr::Call(function, args));
        }

        loop {
            args.push(self.parse_expr()?);
            self.skip_whitespace();
            match self.peek_char() {
                Some(',') => self.pos += 1,
                Some(')') => {
                    self.pos += 1;
                    return Ok(Expr::Call(function, args));
                }
                _ => return Err(format!("expected ',' or ')' in call to {}", name)),
            }
        }
    }

    fn parse_string(&mut self) -> Result<String, String> {
        let Some(quote) = self.peek_char() else {
            return Err("expected string".to_string());
        };
        self.pos += 1;

        let mut out = String::new();
        while let Some(c) = self.peek_char() {
            self.pos += c.len_utf8();
            if c == quote {
                return Ok(out);
            }
            if c != '\\' {
                out.push(c);
                continue;
            }

            let Some(escaped) = self.peek_char() else {
                break;
            };
            self.pos += escaped.len_utf8();
            out.push(match escaped {
                'n' => '\n',
                't' => '\t',
                'r' => '\r',
                '\\' | '"' | '\'' => escaped,
                other => return Err(format!("invalid escape '\\{}'", other)),
            });
        }

        Err("unterminated string".to_string())
    }

    fn parse_number(&mut self) -> Result<Expr, String> {
        let start = self.pos;
        let mut is_float = false;

        while let Some(c) = self.peek_char() {
            if c.is_ascii_digit() {
                self.pos += 1;
            } else if c == '.' && !is_float {
                is_float = true;
                self.pos += 1;
            } else {
                break;
            }
        }

        let num_str = &self.input[start..self.pos];
        let invalid = || format!("invalid number: '{}'", num_str);

        if is_float {
            let f = num_str.parse::<f64>().map_err(|_| invalid())?;
            Number::from_f64(f)
                .map(|n| Expr::Literal(Value::Number(n)))
                .ok_or_else(invalid)
        } else {
            let i = num_str.parse::<i64>().map_err(|_| invalid())?;
            Ok(Expr::Literal(Value::from(i)))
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek_char() {
            if c.is_whitespace() {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }
    }

    fn peek_char(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn peek_str(&self, s: &str) -> bool {
        self.input[self.pos..].starts_with(s)
    }
}
