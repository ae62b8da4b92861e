//! Arithmetic expressions over stat names.
//!
//! Equation-stat expressions are compiled once at configuration time into a
//! small AST and evaluated per tick against a vector of numeric arguments.
//! Operands are stat-name identifiers; each occurrence in the expression
//! binds to its own argument position, in source order, so the caller's
//! input vector lines up with [`parse`]'s returned name list.
//!
//! Grammar: `+ - * / %`, `^` for exponentiation (right associative), unary
//! minus, parentheses, integer and float literals. Identifiers start with a
//! letter and may contain letters, digits, `.`, `_`, and `:`.

use std::fmt;

use crate::stats::StatValue;

/// A typed number. Integer arithmetic stays integral for `+ - * %` so that
/// a zero derived from an integer input is an integer zero; `/` always
/// divides as floats.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    pub fn from_value(value: &StatValue) -> Option<Num> {
        match value {
            StatValue::Int(v) => Some(Num::Int(*v)),
            StatValue::Float(v) => Some(Num::Float(*v)),
            _ => None,
        }
    }

    pub fn as_f64(self) -> f64 {
        match self {
            Num::Int(v) => v as f64,
            Num::Float(v) => v,
        }
    }

    /// Zero of the same numeric type, i.e. `x - x`.
    pub fn zero_like(self) -> Num {
        match self {
            Num::Int(_) => Num::Int(0),
            Num::Float(_) => Num::Float(0.0),
        }
    }

    pub fn add(self, other: Num) -> Result<Num, EvalError> {
        match (self, other) {
            (Num::Int(a), Num::Int(b)) => {
                a.checked_add(b).map(Num::Int).ok_or(EvalError::IntegerOverflow)
            }
            (a, b) => Ok(Num::Float(a.as_f64() + b.as_f64())),
        }
    }

    pub fn sub(self, other: Num) -> Result<Num, EvalError> {
        match (self, other) {
            (Num::Int(a), Num::Int(b)) => {
                a.checked_sub(b).map(Num::Int).ok_or(EvalError::IntegerOverflow)
            }
            (a, b) => Ok(Num::Float(a.as_f64() - b.as_f64())),
        }
    }

    pub fn mul(self, other: Num) -> Result<Num, EvalError> {
        match (self, other) {
            (Num::Int(a), Num::Int(b)) => {
                a.checked_mul(b).map(Num::Int).ok_or(EvalError::IntegerOverflow)
            }
            (a, b) => Ok(Num::Float(a.as_f64() * b.as_f64())),
        }
    }

    pub fn div(self, other: Num) -> Result<Num, EvalError> {
        let divisor = other.as_f64();
        if divisor == 0.0 {
            return Err(EvalError::DivisionByZero);
        }
        Ok(Num::Float(self.as_f64() / divisor))
    }

    pub fn rem(self, other: Num) -> Result<Num, EvalError> {
        match (self, other) {
            (Num::Int(a), Num::Int(b)) => {
                a.checked_rem(b).map(Num::Int).ok_or(EvalError::DivisionByZero)
            }
            (a, b) => {
                if b.as_f64() == 0.0 {
                    Err(EvalError::DivisionByZero)
                } else {
                    Ok(Num::Float(a.as_f64() % b.as_f64()))
                }
            }
        }
    }

    pub fn pow(self, other: Num) -> Result<Num, EvalError> {
        match (self, other) {
            (Num::Int(a), Num::Int(b)) if b >= 0 => {
                let exp = u32::try_from(b).map_err(|_| EvalError::IntegerOverflow)?;
                a.checked_pow(exp).map(Num::Int).ok_or(EvalError::IntegerOverflow)
            }
            (a, b) => Ok(Num::Float(a.as_f64().powf(b.as_f64()))),
        }
    }

    pub fn neg(self) -> Num {
        match self {
            Num::Int(v) => Num::Int(-v),
            Num::Float(v) => Num::Float(-v),
        }
    }
}

impl From<Num> for StatValue {
    fn from(num: Num) -> StatValue {
        match num {
            Num::Int(v) => StatValue::Int(v),
            Num::Float(v) => StatValue::Float(v),
        }
    }
}

/// Runtime evaluation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalError {
    DivisionByZero,
    IntegerOverflow,
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvalError::DivisionByZero => f.write_str("division by zero"),
            EvalError::IntegerOverflow => f.write_str("integer overflow"),
        }
    }
}

impl std::error::Error for EvalError {}

/// Expression parse failure, with a byte offset into the source text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExprError {
    UnexpectedChar(char, usize),
    UnexpectedEnd,
    TrailingInput(usize),
    InvalidNumber(String),
}

impl fmt::Display for ExprError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExprError::UnexpectedChar(c, at) => {
                write!(f, "unexpected character '{}' at offset {}", c, at)
            }
            ExprError::UnexpectedEnd => f.write_str("unexpected end of expression"),
            ExprError::TrailingInput(at) => write!(f, "trailing input at offset {}", at),
            ExprError::InvalidNumber(text) => write!(f, "invalid number '{}'", text),
        }
    }
}

impl std::error::Error for ExprError {}

/// Compiled expression. Operands are indexed by position into the argument
/// vector handed to [`Expr::eval`].
#[derive(Debug, Clone)]
pub enum Expr {
    Literal(Num),
    Arg(usize),
    Neg(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
}

impl Expr {
    pub fn eval(&self, args: &[Num]) -> Result<Num, EvalError> {
        match self {
            Expr::Literal(num) => Ok(*num),
            Expr::Arg(index) => Ok(args[*index]),
            Expr::Neg(inner) => Ok(inner.eval(args)?.neg()),
            Expr::Binary(op, left, right) => {
                let left = left.eval(args)?;
                let right = right.eval(args)?;
                match op {
                    BinaryOp::Add => left.add(right),
                    BinaryOp::Sub => left.sub(right),
                    BinaryOp::Mul => left.mul(right),
                    BinaryOp::Div => left.div(right),
                    BinaryOp::Rem => left.rem(right),
                    BinaryOp::Pow => left.pow(right),
                }
            }
        }
    }
}

/// Parses `text` into an expression plus the identifier list in occurrence
/// order. `Arg(i)` in the returned expression refers to the i-th name.
pub fn parse(text: &str) -> Result<(Expr, Vec<String>), ExprError> {
    let mut parser = Parser {
        chars: text.char_indices().peekable(),
        text,
        names: Vec::new(),
    };
    let expr = parser.expression()?;
    parser.skip_whitespace();
    match parser.chars.peek() {
        Some(&(at, _)) => Err(ExprError::TrailingInput(at)),
        None => Ok((expr, parser.names)),
    }
}

struct Parser<'a> {
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    text: &'a str,
    names: Vec<String>,
}

impl Parser<'_> {
    fn skip_whitespace(&mut self) {
        while matches!(self.chars.peek(), Some((_, c)) if c.is_whitespace()) {
            self.chars.next();
        }
    }

    fn eat(&mut self, expected: char) -> bool {
        self.skip_whitespace();
        if matches!(self.chars.peek(), Some(&(_, c)) if c == expected) {
            self.chars.next();
            true
        } else {
            false
        }
    }

    fn expression(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.term()?;
        loop {
            if self.eat('+') {
                let right = self.term()?;
                left = Expr::Binary(BinaryOp::Add, Box::new(left), Box::new(right));
            } else if self.eat('-') {
                let right = self.term()?;
                left = Expr::Binary(BinaryOp::Sub, Box::new(left), Box::new(right));
            } else {
                return Ok(left);
            }
        }
    }

    fn term(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.factor()?;
        loop {
            if self.eat('*') {
                let right = self.factor()?;
                left = Expr::Binary(BinaryOp::Mul, Box::new(left), Box::new(right));
            } else if self.eat('/') {
                let right = self.factor()?;
                left = Expr::Binary(BinaryOp::Div, Box::new(left), Box::new(right));
            } else if self.eat('%') {
                let right = self.factor()?;
                left = Expr::Binary(BinaryOp::Rem, Box::new(left), Box::new(right));
            } else {
                return Ok(left);
            }
        }
    }

    fn factor(&mut self) -> Result<Expr, ExprError> {
        if self.eat('-') {
            return Ok(Expr::Neg(Box::new(self.factor()?)));
        }
        let base = self.atom()?;
        if self.eat('^') {
            let exponent = self.factor()?;
            return Ok(Expr::Binary(BinaryOp::Pow, Box::new(base), Box::new(exponent)));
        }
        Ok(base)
    }

    fn atom(&mut self) -> Result<Expr, ExprError> {
        self.skip_whitespace();
        let Some(&(start, c)) = self.chars.peek() else {
            return Err(ExprError::UnexpectedEnd);
        };
        if c == '(' {
            self.chars.next();
            let inner = self.expression()?;
            if !self.eat(')') {
                return match self.chars.peek() {
                    Some(&(at, c)) => Err(ExprError::UnexpectedChar(c, at)),
                    None => Err(ExprError::UnexpectedEnd),
                };
            }
            return Ok(inner);
        }
        if c.is_ascii_digit() {
            return self.number(start);
        }
        if c.is_ascii_alphabetic() {
            return Ok(self.identifier(start));
        }
        Err(ExprError::UnexpectedChar(c, start))
    }

    fn number(&mut self, start: usize) -> Result<Expr, ExprError> {
        let mut end = start;
        let mut is_float = false;
        while let Some(&(at, c)) = self.chars.peek() {
            if c.is_ascii_digit() {
                end = at + c.len_utf8();
                self.chars.next();
            } else if c == '.' && !is_float {
                is_float = true;
                end = at + c.len_utf8();
                self.chars.next();
            } else {
                break;
            }
        }
        let text = &self.text[start..end];
        let num = if is_float {
            text.parse::<f64>().map(Num::Float).ok()
        } else {
            text.parse::<i64>().map(Num::Int).ok()
        };
        num.map(Expr::Literal)
            .ok_or_else(|| ExprError::InvalidNumber(text.to_string()))
    }

    fn identifier(&mut self, start: usize) -> Expr {
        let mut end = start;
        while let Some(&(at, c)) = self.chars.peek() {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == ':' {
                end = at + c.len_utf8();
                self.chars.next();
            } else {
                break;
            }
        }
        self.names.push(self.text[start..end].to_string());
        Expr::Arg(self.names.len() - 1)
    }
}
