//! # Expression Evaluator
//!
//! A small, sandboxed evaluator for the condition strings that appear on
//! transitions, guards, loop conditions and loop iterators. Expressions are
//! evaluated over the execution's [`VariableStore`] and never touch the host
//! runtime: there are no function calls, no side effects, and the only
//! property access beyond plain field lookup is `.length` on arrays.
//!
//! ## Supported syntax
//!
//! - literals: numbers, `'single'`/`"double"` quoted strings, `true`, `false`, `null`
//! - variable references by name
//! - comparisons: `==` `!=` `<` `<=` `>` `>=`
//! - logic: `&&` `||` `!`
//! - arithmetic: `+` `-` `*` `/` `%`
//! - array indexing `items[0]`, field access `user.name`, `items.length`
//!
//! A variable that is not set evaluates to a distinguished *undefined* value:
//! it compares unequal to every defined value, and logical AND short-circuits
//! to false on it. Anything outside the grammar is rejected at parse time with
//! an [`EvaluationError`].

use serde_json::{Number, Value};
use std::fmt;

use crate::variables::{VariableStore, truthy};

/// Errors produced while parsing or evaluating an expression.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum EvaluationError {
    /// The expression could not be tokenized.
    #[error("invalid token at position {position}: {message}")]
    InvalidToken { position: usize, message: String },
    /// The expression could not be parsed.
    #[error("parse error: {0}")]
    Parse(String),
    /// The expression uses syntax outside the supported grammar.
    #[error("unsupported syntax: {0}")]
    Unsupported(String),
    /// The expression parsed but a value had the wrong type for an operation.
    #[error("type error: {0}")]
    Type(String),
}

/// The result of evaluating an expression: a JSON value, or the
/// distinguished `undefined` produced by missing variables and fields.
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluated {
    Value(Value),
    Undefined,
}

impl Evaluated {
    /// Coerce to a boolean: `undefined`, `null`, `0`, `""` and `[]` are
    /// false, everything else is true.
    pub fn is_truthy(&self) -> bool {
        match self {
            Evaluated::Undefined => false,
            Evaluated::Value(v) => truthy(v),
        }
    }

    /// The underlying value, if defined.
    pub fn into_value(self) -> Option<Value> {
        match self {
            Evaluated::Value(v) => Some(v),
            Evaluated::Undefined => None,
        }
    }
}

impl fmt::Display for Evaluated {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Evaluated::Undefined => write!(f, "undefined"),
            Evaluated::Value(v) => write!(f, "{}", v),
        }
    }
}

// ============================================================================
// TOKENS
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(Number),
    Str(String),
    Ident(String),
    True,
    False,
    Null,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Not,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Dot,
}

fn tokenize(input: &str) -> Result<Vec<Token>, EvaluationError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
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
            '.' => {
                tokens.push(Token::Dot);
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
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '%' => {
                tokens.push(Token::Percent);
                i += 1;
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Eq);
                    i += 2;
                } else {
                    return Err(EvaluationError::InvalidToken {
                        position: i,
                        message: "assignment is not supported, use '=='".to_string(),
                    });
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ne);
                    i += 2;
                } else {
                    tokens.push(Token::Not);
                    i += 1;
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '&' => {
                if chars.get(i + 1) == Some(&'&') {
                    tokens.push(Token::And);
                    i += 2;
                } else {
                    return Err(EvaluationError::InvalidToken {
                        position: i,
                        message: "bitwise '&' is not supported, use '&&'".to_string(),
                    });
                }
            }
            '|' => {
                if chars.get(i + 1) == Some(&'|') {
                    tokens.push(Token::Or);
                    i += 2;
                } else {
                    return Err(EvaluationError::InvalidToken {
                        position: i,
                        message: "bitwise '|' is not supported, use '||'".to_string(),
                    });
                }
            }
            '\'' | '"' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&'\\') => {
                            match chars.get(i + 1) {
                                Some(&'n') => s.push('\n'),
                                Some(&'t') => s.push('\t'),
                                Some(&'\\') => s.push('\\'),
                                Some(&ch) if ch == quote => s.push(ch),
                                _ => {
                                    return Err(EvaluationError::InvalidToken {
                                        position: i,
                                        message: "invalid escape sequence".to_string(),
                                    });
                                }
                            }
                            i += 2;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                        None => {
                            return Err(EvaluationError::InvalidToken {
                                position: i,
                                message: "unterminated string literal".to_string(),
                            });
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            '0'..='9' => {
                let start = i;
                let mut is_float = false;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    if chars[i] == '.' {
                        // A dot not followed by a digit is field access, not a decimal point.
                        if !chars.get(i + 1).map(|c| c.is_ascii_digit()).unwrap_or(false) {
                            break;
                        }
                        if is_float {
                            break;
                        }
                        is_float = true;
                    }
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let number = if is_float {
                    text.parse::<f64>().ok().and_then(Number::from_f64)
                } else {
                    text.parse::<i64>().ok().map(Number::from)
                };
                match number {
                    Some(n) => tokens.push(Token::Number(n)),
                    None => {
                        return Err(EvaluationError::InvalidToken {
                            position: start,
                            message: format!("invalid number literal '{}'", text),
                        });
                    }
                }
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
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
                return Err(EvaluationError::InvalidToken {
                    position: i,
                    message: format!("unexpected character '{}'", other),
                });
            }
        }
    }

    Ok(tokens)
}

// ============================================================================
// AST & PARSER
// ============================================================================

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Variable(String),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// `target[index]`
    Index {
        target: Box<Expr>,
        index: Box<Expr>,
    },
    /// `target.field` (with `.length` resolved specially on arrays)
    Field {
        target: Box<Expr>,
        field: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BinaryOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: Token) -> Result<(), EvaluationError> {
        match self.advance() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(EvaluationError::Parse(format!(
                "expected {:?}, found {:?}",
                expected, token
            ))),
            None => Err(EvaluationError::Parse(format!(
                "expected {:?}, found end of expression",
                expected
            ))),
        }
    }

    // or := and ('||' and)*
    fn parse_or(&mut self) -> Result<Expr, EvaluationError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Binary {
                op: BinaryOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    // and := comparison ('&&' comparison)*
    fn parse_and(&mut self) -> Result<Expr, EvaluationError> {
        let mut left = self.parse_comparison()?;
        while self.peek() == Some(&Token::And) {
            self.advance();
            let right = self.parse_comparison()?;
            left = Expr::Binary {
                op: BinaryOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    // comparison := additive (cmp_op additive)?
    fn parse_comparison(&mut self) -> Result<Expr, EvaluationError> {
        let left = self.parse_additive()?;
        let op = match self.peek() {
            Some(Token::Eq) => BinaryOp::Eq,
            Some(Token::Ne) => BinaryOp::Ne,
            Some(Token::Lt) => BinaryOp::Lt,
            Some(Token::Le) => BinaryOp::Le,
            Some(Token::Gt) => BinaryOp::Gt,
            Some(Token::Ge) => BinaryOp::Ge,
            _ => return Ok(left),
        };
        self.advance();
        let right = self.parse_additive()?;
        Ok(Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    // additive := multiplicative (('+' | '-') multiplicative)*
    fn parse_additive(&mut self) -> Result<Expr, EvaluationError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    // multiplicative := unary (('*' | '/' | '%') unary)*
    fn parse_multiplicative(&mut self) -> Result<Expr, EvaluationError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::Percent) => BinaryOp::Mod,
                _ => break,
            };
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    // unary := ('!' | '-') unary | postfix
    fn parse_unary(&mut self) -> Result<Expr, EvaluationError> {
        match self.peek() {
            Some(Token::Not) => {
                self.advance();
                let operand = self.parse_unary()?;
                Ok(Expr::Unary {
                    op: UnaryOp::Not,
                    operand: Box::new(operand),
                })
            }
            Some(Token::Minus) => {
                self.advance();
                let operand = self.parse_unary()?;
                Ok(Expr::Unary {
                    op: UnaryOp::Neg,
                    operand: Box::new(operand),
                })
            }
            _ => self.parse_postfix(),
        }
    }

    // postfix := primary ('[' expr ']' | '.' ident)*
    fn parse_postfix(&mut self) -> Result<Expr, EvaluationError> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek() {
                Some(Token::LBracket) => {
                    self.advance();
                    let index = self.parse_or()?;
                    self.expect(Token::RBracket)?;
                    expr = Expr::Index {
                        target: Box::new(expr),
                        index: Box::new(index),
                    };
                }
                Some(Token::Dot) => {
                    self.advance();
                    let field = match self.advance() {
                        Some(Token::Ident(name)) => name,
                        other => {
                            return Err(EvaluationError::Parse(format!(
                                "expected field name after '.', found {:?}",
                                other
                            )));
                        }
                    };
                    if self.peek() == Some(&Token::LParen) {
                        return Err(EvaluationError::Unsupported(format!(
                            "method call '.{}()' is not allowed",
                            field
                        )));
                    }
                    expr = Expr::Field {
                        target: Box::new(expr),
                        field,
                    };
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, EvaluationError> {
        match self.advance() {
            Some(Token::Number(n)) => Ok(Expr::Literal(Value::Number(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Expr::Literal(Value::Null)),
            Some(Token::Ident(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    return Err(EvaluationError::Unsupported(format!(
                        "function call '{}()' is not allowed",
                        name
                    )));
                }
                Ok(Expr::Variable(name))
            }
            Some(Token::LParen) => {
                let expr = self.parse_or()?;
                self.expect(Token::RParen)?;
                Ok(expr)
            }
            Some(token) => Err(EvaluationError::Parse(format!(
                "unexpected token {:?}",
                token
            ))),
            None => Err(EvaluationError::Parse("empty expression".to_string())),
        }
    }
}

/// Parse an expression string into an [`Expr`] tree.
pub fn parse(input: &str) -> Result<Expr, EvaluationError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(EvaluationError::Parse(format!(
            "trailing input after expression: {:?}",
            parser.tokens[parser.pos]
        )));
    }
    Ok(expr)
}

// ============================================================================
// EVALUATION
// ============================================================================

/// Evaluate an expression string over a variable store.
pub fn evaluate(input: &str, vars: &VariableStore) -> Result<Evaluated, EvaluationError> {
    let expr = parse(input)?;
    eval_expr(&expr, vars)
}

/// Evaluate an expression and coerce the result to a boolean.
pub fn evaluate_bool(input: &str, vars: &VariableStore) -> Result<bool, EvaluationError> {
    Ok(evaluate(input, vars)?.is_truthy())
}

/// Evaluate a parsed expression tree over a variable store.
pub fn eval_expr(expr: &Expr, vars: &VariableStore) -> Result<Evaluated, EvaluationError> {
    match expr {
        Expr::Literal(value) => Ok(Evaluated::Value(value.clone())),
        Expr::Variable(name) => Ok(match vars.get(name) {
            Some(value) => Evaluated::Value(value.clone()),
            None => Evaluated::Undefined,
        }),
        Expr::Unary { op, operand } => {
            let value = eval_expr(operand, vars)?;
            match op {
                UnaryOp::Not => Ok(Evaluated::Value(Value::Bool(!value.is_truthy()))),
                UnaryOp::Neg => match value {
                    Evaluated::Value(Value::Number(n)) => {
                        if let Some(i) = n.as_i64() {
                            wrap_int(i.checked_neg())
                        } else {
                            match n.as_f64().and_then(|f| Number::from_f64(-f)) {
                                Some(n) => Ok(Evaluated::Value(Value::Number(n))),
                                None => Err(EvaluationError::Type(
                                    "cannot negate non-finite number".to_string(),
                                )),
                            }
                        }
                    }
                    other => Err(EvaluationError::Type(format!(
                        "cannot negate {}",
                        describe(&other)
                    ))),
                },
            }
        }
        Expr::Binary { op, left, right } => eval_binary(*op, left, right, vars),
        Expr::Index { target, index } => {
            let target = eval_expr(target, vars)?;
            let index = eval_expr(index, vars)?;
            match (target, index) {
                (Evaluated::Value(Value::Array(items)), Evaluated::Value(Value::Number(n))) => {
                    match n.as_i64() {
                        Some(i) if i >= 0 && (i as usize) < items.len() => {
                            Ok(Evaluated::Value(items[i as usize].clone()))
                        }
                        _ => Ok(Evaluated::Undefined),
                    }
                }
                (Evaluated::Value(Value::Object(map)), Evaluated::Value(Value::String(key))) => {
                    Ok(match map.get(&key) {
                        Some(value) => Evaluated::Value(value.clone()),
                        None => Evaluated::Undefined,
                    })
                }
                (Evaluated::Undefined, _) => Ok(Evaluated::Undefined),
                (target, index) => Err(EvaluationError::Type(format!(
                    "cannot index {} with {}",
                    describe(&target),
                    describe(&index)
                ))),
            }
        }
        Expr::Field { target, field } => {
            let target = eval_expr(target, vars)?;
            match target {
                Evaluated::Value(Value::Array(items)) if field == "length" => Ok(Evaluated::Value(
                    Value::Number(Number::from(items.len() as i64)),
                )),
                Evaluated::Value(Value::Object(map)) => Ok(match map.get(field) {
                    Some(value) => Evaluated::Value(value.clone()),
                    None => Evaluated::Undefined,
                }),
                Evaluated::Undefined => Ok(Evaluated::Undefined),
                other => Err(EvaluationError::Type(format!(
                    "cannot access field '{}' on {}",
                    field,
                    describe(&other)
                ))),
            }
        }
    }
}

fn eval_binary(
    op: BinaryOp,
    left: &Expr,
    right: &Expr,
    vars: &VariableStore,
) -> Result<Evaluated, EvaluationError> {
    // Logical operators short-circuit; everything else evaluates both sides.
    match op {
        BinaryOp::And => {
            let lhs = eval_expr(left, vars)?;
            if !lhs.is_truthy() {
                return Ok(Evaluated::Value(Value::Bool(false)));
            }
            let rhs = eval_expr(right, vars)?;
            return Ok(Evaluated::Value(Value::Bool(rhs.is_truthy())));
        }
        BinaryOp::Or => {
            let lhs = eval_expr(left, vars)?;
            if lhs.is_truthy() {
                return Ok(Evaluated::Value(Value::Bool(true)));
            }
            let rhs = eval_expr(right, vars)?;
            return Ok(Evaluated::Value(Value::Bool(rhs.is_truthy())));
        }
        _ => {}
    }

    let lhs = eval_expr(left, vars)?;
    let rhs = eval_expr(right, vars)?;

    match op {
        BinaryOp::Eq => Ok(Evaluated::Value(Value::Bool(values_equal(&lhs, &rhs)))),
        BinaryOp::Ne => Ok(Evaluated::Value(Value::Bool(!values_equal(&lhs, &rhs)))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = match compare(&lhs, &rhs) {
                Some(ordering) => ordering,
                // Undefined or cross-type operands never satisfy an ordering.
                None => return Ok(Evaluated::Value(Value::Bool(false))),
            };
            let result = match op {
                BinaryOp::Lt => ordering.is_lt(),
                BinaryOp::Le => ordering.is_le(),
                BinaryOp::Gt => ordering.is_gt(),
                BinaryOp::Ge => ordering.is_ge(),
                _ => unreachable!(),
            };
            Ok(Evaluated::Value(Value::Bool(result)))
        }
        BinaryOp::Add => {
            // '+' concatenates when either side is a string.
            match (&lhs, &rhs) {
                (Evaluated::Value(Value::String(a)), Evaluated::Value(Value::String(b))) => {
                    Ok(Evaluated::Value(Value::String(format!("{}{}", a, b))))
                }
                _ => arithmetic(op, &lhs, &rhs),
            }
        }
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
            arithmetic(op, &lhs, &rhs)
        }
        BinaryOp::And | BinaryOp::Or => unreachable!(),
    }
}

fn describe(value: &Evaluated) -> String {
    match value {
        Evaluated::Undefined => "undefined".to_string(),
        Evaluated::Value(Value::Null) => "null".to_string(),
        Evaluated::Value(Value::Bool(_)) => "a boolean".to_string(),
        Evaluated::Value(Value::Number(_)) => "a number".to_string(),
        Evaluated::Value(Value::String(_)) => "a string".to_string(),
        Evaluated::Value(Value::Array(_)) => "an array".to_string(),
        Evaluated::Value(Value::Object(_)) => "an object".to_string(),
    }
}

fn values_equal(lhs: &Evaluated, rhs: &Evaluated) -> bool {
    match (lhs, rhs) {
        (Evaluated::Undefined, Evaluated::Undefined) => true,
        (Evaluated::Undefined, _) | (_, Evaluated::Undefined) => false,
        (Evaluated::Value(a), Evaluated::Value(b)) => match (a, b) {
            // Numeric equality ignores the int/float representation split.
            (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
                (Some(i), Some(j)) => i == j,
                _ => x.as_f64() == y.as_f64(),
            },
            _ => a == b,
        },
    }
}

fn compare(lhs: &Evaluated, rhs: &Evaluated) -> Option<std::cmp::Ordering> {
    match (lhs, rhs) {
        (Evaluated::Value(Value::Number(a)), Evaluated::Value(Value::Number(b))) => {
            match (a.as_i64(), b.as_i64()) {
                (Some(i), Some(j)) => Some(i.cmp(&j)),
                _ => match (a.as_f64(), b.as_f64()) {
                    (Some(x), Some(y)) => x.partial_cmp(&y),
                    _ => None,
                },
            }
        }
        (Evaluated::Value(Value::String(a)), Evaluated::Value(Value::String(b))) => {
            Some(a.cmp(b))
        }
        _ => None,
    }
}

fn arithmetic(op: BinaryOp, lhs: &Evaluated, rhs: &Evaluated) -> Result<Evaluated, EvaluationError> {
    let (a, b) = match (lhs, rhs) {
        (Evaluated::Value(Value::Number(a)), Evaluated::Value(Value::Number(b))) => (a, b),
        _ => {
            return Err(EvaluationError::Type(format!(
                "arithmetic requires numbers, found {} and {}",
                describe(lhs),
                describe(rhs)
            )));
        }
    };

    // Integer arithmetic when both sides are integers, except division.
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        match op {
            BinaryOp::Add => return wrap_int(x.checked_add(y)),
            BinaryOp::Sub => return wrap_int(x.checked_sub(y)),
            BinaryOp::Mul => return wrap_int(x.checked_mul(y)),
            BinaryOp::Mod => {
                return if y == 0 {
                    Err(EvaluationError::Type("modulo by zero".to_string()))
                } else {
                    wrap_int(x.checked_rem(y))
                };
            }
            BinaryOp::Div if y != 0 && x % y == 0 => return wrap_int(Some(x / y)),
            _ => {}
        }
    }

    let x = a.as_f64().unwrap_or(f64::NAN);
    let y = b.as_f64().unwrap_or(f64::NAN);
    let result = match op {
        BinaryOp::Add => x + y,
        BinaryOp::Sub => x - y,
        BinaryOp::Mul => x * y,
        BinaryOp::Div => {
            if y == 0.0 {
                return Err(EvaluationError::Type("division by zero".to_string()));
            }
            x / y
        }
        BinaryOp::Mod => {
            if y == 0.0 {
                return Err(EvaluationError::Type("modulo by zero".to_string()));
            }
            x % y
        }
        _ => unreachable!(),
    };
    match Number::from_f64(result) {
        Some(n) => Ok(Evaluated::Value(Value::Number(n))),
        None => Err(EvaluationError::Type(
            "arithmetic produced a non-finite number".to_string(),
        )),
    }
}

fn wrap_int(value: Option<i64>) -> Result<Evaluated, EvaluationError> {
    match value {
        Some(i) => Ok(Evaluated::Value(Value::Number(Number::from(i)))),
        None => Err(EvaluationError::Type(
            "integer overflow in arithmetic".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store(pairs: &[(&str, Value)]) -> VariableStore {
        let mut vars = VariableStore::new();
        for (name, value) in pairs {
            vars.set(*name, value.clone());
        }
        vars
    }

    #[test]
    fn test_literals_and_arithmetic() {
        let vars = VariableStore::new();
        assert_eq!(
            evaluate("1 + 2 * 3", &vars).unwrap(),
            Evaluated::Value(json!(7))
        );
        assert_eq!(
            evaluate("(1 + 2) * 3", &vars).unwrap(),
            Evaluated::Value(json!(9))
        );
        assert_eq!(
            evaluate("10 % 4", &vars).unwrap(),
            Evaluated::Value(json!(2))
        );
        assert_eq!(
            evaluate("7 / 2", &vars).unwrap(),
            Evaluated::Value(json!(3.5))
        );
        assert_eq!(
            evaluate("-3 + 1", &vars).unwrap(),
            Evaluated::Value(json!(-2))
        );
    }

    #[test]
    fn test_comparisons_and_logic() {
        let vars = store(&[("numVar", json!(42)), ("boolVar", json!(true))]);
        assert!(evaluate_bool("numVar > 40 && boolVar", &vars).unwrap());
        assert!(!evaluate_bool("numVar > 50 || !boolVar", &vars).unwrap());
        assert!(evaluate_bool("numVar == 42", &vars).unwrap());
        assert!(evaluate_bool("numVar != 41", &vars).unwrap());
        assert!(evaluate_bool("numVar >= 42 && numVar <= 42", &vars).unwrap());
    }

    #[test]
    fn test_int_float_comparison() {
        let vars = store(&[("x", json!(2.0))]);
        assert!(evaluate_bool("x == 2", &vars).unwrap());
        assert!(evaluate_bool("x < 2.5", &vars).unwrap());
    }

    #[test]
    fn test_string_operations() {
        let vars = store(&[("name", json!("flow"))]);
        assert!(evaluate_bool("name == 'flow'", &vars).unwrap());
        assert_eq!(
            evaluate("name + \"-engine\"", &vars).unwrap(),
            Evaluated::Value(json!("flow-engine"))
        );
        assert!(evaluate_bool("'abc' < 'abd'", &vars).unwrap());
    }

    #[test]
    fn test_undefined_semantics() {
        let vars = store(&[("present", json!(1))]);
        // Missing variables are undefined and compare unequal to everything defined.
        assert!(!evaluate_bool("missing == 1", &vars).unwrap());
        assert!(evaluate_bool("missing != 1", &vars).unwrap());
        assert!(!evaluate_bool("missing == null", &vars).unwrap());
        assert!(evaluate_bool("missing == other_missing", &vars).unwrap());
        // AND short-circuits to false on undefined.
        assert!(!evaluate_bool("missing && present", &vars).unwrap());
        // Orderings never hold against undefined.
        assert!(!evaluate_bool("missing > 0", &vars).unwrap());
    }

    #[test]
    fn test_indexing_and_fields() {
        let vars = store(&[
            ("items", json!(["x", "y", "z"])),
            ("user", json!({"name": "ada", "age": 36})),
        ]);
        assert_eq!(
            evaluate("items[1]", &vars).unwrap(),
            Evaluated::Value(json!("y"))
        );
        assert_eq!(evaluate("items[9]", &vars).unwrap(), Evaluated::Undefined);
        assert_eq!(
            evaluate("items.length", &vars).unwrap(),
            Evaluated::Value(json!(3))
        );
        assert_eq!(
            evaluate("user.name", &vars).unwrap(),
            Evaluated::Value(json!("ada"))
        );
        assert_eq!(evaluate("user.missing", &vars).unwrap(), Evaluated::Undefined);
        assert!(evaluate_bool("items.length > 2 && user.age >= 36", &vars).unwrap());
    }

    #[test]
    fn test_boolean_coercion() {
        let vars = store(&[
            ("empty_str", json!("")),
            ("empty_arr", json!([])),
            ("zero", json!(0)),
            ("nothing", json!(null)),
            ("word", json!("hi")),
        ]);
        assert!(!evaluate_bool("empty_str", &vars).unwrap());
        assert!(!evaluate_bool("empty_arr", &vars).unwrap());
        assert!(!evaluate_bool("zero", &vars).unwrap());
        assert!(!evaluate_bool("nothing", &vars).unwrap());
        assert!(evaluate_bool("word", &vars).unwrap());
        assert!(evaluate_bool("!zero", &vars).unwrap());
    }

    #[test]
    fn test_rejects_unsupported_syntax() {
        let vars = VariableStore::new();
        assert!(matches!(
            evaluate("foo()", &vars),
            Err(EvaluationError::Unsupported(_))
        ));
        assert!(matches!(
            evaluate("items.map()", &vars),
            Err(EvaluationError::Unsupported(_))
        ));
        assert!(evaluate("a = 1", &vars).is_err());
        assert!(evaluate("a & b", &vars).is_err());
        assert!(evaluate("", &vars).is_err());
        assert!(evaluate("1 +", &vars).is_err());
        assert!(evaluate("(1", &vars).is_err());
        assert!(evaluate("1 2", &vars).is_err());
    }

    #[test]
    fn test_type_errors() {
        let vars = store(&[("s", json!("text"))]);
        assert!(matches!(
            evaluate("s - 1", &vars),
            Err(EvaluationError::Type(_))
        ));
        assert!(matches!(
            evaluate("1 / 0", &vars),
            Err(EvaluationError::Type(_))
        ));
        assert!(matches!(
            evaluate("s.length", &vars),
            Err(EvaluationError::Type(_))
        ));
    }
}
