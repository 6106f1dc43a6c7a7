//! Expression language for `update` actions and `${...}` payload placeholders.
//!
//! Supported syntax:
//! - Field access: `order.total`, `items.0.price`
//! - Literals: `42`, `3.5`, `"text"`, `'text'`, `true`, `false`, `null`
//! - Arithmetic: `+`, `-`, `*`, `/`, `%`, unary `-`, parentheses
//! - String concatenation: `+` when either side is a string
//! - Function calls from a fixed allow-list: `sha256(order.email)`, `upper(name)`
//!
//! Expressions are parsed when the rule set is compiled. Anything outside
//! this grammar is rejected.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256, Sha512};

use crate::error::{Result, RuleError};
use crate::value::{as_number, get_path, number_value, to_display, type_name};

/// Expression AST node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expression {
    Literal(Value),
    /// Dot path into the current record.
    Field(String),
    Binary {
        left: Box<Expression>,
        op: BinaryOperator,
        right: Box<Expression>,
    },
    Negate(Box<Expression>),
    Call {
        function: Function,
        args: Vec<Expression>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOperator {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

/// Allow-listed helper functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Function {
    Sha256,
    Sha512,
    Upper,
    Lower,
    Trim,
    Len,
    Concat,
    Abs,
    Round,
    Floor,
    Ceil,
    Min,
    Max,
    Coalesce,
    String,
    Number,
    Now,
    Uuid,
}

impl Function {
    pub fn from_name(name: &str) -> Option<Self> {
        let function = match name.to_ascii_lowercase().as_str() {
            "sha256" => Self::Sha256,
            "sha512" => Self::Sha512,
            "upper" => Self::Upper,
            "lower" => Self::Lower,
            "trim" => Self::Trim,
            "len" => Self::Len,
            "concat" => Self::Concat,
            "abs" => Self::Abs,
            "round" => Self::Round,
            "floor" => Self::Floor,
            "ceil" => Self::Ceil,
            "min" => Self::Min,
            "max" => Self::Max,
            "coalesce" => Self::Coalesce,
            "string" => Self::String,
            "number" => Self::Number,
            "now" => Self::Now,
            "uuid" => Self::Uuid,
            _ => return None,
        };
        Some(function)
    }

    /// Accepted argument count range (inclusive).
    fn arity(&self) -> (usize, usize) {
        match self {
            Self::Now | Self::Uuid => (0, 0),
            Self::Round => (1, 2),
            Self::Concat | Self::Min | Self::Max | Self::Coalesce => (1, usize::MAX),
            _ => (1, 1),
        }
    }

    /// Whether the function yields the same output for the same input.
    pub fn is_pure(&self) -> bool {
        !matches!(self, Self::Now | Self::Uuid)
    }
}

impl Expression {
    /// Parse an expression from a string.
    pub fn parse(input: &str) -> Result<Self> {
        let tokens = lex(input)?;
        if tokens.is_empty() {
            return Err(RuleError::Expression("empty expression".to_string()));
        }
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_expr()?;
        if let Some(token) = parser.tokens.get(parser.pos) {
            return Err(RuleError::Expression(format!(
                "unexpected {:?} in '{}'",
                token, input
            )));
        }
        Ok(expr)
    }

    /// Evaluate against a record.
    pub fn evaluate(&self, record: &Value) -> Result<Value> {
        match self {
            Expression::Literal(value) => Ok(value.clone()),
            Expression::Field(path) => Ok(get_path(record, path).cloned().unwrap_or(Value::Null)),
            Expression::Negate(inner) => {
                let value = inner.evaluate(record)?;
                Ok(number_value(-expect_number(&value, "negate")?))
            }
            Expression::Binary { left, op, right } => {
                let left = left.evaluate(record)?;
                let right = right.evaluate(record)?;
                apply_binary(*op, &left, &right)
            }
            Expression::Call { function, args } => {
                let values = args
                    .iter()
                    .map(|arg| arg.evaluate(record))
                    .collect::<Result<Vec<_>>>()?;
                call(*function, &values)
            }
        }
    }

    /// Whether evaluation depends only on the record.
    pub fn is_pure(&self) -> bool {
        match self {
            Expression::Literal(_) | Expression::Field(_) => true,
            Expression::Negate(inner) => inner.is_pure(),
            Expression::Binary { left, right, .. } => left.is_pure() && right.is_pure(),
            Expression::Call { function, args } => {
                function.is_pure() && args.iter().all(Expression::is_pure)
            }
        }
    }
}

fn expect_number(value: &Value, context: &str) -> Result<f64> {
    as_number(value).ok_or_else(|| {
        RuleError::Expression(format!("{} expects a number, got {}", context, type_name(value)))
    })
}

fn apply_binary(op: BinaryOperator, left: &Value, right: &Value) -> Result<Value> {
    if op == BinaryOperator::Add && (left.is_string() || right.is_string()) {
        return Ok(Value::String(format!("{}{}", to_display(left), to_display(right))));
    }

    let symbol = match op {
        BinaryOperator::Add => "+",
        BinaryOperator::Sub => "-",
        BinaryOperator::Mul => "*",
        BinaryOperator::Div => "/",
        BinaryOperator::Mod => "%",
    };
    let a = expect_number(left, symbol)?;
    let b = expect_number(right, symbol)?;

    let result = match op {
        BinaryOperator::Add => a + b,
        BinaryOperator::Sub => a - b,
        BinaryOperator::Mul => a * b,
        BinaryOperator::Div | BinaryOperator::Mod if b == 0.0 => {
            return Err(RuleError::Expression(format!("division by zero in '{}'", symbol)));
        }
        BinaryOperator::Div => a / b,
        BinaryOperator::Mod => a % b,
    };
    Ok(number_value(result))
}

fn call(function: Function, args: &[Value]) -> Result<Value> {
    let first = args.first().unwrap_or(&Value::Null);
    let value = match function {
        Function::Sha256 => Value::String(hex::encode(Sha256::digest(to_display(first).as_bytes()))),
        Function::Sha512 => Value::String(hex::encode(Sha512::digest(to_display(first).as_bytes()))),
        Function::Upper => Value::String(to_display(first).to_uppercase()),
        Function::Lower => Value::String(to_display(first).to_lowercase()),
        Function::Trim => Value::String(to_display(first).trim().to_string()),
        Function::Len => {
            let len = match first {
                Value::Null => 0,
                Value::String(s) => s.chars().count(),
                Value::Array(items) => items.len(),
                Value::Object(map) => map.len(),
                other => to_display(other).chars().count(),
            };
            Value::from(len)
        }
        Function::Concat => Value::String(args.iter().map(to_display).collect()),
        Function::Abs => number_value(expect_number(first, "abs")?.abs()),
        Function::Floor => number_value(expect_number(first, "floor")?.floor()),
        Function::Ceil => number_value(expect_number(first, "ceil")?.ceil()),
        Function::Round => {
            let n = expect_number(first, "round")?;
            let digits = match args.get(1) {
                Some(d) => expect_number(d, "round")?.clamp(0.0, 15.0) as i32,
                None => 0,
            };
            let factor = 10f64.powi(digits);
            number_value((n * factor).round() / factor)
        }
        Function::Min | Function::Max => {
            let mut numbers = Vec::with_capacity(args.len());
            for arg in args {
                numbers.push(expect_number(arg, "min/max")?);
            }
            let folded = numbers.into_iter().reduce(|a, b| {
                if function == Function::Min {
                    a.min(b)
                } else {
                    a.max(b)
                }
            });
            folded.map(number_value).unwrap_or(Value::Null)
        }
        Function::Coalesce => args
            .iter()
            .find(|v| !v.is_null())
            .cloned()
            .unwrap_or(Value::Null),
        Function::String => Value::String(to_display(first)),
        Function::Number => number_value(expect_number(first, "number")?),
        Function::Now => Value::String(chrono::Utc::now().to_rfc3339()),
        Function::Uuid => Value::String(uuid::Uuid::new_v4().to_string()),
    };
    Ok(value)
}

#[derive(Debug, Clone, PartialEq)]
enum Lexeme {
    Number(f64),
    Str(String),
    Ident(String),
    LParen,
    RParen,
    Comma,
    Op(char),
}

fn lex(input: &str) -> Result<Vec<Lexeme>> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Lexeme::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Lexeme::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Lexeme::Comma);
                i += 1;
            }
            '+' | '-' | '*' | '/' | '%' => {
                tokens.push(Lexeme::Op(c));
                i += 1;
            }
            '"' | '\'' => {
                let mut literal = String::new();
                let mut j = i + 1;
                let mut closed = false;
                while j < chars.len() {
                    if chars[j] == '\\' && j + 1 < chars.len() {
                        literal.push(chars[j + 1]);
                        j += 2;
                        continue;
                    }
                    if chars[j] == c {
                        closed = true;
                        break;
                    }
                    literal.push(chars[j]);
                    j += 1;
                }
                if !closed {
                    return Err(RuleError::Expression(format!(
                        "unterminated string in '{}'",
                        input
                    )));
                }
                tokens.push(Lexeme::Str(literal));
                i = j + 1;
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let number = text.parse::<f64>().map_err(|_| {
                    RuleError::Expression(format!("invalid number '{}'", text))
                })?;
                tokens.push(Lexeme::Number(number));
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '.' | '$'))
                {
                    i += 1;
                }
                let ident: String = chars[start..i].iter().collect();
                if ident.ends_with('.') || ident.contains("..") {
                    return Err(RuleError::Expression(format!("invalid field path '{}'", ident)));
                }
                tokens.push(Lexeme::Ident(ident));
            }
            other => {
                return Err(RuleError::Expression(format!(
                    "unexpected character '{}' in '{}'",
                    other, input
                )));
            }
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Lexeme>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Lexeme> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Lexeme> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn parse_expr(&mut self) -> Result<Expression> {
        let mut left = self.parse_term()?;
        while let Some(Lexeme::Op(c @ ('+' | '-'))) = self.peek() {
            let op = if *c == '+' {
                BinaryOperator::Add
            } else {
                BinaryOperator::Sub
            };
            self.advance();
            let right = self.parse_term()?;
            left = Expression::Binary {
                left: Box::new(left),
                op,
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_term(&mut self) -> Result<Expression> {
        let mut left = self.parse_unary()?;
        while let Some(Lexeme::Op(c @ ('*' | '/' | '%'))) = self.peek() {
            let op = match *c {
                '*' => BinaryOperator::Mul,
                '/' => BinaryOperator::Div,
                _ => BinaryOperator::Mod,
            };
            self.advance();
            let right = self.parse_unary()?;
            left = Expression::Binary {
                left: Box::new(left),
                op,
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expression> {
        if let Some(Lexeme::Op('-')) = self.peek() {
            self.advance();
            let operand = self.parse_unary()?;
            return Ok(match operand {
                Expression::Literal(Value::Number(n)) => match n.as_f64() {
                    Some(f) => Expression::Literal(number_value(-f)),
                    None => Expression::Negate(Box::new(Expression::Literal(Value::Number(n)))),
                },
                other => Expression::Negate(Box::new(other)),
            });
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expression> {
        match self.advance() {
            Some(Lexeme::Number(n)) => Ok(Expression::Literal(number_value(n))),
            Some(Lexeme::Str(s)) => Ok(Expression::Literal(Value::String(s))),
            Some(Lexeme::LParen) => {
                let inner = self.parse_expr()?;
                match self.advance() {
                    Some(Lexeme::RParen) => Ok(inner),
                    _ => Err(RuleError::Expression("missing ')'".to_string())),
                }
            }
            Some(Lexeme::Ident(name)) => {
                if let Some(Lexeme::LParen) = self.peek() {
                    self.advance();
                    return self.parse_call(&name);
                }
                match name.to_ascii_lowercase().as_str() {
                    "true" => Ok(Expression::Literal(Value::Bool(true))),
                    "false" => Ok(Expression::Literal(Value::Bool(false))),
                    "null" => Ok(Expression::Literal(Value::Null)),
                    _ => Ok(Expression::Field(name)),
                }
            }
            Some(other) => Err(RuleError::Expression(format!("unexpected {:?}", other))),
            None => Err(RuleError::Expression("unexpected end of expression".to_string())),
        }
    }

    fn parse_call(&mut self, name: &str) -> Result<Expression> {
        let function = Function::from_name(name)
            .ok_or_else(|| RuleError::Expression(format!("unknown function '{}'", name)))?;

        let mut args = Vec::new();
        if let Some(Lexeme::RParen) = self.peek() {
            self.advance();
        } else {
            loop {
                args.push(self.parse_expr()?);
                match self.advance() {
                    Some(Lexeme::Comma) => continue,
                    Some(Lexeme::RParen) => break,
                    _ => {
                        return Err(RuleError::Expression(format!(
                            "expected ',' or ')' in call to '{}'",
                            name
                        )));
                    }
                }
            }
        }

        let (min, max) = function.arity();
        if args.len() < min || args.len() > max {
            return Err(RuleError::Expression(format!(
                "'{}' takes {} argument(s), got {}",
                name,
                if min == max {
                    min.to_string()
                } else if max == usize::MAX {
                    format!("at least {}", min)
                } else {
                    format!("{} to {}", min, max)
                },
                args.len()
            )));
        }

        Ok(Expression::Call { function, args })
    }
}
