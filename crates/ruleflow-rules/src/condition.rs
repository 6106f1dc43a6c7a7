//! Condition AST.
//!
//! A `WHEN` clause compiles into a [`ConditionNode`]: either a single
//! comparison leaf or a group of nodes separated by `AND`/`OR` connectors.
//!
//! Connectors have equal weight. A group is folded strictly left to right,
//! so `a AND b OR c` means `(a AND b) OR c` and `a OR b AND c` means
//! `(a OR b) AND c`. Parentheses are the only grouping mechanism.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, RuleError};
use crate::scanner::{self, Token};
use crate::value::{as_number, get_path, is_truthy, loose_eq, parse_literal, to_display};

/// Comparison operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    Equal,
    NotEqual,
    GreaterThan,
    LessThan,
    GreaterEqual,
    LessEqual,
    Contains,
    In,
    IsNull,
    IsNotNull,
    /// Symbolic operator the engine does not know; always evaluates false.
    Unknown(String),
}

impl Operator {
    /// Operators written as a single token.
    fn from_word(word: &str) -> Option<Self> {
        match word.to_ascii_uppercase().as_str() {
            "=" | "==" => Some(Self::Equal),
            "!=" | "<>" => Some(Self::NotEqual),
            ">" => Some(Self::GreaterThan),
            "<" => Some(Self::LessThan),
            ">=" => Some(Self::GreaterEqual),
            "<=" => Some(Self::LessEqual),
            "CONTAINS" => Some(Self::Contains),
            "IN" => Some(Self::In),
            _ => None,
        }
    }

    /// A word made only of symbol characters, like `>>` or `=~`.
    fn is_symbolic(word: &str) -> bool {
        !word.is_empty()
            && word
                .chars()
                .all(|c| !c.is_alphanumeric() && !matches!(c, '_' | '.' | '$'))
    }

    /// Get operator as string.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Equal => "=",
            Self::NotEqual => "!=",
            Self::GreaterThan => ">",
            Self::LessThan => "<",
            Self::GreaterEqual => ">=",
            Self::LessEqual => "<=",
            Self::Contains => "CONTAINS",
            Self::In => "IN",
            Self::IsNull => "IS NULL",
            Self::IsNotNull => "IS NOT NULL",
            Self::Unknown(symbol) => symbol,
        }
    }

    /// Compare an actual record value (`None` when the path is missing)
    /// against the literal from the rule.
    pub fn evaluate(&self, actual: Option<&Value>, expected: &Value) -> bool {
        let actual_value = actual.unwrap_or(&Value::Null);
        match self {
            Self::Equal => loose_eq(actual_value, expected),
            Self::NotEqual => !loose_eq(actual_value, expected),
            Self::GreaterThan => compare(actual_value, expected, |a, b| a > b),
            Self::LessThan => compare(actual_value, expected, |a, b| a < b),
            Self::GreaterEqual => compare(actual_value, expected, |a, b| a >= b),
            Self::LessEqual => compare(actual_value, expected, |a, b| a <= b),
            Self::Contains => {
                if actual_value.is_null() {
                    return false;
                }
                stringify(actual_value).contains(&to_display(expected))
            }
            Self::In => match expected {
                Value::Array(items) => items.iter().any(|item| loose_eq(actual_value, item)),
                other => loose_eq(actual_value, other),
            },
            Self::IsNull => actual_value.is_null(),
            Self::IsNotNull => !actual_value.is_null(),
            Self::Unknown(_) => false,
        }
    }
}

fn compare(actual: &Value, expected: &Value, cmp: impl Fn(f64, f64) -> bool) -> bool {
    match (as_number(actual), as_number(expected)) {
        (Some(a), Some(b)) => cmp(a, b),
        _ => false,
    }
}

/// Arrays stringify as their comma-joined elements, like `String(array)`.
fn stringify(value: &Value) -> String {
    match value {
        Value::Array(items) => items
            .iter()
            .map(stringify)
            .collect::<Vec<_>>()
            .join(","),
        other => to_display(other),
    }
}

/// Logical connector between group items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Connector {
    And,
    Or,
}

/// A single comparison: `field op value`.
///
/// `operator` is `None` for a bare field reference, which tests truthiness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub operator: Option<Operator>,
    /// Literal right-hand side; an array for `IN`, `null` for `IS [NOT] NULL`.
    pub value: Value,
}

impl Condition {
    pub fn evaluate(&self, record: &Value) -> bool {
        let actual = get_path(record, &self.field);
        match &self.operator {
            Some(Operator::Unknown(symbol)) => {
                tracing::warn!(
                    field = %self.field,
                    operator = %symbol,
                    "Unknown condition operator"
                );
                false
            }
            Some(op) => op.evaluate(actual, &self.value),
            None => actual.map_or(false, is_truthy),
        }
    }
}

/// An item of a condition group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GroupItem {
    Node(ConditionNode),
    Connector(Connector),
}

/// Compiled condition tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConditionNode {
    Leaf(Condition),
    /// Alternating nodes and connectors. An empty group is vacuously true.
    Group(Vec<GroupItem>),
}

impl Default for ConditionNode {
    fn default() -> Self {
        ConditionNode::Group(Vec::new())
    }
}

impl ConditionNode {
    /// Scan and build a condition from `WHEN` text. Empty text matches everything.
    pub fn parse(text: &str) -> Result<Self> {
        build(scanner::scan(text)?)
    }

    /// Evaluate against a record, short-circuiting where the fold allows it.
    pub fn evaluate(&self, record: &Value) -> bool {
        match self {
            ConditionNode::Leaf(condition) => condition.evaluate(record),
            ConditionNode::Group(items) => {
                let mut result: Option<bool> = None;
                let mut pending: Option<Connector> = None;
                for item in items {
                    match item {
                        GroupItem::Connector(connector) => pending = Some(*connector),
                        GroupItem::Node(node) => {
                            result = Some(match (result, pending.take()) {
                                (None, _) => node.evaluate(record),
                                (Some(acc), Some(Connector::Or)) => acc || node.evaluate(record),
                                (Some(acc), _) => acc && node.evaluate(record),
                            });
                        }
                    }
                }
                result.unwrap_or(true)
            }
        }
    }

    /// Whether this is the empty (always true) condition.
    pub fn is_empty(&self) -> bool {
        matches!(self, ConditionNode::Group(items) if items.is_empty())
    }

    /// All field paths referenced by this condition.
    pub fn referenced_fields(&self) -> Vec<String> {
        match self {
            ConditionNode::Leaf(condition) => vec![condition.field.clone()],
            ConditionNode::Group(items) => items
                .iter()
                .filter_map(|item| match item {
                    GroupItem::Node(node) => Some(node.referenced_fields()),
                    GroupItem::Connector(_) => None,
                })
                .flatten()
                .collect(),
        }
    }
}

/// Build a condition tree from scanned tokens.
pub fn build(tokens: Vec<Token>) -> Result<ConditionNode> {
    let mut items: Vec<GroupItem> = Vec::new();
    let mut iter = tokens.into_iter().peekable();

    while let Some(token) = iter.next() {
        let expects_node = matches!(items.last(), None | Some(GroupItem::Connector(_)));

        if token.is_keyword("AND") || token.is_keyword("OR") {
            if expects_node {
                return Err(RuleError::Parse(format!(
                    "dangling connector '{}'",
                    token.as_word().unwrap_or_default()
                )));
            }
            let connector = if token.is_keyword("AND") {
                Connector::And
            } else {
                Connector::Or
            };
            items.push(GroupItem::Connector(connector));
            continue;
        }

        if !expects_node {
            return Err(RuleError::Parse(format!(
                "expected AND or OR before {}",
                describe(&token)
            )));
        }

        let node = match token {
            Token::Group(inner) => build(inner)?,
            Token::Word(field) | Token::Quoted(field) => {
                ConditionNode::Leaf(parse_leaf(field, &mut iter)?)
            }
            Token::List(_) => {
                return Err(RuleError::Parse(
                    "list literal is only valid after IN".to_string(),
                ));
            }
        };
        items.push(GroupItem::Node(node));
    }

    if let Some(GroupItem::Connector(_)) = items.last() {
        return Err(RuleError::Parse("condition ends with a connector".to_string()));
    }

    if items.len() == 1 {
        if let Some(GroupItem::Node(node)) = items.pop() {
            return Ok(node);
        }
    }
    Ok(ConditionNode::Group(items))
}

fn parse_leaf<I>(field: String, iter: &mut std::iter::Peekable<I>) -> Result<Condition>
where
    I: Iterator<Item = Token>,
{
    let is_null_check = iter.peek().map_or(false, |t| t.is_keyword("IS"));
    if is_null_check {
        iter.next();
        let operator = match iter.next() {
            Some(t) if t.is_keyword("NULL") => Operator::IsNull,
            Some(t) if t.is_keyword("NOT") => match iter.next() {
                Some(t) if t.is_keyword("NULL") => Operator::IsNotNull,
                _ => {
                    return Err(RuleError::Parse(format!(
                        "expected NULL after '{} IS NOT'",
                        field
                    )));
                }
            },
            _ => {
                return Err(RuleError::Parse(format!(
                    "expected NULL or NOT NULL after '{} IS'",
                    field
                )));
            }
        };
        return Ok(Condition {
            field,
            operator: Some(operator),
            value: Value::Null,
        });
    }

    let next_word = iter.peek().and_then(Token::as_word).map(str::to_string);
    let operator = match next_word.as_deref().and_then(Operator::from_word) {
        Some(op) => op,
        None if next_word.as_deref().map_or(false, Operator::is_symbolic) => {
            iter.next();
            let symbol = next_word.unwrap_or_default();
            return Ok(Condition {
                field,
                operator: Some(Operator::Unknown(symbol)),
                value: unknown_operand(iter),
            });
        }
        None => {
            return Ok(Condition {
                field,
                operator: None,
                value: Value::Null,
            });
        }
    };
    iter.next();

    let value = match (&operator, iter.next()) {
        (Operator::In, Some(Token::List(items))) | (Operator::In, Some(Token::Group(items))) => {
            Value::Array(items.into_iter().map(list_literal).collect::<Result<_>>()?)
        }
        (Operator::In, _) => {
            return Err(RuleError::Parse(format!(
                "IN on '{}' expects a [..] or (..) list",
                field
            )));
        }
        (_, Some(Token::Word(word))) => parse_literal(&word),
        (_, Some(Token::Quoted(text))) => Value::String(text),
        (op, _) => {
            return Err(RuleError::Parse(format!(
                "missing value after '{} {}'",
                field,
                op.as_str()
            )));
        }
    };

    Ok(Condition {
        field,
        operator: Some(operator),
        value,
    })
}

/// Right-hand side of an unknown operator, kept only for display.
fn unknown_operand<I>(iter: &mut std::iter::Peekable<I>) -> Value
where
    I: Iterator<Item = Token>,
{
    if iter
        .peek()
        .map_or(true, |t| t.is_keyword("AND") || t.is_keyword("OR"))
    {
        return Value::Null;
    }
    match iter.next() {
        Some(Token::Word(word)) => parse_literal(&word),
        Some(Token::Quoted(text)) => Value::String(text),
        Some(Token::List(items)) | Some(Token::Group(items)) => Value::Array(
            items
                .into_iter()
                .filter_map(|item| list_literal(item).ok())
                .collect(),
        ),
        None => Value::Null,
    }
}

fn list_literal(token: Token) -> Result<Value> {
    match token {
        Token::Word(word) => Ok(parse_literal(&word)),
        Token::Quoted(text) => Ok(Value::String(text)),
        other => Err(RuleError::Parse(format!(
            "nested {} inside IN list",
            describe(&other)
        ))),
    }
}

fn describe(token: &Token) -> String {
    match token {
        Token::Word(w) => format!("'{}'", w),
        Token::Quoted(q) => format!("\"{}\"", q),
        Token::Group(_) => "parenthesized group".to_string(),
        Token::List(_) => "list literal".to_string(),
    }
}

impl fmt::Display for ConditionNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionNode::Leaf(c) => match &c.operator {
                None => write!(f, "{}", c.field),
                Some(op @ (Operator::IsNull | Operator::IsNotNull)) => {
                    write!(f, "{} {}", c.field, op.as_str())
                }
                Some(op) => write!(f, "{} {} {}", c.field, op.as_str(), c.value),
            },
            ConditionNode::Group(items) => {
                let parts: Vec<String> = items
                    .iter()
                    .map(|item| match item {
                        GroupItem::Node(node @ ConditionNode::Group(_)) => format!("({})", node),
                        GroupItem::Node(node) => node.to_string(),
                        GroupItem::Connector(Connector::And) => "AND".to_string(),
                        GroupItem::Connector(Connector::Or) => "OR".to_string(),
                    })
                    .collect();
                write!(f, "{}", parts.join(" "))
            }
        }
    }
}
