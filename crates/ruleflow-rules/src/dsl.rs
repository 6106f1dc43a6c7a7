//! Rule DSL parser.
//!
//! A DSL source binds rules to a data store and declares them one after another:
//!
//! ```text
//! # Discounts
//! WITH postgres main DO
//!
//! IF NEW order WHEN order.total > 500 THEN
//!     update order.total = order.total - 50
//! ELSE IF order.total > 100
//!     update order.discount = 5
//! ELSE
//!     log message: "no discount"
//!
//! IF GETOUT customer WHEN (customer.vip = true OR customer.spent >= 1000) AND customer.region IN ["US", "CA"] THEN
//!     update customer.badge = "gold"
//! ```
//!
//! Lines starting with `#` and blank lines are ignored. A `WITH <dbType>
//! <dbConnection> DO` line applies to every rule that follows it until the next
//! `WITH`. A rule runs from its `IF` line up to the next `IF` or `WITH`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::action::{parse_action, ActionSpec};
use crate::condition::ConditionNode;
use crate::config::EngineConfig;
use crate::engine::RuleId;
use crate::error::{Result, RuleError};
use crate::registry::ActionRegistry;
use crate::scanner::find_keyword;

/// Data store binding from a `WITH ... DO` line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbConfig {
    pub db_type: String,
    pub db_connection: String,
}

/// Processing direction carried by the `GETIN`/`GETOUT` event pseudonyms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

/// Upper-case an event name and split `GETIN`/`GETOUT` into `GET` plus a direction.
pub fn normalize_event(raw: &str) -> (String, Option<Direction>) {
    let upper = raw.trim().to_ascii_uppercase();
    match upper.as_str() {
        "GETIN" => ("GET".to_string(), Some(Direction::In)),
        "GETOUT" => ("GET".to_string(), Some(Direction::Out)),
        _ => (upper, None),
    }
}

/// An `ELSE IF` branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElseIfBlock {
    pub conditions: ConditionNode,
    pub actions: Vec<ActionSpec>,
}

/// Which branch of a rule fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Branch {
    Then,
    /// Index into [`Rule::else_ifs`].
    ElseIf(usize),
    Else,
}

/// A compiled rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: RuleId,
    /// 1-based line of the `IF`.
    pub line: usize,
    pub event_type: String,
    pub entity: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,
    pub conditions: ConditionNode,
    pub then_actions: Vec<ActionSpec>,
    #[serde(default)]
    pub else_ifs: Vec<ElseIfBlock>,
    #[serde(default)]
    pub else_actions: Vec<ActionSpec>,
    pub db_config: DbConfig,
}

impl Rule {
    /// Total number of actions over all branches.
    pub fn action_count(&self) -> usize {
        self.then_actions.len()
            + self.else_ifs.iter().map(|b| b.actions.len()).sum::<usize>()
            + self.else_actions.len()
    }

    /// Pick the branch to run for `record`: `THEN` if the condition holds,
    /// else the first matching `ELSE IF`, else a non-empty `ELSE`.
    pub fn select_branch(&self, record: &Value) -> Option<(Branch, &[ActionSpec])> {
        if self.conditions.evaluate(record) {
            return Some((Branch::Then, &self.then_actions));
        }
        for (index, block) in self.else_ifs.iter().enumerate() {
            if block.conditions.evaluate(record) {
                return Some((Branch::ElseIf(index), &block.actions));
            }
        }
        if self.else_actions.is_empty() {
            None
        } else {
            Some((Branch::Else, &self.else_actions))
        }
    }
}

/// Compiles DSL source into rules.
///
/// The registry decides which named actions exist and the config decides
/// whether unknown entities and actions are fatal.
pub struct RuleParser<'a> {
    registry: &'a ActionRegistry,
    config: &'a EngineConfig,
}

/// A non-comment line with its 1-based number.
#[derive(Debug, Clone, Copy)]
struct SourceLine<'s> {
    number: usize,
    text: &'s str,
}

impl<'a> RuleParser<'a> {
    pub fn new(registry: &'a ActionRegistry, config: &'a EngineConfig) -> Self {
        Self { registry, config }
    }

    /// Parse a whole DSL source. Any compile-time error aborts the parse.
    pub fn parse(&self, source: &str) -> Result<Vec<Rule>> {
        let lines: Vec<SourceLine<'_>> = source
            .lines()
            .enumerate()
            .map(|(i, text)| SourceLine {
                number: i + 1,
                text: text.trim(),
            })
            .filter(|l| !l.text.is_empty() && !l.text.starts_with('#'))
            .collect();

        if !lines.iter().any(|l| strip_keyword(l.text, "WITH").is_some()) {
            let line = lines.first().map_or(1, |l| l.number);
            return Err(RuleError::MissingDbBinding { line });
        }

        let mut rules = Vec::new();
        let mut current_db: Option<DbConfig> = None;
        let mut i = 0;

        while i < lines.len() {
            let line = lines[i];

            if let Some(rest) = strip_keyword(line.text, "WITH") {
                current_db = Some(parse_with(rest, line.number)?);
                i += 1;
                continue;
            }

            if strip_keyword(line.text, "IF").is_none() {
                return Err(RuleError::Parse(format!(
                    "line {}: expected IF or WITH, found '{}'",
                    line.number, line.text
                )));
            }

            let Some(db) = current_db.as_ref() else {
                return Err(RuleError::MissingDbBinding { line: line.number });
            };

            let end = lines[i + 1..]
                .iter()
                .position(|l| is_block_start(l.text))
                .map_or(lines.len(), |offset| i + 1 + offset);

            if let Some(rule) = self.parse_block(&lines[i..end], db)? {
                rules.push(rule);
            }
            i = end;
        }

        Ok(rules)
    }

    fn parse_block(&self, block: &[SourceLine<'_>], db: &DbConfig) -> Result<Option<Rule>> {
        let first_line = block[0].number;

        // The header may span lines up to the first THEN.
        let mut header = String::new();
        let mut then_at = None;
        for (index, line) in block.iter().enumerate() {
            if !header.is_empty() {
                header.push(' ');
            }
            header.push_str(line.text);
            if let Some(pos) = find_keyword(&header, "THEN") {
                then_at = Some((index, pos));
                break;
            }
        }
        let Some((header_end, then_pos)) = then_at else {
            return Err(RuleError::MissingThen { line: first_line });
        };

        let inline_action = header[then_pos + "THEN".len()..].trim().to_string();
        let (event_type, direction, entity, conditions) =
            parse_header(header[..then_pos].trim(), first_line)?;

        let mut then_actions = Vec::new();
        let mut else_ifs: Vec<ElseIfBlock> = Vec::new();
        let mut else_actions = Vec::new();
        let mut in_else = false;

        let header_line = block[header_end].number;
        let mut body: Vec<(usize, String)> = Vec::new();
        if !inline_action.is_empty() {
            body.push((header_line, inline_action));
        }
        body.extend(
            block[header_end + 1..]
                .iter()
                .map(|l| (l.number, l.text.to_string())),
        );

        for (number, text) in body {
            if let Some(rest) = strip_keyword(&text, "ELSE") {
                if in_else {
                    return Err(RuleError::MalformedIf {
                        line: number,
                        message: "branch after ELSE".to_string(),
                    });
                }

                if let Some(condition_text) = strip_keyword(rest, "IF") {
                    let (condition_text, inline) = match find_keyword(condition_text, "THEN") {
                        Some(pos) => (
                            condition_text[..pos].trim(),
                            condition_text[pos + "THEN".len()..].trim(),
                        ),
                        None => (condition_text, ""),
                    };
                    if condition_text.is_empty() {
                        return Err(RuleError::MalformedIf {
                            line: number,
                            message: "ELSE IF without a condition".to_string(),
                        });
                    }
                    let conditions =
                        ConditionNode::parse(condition_text).map_err(|e| e.at_line(number))?;
                    let mut actions = Vec::new();
                    if !inline.is_empty() {
                        actions.extend(self.action(inline, number)?);
                    }
                    else_ifs.push(ElseIfBlock {
                        conditions,
                        actions,
                    });
                } else {
                    in_else = true;
                    if !rest.is_empty() {
                        else_actions.extend(self.action(rest, number)?);
                    }
                }
                continue;
            }

            let action = self.action(&text, number)?;
            if in_else {
                else_actions.extend(action);
            } else if let Some(branch) = else_ifs.last_mut() {
                branch.actions.extend(action);
            } else {
                then_actions.extend(action);
            }
        }

        if !self.config.is_known_entity(&entity) {
            if self.config.strict_entities {
                return Err(RuleError::UnknownEntity {
                    line: first_line,
                    entity,
                });
            }
            tracing::warn!(line = first_line, entity = %entity, "Dropping rule for unknown entity");
            return Ok(None);
        }

        let rule = Rule {
            id: RuleId::new(),
            line: first_line,
            event_type,
            entity,
            direction,
            conditions,
            then_actions,
            else_ifs,
            else_actions,
            db_config: db.clone(),
        };

        if rule.action_count() == 0 {
            tracing::warn!(line = first_line, entity = %rule.entity, "Dropping rule without actions");
            return Ok(None);
        }

        tracing::debug!(
            line = first_line,
            event = %rule.event_type,
            entity = %rule.entity,
            actions = rule.action_count(),
            "Parsed rule"
        );
        Ok(Some(rule))
    }

    fn action(&self, text: &str, line: usize) -> Result<Option<ActionSpec>> {
        parse_action(text, line, self.registry, self.config)
    }
}

/// `IF <event> <entity> [WHEN <condition>]` without the trailing THEN.
fn parse_header(
    header: &str,
    line: usize,
) -> Result<(String, Option<Direction>, String, ConditionNode)> {
    let malformed = |message: &str| RuleError::MalformedIf {
        line,
        message: message.to_string(),
    };

    let rest = strip_keyword(header, "IF").ok_or_else(|| malformed("expected IF"))?;
    let (target, condition_text) = match find_keyword(rest, "WHEN") {
        Some(pos) => (rest[..pos].trim(), Some(rest[pos + "WHEN".len()..].trim())),
        None => (rest.trim(), None),
    };

    let words: Vec<&str> = target.split_whitespace().collect();
    let [event, entity] = words.as_slice() else {
        return Err(malformed("expected 'IF <EVENT> <entity>'"));
    };
    if !event.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return Err(malformed(&format!("invalid event '{}'", event)));
    }
    if !entity
        .chars()
        .all(|c| c.is_alphanumeric() || matches!(c, '_' | '/' | ':'))
    {
        return Err(malformed(&format!("invalid entity '{}'", entity)));
    }

    let conditions = match condition_text {
        Some("") => return Err(malformed("WHEN without a condition")),
        Some(text) => ConditionNode::parse(text).map_err(|e| e.at_line(line))?,
        None => ConditionNode::default(),
    };

    let (event_type, direction) = normalize_event(event);
    Ok((event_type, direction, entity.to_string(), conditions))
}

/// `WITH <dbType> <dbConnection> DO`
fn parse_with(rest: &str, line: usize) -> Result<DbConfig> {
    let malformed = |message: &str| RuleError::MalformedWith {
        line,
        message: message.to_string(),
    };

    let words: Vec<&str> = rest.split_whitespace().collect();
    let Some((last, body)) = words.split_last() else {
        return Err(malformed("expected 'WITH <dbType> <dbConnection> DO'"));
    };
    if !last.eq_ignore_ascii_case("DO") {
        return Err(malformed("missing DO"));
    }
    let [db_type, connection @ ..] = body else {
        return Err(malformed("missing database type"));
    };
    if connection.is_empty() {
        return Err(malformed("missing database connection"));
    }

    let connection = connection.join(" ");
    let connection = connection
        .strip_prefix('"')
        .and_then(|c| c.strip_suffix('"'))
        .unwrap_or(&connection);

    Ok(DbConfig {
        db_type: db_type.to_string(),
        db_connection: connection.to_string(),
    })
}

/// If `text` starts with `keyword` as a whole word, return what follows.
fn strip_keyword<'t>(text: &'t str, keyword: &str) -> Option<&'t str> {
    let head = text.get(..keyword.len())?;
    if !head.eq_ignore_ascii_case(keyword) {
        return None;
    }
    let rest = &text[keyword.len()..];
    match rest.chars().next() {
        None => Some(""),
        Some(c) if c.is_whitespace() => Some(rest.trim_start()),
        _ => None,
    }
}

fn is_block_start(text: &str) -> bool {
    strip_keyword(text, "IF").is_some() || strip_keyword(text, "WITH").is_some()
}
