//! Action line parsing.
//!
//! ```text
//! update order.total = order.total - 50
//! assign order.hash = sha256(order.email)
//! notify entity: audit, channel: "ops team", data: {"id": ${order.id}}
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::error::{Result, RuleError};
use crate::expression::Expression;
use crate::registry::{is_reserved, ActionRegistry};
use crate::scanner::byte_offset;
use crate::template::PayloadTemplate;

/// A parsed, not yet executed action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionSpec {
    /// `update field = expression` (or `assign`).
    Update {
        field: String,
        expression: Expression,
        /// Expression text as written.
        source: String,
    },
    /// A registered named action.
    Command {
        action_type: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        entity: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<PayloadTemplate>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        fields: BTreeMap<String, String>,
    },
}

impl ActionSpec {
    pub fn name(&self) -> &str {
        match self {
            ActionSpec::Update { .. } => "update",
            ActionSpec::Command { action_type, .. } => action_type,
        }
    }
}

/// Parse one action line.
///
/// Returns `Ok(None)` when the action is skipped: an unregistered name outside
/// strict mode.
pub fn parse_action(
    text: &str,
    line: usize,
    registry: &ActionRegistry,
    config: &EngineConfig,
) -> Result<Option<ActionSpec>> {
    let text = text.trim().trim_end_matches(';').trim();
    let (name, rest) = match text.find(char::is_whitespace) {
        Some(pos) => (&text[..pos], text[pos..].trim()),
        None => (text, ""),
    };

    if is_reserved(name) {
        return parse_update(rest, line).map(Some);
    }

    if !registry.contains(name) {
        if config.strict_actions {
            return Err(RuleError::UnknownAction {
                line,
                action: name.to_string(),
            });
        }
        tracing::warn!(line, action = %name, "Skipping unregistered action");
        return Ok(None);
    }

    let (pairs, payload) = match find_data_marker(rest) {
        Some(pos) => (&rest[..pos], Some(rest[pos + DATA_MARKER.len()..].trim())),
        None => (rest, None),
    };

    let mut fields = parse_fields(pairs).map_err(|e| e.at_line(line))?;
    let entity = fields.remove("entity");
    let data = match payload {
        Some(source) if !source.is_empty() => {
            Some(PayloadTemplate::compile(source).map_err(|e| e.at_line(line))?)
        }
        _ => None,
    };

    Ok(Some(ActionSpec::Command {
        action_type: name.to_string(),
        entity,
        data,
        fields,
    }))
}

fn parse_update(rest: &str, line: usize) -> Result<ActionSpec> {
    let invalid = |message: String| RuleError::InvalidUpdate { line, message };

    let Some(eq) = rest.find('=') else {
        return Err(invalid(format!("missing '=' in '{}'", rest)));
    };
    let field = rest[..eq].trim();
    let source = rest[eq + 1..].trim();

    if field.is_empty() || source.is_empty() {
        return Err(invalid("expected '<field> = <expression>'".to_string()));
    }
    if !is_field_path(field) {
        return Err(invalid(format!("invalid field path '{}'", field)));
    }
    let expression = Expression::parse(source).map_err(|e| invalid(e.to_string()))?;

    Ok(ActionSpec::Update {
        field: field.to_string(),
        expression,
        source: source.to_string(),
    })
}

fn is_field_path(path: &str) -> bool {
    path.split('.').all(|segment| {
        !segment.is_empty()
            && segment
                .chars()
                .all(|c| c.is_alphanumeric() || c == '_' || c == '$')
    })
}

const DATA_MARKER: &str = "data:";

/// Byte offset of `data:` outside quotes, at a word boundary.
fn find_data_marker(text: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut prev: Option<char> = None;

    for (i, c) in text.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
        } else if c == '"' || c == '\'' {
            quote = Some(c);
        } else if prev.map_or(true, |p| p.is_whitespace() || p == ',')
            && text[i..].starts_with(DATA_MARKER)
        {
            return Some(i);
        }
        prev = Some(c);
    }
    None
}

/// Parse `key: value` and `key: "quoted value"` pairs. Commas are optional.
fn parse_fields(text: &str) -> Result<BTreeMap<String, String>> {
    let chars: Vec<char> = text.chars().collect();
    let mut fields = BTreeMap::new();
    let mut i = 0;

    let skip_separators = |i: &mut usize| {
        while *i < chars.len() && (chars[*i].is_whitespace() || chars[*i] == ',') {
            *i += 1;
        }
    };

    loop {
        skip_separators(&mut i);
        if i >= chars.len() {
            break;
        }

        let key_start = i;
        while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '-') {
            i += 1;
        }
        let key: String = chars[key_start..i].iter().collect();
        while i < chars.len() && chars[i].is_whitespace() {
            i += 1;
        }
        if key.is_empty() || chars.get(i) != Some(&':') {
            let rest: String = chars[key_start..].iter().collect();
            return Err(RuleError::Parse(format!(
                "expected 'key: value' at '{}'",
                rest.trim()
            )));
        }
        i += 1;
        while i < chars.len() && chars[i].is_whitespace() {
            i += 1;
        }

        let value = match chars.get(i) {
            Some(&q) if q == '"' || q == '\'' => {
                let start = i;
                let mut literal = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => {
                            return Err(RuleError::UnterminatedQuote {
                                offset: byte_offset(&chars, start),
                            })
                        }
                        Some('\\') if i + 1 < chars.len() => {
                            literal.push(chars[i + 1]);
                            i += 2;
                        }
                        Some(&c) if c == q => {
                            i += 1;
                            break;
                        }
                        Some(&c) => {
                            literal.push(c);
                            i += 1;
                        }
                    }
                }
                literal
            }
            _ => {
                let start = i;
                while i < chars.len() && !chars[i].is_whitespace() && chars[i] != ',' {
                    i += 1;
                }
                chars[start..i].iter().collect()
            }
        };

        fields.insert(key, value);
    }

    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn registry() -> ActionRegistry {
        let mut registry = ActionRegistry::with_builtins();
        registry.register_fn("notify", |_, _| Ok(Value::Null)).unwrap();
        registry
    }

    fn parse(text: &str) -> Result<Option<ActionSpec>> {
        parse_action(text, 1, &registry(), &EngineConfig::default())
    }

    #[test]
    fn test_parse_update() {
        match parse("update order.total = order.total - 50").unwrap() {
            Some(ActionSpec::Update { field, source, .. }) => {
                assert_eq!(field, "order.total");
                assert_eq!(source, "order.total - 50");
            }
            other => panic!("Expected update, got {:?}", other),
        }
        assert!(matches!(
            parse("ASSIGN order.hash = sha256(order.email);").unwrap(),
            Some(ActionSpec::Update { .. })
        ));
    }

    #[test]
    fn test_invalid_update_is_fatal() {
        for text in [
            "update order.total",
            "update = 5",
            "update order.total =",
            "update order..total = 1",
            "update order.total = exec('rm')",
        ] {
            assert!(
                matches!(parse(text), Err(RuleError::InvalidUpdate { line: 1, .. })),
                "Expected InvalidUpdate for: {}",
                text
            );
        }
    }

    #[test]
    fn test_parse_command_with_fields_and_data() {
        let spec = parse(
            r#"notify entity: audit, channel: "ops team" priority:high data: {"id": ${order.id}}"#,
        )
        .unwrap();
        match spec {
            Some(ActionSpec::Command {
                action_type,
                entity,
                data,
                fields,
            }) => {
                assert_eq!(action_type, "notify");
                assert_eq!(entity.as_deref(), Some("audit"));
                assert_eq!(fields.get("channel").map(String::as_str), Some("ops team"));
                assert_eq!(fields.get("priority").map(String::as_str), Some("high"));
                let rendered = data.unwrap().render(&json!({"order": {"id": 9}})).unwrap();
                assert_eq!(rendered, json!({"id": 9}));
            }
            other => panic!("Expected command, got {:?}", other),
        }
    }

    #[test]
    fn test_data_marker_inside_quotes_is_ignored() {
        match parse(r#"log message: "data: none""#).unwrap() {
            Some(ActionSpec::Command { data, fields, .. }) => {
                assert!(data.is_none());
                assert_eq!(fields.get("message").map(String::as_str), Some("data: none"));
            }
            other => panic!("Expected command, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_action() {
        assert!(parse("sendSms to: 123").unwrap().is_none());

        let strict = EngineConfig::default().with_strict_actions(true);
        assert!(matches!(
            parse_action("sendSms to: 123", 4, &registry(), &strict),
            Err(RuleError::UnknownAction { line: 4, .. })
        ));
    }

    #[test]
    fn test_malformed_fields() {
        assert!(parse("notify just words").is_err());
        assert!(parse(r#"notify message: "open"#).is_err());
    }
}
