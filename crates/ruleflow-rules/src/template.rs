//! `data:` payload templates with `${expr}` placeholders.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, RuleError};
use crate::expression::Expression;
use crate::value::to_display;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Segment {
    Text(String),
    Placeholder {
        expression: Expression,
        /// Quote character of the enclosing string literal, if any.
        quote: Option<char>,
    },
}

/// A compiled payload template.
///
/// Rendering produces JSON. Object keys may be left unquoted and strings may
/// use single quotes (`{to: 'ops', id: ${order.id}}`). Text that still does not
/// parse as JSON is passed through as a JSON string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl PayloadTemplate {
    pub fn compile(source: &str) -> Result<Self> {
        let chars: Vec<char> = source.chars().collect();
        let mut segments = Vec::new();
        let mut text = String::new();
        let mut quote: Option<char> = None;
        let mut i = 0;

        while i < chars.len() {
            let c = chars[i];

            if c == '$' && chars.get(i + 1) == Some(&'{') {
                let close = find_placeholder_end(&chars, i + 2).ok_or_else(|| {
                    RuleError::Expression(format!("unclosed '${{' in payload '{}'", source))
                })?;
                let inner: String = chars[i + 2..close].iter().collect();
                let expression = Expression::parse(inner.trim())?;
                if !text.is_empty() {
                    segments.push(Segment::Text(std::mem::take(&mut text)));
                }
                segments.push(Segment::Placeholder {
                    expression,
                    quote,
                });
                i = close + 1;
                continue;
            }

            match quote {
                Some(_) if c == '\\' => {
                    text.push(c);
                    if let Some(next) = chars.get(i + 1) {
                        text.push(*next);
                        i += 1;
                    }
                }
                Some(q) if c == q => {
                    quote = None;
                    text.push(c);
                }
                None if c == '"' || c == '\'' => {
                    quote = Some(c);
                    text.push(c);
                }
                _ => text.push(c),
            }
            i += 1;
        }

        if !text.is_empty() {
            segments.push(Segment::Text(text));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn has_placeholders(&self) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, Segment::Placeholder { .. }))
    }

    /// Render against a record. Placeholder evaluation errors are returned.
    pub fn render(&self, record: &Value) -> Result<Value> {
        let mut rendered = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => rendered.push_str(text),
                Segment::Placeholder { expression, quote } => {
                    let value = expression.evaluate(record)?;
                    match quote {
                        Some(q) => {
                            let escaped =
                                serde_json::to_string(&Value::String(to_display(&value)))?;
                            let inner = &escaped[1..escaped.len() - 1];
                            if *q == '\'' {
                                rendered.push_str(&inner.replace('\'', "\\'"));
                            } else {
                                rendered.push_str(inner);
                            }
                        }
                        None => rendered.push_str(&serde_json::to_string(&value)?),
                    }
                }
            }
        }

        if let Ok(value) = serde_json::from_str::<Value>(&rendered) {
            return Ok(value);
        }
        if let Ok(value) = serde_json::from_str::<Value>(&relax_json(&rendered)) {
            return Ok(value);
        }
        Ok(Value::String(rendered))
    }
}

/// Index of the `}` closing a placeholder whose body starts at `start`.
fn find_placeholder_end(chars: &[char], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut i = start;
    while i < chars.len() {
        let c = chars[i];
        match quote {
            Some(_) if c == '\\' => i += 1,
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None => match c {
                '"' | '\'' => quote = Some(c),
                '{' => depth += 1,
                '}' if depth == 0 => return Some(i),
                '}' => depth -= 1,
                _ => {}
            },
        }
        i += 1;
    }
    None
}

/// Rewrite object-literal shorthand into JSON: quote bare keys and turn
/// single-quoted strings into double-quoted ones.
fn relax_json(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len() + 16);
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '"' | '\'' => {
                out.push('"');
                i += 1;
                while i < chars.len() && chars[i] != c {
                    if chars[i] == '\\' && i + 1 < chars.len() {
                        if chars[i + 1] == '\'' {
                            out.push('\'');
                        } else {
                            out.push('\\');
                            out.push(chars[i + 1]);
                        }
                        i += 2;
                        continue;
                    }
                    if chars[i] == '"' {
                        out.push('\\');
                    }
                    out.push(chars[i]);
                    i += 1;
                }
                out.push('"');
                i += 1;
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '$')) {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                let mut j = i;
                while j < chars.len() && chars[j].is_whitespace() {
                    j += 1;
                }
                if chars.get(j) == Some(&':') {
                    out.push('"');
                    out.push_str(&word);
                    out.push('"');
                } else {
                    out.push_str(&word);
                }
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }

    out
}
