//! Condition scanner.
//!
//! Turns a `WHEN` clause into a flat token stream. Parenthesized text is
//! scanned recursively into [`Token::Group`], bracketed lists into
//! [`Token::List`]. Commas are separators, so `["US", "CA"]` and
//! `("US","CA")` both yield two quoted tokens.

use serde::{Deserialize, Serialize};

use crate::error::{Result, RuleError};

/// A scanned token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Token {
    /// Identifier, operator word or number.
    Word(String),
    /// Quoted string literal with the quotes removed.
    Quoted(String),
    /// Tokens of a parenthesized sub-expression.
    Group(Vec<Token>),
    /// Tokens of a `[...]` list literal.
    List(Vec<Token>),
}

impl Token {
    /// Case-insensitive keyword test on bare words.
    pub fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self, Token::Word(w) if w.eq_ignore_ascii_case(keyword))
    }

    pub fn as_word(&self) -> Option<&str> {
        match self {
            Token::Word(w) => Some(w),
            _ => None,
        }
    }
}

/// Scan condition text into tokens.
pub fn scan(text: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = text.chars().collect();
    let scanner = Scanner { chars: &chars };
    scanner.scan_range(0, chars.len())
}

struct Scanner<'a> {
    chars: &'a [char],
}

impl Scanner<'_> {
    fn scan_range(&self, start: usize, end: usize) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();
        let mut i = start;

        while i < end {
            let c = self.chars[i];
            match c {
                c if c.is_whitespace() || c == ',' => i += 1,
                '(' | '[' => {
                    let close_char = if c == '(' { ')' } else { ']' };
                    let close = self.find_matching(i, end, c, close_char)?;
                    let inner = self.scan_range(i + 1, close)?;
                    tokens.push(if c == '(' {
                        Token::Group(inner)
                    } else {
                        Token::List(inner)
                    });
                    i = close + 1;
                }
                ')' | ']' => {
                    return Err(RuleError::UnbalancedParen {
                        delimiter: c,
                        offset: byte_offset(self.chars, i),
                    });
                }
                '"' | '\'' => {
                    let (literal, next) = self.read_quoted(i, end)?;
                    tokens.push(Token::Quoted(literal));
                    i = next;
                }
                _ => {
                    let word_start = i;
                    while i < end && !is_boundary(self.chars[i]) {
                        i += 1;
                    }
                    tokens.push(Token::Word(self.chars[word_start..i].iter().collect()));
                }
            }
        }

        Ok(tokens)
    }

    /// Find the delimiter closing the one at `open_at`, skipping quoted text.
    fn find_matching(&self, open_at: usize, end: usize, open: char, close: char) -> Result<usize> {
        let mut depth = 0usize;
        let mut i = open_at;
        while i < end {
            let c = self.chars[i];
            if c == '"' || c == '\'' {
                let (_, next) = self.read_quoted(i, end)?;
                i = next;
                continue;
            }
            if c == open {
                depth += 1;
            } else if c == close {
                depth -= 1;
                if depth == 0 {
                    return Ok(i);
                }
            }
            i += 1;
        }
        Err(RuleError::UnbalancedParen {
            delimiter: open,
            offset: byte_offset(self.chars, open_at),
        })
    }

    /// Read a quoted literal starting at `start`; returns the content and the
    /// index just past the closing quote. Backslash escapes the next char.
    fn read_quoted(&self, start: usize, end: usize) -> Result<(String, usize)> {
        let quote = self.chars[start];
        let mut literal = String::new();
        let mut i = start + 1;
        while i < end {
            let c = self.chars[i];
            if c == '\\' && i + 1 < end {
                literal.push(self.chars[i + 1]);
                i += 2;
                continue;
            }
            if c == quote {
                return Ok((literal, i + 1));
            }
            literal.push(c);
            i += 1;
        }
        Err(RuleError::UnterminatedQuote {
            offset: byte_offset(self.chars, start),
        })
    }
}

/// Byte offset in the source text of the char at `index`.
pub(crate) fn byte_offset(chars: &[char], index: usize) -> usize {
    chars[..index.min(chars.len())]
        .iter()
        .map(|c| c.len_utf8())
        .sum()
}

fn is_boundary(c: char) -> bool {
    c.is_whitespace() || matches!(c, '(' | ')' | '[' | ']' | '"' | '\'' | ',')
}

/// Byte offset of `keyword` as a whole word outside quotes, case-insensitive.
pub fn find_keyword(text: &str, keyword: &str) -> Option<usize> {
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
            prev = Some(c);
            continue;
        }
        if c == '"' || c == '\'' {
            quote = Some(c);
            prev = Some(c);
            continue;
        }

        let at_word_start = prev.map_or(true, |p| p.is_whitespace() || p == ')');
        if at_word_start {
            if let Some(candidate) = text.get(i..i + keyword.len()) {
                let after = text[i + keyword.len()..].chars().next();
                let at_word_end = after.map_or(true, |a| a.is_whitespace() || a == '(');
                if at_word_end && candidate.eq_ignore_ascii_case(keyword) {
                    return Some(i);
                }
            }
        }
        prev = Some(c);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(s: &str) -> Token {
        Token::Word(s.to_string())
    }

    #[test]
    fn test_scan_flat_condition() {
        let tokens = scan("order.total > 500").unwrap();
        assert_eq!(tokens, vec![word("order.total"), word(">"), word("500")]);
    }

    #[test]
    fn test_scan_quoted_literal() {
        let tokens = scan(r#"customer.name = "Ann \"Lee\"" AND x = 'y z'"#).unwrap();
        assert_eq!(tokens[2], Token::Quoted("Ann \"Lee\"".to_string()));
        assert_eq!(tokens[6], Token::Quoted("y z".to_string()));
    }

    #[test]
    fn test_scan_nested_groups() {
        let tokens = scan("(a > 1 AND (b < 2 OR c = 3)) OR d").unwrap();
        assert_eq!(tokens.len(), 3);
        match &tokens[0] {
            Token::Group(inner) => {
                assert_eq!(inner.len(), 5);
                assert!(matches!(inner[4], Token::Group(ref g) if g.len() == 7));
            }
            other => panic!("Expected group, got {:?}", other),
        }
        assert!(tokens[1].is_keyword("or"));
    }

    #[test]
    fn test_scan_list_literal() {
        let tokens = scan(r#"order.country IN ["US","CA", 3]"#).unwrap();
        assert_eq!(
            tokens[2],
            Token::List(vec![
                Token::Quoted("US".to_string()),
                Token::Quoted("CA".to_string()),
                word("3"),
            ])
        );
    }

    #[test]
    fn test_scan_paren_inside_quotes() {
        let tokens = scan(r#"(note = "a)b")"#).unwrap();
        assert_eq!(
            tokens,
            vec![Token::Group(vec![
                word("note"),
                word("="),
                Token::Quoted("a)b".to_string())
            ])]
        );
    }

    #[test]
    fn test_scan_unbalanced_paren() {
        assert!(matches!(
            scan("(a > 1"),
            Err(RuleError::UnbalancedParen { delimiter: '(', .. })
        ));
        assert!(matches!(
            scan("a > 1)"),
            Err(RuleError::UnbalancedParen { delimiter: ')', .. })
        ));
        assert!(scan("x IN [1, 2").is_err());
    }

    #[test]
    fn test_scan_unterminated_quote() {
        assert!(matches!(
            scan(r#"name = "open"#),
            Err(RuleError::UnterminatedQuote { offset: 7 })
        ));
        assert!(matches!(
            scan(r#"straße = "open"#),
            Err(RuleError::UnterminatedQuote { offset: 10 })
        ));
        assert!(matches!(
            scan("größe > 1)"),
            Err(RuleError::UnbalancedParen { delimiter: ')', offset: 11 })
        ));
    }

    #[test]
    fn test_find_keyword() {
        assert_eq!(find_keyword("IF NEW order THEN update", "THEN"), Some(13));
        assert_eq!(find_keyword("IF NEW order then", "THEN"), Some(13));
        assert_eq!(find_keyword(r#"x = "THEN" THEN"#, "THEN"), Some(11));
        assert_eq!(find_keyword("AUTHENTICATED = 1", "THEN"), None);
        assert_eq!(find_keyword("order.total > 5", "WHEN"), None);
    }
}
