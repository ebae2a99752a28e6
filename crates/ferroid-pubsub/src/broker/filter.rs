//! Subscription filter expressions.
//!
//! Supported grammar, a conjunction of attribute equality tests:
//!
//! ```text
//! filter := clause ("AND" clause)*
//! clause := "(" filter ")" | "attributes." KEY "=" "\"" VALUE "\""
//! ```
//!
//! Quoted values may contain parentheses, `AND` and `\"` escapes.
//!
//! This covers the filters endpoints generate (`attributes.host_id = "..."`,
//! optionally conjoined with a caller-supplied filter).

use crate::common::{Error, Result};
use std::collections::HashMap;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    clauses: Vec<(String, String)>,
}

impl Filter {
    /// Parses a filter expression. An empty expression matches everything.
    ///
    /// Quoted values are taken verbatim, so parentheses and `AND` inside
    /// them are part of the value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the expression is not a conjunction
    /// of `attributes.<key> = "<value>"` tests.
    pub fn parse(expr: &str) -> Result<Self> {
        let tokens = tokenize(expr)?;
        let mut clauses = Vec::new();
        if tokens.is_empty() {
            return Ok(Self { clauses });
        }

        let mut parser = Parser {
            tokens: &tokens,
            pos: 0,
            expr,
        };
        parser.conjunction(&mut clauses)?;
        if parser.pos != tokens.len() {
            return Err(parser.invalid());
        }
        Ok(Self { clauses })
    }

    pub fn matches(&self, attributes: &HashMap<String, String>) -> bool {
        self.clauses
            .iter()
            .all(|(key, value)| attributes.get(key) == Some(value))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Open,
    Close,
    Eq,
    And,
    Word(String),
    Quoted(String),
}

fn invalid(expr: &str) -> Error {
    Error::InvalidConfig {
        reason: format!("unsupported filter expression: {expr}"),
    }
}

fn tokenize(expr: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = expr.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' | ')' | '=' => {
                chars.next();
                tokens.push(match c {
                    '(' => Token::Open,
                    ')' => Token::Close,
                    _ => Token::Eq,
                });
            }
            '"' => {
                chars.next();
                let mut value = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => value.push(chars.next().ok_or_else(|| invalid(expr))?),
                        Some(c) => value.push(c),
                        None => return Err(invalid(expr)),
                    }
                }
                tokens.push(Token::Quoted(value));
            }
            _ => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || matches!(c, '(' | ')' | '=' | '"') {
                        break;
                    }
                    word.push(c);
                    chars.next();
                }
                tokens.push(if word == "AND" {
                    Token::And
                } else {
                    Token::Word(word)
                });
            }
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    expr: &'a str,
}

impl<'a> Parser<'a> {
    fn invalid(&self) -> Error {
        invalid(self.expr)
    }

    fn next(&mut self) -> Option<&'a Token> {
        let token = self.tokens.get(self.pos);
        self.pos += 1;
        token
    }

    fn conjunction(&mut self, clauses: &mut Vec<(String, String)>) -> Result<()> {
        self.clause(clauses)?;
        while self.tokens.get(self.pos) == Some(&Token::And) {
            self.pos += 1;
            self.clause(clauses)?;
        }
        Ok(())
    }

    fn clause(&mut self, clauses: &mut Vec<(String, String)>) -> Result<()> {
        let key = match self.next() {
            Some(Token::Open) => {
                self.conjunction(clauses)?;
                return match self.next() {
                    Some(Token::Close) => Ok(()),
                    _ => Err(self.invalid()),
                };
            }
            Some(Token::Word(word)) => word
                .strip_prefix("attributes.")
                .filter(|k| !k.is_empty())
                .map(str::to_string),
            _ => None,
        }
        .ok_or_else(|| self.invalid())?;

        if self.next() != Some(&Token::Eq) {
            return Err(self.invalid());
        }
        match self.next() {
            Some(Token::Quoted(value)) => {
                clauses.push((key, value.clone()));
                Ok(())
            }
            _ => Err(self.invalid()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn empty_filter_matches_everything() {
        let filter = Filter::parse("").unwrap();
        assert!(filter.matches(&attrs(&[])));
    }

    #[test]
    fn single_clause() {
        let filter = Filter::parse("attributes.host_id = \"abc\"").unwrap();
        assert!(filter.matches(&attrs(&[("host_id", "abc"), ("job_id", "1")])));
        assert!(!filter.matches(&attrs(&[("host_id", "abd")])));
        assert!(!filter.matches(&attrs(&[])));
    }

    #[test]
    fn parenthesized_conjunction() {
        let filter =
            Filter::parse("(attributes.tenant = \"t1\") AND (attributes.host_id = \"abc\")")
                .unwrap();
        assert!(filter.matches(&attrs(&[("tenant", "t1"), ("host_id", "abc")])));
        assert!(!filter.matches(&attrs(&[("tenant", "t2"), ("host_id", "abc")])));
    }

    #[test]
    fn rejects_unsupported_syntax() {
        assert!(Filter::parse("hasPrefix(attributes.x, \"a\")").is_err());
        assert!(Filter::parse("attributes.x = unquoted").is_err());
        assert!(Filter::parse("labels.x = \"a\"").is_err());
        assert!(Filter::parse("attributes.x = \"open").is_err());
        assert!(Filter::parse("(attributes.x = \"a\"").is_err());
        assert!(Filter::parse("attributes.x = \"a\" AND").is_err());
    }

    #[test]
    fn parentheses_inside_quotes_are_part_of_the_value() {
        let filter = Filter::parse("attributes.team = \"core (eu)\"").unwrap();
        assert!(filter.matches(&attrs(&[("team", "core (eu)")])));
        assert!(!filter.matches(&attrs(&[("team", "core  eu ")])));
    }

    #[test]
    fn and_inside_quotes_is_part_of_the_value() {
        let filter =
            Filter::parse("(attributes.q = \"salt AND pepper\") AND (attributes.host_id = \"h\")")
                .unwrap();
        assert!(filter.matches(&attrs(&[("q", "salt AND pepper"), ("host_id", "h")])));
        assert!(!filter.matches(&attrs(&[("q", "salt"), ("host_id", "h")])));
    }

    #[test]
    fn escaped_quote_in_value() {
        let filter = Filter::parse(r#"attributes.x = "say \"hi\"""#).unwrap();
        assert!(filter.matches(&attrs(&[("x", "say \"hi\"")])));
    }
}
