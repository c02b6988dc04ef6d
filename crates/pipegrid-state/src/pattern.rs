//! Dot-separated key patterns.
//!
//! `*` matches exactly one token, a trailing `>` matches one or more
//! tokens, anything else matches literally.

use std::fmt;

use crate::error::{StateError, StateResult};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(String),
    Any,
    Tail,
}

/// A compiled key pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPattern {
    raw: String,
    tokens: Vec<Token>,
}

impl KeyPattern {
    /// Compile a pattern such as `acme.pipeline.*.version.*`.
    pub fn parse(pattern: &str) -> StateResult<Self> {
        let parts: Vec<&str> = pattern.split('.').collect();
        let mut tokens = Vec::with_capacity(parts.len());

        for (i, part) in parts.iter().enumerate() {
            let token = match *part {
                "*" => Token::Any,
                ">" if i == parts.len() - 1 => Token::Tail,
                ">" => {
                    return Err(StateError::InvalidKey(format!(
                        "'>' must be the last token in {pattern:?}"
                    )));
                }
                literal if is_valid_token(literal) => Token::Literal(literal.to_string()),
                _ => {
                    return Err(StateError::InvalidKey(format!(
                        "invalid token {part:?} in pattern {pattern:?}"
                    )));
                }
            };
            tokens.push(token);
        }

        Ok(Self {
            raw: pattern.to_string(),
            tokens,
        })
    }

    /// Whether a concrete key matches this pattern.
    pub fn matches(&self, key: &str) -> bool {
        let mut parts = key.split('.');
        for token in &self.tokens {
            match token {
                Token::Tail => return parts.next().is_some(),
                Token::Any => {
                    if parts.next().is_none() {
                        return false;
                    }
                }
                Token::Literal(lit) => match parts.next() {
                    Some(part) if part == lit => {}
                    _ => return false,
                },
            }
        }
        parts.next().is_none()
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// A single key token: non-empty, no dots, wildcards or whitespace.
pub fn is_valid_token(token: &str) -> bool {
    !token.is_empty()
        && !token
            .chars()
            .any(|c| c == '.' || c == '*' || c == '>' || c.is_whitespace())
}

/// Validate a concrete (wildcard-free) key.
pub fn validate_key(key: &str) -> StateResult<()> {
    if key.split('.').all(is_valid_token) {
        Ok(())
    } else {
        Err(StateError::InvalidKey(key.to_string()))
    }
}
