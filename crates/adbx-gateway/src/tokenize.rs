//! Tokenization engine: opaque placeholders for sensitive cell values.
//!
//! A token reads `tok_<connection>_<generation>_<index>`. Each connection
//! owns one `TokenMapping`:
//!
//! - an append-only arena of `{column, value}` entries; a token's index is its
//!   arena position
//! - in deterministic mode, a `value -> index` dictionary so equal values
//!   share a token
//!
//! Randomized mode never keeps the dictionary: every call allocates a new
//! index, so two tokens say nothing about whether their values were equal.
//! The arena is kept in both modes so the gateway can bind a token back to
//! its value inside the broker. Values never leave through this module.
//!
//! `reset` bumps the generation and empties both structures. Tokens from an
//! older generation then fail to resolve.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use adbx_core::config::TokenMode;

pub const TOKEN_PREFIX: &str = "tok_";

/// Parsed token text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub connection: String,
    pub generation: u32,
    pub index: u32,
}

impl Token {
    /// Parse from the right: the connection name may itself contain `_`.
    pub fn parse(text: &str) -> Result<Self, TokenError> {
        let body = text.strip_prefix(TOKEN_PREFIX).ok_or(TokenError::Malformed)?;
        let mut parts = body.rsplitn(3, '_');
        let index = parse_counter(parts.next())?;
        let generation = parse_counter(parts.next())?;
        let connection = parts.next().filter(|c| !c.is_empty()).ok_or(TokenError::Malformed)?;
        Ok(Self {
            connection: connection.to_string(),
            generation,
            index,
        })
    }
}

fn parse_counter(part: Option<&str>) -> Result<u32, TokenError> {
    let digits = part.filter(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()));
    digits
        .and_then(|d| d.parse().ok())
        .ok_or(TokenError::Malformed)
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{TOKEN_PREFIX}{}_{}_{}", self.connection, self.generation, self.index)
    }
}

/// One arena slot: the value behind a token and the column it came from.
#[derive(Debug)]
pub struct TokenEntry {
    pub column: String,
    pub value: String,
}

/// Per-connection token state.
pub struct TokenMapping {
    connection: String,
    mode: TokenMode,
    generation: u32,
    capacity: u32,
    entries: Vec<TokenEntry>,
    by_value: HashMap<String, u32>,
}

impl TokenMapping {
    pub fn new(connection: impl Into<String>, mode: TokenMode, generation: u32, capacity: u32) -> Self {
        Self {
            connection: connection.into(),
            mode,
            generation,
            capacity: capacity.max(1),
            entries: Vec::new(),
            by_value: HashMap::new(),
        }
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Token for `raw`, read from `column`.
    pub fn tokenize(&mut self, column: &str, raw: &str) -> String {
        if self.mode == TokenMode::Deterministic {
            if let Some(&index) = self.by_value.get(raw) {
                return self.format(index);
            }
        }

        let mut index = self.allocate(column, raw);
        let mut token = self.format(index);
        // A raw value can itself look like a token; never hand it back verbatim.
        if token == raw {
            index = self.allocate(column, raw);
            token = self.format(index);
        }
        if self.mode == TokenMode::Deterministic {
            self.by_value.insert(raw.to_string(), index);
        }
        token
    }

    fn allocate(&mut self, column: &str, raw: &str) -> u32 {
        if self.entries.len() >= self.capacity as usize {
            tracing::info!(connection = %self.connection, entries = self.entries.len(), "token mapping full; resetting");
            self.reset();
        }
        let index = self.entries.len() as u32;
        self.entries.push(TokenEntry {
            column: column.to_string(),
            value: raw.to_string(),
        });
        index
    }

    fn format(&self, index: u32) -> String {
        format!("{TOKEN_PREFIX}{}_{}_{}", self.connection, self.generation, index)
    }

    /// Start a new generation. Every previously issued token goes stale.
    pub fn reset(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        self.entries.clear();
        self.by_value.clear();
    }

    /// Raw value behind `token`, after checking it belongs here and now.
    pub fn resolve(&self, token: &Token) -> Result<&TokenEntry, TokenError> {
        if token.connection != self.connection {
            return Err(TokenError::ConnectionMismatch {
                expected: self.connection.clone(),
                found: token.connection.clone(),
            });
        }
        if token.generation != self.generation {
            return Err(TokenError::StaleGeneration {
                current: self.generation,
                found: token.generation,
            });
        }
        self.entries
            .get(token.index as usize)
            .ok_or(TokenError::UnknownIndex(token.index))
    }
}

/// All connections' mappings. One lock per connection, never a global one.
pub struct TokenEngine {
    mappings: HashMap<String, Mutex<TokenMapping>>,
}

impl TokenEngine {
    pub fn new<'a>(connections: impl IntoIterator<Item = (&'a str, TokenMode)>, generation: u32, capacity: u32) -> Self {
        let mappings = connections
            .into_iter()
            .map(|(name, mode)| {
                (name.to_string(), Mutex::new(TokenMapping::new(name, mode, generation, capacity)))
            })
            .collect();
        Self { mappings }
    }

    /// Lock one connection's mapping.
    pub fn mapping(&self, connection: &str) -> Result<MutexGuard<'_, TokenMapping>, TokenError> {
        let mapping = self
            .mappings
            .get(connection)
            .ok_or_else(|| TokenError::UnknownConnection(connection.to_string()))?;
        // A panic mid-allocation leaves the arena and dictionary consistent, so poisoning is ignored.
        Ok(mapping.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }

    pub fn tokenize(&self, connection: &str, column: &str, raw: &str) -> Result<String, TokenError> {
        Ok(self.mapping(connection)?.tokenize(column, raw))
    }

    pub fn reset(&self, connection: &str) -> Result<u32, TokenError> {
        let mut mapping = self.mapping(connection)?;
        mapping.reset();
        Ok(mapping.generation())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("invalid token format, expected tok_<connection>_<generation>_<index>")]
    Malformed,
    #[error("token belongs to connection {found:?}, not {expected:?}")]
    ConnectionMismatch { expected: String, found: String },
    #[error("stale token generation {found} (current {current}); run a fresh query")]
    StaleGeneration { current: u32, found: u32 },
    #[error("unknown token index {0}")]
    UnknownIndex(u32),
    #[error("no token mapping for connection {0:?}")]
    UnknownConnection(String),
}
