//! Connection profiles: a configured backend plus the policy guarding it.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;

use adbx_core::config::{ConnectionConfig, Role, SafetyPolicy, TokenMode};

/// A sensitive-column rule: `column` applies to every table, `table.column`
/// only where that table is referenced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensitiveRule {
    pub table: Option<String>,
    pub column: String,
}

impl SensitiveRule {
    pub fn parse(text: &str) -> Self {
        let lowered = text.trim().to_ascii_lowercase();
        match lowered.rsplit_once('.') {
            Some((table, column)) => Self {
                table: Some(table.rsplit('.').next().unwrap_or(table).to_string()),
                column: column.to_string(),
            },
            None => Self {
                table: None,
                column: lowered,
            },
        }
    }

    /// Does a reference to `column`, in a statement touching `relations`,
    /// possibly read this rule's column? Qualifiers are not trusted: an alias
    /// can hide the table name.
    pub fn matches(&self, column: &str, relations: &HashSet<String>) -> bool {
        if !self.column.eq_ignore_ascii_case(column) {
            return false;
        }
        match &self.table {
            None => true,
            Some(table) => relations.contains(table),
        }
    }

    /// Whether this rule can apply to a statement touching `relations` at all.
    pub fn applies_to(&self, relations: &HashSet<String>) -> bool {
        match &self.table {
            None => !relations.is_empty(),
            Some(table) => relations.contains(table),
        }
    }
}

impl fmt::Display for SensitiveRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.table {
            Some(table) => write!(f, "{table}.{}", self.column),
            None => f.write_str(&self.column),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionProfile {
    pub name: String,
    pub database: PathBuf,
    pub role: Role,
    pub sensitive: Vec<SensitiveRule>,
    /// Lower-cased function names.
    pub approved_functions: HashSet<String>,
    /// Lower-cased function names.
    pub unsafe_functions: HashSet<String>,
    pub tokenization: TokenMode,
    pub safety: SafetyPolicy,
}

impl ConnectionProfile {
    pub fn from_config(config: &ConnectionConfig) -> Self {
        let lower = |names: &[String]| names.iter().map(|n| n.trim().to_ascii_lowercase()).collect();
        Self {
            name: config.name.clone(),
            database: config.database.clone(),
            role: config.role,
            sensitive: config.sensitive_columns.iter().map(|c| SensitiveRule::parse(c)).collect(),
            approved_functions: lower(&config.approved_functions),
            unsafe_functions: lower(&config.unsafe_functions),
            tokenization: config.tokenization,
            safety: config.safety,
        }
    }

    pub fn is_approved(&self, function: &str) -> bool {
        self.approved_functions.contains(function)
    }

    pub fn is_unsafe(&self, function: &str) -> bool {
        self.unsafe_functions.contains(function)
    }

    /// First rule a reference to `column` would trip, if any.
    pub fn sensitive_rule(&self, column: &str, relations: &HashSet<String>) -> Option<&SensitiveRule> {
        self.sensitive.iter().find(|r| r.matches(column, relations))
    }
}
