//! Configuration system for the broker.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $ADBX_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/adbx/config.toml
//!   3. ~/.config/adbx/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AdbxConfig {
    pub broker: BrokerConfig,
    pub resume: ResumeConfig,
    pub tokens: TokenConfig,
    pub connections: Vec<ConnectionConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Private dir base. None = $XDG_RUNTIME_DIR/adbx with fallbacks.
    pub private_dir: Option<PathBuf>,
    /// Socket file name under <private_dir>/run.
    pub socket_name: String,
    /// Concurrent authenticated sessions. 0 = unlimited.
    pub max_clients: usize,
    /// Largest request frame accepted after the handshake.
    pub max_request_bytes: u32,
    /// Deadline for the whole handshake frame.
    pub handshake_timeout_ms: u64,
    /// Deadline for a request body once its header has arrived.
    pub request_timeout_ms: u64,
    /// Resumable lineages kept in memory after their connection closed.
    pub max_idle_sessions: usize,
    /// Generate the shared secret at startup if it does not exist yet.
    pub provision_secret: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResumeConfig {
    pub enabled: bool,
    /// Store directory. None = $XDG_RUNTIME_DIR/adbx-resume with fallbacks.
    pub dir: Option<PathBuf>,
    pub idle_ttl_secs: u64,
    pub absolute_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// A connection's token mapping is reset once it holds this many entries.
    pub max_per_connection: u32,
}

/// Access role of a connection profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Queries only.
    #[default]
    ReadOnly,
    /// Queries plus INSERT/UPDATE/DELETE.
    ReadWrite,
    /// Anything the backend accepts.
    Admin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenMode {
    #[default]
    Deterministic,
    Randomized,
}

/// Per-profile execution limits. Zero means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyPolicy {
    pub max_rows: u32,
    pub max_cell_bytes: u32,
    pub statement_timeout_ms: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Unique profile name; appears verbatim inside tokens.
    pub name: String,
    /// SQLite database path.
    pub database: PathBuf,
    pub role: Role,
    /// `column` or `table.column`.
    pub sensitive_columns: Vec<String>,
    /// Functions whose output may carry sensitive data, tokenized.
    pub approved_functions: Vec<String>,
    /// Functions rejected anywhere in a statement.
    pub unsafe_functions: Vec<String>,
    pub tokenization: TokenMode,
    pub safety: SafetyPolicy,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            private_dir: None,
            socket_name: "broker.sock".to_string(),
            max_clients: 32,
            max_request_bytes: 8 * 1024 * 1024,
            handshake_timeout_ms: 3_000,
            request_timeout_ms: 3_000,
            max_idle_sessions: 64,
            provision_secret: true,
        }
    }
}

impl Default for ResumeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
            idle_ttl_secs: 20 * 60,
            absolute_ttl_secs: 8 * 60 * 60,
        }
    }
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            max_per_connection: 1 << 20,
        }
    }
}

impl Default for SafetyPolicy {
    fn default() -> Self {
        Self {
            max_rows: 200,
            max_cell_bytes: 65_536,
            statement_timeout_ms: 5_000,
        }
    }
}

impl ResumeConfig {
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }

    pub fn absolute_ttl(&self) -> Duration {
        Duration::from_secs(self.absolute_ttl_secs)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("adbx")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl AdbxConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            AdbxConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("ADBX_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Reject configurations the broker cannot run safely with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for conn in &self.connections {
            if conn.name.is_empty() {
                return Err(ConfigError::Invalid("connection with empty name".into()));
            }
            if conn.name.len() > 31 || !conn.name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
                return Err(ConfigError::Invalid(format!(
                    "connection name {:?} must be 1-31 chars of [A-Za-z0-9_-]",
                    conn.name
                )));
            }
            if !seen.insert(conn.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate connection {:?}", conn.name)));
            }
        }
        if self.resume.idle_ttl_secs == 0 || self.resume.absolute_ttl_secs == 0 {
            return Err(ConfigError::Invalid("resume TTLs must be non-zero".into()));
        }
        if self.broker.max_request_bytes == 0 {
            return Err(ConfigError::Invalid("max_request_bytes must be non-zero".into()));
        }
        Ok(())
    }

    /// Apply ADBX_* env var overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(v) = get("ADBX_BROKER__PRIVATE_DIR") {
            self.broker.private_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = get("ADBX_BROKER__MAX_CLIENTS") {
            if let Ok(n) = v.parse() {
                self.broker.max_clients = n;
            }
        }
        if let Some(v) = get("ADBX_RESUME__ENABLED") {
            self.resume.enabled = v == "true" || v == "1";
        }
        if let Some(v) = get("ADBX_RESUME__DIR") {
            self.resume.dir = Some(PathBuf::from(v));
        }
        if let Some(v) = get("ADBX_RESUME__IDLE_TTL_SECS") {
            if let Ok(n) = v.parse() {
                self.resume.idle_ttl_secs = n;
            }
        }
        if let Some(v) = get("ADBX_RESUME__ABSOLUTE_TTL_SECS") {
            if let Ok(n) = v.parse() {
                self.resume.absolute_ttl_secs = n;
            }
        }
    }
}
