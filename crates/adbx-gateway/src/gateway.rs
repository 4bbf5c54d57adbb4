//! The query gateway: policy check, execution, tokenization.
//!
//! Only an authorized session gets this far. For each call the gateway
//! resolves the connection profile, analyses the SQL against it, runs the
//! statement on a blocking thread, then rewrites the result: approved-function
//! columns become tokens and long plaintext cells are cut.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use adbx_core::config::{AdbxConfig, Role};

use crate::analysis::{analyze, AnalysisError, OutputColumn, QueryPlan};
use crate::backend::{Backend, BackendError, QueryLimits, ResultSet, SqliteBackend};
use crate::profile::ConnectionProfile;
use crate::tokenize::{Token, TokenEngine, TokenError};

/// Bounds on the token-parameter call.
pub const MIN_TOKEN_PARAMS: usize = 1;
pub const MAX_TOKEN_PARAMS: usize = 10;

/// What the session layer vouches for on each call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionAuth {
    pub session_id: u64,
    pub authorized: bool,
}

struct Target {
    profile: Arc<ConnectionProfile>,
    backend: Arc<dyn Backend>,
}

pub struct QueryGateway {
    targets: HashMap<String, Target>,
    tokens: TokenEngine,
}

impl QueryGateway {
    pub fn new(
        connections: Vec<(ConnectionProfile, Arc<dyn Backend>)>,
        generation: u32,
        max_tokens_per_connection: u32,
    ) -> Self {
        let tokens = TokenEngine::new(
            connections.iter().map(|(p, _)| (p.name.as_str(), p.tokenization)),
            generation,
            max_tokens_per_connection,
        );
        let targets = connections
            .into_iter()
            .map(|(profile, backend)| {
                (profile.name.clone(), Target { profile: Arc::new(profile), backend })
            })
            .collect();
        Self { targets, tokens }
    }

    /// Open a SQLite backend for every configured connection.
    pub fn from_config(config: &AdbxConfig, generation: u32) -> Result<Self, GatewayError> {
        let mut connections = Vec::with_capacity(config.connections.len());
        for conn in &config.connections {
            let profile = ConnectionProfile::from_config(conn);
            let backend = SqliteBackend::open(&profile.database, profile.role == Role::ReadOnly)
                .map_err(|source| GatewayError::Backend { connection: profile.name.clone(), source })?;
            tracing::info!(
                connection = %profile.name,
                role = ?profile.role,
                mode = ?profile.tokenization,
                sensitive = profile.sensitive.len(),
                "connection profile loaded"
            );
            connections.push((profile, Arc::new(backend) as Arc<dyn Backend>));
        }
        Ok(Self::new(connections, generation, config.tokens.max_per_connection))
    }

    pub fn connection_names(&self) -> impl Iterator<Item = &str> {
        self.targets.keys().map(String::as_str)
    }

    pub fn tokens(&self) -> &TokenEngine {
        &self.tokens
    }

    pub async fn execute(&self, connection: &str, sql: &str, auth: &SessionAuth) -> Result<ResultSet, GatewayError> {
        let target = self.target(connection, auth)?;
        let plan = analyze(sql, &target.profile, false).map_err(|e| policy_error(connection, e))?;
        self.run(target, sql, Vec::new(), &plan, auth).await
    }

    /// Run `sql` with each token bound, in order, as `?1..?n`. Raw values are
    /// bound inside the broker and never returned.
    pub async fn execute_with_tokens(
        &self,
        connection: &str,
        sql: &str,
        tokens: &[String],
        auth: &SessionAuth,
    ) -> Result<ResultSet, GatewayError> {
        let target = self.target(connection, auth)?;
        if !(MIN_TOKEN_PARAMS..=MAX_TOKEN_PARAMS).contains(&tokens.len()) {
            return Err(GatewayError::InvalidQuery(format!(
                "expected {MIN_TOKEN_PARAMS} to {MAX_TOKEN_PARAMS} token parameters, got {}",
                tokens.len()
            )));
        }
        let params = self.resolve_tokens(connection, tokens)?;
        let plan = analyze(sql, &target.profile, true).map_err(|e| policy_error(connection, e))?;
        self.run(target, sql, params, &plan, auth).await
    }

    fn target(&self, connection: &str, auth: &SessionAuth) -> Result<&Target, GatewayError> {
        let target = self
            .targets
            .get(connection)
            .ok_or_else(|| GatewayError::UnknownConnection(connection.to_string()))?;
        if !auth.authorized {
            return Err(GatewayError::Unauthorized);
        }
        Ok(target)
    }

    fn resolve_tokens(&self, connection: &str, tokens: &[String]) -> Result<Vec<String>, GatewayError> {
        let invalid = |source| GatewayError::InvalidToken { connection: connection.to_string(), source };
        let mapping = self.tokens.mapping(connection).map_err(invalid)?;
        tokens
            .iter()
            .map(|text| -> Result<String, GatewayError> {
                let token = Token::parse(text).map_err(invalid)?;
                let entry = mapping.resolve(&token).map_err(invalid)?;
                Ok(entry.value.clone())
            })
            .collect()
    }

    async fn run(
        &self,
        target: &Target,
        sql: &str,
        params: Vec<String>,
        plan: &QueryPlan,
        auth: &SessionAuth,
    ) -> Result<ResultSet, GatewayError> {
        let profile = &target.profile;
        let limits = QueryLimits {
            max_rows: profile.safety.max_rows as usize,
            statement_timeout: match profile.safety.statement_timeout_ms {
                0 => None,
                ms => Some(Duration::from_millis(u64::from(ms))),
            },
        };

        let backend = target.backend.clone();
        let owned_sql = sql.to_string();
        let kind = plan.kind;
        let result = tokio::task::spawn_blocking(move || backend.execute(&owned_sql, &params, kind, limits))
            .await
            .map_err(|e| GatewayError::Internal(format!("query task failed: {e}")))?
            .map_err(|source| GatewayError::Backend { connection: profile.name.clone(), source })?;

        let result = self.shape(profile, plan, result)?;
        tracing::debug!(
            session = auth.session_id,
            connection = %profile.name,
            rows = result.rows.len(),
            truncated = result.truncated,
            "query executed"
        );
        Ok(result)
    }

    /// Tokenize approved-function columns and cut oversized plaintext cells.
    fn shape(&self, profile: &ConnectionProfile, plan: &QueryPlan, mut result: ResultSet) -> Result<ResultSet, GatewayError> {
        let tokenized: Vec<bool> = (0..result.columns.len())
            .map(|i| plan.output(i) == OutputColumn::Tokenized)
            .collect();
        let max_cell = profile.safety.max_cell_bytes as usize;

        if tokenized.contains(&true) {
            let mut mapping = self
                .tokens
                .mapping(&profile.name)
                .map_err(|e| GatewayError::Internal(e.to_string()))?;
            for row in &mut result.rows {
                for (i, cell) in row.iter_mut().enumerate() {
                    if tokenized[i] {
                        if let Some(raw) = cell.as_deref() {
                            *cell = Some(mapping.tokenize(&result.columns[i], raw));
                        }
                    }
                }
            }
        }

        if max_cell > 0 {
            for row in &mut result.rows {
                for (i, cell) in row.iter_mut().enumerate() {
                    if let (false, Some(text)) = (tokenized[i], cell.as_mut()) {
                        truncate_at_char_boundary(text, max_cell);
                    }
                }
            }
        }
        Ok(result)
    }
}

fn truncate_at_char_boundary(text: &mut String, max: usize) {
    if text.len() <= max {
        return;
    }
    let mut cut = max;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
}

fn policy_error(connection: &str, err: AnalysisError) -> GatewayError {
    let connection = connection.to_string();
    match err {
        AnalysisError::Parse(msg) => GatewayError::InvalidQuery(msg),
        AnalysisError::SensitiveColumn(column) => GatewayError::SensitiveColumn { connection, column },
        AnalysisError::UnsafeFunction(function) => GatewayError::UnsafeFunction { connection, function },
        other @ (AnalysisError::StatementCount(_)
        | AnalysisError::RoleForbids { .. }
        | AnalysisError::MisplacedParameter(_)
        | AnalysisError::Policy(_)) => {
            GatewayError::PolicyViolation { connection, reason: other.to_string() }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("unknown connection {0:?}")]
    UnknownConnection(String),
    #[error("policy violation on {connection}: {reason}")]
    PolicyViolation { connection: String, reason: String },
    #[error("column {column} on {connection} is sensitive; select it through an approved function")]
    SensitiveColumn { connection: String, column: String },
    #[error("function {function} is not allowed on {connection}")]
    UnsafeFunction { connection: String, function: String },
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("invalid token for {connection}: {source}")]
    InvalidToken { connection: String, source: TokenError },
    #[error("session is not authorized")]
    Unauthorized,
    #[error("query on {connection} failed: {source}")]
    Backend { connection: String, source: BackendError },
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Stable machine-readable kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownConnection(_) => "unknown_connection",
            Self::PolicyViolation { .. } => "policy_violation",
            Self::SensitiveColumn { .. } => "sensitive_column",
            Self::UnsafeFunction { .. } => "unsafe_function",
            Self::InvalidQuery(_) => "invalid_query",
            Self::InvalidToken { .. } => "invalid_token",
            Self::Unauthorized => "unauthorized",
            Self::Backend { source: BackendError::Timeout, .. } => "timeout",
            Self::Backend { .. } => "backend",
            Self::Internal(_) => "internal",
        }
    }

    pub fn connection(&self) -> Option<&str> {
        match self {
            Self::UnknownConnection(c)
            | Self::PolicyViolation { connection: c, .. }
            | Self::SensitiveColumn { connection: c, .. }
            | Self::UnsafeFunction { connection: c, .. }
            | Self::InvalidToken { connection: c, .. }
            | Self::Backend { connection: c, .. } => Some(c),
            Self::InvalidQuery(_) | Self::Unauthorized | Self::Internal(_) => None,
        }
    }
}
