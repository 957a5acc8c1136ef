//! Top-level error types for the messaging hub.

use std::sync::Arc;

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration loading and validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load config from {path}: {source}")]
    Load {
        path: String,
        source: Arc<std::io::Error>,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("missing required config key: {0}")]
    MissingKey(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Storage errors: connection, migration, constraint violations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("failed to connect to storage: {0}")]
    Connect(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("constraint violated: {0}")]
    Constraint(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors classified per spec.md §7: the agent-call error taxonomy.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AgentError {
    #[error("agent call timed out after {0}s")]
    Timeout(u64),

    #[error("agent returned http {0}")]
    Http(u16),

    #[error("agent transport error: {0}")]
    Transport(String),
}

impl AgentError {
    /// The `error_stage`/error-kind tag recorded on a `MessageTrace` (spec.md §7).
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::Timeout(_) => "agent_timeout",
            AgentError::Http(_) => "agent_http",
            AgentError::Transport(_) => "agent_transport",
        }
    }
}

/// Errors classified per spec.md §7: the outbound-dispatch error taxonomy.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
    #[error("bot sidecar is not running")]
    BotMissing,

    #[error("outbound call timed out")]
    Timeout,

    #[error("outbound http error {0}")]
    Http(u16),

    #[error("outbound transport error: {0}")]
    Transport(String),
}

impl DispatchError {
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::BotMissing => "outbound_bot_missing",
            DispatchError::Timeout => "outbound_timeout",
            DispatchError::Http(_) => "outbound_http",
            DispatchError::Transport(_) => "outbound_http",
        }
    }

    /// HTTP 4xx must not be retried; transport errors and 5xx are (spec.md §4.6 step 4).
    pub fn is_retryable(&self) -> bool {
        match self {
            DispatchError::BotMissing => false,
            DispatchError::Timeout => true,
            DispatchError::Http(code) => *code >= 500,
            DispatchError::Transport(_) => true,
        }
    }
}
