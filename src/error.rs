use thiserror::Error;

#[derive(Error, Debug)]
pub enum RunletError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    #[error("TOML parse error: {0}")]
    TomlParse(String),

    // Authentication / authorization
    #[error("Token was rejected by the auth collaborator")]
    Unauthenticated,

    #[error("Caller is not permitted to {action}")]
    Unauthorized { action: String },

    // Policy
    #[error("Command rejected by policy: {reason}")]
    PolicyRejected { reason: String },

    // Execution lifecycle
    #[error("Execution not found: {id}")]
    NotFound { id: String },

    #[error("Illegal state transition for execution {id}: {from} -> {to}")]
    IllegalTransition {
        id: String,
        from: &'static str,
        to: &'static str,
    },

    // Workspace errors
    #[error("Workspace path already exists: {path}")]
    WorkspaceCollision { path: String },

    #[error("Workspace root is not usable: {0}")]
    WorkspaceInit(String),

    // Broadcast errors
    #[error("Event sink rejected delivery: {0}")]
    SinkDelivery(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // HTTP errors (remote token verifier)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // Generic wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RunletError {
    /// Machine-readable reason code reported to callers through the gateway.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::Unauthorized { .. } => "unauthorized",
            Self::PolicyRejected { .. } => "policy_violation",
            Self::NotFound { .. } => "not_found",
            Self::IllegalTransition { .. } => "illegal_transition",
            Self::WorkspaceCollision { .. } => "workspace_collision",
            Self::Config(_) | Self::ConfigNotFound { .. } | Self::TomlParse(_) => "config_error",
            _ => "internal_error",
        }
    }

    /// True when the failure is the caller's fault rather than the engine's.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Unauthenticated
                | Self::Unauthorized { .. }
                | Self::PolicyRejected { .. }
                | Self::NotFound { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, RunletError>;
