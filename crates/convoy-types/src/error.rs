//! Error types shared across all Convoy crates.

/// Errors that can occur across the Convoy engine.
///
/// Each variant corresponds to a subsystem. `Validation` is special: it is
/// the caller's fault (bad request, bad plan, illegal state transition) and
/// transports surface it as a 4xx-equivalent; everything else is
/// infrastructure and maps to 5xx.
#[derive(Debug, thiserror::Error)]
pub enum ConvoyError {
    /// Bad request, bad plan, or illegal state transition. Never appended to
    /// an event log as an `error` event.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Event-log read/write failure.
    #[error("ledger error: {0}")]
    Ledger(String),

    /// Approval classifier or prompt-detection failure.
    #[error("policy error: {0}")]
    Policy(String),

    /// PTY spawn, read, write, or resize failure.
    #[error("pilot error: {0}")]
    Pilot(String),

    /// Workspace staging (clone, symlink, copy) failure.
    #[error("workspace error: {0}")]
    Workspace(String),

    /// Git or host-service command failure.
    #[error("git error: {0}")]
    Git(String),

    /// Configuration loading or validation error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error (event-log lines, review findings).
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization error (item, plan, catalog files).
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl ConvoyError {
    /// Whether this error is the caller's fault (4xx-equivalent).
    pub fn is_validation(&self) -> bool {
        matches!(self, ConvoyError::Validation(_))
    }
}

pub type Result<T> = std::result::Result<T, ConvoyError>;
