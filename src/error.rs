use thiserror::Error;

/// Main error type for the execution core
#[derive(Error, Debug)]
pub enum BulwarkError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Venue errors
    #[error("Venue rejected order: {0}")]
    VenueRejected(String),

    #[error("Venue unavailable: {0}")]
    VenueUnavailable(String),

    #[error("Venue call timed out after {elapsed_ms}ms: {action}")]
    VenueTimeout { action: String, elapsed_ms: u64 },

    #[error("Unknown order: {0}")]
    UnknownOrder(String),

    // Lifecycle errors
    #[error("Unknown group: {0}")]
    UnknownGroup(String),

    #[error("Duplicate group: {0}")]
    DuplicateGroup(String),

    #[error("Invalid state transition: from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    // Coordinator errors
    #[error("Strategy initialization failed: {0}")]
    StrategyInitialization(String),

    #[error("Capital allocation error: {0}")]
    CapitalAllocation(String),

    #[error("Coordinator is not running")]
    CoordinatorNotRunning,

    // Safety errors
    #[error("Kill switch engaged: {0}")]
    KillSwitchEngaged(String),

    #[error("Live trading gate: {0}")]
    LiveGate(String),

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // Persistence
    #[error("Persistence error: {0}")]
    Persistence(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for BulwarkError
pub type Result<T> = std::result::Result<T, BulwarkError>;

impl BulwarkError {
    /// Whether the venue may have acted on the call even though we saw an error.
    pub fn needs_reconciliation(&self) -> bool {
        matches!(
            self,
            BulwarkError::VenueTimeout { .. } | BulwarkError::VenueUnavailable(_)
        )
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for BulwarkError {
    fn from(err: tokio::sync::mpsc::error::SendError<T>) -> Self {
        BulwarkError::ChannelClosed(err.to_string())
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for BulwarkError {
    fn from(err: tokio::sync::oneshot::error::RecvError) -> Self {
        BulwarkError::ChannelClosed(err.to_string())
    }
}
