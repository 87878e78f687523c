//! Error handling for gpumux
//!
//! Provides a unified error type and result type for use across all gpumux
//! components.

/// Result type alias for gpumux operations
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for gpumux
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    InvalidConfiguration(String),

    /// Placement is impossible on the candidate backend (missing profile,
    /// SLA too tight for batch size 1, or memory overflow)
    #[error("Placement infeasible: {0}")]
    PlacementInfeasible(String),

    /// A backend stopped answering control RPCs
    #[error("Backend unreachable: {0}")]
    BackendUnreachable(String),

    /// An input missed its deadline before it could be batched
    #[error("Deadline miss: {0}")]
    DeadlineMiss(String),

    /// A request arrived for a model session the backend does not host
    #[error("Model not loaded: {0}")]
    ModelNotLoaded(String),

    /// Resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid request or parameters
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// gRPC/transport errors
    #[error("Transport error: {0}")]
    Transport(String),

    /// Operation timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Internal error or invariant violation
    #[error("Internal error: {0}")]
    Internal(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Configuration parsing errors
    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    /// Generic error with context
    #[error("Error: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Create a placement-infeasible error
    pub fn placement(msg: impl Into<String>) -> Self {
        Self::PlacementInfeasible(msg.into())
    }

    /// Create a backend-unreachable error
    pub fn unreachable(msg: impl Into<String>) -> Self {
        Self::BackendUnreachable(msg.into())
    }

    /// Create a deadline-miss error
    pub fn deadline(msg: impl Into<String>) -> Self {
        Self::DeadlineMiss(msg.into())
    }

    /// Create a model-not-loaded error
    pub fn model_not_loaded(msg: impl Into<String>) -> Self {
        Self::ModelNotLoaded(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an invalid request error
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::BackendUnreachable(_)
                | Error::Transport(_)
                | Error::Timeout(_)
                | Error::DeadlineMiss(_)
        )
    }

    /// Check if this error indicates a client-side problem
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidConfiguration(_)
                | Error::InvalidRequest(_)
                | Error::NotFound(_)
                | Error::ModelNotLoaded(_)
        )
    }

    /// Get the error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            Error::InvalidConfiguration(_) => "configuration",
            Error::PlacementInfeasible(_) => "placement_infeasible",
            Error::BackendUnreachable(_) => "backend_unreachable",
            Error::DeadlineMiss(_) => "deadline_miss",
            Error::ModelNotLoaded(_) => "model_not_loaded",
            Error::NotFound(_) => "not_found",
            Error::InvalidRequest(_) => "invalid_request",
            Error::Transport(_) => "transport",
            Error::Timeout(_) => "timeout",
            Error::Internal(_) => "internal",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::Yaml(_) => "yaml",
            Error::Config(_) => "config",
            Error::Other(_) => "other",
        }
    }
}
