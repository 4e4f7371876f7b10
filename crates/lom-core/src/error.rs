//! Error types for the LoM engine core.
//!
//! Every registry, dispatcher and transport operation returns [`Result`].
//! Variants map onto the wire-level [`ErrorCode`] enumeration through
//! [`EngineError::result_code`], so a failure raised deep inside the registry
//! reaches the client as a stable numeric code plus a readable message.

use crate::types::ErrorCode;
use thiserror::Error;

/// Main error type for the engine core.
#[derive(Debug, Error)]
pub enum EngineError {
    // Usage errors
    #[error("Empty {field} name")]
    EmptyName { field: &'static str },

    #[error("Client not registered: {client}")]
    ClientNotRegistered { client: String },

    #[error("Action not registered: {action}")]
    ActionNotRegistered { action: String },

    #[error("Action {action} is disabled")]
    ActionDisabled { action: String },

    #[error("Action {action} has no configuration")]
    ActionNotConfigured { action: String },

    // Request shape errors
    #[error("Unknown request type: {0}")]
    UnknownRequestType(i32),

    #[error("Incorrect request data: {message}")]
    IncorrectRequestData { message: String },

    // Capacity errors
    #[error("{queue} queue is full (capacity {capacity})")]
    QueueFull {
        queue: &'static str,
        capacity: usize,
    },

    #[error("Request timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("Engine is shutting down")]
    Shutdown,

    // Transport errors
    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    /// A non-success reply received by a client.
    #[error("Request failed with code {code}: {message}")]
    Response { code: i32, message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl EngineError {
    /// Create a transport error from anything displayable.
    pub fn transport(message: impl Into<String>) -> Self {
        EngineError::Transport {
            message: message.into(),
        }
    }

    /// Convert to the wire result code reported to clients.
    ///
    /// Usage and capacity failures collapse onto `ReqFailed`; timeouts,
    /// shape errors and invariant violations keep their own codes.
    pub fn result_code(&self) -> ErrorCode {
        match self {
            EngineError::UnknownRequestType(_) => ErrorCode::UnknownReqType,
            EngineError::IncorrectRequestData { .. } => ErrorCode::IncorrectReqData,
            EngineError::Timeout { .. } => ErrorCode::ReqTimeout,
            EngineError::ActionNotRegistered { .. } => ErrorCode::ActionNotRegistered,
            EngineError::Shutdown => ErrorCode::Shutdown,
            EngineError::Internal { .. } => ErrorCode::InternalError,

            EngineError::EmptyName { .. }
            | EngineError::ClientNotRegistered { .. }
            | EngineError::ActionDisabled { .. }
            | EngineError::ActionNotConfigured { .. }
            | EngineError::QueueFull { .. }
            | EngineError::Config { .. } => ErrorCode::ReqFailed,

            EngineError::Response { code, .. } => {
                ErrorCode::from_code(*code).unwrap_or(ErrorCode::UnknownError)
            }

            EngineError::Transport { .. } | EngineError::Io { .. } | EngineError::Json { .. } => {
                ErrorCode::UnknownError
            }
        }
    }

    /// True for failures of the link itself rather than of the request.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            EngineError::Transport { .. } | EngineError::Io { .. } | EngineError::Json { .. }
        )
    }
}
