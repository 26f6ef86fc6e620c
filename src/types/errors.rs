//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context. No operation lets an error cross the
//! control-interface boundary as a panic; every wire response carries an
//! explicit code from `to_ipc_error_code`.

use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the service registry and host runtime.
#[derive(Error, Debug)]
pub enum Error {
    /// Service id outside the valid range - rejected before any mutation.
    #[error("invalid service id: {0}")]
    InvalidId(i32),

    /// Malformed, empty, or spoofed name; out-of-range caller metadata.
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// Capability descriptor is not well-formed JSON or exceeds limits.
    #[error("invalid capability: {0}")]
    InvalidCapability(String),

    /// Caller lacks the required privilege or permission.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// No record and no on-demand route for the requested entity.
    #[error("not found: {0}")]
    NotFound(String),

    /// Bounded wait exhausted (dependency, bootstrap, on-demand polling).
    #[error("timeout: {0}")]
    Timeout(String),

    /// Capacity ceiling reached (service map, task queue).
    #[error("exhausted: {0}")]
    Exhausted(String),

    /// Control-interface call could not be delivered.
    #[error("transport failure: {0}")]
    Transport(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Wire error code for IPC error frames.
    pub fn to_ipc_error_code(&self) -> &'static str {
        match self {
            Error::InvalidId(_) => "INVALID_ID",
            Error::InvalidValue(_) => "INVALID_ARGUMENT",
            Error::InvalidCapability(_) => "INVALID_CAPABILITY",
            Error::PermissionDenied(_) => "PERMISSION_DENIED",
            Error::NotFound(_) => "NOT_FOUND",
            Error::Timeout(_) => "DEADLINE_EXCEEDED",
            Error::Exhausted(_) => "RESOURCE_EXHAUSTED",
            Error::Transport(_) => "UNAVAILABLE",
            Error::Serialization(_) => "INTERNAL",
            Error::Io(_) => "INTERNAL",
        }
    }
}

// Convenience constructors
impl Error {
    pub fn invalid_value(msg: impl Into<String>) -> Self {
        Self::InvalidValue(msg.into())
    }

    pub fn invalid_capability(msg: impl Into<String>) -> Self {
        Self::InvalidCapability(msg.into())
    }

    pub fn permission_denied(msg: impl Into<String>) -> Self {
        Self::PermissionDenied(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn exhausted(msg: impl Into<String>) -> Self {
        Self::Exhausted(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }
}
