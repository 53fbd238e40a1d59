//! Error types for the call service
//!
//! Errors are split by where they originate:
//!
//! - [`EngineError`] - failures reported by the external SIP protocol engine
//! - [`MiddlewareError`] - failures of the inbound-call acknowledgment request
//! - [`ServiceError`] - everything the session engine and its handle can return

use thiserror::Error;

use crate::engine::CallHandle;

/// Result type for call service operations
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Errors raised by the protocol engine primitives
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// The native SIP library could not be loaded
    #[error("Protocol library unavailable: {message}")]
    LibraryUnavailable { message: String },

    /// Library initialisation, transport creation or start-up failed
    #[error("Protocol engine failed to start: {message}")]
    StartFailed { message: String },

    /// The line is busy
    #[error("Line is busy")]
    Busy,

    /// Transport level failure
    #[error("Transport failure: {message}")]
    Transport { message: String },

    /// The engine no longer knows the call handle
    #[error("Invalid call handle: {handle}")]
    InvalidCallHandle { handle: CallHandle },

    /// The operation is not allowed in the call's current engine state
    #[error("Operation {operation} not allowed: {message}")]
    InvalidOperation { operation: String, message: String },

    /// Audio device wiring failed
    #[error("Media failure: {message}")]
    Media { message: String },

    /// A bounded engine operation did not finish in time
    #[error("Engine operation {operation} timed out")]
    Timeout { operation: String },

    /// Any other native failure
    #[error("Native failure in {operation}: {message}")]
    Native { operation: String, message: String },
}

impl EngineError {
    /// Create a native failure
    pub fn native(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Native {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a media failure
    pub fn media(message: impl Into<String>) -> Self {
        Self::Media {
            message: message.into(),
        }
    }

    /// Create an invalid operation failure
    pub fn invalid_operation(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Whether the engine rejected the call handle as stale
    pub fn is_stale_handle(&self) -> bool {
        matches!(self, Self::InvalidCallHandle { .. })
    }
}

/// Errors of the middleware acknowledgment request
#[derive(Debug, Error)]
pub enum MiddlewareError {
    /// The response URL handed over by the launcher is not usable
    #[error("Invalid middleware URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// The HTTP request could not be performed
    #[error("Middleware request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The middleware answered with a non-success status
    #[error("Middleware rejected the reply with status {status}")]
    Rejected { status: u16 },
}

/// Errors returned by the session engine and its handle
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Protocol engine error
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    /// Middleware error
    #[error("Middleware error: {0}")]
    Middleware(#[from] MiddlewareError),

    /// A call is already in progress
    #[error("Busy: call {active} is already in progress")]
    Busy { active: CallHandle },

    /// The account is not registered yet
    #[error("Account is not registered")]
    NotRegistered,

    /// There is no call to address
    #[error("No active call")]
    NoActiveCall,

    /// Configuration error
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Account storage error
    #[error("Account storage error: {message}")]
    Storage { message: String },

    /// The session engine is no longer running
    #[error("Session engine is not running")]
    ChannelClosed,

    /// The session engine task panicked or was aborted
    #[error("Session engine task failed: {0}")]
    TaskFailed(#[from] tokio::task::JoinError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServiceError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an account storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }
}
