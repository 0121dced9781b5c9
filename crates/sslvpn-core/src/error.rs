//! Error types for the gateway data-plane.

use std::error::Error as StdError;
use thiserror::Error;

/// Boxed error type used for error chaining across crate boundaries.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Context wrapper that preserves an optional underlying source error.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ErrorContext {
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl ErrorContext {
    /// Create context-only error (no underlying source).
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Create context error with an underlying source.
    pub fn with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Gateway data-plane errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GatewayError {
    /// TUN device creation or configuration failed.
    #[error("TUN device error: {0}")]
    TunDevice(#[source] ErrorContext),

    /// An external command could not be run or exited unsuccessfully.
    #[error("Command failed: {0}")]
    Command(String),

    /// Firewall rule listing or modification failed.
    #[error("Firewall error: {0}")]
    Firewall(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(#[source] ErrorContext),

    /// Caller-supplied data failed validation (malformed IP/MAC, missing username).
    #[error("Validation error: {0}")]
    Validation(String),

    /// A uniqueness constraint of the reservation table would be violated.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The reservation store could not be read or written.
    #[error("Storage error: {0}")]
    Storage(#[source] ErrorContext),

    /// The session cannot be attached to a tunnel.
    #[error("Session error: {0}")]
    Session(String),

    /// Local I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// Create a TUN device error with context only.
    pub fn tun_device(message: impl Into<String>) -> Self {
        Self::TunDevice(ErrorContext::new(message))
    }

    /// Create a TUN device error with preserved source.
    pub fn tun_device_with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::TunDevice(ErrorContext::with_source(message, source))
    }

    /// Create a configuration error with context only.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(ErrorContext::new(message))
    }

    /// Create a configuration error with preserved source.
    pub fn config_with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Config(ErrorContext::with_source(message, source))
    }

    /// Create a storage error with preserved source.
    pub fn storage_with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Storage(ErrorContext::with_source(message, source))
    }

    /// Returns true if the error was caused by invalid caller input rather
    /// than by the storage layer or the host.
    pub fn is_validation(&self) -> bool {
        matches!(self, GatewayError::Validation(_))
    }
}

/// Result type alias for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;
