//! Error types for the overlay tunnel.

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

/// Overlay-specific errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum OverlayError {
    /// Unreadable or invalid configuration (config file, endpoint file, device id).
    #[error("Configuration error: {0}")]
    Config(#[source] ErrorContext),

    /// Dial/read/write failure on the tunnel transport.
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Virtual interface creation or configuration failed.
    #[error("Virtual interface error: {0}")]
    Device(#[source] ErrorContext),

    /// Malformed registration message, frame, or address response.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Pre-shared-key session negotiation failed.
    #[error("PSK handshake error: {0}")]
    Handshake(String),

    /// Broadcast payload could not be encrypted or decrypted.
    #[error("Cipher error: {0}")]
    Cipher(String),

    /// Broadcast HTTP request failed or was rejected.
    #[error("HTTP error: {0}")]
    Http(String),

    /// Virtual address pool exhausted.
    #[error("IP assignment error: {0}")]
    IpAssignment(String),

    /// Endpoint was already closed.
    #[error("{0} not alive")]
    NotAlive(&'static str),
}

impl OverlayError {
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

    /// Create a virtual interface error with context only.
    pub fn device(message: impl Into<String>) -> Self {
        Self::Device(ErrorContext::new(message))
    }

    /// Create a virtual interface error with preserved source.
    pub fn device_with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Device(ErrorContext::with_source(message, source))
    }

    /// Returns true if this error is potentially recoverable by retrying.
    ///
    /// **Recoverable (transient):**
    /// - `Transport` - connection refused/reset, server restarting
    /// - `Handshake` - peer went away mid-negotiation
    /// - `Http` - broadcast server unreachable
    ///
    /// **Non-recoverable (permanent):**
    /// - `Config` - won't change without user action
    /// - `Device` - usually missing privileges or OS configuration
    /// - `Protocol` - server answered with something unusable
    /// - `Cipher` - wrong passphrase
    /// - `IpAssignment` - pool exhausted
    /// - `NotAlive` - endpoint closed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            OverlayError::Transport(_) | OverlayError::Handshake(_) | OverlayError::Http(_)
        )
    }
}

/// Result type alias for overlay operations.
pub type OverlayResult<T> = Result<T, OverlayError>;
