//! Custom error types for the application.
//!
//! This module defines the primary error type, `VnaError`, for the entire
//! application. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the failure classes the instrument session can
//! produce:
//!
//! - **`NotConnected`**: an operation was attempted while the session is
//!   Disconnected (or the input was rejected before touching the bus). No
//!   side effects; recoverable by reconnecting.
//! - **`NoData`**: a bounded read timed out with nothing collected at a point
//!   where real data was expected. Surfaced to the user as a warning; the
//!   session stays Connected.
//! - **`TransportFailed`**: a write or read indicates the hpctrl child died.
//!   The transport has been restarted and the session forced to Disconnected;
//!   callers must refresh to the disconnected state.
//! - **`ProtocolDesync`**: an unexpected reply shape (e.g. a ping sentinel
//!   mismatch). The protocol has no generic recovery, so this is handled the
//!   same way as a transport failure.
//!
//! Everything else (`Io`, `Config`, `Parse`, …) covers the usual file,
//! configuration and text-format failure paths via `#[from]` conversions so
//! the `?` operator works throughout.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, VnaError>;

#[derive(Error, Debug)]
pub enum VnaError {
    #[error("Not connected to the instrument")]
    NotConnected,

    #[error("No data received, device may be in remote mode")]
    NoData,

    #[error("A continuous measurement run is already active")]
    RunActive,

    #[error("Transport failure: {0}")]
    TransportFailed(String),

    #[error("Protocol desync: expected {expected:?}, got {got:?}")]
    ProtocolDesync { expected: String, got: String },

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Sweep parse error: {0}")]
    Parse(String),

    #[error("Parameter {0} is not part of the requested set")]
    UnknownParameter(String),

    #[error("Frame {0} is out of range")]
    FrameOutOfRange(usize),

    #[error("Settings serialization error: {0}")]
    SettingsFormat(#[from] toml::ser::Error),
}

impl VnaError {
    /// True for the failure classes after which the session has already
    /// fallen back toward Disconnected and the front end must refresh.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            VnaError::TransportFailed(_) | VnaError::ProtocolDesync { .. }
        )
    }
}
