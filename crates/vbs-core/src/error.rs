//! Common error types for the vehicle bus service

use thiserror::Error;

/// Result type for bus operations
pub type VbsResult<T> = Result<T, VbsError>;

/// Errors raised outside of an established hardware session
#[derive(Debug, Error)]
pub enum VbsError {
    /// Frame could not be constructed (bad id or payload length)
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// Hardware filter or flow-control record is malformed
    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    /// Configuration file or value is malformed
    #[error("Configuration error: {0}")]
    Config(String),

    /// Persistent state could not be read or written
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Bus type is not supported by the hardware variant
    #[error("Bus not supported: {0}")]
    Unsupported(String),

    /// The hardware link refused the requested configuration
    #[error("Bus start failed: {0}")]
    StartFailed(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
