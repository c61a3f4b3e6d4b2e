//! Hardware transport errors

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Link control failed: {0}")]
    LinkControl(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Transport not supported: {0}")]
    Unsupported(String),
}

impl From<TransportError> for vbs_core::VbsError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Unsupported(msg) => Self::Unsupported(msg),
            TransportError::InvalidConfig(msg) => Self::Config(msg),
            other => Self::StartFailed(other.to_string()),
        }
    }
}
