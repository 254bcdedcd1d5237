// Central Error Type for the message bus

use thiserror::Error;

use crate::domain::ActionStateError;
use crate::port::TransportError;

/// Bus-level error type
///
/// `Clone` so a fatal error can be both handed to the `on_error` hook and
/// stored as the terminating result of a connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Channel protocol error: {0}")]
    ChannelProtocol(String),

    #[error(transparent)]
    ActionState(#[from] ActionStateError),

    #[error("This instance is defunct. Either it was purposely closed or an error occurred.")]
    Defunct,

    #[error("Publish confirm for delivery-tag {delivery_tag} was abandoned (connection closed)")]
    ConfirmAbandoned { delivery_tag: u64 },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BusError {
    /// Fatal errors close the connection and mark it defunct
    pub fn is_fatal(&self) -> bool {
        matches!(self, BusError::Connection(_) | BusError::ChannelProtocol(_))
    }
}

/// Result type alias using BusError
pub type Result<T> = std::result::Result<T, BusError>;

impl From<serde_json::Error> for BusError {
    fn from(err: serde_json::Error) -> Self {
        BusError::Serialization(err.to_string())
    }
}

impl From<TransportError> for BusError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Connection(msg) => BusError::Connection(msg),
            TransportError::Channel { code, text } => {
                BusError::ChannelProtocol(format!("An error occurred: {} - {}", code, text))
            }
            TransportError::NotFound(what) => BusError::NotFound(what),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_kinds() {
        assert!(BusError::Connection("down".into()).is_fatal());
        assert!(BusError::ChannelProtocol("406".into()).is_fatal());
        assert!(!BusError::Defunct.is_fatal());
        assert!(!BusError::NotFound("q".into()).is_fatal());
    }

    #[test]
    fn test_channel_error_message() {
        let err: BusError = TransportError::Channel {
            code: 406,
            text: "PRECONDITION_FAILED".to_string(),
        }
        .into();
        assert_eq!(
            err.to_string(),
            "Channel protocol error: An error occurred: 406 - PRECONDITION_FAILED"
        );
    }

    #[test]
    fn test_defunct_message() {
        assert!(BusError::Defunct.to_string().contains("defunct"));
    }
}
