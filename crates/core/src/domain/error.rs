// Domain Error Types

use thiserror::Error;

use super::message::Action;

/// Misuse of ack/nack/reject/republish. Local and recoverable: only the
/// immediate caller sees it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActionStateError {
    #[error("This message is not {0}able")]
    NotActionable(Action),

    #[error("This message was already {0}ed")]
    AlreadyActed(Action),

    #[error("Only messages from a work queue can be republished")]
    NotFromWorkQueue,

    #[error("A message can only be republished by the instance that received it")]
    ForeignInstance,
}

pub type Result<T> = std::result::Result<T, ActionStateError>;
