// Panic isolation for handler dispatch
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::error;

use crate::domain::ReceivedMessage;
use crate::port::Handler;

/// Result of a guarded handler call
#[derive(Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    Handled,
    Panicked(String),
}

/// Invoke `handler` with the message, catching any panic
///
/// A panicking handler must not take down the delivery task that feeds every
/// other message of its queue. The message stays unsettled; for a work queue
/// it is redelivered once its subscriber goes away.
pub fn dispatch_guarded(handler: &Handler, message: ReceivedMessage, queue: &str) -> DispatchOutcome {
    match catch_unwind(AssertUnwindSafe(|| handler(message))) {
        Ok(()) => DispatchOutcome::Handled,
        Err(panic_info) => {
            let panic_msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic_info.downcast_ref::<String>() {
                s.clone()
            } else {
                "Unknown panic".to_string()
            };

            error!(queue = %queue, panic_msg = %panic_msg, "Message handler panicked");
            DispatchOutcome::Panicked(panic_msg)
        }
    }
}
