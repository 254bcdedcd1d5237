// Settles simulated deliveries

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use courier_core::domain::{Acknowledger, Action};
use courier_core::{BusError, Result};
use tracing::error;

use crate::queue::{MessageId, SimQueue};

pub struct SimAcker {
    pub(crate) queue: Arc<SimQueue>,
    pub(crate) message_id: MessageId,
    /// Liveness of the connection that received the message
    pub(crate) alive: Arc<AtomicBool>,
}

impl Acknowledger for SimAcker {
    fn settle(&self, action: Action) -> Result<()> {
        if !self.alive.load(Ordering::Acquire) {
            return Err(BusError::Defunct);
        }
        let settled = match action {
            Action::Ack | Action::Reject => self.queue.ack_or_reject(self.message_id),
            Action::Nack => self.queue.nack(self.message_id),
        };
        if let Err(BusError::Internal(reason)) = &settled {
            // queue bookkeeping is broken; the connection cannot continue
            error!(queue = %self.queue.id(), message_id = self.message_id, %action, error = %reason, "Settlement failed");
            self.alive.store(false, Ordering::Release);
        }
        settled
    }
}
