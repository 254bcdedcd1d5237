// Subscriber attached to a simulated queue

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use courier_core::domain::ConnectionId;
use courier_core::port::Handler;

pub type SubscriberId = u64;

/// A handler plus its in-flight capacity
pub struct Subscriber {
    pub id: SubscriberId,
    pub owner: ConnectionId,
    /// Cleared when the owning connection closes
    pub alive: Arc<AtomicBool>,
    pub handler: Handler,
    /// Deliveries it can still take before acking
    pub capacity: usize,
}

impl Subscriber {
    pub fn is_idle(&self) -> bool {
        self.capacity > 0 && self.alive.load(Ordering::Acquire)
    }
}
