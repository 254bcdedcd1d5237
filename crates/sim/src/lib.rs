// Courier Simulator - the message bus without a broker
//
// Queues live in an explicit `DomainRegistry`; every `SimBus` opened on the
// same registry and domain name sees the same queues.

pub mod acker;
pub mod client;
pub mod domain;
pub mod queue;
pub mod registry;
pub mod subscriber;

pub use client::{SimBus, SimOptions};
pub use domain::Domain;
pub use queue::SimQueue;
pub use registry::{DomainRegistry, DEFAULT_DOMAIN};
