// Application Layer - Broker client and delivery plumbing

pub mod client;
pub mod confirm;
pub mod constants;
pub mod dispatch;
pub mod publish_once;
pub mod shutdown;

// Re-exports
pub use client::{BrokerClient, ErrorHook, OpenOptions};
pub use confirm::ConfirmTracker;
pub use dispatch::{dispatch_guarded, DispatchOutcome};
pub use publish_once::publish_once;
pub use shutdown::{shutdown_channel, ShutdownSender, ShutdownToken};
