// Port Layer - Interfaces for external collaborators

pub mod bus;
pub mod id_provider; // For deterministic testing
pub mod serializer;
pub mod transport;

// Re-exports
pub use bus::{handler, Handler, MessageBus, PublishOptions};
pub use id_provider::{IdProvider, SequentialIdProvider, UuidProvider};
pub use serializer::{JsonWireSerializer, WireSerializer};
pub use transport::{
    AckMode, Connection, Connector, Delivery, OutboundMessage, QueueSpec, Settlement,
    SourceOptions, Transport, TransportError, TransportEvent,
};
