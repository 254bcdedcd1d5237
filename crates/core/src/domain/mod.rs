// Domain Layer - Routing, headers and the received-message lifecycle

pub mod binding;
pub mod error;
pub mod headers;
pub mod message;
pub mod source;

// Re-exports
pub use binding::{Binding, TagFilter};
pub use error::ActionStateError;
pub use headers::{
    republish_count, republish_headers, Headers, ORIGINAL_TAG_HEADER, REPUBLISH_COUNT_HEADER,
};
pub use message::{AckCapability, Acknowledger, Action, ConnectionId, ReceivedMessage};
pub use source::{is_built_in_source, BUILT_IN_SOURCES, DEFAULT_EXCHANGE};
