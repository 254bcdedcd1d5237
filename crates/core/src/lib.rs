// Courier Core - Domain Logic, Ports & the broker-backed client
// NO broker library dependency: the transport is consumed through `port::Transport`

pub mod application;
pub mod config;
pub mod domain;
pub mod error;
pub mod port;

pub use error::{BusError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
