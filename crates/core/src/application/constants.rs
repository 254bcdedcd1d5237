// Client constants (no magic values)

/// Reported when the initial connection cannot be established
pub const SERVER_DOWN_MESSAGE: &str = "Failed to establish connection to AMQP server. Exiting.";

/// Reported when an established connection drops
pub const CONNECTION_LOST_MESSAGE: &str = "Lost connection to AMQP server. Exiting.";

/// Published messages survive a broker restart
pub const PERSISTENT_PUBLISH: bool = true;
