// One-shot publish: open, publish, close

use serde_json::Value;
use tracing::warn;

use super::client::BrokerClient;
use crate::config::ConnectionConfig;
use crate::error::Result;
use crate::port::{Connector, MessageBus, PublishOptions};

/// Publish a single message on a short-lived connection
///
/// Waits for the publish confirm when confirms are enabled. The connection is
/// closed whether or not the publish succeeded; the publish error wins.
pub async fn publish_once<C>(
    connector: &C,
    config: ConnectionConfig,
    source: &str,
    message: Value,
    options: PublishOptions,
) -> Result<()>
where
    C: Connector,
{
    let client = BrokerClient::open(connector, config).await?;
    let published = client.publish(source, message, options).await;
    let closed = client.close().await;
    if let (Err(_), Err(e)) = (&published, &closed) {
        warn!(error = %e, "Closing after failed publish");
    }
    published.and(closed)
}
