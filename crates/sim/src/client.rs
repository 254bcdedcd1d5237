// Simulator client - MessageBus over an in-process domain

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use courier_core::config::{ConnectionConfig, DEFAULT_PARALLELISM};
use courier_core::domain::{is_built_in_source, republish_headers, Binding, ReceivedMessage};
use courier_core::port::{
    Handler, IdProvider, JsonWireSerializer, MessageBus, PublishOptions, UuidProvider,
    WireSerializer,
};
use courier_core::{BusError, Result};
use serde_json::Value;
use tracing::{debug, info};

use crate::domain::Domain;
use crate::registry::{DomainRegistry, DEFAULT_DOMAIN};

/// Simulator settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimOptions {
    pub domain: String,
    pub parallelism: u16,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            domain: DEFAULT_DOMAIN.to_string(),
            parallelism: DEFAULT_PARALLELISM,
        }
    }
}

impl SimOptions {
    /// Take the parallelism of a broker config; the rest does not apply
    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self {
            parallelism: config.parallelism,
            ..Self::default()
        }
    }

    pub fn domain(mut self, name: impl Into<String>) -> Self {
        self.domain = name.into();
        self
    }

    pub fn parallelism(mut self, parallelism: u16) -> Self {
        self.parallelism = parallelism;
        self
    }
}

/// In-process message bus; the drop-in for `BrokerClient` in tests
pub struct SimBus {
    id: String,
    domain: Arc<Domain>,
    parallelism: usize,
    alive: Arc<AtomicBool>,
    serializer: Arc<dyn WireSerializer>,
    ids: Arc<dyn IdProvider>,
}

impl SimBus {
    pub async fn open(registry: &DomainRegistry, options: SimOptions) -> Result<Self> {
        Self::open_with_ids(registry, options, Arc::new(UuidProvider)).await
    }

    /// Open with a custom id source (connection ids and listener identities)
    pub async fn open_with_ids(
        registry: &DomainRegistry,
        options: SimOptions,
        ids: Arc<dyn IdProvider>,
    ) -> Result<Self> {
        if options.parallelism == 0 {
            return Err(BusError::Config("parallelism must be at least 1".to_string()));
        }
        let bus = Self {
            id: ids.generate_id(),
            domain: registry.domain(&options.domain),
            parallelism: usize::from(options.parallelism),
            alive: Arc::new(AtomicBool::new(true)),
            serializer: Arc::new(JsonWireSerializer),
            ids,
        };
        info!(
            connection = %bus.id,
            domain = %options.domain,
            parallelism = options.parallelism,
            "Simulated connection opened"
        );
        Ok(bus)
    }

    pub fn domain(&self) -> &Arc<Domain> {
        &self.domain
    }

    pub fn is_defunct(&self) -> bool {
        !self.alive.load(Ordering::Acquire)
    }

    fn guard(&self) -> Result<()> {
        if self.is_defunct() {
            return Err(BusError::Defunct);
        }
        Ok(())
    }

    /// Pass content through the wire format, as a broker round trip would
    fn roundtrip(&self, message: &Value) -> Result<Value> {
        let bytes = self.serializer.encode(message)?;
        Ok(self.serializer.decode(&bytes))
    }

    fn subscribe(&self, binding: Binding, worker: String, handler: Handler, exclusive: bool) {
        let owner = exclusive.then(|| self.id.clone());
        let queue = self.domain.ensure_queue(binding, worker, owner);
        // delivery happens on the queue's task, after this call returns
        queue.add_subscriber(self.id.clone(), self.alive.clone(), handler, self.parallelism);
        debug!(connection = %self.id, queue = %queue.id(), "Subscriber attached");
    }
}

#[async_trait]
impl MessageBus for SimBus {
    fn id(&self) -> &str {
        &self.id
    }

    async fn publish(&self, source: &str, message: Value, options: PublishOptions) -> Result<()> {
        self.guard()?;
        let content = self.roundtrip(&message)?;
        let queues = self.domain.queues_binding(source, &options.tag);
        debug!(source = %source, tag = %options.tag, queues = queues.len(), "Routing publish");
        for queue in queues {
            queue.enqueue(content.clone(), options.tag.clone(), options.headers.clone());
        }
        Ok(())
    }

    async fn start_listener(
        &self,
        source: &str,
        handler: Handler,
        tag_filter: Option<&str>,
    ) -> Result<()> {
        self.guard()?;
        let binding = Binding::new(source, tag_filter, None);
        info!(source = %source, filter = %binding.filter, "Listener started");
        self.subscribe(binding, self.ids.generate_id(), handler, true);
        Ok(())
    }

    async fn start_worker(
        &self,
        worker_group: &str,
        source: &str,
        handler: Handler,
        tag_filter: Option<&str>,
    ) -> Result<()> {
        self.guard()?;
        let binding = Binding::new(source, tag_filter, Some(worker_group.to_string()));
        info!(source = %source, filter = %binding.filter, queue = %worker_group, "Worker started");
        self.subscribe(binding, worker_group.to_string(), handler, false);
        Ok(())
    }

    async fn start_queue_worker(&self, worker_group: &str, handler: Handler) -> Result<()> {
        self.guard()?;
        let queue = self
            .domain
            .find_worker(worker_group)
            .filter(|q| q.requires_ack())
            .ok_or_else(|| BusError::NotFound(format!("work queue '{}'", worker_group)))?;
        queue.add_subscriber(self.id.clone(), self.alive.clone(), handler, self.parallelism);
        info!(queue = %worker_group, "Queue worker started");
        Ok(())
    }

    async fn delete_source(&self, source: &str) -> Result<()> {
        self.guard()?;
        let removed = self.domain.remove_where(|q| q.binding().source == source);
        info!(source = %source, queues = removed, "Source deleted");
        Ok(())
    }

    async fn delete_work_queue(&self, worker_group: &str) -> Result<()> {
        self.guard()?;
        let removed = self
            .domain
            .remove_where(|q| q.binding().worker_group.as_deref() == Some(worker_group));
        info!(queue = %worker_group, queues = removed, "Work queue deleted");
        Ok(())
    }

    async fn source_exists(&self, source: &str) -> Result<bool> {
        self.guard()?;
        Ok(is_built_in_source(source) || self.domain.has_source(source))
    }

    async fn queue_exists(&self, name: &str) -> Result<bool> {
        self.guard()?;
        Ok(self.domain.has_worker(name))
    }

    async fn republish(&self, message: &ReceivedMessage) -> Result<()> {
        self.guard()?;
        let capability = message.republishable_by(&self.id)?;
        let queue = self
            .domain
            .find(&capability.queue_id)
            .ok_or_else(|| BusError::NotFound(format!("queue '{}'", capability.queue_id)))?;

        let content = self.roundtrip(message.content())?;
        let headers = republish_headers(message);
        // publish-then-ack, same as the broker
        queue.enqueue(content, capability.work_queue.clone(), headers);
        message.ack()?;
        debug!(queue = %queue.id(), "Message republished");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let was_open = self.alive.swap(false, Ordering::AcqRel);
        // a connection failed by a settlement still holds its subscribers
        self.domain.detach_connection(&self.id);
        if was_open {
            info!(connection = %self.id, "Simulated connection closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::domain::ActionStateError;
    use courier_core::port::{handler, SequentialIdProvider};
    use serde_json::json;

    #[tokio::test]
    async fn test_publish_roundtrips_through_serializer() {
        let registry = DomainRegistry::new();
        let bus = SimBus::open(&registry, SimOptions::default()).await.unwrap();
        let err = bus
            .publish("X", json!(12), PublishOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Serialization(_)));
    }

    #[tokio::test]
    async fn test_existence() {
        let registry = DomainRegistry::new();
        let bus = SimBus::open(&registry, SimOptions::default()).await.unwrap();
        assert!(bus.source_exists("amq.fanout").await.unwrap());
        assert!(!bus.source_exists("X").await.unwrap());

        bus.start_worker("w", "X", handler(|_| {}), None)
            .await
            .unwrap();
        assert!(bus.source_exists("X").await.unwrap());
        assert!(bus.queue_exists("w").await.unwrap());

        bus.delete_work_queue("w").await.unwrap();
        assert!(!bus.queue_exists("w").await.unwrap());
        assert!(!bus.source_exists("X").await.unwrap());
    }

    #[tokio::test]
    async fn test_start_queue_worker_requires_existing_queue() {
        let registry = DomainRegistry::new();
        let bus = SimBus::open(&registry, SimOptions::default()).await.unwrap();
        assert!(matches!(
            bus.start_queue_worker("w", handler(|_| {})).await,
            Err(BusError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_closed_bus_is_defunct() {
        let registry = DomainRegistry::new();
        let bus = SimBus::open_with_ids(
            &registry,
            SimOptions::default(),
            Arc::new(SequentialIdProvider::new("sim")),
        )
        .await
        .unwrap();
        assert_eq!(bus.id(), "sim-1");
        tokio_test::assert_ok!(bus.close().await);
        tokio_test::assert_ok!(bus.close().await);
        assert_eq!(
            bus.publish("X", json!({}), PublishOptions::default()).await,
            Err(BusError::Defunct)
        );
    }

    #[tokio::test]
    async fn test_republish_requires_work_queue_message() {
        let registry = DomainRegistry::new();
        let bus = SimBus::open(&registry, SimOptions::default()).await.unwrap();
        let msg = ReceivedMessage::listener(json!({}), "t", Default::default());
        assert_eq!(
            bus.republish(&msg).await,
            Err(BusError::ActionState(ActionStateError::NotFromWorkQueue))
        );
    }

    #[tokio::test]
    async fn test_zero_parallelism_rejected() {
        let registry = DomainRegistry::new();
        assert!(matches!(
            SimBus::open(&registry, SimOptions::default().parallelism(0)).await,
            Err(BusError::Config(_))
        ));
    }
}
