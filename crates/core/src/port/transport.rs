// Transport Port - broker connection contract
// Implementations drive a real broker; the mock below scripts one in memory.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::ConnectionConfig;
use crate::domain::Headers;

/// Transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Broker closed the channel with a reply code
    #[error("Channel error {code}: {text}")]
    Channel { code: u16, text: String },

    /// 404 answer to a passive declare or an operation on a missing entity
    #[error("Not found: {0}")]
    NotFound(String),
}

/// Options for declaring a topic source
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceOptions {
    pub durable: bool,
    pub auto_delete: bool,
    /// Only check existence; never create
    pub passive: bool,
}

impl SourceOptions {
    /// Durable, never auto-deleted
    pub fn durable() -> Self {
        Self {
            durable: true,
            auto_delete: false,
            passive: false,
        }
    }

    pub fn passive() -> Self {
        Self {
            passive: true,
            ..Self::default()
        }
    }
}

/// Queue declaration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueSpec {
    /// `None` asks the broker for a generated name
    pub name: Option<String>,
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
    pub passive: bool,
}

impl QueueSpec {
    /// Named, durable, shared by competing consumers
    pub fn work_queue(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            durable: true,
            ..Self::default()
        }
    }

    /// Anonymous, exclusive, deleted with its connection
    pub fn listener() -> Self {
        Self {
            name: None,
            durable: false,
            auto_delete: true,
            exclusive: true,
            passive: false,
        }
    }

    pub fn passive(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            passive: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub payload: Vec<u8>,
    pub routing_key: String,
    pub headers: Headers,
    pub persistent: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// Broker waits for an explicit settlement
    Manual,
    /// Broker considers the message handled once sent
    Auto,
}

/// A message pushed to a subscription
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub headers: Headers,
    pub redelivered: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Reject { requeue: bool },
}

/// Asynchronous events raised by the connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    ConfirmAck { delivery_tag: u64, multiple: bool },
    ConfirmNack { delivery_tag: u64, multiple: bool },
    ConnectionLost(String),
    ChannelError { code: u16, text: String },
}

/// One open broker connection with a single channel
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Limit unsettled deliveries per consumer
    async fn set_prefetch(&self, count: u16) -> Result<(), TransportError>;

    /// Put the channel in publisher-confirm mode
    async fn enable_confirms(&self) -> Result<(), TransportError>;

    async fn declare_topic_source(
        &self,
        name: &str,
        options: SourceOptions,
    ) -> Result<(), TransportError>;

    /// Returns the declared (possibly generated) queue name
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<String, TransportError>;

    async fn bind(&self, queue: &str, source: &str, filter: &str) -> Result<(), TransportError>;

    async fn publish(&self, source: &str, message: OutboundMessage) -> Result<(), TransportError>;

    async fn subscribe(
        &self,
        queue: &str,
        mode: AckMode,
    ) -> Result<mpsc::UnboundedReceiver<Delivery>, TransportError>;

    async fn settle(&self, delivery_tag: u64, settlement: Settlement)
        -> Result<(), TransportError>;

    async fn delete_source(&self, name: &str) -> Result<(), TransportError>;

    async fn delete_queue(&self, name: &str) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// An opened transport plus its event stream
pub struct Connection<T> {
    pub transport: T,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Opens transports from configuration
#[async_trait]
pub trait Connector: Send + Sync {
    type Transport: Transport;

    async fn open(
        &self,
        config: &ConnectionConfig,
    ) -> Result<Connection<Self::Transport>, TransportError>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use crate::domain::{TagFilter, BUILT_IN_SOURCES, DEFAULT_EXCHANGE};
    use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
    use std::sync::{Arc, Mutex, PoisonError};

    #[derive(Default)]
    struct MockQueue {
        bindings: Vec<(String, TagFilter)>,
        consumers: Vec<(mpsc::UnboundedSender<Delivery>, AckMode)>,
        next_consumer: usize,
        backlog: VecDeque<Delivery>,
    }

    #[derive(Default)]
    struct BrokerState {
        sources: BTreeSet<String>,
        queues: BTreeMap<String, MockQueue>,
        published: Vec<(String, OutboundMessage)>,
        settlements: Vec<(u64, Settlement)>,
        unacked: HashMap<u64, (String, Delivery)>,
        next_delivery_tag: u64,
        generated_names: u64,
    }

    impl BrokerState {
        fn route(&mut self, source: &str, message: &OutboundMessage) {
            let targets: Vec<String> = if source == DEFAULT_EXCHANGE {
                self.queues
                    .contains_key(&message.routing_key)
                    .then(|| message.routing_key.clone())
                    .into_iter()
                    .collect()
            } else {
                self.queues
                    .iter()
                    .filter(|(_, q)| {
                        q.bindings
                            .iter()
                            .any(|(s, f)| s == source && f.matches(&message.routing_key))
                    })
                    .map(|(name, _)| name.clone())
                    .collect()
            };

            for queue in targets {
                self.next_delivery_tag += 1;
                let delivery = Delivery {
                    delivery_tag: self.next_delivery_tag,
                    routing_key: message.routing_key.clone(),
                    payload: message.payload.clone(),
                    headers: message.headers.clone(),
                    redelivered: false,
                };
                self.push(&queue, delivery);
            }
        }

        /// Hand a delivery to the next live consumer, or park it
        fn push(&mut self, queue: &str, delivery: Delivery) {
            let Some(q) = self.queues.get_mut(queue) else {
                return;
            };
            q.consumers.retain(|(tx, _)| !tx.is_closed());
            if q.consumers.is_empty() {
                q.backlog.push_back(delivery);
                return;
            }
            let index = q.next_consumer % q.consumers.len();
            q.next_consumer = q.next_consumer.wrapping_add(1);
            let (tx, mode) = &q.consumers[index];
            if *mode == AckMode::Manual {
                self.unacked
                    .insert(delivery.delivery_tag, (queue.to_string(), delivery.clone()));
            }
            let _ = tx.send(delivery);
        }
    }

    /// In-memory broker shared by every transport it opens
    #[derive(Clone)]
    pub struct MockBroker {
        state: Arc<Mutex<BrokerState>>,
    }

    impl Default for MockBroker {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MockBroker {
        pub fn new() -> Self {
            let state = BrokerState {
                sources: BUILT_IN_SOURCES.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            };
            Self {
                state: Arc::new(Mutex::new(state)),
            }
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, BrokerState> {
            self.state.lock().unwrap_or_else(PoisonError::into_inner)
        }

        /// Open a new transport on this broker
        pub fn connect(&self) -> (MockTransport, mpsc::UnboundedReceiver<TransportEvent>) {
            let (events, rx) = mpsc::unbounded_channel();
            let transport = MockTransport {
                broker: self.clone(),
                conn: Arc::new(Mutex::new(ConnState {
                    auto_confirm: true,
                    ..Default::default()
                })),
                events,
            };
            (transport, rx)
        }

        /// Every publish seen so far, as `(source, message)`
        pub fn published(&self) -> Vec<(String, OutboundMessage)> {
            self.lock().published.clone()
        }

        pub fn settlements(&self) -> Vec<(u64, Settlement)> {
            self.lock().settlements.clone()
        }

        pub fn has_source(&self, name: &str) -> bool {
            self.lock().sources.contains(name)
        }

        pub fn has_queue(&self, name: &str) -> bool {
            self.lock().queues.contains_key(name)
        }

        pub fn queue_names(&self) -> Vec<String> {
            self.lock().queues.keys().cloned().collect()
        }

        /// Messages waiting for a consumer on `queue`
        pub fn backlog(&self, queue: &str) -> usize {
            self.lock().queues.get(queue).map_or(0, |q| q.backlog.len())
        }

        /// Inject a delivery straight into `queue`
        pub fn deliver(&self, queue: &str, routing_key: &str, payload: &[u8], headers: Headers) {
            let mut state = self.lock();
            state.next_delivery_tag += 1;
            let delivery = Delivery {
                delivery_tag: state.next_delivery_tag,
                routing_key: routing_key.to_string(),
                payload: payload.to_vec(),
                headers,
                redelivered: false,
            };
            state.push(queue, delivery);
        }
    }

    #[derive(Default)]
    struct ConnState {
        confirms: bool,
        auto_confirm: bool,
        next_confirm_tag: u64,
        prefetch: Option<u16>,
        closed: bool,
        fail_next_publish: Option<TransportError>,
    }

    /// Scripted transport handle; clones share one connection
    #[derive(Clone)]
    pub struct MockTransport {
        broker: MockBroker,
        conn: Arc<Mutex<ConnState>>,
        events: mpsc::UnboundedSender<TransportEvent>,
    }

    impl MockTransport {
        /// Transport on a fresh broker
        pub fn new() -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
            MockBroker::new().connect()
        }

        fn conn(&self) -> std::sync::MutexGuard<'_, ConnState> {
            self.conn.lock().unwrap_or_else(PoisonError::into_inner)
        }

        fn ensure_open(&self) -> Result<(), TransportError> {
            if self.conn().closed {
                return Err(TransportError::Connection("connection closed".to_string()));
            }
            Ok(())
        }

        pub fn broker(&self) -> &MockBroker {
            &self.broker
        }

        /// Push an event as if the broker raised it
        pub fn emit(&self, event: TransportEvent) {
            let _ = self.events.send(event);
        }

        /// When off, confirms must be emitted by hand
        pub fn set_auto_confirm(&self, on: bool) {
            self.conn().auto_confirm = on;
        }

        pub fn fail_next_publish(&self, err: TransportError) {
            self.conn().fail_next_publish = Some(err);
        }

        pub fn confirms_enabled(&self) -> bool {
            self.conn().confirms
        }

        pub fn prefetch(&self) -> Option<u16> {
            self.conn().prefetch
        }

        pub fn is_closed(&self) -> bool {
            self.conn().closed
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn set_prefetch(&self, count: u16) -> Result<(), TransportError> {
            self.ensure_open()?;
            self.conn().prefetch = Some(count);
            Ok(())
        }

        async fn enable_confirms(&self) -> Result<(), TransportError> {
            self.ensure_open()?;
            self.conn().confirms = true;
            Ok(())
        }

        async fn declare_topic_source(
            &self,
            name: &str,
            options: SourceOptions,
        ) -> Result<(), TransportError> {
            self.ensure_open()?;
            let mut state = self.broker.lock();
            if options.passive {
                if !state.sources.contains(name) {
                    return Err(TransportError::NotFound(format!("exchange '{}'", name)));
                }
                return Ok(());
            }
            state.sources.insert(name.to_string());
            Ok(())
        }

        async fn declare_queue(&self, spec: &QueueSpec) -> Result<String, TransportError> {
            self.ensure_open()?;
            let mut state = self.broker.lock();
            let name = match &spec.name {
                Some(name) if !name.is_empty() => name.clone(),
                _ => {
                    state.generated_names += 1;
                    format!("amq.gen-{}", state.generated_names)
                }
            };
            if spec.passive {
                if !state.queues.contains_key(&name) {
                    return Err(TransportError::NotFound(format!("queue '{}'", name)));
                }
                return Ok(name);
            }
            state.queues.entry(name.clone()).or_default();
            Ok(name)
        }

        async fn bind(&self, queue: &str, source: &str, filter: &str) -> Result<(), TransportError> {
            self.ensure_open()?;
            let mut state = self.broker.lock();
            if !state.sources.contains(source) {
                return Err(TransportError::NotFound(format!("exchange '{}'", source)));
            }
            let q = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| TransportError::NotFound(format!("queue '{}'", queue)))?;
            if !q.bindings.iter().any(|(s, f)| s == source && f.pattern() == filter) {
                q.bindings.push((source.to_string(), TagFilter::new(filter)));
            }
            Ok(())
        }

        async fn publish(&self, source: &str, message: OutboundMessage) -> Result<(), TransportError> {
            self.ensure_open()?;
            let confirm_tag = {
                let mut conn = self.conn();
                if let Some(err) = conn.fail_next_publish.take() {
                    return Err(err);
                }
                if conn.confirms {
                    conn.next_confirm_tag += 1;
                    conn.auto_confirm.then_some(conn.next_confirm_tag)
                } else {
                    None
                }
            };
            {
                let mut state = self.broker.lock();
                if source != DEFAULT_EXCHANGE && !state.sources.contains(source) {
                    return Err(TransportError::Channel {
                        code: 404,
                        text: format!("NOT_FOUND - no exchange '{}'", source),
                    });
                }
                state.published.push((source.to_string(), message.clone()));
                state.route(source, &message);
            }
            if let Some(delivery_tag) = confirm_tag {
                self.emit(TransportEvent::ConfirmAck {
                    delivery_tag,
                    multiple: false,
                });
            }
            Ok(())
        }

        async fn subscribe(
            &self,
            queue: &str,
            mode: AckMode,
        ) -> Result<mpsc::UnboundedReceiver<Delivery>, TransportError> {
            self.ensure_open()?;
            let (tx, rx) = mpsc::unbounded_channel();
            let mut state = self.broker.lock();
            let q = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| TransportError::NotFound(format!("queue '{}'", queue)))?;
            q.consumers.push((tx, mode));
            let backlog: Vec<Delivery> = q.backlog.drain(..).collect();
            for delivery in backlog {
                state.push(queue, delivery);
            }
            Ok(rx)
        }

        async fn settle(
            &self,
            delivery_tag: u64,
            settlement: Settlement,
        ) -> Result<(), TransportError> {
            self.ensure_open()?;
            let mut state = self.broker.lock();
            let (queue, mut delivery) =
                state
                    .unacked
                    .remove(&delivery_tag)
                    .ok_or_else(|| TransportError::Channel {
                        code: 406,
                        text: format!("PRECONDITION_FAILED - unknown delivery tag {}", delivery_tag),
                    })?;
            state.settlements.push((delivery_tag, settlement));
            if settlement == (Settlement::Reject { requeue: true }) {
                state.next_delivery_tag += 1;
                delivery.delivery_tag = state.next_delivery_tag;
                delivery.redelivered = true;
                state.push(&queue, delivery);
            }
            Ok(())
        }

        async fn delete_source(&self, name: &str) -> Result<(), TransportError> {
            self.ensure_open()?;
            let mut state = self.broker.lock();
            state.sources.remove(name);
            for q in state.queues.values_mut() {
                q.bindings.retain(|(s, _)| s != name);
            }
            Ok(())
        }

        async fn delete_queue(&self, name: &str) -> Result<(), TransportError> {
            self.ensure_open()?;
            let mut state = self.broker.lock();
            state.queues.remove(name);
            state.unacked.retain(|_, (queue, _)| queue != name);
            Ok(())
        }

        async fn close(&self) -> Result<(), TransportError> {
            self.conn().closed = true;
            Ok(())
        }
    }

    /// Connector handing out transports on one shared broker
    pub struct MockConnector {
        broker: MockBroker,
        refuse: Option<String>,
        opened: Mutex<Vec<MockTransport>>,
    }

    impl MockConnector {
        pub fn new(broker: MockBroker) -> Self {
            Self {
                broker,
                refuse: None,
                opened: Mutex::new(Vec::new()),
            }
        }

        /// Connector whose every open fails
        pub fn refusing(reason: impl Into<String>) -> Self {
            Self {
                refuse: Some(reason.into()),
                ..Self::new(MockBroker::new())
            }
        }

        pub fn broker(&self) -> &MockBroker {
            &self.broker
        }

        /// Transports opened so far
        pub fn opened(&self) -> Vec<MockTransport> {
            self.opened
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        type Transport = MockTransport;

        async fn open(
            &self,
            _config: &ConnectionConfig,
        ) -> Result<Connection<MockTransport>, TransportError> {
            if let Some(reason) = &self.refuse {
                return Err(TransportError::Connection(reason.clone()));
            }
            let (transport, events) = self.broker.connect();
            self.opened
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(transport.clone());
            Ok(Connection { transport, events })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mocks::*;
    use super::*;

    fn message(tag: &str) -> OutboundMessage {
        OutboundMessage {
            payload: b"{}".to_vec(),
            routing_key: tag.to_string(),
            headers: Headers::new(),
            persistent: true,
        }
    }

    #[tokio::test]
    async fn test_passive_declare_reports_not_found() {
        let (transport, _events) = MockTransport::new();
        assert!(transport
            .declare_topic_source("amq.topic", SourceOptions::passive())
            .await
            .is_ok());
        assert!(matches!(
            transport
                .declare_topic_source("nope", SourceOptions::passive())
                .await,
            Err(TransportError::NotFound(_))
        ));
        assert!(matches!(
            transport.declare_queue(&QueueSpec::passive("nope")).await,
            Err(TransportError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_routes_by_filter_and_confirms() {
        let (transport, mut events) = MockTransport::new();
        transport.enable_confirms().await.unwrap();
        transport
            .declare_topic_source("X", SourceOptions::durable())
            .await
            .unwrap();
        let queue = transport.declare_queue(&QueueSpec::listener()).await.unwrap();
        transport.bind(&queue, "X", "*.success").await.unwrap();
        let mut rx = transport.subscribe(&queue, AckMode::Auto).await.unwrap();

        transport.publish("X", message("foo.success")).await.unwrap();
        transport.publish("X", message("foo.failure")).await.unwrap();

        assert_eq!(rx.recv().await.unwrap().routing_key, "foo.success");
        assert!(rx.try_recv().is_err());
        assert_eq!(
            events.recv().await,
            Some(TransportEvent::ConfirmAck {
                delivery_tag: 1,
                multiple: false
            })
        );
        assert_eq!(
            events.recv().await,
            Some(TransportEvent::ConfirmAck {
                delivery_tag: 2,
                multiple: false
            })
        );
    }

    #[tokio::test]
    async fn test_requeue_redelivers() {
        let (transport, _events) = MockTransport::new();
        let queue = transport
            .declare_queue(&QueueSpec::work_queue("workers"))
            .await
            .unwrap();
        transport.broker().deliver(&queue, "t", b"1", Headers::new());
        let mut rx = transport.subscribe(&queue, AckMode::Manual).await.unwrap();

        let first = rx.recv().await.unwrap();
        transport
            .settle(first.delivery_tag, Settlement::Reject { requeue: true })
            .await
            .unwrap();
        let again = rx.recv().await.unwrap();
        assert!(again.redelivered);
        assert_eq!(again.payload, b"1".to_vec());

        transport
            .settle(again.delivery_tag, Settlement::Ack)
            .await
            .unwrap();
        assert!(transport
            .settle(again.delivery_tag, Settlement::Ack)
            .await
            .is_err());
    }
}
