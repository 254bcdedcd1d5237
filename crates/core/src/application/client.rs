// Broker Client - MessageBus on top of a Transport
//
// One event-loop task per connection owns the transport's event stream and
// the settlement command queue. Confirm bookkeeping sits behind one mutex
// shared with publishers; publishers take `publish_lock` so confirm tags are
// assigned in the order frames reach the broker.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use super::confirm::ConfirmTracker;
use super::constants::{CONNECTION_LOST_MESSAGE, PERSISTENT_PUBLISH, SERVER_DOWN_MESSAGE};
use super::dispatch::dispatch_guarded;
use super::shutdown::{shutdown_channel, ShutdownSender, ShutdownToken};
use crate::config::ConnectionConfig;
use crate::domain::{
    republish_headers, AckCapability, Acknowledger, Action, Binding, ConnectionId, Headers,
    ReceivedMessage, DEFAULT_EXCHANGE,
};
use crate::error::{BusError, Result};
use crate::port::{
    AckMode, Connection, Connector, Delivery, Handler, IdProvider, JsonWireSerializer,
    MessageBus, OutboundMessage, PublishOptions, QueueSpec, Settlement, SourceOptions, Transport,
    TransportError, TransportEvent, UuidProvider, WireSerializer,
};

/// Receives fatal connection errors
pub type ErrorHook = Arc<dyn Fn(BusError) + Send + Sync>;

/// Optional collaborators for [`BrokerClient::open_with`]
#[derive(Clone)]
pub struct OpenOptions {
    pub on_error: Option<ErrorHook>,
    pub serializer: Arc<dyn WireSerializer>,
    pub ids: Arc<dyn IdProvider>,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            on_error: None,
            serializer: Arc::new(JsonWireSerializer),
            ids: Arc::new(UuidProvider),
        }
    }
}

impl OpenOptions {
    pub fn on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(BusError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(hook));
        self
    }
}

/// Work for the event loop
#[derive(Debug)]
enum Command {
    Settle {
        delivery_tag: u64,
        settlement: Settlement,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Open,
    Defunct,
}

type Confirms = ConfirmTracker<oneshot::Sender<()>>;

struct Inner<T: Transport> {
    id: ConnectionId,
    transport: T,
    serializer: Arc<dyn WireSerializer>,
    on_error: Option<ErrorHook>,
    lifecycle: Mutex<Lifecycle>,
    /// `None` when publisher confirms are disabled
    confirms: Option<Mutex<Confirms>>,
    publish_lock: tokio::sync::Mutex<()>,
    commands: mpsc::UnboundedSender<Command>,
    shutdown: ShutdownSender,
    /// `Some` once the connection is finished; `Err` if it failed
    outcome: watch::Sender<Option<Result<()>>>,
}

/// Broker-backed message bus
pub struct BrokerClient<T: Transport> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport> Clone for BrokerClient<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Transport> BrokerClient<T> {
    /// Connect with default options
    pub async fn open<C>(connector: &C, config: ConnectionConfig) -> Result<Self>
    where
        C: Connector<Transport = T>,
    {
        Self::open_with(connector, config, OpenOptions::default()).await
    }

    pub async fn open_with<C>(
        connector: &C,
        config: ConnectionConfig,
        options: OpenOptions,
    ) -> Result<Self>
    where
        C: Connector<Transport = T>,
    {
        config.validate()?;
        let connection = connector.open(&config).await.map_err(|e| {
            error!(host = %config.host, port = config.port, error = %e, "{}", SERVER_DOWN_MESSAGE);
            BusError::Connection(format!("{} ({})", SERVER_DOWN_MESSAGE, e))
        })?;
        Self::from_connection(connection, &config, options).await
    }

    /// Wrap an already opened transport
    pub async fn from_connection(
        connection: Connection<T>,
        config: &ConnectionConfig,
        options: OpenOptions,
    ) -> Result<Self> {
        let Connection { transport, events } = connection;

        if let Err(e) = Self::prepare_channel(&transport, config).await {
            if let Err(close_err) = transport.close().await {
                warn!(error = %close_err, "Closing transport after failed setup");
            }
            return Err(e.into());
        }

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (shutdown, token) = shutdown_channel();
        let (outcome, _) = watch::channel(None);
        let inner = Arc::new(Inner {
            id: options.ids.generate_id(),
            transport,
            serializer: options.serializer,
            on_error: options.on_error,
            lifecycle: Mutex::new(Lifecycle::Open),
            confirms: config
                .wait_for_publisher_confirms
                .then(|| Mutex::new(ConfirmTracker::new())),
            publish_lock: tokio::sync::Mutex::new(()),
            commands,
            shutdown,
            outcome,
        });

        tokio::spawn(run_event_loop(inner.clone(), events, command_rx, token));

        info!(
            connection = %inner.id,
            host = %config.host,
            vhost = %config.vhost,
            parallelism = config.parallelism,
            confirms = config.wait_for_publisher_confirms,
            "Connection opened"
        );
        Ok(Self { inner })
    }

    async fn prepare_channel(
        transport: &T,
        config: &ConnectionConfig,
    ) -> std::result::Result<(), TransportError> {
        transport.set_prefetch(config.parallelism).await?;
        if config.wait_for_publisher_confirms {
            transport.enable_confirms().await?;
        }
        Ok(())
    }

    pub fn is_defunct(&self) -> bool {
        self.inner.is_defunct()
    }

    /// Resolves when the connection ends: `Ok` after `close`, the fatal
    /// error otherwise
    pub async fn closed(&self) -> Result<()> {
        let mut rx = self.inner.outcome.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(outcome) = current {
                return outcome;
            }
            if rx.changed().await.is_err() {
                return Err(BusError::Defunct);
            }
        }
    }

    /// Delivery tags still waiting for a broker confirm
    pub fn pending_confirms(&self) -> Vec<u64> {
        self.inner
            .confirms
            .as_ref()
            .map(|c| lock(c).pending_tags())
            .unwrap_or_default()
    }

    async fn declare_source(&self, source: &str) -> Result<()> {
        let result = self
            .inner
            .transport
            .declare_topic_source(source, SourceOptions::durable())
            .await;
        self.inner.check(result).await
    }

    async fn publish_internal(
        &self,
        source: &str,
        message: &Value,
        tag: &str,
        headers: Headers,
    ) -> Result<()> {
        let outbound = OutboundMessage {
            payload: self.inner.serializer.encode(message)?,
            routing_key: tag.to_string(),
            headers,
            persistent: PERSISTENT_PUBLISH,
        };

        let awaiting = {
            let _order = self.inner.publish_lock.lock().await;
            self.inner.guard()?;
            let awaiting = self.inner.confirms.as_ref().map(|confirms| {
                let (tx, rx) = oneshot::channel();
                (lock(confirms).expect(tx), rx)
            });
            let result = self.inner.transport.publish(source, outbound).await;
            if result.is_err() {
                // the broker never numbered this publish
                if let (Some(confirms), Some((delivery_tag, _))) =
                    (self.inner.confirms.as_ref(), awaiting.as_ref())
                {
                    lock(confirms).cancel(*delivery_tag);
                }
            }
            self.inner.check(result).await?;
            awaiting
        };

        if let Some((delivery_tag, confirmed)) = awaiting {
            confirmed
                .await
                .map_err(|_| BusError::ConfirmAbandoned { delivery_tag })?;
            debug!(source = %source, tag = %tag, delivery_tag, "Publish confirmed");
        } else {
            debug!(source = %source, tag = %tag, "Published");
        }
        Ok(())
    }

    fn spawn_consumer(
        &self,
        queue: String,
        mut deliveries: mpsc::UnboundedReceiver<Delivery>,
        handler: Handler,
        work_queue: Option<(String, String)>,
    ) {
        let inner = self.inner.clone();
        let mut token = inner.shutdown.token();
        tokio::spawn(async move {
            loop {
                let delivery = tokio::select! {
                    _ = token.wait() => break,
                    delivery = deliveries.recv() => match delivery {
                        Some(delivery) => delivery,
                        None => break,
                    },
                };
                debug!(
                    queue = %queue,
                    delivery_tag = delivery.delivery_tag,
                    tag = %delivery.routing_key,
                    "Delivery received"
                );
                let message = inner.received_message(delivery, work_queue.as_ref());
                dispatch_guarded(&handler, message, &queue);
            }
            debug!(queue = %queue, "Consumer stopped");
        });
    }

    async fn existence_check(
        &self,
        result: std::result::Result<(), TransportError>,
    ) -> Result<bool> {
        match result {
            Ok(()) => Ok(true),
            Err(TransportError::NotFound(_)) => Ok(false),
            Err(TransportError::Channel { code: 404, .. }) => Ok(false),
            Err(e) => {
                let err = BusError::from(e);
                // failed for an unknown reason
                self.inner.fail(err.clone()).await;
                Err(err)
            }
        }
    }
}

#[async_trait]
impl<T: Transport> MessageBus for BrokerClient<T> {
    fn id(&self) -> &str {
        &self.inner.id
    }

    async fn publish(&self, source: &str, message: Value, options: PublishOptions) -> Result<()> {
        self.inner.guard()?;
        self.declare_source(source).await?;
        self.publish_internal(source, &message, &options.tag, options.headers)
            .await
    }

    async fn start_listener(
        &self,
        source: &str,
        handler: Handler,
        tag_filter: Option<&str>,
    ) -> Result<()> {
        self.inner.guard()?;
        let binding = Binding::new(source, tag_filter, None);
        self.declare_source(source).await?;

        let declared = self.inner.transport.declare_queue(&QueueSpec::listener()).await;
        let queue = self.inner.check(declared).await?;
        let bound = self
            .inner
            .transport
            .bind(&queue, source, binding.filter.pattern())
            .await;
        self.inner.check(bound).await?;
        let subscribed = self.inner.transport.subscribe(&queue, AckMode::Auto).await;
        let deliveries = self.inner.check(subscribed).await?;

        info!(source = %source, filter = %binding.filter, queue = %queue, "Listener started");
        self.spawn_consumer(queue, deliveries, handler, None);
        Ok(())
    }

    async fn start_worker(
        &self,
        worker_group: &str,
        source: &str,
        handler: Handler,
        tag_filter: Option<&str>,
    ) -> Result<()> {
        self.inner.guard()?;
        let binding = Binding::new(source, tag_filter, Some(worker_group.to_string()));
        self.declare_source(source).await?;

        let declared = self
            .inner
            .transport
            .declare_queue(&QueueSpec::work_queue(worker_group))
            .await;
        let queue = self.inner.check(declared).await?;
        let bound = self
            .inner
            .transport
            .bind(&queue, source, binding.filter.pattern())
            .await;
        self.inner.check(bound).await?;
        let subscribed = self.inner.transport.subscribe(&queue, AckMode::Manual).await;
        let deliveries = self.inner.check(subscribed).await?;

        info!(source = %source, filter = %binding.filter, queue = %queue, "Worker started");
        let identity = (queue.clone(), binding.queue_id(worker_group));
        self.spawn_consumer(queue, deliveries, handler, Some(identity));
        Ok(())
    }

    async fn start_queue_worker(&self, worker_group: &str, handler: Handler) -> Result<()> {
        self.inner.guard()?;
        let declared = self
            .inner
            .transport
            .declare_queue(&QueueSpec::work_queue(worker_group))
            .await;
        let queue = self.inner.check(declared).await?;
        let subscribed = self.inner.transport.subscribe(&queue, AckMode::Manual).await;
        let deliveries = self.inner.check(subscribed).await?;

        info!(queue = %queue, "Queue worker started");
        let identity = (queue.clone(), queue.clone());
        self.spawn_consumer(queue, deliveries, handler, Some(identity));
        Ok(())
    }

    async fn delete_source(&self, source: &str) -> Result<()> {
        self.inner.guard()?;
        let result = self.inner.transport.delete_source(source).await;
        self.inner.check(result).await?;
        info!(source = %source, "Source deleted");
        Ok(())
    }

    async fn delete_work_queue(&self, worker_group: &str) -> Result<()> {
        self.inner.guard()?;
        let result = self.inner.transport.delete_queue(worker_group).await;
        self.inner.check(result).await?;
        info!(queue = %worker_group, "Work queue deleted");
        Ok(())
    }

    async fn source_exists(&self, source: &str) -> Result<bool> {
        self.inner.guard()?;
        let result = self
            .inner
            .transport
            .declare_topic_source(source, SourceOptions::passive())
            .await;
        self.existence_check(result).await
    }

    async fn queue_exists(&self, name: &str) -> Result<bool> {
        self.inner.guard()?;
        let result = self
            .inner
            .transport
            .declare_queue(&QueueSpec::passive(name))
            .await
            .map(|_| ());
        self.existence_check(result).await
    }

    async fn republish(&self, message: &ReceivedMessage) -> Result<()> {
        self.inner.guard()?;
        let work_queue = message.republishable_by(&self.inner.id)?.work_queue.clone();
        let headers = republish_headers(message);

        // publish-then-ack: a failure in between duplicates, never loses
        self.publish_internal(DEFAULT_EXCHANGE, message.content(), &work_queue, headers)
            .await?;
        message.ack()?;
        debug!(queue = %work_queue, count = message.republish_count() + 1, "Message republished");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.inner.mark_defunct() {
            return Ok(());
        }
        self.inner.shutdown.shutdown();
        self.inner.abandon_confirms();
        let result = self.inner.transport.close().await.map_err(BusError::from);
        self.inner.outcome.send_replace(Some(Ok(())));
        info!(connection = %self.inner.id, "Connection closed");
        result
    }
}

impl<T: Transport> Inner<T> {
    fn is_defunct(&self) -> bool {
        *lock(&self.lifecycle) == Lifecycle::Defunct
    }

    fn guard(&self) -> Result<()> {
        if self.is_defunct() {
            return Err(BusError::Defunct);
        }
        Ok(())
    }

    /// Returns false if the connection was already defunct
    fn mark_defunct(&self) -> bool {
        let mut lifecycle = lock(&self.lifecycle);
        if *lifecycle == Lifecycle::Defunct {
            return false;
        }
        *lifecycle = Lifecycle::Defunct;
        true
    }

    /// Convert a transport result, failing the connection on fatal errors
    async fn check<V>(&self, result: std::result::Result<V, TransportError>) -> Result<V> {
        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                let err = BusError::from(e);
                if err.is_fatal() {
                    self.fail(err.clone()).await;
                }
                Err(err)
            }
        }
    }

    /// Tear the connection down after a fatal error
    async fn fail(&self, err: BusError) {
        if !self.mark_defunct() {
            return;
        }
        error!(connection = %self.id, error = %err, "Connection failed");
        self.shutdown.shutdown();
        self.abandon_confirms();
        if let Err(e) = self.transport.close().await {
            warn!(connection = %self.id, error = %e, "Closing failed transport");
        }
        if let Some(hook) = &self.on_error {
            hook(err.clone());
        }
        self.outcome.send_replace(Some(Err(err)));
    }

    fn abandon_confirms(&self) {
        if let Some(confirms) = &self.confirms {
            let abandoned = lock(confirms).abandon();
            if !abandoned.is_empty() {
                warn!(
                    connection = %self.id,
                    count = abandoned.len(),
                    "Abandoning unconfirmed publishes"
                );
            }
        }
    }

    fn handle_event(&self, event: TransportEvent) -> Result<()> {
        match event {
            TransportEvent::ConfirmAck {
                delivery_tag,
                multiple,
            } => {
                let confirms = self.confirms.as_ref().ok_or_else(|| {
                    BusError::ChannelProtocol(format!(
                        "Got a publish confirmation for delivery-tag {} without confirms enabled",
                        delivery_tag
                    ))
                })?;
                let settled = lock(confirms).resolve(delivery_tag, multiple)?;
                for (_, continuation) in settled {
                    // the publisher may have given up waiting
                    let _ = continuation.send(());
                }
                Ok(())
            }
            TransportEvent::ConfirmNack { delivery_tag, .. } => Err(BusError::ChannelProtocol(
                format!("Delivery failed for message with delivery-tag: {}", delivery_tag),
            )),
            TransportEvent::ConnectionLost(reason) => Err(BusError::Connection(format!(
                "{} ({})",
                CONNECTION_LOST_MESSAGE, reason
            ))),
            TransportEvent::ChannelError { code, text } => Err(BusError::from(
                TransportError::Channel { code, text },
            )),
        }
    }

    fn received_message(
        self: &Arc<Self>,
        delivery: Delivery,
        work_queue: Option<&(String, String)>,
    ) -> ReceivedMessage {
        let content = self.serializer.decode(&delivery.payload);
        match work_queue {
            None => ReceivedMessage::listener(content, delivery.routing_key, delivery.headers),
            Some((name, queue_id)) => {
                let capability = AckCapability {
                    work_queue: name.clone(),
                    queue_id: queue_id.clone(),
                    origin: self.id.clone(),
                    acker: Arc::new(BrokerAcker {
                        inner: self.clone(),
                        delivery_tag: delivery.delivery_tag,
                    }),
                };
                ReceivedMessage::work(content, delivery.routing_key, delivery.headers, capability)
            }
        }
    }
}

/// Settles one delivery through the connection's event loop
struct BrokerAcker<T: Transport> {
    inner: Arc<Inner<T>>,
    delivery_tag: u64,
}

impl<T: Transport> Acknowledger for BrokerAcker<T> {
    fn settle(&self, action: Action) -> Result<()> {
        self.inner.guard()?;
        let settlement = match action {
            Action::Ack => Settlement::Ack,
            Action::Nack => Settlement::Reject { requeue: true },
            Action::Reject => Settlement::Reject { requeue: false },
        };
        self.inner
            .commands
            .send(Command::Settle {
                delivery_tag: self.delivery_tag,
                settlement,
            })
            .map_err(|_| BusError::Defunct)
    }
}

async fn run_event_loop<T: Transport>(
    inner: Arc<Inner<T>>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut token: ShutdownToken,
) {
    loop {
        tokio::select! {
            _ = token.wait() => break,
            event = events.recv() => {
                let result = match event {
                    Some(event) => inner.handle_event(event),
                    None => Err(BusError::Connection(CONNECTION_LOST_MESSAGE.to_string())),
                };
                if let Err(err) = result {
                    inner.fail(err).await;
                    break;
                }
            }
            command = commands.recv() => match command {
                Some(Command::Settle { delivery_tag, settlement }) => {
                    debug!(delivery_tag, ?settlement, "Settling delivery");
                    let result = inner.transport.settle(delivery_tag, settlement).await;
                    if let Err(err) = inner.check(result).await {
                        if !err.is_fatal() {
                            warn!(delivery_tag, error = %err, "Settlement failed");
                        }
                    }
                }
                None => break,
            },
        }
    }
    debug!(connection = %inner.id, "Event loop stopped");
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
