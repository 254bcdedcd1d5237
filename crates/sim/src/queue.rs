// Simulated queue and its delivery actor

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use courier_core::application::dispatch_guarded;
use courier_core::domain::{AckCapability, Binding, ConnectionId, Headers, ReceivedMessage};
use courier_core::port::Handler;
use courier_core::{BusError, Result};
use rand::seq::SliceRandom;
use serde_json::Value;
use tokio::sync::Notify;
use tracing::debug;

use crate::acker::SimAcker;
use crate::subscriber::{Subscriber, SubscriberId};

pub type MessageId = u64;

#[derive(Debug, Clone)]
struct QueuedMessage {
    id: MessageId,
    content: Value,
    tag: String,
    headers: Headers,
    delivered: bool,
    subscriber: Option<SubscriberId>,
}

#[derive(Default)]
struct QueueState {
    messages: Vec<QueuedMessage>,
    subscribers: Vec<Subscriber>,
    next_message_id: MessageId,
    next_subscriber_id: SubscriberId,
    closed: bool,
}

impl QueueState {
    fn subscriber_mut(&mut self, id: Option<SubscriberId>) -> Option<&mut Subscriber> {
        let id = id?;
        self.subscribers.iter_mut().find(|s| s.id == id)
    }
}

/// Pending messages for one `source^filter^worker` binding
///
/// State sits behind one mutex. Delivery runs in a dedicated task woken
/// through `wake`; it performs one step per wake-up round trip and yields in
/// between, so a long backlog never runs as one uninterrupted burst.
pub struct SimQueue {
    id: String,
    binding: Binding,
    worker: String,
    /// Connection owning an exclusive listener queue
    owner: Option<ConnectionId>,
    state: Mutex<QueueState>,
    wake: Arc<Notify>,
}

impl SimQueue {
    /// Create the queue and start its delivery task
    ///
    /// Must be called within a tokio runtime.
    pub fn spawn(binding: Binding, worker: String, owner: Option<ConnectionId>) -> Arc<Self> {
        let wake = Arc::new(Notify::new());
        let queue = Arc::new(Self {
            id: binding.queue_id(&worker),
            binding,
            worker,
            owner,
            state: Mutex::new(QueueState::default()),
            wake: wake.clone(),
        });
        tokio::spawn(run_delivery(Arc::downgrade(&queue), wake));
        queue
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn binding(&self) -> &Binding {
        &self.binding
    }

    /// Worker group, or the generated identity of a listener queue
    pub fn worker(&self) -> &str {
        &self.worker
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    pub fn requires_ack(&self) -> bool {
        self.binding.requires_ack()
    }

    pub fn binds(&self, source: &str, tag: &str) -> bool {
        self.binding.binds(source, tag)
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn kick(&self) {
        self.wake.notify_one();
    }

    pub fn enqueue(&self, content: Value, tag: impl Into<String>, headers: Headers) {
        let tag = tag.into();
        {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.next_message_id += 1;
            let id = state.next_message_id;
            debug!(queue = %self.id, message_id = id, tag = %tag, "Message enqueued");
            state.messages.push(QueuedMessage {
                id,
                content,
                tag,
                headers,
                delivered: false,
                subscriber: None,
            });
        }
        self.kick();
    }

    pub fn add_subscriber(
        &self,
        owner: ConnectionId,
        alive: Arc<AtomicBool>,
        handler: Handler,
        capacity: usize,
    ) {
        {
            let mut state = self.lock();
            state.next_subscriber_id += 1;
            let id = state.next_subscriber_id;
            state.subscribers.push(Subscriber {
                id,
                owner,
                alive,
                handler,
                capacity,
            });
        }
        self.kick();
    }

    /// Take one delivery step, if any is possible
    ///
    /// Picks the oldest undelivered message and a random idle subscriber.
    /// Ack-required queues keep the message tracked until it is settled;
    /// other queues drop it as soon as it is handed out.
    pub fn next_delivery(self: &Arc<Self>) -> Option<(Handler, ReceivedMessage)> {
        let mut state = self.lock();
        if state.closed {
            return None;
        }
        let idle: Vec<usize> = state
            .subscribers
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_idle())
            .map(|(i, _)| i)
            .collect();
        let slot = *idle.choose(&mut rand::thread_rng())?;
        let position = state.messages.iter().position(|m| !m.delivered)?;

        let requires_ack = self.requires_ack();
        let QueueState {
            messages,
            subscribers,
            ..
        } = &mut *state;
        let subscriber = &mut subscribers[slot];
        let message = if requires_ack {
            let message = &mut messages[position];
            message.delivered = true;
            message.subscriber = Some(subscriber.id);
            subscriber.capacity -= 1;
            message.clone()
        } else {
            messages.remove(position)
        };

        debug!(
            queue = %self.id,
            message_id = message.id,
            subscriber = subscriber.id,
            "Delivering message"
        );
        let received = match &self.binding.worker_group {
            Some(work_queue) if requires_ack => ReceivedMessage::work(
                message.content,
                message.tag,
                message.headers,
                AckCapability {
                    work_queue: work_queue.clone(),
                    queue_id: self.id.clone(),
                    origin: subscriber.owner.clone(),
                    acker: Arc::new(SimAcker {
                        queue: self.clone(),
                        message_id: message.id,
                        alive: subscriber.alive.clone(),
                    }),
                },
            ),
            _ => ReceivedMessage::listener(message.content, message.tag, message.headers),
        };
        Some((subscriber.handler.clone(), received))
    }

    /// Remove a delivered message for good (ack and reject)
    pub fn ack_or_reject(&self, message_id: MessageId) -> Result<()> {
        {
            let mut state = self.lock();
            if state.closed {
                debug!(queue = %self.id, message_id, "Settling on a deleted queue");
                return Ok(());
            }
            let position = state
                .messages
                .iter()
                .position(|m| m.id == message_id)
                .ok_or_else(|| {
                    BusError::Internal(format!(
                        "tried to delete message that was not in queue {}",
                        self.id
                    ))
                })?;
            let message = state.messages.remove(position);
            if let Some(subscriber) = state.subscriber_mut(message.subscriber) {
                subscriber.capacity += 1;
            }
        }
        self.kick();
        Ok(())
    }

    /// Return a delivered message to the pending pool
    pub fn nack(&self, message_id: MessageId) -> Result<()> {
        {
            let mut state = self.lock();
            if state.closed {
                debug!(queue = %self.id, message_id, "Settling on a deleted queue");
                return Ok(());
            }
            let message = state
                .messages
                .iter_mut()
                .find(|m| m.id == message_id)
                .ok_or_else(|| {
                    BusError::Internal(format!(
                        "tried to requeue message that was not in queue {}",
                        self.id
                    ))
                })?;
            message.delivered = false;
            let holder = message.subscriber.take();
            if let Some(subscriber) = state.subscriber_mut(holder) {
                subscriber.capacity += 1;
            }
        }
        self.kick();
        Ok(())
    }

    /// Drop `owner`'s subscribers and return their unsettled messages
    pub fn detach(&self, owner: &str) -> usize {
        let requeued = {
            let mut state = self.lock();
            let gone: Vec<SubscriberId> = state
                .subscribers
                .iter()
                .filter(|s| s.owner == owner)
                .map(|s| s.id)
                .collect();
            if gone.is_empty() {
                return 0;
            }
            state.subscribers.retain(|s| s.owner != owner);
            let mut requeued = 0;
            for message in state.messages.iter_mut() {
                if message.subscriber.is_some_and(|id| gone.contains(&id)) {
                    message.delivered = false;
                    message.subscriber = None;
                    requeued += 1;
                }
            }
            requeued
        };
        if requeued > 0 {
            debug!(queue = %self.id, requeued, "Returned unacked messages");
        }
        self.kick();
        requeued
    }

    /// Stop deliveries and drop every message
    pub fn shutdown(&self) {
        {
            let mut state = self.lock();
            state.closed = true;
            state.messages.clear();
            state.subscribers.clear();
        }
        self.kick();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Messages tracked by the queue, delivered or not
    pub fn len(&self) -> usize {
        self.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }
}

impl Drop for SimQueue {
    fn drop(&mut self) {
        // lets the delivery task observe the drop and exit
        self.wake.notify_one();
    }
}

async fn run_delivery(queue: Weak<SimQueue>, wake: Arc<Notify>) {
    loop {
        wake.notified().await;
        loop {
            let Some(q) = queue.upgrade() else {
                return;
            };
            if q.is_closed() {
                return;
            }
            let Some((handler, message)) = q.next_delivery() else {
                break;
            };
            let id = q.id.clone();
            drop(q);
            dispatch_guarded(&handler, message, &id);
            tokio::task::yield_now().await;
        }
    }
}
