// Message Bus Port - the public surface shared by broker and simulator

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::{Headers, ReceivedMessage};
use crate::error::Result;

/// Callback invoked once per delivered message
///
/// Runs on the delivering task; long work should be spawned.
pub type Handler = Arc<dyn Fn(ReceivedMessage) + Send + Sync>;

/// Wrap a closure as a [`Handler`]
pub fn handler<F>(f: F) -> Handler
where
    F: Fn(ReceivedMessage) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Per-publish options
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishOptions {
    /// Routing key; empty by default
    pub tag: String,
    pub headers: Headers,
}

impl PublishOptions {
    pub fn tagged(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            headers: Headers::new(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// Topic-routed publish/subscribe plus competing-consumer work queues
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Identity of this instance; messages remember it for republish
    fn id(&self) -> &str;

    /// Publish to a topic source; completes once confirmed (when enabled)
    async fn publish(&self, source: &str, message: Value, options: PublishOptions) -> Result<()>;

    /// Broadcast subscription: every listener gets its own copy
    ///
    /// An absent filter matches every tag.
    async fn start_listener(
        &self,
        source: &str,
        handler: Handler,
        tag_filter: Option<&str>,
    ) -> Result<()>;

    /// Competing-consumer subscription on the queue named `worker_group`
    async fn start_worker(
        &self,
        worker_group: &str,
        source: &str,
        handler: Handler,
        tag_filter: Option<&str>,
    ) -> Result<()>;

    /// Attach a worker to an existing work queue without binding it
    async fn start_queue_worker(&self, worker_group: &str, handler: Handler) -> Result<()>;

    async fn delete_source(&self, source: &str) -> Result<()>;

    async fn delete_work_queue(&self, worker_group: &str) -> Result<()>;

    async fn source_exists(&self, source: &str) -> Result<bool>;

    async fn queue_exists(&self, name: &str) -> Result<bool>;

    /// Put a copy at the back of the originating work queue, then ack the original
    async fn republish(&self, message: &ReceivedMessage) -> Result<()>;

    /// Idempotent
    async fn close(&self) -> Result<()>;
}
