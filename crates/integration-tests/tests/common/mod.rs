//! Shared helpers for the scenario tests

#![allow(dead_code)]

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use courier_core::domain::ReceivedMessage;
use courier_core::port::{handler, Handler};
use tokio::sync::mpsc;

pub const WAIT: Duration = Duration::from_secs(2);

/// Poll `condition` until it holds, failing the test after `WAIT`
pub async fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

/// Let spawned delivery tasks run until nothing is left to do
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

pub async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(WAIT, future)
        .await
        .expect("timed out")
}

/// Handler that forwards every message to a channel
pub fn channel_handler() -> (Handler, mpsc::UnboundedReceiver<ReceivedMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        handler(move |msg| {
            let _ = tx.send(msg);
        }),
        rx,
    )
}

pub async fn next(rx: &mut mpsc::UnboundedReceiver<ReceivedMessage>) -> ReceivedMessage {
    within(rx.recv()).await.expect("handler channel closed")
}

/// Messages a handler kept, shared with the test
pub type Inbox = Arc<Mutex<Vec<ReceivedMessage>>>;

/// Handler that keeps messages, acking them when `ack` is set
pub fn inbox_handler(ack: bool) -> (Handler, Inbox) {
    let inbox: Inbox = Arc::default();
    let kept = inbox.clone();
    (
        handler(move |msg| {
            if ack {
                msg.ack().expect("ack failed");
            }
            kept.lock().unwrap().push(msg);
        }),
        inbox,
    )
}

pub fn contents(inbox: &Inbox) -> Vec<serde_json::Value> {
    inbox
        .lock()
        .unwrap()
        .iter()
        .map(|m| m.content().clone())
        .collect()
}
