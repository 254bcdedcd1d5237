//! Competing consumers, capacity and settlement on the simulator

mod common;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use common::{channel_handler, contents, inbox_handler, next, settle, wait_until};
use courier_core::domain::{ActionStateError, Action};
use courier_core::port::{handler, MessageBus, PublishOptions};
use courier_core::BusError;
use courier_sim::{DomainRegistry, SimBus, SimOptions};
use serde_json::{json, Value};

async fn open(registry: &DomainRegistry) -> SimBus {
    SimBus::open(registry, SimOptions::default()).await.unwrap()
}

/// Create the work queue and leave it without subscribers
async fn declare_work_queue(registry: &DomainRegistry, worker_group: &str) {
    let bus = open(registry).await;
    bus.start_worker(worker_group, "X", handler(|_| {}), None)
        .await
        .unwrap();
    bus.close().await.unwrap();
}

#[tokio::test]
async fn test_competing_consumers_split_messages() {
    let registry = DomainRegistry::new();
    let a = open(&registry).await;
    let b = open(&registry).await;
    let (ha, inbox_a) = inbox_handler(true);
    let (hb, inbox_b) = inbox_handler(true);
    a.start_worker("w", "X", ha, None).await.unwrap();
    b.start_worker("w", "X", hb, None).await.unwrap();

    for n in 0..20 {
        a.publish("X", json!({ "n": n }), PublishOptions::default())
            .await
            .unwrap();
    }

    wait_until(|| inbox_a.lock().unwrap().len() + inbox_b.lock().unwrap().len() == 20).await;
    settle().await;

    let seen_a: BTreeSet<String> = contents(&inbox_a).iter().map(Value::to_string).collect();
    let seen_b: BTreeSet<String> = contents(&inbox_b).iter().map(Value::to_string).collect();
    assert!(seen_a.is_disjoint(&seen_b));
    assert_eq!(seen_a.len() + seen_b.len(), 20);
}

#[tokio::test]
async fn test_parallelism_one_waits_for_ack() {
    let registry = DomainRegistry::new();
    declare_work_queue(&registry, "w").await;
    let publisher = open(&registry).await;
    publisher
        .publish("X", json!({"n": 1}), PublishOptions::default())
        .await
        .unwrap();
    publisher
        .publish("X", json!({"n": 2}), PublishOptions::default())
        .await
        .unwrap();

    let worker = open(&registry).await;
    let (h, mut rx) = channel_handler();
    worker.start_queue_worker("w", h).await.unwrap();

    let first = next(&mut rx).await;
    assert_eq!(first.content(), &json!({"n": 1}));
    settle().await;
    assert!(rx.try_recv().is_err());

    first.ack().unwrap();
    let second = next(&mut rx).await;
    assert_eq!(second.content(), &json!({"n": 2}));
}

#[tokio::test]
async fn test_higher_parallelism_takes_several() {
    let registry = DomainRegistry::new();
    declare_work_queue(&registry, "w").await;
    let publisher = open(&registry).await;
    for n in 0..5 {
        publisher
            .publish("X", json!({ "n": n }), PublishOptions::default())
            .await
            .unwrap();
    }

    let worker = SimBus::open(&registry, SimOptions::default().parallelism(3))
        .await
        .unwrap();
    let (h, inbox) = inbox_handler(false);
    worker.start_queue_worker("w", h).await.unwrap();

    wait_until(|| inbox.lock().unwrap().len() == 3).await;
    settle().await;
    assert_eq!(inbox.lock().unwrap().len(), 3);
}

#[tokio::test]
async fn test_nack_redelivers_and_reject_drops() {
    let registry = DomainRegistry::new();
    let bus = open(&registry).await;
    let (h, mut rx) = channel_handler();
    bus.start_worker("w", "X", h, None).await.unwrap();
    bus.publish("X", json!({"job": 1}), PublishOptions::tagged("a"))
        .await
        .unwrap();

    let first = next(&mut rx).await;
    first.nack().unwrap();
    let again = next(&mut rx).await;
    assert_eq!(again.content(), &json!({"job": 1}));
    assert_eq!(again.tag(), "a");

    again.reject().unwrap();
    settle().await;
    assert!(rx.try_recv().is_err());
    let queue = bus.domain().find_worker("w").unwrap();
    assert!(queue.is_empty());
}

#[tokio::test]
async fn test_second_action_fails() {
    let registry = DomainRegistry::new();
    let bus = open(&registry).await;
    let (h, mut rx) = channel_handler();
    bus.start_worker("w", "X", h, None).await.unwrap();
    bus.publish("X", json!({}), PublishOptions::default())
        .await
        .unwrap();

    let msg = next(&mut rx).await;
    msg.ack().unwrap();
    let err = msg.ack().unwrap_err();
    assert_eq!(err.to_string(), "This message was already acked");
    assert_eq!(
        msg.reject(),
        Err(BusError::ActionState(ActionStateError::AlreadyActed(
            Action::Ack
        )))
    );
}

#[tokio::test]
async fn test_start_worker_completes_before_first_delivery() {
    let registry = DomainRegistry::new();
    declare_work_queue(&registry, "w").await;
    let publisher = open(&registry).await;
    publisher
        .publish("X", json!({}), PublishOptions::default())
        .await
        .unwrap();

    let started = Arc::new(AtomicBool::new(false));
    let delivered_after_start = Arc::new(AtomicUsize::new(0));
    let (flag, count) = (started.clone(), delivered_after_start.clone());
    let worker = open(&registry).await;
    worker
        .start_worker(
            "w",
            "X",
            handler(move |_| {
                if flag.load(Ordering::SeqCst) {
                    count.fetch_add(1, Ordering::SeqCst);
                }
            }),
            None,
        )
        .await
        .unwrap();
    started.store(true, Ordering::SeqCst);

    wait_until(|| delivered_after_start.load(Ordering::SeqCst) == 1).await;
}

#[tokio::test]
async fn test_close_requeues_unacked_work() {
    let registry = DomainRegistry::new();
    let first = open(&registry).await;
    let (h1, mut rx1) = channel_handler();
    first.start_worker("w", "X", h1, None).await.unwrap();
    first
        .publish("X", json!({"job": "x"}), PublishOptions::default())
        .await
        .unwrap();
    let held = next(&mut rx1).await;

    let second = open(&registry).await;
    let (h2, mut rx2) = channel_handler();
    second.start_worker("w", "X", h2, None).await.unwrap();
    settle().await;
    assert!(rx2.try_recv().is_err());

    first.close().await.unwrap();
    let redelivered = next(&mut rx2).await;
    assert_eq!(redelivered.content(), &json!({"job": "x"}));
    assert_eq!(held.ack(), Err(BusError::Defunct));
    assert_eq!(held.action_taken(), None);
    redelivered.ack().unwrap();
    assert!(second.queue_exists("w").await.unwrap());
}

#[tokio::test]
async fn test_panicking_handler_does_not_stop_delivery() {
    let registry = DomainRegistry::new();
    let bus = open(&registry).await;
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    bus.start_listener(
        "X",
        handler(move |msg| {
            if msg.tag() == "boom" {
                panic!("handler exploded");
            }
            counter.fetch_add(1, Ordering::SeqCst);
        }),
        None,
    )
    .await
    .unwrap();

    for tag in ["ok", "boom", "ok", "ok"] {
        bus.publish("X", json!({}), PublishOptions::tagged(tag))
            .await
            .unwrap();
    }
    wait_until(|| seen.load(Ordering::SeqCst) == 3).await;
}

#[tokio::test]
async fn test_delete_work_queue_drops_pending() {
    let registry = DomainRegistry::new();
    declare_work_queue(&registry, "w").await;
    let bus = open(&registry).await;
    bus.publish("X", json!({}), PublishOptions::default())
        .await
        .unwrap();
    assert!(bus.queue_exists("w").await.unwrap());

    bus.delete_work_queue("w").await.unwrap();
    assert!(!bus.queue_exists("w").await.unwrap());
    assert!(matches!(
        bus.start_queue_worker("w", handler(|_| {})).await,
        Err(BusError::NotFound(_))
    ));
}
