//! Demo pipeline: one audit listener and a pool of competing workers

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::json;
use tokio::sync::Notify;
use tracing::{info, warn};

use courier_core::port::{handler, MessageBus, PublishOptions};
use courier_sim::{DomainRegistry, SimBus, SimOptions};

const DEFAULT_MESSAGES: usize = 10;
const DEFAULT_WORKERS: usize = 2;
const SOURCE: &str = "courier.demo";
const WORK_QUEUE: &str = "courier.demo.workers";
const WORK_FILTER: &str = "job.*";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSettings {
    pub messages: usize,
    pub workers: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            messages: DEFAULT_MESSAGES,
            workers: DEFAULT_WORKERS,
        }
    }
}

impl PipelineSettings {
    /// `COURIER_DEMO_MESSAGES` and `COURIER_DEMO_WORKERS` override the defaults
    pub fn from_env() -> Result<Self> {
        let mut settings = Self::default();
        if let Ok(raw) = std::env::var("COURIER_DEMO_MESSAGES") {
            settings.messages = raw
                .parse()
                .with_context(|| format!("COURIER_DEMO_MESSAGES is not a number: {}", raw))?;
        }
        if let Ok(raw) = std::env::var("COURIER_DEMO_WORKERS") {
            settings.workers = raw
                .parse()
                .with_context(|| format!("COURIER_DEMO_WORKERS is not a number: {}", raw))?;
        }
        anyhow::ensure!(settings.workers > 0, "COURIER_DEMO_WORKERS must be at least 1");
        Ok(settings)
    }
}

/// Counters gathered while the pipeline ran
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub acked: usize,
    pub heard: usize,
    pub per_worker: Vec<usize>,
}

pub struct Pipeline {
    publisher: SimBus,
    auditor: SimBus,
    workers: Vec<SimBus>,
    acked: Arc<AtomicUsize>,
    heard: Arc<AtomicUsize>,
    per_worker: Vec<Arc<AtomicUsize>>,
    progress: Arc<Notify>,
}

impl Pipeline {
    pub async fn start(
        registry: &DomainRegistry,
        options: SimOptions,
        settings: &PipelineSettings,
    ) -> Result<Self> {
        let heard = Arc::new(AtomicUsize::new(0));
        let acked = Arc::new(AtomicUsize::new(0));
        let progress = Arc::new(Notify::new());

        let auditor = SimBus::open(registry, options.clone()).await?;
        let audit_count = heard.clone();
        auditor
            .start_listener(
                SOURCE,
                handler(move |msg| {
                    audit_count.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(tag = %msg.tag(), "Audit");
                }),
                None,
            )
            .await?;

        let mut workers = Vec::with_capacity(settings.workers);
        let mut per_worker = Vec::with_capacity(settings.workers);
        for index in 0..settings.workers {
            let bus = SimBus::open(registry, options.clone()).await?;
            let handled = Arc::new(AtomicUsize::new(0));
            let (count, total, wake) = (handled.clone(), acked.clone(), progress.clone());
            bus.start_worker(
                WORK_QUEUE,
                SOURCE,
                handler(move |msg| match msg.ack() {
                    Ok(()) => {
                        count.fetch_add(1, Ordering::Relaxed);
                        total.fetch_add(1, Ordering::AcqRel);
                        wake.notify_one();
                    }
                    Err(e) => warn!(worker = index, error = %e, "Ack failed"),
                }),
                Some(WORK_FILTER),
            )
            .await?;
            workers.push(bus);
            per_worker.push(handled);
        }

        let publisher = SimBus::open(registry, options).await?;
        info!(workers = settings.workers, "Pipeline started");
        Ok(Self {
            publisher,
            auditor,
            workers,
            acked,
            heard,
            per_worker,
            progress,
        })
    }

    pub async fn publish_all(&self, messages: usize) -> Result<()> {
        for seq in 0..messages {
            self.publisher
                .publish(SOURCE, json!({ "seq": seq }), PublishOptions::tagged("job.created"))
                .await?;
        }
        info!(messages, "Published");
        Ok(())
    }

    /// Resolves once `expected` messages were acknowledged
    pub async fn drained(&self, expected: usize) {
        loop {
            let notified = self.progress.notified();
            if self.acked.load(Ordering::Acquire) >= expected {
                return;
            }
            notified.await;
        }
    }

    pub async fn close(self) -> Result<Report> {
        for bus in self.workers.iter().chain([&self.auditor, &self.publisher]) {
            bus.close().await?;
        }
        Ok(Report {
            acked: self.acked.load(Ordering::Acquire),
            heard: self.heard.load(Ordering::Relaxed),
            per_worker: self
                .per_worker
                .iter()
                .map(|c| c.load(Ordering::Relaxed))
                .collect(),
        })
    }
}
