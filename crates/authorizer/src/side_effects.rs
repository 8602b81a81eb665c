use std::sync::Arc;

use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use meter_core::UsageEvent;
use meter_stream::EventProducer;

use crate::config::SideEffectConfig;
use crate::metrics::AuthorizerMetrics;

/// Bounded, best-effort queue between the request path and the event stream.
///
/// [`submit`](Self::submit) never waits: when the queue is full the event is
/// dropped and counted. A single dispatcher task drains the queue and appends
/// each event under a semaphore permit and a fixed timeout.
#[derive(Debug, Clone)]
pub struct SideEffectQueue {
    tx: mpsc::Sender<UsageEvent>,
    metrics: Arc<AuthorizerMetrics>,
}

impl SideEffectQueue {
    /// Start the dispatcher task. It runs until every queue handle is
    /// dropped, then finishes the appends already in flight.
    pub fn spawn(
        producer: Arc<dyn EventProducer>,
        config: &SideEffectConfig,
        metrics: Arc<AuthorizerMetrics>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let handle = tokio::spawn(run_dispatcher(
            rx,
            producer,
            config.clone(),
            Arc::clone(&metrics),
        ));
        (Self { tx, metrics }, handle)
    }

    /// Hand an event to the dispatcher. Returns `false` if it was dropped.
    pub fn submit(&self, event: UsageEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => {
                self.metrics.increment_enqueued();
                true
            }
            Err(mpsc::error::TrySendError::Full(event)) => {
                self.metrics.increment_dropped();
                warn!(event_id = %event.id, kind = event.kind.label(), "side-effect queue full, dropping event");
                false
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                self.metrics.increment_dropped();
                warn!(event_id = %event.id, "side-effect queue closed, dropping event");
                false
            }
        }
    }
}

async fn run_dispatcher(
    mut rx: mpsc::Receiver<UsageEvent>,
    producer: Arc<dyn EventProducer>,
    config: SideEffectConfig,
    metrics: Arc<AuthorizerMetrics>,
) {
    let permits = config.max_concurrent.max(1);
    let semaphore = Arc::new(Semaphore::new(permits));

    while let Some(event) = rx.recv().await {
        let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
            break;
        };
        let producer = Arc::clone(&producer);
        let metrics = Arc::clone(&metrics);
        let timeout = config.timeout;
        tokio::spawn(async move {
            let _permit = permit;
            publish(producer.as_ref(), &event, timeout, &metrics).await;
        });
    }

    // Wait for in-flight appends before reporting completion.
    let total = u32::try_from(permits).unwrap_or(u32::MAX);
    let _ = semaphore.acquire_many(total).await;
    debug!("side-effect dispatcher stopped");
}

async fn publish(
    producer: &dyn EventProducer,
    event: &UsageEvent,
    timeout: std::time::Duration,
    metrics: &AuthorizerMetrics,
) {
    let payload = match event.encode() {
        Ok(p) => p,
        Err(e) => {
            metrics.increment_failed();
            warn!(event_id = %event.id, error = %e, "failed to encode usage event");
            return;
        }
    };
    match tokio::time::timeout(timeout, producer.append(event.partition_key(), payload)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => {
            metrics.increment_failed();
            warn!(event_id = %event.id, error = %e, "failed to append usage event");
        }
        Err(_) => {
            metrics.increment_failed();
            warn!(event_id = %event.id, ?timeout, "usage event append timed out");
        }
    }
}
