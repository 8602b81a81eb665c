use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{error, info};

use meter_stream::EventConsumer;

use crate::aggregator::{BatchReport, UsageAggregator};
use crate::error::AggregationError;

/// Polls the event stream and feeds batches to a [`UsageAggregator`].
pub struct AggregatorWorker {
    consumer: Arc<dyn EventConsumer>,
    aggregator: Arc<UsageAggregator>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl AggregatorWorker {
    /// Returns the worker and the sender that stops it.
    pub fn new(
        consumer: Arc<dyn EventConsumer>,
        aggregator: Arc<UsageAggregator>,
    ) -> (Self, mpsc::Sender<()>) {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        (
            Self {
                consumer,
                aggregator,
                shutdown_rx,
            },
            shutdown_tx,
        )
    }

    /// Poll one batch, aggregate it and acknowledge every record in it.
    ///
    /// Malformed records are acknowledged too: they will never decode.
    /// Returns `None` when the stream had nothing to deliver.
    pub async fn process_once(&self) -> Result<Option<BatchReport>, AggregationError> {
        let records = self
            .consumer
            .poll(self.aggregator.config().batch_size)
            .await?;
        if records.is_empty() {
            return Ok(None);
        }
        let report = self.aggregator.process_batch(&records).await;
        let receipts: Vec<_> = records.iter().map(|r| r.receipt).collect();
        self.consumer.ack(&receipts).await?;
        Ok(Some(report))
    }

    /// Run until shutdown is signaled. Full batches are processed
    /// back-to-back; otherwise the worker waits for the next poll tick.
    pub async fn run(mut self) {
        let mut ticker = interval(self.aggregator.config().poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    info!("aggregator worker received shutdown signal");
                    break;
                }
                _ = ticker.tick() => {
                    loop {
                        match self.process_once().await {
                            Ok(Some(report)) if report.received >= self.aggregator.config().batch_size => {}
                            Ok(_) => break,
                            Err(e) => {
                                error!(error = %e, "aggregator poll failed");
                                break;
                            }
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use meter_core::{
        CredentialId, MemoryMetricsSink, PrincipalId, RequestMeta, UsageEvent, UsageEventKind,
    };
    use meter_state_memory::MemoryStateStore;
    use meter_stream::{EventProducer, MemoryEventStream};

    use super::*;
    use crate::config::AggregatorConfig;
    use crate::metrics::AggregatorMetrics;

    fn setup(stream: &Arc<MemoryEventStream>) -> (AggregatorWorker, mpsc::Sender<()>, Arc<AggregatorMetrics>) {
        let metrics = Arc::new(AggregatorMetrics::default());
        let aggregator = UsageAggregator::new(
            Arc::new(MemoryStateStore::new()),
            AggregatorConfig {
                batch_size: 10,
                poll_interval: Duration::from_millis(50),
                ..AggregatorConfig::default()
            },
            Arc::new(MemoryMetricsSink::new()),
            metrics.clone(),
        );
        let (worker, tx) = AggregatorWorker::new(stream.clone(), Arc::new(aggregator));
        (worker, tx, metrics)
    }

    async fn publish(stream: &MemoryEventStream, n: usize) {
        for _ in 0..n {
            let ev = UsageEvent::new(
                UsageEventKind::ApiCall { success: true },
                Some(PrincipalId::from("ada@example.com")),
                Some(CredentialId::from("cred_a")),
                RequestMeta::default(),
            );
            stream
                .append(ev.partition_key(), ev.encode().unwrap())
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn process_once_acks_the_batch() {
        let stream = Arc::new(MemoryEventStream::default());
        let (worker, _tx, _) = setup(&stream);
        assert!(worker.process_once().await.unwrap().is_none());

        publish(&stream, 3).await;
        stream.append("junk", b"not json".to_vec()).await.unwrap();
        let report = worker.process_once().await.unwrap().unwrap();
        assert_eq!(report.received, 4);
        assert_eq!(report.processed, 3);
        assert_eq!(report.malformed, 1);
        assert_eq!(stream.backlog(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn run_drains_and_stops_on_shutdown() {
        let stream = Arc::new(MemoryEventStream::default());
        let (worker, tx, metrics) = setup(&stream);
        publish(&stream, 25).await;

        let handle = tokio::spawn(worker.run());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(metrics.snapshot().processed, 25);
        assert_eq!(stream.backlog(), 0);

        tx.send(()).await.unwrap();
        handle.await.unwrap();
    }
}
