use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info};

use meter_stream::InvalidationSubscription;

use crate::cache::QuotaCache;
use crate::metrics::AuthorizerMetrics;

/// Applies `invalidate_key` messages to the local [`QuotaCache`].
pub struct InvalidationListener {
    subscription: InvalidationSubscription,
    cache: QuotaCache,
    metrics: Arc<AuthorizerMetrics>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl InvalidationListener {
    /// Returns the listener and the sender that stops it.
    pub fn new(
        subscription: InvalidationSubscription,
        cache: QuotaCache,
        metrics: Arc<AuthorizerMetrics>,
    ) -> (Self, mpsc::Sender<()>) {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        (
            Self {
                subscription,
                cache,
                metrics,
                shutdown_rx,
            },
            shutdown_tx,
        )
    }

    /// Run until shutdown is signaled or the channel closes.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    info!("invalidation listener received shutdown signal");
                    break;
                }
                digest = self.subscription.recv() => {
                    let Some(digest) = digest else {
                        info!("invalidation channel closed");
                        break;
                    };
                    self.cache.invalidate(&digest).await;
                    self.metrics.increment_invalidation();
                    debug!(digest = %digest, "evicted cached credential");
                }
            }
        }
    }
}
