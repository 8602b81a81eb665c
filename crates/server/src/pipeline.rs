//! Assembly of the metering pipeline.
//!
//! ```text
//! authorize() ──> SideEffectQueue ──> event stream ──> AggregatorWorker
//!      │                                                    │
//!  QuotaCache <── InvalidationListener            UsageAggregator ──> NotificationDispatcher
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use meter_aggregator::{AggregatorMetrics, AggregatorWorker, UsageAggregator, UsageQueries};
use meter_authorizer::{
    Authorizer, AuthorizerConfig, AuthorizerMetrics, CredentialRepository, InvalidationListener,
    QuotaCache, SideEffectQueue,
};
use meter_core::{MetricsSink, TracingMetricsSink};
use meter_email::{EmailBackend, EmailBackendKind, MemoryEmailBackend, SmtpBackend};
use meter_notify::{DispatcherMetrics, NotificationDispatcher, SubscriptionRepository};
use meter_state::StateStore;
use meter_state_memory::MemoryStateStore;
use meter_stream::{BroadcastInvalidationChannel, InvalidationChannel, MemoryEventStream};
use meter_webhook::{HttpWebhookTransport, WebhookClientConfig, WebhookTransport};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, timeout};
use tracing::{debug, info, warn};

use crate::config::MeterConfig;
use crate::error::ServerError;
use crate::state_factory::create_state;

/// A spawned loop and the channel that stops it.
struct BackgroundTask {
    name: &'static str,
    shutdown: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

/// Spawn `tick` every `period` until shutdown is signaled.
fn spawn_periodic<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> BackgroundTask
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (shutdown, mut shutdown_rx) = mpsc::channel::<()>(1);
    let handle = tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!(task = name, "periodic task received shutdown signal");
                    break;
                }
                _ = ticker.tick() => tick().await,
            }
        }
    });
    BackgroundTask {
        name,
        shutdown,
        handle,
    }
}

/// Builder for [`Pipeline`]. Every collaborator defaults to what the
/// configuration describes and can be replaced, which is how tests inject
/// recording transports and faulty stores.
pub struct PipelineBuilder {
    config: MeterConfig,
    store: Option<Arc<dyn StateStore>>,
    transport: Option<Arc<dyn WebhookTransport>>,
    email: Option<Arc<dyn EmailBackend>>,
    sink: Option<Arc<dyn MetricsSink>>,
}

impl PipelineBuilder {
    pub fn new(config: MeterConfig) -> Self {
        Self {
            config,
            store: None,
            transport: None,
            email: None,
            sink: None,
        }
    }

    #[must_use]
    pub fn state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn webhook_transport(mut self, transport: Arc<dyn WebhookTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    #[must_use]
    pub fn email_backend(mut self, backend: Arc<dyn EmailBackend>) -> Self {
        self.email = Some(backend);
        self
    }

    #[must_use]
    pub fn metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Build every component and spawn the background tasks. Must run inside
    /// a Tokio runtime.
    #[allow(clippy::too_many_lines)]
    pub fn build(self) -> Result<Pipeline, ServerError> {
        let config = self.config;
        config.validate()?;

        let (store, memory) = match self.store {
            Some(store) => (store, None),
            None => {
                let backend = create_state(&config.state)?;
                (backend.store, backend.memory)
            }
        };

        let stream = Arc::new(MemoryEventStream::new(config.stream.to_memory_config()));
        let invalidation = Arc::new(BroadcastInvalidationChannel::new(
            config.stream.invalidation_topic.clone(),
            config.stream.invalidation_capacity.max(1),
        ));

        let authorizer_config: AuthorizerConfig =
            config.authorizer.to_authorizer_config(&config.cache);
        let authorizer_metrics = Arc::new(AuthorizerMetrics::default());
        let repository = CredentialRepository::new(Arc::clone(&store))
            .with_invalidation(Arc::clone(&invalidation) as Arc<dyn InvalidationChannel>)
            .with_max_update_attempts(authorizer_config.max_update_attempts);
        let cache = QuotaCache::new(authorizer_config.cache_ttl, authorizer_config.cache_capacity);
        let (side_effects, side_effect_handle) = SideEffectQueue::spawn(
            Arc::clone(&stream) as _,
            &authorizer_config.side_effects,
            Arc::clone(&authorizer_metrics),
        );

        let mut tasks = Vec::new();

        let (listener, listener_shutdown) = InvalidationListener::new(
            invalidation.subscribe(),
            cache.clone(),
            Arc::clone(&authorizer_metrics),
        );
        tasks.push(BackgroundTask {
            name: "invalidation listener",
            shutdown: listener_shutdown,
            handle: tokio::spawn(listener.run()),
        });

        let aggregator_config = config
            .aggregator
            .to_aggregator_config(&authorizer_config.thresholds);
        let queries = UsageQueries::new(Arc::clone(&store), &aggregator_config);

        let dispatcher = if config.dispatcher.enabled {
            let transport: Arc<dyn WebhookTransport> = match self.transport {
                Some(transport) => transport,
                None => {
                    let mut client_config = WebhookClientConfig::default().with_timeout(
                        Duration::from_secs(config.dispatcher.webhook_timeout_seconds.max(1)),
                    );
                    if config.dispatcher.allow_insecure_endpoints {
                        warn!("plain http webhook endpoints are allowed");
                        client_config = client_config.with_insecure_endpoints();
                    }
                    Arc::new(HttpWebhookTransport::new(client_config)?)
                }
            };
            let dispatcher_config = config
                .dispatcher
                .to_dispatcher_config(&config.email.from_address);
            let subscriptions = SubscriptionRepository::new(Arc::clone(&store))
                .allow_insecure_endpoints(config.dispatcher.allow_insecure_endpoints)
                .with_max_update_attempts(dispatcher_config.max_update_attempts);
            let mut dispatcher = NotificationDispatcher::new(
                Arc::clone(&store),
                subscriptions,
                transport,
                dispatcher_config,
                Arc::new(DispatcherMetrics::default()),
            )?;
            if config.dispatcher.email_enabled {
                let backend = match self.email {
                    Some(backend) => backend,
                    None => create_email_backend(&config)?,
                };
                info!(backend = backend.backend_name(), "threshold email enabled");
                dispatcher = dispatcher.with_email(backend);
            }
            Some(Arc::new(dispatcher))
        } else {
            info!("notification dispatcher disabled");
            None
        };

        let sink = self
            .sink
            .unwrap_or_else(|| Arc::new(TracingMetricsSink) as Arc<dyn MetricsSink>);
        let mut aggregator = UsageAggregator::new(
            Arc::clone(&store),
            aggregator_config,
            sink,
            Arc::new(AggregatorMetrics::default()),
        );
        if let Some(dispatcher) = &dispatcher {
            aggregator = aggregator.with_notifier(Arc::clone(dispatcher) as _);
        }
        let aggregator = Arc::new(aggregator);

        if config.aggregator.enabled {
            let (worker, worker_shutdown) =
                AggregatorWorker::new(Arc::clone(&stream) as _, Arc::clone(&aggregator));
            tasks.push(BackgroundTask {
                name: "aggregator worker",
                shutdown: worker_shutdown,
                handle: tokio::spawn(worker.run()),
            });
        }

        if config.cache.maintenance_interval_seconds > 0 {
            let cache = cache.clone();
            tasks.push(spawn_periodic(
                "cache maintenance",
                Duration::from_secs(config.cache.maintenance_interval_seconds),
                move || {
                    let cache = cache.clone();
                    async move { cache.run_pending_tasks().await }
                },
            ));
        }

        if let Some(memory) = memory
            && config.state.sweep_interval_seconds > 0
        {
            tasks.push(spawn_periodic(
                "state sweep",
                Duration::from_secs(config.state.sweep_interval_seconds),
                move || {
                    let memory = Arc::clone(&memory);
                    async move { sweep(&memory) }
                },
            ));
        }

        let authorizer = Arc::new(Authorizer::new(
            repository,
            cache,
            side_effects,
            authorizer_config,
            authorizer_metrics,
        ));

        info!(
            quota_limit = config.authorizer.quota_limit,
            window = %config.authorizer.window,
            partitions = config.stream.partitions,
            background_tasks = tasks.len(),
            "metering pipeline started"
        );

        Ok(Pipeline {
            store,
            stream,
            invalidation,
            authorizer,
            aggregator,
            dispatcher,
            queries,
            side_effect_handle,
            tasks,
            shutdown_timeout: Duration::from_secs(config.shutdown_timeout_seconds),
        })
    }
}

fn sweep(memory: &MemoryStateStore) {
    let removed = memory.sweep_expired();
    if removed > 0 {
        debug!(removed, "swept expired state entries");
    }
}

fn create_email_backend(config: &MeterConfig) -> Result<Arc<dyn EmailBackend>, ServerError> {
    let backend: Arc<dyn EmailBackend> = match config.email.backend {
        EmailBackendKind::Smtp => Arc::new(SmtpBackend::new(config.email.clone())?),
        EmailBackendKind::Memory => Arc::new(MemoryEmailBackend::new()),
    };
    Ok(backend)
}

/// The running pipeline: request-path handle plus background tasks.
pub struct Pipeline {
    pub store: Arc<dyn StateStore>,
    pub stream: Arc<MemoryEventStream>,
    pub invalidation: Arc<BroadcastInvalidationChannel>,
    pub authorizer: Arc<Authorizer>,
    pub aggregator: Arc<UsageAggregator>,
    pub dispatcher: Option<Arc<NotificationDispatcher>>,
    pub queries: UsageQueries,
    side_effect_handle: JoinHandle<()>,
    tasks: Vec<BackgroundTask>,
    shutdown_timeout: Duration,
}

impl Pipeline {
    pub fn builder(config: MeterConfig) -> PipelineBuilder {
        PipelineBuilder::new(config)
    }

    pub fn build(config: MeterConfig) -> Result<Self, ServerError> {
        PipelineBuilder::new(config).build()
    }

    /// Stop the pipeline.
    ///
    /// The authorizer is dropped first so queued side effects reach the
    /// stream, then every background loop is signaled and awaited. Each
    /// wait is bounded by the shutdown timeout; the first task to overrun is
    /// reported after the rest have been stopped.
    pub async fn shutdown(self) -> Result<(), ServerError> {
        let Self {
            authorizer,
            side_effect_handle,
            tasks,
            shutdown_timeout,
            ..
        } = self;

        let mut first_timeout = None;

        drop(authorizer);
        if timeout(shutdown_timeout, side_effect_handle).await.is_err() {
            warn!("side-effect queue did not drain before the shutdown timeout");
            first_timeout.get_or_insert("side-effect queue");
        }

        for task in &tasks {
            // A closed channel means the task already exited.
            let _ = task.shutdown.try_send(());
        }
        for task in tasks {
            if timeout(shutdown_timeout, task.handle).await.is_err() {
                warn!(task = task.name, "background task did not stop in time");
                first_timeout.get_or_insert(task.name);
            }
        }

        match first_timeout {
            Some(name) => Err(ServerError::ShutdownTimeout(name)),
            None => {
                info!("metering pipeline stopped");
                Ok(())
            }
        }
    }
}
