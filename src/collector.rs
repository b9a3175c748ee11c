//! Entry point the gateway pipeline talks to
//!
//! Request tasks call [`StatisticsCollector::handle_exchange_finished`] once an
//! exchange completes; everything else happens on the collector task.

use crate::config::SharedConfig;
use crate::error::DeliveryError;
use crate::exchange::Exchange;
use crate::identity::RunIdentity;
use crate::metrics;
use crate::registry::KeyedQueueRegistry;
use crate::scheduler::{
    CollectorScheduler, SchedulerHandle, SchedulerState, ShutdownOutcome, StateWatch,
};
use crate::sink::{TelemetrySink, TelemetryTransport};
use std::sync::{Arc, Mutex};

pub struct StatisticsCollector {
    registry: Arc<KeyedQueueRegistry>,
    identity: Arc<RunIdentity>,
    config: SharedConfig,
    handle: Mutex<Option<SchedulerHandle>>,
    state: StateWatch,
}

impl StatisticsCollector {
    /// Resolve the run identity, build the HTTP sink and spawn the collector task
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: SharedConfig) -> Result<Self, DeliveryError> {
        let identity = Arc::new(RunIdentity::resolve());
        let sink = TelemetrySink::from_config(&config.load(), Arc::clone(&identity))?;
        Ok(Self::start_with_sink(config, identity, sink))
    }

    /// Like [`start`](Self::start) with a caller-provided transport
    pub fn start_with_transport(
        config: SharedConfig,
        identity: Arc<RunIdentity>,
        transport: Box<dyn TelemetryTransport>,
    ) -> Self {
        let sink = {
            let cfg = config.load();
            TelemetrySink::new(
                &cfg.elastic_search_host,
                cfg.elastic_search_port,
                Arc::clone(&identity),
                transport,
            )
        };
        Self::start_with_sink(config, identity, sink)
    }

    fn start_with_sink(config: SharedConfig, identity: Arc<RunIdentity>, sink: TelemetrySink) -> Self {
        let registry = Arc::new(KeyedQueueRegistry::new());
        let scheduler = CollectorScheduler::new(
            Arc::clone(&registry),
            sink,
            Arc::clone(&identity),
            Arc::clone(&config),
        );

        let handle = scheduler.spawn();
        Self {
            registry,
            identity,
            config,
            state: handle.watch(),
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Exchange-finished hook: queue keyed exchanges, ignore the rest
    ///
    /// Returns whether the exchange was queued.
    pub fn handle_exchange_finished(&self, exchange: Arc<Exchange>) -> bool {
        enqueue_if_keyed(&self.registry, exchange)
    }

    pub fn registry(&self) -> &Arc<KeyedQueueRegistry> {
        &self.registry
    }

    pub fn identity(&self) -> &Arc<RunIdentity> {
        &self.identity
    }

    /// State of the collector task, including after a timed-out shutdown
    pub fn state(&self) -> SchedulerState {
        self.state.get()
    }

    /// Stop the collector task, waiting at most `shutdown_timeout_seconds`
    ///
    /// Calling this more than once is harmless.
    pub async fn shutdown(&self) -> ShutdownOutcome {
        let handle = match self.handle.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        match handle {
            Some(handle) => handle.shutdown(self.config.load().shutdown_timeout()).await,
            None => ShutdownOutcome::Stopped,
        }
    }
}

/// Receiver of exchange-finished notifications
///
/// Implementations are called on request tasks and must not block.
pub trait ExchangeObserver: Send + Sync {
    fn exchange_finished(&self, exchange: Arc<Exchange>);

    /// Body bytes worth keeping per message; `None` keeps everything
    fn capture_limit(&self) -> Option<usize> {
        None
    }
}

impl ExchangeObserver for StatisticsCollector {
    fn exchange_finished(&self, exchange: Arc<Exchange>) {
        self.handle_exchange_finished(exchange);
    }

    fn capture_limit(&self) -> Option<usize> {
        self.config.load().body_limit()
    }
}

impl ExchangeObserver for KeyedQueueRegistry {
    fn exchange_finished(&self, exchange: Arc<Exchange>) {
        enqueue_if_keyed(self, exchange);
    }
}

/// Queue `exchange` under its API key; exchanges without one are not tracked
pub fn enqueue_if_keyed(registry: &KeyedQueueRegistry, exchange: Arc<Exchange>) -> bool {
    let Some(api_key) = exchange.api_key.clone() else {
        return false;
    };

    registry.enqueue(&api_key, exchange);
    metrics::record_enqueued();
    true
}
