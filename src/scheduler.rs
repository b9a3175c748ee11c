//! Background collector: drain, encode, deliver, sleep
//!
//! A single tokio task owns every drain, encode and send. Producers only touch
//! the registry.
//!
//! ```text
//! Running ──shutdown()──▶ ShuttingDown ──final cycle──▶ Stopped
//! ```

use crate::config::SharedConfig;
use crate::encoder::{combine, BatchEncoder, Fragment, SnapshotOptions};
use crate::error::{CycleError, EncodingError};
use crate::identity::RunIdentity;
use crate::logging::SensitiveApiKey;
use crate::metrics;
use crate::registry::KeyedQueueRegistry;
use crate::sink::TelemetrySink;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const STATISTICS_PATH: &str = "/statistics/";
pub const EXCHANGES_PATH: &str = "/exchanges/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Running,
    ShuttingDown,
    Stopped,
}

impl SchedulerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Running,
            1 => Self::ShuttingDown,
            _ => Self::Stopped,
        }
    }
}

/// Read-only view of a worker's state that outlives its [`SchedulerHandle`]
#[derive(Debug, Clone)]
pub struct StateWatch(Arc<AtomicU8>);

impl StateWatch {
    pub fn get(&self) -> SchedulerState {
        SchedulerState::from_u8(self.0.load(Ordering::Acquire))
    }
}

/// Result of waiting for the worker to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    Stopped,
    /// The wait elapsed first; the worker is left to finish on its own
    TimedOut,
}

/// What one successful cycle did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub keys_drained: usize,
    pub exchanges_drained: usize,
    pub statistics_records: usize,
    pub snapshot_records: usize,
    pub dropped_records: usize,
    pub deliveries: usize,
}

pub struct CollectorScheduler {
    registry: Arc<KeyedQueueRegistry>,
    sink: TelemetrySink,
    identity: Arc<RunIdentity>,
    config: SharedConfig,
}

impl CollectorScheduler {
    pub fn new(
        registry: Arc<KeyedQueueRegistry>,
        sink: TelemetrySink,
        identity: Arc<RunIdentity>,
        config: SharedConfig,
    ) -> Self {
        Self {
            registry,
            sink,
            identity,
            config,
        }
    }

    /// Run one full cycle and advance the run counter
    ///
    /// Failures abort the rest of the cycle; whatever was drained but not yet
    /// delivered is dropped. The counter advances either way.
    pub async fn run_cycle(&self) -> Result<CycleReport, CycleError> {
        let start = Instant::now();
        let result = self.collect_and_deliver().await;
        let run = self.identity.advance();
        metrics::record_queue_keys(self.registry.key_count());

        match &result {
            Ok(report) => {
                metrics::record_cycle("ok", start.elapsed());
                if report.exchanges_drained > 0 {
                    tracing::debug!(
                        run = run,
                        keys = report.keys_drained,
                        exchanges = report.exchanges_drained,
                        deliveries = report.deliveries,
                        dropped = report.dropped_records,
                        duration_ms = start.elapsed().as_millis(),
                        "Telemetry cycle completed"
                    );
                }
            }
            Err(e) => {
                metrics::record_cycle(e.kind(), start.elapsed());
                tracing::error!(
                    run = run,
                    error = %e,
                    "Telemetry cycle aborted, drained data discarded"
                );
            }
        }

        result
    }

    async fn collect_and_deliver(&self) -> Result<CycleReport, CycleError> {
        let config = self.config.load();
        let encoder = BatchEncoder::new(SnapshotOptions {
            include_headers: config.trace_includes_header,
            body_limit: config.body_limit(),
        });

        let mut report = CycleReport::default();
        let mut statistics_batches = Vec::new();
        let mut snapshot_batches = Vec::new();

        for api_key in self.registry.keys() {
            let drained = self.registry.drain(&api_key);
            if drained.is_empty() {
                continue;
            }
            report.keys_drained += 1;
            report.exchanges_drained += drained.len();

            let mut statistics = Vec::new();
            let mut snapshots = Vec::new();

            for exchange in &drained {
                if config.trace_statistics {
                    push_record(
                        encoder.encode_statistics(exchange),
                        &mut statistics,
                        &mut report,
                        &api_key,
                    );
                }
                if config.trace_exchanges {
                    push_record(
                        encoder.encode_snapshot(exchange),
                        &mut snapshots,
                        &mut report,
                        &api_key,
                    );
                }
            }

            report.statistics_records += statistics.len();
            report.snapshot_records += snapshots.len();
            metrics::record_encoded("statistics", statistics.len() as u64);
            metrics::record_encoded("snapshot", snapshots.len() as u64);

            if !statistics.is_empty() {
                statistics_batches.push(combine(&api_key, &statistics)?);
            }
            if !snapshots.is_empty() {
                snapshot_batches.push(combine(&api_key, &snapshots)?);
            }
        }

        let hostname = self.identity.hostname();
        if !statistics_batches.is_empty() {
            let envelope = combine(hostname, &statistics_batches)?;
            self.deliver(STATISTICS_PATH, &envelope).await?;
            report.deliveries += 1;
        }
        if !snapshot_batches.is_empty() {
            let envelope = combine(hostname, &snapshot_batches)?;
            self.deliver(EXCHANGES_PATH, &envelope).await?;
            report.deliveries += 1;
        }

        Ok(report)
    }

    async fn deliver(&self, path: &str, envelope: &Fragment) -> Result<(), CycleError> {
        let collection = path.trim_matches('/');
        match self.sink.deliver(path, envelope).await {
            Ok(()) => {
                metrics::record_delivery(collection, "ok");
                Ok(())
            }
            Err(e) => {
                metrics::record_delivery(collection, "failed");
                Err(e.into())
            }
        }
    }

    /// Start the worker task
    pub fn spawn(self) -> SchedulerHandle {
        let token = CancellationToken::new();
        let state = Arc::new(AtomicU8::new(SchedulerState::Running as u8));

        let join = tokio::spawn({
            let token = token.clone();
            let state = Arc::clone(&state);
            async move {
                self.run(token).await;
                state.store(SchedulerState::Stopped as u8, Ordering::Release);
            }
        });

        SchedulerHandle { token, state, join }
    }

    async fn run(self, token: CancellationToken) {
        tracing::info!(
            hostname = self.identity.hostname(),
            interval_secs = self.config.load().collect_interval_seconds,
            "Telemetry collector started"
        );

        loop {
            // Errors are already logged and counted
            let _ = self.run_cycle().await;

            if token.is_cancelled() {
                break;
            }

            // Re-read so interval changes apply to this sleep
            let interval = self.config.load().collect_interval();
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::info!("Shutdown requested, running final telemetry cycle");
                    let _ = self.run_cycle().await;
                    break;
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }

        tracing::info!(
            runs = self.identity.run_counter(),
            "Telemetry collector stopped"
        );
    }
}

fn push_record(
    encoded: Result<Fragment, EncodingError>,
    records: &mut Vec<Fragment>,
    report: &mut CycleReport,
    api_key: &str,
) {
    match encoded {
        Ok(fragment) => records.push(fragment),
        Err(e) => {
            let kind = match &e {
                EncodingError::Record { kind, .. } => *kind,
                EncodingError::Envelope { .. } => "envelope",
            };
            metrics::record_dropped(kind);
            report.dropped_records += 1;
            tracing::warn!(
                api_key = %SensitiveApiKey::new(api_key),
                error = %e,
                "Dropping telemetry record"
            );
        }
    }
}

/// Handle to a running collector task
pub struct SchedulerHandle {
    token: CancellationToken,
    state: Arc<AtomicU8>,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    pub fn state(&self) -> SchedulerState {
        SchedulerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn watch(&self) -> StateWatch {
        StateWatch(Arc::clone(&self.state))
    }

    /// Ask the worker to stop after its current (or one final) cycle
    pub fn request_shutdown(&self) {
        let _ = self.state.compare_exchange(
            SchedulerState::Running as u8,
            SchedulerState::ShuttingDown as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.token.cancel();
    }

    /// Request shutdown and wait up to `timeout` for the worker to stop
    pub async fn shutdown(mut self, timeout: Duration) -> ShutdownOutcome {
        self.request_shutdown();

        match tokio::time::timeout(timeout, &mut self.join).await {
            Ok(Ok(())) => ShutdownOutcome::Stopped,
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Telemetry collector task ended abnormally");
                self.state
                    .store(SchedulerState::Stopped as u8, Ordering::Release);
                ShutdownOutcome::Stopped
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = timeout.as_millis(),
                    "Telemetry collector did not stop in time, continuing shutdown"
                );
                ShutdownOutcome::TimedOut
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TelemetryConfig;
    use crate::error::DeliveryError;
    use crate::exchange::{Exchange, ExchangeStatus, Message};
    use crate::sink::test_support::RecordingTransport;
    use crate::sink::{HttpReply, TelemetryTransport};
    use async_trait::async_trait;
    use reqwest::{Method, StatusCode};
    use serde_json::{json, Value};

    struct Fixture {
        registry: Arc<KeyedQueueRegistry>,
        identity: Arc<RunIdentity>,
        config: SharedConfig,
        transport: RecordingTransport,
    }

    impl Fixture {
        fn new(config: TelemetryConfig) -> Self {
            Self {
                registry: Arc::new(KeyedQueueRegistry::new()),
                identity: Arc::new(RunIdentity::new("gw-1", 1_700_000_000_000)),
                config: config.into_shared(),
                transport: RecordingTransport::new(),
            }
        }

        fn statistics_only() -> Self {
            Self::new(TelemetryConfig {
                trace_exchanges: false,
                ..Default::default()
            })
        }

        fn scheduler(&self) -> CollectorScheduler {
            let sink = TelemetrySink::new(
                "localhost",
                9200,
                Arc::clone(&self.identity),
                Box::new(self.transport.clone()),
            );
            CollectorScheduler::new(
                Arc::clone(&self.registry),
                sink,
                Arc::clone(&self.identity),
                Arc::clone(&self.config),
            )
        }

        fn enqueue(&self, api_key: &str, id: &str) {
            let exchange = Exchange::new(id, Message::request().with_body("ping"))
                .with_response(Message::response(200).with_body("pong"))
                .with_status(ExchangeStatus::Completed)
                .with_timings(Some(100), Some(110))
                .with_api_key(api_key);
            self.registry.enqueue(api_key, Arc::new(exchange));
        }
    }

    fn statistic(id: &str) -> Value {
        json!({"excId": id, "excStatus": "COMPLETED", "code": 200, "time": 10})
    }

    fn body(call: &crate::sink::test_support::RecordedCall) -> Value {
        serde_json::from_str(&call.body).unwrap()
    }

    #[tokio::test]
    async fn test_cycle_delivers_statistics_in_enqueue_order() {
        let fx = Fixture::statistics_only();
        for id in ["r0", "r1", "r2"] {
            fx.enqueue("k1", id);
        }

        let report = fx.scheduler().run_cycle().await.unwrap();
        assert_eq!(report.statistics_records, 3);
        assert_eq!(report.deliveries, 1);

        let calls = fx.transport.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0].url,
            "http://localhost:9200/statistics/gw-1-1700000000000-0"
        );
        assert_eq!(
            body(&calls[0]),
            json!({"gw-1": [{"k1": [statistic("r0"), statistic("r1"), statistic("r2")]}]})
        );
    }

    #[tokio::test]
    async fn test_cycle_delivers_both_collections() {
        let fx = Fixture::new(TelemetryConfig::default());
        fx.enqueue("k1", "1");
        fx.enqueue("k2", "2");

        let report = fx.scheduler().run_cycle().await.unwrap();
        assert_eq!(report.keys_drained, 2);
        assert_eq!(report.deliveries, 2);

        let calls = fx.transport.calls();
        assert!(calls[0].url.contains("/statistics/"));
        assert!(calls[1].url.contains("/exchanges/"));

        let snapshots = body(&calls[1]);
        let per_key = snapshots["gw-1"].as_array().unwrap();
        assert_eq!(per_key.len(), 2);
        for envelope in per_key {
            let (_, records) = envelope.as_object().unwrap().iter().next().unwrap();
            assert_eq!(records[0]["Request"]["body"], json!("ping"));
        }
    }

    #[tokio::test]
    async fn test_empty_cycle_sends_nothing_but_advances_counter() {
        let fx = Fixture::new(TelemetryConfig::default());
        let scheduler = fx.scheduler();

        let report = scheduler.run_cycle().await.unwrap();
        assert_eq!(report, CycleReport::default());
        assert!(fx.transport.calls().is_empty());
        assert_eq!(fx.identity.run_counter(), 1);
    }

    #[tokio::test]
    async fn test_idle_key_contributes_nothing() {
        let fx = Fixture::statistics_only();
        let scheduler = fx.scheduler();
        fx.enqueue("idle", "1");
        fx.enqueue("busy", "2");
        scheduler.run_cycle().await.unwrap();

        fx.enqueue("busy", "3");
        scheduler.run_cycle().await.unwrap();

        let calls = fx.transport.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(body(&calls[1]), json!({"gw-1": [{"busy": [statistic("3")]}]}));
        assert!(calls[1].url.ends_with("-1"));
    }

    #[tokio::test]
    async fn test_tracing_disabled_skips_delivery() {
        let fx = Fixture::new(TelemetryConfig {
            trace_statistics: false,
            trace_exchanges: false,
            ..Default::default()
        });
        fx.enqueue("k1", "1");

        let report = fx.scheduler().run_cycle().await.unwrap();
        assert_eq!(report.exchanges_drained, 1);
        assert_eq!(report.deliveries, 0);
        assert!(fx.transport.calls().is_empty());
        assert_eq!(fx.registry.pending("k1"), 0);
    }

    #[tokio::test]
    async fn test_delivery_failure_discards_cycle() {
        let fx = Fixture::statistics_only();
        let scheduler = fx.scheduler();
        fx.transport.reply_with(StatusCode::SERVICE_UNAVAILABLE);

        fx.enqueue("k1", "lost");
        let result = scheduler.run_cycle().await;
        assert!(matches!(result, Err(CycleError::Delivery(_))));
        assert_eq!(fx.identity.run_counter(), 1);

        fx.enqueue("k1", "kept");
        scheduler.run_cycle().await.unwrap();

        let calls = fx.transport.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(body(&calls[1]), json!({"gw-1": [{"k1": [statistic("kept")]}]}));
    }

    #[tokio::test]
    async fn test_statistics_failure_skips_snapshot_delivery() {
        let fx = Fixture::new(TelemetryConfig::default());
        fx.transport.reply_with(StatusCode::BAD_REQUEST);
        fx.enqueue("k1", "1");

        assert!(fx.scheduler().run_cycle().await.is_err());
        assert_eq!(fx.transport.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_config_changes_apply_next_cycle() {
        let fx = Fixture::statistics_only();
        let scheduler = fx.scheduler();

        fx.config.store(Arc::new(TelemetryConfig {
            trace_statistics: false,
            trace_exchanges: true,
            body_byte_limit: 2,
            ..Default::default()
        }));
        fx.enqueue("k1", "1");
        scheduler.run_cycle().await.unwrap();

        let calls = fx.transport.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].url.contains("/exchanges/"));
        assert_eq!(body(&calls[0])["gw-1"][0]["k1"][0]["Request"]["body"], json!("pi"));
    }

    #[tokio::test]
    async fn test_shutdown_runs_final_cycle_and_stops() {
        let fx = Fixture::new(TelemetryConfig {
            collect_interval_seconds: 3600,
            trace_exchanges: false,
            ..Default::default()
        });
        let handle = fx.scheduler().spawn();

        // Let the first (empty) cycle finish and the worker go to sleep
        while fx.identity.run_counter() == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(handle.state(), SchedulerState::Running);

        fx.enqueue("k1", "late");
        let outcome = handle.shutdown(Duration::from_secs(5)).await;
        assert_eq!(outcome, ShutdownOutcome::Stopped);

        let calls = fx.transport.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(body(&calls[0]), json!({"gw-1": [{"k1": [statistic("late")]}]}));
        assert_eq!(fx.identity.run_counter(), 2);
    }

    #[tokio::test]
    async fn test_request_shutdown_marks_shutting_down() {
        let fx = Fixture::new(TelemetryConfig {
            collect_interval_seconds: 3600,
            ..Default::default()
        });
        let handle = fx.scheduler().spawn();
        handle.request_shutdown();
        assert_ne!(handle.state(), SchedulerState::Running);

        assert_eq!(
            handle.shutdown(Duration::from_secs(5)).await,
            ShutdownOutcome::Stopped
        );
    }

    /// Backend that accepts the connection and never answers
    struct StalledTransport;

    #[async_trait]
    impl TelemetryTransport for StalledTransport {
        async fn issue(
            &self,
            _method: Method,
            _url: &str,
            _body: String,
        ) -> Result<HttpReply, DeliveryError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_shutdown_gives_up_on_stuck_worker() {
        let fx = Fixture::new(TelemetryConfig {
            collect_interval_seconds: 3600,
            trace_exchanges: false,
            ..Default::default()
        });
        let sink = TelemetrySink::new(
            "localhost",
            9200,
            Arc::clone(&fx.identity),
            Box::new(StalledTransport),
        );
        let scheduler = CollectorScheduler::new(
            Arc::clone(&fx.registry),
            sink,
            Arc::clone(&fx.identity),
            Arc::clone(&fx.config),
        );
        fx.enqueue("k1", "1");

        let handle = scheduler.spawn();
        let watch = handle.watch();
        let outcome = handle.shutdown(Duration::from_millis(100)).await;

        assert_eq!(outcome, ShutdownOutcome::TimedOut);
        assert_eq!(watch.get(), SchedulerState::ShuttingDown);
        assert_eq!(fx.identity.run_counter(), 0);
    }
}
