use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Install the Prometheus recorder and register metric descriptions
///
/// Fails if a global recorder is already installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    init_metric_descriptions();

    Ok(handle)
}

/// Register metric descriptions (can be called multiple times safely)
pub fn init_metric_descriptions() {
    describe_counter!(
        "telemetry_exchanges_enqueued_total",
        "Finished exchanges queued for telemetry"
    );
    describe_counter!(
        "telemetry_records_encoded_total",
        "Records encoded by the collector"
    );
    describe_counter!(
        "telemetry_records_dropped_total",
        "Records dropped because they could not be encoded"
    );
    describe_counter!(
        "telemetry_deliveries_total",
        "Envelope deliveries to the telemetry backend"
    );
    describe_counter!("telemetry_cycles_total", "Completed collector cycles");
    describe_gauge!(
        "telemetry_queue_keys",
        "Distinct API keys with a collector queue"
    );
    describe_histogram!(
        "telemetry_cycle_duration_seconds",
        "Time spent draining, encoding and delivering one cycle"
    );

    gauge!("telemetry_collector_info", "version" => env!("CARGO_PKG_VERSION")).set(1.0);
}

/// Counted without a per-key label
pub fn record_enqueued() {
    counter!("telemetry_exchanges_enqueued_total").increment(1);
}

pub fn record_queue_keys(count: usize) {
    gauge!("telemetry_queue_keys").set(count as f64);
}

pub fn record_encoded(kind: &'static str, count: u64) {
    counter!("telemetry_records_encoded_total", "kind" => kind).increment(count);
}

pub fn record_dropped(kind: &'static str) {
    counter!("telemetry_records_dropped_total", "kind" => kind).increment(1);
}

pub fn record_delivery(collection: &str, outcome: &'static str) {
    counter!(
        "telemetry_deliveries_total",
        "collection" => collection.to_string(),
        "outcome" => outcome,
    )
    .increment(1);
}

pub fn record_cycle(outcome: &'static str, duration: Duration) {
    counter!("telemetry_cycles_total", "outcome" => outcome).increment(1);
    histogram!("telemetry_cycle_duration_seconds").record(duration.as_secs_f64());
}
