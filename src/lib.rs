//! Per-API-key exchange statistics for the gateway
//!
//! Request tasks hand finished exchanges to a [`collector::StatisticsCollector`];
//! a single background task drains them on a timer, encodes them as JSON and
//! PUTs them to the telemetry backend.
//!
//! ```text
//! request tasks ──enqueue──▶ KeyedQueueRegistry
//!                                  │ drain (collector task only)
//!                                  ▼
//!                            BatchEncoder ──▶ TelemetrySink ──PUT──▶ backend
//! ```

pub mod auth;
pub mod collector;
pub mod config;
pub mod encoder;
pub mod error;
pub mod exchange;
pub mod identity;
pub mod interceptor;
pub mod logging;
pub mod metrics;
pub mod registry;
pub mod scheduler;
pub mod sink;

pub use collector::{ExchangeObserver, StatisticsCollector};
pub use config::{SharedConfig, TelemetryConfig};
pub use exchange::{Exchange, ExchangeStatus, Message};
pub use scheduler::{SchedulerState, ShutdownOutcome};

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize tracing/logging
///
/// Note: This function can only be called once per process.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .init();
}

/// Initialize tracing with JSON-formatted output
pub fn init_json_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().with_target(true))
        .init();
}
