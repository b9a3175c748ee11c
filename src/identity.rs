//! Process identity used to namespace telemetry destinations

use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};

/// Hostname and start instant of this process, plus the collector run counter
///
/// Built once at startup and shared by reference; only the counter changes.
#[derive(Debug)]
pub struct RunIdentity {
    hostname: String,
    start_millis: i64,
    run_counter: AtomicU64,
}

impl RunIdentity {
    /// Resolve the hostname and capture the start instant
    pub fn resolve() -> Self {
        Self::new(resolve_hostname(), chrono::Utc::now().timestamp_millis())
    }

    pub fn new(hostname: impl Into<String>, start_millis: i64) -> Self {
        Self {
            hostname: hostname.into(),
            start_millis,
            run_counter: AtomicU64::new(0),
        }
    }

    /// Hostname, empty if it could not be resolved
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn start_millis(&self) -> i64 {
        self.start_millis
    }

    pub fn run_counter(&self) -> u64 {
        self.run_counter.load(Ordering::Acquire)
    }

    /// Advance the run counter; called once per collector cycle
    pub fn advance(&self) -> u64 {
        self.run_counter.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// `hostname-startInstant-runCounter`
    pub fn destination_suffix(&self) -> String {
        format!(
            "{}-{}-{}",
            self.hostname,
            self.start_millis,
            self.run_counter()
        )
    }
}

/// Look up the local hostname, falling back to the `hostname` command
///
/// Returns an empty string when both fail.
pub fn resolve_hostname() -> String {
    match hostname::get() {
        Ok(name) => {
            let name = name.to_string_lossy().trim().to_string();
            if !name.is_empty() {
                return name;
            }
        }
        Err(e) => {
            tracing::debug!(error = %e, "Hostname lookup failed, asking the OS");
        }
    }

    match hostname_from_command() {
        Some(name) => name,
        None => {
            tracing::warn!("Unable to resolve hostname, telemetry destinations will omit it");
            String::new()
        }
    }
}

fn hostname_from_command() -> Option<String> {
    let output = Command::new("hostname").output().ok()?;
    if !output.status.success() {
        return None;
    }

    let name = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!name.is_empty()).then_some(name)
}
