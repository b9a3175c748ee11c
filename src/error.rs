use reqwest::StatusCode;
use thiserror::Error;

/// A record or envelope could not be turned into JSON
#[derive(Debug, Error)]
pub enum EncodingError {
    /// Serializing a single record failed
    #[error("failed to encode {kind} record for exchange {exchange_id}: {source}")]
    Record {
        kind: &'static str,
        exchange_id: String,
        #[source]
        source: serde_json::Error,
    },
    /// Wrapping fragments into a named envelope failed
    #[error("failed to combine envelope '{name}': {source}")]
    Envelope {
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

/// The telemetry backend did not accept a batch
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Destination could not be built from the configured host/port
    #[error("invalid telemetry destination '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    /// Connection, timeout or protocol failure before a status was received
    #[error("telemetry transport error: {0}")]
    Transport(#[from] reqwest::Error),
    /// Backend answered with a non-2xx status
    #[error("telemetry backend returned {status}: {body}")]
    Status { status: StatusCode, body: String },
}

/// Reason a collection cycle was aborted
///
/// Everything drained during an aborted cycle that had not been delivered yet
/// is discarded.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

impl CycleError {
    /// Short label used for metrics and log fields
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Encoding(_) => "encoding",
            Self::Delivery(DeliveryError::InvalidUrl { .. }) => "invalid_url",
            Self::Delivery(DeliveryError::Transport(_)) => "transport",
            Self::Delivery(DeliveryError::Status { .. }) => "status",
        }
    }
}
