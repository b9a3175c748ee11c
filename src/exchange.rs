//! Request/response exchange as seen by the telemetry pipeline
//!
//! The gateway owns exchanges; the collector only holds an `Arc` until the
//! next drain.

use bytes::Bytes;
use std::borrow::Cow;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Lifecycle state of an exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeStatus {
    Started,
    Received,
    Sent,
    Completed,
    Failed,
}

impl fmt::Display for ExchangeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Started => "STARTED",
            Self::Received => "RECEIVED",
            Self::Sent => "SENT",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub name: String,
    pub value: String,
}

impl HeaderField {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Request or response message
#[derive(Debug, Clone, Default)]
pub struct Message {
    /// HTTP status code, 0 for requests
    pub status_code: u16,
    pub headers: Vec<HeaderField>,
    /// Decoded (de-chunked, decompressed) body
    pub body: Bytes,
}

impl Message {
    pub fn request() -> Self {
        Self::default()
    }

    pub fn response(status_code: u16) -> Self {
        Self {
            status_code,
            ..Self::default()
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(HeaderField::new(name, value));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn body_as_string_decoded(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

#[derive(Debug, Clone)]
pub struct Exchange {
    pub id: String,
    pub status: ExchangeStatus,
    pub request: Message,
    pub response: Option<Message>,
    /// Epoch millis when the request was forwarded, if it ever was
    pub time_req_sent: Option<u64>,
    /// Epoch millis when the response was returned to the client
    pub time_res_sent: Option<u64>,
    /// API key property set by the authentication stage
    pub api_key: Option<String>,
}

impl Exchange {
    pub fn new(id: impl Into<String>, request: Message) -> Self {
        Self {
            id: id.into(),
            status: ExchangeStatus::Started,
            request,
            response: None,
            time_req_sent: None,
            time_res_sent: None,
            api_key: None,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_response(mut self, response: Message) -> Self {
        self.response = Some(response);
        self
    }

    pub fn with_status(mut self, status: ExchangeStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_timings(mut self, req_sent: Option<u64>, res_sent: Option<u64>) -> Self {
        self.time_req_sent = req_sent;
        self.time_res_sent = res_sent;
        self
    }

    /// Milliseconds between request-sent and response-sent, or -1 if either is missing
    pub fn elapsed_millis(&self) -> i64 {
        match (self.time_req_sent, self.time_res_sent) {
            (Some(req), Some(res)) => (res as i64).saturating_sub(req as i64),
            _ => -1,
        }
    }

    /// Status code of the response, 0 if there is none
    pub fn response_code(&self) -> u16 {
        self.response.as_ref().map_or(0, |r| r.status_code)
    }
}

/// Current time in epoch millis
pub fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
