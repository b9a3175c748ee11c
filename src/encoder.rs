//! JSON encoding of exchanges and batch envelopes
//!
//! Records are encoded once into raw JSON fragments; envelopes splice those
//! fragments in verbatim so the drain order is preserved byte for byte.

use crate::error::EncodingError;
use crate::exchange::{Exchange, HeaderField, Message};
use serde::Serialize;
use serde_json::value::RawValue;
use std::collections::BTreeMap;

/// Raw, already-serialized JSON value
pub type Fragment = Box<RawValue>;

/// Compact per-exchange statistics
#[derive(Debug, Serialize)]
pub struct StatisticsRecord<'a> {
    #[serde(rename = "excId")]
    pub exc_id: &'a str,
    #[serde(rename = "excStatus")]
    pub status: String,
    pub code: u16,
    pub time: i64,
}

impl<'a> StatisticsRecord<'a> {
    pub fn from_exchange(exchange: &'a Exchange) -> Self {
        Self {
            exc_id: &exchange.id,
            status: exchange.status.to_string(),
            code: exchange.response_code(),
            time: exchange.elapsed_millis(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ExchangeSnapshot<'a> {
    #[serde(rename = "excId")]
    pub exc_id: &'a str,
    #[serde(rename = "Request")]
    pub request: MessageSnapshot,
    #[serde(rename = "Response")]
    pub response: MessageSnapshot,
}

#[derive(Debug, Default, Serialize)]
pub struct MessageSnapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

/// Snapshot policy, taken from the live configuration each cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotOptions {
    pub include_headers: bool,
    /// Byte limit on the decoded body, `None` for unlimited
    pub body_limit: Option<usize>,
}

impl Default for SnapshotOptions {
    fn default() -> Self {
        Self {
            include_headers: true,
            body_limit: None,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BatchEncoder {
    options: SnapshotOptions,
}

impl BatchEncoder {
    pub fn new(options: SnapshotOptions) -> Self {
        Self { options }
    }

    pub fn encode_statistics(&self, exchange: &Exchange) -> Result<Fragment, EncodingError> {
        to_fragment(&StatisticsRecord::from_exchange(exchange)).map_err(|source| {
            EncodingError::Record {
                kind: "statistics",
                exchange_id: exchange.id.clone(),
                source,
            }
        })
    }

    pub fn encode_snapshot(&self, exchange: &Exchange) -> Result<Fragment, EncodingError> {
        let snapshot = ExchangeSnapshot {
            exc_id: &exchange.id,
            request: self.snapshot_message(Some(&exchange.request)),
            response: self.snapshot_message(exchange.response.as_ref()),
        };

        to_fragment(&snapshot).map_err(|source| EncodingError::Record {
            kind: "snapshot",
            exchange_id: exchange.id.clone(),
            source,
        })
    }

    fn snapshot_message(&self, message: Option<&Message>) -> MessageSnapshot {
        let Some(message) = message else {
            return MessageSnapshot::default();
        };

        let headers = (self.options.include_headers && !message.headers.is_empty())
            .then(|| merge_headers(&message.headers));

        let decoded = message.body_as_string_decoded();
        let body = truncate_to_bytes(&decoded, self.options.body_limit);

        MessageSnapshot {
            headers,
            body: (!body.is_empty()).then(|| body.to_string()),
        }
    }
}

/// Header map for a snapshot; repeated names are joined with `, `
fn merge_headers(headers: &[HeaderField]) -> BTreeMap<String, String> {
    let mut merged: BTreeMap<String, String> = BTreeMap::new();
    for header in headers {
        merged
            .entry(header.name.clone())
            .and_modify(|value| {
                value.push_str(", ");
                value.push_str(&header.value);
            })
            .or_insert_with(|| header.value.clone());
    }
    merged
}

/// Wrap fragments as `{"<name>": [f0, f1, ...]}`
///
/// Callers skip empty fragment lists instead of emitting an empty array.
pub fn combine(name: &str, fragments: &[Fragment]) -> Result<Fragment, EncodingError> {
    let mut envelope = BTreeMap::new();
    envelope.insert(name, fragments);

    to_fragment(&envelope).map_err(|source| EncodingError::Envelope {
        name: name.to_string(),
        source,
    })
}

fn to_fragment<T: Serialize + ?Sized>(value: &T) -> Result<Fragment, serde_json::Error> {
    serde_json::to_string(value).and_then(RawValue::from_string)
}

/// Leading `limit` bytes of `body`, backing off to a char boundary
fn truncate_to_bytes(body: &str, limit: Option<usize>) -> &str {
    let Some(limit) = limit else {
        return body;
    };
    if limit >= body.len() {
        return body;
    }

    let mut end = limit;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{ExchangeStatus, Message};
    use serde_json::{json, Value};

    fn fragment(raw: &str) -> Fragment {
        RawValue::from_string(raw.to_string()).unwrap()
    }

    fn parse(fragment: &Fragment) -> Value {
        serde_json::from_str(fragment.get()).unwrap()
    }

    fn sample_exchange() -> Exchange {
        Exchange::new(
            "42",
            Message::request()
                .with_header("Host", "api.example.com")
                .with_body("Hello World"),
        )
        .with_response(
            Message::response(200)
                .with_header("Content-Type", "text/plain")
                .with_body("pong"),
        )
        .with_status(ExchangeStatus::Completed)
        .with_timings(Some(1_000), Some(1_037))
    }

    #[test]
    fn test_encode_statistics() {
        let encoded = BatchEncoder::default().encode_statistics(&sample_exchange()).unwrap();
        assert_eq!(
            encoded.get(),
            r#"{"excId":"42","excStatus":"COMPLETED","code":200,"time":37}"#
        );
    }

    #[test]
    fn test_encode_statistics_without_request_sent() {
        let exchange = sample_exchange().with_timings(None, Some(1_037));
        let encoded = BatchEncoder::default().encode_statistics(&exchange).unwrap();
        assert_eq!(parse(&encoded)["time"], json!(-1));
    }

    #[test]
    fn test_encode_statistics_without_response() {
        let exchange = Exchange::new("7", Message::request()).with_status(ExchangeStatus::Failed);
        let encoded = BatchEncoder::default().encode_statistics(&exchange).unwrap();
        assert_eq!(
            parse(&encoded),
            json!({"excId": "7", "excStatus": "FAILED", "code": 0, "time": -1})
        );
    }

    #[test]
    fn test_encode_snapshot_with_headers() {
        let encoded = BatchEncoder::default().encode_snapshot(&sample_exchange()).unwrap();
        assert_eq!(
            parse(&encoded),
            json!({
                "excId": "42",
                "Request": {"headers": {"Host": "api.example.com"}, "body": "Hello World"},
                "Response": {"headers": {"Content-Type": "text/plain"}, "body": "pong"},
            })
        );
    }

    #[test]
    fn test_encode_snapshot_without_headers() {
        let encoder = BatchEncoder::new(SnapshotOptions {
            include_headers: false,
            body_limit: None,
        });
        let value = parse(&encoder.encode_snapshot(&sample_exchange()).unwrap());
        assert!(value["Request"].get("headers").is_none());
        assert!(value["Response"].get("headers").is_none());
    }

    #[test]
    fn test_snapshot_joins_repeated_headers() {
        let exchange = Exchange::new("3", Message::request()).with_response(
            Message::response(200)
                .with_header("Set-Cookie", "a=1")
                .with_header("Content-Type", "text/plain")
                .with_header("Set-Cookie", "b=2"),
        );
        let value = parse(&BatchEncoder::default().encode_snapshot(&exchange).unwrap());
        assert_eq!(
            value["Response"]["headers"],
            json!({"Content-Type": "text/plain", "Set-Cookie": "a=1, b=2"})
        );
    }

    #[test]
    fn test_snapshot_body_truncated_to_limit() {
        let encoder = BatchEncoder::new(SnapshotOptions {
            include_headers: true,
            body_limit: Some(5),
        });
        let value = parse(&encoder.encode_snapshot(&sample_exchange()).unwrap());
        assert_eq!(value["Request"]["body"], json!("Hello"));
    }

    #[test]
    fn test_snapshot_body_unlimited() {
        let value = parse(&BatchEncoder::default().encode_snapshot(&sample_exchange()).unwrap());
        assert_eq!(value["Request"]["body"], json!("Hello World"));
    }

    #[test]
    fn test_snapshot_omits_empty_body_and_missing_response() {
        let exchange = Exchange::new("9", Message::request());
        let value = parse(&BatchEncoder::default().encode_snapshot(&exchange).unwrap());
        assert_eq!(value, json!({"excId": "9", "Request": {}, "Response": {}}));
    }

    #[test]
    fn test_zero_limit_drops_body() {
        let encoder = BatchEncoder::new(SnapshotOptions {
            include_headers: false,
            body_limit: Some(0),
        });
        let value = parse(&encoder.encode_snapshot(&sample_exchange()).unwrap());
        assert!(value["Request"].get("body").is_none());
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate_to_bytes("héllo", Some(2)), "h");
        assert_eq!(truncate_to_bytes("héllo", Some(3)), "hé");
        assert_eq!(truncate_to_bytes("abc", Some(10)), "abc");
        assert_eq!(truncate_to_bytes("abc", None), "abc");
    }

    #[test]
    fn test_combine() {
        let combined = combine("k1", &[fragment(r#""a""#), fragment(r#""b""#)]).unwrap();
        assert_eq!(combined.get(), r#"{"k1":["a","b"]}"#);
    }

    #[test]
    fn test_combine_nests_envelopes_in_order() {
        let inner = combine("k1", &[fragment("{\"n\":0}"), fragment("{\"n\":1}")]).unwrap();
        let outer = combine("gw-1", &[inner]).unwrap();
        assert_eq!(outer.get(), r#"{"gw-1":[{"k1":[{"n":0},{"n":1}]}]}"#);
    }

    #[test]
    fn test_combine_escapes_name() {
        let combined = combine("we\"ird", &[fragment("1")]).unwrap();
        assert_eq!(parse(&combined), json!({"we\"ird": [1]}));
    }
}
