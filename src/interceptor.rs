//! axum middleware that reports finished exchanges
//!
//! Mount it inside [`crate::auth::api_key_middleware`] so the API key is
//! already attached when the request arrives here.
//!
//! Bodies are streamed through untouched. Only the first
//! [`ExchangeObserver::capture_limit`] bytes of each are kept for the record,
//! and the exchange is reported once the response body has been fully sent.

use crate::auth::ApiKey;
use crate::collector::ExchangeObserver;
use crate::exchange::{current_millis, Exchange, ExchangeStatus, HeaderField, Message};
use crate::logging::SensitiveApiKey;
use axum::{
    body::{Body, BodyDataStream, HttpBody},
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use bytes::{Bytes, BytesMut};
use futures::stream::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

/// Shared observer handed to the middleware as state
pub type ObserverState = Arc<dyn ExchangeObserver>;

type Capture = Arc<Mutex<BytesMut>>;

/// Tee request and response bodies, then notify the observer once the response is done
///
/// Requests without an [`ApiKey`] extension are passed through untouched.
pub async fn statistics_middleware(
    State(observer): State<ObserverState>,
    req: Request,
    next: Next,
) -> Response {
    let api_key = req.extensions().get::<ApiKey>().map(|key| key.0.clone());
    let Some(api_key) = api_key else {
        return next.run(req).await;
    };

    let limit = observer.capture_limit();
    let (parts, body) = req.into_parts();
    let request_headers = header_fields(&parts.headers);
    let request_capture: Capture = Arc::default();

    let tapped = body.into_data_stream().map({
        let capture = Arc::clone(&request_capture);
        move |chunk| {
            if let Ok(bytes) = &chunk {
                append_capped(&mut lock(&capture), bytes, limit);
            }
            chunk
        }
    });
    let req = Request::from_parts(parts, Body::from_stream(tapped));

    let req_sent = current_millis();
    let response = next.run(req).await;
    let (parts, body) = response.into_parts();

    let pending = PendingExchange {
        observer,
        api_key,
        request_headers,
        request_capture,
        req_sent,
        status_code: parts.status.as_u16(),
        response_headers: header_fields(&parts.headers),
    };

    // Nothing to stream, and hyper may never poll an empty body
    if body.is_end_stream() {
        pending.finish(Bytes::new(), ExchangeStatus::Completed);
        return Response::from_parts(parts, body);
    }

    let tap = ResponseTap {
        upstream: body.into_data_stream(),
        captured: BytesMut::new(),
        limit,
        pending: Some(pending),
    };
    Response::from_parts(parts, Body::from_stream(tap))
}

/// Everything known about an exchange before its response body has been sent
struct PendingExchange {
    observer: ObserverState,
    api_key: String,
    request_headers: Vec<HeaderField>,
    request_capture: Capture,
    req_sent: u64,
    status_code: u16,
    response_headers: Vec<HeaderField>,
}

impl PendingExchange {
    fn finish(self, response_body: Bytes, status: ExchangeStatus) {
        let request_body = lock(&self.request_capture).split().freeze();

        let request = Message {
            status_code: 0,
            headers: self.request_headers,
            body: request_body,
        };
        let response = Message {
            status_code: self.status_code,
            headers: self.response_headers,
            body: response_body,
        };

        let exchange = Exchange::new(uuid::Uuid::new_v4().to_string(), request)
            .with_response(response)
            .with_status(status)
            .with_timings(Some(self.req_sent), Some(current_millis()))
            .with_api_key(self.api_key);
        self.observer.exchange_finished(Arc::new(exchange));
    }
}

/// Response body stream that forwards every chunk and keeps a capped copy
struct ResponseTap {
    upstream: BodyDataStream,
    captured: BytesMut,
    limit: Option<usize>,
    pending: Option<PendingExchange>,
}

impl ResponseTap {
    fn finish(&mut self, status: ExchangeStatus) {
        if let Some(pending) = self.pending.take() {
            pending.finish(self.captured.split().freeze(), status);
        }
    }
}

impl Stream for ResponseTap {
    type Item = Result<Bytes, axum::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        match this.upstream.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                append_capped(&mut this.captured, &chunk, this.limit);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                if let Some(pending) = &this.pending {
                    tracing::warn!(
                        api_key = %SensitiveApiKey::new(&pending.api_key),
                        error = %e,
                        "Upstream response body failed"
                    );
                }
                this.finish(ExchangeStatus::Failed);
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.finish(ExchangeStatus::Completed);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ResponseTap {
    fn drop(&mut self) {
        if let Some(pending) = &self.pending {
            tracing::debug!(
                api_key = %SensitiveApiKey::new(&pending.api_key),
                "Response body dropped before completion"
            );
        }
        self.finish(ExchangeStatus::Failed);
    }
}

fn append_capped(buf: &mut BytesMut, chunk: &[u8], limit: Option<usize>) {
    let room = limit.map_or(chunk.len(), |limit| limit.saturating_sub(buf.len()));
    buf.extend_from_slice(&chunk[..room.min(chunk.len())]);
}

fn lock(capture: &Mutex<BytesMut>) -> MutexGuard<'_, BytesMut> {
    capture.lock().unwrap_or_else(PoisonError::into_inner)
}

fn header_fields(headers: &HeaderMap) -> Vec<HeaderField> {
    headers
        .iter()
        .map(|(name, value)| {
            HeaderField::new(
                name.as_str(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}
