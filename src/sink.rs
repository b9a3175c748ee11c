//! Delivery of JSON envelopes to the telemetry backend

use crate::config::TelemetryConfig;
use crate::encoder::Fragment;
use crate::error::DeliveryError;
use crate::identity::RunIdentity;
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Status and body returned by the backend
#[derive(Debug, Clone)]
pub struct HttpReply {
    pub status: StatusCode,
    pub body: String,
}

/// Blocking-style HTTP call used by the sink
#[async_trait]
pub trait TelemetryTransport: Send + Sync {
    async fn issue(&self, method: Method, url: &str, body: String)
        -> Result<HttpReply, DeliveryError>;
}

/// `reqwest`-backed transport
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Build a client honoring the configured timeout and outbound proxy
    pub fn from_config(config: &TelemetryConfig) -> Result<Self, DeliveryError> {
        let mut builder = reqwest::Client::builder().timeout(config.request_timeout());

        if let Some(proxy_cfg) = &config.proxy {
            let proxy_url = format!("http://{}:{}", proxy_cfg.host, proxy_cfg.port);
            let mut proxy = reqwest::Proxy::all(&proxy_url)?;
            if let Some(username) = &proxy_cfg.username {
                proxy = proxy.basic_auth(username, proxy_cfg.password.as_deref().unwrap_or(""));
            }
            builder = builder.proxy(proxy);
        }

        Ok(Self::new(builder.build()?))
    }
}

#[async_trait]
impl TelemetryTransport for ReqwestTransport {
    async fn issue(
        &self,
        method: Method,
        url: &str,
        body: String,
    ) -> Result<HttpReply, DeliveryError> {
        let response = self
            .client
            .request(method, url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Ok(HttpReply { status, body })
    }
}

/// Writes envelopes to `http://host:port/<collection>/<hostname-start-run>`
pub struct TelemetrySink {
    base_url: String,
    identity: Arc<RunIdentity>,
    // Serializes calls so a shared transport is never used concurrently
    transport: Mutex<Box<dyn TelemetryTransport>>,
}

impl TelemetrySink {
    pub fn new(
        host: &str,
        port: u16,
        identity: Arc<RunIdentity>,
        transport: Box<dyn TelemetryTransport>,
    ) -> Self {
        Self {
            base_url: format!("http://{}:{}", host, port),
            identity,
            transport: Mutex::new(transport),
        }
    }

    pub fn from_config(
        config: &TelemetryConfig,
        identity: Arc<RunIdentity>,
    ) -> Result<Self, DeliveryError> {
        let transport = ReqwestTransport::from_config(config)?;
        Ok(Self::new(
            &config.elastic_search_host,
            config.elastic_search_port,
            identity,
            Box::new(transport),
        ))
    }

    /// Full destination URL for `base_path` under the current run identity
    pub fn destination(&self, base_path: &str) -> String {
        format!(
            "{}{}{}",
            self.base_url,
            normalize_path(base_path),
            self.identity.destination_suffix()
        )
    }

    /// PUT `envelope` to `base_path`; anything but 2xx is a failure
    pub async fn deliver(&self, base_path: &str, envelope: &Fragment) -> Result<(), DeliveryError> {
        let url = self.destination(base_path);
        reqwest::Url::parse(&url).map_err(|e| DeliveryError::InvalidUrl {
            url: url.clone(),
            reason: e.to_string(),
        })?;

        let reply = {
            let transport = self.transport.lock().await;
            transport
                .issue(Method::PUT, &url, envelope.get().to_string())
                .await?
        };

        if !reply.status.is_success() {
            return Err(DeliveryError::Status {
                status: reply.status,
                body: reply.body,
            });
        }

        tracing::debug!(
            url = %url,
            status = reply.status.as_u16(),
            bytes = envelope.get().len(),
            "Delivered telemetry envelope"
        );
        Ok(())
    }
}

/// Ensure exactly one leading and one trailing slash
fn normalize_path(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{}/", trimmed)
    }
}
