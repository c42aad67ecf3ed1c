//! Backend HTTP client: heartbeat exchange, alert delivery and update
//! downloads over `reqwest`.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use lockd_kernel::{AlertSink, HeartbeatTransport, NetworkError, PackageFetcher};
use lockd_store::Alert;
use lockd_types::HeartbeatRequest;
use reqwest::{Client, Response};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use url::Url;

use crate::config::HttpConfig;
use crate::error::HostError;

pub const API_KEY_HEADER: &str = "X-Device-Api-Key";

/// Device-scoped client for `<base>/api/devices/<id>/...`.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    base: Url,
    device_id: String,
    api_key: Option<String>,
    config: HttpConfig,
}

impl HttpBackend {
    pub fn new(
        base: Url,
        device_id: impl Into<String>,
        api_key: Option<String>,
        config: HttpConfig,
    ) -> Result<Self, HostError> {
        if base.cannot_be_a_base() {
            return Err(HostError::Config(format!("backend url '{base}' cannot carry a path")));
        }
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| HostError::Config(format!("build http client: {e}")))?;
        Ok(Self {
            client,
            base,
            device_id: device_id.into(),
            api_key,
            config,
        })
    }

    /// `<base>/api/devices/<device_id>/<leaf>/`, with the device id escaped.
    pub fn endpoint(&self, leaf: &str) -> Result<Url, NetworkError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| {
                let reason = format!("backend url '{}' cannot carry a path", self.base);
                NetworkError::Unreachable(reason)
            })?
            .pop_if_empty()
            .extend(["api", "devices", self.device_id.as_str(), leaf, ""]);
        Ok(url)
    }

    async fn post_json<B: Serialize + ?Sized>(
        &self,
        url: Url,
        body: &B,
    ) -> Result<Value, NetworkError> {
        let limit_ms = self.config.timeout.as_millis() as u64;
        let mut req = self.client.post(url.clone()).json(body);
        if let Some(key) = &self.api_key {
            req = req.header(API_KEY_HEADER, key);
        }

        // Host-level timeout is a hard cap over connect, send and headers.
        let response = match timeout(self.config.timeout, req.send()).await {
            Ok(Ok(r)) => r,
            Ok(Err(e)) if e.is_timeout() => return Err(NetworkError::Timeout(limit_ms)),
            Ok(Err(e)) => return Err(NetworkError::Unreachable(format!("{url}: {e}"))),
            Err(_) => return Err(NetworkError::Timeout(limit_ms)),
        };
        let status = response.status();
        if !status.is_success() {
            tracing::debug!(%url, status = status.as_u16(), "backend rejected request");
            return Err(NetworkError::Status {
                status: status.as_u16(),
            });
        }
        let body = read_limited(response, self.config.max_body_size).await?;
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Object(Default::default()));
        }
        serde_json::from_slice(&body).map_err(|e| NetworkError::Decode(e.to_string()))
    }
}

async fn read_limited(mut response: Response, limit: usize) -> Result<Vec<u8>, NetworkError> {
    if response.content_length().is_some_and(|len| len > limit as u64) {
        return Err(NetworkError::TooLarge { limit: limit as u64 });
    }
    let mut body = Vec::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| NetworkError::Unreachable(format!("read body failed: {e}")))?
    {
        if body.len() + chunk.len() > limit {
            return Err(NetworkError::TooLarge { limit: limit as u64 });
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

#[async_trait]
impl HeartbeatTransport for HttpBackend {
    async fn send(&self, request: &HeartbeatRequest) -> Result<Value, NetworkError> {
        let url = self.endpoint("data")?;
        self.post_json(url, request).await
    }
}

#[async_trait]
impl AlertSink for HttpBackend {
    async fn deliver(&self, alert: &Alert) -> Result<(), NetworkError> {
        let payload: Value = serde_json::from_str(&alert.body)
            .unwrap_or_else(|_| json!({ "message": alert.body }));
        let envelope = json!({
            "id": alert.id,
            "kind": alert.kind,
            "severity": alert.severity,
            "created_at": alert.created_at_ms,
            "attempt": alert.attempts + 1,
            "payload": payload,
        });
        let url = self.endpoint("alerts")?;
        self.post_json(url, &envelope).await.map(|_| ())
    }
}

/// Streams update packages to disk under a size cap.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    max_size: u64,
    overall: Duration,
}

impl HttpFetcher {
    pub fn new(config: &HttpConfig) -> Result<Self, HostError> {
        let client = Client::builder()
            .connect_timeout(config.timeout)
            .build()
            .map_err(|e| HostError::Config(format!("build download client: {e}")))?;
        Ok(Self {
            client,
            max_size: config.max_download_size,
            overall: config.download_timeout,
        })
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<u64, NetworkError> {
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| NetworkError::Unreachable(format!("{url}: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(NetworkError::Status {
                status: status.as_u16(),
            });
        }
        if response.content_length().is_some_and(|len| len > self.max_size) {
            return Err(NetworkError::TooLarge { limit: self.max_size });
        }

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| NetworkError::Unreachable(format!("create {}: {e}", dest.display())))?;
        let mut written = 0u64;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| {
                let reason = format!("download interrupted after {written} bytes: {e}");
                NetworkError::Unreachable(reason)
            })?
        {
            written += chunk.len() as u64;
            if written > self.max_size {
                return Err(NetworkError::TooLarge { limit: self.max_size });
            }
            file.write_all(&chunk)
                .await
                .map_err(|e| NetworkError::Unreachable(format!("write {}: {e}", dest.display())))?;
        }
        file.flush()
            .await
            .map_err(|e| NetworkError::Unreachable(format!("flush {}: {e}", dest.display())))?;
        Ok(written)
    }
}

#[async_trait]
impl PackageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<u64, NetworkError> {
        match timeout(self.overall, self.download(url, dest)).await {
            Ok(res) => res,
            Err(_) => Err(NetworkError::Timeout(self.overall.as_millis() as u64)),
        }
    }
}
