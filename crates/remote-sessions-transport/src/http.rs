//! HTTP control channel against the remote session endpoint.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use remote_sessions_core::{
    ControlChannel, ControlError, SessionConfig, SessionInfo, SessionKind, SessionStartResult,
    StartOptions, StopResult,
};
use reqwest::{RequestBuilder, StatusCode, Url, header};
use serde::de::DeserializeOwned;

use crate::protocol::StartRequest;

/// Control channel speaking the `/sessions/{kind}/...` REST contract.
///
/// Calls go through the proxy layer unchanged; only the status category
/// (2xx, 404, other) is interpreted.
pub struct HttpControlChannel {
    http: reqwest::Client,
    base: Url,
    cache_bust: AtomicU64,
}

impl HttpControlChannel {
    /// Create a channel with a default HTTP client.
    ///
    /// # Errors
    /// Returns error if `base_url` is not an absolute http(s) URL.
    pub fn new(base_url: &str) -> Result<Self, ControlError> {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    /// Create a channel with a caller-supplied HTTP client (auth headers,
    /// proxies, TLS roots).
    ///
    /// # Errors
    /// Returns error if `base_url` is not an absolute http(s) URL.
    pub fn with_client(http: reqwest::Client, base_url: &str) -> Result<Self, ControlError> {
        let base = Url::parse(base_url)
            .map_err(|e| ControlError::Transport(format!("invalid base URL {base_url}: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(ControlError::Transport(format!("invalid base URL {base_url}")));
        }
        Ok(Self {
            http,
            base,
            cache_bust: AtomicU64::new(0),
        })
    }

    /// Create a channel from configuration, applying the request timeout.
    ///
    /// # Errors
    /// Returns error if the client cannot be built or the URL is invalid.
    pub fn from_config(config: &SessionConfig) -> Result<Self, ControlError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| ControlError::Transport(e.to_string()))?;
        Self::with_client(http, &config.base_url)
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    /// Unique value per call so no cache can answer an info poll.
    fn next_cache_bust(&self) -> String {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let n = self.cache_bust.fetch_add(1, Ordering::Relaxed);
        format!("{millis}-{n}")
    }

    async fn send<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, ControlError> {
        let resp = req
            .send()
            .await
            .map_err(|e| ControlError::Transport(e.to_string()))?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ControlError::NotFound);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ControlError::Status {
                code: status.as_u16(),
                body,
            });
        }

        resp.json::<T>()
            .await
            .map_err(|e| ControlError::Decode(e.to_string()))
    }
}

#[async_trait]
impl ControlChannel for HttpControlChannel {
    async fn start(
        &self,
        resource_id: &str,
        kind: SessionKind,
        options: &StartOptions,
    ) -> Result<SessionStartResult, ControlError> {
        let url = self.endpoint(&["sessions", kind.as_str(), "start"]);
        tracing::debug!(resource_id, %kind, %url, "start request");
        self.send(self.http.post(url).json(&StartRequest {
            resource_id,
            options,
        }))
        .await
    }

    async fn stop(
        &self,
        resource_id: &str,
        kind: SessionKind,
        session_id: &str,
    ) -> Result<StopResult, ControlError> {
        let url = self.endpoint(&["sessions", kind.as_str(), session_id]);
        tracing::debug!(resource_id, %kind, %url, "stop request");
        self.send(self.http.delete(url)).await
    }

    async fn info(&self, resource_id: &str, kind: SessionKind) -> Result<SessionInfo, ControlError> {
        let url = self.endpoint(&["sessions", kind.as_str(), "info"]);
        let cache_bust = self.next_cache_bust();
        self.send(
            self.http
                .get(url)
                .query(&[("resourceId", resource_id), ("cacheBust", cache_bust.as_str())])
                .header(header::CACHE_CONTROL, "no-cache"),
        )
        .await
    }
}
