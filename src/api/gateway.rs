/**
 * Fetch Gateway: one request/response exchange per resource key
 */
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use super::changes::{ResourceKey, Snapshot, VersionMarker};
use super::client::{self, ApiConfig};
use crate::error::Result;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("network error: {0}")]
    Network(String),
    #[error("not authorized (status {0})")]
    Auth(u16),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
}

impl GatewayError {
    /// Whether the caller should refresh credentials before retrying
    #[must_use]
    pub const fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }
}

#[async_trait]
pub trait FetchGateway: Send + Sync {
    /// # Errors
    ///
    /// Returns a `GatewayError` for transport failures, rejected credentials
    /// or an unusable response body.
    async fn fetch(&self, key: &ResourceKey) -> core::result::Result<Snapshot, GatewayError>;
}

/// Where the version marker of a fetched resource comes from
#[derive(Debug, Clone)]
pub enum VersionSource {
    /// A response header, e.g. `x-resource-version`
    Header(String),
    /// A JSON pointer into the body, e.g. `/currentRevision`
    Pointer(String),
}

impl Default for VersionSource {
    fn default() -> Self {
        Self::Header("x-resource-version".to_string())
    }
}

/// [`FetchGateway`] backed by the syndesis REST API
#[derive(Debug, Clone)]
pub struct HttpFetchGateway {
    client: reqwest::Client,
    config: ApiConfig,
    version_source: VersionSource,
}

impl HttpFetchGateway {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built
    pub fn new(config: ApiConfig, version_source: VersionSource) -> Result<Self> {
        let client = client::new(&config)?;
        Ok(Self {
            client,
            config,
            version_source,
        })
    }

    fn version_of(&self, headers: &reqwest::header::HeaderMap, body: &Value) -> core::result::Result<VersionMarker, GatewayError> {
        match &self.version_source {
            VersionSource::Header(name) => headers
                .get(name.as_str())
                .and_then(|v| v.to_str().ok())
                .map(|v| VersionMarker::new(v.trim_matches('"')))
                .ok_or_else(|| GatewayError::Decode(format!("missing version header {name}"))),
            VersionSource::Pointer(pointer) => match body.pointer(pointer) {
                Some(Value::String(s)) => Ok(VersionMarker::new(s.clone())),
                Some(Value::Number(n)) => Ok(VersionMarker::new(n.to_string())),
                _ => Err(GatewayError::Decode(format!("no version at {pointer}"))),
            },
        }
    }
}

#[async_trait]
impl FetchGateway for HttpFetchGateway {
    async fn fetch(&self, key: &ResourceKey) -> core::result::Result<Snapshot, GatewayError> {
        let url = self
            .config
            .base_url
            .join(&key.api_path())
            .map_err(|e| GatewayError::Network(format!("bad url for {key}: {e}")))?;

        debug!("GET {} for {}", url, key);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| GatewayError::Network(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(GatewayError::Auth(status.as_u16()));
        }
        if !status.is_success() {
            return Err(GatewayError::Network(format!("unexpected status {status}")));
        }

        let headers = response.headers().clone();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| GatewayError::Network(e.to_string()))?;
        let body: Value =
            serde_json::from_slice(&bytes).map_err(|e| GatewayError::Decode(e.to_string()))?;
        let version = self.version_of(&headers, &body)?;

        Ok(Snapshot::new(key.clone(), version, body))
    }
}
