//! Outbound HTTP plumbing
//!
//! The control plane only consumes HTTP: node stats/diag sampling and
//! server-group discovery. The client sits behind a small trait so tests
//! can script responses.

use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

/// Minimal HTTP GET abstraction.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn get(&self, url: &str) -> Result<Bytes>;
}

/// The production client, backed by reqwest. Callers needing timeouts
/// supply a pre-configured reqwest client.
pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

impl ReqwestHttpClient {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for ReqwestHttpClient {
    fn default() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn get(&self, url: &str) -> Result<Bytes> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Transport(format!(
                "http: GET {url} returned status {status}"
            )));
        }
        Ok(resp.bytes().await?)
    }
}

/// Shared default client handle.
pub fn default_http_client() -> Arc<dyn HttpClient> {
    Arc::new(ReqwestHttpClient::default())
}
