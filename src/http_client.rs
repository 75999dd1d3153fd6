//! HTTP transport module for requests routed through a proxy
//!
//! Every network call made by the prober, the downloader and the proxy
//! validator goes through [`ProxyTransport`], so tests can replace the wire
//! with a scripted transport.

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::header::{CONTENT_LENGTH, USER_AGENT};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::proxy_pool::ProxyEndpoint;

/// Failure of a single request attempt
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("unexpected status {0}")]
    Status(u16),
    #[error("failed to read body: {0}")]
    Body(String),
    #[error("request failed: {0}")]
    Request(String),
    #[error("cancelled")]
    Cancelled,
}

impl FetchError {
    /// Connection refused and timeouts are blamed on the proxy
    pub fn is_proxy_fault(&self) -> bool {
        matches!(self, FetchError::Connect(_) | FetchError::Timeout(_))
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout(err.to_string())
        } else if err.is_connect() {
            FetchError::Connect(err.to_string())
        } else if err.is_body() || err.is_decode() {
            FetchError::Body(err.to_string())
        } else {
            FetchError::Request(err.to_string())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadResponse {
    pub status: u16,
    /// Parsed `Content-Length`, if present and numeric
    pub content_length: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// HEAD and GET with a per-attempt timeout, optionally through a proxy
#[async_trait]
pub trait ProxyTransport: Send + Sync {
    async fn head(
        &self,
        url: &str,
        proxy: &ProxyEndpoint,
        user_agent: &str,
        timeout: Duration,
    ) -> Result<HeadResponse, FetchError>;

    /// Any status is returned as a response; callers decide what counts as success.
    async fn get(
        &self,
        url: &str,
        proxy: Option<&ProxyEndpoint>,
        user_agent: &str,
        timeout: Duration,
    ) -> Result<FetchResponse, FetchError>;

    /// Drop any per-proxy state kept for `proxy`
    fn forget(&self, _proxy: &ProxyEndpoint) {}
}

/// reqwest-backed transport, one client per proxy endpoint
pub struct HttpTransport {
    direct: reqwest::Client,
    clients: Mutex<HashMap<String, reqwest::Client>>,
}

impl HttpTransport {
    pub fn new() -> Result<Self, FetchError> {
        let direct = reqwest::Client::builder()
            .build()
            .map_err(|e| FetchError::Request(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            direct,
            clients: Mutex::new(HashMap::new()),
        })
    }

    fn client_for(&self, proxy: Option<&ProxyEndpoint>) -> Result<reqwest::Client, FetchError> {
        let Some(proxy) = proxy else {
            return Ok(self.direct.clone());
        };

        let dial_url = proxy.dial_url();
        let mut clients = self.clients.lock();
        if let Some(client) = clients.get(&dial_url) {
            return Ok(client.clone());
        }

        let reqwest_proxy = reqwest::Proxy::all(&dial_url)
            .map_err(|e| FetchError::Request(format!("invalid proxy {}: {}", dial_url, e)))?;
        let client = reqwest::Client::builder()
            .proxy(reqwest_proxy)
            .build()
            .map_err(|e| FetchError::Request(format!("failed to build client for {}: {}", dial_url, e)))?;

        debug!("Created HTTP client for proxy {}", dial_url);
        clients.insert(dial_url, client.clone());
        Ok(client)
    }
}

#[async_trait]
impl ProxyTransport for HttpTransport {
    async fn head(
        &self,
        url: &str,
        proxy: &ProxyEndpoint,
        user_agent: &str,
        timeout: Duration,
    ) -> Result<HeadResponse, FetchError> {
        let client = self.client_for(Some(proxy))?;
        let response = client
            .head(url)
            .header(USER_AGENT, user_agent)
            .timeout(timeout)
            .send()
            .await?;

        // content_length() reports the (empty) body size for HEAD, read the header instead
        let content_length = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());

        Ok(HeadResponse {
            status: response.status().as_u16(),
            content_length,
        })
    }

    async fn get(
        &self,
        url: &str,
        proxy: Option<&ProxyEndpoint>,
        user_agent: &str,
        timeout: Duration,
    ) -> Result<FetchResponse, FetchError> {
        let client = self.client_for(proxy)?;
        let response = client
            .get(url)
            .header(USER_AGENT, user_agent)
            .timeout(timeout)
            .send()
            .await?;

        let status = response.status().as_u16();
        let body = response.bytes().await?.to_vec();
        Ok(FetchResponse { status, body })
    }

    fn forget(&self, proxy: &ProxyEndpoint) {
        self.clients.lock().remove(&proxy.dial_url());
    }
}
