//! Existence prober
//!
//! Issues HEAD requests through random proxies from the working set. Network
//! faults are retried with a fresh proxy, while any status >= 400 is a final
//! "does not exist" answer.

use rand::seq::SliceRandom;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ProbeConfig;
use crate::http_client::{FetchError, ProxyTransport};
use crate::probe_cache::{ProbeCache, ProbeRecord};
use crate::proxy_pool::ProxyEndpoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Status in 200..400; size from `Content-Length`, 0 when unknown
    Exists { size: u64 },
    Absent { status: u16 },
}

impl ProbeOutcome {
    pub fn exists(&self) -> bool {
        matches!(self, ProbeOutcome::Exists { .. })
    }
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("no proxies available to probe {0}")]
    NoProxies(String),
    #[error("probe of {url} failed after {attempts} attempts: {last}")]
    Transient {
        url: String,
        attempts: u32,
        last: FetchError,
    },
    #[error("cancelled")]
    Cancelled,
}

pub struct ExistenceProber {
    transport: Arc<dyn ProxyTransport>,
    cache: Option<Arc<ProbeCache>>,
    user_agent: String,
    max_attempts: u32,
    timeout: Duration,
}

impl ExistenceProber {
    pub fn new(
        transport: Arc<dyn ProxyTransport>,
        config: &ProbeConfig,
        user_agent: &str,
        cache: Option<Arc<ProbeCache>>,
    ) -> Self {
        Self {
            transport,
            cache,
            user_agent: user_agent.to_string(),
            max_attempts: config.max_attempts.max(1),
            timeout: config.timeout(),
        }
    }

    pub async fn probe(
        &self,
        url: &str,
        proxies: &[ProxyEndpoint],
        cancel: &CancellationToken,
    ) -> Result<ProbeOutcome, ProbeError> {
        if let Some(outcome) = self.cached(url) {
            debug!("Probe cache hit for {}: {:?}", url, outcome);
            return Ok(outcome);
        }

        if proxies.is_empty() {
            return Err(ProbeError::NoProxies(url.to_string()));
        }

        let mut last = FetchError::Request("no attempt made".to_string());
        for attempt in 1..=self.max_attempts {
            let Some(proxy) = proxies.choose(&mut rand::thread_rng()).cloned() else {
                return Err(ProbeError::NoProxies(url.to_string()));
            };

            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(ProbeError::Cancelled),
                res = self.transport.head(url, &proxy, &self.user_agent, self.timeout) => res,
            };

            match result {
                Ok(response) if response.status < 400 => {
                    let size = response.content_length.unwrap_or(0);
                    debug!("{} exists (status {}, {} bytes)", url, response.status, size);
                    self.remember(url, response.status, size);
                    return Ok(ProbeOutcome::Exists { size });
                }
                Ok(response) => {
                    debug!("{} absent (status {})", url, response.status);
                    self.remember(url, response.status, 0);
                    return Ok(ProbeOutcome::Absent {
                        status: response.status,
                    });
                }
                Err(e) => {
                    debug!(
                        "Probe attempt {}/{} for {} via {} failed: {}",
                        attempt, self.max_attempts, url, proxy, e
                    );
                    last = e;
                }
            }
        }

        Err(ProbeError::Transient {
            url: url.to_string(),
            attempts: self.max_attempts,
            last,
        })
    }

    fn cached(&self, url: &str) -> Option<ProbeOutcome> {
        let cache = self.cache.as_ref()?;
        match cache.lookup(url) {
            Ok(Some(record)) if record.exists() => Some(ProbeOutcome::Exists { size: record.size }),
            Ok(Some(record)) => Some(ProbeOutcome::Absent {
                status: record.status,
            }),
            Ok(None) => None,
            Err(e) => {
                warn!("Probe cache read failed for {}: {}", url, e);
                None
            }
        }
    }

    fn remember(&self, url: &str, status: u16, size: u64) {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.store(&ProbeRecord::new(url, status, size)) {
                warn!("Probe cache write failed for {}: {}", url, e);
            }
        }
    }
}
