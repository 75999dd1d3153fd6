//! Proxy pool module
//!
//! Maintains the raw candidate list and the validated working set on disk.
//! A candidate is working when an IP-echo endpoint reached through it reports
//! the candidate's own host.

use anyhow::{bail, Context, Result};
use futures::stream::{self, StreamExt};
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::ProxyConfig;
use crate::http_client::ProxyTransport;

const LIST_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyScheme {
    Socks4,
    Socks5,
}

impl ProxyScheme {
    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "socks4" | "socks4a" => Some(ProxyScheme::Socks4),
            "socks5" | "socks5h" => Some(ProxyScheme::Socks5),
            _ => None,
        }
    }
}

/// One outbound proxy, as listed in the candidate and working files
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProxyEndpoint {
    raw: String,
    scheme: ProxyScheme,
    /// `user:pass@` prefix, kept verbatim
    userinfo: Option<String>,
    host: String,
    port: u16,
}

impl ProxyEndpoint {
    /// Parse `scheme://[user:pass@]host:port`
    pub fn parse(line: &str) -> Result<Self> {
        let raw = line.trim();
        let (scheme, rest) = raw
            .split_once("://")
            .context(format!("proxy endpoint without scheme: {}", raw))?;
        let scheme = ProxyScheme::parse(scheme)
            .context(format!("unsupported proxy scheme: {}", raw))?;

        let rest = rest.trim_end_matches('/');
        let (userinfo, authority) = match rest.rsplit_once('@') {
            Some((user, authority)) => (Some(user.to_string()), authority),
            None => (None, rest),
        };

        let (host, port) = authority
            .rsplit_once(':')
            .context(format!("proxy endpoint without port: {}", raw))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            bail!("proxy endpoint without host: {}", raw);
        }
        let port: u16 = port
            .parse()
            .context(format!("invalid proxy port: {}", raw))?;

        Ok(Self {
            raw: raw.to_string(),
            scheme,
            userinfo,
            host: host.to_string(),
            port,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn scheme(&self) -> ProxyScheme {
        self.scheme
    }

    /// The endpoint exactly as it appeared in the candidate list
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// URL handed to the HTTP client. SOCKS4 endpoints are dialled as SOCKS5.
    pub fn dial_url(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        match &self.userinfo {
            Some(user) => format!("socks5://{}@{}:{}", user, host, self.port),
            None => format!("socks5://{}:{}", host, self.port),
        }
    }
}

impl fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Validated proxy working set backed by two plain-text files
pub struct ProxyPool {
    config: ProxyConfig,
    user_agent: String,
    transport: Arc<dyn ProxyTransport>,
}

impl ProxyPool {
    pub fn new(config: ProxyConfig, user_agent: &str, transport: Arc<dyn ProxyTransport>) -> Self {
        Self {
            config,
            user_agent: user_agent.to_string(),
            transport,
        }
    }

    /// Make sure a non-empty working set exists on disk.
    ///
    /// Fetches the raw list when it is missing, validates every candidate once
    /// and persists the survivors. Returns the size of the working set.
    pub async fn ensure(&self, cancel: &CancellationToken) -> Result<usize> {
        if self.config.reuse_working {
            if let Some(count) = self.fresh_working_set()? {
                info!(
                    "Reusing {} working proxies from {:?}",
                    count, self.config.working_file
                );
                return Ok(count);
            }
        }

        if !self.config.raw_file.exists() {
            self.fetch_raw_list(cancel).await?;
        }

        let lines = read_lines(&self.config.raw_file)?;
        if lines.is_empty() {
            bail!("proxy list is empty: {:?}", self.config.raw_file);
        }

        let mut candidates = Vec::with_capacity(lines.len());
        for line in &lines {
            match ProxyEndpoint::parse(line) {
                Ok(endpoint) => candidates.push(endpoint),
                Err(e) => debug!("Ignoring proxy candidate: {}", e),
            }
        }

        info!(
            "Validating {} proxy candidates against {} (timeout {:?})",
            candidates.len(),
            self.config.check_url,
            self.config.check_timeout()
        );

        let working = self.validate_all(candidates, cancel).await?;
        if working.is_empty() {
            bail!("no working proxies found");
        }

        self.persist(&working)?;
        info!(
            "Found {} working proxies, saved to {:?}",
            working.len(),
            self.config.working_file
        );
        Ok(working.len())
    }

    /// Current working set, read from the persisted file
    pub fn get(&self) -> Result<Vec<ProxyEndpoint>> {
        let path = &self.config.working_file;
        if !path.exists() {
            bail!("working proxy file not found: {:?}", path);
        }

        let proxies: Vec<ProxyEndpoint> = read_lines(path)?
            .iter()
            .filter_map(|line| ProxyEndpoint::parse(line).ok())
            .collect();

        if proxies.is_empty() {
            bail!("working proxy file is empty: {:?}", path);
        }
        Ok(proxies)
    }

    /// Working set size when it may be reused as-is
    fn fresh_working_set(&self) -> Result<Option<usize>> {
        let path = &self.config.working_file;
        let Ok(metadata) = fs::metadata(path) else {
            return Ok(None);
        };

        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .unwrap_or(Duration::MAX);
        if age > self.config.max_age() {
            debug!("Working proxy file {:?} is stale ({:?} old)", path, age);
            return Ok(None);
        }

        let count = read_lines(path)?
            .iter()
            .filter(|line| ProxyEndpoint::parse(line).is_ok())
            .count();
        Ok((count > 0).then_some(count))
    }

    async fn fetch_raw_list(&self, cancel: &CancellationToken) -> Result<()> {
        let fallback = match &self.config.fallback {
            Some(url) if !url.trim().is_empty() => Some(
                ProxyEndpoint::parse(url).context("invalid fallback proxy")?,
            ),
            _ => None,
        };

        let mut content = String::new();
        for list_url in &self.config.list_urls {
            info!("Downloading proxy list {}", list_url);
            let response = tokio::select! {
                _ = cancel.cancelled() => bail!("cancelled while downloading proxy lists"),
                res = self.transport.get(list_url, fallback.as_ref(), &self.user_agent, LIST_FETCH_TIMEOUT) => res,
            }
            .context(format!("failed to download {}", list_url))?;

            if response.status != 200 {
                bail!("unexpected status code for {}: {}", list_url, response.status);
            }
            content.push_str(&String::from_utf8_lossy(&response.body));
            content.push('\n');
        }

        if let Some(parent) = self.config.raw_file.parent() {
            fs::create_dir_all(parent)
                .context(format!("Failed to create directory: {:?}", parent))?;
        }
        fs::write(&self.config.raw_file, content)
            .context(format!("Failed to write proxy list: {:?}", self.config.raw_file))?;
        Ok(())
    }

    async fn validate_all(
        &self,
        candidates: Vec<ProxyEndpoint>,
        cancel: &CancellationToken,
    ) -> Result<Vec<ProxyEndpoint>> {
        let concurrency = self.config.validate_concurrency.max(1);

        let mut results: Vec<(usize, ProxyEndpoint)> = stream::iter(candidates.into_iter().enumerate())
            .map(|(idx, endpoint)| async move {
                let ok = self.check(&endpoint).await;
                (idx, endpoint, ok)
            })
            .buffer_unordered(concurrency)
            .take_until(cancel.cancelled())
            .filter_map(|(idx, endpoint, ok)| async move { ok.then_some((idx, endpoint)) })
            .collect()
            .await;

        if cancel.is_cancelled() {
            bail!("cancelled during proxy validation");
        }

        // keep the order of the candidate list
        results.sort_by_key(|(idx, _)| *idx);
        Ok(results.into_iter().map(|(_, endpoint)| endpoint).collect())
    }

    /// Single validation attempt; rejected candidates leave no client behind
    async fn check(&self, endpoint: &ProxyEndpoint) -> bool {
        let ok = self.echoes_own_host(endpoint).await;
        if !ok {
            self.transport.forget(endpoint);
        }
        ok
    }

    /// Any failure means "not working"
    async fn echoes_own_host(&self, endpoint: &ProxyEndpoint) -> bool {
        let response = match self
            .transport
            .get(
                &self.config.check_url,
                Some(endpoint),
                &self.user_agent,
                self.config.check_timeout(),
            )
            .await
        {
            Ok(response) => response,
            Err(e) => {
                debug!("Proxy {} failed: {}", endpoint, e);
                return false;
            }
        };

        if response.status != 200 {
            debug!("Proxy {} returned status {}", endpoint, response.status);
            return false;
        }

        let echoed = String::from_utf8_lossy(&response.body);
        let echoed = echoed.trim();
        if echoed != endpoint.host() {
            debug!("Proxy {} echoed {:?}", endpoint, echoed);
            return false;
        }
        true
    }

    fn persist(&self, working: &[ProxyEndpoint]) -> Result<()> {
        let path = &self.config.working_file;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .context(format!("Failed to create directory: {:?}", parent))?;
        }

        let mut content = working
            .iter()
            .map(|p| p.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        content.push('\n');

        let tmp = path.with_extension("tmp");
        fs::write(&tmp, content).context(format!("Failed to write {:?}", tmp))?;
        fs::rename(&tmp, path).context(format!("Failed to move {:?} to {:?}", tmp, path))?;
        Ok(())
    }
}

fn read_lines(path: &Path) -> Result<Vec<String>> {
    let content = fs::read_to_string(path)
        .context(format!("Failed to read proxy file: {:?}", path))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect())
}
