//! Download engine
//!
//! Fetches enumerated archives through random proxies with bounded retries.
//! Proxies that refuse connections or time out are quarantined for the rest
//! of the run. A failing archive never stops the others.

use rand::seq::SliceRandom;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::archive::{self, ArchiveError};
use crate::config::DownloadConfig;
use crate::http_client::{FetchError, ProxyTransport};
use crate::market::{CandidateResource, DataKind};
use crate::progress::Progress;
use crate::proxy_pool::ProxyEndpoint;
use crate::resume::ResumeMarker;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DownloadReport {
    pub downloaded: usize,
    /// Already present with the expected size
    pub skipped: usize,
    /// Depth archives copied from the other market code
    pub reused: usize,
    pub cancelled: usize,
    pub failed: Vec<String>,
}

/// At least one archive could not be retrieved
#[derive(Debug, Error)]
#[error("{} archive(s) failed to download: {}", .failed.len(), .failed.join(", "))]
pub struct DownloadFailure {
    pub failed: Vec<String>,
    pub report: DownloadReport,
}

/// State shared by all downloads of one run
pub struct DownloadRun {
    proxies: Vec<ProxyEndpoint>,
    bad: Mutex<HashSet<ProxyEndpoint>>,
    failed: Mutex<Vec<String>>,
}

impl DownloadRun {
    pub fn new(proxies: Vec<ProxyEndpoint>) -> Self {
        Self {
            proxies,
            bad: Mutex::new(HashSet::new()),
            failed: Mutex::new(Vec::new()),
        }
    }

    /// Working set minus the proxies quarantined so far
    pub fn available(&self) -> Vec<ProxyEndpoint> {
        let bad = self.bad.lock();
        self.proxies
            .iter()
            .filter(|p| !bad.contains(*p))
            .cloned()
            .collect()
    }

    /// Returns true if the proxy was not already quarantined
    pub fn mark_bad(&self, proxy: &ProxyEndpoint) -> bool {
        self.bad.lock().insert(proxy.clone())
    }

    pub fn bad_count(&self) -> usize {
        self.bad.lock().len()
    }

    fn record_failure(&self, id: String) {
        self.failed.lock().push(id);
    }

    fn take_failures(&self) -> Vec<String> {
        let mut failed = std::mem::take(&mut *self.failed.lock());
        failed.sort();
        failed
    }
}

enum Outcome {
    Downloaded,
    Skipped,
    Reused,
    Failed,
    Cancelled,
}

#[derive(Debug, Error)]
enum AttemptError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid archive: {0}")]
    Corrupt(#[from] ArchiveError),
    #[error("failed to write archive: {0}")]
    Io(#[from] io::Error),
    #[error("write task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Clone)]
pub struct DownloadEngine {
    transport: Arc<dyn ProxyTransport>,
    marker: Arc<dyn ResumeMarker>,
    config: DownloadConfig,
    base_url: String,
    user_agent: String,
    progress: Progress,
}

impl DownloadEngine {
    pub fn new(
        transport: Arc<dyn ProxyTransport>,
        marker: Arc<dyn ResumeMarker>,
        config: DownloadConfig,
        base_url: &str,
        user_agent: &str,
        progress: Progress,
    ) -> Self {
        Self {
            transport,
            marker,
            config,
            base_url: base_url.trim_end_matches('/').to_string(),
            user_agent: user_agent.to_string(),
            progress,
        }
    }

    /// Download every resource, at most `max_concurrency` at a time.
    ///
    /// Fails only when at least one resource exhausted its attempts; the
    /// successful ones are persisted either way.
    pub async fn download_all(
        &self,
        cancel: &CancellationToken,
        proxies: Vec<ProxyEndpoint>,
        resources: Vec<CandidateResource>,
    ) -> Result<DownloadReport, DownloadFailure> {
        let total = resources.len();
        let run = Arc::new(DownloadRun::new(proxies));
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut handles = Vec::with_capacity(total);

        info!("Starting download of {} archives", total);
        self.progress.start("files", total as u64);

        for resource in resources {
            let engine = self.clone();
            let run = Arc::clone(&run);
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();

            handles.push(tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return Outcome::Cancelled;
                };
                let outcome = engine.fetch_one(&run, &resource, &cancel).await;
                engine.progress.tick(&resource.id());
                outcome
            }));
        }

        let mut report = DownloadReport::default();
        for handle in handles {
            match handle.await {
                Ok(Outcome::Downloaded) => report.downloaded += 1,
                Ok(Outcome::Skipped) => report.skipped += 1,
                Ok(Outcome::Reused) => report.reused += 1,
                Ok(Outcome::Cancelled) => report.cancelled += 1,
                Ok(Outcome::Failed) => {}
                Err(e) => error!("Download task panicked: {}", e),
            }
        }
        report.failed = run.take_failures();

        self.progress.finish(&format!(
            "{} downloaded, {} skipped, {} failed",
            report.downloaded,
            report.skipped + report.reused,
            report.failed.len()
        ));
        info!(
            "Downloads finished: {} downloaded, {} skipped, {} reused, {} failed, {} proxies quarantined",
            report.downloaded,
            report.skipped,
            report.reused,
            report.failed.len(),
            run.bad_count()
        );

        if report.failed.is_empty() {
            Ok(report)
        } else {
            Err(DownloadFailure {
                failed: report.failed.clone(),
                report,
            })
        }
    }

    async fn fetch_one(
        &self,
        run: &DownloadRun,
        resource: &CandidateResource,
        cancel: &CancellationToken,
    ) -> Outcome {
        if cancel.is_cancelled() {
            return Outcome::Cancelled;
        }

        let path = self.marker.local_path(resource);
        if self.marker.is_complete(resource) {
            debug!("Skipping {}: already downloaded", resource);
            return Outcome::Skipped;
        }

        if let Some(outcome) = self.reuse_sibling(resource, &path).await {
            return outcome;
        }

        let url = resource.url(&self.base_url);
        let timeout = match resource.kind {
            DataKind::Trades => Duration::from_secs(self.config.trades_timeout_secs),
            DataKind::Depth => Duration::from_secs(self.config.depth_timeout_secs),
        };

        for attempt in 1..=self.config.max_attempts {
            let available = run.available();
            let Some(proxy) = available.choose(&mut rand::thread_rng()).cloned() else {
                warn!("No usable proxies left for {}", resource);
                break;
            };

            match self.attempt(&url, &proxy, &path, timeout, cancel).await {
                Ok(size) => {
                    info!("Downloaded {} ({} bytes via {})", resource, size, proxy);
                    return Outcome::Downloaded;
                }
                Err(AttemptError::Fetch(FetchError::Cancelled)) => return Outcome::Cancelled,
                Err(e) => {
                    if let AttemptError::Fetch(fetch) = &e {
                        if fetch.is_proxy_fault() && run.mark_bad(&proxy) {
                            warn!("Marking proxy {} as bad: {}", proxy, fetch);
                        }
                    }
                    warn!(
                        "Attempt {}/{} for {} via {} failed: {}",
                        attempt, self.config.max_attempts, resource, proxy, e
                    );
                }
            }

            if attempt < self.config.max_attempts {
                let delay = Duration::from_secs(self.config.backoff_secs * attempt as u64);
                tokio::select! {
                    _ = cancel.cancelled() => return Outcome::Cancelled,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        error!("Failed to download {}", resource);
        run.record_failure(resource.id());
        Outcome::Failed
    }

    async fn attempt(
        &self,
        url: &str,
        proxy: &ProxyEndpoint,
        path: &Path,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<usize, AttemptError> {
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(FetchError::Cancelled.into()),
            res = self.transport.get(url, Some(proxy), &self.user_agent, timeout) => res?,
        };

        if response.status != 200 {
            return Err(FetchError::Status(response.status).into());
        }

        let size = response.body.len();
        let target = path.to_path_buf();
        tokio::task::spawn_blocking(move || persist_archive(&target, &response.body)).await??;
        Ok(size)
    }

    /// Copy a valid depth archive already fetched under the other market code
    async fn reuse_sibling(&self, resource: &CandidateResource, path: &Path) -> Option<Outcome> {
        let sibling = resource.sibling()?;
        let sibling_path = self.marker.local_path(&sibling);
        let size_hint = resource.size_hint;
        let source = sibling_path.clone();
        let target = path.to_path_buf();

        let copied = tokio::task::spawn_blocking(move || -> Result<bool, AttemptError> {
            let len = fs::metadata(&source)?.len();
            if len == 0 || (size_hint != 0 && len != size_hint) {
                return Ok(false);
            }
            let body = fs::read(&source)?;
            persist_archive(&target, &body)?;
            Ok(true)
        })
        .await;

        match copied {
            Ok(Ok(true)) => {
                info!("Copied {} from {:?}", resource, sibling_path);
                Some(Outcome::Reused)
            }
            Ok(Ok(false)) => None,
            Ok(Err(e)) => {
                debug!("Sibling {:?} not reusable: {}", sibling_path, e);
                None
            }
            Err(e) => {
                warn!("Sibling copy for {} failed: {}", resource, e);
                None
            }
        }
    }
}

fn part_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

/// Write to `<path>.part`, validate, then move into place. The part file never survives a failure.
fn persist_archive(path: &Path, body: &[u8]) -> Result<(), AttemptError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let part = part_path(path);
    let result = fs::write(&part, body)
        .map_err(AttemptError::from)
        .and_then(|_| archive::validate_bytes(body).map_err(AttemptError::from))
        .and_then(|_| fs::rename(&part, path).map_err(AttemptError::from));

    if result.is_err() {
        let _ = fs::remove_file(&part);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::fixtures::zip_with;
    use crate::http_client::mock::MockTransport;
    use crate::http_client::FetchResponse;
    use crate::resume::LocalFileMarker;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    const BASE: &str = "https://origin.example.com/online";

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 4, d).unwrap()
    }

    fn proxies(n: usize) -> Vec<ProxyEndpoint> {
        (1..=n)
            .map(|i| ProxyEndpoint::parse(&format!("socks5://10.0.0.{}:1080", i)).unwrap())
            .collect()
    }

    fn config(max_concurrency: usize) -> DownloadConfig {
        DownloadConfig {
            max_attempts: 5,
            backoff_secs: 0,
            max_concurrency,
            ..DownloadConfig::default()
        }
    }

    fn engine(transport: Arc<MockTransport>, root: &Path, config: DownloadConfig) -> DownloadEngine {
        DownloadEngine::new(
            transport,
            Arc::new(LocalFileMarker::new(root)),
            config,
            BASE,
            "test-agent",
            Progress::hidden(),
        )
    }

    fn trades(n: u32) -> Vec<CandidateResource> {
        (1..=n)
            .map(|i| CandidateResource::trades("SPBL", "BTCUSDT", day(1), i))
            .collect()
    }

    fn serving_zips() -> MockTransport {
        MockTransport::new().on_get(|url, _| {
            Ok(FetchResponse { status: 200, body: zip_with("data.csv", url.as_bytes()) })
        })
    }

    #[tokio::test]
    async fn test_download_and_resume() {
        let dir = TempDir::new().unwrap();
        let transport = serving_zips().into_arc();
        let engine = engine(transport.clone(), dir.path(), config(4));
        let cancel = CancellationToken::new();

        let report = engine.download_all(&cancel, proxies(2), trades(3)).await.unwrap();
        assert_eq!(report.downloaded, 3);
        assert_eq!(transport.gets(), 3);
        for resource in trades(3) {
            let path = resource.local_path(dir.path());
            assert!(archive::validate_file(&path).unwrap() > 0);
            assert!(!part_path(&path).exists());
        }

        // second pass sees everything in place
        let report = engine.download_all(&cancel, proxies(2), trades(3)).await.unwrap();
        assert_eq!(report.skipped, 3);
        assert_eq!(transport.gets(), 3);
    }

    #[tokio::test]
    async fn test_size_mismatch_downloads_again() {
        let dir = TempDir::new().unwrap();
        let resource = CandidateResource::trades("SPBL", "BTCUSDT", day(1), 1).with_size(999_999);
        let path = resource.local_path(dir.path());
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"stale").unwrap();

        let transport = serving_zips().into_arc();
        let report = engine(transport.clone(), dir.path(), config(1))
            .download_all(&CancellationToken::new(), proxies(1), vec![resource])
            .await
            .unwrap();
        assert_eq!(report.downloaded, 1);
        assert!(archive::validate_file(&path).is_ok());
    }

    #[tokio::test]
    async fn test_corrupt_payload_is_rejected() {
        let dir = TempDir::new().unwrap();
        let transport = MockTransport::new()
            .on_get(|_, _| Ok(FetchResponse { status: 200, body: b"<html>blocked</html>".to_vec() }))
            .into_arc();
        let resource = CandidateResource::trades("SPBL", "BTCUSDT", day(1), 1);

        let failure = engine(transport.clone(), dir.path(), config(1))
            .download_all(&CancellationToken::new(), proxies(2), vec![resource.clone()])
            .await
            .unwrap_err();

        assert_eq!(failure.failed, vec![resource.id()]);
        assert_eq!(failure.report.downloaded, 0);
        assert_eq!(transport.gets(), 5);
        let path = resource.local_path(dir.path());
        assert!(!path.exists());
        assert!(!part_path(&path).exists());
    }

    #[tokio::test]
    async fn test_only_status_200_is_success() {
        let dir = TempDir::new().unwrap();
        let transport = MockTransport::new()
            .on_get(|_, _| Ok(FetchResponse { status: 206, body: zip_with("a.csv", b"1") }))
            .into_arc();
        let result = engine(transport, dir.path(), config(1))
            .download_all(&CancellationToken::new(), proxies(1), trades(1))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_failure_isolation() {
        let dir = TempDir::new().unwrap();
        let transport = MockTransport::new()
            .on_get(|url, _| {
                if url.ends_with("_002.zip") {
                    Ok(FetchResponse { status: 503, body: Vec::new() })
                } else {
                    Ok(FetchResponse { status: 200, body: zip_with("a.csv", b"1") })
                }
            })
            .into_arc();

        let failure = engine(transport, dir.path(), config(3))
            .download_all(&CancellationToken::new(), proxies(3), trades(3))
            .await
            .unwrap_err();

        assert_eq!(failure.failed.len(), 1);
        assert!(failure.failed[0].ends_with("_002.zip"));
        assert_eq!(failure.report.downloaded, 2);
        let resources = trades(3);
        assert!(resources[0].local_path(dir.path()).exists());
        assert!(!resources[1].local_path(dir.path()).exists());
        assert!(resources[2].local_path(dir.path()).exists());
    }

    #[tokio::test]
    async fn test_exhausted_pool_fails_resource_immediately() {
        let dir = TempDir::new().unwrap();
        let transport = MockTransport::new()
            .on_get(|url, _| {
                if url.ends_with("_003.zip") {
                    Err(FetchError::Connect("connection refused".into()))
                } else {
                    Ok(FetchResponse { status: 200, body: zip_with("a.csv", b"1") })
                }
            })
            .into_arc();

        // one worker, so the failing archive runs last
        let failure = engine(transport.clone(), dir.path(), config(1))
            .download_all(&CancellationToken::new(), proxies(2), trades(3))
            .await
            .unwrap_err();

        assert_eq!(failure.report.downloaded, 2);
        assert_eq!(failure.failed.len(), 1);
        // two successes plus one attempt per proxy before the pool ran dry
        assert_eq!(transport.gets(), 4);
    }

    #[tokio::test]
    async fn test_bad_proxy_is_never_reused() {
        let dir = TempDir::new().unwrap();
        let bad_hits = Arc::new(AtomicUsize::new(0));
        let hits = Arc::clone(&bad_hits);
        let transport = MockTransport::new()
            .on_get(move |_, proxy| {
                if proxy.map(|p| p.host()) == Some("10.0.0.1") {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Err(FetchError::Timeout("120s".into()))
                } else {
                    Ok(FetchResponse { status: 200, body: zip_with("a.csv", b"1") })
                }
            })
            .into_arc();

        let report = engine(transport, dir.path(), config(1))
            .download_all(&CancellationToken::new(), proxies(2), trades(6))
            .await
            .unwrap();
        assert_eq!(report.downloaded, 6);
        assert!(bad_hits.load(Ordering::SeqCst) <= 1);
    }

    #[tokio::test]
    async fn test_concurrency_limit() {
        let dir = TempDir::new().unwrap();
        let transport = serving_zips()
            .with_get_delay(Duration::from_millis(20))
            .into_arc();

        let report = engine(transport.clone(), dir.path(), config(3))
            .download_all(&CancellationToken::new(), proxies(4), trades(12))
            .await
            .unwrap();

        assert_eq!(report.downloaded, 12);
        let peak = transport.max_in_flight.load(Ordering::SeqCst);
        assert!(peak <= 3, "peak concurrency {}", peak);
        assert!(peak >= 2);
    }

    #[tokio::test]
    async fn test_depth_reuses_sibling_archive() {
        let dir = TempDir::new().unwrap();
        let spot = CandidateResource::depth("1", "BTCUSDT", day(2));
        let futures = spot.sibling().unwrap();
        let futures_path = futures.local_path(dir.path());
        fs::create_dir_all(futures_path.parent().unwrap()).unwrap();
        fs::write(&futures_path, zip_with("depth.csv", b"1,2,3,4,5")).unwrap();

        let transport = serving_zips().into_arc();
        let report = engine(transport.clone(), dir.path(), config(2))
            .download_all(&CancellationToken::new(), proxies(1), vec![spot.clone()])
            .await
            .unwrap();

        assert_eq!(report.reused, 1);
        assert_eq!(transport.gets(), 0);
        assert_eq!(
            fs::read(spot.local_path(dir.path())).unwrap(),
            fs::read(&futures_path).unwrap()
        );
    }

    #[tokio::test]
    async fn test_cancelled_run_downloads_nothing() {
        let dir = TempDir::new().unwrap();
        let transport = serving_zips().into_arc();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = engine(transport.clone(), dir.path(), config(2))
            .download_all(&cancel, proxies(1), trades(3))
            .await
            .unwrap();
        assert_eq!(report.cancelled, 3);
        assert_eq!(transport.gets(), 0);
    }

    #[tokio::test]
    async fn test_cancel_during_request_leaves_no_files() {
        let dir = TempDir::new().unwrap();
        let transport = serving_zips()
            .with_get_delay(Duration::from_millis(300))
            .into_arc();
        let engine = engine(transport.clone(), dir.path(), config(3));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let report = engine.download_all(&cancel, proxies(2), trades(3)).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(250));
        assert_eq!(report.cancelled, 3);
        assert_eq!(report.downloaded, 0);
        assert_eq!(transport.gets(), 3);
        for resource in trades(3) {
            let path = resource.local_path(dir.path());
            assert!(!path.exists());
            assert!(!part_path(&path).exists());
        }
    }
}
