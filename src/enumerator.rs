//! URL enumerator
//!
//! Turns (pair, market, kind, date range) into the list of archives that exist
//! upstream. Trade archives are numbered per day and probed in concurrent
//! batches until the first missing number; depth archives get one probe per
//! market code and day.

use anyhow::{bail, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::market::{CandidateResource, DataKind, DateRange, Market};
use crate::prober::{ExistenceProber, ProbeError, ProbeOutcome};
use crate::progress::Progress;
use crate::proxy_pool::ProxyEndpoint;
use crate::resume::ResumeMarker;

#[derive(Debug, Clone)]
pub struct EnumerateRequest {
    pub pair: String,
    pub market: Market,
    pub kind: DataKind,
    pub range: DateRange,
    /// Include locally present archives without probing them
    pub skip_locally_present: bool,
}

#[derive(Debug, Default)]
pub struct Enumeration {
    /// Sorted by market code, day and sequence number
    pub resources: Vec<CandidateResource>,
    /// URLs whose probe kept failing at the network level
    pub transient_failures: Vec<String>,
    /// Zero-byte placeholders written for depth archives the origin refuses
    pub placeholders: usize,
}

/// Result of one trade sequence number
enum SequenceOutcome {
    Found(CandidateResource),
    Absent(u16),
    Transient(String),
}

pub struct UrlEnumerator {
    prober: Arc<ExistenceProber>,
    marker: Arc<dyn ResumeMarker>,
    base_url: String,
    batch_size: u32,
    max_sequence: u32,
    concurrency: usize,
    progress: Progress,
}

impl UrlEnumerator {
    pub fn new(
        prober: Arc<ExistenceProber>,
        marker: Arc<dyn ResumeMarker>,
        base_url: &str,
        batch_size: u32,
        max_sequence: u32,
        concurrency: usize,
        progress: Progress,
    ) -> Self {
        Self {
            prober,
            marker,
            base_url: base_url.trim_end_matches('/').to_string(),
            batch_size: batch_size.max(1),
            max_sequence,
            concurrency: concurrency.max(1),
            progress,
        }
    }

    pub async fn enumerate(
        &self,
        request: &EnumerateRequest,
        proxies: Arc<Vec<ProxyEndpoint>>,
        cancel: &CancellationToken,
    ) -> Result<Enumeration> {
        let codes = request.market.codes(request.kind);
        info!(
            "Enumerating {} {} archives for {:?} from {} to {}",
            request.pair, request.kind, codes, request.range.start, request.range.end
        );

        let mut enumeration = match request.kind {
            DataKind::Trades => self.enumerate_trades(request, &codes, proxies, cancel).await?,
            DataKind::Depth => self.enumerate_depth(request, &codes, proxies, cancel).await?,
        };

        enumeration.resources.sort_by(|a, b| {
            (&a.code, a.date, a.sequence).cmp(&(&b.code, b.date, b.sequence))
        });

        info!(
            "Enumerated {} archives ({} probe failures, {} placeholders)",
            enumeration.resources.len(),
            enumeration.transient_failures.len(),
            enumeration.placeholders
        );
        Ok(enumeration)
    }

    async fn enumerate_trades(
        &self,
        request: &EnumerateRequest,
        codes: &[&str],
        proxies: Arc<Vec<ProxyEndpoint>>,
        cancel: &CancellationToken,
    ) -> Result<Enumeration> {
        let mut enumeration = Enumeration::default();
        let days = request.range.days().count() as u64;
        self.progress.start("days", days * codes.len() as u64);

        for code in codes {
            for day in request.range.days() {
                let mut first = 1u32;
                while first <= self.max_sequence {
                    let last = (first + self.batch_size - 1).min(self.max_sequence);
                    let outcomes = self
                        .probe_trade_batch(request, code, day, first..=last, &proxies, cancel)
                        .await;

                    if cancel.is_cancelled() {
                        bail!("enumeration cancelled");
                    }

                    let batch = settle_batch(outcomes);
                    for url in &batch.transient {
                        warn!("Giving up on probing {}", url);
                    }
                    let found = batch.found.len();
                    enumeration.resources.extend(batch.found);
                    enumeration.transient_failures.extend(batch.transient);

                    if let Some(number) = batch.end_of_day {
                        debug!("{} {} {}: sequence ends before {:03}", code, request.pair, day, number);
                        break;
                    }
                    if found == 0 && batch.all_transient {
                        warn!(
                            "{} {} {}: every probe in {:03}..={:03} failed, moving to next day",
                            code, request.pair, day, first, last
                        );
                        break;
                    }
                    first = last + 1;
                }
                self.progress.tick(&format!("{} {}", code, day));
            }
        }
        Ok(enumeration)
    }

    /// Probe one batch of sequence numbers concurrently
    async fn probe_trade_batch(
        &self,
        request: &EnumerateRequest,
        code: &str,
        day: chrono::NaiveDate,
        numbers: std::ops::RangeInclusive<u32>,
        proxies: &Arc<Vec<ProxyEndpoint>>,
        cancel: &CancellationToken,
    ) -> Vec<(u32, SequenceOutcome)> {
        let results: Arc<Mutex<Vec<(u32, SequenceOutcome)>>> = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();

        for number in numbers {
            let resource = CandidateResource::trades(code, &request.pair, day, number);
            let url = resource.url(&self.base_url);
            let prober = Arc::clone(&self.prober);
            let marker = Arc::clone(&self.marker);
            let proxies = Arc::clone(proxies);
            let results = Arc::clone(&results);
            let cancel = cancel.clone();
            let skip = request.skip_locally_present;

            handles.push(tokio::spawn(async move {
                let outcome = if skip && marker.is_present(&resource) {
                    debug!("Skipping {}: file already exists locally", url);
                    SequenceOutcome::Found(resource)
                } else {
                    match prober.probe(&url, &proxies, &cancel).await {
                        Ok(ProbeOutcome::Exists { size }) => SequenceOutcome::Found(resource.with_size(size)),
                        Ok(ProbeOutcome::Absent { status }) => SequenceOutcome::Absent(status),
                        Err(e) => {
                            debug!("Error checking {}: {}", url, e);
                            SequenceOutcome::Transient(url)
                        }
                    }
                };
                results.lock().push((number, outcome));
            }));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!("Probe task panicked: {}", e);
            }
        }

        let mut results = results.lock();
        std::mem::take(&mut *results)
    }

    async fn enumerate_depth(
        &self,
        request: &EnumerateRequest,
        codes: &[&str],
        proxies: Arc<Vec<ProxyEndpoint>>,
        cancel: &CancellationToken,
    ) -> Result<Enumeration> {
        let found: Arc<Mutex<Vec<CandidateResource>>> = Arc::new(Mutex::new(Vec::new()));
        let transient: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let placeholders = Arc::new(Mutex::new(0usize));
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut handles = Vec::new();

        let days = request.range.days().count() as u64;
        self.progress.start("urls", days * codes.len() as u64);

        for code in codes {
            for day in request.range.days() {
                let resource = CandidateResource::depth(code, &request.pair, day);
                let url = resource.url(&self.base_url);
                let prober = Arc::clone(&self.prober);
                let marker = Arc::clone(&self.marker);
                let proxies = Arc::clone(&proxies);
                let found = Arc::clone(&found);
                let transient = Arc::clone(&transient);
                let placeholders = Arc::clone(&placeholders);
                let semaphore = Arc::clone(&semaphore);
                let progress = self.progress.clone();
                let cancel = cancel.clone();
                let skip = request.skip_locally_present;

                handles.push(tokio::spawn(async move {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return;
                    };
                    progress.tick(&url);

                    if skip && marker.is_present(&resource) {
                        debug!("Skipping {}: file already exists locally", url);
                        found.lock().push(resource);
                        return;
                    }

                    match prober.probe(&url, &proxies, &cancel).await {
                        Ok(ProbeOutcome::Exists { size }) => {
                            debug!("Generated URL: {} (Content-Length: {})", url, size);
                            found.lock().push(resource.with_size(size));
                        }
                        Ok(ProbeOutcome::Absent { status }) if status == 403 || status == 404 => {
                            let path = marker.local_path(&resource);
                            match write_placeholder(&path).await {
                                Ok(()) => {
                                    debug!("Created empty file {:?} for status {}", path, status);
                                    *placeholders.lock() += 1;
                                }
                                Err(e) => warn!("Failed to create placeholder {:?}: {}", path, e),
                            }
                        }
                        Ok(ProbeOutcome::Absent { status }) => {
                            debug!("Skipping {}: status code {}", url, status);
                        }
                        Err(ProbeError::Cancelled) => {}
                        Err(e) => {
                            warn!("Giving up on probing {}: {}", url, e);
                            transient.lock().push(url);
                        }
                    }
                }));
            }
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!("Probe task panicked: {}", e);
            }
        }

        if cancel.is_cancelled() {
            bail!("enumeration cancelled");
        }

        let resources = std::mem::take(&mut *found.lock());
        let transient_failures = std::mem::take(&mut *transient.lock());
        let placeholders = *placeholders.lock();
        Ok(Enumeration {
            resources,
            transient_failures,
            placeholders,
        })
    }
}

struct SettledBatch {
    found: Vec<CandidateResource>,
    transient: Vec<String>,
    /// Lowest absent sequence number in the batch
    end_of_day: Option<u32>,
    all_transient: bool,
}

/// Keep the existing numbers below the first absent one, whatever order the
/// probes completed in.
fn settle_batch(mut outcomes: Vec<(u32, SequenceOutcome)>) -> SettledBatch {
    outcomes.sort_by_key(|(number, _)| *number);

    let end_of_day = outcomes
        .iter()
        .find(|(_, outcome)| matches!(outcome, SequenceOutcome::Absent(_)))
        .map(|(number, _)| *number);
    let all_transient = !outcomes.is_empty()
        && outcomes
            .iter()
            .all(|(_, outcome)| matches!(outcome, SequenceOutcome::Transient(_)));

    let mut found = Vec::new();
    let mut transient = Vec::new();
    for (number, outcome) in outcomes {
        if end_of_day.is_some_and(|end| number > end) {
            if let SequenceOutcome::Found(resource) = outcome {
                debug!("Dropping {} found after the end of sequence", resource);
            }
            continue;
        }
        match outcome {
            SequenceOutcome::Found(resource) => found.push(resource),
            SequenceOutcome::Transient(url) => transient.push(url),
            SequenceOutcome::Absent(status) => {
                debug!("Sequence {:03} absent (status {})", number, status);
            }
        }
    }

    SettledBatch {
        found,
        transient,
        end_of_day,
        all_transient,
    }
}

async fn write_placeholder(path: &std::path::Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, b"").await?;
    Ok(())
}
