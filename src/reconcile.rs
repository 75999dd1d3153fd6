//! Reconciliation loop
//!
//! Drives enumerate → download → load cycles for one pair, data kind and date
//! range. Loads always run against a working copy of the database in the temp
//! directory; the copy replaces the live file only after it closed cleanly,
//! and the previous live file is kept as a backup until the swap succeeded.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::archive::{self, discover_local, RecheckReport};
use crate::config::{render_db_path, Config, DatabaseConfig};
use crate::converter::{convert_depth, convert_trades};
use crate::downloader::{DownloadEngine, DownloadReport};
use crate::enumerator::{EnumerateRequest, UrlEnumerator};
use crate::http_client::ProxyTransport;
use crate::market::{CandidateResource, DataKind, DateRange, Market};
use crate::probe_cache::ProbeCache;
use crate::prober::ExistenceProber;
use crate::progress::Progress;
use crate::proxy_pool::ProxyPool;
use crate::resume::{LocalFileMarker, ResumeMarker};
use crate::store::{self, LoadStats, TickStore};

/// What to do in one invocation
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub pair: String,
    pub market: Market,
    pub kind: DataKind,
    pub range: DateRange,
    /// Include locally present archives without probing or downloading them
    pub skip_exists: bool,
    /// No network at all; import the archives already on disk
    pub skip_download: bool,
    /// Keep cycling until nothing is left to fetch (depth only)
    pub repeat: bool,
    /// Delete corrupt local archives before starting
    pub recheck: bool,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub cycles: u32,
    pub enumerated: usize,
    pub probe_failures: usize,
    pub downloaded: usize,
    pub skipped: usize,
    pub reused: usize,
    /// Archives still missing after the last cycle
    pub failed: Vec<String>,
    pub rechecked_removed: usize,
    pub archives_loaded: usize,
    pub archives_rejected: usize,
    pub rows_inserted: usize,
    pub rows_skipped: usize,
    pub rows_invalid: usize,
    /// Database groups whose load or swap failed
    pub group_errors: Vec<String>,
}

impl RunSummary {
    fn absorb_downloads(&mut self, report: &DownloadReport) {
        self.downloaded += report.downloaded;
        self.skipped += report.skipped;
        self.reused += report.reused;
        self.failed = report.failed.clone();
    }

    fn absorb_load(&mut self, stats: &GroupStats) {
        self.archives_loaded += stats.archives;
        self.archives_rejected += stats.rejected;
        self.rows_inserted += stats.rows.inserted;
        self.rows_skipped += stats.rows.skipped;
        self.rows_invalid += stats.invalid;
    }
}

/// Archives loaded into one database file
#[derive(Debug, Clone)]
struct LoadGroup {
    kind: DataKind,
    db_path: PathBuf,
    /// (market code, archive path)
    archives: Vec<(String, PathBuf)>,
    /// Depth tables rebuilt from scratch
    reset_codes: Vec<String>,
}

#[derive(Debug, Default)]
struct GroupStats {
    archives: usize,
    rejected: usize,
    invalid: usize,
    rows: LoadStats,
}

pub struct Reconciler {
    config: Config,
    pool: ProxyPool,
    enumerator: UrlEnumerator,
    engine: DownloadEngine,
    marker: Arc<LocalFileMarker>,
    cache: Option<Arc<ProbeCache>>,
    progress: Progress,
}

impl Reconciler {
    pub fn new(config: Config, transport: Arc<dyn ProxyTransport>, progress: Progress) -> Result<Self> {
        config.validate()?;
        let cache = match &config.probe.cache_path {
            Some(path) => Some(Arc::new(ProbeCache::open(path, config.probe.negative_ttl())?)),
            None => None,
        };

        let marker = Arc::new(LocalFileMarker::new(&config.output_dir));
        let prober = Arc::new(ExistenceProber::new(
            Arc::clone(&transport),
            &config.probe,
            &config.user_agent,
            cache.clone(),
        ));
        let enumerator = UrlEnumerator::new(
            prober,
            marker.clone(),
            config.base_url(),
            config.probe.batch_size,
            config.probe.max_sequence,
            config.probe.concurrency,
            progress.clone(),
        );
        let engine = DownloadEngine::new(
            Arc::clone(&transport),
            marker.clone(),
            config.download.clone(),
            config.base_url(),
            &config.user_agent,
            progress.clone(),
        );
        let pool = ProxyPool::new(config.proxy.clone(), &config.user_agent, transport);

        Ok(Self {
            config,
            pool,
            enumerator,
            engine,
            marker,
            cache,
            progress,
        })
    }

    pub async fn run(&self, options: &RunOptions, cancel: &CancellationToken) -> Result<RunSummary> {
        let codes = options.market.codes(options.kind);
        // unresolvable database paths are fatal before any work starts
        for code in &codes {
            self.db_path(options.kind, &options.pair, code)?;
        }

        let mut summary = RunSummary::default();

        if options.recheck {
            summary.rechecked_removed = self.recheck(options, &codes)?.removed;
        }

        if options.skip_download {
            info!("Downloads disabled, importing local archives");
            let mut resources = Vec::new();
            for code in &codes {
                resources.extend(discover_local(
                    &self.config.output_dir,
                    options.kind,
                    &options.pair,
                    code,
                    Some(&options.range),
                )?);
            }
            summary.cycles = 1;
            summary.enumerated = resources.len();
            self.load(options, &codes, &resources, cancel, &mut summary).await;
            if cancel.is_cancelled() {
                bail!("run cancelled");
            }
            return Ok(summary);
        }

        self.pool.ensure(cancel).await?;
        let proxies = self.pool.get()?;
        info!("Using {} working proxies", proxies.len());
        let shared_proxies = Arc::new(proxies.clone());

        let repeat = options.repeat && options.kind == DataKind::Depth;
        if options.repeat && !repeat {
            info!("Trade enumeration ends on its own, running a single pass");
        }
        let max_cycles = if repeat {
            self.config.repeat.max_cycles.max(1)
        } else {
            1
        };

        let request = EnumerateRequest {
            pair: options.pair.clone(),
            market: options.market,
            kind: options.kind,
            range: options.range,
            skip_locally_present: options.skip_exists,
        };

        for cycle in 1..=max_cycles {
            summary.cycles = cycle;
            let enumeration = self
                .enumerator
                .enumerate(&request, Arc::clone(&shared_proxies), cancel)
                .await?;
            summary.enumerated += enumeration.resources.len();
            summary.probe_failures += enumeration.transient_failures.len();

            let pending = enumeration
                .resources
                .iter()
                .filter(|r| !self.marker.is_complete(r))
                .count();
            info!(
                "Cycle {}: {} archives enumerated, {} to fetch",
                cycle,
                enumeration.resources.len(),
                pending
            );

            let report = match self
                .engine
                .download_all(cancel, proxies.clone(), enumeration.resources.clone())
                .await
            {
                Ok(report) => report,
                Err(failure) => {
                    warn!("{}", failure);
                    failure.report
                }
            };
            summary.absorb_downloads(&report);
            if cancel.is_cancelled() {
                bail!("run cancelled");
            }

            self.load(options, &codes, &enumeration.resources, cancel, &mut summary)
                .await;
            if cancel.is_cancelled() {
                bail!("run cancelled");
            }

            if !repeat {
                break;
            }
            let remaining = report.failed.len() + enumeration.transient_failures.len();
            if remaining == 0 {
                info!("Cycle {}: nothing left to fetch", cycle);
                break;
            }
            if report.downloaded + report.reused == 0 {
                warn!("Cycle {} made no progress, {} archives still missing", cycle, remaining);
                break;
            }
            info!("Cycle {}: {} archives still missing, starting another cycle", cycle, remaining);
        }

        if let Some(cache) = &self.cache {
            if let Err(e) = cache.flush() {
                warn!("Failed to flush probe cache: {}", e);
            }
        }
        Ok(summary)
    }

    fn db_path(&self, kind: DataKind, pair: &str, code: &str) -> Result<PathBuf> {
        match kind {
            DataKind::Trades => render_db_path(&self.config.database.trades_path, pair, code),
            // one database per pair holds the tables of every depth code
            DataKind::Depth => render_db_path(&self.config.database.depth_path, pair, ""),
        }
    }

    fn recheck(&self, options: &RunOptions, codes: &[&str]) -> Result<RecheckReport> {
        let mut paths = Vec::new();
        for code in codes {
            let local = discover_local(
                &self.config.output_dir,
                options.kind,
                &options.pair,
                code,
                Some(&options.range),
            )?;
            paths.extend(local.iter().map(|r| self.marker.local_path(r)));
        }
        Ok(archive::recheck(&paths))
    }

    /// Trades load the archives of this cycle; depth rebuilds from every local archive of the pair
    fn groups(
        &self,
        options: &RunOptions,
        codes: &[&str],
        resources: &[CandidateResource],
    ) -> Result<Vec<LoadGroup>> {
        match options.kind {
            DataKind::Trades => {
                let mut groups = Vec::new();
                for code in codes {
                    let archives: Vec<(String, PathBuf)> = resources
                        .iter()
                        .filter(|r| r.code == *code)
                        .map(|r| self.marker.local_path(r))
                        .filter(|path| is_non_empty(path))
                        .map(|path| (code.to_string(), path))
                        .collect();
                    if archives.is_empty() {
                        continue;
                    }
                    groups.push(LoadGroup {
                        kind: DataKind::Trades,
                        db_path: self.db_path(DataKind::Trades, &options.pair, code)?,
                        archives,
                        reset_codes: Vec::new(),
                    });
                }
                Ok(groups)
            }
            DataKind::Depth => {
                let mut archives = Vec::new();
                for code in codes {
                    for resource in discover_local(
                        &self.config.output_dir,
                        DataKind::Depth,
                        &options.pair,
                        code,
                        None,
                    )? {
                        let path = self.marker.local_path(&resource);
                        if is_non_empty(&path) {
                            archives.push((code.to_string(), path));
                        }
                    }
                }
                if archives.is_empty() {
                    return Ok(Vec::new());
                }
                Ok(vec![LoadGroup {
                    kind: DataKind::Depth,
                    db_path: self.db_path(DataKind::Depth, &options.pair, "")?,
                    archives,
                    reset_codes: codes.iter().map(|c| c.to_string()).collect(),
                }])
            }
        }
    }

    async fn load(
        &self,
        options: &RunOptions,
        codes: &[&str],
        resources: &[CandidateResource],
        cancel: &CancellationToken,
        summary: &mut RunSummary,
    ) {
        let groups = match self.groups(options, codes, resources) {
            Ok(groups) => groups,
            Err(e) => {
                error!("Failed to collect archives to load: {:#}", e);
                summary.group_errors.push(format!("{:#}", e));
                return;
            }
        };

        for group in groups {
            let label = format!("{:?}", group.db_path);
            let database = self.config.database.clone();
            let progress = self.progress.clone();
            let cancel = cancel.clone();

            let result = tokio::task::spawn_blocking(move || {
                load_group(&group, &database, &progress, &cancel)
            })
            .await;

            match result {
                Ok(Ok(stats)) => summary.absorb_load(&stats),
                Ok(Err(e)) => {
                    error!("Failed to load {}: {:#}", label, e);
                    summary.group_errors.push(format!("{}: {:#}", label, e));
                }
                Err(e) => {
                    error!("Load task for {} panicked: {}", label, e);
                    summary.group_errors.push(format!("{}: {}", label, e));
                }
            }
        }
    }
}

/// Zero-byte placeholders carry no rows
fn is_non_empty(path: &Path) -> bool {
    fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false)
}

fn sibling_file(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn remove_db_files(path: &Path) {
    for suffix in ["", "-wal", "-shm"] {
        let _ = fs::remove_file(sibling_file(path, suffix));
    }
}

/// Build the group's database in the temp directory, then swap it over the live file
fn load_group(
    group: &LoadGroup,
    database: &DatabaseConfig,
    progress: &Progress,
    cancel: &CancellationToken,
) -> Result<GroupStats> {
    fs::create_dir_all(&database.temp_dir)
        .context(format!("Failed to create temp directory: {:?}", database.temp_dir))?;
    let file_name = group
        .db_path
        .file_name()
        .context(format!("invalid database path: {:?}", group.db_path))?;
    let temp = database.temp_dir.join(file_name);
    remove_db_files(&temp);

    if group.db_path.exists() {
        store::checkpoint_file(&group.db_path)?;
        fs::copy(&group.db_path, &temp)
            .context(format!("Failed to copy {:?} to {:?}", group.db_path, temp))?;
    }

    let codes: Vec<&str> = group.reset_codes.iter().map(String::as_str).collect();
    let mut store = match group.kind {
        DataKind::Trades => TickStore::open_trades(&temp)?,
        DataKind::Depth => {
            let store = TickStore::open_depth(&temp, &codes)?;
            store.reset_depth_tables(&codes)?;
            store
        }
    };

    let mut stats = GroupStats::default();
    progress.start("archives", group.archives.len() as u64);

    for (code, path) in &group.archives {
        if cancel.is_cancelled() {
            drop(store);
            remove_db_files(&temp);
            bail!("load cancelled");
        }
        progress.tick(&path.to_string_lossy());

        let result = match group.kind {
            DataKind::Trades => convert_trades(path).and_then(|converted| {
                Ok((store.insert_trades(&converted.rows)?, converted.skipped))
            }),
            DataKind::Depth => convert_depth(path).and_then(|converted| {
                Ok((store.insert_depth(code, &converted.rows)?, converted.skipped))
            }),
        };

        match result {
            Ok((rows, invalid)) => {
                store.checkpoint()?;
                info!(
                    "Loaded {:?}: {} inserted, {} skipped, {} invalid rows",
                    path, rows.inserted, rows.skipped, invalid
                );
                stats.archives += 1;
                stats.invalid += invalid;
                stats.rows.add(rows);
            }
            Err(e) => {
                warn!("Failed to process {:?}: {:#}", path, e);
                stats.rejected += 1;
            }
        }
    }

    store.close()?;
    swap_database(&temp, &group.db_path, &database.backup_suffix)?;
    info!(
        "Database {:?} updated: {} archives, {} rows inserted, {} duplicates",
        group.db_path, stats.archives, stats.rows.inserted, stats.rows.skipped
    );
    Ok(stats)
}

/// Replace `live` with `temp`. The old live file is renamed to `<live><suffix>` first and
/// restored if any later step fails.
pub fn swap_database(temp: &Path, live: &Path, backup_suffix: &str) -> Result<()> {
    if let Some(parent) = live.parent() {
        fs::create_dir_all(parent).context(format!("Failed to create directory: {:?}", parent))?;
    }

    let backup = sibling_file(live, backup_suffix);
    if backup == live {
        bail!("backup path {:?} is the live database itself", backup);
    }
    let had_live = live.exists();
    if had_live {
        fs::rename(live, &backup)
            .context(format!("Failed to back up {:?} to {:?}", live, backup))?;
    }

    let incoming = sibling_file(live, ".incoming");
    let result = (|| -> Result<()> {
        fs::copy(temp, &incoming).context(format!("Failed to copy {:?} to {:?}", temp, incoming))?;
        fs::File::open(&incoming)
            .and_then(|f| f.sync_all())
            .context(format!("Failed to sync {:?}", incoming))?;
        fs::rename(&incoming, live).context(format!("Failed to move {:?} to {:?}", incoming, live))?;
        Ok(())
    })();

    match result {
        Ok(()) => {
            if had_live {
                if let Err(e) = fs::remove_file(&backup) {
                    warn!("Failed to remove backup {:?}: {}", backup, e);
                }
            }
            remove_db_files(temp);
            Ok(())
        }
        Err(e) => {
            let _ = fs::remove_file(&incoming);
            if had_live {
                fs::rename(&backup, live)
                    .context(format!("Failed to restore {:?} from {:?}", live, backup))?;
                warn!("Restored {:?} from backup", live);
            }
            Err(e.context(format!("Failed to replace {:?}", live)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::fixtures::zip_with;
    use crate::http_client::mock::MockTransport;
    use crate::http_client::{FetchResponse, HeadResponse};
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 5, d).unwrap()
    }

    fn test_config(root: &Path) -> Config {
        let mut config = Config::default();
        config.base_url = "https://origin.test/online".to_string();
        config.output_dir = root.join("raw");
        config.proxy.raw_file = root.join("proxies/raw.txt");
        config.proxy.working_file = root.join("proxies/working.txt");
        config.proxy.check_url = "https://echo.test/".to_string();
        config.proxy.reuse_working = true;
        config.probe.cache_path = None;
        config.download.backoff_secs = 0;
        config.download.max_attempts = 2;
        config.database.trades_path = root.join("db/trades/{pair}_{code}.db").to_string_lossy().into_owned();
        config.database.depth_path = root.join("db/depth/{pair}.db").to_string_lossy().into_owned();
        config.database.temp_dir = root.join("tmp");

        fs::create_dir_all(root.join("proxies")).unwrap();
        fs::write(&config.proxy.raw_file, "socks5://10.0.0.1:1080\nsocks5://10.0.0.2:1080\n").unwrap();
        config
    }

    fn file_name(url: &str) -> &str {
        url.rsplit('/').next().unwrap()
    }

    /// Payload with three rows whose keys derive from the archive name
    fn payload_for(url: &str) -> Vec<u8> {
        let name = file_name(url).trim_end_matches(".zip");
        let csv = if url.contains("/trades/") {
            let mut csv = String::from("trade_id,timestamp,price,side,volume_quote,size_base\n");
            for i in 0..3 {
                csv.push_str(&format!("{}-{},{},100.5,buy,1.0,0.01\n", name, i, 1000 + i));
            }
            csv
        } else {
            let base: i64 = name.parse::<i64>().unwrap() * 10;
            let mut csv = String::from("timestamp,ask_price,bid_price,ask_volume,bid_volume\n");
            for i in 0..3 {
                csv.push_str(&format!("{},10.5,10.4,1,2\n", base + i));
            }
            csv
        };
        zip_with("data.csv", csv.as_bytes())
    }

    fn echo(proxy: Option<&crate::proxy_pool::ProxyEndpoint>) -> FetchResponse {
        FetchResponse {
            status: 200,
            body: proxy.map(|p| p.host().as_bytes().to_vec()).unwrap_or_default(),
        }
    }

    /// Trades 1..=2 exist each day; depth exists only under code "1"
    fn origin() -> MockTransport {
        MockTransport::new()
            .on_head(|url, _| {
                let name = file_name(url);
                let exists = if url.contains("/trades/") {
                    name[9..12].parse::<u32>().unwrap() <= 2
                } else {
                    url.contains("/1/")
                };
                Ok(HeadResponse { status: if exists { 200 } else { 404 }, content_length: None })
            })
            .on_get(|url, proxy| {
                if url.starts_with("https://echo.test") {
                    return Ok(echo(proxy));
                }
                Ok(FetchResponse { status: 200, body: payload_for(url) })
            })
    }

    fn options(kind: DataKind, market: Market) -> RunOptions {
        RunOptions {
            pair: "BTCUSDT".to_string(),
            market,
            kind,
            range: DateRange::new(day(1), day(2)).unwrap(),
            skip_exists: true,
            skip_download: false,
            repeat: false,
            recheck: false,
        }
    }

    fn count_rows(path: &Path, table: &str) -> i64 {
        let conn = rusqlite::Connection::open(path).unwrap();
        conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn test_swap_replaces_live_and_drops_backup() {
        let dir = TempDir::new().unwrap();
        let temp = dir.path().join("tmp.db");
        let live = dir.path().join("live/trades.db");
        fs::create_dir_all(live.parent().unwrap()).unwrap();
        fs::write(&temp, b"new").unwrap();
        fs::write(&live, b"old").unwrap();

        swap_database(&temp, &live, ".bak").unwrap();
        assert_eq!(fs::read(&live).unwrap(), b"new");
        assert!(!sibling_file(&live, ".bak").exists());
        assert!(!sibling_file(&live, ".incoming").exists());
        assert!(!temp.exists());
    }

    #[test]
    fn test_swap_restores_backup_on_failure() {
        let dir = TempDir::new().unwrap();
        let live = dir.path().join("trades.db");
        fs::write(&live, b"old").unwrap();

        let err = swap_database(&dir.path().join("missing.db"), &live, ".bak").unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to replace"));
        assert_eq!(fs::read(&live).unwrap(), b"old");
        assert!(!sibling_file(&live, ".bak").exists());
        assert!(!sibling_file(&live, ".incoming").exists());
    }

    #[test]
    fn test_swap_refuses_empty_backup_suffix() {
        let dir = TempDir::new().unwrap();
        let temp = dir.path().join("tmp.db");
        let live = dir.path().join("trades.db");
        fs::write(&temp, b"new").unwrap();
        fs::write(&live, b"old").unwrap();

        assert!(swap_database(&temp, &live, "").is_err());
        assert_eq!(fs::read(&live).unwrap(), b"old");
        assert!(!sibling_file(&live, ".incoming").exists());
    }

    #[test]
    fn test_new_rejects_empty_backup_suffix() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(dir.path());
        config.database.backup_suffix = String::new();
        let transport = origin().into_arc();
        assert!(Reconciler::new(config, transport.clone(), Progress::hidden()).is_err());
        assert_eq!(transport.gets() + transport.heads(), 0);
    }

    #[test]
    fn test_depth_path_with_code_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(dir.path());
        config.database.depth_path = dir.path().join("db/depth/{pair}_{code}.db").to_string_lossy().into_owned();
        let transport = origin().into_arc();
        assert!(Reconciler::new(config, transport.clone(), Progress::hidden()).is_err());
        assert_eq!(transport.gets() + transport.heads(), 0);
    }

    #[test]
    fn test_swap_without_previous_live() {
        let dir = TempDir::new().unwrap();
        let temp = dir.path().join("tmp.db");
        let live = dir.path().join("new/trades.db");
        fs::write(&temp, b"fresh").unwrap();

        swap_database(&temp, &live, ".bak").unwrap();
        assert_eq!(fs::read(&live).unwrap(), b"fresh");
    }

    #[tokio::test]
    async fn test_trades_run_is_resumable_and_idempotent() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let db = dir.path().join("db/trades/BTCUSDT_SPBL.db");
        let transport = origin().into_arc();
        let reconciler = Reconciler::new(config, transport.clone(), Progress::hidden()).unwrap();
        let cancel = CancellationToken::new();
        let opts = options(DataKind::Trades, Market::Spot);

        let first = reconciler.run(&opts, &cancel).await.unwrap();
        assert_eq!(first.enumerated, 4);
        assert_eq!(first.downloaded, 4);
        assert!(first.failed.is_empty());
        assert_eq!(first.rows_inserted, 12);
        assert!(first.group_errors.is_empty());
        assert_eq!(count_rows(&db, "trades"), 12);
        let gets_after_first = transport.gets();

        let second = reconciler.run(&opts, &cancel).await.unwrap();
        assert_eq!(second.downloaded, 0);
        assert_eq!(second.skipped, 4);
        assert_eq!(transport.gets(), gets_after_first);
        assert_eq!(second.rows_inserted, 0);
        assert_eq!(second.rows_skipped, 12);
        assert_eq!(count_rows(&db, "trades"), 12);
    }

    #[tokio::test]
    async fn test_trades_all_markets_get_separate_databases() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let reconciler = Reconciler::new(config, origin().into_arc(), Progress::hidden()).unwrap();
        let summary = reconciler
            .run(&options(DataKind::Trades, Market::All), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.downloaded, 8);
        assert_eq!(count_rows(&dir.path().join("db/trades/BTCUSDT_SPBL.db"), "trades"), 12);
        assert_eq!(count_rows(&dir.path().join("db/trades/BTCUSDT_UMCBL.db"), "trades"), 12);
    }

    #[tokio::test]
    async fn test_skip_download_imports_local_archives_offline() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        for n in 1..=2 {
            let resource = CandidateResource::trades("SPBL", "BTCUSDT", day(1), n);
            let path = resource.local_path(&config.output_dir);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, payload_for(&resource.url("https://origin.test/online"))).unwrap();
        }

        let transport = origin().into_arc();
        let reconciler = Reconciler::new(config, transport.clone(), Progress::hidden()).unwrap();
        let mut opts = options(DataKind::Trades, Market::Spot);
        opts.skip_download = true;

        let summary = reconciler.run(&opts, &CancellationToken::new()).await.unwrap();
        assert_eq!(summary.archives_loaded, 2);
        assert_eq!(summary.rows_inserted, 6);
        assert_eq!(transport.gets() + transport.heads(), 0);
    }

    #[tokio::test]
    async fn test_depth_rebuilds_tables_from_local_archives() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let db = dir.path().join("db/depth/BTCUSDT.db");
        let reconciler = Reconciler::new(config.clone(), origin().into_arc(), Progress::hidden()).unwrap();
        let opts = options(DataKind::Depth, Market::All);

        let summary = reconciler.run(&opts, &CancellationToken::new()).await.unwrap();
        // code 2 is refused upstream and only gets placeholders
        assert_eq!(summary.enumerated, 2);
        assert_eq!(count_rows(&db, "\"1\""), 6);
        assert_eq!(count_rows(&db, "\"2\""), 0);
        assert!(dir.path().join("raw/depth/BTCUSDT/2/20250501.zip").exists());

        // tables are dropped and rebuilt, so a second load keeps the same counts
        let summary = reconciler.run(&opts, &CancellationToken::new()).await.unwrap();
        assert_eq!(summary.rows_inserted, 6);
        assert_eq!(count_rows(&db, "\"1\""), 6);
        assert!(!sibling_file(&db, &config.database.backup_suffix).exists());
    }

    #[tokio::test]
    async fn test_depth_repeat_until_complete() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(dir.path());
        config.download.max_attempts = 1;

        let archive_gets = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&archive_gets);
        let transport = MockTransport::new()
            .on_head(|url, _| {
                Ok(HeadResponse { status: if url.contains("/1/") { 200 } else { 404 }, content_length: None })
            })
            .on_get(move |url, proxy| {
                if url.starts_with("https://echo.test") {
                    return Ok(echo(proxy));
                }
                // the first archive request hits a flaky edge
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Ok(FetchResponse { status: 502, body: Vec::new() });
                }
                Ok(FetchResponse { status: 200, body: payload_for(url) })
            })
            .into_arc();

        let reconciler = Reconciler::new(config, transport, Progress::hidden()).unwrap();
        let mut opts = options(DataKind::Depth, Market::Spot);
        opts.repeat = true;

        let summary = reconciler.run(&opts, &CancellationToken::new()).await.unwrap();
        assert_eq!(summary.cycles, 2);
        assert!(summary.failed.is_empty());
        assert_eq!(count_rows(&dir.path().join("db/depth/BTCUSDT.db"), "\"1\""), 6);
    }

    #[tokio::test]
    async fn test_recheck_replaces_corrupt_archive() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let resource = CandidateResource::trades("SPBL", "BTCUSDT", day(1), 1);
        let path = resource.local_path(&config.output_dir);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"truncated").unwrap();

        let reconciler = Reconciler::new(config, origin().into_arc(), Progress::hidden()).unwrap();
        let mut opts = options(DataKind::Trades, Market::Spot);
        opts.recheck = true;

        let summary = reconciler.run(&opts, &CancellationToken::new()).await.unwrap();
        assert_eq!(summary.rechecked_removed, 1);
        assert_eq!(summary.downloaded, 4);
        assert!(archive::validate_file(&path).unwrap() > 0);
    }

    #[tokio::test]
    async fn test_unresolved_db_template_is_fatal() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(dir.path());
        config.database.trades_path = dir.path().join("db/{pair}_{market}.db").to_string_lossy().into_owned();
        let transport = origin().into_arc();
        let reconciler = Reconciler::new(config, transport.clone(), Progress::hidden()).unwrap();

        let result = reconciler
            .run(&options(DataKind::Trades, Market::Spot), &CancellationToken::new())
            .await;
        assert!(result.is_err());
        assert_eq!(transport.gets(), 0);
    }
}
