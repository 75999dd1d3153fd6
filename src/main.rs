//! Bitget History Downloader
//!
//! Mirrors Bitget's public trade and depth archives through free proxies and
//! loads them into local SQLite databases.

use anyhow::{bail, Context, Result};
use chrono::{Local, Months, NaiveDate};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use bitget_history::{
    Config, DataKind, DateRange, HttpTransport, Market, Progress, ProxyTransport, Reconciler,
    RunOptions,
};

const DEFAULT_CONFIG: &str = "config/config.yaml";

/// CLI arguments
#[derive(Parser, Debug)]
#[command(name = "bitget-history")]
#[command(about = "Download Bitget trade and depth history through free proxies", long_about = None)]
struct Args {
    /// Path to the configuration YAML file (defaults to config/config.yaml when present)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Data type to download: trades or depth
    #[arg(short = 't', long = "type", value_name = "TYPE")]
    data_type: DataKind,

    /// Trading pair
    #[arg(short, long, default_value = "BTCUSDT")]
    pair: String,

    /// Market: spot, futures or all
    #[arg(short, long, default_value = "all")]
    market: Market,

    /// First day (YYYY-MM-DD), defaults to one year ago
    #[arg(short, long, value_name = "DATE")]
    start: Option<String>,

    /// Last day (YYYY-MM-DD), defaults to today
    #[arg(short, long, value_name = "DATE")]
    end: Option<String>,

    /// Proxy check timeout in seconds
    #[arg(short = 'T', long, value_name = "SECS")]
    timeout: Option<u64>,

    /// Verbose logging, no progress bar
    #[arg(short, long)]
    debug: bool,

    /// Skip archives already present locally
    #[arg(short = 'X', long)]
    skip_exists: bool,

    /// Do not touch the network, import local archives only
    #[arg(short = 'S', long)]
    skip_download: bool,

    /// Repeat enumerate/download cycles until nothing is missing
    #[arg(short, long)]
    repeat: bool,

    /// Validate local archives first and delete corrupt ones
    #[arg(short = 'R', long = "recheck-exists")]
    recheck: bool,
}

fn parse_day(value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .context(format!("Failed to parse date: {} (expected YYYY-MM-DD)", value))
}

fn date_range(args: &Args) -> Result<DateRange> {
    let today = Local::now().date_naive();
    let start = match &args.start {
        Some(value) => parse_day(value)?,
        None => today.checked_sub_months(Months::new(12)).unwrap_or(today),
    };
    let end = match &args.end {
        Some(value) => parse_day(value)?,
        None => today,
    };
    DateRange::new(start, end)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    let mut config = match &args.config {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            Config::from_file(path).context("Failed to load configuration")?
        }
        None => Config::load_or_default(DEFAULT_CONFIG).context("Failed to load configuration")?,
    };
    if let Some(timeout) = args.timeout {
        config.proxy.check_timeout_secs = timeout;
    }

    let range = date_range(&args)?;
    let options = RunOptions {
        pair: args.pair.to_uppercase(),
        market: args.market,
        kind: args.data_type,
        range,
        skip_exists: args.skip_exists,
        skip_download: args.skip_download,
        repeat: args.repeat,
        recheck: args.recheck,
    };
    info!(
        "Processing {} {} ({:?}) from {} to {}",
        options.pair, options.kind, options.market, range.start, range.end
    );

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            signal_token.cancel();
        }
    });

    let transport: Arc<dyn ProxyTransport> =
        Arc::new(HttpTransport::new().context("Failed to create HTTP transport")?);
    let reconciler = Reconciler::new(config, transport, Progress::new(args.debug))?;
    let summary = reconciler.run(&options, &cancel).await?;

    info!(
        "Finished after {} cycle(s): {} enumerated, {} downloaded, {} skipped, {} reused",
        summary.cycles, summary.enumerated, summary.downloaded, summary.skipped, summary.reused
    );
    info!(
        "Loaded {} archives: {} rows inserted, {} duplicates, {} invalid rows",
        summary.archives_loaded, summary.rows_inserted, summary.rows_skipped, summary.rows_invalid
    );
    if summary.probe_failures > 0 {
        warn!("{} existence probes failed at the network level", summary.probe_failures);
    }
    if !summary.failed.is_empty() {
        warn!("{} archives could not be downloaded:", summary.failed.len());
        for id in &summary.failed {
            warn!("  {}", id);
        }
    }
    if summary.archives_rejected > 0 {
        warn!("{} archives could not be converted", summary.archives_rejected);
    }

    if !summary.group_errors.is_empty() {
        for message in &summary.group_errors {
            error!("{}", message);
        }
        bail!("{} database(s) failed to update", summary.group_errors.len());
    }

    info!("Done");
    Ok(())
}
