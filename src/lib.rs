//! Bitget History Downloader Library
//!
//! Mirrors Bitget's public trade and depth archives through a pool of free
//! proxies and loads them into per-pair SQLite databases.
//!
//! A run is one or more reconciliation cycles:
//! - enumerate: probe which archives exist upstream (UrlEnumerator)
//! - download: fetch the missing ones with retries and proxy rotation (DownloadEngine)
//! - load: convert and insert into a working copy, then swap it live (Reconciler)

pub mod archive;
pub mod config;
pub mod converter;
pub mod downloader;
pub mod enumerator;
pub mod http_client;
pub mod market;
pub mod probe_cache;
pub mod prober;
pub mod progress;
pub mod proxy_pool;
pub mod reconcile;
pub mod resume;
pub mod store;

// Re-export commonly used types
pub use config::{Config, DatabaseConfig, DownloadConfig, ProbeConfig, ProxyConfig, RepeatConfig};
pub use downloader::{DownloadEngine, DownloadFailure, DownloadReport};
pub use enumerator::{EnumerateRequest, Enumeration, UrlEnumerator};
pub use http_client::{FetchError, HttpTransport, ProxyTransport};
pub use market::{CandidateResource, DataKind, DateRange, Market};
pub use probe_cache::ProbeCache;
pub use prober::{ExistenceProber, ProbeError, ProbeOutcome};
pub use progress::Progress;
pub use proxy_pool::{ProxyEndpoint, ProxyPool};
pub use reconcile::{Reconciler, RunOptions, RunSummary};
pub use resume::{LocalFileMarker, ResumeMarker};
pub use store::{LoadStats, TickStore};
