//! Configuration module for the history downloader
//!
//! This module defines the YAML configuration for the archive origin, the proxy
//! pool, existence probing, downloads and the embedded databases.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://img.bitgetimg.com/online";
const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

/// Proxy pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Raw candidate list, one endpoint URL per line
    pub raw_file: PathBuf,
    /// Validated working set, same format as `raw_file`
    pub working_file: PathBuf,
    /// Optional proxy used only to fetch the candidate lists (e.g. "socks5://127.0.0.1:9050")
    pub fallback: Option<String>,
    /// Candidate list providers, one per protocol family
    pub list_urls: Vec<String>,
    /// IP-echo endpoint used for liveness validation
    pub check_url: String,
    /// Per-candidate validation timeout in seconds
    pub check_timeout_secs: u64,
    /// Maximum number of validations in flight
    pub validate_concurrency: usize,
    /// Reuse an existing working file instead of re-validating
    pub reuse_working: bool,
    /// A reused working file older than this is validated again
    pub max_age_hours: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            raw_file: PathBuf::from("data/proxies/raw.txt"),
            working_file: PathBuf::from("data/proxies/working.txt"),
            fallback: None,
            list_urls: vec![
                "https://cdn.jsdelivr.net/gh/proxifly/free-proxy-list@main/proxies/protocols/socks4/data.txt".to_string(),
                "https://cdn.jsdelivr.net/gh/proxifly/free-proxy-list@main/proxies/protocols/socks5/data.txt".to_string(),
            ],
            check_url: "https://ifconfig.io".to_string(),
            check_timeout_secs: 3,
            validate_concurrency: 256,
            reuse_working: false,
            max_age_hours: 24,
        }
    }
}

impl ProxyConfig {
    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.check_timeout_secs)
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_hours * 3600)
    }
}

/// Existence probe configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub max_attempts: u32,
    pub timeout_secs: u64,
    /// Number of trade sequence numbers probed concurrently
    pub batch_size: u32,
    /// Highest trade sequence number per day
    pub max_sequence: u32,
    /// Maximum number of depth probes in flight
    pub concurrency: usize,
    /// sled directory for cached probe results; no cache when unset
    pub cache_path: Option<PathBuf>,
    /// Negative results older than this are probed again
    pub negative_ttl_hours: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            timeout_secs: 30,
            batch_size: 10,
            max_sequence: 999,
            concurrency: 32,
            cache_path: Some(PathBuf::from("data/cache/probes")),
            negative_ttl_hours: 24,
        }
    }
}

impl ProbeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn negative_ttl(&self) -> Duration {
        Duration::from_secs(self.negative_ttl_hours * 3600)
    }
}

/// Download configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    pub max_attempts: u32,
    pub trades_timeout_secs: u64,
    pub depth_timeout_secs: u64,
    /// Delay before attempt `n + 1` is `n * backoff_secs`
    pub backoff_secs: u64,
    /// Size of the download worker pool
    pub max_concurrency: usize,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            trades_timeout_secs: 120,
            depth_timeout_secs: 60,
            backoff_secs: 1,
            max_concurrency: 32,
        }
    }
}

/// Embedded database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Trades database per pair and market code, e.g. "data/db/trades/{pair}_{code}.db"
    pub trades_path: String,
    /// Depth database per pair, e.g. "data/db/depth/{pair}.db"
    pub depth_path: String,
    /// Working copies are built here before being swapped over the live file
    pub temp_dir: PathBuf,
    /// The live file is kept under this suffix until the swap succeeds
    pub backup_suffix: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            trades_path: "data/db/trades/{pair}_{code}.db".to_string(),
            depth_path: "data/db/depth/{pair}.db".to_string(),
            temp_dir: std::env::temp_dir().join("bitget-history"),
            backup_suffix: ".bak".to_string(),
        }
    }
}

/// Repeat-until-complete configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepeatConfig {
    pub max_cycles: u32,
}

impl Default for RepeatConfig {
    fn default() -> Self {
        Self { max_cycles: 10 }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Archive origin (e.g., "https://img.bitgetimg.com/online")
    pub base_url: String,
    pub user_agent: String,
    /// Local mirror root for downloaded archives
    pub output_dir: PathBuf,
    pub proxy: ProxyConfig,
    pub probe: ProbeConfig,
    pub download: DownloadConfig,
    pub database: DatabaseConfig,
    pub repeat: RepeatConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            output_dir: PathBuf::from("data/raw"),
            proxy: ProxyConfig::default(),
            probe: ProbeConfig::default(),
            download: DownloadConfig::default(),
            database: DatabaseConfig::default(),
            repeat: RepeatConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

        let config: Config = serde_yaml::from_str(&content)
            .context("Failed to parse config YAML")?;

        config.validate()?;
        Ok(config)
    }

    /// Load the file if it exists, otherwise fall back to built-in defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.base_url.trim().is_empty() {
            bail!("base_url must not be empty");
        }
        if self.download.max_attempts == 0 || self.probe.max_attempts == 0 {
            bail!("max_attempts must be at least 1");
        }
        if self.probe.batch_size == 0 || self.probe.max_sequence == 0 {
            bail!("probe batch_size and max_sequence must be positive");
        }
        if self.download.max_concurrency == 0 {
            bail!("download max_concurrency must be positive");
        }
        if self.database.backup_suffix.trim().is_empty() {
            bail!("database backup_suffix must not be empty");
        }
        if self.database.depth_path.contains("{code}") {
            bail!("database depth_path holds every market code and must not contain {{code}}");
        }
        Ok(())
    }

    /// Origin without a trailing slash
    pub fn base_url(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }
}

/// Substitute `{pair}` and `{code}` in a database path template.
///
/// Fails if any placeholder is left unresolved.
pub fn render_db_path(template: &str, pair: &str, code: &str) -> Result<PathBuf> {
    let rendered = template.replace("{pair}", pair).replace("{code}", code);
    if rendered.contains('{') || rendered.contains('}') || rendered.contains("%s") {
        bail!("invalid database path: {} contains an unresolved placeholder", rendered);
    }
    if rendered.trim().is_empty() {
        bail!("database path template is empty");
    }
    Ok(PathBuf::from(rendered))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_parsing() {
        let yaml = r#"
base_url: "https://origin.example.com/online/"
output_dir: "/data/raw"
proxy:
  working_file: "/data/proxies/ok.txt"
  check_timeout_secs: 5
download:
  max_attempts: 7
  max_concurrency: 4
database:
  trades_path: "/data/db/{pair}-{code}.db"
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.base_url(), "https://origin.example.com/online");
        assert_eq!(config.proxy.working_file, PathBuf::from("/data/proxies/ok.txt"));
        assert_eq!(config.proxy.check_timeout(), Duration::from_secs(5));
        // untouched fields keep their defaults
        assert_eq!(config.proxy.list_urls.len(), 2);
        assert_eq!(config.download.max_attempts, 7);
        assert_eq!(config.download.depth_timeout_secs, 60);
        assert_eq!(config.probe.batch_size, 10);
        assert_eq!(config.database.backup_suffix, ".bak");
    }

    #[test]
    fn test_config_parsing_empty_document() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.probe.max_sequence, 999);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_example_config_parses() {
        let config: Config =
            serde_yaml::from_str(include_str!("../config/config.example.yaml")).unwrap();
        assert!(config.validate().is_ok());
        assert!(config.proxy.reuse_working);
        assert_eq!(config.database.temp_dir, PathBuf::from("data/tmp"));
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let mut config = Config::default();
        config.download.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unsafe_database_paths() {
        let mut config = Config::default();
        config.database.backup_suffix = String::new();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.database.depth_path = "db/depth/{pair}_{code}.db".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_render_db_path() {
        let path = render_db_path("db/trades/{pair}_{code}.db", "BTCUSDT", "SPBL").unwrap();
        assert_eq!(path, PathBuf::from("db/trades/BTCUSDT_SPBL.db"));

        assert!(render_db_path("db/{pair}_{market}.db", "BTCUSDT", "SPBL").is_err());
        assert!(render_db_path("db/%s.db", "BTCUSDT", "SPBL").is_err());
    }
}
