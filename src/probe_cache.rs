//! Probe result cache backed by sled
//!
//! Remembers the outcome of existence probes by URL so resumed runs do not
//! probe the same archive twice. Negative results expire after a TTL.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Cached outcome of one existence probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeRecord {
    pub url: String,
    pub status: u16,
    pub size: u64,
    /// Unix timestamp (seconds)
    pub checked_at: i64,
}

impl ProbeRecord {
    pub fn new(url: &str, status: u16, size: u64) -> Self {
        Self {
            url: url.to_string(),
            status,
            size,
            checked_at: Utc::now().timestamp(),
        }
    }

    pub fn exists(&self) -> bool {
        (200..400).contains(&self.status)
    }
}

pub struct ProbeCache {
    db: sled::Db,
    negative_ttl: Duration,
}

impl ProbeCache {
    /// Open or create a probe cache
    pub fn open<P: AsRef<Path>>(db_path: P, negative_ttl: Duration) -> Result<Self> {
        let db = sled::open(db_path.as_ref())
            .context(format!("Failed to open probe cache: {:?}", db_path.as_ref()))?;

        Ok(Self { db, negative_ttl })
    }

    /// In-memory cache, used when no cache path is configured
    pub fn temporary(negative_ttl: Duration) -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .context("Failed to open temporary probe cache")?;
        Ok(Self { db, negative_ttl })
    }

    /// Cached record, if it is still usable
    pub fn lookup(&self, url: &str) -> Result<Option<ProbeRecord>> {
        let Some(record) = self.get(url)? else {
            return Ok(None);
        };

        if !record.exists() {
            let age = Utc::now().timestamp() - record.checked_at;
            if age < 0 || age as u64 >= self.negative_ttl.as_secs() {
                return Ok(None);
            }
        }
        Ok(Some(record))
    }

    pub fn get(&self, url: &str) -> Result<Option<ProbeRecord>> {
        match self.db.get(url.as_bytes())? {
            Some(data) => {
                let record: ProbeRecord = serde_json::from_slice(&data)
                    .context("Failed to deserialize probe record")?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    pub fn store(&self, record: &ProbeRecord) -> Result<()> {
        let data = serde_json::to_vec(record)
            .context("Failed to serialize probe record")?;
        self.db.insert(record.url.as_bytes(), data)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.db.len()
    }

    pub fn is_empty(&self) -> bool {
        self.db.is_empty()
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}
