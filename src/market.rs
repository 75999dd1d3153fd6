//! Market codes, data kinds and remote resource layout
//!
//! Trades archives live at `trades/{code}/{PAIR}/{YYYYMMDD}_{NNN}.zip` and depth
//! archives at `depth/{PAIR}/{code}/{YYYYMMDD}.zip`. The local mirror uses the
//! same relative paths under the output directory.

use anyhow::{bail, Result};
use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Kind of archive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataKind {
    Trades,
    Depth,
}

impl DataKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataKind::Trades => "trades",
            DataKind::Depth => "depth",
        }
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "trades" => Ok(DataKind::Trades),
            "depth" => Ok(DataKind::Depth),
            other => bail!("invalid data type: {} (must be trades or depth)", other),
        }
    }
}

/// Market selection from the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Market {
    Spot,
    Futures,
    All,
}

impl FromStr for Market {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "spot" => Ok(Market::Spot),
            "futures" => Ok(Market::Futures),
            "all" => Ok(Market::All),
            other => bail!("invalid market: {} (must be spot, futures or all)", other),
        }
    }
}

impl Market {
    /// Upstream market codes for the given data kind
    pub fn codes(&self, kind: DataKind) -> Vec<&'static str> {
        let (spot, futures) = match kind {
            DataKind::Trades => ("SPBL", "UMCBL"),
            DataKind::Depth => ("1", "2"),
        };
        match self {
            Market::Spot => vec![spot],
            Market::Futures => vec![futures],
            Market::All => vec![spot, futures],
        }
    }
}

/// The depth code serving the same content under the other market
pub fn depth_sibling_code(code: &str) -> Option<&'static str> {
    match code {
        "1" => Some("2"),
        "2" => Some("1"),
        _ => None,
    }
}

/// Inclusive range of days
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if start > end {
            bail!("invalid date range: start {} is after end {}", start, end);
        }
        Ok(Self { start, end })
    }

    pub fn days(&self) -> impl Iterator<Item = NaiveDate> {
        let end = self.end;
        let mut next = Some(self.start);
        std::iter::from_fn(move || {
            let day = next?;
            next = if day < end { Some(day + Duration::days(1)) } else { None };
            Some(day)
        })
    }

    pub fn contains(&self, day: NaiveDate) -> bool {
        day >= self.start && day <= self.end
    }
}

/// A remote archive instantiated for one market code, pair and day
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CandidateResource {
    pub kind: DataKind,
    pub code: String,
    pub pair: String,
    pub date: NaiveDate,
    /// Trades only: 1..=999 within the day
    pub sequence: Option<u32>,
    /// Expected size from the existence probe; 0 when unknown
    pub size_hint: u64,
}

impl CandidateResource {
    pub fn trades(code: &str, pair: &str, date: NaiveDate, sequence: u32) -> Self {
        Self {
            kind: DataKind::Trades,
            code: code.to_string(),
            pair: pair.to_string(),
            date,
            sequence: Some(sequence),
            size_hint: 0,
        }
    }

    pub fn depth(code: &str, pair: &str, date: NaiveDate) -> Self {
        Self {
            kind: DataKind::Depth,
            code: code.to_string(),
            pair: pair.to_string(),
            date,
            sequence: None,
            size_hint: 0,
        }
    }

    pub fn with_size(mut self, size_hint: u64) -> Self {
        self.size_hint = size_hint;
        self
    }

    /// Path relative to both the origin and the local mirror root
    pub fn relative_path(&self) -> String {
        let day = self.date.format("%Y%m%d");
        match self.kind {
            DataKind::Trades => format!(
                "trades/{}/{}/{}_{:03}.zip",
                self.code,
                self.pair,
                day,
                self.sequence.unwrap_or(1)
            ),
            DataKind::Depth => format!("depth/{}/{}/{}.zip", self.pair, self.code, day),
        }
    }

    pub fn url(&self, base_url: &str) -> String {
        format!("{}/{}", base_url.trim_end_matches('/'), self.relative_path())
    }

    pub fn local_path(&self, output_dir: &Path) -> PathBuf {
        output_dir.join(self.relative_path())
    }

    /// Depth archives are identical under both market codes
    pub fn sibling(&self) -> Option<CandidateResource> {
        if self.kind != DataKind::Depth {
            return None;
        }
        let code = depth_sibling_code(&self.code)?;
        Some(CandidateResource {
            code: code.to_string(),
            ..self.clone()
        })
    }

    /// Stable identifier used in logs and failure reports
    pub fn id(&self) -> String {
        self.relative_path()
    }
}

impl fmt::Display for CandidateResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.relative_path())
    }
}
