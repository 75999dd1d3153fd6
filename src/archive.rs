//! Archive validation and local archive discovery

use anyhow::{Context, Result};
use chrono::NaiveDate;
use std::fs;
use std::io::{self, Cursor, Read, Seek};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;
use zip::ZipArchive;

use crate::market::{CandidateResource, DataKind, DateRange};

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive is empty")]
    Empty,

    #[error("archive has no entries")]
    NoEntries,

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Every entry must open and decompress cleanly
fn check_entries<R: Read + Seek>(reader: R) -> Result<usize, ArchiveError> {
    let mut archive = ZipArchive::new(reader)?;
    if archive.is_empty() {
        return Err(ArchiveError::NoEntries);
    }
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        io::copy(&mut entry, &mut io::sink())?;
    }
    Ok(archive.len())
}

/// Validate a freshly downloaded body
pub fn validate_bytes(data: &[u8]) -> Result<usize, ArchiveError> {
    if data.is_empty() {
        return Err(ArchiveError::Empty);
    }
    check_entries(Cursor::new(data))
}

/// Validate an archive on disk. Zero-byte files are absence placeholders and pass.
pub fn validate_file(path: &Path) -> Result<usize, ArchiveError> {
    let file = fs::File::open(path)?;
    if file.metadata()?.len() == 0 {
        return Ok(0);
    }
    check_entries(io::BufReader::new(file))
}

/// Directory holding the archives of one (kind, pair, code)
pub fn archive_dir(root: &Path, kind: DataKind, pair: &str, code: &str) -> PathBuf {
    match kind {
        DataKind::Trades => root.join("trades").join(code).join(pair),
        DataKind::Depth => root.join("depth").join(pair).join(code),
    }
}

/// Parse `YYYYMMDD_NNN.zip` (trades) or `YYYYMMDD.zip` (depth)
fn parse_file_name(kind: DataKind, name: &str) -> Option<(NaiveDate, Option<u32>)> {
    let stem = name.strip_suffix(".zip")?;
    match kind {
        DataKind::Trades => {
            let (day, number) = stem.split_once('_')?;
            let date = NaiveDate::parse_from_str(day, "%Y%m%d").ok()?;
            let number: u32 = number.parse().ok()?;
            Some((date, Some(number)))
        }
        DataKind::Depth => {
            let date = NaiveDate::parse_from_str(stem, "%Y%m%d").ok()?;
            Some((date, None))
        }
    }
}

/// Archives already mirrored for one (kind, pair, code), optionally limited to a date range.
///
/// Size hints are the local file lengths. Sorted by day and sequence number.
pub fn discover_local(
    root: &Path,
    kind: DataKind,
    pair: &str,
    code: &str,
    range: Option<&DateRange>,
) -> Result<Vec<CandidateResource>> {
    let dir = archive_dir(root, kind, pair, code);
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut resources = Vec::new();
    for entry in WalkDir::new(&dir).min_depth(1).max_depth(1).follow_links(false) {
        let entry = entry.context(format!("Failed to read directory entry in {:?}", dir))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        let Some((date, sequence)) = parse_file_name(kind, name) else {
            debug!("Ignoring unexpected file {:?}", entry.path());
            continue;
        };
        if range.is_some_and(|r| !r.contains(date)) {
            continue;
        }

        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        let resource = match (kind, sequence) {
            (DataKind::Trades, Some(number)) => CandidateResource::trades(code, pair, date, number),
            _ => CandidateResource::depth(code, pair, date),
        };
        resources.push(resource.with_size(size));
    }

    resources.sort_by_key(|r| (r.date, r.sequence));
    Ok(resources)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecheckReport {
    pub checked: usize,
    pub removed: usize,
}

/// Validate every non-empty local archive and delete the corrupt ones so they are fetched again
pub fn recheck(paths: &[PathBuf]) -> RecheckReport {
    let mut report = RecheckReport::default();
    for path in paths {
        match fs::metadata(path) {
            Ok(meta) if meta.is_file() && meta.len() > 0 => {}
            _ => continue,
        }

        report.checked += 1;
        if let Err(e) = validate_file(path) {
            warn!("Corrupted archive {:?}: {}, removing", path, e);
            match fs::remove_file(path) {
                Ok(()) => report.removed += 1,
                Err(e) => warn!("Failed to remove {:?}: {}", path, e),
            }
        }
    }

    info!(
        "Rechecked {} local archives, removed {} corrupted",
        report.checked, report.removed
    );
    report
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::io::{Cursor, Write};
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    /// Zip holding a single file
    pub fn zip_with(name: &str, content: &[u8]) -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        writer.start_file(name, SimpleFileOptions::default()).unwrap();
        writer.write_all(content).unwrap();
        writer.finish().unwrap().into_inner()
    }
}
