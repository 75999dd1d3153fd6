//! Archive payload conversion
//!
//! Each archive carries one CSV or XLSX payload. Rows are normalized into
//! [`TradeRecord`] / [`DepthRecord`]; malformed rows are skipped and counted.

use anyhow::{bail, Context, Result};
use calamine::{open_workbook_from_rs, Data, Reader, Xlsx};
use std::fs;
use std::io::{Cursor, Read};
use std::path::Path;
use tracing::debug;
use zip::ZipArchive;

const TRADE_COLUMNS: usize = 6;

#[derive(Debug, Clone, PartialEq)]
pub struct TradeRecord {
    pub trade_id: String,
    /// Milliseconds since the epoch
    pub timestamp: i64,
    pub price: f64,
    /// "buy" or "sell"
    pub side: String,
    pub volume_quote: f64,
    pub size_base: f64,
}

/// Top of book at one instant
#[derive(Debug, Clone, PartialEq)]
pub struct DepthRecord {
    pub timestamp: i64,
    pub ask_price: f64,
    pub bid_price: f64,
    pub ask_volume: f64,
    pub bid_volume: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Converted<T> {
    pub rows: Vec<T>,
    /// Rows dropped because they could not be parsed
    pub skipped: usize,
}

impl<T> Default for Converted<T> {
    fn default() -> Self {
        Self {
            rows: Vec::new(),
            skipped: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Payload {
    Csv(Vec<u8>),
    Xlsx(Vec<u8>),
}

/// First `.csv` entry, otherwise first `.xlsx` entry. `None` for zero-byte placeholders.
fn read_payload(path: &Path) -> Result<Option<Payload>> {
    let data = fs::read(path).context(format!("Failed to read archive: {:?}", path))?;
    if data.is_empty() {
        return Ok(None);
    }

    let mut archive = ZipArchive::new(Cursor::new(data))
        .context(format!("Failed to open archive: {:?}", path))?;

    let names: Vec<String> = (0..archive.len())
        .filter_map(|i| archive.name_for_index(i).map(String::from))
        .collect();
    let pick = |ext: &str| {
        names
            .iter()
            .find(|n| n.to_lowercase().ends_with(ext))
            .cloned()
    };

    let (name, is_csv) = match (pick(".csv"), pick(".xlsx")) {
        (Some(name), _) => (name, true),
        (None, Some(name)) => (name, false),
        (None, None) => bail!("no CSV or XLSX payload in {:?}", path),
    };

    let mut entry = archive
        .by_name(&name)
        .context(format!("Failed to open {} in {:?}", name, path))?;
    let mut buffer = Vec::with_capacity(entry.size() as usize);
    entry
        .read_to_end(&mut buffer)
        .context(format!("Failed to extract {} from {:?}", name, path))?;

    debug!("Extracted {} ({} bytes) from {:?}", name, buffer.len(), path);
    Ok(Some(if is_csv {
        Payload::Csv(buffer)
    } else {
        Payload::Xlsx(buffer)
    }))
}

/// Data rows as trimmed strings, header removed
fn payload_rows(payload: Payload) -> Result<Vec<Vec<String>>> {
    match payload {
        Payload::Csv(bytes) => {
            let mut reader = csv::ReaderBuilder::new()
                .has_headers(true)
                .flexible(true)
                .trim(csv::Trim::All)
                .from_reader(bytes.as_slice());

            let mut rows = Vec::new();
            for record in reader.records() {
                match record {
                    Ok(record) => rows.push(record.iter().map(String::from).collect()),
                    Err(e) => debug!("Skipping unreadable CSV line: {}", e),
                }
            }
            Ok(rows)
        }
        Payload::Xlsx(bytes) => {
            let mut workbook: Xlsx<_> =
                open_workbook_from_rs(Cursor::new(bytes)).context("Failed to open XLSX payload")?;
            let range = workbook
                .worksheet_range_at(0)
                .context("XLSX payload has no sheets")?
                .context("Failed to read first XLSX sheet")?;

            Ok(range
                .rows()
                .skip(1)
                .map(|row| row.iter().map(cell_text).collect())
                .collect())
        }
    }
}

/// Spreadsheet cell as text; floats never use exponent notation
fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.trim().to_string(),
        Data::Float(f) => format!("{}", f),
        Data::Int(i) => i.to_string(),
        other => other.to_string().trim().to_string(),
    }
}

/// "12." becomes "12.0", blank becomes "0.0"
fn normalize_number(value: &str) -> String {
    let value = value.trim();
    if value.is_empty() {
        "0.0".to_string()
    } else if value.ends_with('.') {
        format!("{}0", value)
    } else {
        value.to_string()
    }
}

fn parse_timestamp(value: &str) -> Option<i64> {
    let value = value.trim();
    if let Ok(ts) = value.parse::<i64>() {
        return Some(ts);
    }
    // spreadsheets store integers as floats
    let f: f64 = value.parse().ok()?;
    (f.is_finite() && f.fract() == 0.0).then_some(f as i64)
}

fn parse_number(value: &str) -> Option<f64> {
    normalize_number(value).parse::<f64>().ok().filter(|f| f.is_finite())
}

fn parse_trade(row: &[String]) -> Option<TradeRecord> {
    if row.len() < TRADE_COLUMNS {
        return None;
    }
    let trade_id = row[0].trim();
    if trade_id.is_empty() {
        return None;
    }
    let side = row[3].trim().to_lowercase();
    if side != "buy" && side != "sell" {
        return None;
    }

    Some(TradeRecord {
        trade_id: trade_id.to_string(),
        timestamp: parse_timestamp(&row[1])?,
        price: parse_number(&row[2])?,
        side,
        volume_quote: parse_number(&row[4])?,
        size_base: parse_number(&row[5])?,
    })
}

fn parse_depth(row: &[String]) -> Option<DepthRecord> {
    if row.iter().all(|cell| cell.trim().is_empty()) {
        return None;
    }
    let cell = |i: usize| row.get(i).map(String::as_str).unwrap_or("");

    Some(DepthRecord {
        timestamp: parse_timestamp(cell(0))?,
        ask_price: parse_number(cell(1))?,
        bid_price: parse_number(cell(2))?,
        ask_volume: parse_number(cell(3))?,
        bid_volume: parse_number(cell(4))?,
    })
}

fn convert<T>(path: &Path, parse: fn(&[String]) -> Option<T>) -> Result<Converted<T>> {
    let Some(payload) = read_payload(path)? else {
        return Ok(Converted::default());
    };

    let mut converted = Converted::default();
    for (line, row) in payload_rows(payload)?.into_iter().enumerate() {
        if row.iter().all(|cell| cell.is_empty()) {
            continue;
        }
        match parse(&row) {
            Some(record) => converted.rows.push(record),
            None => {
                debug!("Skipping record in {:?} at line {}: {:?}", path, line + 2, row);
                converted.skipped += 1;
            }
        }
    }
    Ok(converted)
}

pub fn convert_trades(path: &Path) -> Result<Converted<TradeRecord>> {
    convert(path, parse_trade)
}

pub fn convert_depth(path: &Path) -> Result<Converted<DepthRecord>> {
    convert(path, parse_depth)
}
