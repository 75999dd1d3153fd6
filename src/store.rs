//! Embedded tick store (SQLite, WAL mode)
//!
//! One database per (pair, trade code) holding a `trades` table, and one per
//! pair holding a depth table per market code. Inserts ignore rows whose key
//! is already present, so re-importing an archive never duplicates data.

use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection, OpenFlags};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::converter::{DepthRecord, TradeRecord};
use crate::market::{depth_sibling_code, DataKind};

const PRAGMAS_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;
"#;

const TRADES_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS trades (
    trade_id TEXT PRIMARY KEY,
    timestamp INTEGER,
    price REAL,
    side TEXT,
    volume_quote REAL,
    size_base REAL
);
CREATE INDEX IF NOT EXISTS idx_trades_timestamp ON trades(timestamp);
"#;

/// Rows written by one load
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoadStats {
    pub inserted: usize,
    /// Already present (duplicate key)
    pub skipped: usize,
}

impl LoadStats {
    pub fn add(&mut self, other: LoadStats) {
        self.inserted += other.inserted;
        self.skipped += other.skipped;
    }
}

pub struct TickStore {
    conn: Connection,
    path: PathBuf,
    kind: DataKind,
}

/// Depth tables are named after their market code
fn depth_table(code: &str) -> Result<String> {
    if depth_sibling_code(code).is_none() {
        bail!("invalid depth market code: {}", code);
    }
    Ok(format!("\"{}\"", code))
}

impl TickStore {
    fn open(path: &Path, kind: DataKind) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .context(format!("Failed to create directory: {:?}", parent))?;
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
        let conn = Connection::open_with_flags(path, flags)
            .with_context(|| format!("Failed to open database at {:?}", path))?;
        conn.execute_batch(PRAGMAS_SQL)
            .context("Failed to configure database")?;

        Ok(Self {
            conn,
            path: path.to_path_buf(),
            kind,
        })
    }

    pub fn open_trades(path: &Path) -> Result<Self> {
        let store = Self::open(path, DataKind::Trades)?;
        store
            .conn
            .execute_batch(TRADES_SCHEMA_SQL)
            .context("Failed to create trades schema")?;
        Ok(store)
    }

    /// Open a depth database, creating the tables for `codes` if missing
    pub fn open_depth(path: &Path, codes: &[&str]) -> Result<Self> {
        let store = Self::open(path, DataKind::Depth)?;
        for code in codes {
            store.create_depth_table(code)?;
        }
        Ok(store)
    }

    fn create_depth_table(&self, code: &str) -> Result<()> {
        let table = depth_table(code)?;
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                timestamp INTEGER PRIMARY KEY,
                ask_price REAL,
                bid_price REAL,
                ask_volume REAL,
                bid_volume REAL
            );",
            table = table
        );
        self.conn
            .execute_batch(&sql)
            .context(format!("Failed to create depth table {}", table))?;
        Ok(())
    }

    /// Drop and recreate the depth tables; the next load rebuilds them from every local archive
    pub fn reset_depth_tables(&self, codes: &[&str]) -> Result<()> {
        for code in codes {
            let table = depth_table(code)?;
            self.conn
                .execute_batch(&format!("DROP TABLE IF EXISTS {};", table))
                .context(format!("Failed to drop depth table {}", table))?;
            self.create_depth_table(code)?;
            debug!("Reset depth table {} in {:?}", table, self.path);
        }
        Ok(())
    }

    /// Insert one archive's trades in a single transaction
    pub fn insert_trades(&mut self, rows: &[TradeRecord]) -> Result<LoadStats> {
        if self.kind != DataKind::Trades {
            bail!("{:?} is not a trades database", self.path);
        }

        let mut stats = LoadStats::default();
        let tx = self.conn.transaction().context("Failed to start transaction")?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO trades (trade_id, timestamp, price, side, volume_quote, size_base)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for row in rows {
                let changed = stmt.execute(params![
                    row.trade_id,
                    row.timestamp,
                    row.price,
                    row.side,
                    row.volume_quote,
                    row.size_base
                ])?;
                if changed > 0 {
                    stats.inserted += 1;
                } else {
                    stats.skipped += 1;
                }
            }
        }
        tx.commit().context("Failed to commit trades")?;
        Ok(stats)
    }

    /// Insert one archive's depth rows into the table of `code` in a single transaction
    pub fn insert_depth(&mut self, code: &str, rows: &[DepthRecord]) -> Result<LoadStats> {
        if self.kind != DataKind::Depth {
            bail!("{:?} is not a depth database", self.path);
        }
        let table = depth_table(code)?;

        let mut stats = LoadStats::default();
        let tx = self.conn.transaction().context("Failed to start transaction")?;
        {
            let mut stmt = tx.prepare_cached(&format!(
                "INSERT OR IGNORE INTO {} (timestamp, ask_price, bid_price, ask_volume, bid_volume)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                table
            ))?;
            for row in rows {
                let changed = stmt.execute(params![
                    row.timestamp,
                    row.ask_price,
                    row.bid_price,
                    row.ask_volume,
                    row.bid_volume
                ])?;
                if changed > 0 {
                    stats.inserted += 1;
                } else {
                    stats.skipped += 1;
                }
            }
        }
        tx.commit().context("Failed to commit depth rows")?;
        Ok(stats)
    }

    /// Flush the write-ahead log into the main file and truncate it
    pub fn checkpoint(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")
            .context(format!("Failed to checkpoint {:?}", self.path))
    }

    pub fn row_count(&self, table: &str) -> Result<i64> {
        let table = match self.kind {
            DataKind::Trades => "trades".to_string(),
            DataKind::Depth => depth_table(table)?,
        };
        let count = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))?;
        Ok(count)
    }

    /// Checkpoint and close; the file is complete once this returns
    pub fn close(self) -> Result<()> {
        self.checkpoint()?;
        let path = self.path.clone();
        self.conn
            .close()
            .map_err(|(_, e)| e)
            .context(format!("Failed to close database {:?}", path))
    }
}

/// Fold a leftover write-ahead log back into `path` so the file can be copied on its own
pub fn checkpoint_file(path: &Path) -> Result<()> {
    let mut wal = path.as_os_str().to_owned();
    wal.push("-wal");
    if !Path::new(&wal).exists() {
        return Ok(());
    }

    let conn = Connection::open(path)
        .with_context(|| format!("Failed to open database at {:?}", path))?;
    conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")
        .context(format!("Failed to checkpoint {:?}", path))?;
    conn.close()
        .map_err(|(_, e)| e)
        .context(format!("Failed to close database {:?}", path))
}
