use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::models::TradeRecord;
use crate::Result;

/// Append-only JSON-lines ledger of completed trades
///
/// One record per closed position, fsynced on append so a close is never
/// considered final before it is durable. `load` rebuilds performance
/// accounting after a restart.
pub struct TradeLedger {
    path: PathBuf,
}

impl TradeLedger {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Durably append one record. Returns only after the bytes are synced
    /// to disk.
    pub fn append(&self, record: &TradeRecord) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        file.write_all(line.as_bytes())?;
        file.sync_all()?;
        tracing::debug!(
            symbol = %record.symbol,
            pnl = %record.pnl,
            "Trade record persisted"
        );
        Ok(())
    }

    /// All records, oldest first. A missing file is an empty ledger.
    pub fn load(&self) -> Result<Vec<TradeRecord>> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }
        Ok(records)
    }
}
