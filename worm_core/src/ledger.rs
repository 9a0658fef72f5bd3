//! Local record of objects the depot has confirmed.
//!
//! The ledger is an append-only text file, one confirmed object per line:
//!
//! ```text
//! <unix seconds>|<hex hash>|<size>
//! ```
//!
//! Push consults it to skip objects already confirmed by an earlier run, and
//! status treats a hit as depot presence without a network round trip.
//! Lines that fail to parse are ignored on load.

use crate::error::{Error, Result};
use crate::hash::ContentHash;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// One confirmed object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    /// Unix timestamp of the confirmation.
    pub timestamp: i64,
    pub hash: ContentHash,
    pub size: u64,
}

impl LedgerEntry {
    pub fn new(hash: ContentHash, size: u64) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Self {
            timestamp,
            hash,
            size,
        }
    }

    /// Serialize the entry to a pipe-delimited line.
    pub fn to_line(&self) -> String {
        format!("{}|{}|{}", self.timestamp, self.hash, self.size)
    }

    /// Parse an entry from a pipe-delimited line.
    pub fn from_line(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.split('|').collect();
        if parts.len() != 3 {
            return Err(malformed(format!(
                "Invalid ledger entry: expected 3 fields, got {}",
                parts.len()
            )));
        }

        let timestamp = parts[0]
            .parse::<i64>()
            .map_err(|_| malformed(format!("Invalid timestamp in ledger entry: {}", parts[0])))?;
        let hash = ContentHash::from_hex(parts[1])?;
        let size = parts[2]
            .parse::<u64>()
            .map_err(|_| malformed(format!("Invalid size in ledger entry: {}", parts[2])))?;

        Ok(Self {
            timestamp,
            hash,
            size,
        })
    }
}

fn malformed(reason: String) -> Error {
    io::Error::new(io::ErrorKind::InvalidData, reason).into()
}

/// Confirmed-object ledger for one depot.
#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    confirmed: Mutex<HashMap<ContentHash, u64>>,
}

impl Ledger {
    /// Open the ledger at `path`, loading existing entries.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut confirmed = HashMap::new();
        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            for line in reader.lines() {
                let line = line?;
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match LedgerEntry::from_line(line) {
                    Ok(entry) => {
                        confirmed.insert(entry.hash, entry.size);
                    }
                    Err(e) => tracing::warn!(ledger = %path.display(), error = %e, "skipping ledger line"),
                }
            }
        }

        Ok(Self {
            path,
            confirmed: Mutex::new(confirmed),
        })
    }

    /// Ledger file name for the depot identified by `depot_id`.
    ///
    /// Caches are shared between repositories that may use different depots,
    /// so each depot gets its own ledger.
    pub fn file_name(depot_id: &str) -> String {
        format!("{}.ledger", ContentHash::hash_bytes(depot_id.as_bytes()).short())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the depot has confirmed `hash`.
    pub fn contains(&self, hash: &ContentHash) -> bool {
        self.confirmed
            .lock()
            .map(|confirmed| confirmed.contains_key(hash))
            .unwrap_or(false)
    }

    /// Record `hash` as confirmed. Recording a known hash is a no-op.
    pub fn record(&self, hash: &ContentHash, size: u64) -> Result<()> {
        let mut confirmed = self
            .confirmed
            .lock()
            .map_err(|_| std::io::Error::other("ledger lock poisoned"))?;
        if confirmed.contains_key(hash) {
            return Ok(());
        }

        let entry = LedgerEntry::new(*hash, size);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", entry.to_line())?;
        file.flush()?;

        confirmed.insert(*hash, size);
        tracing::debug!(%hash, size, "recorded depot confirmation");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.confirmed.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
