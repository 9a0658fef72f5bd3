//! The persisted path → hash index.
//!
//! The index is the source of truth for what is tracked. It lives at the
//! repository root as pretty-printed JSON and is checked into the surrounding
//! version-control repository:
//!
//! ```text
//! {
//!     "version": 1,
//!     "files": {
//!         "data/model.bin": "ec1c09ae76ff5d98...",
//!         ...
//!     }
//! }
//! ```
//!
//! Paths are repository-relative and `/`-separated. Writes go through a
//! temporary file in the same directory and a rename, so a crash leaves
//! either the previous or the new index on disk.

use crate::error::{Error, Result};
use crate::hash::ContentHash;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::Path;

/// Current on-disk format version.
pub const INDEX_VERSION: u32 = 1;

/// File name of the index at the repository root.
pub const INDEX_FILE: &str = ".worm";

/// Mapping of tracked paths to content hashes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Index {
    version: u32,
    files: BTreeMap<String, ContentHash>,
    /// Paths whose anchors were unlocked and await re-ingestion.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    unlocked: BTreeSet<String>,
}

impl Default for Index {
    fn default() -> Self {
        Self {
            version: INDEX_VERSION,
            files: BTreeMap::new(),
            unlocked: BTreeSet::new(),
        }
    }
}

impl Index {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the index from `path`.
    ///
    /// A missing file is an empty index. Anything unparseable (invalid
    /// UTF-8, unknown or missing fields) is `IndexCorrupt`, which callers
    /// treat as fatal before touching any other state.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }

        let content = fs::read(path)?;
        let index: Index = serde_json::from_slice(&content)
            .map_err(|e| Error::index_corrupt(path, e.to_string()))?;

        if index.version != INDEX_VERSION {
            return Err(Error::index_corrupt(
                path,
                format!("unsupported index version {}", index.version),
            ));
        }

        for unlocked in &index.unlocked {
            if !index.files.contains_key(unlocked) {
                return Err(Error::index_corrupt(
                    path,
                    format!("unlocked path {} has no entry", unlocked),
                ));
            }
        }

        Ok(index)
    }

    /// Write the index to `path` atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;

        let mut json = serde_json::to_vec_pretty(self)
            .map_err(|e| Error::index_corrupt(path, e.to_string()))?;
        json.push(b'\n');

        let mut temp_file = tempfile::NamedTempFile::new_in(dir)?;
        temp_file.write_all(&json)?;
        temp_file.flush()?;
        temp_file.persist(path)?;

        tracing::debug!(path = %path.display(), entries = self.files.len(), "saved index");
        Ok(())
    }

    /// Track `path` at `hash`, replacing any previous entry.
    ///
    /// Clears a pending unlock for the path.
    pub fn add(&mut self, path: impl Into<String>, hash: ContentHash) {
        let path = path.into();
        self.unlocked.remove(&path);
        self.files.insert(path, hash);
    }

    /// Stop tracking `path`, returning the hash it had.
    pub fn remove(&mut self, path: &str) -> Option<ContentHash> {
        self.unlocked.remove(path);
        self.files.remove(path)
    }

    /// Move the entry at `old` to `new`, keeping its hash.
    pub fn rename(&mut self, old: &str, new: impl Into<String>) -> Result<ContentHash> {
        let hash = self.files.remove(old).ok_or_else(|| Error::not_tracked(old))?;
        let new = new.into();
        if self.unlocked.remove(old) {
            self.unlocked.insert(new.clone());
        }
        self.files.insert(new, hash);
        Ok(hash)
    }

    /// Track `dst` at the same hash as `src`.
    pub fn copy(&mut self, src: &str, dst: impl Into<String>) -> Result<ContentHash> {
        let hash = self.get(src).ok_or_else(|| Error::not_tracked(src))?;
        self.add(dst, hash);
        Ok(hash)
    }

    /// Hash recorded for `path`.
    pub fn get(&self, path: &str) -> Option<ContentHash> {
        self.files.get(path).copied()
    }

    /// Whether `path` is tracked.
    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    /// All entries in path order.
    pub fn list(&self) -> Vec<(String, ContentHash)> {
        self.files
            .iter()
            .map(|(path, hash)| (path.clone(), *hash))
            .collect()
    }

    /// Iterate over entries in path order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, ContentHash)> {
        self.files.iter().map(|(path, hash)| (path.as_str(), *hash))
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Record that the anchor at `path` was replaced by a private writable copy.
    pub fn mark_unlocked(&mut self, path: &str) -> Result<()> {
        if !self.files.contains_key(path) {
            return Err(Error::not_tracked(path));
        }
        self.unlocked.insert(path.to_string());
        Ok(())
    }

    /// Whether `path` was unlocked and not yet re-added.
    pub fn is_unlocked(&self, path: &str) -> bool {
        self.unlocked.contains(path)
    }

    /// Fold `other` into this index; `other` wins where both track a path.
    pub fn merge(&mut self, other: &Index) {
        for (path, hash) in other.iter() {
            self.add(path, hash);
        }
        for path in &other.unlocked {
            self.unlocked.insert(path.clone());
        }
    }
}
