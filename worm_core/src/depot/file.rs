//! Directory-backed depot.
//!
//! Layout under the depot root mirrors the object key:
//!
//! ```text
//! <root>/objects/<hex>
//! <root>/tmp/            in-flight uploads
//! ```

use super::{Depot, DepotError, DepotResult, object_key};
use crate::error::Result;
use crate::hash::ContentHash;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

/// A depot stored in a local or mounted directory.
#[derive(Debug, Clone)]
pub struct FileDepot {
    root: PathBuf,
}

impl FileDepot {
    /// Open (creating if needed) the depot at `root`.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("objects"))?;
        fs::create_dir_all(root.join("tmp"))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Filesystem path of the object stored for `hash`.
    pub fn object_path(&self, hash: &ContentHash) -> PathBuf {
        self.root.join(object_key(hash))
    }
}

fn unavailable(err: io::Error) -> DepotError {
    DepotError::unavailable(err.to_string())
}

impl Depot for FileDepot {
    fn probe(&self, hash: &ContentHash) -> DepotResult<bool> {
        match fs::metadata(self.object_path(hash)) {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(unavailable(e)),
        }
    }

    fn fetch(&self, hash: &ContentHash) -> DepotResult<Box<dyn Read + Send>> {
        match fs::File::open(self.object_path(hash)) {
            Ok(file) => Ok(Box::new(io::BufReader::new(file))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(DepotError::not_found(hash)),
            Err(e) => Err(unavailable(e)),
        }
    }

    fn store(&self, hash: &ContentHash, mut reader: Box<dyn Read + Send>, len: u64) -> DepotResult<()> {
        let dest = self.object_path(hash);
        if dest.is_file() {
            return Ok(());
        }

        let mut temp_file =
            tempfile::NamedTempFile::new_in(self.root.join("tmp")).map_err(unavailable)?;
        let written = io::copy(&mut reader, &mut temp_file).map_err(unavailable)?;
        temp_file.flush().map_err(unavailable)?;

        if written != len {
            return Err(DepotError::unavailable(format!(
                "short upload: expected {} bytes, got {}",
                len, written
            )));
        }

        temp_file.persist(&dest).map_err(|e| unavailable(e.error))?;
        tracing::debug!(%hash, depot = %self.root.display(), "stored object");
        Ok(())
    }

    fn describe(&self) -> String {
        format!("file://{}", self.root.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_store_probe_fetch() {
        let temp_dir = TempDir::new().unwrap();
        let depot = FileDepot::open(temp_dir.path().join("depot")).unwrap();
        let hash = ContentHash::hash_bytes(b"WORM123");

        assert!(!depot.probe(&hash).unwrap());
        depot.store(&hash, Box::new(&b"WORM123"[..]), 7).unwrap();
        assert!(depot.probe(&hash).unwrap());
        assert!(
            temp_dir
                .path()
                .join("depot/objects")
                .join(hash.to_hex())
                .is_file()
        );

        let mut fetched = Vec::new();
        depot.fetch(&hash).unwrap().read_to_end(&mut fetched).unwrap();
        assert_eq!(fetched, b"WORM123");

        // Idempotent
        depot.store(&hash, Box::new(&b"WORM123"[..]), 7).unwrap();
    }

    #[test]
    fn test_fetch_missing_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let depot = FileDepot::open(temp_dir.path()).unwrap();
        let hash = ContentHash::hash_bytes(b"absent");
        assert!(matches!(depot.fetch(&hash), Err(DepotError::NotFound { .. })));
    }

    #[test]
    fn test_short_upload_leaves_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let depot = FileDepot::open(temp_dir.path()).unwrap();
        let hash = ContentHash::hash_bytes(b"complete");

        assert!(depot.store(&hash, Box::new(&b"comp"[..]), 8).is_err());
        assert!(!depot.probe(&hash).unwrap());
        assert_eq!(fs::read_dir(temp_dir.path().join("tmp")).unwrap().count(), 0);
    }
}
