//! Working-tree anchors.
//!
//! An anchor is the entry at a tracked path that stands in for the stored
//! object: a hard link, a symbolic link, or (copy mode) a read-only private
//! copy. Anchors are always replaced by building the new entry under a
//! temporary sibling name and renaming it into place.

use crate::error::{Error, Result};
use crate::exclude::ExcludeFile;
use crate::hash::ContentHash;
use crate::store::{self, ContentStore, LinkMode};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Creates, inspects and removes anchors under one working directory.
#[derive(Debug, Clone)]
pub struct Anchors {
    work_dir: PathBuf,
    store: ContentStore,
    mode: LinkMode,
    exclude: Option<ExcludeFile>,
}

impl Anchors {
    pub fn new(
        work_dir: impl Into<PathBuf>,
        store: ContentStore,
        mode: LinkMode,
        exclude: Option<ExcludeFile>,
    ) -> Self {
        Self {
            work_dir: work_dir.into(),
            store,
            mode,
            exclude,
        }
    }

    pub fn mode(&self) -> LinkMode {
        self.mode
    }

    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    /// Absolute path of the working entry for a repository-relative path.
    pub fn entry_path(&self, rel_path: &str) -> PathBuf {
        self.work_dir.join(rel_path)
    }

    /// Link the entry at `rel_path` to the object `hash`.
    ///
    /// Whatever was at the path is replaced. An entry that already is the
    /// stored object is left alone. The path is registered in the exclusion
    /// file.
    pub fn link(&self, rel_path: &str, hash: &ContentHash) -> Result<()> {
        let dest = self.entry_path(rel_path);

        let already_linked = match self.mode {
            LinkMode::Copy => self.is_copy_anchor(&dest, hash)?,
            _ => self.is_same_file(&dest, hash),
        };

        if !already_linked {
            self.store.materialize(hash, &dest, self.mode)?;
        }

        if let Some(exclude) = &self.exclude {
            exclude.ensure(rel_path)?;
        }
        Ok(())
    }

    /// Replace the anchor at `rel_path` with a private writable copy.
    pub fn unlock(&self, rel_path: &str, hash: &ContentHash) -> Result<()> {
        let dest = self.entry_path(rel_path);
        let parent = dest.parent().unwrap_or(&self.work_dir);

        let mut source = match fs::File::open(&dest) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => self.store.open_object(hash)?,
            Err(e) => return Err(e.into()),
        };
        let was_copy_anchor = self.mode == LinkMode::Copy && self.is_copy_anchor(&dest, hash)?;

        let mut temp_file = tempfile::Builder::new()
            .prefix(".worm-")
            .tempfile_in(parent)?;
        io::copy(&mut source, &mut temp_file)?;
        temp_file.flush()?;
        let staged = temp_file.into_temp_path();
        store::set_writable(&staged)?;
        staged.persist(&dest)?;

        if was_copy_anchor {
            self.store.release(hash)?;
        }

        tracing::debug!(path = rel_path, %hash, "unlocked anchor");
        Ok(())
    }

    /// Whether the entry at `rel_path` holds the content `hash`.
    ///
    /// An entry that is the stored object itself answers without reading
    /// any bytes; anything else is rehashed.
    pub fn is_anchored(&self, rel_path: &str, hash: &ContentHash) -> bool {
        let path = self.entry_path(rel_path);
        if !path.is_file() {
            return false;
        }
        if self.is_same_file(&path, hash) {
            return true;
        }
        matches!(ContentHash::hash_file(&path), Ok(actual) if actual == *hash)
    }

    /// Put the object `hash` back into the store from the anchor at `rel_path`.
    ///
    /// For a cache that lost an object the working tree still holds. A
    /// hard-link anchor is linked back in; a copy anchor is copied so it stays
    /// a private file.
    pub fn restore_object(&self, rel_path: &str, hash: &ContentHash) -> Result<()> {
        let path = self.entry_path(rel_path);
        let restored = match self.mode {
            LinkMode::Copy => self.store.ingest_copy(&path)?,
            _ => self.store.ingest(&path)?,
        };
        if restored != *hash {
            return Err(Error::hash_mismatch(hash.to_hex(), restored.to_hex()));
        }

        tracing::debug!(path = rel_path, %hash, "restored object from working tree");
        Ok(())
    }

    /// Whether something exists at `rel_path` (including a dangling symlink).
    pub fn entry_exists(&self, rel_path: &str) -> bool {
        fs::symlink_metadata(self.entry_path(rel_path)).is_ok()
    }

    /// Move the entry at `src` to `dst`, keeping whatever link it has.
    ///
    /// Symbolic links point at absolute object paths, so a rename keeps
    /// them valid.
    pub fn rename(&self, src: &str, dst: &str) -> Result<()> {
        let from = self.entry_path(src);
        let to = self.entry_path(dst);
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&from, &to)?;

        if let Some(exclude) = &self.exclude {
            exclude.ensure(dst)?;
            exclude.remove(src)?;
        }
        Ok(())
    }

    /// Stop excluding `rel_path` from version control.
    pub fn unregister(&self, rel_path: &str) -> Result<()> {
        if let Some(exclude) = &self.exclude {
            exclude.remove(rel_path)?;
        }
        Ok(())
    }

    /// Delete the working entry at `rel_path`. A missing entry is not an error.
    ///
    /// `held` is the hash the entry anchors, if it is a live anchor; in copy
    /// mode its reference is released.
    pub fn remove(&self, rel_path: &str, held: Option<&ContentHash>) -> Result<()> {
        let path = self.entry_path(rel_path);
        let is_copy_anchor = match held {
            Some(hash) if self.mode == LinkMode::Copy => self.is_copy_anchor(&path, hash)?,
            _ => false,
        };

        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        if let (true, Some(hash)) = (is_copy_anchor, held) {
            self.store.release(hash)?;
        }

        tracing::debug!(path = rel_path, "removed anchor");
        Ok(())
    }

    /// Check that the entry at `rel_path` is not a modified working file.
    ///
    /// Fails with `DirtyFile` when something exists at the path but does not
    /// hold `hash`.
    pub fn ensure_not_dirty(&self, rel_path: &str, hash: &ContentHash) -> Result<()> {
        let path = self.entry_path(rel_path);
        match fs::symlink_metadata(&path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
            // Dangling symlink left behind by a cleared cache
            Ok(meta) if meta.file_type().is_symlink() && !path.exists() => Ok(()),
            Ok(_) if self.is_anchored(rel_path, hash) => Ok(()),
            Ok(_) => Err(Error::dirty_file(path)),
        }
    }

    /// A copy-mode anchor: read-only regular file with the right content.
    fn is_copy_anchor(&self, path: &Path, hash: &ContentHash) -> Result<bool> {
        let meta = match fs::symlink_metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if !meta.is_file() || !meta.permissions().readonly() || self.is_same_file(path, hash) {
            return Ok(false);
        }
        Ok(ContentHash::hash_file(path)? == *hash)
    }

    /// Whether `path` resolves to the stored object file itself.
    #[cfg(unix)]
    fn is_same_file(&self, path: &Path, hash: &ContentHash) -> bool {
        use std::os::unix::fs::MetadataExt;
        match (
            fs::metadata(path),
            fs::metadata(self.store.object_path(hash)),
        ) {
            (Ok(entry), Ok(object)) => entry.dev() == object.dev() && entry.ino() == object.ino(),
            _ => false,
        }
    }

    #[cfg(not(unix))]
    fn is_same_file(&self, path: &Path, hash: &ContentHash) -> bool {
        match (
            fs::canonicalize(path),
            fs::canonicalize(self.store.object_path(hash)),
        ) {
            (Ok(entry), Ok(object)) => entry == object,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup(mode: LinkMode) -> (TempDir, Anchors) {
        let temp_dir = TempDir::new().unwrap();
        let work_dir = temp_dir.path().join("work");
        fs::create_dir_all(work_dir.join(".git/info")).unwrap();
        let store = ContentStore::open(temp_dir.path().join("cache")).unwrap();
        let exclude = ExcludeFile::new(work_dir.join(".git/info/exclude"));
        let anchors = Anchors::new(&work_dir, store, mode, Some(exclude));
        (temp_dir, anchors)
    }

    fn stored(anchors: &Anchors, data: &[u8]) -> ContentHash {
        let hash = ContentHash::hash_bytes(data);
        anchors.store().ingest_reader(data, &hash).unwrap();
        hash
    }

    fn is_read_only(path: &Path) -> bool {
        fs::metadata(path).unwrap().permissions().readonly()
    }

    #[test]
    fn test_link_read_only_and_excluded() {
        let (_temp_dir, anchors) = setup(LinkMode::Hardlink);
        let hash = stored(&anchors, b"WORM123");

        anchors.link("data/foo", &hash).unwrap();
        let path = anchors.entry_path("data/foo");
        assert_eq!(fs::read(&path).unwrap(), b"WORM123");
        assert!(is_read_only(&path));
        assert!(anchors.is_anchored("data/foo", &hash));

        let exclude = anchors.exclude.as_ref().unwrap();
        assert!(exclude.contains("data/foo").unwrap());
    }

    #[test]
    fn test_link_missing_object() {
        let (_temp_dir, anchors) = setup(LinkMode::Hardlink);
        let hash = ContentHash::hash_bytes(b"never stored");
        assert!(matches!(
            anchors.link("foo", &hash),
            Err(Error::MissingObject { .. })
        ));
        assert!(!anchors.entry_exists("foo"));
    }

    #[test]
    fn test_unlock_gives_private_writable_copy() {
        for mode in [LinkMode::Hardlink, LinkMode::Symlink, LinkMode::Copy] {
            let (_temp_dir, anchors) = setup(mode);
            let hash = stored(&anchors, b"locked bytes");
            anchors.link("f", &hash).unwrap();

            anchors.unlock("f", &hash).unwrap();
            let path = anchors.entry_path("f");
            let meta = fs::symlink_metadata(&path).unwrap();
            assert!(meta.is_file(), "{} unlock should produce a regular file", mode);
            assert!(!meta.permissions().readonly());

            // Writing to the unlocked file leaves the object intact
            fs::write(&path, b"edited").unwrap();
            assert_eq!(
                fs::read(anchors.store().object_path(&hash)).unwrap(),
                b"locked bytes"
            );
            assert_eq!(anchors.store().ref_count(&hash).unwrap(), 0);
        }
    }

    #[test]
    fn test_is_anchored_detects_divergence() {
        let (_temp_dir, anchors) = setup(LinkMode::Hardlink);
        let hash = stored(&anchors, b"original");

        fs::write(anchors.entry_path("f"), b"something else").unwrap();
        assert!(!anchors.is_anchored("f", &hash));
        assert!(matches!(
            anchors.ensure_not_dirty("f", &hash),
            Err(Error::DirtyFile { .. })
        ));

        // Same bytes but an independent file still count as anchored content
        fs::write(anchors.entry_path("g"), b"original").unwrap();
        assert!(anchors.is_anchored("g", &hash));
        assert!(anchors.ensure_not_dirty("missing", &hash).is_ok());
    }

    #[test]
    fn test_remove_releases_copy_reference() {
        let (_temp_dir, anchors) = setup(LinkMode::Copy);
        let hash = stored(&anchors, b"copied");

        anchors.link("a", &hash).unwrap();
        anchors.link("a", &hash).unwrap();
        assert_eq!(anchors.store().ref_count(&hash).unwrap(), 1);

        anchors.remove("a", Some(&hash)).unwrap();
        assert!(!anchors.entry_exists("a"));
        assert_eq!(anchors.store().ref_count(&hash).unwrap(), 0);

        // Removing again is fine
        anchors.remove("a", Some(&hash)).unwrap();
    }

    #[test]
    fn test_rename_keeps_link() {
        let (_temp_dir, anchors) = setup(LinkMode::Symlink);
        let hash = stored(&anchors, b"moving");
        anchors.link("old", &hash).unwrap();

        anchors.rename("old", "sub/new").unwrap();
        assert!(!anchors.entry_exists("old"));
        assert!(anchors.is_anchored("sub/new", &hash));

        let exclude = anchors.exclude.as_ref().unwrap();
        assert!(!exclude.contains("old").unwrap());
        assert!(exclude.contains("sub/new").unwrap());
    }

    #[test]
    fn test_restore_object_after_cache_loss() {
        for mode in [LinkMode::Hardlink, LinkMode::Copy] {
            let (_temp_dir, anchors) = setup(mode);
            let hash = stored(&anchors, b"keep me");
            anchors.link("f", &hash).unwrap();

            fs::remove_dir_all(anchors.store().root().join("objects")).unwrap();
            assert!(!anchors.store().exists(&hash));
            assert!(anchors.is_anchored("f", &hash));

            anchors.restore_object("f", &hash).unwrap();
            assert!(anchors.store().exists(&hash), "{} restore", mode);
            assert!(anchors.is_anchored("f", &hash));
        }
    }
}
