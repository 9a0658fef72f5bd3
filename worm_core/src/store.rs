//! The local content store.
//!
//! Objects live under the cache directory, sharded by the first two bytes of
//! their hash so no directory grows past 256 entries per level:
//!
//! ```text
//! <cache>/
//!   objects/ab/cd/abcd1234...   immutable, read-only object bytes
//!   tmp/                        staging area for ingestion and downloads
//!   refs/abcd1234...            explicit refcounts (copy link mode only)
//! ```
//!
//! Every object is written under `tmp/` first and renamed into place, so an
//! object path either does not exist or holds complete, verified bytes.

use crate::error::{Error, Result};
use crate::hash::{ContentHash, HashingWriter};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

const OBJECTS_DIR: &str = "objects";
const TMP_DIR: &str = "tmp";
const REFS_DIR: &str = "refs";

/// How working-tree entries are linked to stored objects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkMode {
    /// Hard link to the object; the link count is the reference count.
    #[default]
    Hardlink,
    /// Symbolic link to the object path.
    Symlink,
    /// Read-only private copy plus an explicit refcount file.
    ///
    /// Degraded mode for filesystems without hard links: objects are
    /// duplicated on disk and sharing is tracked in `refs/`.
    Copy,
}

impl LinkMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkMode::Hardlink => "hardlink",
            LinkMode::Symlink => "symlink",
            LinkMode::Copy => "copy",
        }
    }
}

impl fmt::Display for LinkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LinkMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "hardlink" => Ok(LinkMode::Hardlink),
            "symlink" => Ok(LinkMode::Symlink),
            "copy" => Ok(LinkMode::Copy),
            _ => Err(Error::invalid_config(format!("unknown link mode: {}", s))),
        }
    }
}

/// An object whose bytes no longer hash to its name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CorruptObject {
    pub path: PathBuf,
    pub expected: ContentHash,
    pub actual: ContentHash,
}

/// A content-addressed store of immutable objects.
#[derive(Debug, Clone)]
pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    /// Open the store rooted at `root`, creating its directories if needed.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join(OBJECTS_DIR))?;
        fs::create_dir_all(root.join(TMP_DIR))?;
        Ok(Self { root })
    }

    /// Get the root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get the path to an object file given its hash.
    ///
    /// Returns: `objects/{ab}/{cd}/{full hex}`
    pub fn object_path(&self, hash: &ContentHash) -> PathBuf {
        let (first, second) = hash.shards();
        self.root
            .join(OBJECTS_DIR)
            .join(first)
            .join(second)
            .join(hash.to_hex())
    }

    fn tmp_dir(&self) -> PathBuf {
        self.root.join(TMP_DIR)
    }

    /// Whether an object for `hash` is present.
    pub fn exists(&self, hash: &ContentHash) -> bool {
        self.object_path(hash).is_file()
    }

    /// Open a stored object for reading.
    pub fn open_object(&self, hash: &ContentHash) -> Result<fs::File> {
        match fs::File::open(self.object_path(hash)) {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(Error::missing_object(hash.to_hex()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Size in bytes of a stored object.
    pub fn object_size(&self, hash: &ContentHash) -> Result<u64> {
        Ok(self.open_object(hash)?.metadata()?.len())
    }

    /// Ingest the file at `source`, returning its hash.
    ///
    /// The source is hard-linked into the staging area (copied when the
    /// store is on another filesystem or linking is not permitted), made
    /// read-only, and then hashed, so the name always matches the bytes that
    /// were staged. A symbolic link is never linked into the store; the
    /// bytes it resolves to are copied instead. Ingesting bytes that are
    /// already stored leaves the store unchanged.
    pub fn ingest(&self, source: &Path) -> Result<ContentHash> {
        let is_symlink = fs::symlink_metadata(source)?.file_type().is_symlink();

        let (staged, hash) = if is_symlink {
            tracing::debug!(source = %source.display(), "copying symlink target into cache");
            self.stage_copy(source)?
        } else {
            match tempfile::Builder::new()
                .prefix("ingest-")
                .make_in(self.tmp_dir(), |path| fs::hard_link(source, path))
            {
                Ok(staged) => {
                    let staged = staged.into_temp_path();
                    // Shared inode: no new writers once the bits are cleared
                    set_read_only(&staged)?;
                    let hash = ContentHash::hash_file(&staged)?;
                    (staged, hash)
                }
                Err(e) if link_fallback_allowed(&e) => {
                    tracing::debug!(
                        source = %source.display(),
                        error = %e,
                        "hard link into cache refused, copying"
                    );
                    self.stage_copy(source)?
                }
                Err(e) => return Err(e.into()),
            }
        };

        if self.exists(&hash) {
            tracing::debug!(%hash, source = %source.display(), "object already stored");
            return Ok(hash);
        }

        set_read_only(&staged)?;
        self.commit(staged, &hash)?;

        tracing::debug!(%hash, source = %source.display(), "ingested object");
        Ok(hash)
    }

    /// Copy `source` into the staging area, hashing the bytes as they are written.
    fn stage_copy(&self, source: &Path) -> Result<(tempfile::TempPath, ContentHash)> {
        let temp_file = tempfile::Builder::new()
            .prefix("ingest-")
            .tempfile_in(self.tmp_dir())?;
        let mut writer = HashingWriter::new(temp_file);
        io::copy(&mut fs::File::open(source)?, &mut writer)?;
        let (mut temp_file, hash, _) = writer.finish();
        temp_file.flush()?;
        Ok((temp_file.into_temp_path(), hash))
    }

    /// Ingest `source` by copying its bytes, never sharing its inode.
    ///
    /// Used where the source must stay an independent file (copy link mode).
    pub fn ingest_copy(&self, source: &Path) -> Result<ContentHash> {
        let (staged, hash) = self.stage_copy(source)?;
        if !self.exists(&hash) {
            set_read_only(&staged)?;
            self.commit(staged, &hash)?;
            tracing::debug!(%hash, source = %source.display(), "ingested object by copy");
        }
        Ok(hash)
    }

    /// Stream `reader` into the store, verifying it hashes to `expected`.
    ///
    /// On mismatch the partial object is discarded and `HashMismatch` is
    /// returned; nothing becomes visible under `objects/`. Returns the
    /// number of bytes stored.
    pub fn ingest_reader<R: Read>(&self, mut reader: R, expected: &ContentHash) -> Result<u64> {
        let temp_file = tempfile::Builder::new()
            .prefix("fetch-")
            .tempfile_in(self.tmp_dir())?;
        let mut writer = HashingWriter::new(temp_file);
        io::copy(&mut reader, &mut writer)?;
        let (mut temp_file, actual, len) = writer.finish();
        temp_file.flush()?;

        if actual != *expected {
            tracing::warn!(expected = %expected, actual = %actual, "discarding object with wrong hash");
            return Err(Error::hash_mismatch(expected.to_hex(), actual.to_hex()));
        }

        if self.exists(expected) {
            return Ok(len);
        }

        let staged = temp_file.into_temp_path();
        set_read_only(&staged)?;
        self.commit(staged, expected)?;
        Ok(len)
    }

    /// Move a staged, read-only object into its final location.
    fn commit(&self, staged: tempfile::TempPath, hash: &ContentHash) -> Result<()> {
        let obj_path = self.object_path(hash);
        if let Some(parent) = obj_path.parent() {
            fs::create_dir_all(parent)?;
        }

        match staged.persist_noclobber(&obj_path) {
            Ok(()) => Ok(()),
            // Another invocation stored the same bytes first
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(e.error.into()),
        }
    }

    /// Create a read-only entry at `dest` for the object `hash`.
    ///
    /// The entry is built under a temporary sibling name and renamed over
    /// `dest`, replacing whatever was there in one step.
    pub fn materialize(&self, hash: &ContentHash, dest: &Path, mode: LinkMode) -> Result<()> {
        let obj_path = self.object_path(hash);
        if !obj_path.is_file() {
            return Err(Error::missing_object(hash.to_hex()));
        }

        let parent = match dest.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent)?;

        let staged = tempfile::Builder::new()
            .prefix(".worm-")
            .make_in(parent, |path| match mode {
                LinkMode::Hardlink => fs::hard_link(&obj_path, path),
                LinkMode::Symlink => make_symlink(&obj_path, path),
                LinkMode::Copy => fs::copy(&obj_path, path).map(|_| ()),
            })?
            .into_temp_path();

        if mode == LinkMode::Copy {
            set_read_only(&staged)?;
        }

        staged.persist(dest)?;

        if mode == LinkMode::Copy {
            self.retain(hash)?;
        }

        tracing::debug!(%hash, dest = %dest.display(), %mode, "materialized object");
        Ok(())
    }

    fn refcount_path(&self, hash: &ContentHash) -> PathBuf {
        self.root.join(REFS_DIR).join(hash.to_hex())
    }

    /// Explicit reference count recorded for `hash` (copy link mode).
    pub fn ref_count(&self, hash: &ContentHash) -> Result<u64> {
        let path = self.refcount_path(hash);
        if !path.exists() {
            return Ok(0);
        }

        let content = fs::read_to_string(&path)?;
        content.trim().parse::<u64>().map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Invalid refcount in {}", path.display()),
            )
            .into()
        })
    }

    /// Number of working-tree entries sharing the object for `hash`.
    ///
    /// Hard links are counted from the object's link count; copies from the
    /// explicit refcount.
    pub fn references(&self, hash: &ContentHash) -> Result<u64> {
        let explicit = self.ref_count(hash)?;
        Ok(explicit + self.hard_link_references(hash)?)
    }

    #[cfg(unix)]
    fn hard_link_references(&self, hash: &ContentHash) -> Result<u64> {
        use std::os::unix::fs::MetadataExt;
        match fs::metadata(self.object_path(hash)) {
            Ok(metadata) => Ok(metadata.nlink().saturating_sub(1)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    #[cfg(not(unix))]
    fn hard_link_references(&self, _hash: &ContentHash) -> Result<u64> {
        Ok(0)
    }

    /// Record one more copy-mode reference to `hash`.
    pub fn retain(&self, hash: &ContentHash) -> Result<u64> {
        let count = self.ref_count(hash)? + 1;
        self.write_ref_count(hash, count)?;
        Ok(count)
    }

    /// Drop one copy-mode reference to `hash`.
    pub fn release(&self, hash: &ContentHash) -> Result<u64> {
        let count = self.ref_count(hash)?.saturating_sub(1);
        if count == 0 {
            match fs::remove_file(self.refcount_path(hash)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        } else {
            self.write_ref_count(hash, count)?;
        }
        Ok(count)
    }

    fn write_ref_count(&self, hash: &ContentHash, count: u64) -> Result<()> {
        let refs_dir = self.root.join(REFS_DIR);
        fs::create_dir_all(&refs_dir)?;

        let mut temp_file = tempfile::NamedTempFile::new_in(&refs_dir)?;
        writeln!(temp_file, "{}", count)?;
        temp_file.persist(self.refcount_path(hash))?;
        Ok(())
    }

    /// Hashes of every stored object.
    pub fn objects(&self) -> Result<Vec<ContentHash>> {
        let mut hashes = Vec::new();
        let objects_dir = self.root.join(OBJECTS_DIR);

        for first in fs::read_dir(&objects_dir)? {
            let first = first?.path();
            if !first.is_dir() {
                continue;
            }
            for second in fs::read_dir(&first)? {
                let second = second?.path();
                if !second.is_dir() {
                    continue;
                }
                for object in fs::read_dir(&second)? {
                    let object = object?.path();
                    let name = object.file_name().and_then(|n| n.to_str()).unwrap_or("");
                    match ContentHash::from_hex(name) {
                        Ok(hash) => hashes.push(hash),
                        Err(_) => {
                            tracing::warn!(path = %object.display(), "ignoring stray file in cache")
                        }
                    }
                }
            }
        }

        hashes.sort();
        Ok(hashes)
    }

    /// Rehash every object and report those whose bytes disagree with their name.
    pub fn verify(&self) -> Result<Vec<CorruptObject>> {
        let mut corrupt = Vec::new();

        for hash in self.objects()? {
            let path = self.object_path(&hash);
            let actual = ContentHash::hash_file(&path)?;
            if actual != hash {
                tracing::warn!(expected = %hash, %actual, "corrupt object in cache");
                corrupt.push(CorruptObject {
                    path,
                    expected: hash,
                    actual,
                });
            }
        }

        Ok(corrupt)
    }
}

/// Link failures that ingestion may answer by copying instead.
fn link_fallback_allowed(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::CrossesDevices
            | io::ErrorKind::Unsupported
            | io::ErrorKind::PermissionDenied
    )
}

#[cfg(unix)]
fn make_symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn make_symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_file(target, link)
}

/// Remove all write permission bits.
#[cfg(unix)]
pub(crate) fn set_read_only(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mode = fs::metadata(path)?.permissions().mode();
    fs::set_permissions(path, fs::Permissions::from_mode(mode & !0o222))?;
    Ok(())
}

/// Remove all write permission bits (Windows read-only attribute).
#[cfg(not(unix))]
pub(crate) fn set_read_only(path: &Path) -> Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_readonly(true);
    fs::set_permissions(path, perms)?;
    Ok(())
}

/// Grant owner and group write permission.
#[cfg(unix)]
pub(crate) fn set_writable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mode = fs::metadata(path)?.permissions().mode();
    fs::set_permissions(path, fs::Permissions::from_mode(mode | 0o220))?;
    Ok(())
}

/// Grant write permission (clear Windows read-only attribute).
#[cfg(not(unix))]
pub(crate) fn set_writable(path: &Path) -> Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    #[allow(clippy::permissions_set_readonly_false)]
    perms.set_readonly(false);
    fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, ContentStore) {
        let temp_dir = TempDir::new().unwrap();
        let store = ContentStore::open(temp_dir.path().join("cache")).unwrap();
        (temp_dir, store)
    }

    fn is_read_only(path: &Path) -> bool {
        fs::metadata(path).unwrap().permissions().readonly()
    }

    #[test]
    fn test_open_creates_layout() {
        let (temp_dir, _store) = setup();
        assert!(temp_dir.path().join("cache/objects").is_dir());
        assert!(temp_dir.path().join("cache/tmp").is_dir());
    }

    #[test]
    fn test_object_path() {
        let (_temp_dir, store) = setup();
        let hash = ContentHash::hash_bytes(b"WORM123");
        let path = store.object_path(&hash);

        assert!(path.ends_with(format!("objects/ec/1c/{}", hash.to_hex())));
    }

    #[test]
    fn test_ingest_file() {
        let (temp_dir, store) = setup();
        let source = temp_dir.path().join("big.bin");
        fs::write(&source, b"WORM123").unwrap();

        let hash = store.ingest(&source).unwrap();
        assert_eq!(hash, ContentHash::hash_bytes(b"WORM123"));
        assert!(store.exists(&hash));
        assert!(is_read_only(&store.object_path(&hash)));
        assert_eq!(fs::read(store.object_path(&hash)).unwrap(), b"WORM123");
    }

    #[test]
    fn test_ingest_twice_single_object() {
        let (temp_dir, store) = setup();
        let a = temp_dir.path().join("a.bin");
        let b = temp_dir.path().join("b.bin");
        fs::write(&a, b"same content").unwrap();
        fs::write(&b, b"same content").unwrap();

        let hash1 = store.ingest(&a).unwrap();
        let hash2 = store.ingest(&b).unwrap();
        assert_eq!(hash1, hash2);
        assert_eq!(store.objects().unwrap(), vec![hash1]);

        // Nothing left behind in staging
        assert_eq!(fs::read_dir(store.root().join("tmp")).unwrap().count(), 0);
    }

    #[test]
    #[cfg(unix)]
    fn test_ingest_symlink_stores_target_bytes() {
        let (temp_dir, store) = setup();
        let outside = temp_dir.path().join("outside.bin");
        let link = temp_dir.path().join("link.bin");
        fs::write(&outside, b"original").unwrap();
        std::os::unix::fs::symlink(&outside, &link).unwrap();

        let hash = store.ingest(&link).unwrap();
        assert_eq!(hash, ContentHash::hash_bytes(b"original"));

        let obj_path = store.object_path(&hash);
        assert!(fs::symlink_metadata(&obj_path).unwrap().file_type().is_file());
        assert!(!is_read_only(&outside), "symlink target must not be touched");

        // Rewriting the target leaves the stored object intact
        fs::write(&outside, b"MUTATED!").unwrap();
        assert_eq!(fs::read(&obj_path).unwrap(), b"original");
        assert!(store.verify().unwrap().is_empty());
    }

    #[test]
    fn test_ingest_blocks_writes_before_hashing() {
        let (temp_dir, store) = setup();
        let source = temp_dir.path().join("big.bin");
        fs::write(&source, b"frozen").unwrap();

        let hash = store.ingest(&source).unwrap();
        assert_eq!(hash, ContentHash::hash_bytes(b"frozen"));
        // The working file shares the staged inode, so it is frozen too
        assert!(is_read_only(&source));
        assert!(is_read_only(&store.object_path(&hash)));
    }

    #[test]
    fn test_ingest_copy_keeps_source_independent() {
        let (temp_dir, store) = setup();
        let source = temp_dir.path().join("copy.bin");
        fs::write(&source, b"independent").unwrap();

        let hash = store.ingest_copy(&source).unwrap();
        assert!(store.exists(&hash));
        assert!(!is_read_only(&source));
        fs::write(&source, b"edited").unwrap();
        assert_eq!(fs::read(store.object_path(&hash)).unwrap(), b"independent");
    }

    #[test]
    fn test_ingest_missing_source() {
        let (temp_dir, store) = setup();
        assert!(store.ingest(&temp_dir.path().join("nope")).is_err());
    }

    #[test]
    fn test_ingest_reader_verifies_hash() {
        let (_temp_dir, store) = setup();
        let good = ContentHash::hash_bytes(b"payload");

        let len = store.ingest_reader(&b"payload"[..], &good).unwrap();
        assert_eq!(len, 7);
        assert!(store.exists(&good));
    }

    #[test]
    fn test_ingest_reader_mismatch_discards() {
        let (_temp_dir, store) = setup();
        let expected = ContentHash::hash_bytes(b"what we asked for");

        let result = store.ingest_reader(&b"something else"[..], &expected);
        assert!(matches!(result, Err(Error::HashMismatch { .. })));
        assert!(!store.exists(&expected));
        assert_eq!(fs::read_dir(store.root().join("tmp")).unwrap().count(), 0);
    }

    #[test]
    fn test_materialize_missing_object() {
        let (temp_dir, store) = setup();
        let hash = ContentHash::hash_bytes(b"absent");
        let result = store.materialize(&hash, &temp_dir.path().join("out"), LinkMode::Hardlink);
        assert!(matches!(result, Err(Error::MissingObject { .. })));
    }

    #[test]
    fn test_materialize_modes_read_only() {
        let (temp_dir, store) = setup();
        let hash = ContentHash::hash_bytes(b"linked");
        store.ingest_reader(&b"linked"[..], &hash).unwrap();

        for mode in [LinkMode::Hardlink, LinkMode::Symlink, LinkMode::Copy] {
            let dest = temp_dir.path().join("work").join(mode.as_str());
            store.materialize(&hash, &dest, mode).unwrap();
            assert_eq!(fs::read(&dest).unwrap(), b"linked");
            assert!(is_read_only(&dest), "{} entry should be read-only", mode);
        }
    }

    #[test]
    fn test_materialize_replaces_existing() {
        let (temp_dir, store) = setup();
        let hash = ContentHash::hash_bytes(b"new");
        store.ingest_reader(&b"new"[..], &hash).unwrap();

        let dest = temp_dir.path().join("file");
        fs::write(&dest, b"old").unwrap();
        store.materialize(&hash, &dest, LinkMode::Hardlink).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"new");
    }

    #[test]
    #[cfg(unix)]
    fn test_hardlink_references() {
        let (temp_dir, store) = setup();
        let hash = ContentHash::hash_bytes(b"shared");
        store.ingest_reader(&b"shared"[..], &hash).unwrap();
        assert_eq!(store.references(&hash).unwrap(), 0);

        store.materialize(&hash, &temp_dir.path().join("one"), LinkMode::Hardlink).unwrap();
        store.materialize(&hash, &temp_dir.path().join("two"), LinkMode::Hardlink).unwrap();
        assert_eq!(store.references(&hash).unwrap(), 2);
    }

    #[test]
    fn test_copy_mode_refcount() {
        let (temp_dir, store) = setup();
        let hash = ContentHash::hash_bytes(b"copied");
        store.ingest_reader(&b"copied"[..], &hash).unwrap();

        store.materialize(&hash, &temp_dir.path().join("one"), LinkMode::Copy).unwrap();
        store.materialize(&hash, &temp_dir.path().join("two"), LinkMode::Copy).unwrap();
        assert_eq!(store.ref_count(&hash).unwrap(), 2);

        assert_eq!(store.release(&hash).unwrap(), 1);
        assert_eq!(store.release(&hash).unwrap(), 0);
        assert!(!store.root().join("refs").join(hash.to_hex()).exists());
    }

    #[test]
    fn test_verify_detects_corruption() {
        let (_temp_dir, store) = setup();
        let good = ContentHash::hash_bytes(b"good");
        let bad = ContentHash::hash_bytes(b"bad");
        store.ingest_reader(&b"good"[..], &good).unwrap();
        store.ingest_reader(&b"bad"[..], &bad).unwrap();

        let bad_path = store.object_path(&bad);
        set_writable(&bad_path).unwrap();
        fs::write(&bad_path, b"tampered").unwrap();

        let corrupt = store.verify().unwrap();
        assert_eq!(corrupt.len(), 1);
        assert_eq!(corrupt[0].expected, bad);
        assert_eq!(corrupt[0].actual, ContentHash::hash_bytes(b"tampered"));
    }

    #[test]
    fn test_link_mode_parse() {
        assert_eq!("hardlink".parse::<LinkMode>().unwrap(), LinkMode::Hardlink);
        assert_eq!("symlink".parse::<LinkMode>().unwrap(), LinkMode::Symlink);
        assert_eq!("copy".parse::<LinkMode>().unwrap(), LinkMode::Copy);
        assert!("reflink".parse::<LinkMode>().is_err());
    }

    // Property-based tests
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 32,
            max_shrink_iters: 1000,
            ..ProptestConfig::default()
        })]

        /// Ingesting the same bytes twice yields one hash and one object
        #[test]
        fn prop_ingest_idempotent(data in prop::collection::vec(any::<u8>(), 0..20_000)) {
            let (temp_dir, store) = setup();
            let source = temp_dir.path().join("src.bin");
            fs::write(&source, &data)?;

            let first = store.ingest(&source)?;
            let second = store.ingest(&source)?;
            prop_assert_eq!(first, second);
            prop_assert_eq!(store.objects()?.len(), 1);
            prop_assert_eq!(fs::read(store.object_path(&first))?, data);
        }
    }
}
