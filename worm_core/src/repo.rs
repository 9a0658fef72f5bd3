//! The per-invocation repository context.
//!
//! A [`Repository`] bundles everything a command needs: the working
//! directory, the index location, the content store and anchors, the depot
//! client and its ledger, and the resolved settings. Every operation loads
//! the index, does its work and writes the index back; structural errors
//! (corrupt index, untracked or out-of-tree paths) are raised before anything
//! is changed.

use crate::anchor::Anchors;
use crate::config::Config;
use crate::depot::Depot;
use crate::error::{Error, Result};
use crate::exclude::ExcludeFile;
use crate::hash::ContentHash;
use crate::index::{INDEX_FILE, Index};
use crate::ledger::Ledger;
use crate::status::{ProbePolicy, StatusEngine, StatusRecord};
use crate::store::{ContentStore, CorruptObject, LinkMode};
use crate::sync::{CancelToken, SyncEngine, SyncOptions, SyncReport};
use crate::walk;
use serde::Serialize;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// Default exclusion file, relative to the repository root.
pub const DEFAULT_EXCLUDE_FILE: &str = ".git/info/exclude";

/// Resolved settings for one repository.
#[derive(Debug, Clone)]
pub struct Settings {
    pub cache_dir: PathBuf,
    pub link_mode: LinkMode,
    pub sync: SyncOptions,
    pub probe: ProbePolicy,
    /// `None` disables exclusion registration.
    pub exclude_file: Option<PathBuf>,
}

impl Settings {
    /// Settings with defaults and the given cache directory.
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            link_mode: LinkMode::default(),
            sync: SyncOptions::default(),
            probe: ProbePolicy::default(),
            exclude_file: Some(PathBuf::from(DEFAULT_EXCLUDE_FILE)),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            cache_dir: config.cache_dir(),
            link_mode: config.link_mode,
            sync: config.sync_options(),
            probe: config.probe,
            exclude_file: Some(
                config
                    .exclude_file
                    .clone()
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_EXCLUDE_FILE)),
            ),
        }
    }
}

/// Findings of an integrity check.
#[derive(Debug, Default, Serialize)]
pub struct CheckReport {
    /// Cached objects whose bytes no longer match their hash.
    pub corrupt: Vec<CorruptObject>,
    /// Tracked paths holding content other than the indexed hash.
    pub dirty: Vec<String>,
    /// Tracked paths whose content is neither cached nor in the working tree.
    pub missing: Vec<String>,
}

impl CheckReport {
    pub fn is_clean(&self) -> bool {
        self.corrupt.is_empty() && self.dirty.is_empty()
    }
}

/// Context for operating on one repository.
pub struct Repository {
    work_dir: PathBuf,
    index_path: PathBuf,
    anchors: Anchors,
    depot: Option<Arc<dyn Depot>>,
    ledger: Option<Ledger>,
    settings: Settings,
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("work_dir", &self.work_dir)
            .field("depot", &self.depot.as_ref().map(|d| d.describe()))
            .field("settings", &self.settings)
            .finish()
    }
}

impl Repository {
    /// Create the index in `work_dir` if it does not exist, then open.
    pub fn init(work_dir: &Path, settings: Settings, depot: Option<Arc<dyn Depot>>) -> Result<Self> {
        fs::create_dir_all(work_dir)?;
        let index_path = work_dir.join(INDEX_FILE);
        if !index_path.exists() {
            Index::new().save(&index_path)?;
            tracing::info!(path = %index_path.display(), "initialized index");
        }
        Self::open(work_dir, settings, depot)
    }

    /// Open an initialized repository rooted at `work_dir`.
    pub fn open(work_dir: &Path, settings: Settings, depot: Option<Arc<dyn Depot>>) -> Result<Self> {
        let work_dir = fs::canonicalize(work_dir)?;
        let index_path = work_dir.join(INDEX_FILE);
        if !index_path.is_file() {
            return Err(Error::NotInitialized {
                path: work_dir,
                index: INDEX_FILE.to_string(),
            });
        }

        let cache_dir = if settings.cache_dir.is_absolute() {
            settings.cache_dir.clone()
        } else {
            work_dir.join(&settings.cache_dir)
        };
        fs::create_dir_all(&cache_dir)?;
        let store = ContentStore::open(fs::canonicalize(&cache_dir)?)?;

        let exclude = settings
            .exclude_file
            .as_ref()
            .map(|file| ExcludeFile::new(work_dir.join(file)));
        let anchors = Anchors::new(&work_dir, store, settings.link_mode, exclude);

        let ledger = match &depot {
            Some(depot) => Some(Ledger::open(
                anchors
                    .store()
                    .root()
                    .join("ledger")
                    .join(Ledger::file_name(&depot.describe())),
            )?),
            None => None,
        };

        Ok(Self {
            work_dir,
            index_path,
            anchors,
            depot,
            ledger,
            settings,
        })
    }

    /// Find the repository root at or above `start`.
    pub fn discover(start: &Path) -> Result<PathBuf> {
        let start = fs::canonicalize(start)?;
        start
            .ancestors()
            .find(|dir| dir.join(INDEX_FILE).is_file())
            .map(Path::to_path_buf)
            .ok_or_else(|| Error::NotInitialized {
                path: start.clone(),
                index: INDEX_FILE.to_string(),
            })
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    pub fn store(&self) -> &ContentStore {
        self.anchors.store()
    }

    pub fn anchors(&self) -> &Anchors {
        &self.anchors
    }

    pub fn depot(&self) -> Option<&Arc<dyn Depot>> {
        self.depot.as_ref()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn load_index(&self) -> Result<Index> {
        Index::load(&self.index_path)
    }

    /// Repository-relative, `/`-separated form of `path`.
    ///
    /// Relative paths are taken relative to the working directory. The
    /// repository root itself resolves to the empty string.
    pub fn resolve(&self, path: &Path) -> Result<String> {
        let abs = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.work_dir.join(path)
        };
        let normalized = normalize(&abs);

        let rel = match normalized.strip_prefix(&self.work_dir) {
            Ok(rel) => rel.to_path_buf(),
            // The caller may have used a non-canonical spelling of the root
            Err(_) => canonical_parent(&normalized)
                .and_then(|canonical| {
                    canonical
                        .strip_prefix(&self.work_dir)
                        .ok()
                        .map(Path::to_path_buf)
                })
                .ok_or_else(|| Error::outside_repository(path))?,
        };

        let parts: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Ok(parts.join("/"))
    }

    /// Tracked paths selected by `paths`: exact entries, or every entry under
    /// a directory. No arguments selects everything.
    pub fn select(&self, index: &Index, paths: &[PathBuf]) -> Result<Vec<String>> {
        if paths.is_empty() {
            return Ok(index.iter().map(|(p, _)| p.to_string()).collect());
        }

        let mut selected = Vec::new();
        for path in paths {
            let rel = self.resolve(path)?;
            if index.contains(&rel) {
                selected.push(rel);
                continue;
            }

            let prefix = if rel.is_empty() {
                String::new()
            } else {
                format!("{}/", rel)
            };
            let before = selected.len();
            selected.extend(
                index
                    .iter()
                    .filter(|(p, _)| p.starts_with(&prefix))
                    .map(|(p, _)| p.to_string()),
            );
            if selected.len() == before {
                return Err(Error::not_tracked(rel));
            }
        }

        selected.sort();
        selected.dedup();
        Ok(selected)
    }

    /// Start tracking files (directories are expanded).
    ///
    /// Each file is ingested into the store and replaced by an anchor.
    /// Returns the tracked paths and their hashes.
    pub fn add(&self, paths: &[PathBuf]) -> Result<Vec<(String, ContentHash)>> {
        let mut index = self.load_index()?;

        let mut files = Vec::new();
        for path in paths {
            let abs = self.work_dir.join(self.resolve(path)?);
            let metadata = fs::symlink_metadata(&abs)?;
            if metadata.file_type().is_symlink() {
                tracing::warn!(path = %path.display(), "skipping symbolic link");
                continue;
            }
            if metadata.is_dir() {
                for file in walk::files_under(&abs)? {
                    let rel = self.resolve(&file)?;
                    files.push((file, rel));
                }
            } else {
                let rel = self.resolve(path)?;
                if rel.is_empty() || rel == INDEX_FILE {
                    tracing::warn!(path = %path.display(), "refusing to track repository metadata");
                    continue;
                }
                files.push((abs, rel));
            }
        }

        let mut added = Vec::new();
        let result = files.into_iter().try_for_each(|(abs, rel)| {
            let hash = self.store().ingest(&abs)?;
            self.anchors.link(&rel, &hash)?;
            tracing::info!(path = %rel, %hash, "tracked");
            index.add(rel.clone(), hash);
            added.push((rel, hash));
            Ok::<(), Error>(())
        });

        index.save(&self.index_path)?;
        result?;
        Ok(added)
    }

    /// Stop tracking paths and delete their anchors. Objects stay cached.
    ///
    /// A working file that does not hold the tracked content is left on disk.
    pub fn rm(&self, paths: &[PathBuf]) -> Result<Vec<(String, ContentHash)>> {
        let mut index = self.load_index()?;
        let selected = self.select_explicit(&index, paths)?;

        let mut removed = Vec::new();
        let result = selected.into_iter().try_for_each(|rel| {
            let Some(hash) = index.get(&rel) else {
                return Ok(());
            };

            if self.anchors.ensure_not_dirty(&rel, &hash).is_ok() {
                let held = (!index.is_unlocked(&rel)).then_some(&hash);
                self.anchors.remove(&rel, held)?;
            } else {
                tracing::warn!(path = %rel, "leaving modified working file in place");
            }
            self.anchors.unregister(&rel)?;

            index.remove(&rel);
            removed.push((rel, hash));
            Ok::<(), Error>(())
        });

        index.save(&self.index_path)?;
        result?;
        Ok(removed)
    }

    /// Move a tracked path, keeping its hash and anchor.
    pub fn mv(&self, src: &Path, dst: &Path) -> Result<(String, String, ContentHash)> {
        let mut index = self.load_index()?;
        let (src_rel, dst_rel, hash) = self.copy_target(&index, src, dst)?;

        if self.anchors.entry_exists(&src_rel) {
            self.anchors.rename(&src_rel, &dst_rel)?;
        } else {
            if self.store().exists(&hash) {
                self.anchors.link(&dst_rel, &hash)?;
            }
            self.anchors.unregister(&src_rel)?;
        }

        index.rename(&src_rel, dst_rel.clone())?;
        index.save(&self.index_path)?;

        tracing::info!(from = %src_rel, to = %dst_rel, "moved");
        Ok((src_rel, dst_rel, hash))
    }

    /// Track `dst` at the same content as `src`.
    pub fn cp(&self, src: &Path, dst: &Path) -> Result<(String, String, ContentHash)> {
        let mut index = self.load_index()?;
        let (src_rel, dst_rel, hash) = self.copy_target(&index, src, dst)?;

        if !self.store().exists(&hash) && self.anchors.is_anchored(&src_rel, &hash) {
            self.store().ingest(&self.anchors.entry_path(&src_rel))?;
        }
        if self.store().exists(&hash) {
            self.anchors.link(&dst_rel, &hash)?;
        }

        index.copy(&src_rel, dst_rel.clone())?;
        index.save(&self.index_path)?;

        tracing::info!(from = %src_rel, to = %dst_rel, "copied");
        Ok((src_rel, dst_rel, hash))
    }

    /// Replace anchors with private writable copies.
    pub fn unlock(&self, paths: &[PathBuf]) -> Result<Vec<String>> {
        let mut index = self.load_index()?;
        let selected = self.select_explicit(&index, paths)?;

        let mut unlocked = Vec::new();
        let result = selected.into_iter().try_for_each(|rel| {
            let Some(hash) = index.get(&rel) else {
                return Ok(());
            };
            if index.is_unlocked(&rel) {
                return Ok(());
            }

            self.anchors.ensure_not_dirty(&rel, &hash)?;
            self.anchors.unlock(&rel, &hash)?;
            index.mark_unlocked(&rel)?;
            unlocked.push(rel);
            Ok::<(), Error>(())
        });

        index.save(&self.index_path)?;
        result?;
        Ok(unlocked)
    }

    pub fn push(&self, paths: &[PathBuf], cancel: CancelToken) -> Result<SyncReport> {
        let index = self.load_index()?;
        let selected = self.select(&index, paths)?;
        self.sync_engine(self.settings.sync.clone(), cancel)
            .push(&index, &selected)
    }

    pub fn pull(&self, paths: &[PathBuf], cancel: CancelToken, offline: bool) -> Result<SyncReport> {
        let index = self.load_index()?;
        let selected = self.select(&index, paths)?;
        let options = SyncOptions {
            offline: offline || self.settings.sync.offline,
            ..self.settings.sync.clone()
        };
        self.sync_engine(options, cancel).pull(&index, &selected)
    }

    /// Add an extra hard link to the cached object of each selected path.
    ///
    /// With one selected path `dest` names the link itself; with several it
    /// is a directory receiving one link per file name. Paths whose object is
    /// not cached are skipped. An existing file at a link location is
    /// replaced only when it already holds the same content.
    pub fn link_extra(&self, paths: &[PathBuf], dest: &Path) -> Result<Vec<(String, PathBuf)>> {
        let index = self.load_index()?;
        let selected = self.select(&index, paths)?;
        let multi = selected.len() > 1;

        let mut linked = Vec::new();
        for rel in selected {
            let Some(hash) = index.get(&rel) else {
                continue;
            };
            if !self.store().exists(&hash) {
                tracing::warn!(path = %rel, "not cached, no extra link");
                continue;
            }

            let target = if multi {
                dest.join(rel.rsplit('/').next().unwrap_or(&rel))
            } else {
                dest.to_path_buf()
            };
            if fs::symlink_metadata(&target).is_ok()
                && !matches!(ContentHash::hash_file(&target), Ok(actual) if actual == hash)
            {
                return Err(Error::path_exists(target));
            }

            self.store().materialize(&hash, &target, LinkMode::Hardlink)?;
            tracing::info!(path = %rel, link = %target.display(), "extra link");
            linked.push((rel, target));
        }
        Ok(linked)
    }

    pub fn status(&self, paths: &[PathBuf]) -> Result<Vec<StatusRecord>> {
        self.status_with(paths, self.settings.probe)
    }

    /// Status under an explicit probe policy.
    pub fn status_with(&self, paths: &[PathBuf], policy: ProbePolicy) -> Result<Vec<StatusRecord>> {
        let index = self.load_index()?;
        let selected = self.select(&index, paths)?;
        let engine = StatusEngine::new(
            &self.anchors,
            self.depot.clone(),
            self.ledger.as_ref(),
            policy,
            self.settings.sync.timeout,
        );
        Ok(engine.status(&index, &selected))
    }

    /// Verify cached objects and tracked working files.
    pub fn check(&self) -> Result<CheckReport> {
        let index = self.load_index()?;
        let mut report = CheckReport {
            corrupt: self.store().verify()?,
            ..CheckReport::default()
        };

        for (path, hash) in index.iter() {
            if index.is_unlocked(path) {
                continue;
            }
            if self.anchors.ensure_not_dirty(path, &hash).is_err() {
                report.dirty.push(path.to_string());
            } else if !self.store().exists(&hash) && !self.anchors.is_anchored(path, &hash) {
                report.missing.push(path.to_string());
            }
        }

        Ok(report)
    }

    fn sync_engine(&self, options: SyncOptions, cancel: CancelToken) -> SyncEngine<'_> {
        SyncEngine::new(
            &self.anchors,
            self.depot.clone(),
            self.ledger.as_ref(),
            options,
            cancel,
        )
    }

    /// Like `select`, but every argument must name tracked content and an
    /// empty argument list selects nothing.
    fn select_explicit(&self, index: &Index, paths: &[PathBuf]) -> Result<Vec<String>> {
        if paths.is_empty() {
            return Ok(Vec::new());
        }
        self.select(index, paths)
    }

    /// Validate a move or copy: `src` tracked, `dst` free. A `dst` naming an
    /// existing directory receives the source file name.
    fn copy_target(&self, index: &Index, src: &Path, dst: &Path) -> Result<(String, String, ContentHash)> {
        let src_rel = self.resolve(src)?;
        let hash = index.get(&src_rel).ok_or_else(|| Error::not_tracked(&src_rel))?;

        let mut dst_rel = self.resolve(dst)?;
        let dst_abs = self.work_dir.join(&dst_rel);
        if dst_abs.is_dir() {
            let name = src_rel.rsplit('/').next().unwrap_or(&src_rel);
            dst_rel = if dst_rel.is_empty() {
                name.to_string()
            } else {
                format!("{}/{}", dst_rel, name)
            };
        }

        if dst_rel.is_empty() || index.contains(&dst_rel) || self.anchors.entry_exists(&dst_rel) {
            return Err(Error::path_exists(self.work_dir.join(&dst_rel)));
        }
        Ok((src_rel, dst_rel, hash))
    }
}

/// Merge the index file `theirs` into `ours`, writing the result to `ours`.
///
/// Suitable as a version-control merge driver for the index file.
pub fn merge_index_files(ours: &Path, theirs: &Path) -> Result<Index> {
    let mut merged = Index::load(ours)?;
    merged.merge(&Index::load(theirs)?);
    merged.save(ours)?;
    Ok(merged)
}

/// Lexically remove `.` and `..` components.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// `path` with its parent directory canonicalized.
fn canonical_parent(path: &Path) -> Option<PathBuf> {
    let parent = fs::canonicalize(path.parent()?).ok()?;
    Some(match path.file_name() {
        Some(name) => parent.join(name),
        None => parent,
    })
}
