//! # Worm Core
//!
//! Write-once-read-many management of large files next to a version-control
//! repository.
//!
//! File bytes never enter the version-control history. Instead a small index
//! maps each tracked path to the SHA-256 of its content, the bytes live in a
//! local content-addressed cache, and the working tree holds read-only
//! anchors (hard links by default) into that cache. A remote depot keyed by
//! the same hashes lets other checkouts pull the content back.
//!
//! ## Features
//!
//! - Content-addressed, deduplicating, immutable local cache
//! - Read-only anchors with explicit unlock for editing
//! - Push/pull over a bounded worker pool with deadlines and retries
//! - Per-path presence across working tree, cache and depot
//! - Pluggable depot drivers keyed by URL scheme
//!
//! ## Example
//!
//! ```no_run
//! use worm_core::{CancelToken, Depot, MemoryDepot, Repository, Settings};
//! use std::path::{Path, PathBuf};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let depot: Arc<dyn Depot> = Arc::new(MemoryDepot::new());
//! let repo = Repository::init(
//!     Path::new("./project"),
//!     Settings::new("./cache"),
//!     Some(depot),
//! )?;
//!
//! // Track a file: it is ingested and replaced by a read-only link
//! repo.add(&[PathBuf::from("data/model.bin")])?;
//!
//! // Upload everything that is not yet in the depot
//! let report = repo.push(&[], CancelToken::new())?;
//! assert!(report.is_success());
//!
//! for record in repo.status(&[])? {
//!     println!("{} {}", record.presence, record.path);
//! }
//! # Ok(())
//! # }
//! ```

mod anchor;
mod config;
mod depot;
mod error;
mod exclude;
mod hash;
mod index;
mod ledger;
mod repo;
mod status;
mod store;
mod sync;
mod walk;

pub use anchor::Anchors;
pub use config::{CONFIG_FILE, Config, default_cache_dir};
pub use depot::{
    Depot, DepotError, DepotRegistry, DepotResult, DepotSpec, FileDepot, MemoryDepot, object_key,
};
pub use error::{Error, Result};
pub use exclude::ExcludeFile;
pub use hash::ContentHash;
pub use index::{INDEX_FILE, INDEX_VERSION, Index};
pub use ledger::{Ledger, LedgerEntry};
pub use repo::{CheckReport, DEFAULT_EXCLUDE_FILE, Repository, Settings, merge_index_files};
pub use status::{Presence, ProbePolicy, StatusEngine, StatusRecord};
pub use store::{ContentStore, CorruptObject, LinkMode};
pub use sync::{
    CancelToken, Direction, SyncEngine, SyncOptions, SyncReport, TransferOutcome, TransferStatus,
};
pub use walk::files_under;
