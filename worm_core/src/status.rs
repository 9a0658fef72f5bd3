//! Where each tracked path's content currently lives.

use crate::anchor::Anchors;
use crate::depot::Depot;
use crate::error::{Error, Result};
use crate::hash::ContentHash;
use crate::index::Index;
use crate::ledger::Ledger;
use crate::sync::call_with_deadline;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// How the depot bit of a status record is decided.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbePolicy {
    /// Trust the ledger; probe the depot only for hashes it does not list,
    /// and record positive answers.
    #[default]
    Ledger,
    /// Always probe the depot.
    Live,
    /// Never contact the depot; the ledger alone decides.
    Offline,
}

impl ProbePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbePolicy::Ledger => "ledger",
            ProbePolicy::Live => "live",
            ProbePolicy::Offline => "offline",
        }
    }
}

impl fmt::Display for ProbePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProbePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ledger" => Ok(ProbePolicy::Ledger),
            "live" => Ok(ProbePolicy::Live),
            "offline" => Ok(ProbePolicy::Offline),
            _ => Err(Error::invalid_config(format!("unknown probe policy: {}", s))),
        }
    }
}

/// Tiers holding a path's content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Presence {
    pub working: bool,
    pub cache: bool,
    pub depot: bool,
}

impl Presence {
    pub const fn new(working: bool, cache: bool, depot: bool) -> Self {
        Self {
            working,
            cache,
            depot,
        }
    }
}

impl fmt::Display for Presence {
    /// Three columns: `W` working, `C` cache, `D` depot, `-` when absent.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            if self.working { 'W' } else { '-' },
            if self.cache { 'C' } else { '-' },
            if self.depot { 'D' } else { '-' },
        )
    }
}

/// Status of one tracked path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusRecord {
    pub path: String,
    pub hash: ContentHash,
    pub presence: Presence,
    /// Object size, when the bytes are available locally.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Something is at the path but it does not hold the indexed content.
    pub dirty: bool,
    pub unlocked: bool,
    /// Why the depot bit could not be determined.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depot_error: Option<String>,
}

/// Computes status records for a repository.
pub struct StatusEngine<'a> {
    anchors: &'a Anchors,
    depot: Option<Arc<dyn Depot>>,
    ledger: Option<&'a Ledger>,
    policy: ProbePolicy,
    timeout: Duration,
}

impl<'a> StatusEngine<'a> {
    pub fn new(
        anchors: &'a Anchors,
        depot: Option<Arc<dyn Depot>>,
        ledger: Option<&'a Ledger>,
        policy: ProbePolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            anchors,
            depot,
            ledger,
            policy,
            timeout,
        }
    }

    /// One record per tracked path in `paths`, in the given order.
    pub fn status(&self, index: &Index, paths: &[String]) -> Vec<StatusRecord> {
        let mut depot_answers: HashMap<ContentHash, std::result::Result<bool, String>> = HashMap::new();

        paths
            .iter()
            .filter_map(|path| index.get(path).map(|hash| (path, hash)))
            .map(|(path, hash)| {
                if index.is_unlocked(path) {
                    return self.unlocked_record(path, hash);
                }

                let store = self.anchors.store();
                let working = self.anchors.is_anchored(path, &hash);
                let cache = store.exists(&hash);
                let dirty = !working && self.anchors.ensure_not_dirty(path, &hash).is_err();

                let depot = depot_answers
                    .entry(hash)
                    .or_insert_with(|| self.depot_present(&hash))
                    .clone();

                let size = if cache {
                    store.object_size(&hash).ok()
                } else if working {
                    fs::metadata(self.anchors.entry_path(path)).map(|m| m.len()).ok()
                } else {
                    None
                };

                StatusRecord {
                    path: path.clone(),
                    hash,
                    presence: Presence::new(working, cache, *depot.as_ref().unwrap_or(&false)),
                    size,
                    dirty,
                    unlocked: false,
                    depot_error: depot.err(),
                }
            })
            .collect()
    }

    fn unlocked_record(&self, path: &str, hash: ContentHash) -> StatusRecord {
        let metadata = fs::metadata(self.anchors.entry_path(path)).ok();
        StatusRecord {
            path: path.to_string(),
            hash,
            presence: Presence::new(metadata.as_ref().is_some_and(|m| m.is_file()), false, false),
            size: metadata.map(|m| m.len()),
            dirty: false,
            unlocked: true,
            depot_error: None,
        }
    }

    /// Decide the depot bit for `hash` under the configured policy.
    fn depot_present(&self, hash: &ContentHash) -> std::result::Result<bool, String> {
        let Some(depot) = &self.depot else {
            return Ok(false);
        };
        let in_ledger = self.ledger.is_some_and(|ledger| ledger.contains(hash));

        match self.policy {
            ProbePolicy::Offline => return Ok(in_ledger),
            ProbePolicy::Ledger if in_ledger => return Ok(true),
            _ => {}
        }

        let depot = depot.clone();
        let probe_hash = *hash;
        match call_with_deadline(self.timeout, move || Ok(depot.probe(&probe_hash)?)) {
            Ok(true) => {
                if let Some(ledger) = self.ledger {
                    let size = self.anchors.store().object_size(hash).unwrap_or(0);
                    if let Err(e) = ledger.record(hash, size) {
                        tracing::warn!(%hash, error = %e, "could not record depot confirmation");
                    }
                }
                Ok(true)
            }
            Ok(false) => Ok(false),
            Err(e) => {
                tracing::warn!(%hash, error = %e, "depot probe failed");
                Err(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::depot::MemoryDepot;
    use crate::store::{ContentStore, LinkMode};
    use tempfile::TempDir;

    struct Fixture {
        _temp_dir: TempDir,
        anchors: Anchors,
        ledger: Ledger,
        index: Index,
        hash: ContentHash,
    }

    fn fixture() -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let work_dir = temp_dir.path().join("work");
        fs::create_dir_all(&work_dir).unwrap();
        let store = ContentStore::open(temp_dir.path().join("cache")).unwrap();
        let anchors = Anchors::new(&work_dir, store, LinkMode::Hardlink, None);
        let ledger = Ledger::open(temp_dir.path().join("cache/ledger/t.ledger")).unwrap();

        fs::write(work_dir.join("foo"), b"WORM123").unwrap();
        let hash = anchors.store().ingest(&work_dir.join("foo")).unwrap();
        anchors.link("foo", &hash).unwrap();
        let mut index = Index::new();
        index.add("foo", hash);

        Fixture {
            _temp_dir: temp_dir,
            anchors,
            ledger,
            index,
            hash,
        }
    }

    fn paths() -> Vec<String> {
        vec!["foo".to_string()]
    }

    #[test]
    fn test_added_is_working_and_cache() {
        let fx = fixture();
        let engine = StatusEngine::new(&fx.anchors, None, None, ProbePolicy::Ledger, Duration::from_secs(1));

        let records = engine.status(&fx.index, &paths());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].presence, Presence::new(true, true, false));
        assert_eq!(records[0].size, Some(7));
        assert!(!records[0].dirty);
        assert_eq!(records[0].presence.to_string(), "WC-");
    }

    #[test]
    fn test_probe_policies() {
        let fx = fixture();
        let depot = MemoryDepot::new();
        depot.insert_raw(fx.hash, b"WORM123".to_vec());
        let depot: Arc<dyn Depot> = Arc::new(depot);

        // Offline: the ledger has nothing yet
        let offline = StatusEngine::new(&fx.anchors, Some(depot.clone()), Some(&fx.ledger), ProbePolicy::Offline, Duration::from_secs(1));
        assert!(!offline.status(&fx.index, &paths())[0].presence.depot);

        // Ledger: miss falls back to a live probe and records the answer
        let ledger = StatusEngine::new(&fx.anchors, Some(depot.clone()), Some(&fx.ledger), ProbePolicy::Ledger, Duration::from_secs(1));
        assert!(ledger.status(&fx.index, &paths())[0].presence.depot);
        assert!(fx.ledger.contains(&fx.hash));

        assert!(offline.status(&fx.index, &paths())[0].presence.depot);
    }

    #[test]
    fn test_live_policy_ignores_stale_ledger() {
        let fx = fixture();
        fx.ledger.record(&fx.hash, 7).unwrap();
        let depot: Arc<dyn Depot> = Arc::new(MemoryDepot::new());

        let live = StatusEngine::new(&fx.anchors, Some(depot.clone()), Some(&fx.ledger), ProbePolicy::Live, Duration::from_secs(1));
        assert!(!live.status(&fx.index, &paths())[0].presence.depot);

        let ledger = StatusEngine::new(&fx.anchors, Some(depot), Some(&fx.ledger), ProbePolicy::Ledger, Duration::from_secs(1));
        assert!(ledger.status(&fx.index, &paths())[0].presence.depot);
    }

    #[test]
    fn test_dirty_working_file() {
        let fx = fixture();
        let path = fx.anchors.entry_path("foo");
        fs::remove_file(&path).unwrap();
        fs::write(&path, b"edited").unwrap();

        let engine = StatusEngine::new(&fx.anchors, None, None, ProbePolicy::Ledger, Duration::from_secs(1));
        let records = engine.status(&fx.index, &paths());
        let record = &records[0];
        assert!(!record.presence.working);
        assert!(record.presence.cache);
        assert!(record.dirty);
    }

    #[test]
    fn test_unlocked_reports_working_only() {
        let mut fx = fixture();
        fx.anchors.unlock("foo", &fx.hash).unwrap();
        fx.index.mark_unlocked("foo").unwrap();

        let engine = StatusEngine::new(&fx.anchors, None, None, ProbePolicy::Ledger, Duration::from_secs(1));
        let records = engine.status(&fx.index, &paths());
        let record = &records[0];
        assert_eq!(record.presence, Presence::new(true, false, false));
        assert!(record.unlocked);
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!("ledger".parse::<ProbePolicy>().unwrap(), ProbePolicy::Ledger);
        assert_eq!("live".parse::<ProbePolicy>().unwrap(), ProbePolicy::Live);
        assert_eq!("offline".parse::<ProbePolicy>().unwrap(), ProbePolicy::Offline);
        assert!("sometimes".parse::<ProbePolicy>().is_err());
    }
}
