//! In-process depot.

use super::{Depot, DepotError, DepotResult};
use crate::hash::ContentHash;
use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::sync::{Arc, Mutex};

/// A depot held in memory.
///
/// Clones share the same objects, so a test can hand one clone to a
/// repository and inspect or tamper with the other.
#[derive(Debug, Clone, Default)]
pub struct MemoryDepot {
    name: String,
    objects: Arc<Mutex<HashMap<ContentHash, Arc<Vec<u8>>>>>,
}

impl MemoryDepot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    fn lock(&self) -> DepotResult<std::sync::MutexGuard<'_, HashMap<ContentHash, Arc<Vec<u8>>>>> {
        self.objects
            .lock()
            .map_err(|_| DepotError::unavailable("memory depot lock poisoned"))
    }

    /// Place raw bytes under `hash` without any checking.
    pub fn insert_raw(&self, hash: ContentHash, bytes: Vec<u8>) {
        if let Ok(mut objects) = self.objects.lock() {
            objects.insert(hash, Arc::new(bytes));
        }
    }

    /// Bytes held under `hash`.
    pub fn get(&self, hash: &ContentHash) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .ok()
            .and_then(|objects| objects.get(hash).map(|bytes| bytes.as_ref().clone()))
    }

    pub fn len(&self) -> usize {
        self.objects.lock().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Depot for MemoryDepot {
    fn probe(&self, hash: &ContentHash) -> DepotResult<bool> {
        Ok(self.lock()?.contains_key(hash))
    }

    fn fetch(&self, hash: &ContentHash) -> DepotResult<Box<dyn Read + Send>> {
        let bytes = self
            .lock()?
            .get(hash)
            .cloned()
            .ok_or_else(|| DepotError::not_found(hash))?;
        Ok(Box::new(Cursor::new(bytes.as_ref().clone())))
    }

    fn store(&self, hash: &ContentHash, mut reader: Box<dyn Read + Send>, len: u64) -> DepotResult<()> {
        let mut bytes = Vec::with_capacity(len as usize);
        reader
            .read_to_end(&mut bytes)
            .map_err(|e| DepotError::unavailable(e.to_string()))?;
        if bytes.len() as u64 != len {
            return Err(DepotError::unavailable(format!(
                "short upload: expected {} bytes, got {}",
                len,
                bytes.len()
            )));
        }
        self.lock()?.entry(*hash).or_insert_with(|| Arc::new(bytes));
        Ok(())
    }

    fn describe(&self) -> String {
        format!("memory://{}", self.name)
    }
}
