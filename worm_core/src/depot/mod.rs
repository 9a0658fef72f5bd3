//! Remote object storage.
//!
//! A depot holds object bytes keyed by content hash (`objects/<hex>`). It is
//! not trusted: everything fetched from a depot is rehashed before it enters
//! the local store. Drivers perform no retries; the sync engine owns retry,
//! backoff and deadlines.

mod file;
mod memory;

pub use file::FileDepot;
pub use memory::MemoryDepot;

use crate::error::{Error, Result};
use crate::hash::ContentHash;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Read;
use std::sync::Arc;

/// Errors reported by depot drivers.
#[derive(thiserror::Error, Debug)]
pub enum DepotError {
    /// The depot holds no object under the requested key.
    #[error("object not found in depot: {hash}")]
    NotFound { hash: String },

    /// The depot could not be reached or refused the request.
    #[error("depot unavailable: {0}")]
    Unavailable(String),

    /// The request did not complete in time.
    #[error("depot request timed out after {seconds}s")]
    Timeout { seconds: u64 },
}

pub type DepotResult<T> = std::result::Result<T, DepotError>;

impl DepotError {
    pub fn not_found(hash: &ContentHash) -> Self {
        DepotError::NotFound {
            hash: hash.to_hex(),
        }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        DepotError::Unavailable(reason.into())
    }
}

impl From<DepotError> for Error {
    fn from(err: DepotError) -> Self {
        match err {
            DepotError::NotFound { hash } => Error::DepotMissingObject { hash },
            DepotError::Unavailable(reason) => Error::DepotUnavailable { reason },
            DepotError::Timeout { seconds } => Error::DepotTimeout { seconds },
        }
    }
}

/// Key under which a depot stores the object for `hash`.
pub fn object_key(hash: &ContentHash) -> String {
    format!("objects/{}", hash.to_hex())
}

/// Capability interface every depot driver implements.
///
/// All operations are idempotent: storing an object twice or probing a
/// missing object has no side effects.
pub trait Depot: Send + Sync {
    /// Whether the depot holds an object for `hash`.
    fn probe(&self, hash: &ContentHash) -> DepotResult<bool>;

    /// Stream the bytes stored for `hash`.
    fn fetch(&self, hash: &ContentHash) -> DepotResult<Box<dyn Read + Send>>;

    /// Store `len` bytes read from `reader` under `hash`.
    fn store(&self, hash: &ContentHash, reader: Box<dyn Read + Send>, len: u64) -> DepotResult<()>;

    /// Human-readable identity, used in logs and as the ledger key.
    fn describe(&self) -> String;
}

/// Where and how to reach a depot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepotSpec {
    /// `<scheme>://<location>`
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

impl DepotSpec {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            key: None,
            secret: None,
        }
    }

    /// Split the URL into scheme and location.
    pub fn parts(&self) -> Result<(&str, &str)> {
        match self.url.split_once("://") {
            Some((scheme, location))
                if !scheme.is_empty()
                    && scheme
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.')) =>
            {
                Ok((scheme, location))
            }
            _ => Err(Error::invalid_config(format!(
                "depot url must look like <scheme>://<location>: {}",
                self.url
            ))),
        }
    }
}

type DepotFactory = Box<dyn Fn(&DepotSpec, &str) -> Result<Arc<dyn Depot>> + Send + Sync>;

/// Depot drivers keyed by URL scheme.
pub struct DepotRegistry {
    factories: BTreeMap<String, DepotFactory>,
}

impl Default for DepotRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl DepotRegistry {
    /// A registry with no drivers.
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// A registry with the `file` and `memory` drivers.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("file", |_spec, location| {
            Ok(Arc::new(FileDepot::open(location)?) as Arc<dyn Depot>)
        });
        registry.register("memory", |_spec, location| {
            Ok(Arc::new(MemoryDepot::named(location)) as Arc<dyn Depot>)
        });
        registry
    }

    /// Register a driver for `scheme`, replacing any existing one.
    pub fn register<F>(&mut self, scheme: &str, factory: F)
    where
        F: Fn(&DepotSpec, &str) -> Result<Arc<dyn Depot>> + Send + Sync + 'static,
    {
        self.factories.insert(scheme.to_string(), Box::new(factory));
    }

    pub fn schemes(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Build the depot described by `spec`.
    pub fn open(&self, spec: &DepotSpec) -> Result<Arc<dyn Depot>> {
        let (scheme, location) = spec.parts()?;
        let factory = self
            .factories
            .get(scheme)
            .ok_or_else(|| Error::UnknownDepotScheme {
                scheme: scheme.to_string(),
            })?;

        let depot = factory(spec, location)?;
        tracing::debug!(depot = %depot.describe(), "opened depot");
        Ok(depot)
    }
}

impl std::fmt::Debug for DepotRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DepotRegistry")
            .field("schemes", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_spec_parts() {
        let spec = DepotSpec::new("file:///srv/depot");
        assert_eq!(spec.parts().unwrap(), ("file", "/srv/depot"));

        assert!(DepotSpec::new("/srv/depot").parts().is_err());
        assert!(DepotSpec::new("://x").parts().is_err());
        assert!(DepotSpec::new("s 3://bucket").parts().is_err());
    }

    #[test]
    fn test_registry_opens_builtins() {
        let temp_dir = TempDir::new().unwrap();
        let registry = DepotRegistry::with_builtins();

        let url = format!("file://{}", temp_dir.path().join("depot").display());
        let depot = registry.open(&DepotSpec::new(url)).unwrap();
        assert!(depot.describe().starts_with("file://"));

        let depot = registry.open(&DepotSpec::new("memory://scratch")).unwrap();
        assert_eq!(depot.describe(), "memory://scratch");
    }

    #[test]
    fn test_registry_unknown_scheme() {
        let registry = DepotRegistry::with_builtins();
        let result = registry.open(&DepotSpec::new("s3://bucket/prefix"));
        assert!(matches!(result, Err(Error::UnknownDepotScheme { scheme }) if scheme == "s3"));
    }

    #[test]
    fn test_registry_custom_driver() {
        let mut registry = DepotRegistry::empty();
        registry.register("mem2", |_spec, location| {
            Ok(Arc::new(MemoryDepot::named(location)) as Arc<dyn Depot>)
        });
        assert_eq!(registry.schemes().collect::<Vec<_>>(), vec!["mem2"]);
        assert!(registry.open(&DepotSpec::new("mem2://x")).is_ok());
        assert!(registry.open(&DepotSpec::new("memory://x")).is_err());
    }

    #[test]
    fn test_depot_error_conversion() {
        let hash = ContentHash::hash_bytes(b"x");
        let err: Error = DepotError::not_found(&hash).into();
        assert!(matches!(err, Error::DepotMissingObject { .. }));

        let err: Error = DepotError::unavailable("503").into();
        assert!(err.is_retryable());

        let err: Error = DepotError::Timeout { seconds: 3 }.into();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_object_key() {
        let hash = ContentHash::hash_bytes(b"WORM123");
        assert_eq!(object_key(&hash), format!("objects/{}", hash));
    }
}
