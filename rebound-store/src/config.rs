use std::sync::Arc;

use serde::Deserialize;

use crate::{
    backends::{FileJobStore, MemoryJobStore},
    store::JobStore,
};

/// Configuration for the job store
///
/// File-backed store in RON config:
/// ```ron
/// Rebound (
///     store: File((
///         path: "/var/lib/rebound/jobs",
///     )),
/// )
/// ```
///
/// Memory-backed store, with an optional capacity:
/// ```ron
/// Rebound (
///     store: Memory((
///         capacity: Some(1000),
///     )),
/// )
/// ```
#[derive(Debug, Clone, Deserialize)]
pub enum StoreConfig {
    /// One file per job (production)
    File(FileJobStore),
    /// In-process only (testing/development)
    Memory(MemoryConfig),
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct MemoryConfig {
    /// Maximum number of jobs to store (omit for unlimited)
    #[serde(default)]
    pub capacity: Option<usize>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::File(FileJobStore::default())
    }
}

impl StoreConfig {
    /// Get the filesystem path for file-backed stores, if applicable
    #[must_use]
    pub fn path(&self) -> Option<&std::path::Path> {
        match self {
            Self::File(store) => Some(store.path()),
            Self::Memory(_) => None,
        }
    }

    /// Initialise the configured backend and return it as a trait object
    ///
    /// # Errors
    /// Returns an error if the file store directory cannot be prepared
    pub fn open(self) -> crate::Result<Arc<dyn JobStore>> {
        match self {
            Self::File(store) => {
                store.init()?;
                Ok(Arc::new(store))
            }
            Self::Memory(config) => {
                let store = config
                    .capacity
                    .map_or_else(MemoryJobStore::new, MemoryJobStore::with_capacity);
                Ok(Arc::new(store))
            }
        }
    }
}
