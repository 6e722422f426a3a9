//! Bundle blob stores.
//!
//! A store persists opaque bundle bytes and hands back an opaque handle.
//! Stores are append-only: handles are derived from content or assigned
//! uniquely by the backend, so concurrent writers never collide and a
//! written blob is never updated in place.

pub mod disk;
pub mod external;

use crate::config::StoreConfig;
use crate::error::{Result, ServerError};

pub use disk::DiskStore;
pub use external::ExternalStore;

pub trait BundleStore: Send + Sync + std::fmt::Debug {
    /// Persist a blob, returning its handle. Safe to call concurrently.
    fn write(&self, data: &[u8]) -> Result<String>;

    /// Fetch a previously written blob. Unknown handles are
    /// `ServerError::StoreNotFound`.
    fn read(&self, handle: &str) -> Result<Vec<u8>>;
}

/// The configured store/index pair a server holds for its lifetime.
pub struct BundleStorage {
    pub store: Box<dyn BundleStore>,
    pub index: Box<dyn crate::index::BundleIndex>,
}

impl BundleStorage {
    pub fn from_config(config: &crate::config::Config) -> Result<Self> {
        Ok(Self {
            store: build_store(&config.store)?,
            index: crate::index::build_index(&config.index)?,
        })
    }
}

/// Select the store backend once at startup from its config tag.
pub fn build_store(config: &StoreConfig) -> Result<Box<dyn BundleStore>> {
    match config.kind.as_str() {
        "disk" => {
            let path = config.path.clone().ok_or_else(|| {
                ServerError::Config("store.path is required for the disk store".to_string())
            })?;
            Ok(Box::new(DiskStore::new(path)?))
        }
        "external" => Ok(Box::new(ExternalStore::from_config(config)?)),
        other => Err(ServerError::Config(format!(
            "unknown store type specified {:?}",
            other
        ))),
    }
}
