//! Bundle indexes.
//!
//! The index is the only mutable resource shared across concurrent
//! pushes. It maps bookmark names to nodes and nodes to the handle of
//! the bundle containing them; it never stores bundle bytes. All
//! mutation for one push happens inside a single scoped exclusive
//! acquisition ([`BundleIndex::lock`]) so two pushes never interleave
//! their bookmark and bundle-association updates.

pub mod db;
pub mod disk;

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::time::{Duration, Instant};

use fs2::FileExt;

use crate::config::IndexConfig;
use crate::error::{Result, ServerError};
use crate::node::Node;

pub use db::DbIndex;
pub use disk::DiskIndex;

pub trait BundleIndex: Send + Sync + std::fmt::Debug {
    /// Current node of a bookmark, if it exists.
    fn get_node(&self, bookmark: &str) -> Result<Option<Node>>;

    /// Handle of a bundle containing the node, if any bundle does.
    fn get_bundle(&self, node: Node) -> Result<Option<String>>;

    /// Associate a freshly written bundle with every node it contains.
    fn add_bundle(&self, handle: &str, nodes: &[Node]) -> Result<()>;

    fn add_bookmark(&self, name: &str, node: Node) -> Result<()>;

    fn delete_bookmarks(&self, names: &[String]) -> Result<()>;

    fn add_many_bookmarks(&self, bookmarks: &BTreeMap<String, Node>) -> Result<()>;

    /// Bookmarks matching a literal name or trailing-`*` prefix.
    fn get_bookmarks(&self, pattern: &str) -> Result<BTreeMap<String, Node>>;

    /// Acquire the index exclusively. Held for the duration of one
    /// push's mutations; released on drop, on every exit path.
    fn lock(&self) -> Result<IndexLock>;
}

/// Exclusive hold on an index. The underlying file lock releases when
/// this guard drops.
pub struct IndexLock {
    file: File,
}

impl Drop for IndexLock {
    fn drop(&mut self) {
        // Dropping the file would unlock anyway; unlock explicitly so
        // failures are at least observable in logs.
        if let Err(e) = fs2::FileExt::unlock(&self.file) {
            tracing::warn!(error = %e, "failed to release index lock");
        }
    }
}

/// Take an exclusive flock on `path`, waiting up to `timeout` for a
/// competing push to finish.
pub(crate) fn acquire_lock(path: &Path, timeout: Duration) -> Result<IndexLock> {
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)?;

    let start = Instant::now();
    loop {
        match file.try_lock_exclusive() {
            Ok(()) => return Ok(IndexLock { file }),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                if start.elapsed() >= timeout {
                    return Err(ServerError::Index(format!(
                        "timed out after {:?} waiting for index lock {}",
                        timeout,
                        path.display()
                    )));
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Select the index backend once at startup from its config tag.
pub fn build_index(config: &IndexConfig) -> Result<Box<dyn BundleIndex>> {
    let path = config.path.clone().ok_or_else(|| {
        ServerError::Config("index.path is required".to_string())
    })?;
    let timeout = Duration::from_secs(config.lock_timeout_secs);
    match config.kind.as_str() {
        "disk" => Ok(Box::new(DiskIndex::new(path, timeout)?)),
        "db" => Ok(Box::new(DbIndex::new(path, timeout)?)),
        other => Err(ServerError::Config(format!(
            "unknown index type specified {:?}",
            other
        ))),
    }
}
