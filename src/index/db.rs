//! Database-backed bundle index.
//!
//! Keeps the same contract as the disk index on top of an embedded
//! fjall keyspace: a `bookmarks` partition (name -> hex node) and a
//! `nodes` partition (hex node -> handle). Prefix scans back the
//! trailing-`*` pattern queries. Exclusive acquisition reuses the same
//! flock protocol as the disk index so mixed deployments contend on a
//! file either way.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};

use crate::error::{Result, ServerError};
use crate::index::{acquire_lock, BundleIndex, IndexLock};
use crate::node::Node;

pub struct DbIndex {
    root: PathBuf,
    keyspace: Keyspace,
    bookmarks: PartitionHandle,
    nodes: PartitionHandle,
    lock_timeout: Duration,
}

impl std::fmt::Debug for DbIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbIndex")
            .field("root", &self.root)
            .field("lock_timeout", &self.lock_timeout)
            .finish_non_exhaustive()
    }
}

fn db_err(e: impl std::fmt::Display) -> ServerError {
    ServerError::Index(format!("index database: {}", e))
}

impl DbIndex {
    pub fn new(root: impl Into<PathBuf>, lock_timeout: Duration) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        let keyspace = fjall::Config::new(root.join("db")).open().map_err(db_err)?;
        let bookmarks = keyspace
            .open_partition("bookmarks", PartitionCreateOptions::default())
            .map_err(db_err)?;
        let nodes = keyspace
            .open_partition("nodes", PartitionCreateOptions::default())
            .map_err(db_err)?;
        Ok(Self {
            root,
            keyspace,
            bookmarks,
            nodes,
            lock_timeout,
        })
    }

    fn persist(&self) -> Result<()> {
        self.keyspace
            .persist(PersistMode::SyncAll)
            .map_err(db_err)
    }
}

impl BundleIndex for DbIndex {
    fn get_node(&self, bookmark: &str) -> Result<Option<Node>> {
        match self.bookmarks.get(bookmark).map_err(db_err)? {
            Some(value) => Ok(Some(Node::from_hex(
                std::str::from_utf8(&value)
                    .map_err(|_| ServerError::Index("non-UTF8 node in index".to_string()))?,
            )?)),
            None => Ok(None),
        }
    }

    fn get_bundle(&self, node: Node) -> Result<Option<String>> {
        match self.nodes.get(node.to_hex()).map_err(db_err)? {
            Some(value) => Ok(Some(
                std::str::from_utf8(&value)
                    .map_err(|_| ServerError::Index("non-UTF8 handle in index".to_string()))?
                    .to_string(),
            )),
            None => Ok(None),
        }
    }

    fn add_bundle(&self, handle: &str, nodes: &[Node]) -> Result<()> {
        for node in nodes {
            self.nodes.insert(node.to_hex(), handle).map_err(db_err)?;
        }
        self.persist()
    }

    fn add_bookmark(&self, name: &str, node: Node) -> Result<()> {
        self.bookmarks.insert(name, node.to_hex()).map_err(db_err)?;
        self.persist()
    }

    fn delete_bookmarks(&self, names: &[String]) -> Result<()> {
        for name in names {
            self.bookmarks.remove(name.as_str()).map_err(db_err)?;
        }
        self.persist()
    }

    fn add_many_bookmarks(&self, bookmarks: &BTreeMap<String, Node>) -> Result<()> {
        for (name, node) in bookmarks {
            self.bookmarks
                .insert(name.as_str(), node.to_hex())
                .map_err(db_err)?;
        }
        self.persist()
    }

    fn get_bookmarks(&self, pattern: &str) -> Result<BTreeMap<String, Node>> {
        let mut out = BTreeMap::new();
        if let Some(prefix) = pattern.strip_suffix('*') {
            for item in self.bookmarks.prefix(prefix) {
                let (key, value) = item.map_err(db_err)?;
                let name = std::str::from_utf8(&key)
                    .map_err(|_| ServerError::Index("non-UTF8 bookmark in index".to_string()))?
                    .to_string();
                let node = Node::from_hex(
                    std::str::from_utf8(&value)
                        .map_err(|_| ServerError::Index("non-UTF8 node in index".to_string()))?,
                )?;
                out.insert(name, node);
            }
        } else if let Some(node) = self.get_node(pattern)? {
            out.insert(pattern.to_string(), node);
        }
        Ok(out)
    }

    fn lock(&self) -> Result<IndexLock> {
        acquire_lock(&self.root.join("index.lock"), self.lock_timeout)
    }
}
