//! Disk-backed bundle index.
//!
//! Plain-file layout under the index root:
//!
//! ```text
//! bookmarks/<name>   one line: hex node (names may contain `/`)
//! nodes/<hex node>   one line: bundle handle
//! index.lock         flock target for exclusive acquisition
//! ```
//!
//! Bookmark files are written via temp file + rename so a reader never
//! sees a half-written node.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, ServerError};
use crate::index::{acquire_lock, BundleIndex, IndexLock};
use crate::node::Node;

#[derive(Debug)]
pub struct DiskIndex {
    root: PathBuf,
    lock_timeout: Duration,
}

impl DiskIndex {
    /// Format version
    const FORMAT_VERSION: &'static str = "v1";

    pub fn new(root: impl Into<PathBuf>, lock_timeout: Duration) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("bookmarks"))?;
        fs::create_dir_all(root.join("nodes"))?;

        let marker = root.join("FORMAT");
        if !marker.exists() {
            let created = chrono::Utc::now().to_rfc3339();
            fs::write(
                &marker,
                format!(
                    "# scratchpush index {}\n# created: {}\n",
                    Self::FORMAT_VERSION,
                    created
                ),
            )?;
        }
        Ok(Self { root, lock_timeout })
    }

    fn bookmark_path(&self, name: &str) -> Result<PathBuf> {
        validate_bookmark_name(name)?;
        Ok(self.root.join("bookmarks").join(name))
    }

    fn node_path(&self, node: Node) -> PathBuf {
        self.root.join("nodes").join(node.to_hex())
    }

    fn write_atomic(path: &Path, content: &str) -> Result<()> {
        let dir = path.parent().expect("index entry has a parent");
        fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.flush()?;
        tmp.persist(path)
            .map_err(|e| ServerError::Index(format!("cannot persist {}: {}", path.display(), e)))?;
        Ok(())
    }

    fn collect_bookmarks(
        &self,
        dir: &Path,
        prefix: &str,
        out: &mut BTreeMap<String, Node>,
    ) -> Result<()> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            let full = if prefix.is_empty() {
                name
            } else {
                format!("{}/{}", prefix, name)
            };
            if entry.file_type()?.is_dir() {
                self.collect_bookmarks(&path, &full, out)?;
            } else {
                let text = fs::read_to_string(&path)?;
                out.insert(full, Node::from_hex(text.trim())?);
            }
        }
        Ok(())
    }
}

/// Bookmark names become filesystem paths; refuse anything that could
/// escape the bookmarks directory.
fn validate_bookmark_name(name: &str) -> Result<()> {
    if name.is_empty() || name.starts_with('/') || name.ends_with('/') {
        return Err(ServerError::Index(format!("invalid bookmark name {:?}", name)));
    }
    for segment in name.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(ServerError::Index(format!("invalid bookmark name {:?}", name)));
        }
    }
    Ok(())
}

impl BundleIndex for DiskIndex {
    fn get_node(&self, bookmark: &str) -> Result<Option<Node>> {
        let path = self.bookmark_path(bookmark)?;
        match fs::read_to_string(&path) {
            Ok(text) => Ok(Some(Node::from_hex(text.trim())?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn get_bundle(&self, node: Node) -> Result<Option<String>> {
        match fs::read_to_string(self.node_path(node)) {
            Ok(text) => Ok(Some(text.trim().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn add_bundle(&self, handle: &str, nodes: &[Node]) -> Result<()> {
        for node in nodes {
            Self::write_atomic(&self.node_path(*node), handle)?;
        }
        Ok(())
    }

    fn add_bookmark(&self, name: &str, node: Node) -> Result<()> {
        Self::write_atomic(&self.bookmark_path(name)?, &node.to_hex())
    }

    fn delete_bookmarks(&self, names: &[String]) -> Result<()> {
        for name in names {
            let path = self.bookmark_path(name)?;
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn add_many_bookmarks(&self, bookmarks: &BTreeMap<String, Node>) -> Result<()> {
        for (name, node) in bookmarks {
            self.add_bookmark(name, *node)?;
        }
        Ok(())
    }

    fn get_bookmarks(&self, pattern: &str) -> Result<BTreeMap<String, Node>> {
        let mut out = BTreeMap::new();
        if let Some(prefix) = pattern.strip_suffix('*') {
            let mut all = BTreeMap::new();
            self.collect_bookmarks(&self.root.join("bookmarks"), "", &mut all)?;
            out.extend(all.into_iter().filter(|(name, _)| name.starts_with(prefix)));
        } else if let Some(node) = self.get_node(pattern)? {
            out.insert(pattern.to_string(), node);
        }
        Ok(out)
    }

    fn lock(&self) -> Result<IndexLock> {
        acquire_lock(&self.root.join("index.lock"), self.lock_timeout)
    }
}
