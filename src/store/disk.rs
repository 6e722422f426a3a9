//! Disk-backed bundle store.
//!
//! Content-addressed: the handle is the blake3 hex digest of the blob,
//! sharded two levels deep (`ab/cd/abcd...`) to keep directories small.
//! Writes go through a temp file in the same directory followed by a
//! rename, so a crashed writer never leaves a partial blob under a
//! valid handle and concurrent writers of identical content converge on
//! the same file.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Result, ServerError};
use crate::store::BundleStore;

#[derive(Debug)]
pub struct DiskStore {
    root: PathBuf,
}

impl DiskStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn blob_path(&self, handle: &str) -> Result<PathBuf> {
        if handle.len() < 4 || !handle.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ServerError::Store(format!("malformed handle {:?}", handle)));
        }
        Ok(self
            .root
            .join(&handle[0..2])
            .join(&handle[2..4])
            .join(handle))
    }
}

impl BundleStore for DiskStore {
    fn write(&self, data: &[u8]) -> Result<String> {
        let handle = blake3::hash(data).to_hex().to_string();
        let path = self.blob_path(&handle)?;
        if path.exists() {
            // Same content, same handle.
            return Ok(handle);
        }

        let dir = path.parent().expect("blob path has a parent");
        fs::create_dir_all(dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(data)?;
        tmp.flush()?;
        tmp.persist(&path)
            .map_err(|e| ServerError::Store(format!("cannot persist blob {}: {}", handle, e)))?;
        Ok(handle)
    }

    fn read(&self, handle: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(handle)?;
        match fs::read(&path) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ServerError::StoreNotFound(handle.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl DiskStore {
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_read_roundtrip() {
        let temp = TempDir::new().unwrap();
        let store = DiskStore::new(temp.path()).unwrap();
        let handle = store.write(b"bundle bytes").unwrap();
        assert_eq!(store.read(&handle).unwrap(), b"bundle bytes");
    }

    #[test]
    fn test_identical_content_same_handle() {
        let temp = TempDir::new().unwrap();
        let store = DiskStore::new(temp.path()).unwrap();
        let h1 = store.write(b"same").unwrap();
        let h2 = store.write(b"same").unwrap();
        assert_eq!(h1, h2);
    }

    #[test]
    fn test_distinct_content_distinct_handles() {
        let temp = TempDir::new().unwrap();
        let store = DiskStore::new(temp.path()).unwrap();
        assert_ne!(store.write(b"a").unwrap(), store.write(b"b").unwrap());
    }

    #[test]
    fn test_unknown_handle_not_found() {
        let temp = TempDir::new().unwrap();
        let store = DiskStore::new(temp.path()).unwrap();
        let err = store.read(&"ab".repeat(32)).unwrap_err();
        assert!(matches!(err, ServerError::StoreNotFound(_)));
    }

    #[test]
    fn test_malformed_handle_rejected() {
        let temp = TempDir::new().unwrap();
        let store = DiskStore::new(temp.path()).unwrap();
        assert!(store.read("../../etc/passwd").is_err());
        assert!(store.read("ab").is_err());
    }

    #[test]
    fn test_sharded_layout() {
        let temp = TempDir::new().unwrap();
        let store = DiskStore::new(temp.path()).unwrap();
        let handle = store.write(b"sharded").unwrap();
        let expected = temp
            .path()
            .join(&handle[0..2])
            .join(&handle[2..4])
            .join(&handle);
        assert!(expected.exists());
    }
}
