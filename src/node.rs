//! Node identifiers.
//!
//! A node is a 20-byte changeset hash, rendered as 40 hex characters on
//! the wire and in index files.

use std::fmt;
use std::str::FromStr;

use crate::error::{Result, ServerError};

pub const NODE_LEN: usize = 20;

/// The null node: parent slot that points at nothing.
pub const NULL_NODE: Node = Node([0u8; NODE_LEN]);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Node(pub [u8; NODE_LEN]);

impl Node {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != NODE_LEN {
            return Err(ServerError::Protocol(format!(
                "node must be {} bytes, got {}",
                NODE_LEN,
                bytes.len()
            )));
        }
        let mut buf = [0u8; NODE_LEN];
        buf.copy_from_slice(bytes);
        Ok(Node(buf))
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)
            .map_err(|e| ServerError::Protocol(format!("invalid node {:?}: {}", s, e)))?;
        Self::from_bytes(&bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn is_null(&self) -> bool {
        *self == NULL_NODE
    }

    pub fn as_bytes(&self) -> &[u8; NODE_LEN] {
        &self.0
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for Node {
    type Err = ServerError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}
