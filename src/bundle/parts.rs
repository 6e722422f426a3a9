//! Part types and payload schemas used by the push pipeline.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::bundle::Part;
use crate::error::{Result, ServerError};

/// Mandatory part carrying a changegroup destined for the bundle store.
/// Uppercase: a server without scratch storage must reject the push.
pub const PART_SCRATCH_BRANCH: &str = "SCRATCHBRANCH";

/// Advisory part carrying bookmark updates, applied after storage.
pub const PART_SCRATCH_BOOKMARKS: &str = "scratchbookmarks";

pub const PART_REPLY_CAPS: &str = "replycaps";
pub const PART_CHANGEGROUP: &str = "changegroup";
pub const PART_PUSHKEY: &str = "pushkey";
pub const PART_PHASE_HEADS: &str = "phase-heads";
pub const PART_REPLY_PUSHKEY: &str = "reply:pushkey";

/// Reply part reporting a failed push: `message` and optional `hint`.
pub const PART_ERROR_ABORT: &str = "error:abort";

/// Part types always forwarded into the stored bundle even when the
/// server is not storing all parts. Tree manifest groups travel with
/// their changegroup.
pub const PART_FORWARDING_WHITELIST: &[&str] = &["treegroup2"];

/// Parameters of a scratch-branch part.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScratchBranchParams {
    pub bookmark: Option<String>,
    pub book_prev_node: Option<String>,
    pub create: bool,
    pub force: bool,
    pub cg_version: String,
    pub pushback_bookmarks: bool,
}

impl ScratchBranchParams {
    pub fn from_part(part: &Part) -> Self {
        Self {
            bookmark: part.param("bookmark").map(str::to_string),
            book_prev_node: part.param("bookprevnode").map(str::to_string),
            create: part.param("create").is_some(),
            force: part.param("force").is_some(),
            cg_version: part.param("cgversion").unwrap_or("02").to_string(),
            pushback_bookmarks: part.param("pushbackbookmarks").is_some(),
        }
    }

    pub fn apply_to(&self, mut part: Part) -> Part {
        if let Some(bookmark) = &self.bookmark {
            part = part.with_param("bookmark", bookmark.clone());
            part = part.with_param(
                "bookprevnode",
                self.book_prev_node.clone().unwrap_or_default(),
            );
        }
        if self.create {
            part = part.with_param("create", "1");
        }
        if self.force {
            part = part.with_param("force", "1");
        }
        if self.pushback_bookmarks {
            part = part.with_param("pushbackbookmarks", "1");
        }
        part.with_param("cgversion", self.cg_version.clone())
    }
}

/// Scratch-bookmarks part payload: u32-be JSON length then a JSON object
/// mapping bookmark name to hex node. An empty node deletes the
/// bookmark.
pub fn encode_bookmarks(bookmarks: &BTreeMap<String, String>) -> Result<Bytes> {
    let json = serde_json::to_vec(bookmarks)?;
    let mut buf = BytesMut::with_capacity(4 + json.len());
    buf.put_u32(json.len() as u32);
    buf.put_slice(&json);
    Ok(buf.freeze())
}

pub fn decode_bookmarks(mut payload: Bytes) -> Result<BTreeMap<String, String>> {
    if payload.remaining() < 4 {
        return Err(ServerError::Protocol(
            "scratch bookmarks payload too short".to_string(),
        ));
    }
    let size = payload.get_u32() as usize;
    if payload.remaining() < size {
        return Err(ServerError::Protocol(format!(
            "scratch bookmarks payload truncated: wants {} bytes, {} left",
            size,
            payload.remaining()
        )));
    }
    let json = payload.copy_to_bytes(size);
    Ok(serde_json::from_slice(&json)?)
}
