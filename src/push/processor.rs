//! Part demultiplexer for incoming pushes.
//!
//! Walks the parts of one push container and decides, per part, whether
//! to buffer it into the bundle headed for storage, handle it in place,
//! or both. Scratch-branch parts become plain changegroup parts inside
//! the stored bundle; scratch-bookmark parts are copied and deferred
//! until the bundle they reference is durable.

use std::collections::BTreeMap;
use std::io::Write;

use bytes::Bytes;

use crate::bundle::parts::{
    decode_bookmarks, ScratchBranchParams, PART_CHANGEGROUP, PART_FORWARDING_WHITELIST,
    PART_PHASE_HEADS, PART_PUSHKEY, PART_REPLY_CAPS, PART_REPLY_PUSHKEY, PART_SCRATCH_BOOKMARKS,
    PART_SCRATCH_BRANCH,
};
use crate::bundle::{Bundler, Part, PartIterator};
use crate::config::ServerConfig;
use crate::error::{Result, ServerError};
use crate::node::Node;
use crate::push::{log_service_call, store_bundle, PushOperation};
use crate::store::BundleStorage;

/// Process every part of a push and run the storage step if commits
/// were sent. Returns the reply container to stream back to the client
/// (empty when the client cannot receive replies).
pub fn process_parts(
    storage: &BundleStorage,
    config: &ServerConfig,
    bundle: Bytes,
) -> Result<Bundler> {
    let mut op = PushOperation::new();
    let mut parts = PartIterator::new(bundle)?;

    let handle_all_parts = config.store_all_parts;
    let mut bundler = Bundler::new();
    let mut cg_params: Option<ScratchBranchParams> = None;
    let mut scratch_book_payload: Option<Bytes> = None;

    while let Some(part) = parts.next_part()? {
        let mut bundle_part: Option<Part> = None;
        match part.kind().as_str() {
            // Configures whether replies are possible for the rest of
            // the operation; handled immediately.
            kind if kind == PART_REPLY_CAPS => {
                op.reply_caps = serde_json::from_slice(&part.payload).unwrap_or_default();
                op.reply = Some(Bundler::new());
            }
            kind if kind == PART_SCRATCH_BRANCH.to_ascii_lowercase() => {
                // Rewrap as a plain changegroup for storage; keep the
                // parameters for the storage step.
                let params = ScratchBranchParams::from_part(&part);
                bundle_part = Some(
                    Part::new(PART_CHANGEGROUP, part.payload.clone())
                        .with_param("version", params.cg_version.clone()),
                );
                if !handle_all_parts {
                    // The storage step covers bookmark and phase
                    // updates; the stock handlers must stand down.
                    op.skip_pushkey = true;
                    op.skip_phaseheads = true;
                }
                cg_params = Some(params);
            }
            kind if kind == PART_SCRATCH_BOOKMARKS => {
                // The part stream cannot be re-read later, so keep our
                // own copy. Processing waits until the bundle is
                // stored: these bookmarks may point at nodes that are
                // only durable after the storage step.
                scratch_book_payload = Some(part.payload.clone());
            }
            _ => {
                if handle_all_parts
                    || PART_FORWARDING_WHITELIST.contains(&part.kind().as_str())
                {
                    // Forward verbatim into the stored bundle. Parts
                    // that expect an answer still get one.
                    if part.kind() == PART_PUSHKEY {
                        add_pushkey_reply(&mut op, &part);
                    }
                    bundle_part = Some(part.clone());
                } else {
                    handle_part_inline(&mut op, storage, &part)?;
                }
            }
        }

        if let Some(p) = bundle_part {
            bundler.add_part(p);
        }
    }

    // If commits were sent, store them.
    if let Some(params) = cg_params {
        let mut tmp = tempfile::NamedTempFile::new()?;
        tmp.write_all(&bundler.encode())?;
        tmp.flush()?;
        let result = store_bundle(
            &mut op,
            storage,
            &params,
            tmp.path(),
            config.bundle_size_limit,
        );
        // The bundle file goes away on every exit path; a failed
        // removal is logged, never escalated over the push result.
        if let Err(e) = tmp.close() {
            tracing::warn!(error = %e, "failed to remove temporary bundle file");
        }
        result?;
    }

    // Deferred: bookmark updates arriving alongside the bundle, applied
    // once the nodes they reference are in the store.
    if let Some(payload) = scratch_book_payload {
        process_scratch_bookmarks(storage, payload)?;
    }

    Ok(op.reply.take().unwrap_or_default())
}

/// Default handling for parts the push does not forward to storage.
fn handle_part_inline(
    op: &mut PushOperation,
    storage: &BundleStorage,
    part: &Part,
) -> Result<()> {
    match part.kind().as_str() {
        kind if kind == PART_PUSHKEY => {
            if !op.skip_pushkey {
                apply_pushkey(storage, part)?;
            }
            add_pushkey_reply(op, part);
            Ok(())
        }
        kind if kind == PART_PHASE_HEADS => {
            // Phases of scratch commits are managed by the storage
            // step; there is nothing to apply here either way.
            let _ = op.skip_phaseheads;
            Ok(())
        }
        _ if part.is_mandatory() => Err(ServerError::abort(format!(
            "missing support for {}",
            part.part_type
        ))),
        _ => Ok(()), // unknown advisory parts are skipped
    }
}

/// A pushkey part in the bookmarks namespace moves or deletes a
/// bookmark directly.
fn apply_pushkey(storage: &BundleStorage, part: &Part) -> Result<()> {
    if part.param("namespace") != Some("bookmarks") {
        return Ok(());
    }
    let key = part
        .param("key")
        .ok_or_else(|| ServerError::Protocol("pushkey part without key".to_string()))?;
    match part.param("new") {
        Some(new) if !new.is_empty() => {
            storage.index.add_bookmark(key, Node::from_hex(new)?)
        }
        _ => storage.index.delete_bookmarks(&[key.to_string()]),
    }
}

fn add_pushkey_reply(op: &mut PushOperation, part: &Part) {
    let id = part.id;
    if let Some(reply) = op.reply.as_mut() {
        reply.add_part(
            Part::new(PART_REPLY_PUSHKEY, Bytes::new())
                .with_param("in-reply-to", id.to_string())
                .with_param("return", "1"),
        );
    }
}

/// Deletions first, then inserts, all under one exclusive acquisition.
fn process_scratch_bookmarks(storage: &BundleStorage, payload: Bytes) -> Result<()> {
    let decoded = decode_bookmarks(payload)?;
    let mut to_insert = BTreeMap::new();
    let mut to_delete = Vec::new();
    for (bookmark, node) in decoded {
        if node.is_empty() {
            to_delete.push(bookmark);
        } else {
            to_insert.insert(bookmark, Node::from_hex(&node)?);
        }
    }
    log_service_call("scratchbookmarks", || {
        let _lock = storage.index.lock()?;
        if !to_delete.is_empty() {
            storage.index.delete_bookmarks(&to_delete)?;
        }
        if !to_insert.is_empty() {
            storage.index.add_many_bookmarks(&to_insert)?;
        }
        Ok(())
    })
}
