//! Bundle storage step of a scratch push.
//!
//! Ordering matters here: the blob is written to the store before any
//! index mutation. An orphaned blob with no index entry is harmless;
//! an index entry pointing at a missing blob is not. Every index
//! mutation for one push happens under a single exclusive acquisition.

use std::path::Path;
use std::time::Instant;

use crate::bundle::parts::{ScratchBranchParams, PART_CHANGEGROUP, PART_PUSHKEY};
use crate::bundle::{Part, PartIterator};
use crate::changegroup::Changegroup;
use crate::error::{Result, ServerError};
use crate::node::Node;
use crate::push::{log_service_call, PushOperation};
use crate::store::BundleStorage;

/// Extract the changegroup from a serialized bundle file.
fn read_bundle_changegroup(bundle_file: &Path) -> Result<Changegroup> {
    let data = std::fs::read(bundle_file)?;
    let mut parts = PartIterator::new(data.into())?;
    while let Some(part) = parts.next_part()? {
        if part.kind() == PART_CHANGEGROUP {
            return Changegroup::parse(part.payload);
        }
    }
    Err(ServerError::abort_with_hint(
        "unexpected bundle without changegroup part",
        "report to administrator",
    ))
}

/// Validate the pushed revision set against the bookmark's current
/// position: new bookmark, fast-forward, or explicitly forced.
fn check_fast_forward(
    cg: &Changegroup,
    old_node: Option<Node>,
    force: bool,
) -> Result<()> {
    let old = match old_node {
        None => return Ok(()),
        Some(old) => old,
    };
    if cg.contains(old) && cg.descends_from(old) {
        return Ok(());
    }
    if force {
        return Ok(());
    }
    Err(ServerError::abort_with_hint(
        "non-forward push",
        "use --non-forward-move to override",
    ))
}

/// Store a pushed bundle and update the index.
///
/// `bundle_file` holds the serialized bundle assembled by the part
/// processor. The caller owns the file's lifetime; it is removed on
/// every exit path regardless of what happens here.
pub fn store_bundle(
    op: &mut PushOperation,
    storage: &BundleStorage,
    params: &ScratchBranchParams,
    bundle_file: &Path,
    size_limit: u64,
) -> Result<()> {
    let start = Instant::now();
    tracing::info!(service = "scratchbranch", event = "start");

    let result = store_bundle_inner(op, storage, params, bundle_file, size_limit);
    match &result {
        Ok(()) => tracing::info!(
            service = "scratchbranch",
            event = "success",
            elapsed_ms = start.elapsed().as_millis() as u64
        ),
        Err(e) => tracing::warn!(
            service = "scratchbranch",
            event = "failure",
            elapsed_ms = start.elapsed().as_millis() as u64,
            error = %e
        ),
    }
    result
}

fn store_bundle_inner(
    op: &mut PushOperation,
    storage: &BundleStorage,
    params: &ScratchBranchParams,
    bundle_file: &Path,
    size_limit: u64,
) -> Result<()> {
    let index = storage.index.as_ref();
    let store = storage.store.as_ref();

    // Bookmark updates are handled right here; the pushkey handler
    // later in this push must not re-apply them.
    op.skip_pushkey = true;

    let cg = read_bundle_changegroup(bundle_file)?;
    let heads = cg.heads();

    let bookmark = params.bookmark.as_deref();
    let old_node = match bookmark {
        Some(name) => {
            let old = index.get_node(name)?;
            if old.is_none() && !params.create {
                return Err(ServerError::abort_with_hint(
                    format!("unknown bookmark {}", name),
                    "use --create if you want to create one",
                ));
            }
            old
        }
        None => None,
    };

    if bookmark.is_some() && heads.len() > 1 {
        return Err(ServerError::abort(
            "cannot push more than one head to a scratch branch",
        ));
    }

    check_fast_forward(&cg, old_node, params.force)?;

    let nodes = cg.nodes();
    tracing::info!(
        count = nodes.len(),
        "pushing {} commit{}",
        nodes.len(),
        if nodes.len() == 1 { "" } else { "s" }
    );

    let mut new_heads = 0usize;
    for head in &heads {
        if index.get_bundle(*head)?.is_none() {
            new_heads += 1;
        }
    }

    // With a bookmark there is exactly one head, which is the last
    // node. Should a defective client smuggle several heads through
    // anonymously, the bookmark still lands on the last pushed node.
    let bookmark_node = nodes.last().copied();

    let mut handle = None;
    if new_heads > 0 {
        let data = std::fs::read(bundle_file)?;
        handle = Some(log_service_call("bundlestore", || {
            if data.len() as u64 > size_limit {
                return Err(ServerError::abort(format!(
                    "bundle is too big: {} bytes. max allowed size is {} MB",
                    data.len(),
                    size_limit / (1024 * 1024)
                )));
            }
            store.write(&data)
        })?);
    }

    // Blob is durable; now mutate the index, exclusively.
    log_service_call("index", || {
        let _lock = index.lock()?;
        if let Some(handle) = &handle {
            index.add_bundle(handle, &nodes)?;
        }
        if let (Some(name), Some(node)) = (bookmark, bookmark_node) {
            index.add_bookmark(name, node)?;
            maybe_add_pushback_part(op, params, name, node);
        }
        Ok(())
    })
}

/// Queue a pushkey reply telling the client where its bookmark landed.
fn maybe_add_pushback_part(
    op: &mut PushOperation,
    params: &ScratchBranchParams,
    bookmark: &str,
    node: Node,
) {
    if !params.pushback_bookmarks || !op.can_push_back() {
        return;
    }
    let part = Part::new(PART_PUSHKEY, bytes::Bytes::new())
        .with_param("namespace", "bookmarks")
        .with_param("key", bookmark)
        .with_param("old", params.book_prev_node.clone().unwrap_or_default())
        .with_param("new", node.to_hex());
    if let Some(reply) = op.reply.as_mut() {
        reply.add_part(part);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::parts::PART_CHANGEGROUP;
    use crate::bundle::Bundler;
    use crate::changegroup::testutil::{chain, node};
    use crate::config::{IndexConfig, StoreConfig};
    use crate::store::{build_store, BundleStorage};
    use std::io::Write;
    use tempfile::TempDir;

    fn storage(temp: &TempDir) -> BundleStorage {
        let store_config = StoreConfig {
            kind: "disk".to_string(),
            path: Some(temp.path().join("store")),
            ..Default::default()
        };
        let index_config = IndexConfig {
            kind: "disk".to_string(),
            path: Some(temp.path().join("index")),
            lock_timeout_secs: 2,
        };
        BundleStorage {
            store: build_store(&store_config).unwrap(),
            index: crate::index::build_index(&index_config).unwrap(),
        }
    }

    fn write_bundle(temp: &TempDir, cg: &Changegroup) -> std::path::PathBuf {
        let mut bundler = Bundler::new();
        bundler.add_part(
            Part::new(PART_CHANGEGROUP, cg.encode()).with_param("version", "02"),
        );
        let path = temp.path().join("bundle.tmp");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(&bundler.encode()).unwrap();
        path
    }

    fn params(bookmark: &str) -> ScratchBranchParams {
        ScratchBranchParams {
            bookmark: Some(bookmark.to_string()),
            create: true,
            cg_version: "02".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_store_and_index_association() {
        let temp = TempDir::new().unwrap();
        let storage = storage(&temp);
        let cg = chain(3, None);
        let bundle = write_bundle(&temp, &cg);

        let mut op = PushOperation::new();
        store_bundle(&mut op, &storage, &params("scratch/f"), &bundle, 1 << 20).unwrap();

        assert_eq!(
            storage.index.get_node("scratch/f").unwrap(),
            Some(node(3))
        );
        let stored_bytes = std::fs::read(&bundle).unwrap();
        for n in cg.nodes() {
            let handle = storage.index.get_bundle(n).unwrap().expect("node indexed");
            assert_eq!(storage.store.read(&handle).unwrap(), stored_bytes);
        }
        assert!(op.skip_pushkey);
    }

    #[test]
    fn test_unknown_bookmark_without_create() {
        let temp = TempDir::new().unwrap();
        let storage = storage(&temp);
        let bundle = write_bundle(&temp, &chain(1, None));

        let params = ScratchBranchParams {
            bookmark: Some("scratch/nope".to_string()),
            create: false,
            cg_version: "02".to_string(),
            ..Default::default()
        };
        let err =
            store_bundle(&mut PushOperation::new(), &storage, &params, &bundle, 1 << 20)
                .unwrap_err();
        assert!(err.user_message().contains("unknown bookmark scratch/nope"));
        assert!(err.user_message().contains("--create"));
    }

    #[test]
    fn test_multiple_heads_with_bookmark_rejected() {
        let temp = TempDir::new().unwrap();
        let storage = storage(&temp);
        // Two disconnected roots: two heads.
        let cg = Changegroup::new(
            chain(1, None)
                .revisions()
                .iter()
                .cloned()
                .chain(chain(1, None).revisions().iter().map(|r| {
                    let mut r = r.clone();
                    r.node = node(9);
                    r
                }))
                .collect(),
        );
        let bundle = write_bundle(&temp, &cg);
        let err = store_bundle(
            &mut PushOperation::new(),
            &storage,
            &params("scratch/two"),
            &bundle,
            1 << 20,
        )
        .unwrap_err();
        assert!(err
            .user_message()
            .contains("cannot push more than one head to a scratch branch"));
    }

    #[test]
    fn test_fast_forward_then_non_forward_rejected() {
        let temp = TempDir::new().unwrap();
        let storage = storage(&temp);

        // First push creates the bookmark at node(2).
        let first = chain(2, None);
        let bundle = write_bundle(&temp, &first);
        store_bundle(
            &mut PushOperation::new(),
            &storage,
            &params("scratch/ff"),
            &bundle,
            1 << 20,
        )
        .unwrap();
        assert_eq!(storage.index.get_node("scratch/ff").unwrap(), Some(node(2)));

        // Fast-forward: extends node(2) to node(4) and includes it.
        let second = chain(4, None);
        let bundle = write_bundle(&temp, &second);
        let mut update = params("scratch/ff");
        update.create = false;
        store_bundle(&mut PushOperation::new(), &storage, &update, &bundle, 1 << 20).unwrap();
        assert_eq!(storage.index.get_node("scratch/ff").unwrap(), Some(node(4)));

        // A bundle not containing the current node is a non-forward move.
        let unrelated = chain(1, Some(node(9)));
        let bundle = write_bundle(&temp, &unrelated);
        let err = store_bundle(
            &mut PushOperation::new(),
            &storage,
            &update,
            &bundle,
            1 << 20,
        )
        .unwrap_err();
        assert!(err.user_message().contains("non-forward push"));
        assert!(err.user_message().contains("--non-forward-move"));

        // The same push succeeds when forced.
        let mut forced = update.clone();
        forced.force = true;
        store_bundle(&mut PushOperation::new(), &storage, &forced, &bundle, 1 << 20).unwrap();
        assert_eq!(storage.index.get_node("scratch/ff").unwrap(), Some(node(1)));
    }

    #[test]
    fn test_size_limit_enforced_before_write() {
        let temp = TempDir::new().unwrap();
        let storage = storage(&temp);
        let cg = chain(1, None);
        let bundle = write_bundle(&temp, &cg);

        let err = store_bundle(
            &mut PushOperation::new(),
            &storage,
            &params("scratch/big"),
            &bundle,
            8, // far below the bundle size
        )
        .unwrap_err();
        assert!(err.user_message().contains("bundle is too big"));
        // Nothing was stored or indexed.
        assert_eq!(storage.index.get_node("scratch/big").unwrap(), None);
        assert_eq!(storage.index.get_bundle(node(1)).unwrap(), None);
    }

    #[test]
    fn test_already_indexed_heads_skip_blob_write() {
        let temp = TempDir::new().unwrap();
        let storage = storage(&temp);
        let cg = chain(2, None);
        let bundle = write_bundle(&temp, &cg);

        store_bundle(
            &mut PushOperation::new(),
            &storage,
            &params("scratch/a"),
            &bundle,
            1 << 20,
        )
        .unwrap();
        let handle_before = storage.index.get_bundle(node(2)).unwrap().unwrap();

        // Same revisions under another bookmark: head already indexed,
        // so no new blob, but the bookmark still moves.
        store_bundle(
            &mut PushOperation::new(),
            &storage,
            &params("scratch/b"),
            &bundle,
            1 << 20,
        )
        .unwrap();
        assert_eq!(storage.index.get_node("scratch/b").unwrap(), Some(node(2)));
        assert_eq!(
            storage.index.get_bundle(node(2)).unwrap().unwrap(),
            handle_before
        );
    }

    #[test]
    fn test_pushback_part_queued() {
        let temp = TempDir::new().unwrap();
        let storage = storage(&temp);
        let bundle = write_bundle(&temp, &chain(1, None));

        let mut op = PushOperation::new();
        op.reply = Some(Bundler::new());
        op.reply_caps.push("pushback".to_string());

        let mut p = params("scratch/pb");
        p.pushback_bookmarks = true;
        p.book_prev_node = Some(String::new());
        store_bundle(&mut op, &storage, &p, &bundle, 1 << 20).unwrap();

        let reply = op.reply.unwrap();
        assert_eq!(reply.parts().len(), 1);
        let part = &reply.parts()[0];
        assert_eq!(part.part_type, PART_PUSHKEY);
        assert_eq!(part.param("key"), Some("scratch/pb"));
        assert_eq!(part.param("new"), Some(node(1).to_hex().as_str()));
    }

    #[test]
    fn test_bundle_without_changegroup_rejected() {
        let temp = TempDir::new().unwrap();
        let storage = storage(&temp);
        let bundler = Bundler::new();
        let path = temp.path().join("empty.tmp");
        std::fs::write(&path, bundler.encode()).unwrap();

        let err = store_bundle(
            &mut PushOperation::new(),
            &storage,
            &params("scratch/x"),
            &path,
            1 << 20,
        )
        .unwrap_err();
        assert!(err
            .user_message()
            .contains("unexpected bundle without changegroup part"));
    }
}
