//! Server mode - runs when invoked as `scratchpush serve <path>`.
//!
//! One connection is one sequential flow of control: read a frame, fold
//! it into the reactor, act. The only suspension points are waiting for
//! the next frame and waiting for the index lock inside the storage
//! step. Command responses stream back as command-data frames.

pub mod watchdog;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use bytes::Bytes;
use tokio::io::{self, AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::bundle::parts::PART_ERROR_ABORT;
use crate::bundle::{Bundler, Part};
use crate::config::{BranchPattern, Config, ServerConfig};
use crate::error::ServerError;
use crate::node::Node;
use crate::push::process_parts;
use crate::store::BundleStorage;
use crate::wire::{
    encode_frame, read_frame, write_frame, Action, DataFlags, FrameType, Reactor,
    DEFAULT_MAX_FRAME_SIZE,
};

use watchdog::{ActivityTracker, Watchdog};

/// Everything a connection needs, built once at startup.
pub struct ServerContext {
    pub storage: BundleStorage,
    pub config: ServerConfig,
    pattern: BranchPattern,
    activity: Arc<ActivityTracker>,
}

impl ServerContext {
    pub fn new(storage: BundleStorage, config: ServerConfig) -> Result<Self> {
        let pattern = BranchPattern::new(&config.branch_pattern)?;
        Ok(Self {
            storage,
            config,
            pattern,
            activity: Arc::new(ActivityTracker::new()),
        })
    }

    pub fn activity(&self) -> Arc<ActivityTracker> {
        Arc::clone(&self.activity)
    }
}

/// Expand tilde (~) in paths to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if path_str == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
    } else if let Some(rest) = path_str.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            home.join(rest)
        } else {
            path.to_path_buf()
        }
    } else {
        path.to_path_buf()
    }
}

/// Main server entry point: speak the protocol over stdin/stdout.
pub async fn run_server(config_path: &Path, root: &Path) -> Result<()> {
    let root = expand_tilde(root);
    let mut config = Config::load(&expand_tilde(config_path))?;

    // Relative backend paths hang off the served root.
    if let Some(path) = &config.store.path {
        if path.is_relative() {
            config.store.path = Some(root.join(path));
        }
    }
    if let Some(path) = &config.index.path {
        if path.is_relative() {
            config.index.path = Some(root.join(path));
        }
    }

    let storage = BundleStorage::from_config(&config).context("building storage backends")?;
    let ctx = ServerContext::new(storage, config.server.clone())?;

    let watchdog = Watchdog::spawn(
        ctx.activity(),
        config
            .server
            .idle_timeout_secs
            .map(std::time::Duration::from_secs),
        config.server.owner_file.clone(),
    );

    let mut stdin = io::stdin();
    let mut stdout = io::stdout();

    tokio::select! {
        result = serve_connection(&mut stdin, &mut stdout, &ctx) => result,
        _ = watchdog.shut_down() => {
            tracing::info!("watchdog requested shutdown");
            Ok(())
        }
    }
}

/// Frame loop for one connection. Returns cleanly on EOF; protocol
/// errors terminate the connection with a logged diagnostic.
pub async fn serve_connection<R, W>(
    reader: &mut R,
    writer: &mut W,
    ctx: &ServerContext,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reactor = Reactor::new();

    loop {
        let frame = match read_frame(reader).await? {
            Some(frame) => frame,
            None => return Ok(()),
        };
        ctx.activity.touch();

        match reactor.on_frame(&frame) {
            Action::WantFrame => continue,
            Action::Error { message } => {
                // Terminal: all further frames would error the same way.
                tracing::warn!(error = %message, "protocol error; dropping connection");
                anyhow::bail!("protocol error: {}", message);
            }
            Action::RunCommand {
                command,
                args,
                data,
            } => {
                let response = dispatch_command(ctx, &command, &args, data);
                write_response(writer, &response).await?;
                writer.flush().await?;
            }
        }
    }
}

/// Stream a response back as command-data frames: continuation frames
/// for every full chunk, end-of-stream on the final one.
async fn write_response<W: AsyncWrite + Unpin>(writer: &mut W, response: &[u8]) -> Result<()> {
    let mut chunks = response.chunks(DEFAULT_MAX_FRAME_SIZE).peekable();
    if chunks.peek().is_none() {
        let frame = encode_frame(FrameType::CommandData as u8, DataFlags::EOS.bits(), b"")?;
        write_frame(writer, &frame).await?;
        return Ok(());
    }
    while let Some(chunk) = chunks.next() {
        let flags = if chunks.peek().is_some() {
            DataFlags::CONTINUATION
        } else {
            DataFlags::EOS
        };
        let frame = encode_frame(FrameType::CommandData as u8, flags.bits(), chunk)?;
        write_frame(writer, &frame).await?;
    }
    Ok(())
}

/// Run one accumulated command. Policy failures become payload-level
/// errors; only framing/internal failures escape to the caller.
fn dispatch_command(
    ctx: &ServerContext,
    command: &Bytes,
    args: &HashMap<Bytes, Bytes>,
    data: Option<Bytes>,
) -> Vec<u8> {
    let name = String::from_utf8_lossy(command);
    tracing::debug!(command = %name, args = args.len(), "dispatching command");
    match name.as_ref() {
        "lookup" => cmd_lookup(ctx, args),
        "listkeyspatterns" => cmd_listkeyspatterns(ctx, args),
        "unbundle" => cmd_unbundle(ctx, data),
        other => format!("0 unknown command {}\n", other).into_bytes(),
    }
}

fn arg_str(args: &HashMap<Bytes, Bytes>, name: &str) -> Option<String> {
    args.get(name.as_bytes())
        .map(|v| String::from_utf8_lossy(v).into_owned())
}

/// Resolve a key to a node: scratch bookmarks through the index, bare
/// hex nodes through the bundle association.
fn cmd_lookup(ctx: &ServerContext, args: &HashMap<Bytes, Bytes>) -> Vec<u8> {
    let key = match arg_str(args, "key") {
        Some(key) => key,
        None => return b"0 missing key argument\n".to_vec(),
    };

    if ctx.pattern.matches(&key) {
        return match ctx.storage.index.get_node(&key) {
            Ok(Some(node)) => format!("1 {}\n", node).into_bytes(),
            Ok(None) => format!("0 scratch branch {} not found\n", key).into_bytes(),
            Err(e) => format!("0 {}\n", e.user_message()).into_bytes(),
        };
    }

    match Node::from_hex(&key) {
        Ok(node) => match ctx.storage.index.get_bundle(node) {
            Ok(Some(_)) => format!("1 {}\n", key).into_bytes(),
            Ok(None) => format!("0 unknown revision {}\n", key).into_bytes(),
            Err(e) => format!("0 {}\n", e.user_message()).into_bytes(),
        },
        Err(_) => format!("0 unknown key {}\n", key).into_bytes(),
    }
}

/// Bookmark listing with trailing-`*` patterns; the response is a JSON
/// object of name to hex node.
fn cmd_listkeyspatterns(ctx: &ServerContext, args: &HashMap<Bytes, Bytes>) -> Vec<u8> {
    let namespace = arg_str(args, "namespace").unwrap_or_default();
    if namespace != "bookmarks" {
        return b"{}\n".to_vec();
    }
    let patterns: Vec<String> = arg_str(args, "patterns")
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default();

    let mut results = std::collections::BTreeMap::new();
    for pattern in patterns {
        match ctx.storage.index.get_bookmarks(&pattern) {
            Ok(matched) => {
                results.extend(matched.into_iter().map(|(k, v)| (k, v.to_hex())));
            }
            Err(e) => {
                tracing::warn!(pattern = %pattern, error = %e, "bookmark listing failed");
            }
        }
    }
    let mut body = serde_json::to_vec(&results).unwrap_or_else(|_| b"{}".to_vec());
    body.push(b'\n');
    body
}

/// Store an incoming push. The response is a part container: the reply
/// parts on success, a single `error:abort` part on policy failure.
fn cmd_unbundle(ctx: &ServerContext, data: Option<Bytes>) -> Vec<u8> {
    let data = match data {
        Some(data) => data,
        None => return error_container("unbundle requires a data stream", None),
    };
    match process_parts(&ctx.storage, &ctx.config, data) {
        Ok(reply) => reply.encode().to_vec(),
        Err(ServerError::Abort { message, hint }) => error_container(&message, hint.as_deref()),
        Err(e) => {
            tracing::error!(error = %e, "push failed");
            error_container(&e.user_message(), None)
        }
    }
}

fn error_container(message: &str, hint: Option<&str>) -> Vec<u8> {
    let mut bundler = Bundler::new();
    let mut part = Part::new(PART_ERROR_ABORT, Bytes::new()).with_param("message", message);
    if let Some(hint) = hint {
        part = part.with_param("hint", hint);
    }
    bundler.add_part(part);
    bundler.encode().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IndexConfig, StoreConfig};
    use crate::store::build_store;
    use tempfile::TempDir;

    fn context(temp: &TempDir) -> ServerContext {
        let storage = BundleStorage {
            store: build_store(&StoreConfig {
                kind: "disk".to_string(),
                path: Some(temp.path().join("store")),
                ..Default::default()
            })
            .unwrap(),
            index: crate::index::build_index(&IndexConfig {
                kind: "disk".to_string(),
                path: Some(temp.path().join("index")),
                lock_timeout_secs: 2,
            })
            .unwrap(),
        };
        ServerContext::new(storage, ServerConfig::default()).unwrap()
    }

    fn args(pairs: &[(&str, &str)]) -> HashMap<Bytes, Bytes> {
        pairs
            .iter()
            .map(|(k, v)| {
                (
                    Bytes::copy_from_slice(k.as_bytes()),
                    Bytes::copy_from_slice(v.as_bytes()),
                )
            })
            .collect()
    }

    #[test]
    fn test_lookup_scratch_bookmark() {
        let temp = TempDir::new().unwrap();
        let ctx = context(&temp);
        let node = Node([4u8; 20]);
        ctx.storage.index.add_bookmark("scratch/f", node).unwrap();

        let found = cmd_lookup(&ctx, &args(&[("key", "scratch/f")]));
        assert_eq!(found, format!("1 {}\n", node).into_bytes());

        let missing = cmd_lookup(&ctx, &args(&[("key", "scratch/gone")]));
        assert_eq!(
            missing,
            b"0 scratch branch scratch/gone not found\n".to_vec()
        );
    }

    #[test]
    fn test_lookup_indexed_node() {
        let temp = TempDir::new().unwrap();
        let ctx = context(&temp);
        let node = Node([5u8; 20]);
        ctx.storage.index.add_bundle("h1", &[node]).unwrap();

        let found = cmd_lookup(&ctx, &args(&[("key", &node.to_hex())]));
        assert_eq!(found, format!("1 {}\n", node).into_bytes());

        let other = Node([6u8; 20]);
        let missing = cmd_lookup(&ctx, &args(&[("key", &other.to_hex())]));
        assert!(missing.starts_with(b"0 unknown revision"));
    }

    #[test]
    fn test_listkeyspatterns() {
        let temp = TempDir::new().unwrap();
        let ctx = context(&temp);
        let node = Node([7u8; 20]);
        ctx.storage.index.add_bookmark("scratch/a", node).unwrap();
        ctx.storage.index.add_bookmark("other", node).unwrap();

        let body = cmd_listkeyspatterns(
            &ctx,
            &args(&[("namespace", "bookmarks"), ("patterns", r#"["scratch/*"]"#)]),
        );
        let parsed: std::collections::BTreeMap<String, String> =
            serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed.get("scratch/a"), Some(&node.to_hex()));
    }

    #[test]
    fn test_listkeyspatterns_other_namespace_empty() {
        let temp = TempDir::new().unwrap();
        let ctx = context(&temp);
        let body = cmd_listkeyspatterns(&ctx, &args(&[("namespace", "phases")]));
        assert_eq!(body, b"{}\n".to_vec());
    }

    #[test]
    fn test_unknown_command() {
        let temp = TempDir::new().unwrap();
        let ctx = context(&temp);
        let body = dispatch_command(&ctx, &Bytes::from_static(b"frobnicate"), &args(&[]), None);
        assert_eq!(body, b"0 unknown command frobnicate\n".to_vec());
    }

    #[test]
    fn test_unbundle_policy_error_becomes_abort_part() {
        let temp = TempDir::new().unwrap();
        let ctx = context(&temp);
        // A push referencing an unknown bookmark without create.
        let mut bundler = Bundler::new();
        bundler.add_part(
            Part::new(
                crate::bundle::parts::PART_SCRATCH_BRANCH,
                crate::changegroup::testutil::chain(1, None).encode(),
            )
            .with_param("bookmark", "scratch/none"),
        );
        let body = cmd_unbundle(&ctx, Some(bundler.encode()));

        let mut parts = crate::bundle::PartIterator::new(Bytes::from(body)).unwrap();
        let part = parts.next_part().unwrap().unwrap();
        assert_eq!(part.part_type, PART_ERROR_ABORT);
        assert!(part.param("message").unwrap().contains("unknown bookmark"));
        assert!(part.param("hint").unwrap().contains("--create"));
    }

    #[tokio::test]
    async fn test_write_response_chunking() {
        let mut buf = Vec::new();
        let payload = vec![9u8; DEFAULT_MAX_FRAME_SIZE + 5];
        write_response(&mut buf, &payload).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let first = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(first.data_flags(), DataFlags::CONTINUATION);
        assert_eq!(first.payload.len(), DEFAULT_MAX_FRAME_SIZE);
        let second = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(second.data_flags(), DataFlags::EOS);
        assert_eq!(second.payload.len(), 5);
    }

    #[tokio::test]
    async fn test_write_response_empty() {
        let mut buf = Vec::new();
        write_response(&mut buf, b"").await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let frame = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(frame.data_flags(), DataFlags::EOS);
        assert!(frame.payload.is_empty());
    }
}
