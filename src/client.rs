//! Client operations against a serve peer.
//!
//! Requests are encoded with the command frame encoder; responses come
//! back as command-data frames which are drained into one buffer per
//! command. Policy failures surface as the abort message and hint the
//! server put in its reply container.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::path::Path;

use anyhow::{bail, Context, Result};
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::bundle::parts::{PART_ERROR_ABORT, PART_REPLY_CAPS, PART_SCRATCH_BRANCH};
use crate::bundle::{Bundler, Part, PartIterator, STREAM_PARAM_SCRATCH};
use crate::wire::{command_frames, read_frame, write_frame, DataFlags, FrameType};

/// Options for pushing a changegroup to a scratch bookmark.
#[derive(Debug, Clone, Default)]
pub struct PushOptions {
    pub bookmark: Option<String>,
    pub prev_node: Option<String>,
    pub create: bool,
    pub force: bool,
    pub pushback: bool,
}

/// Send one command and drain its data-frame response.
pub async fn call<R, W>(
    reader: &mut R,
    writer: &mut W,
    command: &[u8],
    args: &BTreeMap<Vec<u8>, Vec<u8>>,
    data: Option<&[u8]>,
) -> Result<Bytes>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut source = data.map(Cursor::new);
    let frames = command_frames(
        command,
        args,
        source
            .as_mut()
            .map(|c| c as &mut dyn std::io::Read),
    )?;
    for frame in &frames {
        write_frame(writer, frame).await?;
    }
    writer.flush().await?;

    read_response(reader).await
}

/// Responses are command-data frames: continuation until the final
/// end-of-stream frame.
async fn read_response<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Bytes> {
    let mut buffer = BytesMut::new();
    loop {
        let frame = read_frame(reader)
            .await?
            .context("connection closed mid-response")?;
        if frame.frame_type() != Some(FrameType::CommandData) {
            bail!("expected a response data frame, got type {}", frame.ftype);
        }
        buffer.extend_from_slice(&frame.payload);
        let flags = frame.data_flags();
        if flags.contains(DataFlags::EOS) {
            return Ok(buffer.freeze());
        }
        if !flags.contains(DataFlags::CONTINUATION) {
            bail!("response data frame without flags");
        }
    }
}

/// Resolve a bookmark or node on the server. Returns the hex node, or
/// `None` with the server's reason logged when the key is unknown.
pub async fn lookup<R, W>(reader: &mut R, writer: &mut W, key: &str) -> Result<Option<String>>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut args = BTreeMap::new();
    args.insert(b"key".to_vec(), key.as_bytes().to_vec());
    let response = call(reader, writer, b"lookup", &args, None).await?;
    let text = String::from_utf8_lossy(&response);
    let text = text.trim_end();
    match text.split_once(' ') {
        Some(("1", node)) => Ok(Some(node.to_string())),
        Some(("0", reason)) => {
            tracing::debug!(key, reason, "lookup miss");
            Ok(None)
        }
        _ => bail!("malformed lookup response: {:?}", text),
    }
}

/// List remote bookmarks matching the given patterns.
pub async fn list_bookmarks<R, W>(
    reader: &mut R,
    writer: &mut W,
    patterns: &[String],
) -> Result<BTreeMap<String, String>>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut args = BTreeMap::new();
    args.insert(b"namespace".to_vec(), b"bookmarks".to_vec());
    args.insert(b"patterns".to_vec(), serde_json::to_vec(patterns)?);
    let response = call(reader, writer, b"listkeyspatterns", &args, None).await?;
    serde_json::from_slice(&response).context("malformed bookmark listing")
}

/// Build the part container for a scratch push.
pub fn build_push_bundle(changegroup: Bytes, options: &PushOptions) -> Result<Bytes> {
    let mut bundler = Bundler::new();
    // Tells the server to route this container to scratch storage.
    bundler.add_stream_param(STREAM_PARAM_SCRATCH, "1");
    if options.pushback {
        bundler.add_part(Part::new(
            PART_REPLY_CAPS,
            Bytes::from(serde_json::to_vec(&["pushback"])?),
        ));
    }

    let mut part = Part::new(PART_SCRATCH_BRANCH, changegroup).with_param("cgversion", "02");
    if let Some(bookmark) = &options.bookmark {
        part = part
            .with_param("bookmark", bookmark.clone())
            .with_param("bookprevnode", options.prev_node.clone().unwrap_or_default());
    }
    if options.create {
        part = part.with_param("create", "1");
    }
    if options.force {
        part = part.with_param("force", "1");
    }
    if options.pushback {
        part = part.with_param("pushbackbookmarks", "1");
    }
    bundler.add_part(part);
    Ok(bundler.encode())
}

/// Push a changegroup file to the server's scratch store. Returns the
/// reply parts (pushback bookmark updates among them).
pub async fn push_bundle<R, W>(
    reader: &mut R,
    writer: &mut W,
    changegroup_file: &Path,
    options: &PushOptions,
) -> Result<Vec<Part>>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let changegroup = tokio::fs::read(changegroup_file)
        .await
        .with_context(|| format!("reading {}", changegroup_file.display()))?;
    let bundle = build_push_bundle(Bytes::from(changegroup), options)?;

    let response = call(reader, writer, b"unbundle", &BTreeMap::new(), Some(&bundle)).await?;
    parse_push_reply(response)
}

/// Unpack the server's reply container, surfacing aborts as errors.
pub fn parse_push_reply(response: Bytes) -> Result<Vec<Part>> {
    let mut parts = PartIterator::new(response).context("malformed push reply")?;
    let mut replies = Vec::new();
    while let Some(part) = parts.next_part()? {
        if part.kind() == PART_ERROR_ABORT {
            let message = part.param("message").unwrap_or("push rejected").to_string();
            match part.param("hint") {
                Some(hint) => bail!("{}\n({})", message, hint),
                None => bail!("{}", message),
            }
        }
        replies.push(part);
    }
    Ok(replies)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::parts::PART_PUSHKEY;

    #[test]
    fn test_build_push_bundle_params() {
        let options = PushOptions {
            bookmark: Some("scratch/x".to_string()),
            prev_node: None,
            create: true,
            force: false,
            pushback: true,
        };
        let encoded = build_push_bundle(Bytes::from_static(b"cg"), &options).unwrap();
        let mut parts = PartIterator::new(encoded).unwrap();

        let caps = parts.next_part().unwrap().unwrap();
        assert_eq!(caps.part_type, PART_REPLY_CAPS);

        let scratch = parts.next_part().unwrap().unwrap();
        assert_eq!(scratch.part_type, PART_SCRATCH_BRANCH);
        assert_eq!(scratch.param("bookmark"), Some("scratch/x"));
        assert_eq!(scratch.param("create"), Some("1"));
        assert_eq!(scratch.param("force"), None);
        assert_eq!(scratch.param("pushbackbookmarks"), Some("1"));
        assert_eq!(scratch.payload.as_ref(), b"cg");
    }

    #[test]
    fn test_parse_push_reply_abort() {
        let mut bundler = Bundler::new();
        bundler.add_part(
            Part::new(PART_ERROR_ABORT, Bytes::new())
                .with_param("message", "non-forward push")
                .with_param("hint", "use --non-forward-move to override"),
        );
        let err = parse_push_reply(bundler.encode()).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("non-forward push"));
        assert!(text.contains("--non-forward-move"));
    }

    #[test]
    fn test_parse_push_reply_collects_parts() {
        let mut bundler = Bundler::new();
        bundler.add_part(
            Part::new(PART_PUSHKEY, Bytes::new())
                .with_param("namespace", "bookmarks")
                .with_param("key", "scratch/x"),
        );
        let replies = parse_push_reply(bundler.encode()).unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].part_type, PART_PUSHKEY);
    }
}
