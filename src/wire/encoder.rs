//! Client-side command frame encoder.
//!
//! Turns a command request (name, argument map, optional data source)
//! into the frame sequence a server expects: one command-name frame,
//! N argument frames, M data frames.

use std::collections::BTreeMap;
use std::io::Read;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Result, ServerError};
use crate::wire::frame::{
    encode_frame, ArgumentFlags, CommandNameFlags, DataFlags, FrameType, DEFAULT_MAX_FRAME_SIZE,
};

/// Fixed prefix of an argument frame payload: u16 name length then u16
/// value length, both little-endian.
pub const ARGUMENT_FRAME_HEADER_SIZE: usize = 4;

/// Largest argument value that fits a single frame. Splitting one value
/// across frames is declared in the protocol but not implemented; the
/// encoder refuses rather than emit frames no reactor accepts.
pub const MAX_ARGUMENT_VALUE_SIZE: usize = DEFAULT_MAX_FRAME_SIZE - ARGUMENT_FRAME_HEADER_SIZE;

/// Serialize an argument frame payload.
fn argument_payload(name: &[u8], value: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(ARGUMENT_FRAME_HEADER_SIZE + name.len() + value.len());
    buf.put_u16_le(name.len() as u16);
    buf.put_u16_le(value.len() as u16);
    buf.put_slice(name);
    buf.put_slice(value);
    buf.freeze()
}

/// Create the frames necessary to transmit a command request.
///
/// Arguments are emitted in name order (the map is ordered), so the same
/// request always produces the same wire trace. The last argument frame
/// carries EOA. Data is chunked at `DEFAULT_MAX_FRAME_SIZE`; every
/// full-size chunk is a continuation, the final short (possibly empty)
/// chunk carries EOS.
pub fn command_frames(
    command: &[u8],
    args: &BTreeMap<Vec<u8>, Vec<u8>>,
    mut data: Option<&mut dyn Read>,
) -> Result<Vec<Bytes>> {
    let mut flags = CommandNameFlags::empty();
    if !args.is_empty() {
        flags |= CommandNameFlags::HAVE_ARGS;
    }
    if data.is_some() {
        flags |= CommandNameFlags::HAVE_DATA;
    }
    if flags.is_empty() {
        flags |= CommandNameFlags::EOS;
    }

    let mut frames = Vec::new();
    frames.push(encode_frame(
        FrameType::CommandName as u8,
        flags.bits(),
        command,
    )?);

    let last = args.len().saturating_sub(1);
    for (i, (name, value)) in args.iter().enumerate() {
        if name.len() > u16::MAX as usize {
            return Err(ServerError::Protocol(format!(
                "argument name of {} bytes does not fit a frame",
                name.len()
            )));
        }
        if value.len() > MAX_ARGUMENT_VALUE_SIZE {
            return Err(ServerError::Protocol(format!(
                "argument value of {} bytes exceeds the {} byte frame limit",
                value.len(),
                MAX_ARGUMENT_VALUE_SIZE
            )));
        }
        let arg_flags = if i == last {
            ArgumentFlags::EOA
        } else {
            ArgumentFlags::empty()
        };
        frames.push(encode_frame(
            FrameType::CommandArgument as u8,
            arg_flags.bits(),
            &argument_payload(name, value),
        )?);
    }

    if let Some(source) = data.as_deref_mut() {
        loop {
            let mut chunk = vec![0u8; DEFAULT_MAX_FRAME_SIZE];
            let n = read_full(source, &mut chunk)?;
            chunk.truncate(n);

            if n == DEFAULT_MAX_FRAME_SIZE {
                frames.push(encode_frame(
                    FrameType::CommandData as u8,
                    DataFlags::CONTINUATION.bits(),
                    &chunk,
                )?);
            } else {
                frames.push(encode_frame(
                    FrameType::CommandData as u8,
                    DataFlags::EOS.bits(),
                    &chunk,
                )?);
                // The source must be exhausted once a short read is seen.
                let mut probe = [0u8; 1];
                if source.read(&mut probe)? != 0 {
                    return Err(ServerError::Internal(
                        "data source yielded bytes after final chunk".to_string(),
                    ));
                }
                break;
            }
        }
    }

    Ok(frames)
}

/// Read until the buffer is full or the source is drained.
fn read_full(source: &mut dyn Read, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = source.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
