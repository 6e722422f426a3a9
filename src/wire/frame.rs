//! Frame codec for the command wire protocol.
//!
//! Wire format: every unit on the wire is a frame with a fixed 4-byte
//! header followed by a variable-length payload:
//!
//! ```text
//! byte 0..3: payload length, 24-bit little-endian
//! byte 3:    (frame type << 4) | frame flags
//! ```
//!
//! Frame types carry their own flag namespaces; flag validity is enforced
//! by the reactor, not the codec. The codec is bit-exact and stateless.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, ServerError};

pub const FRAME_HEADER_SIZE: usize = 4;

/// Protocol ceiling: a frame payload length is a 24-bit integer.
pub const MAX_PAYLOAD_SIZE: usize = (1 << 24) - 1;

/// Practical per-frame payload ceiling. Policy, not protocol: senders
/// split larger logical values across continuation frames.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 32768;

// =============================================================================
// Frame types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    CommandName = 0x1,
    CommandArgument = 0x2,
    CommandData = 0x3,
}

impl FrameType {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x1 => Some(Self::CommandName),
            0x2 => Some(Self::CommandArgument),
            0x3 => Some(Self::CommandData),
            _ => None,
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "command-name" => Some(Self::CommandName),
            "command-argument" => Some(Self::CommandArgument),
            "command-data" => Some(Self::CommandData),
            _ => None,
        }
    }
}

// =============================================================================
// Flags (one namespace per frame type)
// =============================================================================

bitflags::bitflags! {
    /// Flags valid on a command-name frame.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CommandNameFlags: u8 {
        /// No argument or data frames follow.
        const EOS = 0x01;
        const HAVE_ARGS = 0x02;
        const HAVE_DATA = 0x04;
    }
}

bitflags::bitflags! {
    /// Flags valid on a command-argument frame.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ArgumentFlags: u8 {
        /// Value continues in the next frame. Declared but not
        /// implemented; the reactor treats it as a hard error.
        const CONTINUATION = 0x01;
        /// End of the argument block.
        const EOA = 0x02;
    }
}

bitflags::bitflags! {
    /// Flags valid on a command-data frame.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DataFlags: u8 {
        const CONTINUATION = 0x01;
        const EOS = 0x02;
    }
}

// =============================================================================
// Frame
// =============================================================================

/// One decoded frame. `ftype` is kept raw so that frames with an unknown
/// type nibble still reach the reactor, which owns the rejection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub ftype: u8,
    pub flags: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(ftype: FrameType, flags: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            ftype: ftype as u8,
            flags,
            payload: payload.into(),
        }
    }

    pub fn frame_type(&self) -> Option<FrameType> {
        FrameType::from_u8(self.ftype)
    }

    pub fn name_flags(&self) -> CommandNameFlags {
        CommandNameFlags::from_bits_truncate(self.flags)
    }

    pub fn argument_flags(&self) -> ArgumentFlags {
        ArgumentFlags::from_bits_truncate(self.flags)
    }

    pub fn data_flags(&self) -> DataFlags {
        DataFlags::from_bits_truncate(self.flags)
    }

    pub fn encode(&self) -> Result<Bytes> {
        encode_frame(self.ftype, self.flags, &self.payload)
    }
}

// =============================================================================
// Encode / decode
// =============================================================================

/// Assemble a frame into wire bytes. Fails if the payload exceeds the
/// 24-bit length field.
pub fn encode_frame(ftype: u8, flags: u8, payload: &[u8]) -> Result<Bytes> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(ServerError::Protocol(format!(
            "frame payload of {} bytes exceeds protocol maximum {}",
            payload.len(),
            MAX_PAYLOAD_SIZE
        )));
    }
    debug_assert!(ftype <= 0x0f && flags <= 0x0f);

    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
    let len = payload.len() as u32;
    buf.put_u8((len & 0xff) as u8);
    buf.put_u8(((len >> 8) & 0xff) as u8);
    buf.put_u8(((len >> 16) & 0xff) as u8);
    buf.put_u8((ftype << 4) | flags);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Decompose a frame header. Pure arithmetic; never fails on a 4-byte
/// input. The length is not validated against any maximum here.
pub fn parse_header(header: &[u8; FRAME_HEADER_SIZE]) -> (u8, u8, usize) {
    let length =
        header[0] as usize + ((header[1] as usize) << 8) + ((header[2] as usize) << 16);
    let ftype = (header[3] & 0xf0) >> 4;
    let flags = header[3] & 0x0f;
    (ftype, flags, length)
}

/// Read one frame off the stream.
///
/// Returns `Ok(None)` on a clean EOF (zero bytes before the header).
/// A header cut short or a payload shorter than its declared length is a
/// malformed stream, never silently tolerated.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Frame>> {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    let mut read = 0;
    while read < FRAME_HEADER_SIZE {
        let n = reader.read(&mut header[read..]).await?;
        if n == 0 {
            break;
        }
        read += n;
    }

    if read == 0 {
        return Ok(None);
    }
    if read != FRAME_HEADER_SIZE {
        return Err(ServerError::Protocol(format!(
            "received incomplete frame: got {} header bytes",
            read
        )));
    }

    let (ftype, flags, length) = parse_header(&header);

    let mut payload = vec![0u8; length];
    let mut filled = 0;
    while filled < length {
        let n = reader.read(&mut payload[filled..]).await?;
        if n == 0 {
            return Err(ServerError::Protocol(format!(
                "frame length error: expected {}; got {}",
                length, filled
            )));
        }
        filled += n;
    }

    Ok(Some(Frame {
        ftype,
        flags,
        payload: Bytes::from(payload),
    }))
}

/// Write pre-encoded frame bytes to the stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Bytes) -> Result<()> {
    writer.write_all(frame).await?;
    Ok(())
}

// =============================================================================
// Human-readable frame notation
// =============================================================================

/// Build a frame from `"<type> <flags> <payload>"` notation.
///
/// Used by tooling and tests to author frames without spelling out raw
/// constants. Type and flags accept symbolic names or integers; multiple
/// flags join with `|`. The payload supports `\n`, `\r`, `\t`, `\0`,
/// `\\` and `\xNN` escapes.
pub fn frame_from_human_string(s: &str) -> Result<Frame> {
    let mut parts = s.splitn(3, ' ');
    let (type_str, flags_str, payload_str) = match (parts.next(), parts.next(), parts.next()) {
        (Some(t), Some(f), Some(p)) => (t, f, p),
        _ => {
            return Err(ServerError::Protocol(format!(
                "malformed frame string {:?}: want <type> <flags> <payload>",
                s
            )))
        }
    };

    let ftype = match FrameType::from_name(type_str) {
        Some(t) => t as u8,
        None => type_str
            .parse::<u8>()
            .map_err(|_| ServerError::Protocol(format!("unknown frame type {:?}", type_str)))?,
    };

    let mut flags = 0u8;
    for flag in flags_str.split('|') {
        flags |= parse_flag(ftype, flag)?;
    }

    Ok(Frame {
        ftype,
        flags,
        payload: Bytes::from(unescape_payload(payload_str)?),
    })
}

fn parse_flag(ftype: u8, flag: &str) -> Result<u8> {
    let symbolic = match (FrameType::from_u8(ftype), flag) {
        (Some(FrameType::CommandName), "eos") => Some(CommandNameFlags::EOS.bits()),
        (Some(FrameType::CommandName), "have-args") => Some(CommandNameFlags::HAVE_ARGS.bits()),
        (Some(FrameType::CommandName), "have-data") => Some(CommandNameFlags::HAVE_DATA.bits()),
        (Some(FrameType::CommandArgument), "continuation") => {
            Some(ArgumentFlags::CONTINUATION.bits())
        }
        (Some(FrameType::CommandArgument), "eoa") => Some(ArgumentFlags::EOA.bits()),
        (Some(FrameType::CommandData), "continuation") => Some(DataFlags::CONTINUATION.bits()),
        (Some(FrameType::CommandData), "eos") => Some(DataFlags::EOS.bits()),
        _ => None,
    };
    if let Some(bits) = symbolic {
        return Ok(bits);
    }
    flag.parse::<u8>()
        .map_err(|_| ServerError::Protocol(format!("unknown frame flag {:?}", flag)))
}

fn unescape_payload(s: &str) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(s.len());
    let mut chars = s.bytes();
    while let Some(b) = chars.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        match chars.next() {
            Some(b'n') => out.push(b'\n'),
            Some(b'r') => out.push(b'\r'),
            Some(b't') => out.push(b'\t'),
            Some(b'0') => out.push(0),
            Some(b'\\') => out.push(b'\\'),
            Some(b'x') => {
                let hi = chars.next();
                let lo = chars.next();
                let (hi, lo) = match (hi, lo) {
                    (Some(h), Some(l)) => (h, l),
                    _ => {
                        return Err(ServerError::Protocol(
                            "truncated \\x escape in frame payload".to_string(),
                        ))
                    }
                };
                let byte = u8::from_str_radix(
                    std::str::from_utf8(&[hi, lo]).map_err(|_| {
                        ServerError::Protocol("invalid \\x escape in frame payload".to_string())
                    })?,
                    16,
                )
                .map_err(|_| {
                    ServerError::Protocol("invalid \\x escape in frame payload".to_string())
                })?;
                out.push(byte);
            }
            other => {
                return Err(ServerError::Protocol(format!(
                    "unknown escape \\{} in frame payload",
                    other.map(|c| c as char).unwrap_or('?')
                )))
            }
        }
    }
    Ok(out)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Cursor;

    #[test]
    fn test_header_roundtrip() {
        let encoded = encode_frame(FrameType::CommandName as u8, 0x3, b"lookup").unwrap();
        let mut header = [0u8; FRAME_HEADER_SIZE];
        header.copy_from_slice(&encoded[..FRAME_HEADER_SIZE]);
        let (ftype, flags, length) = parse_header(&header);
        assert_eq!(ftype, FrameType::CommandName as u8);
        assert_eq!(flags, 0x3);
        assert_eq!(length, 6);
        assert_eq!(&encoded[FRAME_HEADER_SIZE..], b"lookup");
    }

    #[test]
    fn test_length_is_little_endian() {
        let payload = vec![0u8; 0x012345];
        let encoded = encode_frame(FrameType::CommandData as u8, 0, &payload).unwrap();
        assert_eq!(encoded[0], 0x45);
        assert_eq!(encoded[1], 0x23);
        assert_eq!(encoded[2], 0x01);
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let payload = vec![0u8; MAX_PAYLOAD_SIZE + 1];
        assert!(encode_frame(FrameType::CommandData as u8, 0, &payload).is_err());
    }

    #[tokio::test]
    async fn test_read_frame_clean_eof() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        assert!(read_frame(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_frame_partial_header_is_error() {
        let mut cursor = Cursor::new(vec![0x01, 0x02]);
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert!(err.to_string().contains("incomplete frame"));
    }

    #[tokio::test]
    async fn test_read_frame_short_payload_is_error() {
        let mut encoded = encode_frame(FrameType::CommandData as u8, 0, b"hello")
            .unwrap()
            .to_vec();
        encoded.truncate(encoded.len() - 2);
        let mut cursor = Cursor::new(encoded);
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert!(err.to_string().contains("frame length error"));
    }

    #[tokio::test]
    async fn test_read_frame_roundtrip() {
        let encoded = encode_frame(
            FrameType::CommandName as u8,
            CommandNameFlags::EOS.bits(),
            b"heads",
        )
        .unwrap();
        let mut cursor = Cursor::new(encoded.to_vec());
        let frame = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(frame.frame_type(), Some(FrameType::CommandName));
        assert_eq!(frame.name_flags(), CommandNameFlags::EOS);
        assert_eq!(frame.payload.as_ref(), b"heads");
        assert!(read_frame(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_frame_preserves_unknown_type() {
        let encoded = encode_frame(0x9, 0x1, b"x").unwrap();
        let mut cursor = Cursor::new(encoded.to_vec());
        let frame = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(frame.ftype, 0x9);
        assert_eq!(frame.frame_type(), None);
    }

    #[test]
    fn test_human_string_symbolic() {
        let frame = frame_from_human_string("command-name have-args|have-data lookup").unwrap();
        assert_eq!(frame.frame_type(), Some(FrameType::CommandName));
        assert_eq!(
            frame.name_flags(),
            CommandNameFlags::HAVE_ARGS | CommandNameFlags::HAVE_DATA
        );
        assert_eq!(frame.payload.as_ref(), b"lookup");
    }

    #[test]
    fn test_human_string_numeric_and_escapes() {
        let frame = frame_from_human_string("3 1 a\\x00b\\nc").unwrap();
        assert_eq!(frame.frame_type(), Some(FrameType::CommandData));
        assert_eq!(frame.data_flags(), DataFlags::CONTINUATION);
        assert_eq!(frame.payload.as_ref(), b"a\x00b\nc");
    }

    #[test]
    fn test_human_string_rejects_bad_flag() {
        assert!(frame_from_human_string("command-name nope x").is_err());
    }

    proptest! {
        #[test]
        fn prop_header_roundtrip(
            ftype in 0u8..=0x0f,
            flags in 0u8..=0x0f,
            payload in proptest::collection::vec(any::<u8>(), 0..2048),
        ) {
            let encoded = encode_frame(ftype, flags, &payload).unwrap();
            let mut header = [0u8; FRAME_HEADER_SIZE];
            header.copy_from_slice(&encoded[..FRAME_HEADER_SIZE]);
            let (t, f, l) = parse_header(&header);
            prop_assert_eq!(t, ftype);
            prop_assert_eq!(f, flags);
            prop_assert_eq!(l, payload.len());
            prop_assert_eq!(&encoded[FRAME_HEADER_SIZE..], &payload[..]);
        }
    }
}
