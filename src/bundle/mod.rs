//! Bundle part container.
//!
//! A push is a container of typed parts: stream-level parameters followed
//! by a sequence of sub-messages, each with a type, parameters, and an
//! opaque payload. Parts whose type is spelled in uppercase are mandatory;
//! a reader that has no handler for a mandatory part must abort instead
//! of skipping it.
//!
//! Wire layout (all lengths big-endian):
//!
//! ```text
//! magic "SB10"
//! u8 stream param count, then per param: u16 klen | u16 vlen | k | v
//! parts:
//!   u16 type len (0 terminates the container)
//!   type bytes (ASCII)
//!   u8 param count, params encoded as above
//!   u32 payload len | payload
//! ```

pub mod parts;

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, ServerError};

pub const BUNDLE_MAGIC: &[u8; 4] = b"SB10";

/// Stream-level parameter marking a container as a scratch push.
pub const STREAM_PARAM_SCRATCH: &str = "scratchpush";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    /// Sequential id assigned by the reader; used for reply references.
    pub id: u32,
    pub part_type: String,
    pub params: BTreeMap<String, String>,
    pub payload: Bytes,
}

impl Part {
    pub fn new(part_type: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            id: 0,
            part_type: part_type.into(),
            params: BTreeMap::new(),
            payload: payload.into(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Mandatory parts carry an uppercase type on the wire.
    pub fn is_mandatory(&self) -> bool {
        self.part_type.chars().any(|c| c.is_ascii_uppercase())
    }

    /// Canonical lowercase type for handler dispatch.
    pub fn kind(&self) -> String {
        self.part_type.to_ascii_lowercase()
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }
}

fn put_kv(buf: &mut BytesMut, key: &str, value: &str) {
    buf.put_u16(key.len() as u16);
    buf.put_u16(value.len() as u16);
    buf.put_slice(key.as_bytes());
    buf.put_slice(value.as_bytes());
}

fn get_kv(data: &mut Bytes, what: &str) -> Result<(String, String)> {
    if data.remaining() < 4 {
        return Err(ServerError::Protocol(format!("truncated {} parameter", what)));
    }
    let klen = data.get_u16() as usize;
    let vlen = data.get_u16() as usize;
    if data.remaining() < klen + vlen {
        return Err(ServerError::Protocol(format!("truncated {} parameter", what)));
    }
    let key = String::from_utf8(data.copy_to_bytes(klen).to_vec())
        .map_err(|_| ServerError::Protocol(format!("non-UTF8 {} parameter name", what)))?;
    let value = String::from_utf8(data.copy_to_bytes(vlen).to_vec())
        .map_err(|_| ServerError::Protocol(format!("non-UTF8 {} parameter value", what)))?;
    Ok((key, value))
}

// =============================================================================
// Bundler (writer)
// =============================================================================

/// Accumulates parts and serializes them into a container.
#[derive(Debug, Default)]
pub struct Bundler {
    stream_params: BTreeMap<String, String>,
    parts: Vec<Part>,
}

impl Bundler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_stream_param(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.stream_params.insert(key.into(), value.into());
    }

    pub fn add_part(&mut self, part: Part) {
        self.parts.push(part);
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_slice(BUNDLE_MAGIC);
        buf.put_u8(self.stream_params.len() as u8);
        for (k, v) in &self.stream_params {
            put_kv(&mut buf, k, v);
        }
        for part in &self.parts {
            buf.put_u16(part.part_type.len() as u16);
            buf.put_slice(part.part_type.as_bytes());
            buf.put_u8(part.params.len() as u8);
            for (k, v) in &part.params {
                put_kv(&mut buf, k, v);
            }
            buf.put_u32(part.payload.len() as u32);
            buf.put_slice(&part.payload);
        }
        buf.put_u16(0); // terminator
        buf.freeze()
    }
}

// =============================================================================
// PartIterator (reader)
// =============================================================================

/// Parses a container: stream params eagerly, parts on demand.
#[derive(Debug)]
pub struct PartIterator {
    data: Bytes,
    stream_params: BTreeMap<String, String>,
    next_id: u32,
    done: bool,
}

impl PartIterator {
    pub fn new(mut data: Bytes) -> Result<Self> {
        if data.remaining() < BUNDLE_MAGIC.len() + 1 {
            return Err(ServerError::Protocol("bundle too short for header".to_string()));
        }
        let magic = data.copy_to_bytes(BUNDLE_MAGIC.len());
        if magic.as_ref() != BUNDLE_MAGIC {
            return Err(ServerError::Protocol(format!(
                "bad bundle magic {:02x?}",
                magic.as_ref()
            )));
        }
        let count = data.get_u8() as usize;
        let mut stream_params = BTreeMap::new();
        for _ in 0..count {
            let (k, v) = get_kv(&mut data, "stream")?;
            stream_params.insert(k, v);
        }
        Ok(Self {
            data,
            stream_params,
            next_id: 0,
            done: false,
        })
    }

    pub fn stream_param(&self, key: &str) -> Option<&str> {
        self.stream_params.get(key).map(String::as_str)
    }

    /// Next part, or `None` at the terminator.
    pub fn next_part(&mut self) -> Result<Option<Part>> {
        if self.done {
            return Ok(None);
        }
        if self.data.remaining() < 2 {
            return Err(ServerError::Protocol(
                "bundle truncated: missing part header".to_string(),
            ));
        }
        let type_len = self.data.get_u16() as usize;
        if type_len == 0 {
            self.done = true;
            return Ok(None);
        }
        if self.data.remaining() < type_len + 1 {
            return Err(ServerError::Protocol("bundle truncated in part type".to_string()));
        }
        let part_type = String::from_utf8(self.data.copy_to_bytes(type_len).to_vec())
            .map_err(|_| ServerError::Protocol("non-UTF8 part type".to_string()))?;
        let param_count = self.data.get_u8() as usize;
        let mut params = BTreeMap::new();
        for _ in 0..param_count {
            let (k, v) = get_kv(&mut self.data, "part")?;
            params.insert(k, v);
        }
        if self.data.remaining() < 4 {
            return Err(ServerError::Protocol(
                "bundle truncated: missing payload length".to_string(),
            ));
        }
        let payload_len = self.data.get_u32() as usize;
        if self.data.remaining() < payload_len {
            return Err(ServerError::Protocol(format!(
                "bundle truncated: part {:?} payload wants {} bytes, {} left",
                part_type,
                payload_len,
                self.data.remaining()
            )));
        }
        let payload = self.data.copy_to_bytes(payload_len);

        let id = self.next_id;
        self.next_id += 1;
        Ok(Some(Part {
            id,
            part_type,
            params,
            payload,
        }))
    }
}
