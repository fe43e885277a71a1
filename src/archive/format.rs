//! Archive wire format
//!
//! An archive file is an 8-byte magic and a schema version byte followed
//! by a self-delimiting sequence of length-prefixed record frames. Every
//! integer is big-endian.

use crate::fingerprint::RequestKey;
use crate::{ReplayError, Result};

/// File magic bytes
pub const FILE_MAGIC: [u8; 8] = *b"WREPLAY\0";

/// Current schema version
pub const SCHEMA_VERSION: u8 = 1;

/// File header size (magic + schema version)
pub const FILE_HEADER_SIZE: usize = 9;

/// Frame overhead: u32 payload length before, u32 CRC32 after
pub const FRAME_OVERHEAD: usize = 8;

const TAG_METHOD: u8 = 0x01;
const TAG_HOST: u8 = 0x02;
const TAG_PATH: u8 = 0x03;
const TAG_HEADERS: u8 = 0x04;
const TAG_BODY_HASH: u8 = 0x05;

/// A recorded HTTP response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseRecord {
    /// HTTP status code
    pub status: u16,
    /// Status reason phrase
    pub reason: String,
    /// Response headers in received order
    pub headers: Vec<(String, String)>,
    /// Response body bytes
    pub body: Vec<u8>,
    /// Recording timestamp, Unix epoch milliseconds
    pub recorded_at_ms: u64,
}

/// Encode one `(RequestKey, ResponseRecord)` pair as a frame payload
#[must_use]
pub fn encode_record(key: &RequestKey, response: &ResponseRecord) -> Vec<u8> {
    let mut out = Vec::with_capacity(128 + response.body.len());
    out.push(SCHEMA_VERSION);

    out.push(TAG_METHOD);
    put_str16(&mut out, &key.method);
    out.push(TAG_HOST);
    put_str16(&mut out, &key.host);
    out.push(TAG_PATH);
    put_str16(&mut out, &key.path);
    out.push(TAG_HEADERS);
    out.extend_from_slice(&(key.headers.len() as u16).to_be_bytes());
    for (name, value) in &key.headers {
        put_str16(&mut out, name);
        put_str16(&mut out, value);
    }
    out.push(TAG_BODY_HASH);
    out.extend_from_slice(&key.body_hash);

    out.extend_from_slice(&response.status.to_be_bytes());
    put_str16(&mut out, &response.reason);
    out.extend_from_slice(&(response.headers.len() as u16).to_be_bytes());
    for (name, value) in &response.headers {
        put_str16(&mut out, name);
        put_str16(&mut out, value);
    }
    out.extend_from_slice(&(response.body.len() as u32).to_be_bytes());
    out.extend_from_slice(&response.body);
    out.extend_from_slice(&response.recorded_at_ms.to_be_bytes());

    out
}

/// Decode one frame payload back into its `(RequestKey, ResponseRecord)` pair
///
/// # Errors
///
/// Returns [`ReplayError::InvalidFormat`] on truncation, unknown field
/// tags, or an unsupported record schema version.
pub fn decode_record(payload: &[u8]) -> Result<(RequestKey, ResponseRecord)> {
    let mut cur = Cursor::new(payload);

    let version = cur.take_u8()?;
    if version != SCHEMA_VERSION {
        return Err(ReplayError::InvalidFormat(format!(
            "unsupported record schema version: {version} (expected {SCHEMA_VERSION})"
        )));
    }

    cur.expect_tag(TAG_METHOD)?;
    let method = cur.take_str16()?;
    cur.expect_tag(TAG_HOST)?;
    let host = cur.take_str16()?;
    cur.expect_tag(TAG_PATH)?;
    let path = cur.take_str16()?;
    cur.expect_tag(TAG_HEADERS)?;
    let header_count = cur.take_u16()?;
    let mut key_headers = Vec::with_capacity(header_count as usize);
    for _ in 0..header_count {
        let name = cur.take_str16()?;
        let value = cur.take_str16()?;
        key_headers.push((name, value));
    }
    cur.expect_tag(TAG_BODY_HASH)?;
    let mut body_hash = [0u8; 32];
    body_hash.copy_from_slice(cur.take_bytes(32)?);

    let status = cur.take_u16()?;
    let reason = cur.take_str16()?;
    let response_header_count = cur.take_u16()?;
    let mut response_headers = Vec::with_capacity(response_header_count as usize);
    for _ in 0..response_header_count {
        let name = cur.take_str16()?;
        let value = cur.take_str16()?;
        response_headers.push((name, value));
    }
    let body_len = cur.take_u32()? as usize;
    let body = cur.take_bytes(body_len)?.to_vec();
    let recorded_at_ms = cur.take_u64()?;

    let key = RequestKey {
        method,
        host,
        path,
        headers: key_headers,
        body_hash,
    };
    let response = ResponseRecord {
        status,
        reason,
        headers: response_headers,
        body,
        recorded_at_ms,
    };
    Ok((key, response))
}

fn put_str16(out: &mut Vec<u8>, value: &str) {
    out.extend_from_slice(&(value.len() as u16).to_be_bytes());
    out.extend_from_slice(value.as_bytes());
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(len).ok_or_else(|| {
            ReplayError::InvalidFormat("record length overflow".to_string())
        })?;
        if end > self.data.len() {
            return Err(ReplayError::InvalidFormat(format!(
                "record truncated at offset {}: need {len} bytes",
                self.pos
            )));
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn take_u8(&mut self) -> Result<u8> {
        Ok(self.take_bytes(1)?[0])
    }

    fn take_u16(&mut self) -> Result<u16> {
        let bytes = self.take_bytes(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn take_u32(&mut self) -> Result<u32> {
        let bytes = self.take_bytes(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn take_u64(&mut self) -> Result<u64> {
        let bytes = self.take_bytes(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(buf))
    }

    fn take_str16(&mut self) -> Result<String> {
        let len = self.take_u16()? as usize;
        let bytes = self.take_bytes(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| ReplayError::InvalidFormat("invalid UTF-8 in record field".to_string()))
    }

    fn expect_tag(&mut self, tag: u8) -> Result<()> {
        let actual = self.take_u8()?;
        if actual != tag {
            return Err(ReplayError::InvalidFormat(format!(
                "unexpected field tag {actual:#x} (expected {tag:#x})"
            )));
        }
        Ok(())
    }
}
