// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Service request/response frames.
//!
//! Both protocol versions share this layout; v1 differs only in the version
//! byte, which servers echo in their responses. Frames travel inside the
//! TCP length-prefix framing of [`crate::transport::tcp`].
//!
//! ```text
//! request:  magic u32 | version u8 | request_id u64 |
//!           method_name_len u32 | method_name | payload_len u32 | payload
//! response: magic u32 | version u8 | request_id u64 | ret_state i32 |
//!           error_msg_len u32 | error_msg | payload_len u32 | payload
//! ```

use crate::error::{Error, Result};

/// Service frame magic ("HBRC").
pub const SERVICE_MAGIC: u32 = 0x4842_5243;

/// Protocol version 0.
pub const PROTOCOL_V0: u8 = 0;

/// Protocol version 1.
pub const PROTOCOL_V1: u8 = 1;

/// Handler completed normally; `ret_state` is the handler's own value.
pub const RET_OK: i32 = 0;

/// The requested method is not registered on the server.
pub const RET_METHOD_NOT_FOUND: i32 = -1;

/// The handler failed internally (panicked).
pub const RET_INTERNAL_ERROR: i32 = -2;

/// Outcome of one service invocation as seen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum CallState {
    /// Not attempted.
    #[default]
    None = 0,
    /// The server executed the handler.
    Executed = 1,
    /// Transport failure, timeout, or cancellation.
    Failed = 2,
}

/// A method invocation on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    /// Protocol version spoken on this connection.
    pub version: u8,
    /// Correlates the response on the same connection.
    pub request_id: u64,
    /// Target method.
    pub method_name: String,
    /// Opaque request payload.
    pub payload: Vec<u8>,
}

impl RequestFrame {
    /// Encode into the inner frame bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(25 + self.method_name.len() + self.payload.len());
        buf.extend_from_slice(&SERVICE_MAGIC.to_le_bytes());
        buf.push(self.version);
        buf.extend_from_slice(&self.request_id.to_le_bytes());
        buf.extend_from_slice(&(self.method_name.len() as u32).to_le_bytes());
        buf.extend_from_slice(self.method_name.as_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode from the inner frame bytes.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(buf);
        cursor.expect_magic()?;
        let version = cursor.u8()?;
        let request_id = cursor.u64()?;
        let method_name = cursor.string()?;
        let payload = cursor.bytes()?.to_vec();
        Ok(Self {
            version,
            request_id,
            method_name,
            payload,
        })
    }
}

/// A method result on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    /// Echoes the request's protocol version.
    pub version: u8,
    /// Echoes the request id.
    pub request_id: u64,
    /// Handler return state, or [`RET_METHOD_NOT_FOUND`].
    pub ret_state: i32,
    /// Human-readable failure explanation, empty on success.
    pub error_msg: String,
    /// Opaque response payload.
    pub payload: Vec<u8>,
}

impl ResponseFrame {
    /// Encode into the inner frame bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(29 + self.error_msg.len() + self.payload.len());
        buf.extend_from_slice(&SERVICE_MAGIC.to_le_bytes());
        buf.push(self.version);
        buf.extend_from_slice(&self.request_id.to_le_bytes());
        buf.extend_from_slice(&self.ret_state.to_le_bytes());
        buf.extend_from_slice(&(self.error_msg.len() as u32).to_le_bytes());
        buf.extend_from_slice(self.error_msg.as_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode from the inner frame bytes.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(buf);
        cursor.expect_magic()?;
        let version = cursor.u8()?;
        let request_id = cursor.u64()?;
        let ret_state = cursor.i32()?;
        let error_msg = cursor.string()?;
        let payload = cursor.bytes()?.to_vec();
        Ok(Self {
            version,
            request_id,
            ret_state,
            error_msg,
            payload,
        })
    }
}

/// Minimal little-endian cursor for the service frames.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() - self.pos < n {
            return Err(Error::Serialization("service frame truncated".into()));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn expect_magic(&mut self) -> Result<()> {
        let b = self.take(4)?;
        let magic = u32::from_le_bytes([b[0], b[1], b[2], b[3]]);
        if magic != SERVICE_MAGIC {
            return Err(Error::Serialization(format!(
                "bad service frame magic 0x{:08X}",
                magic
            )));
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn i32(&mut self) -> Result<i32> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn bytes(&mut self) -> Result<&'a [u8]> {
        let len = {
            let b = self.take(4)?;
            u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize
        };
        self.take(len)
    }

    fn string(&mut self) -> Result<String> {
        let bytes = self.bytes()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::Serialization("service frame string is not UTF-8".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrip() {
        let frame = RequestFrame {
            version: PROTOCOL_V1,
            request_id: 42,
            method_name: "add".into(),
            payload: vec![1, 2],
        };
        let decoded = RequestFrame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn response_roundtrip() {
        let frame = ResponseFrame {
            version: PROTOCOL_V0,
            request_id: 42,
            ret_state: RET_METHOD_NOT_FOUND,
            error_msg: "method not found".into(),
            payload: Vec::new(),
        };
        let decoded = ResponseFrame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut bytes = RequestFrame {
            version: PROTOCOL_V0,
            request_id: 1,
            method_name: "m".into(),
            payload: Vec::new(),
        }
        .encode();
        bytes[0] ^= 0xFF;
        assert!(RequestFrame::decode(&bytes).is_err());
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let bytes = RequestFrame {
            version: PROTOCOL_V0,
            request_id: 1,
            method_name: "method".into(),
            payload: vec![0; 16],
        }
        .encode();
        assert!(RequestFrame::decode(&bytes[..bytes.len() - 4]).is_err());
    }
}
