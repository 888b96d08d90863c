// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Versioned framed records - the single wire format for registration
//! announcements, sample envelopes, and the log stream.
//!
//! # Frame layout
//!
//! ```text
//! +--------------+-----------+--------+----------------+------------+
//! | magic u16 LE | version u8| kind u8| body_len u32 LE| body bytes |
//! +--------------+-----------+--------+----------------+------------+
//! ```
//!
//! Bodies evolve additively: encoders may append fields, decoders read the
//! fields they know and ignore trailing bytes. A frame with an unknown kind
//! is skipped, not an error, so older peers coexist with newer ones.

use crate::error::{Error, Result};
use crate::registration::entries::TopicId;

/// Frame magic.
pub const WIRE_MAGIC: u16 = 0xE5CA;

/// Current frame version.
pub const WIRE_VERSION: u8 = 1;

/// Fixed frame header size.
pub const HEADER_SIZE: usize = 8;

/// Upper bound on a single record body (anti-OOM guard on receive paths).
/// Sized for a 64 MiB user payload plus envelope overhead.
pub const MAX_BODY_SIZE: usize = 65 * 1024 * 1024;

/// Discriminates record bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    /// Complete sample envelope (TCP, SHM).
    Sample = 1,
    /// One MTU-sized slice of a sample envelope (UDP).
    SampleFragment = 2,
    /// Registration: process entry.
    RegisterProcess = 10,
    /// Registration: publisher topic entry.
    RegisterPublisher = 11,
    /// Registration: subscriber topic entry.
    RegisterSubscriber = 12,
    /// Registration: service server entry.
    RegisterServer = 13,
    /// Registration: service client entry.
    RegisterClient = 14,
    /// Unregistration counterparts.
    UnregisterProcess = 20,
    /// Unregister a publisher.
    UnregisterPublisher = 21,
    /// Unregister a subscriber.
    UnregisterSubscriber = 22,
    /// Unregister a server.
    UnregisterServer = 23,
    /// Unregister a client.
    UnregisterClient = 24,
    /// Fire-and-forget shutdown request.
    ShutdownRequest = 30,
    /// One serialized log entry.
    LogEntry = 40,
}

impl RecordKind {
    /// Decode from a wire byte; `None` for kinds this version does not know.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(RecordKind::Sample),
            2 => Some(RecordKind::SampleFragment),
            10 => Some(RecordKind::RegisterProcess),
            11 => Some(RecordKind::RegisterPublisher),
            12 => Some(RecordKind::RegisterSubscriber),
            13 => Some(RecordKind::RegisterServer),
            14 => Some(RecordKind::RegisterClient),
            20 => Some(RecordKind::UnregisterProcess),
            21 => Some(RecordKind::UnregisterPublisher),
            22 => Some(RecordKind::UnregisterSubscriber),
            23 => Some(RecordKind::UnregisterServer),
            24 => Some(RecordKind::UnregisterClient),
            30 => Some(RecordKind::ShutdownRequest),
            40 => Some(RecordKind::LogEntry),
            _ => None,
        }
    }
}

/// Append-only body encoder.
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    /// Create an empty writer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a writer with reserved capacity.
    #[must_use]
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap),
        }
    }

    /// Consume the writer, returning the encoded body.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Append a byte.
    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    /// Append a little-endian u16.
    pub fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Append a little-endian u32.
    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Append a little-endian u64.
    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Append a little-endian i32.
    pub fn put_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Append a length-prefixed byte slice.
    pub fn put_bytes(&mut self, v: &[u8]) {
        self.put_u32(v.len() as u32);
        self.buf.extend_from_slice(v);
    }

    /// Append a length-prefixed UTF-8 string.
    pub fn put_str(&mut self, v: &str) {
        self.put_bytes(v.as_bytes());
    }
}

/// Body decoder over a borrowed slice.
///
/// Every accessor advances the cursor; trailing bytes the caller never asks
/// for are ignored by design (additive evolution).
#[derive(Debug)]
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    /// Wrap a body slice.
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes left after the cursor.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::Serialization(format!(
                "body truncated: need {} bytes, have {}",
                n,
                self.remaining()
            )));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    /// Read a byte.
    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    /// Read a little-endian u16.
    pub fn get_u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    /// Read a little-endian u32.
    pub fn get_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read a little-endian u64.
    pub fn get_u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    /// Read a little-endian i32.
    pub fn get_i32(&mut self) -> Result<i32> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read a length-prefixed byte slice.
    pub fn get_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.get_u32()? as usize;
        self.take(len)
    }

    /// Read a length-prefixed UTF-8 string.
    pub fn get_string(&mut self) -> Result<String> {
        let bytes = self.get_bytes()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::Serialization("string field is not valid UTF-8".into()))
    }
}

/// Frame a body with the hbus record header.
#[must_use]
pub fn encode_record(kind: RecordKind, body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_SIZE + body.len());
    frame.extend_from_slice(&WIRE_MAGIC.to_le_bytes());
    frame.push(WIRE_VERSION);
    frame.push(kind as u8);
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(body);
    frame
}

/// Parse a framed record.
///
/// Returns `Ok(None)` for frames of an unknown kind (skip, don't fail).
///
/// # Errors
///
/// Returns `Error::Serialization` on bad magic, a body length that exceeds
/// the buffer or [`MAX_BODY_SIZE`], or a truncated header.
pub fn decode_record(buf: &[u8]) -> Result<Option<(RecordKind, &[u8])>> {
    if buf.len() < HEADER_SIZE {
        return Err(Error::Serialization("frame shorter than header".into()));
    }
    let magic = u16::from_le_bytes([buf[0], buf[1]]);
    if magic != WIRE_MAGIC {
        return Err(Error::Serialization(format!(
            "bad frame magic 0x{:04X}",
            magic
        )));
    }
    // buf[2] is the version; additive evolution means any version parses.
    let kind = buf[3];
    let body_len = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
    if body_len > MAX_BODY_SIZE {
        return Err(Error::Serialization(format!(
            "frame body too large: {} bytes",
            body_len
        )));
    }
    if buf.len() < HEADER_SIZE + body_len {
        return Err(Error::Serialization("frame body truncated".into()));
    }
    let body = &buf[HEADER_SIZE..HEADER_SIZE + body_len];
    Ok(RecordKind::from_u8(kind).map(|k| (k, body)))
}

/// FNV-1a 64-bit hash, used for payload ids and topic group derivation.
#[must_use]
pub fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// The on-wire sample carrying one payload from a publisher to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleEnvelope {
    /// Sending publisher.
    pub topic_id: TopicId,
    /// Topic name (lets receivers route without a registration lookup).
    pub topic_name: String,
    /// Strictly monotonic per publisher.
    pub sequence: u64,
    /// Publisher clock at send time, epoch microseconds.
    pub send_clock_us: u64,
    /// Opaque user payload.
    pub payload: Vec<u8>,
    /// FNV-1a of the payload, for integrity and duplicate checks.
    pub payload_hash: u64,
}

impl SampleEnvelope {
    /// Build an envelope, computing the payload hash.
    #[must_use]
    pub fn new(
        topic_id: TopicId,
        topic_name: String,
        sequence: u64,
        send_clock_us: u64,
        payload: Vec<u8>,
    ) -> Self {
        let payload_hash = fnv1a64(&payload);
        Self {
            topic_id,
            topic_name,
            sequence,
            send_clock_us,
            payload,
            payload_hash,
        }
    }

    /// Encode the envelope body (no record header).
    #[must_use]
    pub fn encode_body(&self) -> Vec<u8> {
        let mut w = WireWriter::with_capacity(64 + self.payload.len());
        self.topic_id.encode(&mut w);
        w.put_str(&self.topic_name);
        w.put_u64(self.sequence);
        w.put_u64(self.send_clock_us);
        w.put_u64(self.payload_hash);
        w.put_bytes(&self.payload);
        w.into_bytes()
    }

    /// Decode an envelope body.
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` on truncation or a payload-hash
    /// mismatch.
    pub fn decode_body(body: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(body);
        let topic_id = TopicId::decode(&mut r)?;
        let topic_name = r.get_string()?;
        let sequence = r.get_u64()?;
        let send_clock_us = r.get_u64()?;
        let payload_hash = r.get_u64()?;
        let payload = r.get_bytes()?.to_vec();
        if fnv1a64(&payload) != payload_hash {
            return Err(Error::Serialization(format!(
                "payload hash mismatch for seq {} on '{}'",
                sequence, topic_name
            )));
        }
        Ok(Self {
            topic_id,
            topic_name,
            sequence,
            send_clock_us,
            payload,
            payload_hash,
        })
    }

    /// Encode as a complete framed record.
    #[must_use]
    pub fn encode_record(&self) -> Vec<u8> {
        encode_record(RecordKind::Sample, &self.encode_body())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_topic_id() -> TopicId {
        TopicId {
            host_name: "host-a".into(),
            process_id: 4242,
            serial: 7,
        }
    }

    #[test]
    fn record_roundtrip() {
        let frame = encode_record(RecordKind::Sample, b"payload");
        let (kind, body) = decode_record(&frame).unwrap().unwrap();
        assert_eq!(kind, RecordKind::Sample);
        assert_eq!(body, b"payload");
    }

    #[test]
    fn record_rejects_bad_magic() {
        let mut frame = encode_record(RecordKind::Sample, b"x");
        frame[0] = 0;
        assert!(decode_record(&frame).is_err());
    }

    #[test]
    fn record_skips_unknown_kind() {
        let mut frame = encode_record(RecordKind::Sample, b"x");
        frame[3] = 250;
        assert!(decode_record(&frame).unwrap().is_none());
    }

    #[test]
    fn record_rejects_truncated_body() {
        let mut frame = encode_record(RecordKind::Sample, b"longer payload");
        frame.truncate(frame.len() - 3);
        assert!(decode_record(&frame).is_err());
    }

    #[test]
    fn reader_ignores_trailing_bytes() {
        let mut w = WireWriter::new();
        w.put_u32(99);
        w.put_str("known");
        w.put_u64(123); // a field this "older" reader does not know
        let body = w.into_bytes();

        let mut r = WireReader::new(&body);
        assert_eq!(r.get_u32().unwrap(), 99);
        assert_eq!(r.get_string().unwrap(), "known");
        assert!(r.remaining() > 0);
    }

    #[test]
    fn envelope_roundtrip() {
        let env = SampleEnvelope::new(
            test_topic_id(),
            "sensors/temperature".into(),
            42,
            1_700_000_000_000_000,
            vec![1, 2, 3, 4, 5],
        );
        let body = env.encode_body();
        let decoded = SampleEnvelope::decode_body(&body).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn envelope_detects_corruption() {
        let env = SampleEnvelope::new(test_topic_id(), "t".into(), 1, 0, vec![9; 32]);
        let mut body = env.encode_body();
        let last = body.len() - 1;
        body[last] ^= 0xFF;
        assert!(SampleEnvelope::decode_body(&body).is_err());
    }

    #[test]
    fn fnv_known_vector() {
        // FNV-1a 64 of empty input is the offset basis.
        assert_eq!(fnv1a64(b""), 0xcbf2_9ce4_8422_2325);
        assert_ne!(fnv1a64(b"a"), fnv1a64(b"b"));
    }
}
