// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Single-writer sample channel over a shared memory segment.
//!
//! One publisher owns the segment; every matched subscriber on the host maps
//! it and watches for new samples. The segment holds exactly one in-flight
//! sample (unreliable semantics: a slow reader misses overwritten samples
//! and the writer counts the miss).
//!
//! # Memory layout
//!
//! ```text
//! +--------------------------------------+
//! | ChannelHeader (64 bytes, aligned)    |
//! +--------------------------------------+
//! | payload[capacity]                    |
//! +--------------------------------------+
//! ```
//!
//! # Synchronization protocol
//!
//! Writer:
//! 1. wait up to `ack_timeout` for `ack_count == reader_count` (previous
//!    sample acknowledged); on expiry count the miss and proceed
//! 2. `write_state = (seq << 1) | 1` (odd = in progress)
//! 3. copy payload, set `payload_length` and `send_clock`
//! 4. `write_state = seq << 1` (Release), `sequence = seq` (Release)
//! 5. bump the event counter and wake readers via futex
//!
//! Reader:
//! 1. load `sequence` (Acquire); nothing new if `<=` own cursor
//! 2. verify `write_state == seq << 1` (committed, not in progress)
//! 3. copy payload, re-check `write_state`/`sequence` (torn-read detection)
//! 4. acknowledge via `ack_count`
//!
//! A payload larger than the segment triggers a grow: the writer flags the
//! old mapping `RELOCATED`, wakes readers, and re-creates the segment under
//! the same name with headroom; readers re-map transparently.

use super::futex::{futex_wait, futex_wake_all};
use super::segment::Segment;
use crate::error::{Error, Result};
use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Header magic ("HBSM").
const CHANNEL_MAGIC: u32 = 0x4842_534D;

/// Header version.
const CHANNEL_VERSION: u32 = 1;

/// The writer re-created the segment; re-map by name.
const FLAG_RELOCATED: u32 = 1;

/// The writer is gone; stop watching.
const FLAG_CLOSED: u32 = 2;

/// Control block at the start of every sample channel segment.
#[repr(C, align(64))]
pub struct ChannelHeader {
    magic: AtomicU32,
    version: AtomicU32,
    flags: AtomicU32,
    reader_count: AtomicU32,
    /// `(seq << 1) | 1` while the writer copies, `seq << 1` once committed.
    write_state: AtomicU64,
    payload_length: AtomicU64,
    send_clock: AtomicU64,
    /// Last committed sequence (1-based; 0 = nothing written yet).
    sequence: AtomicU64,
    capacity: AtomicU64,
    ack_count: AtomicU32,
    /// Futex event counter bumped on every commit.
    event: AtomicU32,
}

const HEADER_SIZE: usize = std::mem::size_of::<ChannelHeader>();

// The wire contract fixes the header at one cache line.
const _: () = assert!(HEADER_SIZE == 64);

/// One sample pulled out of a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShmSample {
    /// Copied payload bytes.
    pub payload: Vec<u8>,
    /// Publisher clock at send time, epoch microseconds.
    pub send_clock_us: u64,
    /// Publisher sequence number.
    pub sequence: u64,
}

/// Outcome of one write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteReport {
    /// Payload bytes written.
    pub bytes: usize,
    /// Readers that had not acknowledged the previous sample in time.
    pub ack_missed: u32,
}

/// Producing side of a sample channel. One per publisher.
pub struct ChannelWriter {
    segment: Segment,
    name: String,
    capacity: usize,
    min_size: usize,
    reserve_percent: usize,
    next_seq: u64,
}

impl ChannelWriter {
    /// Create the channel segment, replacing any stale one with this name.
    pub fn create(name: &str, min_size: usize, reserve_percent: usize) -> Result<Self> {
        let capacity = min_size.max(64);
        let segment = Segment::create(name, HEADER_SIZE + capacity)?;
        init_header(&segment, capacity);
        Ok(Self {
            segment,
            name: name.to_string(),
            capacity,
            min_size: capacity,
            reserve_percent,
            next_seq: 1,
        })
    }

    #[inline]
    fn header(&self) -> &ChannelHeader {
        // SAFETY: the segment is at least HEADER_SIZE bytes (enforced at
        // create/grow), page-aligned by mmap, and the header consists of
        // atomics designed for cross-process access.
        unsafe { &*(self.segment.as_ptr() as *const ChannelHeader) }
    }

    /// Write one sample, waiting for outstanding acknowledgements first.
    pub fn write(
        &mut self,
        payload: &[u8],
        send_clock_us: u64,
        ack_timeout: Duration,
    ) -> Result<WriteReport> {
        if payload.len() > self.capacity {
            self.grow(payload.len())?;
        }

        let mut ack_missed = 0u32;
        if self.next_seq > 1 {
            let header = self.header();
            let readers = header.reader_count.load(Ordering::Acquire);
            if readers > 0 {
                let deadline = Instant::now() + ack_timeout;
                loop {
                    let acked = header.ack_count.load(Ordering::Acquire);
                    if acked >= readers {
                        break;
                    }
                    if Instant::now() >= deadline {
                        ack_missed = readers - acked;
                        break;
                    }
                    std::thread::sleep(Duration::from_micros(20));
                }
            }
        }

        let seq = self.next_seq;
        let header = self.header();
        header.ack_count.store(0, Ordering::Release);
        header.write_state.store((seq << 1) | 1, Ordering::Relaxed);

        // SAFETY: the payload area starts HEADER_SIZE bytes into the mapping
        // and holds `capacity >= payload.len()` bytes. The odd write_state
        // marker keeps readers away, and there is exactly one writer.
        unsafe {
            let dst = self.segment.as_ptr().add(HEADER_SIZE);
            ptr::copy_nonoverlapping(payload.as_ptr(), dst, payload.len());
        }

        header
            .payload_length
            .store(payload.len() as u64, Ordering::Relaxed);
        header.send_clock.store(send_clock_us, Ordering::Relaxed);
        header.write_state.store(seq << 1, Ordering::Release);
        header.sequence.store(seq, Ordering::Release);
        header.event.fetch_add(1, Ordering::Release);
        futex_wake_all(&header.event);

        self.next_seq = seq + 1;
        Ok(WriteReport {
            bytes: payload.len(),
            ack_missed,
        })
    }

    /// Re-create the segment with room for `needed` bytes plus headroom.
    fn grow(&mut self, needed: usize) -> Result<()> {
        let new_capacity = (needed + needed * self.reserve_percent / 100).max(self.min_size);
        log::debug!(
            "[SHM] growing channel {} from {} to {} payload bytes",
            self.name,
            self.capacity,
            new_capacity
        );

        // Point readers of the old mapping at the new segment.
        let header = self.header();
        header.flags.fetch_or(FLAG_RELOCATED, Ordering::Release);
        header.event.fetch_add(1, Ordering::Release);
        futex_wake_all(&header.event);

        let segment = Segment::create(&self.name, HEADER_SIZE + new_capacity)?;
        init_header(&segment, new_capacity);
        self.segment = segment;
        self.capacity = new_capacity;
        Ok(())
    }

    /// The segment name readers attach to.
    #[must_use]
    pub fn segment_name(&self) -> &str {
        &self.name
    }

    /// Next sequence number to be written.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.next_seq
    }

    /// Current payload capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Drop for ChannelWriter {
    fn drop(&mut self) {
        let header = self.header();
        header.flags.fetch_or(FLAG_CLOSED, Ordering::Release);
        header.event.fetch_add(1, Ordering::Release);
        futex_wake_all(&header.event);
        Segment::unlink(&self.name).ok();
    }
}

fn init_header(segment: &Segment, capacity: usize) {
    // SAFETY: the segment was just created with at least HEADER_SIZE bytes,
    // zero-initialized, with no other mappings yet.
    let header = unsafe { &*(segment.as_ptr() as *const ChannelHeader) };
    header.capacity.store(capacity as u64, Ordering::Relaxed);
    header.version.store(CHANNEL_VERSION, Ordering::Relaxed);
    header.magic.store(CHANNEL_MAGIC, Ordering::Release);
}

/// Result of one non-blocking poll, carrying the delivery closure's output.
enum ReadStep<R> {
    Sample(R),
    Empty,
    Closed,
}

/// Consuming side of a sample channel. Many per segment.
pub struct ChannelReader {
    segment: Segment,
    name: String,
    capacity: usize,
    last_seq: u64,
}

impl ChannelReader {
    /// Attach to an existing channel.
    ///
    /// Attaching positions the cursor at the current sequence, so only
    /// samples written after the attach are delivered.
    pub fn attach(name: &str) -> Result<Self> {
        let segment = Segment::open_auto(name)?;
        if segment.size() < HEADER_SIZE {
            return Err(Error::Internal(format!(
                "channel segment {} too small",
                name
            )));
        }
        // SAFETY: the mapping spans at least HEADER_SIZE bytes (checked) and
        // the header is all atomics.
        let header = unsafe { &*(segment.as_ptr() as *const ChannelHeader) };
        if header.magic.load(Ordering::Acquire) != CHANNEL_MAGIC {
            return Err(Error::Internal(format!(
                "channel segment {} has no valid header",
                name
            )));
        }
        let capacity = header.capacity.load(Ordering::Acquire) as usize;
        let last_seq = header.sequence.load(Ordering::Acquire);
        header.reader_count.fetch_add(1, Ordering::AcqRel);
        Ok(Self {
            segment,
            name: name.to_string(),
            capacity,
            last_seq,
        })
    }

    #[inline]
    fn header(&self) -> &ChannelHeader {
        // SAFETY: validated in attach()/reattach(); all fields are atomics.
        unsafe { &*(self.segment.as_ptr() as *const ChannelHeader) }
    }

    /// Blocking read of the next sample.
    ///
    /// Returns `Ok(None)` on timeout.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` once the writer has closed the channel.
    pub fn read(&mut self, timeout: Duration) -> Result<Option<ShmSample>> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.try_read(|payload, clock, seq| ShmSample {
                payload: payload.to_vec(),
                send_clock_us: clock,
                sequence: seq,
            })? {
                ReadStep::Sample(sample) => return Ok(Some(sample)),
                ReadStep::Closed => return Err(Error::NotFound),
                ReadStep::Empty => {}
            }

            let snapshot = self.header().event.load(Ordering::Acquire);

            // Re-poll between snapshot and wait to close the lost-wake race.
            match self.try_read(|payload, clock, seq| ShmSample {
                payload: payload.to_vec(),
                send_clock_us: clock,
                sequence: seq,
            })? {
                ReadStep::Sample(sample) => return Ok(Some(sample)),
                ReadStep::Closed => return Err(Error::NotFound),
                ReadStep::Empty => {}
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            futex_wait(&self.header().event, snapshot, Some(deadline - now));
        }
    }

    /// Blocking read delivering a borrowed view of the payload (zero-copy).
    ///
    /// The slice handed to `f` is only valid for the duration of the call;
    /// the sample is acknowledged when `f` returns. A callback that outlives
    /// the writer's ack timeout may observe the slot being overwritten (the
    /// writer treats it as abandoned); such a delivery is discarded and `f`
    /// runs again for the replacing sample.
    pub fn read_with<R>(
        &mut self,
        timeout: Duration,
        mut f: impl FnMut(&[u8], u64, u64) -> R,
    ) -> Result<Option<R>> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.try_read(&mut f)? {
                ReadStep::Sample(out) => return Ok(Some(out)),
                ReadStep::Closed => return Err(Error::NotFound),
                ReadStep::Empty => {}
            }

            let snapshot = self.header().event.load(Ordering::Acquire);
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            futex_wait(&self.header().event, snapshot, Some(deadline - now));
        }
    }

    /// One non-blocking poll. `deliver` runs while the payload view is
    /// protected by the torn-read re-check; its result is discarded if the
    /// check fails.
    fn try_read<R>(&mut self, deliver: impl FnOnce(&[u8], u64, u64) -> R) -> Result<ReadStep<R>> {
        let flags = self.header().flags.load(Ordering::Acquire);
        if flags & FLAG_CLOSED != 0 {
            return Ok(ReadStep::Closed);
        }
        if flags & FLAG_RELOCATED != 0 {
            self.reattach()?;
        }

        let header = self.header();
        let seq = header.sequence.load(Ordering::Acquire);
        if seq <= self.last_seq {
            return Ok(ReadStep::Empty);
        }

        let state = header.write_state.load(Ordering::Acquire);
        if state != seq << 1 {
            // Write in progress or already superseded; poll again.
            return Ok(ReadStep::Empty);
        }

        let len = header.payload_length.load(Ordering::Acquire) as usize;
        if len > self.capacity {
            return Ok(ReadStep::Empty);
        }
        let clock = header.send_clock.load(Ordering::Acquire);

        // SAFETY: the payload area starts HEADER_SIZE into the mapping and
        // len <= capacity (checked above). A concurrent overwrite is caught
        // by the state re-check below, after which the result is discarded.
        let payload = unsafe {
            std::slice::from_raw_parts(self.segment.as_ptr().add(HEADER_SIZE) as *const u8, len)
        };
        let out = deliver(payload, clock, seq);

        if header.write_state.load(Ordering::Acquire) != state
            || header.sequence.load(Ordering::Acquire) != seq
        {
            // Torn read; the next poll sees the newer sample.
            return Ok(ReadStep::Empty);
        }

        header.ack_count.fetch_add(1, Ordering::AcqRel);
        self.last_seq = seq;
        Ok(ReadStep::Sample(out))
    }

    /// Re-map after the writer grew the segment.
    fn reattach(&mut self) -> Result<()> {
        let segment = Segment::open_auto(&self.name)?;
        if segment.size() < HEADER_SIZE {
            return Err(Error::Internal(format!(
                "channel segment {} too small after grow",
                self.name
            )));
        }
        // SAFETY: size checked; header is all atomics.
        let header = unsafe { &*(segment.as_ptr() as *const ChannelHeader) };
        if header.magic.load(Ordering::Acquire) != CHANNEL_MAGIC {
            return Err(Error::Internal(format!(
                "channel segment {} lost its header after grow",
                self.name
            )));
        }
        let capacity = header.capacity.load(Ordering::Acquire) as usize;
        header.reader_count.fetch_add(1, Ordering::AcqRel);
        log::debug!(
            "[SHM] re-mapped channel {} (payload capacity {})",
            self.name,
            capacity
        );
        self.segment = segment;
        self.capacity = capacity;
        Ok(())
    }

    /// The reader's delivery cursor.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.last_seq
    }
}

impl Drop for ChannelReader {
    fn drop(&mut self) {
        self.header().reader_count.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn unique_name(tag: &str) -> String {
        use std::time::{SystemTime, UNIX_EPOCH};
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("/hbus_chan_{}_{}", tag, ts)
    }

    #[test]
    fn write_read_roundtrip() {
        let name = unique_name("rt");
        let mut writer = ChannelWriter::create(&name, 4096, 50).expect("create");
        let mut reader = ChannelReader::attach(&name).expect("attach");

        writer
            .write(b"hello shm", 1234, Duration::from_millis(5))
            .expect("write");

        let sample = reader
            .read(Duration::from_millis(500))
            .expect("read")
            .expect("sample");
        assert_eq!(sample.payload, b"hello shm");
        assert_eq!(sample.send_clock_us, 1234);
        assert_eq!(sample.sequence, 1);
    }

    #[test]
    fn attach_skips_history() {
        let name = unique_name("hist");
        let mut writer = ChannelWriter::create(&name, 4096, 50).expect("create");
        writer
            .write(b"old", 1, Duration::from_millis(5))
            .expect("write");

        let mut reader = ChannelReader::attach(&name).expect("attach");
        // The pre-attach sample is never delivered.
        assert!(reader
            .read(Duration::from_millis(50))
            .expect("read")
            .is_none());

        writer
            .write(b"new", 2, Duration::from_millis(5))
            .expect("write");
        let sample = reader
            .read(Duration::from_millis(500))
            .expect("read")
            .expect("sample");
        assert_eq!(sample.payload, b"new");
    }

    #[test]
    fn unacknowledged_reader_counts_as_missed() {
        let name = unique_name("ack");
        let mut writer = ChannelWriter::create(&name, 4096, 50).expect("create");
        let _reader = ChannelReader::attach(&name).expect("attach");

        let first = writer
            .write(b"a", 0, Duration::from_millis(2))
            .expect("write");
        assert_eq!(first.ack_missed, 0);

        // The reader never polls, so the second write times out on the ack.
        let second = writer
            .write(b"b", 0, Duration::from_millis(2))
            .expect("write");
        assert_eq!(second.ack_missed, 1);
    }

    #[test]
    fn oversized_payload_grows_segment_and_reader_remaps() {
        let name = unique_name("grow");
        let mut writer = ChannelWriter::create(&name, 64, 50).expect("create");
        let mut reader = ChannelReader::attach(&name).expect("attach");

        let big = vec![0xABu8; 4096];
        writer
            .write(&big, 9, Duration::from_millis(5))
            .expect("write");
        assert!(writer.capacity() >= 4096);

        let sample = reader
            .read(Duration::from_millis(1000))
            .expect("read")
            .expect("sample");
        assert_eq!(sample.payload, big);
        assert_eq!(sample.sequence, 1);
    }

    #[test]
    fn closed_channel_reports_not_found() {
        let name = unique_name("close");
        let writer = ChannelWriter::create(&name, 4096, 50).expect("create");
        let mut reader = ChannelReader::attach(&name).expect("attach");
        drop(writer);

        assert!(matches!(
            reader.read(Duration::from_millis(200)),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn zero_copy_read_delivers_borrowed_payload() {
        let name = unique_name("zc");
        let mut writer = ChannelWriter::create(&name, 4096, 50).expect("create");
        let mut reader = ChannelReader::attach(&name).expect("attach");

        writer
            .write(b"borrowed", 7, Duration::from_millis(5))
            .expect("write");

        let len = reader
            .read_with(Duration::from_millis(500), |payload, clock, seq| {
                assert_eq!(payload, b"borrowed");
                assert_eq!(clock, 7);
                assert_eq!(seq, 1);
                payload.len()
            })
            .expect("read")
            .expect("sample");
        assert_eq!(len, 8);
    }

    #[test]
    fn concurrent_stream_delivers_in_order() {
        let name = unique_name("conc");
        let mut writer = ChannelWriter::create(&name, 4096, 50).expect("create");
        let reader_name = name.clone();

        let handle = thread::spawn(move || {
            let mut reader = ChannelReader::attach(&reader_name).expect("attach");
            let mut seen = Vec::new();
            while seen.len() < 50 {
                match reader.read(Duration::from_millis(2000)) {
                    Ok(Some(sample)) => seen.push(sample.sequence),
                    Ok(None) => break,
                    Err(_) => break,
                }
            }
            seen
        });

        // Give the reader a moment to attach so no sample predates it.
        thread::sleep(Duration::from_millis(50));
        for i in 0..50u32 {
            writer
                .write(&i.to_le_bytes(), 0, Duration::from_millis(50))
                .expect("write");
        }

        let seen = handle.join().expect("reader");
        assert!(!seen.is_empty());
        assert!(seen.windows(2).all(|w| w[0] < w[1]), "sequences not strictly increasing: {:?}", seen);
    }
}
