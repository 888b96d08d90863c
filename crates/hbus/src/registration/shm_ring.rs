// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Host-local registration channel: a shared broadcast ring every hbus
//! process on the host appends its announcements to and reads the others'
//! from.
//!
//! # Memory layout
//!
//! ```text
//! +--------------------------------------+
//! | RingHeader (64 bytes, aligned)       |
//! +--------------------------------------+
//! | record area: [len u32][bytes] ...    |   wraps at capacity
//! +--------------------------------------+
//! ```
//!
//! Writers serialize on a cross-process spinlock with a bounded acquire (a
//! crashed lock holder costs one skipped announcement cycle, never a hang).
//! `write_cursor` is an absolute byte offset published with Release ordering
//! after the record bytes are in place; readers chase it with their own
//! cursor and resynchronize to the head on overrun. Announcements are
//! refreshed every interval anyway, so a lost record heals within one cycle.

use crate::error::{Error, Result};
use crate::transport::shm::{futex_wait, futex_wake_all, Segment};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Header magic ("HBRG").
const RING_MAGIC: u32 = 0x4842_5247;

/// Header version.
const RING_VERSION: u32 = 1;

/// Give a concurrent creator this long to initialize the header.
const INIT_WAIT: Duration = Duration::from_millis(200);

/// Bounded spinlock acquire; a dead holder only costs this much.
const LOCK_WAIT: Duration = Duration::from_millis(100);

/// Control block at the start of the ring segment.
#[repr(C, align(64))]
struct RingHeader {
    magic: AtomicU32,
    version: AtomicU32,
    /// 0 = free, 1 = held.
    lock: AtomicU32,
    /// Futex event counter bumped on every append.
    event: AtomicU32,
    /// Absolute bytes ever written; `% capacity` is the physical offset.
    write_cursor: AtomicU64,
    capacity: AtomicU64,
}

const HEADER_SIZE: usize = std::mem::size_of::<RingHeader>();

const _: () = assert!(HEADER_SIZE == 64);

/// Name of the host-local registration ring for a given domain port.
#[must_use]
pub fn ring_name(port: u16) -> String {
    format!("/hbus_reg_{}", port)
}

/// The shared broadcast ring, opened by every process on the host.
pub struct BroadcastRing {
    segment: Segment,
    capacity: usize,
}

impl BroadcastRing {
    /// Open the ring, creating it when this process is first on the host.
    pub fn open(name: &str, capacity: usize) -> Result<Self> {
        loop {
            match Segment::open_auto(name) {
                Ok(segment) => {
                    let ring = Self::validate(segment)?;
                    return Ok(ring);
                }
                Err(Error::NotFound) => {}
                Err(e) => return Err(e),
            }

            match Segment::create_exclusive(name, HEADER_SIZE + capacity) {
                Ok(segment) => {
                    // SAFETY: freshly created zeroed mapping of at least
                    // HEADER_SIZE bytes; no other process sees it until the
                    // magic is published below.
                    let header = unsafe { &*(segment.as_ptr() as *const RingHeader) };
                    header.capacity.store(capacity as u64, Ordering::Relaxed);
                    header.version.store(RING_VERSION, Ordering::Relaxed);
                    header.magic.store(RING_MAGIC, Ordering::Release);
                    return Ok(Self { segment, capacity });
                }
                // Lost the creation race; loop back to open.
                Err(Error::AlreadyExists(_)) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn validate(segment: Segment) -> Result<Self> {
        if segment.size() < HEADER_SIZE {
            return Err(Error::Internal("registration ring too small".into()));
        }
        // SAFETY: the mapping spans at least HEADER_SIZE bytes; the header
        // is all atomics.
        let header = unsafe { &*(segment.as_ptr() as *const RingHeader) };

        // The creator may still be between ftruncate and header init.
        let deadline = Instant::now() + INIT_WAIT;
        while header.magic.load(Ordering::Acquire) != RING_MAGIC {
            if Instant::now() >= deadline {
                return Err(Error::Internal(
                    "registration ring header never initialized".into(),
                ));
            }
            std::thread::sleep(Duration::from_millis(1));
        }

        let capacity = header.capacity.load(Ordering::Acquire) as usize;
        if capacity == 0 || segment.size() < HEADER_SIZE + capacity {
            return Err(Error::Internal("registration ring capacity corrupt".into()));
        }
        Ok(Self { segment, capacity })
    }

    #[inline]
    fn header(&self) -> &RingHeader {
        // SAFETY: validated in open(); all fields are atomics.
        unsafe { &*(self.segment.as_ptr() as *const RingHeader) }
    }

    #[inline]
    fn data_ptr(&self) -> *mut u8 {
        // SAFETY: the mapping spans HEADER_SIZE + capacity bytes.
        unsafe { self.segment.as_ptr().add(HEADER_SIZE) }
    }

    /// Copy `bytes` into the ring at absolute offset `at`, wrapping.
    fn copy_in(&self, at: u64, bytes: &[u8]) {
        let off = (at % self.capacity as u64) as usize;
        let first = bytes.len().min(self.capacity - off);
        // SAFETY: off + first <= capacity and the remainder lands at offset
        // 0; both ranges stay inside the record area. The spinlock gives the
        // writer exclusive append access.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.data_ptr().add(off), first);
            if first < bytes.len() {
                std::ptr::copy_nonoverlapping(
                    bytes.as_ptr().add(first),
                    self.data_ptr(),
                    bytes.len() - first,
                );
            }
        }
    }

    /// Copy `len` bytes out of the ring at absolute offset `at`, wrapping.
    fn copy_out(&self, at: u64, len: usize) -> Vec<u8> {
        let off = (at % self.capacity as u64) as usize;
        let mut out = vec![0u8; len];
        let first = len.min(self.capacity - off);
        // SAFETY: both ranges stay inside the record area; a concurrent
        // overwrite is caught by the caller's cursor re-check.
        unsafe {
            std::ptr::copy_nonoverlapping(self.data_ptr().add(off), out.as_mut_ptr(), first);
            if first < len {
                std::ptr::copy_nonoverlapping(
                    self.data_ptr(),
                    out.as_mut_ptr().add(first),
                    len - first,
                );
            }
        }
        out
    }

    /// Append one record, waking blocked readers.
    ///
    /// # Errors
    ///
    /// `Error::Timeout` when the ring lock could not be acquired (a crashed
    /// holder); `Error::InvalidArgument` for records larger than the ring.
    pub fn append(&self, record: &[u8]) -> Result<()> {
        let total = 4 + record.len();
        if total > self.capacity {
            return Err(Error::InvalidArgument(format!(
                "record of {} bytes exceeds ring capacity {}",
                record.len(),
                self.capacity
            )));
        }

        let header = self.header();
        let deadline = Instant::now() + LOCK_WAIT;
        while header
            .lock
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            if Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
            std::hint::spin_loop();
            std::thread::sleep(Duration::from_micros(20));
        }

        let at = header.write_cursor.load(Ordering::Relaxed);
        self.copy_in(at, &(record.len() as u32).to_le_bytes());
        self.copy_in(at + 4, record);
        header
            .write_cursor
            .store(at + total as u64, Ordering::Release);
        header.lock.store(0, Ordering::Release);

        header.event.fetch_add(1, Ordering::Release);
        futex_wake_all(&header.event);
        Ok(())
    }

    /// A cursor positioned at the current head (past records are skipped).
    #[must_use]
    pub fn cursor(&self) -> u64 {
        self.header().write_cursor.load(Ordering::Acquire)
    }

    /// Read the record at `cursor`, advancing it.
    ///
    /// Returns `None` when the cursor has caught up. On overrun the cursor
    /// resynchronizes to the head and the lost records are dropped (the next
    /// refresh cycle re-announces everything).
    pub fn read_next(&self, cursor: &mut u64) -> Option<Vec<u8>> {
        let header = self.header();
        loop {
            let head = header.write_cursor.load(Ordering::Acquire);
            if *cursor >= head {
                return None;
            }
            if head - *cursor > self.capacity as u64 {
                *cursor = head;
                continue;
            }

            let len_bytes = self.copy_out(*cursor, 4);
            let len = u32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]])
                as usize;
            if 4 + len > self.capacity {
                // Torn length read after an overrun; resync.
                *cursor = header.write_cursor.load(Ordering::Acquire);
                continue;
            }
            let record = self.copy_out(*cursor + 4, len);

            // The writer may have lapped us while copying.
            let head_after = header.write_cursor.load(Ordering::Acquire);
            if head_after - *cursor > self.capacity as u64 {
                *cursor = head_after;
                continue;
            }

            *cursor += 4 + len as u64;
            return Some(record);
        }
    }

    /// Block until the ring advances past `event_snapshot` or `timeout`.
    pub fn wait(&self, event_snapshot: u32, timeout: Duration) {
        futex_wait(&self.header().event, event_snapshot, Some(timeout));
    }

    /// Current event counter, for the wait double-check pattern.
    #[must_use]
    pub fn event_snapshot(&self) -> u32 {
        self.header().event.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        use std::time::{SystemTime, UNIX_EPOCH};
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("/hbus_ringtest_{}_{}", tag, ts)
    }

    #[test]
    fn append_read_roundtrip() {
        let name = unique_name("rt");
        let ring = BroadcastRing::open(&name, 4096).expect("open");
        let mut cursor = ring.cursor();

        ring.append(b"first").expect("append");
        ring.append(b"second").expect("append");

        assert_eq!(ring.read_next(&mut cursor).unwrap(), b"first");
        assert_eq!(ring.read_next(&mut cursor).unwrap(), b"second");
        assert!(ring.read_next(&mut cursor).is_none());

        Segment::unlink(&name).ok();
    }

    #[test]
    fn two_handles_share_the_ring() {
        let name = unique_name("share");
        let writer = BroadcastRing::open(&name, 4096).expect("open writer");
        let reader = BroadcastRing::open(&name, 4096).expect("open reader");
        let mut cursor = reader.cursor();

        writer.append(b"hello peers").expect("append");
        assert_eq!(reader.read_next(&mut cursor).unwrap(), b"hello peers");

        Segment::unlink(&name).ok();
    }

    #[test]
    fn records_wrap_around_the_boundary() {
        let name = unique_name("wrap");
        let ring = BroadcastRing::open(&name, 128).expect("open");
        let mut cursor = ring.cursor();

        // Enough appends to wrap several times; reader keeps up.
        for i in 0..50u32 {
            let record = [i as u8; 20];
            ring.append(&record).expect("append");
            let read = ring.read_next(&mut cursor).expect("record");
            assert_eq!(read, record);
        }

        Segment::unlink(&name).ok();
    }

    #[test]
    fn lapped_reader_resynchronizes() {
        let name = unique_name("lap");
        let ring = BroadcastRing::open(&name, 128).expect("open");
        let mut cursor = ring.cursor();

        // Write far more than capacity without reading; the reader is lapped
        // and jumps to the head, dropping everything in between.
        for i in 0..50u32 {
            ring.append(&[i as u8; 20]).expect("append");
        }
        assert!(ring.read_next(&mut cursor).is_none());
        assert_eq!(cursor, ring.cursor());

        // Fresh records after the resync flow normally again.
        ring.append(b"after the lap").expect("append");
        assert_eq!(ring.read_next(&mut cursor).unwrap(), b"after the lap");

        Segment::unlink(&name).ok();
    }

    #[test]
    fn oversized_record_is_rejected() {
        let name = unique_name("big");
        let ring = BroadcastRing::open(&name, 128).expect("open");
        assert!(matches!(
            ring.append(&[0u8; 256]),
            Err(Error::InvalidArgument(_))
        ));
        Segment::unlink(&name).ok();
    }
}
