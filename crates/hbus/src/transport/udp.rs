// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! UDP multicast sample transport with MTU-sized fragmentation.
//!
//! Samples are split into datagrams carrying
//! `{topic_id, sequence, fragment_index, fragment_count, chunk}`. Receivers
//! reassemble by `(topic_id, sequence)`; buffers for incomplete samples
//! expire after one second and the sample is dropped.
//!
//! The multicast group for a topic is derived from a hash of the topic name
//! modulo the configured group range, so a subscriber joins only the groups
//! it actually needs.

use crate::config::{UdpConfig, MULTICAST_GROUP_BASE};
use crate::error::{Error, Result};
use crate::registration::entries::{EntityKey, TopicId};
use crate::wire::{
    decode_record, encode_record, RecordKind, SampleEnvelope, WireReader, WireWriter,
};
use lru::LruCache;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Payload bytes per fragment, chosen to keep datagrams under a 1500 MTU
/// with record and IP/UDP headers included.
pub const FRAGMENT_PAYLOAD: usize = 1400;

/// Receive buffer large enough for any fragment datagram.
const RECV_BUFFER: usize = 2048;

/// How long an incomplete sample may sit in the reassembly cache.
const REASSEMBLY_TTL: Duration = Duration::from_secs(1);

/// Bound on concurrently reassembling samples.
const REASSEMBLY_CAPACITY: usize = 256;

/// Derive the multicast group for a topic name.
///
/// `239.255.0.base + (fnv1a(topic) % mask)`, staying inside the configured
/// group range.
#[must_use]
pub fn topic_group(cfg: &UdpConfig, topic_name: &str) -> Ipv4Addr {
    let offset = (crate::wire::fnv1a64(topic_name.as_bytes()) % u64::from(cfg.mask)) as u8;
    let base = MULTICAST_GROUP_BASE.octets();
    Ipv4Addr::new(base[0], base[1], base[2], base[3].wrapping_add(offset))
}

/// Build a UDP socket bound for multicast reception on `port`.
///
/// `iface` selects the interface for joins and outbound multicast;
/// `Ipv4Addr::UNSPECIFIED` lets the kernel pick.
pub fn multicast_socket(port: u16, ttl: u8, iface: Ipv4Addr) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    set_reuse_port(&socket)?;
    socket.set_multicast_loop_v4(true)?;
    socket.set_multicast_ttl_v4(u32::from(ttl))?;
    if iface != Ipv4Addr::UNSPECIFIED {
        socket.set_multicast_if_v4(&iface)?;
    }
    let bind_addr = SocketAddr::from(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
    socket.bind(&bind_addr.into())?;
    Ok(socket.into())
}

/// Set `SO_REUSEPORT` so every hbus process on the host can bind the same
/// registration and sample ports.
#[cfg(unix)]
pub(crate) fn set_reuse_port(socket: &Socket) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;
    let fd = socket.as_raw_fd();
    let optval: libc::c_int = 1;
    // SAFETY: setsockopt FFI with a valid fd, a standard socket option, and
    // a correctly sized optval pointer.
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEPORT,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Split a sample envelope into fragment records ready to send.
#[must_use]
pub fn fragment_sample(envelope: &SampleEnvelope) -> Vec<Vec<u8>> {
    let body = envelope.encode_body();
    let count = body.len().div_ceil(FRAGMENT_PAYLOAD).max(1);
    let mut frames = Vec::with_capacity(count);
    for (index, chunk) in body.chunks(FRAGMENT_PAYLOAD).enumerate() {
        let mut w = WireWriter::with_capacity(48 + chunk.len());
        envelope.topic_id.encode(&mut w);
        w.put_u64(envelope.sequence);
        w.put_u16(index as u16);
        w.put_u16(count as u16);
        w.put_bytes(chunk);
        frames.push(encode_record(RecordKind::SampleFragment, &w.into_bytes()));
    }
    frames
}

/// One parsed fragment.
#[derive(Debug)]
pub struct Fragment {
    /// Sending publisher.
    pub topic_id: TopicId,
    /// Sample sequence the fragment belongs to.
    pub sequence: u64,
    /// Position within the sample.
    pub index: u16,
    /// Total fragments of the sample.
    pub count: u16,
    /// Chunk bytes.
    pub chunk: Vec<u8>,
}

fn decode_fragment(body: &[u8]) -> Result<Fragment> {
    let mut r = WireReader::new(body);
    let topic_id = TopicId::decode(&mut r)?;
    let sequence = r.get_u64()?;
    let index = r.get_u16()?;
    let count = r.get_u16()?;
    let chunk = r.get_bytes()?.to_vec();
    if count == 0 || index >= count {
        return Err(Error::Serialization(format!(
            "fragment index {} out of range (count {})",
            index, count
        )));
    }
    Ok(Fragment {
        topic_id,
        sequence,
        index,
        count,
        chunk,
    })
}

struct PartialSample {
    chunks: Vec<Option<Vec<u8>>>,
    received: usize,
    created: Instant,
}

/// Reassembles fragments into envelope bodies, dropping stale partials.
pub struct ReassemblyBuffer {
    cache: LruCache<(EntityKey, u64), PartialSample>,
    ttl: Duration,
    /// Incomplete samples dropped on expiry.
    pub expired: u64,
}

impl ReassemblyBuffer {
    /// Create a buffer bounded to `capacity` concurrent samples.
    #[must_use]
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            cache: LruCache::new(
                NonZeroUsize::new(capacity.max(1)).expect("capacity forced non-zero"),
            ),
            ttl,
            expired: 0,
        }
    }

    /// Feed one fragment; returns the completed envelope body when the last
    /// fragment arrives.
    pub fn push(&mut self, fragment: Fragment) -> Option<Vec<u8>> {
        let key = (fragment.topic_id.key(), fragment.sequence);
        let count = usize::from(fragment.count);

        // A stale partial under the same key restarts from scratch.
        if self
            .cache
            .get(&key)
            .is_some_and(|p| p.created.elapsed() > self.ttl)
        {
            self.cache.pop(&key);
            self.expired += 1;
        }

        if self.cache.get(&key).is_none() {
            self.cache.put(
                key.clone(),
                PartialSample {
                    chunks: vec![None; count],
                    received: 0,
                    created: Instant::now(),
                },
            );
        }
        let partial = self.cache.get_mut(&key)?;

        if partial.chunks.len() != count {
            // Conflicting fragment counts for the same sample; restart.
            partial.chunks = vec![None; count];
            partial.received = 0;
            partial.created = Instant::now();
        }

        let index = usize::from(fragment.index);
        if partial.chunks[index].is_none() {
            partial.chunks[index] = Some(fragment.chunk);
            partial.received += 1;
        }

        if partial.received == count {
            let done = self.cache.pop(&key)?;
            let mut body = Vec::new();
            for chunk in done.chunks.into_iter().flatten() {
                body.extend_from_slice(&chunk);
            }
            return Some(body);
        }
        None
    }

    /// Drop every partial older than the TTL.
    pub fn purge_expired(&mut self) {
        let stale: Vec<(EntityKey, u64)> = self
            .cache
            .iter()
            .filter(|(_, p)| p.created.elapsed() > self.ttl)
            .map(|(k, _)| k.clone())
            .collect();
        for key in stale {
            self.cache.pop(&key);
            self.expired += 1;
        }
    }
}

/// Sending half of the UDP sample transport; shared by all publishers.
pub struct UdpSampleSender {
    socket: UdpSocket,
    port: u16,
    cfg: UdpConfig,
}

impl UdpSampleSender {
    /// Create a sender with an ephemeral local port.
    pub fn new(cfg: &UdpConfig, sample_port: u16, iface: Ipv4Addr) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_multicast_loop_v4(true)?;
        socket.set_multicast_ttl_v4(u32::from(cfg.ttl))?;
        if iface != Ipv4Addr::UNSPECIFIED {
            socket.set_multicast_if_v4(&iface)?;
        }
        let bind_addr = SocketAddr::from(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
        socket.bind(&bind_addr.into())?;
        Ok(Self {
            socket: socket.into(),
            port: sample_port,
            cfg: cfg.clone(),
        })
    }

    /// Send one sample to its topic's multicast group.
    ///
    /// Returns the payload bytes accounted as sent.
    pub fn send_multicast(&self, envelope: &SampleEnvelope) -> Result<usize> {
        let group = topic_group(&self.cfg, &envelope.topic_name);
        let dest = SocketAddr::from(SocketAddrV4::new(group, self.port));
        self.send_to(envelope, dest)
    }

    /// Send one sample to an explicit destination (unicast mode).
    pub fn send_to(&self, envelope: &SampleEnvelope, dest: SocketAddr) -> Result<usize> {
        for frame in fragment_sample(envelope) {
            self.socket.send_to(&frame, dest)?;
        }
        Ok(envelope.payload.len())
    }
}

/// Receiving half of the UDP sample transport; one per context, shared by
/// all subscribers.
pub struct UdpSampleReceiver {
    socket: Arc<UdpSocket>,
    cfg: UdpConfig,
    iface: Ipv4Addr,
    joined: Mutex<Vec<(Ipv4Addr, usize)>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    running: Arc<AtomicBool>,
}

impl UdpSampleReceiver {
    /// Bind the sample port and start the reader thread pool.
    ///
    /// `deliver` runs on a pool thread for every fully reassembled sample.
    pub fn new(
        cfg: &UdpConfig,
        sample_port: u16,
        iface: Ipv4Addr,
        reader_threads: usize,
        running: Arc<AtomicBool>,
        deliver: Arc<dyn Fn(SampleEnvelope) + Send + Sync>,
    ) -> Result<Self> {
        let socket = Arc::new(multicast_socket(sample_port, cfg.ttl, iface)?);
        socket.set_read_timeout(Some(Duration::from_millis(100)))?;

        let reassembly = Arc::new(Mutex::new(ReassemblyBuffer::new(
            REASSEMBLY_CAPACITY,
            REASSEMBLY_TTL,
        )));

        let mut threads = Vec::new();
        for n in 0..reader_threads.max(1) {
            let socket = Arc::clone(&socket);
            let running = Arc::clone(&running);
            let reassembly = Arc::clone(&reassembly);
            let deliver = Arc::clone(&deliver);
            let handle = std::thread::Builder::new()
                .name(format!("hbus-udp-rx-{}", n))
                .spawn(move || {
                    receive_loop(&socket, &running, &reassembly, deliver.as_ref());
                })
                .map_err(|e| Error::Internal(format!("spawn udp reader: {}", e)))?;
            threads.push(handle);
        }

        Ok(Self {
            socket,
            cfg: cfg.clone(),
            iface,
            joined: Mutex::new(Vec::new()),
            threads: Mutex::new(threads),
            running,
        })
    }

    /// Join the multicast group of a topic (refcounted).
    pub fn join_topic(&self, topic_name: &str) -> Result<()> {
        let group = topic_group(&self.cfg, topic_name);
        let mut joined = self.joined.lock();
        if let Some(entry) = joined.iter_mut().find(|(g, _)| *g == group) {
            entry.1 += 1;
            return Ok(());
        }
        self.socket.join_multicast_v4(&group, &self.iface)?;
        log::debug!("[UDP] joined group {} for topic '{}'", group, topic_name);
        joined.push((group, 1));
        Ok(())
    }

    /// Leave a topic's group once the last subscriber is gone.
    pub fn leave_topic(&self, topic_name: &str) {
        let group = topic_group(&self.cfg, topic_name);
        let mut joined = self.joined.lock();
        if let Some(pos) = joined.iter().position(|(g, _)| *g == group) {
            joined[pos].1 -= 1;
            if joined[pos].1 == 0 {
                joined.remove(pos);
                self.socket.leave_multicast_v4(&group, &self.iface).ok();
                log::debug!("[UDP] left group {}", group);
            }
        }
    }

    /// Stop the reader pool and join its threads.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        for handle in self.threads.lock().drain(..) {
            handle.join().ok();
        }
    }
}

impl Drop for UdpSampleReceiver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn receive_loop(
    socket: &UdpSocket,
    running: &AtomicBool,
    reassembly: &Mutex<ReassemblyBuffer>,
    deliver: &(dyn Fn(SampleEnvelope) + Send + Sync),
) {
    let mut buf = [0u8; RECV_BUFFER];
    let mut last_purge = Instant::now();

    while running.load(Ordering::Acquire) {
        let len = match socket.recv_from(&mut buf) {
            Ok((len, _from)) => len,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                if last_purge.elapsed() > REASSEMBLY_TTL {
                    reassembly.lock().purge_expired();
                    last_purge = Instant::now();
                }
                continue;
            }
            Err(e) => {
                log::warn!("[UDP] receive failed: {}", e);
                continue;
            }
        };

        let frame = &buf[..len];
        let parsed = match decode_record(frame) {
            Ok(Some((RecordKind::SampleFragment, body))) => decode_fragment(body),
            Ok(_) => continue,
            Err(e) => {
                log::debug!("[UDP] dropped malformed frame: {}", e);
                continue;
            }
        };
        let fragment = match parsed {
            Ok(f) => f,
            Err(e) => {
                log::debug!("[UDP] dropped malformed fragment: {}", e);
                continue;
            }
        };

        let completed = reassembly.lock().push(fragment);
        if let Some(body) = completed {
            match SampleEnvelope::decode_body(&body) {
                Ok(envelope) => deliver(envelope),
                Err(e) => log::debug!("[UDP] dropped corrupt sample: {}", e),
            }
        }
    }
}
