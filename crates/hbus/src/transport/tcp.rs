// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TCP sample transport: length-prefixed framed streams, one per
//! publisher->subscriber pair.
//!
//! The subscriber listens on an OS-assigned port advertised through
//! registration; the publisher connects and pushes framed sample records.
//! Backpressure is the socket's: writes block up to a bounded send window,
//! beyond that the sample is dropped and counted. Reconnects back off
//! exponentially from 125 ms up to 5 s.
//!
//! # Frame layout
//!
//! ```text
//! +----------------+------------------------+
//! | length u32 BE  | hbus record bytes      |
//! +----------------+------------------------+
//! ```

use crate::error::{Error, Result};
use crate::wire::{decode_record, RecordKind, SampleEnvelope, MAX_BODY_SIZE};
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Frame length prefix size.
pub const FRAME_HEADER_SIZE: usize = 4;

/// Largest frame a receiver accepts.
pub const MAX_FRAME_SIZE: usize = MAX_BODY_SIZE + 64;

/// First reconnect delay.
pub const BACKOFF_INITIAL: Duration = Duration::from_millis(125);

/// Reconnect delay cap.
pub const BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Connect timeout for outbound sample streams.
const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

/// Bounded blocking-write window; beyond it the sample is dropped.
const WRITE_TIMEOUT: Duration = Duration::from_millis(500);

/// Prefix a record with its length.
#[must_use]
pub fn encode_frame(record: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + record.len());
    frame.extend_from_slice(&(record.len() as u32).to_be_bytes());
    frame.extend_from_slice(record);
    frame
}

/// Read one frame from a blocking stream with a read timeout installed.
///
/// Returns `Ok(None)` on a clean EOF at a frame boundary or when `running`
/// goes false while waiting.
///
/// # Errors
///
/// I/O errors, an oversized length prefix, and EOF mid-frame are errors.
pub fn read_frame(
    stream: &mut TcpStream,
    max: usize,
    running: &AtomicBool,
) -> io::Result<Option<Vec<u8>>> {
    read_frame_until(stream, max, running, None)
}

/// [`read_frame`] with an absolute deadline; expiry reads as `TimedOut`.
pub fn read_frame_until(
    stream: &mut TcpStream,
    max: usize,
    running: &AtomicBool,
    deadline: Option<Instant>,
) -> io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    if !read_full(stream, &mut header, running, true, deadline)? {
        return Ok(None);
    }
    let len = u32::from_be_bytes(header) as usize;
    if len > max {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {} bytes (max {})", len, max),
        ));
    }
    let mut body = vec![0u8; len];
    if !read_full(stream, &mut body, running, false, deadline)? {
        return Ok(None);
    }
    Ok(Some(body))
}

/// Fill `buf`, riding out read timeouts while `running` holds and the
/// deadline (if any) has not passed.
///
/// Returns `Ok(false)` when cancelled, or on EOF if `eof_ok` and no byte was
/// consumed yet.
fn read_full(
    stream: &mut TcpStream,
    buf: &mut [u8],
    running: &AtomicBool,
    eof_ok: bool,
    deadline: Option<Instant>,
) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        if !running.load(Ordering::Acquire) {
            return Ok(false);
        }
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "read deadline"));
            }
        }
        match stream.read(&mut buf[filled..]) {
            Ok(0) => {
                if eof_ok && filled == 0 {
                    return Ok(false);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed mid-frame",
                ));
            }
            Ok(n) => filled += n,
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

/// Exponential reconnect backoff, 125 ms doubling to a 5 s cap.
#[derive(Debug)]
pub struct Backoff {
    current: Duration,
}

impl Backoff {
    /// Start at the initial delay.
    #[must_use]
    pub fn new() -> Self {
        Self {
            current: BACKOFF_INITIAL,
        }
    }

    /// Take the next delay and double for the time after.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(BACKOFF_MAX);
        delay
    }

    /// Back to the initial delay after a successful connect.
    pub fn reset(&mut self) {
        self.current = BACKOFF_INITIAL;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

/// Outbound sample stream to one subscriber. Owned by a publisher.
pub struct SampleConnector {
    addr: SocketAddr,
    stream: Option<TcpStream>,
    backoff: Backoff,
    retry_at: Option<Instant>,
    /// Samples dropped on connect failures and write backpressure.
    pub drops: u64,
}

impl SampleConnector {
    /// Create a connector; the stream is established lazily on first send.
    #[must_use]
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            stream: None,
            backoff: Backoff::new(),
            retry_at: None,
            drops: 0,
        }
    }

    /// The peer address.
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Send one frame; returns false (and counts a drop) when the peer is
    /// unreachable or the send window stayed full past the write timeout.
    pub fn send_frame(&mut self, frame: &[u8]) -> bool {
        if let Some(retry_at) = self.retry_at {
            if Instant::now() < retry_at {
                self.drops += 1;
                return false;
            }
            self.retry_at = None;
        }

        if self.stream.is_none() {
            match TcpStream::connect_timeout(&self.addr, CONNECT_TIMEOUT) {
                Ok(stream) => {
                    stream.set_nodelay(true).ok();
                    stream.set_write_timeout(Some(WRITE_TIMEOUT)).ok();
                    self.backoff.reset();
                    self.stream = Some(stream);
                }
                Err(e) => {
                    let delay = self.backoff.next_delay();
                    log::debug!(
                        "[TCP] connect to {} failed ({}), retrying in {:?}",
                        self.addr,
                        e,
                        delay
                    );
                    self.retry_at = Some(Instant::now() + delay);
                    self.drops += 1;
                    return false;
                }
            }
        }

        let stream = self.stream.as_mut().expect("stream established above");
        if let Err(e) = stream.write_all(frame) {
            log::debug!("[TCP] write to {} failed: {}", self.addr, e);
            self.stream = None;
            self.retry_at = Some(Instant::now() + self.backoff.next_delay());
            self.drops += 1;
            return false;
        }
        true
    }
}

/// Inbound sample listener. Owned by a subscriber; the port is advertised
/// through registration.
pub struct SampleServer {
    port: u16,
    running: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
    connections: Arc<AtomicU64>,
}

impl SampleServer {
    /// Bind an OS-assigned port and start accepting sample streams.
    ///
    /// `deliver` runs on the per-connection reader thread for every decoded
    /// sample record.
    pub fn start(
        running: Arc<AtomicBool>,
        deliver: Arc<dyn Fn(SampleEnvelope) + Send + Sync>,
    ) -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        let port = listener.local_addr()?.port();
        listener.set_nonblocking(true)?;

        let connections = Arc::new(AtomicU64::new(0));
        let accept_running = Arc::clone(&running);
        let accept_connections = Arc::clone(&connections);
        let accept_thread = std::thread::Builder::new()
            .name("hbus-tcp-accept".into())
            .spawn(move || {
                accept_loop(&listener, &accept_running, &accept_connections, &deliver);
            })
            .map_err(|e| Error::Internal(format!("spawn tcp accept: {}", e)))?;

        log::debug!("[TCP] sample server listening on port {}", port);
        Ok(Self {
            port,
            running,
            accept_thread: Some(accept_thread),
            connections,
        })
    }

    /// The advertised port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Live inbound connections.
    #[must_use]
    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Acquire)
    }

    /// Stop accepting and join the accept thread. Reader threads drain on
    /// the shared running flag.
    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.accept_thread.take() {
            handle.join().ok();
        }
    }
}

impl Drop for SampleServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(
    listener: &TcpListener,
    running: &Arc<AtomicBool>,
    connections: &Arc<AtomicU64>,
    deliver: &Arc<dyn Fn(SampleEnvelope) + Send + Sync>,
) {
    while running.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, peer)) => {
                log::debug!("[TCP] sample stream from {}", peer);
                stream.set_nodelay(true).ok();
                if stream
                    .set_read_timeout(Some(Duration::from_millis(100)))
                    .is_err()
                {
                    continue;
                }
                let running = Arc::clone(running);
                let conn_count = Arc::clone(connections);
                let deliver = Arc::clone(deliver);
                connections.fetch_add(1, Ordering::AcqRel);
                let spawned = std::thread::Builder::new()
                    .name("hbus-tcp-read".into())
                    .spawn(move || {
                        reader_loop(stream, &running, &*deliver);
                        conn_count.fetch_sub(1, Ordering::AcqRel);
                    });
                if spawned.is_err() {
                    connections.fetch_sub(1, Ordering::AcqRel);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                log::warn!("[TCP] accept failed: {}", e);
                std::thread::sleep(Duration::from_millis(50));
            }
        }
    }
}

fn reader_loop(
    mut stream: TcpStream,
    running: &AtomicBool,
    deliver: &(dyn Fn(SampleEnvelope) + Send + Sync),
) {
    loop {
        match read_frame(&mut stream, MAX_FRAME_SIZE, running) {
            Ok(Some(record)) => match decode_record(&record) {
                Ok(Some((RecordKind::Sample, body))) => match SampleEnvelope::decode_body(body) {
                    Ok(envelope) => deliver(envelope),
                    Err(e) => log::debug!("[TCP] dropped corrupt sample: {}", e),
                },
                Ok(_) => {}
                Err(e) => log::debug!("[TCP] dropped malformed record: {}", e),
            },
            Ok(None) => return,
            Err(e) => {
                log::debug!("[TCP] sample stream ended: {}", e);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registration::entries::TopicId;
    use parking_lot::Mutex;

    fn envelope(payload: &[u8]) -> SampleEnvelope {
        SampleEnvelope::new(
            TopicId {
                host_name: "host-a".into(),
                process_id: 1,
                serial: 1,
            },
            "fleet/pose".into(),
            1,
            0,
            payload.to_vec(),
        )
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = Backoff::new();
        assert_eq!(backoff.next_delay(), BACKOFF_INITIAL);
        assert_eq!(backoff.next_delay(), BACKOFF_INITIAL * 2);
        for _ in 0..10 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), BACKOFF_MAX);
        backoff.reset();
        assert_eq!(backoff.next_delay(), BACKOFF_INITIAL);
    }

    #[test]
    fn frame_roundtrip_over_socket_pair() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let addr = listener.local_addr().unwrap();
        let running = AtomicBool::new(true);

        let mut client = TcpStream::connect(addr).unwrap();
        let (mut server_side, _) = listener.accept().unwrap();
        server_side
            .set_read_timeout(Some(Duration::from_millis(50)))
            .unwrap();

        client.write_all(&encode_frame(b"first")).unwrap();
        client.write_all(&encode_frame(b"second")).unwrap();

        let one = read_frame(&mut server_side, MAX_FRAME_SIZE, &running)
            .unwrap()
            .unwrap();
        let two = read_frame(&mut server_side, MAX_FRAME_SIZE, &running)
            .unwrap()
            .unwrap();
        assert_eq!(one, b"first");
        assert_eq!(two, b"second");

        // Clean EOF at a frame boundary reads as None.
        drop(client);
        assert!(read_frame(&mut server_side, MAX_FRAME_SIZE, &running)
            .unwrap()
            .is_none());
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let addr = listener.local_addr().unwrap();
        let running = AtomicBool::new(true);

        let mut client = TcpStream::connect(addr).unwrap();
        let (mut server_side, _) = listener.accept().unwrap();
        server_side
            .set_read_timeout(Some(Duration::from_millis(50)))
            .unwrap();

        client.write_all(&u32::MAX.to_be_bytes()).unwrap();
        assert!(read_frame(&mut server_side, MAX_FRAME_SIZE, &running).is_err());
    }

    #[test]
    fn connector_delivers_to_sample_server() {
        let running = Arc::new(AtomicBool::new(true));
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);

        let server = SampleServer::start(
            Arc::clone(&running),
            Arc::new(move |env: SampleEnvelope| sink.lock().push(env)),
        )
        .expect("server");

        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, server.port()));
        let mut connector = SampleConnector::new(addr);

        let env = envelope(b"over tcp");
        let frame = encode_frame(&env.encode_record());
        assert!(connector.send_frame(&frame));

        let deadline = Instant::now() + Duration::from_secs(3);
        while received.lock().is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }

        let got = received.lock();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0], env);
        assert_eq!(connector.drops, 0);
    }

    #[test]
    fn connector_counts_drops_against_dead_peer() {
        // Grab a port and close it again so nothing listens there.
        let addr = {
            let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
            listener.local_addr().unwrap()
        };

        let mut connector = SampleConnector::new(addr);
        assert!(!connector.send_frame(b"xxxx"));
        assert_eq!(connector.drops, 1);

        // Within the backoff window the next send drops without connecting.
        assert!(!connector.send_frame(b"xxxx"));
        assert_eq!(connector.drops, 2);
    }
}
