// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Registration layer: the out-of-band channel through which every process
//! advertises its entities and learns about its peers.
//!
//! The layer owns the local inventory and announces every entry each refresh
//! interval over the enabled channels:
//!
//! - a local loopback that hands announcements straight to this process's
//!   listeners (so a single host, or a single process, needs no network),
//! - UDP multicast for the fleet,
//! - a host-local shared-memory broadcast ring.
//!
//! Received announcements fan out to registered listeners: the monitoring
//! aggregator, the pub/sub match table, and service client resolvers.
//! Expiry is the listeners' concern and runs on the same timer via
//! [`RegistrationListener::on_tick`].

pub mod entries;
mod shm_ring;

pub use shm_ring::{ring_name, BroadcastRing};

use crate::clock::epoch_micros;
use crate::config::{Configuration, MULTICAST_GROUP_BASE};
use crate::error::{Error, Result};
use crate::transport::udp::multicast_socket;
use dashmap::DashMap;
use entries::{Announcement, Entity, ShutdownRequest};
use parking_lot::{Mutex, RwLock};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Capacity of the host-local broadcast ring.
const RING_CAPACITY: usize = 256 * 1024;

/// Largest registration datagram we accept.
const RECV_BUFFER: usize = 64 * 1024;

/// Consumers of registration traffic.
///
/// Callbacks run on the delivering thread (sender loopback, UDP receiver,
/// or ring receiver) and must not block.
pub trait RegistrationListener: Send + Sync {
    /// One announcement arrived (local or remote).
    fn on_announcement(&self, announcement: &Announcement);

    /// The refresh timer fired; run expiry sweeps.
    fn on_tick(&self, _now_us: u64) {}
}

/// Identity of this process, stamped into every announced entry.
#[derive(Debug, Clone)]
pub struct RegistrationIdentity {
    /// Host name.
    pub host_name: String,
    /// Shared-memory eligibility group; empty means "same as host".
    pub host_group_name: String,
    /// OS process id.
    pub process_id: u32,
    /// Executable name.
    pub process_name: String,
    /// Unit name given at init.
    pub unit_name: String,
}

/// The registration component. One per context.
pub struct Registration {
    identity: RegistrationIdentity,
    refresh_interval: Duration,
    timeout: Duration,
    running: Arc<AtomicBool>,
    inventory: DashMap<u64, Entity>,
    listeners: RwLock<Vec<Weak<dyn RegistrationListener>>>,
    udp_tx: Option<UdpSocket>,
    udp_dest: SocketAddr,
    ring: Option<Arc<BroadcastRing>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Registration {
    /// Start the layer: set up the enabled channels and the refresh timer.
    pub fn start(
        config: &Configuration,
        identity: RegistrationIdentity,
        running: Arc<AtomicBool>,
    ) -> Result<Arc<Self>> {
        let reg_cfg = &config.registration;
        let udp_cfg = &config.transport.udp;
        let udp_dest = SocketAddr::from(SocketAddrV4::new(MULTICAST_GROUP_BASE, udp_cfg.port));

        let udp_tx = if reg_cfg.udp_enable {
            let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
            socket.set_multicast_loop_v4(true)?;
            // With networking disabled announcements still loop back to the
            // host but never leave it.
            let ttl = if reg_cfg.network_enabled {
                u32::from(udp_cfg.ttl)
            } else {
                0
            };
            socket.set_multicast_ttl_v4(ttl)?;
            let bind = SocketAddr::from(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
            socket.bind(&bind.into())?;
            Some(socket.into())
        } else {
            None
        };

        let ring = if reg_cfg.shm_enable {
            Some(Arc::new(BroadcastRing::open(
                &ring_name(udp_cfg.port),
                RING_CAPACITY,
            )?))
        } else {
            None
        };

        let registration = Arc::new(Self {
            identity,
            refresh_interval: Duration::from_millis(reg_cfg.refresh_interval_ms),
            timeout: Duration::from_millis(reg_cfg.timeout_ms),
            running,
            inventory: DashMap::new(),
            listeners: RwLock::new(Vec::new()),
            udp_tx,
            udp_dest,
            ring,
            threads: Mutex::new(Vec::new()),
        });

        let mut threads = Vec::new();

        let sender = Arc::clone(&registration);
        threads.push(
            std::thread::Builder::new()
                .name("hbus-reg-tx".into())
                .spawn(move || sender.sender_loop())
                .map_err(|e| Error::Internal(format!("spawn registration sender: {}", e)))?,
        );

        if reg_cfg.udp_enable {
            let rx_socket = multicast_socket(udp_cfg.port, udp_cfg.ttl, Ipv4Addr::UNSPECIFIED)?;
            rx_socket.join_multicast_v4(&MULTICAST_GROUP_BASE, &Ipv4Addr::UNSPECIFIED)?;
            rx_socket.set_read_timeout(Some(Duration::from_millis(100)))?;
            let receiver = Arc::clone(&registration);
            threads.push(
                std::thread::Builder::new()
                    .name("hbus-reg-rx-udp".into())
                    .spawn(move || receiver.udp_receive_loop(&rx_socket))
                    .map_err(|e| Error::Internal(format!("spawn registration receiver: {}", e)))?,
            );
        }

        if registration.ring.is_some() {
            let receiver = Arc::clone(&registration);
            threads.push(
                std::thread::Builder::new()
                    .name("hbus-reg-rx-shm".into())
                    .spawn(move || receiver.ring_receive_loop())
                    .map_err(|e| Error::Internal(format!("spawn registration receiver: {}", e)))?,
            );
        }

        *registration.threads.lock() = threads;
        log::info!(
            "[REG] started (udp={}, shm={}, refresh={}ms, timeout={}ms)",
            reg_cfg.udp_enable,
            reg_cfg.shm_enable,
            reg_cfg.refresh_interval_ms,
            reg_cfg.timeout_ms
        );
        Ok(registration)
    }

    /// This process's identity.
    #[must_use]
    pub fn identity(&self) -> &RegistrationIdentity {
        &self.identity
    }

    /// Expiry horizon in microseconds.
    #[must_use]
    pub fn timeout_us(&self) -> u64 {
        self.timeout.as_micros() as u64
    }

    /// Subscribe to registration traffic. The layer holds a weak reference;
    /// dropped listeners fall out on the next dispatch.
    pub fn add_listener(&self, listener: &Arc<dyn RegistrationListener>) {
        self.listeners.write().push(Arc::downgrade(listener));
    }

    /// Put an entity into the inventory and announce it immediately.
    pub fn register(&self, entity: Entity) {
        let serial = entity.key().serial;
        let announcement = Announcement::Register(entity.clone());
        self.inventory.insert(serial, entity);
        self.announce(&announcement);
    }

    /// Update a local entry's live statistics; the next refresh carries
    /// them.
    pub fn refresh<F: FnOnce(&mut Entity)>(&self, serial: u64, f: F) {
        if let Some(mut entry) = self.inventory.get_mut(&serial) {
            f(entry.value_mut());
        }
    }

    /// Remove an entity and announce its departure.
    pub fn unregister(&self, serial: u64) {
        if let Some((_, mut entity)) = self.inventory.remove(&serial) {
            entity.bump_registration_clock();
            self.announce(&Announcement::Unregister(entity));
        }
    }

    /// Fire-and-forget shutdown signalling; the local process is addressed
    /// through the loopback like any peer.
    pub fn announce_shutdown(&self, request: ShutdownRequest) {
        log::info!("[REG] announcing shutdown request {:?}", request.scope);
        self.announce(&Announcement::Shutdown(request));
    }

    /// Stop the layer: unregister everything and join the worker threads.
    ///
    /// The shared running flag must already be false.
    pub fn stop(&self) {
        let serials: Vec<u64> = self.inventory.iter().map(|e| *e.key()).collect();
        for serial in serials {
            self.unregister(serial);
        }
        for handle in self.threads.lock().drain(..) {
            handle.join().ok();
        }
    }

    fn announce(&self, announcement: &Announcement) {
        // Local listeners first: a single process never depends on any
        // channel being up.
        self.dispatch(announcement);

        let frame = announcement.encode_record();
        if let Some(socket) = &self.udp_tx {
            if let Err(e) = socket.send_to(&frame, self.udp_dest) {
                log::debug!("[REG] udp announce failed: {}", e);
            }
        }
        if let Some(ring) = &self.ring {
            if let Err(e) = ring.append(&frame) {
                log::debug!("[REG] ring announce failed: {}", e);
            }
        }
    }

    fn listeners_snapshot(&self) -> Vec<Arc<dyn RegistrationListener>> {
        let guard = self.listeners.read();
        let mut live = Vec::with_capacity(guard.len());
        let mut dead = false;
        for weak in guard.iter() {
            match weak.upgrade() {
                Some(listener) => live.push(listener),
                None => dead = true,
            }
        }
        drop(guard);
        if dead {
            self.listeners.write().retain(|w| w.strong_count() > 0);
        }
        live
    }

    fn dispatch(&self, announcement: &Announcement) {
        for listener in self.listeners_snapshot() {
            listener.on_announcement(announcement);
        }
    }

    fn sender_loop(self: Arc<Self>) {
        let mut next_refresh = Instant::now() + self.refresh_interval;
        while self.running.load(Ordering::Acquire) {
            std::thread::sleep(Duration::from_millis(25).min(self.refresh_interval));
            if Instant::now() < next_refresh {
                continue;
            }
            next_refresh = Instant::now() + self.refresh_interval;

            // Snapshot first: announcing re-enters listeners which are free
            // to touch the inventory.
            let mut snapshot = Vec::with_capacity(self.inventory.len());
            for mut entry in self.inventory.iter_mut() {
                entry.value_mut().bump_registration_clock();
                snapshot.push(entry.value().clone());
            }
            for entity in snapshot {
                self.announce(&Announcement::Register(entity));
            }

            let now = epoch_micros();
            for listener in self.listeners_snapshot() {
                listener.on_tick(now);
            }
        }
    }

    fn udp_receive_loop(self: Arc<Self>, socket: &UdpSocket) {
        let mut buf = vec![0u8; RECV_BUFFER];
        while self.running.load(Ordering::Acquire) {
            let len = match socket.recv_from(&mut buf) {
                Ok((len, _)) => len,
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => {
                    log::warn!("[REG] udp receive failed: {}", e);
                    continue;
                }
            };
            self.handle_frame(&buf[..len]);
        }
    }

    fn ring_receive_loop(self: Arc<Self>) {
        let Some(ring) = self.ring.clone() else {
            return;
        };
        let mut cursor = ring.cursor();
        while self.running.load(Ordering::Acquire) {
            while let Some(frame) = ring.read_next(&mut cursor) {
                self.handle_frame(&frame);
            }
            let snapshot = ring.event_snapshot();
            if ring.read_next(&mut cursor).is_none() {
                ring.wait(snapshot, Duration::from_millis(100));
            }
        }
    }

    fn handle_frame(&self, frame: &[u8]) {
        let parsed = match crate::wire::decode_record(frame) {
            Ok(Some((kind, body))) => Announcement::decode(kind, body),
            Ok(None) => return,
            Err(e) => {
                log::debug!("[REG] dropped malformed frame: {}", e);
                return;
            }
        };
        match parsed {
            Ok(Some(announcement)) => self.dispatch(&announcement),
            Ok(None) => {}
            Err(e) => log::debug!("[REG] dropped malformed announcement: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Configuration;
    use crate::registration::entries::{
        ClientEntry, ProcessEntry, ShutdownScope,
    };

    struct Recorder {
        seen: Mutex<Vec<Announcement>>,
        ticks: std::sync::atomic::AtomicU64,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                ticks: std::sync::atomic::AtomicU64::new(0),
            })
        }
    }

    impl RegistrationListener for Recorder {
        fn on_announcement(&self, announcement: &Announcement) {
            self.seen.lock().push(announcement.clone());
        }

        fn on_tick(&self, _now_us: u64) {
            self.ticks.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn test_identity(pid: u32) -> RegistrationIdentity {
        RegistrationIdentity {
            host_name: "test-host".into(),
            host_group_name: String::new(),
            process_id: pid,
            process_name: "hbus-test".into(),
            unit_name: "unit".into(),
        }
    }

    fn loopback_config(refresh_ms: u64) -> Configuration {
        let mut cfg = Configuration::default();
        cfg.registration.refresh_interval_ms = refresh_ms;
        cfg.registration.timeout_ms = refresh_ms * 5;
        cfg.registration.udp_enable = false;
        cfg.registration.shm_enable = false;
        cfg
    }

    fn wait_until(deadline_ms: u64, mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_millis(deadline_ms);
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn register_dispatches_immediately_and_refreshes() {
        let running = Arc::new(AtomicBool::new(true));
        let registration =
            Registration::start(&loopback_config(50), test_identity(1), Arc::clone(&running))
                .expect("start");
        let recorder = Recorder::new();
        let listener: Arc<dyn RegistrationListener> = recorder.clone();
        registration.add_listener(&listener);

        let mut entry = ProcessEntry::default();
        entry.host_name = "test-host".into();
        entry.process_id = 1;
        entry.registration_clock = 1;
        registration.register(Entity::Process(entry));

        // Immediate loopback announcement.
        assert!(wait_until(500, || !recorder.seen.lock().is_empty()));

        // Refresh cycles bump the clock and re-announce.
        assert!(wait_until(2000, || recorder.seen.lock().len() >= 3));
        let seen = recorder.seen.lock();
        let clocks: Vec<u64> = seen
            .iter()
            .filter_map(|a| match a {
                Announcement::Register(e) => Some(e.registration_clock()),
                _ => None,
            })
            .collect();
        assert!(clocks.windows(2).all(|w| w[0] <= w[1]));
        drop(seen);

        running.store(false, Ordering::Release);
        registration.stop();
    }

    #[test]
    fn unregister_is_announced_and_ticks_fire() {
        let running = Arc::new(AtomicBool::new(true));
        let registration =
            Registration::start(&loopback_config(50), test_identity(2), Arc::clone(&running))
                .expect("start");
        let recorder = Recorder::new();
        let listener: Arc<dyn RegistrationListener> = recorder.clone();
        registration.add_listener(&listener);

        let mut client = ClientEntry::default();
        client.host_name = "test-host".into();
        client.process_id = 2;
        client.service_instance_id = 9;
        registration.register(Entity::Client(client));
        registration.unregister(9);

        assert!(wait_until(500, || {
            recorder
                .seen
                .lock()
                .iter()
                .any(|a| matches!(a, Announcement::Unregister(Entity::Client(_))))
        }));
        assert!(wait_until(1000, || recorder.ticks.load(Ordering::SeqCst) > 0));

        running.store(false, Ordering::Release);
        registration.stop();
    }

    #[test]
    fn shm_ring_carries_announcements_between_instances() {
        let mut cfg = loopback_config(50);
        cfg.registration.shm_enable = true;
        // A port unique to this test keeps the ring segment private.
        cfg.transport.udp.port = 45000 + (std::process::id() % 10000) as u16;

        let running_a = Arc::new(AtomicBool::new(true));
        let running_b = Arc::new(AtomicBool::new(true));
        let reg_a = Registration::start(&cfg, test_identity(11), Arc::clone(&running_a))
            .expect("start a");
        let reg_b = Registration::start(&cfg, test_identity(12), Arc::clone(&running_b))
            .expect("start b");

        let recorder = Recorder::new();
        let listener: Arc<dyn RegistrationListener> = recorder.clone();
        reg_b.add_listener(&listener);

        let mut entry = ProcessEntry::default();
        entry.host_name = "test-host".into();
        entry.process_id = 11;
        reg_a.register(Entity::Process(entry));

        assert!(wait_until(2000, || {
            recorder.seen.lock().iter().any(|a| {
                matches!(a, Announcement::Register(Entity::Process(p)) if p.process_id == 11)
            })
        }));

        running_a.store(false, Ordering::Release);
        running_b.store(false, Ordering::Release);
        reg_a.stop();
        reg_b.stop();
        crate::transport::shm::Segment::unlink(&ring_name(cfg.transport.udp.port)).ok();
    }

    #[test]
    fn shutdown_requests_reach_local_listeners() {
        let running = Arc::new(AtomicBool::new(true));
        let registration =
            Registration::start(&loopback_config(50), test_identity(3), Arc::clone(&running))
                .expect("start");
        let recorder = Recorder::new();
        let listener: Arc<dyn RegistrationListener> = recorder.clone();
        registration.add_listener(&listener);

        registration.announce_shutdown(ShutdownRequest {
            scope: ShutdownScope::All,
        });

        assert!(wait_until(500, || {
            recorder
                .seen
                .lock()
                .iter()
                .any(|a| matches!(a, Announcement::Shutdown(_)))
        }));

        running.store(false, Ordering::Release);
        registration.stop();
    }
}
