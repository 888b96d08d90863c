// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Subscriber: merges samples from every transport, enforces per-publisher
//! ordering and duplicate suppression, and delivers through a bounded pull
//! queue or a single callback.
//!
//! Exactly one delivery mode is active at a time. Installing a callback
//! drains the queued backlog into it; removing the callback reverts to pull
//! mode. Callbacks run on the transport thread that delivered the sample;
//! panics are caught at the transport boundary, logged, and never kill the
//! delivery thread.

use super::matching::{effective_group, MatchParticipant, MatchTable};
use super::{PubSubShared, Sample, SampleView};
use crate::clock::epoch_micros;
use crate::config::{Configuration, TransportKind};
use crate::error::{Error, Result};
use crate::registration::entries::{
    DataTypeInfo, Direction, Entity, EntityKey, TopicEntry, TopicId, TransportEndpoint,
};
use crate::registration::Registration;
use crate::transport::shm::ChannelReader;
use crate::transport::tcp::SampleServer;
use crate::wire::SampleEnvelope;
use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

/// Depth of the pull-mode sample queue.
const QUEUE_DEPTH: usize = 1024;

/// Delivered-set bound per source when out-of-order delivery is allowed.
const DEDUPE_WINDOW: usize = 4096;

type Callback = Arc<dyn Fn(&SampleView<'_>) + Send + Sync>;

/// Per-publisher delivery gate: ordering and duplicate suppression.
#[derive(Default)]
struct SourceGate {
    last_seq: u64,
    /// Only populated when `drop_out_of_order` is off.
    delivered: HashSet<u64>,
}

/// One shared-memory watcher thread.
struct Watcher {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

pub(crate) struct SubscriberShared {
    topic_name: String,
    serial: u64,
    data_type: DataTypeInfo,
    config: Arc<Configuration>,
    registration: Arc<Registration>,
    running: Arc<AtomicBool>,
    alive: AtomicBool,
    queue_tx: Sender<Sample>,
    queue_rx: Receiver<Sample>,
    callback: RwLock<Option<Callback>>,
    gates: Mutex<HashMap<EntityKey, SourceGate>>,
    watchers: Mutex<HashMap<EntityKey, Watcher>>,
    warned_types: Mutex<HashSet<EntityKey>>,
    tcp_server: Mutex<Option<SampleServer>>,
    server_running: Arc<AtomicBool>,
    matched_count: AtomicUsize,
    data_clock: AtomicU64,
    dropped: AtomicU64,
    /// Weak self-handle for spawning watchers that must not keep the
    /// subscriber alive. Set once right after construction.
    self_weak: RwLock<Option<Weak<SubscriberShared>>>,
}

impl MatchParticipant for SubscriberShared {
    fn topic_name(&self) -> &str {
        &self.topic_name
    }

    fn on_peers_changed(&self, table: &MatchTable) {
        self.update_matches(table);
    }
}

impl SubscriberShared {
    /// Ordering / dedupe / expiry gate. True means "deliver".
    fn admit(&self, source: &EntityKey, sequence: u64, send_clock_us: u64) -> bool {
        let expiry_ms = self.config.subscriber.filter_expired_samples_ms;
        if expiry_ms > 0 && send_clock_us > 0 {
            let age_us = epoch_micros().saturating_sub(send_clock_us);
            if age_us > expiry_ms * 1000 {
                return false;
            }
        }

        let mut gates = self.gates.lock();
        let gate = gates.entry(source.clone()).or_default();

        if self.config.subscriber.drop_out_of_order {
            // First delivery wins; stragglers on slower transports and
            // duplicates both land at or below the cursor.
            if sequence <= gate.last_seq {
                return false;
            }
            gate.last_seq = sequence;
            true
        } else {
            if !gate.delivered.insert(sequence) {
                return false;
            }
            if gate.delivered.len() > DEDUPE_WINDOW {
                let cutoff = sequence.saturating_sub(DEDUPE_WINDOW as u64);
                gate.delivered.retain(|&s| s > cutoff);
            }
            true
        }
    }

    /// Hand one admitted sample to the active delivery mode.
    fn dispatch(&self, source: &TopicId, payload: &[u8], send_clock_us: u64, sequence: u64) {
        let callback = self.callback.read().clone();
        if let Some(callback) = callback {
            let view = SampleView {
                topic_name: &self.topic_name,
                payload,
                send_clock_us,
                sequence,
            };
            if catch_unwind(AssertUnwindSafe(|| callback(&view))).is_err() {
                log::warn!(
                    "[SUB] callback on '{}' panicked; delivery thread continues",
                    self.topic_name
                );
            }
        } else {
            let sample = Sample {
                payload: payload.to_vec(),
                send_clock_us,
                sequence,
                source: source.clone(),
            };
            if let Err(TrySendError::Full(_)) = self.queue_tx.try_send(sample) {
                self.dropped.fetch_add(1, Ordering::AcqRel);
            }
        }

        let data_clock = self.data_clock.fetch_add(1, Ordering::AcqRel) + 1;
        let dropped = self.dropped.load(Ordering::Acquire);
        self.registration.refresh(self.serial, |e| {
            if let Entity::Subscriber(t) = e {
                t.data_clock = data_clock;
                t.dropped = dropped;
                t.size_hint = payload.len() as u32;
            }
        });
    }

    /// Entry point for owned samples (UDP, TCP).
    pub fn deliver_envelope(&self, envelope: &SampleEnvelope) {
        if !self.alive.load(Ordering::Acquire) || !self.running.load(Ordering::Acquire) {
            return;
        }
        if envelope.topic_name != self.topic_name {
            return;
        }
        if !self.admit(
            &envelope.topic_id.key(),
            envelope.sequence,
            envelope.send_clock_us,
        ) {
            return;
        }
        self.dispatch(
            &envelope.topic_id,
            &envelope.payload,
            envelope.send_clock_us,
            envelope.sequence,
        );
    }

    /// Entry point for borrowed samples (shared memory).
    fn deliver_view(&self, source: &TopicId, payload: &[u8], send_clock_us: u64, sequence: u64) {
        if !self.alive.load(Ordering::Acquire) || !self.running.load(Ordering::Acquire) {
            return;
        }
        if !self.admit(&source.key(), sequence, send_clock_us) {
            return;
        }
        self.dispatch(source, payload, send_clock_us, sequence);
    }

    fn update_matches(&self, table: &MatchTable) {
        let identity = self.registration.identity().clone();
        let peers = table.publishers_for(&self.topic_name);

        let mut local = 0u32;
        let mut external = 0u32;
        let mut shm_sources: HashMap<EntityKey, (String, TopicId)> = HashMap::new();

        for peer in &peers {
            if !self.data_type.compatible_with(&peer.data_type)
                && self.warned_types.lock().insert(peer.id.key())
            {
                log::warn!(
                    "[SUB] type mismatch on '{}': expecting '{}', publisher sends '{}' (bytes flow anyway)",
                    self.topic_name,
                    self.data_type.name,
                    peer.data_type.name
                );
            }

            let same_host = peer.id.host_name == identity.host_name;
            if same_host {
                local += 1;
            } else {
                external += 1;
            }

            let groups_compatible = effective_group(&peer.host_group_name, &peer.id.host_name)
                == effective_group(&identity.host_group_name, &identity.host_name);
            if same_host && groups_compatible && self.config.transport.shm.enable {
                if let Some(endpoint) = peer.transport(TransportKind::Shm) {
                    shm_sources.insert(
                        peer.id.key(),
                        (endpoint.params.clone(), peer.id.clone()),
                    );
                }
            }
        }

        self.matched_count
            .store(peers.len(), Ordering::Release);
        self.registration.refresh(self.serial, |e| {
            if let Entity::Subscriber(t) = e {
                t.connections_local = local;
                t.connections_external = external;
            }
        });

        log::debug!(
            "[SUB] '{}' matched {} publisher(s) ({} shm source(s))",
            self.topic_name,
            peers.len(),
            shm_sources.len()
        );
        self.sync_watchers(shm_sources);
    }

    /// Bring the shared-memory watcher set in line with the matched
    /// publishers.
    fn sync_watchers(&self, desired: HashMap<EntityKey, (String, TopicId)>) {
        let mut watchers = self.watchers.lock();

        let stale: Vec<EntityKey> = watchers
            .keys()
            .filter(|key| !desired.contains_key(*key))
            .cloned()
            .collect();
        for key in stale {
            if let Some(mut watcher) = watchers.remove(&key) {
                watcher.stop.store(true, Ordering::Release);
                if let Some(handle) = watcher.handle.take() {
                    handle.join().ok();
                }
            }
        }

        for (key, (segment, source)) in desired {
            if watchers.contains_key(&key) {
                continue;
            }
            let Some(watcher) = self.spawn_watcher(segment, source) else {
                continue;
            };
            watchers.insert(key, watcher);
        }
    }

    fn spawn_watcher(&self, segment: String, source: TopicId) -> Option<Watcher> {
        // The watcher must not keep the subscriber alive.
        let weak = self.self_weak.read().clone()?;
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let running = Arc::clone(&self.running);
        let zero_copy = self.config.transport.shm.zero_copy;
        let topic = self.topic_name.clone();

        let handle = std::thread::Builder::new()
            .name(format!("hbus-shm-watch-{}", source.serial))
            .spawn(move || {
                shm_watch_loop(&weak, &segment, &source, &running, &stop_flag, zero_copy);
                log::debug!("[SUB] shm watcher for '{}' ({}) ended", topic, segment);
            })
            .ok()?;

        Some(Watcher {
            stop,
            handle: Some(handle),
        })
    }

    /// Stop every worker owned by this subscriber. In-flight callback
    /// invocations complete before this returns.
    fn stop_all(&self) {
        self.alive.store(false, Ordering::Release);
        self.server_running.store(false, Ordering::Release);

        let mut watchers = self.watchers.lock();
        for (_, watcher) in watchers.iter_mut() {
            watcher.stop.store(true, Ordering::Release);
        }
        for (_, mut watcher) in watchers.drain() {
            if let Some(handle) = watcher.handle.take() {
                handle.join().ok();
            }
        }
        drop(watchers);

        if let Some(mut server) = self.tcp_server.lock().take() {
            server.shutdown();
        }
    }
}

fn shm_watch_loop(
    weak: &Weak<SubscriberShared>,
    segment: &str,
    source: &TopicId,
    running: &AtomicBool,
    stop: &AtomicBool,
    zero_copy: bool,
) {
    let mut reader: Option<ChannelReader> = None;
    let poll = Duration::from_millis(100);

    while running.load(Ordering::Acquire) && !stop.load(Ordering::Acquire) {
        let Some(subscriber) = weak.upgrade() else {
            return;
        };
        if !subscriber.alive.load(Ordering::Acquire) {
            return;
        }

        if reader.is_none() {
            match ChannelReader::attach(segment) {
                Ok(r) => reader = Some(r),
                Err(_) => {
                    // The publisher may not have created (or re-created) the
                    // segment yet.
                    drop(subscriber);
                    std::thread::sleep(Duration::from_millis(50));
                    continue;
                }
            }
        }
        let channel = reader.as_mut().expect("reader attached above");

        let outcome = if zero_copy {
            channel
                .read_with(poll, |payload, clock, seq| {
                    subscriber.deliver_view(source, payload, clock, seq);
                })
                .map(|delivered| delivered.is_some())
        } else {
            match channel.read(poll) {
                Ok(Some(sample)) => {
                    subscriber.deliver_view(
                        source,
                        &sample.payload,
                        sample.send_clock_us,
                        sample.sequence,
                    );
                    Ok(true)
                }
                Ok(None) => Ok(false),
                Err(e) => Err(e),
            }
        };

        match outcome {
            Ok(_) => {}
            Err(Error::NotFound) => {
                // Writer gone; wait for a replacement segment.
                reader = None;
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                log::debug!("[SUB] shm watcher error on {}: {}", segment, e);
                reader = None;
                std::thread::sleep(Duration::from_millis(50));
            }
        }
    }
}

/// A topic subscriber handle.
///
/// Dropping the handle removes any installed callback, waits for in-flight
/// deliveries, and unregisters the endpoint.
pub struct Subscriber {
    shared: Arc<SubscriberShared>,
    pubsub: Arc<PubSubShared>,
    _participant: Arc<dyn MatchParticipant>,
}

impl Subscriber {
    pub(crate) fn create(
        pubsub: &Arc<PubSubShared>,
        topic_name: &str,
        data_type: DataTypeInfo,
    ) -> Result<Self> {
        if topic_name.is_empty() {
            return Err(Error::InvalidArgument("topic name must not be empty".into()));
        }

        let config = Arc::clone(&pubsub.config);
        let identity = pubsub.registration.identity().clone();
        let serial = pubsub.next_serial();
        let (queue_tx, queue_rx) = bounded(QUEUE_DEPTH);
        let server_running = Arc::new(AtomicBool::new(true));

        let shared = Arc::new(SubscriberShared {
            topic_name: topic_name.to_string(),
            serial,
            data_type: data_type.clone(),
            config: Arc::clone(&config),
            registration: Arc::clone(&pubsub.registration),
            running: Arc::clone(&pubsub.running),
            alive: AtomicBool::new(true),
            queue_tx,
            queue_rx,
            callback: RwLock::new(None),
            gates: Mutex::new(HashMap::new()),
            watchers: Mutex::new(HashMap::new()),
            warned_types: Mutex::new(HashSet::new()),
            tcp_server: Mutex::new(None),
            server_running: Arc::clone(&server_running),
            matched_count: AtomicUsize::new(0),
            data_clock: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            self_weak: RwLock::new(None),
        });
        *shared.self_weak.write() = Some(Arc::downgrade(&shared));

        let mut transports = Vec::new();
        if config.transport.shm.enable {
            transports.push(TransportEndpoint {
                kind: TransportKind::Shm,
                active: true,
                params: String::new(),
            });
        }

        if config.transport.udp.enable {
            let receiver = pubsub.udp_receiver()?;
            receiver.join_topic(topic_name)?;
            pubsub.add_udp_route(topic_name, serial, &shared);
            transports.push(TransportEndpoint {
                kind: TransportKind::Udp,
                active: true,
                params: SocketAddr::new(pubsub.local_ip, config.sample_port()).to_string(),
            });
        }

        if config.transport.tcp.enable {
            let weak = Arc::downgrade(&shared);
            let server = SampleServer::start(
                Arc::clone(&server_running),
                Arc::new(move |envelope: SampleEnvelope| {
                    if let Some(subscriber) = weak.upgrade() {
                        subscriber.deliver_envelope(&envelope);
                    }
                }),
            )?;
            transports.push(TransportEndpoint {
                kind: TransportKind::Tcp,
                active: true,
                params: SocketAddr::new(pubsub.local_ip, server.port()).to_string(),
            });
            *shared.tcp_server.lock() = Some(server);
        }

        let entry = TopicEntry {
            id: TopicId {
                host_name: identity.host_name.clone(),
                process_id: identity.process_id,
                serial,
            },
            topic_name: topic_name.to_string(),
            host_group_name: identity.host_group_name.clone(),
            process_name: identity.process_name.clone(),
            unit_name: identity.unit_name.clone(),
            data_type,
            direction: Direction::Subscriber,
            transports,
            size_hint: 0,
            connections_local: 0,
            connections_external: 0,
            dropped: 0,
            registration_clock: 1,
            data_clock: 0,
            frequency_mhz: 0,
            attributes: BTreeMap::new(),
        };

        let participant: Arc<dyn MatchParticipant> = shared.clone();
        pubsub
            .match_table
            .add_local_subscriber(Arc::downgrade(&participant));
        pubsub.registration.register(Entity::Subscriber(entry));
        shared.update_matches(&pubsub.match_table);

        log::info!("[SUB] created subscriber on '{}'", topic_name);
        Ok(Self {
            shared,
            pubsub: Arc::clone(pubsub),
            _participant: participant,
        })
    }

    /// Pull the next sample from the queue.
    ///
    /// # Errors
    ///
    /// `Error::Timeout` on expiry, `Error::Cancelled` once the context shut
    /// down, `Error::InvalidArgument` while a callback is installed.
    pub fn receive(&self, timeout: Duration) -> Result<Sample> {
        if self.shared.callback.read().is_some() {
            return Err(Error::InvalidArgument(
                "receive() is unavailable while a callback is installed".into(),
            ));
        }
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if !self.shared.running.load(Ordering::Acquire) {
                return Err(Error::Cancelled);
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return Err(Error::Timeout);
            }
            let slice = (deadline - now).min(Duration::from_millis(100));
            match self.shared.queue_rx.recv_timeout(slice) {
                Ok(sample) => return Ok(sample),
                Err(crossbeam::channel::RecvTimeoutError::Timeout) => {}
                Err(crossbeam::channel::RecvTimeoutError::Disconnected) => {
                    return Err(Error::Cancelled)
                }
            }
        }
    }

    /// Install the delivery callback, draining any queued backlog into it.
    ///
    /// Exactly one callback is active; installing replaces the previous one.
    pub fn set_callback(&self, callback: impl Fn(&SampleView<'_>) + Send + Sync + 'static) {
        let callback: Callback = Arc::new(callback);
        *self.shared.callback.write() = Some(Arc::clone(&callback));

        while let Ok(sample) = self.shared.queue_rx.try_recv() {
            let view = SampleView {
                topic_name: &self.shared.topic_name,
                payload: &sample.payload,
                send_clock_us: sample.send_clock_us,
                sequence: sample.sequence,
            };
            if catch_unwind(AssertUnwindSafe(|| callback(&view))).is_err() {
                log::warn!(
                    "[SUB] callback on '{}' panicked while draining backlog",
                    self.shared.topic_name
                );
            }
        }
    }

    /// Remove the callback; delivery reverts to the pull queue.
    pub fn remove_callback(&self) {
        *self.shared.callback.write() = None;
    }

    /// The topic name.
    #[must_use]
    pub fn topic_name(&self) -> &str {
        &self.shared.topic_name
    }

    /// Matched publisher count.
    #[must_use]
    pub fn publisher_count(&self) -> usize {
        self.shared.matched_count.load(Ordering::Acquire)
    }

    /// Whether any publisher is currently matched.
    #[must_use]
    pub fn is_published(&self) -> bool {
        self.publisher_count() > 0
    }

    /// Total samples delivered.
    #[must_use]
    pub fn data_clock(&self) -> u64 {
        self.shared.data_clock.load(Ordering::Acquire)
    }

    /// Samples lost to queue overflow.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Acquire)
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.shared.stop_all();
        if self.shared.config.transport.udp.enable {
            self.pubsub
                .remove_udp_route(&self.shared.topic_name, self.shared.serial);
            if let Some(receiver) = self.pubsub.udp_receiver_if_started() {
                receiver.leave_topic(&self.shared.topic_name);
            }
        }
        self.shared.registration.unregister(self.shared.serial);
        log::debug!(
            "[SUB] destroyed subscriber on '{}'",
            self.shared.topic_name
        );
    }
}
