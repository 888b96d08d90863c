// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Publisher: writes each sample once per chosen transport towards every
//! matched subscriber.

use super::matching::{select_transport, MatchParticipant, MatchTable};
use super::PubSubShared;
use crate::clock::epoch_micros;
use crate::config::{Configuration, TransportKind, UdpMode};
use crate::error::{Error, Result};
use crate::registration::entries::{
    DataTypeInfo, Direction, Entity, EntityKey, TopicEntry, TopicId, TransportEndpoint,
};
use crate::registration::Registration;
use crate::transport::shm::{segment_name, ChannelWriter};
use crate::transport::tcp::{encode_frame, SampleConnector};
use crate::wire::SampleEnvelope;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Smoothing factor of the send-rate estimate.
const FREQ_EWMA_ALPHA: f64 = 0.3;

/// Exponentially smoothed send rate in millihertz.
struct FreqEstimator {
    last_us: u64,
    freq_mhz: f64,
}

impl FreqEstimator {
    fn new() -> Self {
        Self {
            last_us: 0,
            freq_mhz: 0.0,
        }
    }

    fn update(&mut self, now_us: u64) -> u32 {
        if self.last_us == 0 || now_us <= self.last_us {
            self.last_us = now_us;
            return self.freq_mhz as u32;
        }
        let dt_us = (now_us - self.last_us) as f64;
        let instant_mhz = 1.0e9 / dt_us;
        self.freq_mhz = if self.freq_mhz == 0.0 {
            instant_mhz
        } else {
            FREQ_EWMA_ALPHA * instant_mhz + (1.0 - FREQ_EWMA_ALPHA) * self.freq_mhz
        };
        self.last_us = now_us;
        self.freq_mhz as u32
    }
}

/// One matched subscriber and the transport chosen towards it.
#[derive(Debug, Clone)]
struct MatchedSub {
    key: EntityKey,
    kind: TransportKind,
    tcp_addr: Option<SocketAddr>,
    udp_addr: Option<SocketAddr>,
}

pub(crate) struct PublisherShared {
    topic_name: String,
    serial: u64,
    topic_id: TopicId,
    data_type: DataTypeInfo,
    config: Arc<Configuration>,
    registration: Arc<Registration>,
    pubsub: Arc<PubSubShared>,
    running: Arc<AtomicBool>,
    shm_writer: Mutex<Option<ChannelWriter>>,
    tcp_connectors: Mutex<HashMap<EntityKey, SampleConnector>>,
    matched: RwLock<Vec<MatchedSub>>,
    warned_types: Mutex<HashSet<EntityKey>>,
    next_seq: AtomicU64,
    data_clock: AtomicU64,
    dropped: AtomicU64,
    freq: Mutex<FreqEstimator>,
    attributes: RwLock<BTreeMap<String, String>>,
}

impl MatchParticipant for PublisherShared {
    fn topic_name(&self) -> &str {
        &self.topic_name
    }

    fn on_peers_changed(&self, table: &MatchTable) {
        self.update_matches(table);
    }
}

impl PublisherShared {
    fn update_matches(&self, table: &MatchTable) {
        let identity = self.registration.identity().clone();
        let peers = table.subscribers_for(&self.topic_name);
        let own_type = &self.data_type;

        let mut matched = Vec::new();
        let mut local = 0u32;
        let mut external = 0u32;

        for peer in peers {
            if !own_type.compatible_with(&peer.data_type)
                && self.warned_types.lock().insert(peer.id.key())
            {
                log::warn!(
                    "[PUB] type mismatch on '{}': sending '{}' to subscriber expecting '{}' (bytes flow anyway)",
                    self.topic_name,
                    own_type.name,
                    peer.data_type.name
                );
            }

            let Some(kind) = select_transport(&self.config, &identity, &peer) else {
                log::debug!(
                    "[PUB] no usable transport towards subscriber {:?} on '{}'",
                    peer.id,
                    self.topic_name
                );
                continue;
            };

            let same_host = peer.id.host_name == identity.host_name;
            let tcp_addr = if kind == TransportKind::Tcp {
                peer.transport(TransportKind::Tcp)
                    .and_then(|t| parse_peer_addr(&t.params, same_host))
            } else {
                None
            };
            let udp_addr = if kind == TransportKind::Udp
                && self.config.transport.udp.mode == UdpMode::Unicast
            {
                peer.transport(TransportKind::Udp)
                    .and_then(|t| parse_peer_addr(&t.params, same_host))
            } else {
                None
            };

            if same_host {
                local += 1;
            } else {
                external += 1;
            }
            matched.push(MatchedSub {
                key: peer.id.key(),
                kind,
                tcp_addr,
                udp_addr,
            });
        }

        let tcp_keys: HashSet<EntityKey> = matched
            .iter()
            .filter(|m| m.kind == TransportKind::Tcp)
            .map(|m| m.key.clone())
            .collect();
        self.tcp_connectors
            .lock()
            .retain(|key, _| tcp_keys.contains(key));

        log::debug!(
            "[PUB] '{}' matched {} subscriber(s) ({} local, {} external)",
            self.topic_name,
            matched.len(),
            local,
            external
        );
        *self.matched.write() = matched;

        self.registration.refresh(self.serial, |e| {
            if let Entity::Publisher(t) = e {
                t.connections_local = local;
                t.connections_external = external;
            }
        });
    }

    fn send(&self, payload: &[u8], timestamp_us: u64) -> Result<usize> {
        if !self.running.load(Ordering::Acquire) {
            return Err(Error::Cancelled);
        }
        let send_clock = if timestamp_us == 0 {
            epoch_micros()
        } else {
            timestamp_us
        };
        let sequence = self.next_seq.fetch_add(1, Ordering::AcqRel) + 1;
        let matched = self.matched.read().clone();

        let mut bytes_total = 0usize;
        let mut transports_tried = 0u32;
        let mut transports_failed = 0u32;

        // SHM: one write serves every co-located subscriber.
        if matched.iter().any(|m| m.kind == TransportKind::Shm) {
            transports_tried += 1;
            let ack_timeout = Duration::from_millis(self.config.transport.shm.ack_timeout_ms);
            let mut guard = self.shm_writer.lock();
            match guard.as_mut() {
                Some(writer) => match writer.write(payload, send_clock, ack_timeout) {
                    Ok(report) => {
                        bytes_total += report.bytes;
                        if report.ack_missed > 0 {
                            self.dropped
                                .fetch_add(u64::from(report.ack_missed), Ordering::AcqRel);
                        }
                    }
                    Err(e) => {
                        transports_failed += 1;
                        log::warn!("[PUB] shm write on '{}' failed: {}", self.topic_name, e);
                    }
                },
                None => transports_failed += 1,
            }
        }

        // UDP and TCP both carry the framed envelope.
        let wants_udp = matched.iter().any(|m| m.kind == TransportKind::Udp);
        let wants_tcp = matched.iter().any(|m| m.kind == TransportKind::Tcp);
        if wants_udp || wants_tcp {
            let envelope = SampleEnvelope::new(
                self.topic_id.clone(),
                self.topic_name.clone(),
                sequence,
                send_clock,
                payload.to_vec(),
            );

            if wants_udp {
                transports_tried += 1;
                match self.send_udp(&envelope, &matched) {
                    Ok(bytes) => bytes_total += bytes,
                    Err(e) => {
                        transports_failed += 1;
                        log::warn!("[PUB] udp send on '{}' failed: {}", self.topic_name, e);
                    }
                }
            }

            if wants_tcp {
                transports_tried += 1;
                let frame = encode_frame(&envelope.encode_record());
                let mut any_ok = false;
                let mut connectors = self.tcp_connectors.lock();
                for m in matched.iter().filter(|m| m.kind == TransportKind::Tcp) {
                    let Some(addr) = m.tcp_addr else {
                        continue;
                    };
                    let connector = connectors
                        .entry(m.key.clone())
                        .or_insert_with(|| SampleConnector::new(addr));
                    if connector.send_frame(&frame) {
                        any_ok = true;
                    } else {
                        self.dropped.fetch_add(1, Ordering::AcqRel);
                    }
                }
                if any_ok {
                    bytes_total += payload.len();
                } else {
                    transports_failed += 1;
                }
            }
        }

        if transports_tried > 0 && transports_failed == transports_tried {
            return Err(Error::PeerUnreachable(format!(
                "every transport failed on '{}'",
                self.topic_name
            )));
        }

        let data_clock = self.data_clock.fetch_add(1, Ordering::AcqRel) + 1;
        let freq = self.freq.lock().update(send_clock);
        let dropped = self.dropped.load(Ordering::Acquire);
        self.registration.refresh(self.serial, |e| {
            if let Entity::Publisher(t) = e {
                t.data_clock = data_clock;
                t.frequency_mhz = freq;
                t.dropped = dropped;
                t.size_hint = payload.len() as u32;
            }
        });

        Ok(bytes_total)
    }

    fn send_udp(&self, envelope: &SampleEnvelope, matched: &[MatchedSub]) -> Result<usize> {
        let sender = self.pubsub.udp_sender()?;
        if self.config.transport.udp.mode == UdpMode::Unicast {
            let mut sent = false;
            for m in matched.iter().filter(|m| m.kind == TransportKind::Udp) {
                if let Some(addr) = m.udp_addr {
                    sender.send_to(envelope, addr)?;
                    sent = true;
                }
            }
            if sent {
                Ok(envelope.payload.len())
            } else {
                Err(Error::PeerUnreachable(
                    "no unicast address advertised".into(),
                ))
            }
        } else {
            sender.send_multicast(envelope)
        }
    }
}

/// Parse a peer's advertised `ip:port`, rewriting same-host peers to
/// loopback.
fn parse_peer_addr(params: &str, same_host: bool) -> Option<SocketAddr> {
    let addr: SocketAddr = params.parse().ok()?;
    if same_host {
        Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port()))
    } else {
        Some(addr)
    }
}

/// A topic publisher handle.
///
/// Dropping the handle unregisters the endpoint and closes its transports;
/// matched subscribers observe the departure immediately through the
/// unregister announcement.
pub struct Publisher {
    shared: Arc<PublisherShared>,
    // Keeps the weak registration in the match table alive for our lifetime.
    _participant: Arc<dyn MatchParticipant>,
}

impl Publisher {
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
        let topic_id = TopicId {
            host_name: identity.host_name.clone(),
            process_id: identity.process_id,
            serial,
        };

        let shm_writer = if config.transport.shm.enable {
            Some(ChannelWriter::create(
                &segment_name(identity.process_id, serial),
                config.transport.shm.memfile_min_size_bytes,
                config.transport.shm.memfile_reserve_percent,
            )?)
        } else {
            None
        };

        let mut transports = Vec::new();
        if let Some(writer) = &shm_writer {
            transports.push(TransportEndpoint {
                kind: TransportKind::Shm,
                active: true,
                params: writer.segment_name().to_string(),
            });
        }
        if config.transport.udp.enable {
            transports.push(TransportEndpoint {
                kind: TransportKind::Udp,
                active: true,
                params: String::new(),
            });
        }
        if config.transport.tcp.enable {
            transports.push(TransportEndpoint {
                kind: TransportKind::Tcp,
                active: true,
                params: String::new(),
            });
        }

        let entry = TopicEntry {
            id: topic_id.clone(),
            topic_name: topic_name.to_string(),
            host_group_name: identity.host_group_name.clone(),
            process_name: identity.process_name.clone(),
            unit_name: identity.unit_name.clone(),
            data_type: data_type.clone(),
            direction: Direction::Publisher,
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

        let shared = Arc::new(PublisherShared {
            topic_name: topic_name.to_string(),
            serial,
            topic_id,
            data_type,
            config,
            registration: Arc::clone(&pubsub.registration),
            pubsub: Arc::clone(pubsub),
            running: Arc::clone(&pubsub.running),
            shm_writer: Mutex::new(shm_writer),
            tcp_connectors: Mutex::new(HashMap::new()),
            matched: RwLock::new(Vec::new()),
            warned_types: Mutex::new(HashSet::new()),
            next_seq: AtomicU64::new(0),
            data_clock: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            freq: Mutex::new(FreqEstimator::new()),
            attributes: RwLock::new(BTreeMap::new()),
        });

        let participant: Arc<dyn MatchParticipant> = shared.clone();
        pubsub
            .match_table
            .add_local_publisher(Arc::downgrade(&participant));
        pubsub.registration.register(Entity::Publisher(entry));
        shared.update_matches(&pubsub.match_table);

        log::info!("[PUB] created publisher on '{}'", topic_name);
        Ok(Self {
            shared,
            _participant: participant,
        })
    }

    /// Send one sample to every matched subscriber.
    ///
    /// A zero `timestamp_us` stamps the current clock. Returns the payload
    /// bytes accounted once per transport used.
    pub fn send(&self, payload: &[u8], timestamp_us: u64) -> Result<usize> {
        self.shared.send(payload, timestamp_us)
    }

    /// The topic name.
    #[must_use]
    pub fn topic_name(&self) -> &str {
        &self.shared.topic_name
    }

    /// This publisher's endpoint id.
    #[must_use]
    pub fn id(&self) -> TopicId {
        self.shared.topic_id.clone()
    }

    /// Whether any subscriber is currently matched.
    #[must_use]
    pub fn is_subscribed(&self) -> bool {
        !self.shared.matched.read().is_empty()
    }

    /// Matched subscriber count.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.shared.matched.read().len()
    }

    /// Total samples sent.
    #[must_use]
    pub fn data_clock(&self) -> u64 {
        self.shared.data_clock.load(Ordering::Acquire)
    }

    /// Samples lost to overruns and backpressure, across peers.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Acquire)
    }

    /// Attach a free-form attribute carried in registration.
    pub fn set_attribute(&self, key: &str, value: &str) {
        self.shared
            .attributes
            .write()
            .insert(key.to_string(), value.to_string());
        let attributes = self.shared.attributes.read().clone();
        self.shared.registration.refresh(self.shared.serial, |e| {
            if let Entity::Publisher(t) = e {
                t.attributes = attributes;
            }
        });
    }

    /// Remove an attribute.
    pub fn clear_attribute(&self, key: &str) {
        self.shared.attributes.write().remove(key);
        let attributes = self.shared.attributes.read().clone();
        self.shared.registration.refresh(self.shared.serial, |e| {
            if let Entity::Publisher(t) = e {
                t.attributes = attributes;
            }
        });
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.shared.registration.unregister(self.shared.serial);
        log::debug!("[PUB] destroyed publisher on '{}'", self.shared.topic_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freq_estimator_tracks_rate() {
        let mut freq = FreqEstimator::new();
        assert_eq!(freq.update(1_000_000), 0);
        // 10 ms period = 100 Hz = 100_000 mHz.
        let mut now = 1_000_000;
        let mut last = 0;
        for _ in 0..50 {
            now += 10_000;
            last = freq.update(now);
        }
        assert!((90_000..=110_000).contains(&last), "freq {}", last);
    }

    #[test]
    fn peer_addr_rewrites_same_host_to_loopback() {
        let addr = parse_peer_addr("10.1.2.3:4567", true).unwrap();
        assert_eq!(addr, "127.0.0.1:4567".parse().unwrap());

        let addr = parse_peer_addr("10.1.2.3:4567", false).unwrap();
        assert_eq!(addr, "10.1.2.3:4567".parse().unwrap());

        assert!(parse_peer_addr("garbage", true).is_none());
    }
}
