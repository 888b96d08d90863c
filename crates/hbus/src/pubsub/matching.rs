// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Topic matching: tracks announced peers, pairs publishers with
//! subscribers, and selects the transport for each matched pair.
//!
//! # Matching rules
//!
//! A subscriber matches any publisher with the same topic name whose data
//! type is compatible (equal type name, or unspecified on either side).
//! Incompatible types log a warning but bytes flow anyway.
//!
//! # Transport selection (per matched pair, publisher side)
//!
//! 1. SHM - same host, same (or empty) host group, enabled on both ends
//! 2. UDP - enabled on both ends
//! 3. TCP - enabled on both ends
//! 4. none - logged and left unmatched
//!
//! The publisher's configured priority lists order the candidates; the rules
//! above gate eligibility.

use crate::config::{Configuration, TransportKind};
use crate::registration::entries::{
    Announcement, Direction, Entity, EntityKey, TopicEntry,
};
use crate::registration::{RegistrationIdentity, RegistrationListener};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// A locally owned endpoint that wants to hear about peer changes.
///
/// Implemented by the publisher and subscriber internals; callbacks run on
/// registration threads and must not block.
pub trait MatchParticipant: Send + Sync {
    /// The topic this endpoint is on.
    fn topic_name(&self) -> &str;
    /// The peer set for this topic changed; recompute matches.
    fn on_peers_changed(&self, table: &MatchTable);
}

/// "Same or empty" host-group comparison: an empty group means the host is
/// its own group.
#[must_use]
pub fn effective_group<'a>(group: &'a str, host: &'a str) -> &'a str {
    if group.is_empty() {
        host
    } else {
        group
    }
}

/// Pick the transport a publisher uses towards one announced subscriber.
///
/// Returns `None` when no transport is usable (the pair stays unmatched).
#[must_use]
pub fn select_transport(
    cfg: &Configuration,
    identity: &RegistrationIdentity,
    peer: &TopicEntry,
) -> Option<TransportKind> {
    let same_host = peer.id.host_name == identity.host_name;
    let groups_compatible = effective_group(&peer.host_group_name, &peer.id.host_name)
        == effective_group(&identity.host_group_name, &identity.host_name);

    let priorities = if same_host {
        &cfg.publisher.priority_local
    } else {
        &cfg.publisher.priority_remote
    };

    for kind in priorities {
        let usable = match kind {
            TransportKind::Shm => {
                same_host
                    && groups_compatible
                    && cfg.transport.shm.enable
                    && peer.transport(TransportKind::Shm).is_some()
            }
            TransportKind::Udp => {
                cfg.transport.udp.enable && peer.transport(TransportKind::Udp).is_some()
            }
            TransportKind::Tcp => {
                cfg.transport.tcp.enable && peer.transport(TransportKind::Tcp).is_some()
            }
        };
        if usable {
            return Some(*kind);
        }
    }
    None
}

struct Peer {
    entry: TopicEntry,
    last_seen_us: u64,
}

type PeerMap = HashMap<String, HashMap<EntityKey, Peer>>;

/// The per-context match table. A registration listener.
pub struct MatchTable {
    timeout_us: u64,
    publishers: RwLock<PeerMap>,
    subscribers: RwLock<PeerMap>,
    local_publishers: RwLock<Vec<Weak<dyn MatchParticipant>>>,
    local_subscribers: RwLock<Vec<Weak<dyn MatchParticipant>>>,
}

impl MatchTable {
    /// Create an empty table with the registration expiry horizon.
    #[must_use]
    pub fn new(timeout_us: u64) -> Arc<Self> {
        Arc::new(Self {
            timeout_us,
            publishers: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(HashMap::new()),
            local_publishers: RwLock::new(Vec::new()),
            local_subscribers: RwLock::new(Vec::new()),
        })
    }

    /// Register a local publisher for change notifications.
    pub fn add_local_publisher(&self, participant: Weak<dyn MatchParticipant>) {
        self.local_publishers.write().push(participant);
    }

    /// Register a local subscriber for change notifications.
    pub fn add_local_subscriber(&self, participant: Weak<dyn MatchParticipant>) {
        self.local_subscribers.write().push(participant);
    }

    /// Announced publishers on a topic.
    #[must_use]
    pub fn publishers_for(&self, topic_name: &str) -> Vec<TopicEntry> {
        self.publishers
            .read()
            .get(topic_name)
            .map(|peers| peers.values().map(|p| p.entry.clone()).collect())
            .unwrap_or_default()
    }

    /// Announced subscribers on a topic.
    #[must_use]
    pub fn subscribers_for(&self, topic_name: &str) -> Vec<TopicEntry> {
        self.subscribers
            .read()
            .get(topic_name)
            .map(|peers| peers.values().map(|p| p.entry.clone()).collect())
            .unwrap_or_default()
    }

    fn upsert(&self, entry: TopicEntry, now_us: u64) {
        let map = match entry.direction {
            Direction::Publisher => &self.publishers,
            Direction::Subscriber => &self.subscribers,
        };
        let direction = entry.direction;
        let topic = entry.topic_name.clone();
        let key = entry.id.key();
        {
            let mut guard = map.write();
            let peers = guard.entry(topic.clone()).or_default();
            // A regressed clock means a restarted peer; replacing the entry
            // wholesale covers both refresh and new-epoch cases.
            peers.insert(
                key,
                Peer {
                    entry,
                    last_seen_us: now_us,
                },
            );
        }
        self.notify(direction, &topic);
    }

    fn remove(&self, entry: &TopicEntry) {
        let map = match entry.direction {
            Direction::Publisher => &self.publishers,
            Direction::Subscriber => &self.subscribers,
        };
        let key = entry.id.key();
        let removed = {
            let mut guard = map.write();
            match guard.get_mut(&entry.topic_name) {
                Some(peers) => {
                    let removed = peers.remove(&key).is_some();
                    if peers.is_empty() {
                        guard.remove(&entry.topic_name);
                    }
                    removed
                }
                None => false,
            }
        };
        if removed {
            self.notify(entry.direction, &entry.topic_name);
        }
    }

    /// Drop every peer owned by `(host, pid)`; used when a process
    /// unregisters or dies.
    fn purge_process(&self, host_name: &str, process_id: u32) {
        for (map, direction) in [
            (&self.publishers, Direction::Publisher),
            (&self.subscribers, Direction::Subscriber),
        ] {
            let mut touched = Vec::new();
            {
                let mut guard = map.write();
                guard.retain(|topic, peers| {
                    let before = peers.len();
                    peers.retain(|key, _| {
                        !(key.host_name == host_name && key.process_id == process_id)
                    });
                    if peers.len() != before {
                        touched.push(topic.clone());
                    }
                    !peers.is_empty()
                });
            }
            for topic in touched {
                self.notify(direction, &topic);
            }
        }
    }

    fn expire(&self, now_us: u64) {
        for (map, direction) in [
            (&self.publishers, Direction::Publisher),
            (&self.subscribers, Direction::Subscriber),
        ] {
            let mut touched = Vec::new();
            {
                let mut guard = map.write();
                guard.retain(|topic, peers| {
                    let before = peers.len();
                    peers.retain(|_, peer| {
                        now_us.saturating_sub(peer.last_seen_us) <= self.timeout_us
                    });
                    if peers.len() != before {
                        log::debug!(
                            "[MATCH] expired {} peer(s) on '{}'",
                            before - peers.len(),
                            topic
                        );
                        touched.push(topic.clone());
                    }
                    !peers.is_empty()
                });
            }
            for topic in touched {
                self.notify(direction, &topic);
            }
        }
    }

    /// Notify the locals affected by a change on `topic` of peers with the
    /// given `direction` (publisher change -> local subscribers and vice
    /// versa).
    fn notify(&self, direction: Direction, topic: &str) {
        let locals = match direction {
            Direction::Publisher => &self.local_subscribers,
            Direction::Subscriber => &self.local_publishers,
        };
        let snapshot: Vec<Arc<dyn MatchParticipant>> = {
            let guard = locals.read();
            guard.iter().filter_map(Weak::upgrade).collect()
        };
        locals.write().retain(|w| w.strong_count() > 0);
        for participant in snapshot {
            if participant.topic_name() == topic {
                participant.on_peers_changed(self);
            }
        }
    }
}

impl RegistrationListener for MatchTable {
    fn on_announcement(&self, announcement: &Announcement) {
        let now_us = crate::clock::epoch_micros();
        match announcement {
            Announcement::Register(Entity::Publisher(entry) | Entity::Subscriber(entry)) => {
                self.upsert(entry.clone(), now_us);
            }
            Announcement::Unregister(Entity::Publisher(entry) | Entity::Subscriber(entry)) => {
                self.remove(entry);
            }
            Announcement::Unregister(Entity::Process(process)) => {
                self.purge_process(&process.host_name, process.process_id);
            }
            _ => {}
        }
    }

    fn on_tick(&self, now_us: u64) {
        self.expire(now_us);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registration::entries::{DataTypeInfo, TopicId, TransportEndpoint};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn identity() -> RegistrationIdentity {
        RegistrationIdentity {
            host_name: "host-a".into(),
            host_group_name: String::new(),
            process_id: 1,
            process_name: "test".into(),
            unit_name: "test".into(),
        }
    }

    fn subscriber_entry(host: &str, group: &str, kinds: &[TransportKind]) -> TopicEntry {
        TopicEntry {
            id: TopicId {
                host_name: host.into(),
                process_id: 2,
                serial: 5,
            },
            topic_name: "fleet/pose".into(),
            host_group_name: group.into(),
            process_name: "peer".into(),
            unit_name: "peer".into(),
            data_type: DataTypeInfo::default(),
            direction: Direction::Subscriber,
            transports: kinds
                .iter()
                .map(|&kind| TransportEndpoint {
                    kind,
                    active: true,
                    params: String::new(),
                })
                .collect(),
            size_hint: 0,
            connections_local: 0,
            connections_external: 0,
            dropped: 0,
            registration_clock: 1,
            data_clock: 0,
            frequency_mhz: 0,
            attributes: Default::default(),
        }
    }

    #[test]
    fn same_host_prefers_shm() {
        let cfg = Configuration::default();
        let peer = subscriber_entry(
            "host-a",
            "",
            &[TransportKind::Shm, TransportKind::Udp, TransportKind::Tcp],
        );
        assert_eq!(
            select_transport(&cfg, &identity(), &peer),
            Some(TransportKind::Shm)
        );
    }

    #[test]
    fn remote_host_never_uses_shm() {
        let cfg = Configuration::default();
        let peer = subscriber_entry(
            "host-b",
            "",
            &[TransportKind::Shm, TransportKind::Udp, TransportKind::Tcp],
        );
        assert_eq!(
            select_transport(&cfg, &identity(), &peer),
            Some(TransportKind::Udp)
        );
    }

    #[test]
    fn host_group_mismatch_disables_shm() {
        let mut cfg = Configuration::default();
        cfg.transport.udp.enable = false;
        cfg.transport.tcp.enable = false;
        // Same host, different groups, only SHM offered: unmatched.
        let peer = subscriber_entry("host-a", "group-b", &[TransportKind::Shm]);
        let mut me = identity();
        me.host_group_name = "group-a".into();
        assert_eq!(select_transport(&cfg, &me, &peer), None);

        // Matching groups bring SHM back.
        let mut me_matching = identity();
        me_matching.host_group_name = "group-b".into();
        assert_eq!(
            select_transport(&cfg, &me_matching, &peer),
            Some(TransportKind::Shm)
        );
    }

    #[test]
    fn falls_back_to_tcp_when_udp_disabled() {
        let mut cfg = Configuration::default();
        cfg.transport.udp.enable = false;
        let peer = subscriber_entry("host-b", "", &[TransportKind::Udp, TransportKind::Tcp]);
        assert_eq!(
            select_transport(&cfg, &identity(), &peer),
            Some(TransportKind::Tcp)
        );
    }

    #[test]
    fn peer_without_active_transports_is_unmatched() {
        let cfg = Configuration::default();
        let peer = subscriber_entry("host-b", "", &[]);
        assert_eq!(select_transport(&cfg, &identity(), &peer), None);
    }

    struct CountingParticipant {
        topic: String,
        notified: AtomicUsize,
    }

    impl MatchParticipant for CountingParticipant {
        fn topic_name(&self) -> &str {
            &self.topic
        }

        fn on_peers_changed(&self, _table: &MatchTable) {
            self.notified.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn announcements_notify_matching_locals_only() {
        let table = MatchTable::new(1_000_000);
        let on_topic = Arc::new(CountingParticipant {
            topic: "fleet/pose".into(),
            notified: AtomicUsize::new(0),
        });
        let off_topic = Arc::new(CountingParticipant {
            topic: "other".into(),
            notified: AtomicUsize::new(0),
        });
        let on_dyn: Arc<dyn MatchParticipant> = on_topic.clone();
        let off_dyn: Arc<dyn MatchParticipant> = off_topic.clone();
        table.add_local_publisher(Arc::downgrade(&on_dyn));
        table.add_local_publisher(Arc::downgrade(&off_dyn));

        let entry = subscriber_entry("host-b", "", &[TransportKind::Tcp]);
        table.on_announcement(&Announcement::Register(Entity::Subscriber(entry.clone())));

        assert_eq!(on_topic.notified.load(Ordering::SeqCst), 1);
        assert_eq!(off_topic.notified.load(Ordering::SeqCst), 0);
        assert_eq!(table.subscribers_for("fleet/pose").len(), 1);

        table.on_announcement(&Announcement::Unregister(Entity::Subscriber(entry)));
        assert_eq!(on_topic.notified.load(Ordering::SeqCst), 2);
        assert!(table.subscribers_for("fleet/pose").is_empty());
    }

    #[test]
    fn stale_peers_expire_on_tick() {
        let table = MatchTable::new(50_000); // 50 ms horizon
        let entry = subscriber_entry("host-b", "", &[TransportKind::Tcp]);
        table.on_announcement(&Announcement::Register(Entity::Subscriber(entry)));
        assert_eq!(table.subscribers_for("fleet/pose").len(), 1);

        let later = crate::clock::epoch_micros() + 200_000;
        table.on_tick(later);
        assert!(table.subscribers_for("fleet/pose").is_empty());
    }

    #[test]
    fn process_unregister_purges_its_endpoints() {
        let table = MatchTable::new(10_000_000);
        let entry = subscriber_entry("host-b", "", &[TransportKind::Tcp]);
        table.on_announcement(&Announcement::Register(Entity::Subscriber(entry)));

        let mut process = crate::registration::entries::ProcessEntry::default();
        process.host_name = "host-b".into();
        process.process_id = 2;
        table.on_announcement(&Announcement::Unregister(Entity::Process(process)));

        assert!(table.subscribers_for("fleet/pose").is_empty());
    }
}
