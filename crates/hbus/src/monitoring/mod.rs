// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Monitoring aggregator: an expiring view of every entity in the fleet,
//! fed by registration announcements, plus the buffered log stream.
//!
//! Snapshots are deep copies; the include/exclude regex filters apply to
//! topic names when enabled, with exclude winning over include. Expiry runs
//! on the registration timer via [`RegistrationListener::on_tick`].

use crate::config::Configuration;
use crate::error::{Error, Result};
use crate::registration::entries::{
    Announcement, ClientEntry, Entity, EntityKey, LogEntry, ProcessEntry, ServerEntry, TopicEntry,
};
use crate::registration::RegistrationListener;
use crate::wire::{decode_record, RecordKind};
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Bound on buffered log entries between two `get_logging` calls.
const LOG_BUFFER_CAP: usize = 10_000;

/// A deep-copied view of the fleet at one point in time.
#[derive(Debug, Clone, Default)]
pub struct MonitoringSnapshot {
    /// Known processes.
    pub processes: Vec<ProcessEntry>,
    /// Known publisher endpoints.
    pub publishers: Vec<TopicEntry>,
    /// Known subscriber endpoints.
    pub subscribers: Vec<TopicEntry>,
    /// Known service servers.
    pub servers: Vec<ServerEntry>,
    /// Known service clients.
    pub clients: Vec<ClientEntry>,
}

struct Tracked<T> {
    entry: T,
    last_seen_us: u64,
}

struct FilterState {
    include: Option<Regex>,
    exclude: Option<Regex>,
    enabled: bool,
}

impl FilterState {
    fn passes(&self, topic_name: &str) -> bool {
        if !self.enabled {
            return true;
        }
        if let Some(exclude) = &self.exclude {
            if exclude.is_match(topic_name) {
                return false;
            }
        }
        match &self.include {
            Some(include) => include.is_match(topic_name),
            None => true,
        }
    }
}

/// The monitoring component. A registration listener.
pub struct Monitoring {
    timeout_us: u64,
    filter: RwLock<FilterState>,
    processes: RwLock<HashMap<EntityKey, Tracked<ProcessEntry>>>,
    publishers: RwLock<HashMap<EntityKey, Tracked<TopicEntry>>>,
    subscribers: RwLock<HashMap<EntityKey, Tracked<TopicEntry>>>,
    servers: RwLock<HashMap<EntityKey, Tracked<ServerEntry>>>,
    clients: RwLock<HashMap<EntityKey, Tracked<ClientEntry>>>,
    log_buffer: Mutex<Vec<LogEntry>>,
    log_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Monitoring {
    /// Build the aggregator from the monitoring configuration.
    pub fn new(config: &Configuration) -> Result<Arc<Self>> {
        let compile = |pattern: &str, what: &str| -> Result<Option<Regex>> {
            if pattern.is_empty() {
                return Ok(None);
            }
            Regex::new(pattern)
                .map(Some)
                .map_err(|e| Error::InvalidArgument(format!("{} regex: {}", what, e)))
        };
        let filter = FilterState {
            include: compile(&config.monitoring.filter_incl, "include")?,
            exclude: compile(&config.monitoring.filter_excl, "exclude")?,
            enabled: config.monitoring.filter_enabled,
        };

        Ok(Arc::new(Self {
            timeout_us: config.monitoring.timeout_ms * 1000,
            filter: RwLock::new(filter),
            processes: RwLock::new(HashMap::new()),
            publishers: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(HashMap::new()),
            servers: RwLock::new(HashMap::new()),
            clients: RwLock::new(HashMap::new()),
            log_buffer: Mutex::new(Vec::new()),
            log_thread: Mutex::new(None),
        }))
    }

    /// Start the UDP log receiver on `port`, buffering entries for
    /// [`Monitoring::get_logging`].
    pub fn start_log_receiver(
        self: &Arc<Self>,
        port: u16,
        running: Arc<AtomicBool>,
    ) -> Result<()> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        crate::transport::udp::set_reuse_port(&socket)?;
        let bind = SocketAddr::from(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
        socket.bind(&bind.into())?;
        let socket: UdpSocket = socket.into();
        socket.set_read_timeout(Some(Duration::from_millis(100)))?;

        let monitoring = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("hbus-mon-log".into())
            .spawn(move || monitoring.log_receive_loop(&socket, &running))
            .map_err(|e| Error::Internal(format!("spawn log receiver: {}", e)))?;
        *self.log_thread.lock() = Some(handle);
        Ok(())
    }

    fn log_receive_loop(&self, socket: &UdpSocket, running: &AtomicBool) {
        let mut buf = vec![0u8; 64 * 1024];
        while running.load(Ordering::Acquire) {
            let len = match socket.recv_from(&mut buf) {
                Ok((len, _)) => len,
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(_) => continue,
            };
            if let Ok(Some((RecordKind::LogEntry, body))) = decode_record(&buf[..len]) {
                if let Ok(entry) = LogEntry::decode_body(body) {
                    self.push_log(entry);
                }
            }
        }
    }

    /// Buffer one log entry (receiver path; also used by tests).
    pub fn push_log(&self, entry: LogEntry) {
        let mut buffer = self.log_buffer.lock();
        if buffer.len() < LOG_BUFFER_CAP {
            buffer.push(entry);
        }
    }

    /// Join the log receiver; the shared running flag must be false.
    pub fn stop(&self) {
        if let Some(handle) = self.log_thread.lock().take() {
            handle.join().ok();
        }
    }

    /// Enable or disable the topic-name filters.
    pub fn set_filter_state(&self, enabled: bool) {
        self.filter.write().enabled = enabled;
    }

    /// Set the include filter; empty clears it.
    pub fn set_include_filter(&self, pattern: &str) -> Result<()> {
        let regex = if pattern.is_empty() {
            None
        } else {
            Some(
                Regex::new(pattern)
                    .map_err(|e| Error::InvalidArgument(format!("include regex: {}", e)))?,
            )
        };
        self.filter.write().include = regex;
        Ok(())
    }

    /// Set the exclude filter; empty clears it. Exclude wins over include.
    pub fn set_exclude_filter(&self, pattern: &str) -> Result<()> {
        let regex = if pattern.is_empty() {
            None
        } else {
            Some(
                Regex::new(pattern)
                    .map_err(|e| Error::InvalidArgument(format!("exclude regex: {}", e)))?,
            )
        };
        self.filter.write().exclude = regex;
        Ok(())
    }

    /// A deep copy of the current fleet view, topic filters applied.
    #[must_use]
    pub fn get_monitoring(&self) -> MonitoringSnapshot {
        let filter = self.filter.read();
        MonitoringSnapshot {
            processes: self
                .processes
                .read()
                .values()
                .map(|t| t.entry.clone())
                .collect(),
            publishers: self
                .publishers
                .read()
                .values()
                .filter(|t| filter.passes(&t.entry.topic_name))
                .map(|t| t.entry.clone())
                .collect(),
            subscribers: self
                .subscribers
                .read()
                .values()
                .filter(|t| filter.passes(&t.entry.topic_name))
                .map(|t| t.entry.clone())
                .collect(),
            servers: self
                .servers
                .read()
                .values()
                .map(|t| t.entry.clone())
                .collect(),
            clients: self
                .clients
                .read()
                .values()
                .map(|t| t.entry.clone())
                .collect(),
        }
    }

    /// Return and clear the buffered log entries.
    #[must_use]
    pub fn get_logging(&self) -> Vec<LogEntry> {
        std::mem::take(&mut *self.log_buffer.lock())
    }

    fn upsert<T>(map: &RwLock<HashMap<EntityKey, Tracked<T>>>, key: EntityKey, entry: T, now: u64) {
        // A regressed registration clock means a restarted entity; replacing
        // the tracked entry covers both refresh and new-epoch cases.
        map.write().insert(
            key,
            Tracked {
                entry,
                last_seen_us: now,
            },
        );
    }

    fn expire<T>(map: &RwLock<HashMap<EntityKey, Tracked<T>>>, now: u64, horizon: u64) {
        map.write()
            .retain(|_, tracked| now.saturating_sub(tracked.last_seen_us) <= horizon);
    }
}

impl RegistrationListener for Monitoring {
    fn on_announcement(&self, announcement: &Announcement) {
        let now = crate::clock::epoch_micros();
        match announcement {
            Announcement::Register(entity) => match entity {
                Entity::Process(e) => Self::upsert(&self.processes, e.key(), e.clone(), now),
                Entity::Publisher(e) => {
                    Self::upsert(&self.publishers, e.id.key(), e.clone(), now);
                }
                Entity::Subscriber(e) => {
                    Self::upsert(&self.subscribers, e.id.key(), e.clone(), now);
                }
                Entity::Server(e) => Self::upsert(&self.servers, e.key(), e.clone(), now),
                Entity::Client(e) => Self::upsert(&self.clients, e.key(), e.clone(), now),
            },
            Announcement::Unregister(entity) => match entity {
                Entity::Process(e) => {
                    self.processes.write().remove(&e.key());
                    // A departing process takes its endpoints with it.
                    let host = e.host_name.clone();
                    let pid = e.process_id;
                    let owned =
                        |key: &EntityKey| key.host_name == host && key.process_id == pid;
                    self.publishers.write().retain(|key, _| !owned(key));
                    self.subscribers.write().retain(|key, _| !owned(key));
                    self.servers.write().retain(|key, _| !owned(key));
                    self.clients.write().retain(|key, _| !owned(key));
                }
                Entity::Publisher(e) => {
                    self.publishers.write().remove(&e.id.key());
                }
                Entity::Subscriber(e) => {
                    self.subscribers.write().remove(&e.id.key());
                }
                Entity::Server(e) => {
                    self.servers.write().remove(&e.key());
                }
                Entity::Client(e) => {
                    self.clients.write().remove(&e.key());
                }
            },
            Announcement::Shutdown(_) => {}
        }
    }

    fn on_tick(&self, now_us: u64) {
        Self::expire(&self.processes, now_us, self.timeout_us);
        Self::expire(&self.publishers, now_us, self.timeout_us);
        Self::expire(&self.subscribers, now_us, self.timeout_us);
        Self::expire(&self.servers, now_us, self.timeout_us);
        Self::expire(&self.clients, now_us, self.timeout_us);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogLevel;
    use crate::registration::entries::{DataTypeInfo, Direction, TopicId};
    use std::collections::BTreeMap;

    fn topic_entry(topic: &str, serial: u64, direction: Direction) -> TopicEntry {
        TopicEntry {
            id: TopicId {
                host_name: "host-a".into(),
                process_id: 7,
                serial,
            },
            topic_name: topic.into(),
            host_group_name: String::new(),
            process_name: "p".into(),
            unit_name: "u".into(),
            data_type: DataTypeInfo::default(),
            direction,
            transports: Vec::new(),
            size_hint: 0,
            connections_local: 0,
            connections_external: 0,
            dropped: 0,
            registration_clock: 1,
            data_clock: 0,
            frequency_mhz: 0,
            attributes: BTreeMap::new(),
        }
    }

    fn register(monitoring: &Monitoring, topic: &str, serial: u64) {
        monitoring.on_announcement(&Announcement::Register(Entity::Publisher(topic_entry(
            topic,
            serial,
            Direction::Publisher,
        ))));
    }

    #[test]
    fn snapshot_contains_registered_entities() {
        let monitoring = Monitoring::new(&Configuration::default()).unwrap();
        register(&monitoring, "fleet/pose", 1);
        monitoring.on_announcement(&Announcement::Register(Entity::Subscriber(topic_entry(
            "fleet/pose",
            2,
            Direction::Subscriber,
        ))));

        let snapshot = monitoring.get_monitoring();
        assert_eq!(snapshot.publishers.len(), 1);
        assert_eq!(snapshot.subscribers.len(), 1);
        assert!(snapshot.processes.is_empty());
    }

    #[test]
    fn refresh_updates_instead_of_duplicating() {
        let monitoring = Monitoring::new(&Configuration::default()).unwrap();
        let mut entry = topic_entry("fleet/pose", 1, Direction::Publisher);
        for clock in 1..5 {
            entry.registration_clock = clock;
            monitoring.on_announcement(&Announcement::Register(Entity::Publisher(entry.clone())));
        }
        let snapshot = monitoring.get_monitoring();
        assert_eq!(snapshot.publishers.len(), 1);
        assert_eq!(snapshot.publishers[0].registration_clock, 4);
    }

    #[test]
    fn include_and_exclude_filters_compose() {
        let mut config = Configuration::default();
        config.monitoring.filter_incl = "^foo/.*".into();
        config.monitoring.filter_excl = "foo/secret".into();
        config.monitoring.filter_enabled = true;
        let monitoring = Monitoring::new(&config).unwrap();

        register(&monitoring, "foo/bar", 1);
        register(&monitoring, "foo/secret", 2);
        register(&monitoring, "bar/baz", 3);

        let snapshot = monitoring.get_monitoring();
        let names: Vec<&str> = snapshot
            .publishers
            .iter()
            .map(|t| t.topic_name.as_str())
            .collect();
        assert_eq!(names, vec!["foo/bar"]);

        // Disabling the filter reveals everything.
        monitoring.set_filter_state(false);
        assert_eq!(monitoring.get_monitoring().publishers.len(), 3);
    }

    #[test]
    fn entities_expire_after_the_timeout() {
        let mut config = Configuration::default();
        config.monitoring.timeout_ms = 50;
        let monitoring = Monitoring::new(&config).unwrap();

        register(&monitoring, "fleet/pose", 1);
        assert_eq!(monitoring.get_monitoring().publishers.len(), 1);

        let later = crate::clock::epoch_micros() + 200_000;
        monitoring.on_tick(later);
        assert!(monitoring.get_monitoring().publishers.is_empty());
    }

    #[test]
    fn unregistered_process_takes_endpoints_along() {
        let monitoring = Monitoring::new(&Configuration::default()).unwrap();
        register(&monitoring, "fleet/pose", 1);

        let mut process = ProcessEntry::default();
        process.host_name = "host-a".into();
        process.process_id = 7;
        monitoring.on_announcement(&Announcement::Register(Entity::Process(process.clone())));
        assert_eq!(monitoring.get_monitoring().processes.len(), 1);

        monitoring.on_announcement(&Announcement::Unregister(Entity::Process(process)));
        let snapshot = monitoring.get_monitoring();
        assert!(snapshot.processes.is_empty());
        assert!(snapshot.publishers.is_empty());
    }

    #[test]
    fn logging_buffer_drains_on_read() {
        let monitoring = Monitoring::new(&Configuration::default()).unwrap();
        monitoring.push_log(LogEntry {
            time_us: 1,
            host_name: "host-a".into(),
            process_id: 7,
            unit_name: "u".into(),
            level: LogLevel::Warning,
            message: "something odd".into(),
        });

        let drained = monitoring.get_logging();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].message, "something odd");
        assert!(monitoring.get_logging().is_empty());
    }

    #[test]
    fn bad_filter_pattern_is_invalid_argument() {
        let monitoring = Monitoring::new(&Configuration::default()).unwrap();
        assert!(matches!(
            monitoring.set_include_filter("[unclosed"),
            Err(Error::InvalidArgument(_))
        ));
    }
}
