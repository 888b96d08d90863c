// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Registration data model: the entries a process announces for each of its
//! entities, and the wire codecs for them.
//!
//! Every announcement carries a full entry so receivers never need a second
//! lookup. Bodies are encoded with [`WireWriter`] and evolve additively;
//! decoders ignore trailing bytes they do not know.

use crate::config::{Severity, TransportKind};
use crate::error::{Error, Result};
use crate::wire::{RecordKind, WireReader, WireWriter};
use std::collections::BTreeMap;

/// Identity of a topic endpoint: `(host, pid, handle serial)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicId {
    /// Machine the endpoint lives on.
    pub host_name: String,
    /// OS process id.
    pub process_id: u32,
    /// Process-wide monotonically increasing handle counter.
    pub serial: u64,
}

impl TopicId {
    /// Append to a body.
    pub fn encode(&self, w: &mut WireWriter) {
        w.put_str(&self.host_name);
        w.put_u32(self.process_id);
        w.put_u64(self.serial);
    }

    /// Read from a body.
    pub fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        Ok(Self {
            host_name: r.get_string()?,
            process_id: r.get_u32()?,
            serial: r.get_u64()?,
        })
    }

    /// The snapshot/expiry key for this id.
    #[must_use]
    pub fn key(&self) -> EntityKey {
        EntityKey {
            host_name: self.host_name.clone(),
            process_id: self.process_id,
            serial: self.serial,
        }
    }
}

/// Key under which monitoring and match tables store entities.
///
/// Processes use serial 0; topics use their handle serial; services use
/// their instance id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityKey {
    /// Host name.
    pub host_name: String,
    /// OS process id.
    pub process_id: u32,
    /// Entity id within the process.
    pub serial: u64,
}

/// Opaque payload type annotation: `(name, encoding, descriptor)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataTypeInfo {
    /// Type name; empty means unspecified (matches anything).
    pub name: String,
    /// Encoding label (e.g. "proto", "raw"); informational.
    pub encoding: String,
    /// Opaque schema descriptor bytes.
    pub descriptor: Vec<u8>,
}

impl DataTypeInfo {
    fn encode(&self, w: &mut WireWriter) {
        w.put_str(&self.name);
        w.put_str(&self.encoding);
        w.put_bytes(&self.descriptor);
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        Ok(Self {
            name: r.get_string()?,
            encoding: r.get_string()?,
            descriptor: r.get_bytes()?.to_vec(),
        })
    }

    /// Two endpoints are compatible when either side leaves the type name
    /// unspecified or both agree on it.
    #[must_use]
    pub fn compatible_with(&self, other: &DataTypeInfo) -> bool {
        self.name.is_empty() || other.name.is_empty() || self.name == other.name
    }
}

/// Which side of a topic an entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Direction {
    /// Producing side.
    Publisher = 1,
    /// Consuming side.
    Subscriber = 2,
}

/// One transport offer on a topic entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportEndpoint {
    /// Transport kind.
    pub kind: TransportKind,
    /// Whether the endpoint is usable right now.
    pub active: bool,
    /// Kind-specific parameters (segment name, `ip:port`, group address).
    pub params: String,
}

impl TransportEndpoint {
    fn encode(&self, w: &mut WireWriter) {
        w.put_u8(self.kind as u8);
        w.put_u8(u8::from(self.active));
        w.put_str(&self.params);
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        let kind_raw = r.get_u8()?;
        let kind = TransportKind::from_u8(kind_raw)
            .ok_or_else(|| Error::Serialization(format!("unknown transport kind {}", kind_raw)))?;
        Ok(Self {
            kind,
            active: r.get_u8()? != 0,
            params: r.get_string()?,
        })
    }
}

/// A publisher or subscriber as seen by the fleet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicEntry {
    /// Endpoint identity.
    pub id: TopicId,
    /// Topic name.
    pub topic_name: String,
    /// Shared-memory eligibility group of the host; empty means "same as
    /// host".
    pub host_group_name: String,
    /// Owning process name (executable).
    pub process_name: String,
    /// Owning unit name.
    pub unit_name: String,
    /// Payload type annotation.
    pub data_type: DataTypeInfo,
    /// Which side this entry describes.
    pub direction: Direction,
    /// Offered transports with their parameters.
    pub transports: Vec<TransportEndpoint>,
    /// Last observed payload size.
    pub size_hint: u32,
    /// Matched peers on the same host.
    pub connections_local: u32,
    /// Matched peers on other hosts.
    pub connections_external: u32,
    /// Samples lost to overruns and backpressure.
    pub dropped: u64,
    /// Bumped on every refresh; a regression signals a new epoch.
    pub registration_clock: u64,
    /// Total samples sent or received.
    pub data_clock: u64,
    /// Smoothed send rate in millihertz.
    pub frequency_mhz: u32,
    /// Free-form attributes attached by the user.
    pub attributes: BTreeMap<String, String>,
}

impl TopicEntry {
    /// Encode the announcement body.
    #[must_use]
    pub fn encode_body(&self) -> Vec<u8> {
        let mut w = WireWriter::with_capacity(192);
        self.id.encode(&mut w);
        w.put_str(&self.topic_name);
        w.put_str(&self.host_group_name);
        w.put_str(&self.process_name);
        w.put_str(&self.unit_name);
        self.data_type.encode(&mut w);
        w.put_u8(self.direction as u8);
        w.put_u16(self.transports.len() as u16);
        for t in &self.transports {
            t.encode(&mut w);
        }
        w.put_u32(self.size_hint);
        w.put_u32(self.connections_local);
        w.put_u32(self.connections_external);
        w.put_u64(self.dropped);
        w.put_u64(self.registration_clock);
        w.put_u64(self.data_clock);
        w.put_u32(self.frequency_mhz);
        w.put_u16(self.attributes.len() as u16);
        for (k, v) in &self.attributes {
            w.put_str(k);
            w.put_str(v);
        }
        w.into_bytes()
    }

    /// Decode an announcement body.
    pub fn decode_body(body: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(body);
        let id = TopicId::decode(&mut r)?;
        let topic_name = r.get_string()?;
        let host_group_name = r.get_string()?;
        let process_name = r.get_string()?;
        let unit_name = r.get_string()?;
        let data_type = DataTypeInfo::decode(&mut r)?;
        let direction = match r.get_u8()? {
            1 => Direction::Publisher,
            2 => Direction::Subscriber,
            other => {
                return Err(Error::Serialization(format!(
                    "unknown topic direction {}",
                    other
                )))
            }
        };
        let transport_count = r.get_u16()?;
        let mut transports = Vec::with_capacity(usize::from(transport_count));
        for _ in 0..transport_count {
            transports.push(TransportEndpoint::decode(&mut r)?);
        }
        let size_hint = r.get_u32()?;
        let connections_local = r.get_u32()?;
        let connections_external = r.get_u32()?;
        let dropped = r.get_u64()?;
        let registration_clock = r.get_u64()?;
        let data_clock = r.get_u64()?;
        let frequency_mhz = r.get_u32()?;
        let attr_count = r.get_u16()?;
        let mut attributes = BTreeMap::new();
        for _ in 0..attr_count {
            let k = r.get_string()?;
            let v = r.get_string()?;
            attributes.insert(k, v);
        }
        Ok(Self {
            id,
            topic_name,
            host_group_name,
            process_name,
            unit_name,
            data_type,
            direction,
            transports,
            size_hint,
            connections_local,
            connections_external,
            dropped,
            registration_clock,
            data_clock,
            frequency_mhz,
            attributes,
        })
    }

    /// The transport endpoint of a given kind, if offered and active.
    #[must_use]
    pub fn transport(&self, kind: TransportKind) -> Option<&TransportEndpoint> {
        self.transports
            .iter()
            .find(|t| t.kind == kind && t.active)
    }
}

/// User-reported process state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessState {
    /// Coarse severity.
    pub severity: Severity,
    /// Severity refinement (1..=5 by convention).
    pub level: i32,
    /// Free-form explanation.
    pub info: String,
}

/// A participating process as seen by the fleet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessEntry {
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
    /// Joined command line.
    pub process_param: String,
    /// User-reported state.
    pub state: ProcessState,
    /// Time synchronization state (0 = none).
    pub tsync_state: i32,
    /// Time synchronization module name.
    pub tsync_module: String,
    /// Component init result (0 = ok).
    pub component_init_state: i32,
    /// Component init explanation.
    pub component_init_info: String,
    /// Core version string of the process.
    pub runtime_version: String,
    /// Bumped on every refresh.
    pub registration_clock: u64,
}

impl ProcessEntry {
    /// Encode the announcement body.
    #[must_use]
    pub fn encode_body(&self) -> Vec<u8> {
        let mut w = WireWriter::with_capacity(160);
        w.put_str(&self.host_name);
        w.put_str(&self.host_group_name);
        w.put_u32(self.process_id);
        w.put_str(&self.process_name);
        w.put_str(&self.unit_name);
        w.put_str(&self.process_param);
        w.put_u8(self.state.severity as u8);
        w.put_i32(self.state.level);
        w.put_str(&self.state.info);
        w.put_i32(self.tsync_state);
        w.put_str(&self.tsync_module);
        w.put_i32(self.component_init_state);
        w.put_str(&self.component_init_info);
        w.put_str(&self.runtime_version);
        w.put_u64(self.registration_clock);
        w.into_bytes()
    }

    /// Decode an announcement body.
    pub fn decode_body(body: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(body);
        Ok(Self {
            host_name: r.get_string()?,
            host_group_name: r.get_string()?,
            process_id: r.get_u32()?,
            process_name: r.get_string()?,
            unit_name: r.get_string()?,
            process_param: r.get_string()?,
            state: ProcessState {
                severity: Severity::from_u8(r.get_u8()?),
                level: r.get_i32()?,
                info: r.get_string()?,
            },
            tsync_state: r.get_i32()?,
            tsync_module: r.get_string()?,
            component_init_state: r.get_i32()?,
            component_init_info: r.get_string()?,
            runtime_version: r.get_string()?,
            registration_clock: r.get_u64()?,
        })
    }

    /// Snapshot key (processes use serial 0).
    #[must_use]
    pub fn key(&self) -> EntityKey {
        EntityKey {
            host_name: self.host_name.clone(),
            process_id: self.process_id,
            serial: 0,
        }
    }
}

/// One method exposed by a service server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MethodInfo {
    /// Method name.
    pub method_name: String,
    /// Request type name.
    pub request_type: String,
    /// Response type name.
    pub response_type: String,
    /// Completed invocations.
    pub call_count: u64,
}

impl MethodInfo {
    fn encode(&self, w: &mut WireWriter) {
        w.put_str(&self.method_name);
        w.put_str(&self.request_type);
        w.put_str(&self.response_type);
        w.put_u64(self.call_count);
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        Ok(Self {
            method_name: r.get_string()?,
            request_type: r.get_string()?,
            response_type: r.get_string()?,
            call_count: r.get_u64()?,
        })
    }
}

/// A service server as seen by the fleet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerEntry {
    /// Host name.
    pub host_name: String,
    /// OS process id.
    pub process_id: u32,
    /// Executable name.
    pub process_name: String,
    /// Unit name.
    pub unit_name: String,
    /// Service name.
    pub service_name: String,
    /// Process-wide unique, stable for the server lifetime.
    pub service_instance_id: u64,
    /// Listening port of the v0 protocol (0 = disabled).
    pub tcp_port_v0: u16,
    /// Listening port of the v1 protocol (0 = disabled).
    pub tcp_port_v1: u16,
    /// Highest protocol version offered.
    pub protocol_version: u8,
    /// Exposed methods.
    pub methods: Vec<MethodInfo>,
    /// Bumped on every refresh.
    pub registration_clock: u64,
}

impl ServerEntry {
    /// Encode the announcement body.
    #[must_use]
    pub fn encode_body(&self) -> Vec<u8> {
        let mut w = WireWriter::with_capacity(128);
        w.put_str(&self.host_name);
        w.put_u32(self.process_id);
        w.put_str(&self.process_name);
        w.put_str(&self.unit_name);
        w.put_str(&self.service_name);
        w.put_u64(self.service_instance_id);
        w.put_u16(self.tcp_port_v0);
        w.put_u16(self.tcp_port_v1);
        w.put_u8(self.protocol_version);
        w.put_u16(self.methods.len() as u16);
        for m in &self.methods {
            m.encode(&mut w);
        }
        w.put_u64(self.registration_clock);
        w.into_bytes()
    }

    /// Decode an announcement body.
    pub fn decode_body(body: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(body);
        let host_name = r.get_string()?;
        let process_id = r.get_u32()?;
        let process_name = r.get_string()?;
        let unit_name = r.get_string()?;
        let service_name = r.get_string()?;
        let service_instance_id = r.get_u64()?;
        let tcp_port_v0 = r.get_u16()?;
        let tcp_port_v1 = r.get_u16()?;
        let protocol_version = r.get_u8()?;
        let method_count = r.get_u16()?;
        let mut methods = Vec::with_capacity(usize::from(method_count));
        for _ in 0..method_count {
            methods.push(MethodInfo::decode(&mut r)?);
        }
        Ok(Self {
            host_name,
            process_id,
            process_name,
            unit_name,
            service_name,
            service_instance_id,
            tcp_port_v0,
            tcp_port_v1,
            protocol_version,
            methods,
            registration_clock: r.get_u64()?,
        })
    }

    /// Snapshot key (servers use their instance id).
    #[must_use]
    pub fn key(&self) -> EntityKey {
        EntityKey {
            host_name: self.host_name.clone(),
            process_id: self.process_id,
            serial: self.service_instance_id,
        }
    }
}

/// A service client as seen by the fleet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientEntry {
    /// Host name.
    pub host_name: String,
    /// OS process id.
    pub process_id: u32,
    /// Executable name.
    pub process_name: String,
    /// Unit name.
    pub unit_name: String,
    /// Service name the client resolves.
    pub service_name: String,
    /// Process-wide unique client instance id.
    pub service_instance_id: u64,
    /// Highest protocol version spoken.
    pub protocol_version: u8,
    /// Bumped on every refresh.
    pub registration_clock: u64,
}

impl ClientEntry {
    /// Encode the announcement body.
    #[must_use]
    pub fn encode_body(&self) -> Vec<u8> {
        let mut w = WireWriter::with_capacity(96);
        w.put_str(&self.host_name);
        w.put_u32(self.process_id);
        w.put_str(&self.process_name);
        w.put_str(&self.unit_name);
        w.put_str(&self.service_name);
        w.put_u64(self.service_instance_id);
        w.put_u8(self.protocol_version);
        w.put_u64(self.registration_clock);
        w.into_bytes()
    }

    /// Decode an announcement body.
    pub fn decode_body(body: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(body);
        Ok(Self {
            host_name: r.get_string()?,
            process_id: r.get_u32()?,
            process_name: r.get_string()?,
            unit_name: r.get_string()?,
            service_name: r.get_string()?,
            service_instance_id: r.get_u64()?,
            protocol_version: r.get_u8()?,
            registration_clock: r.get_u64()?,
        })
    }

    /// Snapshot key (clients use their instance id).
    #[must_use]
    pub fn key(&self) -> EntityKey {
        EntityKey {
            host_name: self.host_name.clone(),
            process_id: self.process_id,
            serial: self.service_instance_id,
        }
    }
}

/// Who a shutdown request targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownScope {
    /// The process with this unit name.
    UnitName(String),
    /// The process with this pid.
    Pid(u32),
    /// Every process in the fleet.
    All,
}

/// Fire-and-forget request for peers to shut down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownRequest {
    /// Target selector.
    pub scope: ShutdownScope,
}

impl ShutdownRequest {
    /// Encode the announcement body.
    #[must_use]
    pub fn encode_body(&self) -> Vec<u8> {
        let mut w = WireWriter::with_capacity(16);
        match &self.scope {
            ShutdownScope::UnitName(name) => {
                w.put_u8(1);
                w.put_str(name);
            }
            ShutdownScope::Pid(pid) => {
                w.put_u8(2);
                w.put_u32(*pid);
            }
            ShutdownScope::All => w.put_u8(3),
        }
        w.into_bytes()
    }

    /// Decode an announcement body.
    pub fn decode_body(body: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(body);
        let scope = match r.get_u8()? {
            1 => ShutdownScope::UnitName(r.get_string()?),
            2 => ShutdownScope::Pid(r.get_u32()?),
            3 => ShutdownScope::All,
            other => {
                return Err(Error::Serialization(format!(
                    "unknown shutdown scope {}",
                    other
                )))
            }
        };
        Ok(Self { scope })
    }
}

/// One entry in the distributed log stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Epoch microseconds at emission.
    pub time_us: u64,
    /// Emitting host.
    pub host_name: String,
    /// Emitting pid.
    pub process_id: u32,
    /// Emitting unit name.
    pub unit_name: String,
    /// Severity (reuses the configuration level scale).
    pub level: crate::config::LogLevel,
    /// Message text.
    pub message: String,
}

impl LogEntry {
    /// Encode the announcement body.
    #[must_use]
    pub fn encode_body(&self) -> Vec<u8> {
        let mut w = WireWriter::with_capacity(64 + self.message.len());
        w.put_u64(self.time_us);
        w.put_str(&self.host_name);
        w.put_u32(self.process_id);
        w.put_str(&self.unit_name);
        w.put_u8(self.level as u8);
        w.put_str(&self.message);
        w.into_bytes()
    }

    /// Decode an announcement body.
    pub fn decode_body(body: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(body);
        Ok(Self {
            time_us: r.get_u64()?,
            host_name: r.get_string()?,
            process_id: r.get_u32()?,
            unit_name: r.get_string()?,
            level: crate::config::LogLevel::from_u8(r.get_u8()?),
            message: r.get_string()?,
        })
    }
}

/// One announced entity, register or unregister side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entity {
    /// A process.
    Process(ProcessEntry),
    /// A publisher endpoint.
    Publisher(TopicEntry),
    /// A subscriber endpoint.
    Subscriber(TopicEntry),
    /// A service server.
    Server(ServerEntry),
    /// A service client.
    Client(ClientEntry),
}

impl Entity {
    /// The snapshot/expiry key.
    #[must_use]
    pub fn key(&self) -> EntityKey {
        match self {
            Entity::Process(e) => e.key(),
            Entity::Publisher(e) | Entity::Subscriber(e) => e.id.key(),
            Entity::Server(e) => e.key(),
            Entity::Client(e) => e.key(),
        }
    }

    /// The entity's registration clock.
    #[must_use]
    pub fn registration_clock(&self) -> u64 {
        match self {
            Entity::Process(e) => e.registration_clock,
            Entity::Publisher(e) | Entity::Subscriber(e) => e.registration_clock,
            Entity::Server(e) => e.registration_clock,
            Entity::Client(e) => e.registration_clock,
        }
    }

    /// Bump the registration clock before a refresh.
    pub fn bump_registration_clock(&mut self) {
        match self {
            Entity::Process(e) => e.registration_clock += 1,
            Entity::Publisher(e) | Entity::Subscriber(e) => e.registration_clock += 1,
            Entity::Server(e) => e.registration_clock += 1,
            Entity::Client(e) => e.registration_clock += 1,
        }
    }

    fn record_kind(&self, register: bool) -> RecordKind {
        match (self, register) {
            (Entity::Process(_), true) => RecordKind::RegisterProcess,
            (Entity::Publisher(_), true) => RecordKind::RegisterPublisher,
            (Entity::Subscriber(_), true) => RecordKind::RegisterSubscriber,
            (Entity::Server(_), true) => RecordKind::RegisterServer,
            (Entity::Client(_), true) => RecordKind::RegisterClient,
            (Entity::Process(_), false) => RecordKind::UnregisterProcess,
            (Entity::Publisher(_), false) => RecordKind::UnregisterPublisher,
            (Entity::Subscriber(_), false) => RecordKind::UnregisterSubscriber,
            (Entity::Server(_), false) => RecordKind::UnregisterServer,
            (Entity::Client(_), false) => RecordKind::UnregisterClient,
        }
    }

    fn encode_body(&self) -> Vec<u8> {
        match self {
            Entity::Process(e) => e.encode_body(),
            Entity::Publisher(e) | Entity::Subscriber(e) => e.encode_body(),
            Entity::Server(e) => e.encode_body(),
            Entity::Client(e) => e.encode_body(),
        }
    }
}

/// A parsed registration announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Announcement {
    /// Entity is alive; refresh or create it.
    Register(Entity),
    /// Entity is going away; purge it now.
    Unregister(Entity),
    /// Shutdown signalling.
    Shutdown(ShutdownRequest),
}

impl Announcement {
    /// Encode as a complete framed record.
    #[must_use]
    pub fn encode_record(&self) -> Vec<u8> {
        match self {
            Announcement::Register(e) => {
                crate::wire::encode_record(e.record_kind(true), &e.encode_body())
            }
            Announcement::Unregister(e) => {
                crate::wire::encode_record(e.record_kind(false), &e.encode_body())
            }
            Announcement::Shutdown(req) => {
                crate::wire::encode_record(RecordKind::ShutdownRequest, &req.encode_body())
            }
        }
    }

    /// Decode from a record kind and body.
    ///
    /// Returns `Ok(None)` for kinds that are not registration traffic.
    pub fn decode(kind: RecordKind, body: &[u8]) -> Result<Option<Self>> {
        let ann = match kind {
            RecordKind::RegisterProcess => {
                Announcement::Register(Entity::Process(ProcessEntry::decode_body(body)?))
            }
            RecordKind::RegisterPublisher => {
                Announcement::Register(Entity::Publisher(TopicEntry::decode_body(body)?))
            }
            RecordKind::RegisterSubscriber => {
                Announcement::Register(Entity::Subscriber(TopicEntry::decode_body(body)?))
            }
            RecordKind::RegisterServer => {
                Announcement::Register(Entity::Server(ServerEntry::decode_body(body)?))
            }
            RecordKind::RegisterClient => {
                Announcement::Register(Entity::Client(ClientEntry::decode_body(body)?))
            }
            RecordKind::UnregisterProcess => {
                Announcement::Unregister(Entity::Process(ProcessEntry::decode_body(body)?))
            }
            RecordKind::UnregisterPublisher => {
                Announcement::Unregister(Entity::Publisher(TopicEntry::decode_body(body)?))
            }
            RecordKind::UnregisterSubscriber => {
                Announcement::Unregister(Entity::Subscriber(TopicEntry::decode_body(body)?))
            }
            RecordKind::UnregisterServer => {
                Announcement::Unregister(Entity::Server(ServerEntry::decode_body(body)?))
            }
            RecordKind::UnregisterClient => {
                Announcement::Unregister(Entity::Client(ClientEntry::decode_body(body)?))
            }
            RecordKind::ShutdownRequest => {
                Announcement::Shutdown(ShutdownRequest::decode_body(body)?)
            }
            _ => return Ok(None),
        };
        Ok(Some(ann))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::decode_record;

    fn sample_topic_entry(direction: Direction) -> TopicEntry {
        let mut attributes = BTreeMap::new();
        attributes.insert("qos".to_string(), "best_effort".to_string());
        TopicEntry {
            id: TopicId {
                host_name: "host-a".into(),
                process_id: 100,
                serial: 3,
            },
            topic_name: "fleet/pose".into(),
            host_group_name: String::new(),
            process_name: "nav".into(),
            unit_name: "nav_unit".into(),
            data_type: DataTypeInfo {
                name: "Pose".into(),
                encoding: "raw".into(),
                descriptor: vec![1, 2],
            },
            direction,
            transports: vec![
                TransportEndpoint {
                    kind: TransportKind::Shm,
                    active: true,
                    params: "/hbus_100_3".into(),
                },
                TransportEndpoint {
                    kind: TransportKind::Tcp,
                    active: true,
                    params: "10.0.0.5:39000".into(),
                },
            ],
            size_hint: 128,
            connections_local: 1,
            connections_external: 0,
            dropped: 2,
            registration_clock: 9,
            data_clock: 1000,
            frequency_mhz: 10_000,
            attributes,
        }
    }

    #[test]
    fn topic_entry_roundtrip() {
        let entry = sample_topic_entry(Direction::Publisher);
        let decoded = TopicEntry::decode_body(&entry.encode_body()).unwrap();
        assert_eq!(decoded, entry);
        assert!(decoded.transport(TransportKind::Shm).is_some());
        assert!(decoded.transport(TransportKind::Udp).is_none());
    }

    #[test]
    fn process_entry_roundtrip() {
        let entry = ProcessEntry {
            host_name: "host-a".into(),
            host_group_name: "rack1".into(),
            process_id: 100,
            process_name: "nav".into(),
            unit_name: "nav_unit".into(),
            process_param: "nav --fast".into(),
            state: ProcessState {
                severity: Severity::Healthy,
                level: 1,
                info: "running".into(),
            },
            tsync_state: 0,
            tsync_module: String::new(),
            component_init_state: 0,
            component_init_info: "initialized".into(),
            runtime_version: "0.3.2".into(),
            registration_clock: 4,
        };
        let decoded = ProcessEntry::decode_body(&entry.encode_body()).unwrap();
        assert_eq!(decoded, entry);
        assert_eq!(decoded.key().serial, 0);
    }

    #[test]
    fn server_entry_roundtrip() {
        let entry = ServerEntry {
            host_name: "host-a".into(),
            process_id: 100,
            process_name: "calc".into(),
            unit_name: "calc_unit".into(),
            service_name: "math".into(),
            service_instance_id: 12,
            tcp_port_v0: 39001,
            tcp_port_v1: 39002,
            protocol_version: 1,
            methods: vec![MethodInfo {
                method_name: "add".into(),
                request_type: "AddReq".into(),
                response_type: "AddResp".into(),
                call_count: 7,
            }],
            registration_clock: 2,
        };
        let decoded = ServerEntry::decode_body(&entry.encode_body()).unwrap();
        assert_eq!(decoded, entry);
        assert_eq!(decoded.key().serial, 12);
    }

    #[test]
    fn announcement_record_roundtrip() {
        let ann = Announcement::Register(Entity::Subscriber(sample_topic_entry(
            Direction::Subscriber,
        )));
        let frame = ann.encode_record();
        let (kind, body) = decode_record(&frame).unwrap().unwrap();
        let decoded = Announcement::decode(kind, body).unwrap().unwrap();
        assert_eq!(decoded, ann);
    }

    #[test]
    fn shutdown_scopes_roundtrip() {
        for scope in [
            ShutdownScope::UnitName("nav_unit".into()),
            ShutdownScope::Pid(77),
            ShutdownScope::All,
        ] {
            let req = ShutdownRequest {
                scope: scope.clone(),
            };
            let decoded = ShutdownRequest::decode_body(&req.encode_body()).unwrap();
            assert_eq!(decoded.scope, scope);
        }
    }

    #[test]
    fn type_compatibility_rules() {
        let named = DataTypeInfo {
            name: "Pose".into(),
            ..DataTypeInfo::default()
        };
        let other = DataTypeInfo {
            name: "Twist".into(),
            ..DataTypeInfo::default()
        };
        let unspecified = DataTypeInfo::default();

        assert!(named.compatible_with(&named.clone()));
        assert!(named.compatible_with(&unspecified));
        assert!(unspecified.compatible_with(&named));
        assert!(!named.compatible_with(&other));
    }
}
