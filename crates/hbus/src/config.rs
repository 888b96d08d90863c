// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! hbus configuration record - single source of truth for runtime options.
//!
//! The [`Configuration`] value is consumed once at context initialization and
//! is immutable afterwards. External loaders (YAML front-ends) produce this
//! record; the core never touches files or environment variables for
//! configuration.
//!
//! # Port layout
//!
//! All sockets derive from [`PORT_BASE`]:
//!
//! | Port | Use |
//! |------|-----|
//! | `PORT_BASE`     | registration announcements (UDP multicast) |
//! | `PORT_BASE + 1` | log stream (UDP unicast to monitoring) |
//! | `PORT_BASE + 2` | sample multicast groups |
//!
//! Service and TCP sample ports are OS-assigned and advertised through
//! registration.

use crate::error::{Error, Result};
use std::net::Ipv4Addr;

/// Base UDP port for registration traffic.
///
/// **Never hardcode 14000 elsewhere!**
pub const PORT_BASE: u16 = 14000;

/// UDP port carrying the serialized log stream.
pub const LOG_PORT_OFFSET: u16 = 1;

/// UDP port carrying sample fragments.
pub const SAMPLE_PORT_OFFSET: u16 = 2;

/// Base multicast group for registration and sample traffic.
///
/// Sample groups are derived per topic: `239.255.0.(1 + hash % mask)`.
pub const MULTICAST_GROUP_BASE: Ipv4Addr = Ipv4Addr::new(239, 255, 0, 1);

/// Severity of a user-reported process state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Severity {
    /// No state reported yet.
    #[default]
    Unknown = 0,
    /// Process is healthy.
    Healthy = 1,
    /// Process reported a warning.
    Warning = 2,
    /// Process reported a critical condition.
    Critical = 3,
    /// Process reported a failure.
    Failed = 4,
}

impl Severity {
    /// Decode from a wire byte; unknown values collapse to `Unknown`.
    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Severity::Healthy,
            2 => Severity::Warning,
            3 => Severity::Critical,
            4 => Severity::Failed,
            _ => Severity::Unknown,
        }
    }
}

/// Log levels, ordered from most to least verbose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(u8)]
pub enum LogLevel {
    /// Development detail.
    Debug = 0,
    /// Normal operational messages.
    #[default]
    Info = 1,
    /// Suspicious but non-fatal conditions.
    Warning = 2,
    /// Failures.
    Error = 3,
}

impl LogLevel {
    /// Decode from a wire byte; unknown values collapse to `Info`.
    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => LogLevel::Debug,
            2 => LogLevel::Warning,
            3 => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

/// Where log entries go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogMode {
    /// stderr.
    #[default]
    Console,
    /// A unit-name-stamped log file.
    File,
    /// Serialized entries to the monitoring log port.
    Udp,
}

/// Transports a publisher can choose from, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TransportKind {
    /// Shared-memory segment (same host only).
    Shm = 1,
    /// UDP multicast with fragmentation.
    Udp = 2,
    /// Length-prefixed TCP stream per matched pair.
    Tcp = 3,
}

impl TransportKind {
    /// Decode from a wire byte.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(TransportKind::Shm),
            2 => Some(TransportKind::Udp),
            3 => Some(TransportKind::Tcp),
            _ => None,
        }
    }
}

/// Registration layer options.
#[derive(Debug, Clone)]
pub struct RegistrationConfig {
    /// Period between announcements of each local entity.
    pub refresh_interval_ms: u64,
    /// Remote entities expire after this long without a refresh.
    pub timeout_ms: u64,
    /// Announce over UDP multicast.
    pub udp_enable: bool,
    /// Announce over the host-local shared segment.
    pub shm_enable: bool,
    /// Shared-memory eligibility group; empty means "same as host".
    pub host_group_name: String,
    /// Whether announcements leave the host at all.
    pub network_enabled: bool,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            refresh_interval_ms: 1000,
            timeout_ms: 5100,
            udp_enable: true,
            shm_enable: false,
            host_group_name: String::new(),
            network_enabled: false,
        }
    }
}

/// UDP addressing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UdpMode {
    /// Multicast groups derived per topic (default).
    #[default]
    Multicast,
    /// Direct unicast to matched peers.
    Unicast,
}

/// UDP transport options.
#[derive(Debug, Clone)]
pub struct UdpConfig {
    /// Whether UDP is offered as a sample transport.
    pub enable: bool,
    /// Addressing mode.
    pub mode: UdpMode,
    /// Base port; see the module docs for the derived layout.
    pub port: u16,
    /// Multicast TTL (1 = stay on the subnet).
    pub ttl: u8,
    /// Size of the derived multicast group range.
    pub mask: u8,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            enable: true,
            mode: UdpMode::Multicast,
            port: PORT_BASE,
            ttl: 3,
            mask: 15,
        }
    }
}

/// TCP sample transport options.
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Whether TCP is offered as a sample transport.
    pub enable: bool,
    /// Reader threads accepting inbound sample streams.
    pub reader_threads: usize,
    /// Writer threads (reserved; writes currently happen on the send path).
    pub writer_threads: usize,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            enable: true,
            reader_threads: 4,
            writer_threads: 4,
        }
    }
}

/// Shared-memory transport options.
#[derive(Debug, Clone)]
pub struct ShmConfig {
    /// Whether shared memory is offered as a sample transport.
    pub enable: bool,
    /// Minimum segment payload capacity.
    pub memfile_min_size_bytes: usize,
    /// Extra headroom applied when a segment grows, in percent.
    pub memfile_reserve_percent: usize,
    /// How long a writer waits for reader acknowledgements before counting
    /// the write as dropped and moving on.
    pub ack_timeout_ms: u64,
    /// Deliver borrowed buffers straight out of the mapped segment.
    pub zero_copy: bool,
}

impl Default for ShmConfig {
    fn default() -> Self {
        Self {
            enable: true,
            memfile_min_size_bytes: 4096,
            memfile_reserve_percent: 50,
            ack_timeout_ms: 5,
            zero_copy: false,
        }
    }
}

/// Transport layer options.
#[derive(Debug, Clone, Default)]
pub struct TransportConfig {
    /// UDP options.
    pub udp: UdpConfig,
    /// TCP options.
    pub tcp: TcpConfig,
    /// Shared-memory options.
    pub shm: ShmConfig,
}

/// Subscriber-side delivery options.
#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    /// Discard samples that arrive with a sequence at or below the last
    /// delivered one for their publisher.
    pub drop_out_of_order: bool,
    /// Discard samples older than this at delivery time; 0 disables.
    pub filter_expired_samples_ms: u64,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            drop_out_of_order: true,
            filter_expired_samples_ms: 0,
        }
    }
}

/// Publisher-side transport selection.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Preference order for same-host peers.
    pub priority_local: Vec<TransportKind>,
    /// Preference order for remote peers.
    pub priority_remote: Vec<TransportKind>,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            priority_local: vec![TransportKind::Shm, TransportKind::Udp, TransportKind::Tcp],
            priority_remote: vec![TransportKind::Udp, TransportKind::Tcp],
        }
    }
}

/// Service protocol options.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Offer the v0 request/response protocol.
    pub protocol_v0_enable: bool,
    /// Offer the v1 request/response protocol.
    pub protocol_v1_enable: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            protocol_v0_enable: true,
            protocol_v1_enable: true,
        }
    }
}

/// Monitoring aggregator options.
#[derive(Debug, Clone)]
pub struct MonitoringConfig {
    /// Entities expire from the snapshot after this long without a refresh.
    pub timeout_ms: u64,
    /// Exclude regex applied to topic names; wins over include.
    pub filter_excl: String,
    /// Include regex applied to topic names.
    pub filter_incl: String,
    /// Whether the filters are applied at all.
    pub filter_enabled: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5100,
            filter_excl: String::new(),
            filter_incl: String::new(),
            filter_enabled: false,
        }
    }
}

/// Logging provider options.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Minimum level that reaches the sinks.
    pub level: LogLevel,
    /// Sink selection.
    pub mode: LogMode,
    /// Directory for the file sink; empty means the system temp dir.
    pub file_dir: String,
    /// UDP log port; 0 derives `udp.port + LOG_PORT_OFFSET`.
    pub udp_port: u16,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            mode: LogMode::Console,
            file_dir: String::new(),
            udp_port: 0,
        }
    }
}

/// The complete, immutable configuration record consumed at init time.
#[derive(Debug, Clone, Default)]
pub struct Configuration {
    /// Registration layer options.
    pub registration: RegistrationConfig,
    /// Transport layer options.
    pub transport: TransportConfig,
    /// Subscriber options.
    pub subscriber: SubscriberConfig,
    /// Publisher options.
    pub publisher: PublisherConfig,
    /// Service options.
    pub service: ServiceConfig,
    /// Monitoring options.
    pub monitoring: MonitoringConfig,
    /// Logging options.
    pub logging: LoggingConfig,
}

impl Configuration {
    /// Effective UDP log port.
    #[must_use]
    pub fn log_port(&self) -> u16 {
        if self.logging.udp_port != 0 {
            self.logging.udp_port
        } else {
            self.transport.udp.port + LOG_PORT_OFFSET
        }
    }

    /// Effective UDP sample port.
    #[must_use]
    pub fn sample_port(&self) -> u16 {
        self.transport.udp.port + SAMPLE_PORT_OFFSET
    }

    /// Validate cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidArgument` for zero intervals, an expiry not
    /// exceeding the refresh interval, an empty publisher priority list, or
    /// filter strings that are not valid regular expressions.
    pub fn validate(&self) -> Result<()> {
        if self.registration.refresh_interval_ms == 0 {
            return Err(Error::InvalidArgument(
                "registration.refresh_interval_ms must be > 0".into(),
            ));
        }
        if self.registration.timeout_ms <= self.registration.refresh_interval_ms {
            return Err(Error::InvalidArgument(
                "registration.timeout_ms must exceed refresh_interval_ms".into(),
            ));
        }
        if self.publisher.priority_local.is_empty() && self.publisher.priority_remote.is_empty() {
            return Err(Error::InvalidArgument(
                "publisher priority lists must name at least one transport".into(),
            ));
        }
        if self.transport.udp.mask == 0 {
            return Err(Error::InvalidArgument(
                "transport.udp.mask must be > 0".into(),
            ));
        }
        for (name, pattern) in [
            ("monitoring.filter_excl", &self.monitoring.filter_excl),
            ("monitoring.filter_incl", &self.monitoring.filter_incl),
        ] {
            if !pattern.is_empty() {
                regex::Regex::new(pattern).map_err(|e| {
                    Error::InvalidArgument(format!("{} is not a valid regex: {}", name, e))
                })?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Configuration::default();
        assert_eq!(cfg.registration.refresh_interval_ms, 1000);
        assert_eq!(cfg.registration.timeout_ms, 5100);
        assert!(cfg.subscriber.drop_out_of_order);
        assert!(cfg.transport.shm.enable);
        assert_eq!(cfg.transport.shm.memfile_min_size_bytes, 4096);
        assert_eq!(
            cfg.publisher.priority_local,
            vec![TransportKind::Shm, TransportKind::Udp, TransportKind::Tcp]
        );
        assert_eq!(
            cfg.publisher.priority_remote,
            vec![TransportKind::Udp, TransportKind::Tcp]
        );
        assert!(!cfg.monitoring.filter_enabled);
        assert_eq!(cfg.log_port(), PORT_BASE + LOG_PORT_OFFSET);
        assert_eq!(cfg.sample_port(), PORT_BASE + SAMPLE_PORT_OFFSET);
    }

    #[test]
    fn validate_accepts_defaults() {
        assert!(Configuration::default().validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_refresh() {
        let mut cfg = Configuration::default();
        cfg.registration.refresh_interval_ms = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_timeout_below_refresh() {
        let mut cfg = Configuration::default();
        cfg.registration.timeout_ms = cfg.registration.refresh_interval_ms;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_filter_regex() {
        let mut cfg = Configuration::default();
        cfg.monitoring.filter_incl = "[unclosed".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn severity_and_level_roundtrip() {
        assert_eq!(Severity::from_u8(Severity::Critical as u8), Severity::Critical);
        assert_eq!(Severity::from_u8(99), Severity::Unknown);
        assert_eq!(LogLevel::from_u8(LogLevel::Error as u8), LogLevel::Error);
        assert_eq!(LogLevel::from_u8(99), LogLevel::Info);
        assert!(LogLevel::Debug < LogLevel::Error);
    }

    #[test]
    fn transport_kind_roundtrip() {
        for kind in [TransportKind::Shm, TransportKind::Udp, TransportKind::Tcp] {
            assert_eq!(TransportKind::from_u8(kind as u8), Some(kind));
        }
        assert_eq!(TransportKind::from_u8(0), None);
    }
}
