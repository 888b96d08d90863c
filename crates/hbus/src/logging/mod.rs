// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Logging provider: level-filtered sinks behind the `log` crate facade.
//!
//! One sink is active per the configuration: console (stderr), a
//! unit-name-stamped file, or UDP frames to the monitoring log port. The
//! provider doubles as the process's `log` backend when the logging
//! component is selected, so the core's own `log::*` calls and user
//! messages share one pipeline. Sink failures are swallowed - logging never
//! logs about itself.

use crate::clock::epoch_micros;
use crate::config::{Configuration, LogLevel, LogMode};
use crate::error::{Error, Result};
use crate::registration::entries::LogEntry;
use crate::wire::{encode_record, RecordKind};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// The active sink plumbing.
enum Sink {
    Console,
    File(Mutex<File>),
    Udp { socket: UdpSocket, dest: SocketAddr },
}

/// The logging component. One per context.
pub struct LogProvider {
    min_level: AtomicU8,
    sink: Sink,
    host_name: String,
    process_id: u32,
    unit_name: String,
}

impl LogProvider {
    /// Build the provider from the logging configuration.
    pub fn new(
        config: &Configuration,
        host_name: &str,
        process_id: u32,
        unit_name: &str,
    ) -> Result<Arc<Self>> {
        let sink = match config.logging.mode {
            LogMode::Console => Sink::Console,
            LogMode::File => {
                let dir = if config.logging.file_dir.is_empty() {
                    std::env::temp_dir()
                } else {
                    std::path::PathBuf::from(&config.logging.file_dir)
                };
                let path = dir.join(format!("{}_{}.log", unit_name, process_id));
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .map_err(|e| {
                        Error::InvalidArgument(format!(
                            "cannot open log file {}: {}",
                            path.display(),
                            e
                        ))
                    })?;
                Sink::File(Mutex::new(file))
            }
            LogMode::Udp => {
                let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
                let dest =
                    SocketAddr::from(SocketAddrV4::new(Ipv4Addr::LOCALHOST, config.log_port()));
                Sink::Udp { socket, dest }
            }
        };

        Ok(Arc::new(Self {
            min_level: AtomicU8::new(config.logging.level as u8),
            sink,
            host_name: host_name.to_string(),
            process_id,
            unit_name: unit_name.to_string(),
        }))
    }

    /// Change the minimum level that reaches the sink.
    pub fn set_level(&self, level: LogLevel) {
        self.min_level.store(level as u8, Ordering::Release);
    }

    /// Current minimum level.
    #[must_use]
    pub fn level(&self) -> LogLevel {
        LogLevel::from_u8(self.min_level.load(Ordering::Acquire))
    }

    /// Emit one message through the active sink.
    pub fn log(&self, level: LogLevel, message: &str) {
        if level < self.level() {
            return;
        }
        let time_us = epoch_micros();
        match &self.sink {
            Sink::Console => {
                eprintln!(
                    "[{}] [{:7}] [{}] {}",
                    time_us,
                    level_label(level),
                    self.unit_name,
                    message
                );
            }
            Sink::File(file) => {
                let mut file = file.lock();
                let _ = writeln!(
                    file,
                    "[{}] [{:7}] [{}] {}",
                    time_us,
                    level_label(level),
                    self.unit_name,
                    message
                );
                let _ = file.flush();
            }
            Sink::Udp { socket, dest } => {
                let entry = LogEntry {
                    time_us,
                    host_name: self.host_name.clone(),
                    process_id: self.process_id,
                    unit_name: self.unit_name.clone(),
                    level,
                    message: message.to_string(),
                };
                let frame = encode_record(RecordKind::LogEntry, &entry.encode_body());
                let _ = socket.send_to(&frame, *dest);
            }
        }
    }
}

fn level_label(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Debug => "DEBUG",
        LogLevel::Info => "INFO",
        LogLevel::Warning => "WARNING",
        LogLevel::Error => "ERROR",
    }
}

/// Adapter installing a [`LogProvider`] as the `log` crate backend.
struct LogBackend {
    provider: Arc<LogProvider>,
}

impl log::Log for LogBackend {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        map_level(metadata.level()) >= self.provider.level()
    }

    fn log(&self, record: &log::Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        self.provider
            .log(map_level(record.level()), &format!("{}", record.args()));
    }

    fn flush(&self) {}
}

fn map_level(level: log::Level) -> LogLevel {
    match level {
        log::Level::Error => LogLevel::Error,
        log::Level::Warn => LogLevel::Warning,
        log::Level::Info => LogLevel::Info,
        log::Level::Debug | log::Level::Trace => LogLevel::Debug,
    }
}

/// Install the provider as the process-wide `log` backend.
///
/// A second install (another context, a test harness logger) is a no-op;
/// the provider keeps working for direct [`LogProvider::log`] calls either
/// way.
pub fn install_backend(provider: &Arc<LogProvider>) {
    let backend = Box::new(LogBackend {
        provider: Arc::clone(provider),
    });
    if log::set_boxed_logger(backend).is_ok() {
        log::set_max_level(log::LevelFilter::Debug);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn config_with(mode: LogMode, level: LogLevel) -> Configuration {
        let mut cfg = Configuration::default();
        cfg.logging.mode = mode;
        cfg.logging.level = level;
        cfg
    }

    #[test]
    fn level_gate_filters_messages_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config_with(LogMode::File, LogLevel::Warning);
        cfg.logging.file_dir = dir.path().to_string_lossy().into_owned();

        let provider = LogProvider::new(&cfg, "host-a", 42, "unit").unwrap();
        provider.log(LogLevel::Info, "filtered out");
        provider.log(LogLevel::Error, "kept");

        let mut contents = String::new();
        File::open(dir.path().join("unit_42.log"))
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert!(!contents.contains("filtered out"));
        assert!(contents.contains("kept"));
    }

    #[test]
    fn set_level_takes_effect() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config_with(LogMode::File, LogLevel::Error);
        cfg.logging.file_dir = dir.path().to_string_lossy().into_owned();

        let provider = LogProvider::new(&cfg, "host-a", 43, "unit").unwrap();
        provider.log(LogLevel::Info, "early");
        provider.set_level(LogLevel::Debug);
        provider.log(LogLevel::Info, "late");

        let mut contents = String::new();
        File::open(dir.path().join("unit_43.log"))
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert!(!contents.contains("early"));
        assert!(contents.contains("late"));
    }

    #[test]
    fn udp_sink_frames_reach_a_local_receiver() {
        let receiver = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        receiver
            .set_read_timeout(Some(std::time::Duration::from_secs(3)))
            .unwrap();
        let port = receiver.local_addr().unwrap().port();

        let mut cfg = config_with(LogMode::Udp, LogLevel::Debug);
        cfg.logging.udp_port = port;
        let provider = LogProvider::new(&cfg, "host-a", 44, "unit").unwrap();
        provider.log(LogLevel::Warning, "over the wire");

        let mut buf = [0u8; 4096];
        let (len, _) = receiver.recv_from(&mut buf).unwrap();
        let (kind, body) = decode_record_helper(&buf[..len]);
        assert_eq!(kind, RecordKind::LogEntry);
        let entry = LogEntry::decode_body(body).unwrap();
        assert_eq!(entry.message, "over the wire");
        assert_eq!(entry.level, LogLevel::Warning);
        assert_eq!(entry.process_id, 44);
    }

    fn decode_record_helper(frame: &[u8]) -> (RecordKind, &[u8]) {
        crate::wire::decode_record(frame).unwrap().unwrap()
    }
}
