// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # hbus - high-performance pub/sub and RPC middleware
//!
//! A pure Rust middleware for inter-process communication on a single host
//! and across a local network. Processes publish named topics and consume
//! them through subscribers; processes expose RPC services consumed by
//! clients. Peers discover each other automatically, samples take shared
//! memory when peers are co-located and UDP/TCP otherwise, and the whole
//! fleet is observable through the monitoring aggregator.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hbus::{Components, Configuration, Context, DataTypeInfo};
//! use std::time::Duration;
//!
//! fn main() -> hbus::Result<()> {
//!     let ctx = Context::new(Configuration::default(), "sensor_node", Components::default())?;
//!
//!     let publisher = ctx.create_publisher("sensors/temperature", DataTypeInfo::default())?;
//!     publisher.send(b"23.5", 0)?;
//!
//!     let subscriber = ctx.create_subscriber("sensors/temperature", DataTypeInfo::default())?;
//!     let sample = subscriber.receive(Duration::from_secs(1))?;
//!     println!("got {} bytes", sample.payload.len());
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |                        Application Layer                           |
//! |    Context -> Publisher/Subscriber -> Server/Client                |
//! +--------------------------------------------------------------------+
//! |                        Registration Layer                          |
//! |    periodic announcements | matching | expiry | shutdown signals   |
//! +--------------------------------------------------------------------+
//! |                         Transport Layer                            |
//! |    Shared Memory (futex) | UDP Multicast (frag) | TCP (framed)     |
//! +--------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Context`] | Process-wide entry point, factory for all entities |
//! | [`Publisher`] | Sends samples to every matched subscriber |
//! | [`Subscriber`] | Receives samples via pull queue or callback |
//! | [`Server`] | Exposes named RPC methods over TCP |
//! | [`Client`] | Fans calls out across resolved server instances |
//! | [`Monitoring`] | Expiring view of every entity in the fleet |
//!
//! ## Modules Overview
//!
//! - [`process`] - context lifecycle (start here)
//! - [`pubsub`] - the topic data plane
//! - [`service`] - RPC servers and clients
//! - [`registration`] - discovery and liveness
//! - [`transport`] - shared memory, UDP, TCP mechanics
//! - [`monitoring`] - fleet introspection
//! - [`handles`] - the flat integer-handle API for language bindings

/// Process clock helpers.
pub mod clock;
/// Configuration record and option groups.
pub mod config;
/// Error taxonomy.
pub mod error;
/// Flat handle API for language bindings.
pub mod handles;
/// Logging provider (console/file/UDP sinks behind the `log` facade).
pub mod logging;
/// Monitoring aggregator.
pub mod monitoring;
/// Process context and lifecycle.
pub mod process;
/// Publish/subscribe data plane.
pub mod pubsub;
/// Registration layer (discovery, announcements, expiry).
pub mod registration;
/// RPC service layer.
pub mod service;
/// Sample transports.
pub mod transport;
/// Versioned wire records.
pub mod wire;

pub use config::{Configuration, LogLevel, LogMode, Severity, TransportKind};
pub use error::{Error, Result};
pub use monitoring::{Monitoring, MonitoringSnapshot};
pub use process::{Components, Context};
pub use pubsub::{Publisher, Sample, SampleView, Subscriber};
pub use registration::entries::{DataTypeInfo, LogEntry, TopicId};
pub use service::{CallState, Client, InstanceState, Server, ServiceResponse};

/// hbus version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Release date of this build.
pub const BUILD_DATE: &str = "2026-06-18";
