// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Monitoring a small fleet of contexts over the host-local registration
//! ring, including the log stream.

use hbus::registration::ring_name;
use hbus::transport::shm::Segment;
use hbus::{Components, Configuration, Context, DataTypeInfo, LogLevel, LogMode};
use std::time::{Duration, Instant};

fn fleet_config(salt: u16) -> Configuration {
    let mut cfg = Configuration::default();
    let base = 45000u16.wrapping_add((std::process::id() as u16).wrapping_mul(19) % 8000);
    cfg.transport.udp.port = base + salt * 3;
    cfg.registration.refresh_interval_ms = 50;
    cfg.registration.timeout_ms = 500;
    cfg.registration.udp_enable = false;
    cfg.registration.shm_enable = true;
    cfg.transport.udp.enable = false;
    cfg
}

fn monitoring_components() -> Components {
    Components {
        monitoring: true,
        ..Components::default()
    }
}

fn wait_until(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

fn cleanup(cfg: &Configuration) {
    Segment::unlink(&ring_name(cfg.transport.udp.port)).ok();
}

#[test]
fn snapshot_tracks_a_peer_process_and_its_topics() {
    let cfg = fleet_config(1);
    let mon_ctx = Context::new(cfg.clone(), "fleet_mon", monitoring_components()).unwrap();
    let peer_ctx = Context::new(cfg.clone(), "fleet_peer", Components::default()).unwrap();

    let _publisher = peer_ctx.create_publisher("greet", DataTypeInfo::default()).unwrap();
    let _subscriber = peer_ctx
        .create_subscriber("greet", DataTypeInfo::default())
        .unwrap();

    let monitoring = mon_ctx.monitoring().unwrap();
    assert!(
        wait_until(Duration::from_secs(5), || {
            let snapshot = monitoring.get_monitoring();
            let pubs = snapshot
                .publishers
                .iter()
                .filter(|t| t.topic_name == "greet")
                .count();
            let subs = snapshot
                .subscribers
                .iter()
                .filter(|t| t.topic_name == "greet")
                .count();
            pubs == 1 && subs == 1
        }),
        "peer endpoints never showed up in the snapshot"
    );

    // Both contexts share this process's pid, so the process entry key is
    // contended between them; poll until the peer's refresh lands.
    assert!(wait_until(Duration::from_secs(5), || {
        monitoring
            .get_monitoring()
            .processes
            .iter()
            .any(|p| p.unit_name == "fleet_peer")
    }));

    let snapshot = monitoring.get_monitoring();
    let publisher_entry = snapshot
        .publishers
        .iter()
        .find(|t| t.topic_name == "greet")
        .unwrap();
    assert_eq!(publisher_entry.unit_name, "fleet_peer");
    assert!(!publisher_entry.transports.is_empty());

    // A clean peer shutdown unregisters everything it owned.
    peer_ctx.finalize();
    assert!(
        wait_until(Duration::from_secs(2), || {
            let snapshot = monitoring.get_monitoring();
            snapshot.publishers.is_empty()
                && snapshot.subscribers.is_empty()
                && !snapshot
                    .processes
                    .iter()
                    .any(|p| p.unit_name == "fleet_peer")
        }),
        "peer entities survived finalize"
    );

    mon_ctx.finalize();
    cleanup(&cfg);
}

#[test]
fn snapshot_lists_servers_and_clients() {
    let cfg = fleet_config(2);
    let mon_ctx = Context::new(cfg.clone(), "svc_mon", monitoring_components()).unwrap();
    let peer_ctx = Context::new(cfg.clone(), "svc_peer", Components::default()).unwrap();

    let server = peer_ctx.create_server("math").unwrap();
    server
        .add_method("add", "bytes", "bytes", |_, _, _, req| (0, req.to_vec()))
        .unwrap();
    let _client = peer_ctx.create_client("math").unwrap();

    let monitoring = mon_ctx.monitoring().unwrap();
    assert!(
        wait_until(Duration::from_secs(5), || {
            let snapshot = monitoring.get_monitoring();
            snapshot.servers.iter().any(|s| {
                s.service_name == "math" && s.methods.iter().any(|m| m.method_name == "add")
            }) && snapshot.clients.iter().any(|c| c.service_name == "math")
        }),
        "service entities never showed up"
    );

    let snapshot = monitoring.get_monitoring();
    let server_entry = snapshot
        .servers
        .iter()
        .find(|s| s.service_name == "math")
        .unwrap();
    assert!(server_entry.tcp_port_v0 != 0 || server_entry.tcp_port_v1 != 0);

    peer_ctx.finalize();
    mon_ctx.finalize();
    cleanup(&cfg);
}

#[test]
fn log_stream_reaches_the_aggregator() {
    let mut cfg = fleet_config(3);
    cfg.logging.mode = LogMode::Udp;
    cfg.logging.level = LogLevel::Debug;

    let mon_ctx = Context::new(cfg.clone(), "log_mon", monitoring_components()).unwrap();
    let peer_ctx = Context::new(cfg.clone(), "log_peer", Components::default()).unwrap();

    let provider = peer_ctx.log_provider().unwrap();
    let monitoring = mon_ctx.monitoring().unwrap();

    let mut seen = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    while seen.is_empty() && Instant::now() < deadline {
        provider.log(LogLevel::Warning, "over the log stream");
        std::thread::sleep(Duration::from_millis(50));
        seen = monitoring
            .get_logging()
            .into_iter()
            .filter(|e| e.message == "over the log stream")
            .collect();
    }

    assert!(!seen.is_empty(), "log entry never reached monitoring");
    assert_eq!(seen[0].unit_name, "log_peer");
    assert_eq!(seen[0].level, LogLevel::Warning);
    assert_eq!(seen[0].process_id, std::process::id());

    peer_ctx.finalize();
    mon_ctx.finalize();
    cleanup(&cfg);
}
