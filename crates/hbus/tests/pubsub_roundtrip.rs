// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end pub/sub flows between independent contexts, discovered over
//! the host-local registration ring.

use hbus::registration::ring_name;
use hbus::transport::shm::Segment;
use hbus::{Components, Configuration, Context, DataTypeInfo, Error};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A configuration for same-host fleets: registration over the shared ring,
/// no multicast (CI environments rarely route it).
fn fleet_config(salt: u16) -> Configuration {
    let mut cfg = Configuration::default();
    let base = 41000u16.wrapping_add((std::process::id() as u16).wrapping_mul(13) % 8000);
    cfg.transport.udp.port = base + salt * 3;
    cfg.registration.refresh_interval_ms = 50;
    cfg.registration.timeout_ms = 500;
    cfg.registration.udp_enable = false;
    cfg.registration.shm_enable = true;
    cfg.transport.udp.enable = false;
    cfg
}

fn blob() -> DataTypeInfo {
    DataTypeInfo {
        name: "Blob".into(),
        encoding: "raw".into(),
        descriptor: Vec::new(),
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
fn shm_roundtrip_between_two_contexts() {
    let cfg = fleet_config(1);
    let pub_ctx = Context::new(cfg.clone(), "shm_pub", Components::default()).unwrap();
    let sub_ctx = Context::new(cfg.clone(), "shm_sub", Components::default()).unwrap();

    let publisher = pub_ctx.create_publisher("greet", blob()).unwrap();
    let subscriber = sub_ctx.create_subscriber("greet", blob()).unwrap();

    assert!(
        wait_until(Duration::from_secs(5), || {
            publisher.is_subscribed() && subscriber.is_published()
        }),
        "pair never matched"
    );

    let before = Context::get_microseconds();
    let mut delivered = None;
    let deadline = Instant::now() + Duration::from_secs(5);
    while delivered.is_none() && Instant::now() < deadline {
        let sent = publisher.send(b"hello", 0).unwrap();
        assert!(sent > 0, "matched send must account bytes");
        match subscriber.receive(Duration::from_millis(200)) {
            Ok(sample) => delivered = Some(sample),
            Err(Error::Timeout) => {}
            Err(e) => panic!("receive failed: {}", e),
        }
    }

    let sample = delivered.expect("no sample over shm");
    assert_eq!(sample.payload, b"hello");
    assert!(sample.send_clock_us >= before);
    assert_eq!(sample.source.process_id, std::process::id());

    drop(publisher);
    drop(subscriber);
    pub_ctx.finalize();
    sub_ctx.finalize();
    cleanup(&cfg);
}

#[test]
fn tcp_roundtrip_preserves_large_payloads() {
    let mut cfg = fleet_config(2);
    cfg.transport.shm.enable = false; // force the TCP fallback

    let pub_ctx = Context::new(cfg.clone(), "tcp_pub", Components::default()).unwrap();
    let sub_ctx = Context::new(cfg.clone(), "tcp_sub", Components::default()).unwrap();

    let publisher = pub_ctx.create_publisher("bulk", blob()).unwrap();
    let subscriber = sub_ctx.create_subscriber("bulk", blob()).unwrap();

    assert!(wait_until(Duration::from_secs(5), || publisher.is_subscribed()));

    let payload: Vec<u8> = (0..1_000_000u32).map(|i| (i % 253) as u8).collect();
    let mut delivered = None;
    let deadline = Instant::now() + Duration::from_secs(10);
    while delivered.is_none() && Instant::now() < deadline {
        publisher.send(&payload, 0).unwrap();
        match subscriber.receive(Duration::from_millis(500)) {
            Ok(sample) => delivered = Some(sample),
            Err(Error::Timeout) => {}
            Err(e) => panic!("receive failed: {}", e),
        }
    }

    let sample = delivered.expect("no sample over tcp");
    assert_eq!(sample.payload.len(), payload.len());
    assert_eq!(sample.payload, payload);

    drop(publisher);
    drop(subscriber);
    pub_ctx.finalize();
    sub_ctx.finalize();
    cleanup(&cfg);
}

#[test]
fn host_groups_gate_shared_memory() {
    // SHM is the only transport; mismatched host groups must leave the pair
    // unmatched and deliver nothing.
    let mut cfg_a = fleet_config(3);
    cfg_a.transport.tcp.enable = false;
    cfg_a.registration.host_group_name = "group-a".into();
    let mut cfg_b = cfg_a.clone();
    cfg_b.registration.host_group_name = "group-b".into();

    let pub_ctx = Context::new(cfg_a.clone(), "grp_pub", Components::default()).unwrap();
    let sub_ctx = Context::new(cfg_b, "grp_sub", Components::default()).unwrap();

    let publisher = pub_ctx.create_publisher("gated", blob()).unwrap();
    let subscriber = sub_ctx.create_subscriber("gated", blob()).unwrap();

    // Let several refresh cycles pass; the pair must stay transportless.
    std::thread::sleep(Duration::from_millis(250));
    publisher.send(b"never seen", 0).unwrap();
    assert!(matches!(
        subscriber.receive(Duration::from_millis(500)),
        Err(Error::Timeout)
    ));
    assert!(!publisher.is_subscribed());

    // A subscriber in the matching group starts delivery.
    let sub_ctx2 = Context::new(cfg_a.clone(), "grp_sub2", Components::default()).unwrap();
    let subscriber2 = sub_ctx2.create_subscriber("gated", blob()).unwrap();
    assert!(wait_until(Duration::from_secs(5), || publisher.is_subscribed()));

    let mut delivered = false;
    let deadline = Instant::now() + Duration::from_secs(5);
    while !delivered && Instant::now() < deadline {
        publisher.send(b"now visible", 0).unwrap();
        match subscriber2.receive(Duration::from_millis(200)) {
            Ok(sample) => {
                assert_eq!(sample.payload, b"now visible");
                delivered = true;
            }
            Err(Error::Timeout) => {}
            Err(e) => panic!("receive failed: {}", e),
        }
    }
    assert!(delivered, "matching group never delivered");

    drop(publisher);
    drop(subscriber);
    drop(subscriber2);
    pub_ctx.finalize();
    sub_ctx.finalize();
    sub_ctx2.finalize();
    cleanup(&cfg_a);
}

#[test]
fn callback_stream_is_strictly_ordered_without_duplicates() {
    let mut cfg = fleet_config(4);
    // A generous ack window keeps the single-slot channel near-lossless.
    cfg.transport.shm.ack_timeout_ms = 50;

    let pub_ctx = Context::new(cfg.clone(), "ord_pub", Components::default()).unwrap();
    let sub_ctx = Context::new(cfg.clone(), "ord_sub", Components::default()).unwrap();

    let publisher = pub_ctx.create_publisher("stream", blob()).unwrap();
    let subscriber = sub_ctx.create_subscriber("stream", blob()).unwrap();

    let seen: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    subscriber.set_callback(move |view| {
        sink.lock().push(view.sequence);
    });

    assert!(wait_until(Duration::from_secs(5), || publisher.is_subscribed()));
    // Give the watcher a beat to attach to the segment.
    std::thread::sleep(Duration::from_millis(100));

    let payload = vec![0x5Au8; 1024];
    for _ in 0..200 {
        publisher.send(&payload, 0).unwrap();
    }
    assert_eq!(publisher.data_clock(), 200);

    // Drain-in-flight grace.
    wait_until(Duration::from_secs(2), || seen.lock().len() >= 200);

    let sequences = seen.lock().clone();
    assert!(
        sequences.len() >= 100,
        "only {} of 200 samples delivered",
        sequences.len()
    );
    assert!(
        sequences.windows(2).all(|w| w[0] < w[1]),
        "sequences not strictly increasing"
    );

    drop(publisher);
    drop(subscriber);
    pub_ctx.finalize();
    sub_ctx.finalize();
    cleanup(&cfg);
}

#[test]
fn dropped_publisher_unmatches_promptly() {
    let cfg = fleet_config(5);
    let pub_ctx = Context::new(cfg.clone(), "bye_pub", Components::default()).unwrap();
    let sub_ctx = Context::new(cfg.clone(), "bye_sub", Components::default()).unwrap();

    let publisher = pub_ctx.create_publisher("volatile", blob()).unwrap();
    let subscriber = sub_ctx.create_subscriber("volatile", blob()).unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        subscriber.publisher_count() == 1
    }));

    // The unregister announcement tears the match down without waiting for
    // expiry.
    drop(publisher);
    assert!(wait_until(Duration::from_secs(2), || {
        subscriber.publisher_count() == 0
    }));

    drop(subscriber);
    pub_ctx.finalize();
    sub_ctx.finalize();
    cleanup(&cfg);
}
