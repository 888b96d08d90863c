// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Publish/subscribe data plane.
//!
//! Publishers fan a sample out once per chosen transport; subscribers merge
//! the transports back together, dedupe on `(topic_id, sequence)`, and hand
//! samples to a pull queue or a single callback.

pub mod matching;
mod publisher;
mod subscriber;

pub use matching::{select_transport, MatchTable};
pub use publisher::Publisher;
pub use subscriber::Subscriber;

use crate::config::Configuration;
use crate::error::Result;
use crate::registration::entries::TopicId;
use crate::registration::Registration;
use crate::transport::udp::{UdpSampleReceiver, UdpSampleSender};
use crate::wire::SampleEnvelope;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Weak};

/// An owned sample as returned by [`Subscriber::receive`].
#[derive(Debug, Clone)]
pub struct Sample {
    /// User payload.
    pub payload: Vec<u8>,
    /// Publisher clock at send time, epoch microseconds.
    pub send_clock_us: u64,
    /// Publisher sequence number.
    pub sequence: u64,
    /// The publisher that sent the sample.
    pub source: TopicId,
}

/// A borrowed sample as handed to subscriber callbacks.
///
/// With shared-memory zero-copy the payload points straight into the mapped
/// segment; its validity ends when the callback returns.
#[derive(Debug, Clone, Copy)]
pub struct SampleView<'a> {
    /// Topic the sample arrived on.
    pub topic_name: &'a str,
    /// User payload.
    pub payload: &'a [u8],
    /// Publisher clock at send time, epoch microseconds.
    pub send_clock_us: u64,
    /// Publisher sequence number.
    pub sequence: u64,
}

/// Shared pub/sub runtime: one per context.
pub(crate) struct PubSubShared {
    pub config: Arc<Configuration>,
    pub registration: Arc<Registration>,
    pub running: Arc<AtomicBool>,
    pub match_table: Arc<MatchTable>,
    pub local_ip: IpAddr,
    udp_sender: Mutex<Option<Arc<UdpSampleSender>>>,
    udp_receiver: Mutex<Option<Arc<UdpSampleReceiver>>>,
    udp_routes: Arc<DashMap<String, Vec<(u64, Weak<subscriber::SubscriberShared>)>>>,
}

impl PubSubShared {
    pub fn new(
        config: Arc<Configuration>,
        registration: Arc<Registration>,
        running: Arc<AtomicBool>,
        match_table: Arc<MatchTable>,
    ) -> Arc<Self> {
        let local_ip =
            local_ip_address::local_ip().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
        Arc::new(Self {
            config,
            registration,
            running,
            match_table,
            local_ip,
            udp_sender: Mutex::new(None),
            udp_receiver: Mutex::new(None),
            udp_routes: Arc::new(DashMap::new()),
        })
    }

    /// Allocate the next process-wide handle serial.
    pub fn next_serial(&self) -> u64 {
        crate::process::next_entity_serial()
    }

    /// The shared UDP sender, created on first use.
    pub fn udp_sender(&self) -> Result<Arc<UdpSampleSender>> {
        let mut guard = self.udp_sender.lock();
        if let Some(sender) = guard.as_ref() {
            return Ok(Arc::clone(sender));
        }
        let sender = Arc::new(UdpSampleSender::new(
            &self.config.transport.udp,
            self.config.sample_port(),
            Ipv4Addr::UNSPECIFIED,
        )?);
        *guard = Some(Arc::clone(&sender));
        Ok(sender)
    }

    /// The shared UDP receiver, created on first use. Samples route to
    /// subscribers by topic name.
    pub fn udp_receiver(&self) -> Result<Arc<UdpSampleReceiver>> {
        let mut guard = self.udp_receiver.lock();
        if let Some(receiver) = guard.as_ref() {
            return Ok(Arc::clone(receiver));
        }
        let routes = Arc::clone(&self.udp_routes);
        let receiver = Arc::new(UdpSampleReceiver::new(
            &self.config.transport.udp,
            self.config.sample_port(),
            Ipv4Addr::UNSPECIFIED,
            self.config.transport.tcp.reader_threads,
            Arc::clone(&self.running),
            Arc::new(move |envelope: SampleEnvelope| {
                let Some(subscribers) = routes.get(&envelope.topic_name) else {
                    return;
                };
                for (_, weak) in subscribers.iter() {
                    if let Some(subscriber) = weak.upgrade() {
                        subscriber.deliver_envelope(&envelope);
                    }
                }
            }),
        )?);
        *guard = Some(Arc::clone(&receiver));
        Ok(receiver)
    }

    /// Route UDP samples for `topic_name` to a subscriber.
    pub fn add_udp_route(
        &self,
        topic_name: &str,
        serial: u64,
        subscriber: &Arc<subscriber::SubscriberShared>,
    ) {
        self.udp_routes
            .entry(topic_name.to_string())
            .or_default()
            .push((serial, Arc::downgrade(subscriber)));
    }

    /// Drop a subscriber's UDP route.
    pub fn remove_udp_route(&self, topic_name: &str, serial: u64) {
        if let Some(mut routes) = self.udp_routes.get_mut(topic_name) {
            routes.retain(|(s, w)| *s != serial && w.strong_count() > 0);
        }
    }

    /// The UDP receiver, only if one was ever started.
    pub fn udp_receiver_if_started(&self) -> Option<Arc<UdpSampleReceiver>> {
        self.udp_receiver.lock().clone()
    }
}
