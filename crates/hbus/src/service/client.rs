// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Service client: resolves servers through registration, keeps one client
//! instance per resolved server, and fans calls out across them.
//!
//! # Instance state machine
//!
//! ```text
//! Unconnected -> Connecting -> Ready <-> Calling
//!      ^                         |
//!      +------- Failed <---------+   (reconnect backoff as for TCP samples)
//! ```
//!
//! Liveness bookkeeping lives outside the per-instance mutex, so the
//! registration thread never waits behind an in-flight call.

use super::protocol::{CallState, RequestFrame, ResponseFrame, PROTOCOL_V0, PROTOCOL_V1};
use crate::clock::epoch_micros;
use crate::config::Configuration;
use crate::error::{Error, Result};
use crate::registration::entries::{Announcement, Entity, EntityKey, ServerEntry};
use crate::registration::{Registration, RegistrationListener};
use crate::transport::tcp::{encode_frame, read_frame_until, Backoff, MAX_FRAME_SIZE};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Connection state of one client instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    /// No connection attempt yet (or backing off after a failure).
    Unconnected,
    /// TCP connect in flight.
    Connecting,
    /// Connected and idle.
    Ready,
    /// A call is in flight on the connection.
    Calling,
    /// The server went away; awaiting reconnect or removal.
    Failed,
}

/// One completed (or failed) invocation on one server instance.
#[derive(Debug, Clone)]
pub struct ServiceResponse {
    /// Responding server's host.
    pub host_name: String,
    /// Service name.
    pub service_name: String,
    /// Invoked method.
    pub method_name: String,
    /// Handler return state.
    pub ret_state: i32,
    /// Failure explanation, empty on success.
    pub error_msg: String,
    /// Outcome classification.
    pub call_state: CallState,
    /// Response payload.
    pub payload: Vec<u8>,
}

/// Callback invoked per instance as responses arrive.
pub type ResponseCallback = Arc<dyn Fn(&ServiceResponse) + Send + Sync>;

struct ClientInstance {
    host_name: String,
    addr: SocketAddr,
    version: u8,
    state: InstanceState,
    stream: Option<TcpStream>,
    backoff: Backoff,
    retry_at: Option<Instant>,
}

/// Map entry: atomics for the registration thread, a mutex for the caller.
struct InstanceSlot {
    last_seen_us: AtomicU64,
    inner: Mutex<ClientInstance>,
}

pub(crate) struct ClientShared {
    service_name: String,
    instance_id: u64,
    config: Arc<Configuration>,
    registration: Arc<Registration>,
    running: Arc<AtomicBool>,
    instances: Mutex<HashMap<EntityKey, Arc<InstanceSlot>>>,
    host_filter: RwLock<Option<String>>,
    response_callback: RwLock<Option<ResponseCallback>>,
    request_counter: AtomicU64,
}

impl ClientShared {
    fn upsert_instance(&self, entry: &ServerEntry) {
        if entry.service_name != self.service_name {
            return;
        }
        let identity = self.registration.identity();
        let same_host = entry.host_name == identity.host_name;

        // Prefer v1 when both ends speak it.
        let (port, version) = if self.config.service.protocol_v1_enable && entry.tcp_port_v1 != 0 {
            (entry.tcp_port_v1, PROTOCOL_V1)
        } else if self.config.service.protocol_v0_enable && entry.tcp_port_v0 != 0 {
            (entry.tcp_port_v0, PROTOCOL_V0)
        } else {
            log::debug!(
                "[CLT] '{}': no common protocol with server at {}",
                self.service_name,
                entry.host_name
            );
            return;
        };

        let ip: IpAddr = if same_host {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            match entry.host_name.parse() {
                Ok(ip) => ip,
                // Host names that are not literal addresses resolve through
                // the OS at connect time; keep loopback as a best effort.
                Err(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
            }
        };
        let addr = SocketAddr::new(ip, port);
        let now = epoch_micros();

        let mut instances = self.instances.lock();
        match instances.get(&entry.key()) {
            Some(slot) => {
                slot.last_seen_us.store(now, Ordering::Release);
                // A busy instance picks the refreshed address up on the next
                // announcement.
                if let Some(mut guard) = slot.inner.try_lock() {
                    guard.addr = addr;
                    guard.version = version;
                }
            }
            None => {
                log::debug!(
                    "[CLT] '{}': resolved server instance at {} (v{})",
                    self.service_name,
                    addr,
                    version
                );
                instances.insert(
                    entry.key(),
                    Arc::new(InstanceSlot {
                        last_seen_us: AtomicU64::new(now),
                        inner: Mutex::new(ClientInstance {
                            host_name: entry.host_name.clone(),
                            addr,
                            version,
                            state: InstanceState::Unconnected,
                            stream: None,
                            backoff: Backoff::new(),
                            retry_at: None,
                        }),
                    }),
                );
            }
        }
    }

    fn drop_instance(&self, key: &EntityKey) {
        if let Some(slot) = self.instances.lock().remove(key) {
            // An in-flight call holds the inner lock; it fails on its own
            // when the connection dies, so only an idle instance is flipped.
            if let Some(mut guard) = slot.inner.try_lock() {
                guard.state = InstanceState::Failed;
                guard.stream = None;
                log::debug!(
                    "[CLT] '{}': server instance at {} went away",
                    self.service_name,
                    guard.addr
                );
            }
        }
    }

    /// Instances passing the host filter. Filtering uses the entity key, so
    /// no per-instance lock is touched.
    fn snapshot(&self) -> Vec<Arc<InstanceSlot>> {
        let filter = self.host_filter.read().clone();
        self.instances
            .lock()
            .iter()
            .filter(|(key, _)| match &filter {
                Some(host) => &key.host_name == host,
                None => true,
            })
            .map(|(_, slot)| Arc::clone(slot))
            .collect()
    }

    /// Run one invocation against one instance, honouring the deadline.
    fn call_instance(
        &self,
        slot: &InstanceSlot,
        method: &str,
        request: &[u8],
        deadline: Instant,
    ) -> ServiceResponse {
        let mut guard = slot.inner.lock();
        let host_name = guard.host_name.clone();
        let failed = |guard: &mut ClientInstance, msg: String| {
            guard.stream = None;
            guard.state = InstanceState::Failed;
            guard.retry_at = Some(Instant::now() + guard.backoff.next_delay());
            ServiceResponse {
                host_name: guard.host_name.clone(),
                service_name: self.service_name.clone(),
                method_name: method.to_string(),
                ret_state: 0,
                error_msg: msg,
                call_state: CallState::Failed,
                payload: Vec::new(),
            }
        };

        if !self.running.load(Ordering::Acquire) {
            return failed(&mut guard, "cancelled".into());
        }

        if let Some(retry_at) = guard.retry_at {
            if Instant::now() < retry_at {
                return failed(&mut guard, "backing off after failure".into());
            }
            guard.retry_at = None;
            guard.state = InstanceState::Unconnected;
        }

        if guard.stream.is_none() {
            guard.state = InstanceState::Connecting;
            let budget = deadline
                .saturating_duration_since(Instant::now())
                .min(Duration::from_millis(500));
            match TcpStream::connect_timeout(&guard.addr, budget.max(Duration::from_millis(10))) {
                Ok(stream) => {
                    stream.set_nodelay(true).ok();
                    stream
                        .set_read_timeout(Some(Duration::from_millis(50)))
                        .ok();
                    guard.backoff.reset();
                    guard.stream = Some(stream);
                    guard.state = InstanceState::Ready;
                }
                Err(e) => {
                    return failed(&mut guard, format!("connect failed: {}", e));
                }
            }
        }

        guard.state = InstanceState::Calling;
        let request_id = self.request_counter.fetch_add(1, Ordering::AcqRel) + 1;
        let frame = RequestFrame {
            version: guard.version,
            request_id,
            method_name: method.to_string(),
            payload: request.to_vec(),
        };

        // The stream leaves the instance for the I/O phase; any failure path
        // below drops it, which is exactly the abandon-the-connection
        // semantics a desynced or timed-out stream needs.
        let mut stream = guard.stream.take().expect("stream connected above");
        if let Err(e) = stream.write_all(&encode_frame(&frame.encode())) {
            return failed(&mut guard, format!("request write failed: {}", e));
        }

        let reply = loop {
            match read_frame_until(&mut stream, MAX_FRAME_SIZE, &self.running, Some(deadline)) {
                Ok(Some(bytes)) => break bytes,
                Ok(None) => {
                    return failed(&mut guard, "cancelled".into());
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    return failed(&mut guard, "call timed out".into());
                }
                Err(e) => {
                    return failed(&mut guard, format!("response read failed: {}", e));
                }
            }
        };

        let response = match ResponseFrame::decode(&reply) {
            Ok(response) => response,
            Err(e) => {
                return failed(&mut guard, format!("malformed response: {}", e));
            }
        };
        if response.request_id != request_id {
            return failed(&mut guard, "response correlation mismatch".into());
        }

        guard.stream = Some(stream);
        guard.state = InstanceState::Ready;
        ServiceResponse {
            host_name,
            service_name: self.service_name.clone(),
            method_name: method.to_string(),
            ret_state: response.ret_state,
            error_msg: response.error_msg,
            call_state: CallState::Executed,
            payload: response.payload,
        }
    }
}

impl RegistrationListener for ClientShared {
    fn on_announcement(&self, announcement: &Announcement) {
        match announcement {
            Announcement::Register(Entity::Server(entry)) => self.upsert_instance(entry),
            Announcement::Unregister(Entity::Server(entry)) => {
                if entry.service_name == self.service_name {
                    self.drop_instance(&entry.key());
                }
            }
            Announcement::Unregister(Entity::Process(process)) => {
                let stale: Vec<EntityKey> = self
                    .instances
                    .lock()
                    .keys()
                    .filter(|key| {
                        key.host_name == process.host_name
                            && key.process_id == process.process_id
                    })
                    .cloned()
                    .collect();
                for key in stale {
                    self.drop_instance(&key);
                }
            }
            _ => {}
        }
    }

    fn on_tick(&self, now_us: u64) {
        let timeout = self.registration.timeout_us();
        let stale: Vec<EntityKey> = self
            .instances
            .lock()
            .iter()
            .filter(|(_, slot)| {
                now_us.saturating_sub(slot.last_seen_us.load(Ordering::Acquire)) > timeout
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            log::debug!("[CLT] '{}': server instance expired", self.service_name);
            self.drop_instance(&key);
        }
    }
}

/// A service client handle.
pub struct Client {
    shared: Arc<ClientShared>,
    _listener: Arc<dyn RegistrationListener>,
}

impl Client {
    pub(crate) fn create(
        config: &Arc<Configuration>,
        registration: &Arc<Registration>,
        running: &Arc<AtomicBool>,
        instance_id: u64,
        service_name: &str,
    ) -> Result<Self> {
        if service_name.is_empty() {
            return Err(Error::InvalidArgument(
                "service name must not be empty".into(),
            ));
        }

        let shared = Arc::new(ClientShared {
            service_name: service_name.to_string(),
            instance_id,
            config: Arc::clone(config),
            registration: Arc::clone(registration),
            running: Arc::clone(running),
            instances: Mutex::new(HashMap::new()),
            host_filter: RwLock::new(None),
            response_callback: RwLock::new(None),
            request_counter: AtomicU64::new(0),
        });

        let listener: Arc<dyn RegistrationListener> = shared.clone();
        registration.add_listener(&listener);

        let identity = registration.identity();
        registration.register(Entity::Client(
            crate::registration::entries::ClientEntry {
                host_name: identity.host_name.clone(),
                process_id: identity.process_id,
                process_name: identity.process_name.clone(),
                unit_name: identity.unit_name.clone(),
                service_name: service_name.to_string(),
                service_instance_id: instance_id,
                protocol_version: if config.service.protocol_v1_enable {
                    PROTOCOL_V1
                } else {
                    PROTOCOL_V0
                },
                registration_clock: 1,
            },
        ));

        log::info!("[CLT] created client for service '{}'", service_name);
        Ok(Self {
            shared,
            _listener: listener,
        })
    }

    /// Call a method on every resolved instance, blocking until each
    /// completes or the timeout elapses.
    ///
    /// Returns one response per instance (order unspecified); an empty list
    /// means no instance is currently resolved.
    pub fn call(
        &self,
        method: &str,
        request: &[u8],
        timeout: Duration,
    ) -> Result<Vec<ServiceResponse>> {
        if !self.shared.running.load(Ordering::Acquire) {
            return Err(Error::Cancelled);
        }
        let deadline = Instant::now() + timeout;
        let slots = self.shared.snapshot();
        let mut responses = Vec::with_capacity(slots.len());

        std::thread::scope(|scope| {
            let handles: Vec<_> = slots
                .iter()
                .map(|slot| {
                    let shared = &self.shared;
                    scope.spawn(move || shared.call_instance(slot, method, request, deadline))
                })
                .collect();
            for handle in handles {
                if let Ok(response) = handle.join() {
                    responses.push(response);
                }
            }
        });

        Ok(responses)
    }

    /// Dispatch a call asynchronously; `callback` runs per instance as the
    /// responses arrive. Returns whether all invocations were initiated.
    pub fn call_with_callback(
        &self,
        method: &str,
        request: &[u8],
        callback: ResponseCallback,
        timeout: Duration,
    ) -> bool {
        if !self.shared.running.load(Ordering::Acquire) {
            return false;
        }
        let deadline = Instant::now() + timeout;
        let slots = self.shared.snapshot();
        if slots.is_empty() {
            return false;
        }

        let mut all_spawned = true;
        for slot in slots {
            let shared = Arc::clone(&self.shared);
            let callback = Arc::clone(&callback);
            let method = method.to_string();
            let request = request.to_vec();
            let spawned = std::thread::Builder::new()
                .name("hbus-clt-call".into())
                .spawn(move || {
                    let response = shared.call_instance(&slot, &method, &request, deadline);
                    callback(&response);
                });
            if spawned.is_err() {
                all_spawned = false;
            }
        }
        all_spawned
    }

    /// Like [`Client::call_with_callback`], using the stored response
    /// callback.
    pub fn call_async(&self, method: &str, request: &[u8], timeout: Duration) -> bool {
        let Some(callback) = self.shared.response_callback.read().clone() else {
            return false;
        };
        self.call_with_callback(method, request, callback, timeout)
    }

    /// Store the response callback used by [`Client::call_async`].
    pub fn add_response_callback(
        &self,
        callback: impl Fn(&ServiceResponse) + Send + Sync + 'static,
    ) {
        *self.shared.response_callback.write() = Some(Arc::new(callback));
    }

    /// Remove the stored response callback.
    pub fn remove_response_callback(&self) {
        *self.shared.response_callback.write() = None;
    }

    /// Restrict calls to servers on one host; an empty name clears the
    /// filter.
    pub fn set_host_filter(&self, host_name: &str) {
        *self.shared.host_filter.write() = if host_name.is_empty() {
            None
        } else {
            Some(host_name.to_string())
        };
    }

    /// The service name.
    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.shared.service_name
    }

    /// Resolved instance count (after the host filter).
    #[must_use]
    pub fn instance_count(&self) -> usize {
        self.shared.snapshot().len()
    }

    /// Connection states of the resolved instances.
    #[must_use]
    pub fn instance_states(&self) -> Vec<(String, InstanceState)> {
        self.shared
            .snapshot()
            .iter()
            .map(|slot| {
                let guard = slot.inner.lock();
                (guard.host_name.clone(), guard.state)
            })
            .collect()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shared.registration.unregister(self.shared.instance_id);
        log::debug!(
            "[CLT] destroyed client for service '{}'",
            self.shared.service_name
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_state_transitions_are_nameable() {
        // The public states used in monitoring and tests.
        let states = [
            InstanceState::Unconnected,
            InstanceState::Connecting,
            InstanceState::Ready,
            InstanceState::Calling,
            InstanceState::Failed,
        ];
        assert_eq!(states.len(), 5);
    }
}
