// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Service server: accepts method invocations over TCP and dispatches them
//! to registered handlers.
//!
//! Each enabled protocol version gets its own listener on an OS-assigned
//! port, both advertised through registration. Requests on one connection
//! are serialized by its reader thread; connections are served in parallel.

use super::protocol::{
    RequestFrame, ResponseFrame, PROTOCOL_V0, PROTOCOL_V1, RET_INTERNAL_ERROR,
    RET_METHOD_NOT_FOUND,
};
use crate::config::Configuration;
use crate::error::{Error, Result};
use crate::registration::entries::{Entity, MethodInfo, ServerEntry};
use crate::registration::Registration;
use crate::transport::tcp::{encode_frame, read_frame, MAX_FRAME_SIZE};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::io::Write;
use std::net::{Ipv4Addr, TcpListener, TcpStream};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Method implementation: `(method, request_type, response_type, request)
/// -> (ret_state, response)`.
pub type MethodHandler = Arc<dyn Fn(&str, &str, &str, &[u8]) -> (i32, Vec<u8>) + Send + Sync>;

struct MethodEntry {
    request_type: String,
    response_type: String,
    handler: MethodHandler,
    call_count: AtomicU64,
}

pub(crate) struct ServerShared {
    service_name: String,
    instance_id: u64,
    methods: DashMap<String, Arc<MethodEntry>>,
    registration: Arc<Registration>,
    server_running: Arc<AtomicBool>,
    port_v0: u16,
    port_v1: u16,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl ServerShared {
    fn handle_request(&self, request: &RequestFrame) -> ResponseFrame {
        let Some(entry) = self.methods.get(&request.method_name).map(|e| Arc::clone(&e)) else {
            log::debug!(
                "[SRV] '{}': unknown method '{}'",
                self.service_name,
                request.method_name
            );
            return ResponseFrame {
                version: request.version,
                request_id: request.request_id,
                ret_state: RET_METHOD_NOT_FOUND,
                error_msg: format!("method '{}' not found", request.method_name),
                payload: Vec::new(),
            };
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            (entry.handler)(
                &request.method_name,
                &entry.request_type,
                &entry.response_type,
                &request.payload,
            )
        }));

        match outcome {
            Ok((ret_state, payload)) => {
                entry.call_count.fetch_add(1, Ordering::AcqRel);
                self.push_methods_to_registration();
                ResponseFrame {
                    version: request.version,
                    request_id: request.request_id,
                    ret_state,
                    error_msg: String::new(),
                    payload,
                }
            }
            Err(_) => {
                log::warn!(
                    "[SRV] '{}': handler for '{}' panicked",
                    self.service_name,
                    request.method_name
                );
                ResponseFrame {
                    version: request.version,
                    request_id: request.request_id,
                    ret_state: RET_INTERNAL_ERROR,
                    error_msg: "handler panicked".into(),
                    payload: Vec::new(),
                }
            }
        }
    }

    fn method_infos(&self) -> Vec<MethodInfo> {
        let mut methods: Vec<MethodInfo> = self
            .methods
            .iter()
            .map(|entry| MethodInfo {
                method_name: entry.key().clone(),
                request_type: entry.value().request_type.clone(),
                response_type: entry.value().response_type.clone(),
                call_count: entry.value().call_count.load(Ordering::Acquire),
            })
            .collect();
        methods.sort_by(|a, b| a.method_name.cmp(&b.method_name));
        methods
    }

    fn push_methods_to_registration(&self) {
        let methods = self.method_infos();
        self.registration.refresh(self.instance_id, |e| {
            if let Entity::Server(s) = e {
                s.methods = methods.clone();
            }
        });
    }
}

fn serve_listener(shared: &Arc<ServerShared>, listener: &TcpListener, version: u8) {
    while shared.server_running.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, peer)) => {
                log::debug!(
                    "[SRV] '{}' v{}: connection from {}",
                    shared.service_name,
                    version,
                    peer
                );
                if stream
                    .set_read_timeout(Some(Duration::from_millis(100)))
                    .is_err()
                {
                    continue;
                }
                stream.set_nodelay(true).ok();
                let conn_shared = Arc::clone(shared);
                let spawned = std::thread::Builder::new()
                    .name("hbus-srv-conn".into())
                    .spawn(move || serve_connection(&conn_shared, stream));
                if spawned.is_err() {
                    log::warn!("[SRV] '{}': spawn failed", shared.service_name);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                log::warn!("[SRV] '{}': accept failed: {}", shared.service_name, e);
                std::thread::sleep(Duration::from_millis(50));
            }
        }
    }
}

fn serve_connection(shared: &Arc<ServerShared>, mut stream: TcpStream) {
    loop {
        let frame = match read_frame(&mut stream, MAX_FRAME_SIZE, &shared.server_running) {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(e) => {
                log::debug!("[SRV] '{}': connection ended: {}", shared.service_name, e);
                return;
            }
        };
        let request = match RequestFrame::decode(&frame) {
            Ok(request) => request,
            Err(e) => {
                log::debug!("[SRV] '{}': malformed request: {}", shared.service_name, e);
                return;
            }
        };

        let response = shared.handle_request(&request);
        if let Err(e) = stream.write_all(&encode_frame(&response.encode())) {
            log::debug!("[SRV] '{}': reply write failed: {}", shared.service_name, e);
            return;
        }
    }
}

/// A service server handle.
///
/// Dropping the handle removes the method table, closes the listeners, and
/// unregisters the service.
pub struct Server {
    shared: Arc<ServerShared>,
}

impl Server {
    pub(crate) fn create(
        config: &Arc<Configuration>,
        registration: &Arc<Registration>,
        instance_id: u64,
        service_name: &str,
    ) -> Result<Self> {
        if service_name.is_empty() {
            return Err(Error::InvalidArgument(
                "service name must not be empty".into(),
            ));
        }
        if !config.service.protocol_v0_enable && !config.service.protocol_v1_enable {
            return Err(Error::InvalidArgument(
                "at least one service protocol version must be enabled".into(),
            ));
        }

        let mut listeners = Vec::new();
        let mut port_v0 = 0;
        let mut port_v1 = 0;
        if config.service.protocol_v0_enable {
            let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0))?;
            port_v0 = listener.local_addr()?.port();
            listener.set_nonblocking(true)?;
            listeners.push((listener, PROTOCOL_V0));
        }
        if config.service.protocol_v1_enable {
            let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0))?;
            port_v1 = listener.local_addr()?.port();
            listener.set_nonblocking(true)?;
            listeners.push((listener, PROTOCOL_V1));
        }

        let shared = Arc::new(ServerShared {
            service_name: service_name.to_string(),
            instance_id,
            methods: DashMap::new(),
            registration: Arc::clone(registration),
            server_running: Arc::new(AtomicBool::new(true)),
            port_v0,
            port_v1,
            threads: Mutex::new(Vec::new()),
        });

        let mut threads = Vec::new();
        for (listener, version) in listeners {
            let shared_for_thread = Arc::clone(&shared);
            threads.push(
                std::thread::Builder::new()
                    .name(format!("hbus-srv-accept-v{}", version))
                    .spawn(move || serve_listener(&shared_for_thread, &listener, version))
                    .map_err(|e| Error::Internal(format!("spawn service accept: {}", e)))?,
            );
        }
        *shared.threads.lock() = threads;

        let identity = registration.identity();
        let entry = ServerEntry {
            host_name: identity.host_name.clone(),
            process_id: identity.process_id,
            process_name: identity.process_name.clone(),
            unit_name: identity.unit_name.clone(),
            service_name: service_name.to_string(),
            service_instance_id: instance_id,
            tcp_port_v0: port_v0,
            tcp_port_v1: port_v1,
            protocol_version: if config.service.protocol_v1_enable {
                PROTOCOL_V1
            } else {
                PROTOCOL_V0
            },
            methods: Vec::new(),
            registration_clock: 1,
        };
        registration.register(Entity::Server(entry));

        log::info!(
            "[SRV] service '{}' listening (v0 port {}, v1 port {})",
            service_name,
            port_v0,
            port_v1
        );
        Ok(Self { shared })
    }

    /// Register (or replace) a method handler.
    pub fn add_method(
        &self,
        method_name: &str,
        request_type: &str,
        response_type: &str,
        handler: impl Fn(&str, &str, &str, &[u8]) -> (i32, Vec<u8>) + Send + Sync + 'static,
    ) -> Result<()> {
        if method_name.is_empty() {
            return Err(Error::InvalidArgument(
                "method name must not be empty".into(),
            ));
        }
        self.shared.methods.insert(
            method_name.to_string(),
            Arc::new(MethodEntry {
                request_type: request_type.to_string(),
                response_type: response_type.to_string(),
                handler: Arc::new(handler),
                call_count: AtomicU64::new(0),
            }),
        );
        self.shared.push_methods_to_registration();
        Ok(())
    }

    /// Remove a method handler.
    ///
    /// # Errors
    ///
    /// `Error::NotFound` when no such method is registered.
    pub fn remove_method(&self, method_name: &str) -> Result<()> {
        if self.shared.methods.remove(method_name).is_none() {
            return Err(Error::NotFound);
        }
        self.shared.push_methods_to_registration();
        Ok(())
    }

    /// The service name.
    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.shared.service_name
    }

    /// Listening port of the v0 protocol (0 when disabled).
    #[must_use]
    pub fn port_v0(&self) -> u16 {
        self.shared.port_v0
    }

    /// Listening port of the v1 protocol (0 when disabled).
    #[must_use]
    pub fn port_v1(&self) -> u16 {
        self.shared.port_v1
    }

    /// This server's stable instance id.
    #[must_use]
    pub fn instance_id(&self) -> u64 {
        self.shared.instance_id
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shared.server_running.store(false, Ordering::Release);
        self.shared.registration.unregister(self.shared.instance_id);
        for handle in self.shared.threads.lock().drain(..) {
            handle.join().ok();
        }
        log::debug!("[SRV] service '{}' stopped", self.shared.service_name);
    }
}
