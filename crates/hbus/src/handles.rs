// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Flat handle API - the callable surface consumed by language bindings.
//!
//! Operations return integer status codes (`0` ok, negative per
//! [`crate::error::Error::status_code`]) and opaque `u64` handles backed by
//! a slot+generation arena; a stale or foreign handle maps to `not_found`.
//! One process-global context cell backs `initialize`/`finalize` with a
//! reference count: nested initializes succeed without side effect and the
//! final balanced finalize tears everything down.
//!
//! Blocking operations (`sub_receive`, `client_call_method`) clone the
//! entity handle out of the arena and run without the global lock held.

use crate::config::{Configuration, LogLevel, Severity};
use crate::error::Error;
use crate::monitoring::MonitoringSnapshot;
use crate::process::{Components, Context};
use crate::pubsub::{Publisher, SampleView, Subscriber};
use crate::registration::entries::{DataTypeInfo, Entity, LogEntry};
use crate::service::{Client, Server, ServiceResponse};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Status code for success.
pub const OK: i32 = 0;

/// Generational arena handing out opaque `u64` handles.
///
/// A handle is `generation << 32 | slot_index`; removal bumps the slot's
/// generation, so stale handles never resolve.
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

impl<T> Arena<T> {
    /// An empty arena.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    /// Store a value, returning its handle.
    pub fn insert(&mut self, value: T) -> u64 {
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index].value = Some(value);
                index
            }
            None => {
                self.slots.push(Slot {
                    generation: 1,
                    value: Some(value),
                });
                self.slots.len() - 1
            }
        };
        (u64::from(self.slots[index].generation) << 32) | index as u64
    }

    fn resolve(&self, handle: u64) -> Option<usize> {
        let index = (handle & 0xFFFF_FFFF) as usize;
        let generation = (handle >> 32) as u32;
        let slot = self.slots.get(index)?;
        (slot.generation == generation && slot.value.is_some()).then_some(index)
    }

    /// Look a handle up.
    #[must_use]
    pub fn get(&self, handle: u64) -> Option<&T> {
        let index = self.resolve(handle)?;
        self.slots[index].value.as_ref()
    }

    /// Remove a handle, invalidating it forever.
    pub fn remove(&mut self, handle: u64) -> Option<T> {
        let index = self.resolve(handle)?;
        let slot = &mut self.slots[index];
        let value = slot.value.take();
        slot.generation = slot.generation.wrapping_add(1).max(1);
        self.free.push(index);
        value
    }

    /// Drain every value (teardown).
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            slot.value = None;
            slot.generation = slot.generation.wrapping_add(1).max(1);
        }
        self.free = (0..self.slots.len()).collect();
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

struct Global {
    init_count: u32,
    mon_count: u32,
    pending_unit_name: Option<String>,
    context: Option<Arc<Context>>,
    publishers: Arena<Arc<Publisher>>,
    subscribers: Arena<Arc<Subscriber>>,
    servers: Arena<Arc<Server>>,
    clients: Arena<Arc<Client>>,
}

impl Global {
    const fn new() -> Self {
        Self {
            init_count: 0,
            mon_count: 0,
            pending_unit_name: None,
            context: None,
            publishers: Arena::new(),
            subscribers: Arena::new(),
            servers: Arena::new(),
            clients: Arena::new(),
        }
    }
}

static GLOBAL: Mutex<Global> = Mutex::new(Global::new());

fn code(e: &Error) -> i32 {
    e.status_code()
}

fn with_context<R>(f: impl FnOnce(&Arc<Context>) -> R) -> Result<R, i32> {
    let global = GLOBAL.lock();
    match &global.context {
        Some(context) => Ok(f(context)),
        None => Err(Error::NotInitialized.status_code()),
    }
}

/// Initialize the process-global context with the default configuration.
///
/// Returns `0` on first initialization, `1` when already initialized (the
/// reference count is bumped), negative on failure.
pub fn initialize(args: &[String], unit_name: &str) -> i32 {
    initialize_with_config(Configuration::default(), args, unit_name)
}

/// [`initialize`] with an explicit configuration record.
pub fn initialize_with_config(config: Configuration, args: &[String], unit_name: &str) -> i32 {
    let mut global = GLOBAL.lock();
    if global.context.is_some() {
        global.init_count += 1;
        return 1;
    }

    let effective_unit = if unit_name.is_empty() {
        global.pending_unit_name.clone().unwrap_or_default()
    } else {
        unit_name.to_string()
    };

    let context = match Context::new(config, &effective_unit, Components::default()) {
        Ok(context) => Arc::new(context),
        Err(e) => return code(&e),
    };

    if !args.is_empty() {
        let process_param = args.join(" ");
        context.registration().refresh(0, |e| {
            if let Entity::Process(p) = e {
                p.process_param = process_param.clone();
            }
        });
    }

    global.context = Some(context);
    global.init_count = 1;
    OK
}

/// Drop one initialization reference; tear down at zero.
///
/// Returns `0` when the context was torn down, `1` while references remain,
/// negative when not initialized.
pub fn finalize() -> i32 {
    let mut global = GLOBAL.lock();
    if global.context.is_none() {
        return Error::NotInitialized.status_code();
    }
    global.init_count = global.init_count.saturating_sub(1);
    if global.init_count > 0 {
        return 1;
    }

    // Entities first: their Drop impls unregister through the still-running
    // registration layer.
    global.publishers.clear();
    global.subscribers.clear();
    global.servers.clear();
    global.clients.clear();
    if let Some(context) = global.context.take() {
        context.finalize();
    }
    global.mon_count = 0;
    OK
}

/// Whether the global context is up.
#[must_use]
pub fn is_initialized() -> i32 {
    i32::from(GLOBAL.lock().context.is_some())
}

/// Set the unit name: before init it applies to the next `initialize`,
/// after init it updates the announced process entry.
pub fn set_unit_name(unit_name: &str) -> i32 {
    let mut global = GLOBAL.lock();
    match &global.context {
        Some(context) => {
            let name = unit_name.to_string();
            context.registration().refresh(0, |e| {
                if let Entity::Process(p) = e {
                    p.unit_name = name.clone();
                }
            });
            OK
        }
        None => {
            global.pending_unit_name = Some(unit_name.to_string());
            OK
        }
    }
}

/// The runtime version string.
#[must_use]
pub fn get_version() -> &'static str {
    crate::VERSION
}

/// The runtime version as `(major, minor, patch)`.
#[must_use]
pub fn get_version_components() -> (i32, i32, i32) {
    let mut parts = crate::VERSION.split('.').filter_map(|p| p.parse().ok());
    (
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
    )
}

/// The runtime build date string.
#[must_use]
pub fn get_date() -> &'static str {
    crate::BUILD_DATE
}

/// Epoch microseconds.
#[must_use]
pub fn get_microseconds() -> u64 {
    Context::get_microseconds()
}

/// Report this process's state.
pub fn set_process_state(severity: i32, level: i32, info: &str) -> i32 {
    match with_context(|ctx| ctx.set_process_state(Severity::from_u8(severity as u8), level, info))
    {
        Ok(()) => OK,
        Err(code) => code,
    }
}

/// Whether the process should keep running.
#[must_use]
pub fn ok() -> i32 {
    match with_context(|ctx| i32::from(ctx.ok())) {
        Ok(value) => value,
        Err(_) => 0,
    }
}

/// Ask the process with `unit_name` to shut down.
pub fn shutdown_process_uname(unit_name: &str) -> i32 {
    match with_context(|ctx| ctx.shutdown_process_by_name(unit_name)) {
        Ok(()) => OK,
        Err(code) => code,
    }
}

/// Ask the process with `process_id` to shut down.
pub fn shutdown_process_id(process_id: u32) -> i32 {
    match with_context(|ctx| ctx.shutdown_process_by_id(process_id)) {
        Ok(()) => OK,
        Err(code) => code,
    }
}

/// Ask every user process in the fleet to shut down.
pub fn shutdown_processes() -> i32 {
    match with_context(|ctx| ctx.shutdown_all()) {
        Ok(()) => OK,
        Err(code) => code,
    }
}

/// Ask every hbus process in the fleet to shut down.
pub fn shutdown_core() -> i32 {
    shutdown_processes()
}

/// Set the logging level.
pub fn log_set_level(level: i32) -> i32 {
    match with_context(|ctx| {
        if let Some(provider) = ctx.log_provider() {
            provider.set_level(LogLevel::from_u8(level as u8));
            OK
        } else {
            Error::NotInitialized.status_code()
        }
    }) {
        Ok(value) => value,
        Err(code) => code,
    }
}

/// Emit a user log message at info level.
pub fn log_message(text: &str) -> i32 {
    match with_context(|ctx| {
        if let Some(provider) = ctx.log_provider() {
            provider.log(LogLevel::Info, text);
            OK
        } else {
            Error::NotInitialized.status_code()
        }
    }) {
        Ok(value) => value,
        Err(code) => code,
    }
}

/// Create a publisher. Returns the handle or `0` on failure.
pub fn pub_create(topic_name: &str, type_name: &str, encoding: &str, descriptor: &[u8]) -> u64 {
    let mut global = GLOBAL.lock();
    let Some(context) = global.context.clone() else {
        return 0;
    };
    let data_type = DataTypeInfo {
        name: type_name.to_string(),
        encoding: encoding.to_string(),
        descriptor: descriptor.to_vec(),
    };
    match context.create_publisher(topic_name, data_type) {
        Ok(publisher) => global.publishers.insert(Arc::new(publisher)),
        Err(e) => {
            log::debug!("[API] pub_create('{}') failed: {}", topic_name, e);
            0
        }
    }
}

/// Destroy a publisher handle.
pub fn pub_destroy(handle: u64) -> i32 {
    match GLOBAL.lock().publishers.remove(handle) {
        Some(_) => OK,
        None => Error::NotFound.status_code(),
    }
}

/// Send a sample; returns bytes sent or a negative status.
pub fn pub_send(handle: u64, payload: &[u8], timestamp_us: i64) -> i32 {
    let publisher = {
        let global = GLOBAL.lock();
        match global.publishers.get(handle) {
            Some(publisher) => Arc::clone(publisher),
            None => return Error::NotFound.status_code(),
        }
    };
    match publisher.send(payload, timestamp_us.max(0) as u64) {
        Ok(bytes) => bytes as i32,
        Err(e) => code(&e),
    }
}

/// Create a subscriber. Returns the handle or `0` on failure.
pub fn sub_create(topic_name: &str, type_name: &str, encoding: &str, descriptor: &[u8]) -> u64 {
    let mut global = GLOBAL.lock();
    let Some(context) = global.context.clone() else {
        return 0;
    };
    let data_type = DataTypeInfo {
        name: type_name.to_string(),
        encoding: encoding.to_string(),
        descriptor: descriptor.to_vec(),
    };
    match context.create_subscriber(topic_name, data_type) {
        Ok(subscriber) => global.subscribers.insert(Arc::new(subscriber)),
        Err(e) => {
            log::debug!("[API] sub_create('{}') failed: {}", topic_name, e);
            0
        }
    }
}

/// Destroy a subscriber handle.
pub fn sub_destroy(handle: u64) -> i32 {
    match GLOBAL.lock().subscribers.remove(handle) {
        Some(_) => OK,
        None => Error::NotFound.status_code(),
    }
}

/// Pull the next sample: `(status, payload, send_time_us)`.
///
/// A negative `timeout_ms` blocks for a very long time.
pub fn sub_receive(handle: u64, timeout_ms: i32) -> (i32, Vec<u8>, i64) {
    let subscriber = {
        let global = GLOBAL.lock();
        match global.subscribers.get(handle) {
            Some(subscriber) => Arc::clone(subscriber),
            None => return (Error::NotFound.status_code(), Vec::new(), 0),
        }
    };
    let timeout = if timeout_ms < 0 {
        Duration::from_secs(3600)
    } else {
        Duration::from_millis(timeout_ms as u64)
    };
    match subscriber.receive(timeout) {
        Ok(sample) => (OK, sample.payload, sample.send_clock_us as i64),
        Err(e) => (code(&e), Vec::new(), 0),
    }
}

/// Install the subscriber callback: `(topic, payload, send_time_us,
/// sequence)`.
pub fn sub_set_callback(
    handle: u64,
    callback: impl Fn(&str, &[u8], i64, u64) + Send + Sync + 'static,
) -> i32 {
    let subscriber = {
        let global = GLOBAL.lock();
        match global.subscribers.get(handle) {
            Some(subscriber) => Arc::clone(subscriber),
            None => return Error::NotFound.status_code(),
        }
    };
    subscriber.set_callback(move |view: &SampleView<'_>| {
        callback(
            view.topic_name,
            view.payload,
            view.send_clock_us as i64,
            view.sequence,
        );
    });
    OK
}

/// Remove the subscriber callback.
pub fn sub_rem_callback(handle: u64) -> i32 {
    let global = GLOBAL.lock();
    match global.subscribers.get(handle) {
        Some(subscriber) => {
            subscriber.remove_callback();
            OK
        }
        None => Error::NotFound.status_code(),
    }
}

/// Create a service server. Returns the handle or `0` on failure.
pub fn server_create(service_name: &str) -> u64 {
    let mut global = GLOBAL.lock();
    let Some(context) = global.context.clone() else {
        return 0;
    };
    match context.create_server(service_name) {
        Ok(server) => global.servers.insert(Arc::new(server)),
        Err(e) => {
            log::debug!("[API] server_create('{}') failed: {}", service_name, e);
            0
        }
    }
}

/// Destroy a server handle.
pub fn server_destroy(handle: u64) -> i32 {
    match GLOBAL.lock().servers.remove(handle) {
        Some(_) => OK,
        None => Error::NotFound.status_code(),
    }
}

/// Register a method handler on a server.
pub fn server_add_method_callback(
    handle: u64,
    method_name: &str,
    request_type: &str,
    response_type: &str,
    callback: impl Fn(&str, &str, &str, &[u8]) -> (i32, Vec<u8>) + Send + Sync + 'static,
) -> i32 {
    let global = GLOBAL.lock();
    match global.servers.get(handle) {
        Some(server) => match server.add_method(method_name, request_type, response_type, callback)
        {
            Ok(()) => OK,
            Err(e) => code(&e),
        },
        None => Error::NotFound.status_code(),
    }
}

/// Remove a method handler from a server.
pub fn server_rem_method_callback(handle: u64, method_name: &str) -> i32 {
    let global = GLOBAL.lock();
    match global.servers.get(handle) {
        Some(server) => match server.remove_method(method_name) {
            Ok(()) => OK,
            Err(e) => code(&e),
        },
        None => Error::NotFound.status_code(),
    }
}

/// Create a service client. Returns the handle or `0` on failure.
pub fn client_create(service_name: &str) -> u64 {
    let mut global = GLOBAL.lock();
    let Some(context) = global.context.clone() else {
        return 0;
    };
    match context.create_client(service_name) {
        Ok(client) => global.clients.insert(Arc::new(client)),
        Err(e) => {
            log::debug!("[API] client_create('{}') failed: {}", service_name, e);
            0
        }
    }
}

/// Destroy a client handle.
pub fn client_destroy(handle: u64) -> i32 {
    match GLOBAL.lock().clients.remove(handle) {
        Some(_) => OK,
        None => Error::NotFound.status_code(),
    }
}

/// Restrict a client to servers on one host (empty clears).
pub fn client_set_hostname(handle: u64, host_name: &str) -> i32 {
    let global = GLOBAL.lock();
    match global.clients.get(handle) {
        Some(client) => {
            client.set_host_filter(host_name);
            OK
        }
        None => Error::NotFound.status_code(),
    }
}

/// Call a method across every resolved instance.
///
/// With a stored response callback the call dispatches asynchronously;
/// without one it blocks and reports how many instances executed.
pub fn client_call_method(handle: u64, method_name: &str, request: &[u8], timeout_ms: i32) -> i32 {
    let client = {
        let global = GLOBAL.lock();
        match global.clients.get(handle) {
            Some(client) => Arc::clone(client),
            None => return Error::NotFound.status_code(),
        }
    };
    let timeout = if timeout_ms < 0 {
        Duration::from_secs(3600)
    } else {
        Duration::from_millis(timeout_ms as u64)
    };

    if client.call_async(method_name, request, timeout) {
        return OK;
    }
    match client.call(method_name, request, timeout) {
        Ok(responses) => responses
            .iter()
            .filter(|r| r.call_state == crate::service::CallState::Executed)
            .count() as i32,
        Err(e) => code(&e),
    }
}

/// Store the client response callback.
pub fn client_add_response_callback(
    handle: u64,
    callback: impl Fn(&ServiceResponse) + Send + Sync + 'static,
) -> i32 {
    let global = GLOBAL.lock();
    match global.clients.get(handle) {
        Some(client) => {
            client.add_response_callback(callback);
            OK
        }
        None => Error::NotFound.status_code(),
    }
}

/// Remove the client response callback.
pub fn client_rem_response_callback(handle: u64) -> i32 {
    let global = GLOBAL.lock();
    match global.clients.get(handle) {
        Some(client) => {
            client.remove_response_callback();
            OK
        }
        None => Error::NotFound.status_code(),
    }
}

/// Bump the monitoring reference count.
///
/// The global context must have been initialized with the monitoring
/// component (the flat default configuration does not include it; bindings
/// initialize monitoring-enabled processes explicitly).
pub fn mon_initialize() -> i32 {
    let mut global = GLOBAL.lock();
    let has_monitoring = global
        .context
        .as_ref()
        .is_some_and(|ctx| ctx.monitoring().is_some());
    if !has_monitoring {
        return Error::NotInitialized.status_code();
    }
    global.mon_count += 1;
    OK
}

/// Drop a monitoring reference.
pub fn mon_finalize() -> i32 {
    let mut global = GLOBAL.lock();
    if global.mon_count == 0 {
        return Error::NotInitialized.status_code();
    }
    global.mon_count -= 1;
    OK
}

/// Set the monitoring exclude filter.
pub fn mon_set_excl_filter(pattern: &str) -> i32 {
    match with_context(|ctx| match ctx.monitoring() {
        Some(monitoring) => match monitoring.set_exclude_filter(pattern) {
            Ok(()) => OK,
            Err(e) => code(&e),
        },
        None => Error::NotInitialized.status_code(),
    }) {
        Ok(value) => value,
        Err(code) => code,
    }
}

/// Set the monitoring include filter.
pub fn mon_set_incl_filter(pattern: &str) -> i32 {
    match with_context(|ctx| match ctx.monitoring() {
        Some(monitoring) => match monitoring.set_include_filter(pattern) {
            Ok(()) => OK,
            Err(e) => code(&e),
        },
        None => Error::NotInitialized.status_code(),
    }) {
        Ok(value) => value,
        Err(code) => code,
    }
}

/// Enable or disable the monitoring filters.
pub fn mon_set_filter_state(enabled: bool) -> i32 {
    match with_context(|ctx| match ctx.monitoring() {
        Some(monitoring) => {
            monitoring.set_filter_state(enabled);
            OK
        }
        None => Error::NotInitialized.status_code(),
    }) {
        Ok(value) => value,
        Err(code) => code,
    }
}

/// Fetch the monitoring snapshot: `(status, snapshot)`.
pub fn mon_monitoring() -> (i32, MonitoringSnapshot) {
    match with_context(|ctx| match ctx.monitoring() {
        Some(monitoring) => (OK, monitoring.get_monitoring()),
        None => (
            Error::NotInitialized.status_code(),
            MonitoringSnapshot::default(),
        ),
    }) {
        Ok(value) => value,
        Err(code) => (code, MonitoringSnapshot::default()),
    }
}

/// Drain the buffered log stream: `(status, entries)`.
pub fn mon_logging() -> (i32, Vec<LogEntry>) {
    match with_context(|ctx| match ctx.monitoring() {
        Some(monitoring) => (OK, monitoring.get_logging()),
        None => (Error::NotInitialized.status_code(), Vec::new()),
    }) {
        Ok(value) => value,
        Err(code) => (code, Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arena_handles_have_generations() {
        let mut arena: Arena<String> = Arena::new();
        let a = arena.insert("a".into());
        let b = arena.insert("b".into());
        assert_ne!(a, b);
        assert_eq!(arena.get(a).unwrap(), "a");

        assert_eq!(arena.remove(a).unwrap(), "a");
        // Stale handle no longer resolves, even after slot reuse.
        assert!(arena.get(a).is_none());
        let c = arena.insert("c".into());
        assert_ne!(a, c);
        assert!(arena.get(a).is_none());
        assert_eq!(arena.get(c).unwrap(), "c");
    }

    #[test]
    fn arena_clear_invalidates_everything() {
        let mut arena: Arena<u32> = Arena::new();
        let handles: Vec<u64> = (0..4).map(|i| arena.insert(i)).collect();
        arena.clear();
        for handle in handles {
            assert!(arena.get(handle).is_none());
        }
        // Slots are reusable afterwards.
        let fresh = arena.insert(99);
        assert_eq!(*arena.get(fresh).unwrap(), 99);
    }

    #[test]
    fn flat_api_lifecycle() {
        // One test drives the whole global lifecycle: the global context is
        // process-wide state, so splitting this across tests would race.
        let mut config = Configuration::default();
        config.registration.refresh_interval_ms = 50;
        config.registration.timeout_ms = 500;
        config.registration.udp_enable = false;
        config.registration.shm_enable = false;
        config.transport.udp.enable = false;

        assert!(is_initialized() == 0);
        assert_eq!(ok(), 0);
        assert_eq!(
            initialize_with_config(config.clone(), &["hbus-test".into()], "flat_api"),
            OK
        );
        assert_eq!(is_initialized(), 1);
        assert_eq!(ok(), 1);

        // Re-entrant init bumps the count.
        assert_eq!(initialize(&[], "flat_api"), 1);

        let publisher = pub_create("flat/topic", "Blob", "raw", &[]);
        assert_ne!(publisher, 0);
        let subscriber = sub_create("flat/topic", "Blob", "raw", &[]);
        assert_ne!(subscriber, 0);

        // Loopback matching lands within a couple of refresh cycles.
        let deadline = std::time::Instant::now() + Duration::from_secs(3);
        loop {
            let sent = pub_send(publisher, b"flat payload", 0);
            if sent > 0 {
                let (status, payload, time) = sub_receive(subscriber, 200);
                if status == OK {
                    assert_eq!(payload, b"flat payload");
                    assert!(time > 0);
                    break;
                }
            }
            assert!(
                std::time::Instant::now() < deadline,
                "no delivery over the flat API"
            );
            std::thread::sleep(Duration::from_millis(20));
        }

        // Stale handles are rejected after destroy.
        assert_eq!(pub_destroy(publisher), OK);
        assert!(pub_send(publisher, b"x", 0) < 0);
        assert_eq!(pub_destroy(publisher), Error::NotFound.status_code());
        assert_eq!(sub_destroy(subscriber), OK);

        // Unbalanced finalize keeps the context up.
        assert_eq!(finalize(), 1);
        assert_eq!(is_initialized(), 1);
        assert_eq!(finalize(), OK);
        assert_eq!(is_initialized(), 0);
        assert!(finalize() < 0);
    }
}
