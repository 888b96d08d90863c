// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Process context: process-wide lifecycle and the factory for every other
//! entity.
//!
//! A [`Context`] starts the selected components exactly once, owns the
//! registration layer, and hands out publishers, subscribers, servers, and
//! clients. Re-entrant init with a reference count lives in the flat handle
//! API ([`crate::handles`]); embedding Rust code creates a `Context`
//! directly.

use crate::clock::epoch_micros;
use crate::config::{Configuration, Severity};
use crate::error::{Error, Result};
use crate::logging::{install_backend, LogProvider};
use crate::monitoring::Monitoring;
use crate::pubsub::matching::MatchTable;
use crate::pubsub::{PubSubShared, Publisher, Subscriber};
use crate::registration::entries::{
    DataTypeInfo, Entity, ProcessEntry, ProcessState, ShutdownRequest, ShutdownScope,
};
use crate::registration::{
    Registration, RegistrationIdentity, RegistrationListener,
};
use crate::service::{Client, Server};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

// Handle serials and service instance ids draw from one process-wide
// counter, keeping entity keys unique across the process (and across
// multiple contexts in tests). Zero is reserved for the process entry.
static NEXT_ENTITY_SERIAL: AtomicU64 = AtomicU64::new(0);

/// Allocate the next process-wide entity serial.
pub(crate) fn next_entity_serial() -> u64 {
    NEXT_ENTITY_SERIAL.fetch_add(1, Ordering::AcqRel) + 1
}

/// Which components [`Context::new`] starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Components {
    /// Registration layer (implied by every other component).
    pub registration: bool,
    /// Monitoring aggregator.
    pub monitoring: bool,
    /// Publisher support.
    pub publisher: bool,
    /// Subscriber support.
    pub subscriber: bool,
    /// Service servers and clients.
    pub service: bool,
    /// Logging provider as the `log` backend.
    pub logging: bool,
    /// Time synchronization state reporting.
    pub timesync: bool,
}

impl Components {
    /// Everything on.
    #[must_use]
    pub fn all() -> Self {
        Self {
            registration: true,
            monitoring: true,
            publisher: true,
            subscriber: true,
            service: true,
            logging: true,
            timesync: true,
        }
    }
}

impl Default for Components {
    /// Everything except monitoring, which most data-plane processes do not
    /// need.
    fn default() -> Self {
        Self {
            monitoring: false,
            ..Self::all()
        }
    }
}

/// The process context.
pub struct Context {
    config: Arc<Configuration>,
    components: Components,
    identity: RegistrationIdentity,
    running: Arc<AtomicBool>,
    finalized: AtomicBool,
    registration: Arc<Registration>,
    monitoring: Option<Arc<Monitoring>>,
    log_provider: Option<Arc<LogProvider>>,
    pubsub: Option<Arc<PubSubShared>>,
    // Keep listener registrations alive for the context lifetime.
    _match_table: Option<Arc<MatchTable>>,
    _listeners: Vec<Arc<dyn RegistrationListener>>,
}

/// Flips the running flag when a shutdown announcement addresses this
/// process.
struct ShutdownWatch {
    running: Arc<AtomicBool>,
    unit_name: String,
    process_id: u32,
}

impl RegistrationListener for ShutdownWatch {
    fn on_announcement(&self, announcement: &crate::registration::entries::Announcement) {
        let crate::registration::entries::Announcement::Shutdown(request) = announcement else {
            return;
        };
        let addressed = match &request.scope {
            ShutdownScope::UnitName(name) => *name == self.unit_name,
            ShutdownScope::Pid(pid) => *pid == self.process_id,
            ShutdownScope::All => true,
        };
        if addressed {
            log::info!("[CTX] shutdown requested via registration; stopping");
            self.running.store(false, Ordering::Release);
        }
    }
}

impl Context {
    /// Initialize the context: validate the configuration and start the
    /// selected components.
    pub fn new(config: Configuration, unit_name: &str, components: Components) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let needs_registration = components.monitoring
            || components.publisher
            || components.subscriber
            || components.service
            || components.timesync;
        if !components.registration && needs_registration {
            log::debug!("[CTX] registration implied by selected components");
        }

        let process_id = std::process::id();
        let process_name = current_process_name();
        let unit_name = if unit_name.is_empty() {
            process_name.clone()
        } else {
            unit_name.to_string()
        };
        let identity = RegistrationIdentity {
            host_name: hostname(),
            host_group_name: config.registration.host_group_name.clone(),
            process_id,
            process_name: process_name.clone(),
            unit_name: unit_name.clone(),
        };

        let log_provider = if components.logging {
            let provider = LogProvider::new(&config, &identity.host_name, process_id, &unit_name)?;
            install_backend(&provider);
            Some(provider)
        } else {
            None
        };

        if config.transport.shm.enable {
            let cleaned = crate::transport::shm::cleanup_stale_segments();
            if cleaned > 0 {
                log::info!("[CTX] removed {} stale shm segment(s)", cleaned);
            }
        }

        let running = Arc::new(AtomicBool::new(true));
        let registration =
            Registration::start(&config, identity.clone(), Arc::clone(&running))?;

        let mut listeners: Vec<Arc<dyn RegistrationListener>> = Vec::new();

        let shutdown_watch: Arc<dyn RegistrationListener> = Arc::new(ShutdownWatch {
            running: Arc::clone(&running),
            unit_name: unit_name.clone(),
            process_id,
        });
        registration.add_listener(&shutdown_watch);
        listeners.push(shutdown_watch);

        let monitoring = if components.monitoring {
            let monitoring = Monitoring::new(&config)?;
            monitoring.start_log_receiver(config.log_port(), Arc::clone(&running))?;
            let listener: Arc<dyn RegistrationListener> = monitoring.clone();
            registration.add_listener(&listener);
            listeners.push(listener);
            Some(monitoring)
        } else {
            None
        };

        let (match_table, pubsub) = if components.publisher || components.subscriber {
            let match_table = MatchTable::new(registration.timeout_us());
            let listener: Arc<dyn RegistrationListener> = match_table.clone();
            registration.add_listener(&listener);
            listeners.push(listener);
            let pubsub = PubSubShared::new(
                Arc::clone(&config),
                Arc::clone(&registration),
                Arc::clone(&running),
                Arc::clone(&match_table),
            );
            (Some(match_table), Some(pubsub))
        } else {
            (None, None)
        };

        let entry = ProcessEntry {
            host_name: identity.host_name.clone(),
            host_group_name: identity.host_group_name.clone(),
            process_id,
            process_name,
            unit_name: unit_name.clone(),
            process_param: std::env::args().collect::<Vec<_>>().join(" "),
            state: ProcessState::default(),
            tsync_state: 0,
            tsync_module: if components.timesync {
                "local".to_string()
            } else {
                String::new()
            },
            component_init_state: 0,
            component_init_info: "initialized".to_string(),
            runtime_version: crate::VERSION.to_string(),
            registration_clock: 1,
        };
        registration.register(Entity::Process(entry));

        log::info!(
            "[CTX] initialized unit '{}' (pid {}, host {})",
            unit_name,
            process_id,
            identity.host_name
        );

        Ok(Self {
            config,
            components,
            identity,
            running,
            finalized: AtomicBool::new(false),
            registration,
            monitoring,
            log_provider,
            pubsub,
            _match_table: match_table,
            _listeners: listeners,
        })
    }

    /// Whether the context is up and not shutting down.
    #[must_use]
    pub fn ok(&self) -> bool {
        self.running.load(Ordering::Acquire) && !self.finalized.load(Ordering::Acquire)
    }

    /// Tear the context down: stop the registration layer, the transports,
    /// and the monitoring receiver. Idempotent.
    pub fn finalize(&self) {
        if self.finalized.swap(true, Ordering::AcqRel) {
            return;
        }
        log::info!("[CTX] finalizing unit '{}'", self.identity.unit_name);
        self.running.store(false, Ordering::Release);
        self.registration.stop();
        if let Some(pubsub) = &self.pubsub {
            if let Some(receiver) = pubsub.udp_receiver_if_started() {
                receiver.shutdown();
            }
        }
        if let Some(monitoring) = &self.monitoring {
            monitoring.stop();
        }
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &Arc<Configuration> {
        &self.config
    }

    /// This process's registration identity.
    #[must_use]
    pub fn identity(&self) -> &RegistrationIdentity {
        &self.identity
    }

    /// The registration layer.
    #[must_use]
    pub fn registration(&self) -> &Arc<Registration> {
        &self.registration
    }

    /// The monitoring aggregator, when that component was selected.
    #[must_use]
    pub fn monitoring(&self) -> Option<&Arc<Monitoring>> {
        self.monitoring.as_ref()
    }

    /// The logging provider, when that component was selected.
    #[must_use]
    pub fn log_provider(&self) -> Option<&Arc<LogProvider>> {
        self.log_provider.as_ref()
    }

    /// Create a publisher on `topic_name`.
    pub fn create_publisher(&self, topic_name: &str, data_type: DataTypeInfo) -> Result<Publisher> {
        if !self.ok() {
            return Err(Error::NotInitialized);
        }
        let pubsub = self.pubsub.as_ref().ok_or(Error::NotInitialized)?;
        if !self.components.publisher {
            return Err(Error::NotInitialized);
        }
        Publisher::create(pubsub, topic_name, data_type)
    }

    /// Create a subscriber on `topic_name`.
    pub fn create_subscriber(
        &self,
        topic_name: &str,
        data_type: DataTypeInfo,
    ) -> Result<Subscriber> {
        if !self.ok() {
            return Err(Error::NotInitialized);
        }
        let pubsub = self.pubsub.as_ref().ok_or(Error::NotInitialized)?;
        if !self.components.subscriber {
            return Err(Error::NotInitialized);
        }
        Subscriber::create(pubsub, topic_name, data_type)
    }

    /// Create a service server for `service_name`.
    pub fn create_server(&self, service_name: &str) -> Result<Server> {
        if !self.ok() || !self.components.service {
            return Err(Error::NotInitialized);
        }
        let instance_id = self.next_serial();
        Server::create(&self.config, &self.registration, instance_id, service_name)
    }

    /// Create a service client for `service_name`.
    pub fn create_client(&self, service_name: &str) -> Result<Client> {
        if !self.ok() || !self.components.service {
            return Err(Error::NotInitialized);
        }
        let instance_id = self.next_serial();
        Client::create(
            &self.config,
            &self.registration,
            &self.running,
            instance_id,
            service_name,
        )
    }

    fn next_serial(&self) -> u64 {
        next_entity_serial()
    }

    /// Report this process's state; carried in the next refresh.
    pub fn set_process_state(&self, severity: Severity, level: i32, info: &str) {
        let state = ProcessState {
            severity,
            level,
            info: info.to_string(),
        };
        self.registration.refresh(0, |e| {
            if let Entity::Process(p) = e {
                p.state = state.clone();
            }
        });
    }

    /// Ask the process with `unit_name` to shut down (fire-and-forget).
    pub fn shutdown_process_by_name(&self, unit_name: &str) {
        self.registration.announce_shutdown(ShutdownRequest {
            scope: ShutdownScope::UnitName(unit_name.to_string()),
        });
    }

    /// Ask the process with `process_id` to shut down (fire-and-forget).
    pub fn shutdown_process_by_id(&self, process_id: u32) {
        self.registration.announce_shutdown(ShutdownRequest {
            scope: ShutdownScope::Pid(process_id),
        });
    }

    /// Ask every process in the fleet - this one included - to shut down.
    pub fn shutdown_all(&self) {
        self.registration.announce_shutdown(ShutdownRequest {
            scope: ShutdownScope::All,
        });
    }

    /// Epoch microseconds, the default sample timestamp source.
    #[must_use]
    pub fn get_microseconds() -> u64 {
        epoch_micros()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.finalize();
    }
}

/// The machine's host name.
#[must_use]
pub fn hostname() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: buf is a valid writable buffer of 256 bytes; gethostname
    // NUL-terminates within the given length on success.
    let ret = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if ret == 0 {
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        if let Ok(name) = std::str::from_utf8(&buf[..end]) {
            if !name.is_empty() {
                return name.to_string();
            }
        }
    }
    "localhost".to_string()
}

fn current_process_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_config() -> Configuration {
        let mut cfg = Configuration::default();
        cfg.registration.refresh_interval_ms = 50;
        cfg.registration.timeout_ms = 500;
        cfg.registration.udp_enable = false;
        cfg.registration.shm_enable = false;
        cfg.transport.udp.enable = false;
        cfg
    }

    #[test]
    fn context_initializes_and_finalizes() {
        let ctx = Context::new(local_config(), "ctx_test", Components::default()).unwrap();
        assert!(ctx.ok());
        assert!(!ctx.identity().host_name.is_empty());

        ctx.finalize();
        assert!(!ctx.ok());
        // Idempotent.
        ctx.finalize();
    }

    #[test]
    fn entities_require_their_component() {
        let mut components = Components::default();
        components.publisher = false;
        components.subscriber = false;
        components.service = false;
        let ctx = Context::new(local_config(), "ctx_limited", components).unwrap();

        assert!(matches!(
            ctx.create_publisher("t", DataTypeInfo::default()),
            Err(Error::NotInitialized)
        ));
        assert!(matches!(
            ctx.create_server("s"),
            Err(Error::NotInitialized)
        ));
    }

    #[test]
    fn empty_topic_names_are_rejected() {
        let ctx = Context::new(local_config(), "ctx_args", Components::default()).unwrap();
        assert!(matches!(
            ctx.create_publisher("", DataTypeInfo::default()),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            ctx.create_subscriber("", DataTypeInfo::default()),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn shutdown_all_stops_own_process() {
        let ctx = Context::new(local_config(), "ctx_shutdown", Components::default()).unwrap();
        assert!(ctx.ok());
        ctx.shutdown_all();
        // The loopback announcement lands synchronously.
        assert!(!ctx.running.load(Ordering::Acquire));
    }

    #[test]
    fn hostname_is_nonempty() {
        assert!(!hostname().is_empty());
    }
}
