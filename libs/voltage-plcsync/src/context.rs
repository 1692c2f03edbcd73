//! Device context: the public entry point
//!
//! A `PlcContext` owns everything belonging to one PLC: the address space, the
//! variable registry, the sync engine, change tracking, the connection guard and the
//! polling scheduler. There is no global state; two contexts never share data.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::address_space::AddressSpace;
use crate::config::PlcConfig;
use crate::connection::{ConnectionGuard, ConnectionState, ConnectionStatus, GuardPolicy};
use crate::descriptor::{self, VariableDescriptor};
use crate::device;
use crate::error::{PlcError, Result};
use crate::polling::{GroupSnapshot, PollingScheduler};
use crate::registry::{Variable, VariableRegistry};
use crate::sync::{Propagation, SyncEngine};
use crate::tracker::{ChangeReader, ChangeTracker, ReaderId};
use crate::transport::{PlcTransport, TransportError};
use crate::value::Value;

pub struct PlcContext {
    config: PlcConfig,
    engine: SyncEngine,
    tracker: Arc<ChangeTracker>,
    default_reader: ReaderId,
    guard: Arc<ConnectionGuard>,
    scheduler: PollingScheduler,
}

impl std::fmt::Debug for PlcContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlcContext")
            .field("transport", &self.guard.transport().name())
            .field("variables", &self.engine.registry().len())
            .field("state", &self.guard.state())
            .finish()
    }
}

impl PlcContext {
    /// Build a context from descriptors
    ///
    /// Fails on invalid configuration, out-of-range addresses and name collisions.
    /// Declared initial values are written into the address space without
    /// registering as changes. No connection is opened.
    pub fn new(
        config: PlcConfig,
        descriptors: &[VariableDescriptor],
        transport: Arc<dyn PlcTransport>,
    ) -> Result<Self> {
        config.validate()?;

        let space = Arc::new(AddressSpace::new(&config.regions));
        let registry = Arc::new(VariableRegistry::build(
            descriptors,
            config.word_order,
            &space,
        )?);
        let engine = SyncEngine::new(Arc::clone(&registry), space);
        engine.seed()?;

        let tracker = Arc::new(ChangeTracker::new(Arc::clone(&registry)));
        let default_reader = tracker.register_reader();

        let guard = Arc::new(ConnectionGuard::new(
            transport,
            GuardPolicy::from_config(&config.connection),
        ));
        let scheduler =
            PollingScheduler::new(engine.clone(), Arc::clone(&guard), config.polling.clone());

        info!(
            "PLC context ready: {} declared, {} variables, transport {}",
            descriptors.len(),
            registry.len(),
            guard.transport().name()
        );

        Ok(Self {
            config,
            engine,
            tracker,
            default_reader,
            guard,
            scheduler,
        })
    }

    /// Build a context from declaration text
    pub fn from_declarations(
        config: PlcConfig,
        declarations: &str,
        transport: Arc<dyn PlcTransport>,
    ) -> Result<Self> {
        let descriptors = descriptor::parse_declarations(declarations)?;
        Self::new(config, &descriptors, transport)
    }

    /// Build a context from a declaration file
    pub fn from_file(
        config: PlcConfig,
        path: impl AsRef<Path>,
        transport: Arc<dyn PlcTransport>,
    ) -> Result<Self> {
        let descriptors = descriptor::load_declarations(path)?;
        Self::new(config, &descriptors, transport)
    }

    pub fn config(&self) -> &PlcConfig {
        &self.config
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    pub fn registry(&self) -> &Arc<VariableRegistry> {
        self.engine.registry()
    }

    pub fn variable(&self, name: &str) -> Result<&Variable> {
        self.engine.registry().by_name(name)
    }

    // ========================================================================
    // Values
    // ========================================================================

    /// Current mirrored value; no device access
    pub fn read_var(&self, name: &str) -> Result<Value> {
        let id = self.engine.registry().lookup(name)?;
        self.engine.read(id)
    }

    /// Read `name` from the device and apply it to the mirror
    pub async fn refresh_var(&self, name: &str) -> Result<Value> {
        let var = self.variable(name)?;
        let raw = device::read_variable(&self.guard, var).await?;
        self.engine.apply_device_value(var.id(), raw)?;
        self.engine.read(var.id())
    }

    /// Write to the device, then to the mirror
    ///
    /// The readonly gate runs first. A transport failure leaves the mirror untouched.
    pub async fn write_var(&self, name: &str, value: Value, force: bool) -> Result<Propagation> {
        let var = self.variable(name)?;
        self.engine.authorize(var, force)?;
        let raw = var.encode(&value)?;

        device::write_variable(&self.guard, var, raw).await?;
        let propagation = self.engine.commit(var.id(), raw)?;
        debug!(
            "Wrote {} = {} ({} views changed)",
            name,
            value,
            propagation.changed.len()
        );
        Ok(propagation)
    }

    // ========================================================================
    // Typed accessors
    // ========================================================================

    fn typed<T>(&self, name: &str, expected: &str, f: impl Fn(&Value) -> Option<T>) -> Result<T> {
        let value = self.read_var(name)?;
        f(&value).ok_or_else(|| PlcError::type_mismatch(name, expected, value.type_name()))
    }

    pub fn flag(&self, name: &str) -> Result<bool> {
        self.typed(name, "Flag", Value::as_flag)
    }

    pub fn byte(&self, name: &str) -> Result<u8> {
        self.typed(name, "Byte", Value::as_byte)
    }

    pub fn word(&self, name: &str) -> Result<u16> {
        self.typed(name, "Word", Value::as_word)
    }

    pub fn dword(&self, name: &str) -> Result<u32> {
        self.typed(name, "DWord", Value::as_dword)
    }

    pub fn timer(&self, name: &str) -> Result<Duration> {
        self.typed(name, "Time", Value::as_time)
    }

    // ========================================================================
    // Change tracking
    // ========================================================================

    /// Whether `name` changed since the context's own reader acknowledged it
    pub fn is_changed(&self, name: &str) -> Result<bool> {
        let id = self.engine.registry().lookup(name)?;
        Ok(self.tracker.is_changed(self.default_reader, id))
    }

    pub fn acknowledge(&self, name: &str) -> Result<()> {
        let id = self.engine.registry().lookup(name)?;
        self.tracker.acknowledge(self.default_reader, id);
        Ok(())
    }

    /// Version to pass to [`acknowledge_version`](Self::acknowledge_version) once
    /// the value has been handled; `None` when nothing changed
    pub fn changed_version(&self, name: &str) -> Result<Option<u64>> {
        let id = self.engine.registry().lookup(name)?;
        Ok(self.tracker.changed_version(self.default_reader, id))
    }

    pub fn acknowledge_version(&self, name: &str, seen: u64) -> Result<()> {
        let id = self.engine.registry().lookup(name)?;
        self.tracker.acknowledge_version(self.default_reader, id, seen);
        Ok(())
    }

    /// Names changed since the context's own reader last acknowledged them
    pub fn changed_variables(&self) -> Vec<String> {
        self.tracker
            .changed_since(self.default_reader)
            .into_iter()
            .filter_map(|id| self.engine.registry().get(id))
            .map(|var| var.name().to_string())
            .collect()
    }

    /// Independent change reader starting from the current state
    pub fn change_reader(&self) -> ChangeReader {
        ChangeReader::new(Arc::clone(&self.tracker))
    }

    // ========================================================================
    // Polling
    // ========================================================================

    pub fn add_polling_group<S: AsRef<str>>(
        &self,
        name: &str,
        variables: &[S],
        interval_ms: u64,
        max_cycles: u64,
    ) -> Result<()> {
        self.scheduler.add_group(name, variables, interval_ms, max_cycles)
    }

    pub async fn remove_polling_group(&self, name: &str) -> Result<()> {
        self.scheduler.remove_group(name).await
    }

    pub fn group_snapshot(&self, name: &str) -> Option<GroupSnapshot> {
        self.scheduler.snapshot(name)
    }

    pub fn polling_groups(&self) -> Vec<GroupSnapshot> {
        self.scheduler.groups()
    }

    // ========================================================================
    // Connection
    // ========================================================================

    /// Non-blocking liveness from cached state
    pub fn alive(&self) -> bool {
        self.guard.alive()
    }

    /// Up to `retries` connect attempts spaced by `retry_delay`
    pub async fn connect(&self, retries: u32, retry_delay: Duration) -> Result<()> {
        if self.guard.connect(retries, retry_delay).await {
            Ok(())
        } else {
            Err(TransportError::ConnectionFailed(format!(
                "{} unreachable after {} attempt(s)",
                self.guard.transport().name(),
                retries.max(1)
            ))
            .into())
        }
    }

    /// Connect with the configured retry policy
    pub async fn connect_default(&self) -> Result<()> {
        let conn = &self.config.connection;
        self.connect(conn.connect_retries, conn.retry_delay()).await
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.guard.state()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.guard.status()
    }

    /// Stop all polling groups and close the transport
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        self.guard.disconnect().await;
        info!("PLC context shut down");
    }
}
