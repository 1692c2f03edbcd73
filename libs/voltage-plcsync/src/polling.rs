//! Polling scheduler
//!
//! Each polling group runs as its own tokio task: check liveness, read every
//! variable through the connection guard, apply the values through the sync
//! engine, then sleep for the rest of the interval. Groups are stopped through a
//! `CancellationToken`; the loop notices it at the next boundary. An in-flight read
//! is never aborted, but whatever it returns after stop was requested is dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::PollingConfig;
use crate::connection::ConnectionGuard;
use crate::device;
use crate::error::{PlcError, Result};
use crate::registry::VarId;
use crate::sync::SyncEngine;

/// Lifecycle of a polling group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum RunState {
    Idle = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl RunState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => RunState::Idle,
            1 => RunState::Running,
            2 => RunState::Stopping,
            _ => RunState::Stopped,
        }
    }
}

/// State shared between a group's task and the scheduler
#[derive(Debug)]
pub struct PollingGroup {
    name: String,
    vars: Vec<VarId>,
    var_names: Vec<String>,
    interval: Duration,
    max_cycles: u64,
    state: AtomicU8,
    cycles: AtomicU64,
    skipped: AtomicU64,
    read_errors: AtomicU64,
    token: CancellationToken,
}

impl PollingGroup {
    fn new(
        name: String,
        vars: Vec<VarId>,
        var_names: Vec<String>,
        interval: Duration,
        max_cycles: u64,
    ) -> Self {
        Self {
            name,
            vars,
            var_names,
            interval,
            max_cycles,
            state: AtomicU8::new(RunState::Idle as u8),
            cycles: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            read_errors: AtomicU64::new(0),
            token: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> RunState {
        RunState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: RunState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Request a stop unless the group already finished
    fn request_stop(&self) {
        let _ = self.state.compare_exchange(
            RunState::Running as u8,
            RunState::Stopping as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        let _ = self.state.compare_exchange(
            RunState::Idle as u8,
            RunState::Stopping as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.token.cancel();
    }

    pub fn snapshot(&self) -> GroupSnapshot {
        GroupSnapshot {
            name: self.name.clone(),
            variables: self.var_names.clone(),
            interval_ms: u64::try_from(self.interval.as_millis()).unwrap_or(u64::MAX),
            max_cycles: self.max_cycles,
            cycles: self.cycles.load(Ordering::Acquire),
            skipped_cycles: self.skipped.load(Ordering::Acquire),
            read_errors: self.read_errors.load(Ordering::Acquire),
            state: self.state(),
        }
    }
}

/// Point-in-time view of a polling group
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupSnapshot {
    pub name: String,
    pub variables: Vec<String>,
    pub interval_ms: u64,
    /// 0 means unbounded
    pub max_cycles: u64,
    /// Completed cycles; skipped cycles are not counted
    pub cycles: u64,
    pub skipped_cycles: u64,
    pub read_errors: u64,
    pub state: RunState,
}

struct GroupEntry {
    group: Arc<PollingGroup>,
    handle: JoinHandle<()>,
}

/// Runs named polling groups against one device
pub struct PollingScheduler {
    engine: SyncEngine,
    guard: Arc<ConnectionGuard>,
    config: PollingConfig,
    groups: Mutex<HashMap<String, GroupEntry>>,
}

impl std::fmt::Debug for PollingScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingScheduler")
            .field("config", &self.config)
            .field("groups", &self.groups.lock().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl PollingScheduler {
    pub fn new(engine: SyncEngine, guard: Arc<ConnectionGuard>, config: PollingConfig) -> Self {
        Self {
            engine,
            guard,
            config,
            groups: Mutex::new(HashMap::new()),
        }
    }

    /// Start a polling group
    ///
    /// `interval_ms = 0` selects the configured default interval and
    /// `max_cycles = 0` polls until the group is removed. A name held by a group
    /// that already finished is replaced; a live name is rejected.
    pub fn add_group<S: AsRef<str>>(
        &self,
        name: &str,
        variables: &[S],
        interval_ms: u64,
        max_cycles: u64,
    ) -> Result<()> {
        if name.trim().is_empty() {
            return Err(PlcError::polling("group name must not be empty"));
        }
        if variables.is_empty() {
            return Err(PlcError::polling(format!("group '{}' has no variables", name)));
        }

        let registry = self.engine.registry();
        let mut vars = Vec::with_capacity(variables.len());
        let mut var_names = Vec::with_capacity(variables.len());
        for var in variables {
            vars.push(registry.lookup(var.as_ref())?);
            var_names.push(var.as_ref().to_string());
        }

        let interval = Duration::from_millis(if interval_ms == 0 {
            self.config.default_interval_ms
        } else {
            interval_ms
        });

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| PlcError::polling("polling groups need a tokio runtime"))?;

        let mut groups = self.groups.lock();
        if let Some(existing) = groups.get(name) {
            if existing.group.state() != RunState::Stopped {
                return Err(PlcError::polling(format!(
                    "group '{}' is already running",
                    name
                )));
            }
            debug!("Replacing finished polling group {}", name);
        }

        let group = Arc::new(PollingGroup::new(
            name.to_string(),
            vars,
            var_names,
            interval,
            max_cycles,
        ));
        group.set_state(RunState::Running);

        let handle = runtime.spawn(run_group(
            Arc::clone(&group),
            self.engine.clone(),
            Arc::clone(&self.guard),
        ));
        groups.insert(name.to_string(), GroupEntry { group, handle });

        info!(
            "Polling group {} added: {} vars, interval {}ms, max_cycles {}",
            name,
            variables.len(),
            interval.as_millis(),
            max_cycles
        );
        Ok(())
    }

    /// Stop a group and wait for its task
    ///
    /// The wait is bounded by one interval plus the configured stop grace; a task
    /// still running after that is aborted.
    pub async fn remove_group(&self, name: &str) -> Result<()> {
        let entry = self
            .groups
            .lock()
            .remove(name)
            .ok_or_else(|| PlcError::polling(format!("unknown group '{}'", name)))?;

        stop_entry(entry, self.stop_grace()).await;
        info!("Polling group {} removed", name);
        Ok(())
    }

    pub fn snapshot(&self, name: &str) -> Option<GroupSnapshot> {
        self.groups.lock().get(name).map(|e| e.group.snapshot())
    }

    /// Snapshots of every group, sorted by name
    pub fn groups(&self) -> Vec<GroupSnapshot> {
        let mut out: Vec<GroupSnapshot> = self
            .groups
            .lock()
            .values()
            .map(|e| e.group.snapshot())
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Stop every group
    pub async fn shutdown(&self) {
        let entries: Vec<GroupEntry> = self.groups.lock().drain().map(|(_, e)| e).collect();
        if entries.is_empty() {
            return;
        }
        for entry in &entries {
            entry.group.request_stop();
        }
        let count = entries.len();
        let grace = self.stop_grace();
        for entry in entries {
            stop_entry(entry, grace).await;
        }
        info!("Polling scheduler stopped {} group(s)", count);
    }

    fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.config.stop_grace_ms)
    }
}

impl Drop for PollingScheduler {
    fn drop(&mut self) {
        for entry in self.groups.get_mut().values() {
            entry.group.request_stop();
        }
    }
}

async fn stop_entry(entry: GroupEntry, grace: Duration) {
    let GroupEntry { group, mut handle } = entry;
    group.request_stop();

    let deadline = group.interval + grace;
    match tokio::time::timeout(deadline, &mut handle).await {
        Ok(Ok(())) => {},
        Ok(Err(e)) => error!("Polling group {} task failed: {}", group.name, e),
        Err(_) => {
            warn!(
                "Polling group {} did not stop within {:?}, aborting",
                group.name, deadline
            );
            handle.abort();
        },
    }
    group.set_state(RunState::Stopped);
}

async fn run_group(group: Arc<PollingGroup>, engine: SyncEngine, guard: Arc<ConnectionGuard>) {
    let registry = Arc::clone(engine.registry());
    let token = group.token.clone();
    let mut was_alive = true;

    info!(
        "Polling group {} started, interval {}ms",
        group.name,
        group.interval.as_millis()
    );

    'cycles: loop {
        if token.is_cancelled() {
            break;
        }
        let started = Instant::now();

        if guard.alive() {
            if !was_alive {
                info!("Polling group {}: device alive again, resuming", group.name);
                was_alive = true;
            }

            for &id in &group.vars {
                let Some(var) = registry.get(id) else {
                    continue;
                };
                let result = device::read_variable(&guard, var).await;

                if token.is_cancelled() {
                    debug!(
                        "{}",
                        PlcError::StaleData(format!("{} in group {}", var.name(), group.name))
                    );
                    break 'cycles;
                }

                match result.and_then(|raw| engine.apply_device_value(id, raw)) {
                    Ok(_) => {},
                    Err(e) => {
                        group.read_errors.fetch_add(1, Ordering::Relaxed);
                        debug!("Polling group {}: {} failed: {}", group.name, var.name(), e);
                    },
                }
            }

            let done = group.cycles.fetch_add(1, Ordering::AcqRel) + 1;
            if group.max_cycles > 0 && done >= group.max_cycles {
                info!("Polling group {} completed {} cycles", group.name, done);
                break;
            }
        } else {
            if was_alive {
                warn!("Polling group {}: device not alive, skipping cycles", group.name);
                was_alive = false;
            } else {
                debug!("Polling group {}: cycle skipped", group.name);
            }
            group.skipped.fetch_add(1, Ordering::Relaxed);
        }

        let pause = group.interval.saturating_sub(started.elapsed());
        tokio::select! {
            _ = tokio::time::sleep(pause) => {},
            () = token.cancelled() => break,
        }
    }

    group.set_state(RunState::Stopped);
    info!(
        "Polling group {} stopped after {} cycles",
        group.name,
        group.cycles.load(Ordering::Acquire)
    );
}
