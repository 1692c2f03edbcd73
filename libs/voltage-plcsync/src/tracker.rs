//! Per-reader change tracking
//!
//! Variables carry a monotonic version; each reader keeps its own watermark per
//! variable. Checking is non-destructive and one reader acknowledging a change
//! never hides it from another.
//!
//! `acknowledge` covers everything up to the moment it runs. A reader that acts on
//! a value should take the version with `changed_version` first and hand it back to
//! `acknowledge_version`, so a change landing in between is reported again.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::error::Result;
use crate::registry::{VarId, VariableRegistry};

/// Identifier of one change reader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReaderId(u64);

#[derive(Debug)]
pub struct ChangeTracker {
    registry: Arc<VariableRegistry>,
    next_reader: AtomicU64,
    watermarks: DashMap<(ReaderId, VarId), u64>,
}

impl ChangeTracker {
    pub fn new(registry: Arc<VariableRegistry>) -> Self {
        Self {
            registry,
            next_reader: AtomicU64::new(1),
            watermarks: DashMap::new(),
        }
    }

    /// New reader whose baseline is the current state
    pub fn register_reader(&self) -> ReaderId {
        let reader = ReaderId(self.next_reader.fetch_add(1, Ordering::Relaxed));
        for var in self.registry.iter() {
            let version = var.version();
            if version > 0 {
                self.watermarks.insert((reader, var.id()), version);
            }
        }
        debug!("Change reader {} registered", reader.0);
        reader
    }

    /// Drop every watermark held by `reader`
    pub fn release_reader(&self, reader: ReaderId) {
        self.watermarks.retain(|(r, _), _| *r != reader);
    }

    fn current(&self, var: VarId) -> u64 {
        self.registry.get(var).map_or(0, |v| v.version())
    }

    fn watermark(&self, reader: ReaderId, var: VarId) -> u64 {
        self.watermarks.get(&(reader, var)).map_or(0, |w| *w)
    }

    pub fn is_changed(&self, reader: ReaderId, var: VarId) -> bool {
        self.changed_version(reader, var).is_some()
    }

    /// Current version of `var` if the reader has not acknowledged it yet
    pub fn changed_version(&self, reader: ReaderId, var: VarId) -> Option<u64> {
        let version = self.current(var);
        (version > self.watermark(reader, var)).then_some(version)
    }

    /// Advance the reader's watermark to `seen`, never backwards
    pub fn acknowledge_version(&self, reader: ReaderId, var: VarId, seen: u64) {
        let seen = seen.min(self.current(var));
        let mut entry = self.watermarks.entry((reader, var)).or_insert(0);
        if *entry < seen {
            *entry = seen;
        }
    }

    /// Advance the reader's watermark to the current version
    pub fn acknowledge(&self, reader: ReaderId, var: VarId) {
        self.acknowledge_version(reader, var, self.current(var));
    }

    pub fn acknowledge_all(&self, reader: ReaderId) {
        for var in self.registry.iter() {
            self.acknowledge(reader, var.id());
        }
    }

    /// Every variable changed since the reader last acknowledged it
    pub fn changed_since(&self, reader: ReaderId) -> Vec<VarId> {
        self.registry
            .iter()
            .filter(|var| var.version() > self.watermark(reader, var.id()))
            .map(|var| var.id())
            .collect()
    }
}

/// Owned change reader addressed by variable name; released on drop
#[derive(Debug)]
pub struct ChangeReader {
    id: ReaderId,
    tracker: Arc<ChangeTracker>,
}

impl ChangeReader {
    pub fn new(tracker: Arc<ChangeTracker>) -> Self {
        let id = tracker.register_reader();
        Self { id, tracker }
    }

    pub fn id(&self) -> ReaderId {
        self.id
    }

    pub fn is_changed(&self, name: &str) -> Result<bool> {
        let var = self.tracker.registry.lookup(name)?;
        Ok(self.tracker.is_changed(self.id, var))
    }

    pub fn acknowledge(&self, name: &str) -> Result<()> {
        let var = self.tracker.registry.lookup(name)?;
        self.tracker.acknowledge(self.id, var);
        Ok(())
    }

    pub fn changed_version(&self, name: &str) -> Result<Option<u64>> {
        let var = self.tracker.registry.lookup(name)?;
        Ok(self.tracker.changed_version(self.id, var))
    }

    pub fn acknowledge_version(&self, name: &str, seen: u64) -> Result<()> {
        let var = self.tracker.registry.lookup(name)?;
        self.tracker.acknowledge_version(self.id, var, seen);
        Ok(())
    }

    pub fn acknowledge_all(&self) {
        self.tracker.acknowledge_all(self.id);
    }

    /// Names of changed variables, in registry order
    pub fn changed(&self) -> Vec<String> {
        self.tracker
            .changed_since(self.id)
            .into_iter()
            .filter_map(|id| self.tracker.registry.get(id))
            .map(|var| var.name().to_string())
            .collect()
    }
}

impl Drop for ChangeReader {
    fn drop(&mut self) {
        self.tracker.release_reader(self.id);
    }
}
