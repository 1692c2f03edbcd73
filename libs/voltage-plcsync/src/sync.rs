//! Alias synchronization engine
//!
//! Every mutation follows one path: take the area's exclusive lock, store the raw
//! value into the address space, then re-resolve every variable whose bytes
//! intersect the touched range and bump the version of those that changed. Because
//! the whole pass runs under the area lock, readers never observe a half-propagated
//! state and writes to other areas proceed in parallel.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::address_space::AddressSpace;
use crate::error::{PlcError, Result};
use crate::registry::{VarId, Variable, VariableRegistry};
use crate::value::Value;

/// Result of one propagation pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Propagation {
    pub target: VarId,
    /// Variables whose resolved value changed, target included
    pub changed: Vec<VarId>,
}

impl Propagation {
    pub fn is_noop(&self) -> bool {
        self.changed.is_empty()
    }
}

/// Single mutation point for the address space
#[derive(Debug, Clone)]
pub struct SyncEngine {
    registry: Arc<VariableRegistry>,
    space: Arc<AddressSpace>,
}

impl SyncEngine {
    pub fn new(registry: Arc<VariableRegistry>, space: Arc<AddressSpace>) -> Self {
        Self { registry, space }
    }

    pub fn registry(&self) -> &Arc<VariableRegistry> {
        &self.registry
    }

    pub fn space(&self) -> &Arc<AddressSpace> {
        &self.space
    }

    /// Readonly gate for client writes
    pub fn authorize(&self, var: &Variable, force: bool) -> Result<()> {
        if !var.is_readonly() {
            return Ok(());
        }
        if !force {
            warn!("Write blocked: {} is read-only", var.name());
            return Err(PlcError::read_only(var.name()));
        }
        warn!("Forced write to read-only variable {}", var.name());
        Ok(())
    }

    /// Client write: gate, encode, propagate
    pub fn write(&self, id: VarId, value: Value, force: bool) -> Result<Propagation> {
        let var = self.registry.var(id)?;
        self.authorize(var, force)?;
        let raw = var.encode(&value)?;
        self.commit(id, raw)
    }

    /// Store an already authorized raw value and propagate it
    pub(crate) fn commit(&self, id: VarId, raw: u32) -> Result<Propagation> {
        let var = self.registry.var(id)?;
        let addr = *var.address();

        let mut region = self.space.write(addr.area)?;
        region.store(&addr, raw)?;

        let mut changed = Vec::new();
        for dep in self.registry.dependents(addr.area, addr.byte_range()) {
            let dep_var = self.registry.var(dep)?;
            let resolved = region.load(dep_var.address())?;
            if dep_var.observe(resolved) {
                changed.push(dep);
            }
        }
        drop(region);

        if !changed.is_empty() {
            debug!(
                "Propagated {} = {:#X} to {} views",
                var.name(),
                raw,
                changed.len()
            );
        }
        Ok(Propagation {
            target: id,
            changed,
        })
    }

    /// Device-originated value; the device is authoritative so the readonly gate is skipped
    pub fn apply_device_value(&self, id: VarId, raw: u32) -> Result<Propagation> {
        let max = self.registry.var(id)?.kind().max_raw();
        self.commit(id, raw & max)
    }

    /// Current value resolved from the address space
    pub fn read(&self, id: VarId) -> Result<Value> {
        let var = self.registry.var(id)?;
        let raw = self.space.load(var.address())?;
        Ok(Value::from_raw(var.kind(), raw))
    }

    pub fn read_raw(&self, id: VarId) -> Result<u32> {
        let var = self.registry.var(id)?;
        self.space.load(var.address())
    }

    /// Store declared initial values, then prime every cache without bumping versions
    pub fn seed(&self) -> Result<()> {
        for var in self.registry.iter() {
            if let Some(raw) = var.initial_value() {
                let mut region = self.space.write(var.address().area)?;
                region.store(var.address(), raw)?;
            }
        }
        self.prime()
    }

    /// Align cached values with the address space without recording changes
    pub fn prime(&self) -> Result<()> {
        for var in self.registry.iter() {
            var.prime(self.space.load(var.address())?);
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::address::{Area, WordOrder};
    use crate::config::RegionSizes;
    use crate::descriptor::{VarKind, VariableDescriptor};
    use tracing_test::traced_test;

    fn engine(descs: &[VariableDescriptor]) -> SyncEngine {
        let space = Arc::new(AddressSpace::new(&RegionSizes {
            input: 8,
            output: 8,
            memory: 32,
        }));
        let registry =
            Arc::new(VariableRegistry::build(descs, WordOrder::LowWordFirst, &space).unwrap());
        let engine = SyncEngine::new(registry, space);
        engine.seed().unwrap();
        engine
    }

    fn id(engine: &SyncEngine, name: &str) -> VarId {
        engine.registry().lookup(name).unwrap()
    }

    #[test]
    fn test_word_write_reaches_bytes_and_bits() {
        let e = engine(&[VariableDescriptor::new("W", Area::Memory, 4, None, VarKind::Word)]);
        let prop = e.write(id(&e, "W"), Value::Word(0x00FF), false).unwrap();

        assert_eq!(e.read(id(&e, "W_LowByte")).unwrap(), Value::Byte(0xFF));
        assert_eq!(e.read(id(&e, "W_HighByte")).unwrap(), Value::Byte(0));
        for bit in 0..8 {
            let name = format!("W_LowBit{}", bit);
            assert_eq!(e.read(id(&e, &name)).unwrap(), Value::Flag(true));
        }
        // word, low byte, 8 low bits
        assert_eq!(prop.changed.len(), 10);
    }

    #[test]
    fn test_bit_write_updates_ancestors_only_when_changed() {
        let e = engine(&[VariableDescriptor::new("W", Area::Memory, 0, None, VarKind::Word)]);
        let bit = id(&e, "W_HighBit0");
        let prop = e.write(bit, Value::Flag(true), false).unwrap();
        assert_eq!(e.read(id(&e, "W")).unwrap(), Value::Word(0x0100));
        assert_eq!(prop.changed.len(), 3);

        let again = e.write(bit, Value::Flag(true), false).unwrap();
        assert!(again.is_noop());
        assert_eq!(e.registry().var(bit).unwrap().version(), 1);
    }

    #[traced_test]
    #[test]
    fn test_readonly_gate() {
        let e = engine(&[VariableDescriptor::new("In", Area::Input, 0, None, VarKind::Word)]);
        let target = id(&e, "In_LowBit2");
        let err = e.write(target, Value::Flag(true), false).unwrap_err();
        assert!(matches!(err, PlcError::ReadOnlyViolation(_)));
        assert_eq!(e.read(id(&e, "In")).unwrap(), Value::Word(0));

        e.write(target, Value::Flag(true), true).unwrap();
        assert_eq!(e.read(id(&e, "In")).unwrap(), Value::Word(0b100));
        assert!(logs_contain("Forced write to read-only variable In_LowBit2"));
    }

    #[test]
    fn test_device_value_bypasses_gate() {
        let e = engine(&[VariableDescriptor::new("In", Area::Input, 0, None, VarKind::Byte)]);
        e.apply_device_value(id(&e, "In"), 0x81).unwrap();
        assert_eq!(e.read(id(&e, "In_Bit7")).unwrap(), Value::Flag(true));
    }

    #[test]
    fn test_seed_does_not_bump_versions() {
        let e = engine(&[
            VariableDescriptor::new("W", Area::Memory, 0, None, VarKind::Word).with_initial(0x1234)
        ]);
        let w = e.registry().by_name("W").unwrap();
        assert_eq!(w.cached(), Value::Word(0x1234));
        assert_eq!(w.version(), 0);
        assert_eq!(
            e.registry().by_name("W_HighByte").unwrap().cached(),
            Value::Byte(0x12)
        );
    }

    #[test]
    fn test_overlapping_declared_variables_share_bits() {
        let e = engine(&[
            VariableDescriptor::new("W", Area::Memory, 2, None, VarKind::Word),
            VariableDescriptor::new("B", Area::Memory, 3, None, VarKind::Byte),
        ]);
        e.write(id(&e, "B"), Value::Byte(0xA5), false).unwrap();
        assert_eq!(e.read(id(&e, "W")).unwrap(), Value::Word(0xA500));
        assert_eq!(
            e.registry().by_name("W_HighByte").unwrap().cached(),
            Value::Byte(0xA5)
        );
    }
}
