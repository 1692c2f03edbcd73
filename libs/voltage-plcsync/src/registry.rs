//! Variable registry and alias forest
//!
//! Every declared variable becomes a root; Words, DWords and Bytes expand into
//! generated aliases whose addresses are derived mechanically from the parent:
//!
//! - Word  `W`  -> `W_LowByte`, `W_HighByte`, `W_LowBit0..7`, `W_HighBit0..7`
//! - DWord `D`  -> `D_LowWord`, `D_HighWord` (placed by word order), each expanded as a Word
//! - Byte  `B`  -> `B_Bit0..7`
//!
//! The forest is fixed at build time. Values are never stored here beyond a cached
//! copy used for change detection; the address space holds the bits.

use std::collections::{BTreeSet, HashMap};
use std::ops::Range;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use tracing::{debug, warn};

use crate::address::{AccessSize, Address, Area, WordOrder};
use crate::address_space::AddressSpace;
use crate::descriptor::{VarKind, VariableDescriptor};
use crate::error::{PlcError, Result};
use crate::value::Value;

/// Stable handle of a variable inside one registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(pub(crate) usize);

impl VarId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Position of a variable in the alias forest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AliasRole {
    /// Declared by a descriptor
    Declared,
    LowByte,
    HighByte,
    LowWord,
    HighWord,
    /// Bit of a declared Byte
    Bit(u8),
    LowBit(u8),
    HighBit(u8),
}

impl AliasRole {
    fn suffix(self) -> String {
        match self {
            AliasRole::Declared => String::new(),
            AliasRole::LowByte => "_LowByte".to_string(),
            AliasRole::HighByte => "_HighByte".to_string(),
            AliasRole::LowWord => "_LowWord".to_string(),
            AliasRole::HighWord => "_HighWord".to_string(),
            AliasRole::Bit(b) => format!("_Bit{}", b),
            AliasRole::LowBit(b) => format!("_LowBit{}", b),
            AliasRole::HighBit(b) => format!("_HighBit{}", b),
        }
    }
}

/// Named view over a range of address space bits
#[derive(Debug)]
pub struct Variable {
    id: VarId,
    name: String,
    kind: VarKind,
    address: Address,
    readonly: bool,
    role: AliasRole,
    parent: Option<VarId>,
    children: Vec<VarId>,
    description: String,
    initial_value: Option<u32>,
    cached: AtomicU32,
    version: AtomicU64,
}

impl Variable {
    pub fn id(&self) -> VarId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> VarKind {
        self.kind
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    pub fn role(&self) -> AliasRole {
        self.role
    }

    pub fn parent(&self) -> Option<VarId> {
        self.parent
    }

    pub fn children(&self) -> &[VarId] {
        &self.children
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn initial_value(&self) -> Option<u32> {
        self.initial_value
    }

    /// Last value observed by the sync engine
    pub fn cached(&self) -> Value {
        Value::from_raw(self.kind, self.cached.load(Ordering::Acquire))
    }

    /// Monotonic change counter
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Record a freshly resolved raw value; returns true and bumps the version if it changed
    pub(crate) fn observe(&self, raw: u32) -> bool {
        let previous = self.cached.swap(raw, Ordering::AcqRel);
        if previous != raw {
            self.version.fetch_add(1, Ordering::AcqRel);
            true
        } else {
            false
        }
    }

    /// Set the cache without recording a change
    pub(crate) fn prime(&self, raw: u32) {
        self.cached.store(raw, Ordering::Release);
    }

    /// Convert a tagged value into this variable's raw storage value
    pub fn encode(&self, value: &Value) -> Result<u32> {
        let raw: u64 = match (self.kind, value) {
            (VarKind::Flag, Value::Flag(b)) => u64::from(*b),
            (VarKind::Timer, Value::Time(_)) => value.as_u64(),
            (VarKind::Timer, Value::DWord(v)) => u64::from(*v),
            (
                VarKind::Byte | VarKind::Word | VarKind::DWord,
                Value::Byte(_) | Value::Word(_) | Value::DWord(_),
            ) => value.as_u64(),
            _ => {
                return Err(PlcError::type_mismatch(
                    &self.name,
                    self.kind.to_string(),
                    value.type_name(),
                ))
            },
        };
        let max = u64::from(self.kind.max_raw());
        if raw > max {
            return Err(PlcError::ValueOutOfRange {
                name: self.name.clone(),
                value: raw,
                max,
            });
        }
        Ok(raw as u32)
    }
}

/// All variables of one device, with lookup by name and by byte
#[derive(Debug)]
pub struct VariableRegistry {
    vars: Vec<Variable>,
    by_name: HashMap<String, VarId>,
    /// (area, byte offset) -> variables touching that byte
    by_byte: HashMap<(Area, usize), Vec<VarId>>,
    /// Declared names sharing one address, keyed by canonical address
    address_aliases: HashMap<String, Vec<String>>,
    word_order: WordOrder,
}

impl VariableRegistry {
    /// Build the alias forest for `descriptors`, checking every address against `space`
    pub fn build(
        descriptors: &[VariableDescriptor],
        word_order: WordOrder,
        space: &AddressSpace,
    ) -> Result<Self> {
        let mut registry = Self {
            vars: Vec::new(),
            by_name: HashMap::new(),
            by_byte: HashMap::new(),
            address_aliases: HashMap::new(),
            word_order,
        };
        let mut declared_at: HashMap<String, Vec<String>> = HashMap::new();

        for desc in descriptors {
            let address = registry.resolve_descriptor(desc)?;
            space.check(&address)?;

            let readonly = desc.readonly || desc.area.is_input();
            let root = registry.insert(
                desc.name.clone(),
                desc.kind,
                address,
                readonly,
                AliasRole::Declared,
                None,
                desc.description.clone(),
                desc.initial_value,
            )?;
            registry.expand(root, &desc.name, desc.kind, address, readonly)?;

            declared_at
                .entry(address.to_string())
                .or_default()
                .push(desc.name.clone());
        }

        for (key, names) in declared_at {
            if names.len() > 1 {
                warn!("Alias detected: address {} used by names {:?}", key, names);
                registry.address_aliases.insert(key, names);
            }
        }

        debug!(
            "Variable registry built: {} declared, {} total",
            descriptors.len(),
            registry.vars.len()
        );
        Ok(registry)
    }

    fn resolve_descriptor(&self, desc: &VariableDescriptor) -> Result<Address> {
        let expected = desc.kind.access_size();
        if desc.size != expected {
            return Err(PlcError::address(format!(
                "{}: type {} does not fit a {:?} address",
                desc.name, desc.kind, desc.size
            )));
        }
        let address = match (desc.size, desc.bit_index) {
            (AccessSize::Bit, Some(bit)) if bit <= 7 => Address::bit(desc.area, desc.offset, bit),
            (AccessSize::Bit, Some(bit)) => {
                return Err(PlcError::address(format!(
                    "{}: bit index {} out of range 0..=7",
                    desc.name, bit
                )))
            },
            (AccessSize::Bit, None) => {
                return Err(PlcError::address(format!("{}: missing bit index", desc.name)))
            },
            (_, Some(_)) => {
                return Err(PlcError::address(format!(
                    "{}: bit index on a non-bit address",
                    desc.name
                )))
            },
            (AccessSize::Byte, None) => Address::byte(desc.area, desc.offset),
            (AccessSize::Word, None) => Address::word(desc.area, desc.offset),
            (AccessSize::DWord, None) => Address::dword(desc.area, desc.offset, self.word_order),
        };
        Ok(address)
    }

    #[allow(clippy::too_many_arguments)]
    fn insert(
        &mut self,
        name: String,
        kind: VarKind,
        address: Address,
        readonly: bool,
        role: AliasRole,
        parent: Option<VarId>,
        description: String,
        initial_value: Option<u32>,
    ) -> Result<VarId> {
        if self.by_name.contains_key(&name) {
            return Err(PlcError::duplicate_name(name));
        }
        let id = VarId(self.vars.len());
        for offset in address.byte_range() {
            self.by_byte.entry((address.area, offset)).or_default().push(id);
        }
        if let Some(parent) = parent {
            self.vars[parent.0].children.push(id);
        }
        self.by_name.insert(name.clone(), id);
        self.vars.push(Variable {
            id,
            name,
            kind,
            address,
            readonly,
            role,
            parent,
            children: Vec::new(),
            description,
            initial_value,
            cached: AtomicU32::new(0),
            version: AtomicU64::new(0),
        });
        Ok(id)
    }

    fn alias(
        &mut self,
        parent: VarId,
        root_name: &str,
        role: AliasRole,
        kind: VarKind,
        address: Address,
        readonly: bool,
    ) -> Result<VarId> {
        self.insert(
            format!("{}{}", root_name, role.suffix()),
            kind,
            address,
            readonly,
            role,
            Some(parent),
            String::new(),
            None,
        )
    }

    fn expand(
        &mut self,
        id: VarId,
        name: &str,
        kind: VarKind,
        address: Address,
        readonly: bool,
    ) -> Result<()> {
        match kind {
            VarKind::Byte => {
                for bit in 0..8 {
                    let addr = Address::bit(address.area, address.offset, bit);
                    self.alias(id, name, AliasRole::Bit(bit), VarKind::Flag, addr, readonly)?;
                }
            },
            VarKind::Word => self.expand_word(id, name, address, readonly)?,
            VarKind::DWord => {
                let (lo, hi) = self.word_order.word_offsets();
                for (role, rel) in [(AliasRole::LowWord, lo), (AliasRole::HighWord, hi)] {
                    let addr = Address::word(address.area, address.offset + rel);
                    let word_id = self.alias(id, name, role, VarKind::Word, addr, readonly)?;
                    let word_name = format!("{}{}", name, role.suffix());
                    self.expand_word(word_id, &word_name, addr, readonly)?;
                }
            },
            VarKind::Flag | VarKind::Timer => {},
        }
        Ok(())
    }

    fn expand_word(
        &mut self,
        id: VarId,
        name: &str,
        address: Address,
        readonly: bool,
    ) -> Result<()> {
        let halves: [(AliasRole, usize, fn(u8) -> AliasRole); 2] = [
            (AliasRole::LowByte, address.offset, AliasRole::LowBit),
            (AliasRole::HighByte, address.offset + 1, AliasRole::HighBit),
        ];
        for (role, offset, bit_role) in halves {
            let byte_addr = Address::byte(address.area, offset);
            let byte_id = self.alias(id, name, role, VarKind::Byte, byte_addr, readonly)?;
            for bit in 0..8 {
                let addr = Address::bit(address.area, offset, bit);
                self.alias(byte_id, name, bit_role(bit), VarKind::Flag, addr, readonly)?;
            }
        }
        Ok(())
    }

    /// Resolve a name to its handle
    pub fn lookup(&self, name: &str) -> Result<VarId> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| PlcError::unknown_variable(name))
    }

    pub fn get(&self, id: VarId) -> Option<&Variable> {
        self.vars.get(id.0)
    }

    /// Variable by handle; handles come from this registry
    pub(crate) fn var(&self, id: VarId) -> Result<&Variable> {
        self.get(id)
            .ok_or_else(|| PlcError::unknown_variable(format!("#{}", id.0)))
    }

    pub fn by_name(&self, name: &str) -> Result<&Variable> {
        self.var(self.lookup(name)?)
    }

    /// Every variable whose bytes intersect `range` in `area`, in id order
    pub fn dependents(&self, area: Area, range: Range<usize>) -> Vec<VarId> {
        let mut ids = BTreeSet::new();
        for offset in range {
            if let Some(list) = self.by_byte.get(&(area, offset)) {
                ids.extend(list.iter().copied());
            }
        }
        ids.into_iter().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Variable> {
        self.vars.iter()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn word_order(&self) -> WordOrder {
        self.word_order
    }

    /// Declared names that share an address, keyed by address
    pub fn address_aliases(&self) -> &HashMap<String, Vec<String>> {
        &self.address_aliases
    }
}
