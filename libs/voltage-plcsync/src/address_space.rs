//! Raw PLC memory image
//!
//! One authoritative byte array per area, each behind its own lock so that
//! unrelated areas can be mutated concurrently. Mutable access is crate-private:
//! the sync engine is the only writer.

use std::collections::HashMap;
use std::ops::Range;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::address::{Address, Area, WordOrder};
use crate::config::RegionSizes;
use crate::error::{PlcError, Result};

/// Byte image of a single memory area
#[derive(Debug, Clone)]
pub struct RegionMemory {
    area: Area,
    bytes: Vec<u8>,
}

impl RegionMemory {
    pub fn new(area: Area, size: usize) -> Self {
        Self {
            area,
            bytes: vec![0; size],
        }
    }

    pub fn area(&self) -> Area {
        self.area
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn check(&self, range: Range<usize>) -> Result<()> {
        if range.end > self.bytes.len() {
            return Err(PlcError::address(format!(
                "%{} bytes {}..{} exceed region size {}",
                self.area,
                range.start,
                range.end,
                self.bytes.len()
            )));
        }
        Ok(())
    }

    pub fn get_bit(&self, offset: usize, bit: u8) -> Result<bool> {
        Ok(self.load(&Address::bit(self.area, offset, bit))? == 1)
    }

    pub fn set_bit(&mut self, offset: usize, bit: u8, value: bool) -> Result<()> {
        self.store(&Address::bit(self.area, offset, bit), u32::from(value))
    }

    pub fn get_byte(&self, offset: usize) -> Result<u8> {
        Ok(self.load(&Address::byte(self.area, offset))? as u8)
    }

    pub fn set_byte(&mut self, offset: usize, value: u8) -> Result<()> {
        self.store(&Address::byte(self.area, offset), u32::from(value))
    }

    pub fn get_word(&self, offset: usize) -> Result<u16> {
        Ok(self.load(&Address::word(self.area, offset))? as u16)
    }

    pub fn set_word(&mut self, offset: usize, value: u16) -> Result<()> {
        self.store(&Address::word(self.area, offset), u32::from(value))
    }

    pub fn get_dword(&self, offset: usize, order: WordOrder) -> Result<u32> {
        self.load(&Address::dword(self.area, offset, order))
    }

    pub fn set_dword(&mut self, offset: usize, order: WordOrder, value: u32) -> Result<()> {
        self.store(&Address::dword(self.area, offset, order), value)
    }

    /// Resolve the raw value at `addr`
    pub fn load(&self, addr: &Address) -> Result<u32> {
        self.check(addr.byte_range())?;
        addr.load(&self.bytes, 0)
    }

    /// Write the raw value at `addr`, leaving every other bit untouched
    pub fn store(&mut self, addr: &Address, raw: u32) -> Result<()> {
        self.check(addr.byte_range())?;
        addr.store(&mut self.bytes, 0, raw)
    }

    pub fn slice(&self, range: Range<usize>) -> Result<&[u8]> {
        self.check(range.clone())?;
        Ok(&self.bytes[range])
    }
}

/// PLC memory image, one lock per area
#[derive(Debug)]
pub struct AddressSpace {
    regions: HashMap<Area, RwLock<RegionMemory>>,
}

impl AddressSpace {
    pub fn new(sizes: &RegionSizes) -> Self {
        let regions = Area::ALL
            .iter()
            .map(|&area| (area, RwLock::new(RegionMemory::new(area, sizes.size(area)))))
            .collect();
        Self { regions }
    }

    fn region(&self, area: Area) -> Result<&RwLock<RegionMemory>> {
        self.regions
            .get(&area)
            .ok_or_else(|| PlcError::address(format!("area %{} not configured", area)))
    }

    /// Declared size of an area in bytes
    pub fn region_size(&self, area: Area) -> usize {
        self.regions.get(&area).map_or(0, |r| r.read().len())
    }

    /// Bounds check without touching data
    pub fn check(&self, addr: &Address) -> Result<()> {
        let size = self.region_size(addr.area);
        let range = addr.byte_range();
        if range.end > size {
            return Err(PlcError::address(format!(
                "{} exceeds %{} region of {} bytes",
                addr, addr.area, size
            )));
        }
        Ok(())
    }

    /// Shared access to one area
    pub fn read(&self, area: Area) -> Result<RwLockReadGuard<'_, RegionMemory>> {
        Ok(self.region(area)?.read())
    }

    /// Exclusive access to one area; held for a whole propagation pass
    pub(crate) fn write(&self, area: Area) -> Result<RwLockWriteGuard<'_, RegionMemory>> {
        Ok(self.region(area)?.write())
    }

    pub fn get_bit(&self, area: Area, offset: usize, bit: u8) -> Result<bool> {
        self.read(area)?.get_bit(offset, bit)
    }

    pub fn get_byte(&self, area: Area, offset: usize) -> Result<u8> {
        self.read(area)?.get_byte(offset)
    }

    pub fn get_word(&self, area: Area, offset: usize) -> Result<u16> {
        self.read(area)?.get_word(offset)
    }

    pub fn get_dword(&self, area: Area, offset: usize, order: WordOrder) -> Result<u32> {
        self.read(area)?.get_dword(offset, order)
    }

    pub fn load(&self, addr: &Address) -> Result<u32> {
        self.read(addr.area)?.load(addr)
    }

    /// Copy of an area image, mostly for diagnostics
    pub fn snapshot(&self, area: Area) -> Result<Vec<u8>> {
        Ok(self.read(area)?.as_bytes().to_vec())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn sizes() -> RegionSizes {
        RegionSizes {
            input: 4,
            output: 4,
            memory: 16,
        }
    }

    #[test]
    fn test_region_sizes() {
        let space = AddressSpace::new(&sizes());
        assert_eq!(space.region_size(Area::Input), 4);
        assert_eq!(space.region_size(Area::Memory), 16);
    }

    #[test]
    fn test_word_byte_bit_share_storage() {
        let mut mem = RegionMemory::new(Area::Memory, 8);
        mem.set_word(4, 0x8001).unwrap();
        assert_eq!(mem.get_byte(4).unwrap(), 0x01);
        assert_eq!(mem.get_byte(5).unwrap(), 0x80);
        assert!(mem.get_bit(4, 0).unwrap());
        assert!(mem.get_bit(5, 7).unwrap());
        assert!(!mem.get_bit(4, 1).unwrap());

        mem.set_bit(5, 7, false).unwrap();
        assert_eq!(mem.get_word(4).unwrap(), 0x0001);
    }

    #[test]
    fn test_out_of_range_access_fails() {
        let mut mem = RegionMemory::new(Area::Memory, 4);
        assert!(matches!(mem.get_word(3), Err(PlcError::Address(_))));
        assert!(matches!(mem.set_byte(4, 1), Err(PlcError::Address(_))));
        assert!(mem.get_dword(0, WordOrder::LowWordFirst).is_ok());
        assert!(mem.get_dword(2, WordOrder::LowWordFirst).is_err());
    }

    #[test]
    fn test_space_check_bounds() {
        let space = AddressSpace::new(&sizes());
        assert!(space.check(&Address::word(Area::Input, 2)).is_ok());
        assert!(space.check(&Address::word(Area::Input, 3)).is_err());
        assert!(space.check(&Address::bit(Area::Output, 3, 7)).is_ok());
    }

    #[test]
    fn test_write_guard_visible_to_readers() {
        let space = AddressSpace::new(&sizes());
        {
            let mut guard = space.write(Area::Memory).unwrap();
            guard.set_dword(0, WordOrder::HighWordFirst, 0xDEAD_BEEF).unwrap();
        }
        assert_eq!(
            space.get_dword(Area::Memory, 0, WordOrder::HighWordFirst).unwrap(),
            0xDEAD_BEEF
        );
        assert_eq!(space.get_word(Area::Memory, 0).unwrap(), 0xDEAD);
        assert_eq!(space.snapshot(Area::Memory).unwrap().len(), 16);
    }
}
