//! PLC addressing
//!
//! IEC 61131-3 style addresses (`%MW2`, `%MB6`, `%MX8.0`, `%MD0`, `%IX0.3`) and the
//! resolved byte-level [`Address`] used by the address space.
//!
//! Layout conventions:
//! - `%xBn` is byte `n`, `%xWn` covers bytes `2n..2n+1`, `%xDn` covers `4n..4n+3`
//! - inside a word the even byte holds bits 0-7 (LowByte), the odd byte bits 8-15
//! - the two words of a double word follow the configured [`WordOrder`]

use std::fmt;
use std::ops::Range;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{PlcError, Result};

/// PLC memory area
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Area {
    /// `%I` process inputs
    Input,
    /// `%Q` process outputs
    Output,
    /// `%M` marker memory
    Memory,
}

impl Area {
    pub const ALL: [Area; 3] = [Area::Input, Area::Output, Area::Memory];

    pub fn letter(self) -> char {
        match self {
            Area::Input => 'I',
            Area::Output => 'Q',
            Area::Memory => 'M',
        }
    }

    pub fn from_letter(c: char) -> Option<Self> {
        match c.to_ascii_uppercase() {
            'I' => Some(Area::Input),
            'Q' => Some(Area::Output),
            'M' => Some(Area::Memory),
            _ => None,
        }
    }

    /// Input variables are read-only unless a write is forced
    pub fn is_input(self) -> bool {
        self == Area::Input
    }
}

impl fmt::Display for Area {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

/// Access width of an address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AccessSize {
    Bit,
    Byte,
    Word,
    DWord,
}

impl AccessSize {
    pub fn letter(self) -> char {
        match self {
            AccessSize::Bit => 'X',
            AccessSize::Byte => 'B',
            AccessSize::Word => 'W',
            AccessSize::DWord => 'D',
        }
    }

    pub fn from_letter(c: char) -> Option<Self> {
        match c.to_ascii_uppercase() {
            'X' => Some(AccessSize::Bit),
            'B' => Some(AccessSize::Byte),
            'W' => Some(AccessSize::Word),
            'D' => Some(AccessSize::DWord),
            _ => None,
        }
    }

    /// Number of storage bytes touched by one access
    pub fn byte_len(self) -> usize {
        match self {
            AccessSize::Bit | AccessSize::Byte => 1,
            AccessSize::Word => 2,
            AccessSize::DWord => 4,
        }
    }

    /// Largest raw value representable at this width
    pub fn max_value(self) -> u32 {
        match self {
            AccessSize::Bit => 1,
            AccessSize::Byte => 0xFF,
            AccessSize::Word => 0xFFFF,
            AccessSize::DWord => u32::MAX,
        }
    }
}

/// Order of the two 16-bit words composing a double word
///
/// There is deliberately no `Default`: the order must be configured explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WordOrder {
    /// Word at the lower address holds bits 0-15 (little word order)
    #[serde(alias = "little")]
    LowWordFirst,
    /// Word at the lower address holds bits 16-31 (big word order)
    #[serde(alias = "big")]
    HighWordFirst,
}

impl WordOrder {
    /// Byte offsets (relative to the double word) of the (low, high) significance words
    pub fn word_offsets(self) -> (usize, usize) {
        match self {
            WordOrder::LowWordFirst => (0, 2),
            WordOrder::HighWordFirst => (2, 0),
        }
    }
}

/// Textual PLC address as written in declaration files, e.g. `%MW100` or `%IX0.3`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IecAddress {
    pub area: Area,
    pub size: AccessSize,
    /// Index in units of `size` (byte index for bits)
    pub index: u32,
    pub bit: Option<u8>,
}

fn address_pattern() -> Result<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^%?([IQMiqm])([XBWDxbwd])?(\d+)(?:\.(\d+))?$").ok())
        .as_ref()
        .ok_or_else(|| PlcError::address("address pattern failed to compile"))
}

impl IecAddress {
    pub fn new(area: Area, size: AccessSize, index: u32, bit: Option<u8>) -> Result<Self> {
        let addr = Self {
            area,
            size,
            index,
            bit,
        };
        addr.validate()?;
        Ok(addr)
    }

    fn validate(&self) -> Result<()> {
        match (self.size, self.bit) {
            (AccessSize::Bit, None) => Err(PlcError::address(format!(
                "{}: bit address requires a bit index",
                self
            ))),
            (AccessSize::Bit, Some(b)) if b > 7 => Err(PlcError::address(format!(
                "{}: bit index {} out of range 0..=7",
                self, b
            ))),
            (AccessSize::Bit, Some(_)) => Ok(()),
            (_, Some(_)) => Err(PlcError::address(format!(
                "{}: only X addresses carry a bit index",
                self
            ))),
            (_, None) => Ok(()),
        }
    }

    /// Byte offset of the first storage byte within the area
    pub fn byte_offset(&self) -> usize {
        self.index as usize * self.size.byte_len()
    }

    /// Canonical registry key without the `%` prefix (`MW100`, `MX8.0`)
    pub fn canonical_key(&self) -> String {
        match self.bit {
            Some(bit) => format!(
                "{}{}{}.{}",
                self.area.letter(),
                self.size.letter(),
                self.index,
                bit
            ),
            None => format!("{}{}{}", self.area.letter(), self.size.letter(), self.index),
        }
    }
}

impl FromStr for IecAddress {
    type Err = PlcError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let caps = address_pattern()?
            .captures(trimmed)
            .ok_or_else(|| PlcError::address(format!("malformed address '{}'", trimmed)))?;

        let area = caps
            .get(1)
            .and_then(|m| m.as_str().chars().next())
            .and_then(Area::from_letter)
            .ok_or_else(|| PlcError::address(format!("unknown area in '{}'", trimmed)))?;

        let bit = match caps.get(4) {
            Some(m) => Some(
                m.as_str()
                    .parse::<u8>()
                    .map_err(|_| PlcError::address(format!("invalid bit in '{}'", trimmed)))?,
            ),
            None => None,
        };

        // `%I0.3` is shorthand for `%IX0.3`
        let size = match caps.get(2).and_then(|m| m.as_str().chars().next()) {
            Some(c) => AccessSize::from_letter(c)
                .ok_or_else(|| PlcError::address(format!("unknown size in '{}'", trimmed)))?,
            None if bit.is_some() => AccessSize::Bit,
            None => AccessSize::Byte,
        };

        let index = caps
            .get(3)
            .map(|m| m.as_str())
            .unwrap_or_default()
            .parse::<u32>()
            .map_err(|_| PlcError::address(format!("invalid index in '{}'", trimmed)))?;

        Self::new(area, size, index, bit)
    }
}

impl fmt::Display for IecAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.canonical_key())
    }
}

/// Resolved storage location of a variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address {
    pub area: Area,
    /// Byte offset within the area
    pub offset: usize,
    pub size: AccessSize,
    pub bit: Option<u8>,
    /// Only set for double words
    pub word_order: Option<WordOrder>,
}

impl Address {
    pub fn bit(area: Area, offset: usize, bit: u8) -> Self {
        Self {
            area,
            offset,
            size: AccessSize::Bit,
            bit: Some(bit),
            word_order: None,
        }
    }

    pub fn byte(area: Area, offset: usize) -> Self {
        Self {
            area,
            offset,
            size: AccessSize::Byte,
            bit: None,
            word_order: None,
        }
    }

    pub fn word(area: Area, offset: usize) -> Self {
        Self {
            area,
            offset,
            size: AccessSize::Word,
            bit: None,
            word_order: None,
        }
    }

    pub fn dword(area: Area, offset: usize, order: WordOrder) -> Self {
        Self {
            area,
            offset,
            size: AccessSize::DWord,
            bit: None,
            word_order: Some(order),
        }
    }

    /// Resolve a textual address; `order` is applied to double words only
    pub fn resolve(iec: &IecAddress, order: WordOrder) -> Self {
        let offset = iec.byte_offset();
        match iec.size {
            AccessSize::Bit => Self::bit(iec.area, offset, iec.bit.unwrap_or(0)),
            AccessSize::Byte => Self::byte(iec.area, offset),
            AccessSize::Word => Self::word(iec.area, offset),
            AccessSize::DWord => Self::dword(iec.area, offset, order),
        }
    }

    pub fn byte_range(&self) -> Range<usize> {
        self.offset..self.offset + self.size.byte_len()
    }

    /// Covering 16-bit registers as (first register, register count)
    pub fn register_span(&self) -> (u32, u16) {
        let first = self.offset / 2;
        let last = (self.offset + self.size.byte_len() - 1) / 2;
        (first as u32, (last - first + 1) as u16)
    }

    /// Decode the raw value from `bytes`, whose first element is area byte `base`
    pub fn load(&self, bytes: &[u8], base: usize) -> Result<u32> {
        let window = self.window(bytes.len(), base)?;
        let data = &bytes[window];
        let raw = match self.size {
            AccessSize::Bit => u32::from((data[0] >> self.bit.unwrap_or(0)) & 1),
            AccessSize::Byte => u32::from(data[0]),
            AccessSize::Word => u32::from(u16::from_le_bytes([data[0], data[1]])),
            AccessSize::DWord => {
                let (lo, hi) = self.word_order_or_default().word_offsets();
                let low = u16::from_le_bytes([data[lo], data[lo + 1]]);
                let high = u16::from_le_bytes([data[hi], data[hi + 1]]);
                (u32::from(high) << 16) | u32::from(low)
            },
        };
        Ok(raw)
    }

    /// Encode `raw` into `bytes`, whose first element is area byte `base`
    ///
    /// Bits outside the addressed range are left untouched.
    pub fn store(&self, bytes: &mut [u8], base: usize, raw: u32) -> Result<()> {
        let window = self.window(bytes.len(), base)?;
        let data = &mut bytes[window];
        match self.size {
            AccessSize::Bit => {
                let mask = 1u8 << self.bit.unwrap_or(0);
                if raw & 1 == 1 {
                    data[0] |= mask;
                } else {
                    data[0] &= !mask;
                }
            },
            AccessSize::Byte => data[0] = raw as u8,
            AccessSize::Word => data.copy_from_slice(&(raw as u16).to_le_bytes()),
            AccessSize::DWord => {
                let (lo, hi) = self.word_order_or_default().word_offsets();
                data[lo..lo + 2].copy_from_slice(&(raw as u16).to_le_bytes());
                data[hi..hi + 2].copy_from_slice(&((raw >> 16) as u16).to_le_bytes());
            },
        }
        Ok(())
    }

    fn word_order_or_default(&self) -> WordOrder {
        // Double words are always resolved with an explicit order; see `Address::dword`
        self.word_order.unwrap_or(WordOrder::LowWordFirst)
    }

    fn window(&self, len: usize, base: usize) -> Result<Range<usize>> {
        let range = self.byte_range();
        if range.start < base || range.end > base + len {
            return Err(PlcError::address(format!(
                "{} bytes {}..{} outside buffer {}..{}",
                self.area,
                range.start,
                range.end,
                base,
                base + len
            )));
        }
        Ok(range.start - base..range.end - base)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.bit {
            Some(bit) => write!(f, "{}@{}.{}", self.area, self.offset, bit),
            None => write!(f, "{}@{}:{}", self.area, self.offset, self.size.letter()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_parse_word_address() {
        let addr: IecAddress = "%MW100".parse().unwrap();
        assert_eq!(addr.area, Area::Memory);
        assert_eq!(addr.size, AccessSize::Word);
        assert_eq!(addr.index, 100);
        assert_eq!(addr.byte_offset(), 200);
        assert_eq!(addr.canonical_key(), "MW100");
    }

    #[test]
    fn test_parse_bit_address() {
        let addr: IecAddress = "%IX0.3".parse().unwrap();
        assert_eq!(addr.area, Area::Input);
        assert_eq!(addr.size, AccessSize::Bit);
        assert_eq!(addr.bit, Some(3));
        assert_eq!(addr.to_string(), "%IX0.3");

        let short: IecAddress = "%I0.3".parse().unwrap();
        assert_eq!(short, addr);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!("%ZW1".parse::<IecAddress>().is_err());
        assert!("%MX8".parse::<IecAddress>().is_err());
        assert!("%MX8.8".parse::<IecAddress>().is_err());
        assert!("%MW2.1".parse::<IecAddress>().is_err());
        assert!("MW".parse::<IecAddress>().is_err());
    }

    #[test]
    fn test_dword_byte_offset() {
        let addr: IecAddress = "%MD1".parse().unwrap();
        assert_eq!(addr.byte_offset(), 4);
    }

    #[test]
    fn test_register_span() {
        assert_eq!(Address::word(Area::Memory, 4).register_span(), (2, 1));
        assert_eq!(Address::byte(Area::Memory, 5).register_span(), (2, 1));
        assert_eq!(Address::bit(Area::Memory, 8, 0).register_span(), (4, 1));
        assert_eq!(
            Address::dword(Area::Memory, 4, WordOrder::LowWordFirst).register_span(),
            (2, 2)
        );
    }

    #[test]
    fn test_word_load_store_little_endian_bytes() {
        let addr = Address::word(Area::Memory, 2);
        let mut bytes = [0u8; 4];
        addr.store(&mut bytes, 0, 0xABCD).unwrap();
        assert_eq!(bytes, [0, 0, 0xCD, 0xAB]);
        assert_eq!(addr.load(&bytes, 0).unwrap(), 0xABCD);
    }

    #[test]
    fn test_dword_word_order() {
        let mut low_first = [0u8; 4];
        Address::dword(Area::Memory, 0, WordOrder::LowWordFirst)
            .store(&mut low_first, 0, 0x1234_5678)
            .unwrap();
        assert_eq!(low_first, [0x78, 0x56, 0x34, 0x12]);

        let mut high_first = [0u8; 4];
        let addr = Address::dword(Area::Memory, 0, WordOrder::HighWordFirst);
        addr.store(&mut high_first, 0, 0x1234_5678).unwrap();
        assert_eq!(high_first, [0x34, 0x12, 0x78, 0x56]);
        assert_eq!(addr.load(&high_first, 0).unwrap(), 0x1234_5678);
    }

    #[test]
    fn test_bit_store_preserves_neighbours() {
        let addr = Address::bit(Area::Memory, 0, 3);
        let mut bytes = [0b1010_0001u8];
        addr.store(&mut bytes, 0, 1).unwrap();
        assert_eq!(bytes[0], 0b1010_1001);
        addr.store(&mut bytes, 0, 0).unwrap();
        assert_eq!(bytes[0], 0b1010_0001);
    }

    #[test]
    fn test_load_with_base_offset() {
        let addr = Address::byte(Area::Memory, 5);
        let bytes = [0x11, 0x22];
        assert_eq!(addr.load(&bytes, 4).unwrap(), 0x22);
        assert!(addr.load(&bytes, 6).is_err());
    }

    #[test]
    fn test_word_order_deserialize_aliases() {
        use figment::providers::{Format, Yaml};

        #[derive(Deserialize)]
        struct Holder {
            order: WordOrder,
        }

        let h: Holder = figment::Figment::from(Yaml::string("order: big"))
            .extract()
            .unwrap();
        assert_eq!(h.order, WordOrder::HighWordFirst);

        let h: Holder = figment::Figment::from(Yaml::string("order: low_word_first"))
            .extract()
            .unwrap();
        assert_eq!(h.order, WordOrder::LowWordFirst);
    }
}
