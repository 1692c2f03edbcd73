//! Tagged variable values

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::descriptor::VarKind;

/// Value of a PLC variable
///
/// Raw storage is always an unsigned integer of the variable's width; the
/// variant carries the interpretation. Timers are millisecond counts in a DWord.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Value {
    Flag(bool),
    Byte(u8),
    Word(u16),
    DWord(u32),
    Time(Duration),
}

impl Value {
    /// Interpret a raw storage value for a variable of `kind`
    pub fn from_raw(kind: VarKind, raw: u32) -> Self {
        match kind {
            VarKind::Flag => Value::Flag(raw & 1 == 1),
            VarKind::Byte => Value::Byte(raw as u8),
            VarKind::Word => Value::Word(raw as u16),
            VarKind::DWord => Value::DWord(raw),
            VarKind::Timer => Value::Time(Duration::from_millis(u64::from(raw))),
        }
    }

    /// Raw numeric payload, widened
    pub fn as_u64(&self) -> u64 {
        match *self {
            Value::Flag(b) => u64::from(b),
            Value::Byte(v) => u64::from(v),
            Value::Word(v) => u64::from(v),
            Value::DWord(v) => u64::from(v),
            // saturates so an oversized duration fails range checks
            Value::Time(d) => u64::try_from(d.as_millis()).unwrap_or(u64::MAX),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Flag(_) => "Flag",
            Value::Byte(_) => "Byte",
            Value::Word(_) => "Word",
            Value::DWord(_) => "DWord",
            Value::Time(_) => "Time",
        }
    }

    pub fn as_flag(&self) -> Option<bool> {
        match *self {
            Value::Flag(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_byte(&self) -> Option<u8> {
        match *self {
            Value::Byte(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_word(&self) -> Option<u16> {
        match *self {
            Value::Word(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_dword(&self) -> Option<u32> {
        match *self {
            Value::DWord(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_time(&self) -> Option<Duration> {
        match *self {
            Value::Time(d) => Some(d),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Flag(v)
    }
}

impl From<u8> for Value {
    fn from(v: u8) -> Self {
        Value::Byte(v)
    }
}

impl From<u16> for Value {
    fn from(v: u16) -> Self {
        Value::Word(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::DWord(v)
    }
}

impl From<Duration> for Value {
    fn from(v: Duration) -> Self {
        Value::Time(v)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Flag(b) => write!(f, "{}", if *b { "TRUE" } else { "FALSE" }),
            Value::Byte(v) => write!(f, "16#{:02X}", v),
            Value::Word(v) => write!(f, "16#{:04X}", v),
            Value::DWord(v) => write!(f, "16#{:08X}", v),
            Value::Time(d) => write!(f, "T#{}ms", d.as_millis()),
        }
    }
}
