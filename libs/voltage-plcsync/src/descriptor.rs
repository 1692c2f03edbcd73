//! Variable descriptors and the declaration file parser
//!
//! Declarations follow the PLC variable file format:
//!
//! ```text
//! // comment lines are skipped
//! Speed      AT %MW2  : WORD := 100;   // motor speed
//! Status     AT %MB6  : BYTE;          // status byte (RO)
//! Running    AT %MX8.0 : BOOL;
//! Counter    AT %MD1  : DWORD := 16#FFFF;
//! Delay      AT %MD2  : TIME := T#500ms;
//! ```
//!
//! `RO`, `read-only` and `readonly` in the trailing comment mark the variable
//! read-only. `:=` values seed the address space at build time.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::address::{AccessSize, Area, IecAddress};
use crate::error::{PlcError, Result};

/// Declared type of a variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VarKind {
    Flag,
    Byte,
    Word,
    DWord,
    /// Millisecond count stored in a double word
    Timer,
}

impl VarKind {
    /// Access size a variable of this kind occupies
    pub fn access_size(self) -> AccessSize {
        match self {
            VarKind::Flag => AccessSize::Bit,
            VarKind::Byte => AccessSize::Byte,
            VarKind::Word => AccessSize::Word,
            VarKind::DWord | VarKind::Timer => AccessSize::DWord,
        }
    }

    pub fn max_raw(self) -> u32 {
        self.access_size().max_value()
    }

    /// Map an IEC type name; `None` for names this crate does not know
    pub fn from_type_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "BOOL" | "BIT" => Some(VarKind::Flag),
            "BYTE" | "USINT" | "SINT" => Some(VarKind::Byte),
            "WORD" | "INT" | "UINT" => Some(VarKind::Word),
            "DWORD" | "DINT" | "UDINT" => Some(VarKind::DWord),
            "TIME" => Some(VarKind::Timer),
            _ => None,
        }
    }
}

impl fmt::Display for VarKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VarKind::Flag => "Flag",
            VarKind::Byte => "Byte",
            VarKind::Word => "Word",
            VarKind::DWord => "DWord",
            VarKind::Timer => "Timer",
        };
        f.write_str(s)
    }
}

impl FromStr for VarKind {
    type Err = PlcError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_type_name(s)
            .ok_or_else(|| PlcError::config(format!("unknown variable type '{}'", s)))
    }
}

/// Declared PLC variable, input to the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableDescriptor {
    pub name: String,
    pub area: Area,
    /// Access size implied by the address letter
    pub size: AccessSize,
    /// Byte offset within the area
    pub offset: usize,
    pub bit_index: Option<u8>,
    pub kind: VarKind,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default)]
    pub initial_value: Option<u32>,
    #[serde(default)]
    pub description: String,
}

impl VariableDescriptor {
    /// Descriptor whose access size follows from `kind`
    pub fn new(
        name: impl Into<String>,
        area: Area,
        offset: usize,
        bit_index: Option<u8>,
        kind: VarKind,
    ) -> Self {
        Self {
            name: name.into(),
            area,
            size: kind.access_size(),
            offset,
            bit_index,
            kind,
            readonly: false,
            initial_value: None,
            description: String::new(),
        }
    }

    /// Descriptor from a parsed IEC address; the address letter decides the size
    pub fn from_address(name: impl Into<String>, addr: &IecAddress, kind: VarKind) -> Self {
        Self {
            name: name.into(),
            area: addr.area,
            size: addr.size,
            offset: addr.byte_offset(),
            bit_index: addr.bit,
            kind,
            readonly: false,
            initial_value: None,
            description: String::new(),
        }
    }

    pub fn readonly(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }

    pub fn with_initial(mut self, raw: u32) -> Self {
        self.initial_value = Some(raw);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

fn declaration_pattern() -> Result<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(concat!(
                r"^([A-Za-z_][A-Za-z0-9_]*)",
                r"\s+AT\s+(%?[A-Za-z]{1,2}[0-9]+(?:\.[0-9]+)?)",
                r"\s*:\s*([A-Za-z_][A-Za-z0-9_]*)$",
            ))
            .ok()
        })
        .as_ref()
        .ok_or_else(|| PlcError::config("declaration pattern failed to compile"))
}

fn is_readonly_comment(comment: &str) -> bool {
    let lower = comment.to_ascii_lowercase();
    if lower.contains("read-only") || lower.contains("readonly") {
        return true;
    }
    lower
        .split(|c: char| !c.is_ascii_alphanumeric())
        .any(|token| token == "ro")
}

/// Parse an IEC literal: decimal, `16#`/`8#`/`2#` radix, `TRUE`/`FALSE`, `T#..ms|s`
fn parse_literal(text: &str) -> Option<u32> {
    let text = text.trim().replace('_', "");
    let upper = text.to_ascii_uppercase();
    match upper.as_str() {
        "TRUE" => return Some(1),
        "FALSE" => return Some(0),
        _ => {},
    }
    if let Some(time) = upper.strip_prefix("T#").or_else(|| upper.strip_prefix("TIME#")) {
        if let Some(ms) = time.strip_suffix("MS") {
            return ms.parse().ok();
        }
        if let Some(s) = time.strip_suffix('S') {
            return s.parse::<u32>().ok()?.checked_mul(1000);
        }
        return None;
    }
    if let Some((radix, digits)) = upper.split_once('#') {
        let radix = radix.parse::<u32>().ok()?;
        if !matches!(radix, 2 | 8 | 16) {
            return None;
        }
        return u32::from_str_radix(digits, radix).ok();
    }
    upper.parse().ok()
}

fn parse_line(line_no: usize, line: &str) -> Result<Option<VariableDescriptor>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with("//") {
        return Ok(None);
    }

    let (code, comment) = match line.split_once("//") {
        Some((code, comment)) => (code, comment.trim()),
        None => (line, ""),
    };
    let code = code.trim().trim_end_matches(';').trim();

    let (decl, initial) = match code.split_once(":=") {
        Some((decl, init)) => (decl.trim(), Some(init.trim())),
        None => (code, None),
    };

    let caps = declaration_pattern()?
        .captures(decl)
        .ok_or_else(|| {
            PlcError::parse(
                line_no,
                format!("expected 'Name AT %ADDR : TYPE', got '{}'", decl),
            )
        })?;
    let name = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
    let addr_text = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
    let type_text = caps.get(3).map(|m| m.as_str()).unwrap_or_default();

    let addr: IecAddress = addr_text
        .parse()
        .map_err(|e: PlcError| PlcError::parse(line_no, e.to_string()))?;

    let kind = match VarKind::from_type_name(type_text) {
        Some(kind) => kind,
        None => {
            warn!(
                "Unsupported type {} for {} (line {}), defaulting to Word",
                type_text, name, line_no
            );
            VarKind::Word
        },
    };

    let mut desc = VariableDescriptor::from_address(name, &addr, kind)
        .readonly(is_readonly_comment(comment))
        .with_description(comment);

    if let Some(text) = initial {
        let raw = parse_literal(text)
            .ok_or_else(|| PlcError::parse(line_no, format!("invalid initial value '{}'", text)))?;
        if raw > kind.max_raw() {
            return Err(PlcError::parse(
                line_no,
                format!("initial value {} does not fit {} {}", raw, kind, name),
            ));
        }
        desc = desc.with_initial(raw);
    }

    Ok(Some(desc))
}

/// Parse a declaration file body into descriptors, in declaration order
pub fn parse_declarations(text: &str) -> Result<Vec<VariableDescriptor>> {
    let mut out = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        if let Some(desc) = parse_line(idx + 1, line)? {
            out.push(desc);
        }
    }
    debug!("Parsed {} variable declarations", out.len());
    Ok(out)
}

/// Read and parse a declaration file
pub fn load_declarations(path: impl AsRef<Path>) -> Result<Vec<VariableDescriptor>> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|e| {
        PlcError::config(format!(
            "failed to read declarations {}: {}",
            path.display(),
            e
        ))
    })?;
    parse_declarations(&text)
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    const SAMPLE: &str = r"
// Process image
Speed    AT %MW2   : WORD := 100;  // motor speed
Status   AT %MB6   : BYTE;         // status byte (RO)
Running  AT %MX8.0 : BOOL := TRUE;
Counter  AT %MD1   : DWORD := 16#FFFF;
Delay    AT %MD2   : TIME := T#2s;
Sensor   AT %IX0.3 : BOOL;
";

    #[test]
    fn test_parse_sample() {
        let decls = parse_declarations(SAMPLE).unwrap();
        assert_eq!(decls.len(), 6);

        let speed = &decls[0];
        assert_eq!(speed.name, "Speed");
        assert_eq!(speed.kind, VarKind::Word);
        assert_eq!(speed.offset, 4);
        assert_eq!(speed.initial_value, Some(100));
        assert_eq!(speed.description, "motor speed");
        assert!(!speed.readonly);

        assert!(decls[1].readonly);
        assert_eq!(decls[2].bit_index, Some(0));
        assert_eq!(decls[2].initial_value, Some(1));
        assert_eq!(decls[3].offset, 4);
        assert_eq!(decls[3].initial_value, Some(0xFFFF));
        assert_eq!(decls[4].kind, VarKind::Timer);
        assert_eq!(decls[4].initial_value, Some(2000));
        assert_eq!(decls[5].area, Area::Input);
    }

    #[test]
    fn test_unknown_type_falls_back_to_word() {
        let decls = parse_declarations("Temp AT %MW10 : REAL;").unwrap();
        assert_eq!(decls[0].kind, VarKind::Word);
    }

    #[test]
    fn test_malformed_line_reports_line_number() {
        let err = parse_declarations("\nA AT %MW1 : WORD;\nbroken line here\n").unwrap_err();
        assert!(matches!(err, PlcError::Parse { line: 3, .. }));
    }

    #[test]
    fn test_bad_address_is_parse_error() {
        let err = parse_declarations("A AT %MX1.9 : BOOL;").unwrap_err();
        assert!(matches!(err, PlcError::Parse { line: 1, .. }));
    }

    #[test]
    fn test_initial_value_range() {
        assert!(parse_declarations("B AT %MB1 : BYTE := 256;").is_err());
        assert!(parse_declarations("B AT %MB1 : BYTE := 2#1010;").is_ok());
        assert!(parse_declarations("B AT %MB1 : BYTE := abc;").is_err());
    }

    #[test]
    fn test_readonly_markers() {
        assert!(is_readonly_comment("limit (RO)"));
        assert!(is_readonly_comment("Read-Only value"));
        assert!(is_readonly_comment("readonly"));
        assert!(!is_readonly_comment("rotor speed"));
    }

    #[test]
    fn test_literals() {
        assert_eq!(parse_literal("16#00FF"), Some(255));
        assert_eq!(parse_literal("1_000"), Some(1000));
        assert_eq!(parse_literal("T#250ms"), Some(250));
        assert_eq!(parse_literal("FALSE"), Some(0));
        assert_eq!(parse_literal("3#12"), None);
    }

    #[test]
    fn test_load_declarations_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vars.txt");
        std::fs::write(&path, SAMPLE).unwrap();
        assert_eq!(load_declarations(&path).unwrap().len(), 6);
        assert!(load_declarations(dir.path().join("missing.txt")).is_err());
    }
}
