//! COIL Object Format: the sectioned little-endian container holding one
//! encoded module. The layout is a 16-byte header, a section table of
//! `{type, offset, size}` entries, then section data at the recorded
//! offsets.

pub mod insn;
pub mod read;
pub mod write;

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::diag::{Code, Diagnostic, Severity};

pub use read::read_module;
pub use write::write_module;

pub const COF_MAGIC: [u8; 4] = *b"COIL";
pub const HEADER_SIZE: u32 = 16;
pub const SECTION_ENTRY_SIZE: u32 = 12;

/// Destination byte meaning "no destination register".
pub const DEST_NONE: u8 = 0xFF;

/// Memory-operand index byte meaning "no index register".
pub const INDEX_NONE: u8 = 0xFF;

pub const FUNC_VARIADIC: u8 = 0x01;
pub const FUNC_EXTERNAL: u8 = 0x02;

pub const GLOBAL_CONSTANT: u8 = 0x01;
pub const GLOBAL_EXTERNAL: u8 = 0x02;
pub const GLOBAL_HAS_INIT: u8 = 0x04;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum SectionKind {
    Header = 0,
    Type = 1,
    Function = 2,
    Global = 3,
    Constant = 4,
    Code = 5,
    Relocation = 6,
    Metadata = 7,
}

/// Kind byte prefixed to every encoded source operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum OperandTag {
    Register = 1,
    Immediate = 2,
    Block = 3,
    Function = 4,
    Global = 5,
    Memory = 6,
}

/// Category byte of a composite entry in the type section. Primitive types
/// have fixed ids and are never written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum TypeCategory {
    Pointer = 1,
    Vector = 2,
    Array = 3,
    Struct = 4,
    Function = 5,
}

/// Failure while reading or writing a container. Every variant maps to one
/// binary-category diagnostic code; the stage boundary does the mapping so
/// internal code can use `?`.
#[derive(Debug)]
pub enum CofError {
    InvalidFormat(String),
    UnsupportedVersion(String),
    Corrupt(String),
    MissingSection(String),
    /// Encodings reserved for a future version, e.g. immediates wider than
    /// 24 bits.
    Unsupported(String),
    Io(std::io::Error),
}

impl std::fmt::Display for CofError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CofError::InvalidFormat(msg) => write!(f, "invalid COF file: {msg}"),
            CofError::UnsupportedVersion(msg) => write!(f, "unsupported COF version: {msg}"),
            CofError::Corrupt(msg) => write!(f, "corrupt COF file: {msg}"),
            CofError::MissingSection(msg) => write!(f, "missing COF section: {msg}"),
            CofError::Unsupported(msg) => write!(f, "unsupported encoding: {msg}"),
            CofError::Io(err) => write!(f, "i/o failure: {err}"),
        }
    }
}

impl std::error::Error for CofError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CofError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for CofError {
    fn from(err: std::io::Error) -> Self {
        CofError::Io(err)
    }
}

impl From<anyhow::Error> for CofError {
    fn from(err: anyhow::Error) -> Self {
        // reader helpers fail on truncated input, which is corruption from
        // the container's point of view
        CofError::Corrupt(err.to_string())
    }
}

impl CofError {
    pub fn code(&self) -> Code {
        match self {
            CofError::InvalidFormat(_) => Code::BinaryInvalidFormat,
            CofError::UnsupportedVersion(_) => Code::BinaryUnsupportedVersion,
            CofError::Corrupt(_) => Code::BinaryCorrupt,
            CofError::MissingSection(_) => Code::BinaryMissingSection,
            CofError::Unsupported(_) => Code::CodegenUnsupported,
            CofError::Io(_) => Code::SystemIo,
        }
    }

    pub fn into_diagnostic(self) -> Diagnostic {
        Diagnostic::new(Severity::Error, self.code(), self.to_string(), None)
    }
}

/// The metadata section: module name at offset 0, the target-requirement
/// block, then the string table every other section indexes into.
#[derive(Debug, Clone)]
pub struct Metadata {
    bytes: Vec<u8>,
}

impl Metadata {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// NUL-terminated string at the given byte offset.
    pub fn string_at(&self, offset: u32) -> Result<String, CofError> {
        let start = offset as usize;
        if start >= self.bytes.len() {
            return Err(CofError::Corrupt(format!(
                "string offset {offset:#x} is outside the metadata section"
            )));
        }
        let rest = &self.bytes[start..];
        let Some(end) = rest.iter().position(|&b| b == 0) else {
            return Err(CofError::Corrupt(format!(
                "unterminated string at metadata offset {offset:#x}"
            )));
        };
        Ok(String::from_utf8_lossy(&rest[..end]).into_owned())
    }
}
