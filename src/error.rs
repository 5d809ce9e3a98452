//! Error types for IR parsing, code generation, and Mach-O reading.
//!
//! Internal invariants (mis-computed offsets, out-of-domain instruction
//! immediates, image-size mismatches) are programming errors and abort via
//! `assert!` with file/line context; only user-facing failures flow through
//! this enum.

use std::path::PathBuf;

use thiserror::Error;

/// The main error type for emit and read operations.
#[derive(Error, Debug)]
pub enum Error {
    // ==================== I/O Errors ====================
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to read file '{path}': {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write output file '{path}': {source}")]
    FileWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ==================== IR Errors ====================
    #[error("IR parse error: {reason} in line: {line:?}")]
    IrParse { line: String, reason: String },

    #[error("IR program has no string globals")]
    NoGlobals,

    #[error("IR program has no operations in @main")]
    NoOperations,

    #[error("helper @{helper} has an empty body")]
    EmptyHelperBody { helper: &'static str },

    #[error("helper @{helper} body is missing expected {expected}")]
    HelperShape {
        helper: &'static str,
        expected: &'static str,
    },

    // ==================== Code Generation Errors ====================
    #[error("global @{symbol} is not defined")]
    UndefinedGlobal { symbol: String },

    #[error("write length {len} exceeds @{symbol} ({available} bytes)")]
    WriteOutOfBounds {
        symbol: String,
        len: i64,
        available: usize,
    },

    #[error("operand {value} does not fit in 16 bits")]
    OperandOutOfRange { value: i64 },

    #[error("no exit operation lowered")]
    MissingExit,

    #[error("program uses @print_i64 but defines no @nl global")]
    MissingNewlineGlobal,

    // ==================== Mach-O Errors ====================
    #[error("invalid Mach-O magic: {0:#x}")]
    InvalidMachoMagic(u32),

    #[error("unsupported CPU type: {0:#x} (expected ARM64)")]
    UnsupportedCpuType(u32),

    #[error("load command at offset {offset:#x} extends beyond buffer")]
    LoadCommandOverflow { offset: usize },

    #[error("parse error at offset {offset:#x}: {reason}")]
    Parse { offset: usize, reason: String },

    #[error("buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    #[error("section '{segment},{section}' not found")]
    SectionNotFound { segment: String, section: String },
}

/// A specialized Result type for machforge operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates an IR parse error for the offending line.
    #[inline]
    pub fn ir_parse(line: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::IrParse {
            line: line.into(),
            reason: reason.into(),
        }
    }

    /// Creates a parse error with a formatted message.
    #[inline]
    pub fn parse(offset: usize, reason: impl Into<String>) -> Self {
        Error::Parse {
            offset,
            reason: reason.into(),
        }
    }

    /// Creates a buffer too small error.
    #[inline]
    pub fn buffer_too_small(needed: usize, available: usize) -> Self {
        Error::BufferTooSmall { needed, available }
    }
}
