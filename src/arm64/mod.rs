//! ARM64 (A64) instruction encoding, decoding, and a small patch assembler.
//!
//! The encoder produces the exact 32-bit words the code generator emits into
//! `__text` and `__stubs`; the decoder maps words back to mnemonic strings
//! for the reader's dump output.

pub mod asm;
pub mod decode;
pub mod encode;

pub use asm::Assembler;
pub use decode::disassemble;
