//! machforge - build and inspect signed ARM64 Mach-O executables.
//!
//! This library emits a directly-executable, ad-hoc-signed ARM64 Mach-O
//! image for macOS from a tiny LLVM-shaped textual IR, and reads such
//! images back for inspection. It is not a general linker: it targets one
//! fixed file layout (`__PAGEZERO` + `__TEXT` with `__text`/`__stubs`/
//! `__cstring` + `__DATA_CONST` with `__got` + `__LINKEDIT`) that dyld
//! accepts as a standalone executable.
//!
//! # Features
//!
//! - Miniature IR parser (string globals + straight-line `@main`)
//! - ARM64 A64 encoder, decoder, and a small label/patch assembler
//! - Code generation with fully pre-computed PC-relative immediates
//! - Load commands, chained fixups, exports trie, and symbol tables at
//!   fixed offsets
//! - Embedded SHA-256 CodeDirectory code signature
//!
//! # Example
//!
//! ```no_run
//! fn main() -> machforge::Result<()> {
//!     let image = machforge::emit_image(machforge::ir::REFERENCE_IR, "test_ir.x")?;
//!     assert_eq!(image.len(), machforge::emit::IMAGE_SIZE);
//!
//!     let macho = machforge::MachOContext::parse(&image)?;
//!     println!("{}", macho.header);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod arm64;
pub mod emit;
pub mod error;
pub mod ir;
pub mod macho;
pub mod util;

pub use emit::{emit_image, emit_program};
pub use error::{Error, Result};
pub use macho::MachOContext;

use std::path::Path;

/// Emits the image for `program` and writes it to `path`.
pub fn write_image<P: AsRef<Path>>(
    program: &ir::IrProgram,
    identifier: &str,
    path: P,
) -> Result<()> {
    let path = path.as_ref();
    let image = emit_program(program, identifier)?;
    std::fs::write(path, &image).map_err(|e| Error::FileWrite {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(())
}
