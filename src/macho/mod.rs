//! Mach-O file format handling.
//!
//! On-disk structures shared by the reader and the layout emitter, the
//! format constants, and the reading context that walks load commands.

mod constants;
mod context;
mod structs;

pub use constants::*;
pub use context::*;
pub use structs::*;
