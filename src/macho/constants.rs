//! Mach-O constants and flags.

use bitflags::bitflags;

// =============================================================================
// Magic Numbers
// =============================================================================

/// 64-bit Mach-O magic (little-endian)
pub const MH_MAGIC_64: u32 = 0xFEEDFACF;

/// 64-bit Mach-O magic (big-endian, needs byte swap)
pub const MH_CIGAM_64: u32 = 0xCFFAEDFE;

// =============================================================================
// File Types
// =============================================================================

/// Object file
pub const MH_OBJECT: u32 = 0x1;
/// Executable
pub const MH_EXECUTE: u32 = 0x2;
/// Dynamically bound shared library
pub const MH_DYLIB: u32 = 0x6;

// =============================================================================
// CPU Types
// =============================================================================

/// 64-bit architecture flag
pub const CPU_ARCH_ABI64: u32 = 0x0100_0000;

/// ARM CPU type
pub const CPU_TYPE_ARM: u32 = 12;
/// ARM64 CPU type
pub const CPU_TYPE_ARM64: u32 = CPU_TYPE_ARM | CPU_ARCH_ABI64;

/// x86 CPU type
pub const CPU_TYPE_X86: u32 = 7;
/// x86_64 CPU type
pub const CPU_TYPE_X86_64: u32 = CPU_TYPE_X86 | CPU_ARCH_ABI64;

// =============================================================================
// Load Commands
// =============================================================================

/// Load command requiring dynamic linker
pub const LC_REQ_DYLD: u32 = 0x8000_0000;

/// Link-edit symbol table info
pub const LC_SYMTAB: u32 = 0x2;
/// Dynamic link-edit symbol table info
pub const LC_DYSYMTAB: u32 = 0xB;
/// Load a dynamically linked shared library
pub const LC_LOAD_DYLIB: u32 = 0xC;
/// Load a dynamic linker
pub const LC_LOAD_DYLINKER: u32 = 0xE;
/// 64-bit segment
pub const LC_SEGMENT_64: u32 = 0x19;
/// UUID
pub const LC_UUID: u32 = 0x1B;
/// Local of code signature
pub const LC_CODE_SIGNATURE: u32 = 0x1D;
/// Local of function starts
pub const LC_FUNCTION_STARTS: u32 = 0x26;
/// Main entry point (replacement for LC_UNIXTHREAD)
pub const LC_MAIN: u32 = 0x28 | LC_REQ_DYLD;
/// Table of non-instructions in __text
pub const LC_DATA_IN_CODE: u32 = 0x29;
/// Source version
pub const LC_SOURCE_VERSION: u32 = 0x2A;
/// Build for platform min version
pub const LC_BUILD_VERSION: u32 = 0x32;
/// Used with linkedit_data_command, payload is trie
pub const LC_DYLD_EXPORTS_TRIE: u32 = 0x33 | LC_REQ_DYLD;
/// Used with linkedit_data_command
pub const LC_DYLD_CHAINED_FIXUPS: u32 = 0x34 | LC_REQ_DYLD;

// =============================================================================
// Segment Flags and Protections
// =============================================================================

/// Segment is made read-only after fixups (`__DATA_CONST`)
pub const SG_READ_ONLY: u32 = 0x10;

/// Read permission
pub const VM_PROT_READ: u32 = 0x1;
/// Write permission
pub const VM_PROT_WRITE: u32 = 0x2;
/// Execute permission
pub const VM_PROT_EXECUTE: u32 = 0x4;

// =============================================================================
// Section Types
// =============================================================================

/// Section types mask
pub const SECTION_TYPE: u32 = 0x0000_00FF;

/// Regular section
pub const S_REGULAR: u32 = 0x0;
/// Section with literal C strings
pub const S_CSTRING_LITERALS: u32 = 0x2;
/// Section with non-lazy symbol pointers
pub const S_NON_LAZY_SYMBOL_POINTERS: u32 = 0x6;
/// Section with symbol stubs
pub const S_SYMBOL_STUBS: u32 = 0x8;

// =============================================================================
// Section Attributes
// =============================================================================

/// Section contains only true machine instructions
pub const S_ATTR_PURE_INSTRUCTIONS: u32 = 0x8000_0000;

/// Section contains some machine instructions
pub const S_ATTR_SOME_INSTRUCTIONS: u32 = 0x0000_0400;

// =============================================================================
// Symbol Types
// =============================================================================

/// Mask for the type bits
pub const N_TYPE: u8 = 0x0E;
/// External symbol bit
pub const N_EXT: u8 = 0x01;

/// Undefined symbol
pub const N_UNDF: u8 = 0x0;
/// Absolute symbol
pub const N_ABS: u8 = 0x2;
/// Defined in section number n_sect
pub const N_SECT: u8 = 0xE;

/// `n_desc` flag for symbols the debugger should not strip
pub const REFERENCED_DYNAMICALLY: u16 = 0x0010;

// =============================================================================
// Build Version
// =============================================================================

/// macOS platform identifier
pub const PLATFORM_MACOS: u32 = 1;

/// The static linker, as a build tool identifier
pub const TOOL_LD: u32 = 3;

// =============================================================================
// Chained Fixups
// =============================================================================

/// 64-bit pointer format used by arm64 executables
pub const DYLD_CHAINED_PTR_64: u16 = 6;

/// Compact 32-bit import format
pub const DYLD_CHAINED_IMPORT: u32 = 1;

// =============================================================================
// Code Signing
// =============================================================================

/// CodeDirectory blob magic
pub const CSMAGIC_CODEDIRECTORY: u32 = 0xFADE_0C02;

/// Embedded signature superblob magic
pub const CSMAGIC_EMBEDDED_SIGNATURE: u32 = 0xFADE_0CC0;

/// Superblob slot index of the CodeDirectory
pub const CSSLOT_CODEDIRECTORY: u32 = 0;

/// CodeDirectory version with the scatter/team fields (v2.4)
pub const CS_VERSION_2_4: u32 = 0x0002_0400;

/// `adhoc | linker-signed` CodeDirectory flags
pub const CS_FLAGS_ADHOC_LINKER_SIGNED: u32 = 0x0002_0002;

/// SHA-256 hash type
pub const CS_HASHTYPE_SHA256: u8 = 2;

// =============================================================================
// Header Flags
// =============================================================================

bitflags! {
    /// Mach-O header flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MachOFlags: u32 {
        /// The object file has no undefined references
        const NOUNDEFS = 0x1;
        /// The object file is input for the dynamic linker
        const DYLDLINK = 0x4;
        /// The image is using two-level name space bindings
        const TWOLEVEL = 0x80;
        /// The executable is forcing all images to use flat name space bindings
        const FORCE_FLAT = 0x100;
        /// Safe to divide up the sections into sub-sections via symbols for dead code stripping
        const SUBSECTIONS_VIA_SYMBOLS = 0x2000;
        /// The final linked image contains external weak symbols
        const WEAK_DEFINES = 0x8000;
        /// The final linked image uses weak symbols
        const BINDS_TO_WEAK = 0x10000;
        /// When this bit is set, the OS will load the main executable at a random address
        const PIE = 0x200000;
        /// Contains a section of type S_THREAD_LOCAL_VARIABLES
        const HAS_TLV_DESCRIPTORS = 0x800000;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_executable_flags_value() {
        let flags =
            MachOFlags::NOUNDEFS | MachOFlags::DYLDLINK | MachOFlags::TWOLEVEL | MachOFlags::PIE;
        assert_eq!(flags.bits(), 0x20_0085);
    }
}
