//! LINKEDIT content: chained fixups, exports trie, function starts, and
//! the symbol/indirect/string tables.
//!
//! The fixups blob and exports trie are bit-exact fixed blobs: the image
//! always imports exactly `_exit` and `_write` from libSystem and exports
//! exactly `__mh_execute_header` and `_main`. A general trie encoder is
//! deliberately not part of this toolkit.

use zerocopy::IntoBytes;

use crate::emit::buffer::ByteBuffer;
use crate::emit::codegen::CodePlan;
use crate::emit::{TEXT_FILEOFF, TEXT_VMBASE};
use crate::macho::{
    Nlist64, DYLD_CHAINED_IMPORT, DYLD_CHAINED_PTR_64, N_ABS, N_EXT, N_SECT,
    REFERENCED_DYNAMICALLY,
};

/// Size of the chained-fixups blob.
pub const CHAINED_FIXUPS_SIZE: usize = 104;

/// Size of the exports trie blob.
pub const EXPORTS_TRIE_SIZE: usize = 48;

/// Size of the zero-padded function-starts blob.
pub const FUNCTION_STARTS_SIZE: usize = 8;

/// Number of symbol table entries.
pub const NSYMS: usize = 6;

/// Size of the zero-padded string table.
pub const STRTAB_SIZE: usize = 56;

/// Builds the `LC_DYLD_CHAINED_FIXUPS` payload.
///
/// Header, starts-in-image for the four segments (only `__DATA_CONST` has
/// fixups), one starts-in-segment record, two packed imports, and the
/// import name strings.
pub fn build_chained_fixups() -> Vec<u8> {
    let mut out = ByteBuffer::with_capacity(CHAINED_FIXUPS_SIZE);

    // dyld_chained_fixups_header
    out.push_u32_le(0); // fixups_version
    out.push_u32_le(0x20); // starts_offset
    out.push_u32_le(0x50); // imports_offset
    out.push_u32_le(0x58); // symbols_offset
    out.push_u32_le(2); // imports_count
    out.push_u32_le(DYLD_CHAINED_IMPORT); // imports_format
    out.push_u32_le(0); // symbols_format

    out.push_u32_le(0); // pad to starts_offset

    // dyld_chained_starts_in_image
    out.push_u32_le(4); // seg_count
    out.push_u32_le(0); // __PAGEZERO
    out.push_u32_le(0); // __TEXT
    out.push_u32_le(0x18); // __DATA_CONST
    out.push_u32_le(0); // __LINKEDIT
    out.push_u32_le(0); // alignment padding before starts_in_segment

    // dyld_chained_starts_in_segment for __DATA_CONST
    out.push_u32_le(0x18); // size
    out.push_u16_le(0x4000); // page_size
    out.push_u16_le(DYLD_CHAINED_PTR_64); // pointer_format
    out.push_u64_le(0x4000); // segment_offset
    out.push_u32_le(0); // max_valid_pointer
    out.push_u16_le(1); // page_count
    out.push_u16_le(0); // page_start[0]

    // Two imports: lib ordinal 1, name offsets 0x02 and 0x0E.
    out.push_u32_le(0x0000_0201);
    out.push_u32_le(0x0000_0E01);

    // Import name strings.
    out.push_u8(0x00);
    out.push_cstr("_exit");
    out.push_cstr("_write");
    out.push_u8(0x00);
    out.push_u8(0x00);

    let out = out.into_vec();
    assert_eq!(out.len(), CHAINED_FIXUPS_SIZE);
    out
}

/// Builds the `LC_DYLD_EXPORTS_TRIE` payload.
///
/// Compact trie for `__mh_execute_header -> 0x0` and `_main -> 0x410`,
/// byte-for-byte what ld emits for these two exports.
pub fn build_exports_trie() -> Vec<u8> {
    let mut out = ByteBuffer::with_capacity(EXPORTS_TRIE_SIZE);

    // Root node: no terminal info, one edge labeled "_".
    out.push_u8(0x00);
    out.push_u8(0x01);
    out.push_cstr("_");
    out.push_uleb128(0x12);
    out.push_u8(0x00);
    out.push_u8(0x00);
    out.push_u8(0x00);

    // "_" node: two edges.
    out.push_u8(0x00);
    out.push_u8(0x02);

    out.push_u8(0x00);
    out.push_u8(0x00);
    out.push_u8(0x00);

    // "_main" terminal: flags 0, address 0x410.
    out.push_u8(0x03);
    out.push_u8(0x00);
    out.push_uleb128(0x410);
    out.push_u8(0x00);

    // Edge labels and the "__mh_execute_header" terminal.
    out.push_u8(0x00);
    out.push_u8(0x02);
    out.push_cstr("_mh_execute_header");
    out.push_uleb128(0x09);
    out.push_cstr("main");
    out.push_uleb128(0x0D);
    out.push_u8(0x00);
    out.push_u8(0x00);

    let out = out.into_vec();
    assert_eq!(out.len(), EXPORTS_TRIE_SIZE);
    out
}

/// Builds the `LC_FUNCTION_STARTS` payload: a single ULEB128 delta for
/// `_main` at file offset 0x410, a terminator, zero-padded to 8 bytes.
pub fn build_function_starts() -> Vec<u8> {
    let mut out = ByteBuffer::with_capacity(FUNCTION_STARTS_SIZE);
    out.push_uleb128(TEXT_FILEOFF);
    out.push_u8(0x00);
    out.pad_to(FUNCTION_STARTS_SIZE);
    let out = out.into_vec();
    assert_eq!(out.len(), FUNCTION_STARTS_SIZE);
    out
}

/// Builds the symbol table, indirect symbol table, and string table.
///
/// Six symbols: the `msg`/`msg_len` debug pair describing the first write,
/// the two exported symbols, and the two libSystem imports. The indirect
/// table carries one entry per stub and one per GOT slot.
pub fn build_symbol_tables(plan: &CodePlan) -> (Vec<u8>, Vec<u8>, Vec<u8>) {
    const NAME_POOL: [&str; 6] = [
        "__mh_execute_header",
        "_main",
        "_exit",
        "_write",
        "msg",
        "msg_len",
    ];

    let mut strtab = ByteBuffer::with_capacity(STRTAB_SIZE);
    strtab.push_u8(0x20); // preserved leading bytes
    strtab.push_u8(0x00);

    let mut strx = [0u32; 6];
    for (i, name) in NAME_POOL.iter().enumerate() {
        strx[i] = strtab.len() as u32;
        strtab.push_cstr(name);
    }
    strtab.pad_to(STRTAB_SIZE);

    // Ordinal 1 (libSystem) in the high byte of n_desc.
    let lib_ordinal_1: u16 = 0x0100;

    let symbols = [
        // name_pool index, n_type, n_sect, n_desc, n_value
        (4, N_SECT, 3, 0, plan.msg_addr),
        (5, N_ABS, 0, 0, plan.msg_len),
        (0, N_SECT | N_EXT, 1, REFERENCED_DYNAMICALLY, TEXT_VMBASE),
        (1, N_SECT | N_EXT, 1, 0, plan.addresses.main_addr),
        (2, N_EXT, 0, lib_ordinal_1, 0),
        (3, N_EXT, 0, lib_ordinal_1, 0),
    ];

    let mut symtab = ByteBuffer::with_capacity(NSYMS * Nlist64::SIZE);
    for (pool_index, n_type, n_sect, n_desc, n_value) in symbols {
        let nlist = Nlist64 {
            n_strx: strx[pool_index],
            n_type,
            n_sect,
            n_desc,
            n_value,
        };
        symtab.push_bytes(nlist.as_bytes());
    }
    assert_eq!(symtab.len(), NSYMS * Nlist64::SIZE);

    // Stubs then GOT, each pointing at _exit (4) and _write (5).
    let mut indirect = ByteBuffer::with_capacity(16);
    for index in [4u32, 5, 4, 5] {
        indirect.push_u32_le(index);
    }

    (symtab.into_vec(), indirect.into_vec(), strtab.into_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{parse_program, REFERENCE_IR};

    fn plan() -> CodePlan {
        CodePlan::build(&parse_program(REFERENCE_IR).unwrap()).unwrap()
    }

    #[test]
    fn test_chained_fixups_blob() {
        let blob = build_chained_fixups();
        assert_eq!(blob.len(), CHAINED_FIXUPS_SIZE);
        // starts_offset / imports_offset / symbols_offset
        assert_eq!(&blob[4..8], &0x20u32.to_le_bytes());
        assert_eq!(&blob[8..12], &0x50u32.to_le_bytes());
        assert_eq!(&blob[12..16], &0x58u32.to_le_bytes());
        // packed imports
        assert_eq!(&blob[0x50..0x54], &0x0000_0201u32.to_le_bytes());
        assert_eq!(&blob[0x54..0x58], &0x0000_0E01u32.to_le_bytes());
        // import names at the offsets packed into the import words
        // (0x201 >> 9 == 1, 0xE01 >> 9 == 7)
        assert_eq!(&blob[0x58 + 1..0x58 + 6], b"_exit");
        assert_eq!(&blob[0x58 + 7..0x58 + 13], b"_write");
    }

    #[test]
    fn test_exports_trie_blob() {
        let blob = build_exports_trie();
        assert_eq!(blob.len(), EXPORTS_TRIE_SIZE);
        // _main's address is encoded as uleb 0x410
        assert!(blob.windows(2).any(|w| w == [0x90, 0x08]));
        assert!(blob
            .windows(18)
            .any(|w| w == *b"_mh_execute_header"));
    }

    #[test]
    fn test_function_starts_blob() {
        assert_eq!(
            build_function_starts(),
            vec![0x90, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_symbol_tables() {
        let plan = plan();
        let (symtab, indirect, strtab) = build_symbol_tables(&plan);

        assert_eq!(symtab.len(), 96);
        assert_eq!(indirect.len(), 16);
        assert_eq!(strtab.len(), STRTAB_SIZE);

        assert_eq!(&strtab[..2], &[0x20, 0x00]);
        assert_eq!(&strtab[2..21], b"__mh_execute_header");
        assert_eq!(&strtab[22..27], b"_main");

        // _main entry: strx 22, external defined in section 1.
        let main_entry = &symtab[3 * 16..4 * 16];
        assert_eq!(&main_entry[..4], &22u32.to_le_bytes());
        assert_eq!(main_entry[4], N_SECT | N_EXT);
        assert_eq!(main_entry[5], 1);
        assert_eq!(
            &main_entry[8..16],
            &plan.addresses.main_addr.to_le_bytes()
        );

        // _exit/_write are undefined externals bound to library ordinal 1.
        let exit_entry = &symtab[4 * 16..5 * 16];
        assert_eq!(exit_entry[4], N_EXT);
        assert_eq!(&exit_entry[6..8], &0x0100u16.to_le_bytes());

        assert_eq!(&indirect[..4], &4u32.to_le_bytes());
        assert_eq!(&indirect[4..8], &5u32.to_le_bytes());
    }
}
