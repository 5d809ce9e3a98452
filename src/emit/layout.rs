//! Mach-O layout: header, the 17 load commands, section content, and
//! LINKEDIT, all at fixed file offsets.
//!
//! Everything before the code signature is emitted here; the returned
//! buffer is exactly the signed region. Offsets are constants of the
//! layout, not derived from content: the segments are padded to their
//! 16 KiB boundaries and LINKEDIT regions sit back to back.

use zerocopy::IntoBytes;

use crate::emit::buffer::ByteBuffer;
use crate::emit::codegen::{CodePlan, STUBS_SIZE, STUB_SIZE};
use crate::emit::linkedit::{
    build_chained_fixups, build_exports_trie, build_function_starts, build_symbol_tables,
    CHAINED_FIXUPS_SIZE, EXPORTS_TRIE_SIZE, FUNCTION_STARTS_SIZE, NSYMS, STRTAB_SIZE,
};
use crate::emit::{
    CODE_LIMIT, DATA_CONST_FILEOFF, GOT_ADDR, IMAGE_SIZE, LINKEDIT_FILEOFF, SIGNATURE_SIZE,
    TEXT_FILEOFF, TEXT_VMBASE,
};
use crate::macho::{
    BuildToolVersion, BuildVersionCommand, DylibCommand, DylinkerCommand, DysymtabCommand,
    EntryPointCommand, LinkeditDataCommand, MachHeader64, MachOFlags, Nlist64, Section64,
    SegmentCommand64, SourceVersionCommand, SymtabCommand, UuidCommand, CPU_TYPE_ARM64, Dylib,
    LC_BUILD_VERSION, LC_CODE_SIGNATURE, LC_DATA_IN_CODE, LC_DYLD_CHAINED_FIXUPS,
    LC_DYLD_EXPORTS_TRIE, LC_DYSYMTAB, LC_FUNCTION_STARTS, LC_LOAD_DYLIB, LC_LOAD_DYLINKER,
    LC_MAIN, LC_SEGMENT_64, LC_SOURCE_VERSION, LC_SYMTAB, LC_UUID, MH_EXECUTE, PLATFORM_MACOS,
    SG_READ_ONLY, S_ATTR_PURE_INSTRUCTIONS, S_ATTR_SOME_INSTRUCTIONS, S_CSTRING_LITERALS,
    S_NON_LAZY_SYMBOL_POINTERS, S_REGULAR, S_SYMBOL_STUBS, TOOL_LD, VM_PROT_EXECUTE, VM_PROT_READ,
    VM_PROT_WRITE,
};

/// Number of load commands.
const NCMDS: u32 = 17;

/// Total size of all load commands.
const SIZEOFCMDS: u32 = 976;

/// Fixed LINKEDIT file offsets.
const CHAINED_FIXUPS_OFFSET: u32 = LINKEDIT_FILEOFF as u32;
const EXPORTS_TRIE_OFFSET: u32 = CHAINED_FIXUPS_OFFSET + CHAINED_FIXUPS_SIZE as u32;
const FUNCTION_STARTS_OFFSET: u32 = EXPORTS_TRIE_OFFSET + EXPORTS_TRIE_SIZE as u32;
const SYMTAB_OFFSET: u32 = FUNCTION_STARTS_OFFSET + FUNCTION_STARTS_SIZE as u32;
const INDIRECT_SYMS_OFFSET: u32 = SYMTAB_OFFSET + (NSYMS * Nlist64::SIZE) as u32;
const STRTAB_OFFSET: u32 = INDIRECT_SYMS_OFFSET + 16;

/// Fixed UUID; determinism requires the same image bytes on every run.
const IMAGE_UUID: [u8; 16] = [
    0x27, 0x07, 0xDD, 0x62, 0x09, 0x67, 0x3C, 0xC0, 0xB2, 0xAC, 0xEF, 0xC3, 0x2B, 0x1C, 0xF6,
    0x3A,
];

/// minos 15.7.0 packed X.Y.Z.
const MINOS_15_7: u32 = 0x000F_0700;

/// Version of the ld this layout imitates.
const TOOL_LD_VERSION: u32 = 0x04CE_0100;

/// libSystem current version 1356.0.0.
const LIBSYSTEM_CURRENT_VERSION: u32 = 0x054C_0000;

/// libSystem compatibility version 1.0.0.
const LIBSYSTEM_COMPAT_VERSION: u32 = 0x0001_0000;

/// Builds the signed region of the image: header through LINKEDIT, padded
/// to the code limit.
pub fn build_image(plan: &CodePlan) -> Vec<u8> {
    let map = &plan.addresses;
    let mut buf = ByteBuffer::with_capacity(IMAGE_SIZE);

    let header = MachHeader64 {
        magic: crate::macho::MH_MAGIC_64,
        cputype: CPU_TYPE_ARM64,
        cpusubtype: 0,
        filetype: MH_EXECUTE,
        ncmds: NCMDS,
        sizeofcmds: SIZEOFCMDS,
        flags: (MachOFlags::NOUNDEFS | MachOFlags::DYLDLINK | MachOFlags::TWOLEVEL | MachOFlags::PIE)
            .bits(),
        reserved: 0,
    };
    buf.push_bytes(header.as_bytes());

    // __PAGEZERO
    buf.push_bytes(
        SegmentCommand64 {
            cmd: LC_SEGMENT_64,
            cmdsize: SegmentCommand64::SIZE as u32,
            segname: name16("__PAGEZERO"),
            vmaddr: 0,
            vmsize: TEXT_VMBASE,
            fileoff: 0,
            filesize: 0,
            maxprot: 0,
            initprot: 0,
            nsects: 0,
            flags: 0,
        }
        .as_bytes(),
    );

    // __TEXT with __text, __stubs, __cstring
    buf.push_bytes(
        SegmentCommand64 {
            cmd: LC_SEGMENT_64,
            cmdsize: (SegmentCommand64::SIZE + 3 * Section64::SIZE) as u32,
            segname: name16("__TEXT"),
            vmaddr: TEXT_VMBASE,
            vmsize: 0x4000,
            fileoff: 0,
            filesize: DATA_CONST_FILEOFF as u64,
            maxprot: VM_PROT_READ | VM_PROT_EXECUTE,
            initprot: VM_PROT_READ | VM_PROT_EXECUTE,
            nsects: 3,
            flags: 0,
        }
        .as_bytes(),
    );

    let text_flags = S_REGULAR | S_ATTR_PURE_INSTRUCTIONS | S_ATTR_SOME_INSTRUCTIONS;
    buf.push_bytes(
        Section64 {
            sectname: name16("__text"),
            segname: name16("__TEXT"),
            addr: map.main_addr,
            size: plan.text.len() as u64,
            offset: TEXT_FILEOFF as u32,
            align: 4,
            reloff: 0,
            nreloc: 0,
            flags: text_flags,
            reserved1: 0,
            reserved2: 0,
            reserved3: 0,
        }
        .as_bytes(),
    );

    buf.push_bytes(
        Section64 {
            sectname: name16("__stubs"),
            segname: name16("__TEXT"),
            addr: map.stubs_addr,
            size: STUBS_SIZE as u64,
            offset: TEXT_FILEOFF as u32 + plan.text.len() as u32,
            align: 2,
            reloff: 0,
            nreloc: 0,
            flags: S_SYMBOL_STUBS | S_ATTR_PURE_INSTRUCTIONS | S_ATTR_SOME_INSTRUCTIONS,
            reserved1: 0,
            reserved2: STUB_SIZE as u32,
            reserved3: 0,
        }
        .as_bytes(),
    );

    buf.push_bytes(
        Section64 {
            sectname: name16("__cstring"),
            segname: name16("__TEXT"),
            addr: map.cstring_addr,
            size: plan.cstring.len() as u64,
            offset: TEXT_FILEOFF as u32 + plan.text.len() as u32 + STUBS_SIZE as u32,
            align: 0,
            reloff: 0,
            nreloc: 0,
            flags: S_CSTRING_LITERALS,
            reserved1: 0,
            reserved2: 0,
            reserved3: 0,
        }
        .as_bytes(),
    );

    // __DATA_CONST with __got
    buf.push_bytes(
        SegmentCommand64 {
            cmd: LC_SEGMENT_64,
            cmdsize: (SegmentCommand64::SIZE + Section64::SIZE) as u32,
            segname: name16("__DATA_CONST"),
            vmaddr: GOT_ADDR,
            vmsize: 0x4000,
            fileoff: DATA_CONST_FILEOFF as u64,
            filesize: 0x4000,
            maxprot: VM_PROT_READ | VM_PROT_WRITE,
            initprot: VM_PROT_READ | VM_PROT_WRITE,
            nsects: 1,
            flags: SG_READ_ONLY,
        }
        .as_bytes(),
    );

    buf.push_bytes(
        Section64 {
            sectname: name16("__got"),
            segname: name16("__DATA_CONST"),
            addr: GOT_ADDR,
            size: plan.got.len() as u64,
            offset: DATA_CONST_FILEOFF as u32,
            align: 3,
            reloff: 0,
            nreloc: 0,
            flags: S_NON_LAZY_SYMBOL_POINTERS,
            reserved1: 2,
            reserved2: 0,
            reserved3: 0,
        }
        .as_bytes(),
    );

    // __LINKEDIT
    buf.push_bytes(
        SegmentCommand64 {
            cmd: LC_SEGMENT_64,
            cmdsize: SegmentCommand64::SIZE as u32,
            segname: name16("__LINKEDIT"),
            vmaddr: 0x1_0000_8000,
            vmsize: 0x4000,
            fileoff: LINKEDIT_FILEOFF as u64,
            filesize: (IMAGE_SIZE - LINKEDIT_FILEOFF) as u64,
            maxprot: VM_PROT_READ,
            initprot: VM_PROT_READ,
            nsects: 0,
            flags: 0,
        }
        .as_bytes(),
    );

    buf.push_bytes(
        LinkeditDataCommand {
            cmd: LC_DYLD_CHAINED_FIXUPS,
            cmdsize: LinkeditDataCommand::SIZE as u32,
            dataoff: CHAINED_FIXUPS_OFFSET,
            datasize: CHAINED_FIXUPS_SIZE as u32,
        }
        .as_bytes(),
    );

    buf.push_bytes(
        LinkeditDataCommand {
            cmd: LC_DYLD_EXPORTS_TRIE,
            cmdsize: LinkeditDataCommand::SIZE as u32,
            dataoff: EXPORTS_TRIE_OFFSET,
            datasize: EXPORTS_TRIE_SIZE as u32,
        }
        .as_bytes(),
    );

    buf.push_bytes(
        SymtabCommand {
            cmd: LC_SYMTAB,
            cmdsize: SymtabCommand::SIZE as u32,
            symoff: SYMTAB_OFFSET,
            nsyms: NSYMS as u32,
            stroff: STRTAB_OFFSET,
            strsize: STRTAB_SIZE as u32,
        }
        .as_bytes(),
    );

    buf.push_bytes(
        DysymtabCommand {
            cmd: LC_DYSYMTAB,
            cmdsize: DysymtabCommand::SIZE as u32,
            ilocalsym: 0,
            nlocalsym: 2,
            iextdefsym: 2,
            nextdefsym: 2,
            iundefsym: 4,
            nundefsym: 2,
            tocoff: 0,
            ntoc: 0,
            modtaboff: 0,
            nmodtab: 0,
            extrefsymoff: 0,
            nextrefsyms: 0,
            indirectsymoff: INDIRECT_SYMS_OFFSET,
            nindirectsyms: 4,
            extreloff: 0,
            nextrel: 0,
            locreloff: 0,
            nlocrel: 0,
        }
        .as_bytes(),
    );

    // LC_LOAD_DYLINKER: 12-byte command + 20-byte path field.
    buf.push_bytes(
        DylinkerCommand {
            cmd: LC_LOAD_DYLINKER,
            cmdsize: (DylinkerCommand::SIZE + 20) as u32,
            name_offset: DylinkerCommand::SIZE as u32,
        }
        .as_bytes(),
    );
    buf.push_bytes(&padded_path::<20>("/usr/lib/dyld"));

    buf.push_bytes(
        UuidCommand {
            cmd: LC_UUID,
            cmdsize: UuidCommand::SIZE as u32,
            uuid: IMAGE_UUID,
        }
        .as_bytes(),
    );

    buf.push_bytes(
        BuildVersionCommand {
            cmd: LC_BUILD_VERSION,
            cmdsize: (BuildVersionCommand::SIZE + BuildToolVersion::SIZE) as u32,
            platform: PLATFORM_MACOS,
            minos: MINOS_15_7,
            sdk: 0,
            ntools: 1,
        }
        .as_bytes(),
    );
    buf.push_bytes(
        BuildToolVersion {
            tool: TOOL_LD,
            version: TOOL_LD_VERSION,
        }
        .as_bytes(),
    );

    buf.push_bytes(
        SourceVersionCommand {
            cmd: LC_SOURCE_VERSION,
            cmdsize: SourceVersionCommand::SIZE as u32,
            version: 0,
        }
        .as_bytes(),
    );

    buf.push_bytes(
        EntryPointCommand {
            cmd: LC_MAIN,
            cmdsize: EntryPointCommand::SIZE as u32,
            entryoff: TEXT_FILEOFF,
            stacksize: 0,
        }
        .as_bytes(),
    );

    // LC_LOAD_DYLIB: 24-byte command + 32-byte path field.
    buf.push_bytes(
        DylibCommand {
            cmd: LC_LOAD_DYLIB,
            cmdsize: (DylibCommand::SIZE + 32) as u32,
            dylib: Dylib {
                name_offset: DylibCommand::SIZE as u32,
                timestamp: 2,
                current_version: LIBSYSTEM_CURRENT_VERSION,
                compatibility_version: LIBSYSTEM_COMPAT_VERSION,
            },
        }
        .as_bytes(),
    );
    buf.push_bytes(&padded_path::<32>("/usr/lib/libSystem.B.dylib"));

    buf.push_bytes(
        LinkeditDataCommand {
            cmd: LC_FUNCTION_STARTS,
            cmdsize: LinkeditDataCommand::SIZE as u32,
            dataoff: FUNCTION_STARTS_OFFSET,
            datasize: FUNCTION_STARTS_SIZE as u32,
        }
        .as_bytes(),
    );

    buf.push_bytes(
        LinkeditDataCommand {
            cmd: LC_DATA_IN_CODE,
            cmdsize: LinkeditDataCommand::SIZE as u32,
            dataoff: SYMTAB_OFFSET,
            datasize: 0,
        }
        .as_bytes(),
    );

    buf.push_bytes(
        LinkeditDataCommand {
            cmd: LC_CODE_SIGNATURE,
            cmdsize: LinkeditDataCommand::SIZE as u32,
            dataoff: CODE_LIMIT as u32,
            datasize: SIGNATURE_SIZE as u32,
        }
        .as_bytes(),
    );

    assert_eq!(
        buf.len(),
        MachHeader64::SIZE + SIZEOFCMDS as usize,
        "load command sizes drifted"
    );

    // Section content at its fixed offsets.
    buf.pad_to(TEXT_FILEOFF as usize);
    buf.push_bytes(&plan.text);
    buf.push_bytes(&plan.stubs);
    buf.push_bytes(&plan.cstring);

    buf.pad_to(DATA_CONST_FILEOFF);
    buf.push_bytes(&plan.got);

    buf.pad_to(LINKEDIT_FILEOFF);
    buf.push_bytes(&build_chained_fixups());
    buf.push_bytes(&build_exports_trie());
    buf.push_bytes(&build_function_starts());

    let (symtab, indirect, strtab) = build_symbol_tables(plan);
    assert_eq!(buf.len(), SYMTAB_OFFSET as usize);
    buf.push_bytes(&symtab);
    buf.push_bytes(&indirect);
    buf.push_bytes(&strtab);

    buf.pad_to(CODE_LIMIT);
    buf.into_vec()
}

/// Returns a 16-byte NUL-padded segment/section name.
fn name16(name: &str) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[..name.len()].copy_from_slice(name.as_bytes());
    out
}

/// Returns an `N`-byte NUL-padded load-command path field.
fn padded_path<const N: usize>(path: &str) -> [u8; N] {
    let mut out = [0u8; N];
    out[..path.len()].copy_from_slice(path.as_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{parse_program, REFERENCE_IR};
    use crate::util::read_u32_le_at;

    fn image() -> Vec<u8> {
        let plan = CodePlan::build(&parse_program(REFERENCE_IR).unwrap()).unwrap();
        build_image(&plan)
    }

    #[test]
    fn test_signed_region_size() {
        assert_eq!(image().len(), CODE_LIMIT);
    }

    #[test]
    fn test_header_fields() {
        let image = image();
        assert_eq!(read_u32_le_at(&image, 0), crate::macho::MH_MAGIC_64);
        assert_eq!(read_u32_le_at(&image, 4), CPU_TYPE_ARM64);
        assert_eq!(read_u32_le_at(&image, 12), MH_EXECUTE);
        assert_eq!(read_u32_le_at(&image, 16), NCMDS);
        assert_eq!(read_u32_le_at(&image, 20), SIZEOFCMDS);
        assert_eq!(read_u32_le_at(&image, 24), 0x20_0085);
    }

    #[test]
    fn test_linkedit_region_offsets() {
        assert_eq!(CHAINED_FIXUPS_OFFSET, 32768);
        assert_eq!(EXPORTS_TRIE_OFFSET, 32872);
        assert_eq!(FUNCTION_STARTS_OFFSET, 32920);
        assert_eq!(SYMTAB_OFFSET, 32928);
        assert_eq!(INDIRECT_SYMS_OFFSET, 33024);
        assert_eq!(STRTAB_OFFSET, 33040);
        assert_eq!(STRTAB_OFFSET + STRTAB_SIZE as u32, 33096);
    }

    #[test]
    fn test_got_content() {
        let image = image();
        assert_eq!(
            crate::util::read_u64_le_at(&image, DATA_CONST_FILEOFF),
            0x8010_0000_0000_0000
        );
        assert_eq!(
            crate::util::read_u64_le_at(&image, DATA_CONST_FILEOFF + 8),
            0x8000_0000_0000_0001
        );
    }

    #[test]
    fn test_padding_is_zero() {
        let image = image();
        // Between load commands and __text.
        assert!(image[1008..1040].iter().all(|&b| b == 0));
        // Between strtab and the code signature boundary.
        assert!(image[33096..CODE_LIMIT].iter().all(|&b| b == 0));
    }
}
