//! The IR → signed Mach-O emit pipeline.
//!
//! The pipeline is a straight line: parse the IR, lower it into section
//! images with every PC-relative immediate resolved against the fixed
//! address map, lay out the Mach-O prefix and LINKEDIT at their fixed
//! offsets, then append the code-signature superblob over the finished
//! signed region.

pub mod buffer;
pub mod codegen;
pub mod layout;
pub mod linkedit;
pub mod signature;

use tracing::debug;

use crate::error::Result;
use crate::ir::IrProgram;

pub use codegen::{AddressMap, CodePlan};

// =============================================================================
// Fixed Layout Constants
// =============================================================================

/// Base virtual address of the `__TEXT` segment (end of `__PAGEZERO`).
pub const TEXT_VMBASE: u64 = 0x1_0000_0000;

/// File offset of `__text`: header (32) + load commands (976) + pad.
pub const TEXT_FILEOFF: u64 = 1040;

/// Virtual address of `_main`.
pub const TEXT_ADDR: u64 = TEXT_VMBASE + TEXT_FILEOFF;

/// Virtual address (and, modulo the slide, file offset) of `__got`.
pub const GOT_ADDR: u64 = 0x1_0000_4000;

/// File offset of the `__DATA_CONST` segment.
pub const DATA_CONST_FILEOFF: usize = 16384;

/// File offset of the `__LINKEDIT` segment.
pub const LINKEDIT_FILEOFF: usize = 32768;

/// End of the code-signed region; the signature itself starts here.
pub const CODE_LIMIT: usize = 33104;

/// Size of the code-signature superblob region.
pub const SIGNATURE_SIZE: usize = 408;

/// Total size of every emitted image.
pub const IMAGE_SIZE: usize = CODE_LIMIT + SIGNATURE_SIZE;

/// Hash page size used by both ADRP addressing and the code signer.
pub const PAGE_SIZE_4K: usize = 4096;

// =============================================================================
// Pipeline
// =============================================================================

/// Parses `ir_text` and emits a complete signed image.
pub fn emit_image(ir_text: &str, identifier: &str) -> Result<Vec<u8>> {
    let program = crate::ir::parse_program(ir_text)?;
    emit_program(&program, identifier)
}

/// Emits a complete signed image from an already-parsed program.
pub fn emit_program(program: &IrProgram, identifier: &str) -> Result<Vec<u8>> {
    let plan = CodePlan::build(program)?;
    debug!(
        text = plan.text.len(),
        cstring = plan.cstring.len(),
        "lowered program"
    );

    let mut image = layout::build_image(&plan);
    assert_eq!(image.len(), CODE_LIMIT, "signed region size mismatch");

    let sig = signature::build_code_signature(&image, identifier);
    image.extend_from_slice(&sig);
    assert_eq!(image.len(), IMAGE_SIZE, "image size mismatch");

    // A successfully emitted image must pass its own reader validation.
    crate::macho::MachOContext::parse(&image)?;

    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{self, Operation};
    use crate::macho::{LoadCommandInfo, MachOContext};
    use sha2::{Digest, Sha256};

    const E1_IR: &str = r#"
@prefix = private unnamed_addr constant [7 x i8] c"hello\0A\00", align 1

define ptr @int_to_string(i32 %n, ptr %1) {
entry:
  %q = udiv i32 %n, 10
  %scaled = mul i32 %q, 10
  %rem = sub i32 %n, %scaled
  store i8 %ch, ptr %slot, align 1
  ret ptr %1
}

define void @print_i64(i64 %n) {
entry:
  %str = call ptr @int_to_string(i32 %narrow, ptr %buf)
  %len = call i64 @strlen(ptr %str)
  %0 = call i64 @write(i32 1, ptr %str, i64 %len)
  %1 = call i64 @write(i32 1, ptr @nl, i64 1)
  ret void
}

define i32 @main() {
entry:
  %written = call i64 @write(i32 1, ptr @prefix, i64 6)
  call void @exit(i32 0)
}
"#;

    #[test]
    fn test_e1_minimal_program() {
        let image = emit_image(E1_IR, "test_ir.x").unwrap();
        assert_eq!(image.len(), IMAGE_SIZE);

        // __cstring starts right after _main (28 B) + helpers (180 B) + stubs.
        let text_len = 28 + 88 + 92;
        let cstring_off = TEXT_FILEOFF as usize + text_len + 24;
        assert_eq!(
            &image[cstring_off..cstring_off + 7],
            &[0x68, 0x65, 0x6C, 0x6C, 0x6F, 0x0A, 0x00]
        );

        // LC_MAIN entryoff is the fixed text file offset.
        let macho = MachOContext::parse(&image).unwrap();
        let entry = macho
            .load_commands
            .iter()
            .find_map(|lc| match lc {
                LoadCommandInfo::Main { command, .. } => Some(command.entryoff),
                _ => None,
            })
            .unwrap();
        assert_eq!(entry, TEXT_FILEOFF);
    }

    #[test]
    fn test_fixed_offsets() {
        let image = emit_image(ir::REFERENCE_IR, "test_ir.x").unwrap();
        let macho = MachOContext::parse(&image).unwrap();

        let text_seg = macho.segment("__TEXT").unwrap();
        let text_sect = text_seg.section("__text").unwrap();
        assert_eq!(text_sect.section.offset, 1040);

        let data_const = macho.segment("__DATA_CONST").unwrap();
        assert_eq!(data_const.command.fileoff, 16384);

        let linkedit = macho.segment("__LINKEDIT").unwrap();
        assert_eq!(linkedit.command.fileoff, 32768);

        let codesig = macho
            .load_commands
            .iter()
            .find_map(|lc| match lc {
                LoadCommandInfo::LinkeditData { command, .. }
                    if command.cmd == crate::macho::LC_CODE_SIGNATURE =>
                {
                    Some(*command)
                }
                _ => None,
            })
            .unwrap();
        assert_eq!(codesig.dataoff, 33104);
        assert_eq!(codesig.datasize, 408);
    }

    #[test]
    fn test_deterministic_output() {
        let first = emit_image(ir::REFERENCE_IR, "test_ir.x").unwrap();
        let second = emit_image(ir::REFERENCE_IR, "test_ir.x").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_signature_covers_every_page() {
        let image = emit_image(ir::REFERENCE_IR, "test_ir.x").unwrap();

        // CodeDirectory lives 20 bytes into the superblob; its hash slots
        // start at hashOffset = 88 + |ident| + 1.
        let cd = &image[CODE_LIMIT + 20..];
        let hash_offset = 88 + "test_ir.x".len() + 1;
        let n_slots = CODE_LIMIT.div_ceil(PAGE_SIZE_4K);
        for i in 0..n_slots {
            let start = i * PAGE_SIZE_4K;
            let end = CODE_LIMIT.min(start + PAGE_SIZE_4K);
            let digest = Sha256::digest(&image[start..end]);
            let slot = &cd[hash_offset + i * 32..hash_offset + (i + 1) * 32];
            assert_eq!(slot, digest.as_slice(), "page {i} hash mismatch");
        }
    }

    #[test]
    fn test_single_byte_edit_changes_one_slot() {
        let image = emit_image(ir::REFERENCE_IR, "test_ir.x").unwrap();
        let mut mutated = image.clone();
        mutated[5000] ^= 0xFF;

        let resigned = signature::build_code_signature(&mutated[..CODE_LIMIT], "test_ir.x");
        let original_sig = &image[CODE_LIMIT..];

        let hash_offset = 20 + 88 + "test_ir.x".len() + 1;
        let n_slots = CODE_LIMIT.div_ceil(PAGE_SIZE_4K);
        let mut changed = 0;
        for i in 0..n_slots {
            let a = &original_sig[hash_offset + i * 32..hash_offset + (i + 1) * 32];
            let b = &resigned[hash_offset + i * 32..hash_offset + (i + 1) * 32];
            if a != b {
                changed += 1;
                assert_eq!(i, 5000 / PAGE_SIZE_4K);
            }
        }
        assert_eq!(changed, 1);
    }

    #[test]
    fn test_reader_round_trip_decodes_first_word() {
        let image = emit_image(ir::REFERENCE_IR, "test_ir.x").unwrap();
        let macho = MachOContext::parse(&image).unwrap();

        let text = macho.section_bytes("__TEXT", "__text").unwrap();
        let word = u32::from_le_bytes([text[0], text[1], text[2], text[3]]);
        let mnemonic = crate::arm64::disassemble(word);
        assert!(mnemonic.contains("mov"));
        assert!(mnemonic.contains("x0"));
        assert!(mnemonic.contains("#0x1"));
    }

    #[test]
    fn test_write_global_round_trip() {
        // Property: the bytes addressed by each WriteGlobal's ADRP+ADD are
        // the first `len` bytes of the referenced global.
        let program = crate::ir::parse_program(ir::REFERENCE_IR).unwrap();
        let image = emit_program(&program, "test_ir.x").unwrap();
        let plan = CodePlan::build(&program).unwrap();

        for op in &program.ops {
            if let Operation::WriteGlobal { symbol, len } = op {
                let addr = plan.addresses.global_addr(symbol).unwrap();
                let fileoff = (addr - TEXT_VMBASE) as usize;
                let global = program.global(symbol).unwrap();
                assert_eq!(
                    &image[fileoff..fileoff + *len as usize],
                    &global.bytes[..*len as usize]
                );
            }
        }
    }
}
