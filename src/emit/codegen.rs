//! Code generation: lowers the IR into `__text`, `__stubs`, `__cstring`,
//! and `__got` images with every PC-relative immediate resolved.
//!
//! All virtual addresses are known before a single byte is emitted: `_main`
//! sits at the fixed text address, the helpers follow it, the stubs follow
//! the helpers, and the constant pool follows the stubs. Straight-line code
//! uses pre-computed immediates; the loop-heavy helpers go through the
//! label/patch assembler.

use tracing::debug;

use crate::arm64::encode::{
    add_imm32, add_imm64, add_reg64, adrp, adrp_page_delta, bl, bl_imm26, br, ldr_imm64, ldrb_imm,
    movz64, mul32, ret, strb_imm, sub_imm64, sub_reg32, udiv32, REG_ZR,
};
use crate::arm64::Assembler;
use crate::emit::buffer::ByteBuffer;
use crate::emit::{GOT_ADDR, TEXT_ADDR};
use crate::error::{Error, Result};
use crate::ir::{IrProgram, Operation};

/// Size of each symbol stub in bytes (`reserved2` of `__stubs`).
pub const STUB_SIZE: usize = 12;

/// Total size of the two-stub `__stubs` section.
pub const STUBS_SIZE: usize = 2 * STUB_SIZE;

/// Size of the hand-assembled `print_i64` helper.
pub const PRINT_I64_SIZE: usize = 88;

/// Size of the hand-assembled `int_to_string` helper.
pub const INT_TO_STRING_SIZE: usize = 92;

/// Chained-fixup bind sentinel for GOT slot 0 (`_exit`).
const GOT_BIND_EXIT: u64 = 0x8010_0000_0000_0000;

/// Chained-fixup bind sentinel for GOT slot 1 (`_write`).
const GOT_BIND_WRITE: u64 = 0x8000_0000_0000_0001;

// =============================================================================
// Address Map
// =============================================================================

/// Every virtual address the lowering needs, fixed before emission.
#[derive(Debug, Clone)]
pub struct AddressMap {
    /// Address of `_main` (start of `__text`).
    pub main_addr: u64,
    /// Address of the `print_i64` helper.
    pub print_addr: u64,
    /// Address of the `int_to_string` helper.
    pub int_to_string_addr: u64,
    /// Address of the `__stubs` section.
    pub stubs_addr: u64,
    /// Address of the `_exit` stub.
    pub exit_stub_addr: u64,
    /// Address of the `_write` stub.
    pub write_stub_addr: u64,
    /// Address of the `__cstring` section.
    pub cstring_addr: u64,
    /// Address of the `__got` section.
    pub got_addr: u64,
    /// Per-global (name, address, length), in IR order.
    pub globals: Vec<(String, u64, usize)>,
}

impl AddressMap {
    /// Returns the address of a global by name.
    pub fn global_addr(&self, name: &str) -> Option<u64> {
        self.globals
            .iter()
            .find(|(n, _, _)| n == name)
            .map(|(_, addr, _)| *addr)
    }
}

// =============================================================================
// Code Plan
// =============================================================================

/// The lowered section images plus the address map they were built against.
#[derive(Debug, Clone)]
pub struct CodePlan {
    /// `__text`: `_main`, then `print_i64`, then `int_to_string`.
    pub text: Vec<u8>,
    /// `__stubs`: the `_exit` and `_write` trampolines.
    pub stubs: Vec<u8>,
    /// `__cstring`: each global's payload followed by a NUL, in IR order.
    pub cstring: Vec<u8>,
    /// `__got`: two bind sentinels rewritten by dyld at load time.
    pub got: Vec<u8>,
    /// The address map everything above was resolved against.
    pub addresses: AddressMap,
    /// Address recorded for the `msg` debug symbol (first `WriteGlobal`).
    pub msg_addr: u64,
    /// Value recorded for the `msg_len` debug symbol.
    pub msg_len: u64,
}

impl CodePlan {
    /// Validates the program and lowers it into section images.
    pub fn build(program: &IrProgram) -> Result<Self> {
        validate_helper_shapes(program)?;
        validate_operations(program)?;

        let main_size: usize = program.ops.iter().map(op_encoded_size).sum();
        let text_size = main_size + PRINT_I64_SIZE + INT_TO_STRING_SIZE;

        let main_addr = TEXT_ADDR;
        let print_addr = main_addr + main_size as u64;
        let int_to_string_addr = print_addr + PRINT_I64_SIZE as u64;
        let stubs_addr = TEXT_ADDR + text_size as u64;
        let cstring_addr = stubs_addr + STUBS_SIZE as u64;

        // C-string plan: concatenated payloads, one NUL after each.
        let mut cstring = ByteBuffer::new();
        let mut globals = Vec::with_capacity(program.globals.len());
        for global in &program.globals {
            globals.push((
                global.name.clone(),
                cstring_addr + cstring.len() as u64,
                global.bytes.len(),
            ));
            cstring.push_cstr(&global.bytes);
        }

        let addresses = AddressMap {
            main_addr,
            print_addr,
            int_to_string_addr,
            stubs_addr,
            exit_stub_addr: stubs_addr,
            write_stub_addr: stubs_addr + STUB_SIZE as u64,
            cstring_addr,
            got_addr: GOT_ADDR,
            globals,
        };

        // The helper's trailing newline write addresses the `nl` global; a
        // program with no PrintI64 ops never reaches it.
        let nl_addr = addresses.global_addr("nl").unwrap_or(cstring_addr);

        let mut text = lower_main(program, &addresses);
        text.extend_from_slice(&build_print_i64(&addresses, nl_addr));
        text.extend_from_slice(&build_int_to_string());
        assert_eq!(text.len(), text_size, "assembled __text disagrees with block sum");

        let stubs = build_stubs(&addresses);
        let got = build_got();

        let (msg_addr, msg_len) = program
            .ops
            .iter()
            .find_map(|op| match op {
                Operation::WriteGlobal { symbol, len } => {
                    Some((addresses.global_addr(symbol).unwrap(), *len as u64))
                }
                _ => None,
            })
            .unwrap_or((cstring_addr, 0));

        debug!(
            main = main_size,
            text = text.len(),
            cstring = cstring.len(),
            "code plan built"
        );

        Ok(Self {
            text,
            stubs,
            cstring: cstring.into_vec(),
            got,
            addresses,
            msg_addr,
            msg_len,
        })
    }
}

/// Encoded size in bytes of one lowered operation.
fn op_encoded_size(op: &Operation) -> usize {
    match op {
        Operation::WriteGlobal { .. } => 5 * 4,
        Operation::PrintI64 { .. } => 2 * 4,
        Operation::ExitCode { .. } => 2 * 4,
        Operation::ReturnCode { .. } => 2 * 4,
    }
}

// =============================================================================
// Validation
// =============================================================================

/// Checks that the helper bodies still have the shape the hand-assembled
/// lowerings implement.
fn validate_helper_shapes(program: &IrProgram) -> Result<()> {
    let requires = |body: &[String], helper: &'static str, expected: &'static str| {
        if body.iter().any(|line| line.contains(expected)) {
            Ok(())
        } else {
            Err(Error::HelperShape { helper, expected })
        }
    };

    let its = &program.int_to_string_body;
    requires(its, "int_to_string", "udiv i32")?;
    requires(its, "int_to_string", "mul i32")?;
    requires(its, "int_to_string", "sub i32")?;
    requires(its, "int_to_string", "store i8")?;
    requires(its, "int_to_string", "ret ptr %1")?;

    let pi = &program.print_i64_body;
    requires(pi, "print_i64", "call ptr @int_to_string(")?;
    requires(pi, "print_i64", "call i64 @strlen(")?;
    requires(pi, "print_i64", "ret void")?;
    let write_calls = pi.iter().filter(|l| l.contains("@write(")).count();
    if write_calls != 2 {
        return Err(Error::HelperShape {
            helper: "print_i64",
            expected: "two calls to @write",
        });
    }

    Ok(())
}

/// Validates operand ranges and symbol references before lowering.
fn validate_operations(program: &IrProgram) -> Result<()> {
    let mut saw_exit = false;
    let mut uses_print = false;

    for op in &program.ops {
        match op {
            Operation::WriteGlobal { symbol, len } => {
                let global = program
                    .global(symbol)
                    .ok_or_else(|| Error::UndefinedGlobal {
                        symbol: symbol.clone(),
                    })?;
                if *len < 0 || *len as usize > global.bytes.len() {
                    return Err(Error::WriteOutOfBounds {
                        symbol: symbol.clone(),
                        len: *len,
                        available: global.bytes.len(),
                    });
                }
                check_u16(*len)?;
            }
            Operation::PrintI64 { value } => {
                check_u16(*value)?;
                uses_print = true;
            }
            Operation::ExitCode { code } => {
                check_u16(*code)?;
                saw_exit = true;
            }
            Operation::ReturnCode { code } => {
                check_u16(*code)?;
            }
        }
    }

    if !saw_exit {
        return Err(Error::MissingExit);
    }
    if uses_print && program.global("nl").is_none() {
        return Err(Error::MissingNewlineGlobal);
    }
    Ok(())
}

fn check_u16(value: i64) -> Result<u16> {
    u16::try_from(value).map_err(|_| Error::OperandOutOfRange { value })
}

// =============================================================================
// Lowering
// =============================================================================

/// Lowers the `@main` operation list into instruction bytes.
fn lower_main(program: &IrProgram, map: &AddressMap) -> Vec<u8> {
    let mut out = ByteBuffer::new();

    for op in &program.ops {
        let block_addr = map.main_addr + out.len() as u64;
        match op {
            Operation::WriteGlobal { symbol, len } => {
                let target = map.global_addr(symbol).unwrap();
                let adrp_addr = block_addr + 4;
                let bl_addr = block_addr + 16;
                out.push_u32_le(movz64(0, 1, 0));
                out.push_u32_le(adrp(1, adrp_page_delta(adrp_addr, target)));
                out.push_u32_le(add_imm64(1, 1, (target & 0xFFF) as u16, 0));
                out.push_u32_le(movz64(2, *len as u16, 0));
                out.push_u32_le(bl(bl_imm26(bl_addr, map.write_stub_addr)));
            }
            Operation::PrintI64 { value } => {
                let bl_addr = block_addr + 4;
                out.push_u32_le(movz64(0, *value as u16, 0));
                out.push_u32_le(bl(bl_imm26(bl_addr, map.print_addr)));
            }
            Operation::ExitCode { code } => {
                let bl_addr = block_addr + 4;
                out.push_u32_le(movz64(0, *code as u16, 0));
                out.push_u32_le(bl(bl_imm26(bl_addr, map.exit_stub_addr)));
            }
            Operation::ReturnCode { code } => {
                out.push_u32_le(movz64(0, *code as u16, 0));
                out.push_u32_le(ret());
            }
        }
    }

    assert!(out.len() % 4 == 0);
    out.into_vec()
}

/// Assembles the `print_i64` helper.
///
/// Converts the value on a 64-byte stack buffer via `int_to_string`, finds
/// the length with a manual strlen loop, writes the digits, then writes one
/// newline from the constant pool.
fn build_print_i64(map: &AddressMap, nl_addr: u64) -> Vec<u8> {
    let base = map.print_addr;
    let mut asm = Assembler::new();

    asm.emit(sub_imm64(31, 31, 64, 0)); // sub sp, sp, #64
    asm.emit(add_imm64(9, 0, 0, 0)); // mov x9, x0
    asm.emit(add_imm64(1, 31, 0, 0)); // mov x1, sp
    asm.emit(add_imm32(0, 9, 0, 0)); // mov w0, w9
    let bl_addr = base + 4 * asm.len() as u64;
    asm.emit(bl(bl_imm26(bl_addr, map.int_to_string_addr)));

    // strlen(sp): x4 walks the buffer, x2 counts.
    asm.emit(add_imm64(4, 31, 0, 0));
    asm.emit(movz64(2, 0, 0));
    asm.label("scan");
    asm.emit(ldrb_imm(3, 4, 0));
    asm.cbz_w_to(3, "scanned");
    asm.emit(add_imm64(4, 4, 1, 0));
    asm.emit(add_imm64(2, 2, 1, 0));
    asm.b_to("scan");
    asm.label("scanned");

    // write(1, sp, len)
    asm.emit(movz64(0, 1, 0));
    asm.emit(add_imm64(1, 31, 0, 0));
    let bl_addr = base + 4 * asm.len() as u64;
    asm.emit(bl(bl_imm26(bl_addr, map.write_stub_addr)));

    // write(1, @nl, 1)
    asm.emit(movz64(0, 1, 0));
    let adrp_addr = base + 4 * asm.len() as u64;
    asm.emit(adrp(1, adrp_page_delta(adrp_addr, nl_addr)));
    asm.emit(add_imm64(1, 1, (nl_addr & 0xFFF) as u16, 0));
    asm.emit(movz64(2, 1, 0));
    let bl_addr = base + 4 * asm.len() as u64;
    asm.emit(bl(bl_imm26(bl_addr, map.write_stub_addr)));

    asm.emit(add_imm64(31, 31, 64, 0)); // add sp, sp, #64
    asm.emit(ret());

    let words = asm.resolve();
    assert_eq!(words.len() * 4, PRINT_I64_SIZE, "print_i64 size drifted");
    words_to_bytes(&words)
}

/// Assembles the `int_to_string` helper.
///
/// Unsigned base-10 conversion into the caller's buffer, returning the
/// buffer pointer. Zero input stores a lone NUL. Otherwise the digit count
/// is found by repeated division, the string is NUL-terminated at
/// `buf + len`, and digits are filled from the end.
fn build_int_to_string() -> Vec<u8> {
    let mut asm = Assembler::new();

    asm.emit(movz64(3, 10, 0)); // w3 = 10
    asm.emit(add_imm32(5, 0, 0, 0)); // w5 = n
    asm.cbz_w_to(5, "zero");

    // Count digits: w2 = len, w6 = running quotient.
    asm.emit(movz64(2, 0, 0));
    asm.emit(add_imm32(6, 5, 0, 0));
    asm.label("count");
    asm.emit(udiv32(6, 6, 3));
    asm.emit(add_imm32(2, 2, 1, 0));
    asm.cbz_w_to(6, "counted");
    asm.b_to("count");
    asm.label("counted");

    // NUL-terminate at buf + len, then fill digits from the end.
    asm.emit(add_reg64(4, 1, 2));
    asm.emit(strb_imm(REG_ZR, 4, 0));
    asm.label("fill");
    asm.emit(sub_imm64(4, 4, 1, 0)); // x4--
    asm.emit(udiv32(6, 5, 3)); // w6 = n / 10
    asm.emit(mul32(7, 6, 3)); // w7 = (n / 10) * 10
    asm.emit(sub_reg32(7, 5, 7)); // w7 = n - (n / 10) * 10
    asm.emit(add_imm32(7, 7, 0x30, 0)); // ASCII digit
    asm.emit(strb_imm(7, 4, 0));
    asm.emit(add_imm32(5, 6, 0, 0)); // w5 = w6
    asm.cbz_w_to(5, "done");
    asm.b_to("fill");

    asm.label("zero");
    asm.emit(strb_imm(REG_ZR, 1, 0));
    asm.label("done");
    asm.emit(add_imm64(0, 1, 0, 0)); // return buf
    asm.emit(ret());

    let words = asm.resolve();
    assert_eq!(words.len() * 4, INT_TO_STRING_SIZE, "int_to_string size drifted");
    words_to_bytes(&words)
}

/// Builds the two-entry `__stubs` section: `(exit_stub, write_stub)`.
fn build_stubs(map: &AddressMap) -> Vec<u8> {
    let mut out = ByteBuffer::with_capacity(STUBS_SIZE);

    for (slot, stub_addr) in [(0u16, map.exit_stub_addr), (8u16, map.write_stub_addr)] {
        out.push_u32_le(adrp(16, adrp_page_delta(stub_addr, map.got_addr)));
        out.push_u32_le(ldr_imm64(16, 16, slot));
        out.push_u32_le(br(16));
    }

    let out = out.into_vec();
    assert_eq!(out.len(), STUBS_SIZE);
    out
}

/// Builds the `__got` section: two bind sentinels dyld rewrites at load
/// time based on the chained-fixups blob.
fn build_got() -> Vec<u8> {
    let mut out = ByteBuffer::with_capacity(16);
    out.push_u64_le(GOT_BIND_EXIT);
    out.push_u64_le(GOT_BIND_WRITE);
    out.into_vec()
}

fn words_to_bytes(words: &[u32]) -> Vec<u8> {
    let mut out = ByteBuffer::with_capacity(words.len() * 4);
    for &word in words {
        out.push_u32_le(word);
    }
    out.into_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{parse_program, Global, IrProgram, REFERENCE_IR};

    fn reference_plan() -> CodePlan {
        let program = parse_program(REFERENCE_IR).unwrap();
        CodePlan::build(&program).unwrap()
    }

    fn read_word(bytes: &[u8], index: usize) -> u32 {
        u32::from_le_bytes([
            bytes[index * 4],
            bytes[index * 4 + 1],
            bytes[index * 4 + 2],
            bytes[index * 4 + 3],
        ])
    }

    #[test]
    fn test_block_sizes() {
        let program = parse_program(REFERENCE_IR).unwrap();
        // Two writes, four prints, exit, ret.
        let main_size: usize = program.ops.iter().map(op_encoded_size).sum();
        assert_eq!(main_size, 2 * 20 + 4 * 8 + 8 + 8);

        let plan = CodePlan::build(&program).unwrap();
        assert_eq!(
            plan.text.len(),
            main_size + PRINT_I64_SIZE + INT_TO_STRING_SIZE
        );
        assert_eq!(plan.stubs.len(), STUBS_SIZE);
        assert_eq!(plan.got.len(), 16);
    }

    #[test]
    fn test_bl_targets() {
        let plan = reference_plan();
        let map = &plan.addresses;

        // First block is WriteGlobal: its BL (word 4) targets the write stub.
        let bl_word = read_word(&plan.text, 4);
        let imm26 = ((bl_word & 0x03FF_FFFF) as i32) << 6 >> 6;
        let from = map.main_addr + 16;
        assert_eq!(from.wrapping_add((imm26 as i64 * 4) as u64), map.write_stub_addr);

        // Second block is PrintI64(0): its BL (word 6) targets print_i64.
        let bl_word = read_word(&plan.text, 6);
        let imm26 = ((bl_word & 0x03FF_FFFF) as i32) << 6 >> 6;
        let from = map.main_addr + 20 + 4;
        assert_eq!(from.wrapping_add((imm26 as i64 * 4) as u64), map.print_addr);
    }

    #[test]
    fn test_adrp_page_consistency() {
        let plan = reference_plan();
        let map = &plan.addresses;

        // The first WriteGlobal's ADRP (word 1) must land on @prefix's page.
        let word = read_word(&plan.text, 1);
        let immlo = (word >> 29) & 0x3;
        let immhi = (word >> 5) & 0x7_FFFF;
        let delta = (((immhi << 2) | immlo) as i64) << 43 >> 43;
        let from_page = (map.main_addr + 4) & !0xFFF;
        let target = map.global_addr("prefix").unwrap();
        assert_eq!(
            from_page.wrapping_add((delta * 4096) as u64),
            target & !0xFFF
        );
    }

    #[test]
    fn test_stub_encoding() {
        let plan = reference_plan();
        let map = &plan.addresses;

        // exit stub: adrp x16 / ldr x16, [x16] / br x16
        assert_eq!(
            read_word(&plan.stubs, 0),
            adrp(16, adrp_page_delta(map.exit_stub_addr, map.got_addr))
        );
        assert_eq!(read_word(&plan.stubs, 1), ldr_imm64(16, 16, 0));
        assert_eq!(read_word(&plan.stubs, 2), br(16));
        // write stub loads slot 8
        assert_eq!(read_word(&plan.stubs, 4), ldr_imm64(16, 16, 8));
    }

    #[test]
    fn test_cstring_layout() {
        let plan = reference_plan();
        assert_eq!(
            &plan.cstring[..24],
            b"numbers via print_i64:\n\0".as_slice()
        );
        let map = &plan.addresses;
        assert_eq!(map.global_addr("prefix").unwrap(), map.cstring_addr);
        assert_eq!(map.global_addr("suffix").unwrap(), map.cstring_addr + 24);
        assert_eq!(map.global_addr("nl").unwrap(), map.cstring_addr + 24 + 7);
    }

    #[test]
    fn test_msg_symbol_tracks_first_write() {
        let plan = reference_plan();
        assert_eq!(plan.msg_addr, plan.addresses.global_addr("prefix").unwrap());
        assert_eq!(plan.msg_len, 23);
    }

    #[test]
    fn test_write_len_out_of_bounds() {
        let mut program = parse_program(REFERENCE_IR).unwrap();
        if let Operation::WriteGlobal { len, .. } = &mut program.ops[0] {
            *len = 9999;
        }
        assert!(matches!(
            CodePlan::build(&program),
            Err(Error::WriteOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_missing_exit() {
        let mut program = parse_program(REFERENCE_IR).unwrap();
        program
            .ops
            .retain(|op| !matches!(op, Operation::ExitCode { .. }));
        assert!(matches!(CodePlan::build(&program), Err(Error::MissingExit)));
    }

    #[test]
    fn test_undefined_global() {
        let mut program = parse_program(REFERENCE_IR).unwrap();
        program.ops.insert(
            0,
            Operation::WriteGlobal {
                symbol: "ghost".into(),
                len: 1,
            },
        );
        assert!(matches!(
            CodePlan::build(&program),
            Err(Error::UndefinedGlobal { .. })
        ));
    }

    #[test]
    fn test_print_without_nl_global() {
        let mut program = parse_program(REFERENCE_IR).unwrap();
        program.globals.retain(|g| g.name != "nl");
        assert!(matches!(
            CodePlan::build(&program),
            Err(Error::MissingNewlineGlobal)
        ));
    }

    #[test]
    fn test_helper_shape_mismatch() {
        let mut program = parse_program(REFERENCE_IR).unwrap();
        program
            .int_to_string_body
            .retain(|line| !line.contains("udiv i32"));
        assert!(matches!(
            CodePlan::build(&program),
            Err(Error::HelperShape {
                helper: "int_to_string",
                ..
            })
        ));
    }

    #[test]
    fn test_directly_built_program() {
        // The generator validates programs that never went through the
        // parser, too.
        let program = IrProgram {
            globals: vec![Global {
                name: "msg".into(),
                bytes: b"hi\n".to_vec(),
            }],
            ops: vec![
                Operation::WriteGlobal {
                    symbol: "msg".into(),
                    len: 3,
                },
                Operation::ExitCode { code: 0 },
            ],
            int_to_string_body: vec![
                "%q = udiv i32 %n, 10".into(),
                "%s = mul i32 %q, 10".into(),
                "%r = sub i32 %n, %s".into(),
                "store i8 %c, ptr %p".into(),
                "ret ptr %1".into(),
            ],
            print_i64_body: vec![
                "%p = call ptr @int_to_string(i32 %n, ptr %b)".into(),
                "%l = call i64 @strlen(ptr %p)".into(),
                "%0 = call i64 @write(i32 1, ptr %p, i64 %l)".into(),
                "%1 = call i64 @write(i32 1, ptr @nl, i64 1)".into(),
                "ret void".into(),
            ],
        };
        let plan = CodePlan::build(&program).unwrap();
        assert_eq!(plan.text.len(), 28 + PRINT_I64_SIZE + INT_TO_STRING_SIZE);
    }
}
