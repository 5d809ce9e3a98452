//! A64 instruction decoder.
//!
//! Maps 32-bit instruction words back to mnemonic strings for the reader's
//! `__text`/`__stubs` dump. Decoding is a chained prefix-match over the A64
//! top-level encoding groups; the data-processing-register and SIMD/FP
//! groups are only partially decoded. Unknown encodings produce `"?"` so a
//! stray word never aborts a dump.

/// Placeholder for encodings the decoder does not understand.
pub const UNKNOWN: &str = "?";

/// Decodes one instruction word into a mnemonic string.
pub fn disassemble(word: u32) -> String {
    // Top-level encoding group, bits 28:25.
    let op0 = (word >> 25) & 0xF;
    match op0 {
        0b1000 | 0b1001 => decode_dp_immediate(word),
        0b1010 | 0b1011 => decode_branch_system(word),
        0b0100 | 0b0110 | 0b1100 | 0b1110 => decode_load_store(word),
        0b0101 | 0b1101 => decode_dp_register(word),
        0b0111 | 0b1111 => decode_simd_fp(word),
        _ => UNKNOWN.to_string(),
    }
}

// =============================================================================
// Register and Immediate Formatting
// =============================================================================

fn xreg(r: u32) -> String {
    if r == 31 { "xzr".to_string() } else { format!("x{r}") }
}

fn xreg_or_sp(r: u32) -> String {
    if r == 31 { "sp".to_string() } else { format!("x{r}") }
}

fn wreg(r: u32) -> String {
    if r == 31 { "wzr".to_string() } else { format!("w{r}") }
}

fn wreg_or_sp(r: u32) -> String {
    if r == 31 { "wsp".to_string() } else { format!("w{r}") }
}

fn gpr(sf: bool, r: u32) -> String {
    if sf { xreg(r) } else { wreg(r) }
}

fn gpr_or_sp(sf: bool, r: u32) -> String {
    if sf { xreg_or_sp(r) } else { wreg_or_sp(r) }
}

fn imm_hex(value: i64) -> String {
    if value < 0 {
        format!("#-{:#x}", -value)
    } else {
        format!("#{value:#x}")
    }
}

fn sign_extend(value: u32, bits: u32) -> i64 {
    let shift = 64 - bits;
    ((value as i64) << shift) >> shift
}

// =============================================================================
// Data-Processing (Immediate)
// =============================================================================

fn decode_dp_immediate(word: u32) -> String {
    // ADR / ADRP
    if word & 0x1F00_0000 == 0x1000_0000 {
        let rd = word & 0x1F;
        let immlo = (word >> 29) & 0x3;
        let immhi = (word >> 5) & 0x7_FFFF;
        let imm = sign_extend((immhi << 2) | immlo, 21);
        return if word & 0x8000_0000 != 0 {
            format!("adrp {}, {}", xreg(rd), imm_hex(imm))
        } else {
            format!("adr {}, {}", xreg(rd), imm_hex(imm))
        };
    }

    // MOVN / MOVZ / MOVK
    if word & 0x1F80_0000 == 0x1280_0000 {
        let sf = word & 0x8000_0000 != 0;
        let opc = (word >> 29) & 0x3;
        let hw = (word >> 21) & 0x3;
        let imm16 = (word >> 5) & 0xFFFF;
        let rd = word & 0x1F;
        let mnemonic = match opc {
            0b00 => "movn",
            0b10 => "movz",
            0b11 => "movk",
            _ => return UNKNOWN.to_string(),
        };
        let mut out = format!("{mnemonic} {}, {}", gpr(sf, rd), imm_hex(imm16 as i64));
        if hw != 0 {
            out.push_str(&format!(", lsl #{}", hw * 16));
        }
        return out;
    }

    // ADD / SUB (immediate)
    if word & 0x1F80_0000 == 0x1100_0000 {
        let sf = word & 0x8000_0000 != 0;
        let op = (word >> 30) & 1;
        let set_flags = (word >> 29) & 1 != 0;
        let sh = (word >> 22) & 1;
        let imm12 = ((word >> 10) & 0xFFF) as i64;
        let rn = (word >> 5) & 0x1F;
        let rd = word & 0x1F;
        let mnemonic = match (op, set_flags) {
            (0, false) => "add",
            (0, true) => "adds",
            (1, false) => "sub",
            (1, true) => "subs",
            _ => unreachable!(),
        };
        let mut out = format!(
            "{mnemonic} {}, {}, {}",
            gpr_or_sp(sf, rd),
            gpr_or_sp(sf, rn),
            imm_hex(imm12)
        );
        if sh != 0 {
            out.push_str(", lsl #12");
        }
        return out;
    }

    UNKNOWN.to_string()
}

// =============================================================================
// Branches, Exception Generation, System
// =============================================================================

fn decode_branch_system(word: u32) -> String {
    // B / BL (immediate)
    if word & 0x7C00_0000 == 0x1400_0000 {
        let imm = sign_extend(word & 0x03FF_FFFF, 26) * 4;
        return if word & 0x8000_0000 != 0 {
            format!("bl {}", imm_hex(imm))
        } else {
            format!("b {}", imm_hex(imm))
        };
    }

    // CBZ / CBNZ
    if word & 0x7E00_0000 == 0x3400_0000 {
        let sf = word & 0x8000_0000 != 0;
        let imm = sign_extend((word >> 5) & 0x7_FFFF, 19) * 4;
        let rt = word & 0x1F;
        let mnemonic = if word & 0x0100_0000 != 0 { "cbnz" } else { "cbz" };
        return format!("{mnemonic} {}, {}", gpr(sf, rt), imm_hex(imm));
    }

    // RET
    if word & 0xFFFF_FC1F == 0xD65F_0000 {
        let rn = (word >> 5) & 0x1F;
        return if rn == 30 { "ret".to_string() } else { format!("ret {}", xreg(rn)) };
    }

    // BR / BLR
    if word & 0xFFFF_FC1F == 0xD61F_0000 {
        return format!("br {}", xreg((word >> 5) & 0x1F));
    }
    if word & 0xFFFF_FC1F == 0xD63F_0000 {
        return format!("blr {}", xreg((word >> 5) & 0x1F));
    }

    // SVC
    if word & 0xFFE0_001F == 0xD400_0001 {
        let imm16 = ((word >> 5) & 0xFFFF) as i64;
        return format!("svc {}", imm_hex(imm16));
    }

    // NOP
    if word == 0xD503_201F {
        return "nop".to_string();
    }

    // B.cond
    if word & 0xFF00_0010 == 0x5400_0000 {
        const CONDS: [&str; 16] = [
            "eq", "ne", "cs", "cc", "mi", "pl", "vs", "vc", "hi", "ls", "ge", "lt", "gt", "le",
            "al", "nv",
        ];
        let cond = (word & 0xF) as usize;
        let imm = sign_extend((word >> 5) & 0x7_FFFF, 19) * 4;
        return format!("b.{} {}", CONDS[cond], imm_hex(imm));
    }

    UNKNOWN.to_string()
}

// =============================================================================
// Loads and Stores
// =============================================================================

fn decode_load_store(word: u32) -> String {
    // Load/store register (unsigned immediate): size(31:30) 111 V(26)=0 01 opc(23:22)
    if word & 0x3F00_0000 == 0x3900_0000 {
        let size = (word >> 30) & 0x3;
        let is_load = word & 0x0040_0000 != 0;
        let imm12 = (word >> 10) & 0xFFF;
        let rn = (word >> 5) & 0x1F;
        let rt = word & 0x1F;
        let offset = (imm12 as i64) << size;
        let (mnemonic, rt_str) = match (size, is_load) {
            (0, false) => ("strb", wreg(rt)),
            (0, true) => ("ldrb", wreg(rt)),
            (1, false) => ("strh", wreg(rt)),
            (1, true) => ("ldrh", wreg(rt)),
            (2, false) => ("str", wreg(rt)),
            (2, true) => ("ldr", wreg(rt)),
            (3, false) => ("str", xreg(rt)),
            (3, true) => ("ldr", xreg(rt)),
            _ => return UNKNOWN.to_string(),
        };
        return if offset == 0 {
            format!("{mnemonic} {rt_str}, [{}]", xreg_or_sp(rn))
        } else {
            format!("{mnemonic} {rt_str}, [{}, {}]", xreg_or_sp(rn), imm_hex(offset))
        };
    }

    // Load/store register (unscaled immediate): STUR/LDUR
    if word & 0x3F20_0C00 == 0x3800_0000 {
        let size = (word >> 30) & 0x3;
        let is_load = word & 0x0040_0000 != 0;
        let imm9 = sign_extend((word >> 12) & 0x1FF, 9);
        let rn = (word >> 5) & 0x1F;
        let rt = word & 0x1F;
        let mnemonic = if is_load { "ldur" } else { "stur" };
        let rt_str = if size == 3 { xreg(rt) } else { wreg(rt) };
        return format!("{mnemonic} {rt_str}, [{}, {}]", xreg_or_sp(rn), imm_hex(imm9));
    }

    // Load/store pair: STP/LDP (signed offset, pre- or post-indexed)
    if word & 0x3E00_0000 == 0x2800_0000 {
        let sf = (word >> 30) & 0x3 == 0x2;
        let is_load = word & 0x0040_0000 != 0;
        let scale = if sf { 3 } else { 2 };
        let imm7 = sign_extend((word >> 15) & 0x7F, 7) << scale;
        let rt2 = (word >> 10) & 0x1F;
        let rn = (word >> 5) & 0x1F;
        let rt = word & 0x1F;
        let mnemonic = if is_load { "ldp" } else { "stp" };
        return format!(
            "{mnemonic} {}, {}, [{}, {}]",
            gpr(sf, rt),
            gpr(sf, rt2),
            xreg_or_sp(rn),
            imm_hex(imm7)
        );
    }

    UNKNOWN.to_string()
}

// =============================================================================
// Data-Processing (Register)
// =============================================================================

fn decode_dp_register(word: u32) -> String {
    // ADD / SUB (shifted register), LSL #0 only
    if word & 0x1FE0_FC00 == 0x0B00_0000 {
        let sf = word & 0x8000_0000 != 0;
        let op = (word >> 30) & 1;
        let set_flags = (word >> 29) & 1 != 0;
        let rm = (word >> 16) & 0x1F;
        let rn = (word >> 5) & 0x1F;
        let rd = word & 0x1F;
        let mnemonic = match (op, set_flags) {
            (0, false) => "add",
            (0, true) => "adds",
            (1, false) => "sub",
            (1, true) => "subs",
            _ => unreachable!(),
        };
        return format!(
            "{mnemonic} {}, {}, {}",
            gpr(sf, rd),
            gpr(sf, rn),
            gpr(sf, rm)
        );
    }

    // UDIV / SDIV
    if word & 0x7FE0_F800 == 0x1AC0_0800 {
        let sf = word & 0x8000_0000 != 0;
        let rm = (word >> 16) & 0x1F;
        let rn = (word >> 5) & 0x1F;
        let rd = word & 0x1F;
        let mnemonic = if word & 0x0000_0400 != 0 { "sdiv" } else { "udiv" };
        return format!(
            "{mnemonic} {}, {}, {}",
            gpr(sf, rd),
            gpr(sf, rn),
            gpr(sf, rm)
        );
    }

    // MADD / MSUB (MUL alias when the accumulator is the zero register)
    if word & 0x7FE0_0000 == 0x1B00_0000 {
        let sf = word & 0x8000_0000 != 0;
        let is_sub = word & 0x0000_8000 != 0;
        let rm = (word >> 16) & 0x1F;
        let ra = (word >> 10) & 0x1F;
        let rn = (word >> 5) & 0x1F;
        let rd = word & 0x1F;
        if ra == 31 && !is_sub {
            return format!("mul {}, {}, {}", gpr(sf, rd), gpr(sf, rn), gpr(sf, rm));
        }
        let mnemonic = if is_sub { "msub" } else { "madd" };
        return format!(
            "{mnemonic} {}, {}, {}, {}",
            gpr(sf, rd),
            gpr(sf, rn),
            gpr(sf, rm),
            gpr(sf, ra)
        );
    }

    UNKNOWN.to_string()
}

// =============================================================================
// SIMD / Floating-Point (partial)
// =============================================================================

fn decode_simd_fp(_word: u32) -> String {
    // The pipeline never emits SIMD/FP; leave the whole group as a
    // placeholder rather than mis-labeling an encoding.
    UNKNOWN.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arm64::encode;

    #[test]
    fn test_decode_movz() {
        let text = disassemble(encode::movz64(0, 1, 0));
        assert_eq!(text, "movz x0, #0x1");
        let shifted = disassemble(encode::movz64(2, 7, 16));
        assert_eq!(shifted, "movz x2, #0x7, lsl #16");
        assert_eq!(disassemble(encode::movn64(4, 0, 0)), "movn x4, #0x0");
        assert_eq!(
            disassemble(encode::movk64(0, 0xBEEF, 48)),
            "movk x0, #0xbeef, lsl #48"
        );
    }

    #[test]
    fn test_decode_adrp() {
        assert_eq!(disassemble(encode::adrp(1, 0)), "adrp x1, #0x0");
        assert_eq!(disassemble(encode::adrp(16, 4)), "adrp x16, #0x4");
        assert_eq!(disassemble(encode::adrp(16, -4)), "adrp x16, #-0x4");
    }

    #[test]
    fn test_decode_add_sub() {
        assert_eq!(
            disassemble(encode::add_imm64(1, 1, 0x444, 0)),
            "add x1, x1, #0x444"
        );
        assert_eq!(disassemble(encode::sub_imm64(31, 31, 64, 0)), "sub sp, sp, #0x40");
        assert_eq!(disassemble(encode::add_reg64(4, 1, 2)), "add x4, x1, x2");
        assert_eq!(disassemble(encode::sub_reg32(7, 5, 7)), "sub w7, w5, w7");
    }

    #[test]
    fn test_decode_mul_div() {
        assert_eq!(disassemble(encode::udiv32(6, 6, 3)), "udiv w6, w6, w3");
        assert_eq!(disassemble(encode::mul32(7, 6, 3)), "mul w7, w6, w3");
        assert_eq!(disassemble(encode::madd32(7, 6, 3, 2)), "madd w7, w6, w3, w2");
    }

    #[test]
    fn test_decode_loads_stores() {
        assert_eq!(disassemble(encode::ldr_imm64(16, 16, 8)), "ldr x16, [x16, #0x8]");
        assert_eq!(disassemble(encode::strb_imm(7, 4, 0)), "strb w7, [x4]");
        assert_eq!(disassemble(encode::ldrb_imm(3, 4, 0)), "ldrb w3, [x4]");
        // stp x29, x30, [sp, #-16]! family decodes as a pair access
        assert!(disassemble(0xA9BF_7BFD).starts_with("stp x29, x30"));
    }

    #[test]
    fn test_decode_branches() {
        assert_eq!(disassemble(encode::bl(3)), "bl #0xc");
        assert_eq!(disassemble(encode::b(-4)), "b #-0x10");
        assert_eq!(disassemble(encode::br(16)), "br x16");
        assert_eq!(disassemble(encode::cbz32(3, 5)), "cbz w3, #0x14");
        assert_eq!(disassemble(encode::ret()), "ret");
        assert_eq!(disassemble(0xD400_0001), "svc #0x0");
        assert_eq!(disassemble(0xD503_201F), "nop");
    }

    #[test]
    fn test_unknown_is_placeholder_not_error() {
        // Reserved top-level group
        assert_eq!(disassemble(0x0000_0000), UNKNOWN);
        // SIMD/FP group is left as a placeholder
        assert_eq!(disassemble(0x1E20_4000), UNKNOWN);
    }
}
