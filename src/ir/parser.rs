//! Line-based parser for the textual IR.

use crate::error::{Error, Result};

use super::{Global, IrProgram, Operation};

/// Which function definition the parser is currently inside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    None,
    Main,
    IntToString,
    PrintI64,
}

/// Parses an IR text blob into an [`IrProgram`].
///
/// The parser is line-based and whitespace-insensitive within a line; blank
/// lines are ignored. Unrecognized lines outside the tracked scopes are
/// skipped, so `declare`s and comments pass through harmlessly.
pub fn parse_program(ir_text: &str) -> Result<IrProgram> {
    let mut program = IrProgram::default();
    let mut scope = Scope::None;

    for raw_line in ir_text.lines() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }

        if line.starts_with('@') && line.contains(" c\"") {
            program.globals.push(parse_global(line)?);
        } else if line.starts_with("define i32 @main(") {
            scope = Scope::Main;
        } else if line.starts_with("define ptr @int_to_string(") {
            scope = Scope::IntToString;
        } else if line.starts_with("define void @print_i64(") {
            scope = Scope::PrintI64;
        } else if line == "}" {
            scope = Scope::None;
        } else {
            match scope {
                Scope::Main => {
                    if let Some(op) = parse_operation(line)? {
                        program.ops.push(op);
                    }
                }
                Scope::IntToString if line != "entry:" => {
                    program.int_to_string_body.push(line.to_string());
                }
                Scope::PrintI64 if line != "entry:" => {
                    program.print_i64_body.push(line.to_string());
                }
                _ => {}
            }
        }
    }

    if program.globals.is_empty() {
        return Err(Error::NoGlobals);
    }
    if program.ops.is_empty() {
        return Err(Error::NoOperations);
    }
    if program.int_to_string_body.is_empty() {
        return Err(Error::EmptyHelperBody {
            helper: "int_to_string",
        });
    }
    if program.print_i64_body.is_empty() {
        return Err(Error::EmptyHelperBody { helper: "print_i64" });
    }

    Ok(program)
}

/// Parses one `@main` line into an operation, or `None` for lines the
/// lowering does not recognize (labels, declarations, comments).
fn parse_operation(line: &str) -> Result<Option<Operation>> {
    if line.contains("@write(") {
        let symbol = parse_symbol_after(line, "ptr @")?;
        let len = parse_i64_after_last(line, "i64 ")?;
        return Ok(Some(Operation::WriteGlobal { symbol, len }));
    }
    if line.contains("call void @print_i64(") {
        let value = parse_i64_after_last(line, "i64 ")?;
        return Ok(Some(Operation::PrintI64 { value }));
    }
    if line.contains("call void @exit(") {
        let code = parse_i64_after(line, "i32 ")?;
        return Ok(Some(Operation::ExitCode { code }));
    }
    if line.starts_with("ret i32 ") {
        let code = parse_i64_after(line, "ret i32 ")?;
        return Ok(Some(Operation::ReturnCode { code }));
    }
    Ok(None)
}

/// Parses a `@name = … c"…"` global definition line.
fn parse_global(line: &str) -> Result<Global> {
    let name = parse_global_name(line)?;
    let cpos = line
        .find("c\"")
        .ok_or_else(|| Error::ir_parse(line, "missing c\"…\" literal"))?;
    let payload = &line[cpos + 2..];
    let qend = payload
        .find('"')
        .ok_or_else(|| Error::ir_parse(line, "unterminated c\"…\" literal"))?;
    let bytes = decode_c_string(&payload[..qend], line)?;
    Ok(Global { name, bytes })
}

/// Extracts the global name from a `@name = …` line.
fn parse_global_name(line: &str) -> Result<String> {
    let rest = &line[1..];
    let end = rest
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '.'))
        .unwrap_or(rest.len());
    if end == 0 {
        return Err(Error::ir_parse(line, "missing global name after '@'"));
    }
    Ok(rest[..end].to_string())
}

/// Extracts the symbol following `needle` (e.g. `ptr @`).
fn parse_symbol_after(line: &str, needle: &str) -> Result<String> {
    let pos = line
        .find(needle)
        .ok_or_else(|| Error::ir_parse(line, format!("missing {needle:?}")))?;
    let rest = &line[pos + needle.len()..];
    let end = rest
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '.'))
        .unwrap_or(rest.len());
    if end == 0 {
        return Err(Error::ir_parse(line, format!("missing symbol after {needle:?}")));
    }
    Ok(rest[..end].to_string())
}

/// Parses the decimal integer following the first occurrence of `needle`.
fn parse_i64_after(line: &str, needle: &str) -> Result<i64> {
    let pos = line
        .find(needle)
        .ok_or_else(|| Error::ir_parse(line, format!("missing {needle:?}")))?;
    parse_i64_at(line, pos + needle.len())
}

/// Parses the decimal integer following the *last* occurrence of `needle`.
fn parse_i64_after_last(line: &str, needle: &str) -> Result<i64> {
    let pos = line
        .rfind(needle)
        .ok_or_else(|| Error::ir_parse(line, format!("missing {needle:?}")))?;
    parse_i64_at(line, pos + needle.len())
}

fn parse_i64_at(line: &str, mut i: usize) -> Result<i64> {
    let bytes = line.as_bytes();
    while i < bytes.len() && bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    let negative = i < bytes.len() && bytes[i] == b'-';
    if negative {
        i += 1;
    }
    if i >= bytes.len() || !bytes[i].is_ascii_digit() {
        return Err(Error::ir_parse(line, "expected integer literal"));
    }
    let mut value: i64 = 0;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        value = value * 10 + (bytes[i] - b'0') as i64;
        i += 1;
    }
    Ok(if negative { -value } else { value })
}

/// Decodes an LLVM `c"…"` payload.
///
/// `\\` and `\"` map to literal characters, `\n` is a line feed, and any
/// `\HH` pair of hex digits is the byte `0xHH`. A trailing NUL in the
/// decoded payload is removed.
fn decode_c_string(encoded: &str, line: &str) -> Result<Vec<u8>> {
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        if c != b'\\' {
            out.push(c);
            i += 1;
            continue;
        }
        if i + 1 >= bytes.len() {
            return Err(Error::ir_parse(line, "dangling escape in c\"…\" literal"));
        }
        if i + 2 < bytes.len() {
            let hi = hex_nibble(bytes[i + 1]);
            let lo = hex_nibble(bytes[i + 2]);
            if let (Some(hi), Some(lo)) = (hi, lo) {
                out.push((hi << 4) | lo);
                i += 3;
                continue;
            }
        }
        match bytes[i + 1] {
            b'\\' | b'"' => out.push(bytes[i + 1]),
            b'n' => out.push(b'\n'),
            other => {
                return Err(Error::ir_parse(
                    line,
                    format!("unsupported escape '\\{}'", other as char),
                ));
            }
        }
        i += 2;
    }
    if out.last() == Some(&0) {
        out.pop();
    }
    Ok(out)
}

fn hex_nibble(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::REFERENCE_IR;

    #[test]
    fn test_parse_reference_program() {
        let program = parse_program(REFERENCE_IR).unwrap();

        assert_eq!(program.globals.len(), 3);
        assert_eq!(program.globals[0].name, "prefix");
        assert_eq!(program.globals[0].bytes, b"numbers via print_i64:\n");
        assert_eq!(program.globals[1].bytes, b"done.\n");
        assert_eq!(program.globals[2].name, "nl");
        assert_eq!(program.globals[2].bytes, b"\n");

        assert_eq!(program.ops.len(), 8);
        assert_eq!(
            program.ops[0],
            Operation::WriteGlobal {
                symbol: "prefix".into(),
                len: 23
            }
        );
        assert_eq!(program.ops[1], Operation::PrintI64 { value: 0 });
        assert_eq!(program.ops[4], Operation::PrintI64 { value: 12345 });
        assert_eq!(
            program.ops[5],
            Operation::WriteGlobal {
                symbol: "suffix".into(),
                len: 6
            }
        );
        assert_eq!(program.ops[6], Operation::ExitCode { code: 42 });
        assert_eq!(program.ops[7], Operation::ReturnCode { code: 42 });

        // Helper bodies kept for shape validation; entry labels dropped.
        assert!(!program.int_to_string_body.is_empty());
        assert!(!program.print_i64_body.is_empty());
        assert!(!program.int_to_string_body.iter().any(|l| l == "entry:"));
        assert!(program
            .int_to_string_body
            .iter()
            .any(|l| l.contains("udiv i32")));
    }

    #[test]
    fn test_write_takes_last_i64_literal() {
        let op = parse_operation("%n = call i64 @write(i32 1, ptr @msg, i64 23)")
            .unwrap()
            .unwrap();
        assert_eq!(
            op,
            Operation::WriteGlobal {
                symbol: "msg".into(),
                len: 23
            }
        );
    }

    #[test]
    fn test_decode_escapes() {
        assert_eq!(decode_c_string(r"hi\0A\00", "l").unwrap(), b"hi\n");
        assert_eq!(decode_c_string(r#"a\"b\\c"#, "l").unwrap(), b"a\"b\\c");
        assert_eq!(decode_c_string(r"x\ny", "l").unwrap(), b"x\ny");
        assert!(decode_c_string(r"bad\q", "l").is_err());
    }

    #[test]
    fn test_validation_errors() {
        assert!(matches!(parse_program(""), Err(Error::NoGlobals)));

        let no_ops = r#"
@msg = constant [2 x i8] c"a\00"
define ptr @int_to_string(i32 %n, ptr %1) {
  ret ptr %1
}
define void @print_i64(i64 %n) {
  ret void
}
"#;
        assert!(matches!(parse_program(no_ops), Err(Error::NoOperations)));
    }
}
