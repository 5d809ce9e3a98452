//! machforge - build and inspect signed ARM64 Mach-O executables.
//!
//! Emit a runnable macOS executable from the embedded (or a user-supplied)
//! IR program, or dump the structure of an existing image.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use machforge::arm64::disassemble;
use machforge::ir;
use machforge::macho::{split_cstrings, LoadCommandInfo, MachOContext, SegmentInfo};
use machforge::util::{read_u32_le_at, read_u64_le_at, read_uleb128};

/// Build and inspect signed ARM64 Mach-O executables.
#[derive(Parser, Debug)]
#[command(name = "machforge")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Emit a signed executable from an IR program
    Emit {
        /// Path to an IR file (defaults to the embedded reference program)
        #[arg(short, long)]
        ir: Option<PathBuf>,

        /// Output path
        #[arg(short, long, default_value = "test_ir.x")]
        output: PathBuf,

        /// Signing identifier (defaults to the output file name)
        #[arg(long)]
        identifier: Option<String>,

        /// Verbosity level (0=quiet, 1=warnings, 2=info, 3=debug)
        #[arg(short, long, default_value = "1")]
        verbosity: u8,
    },

    /// Emit a signed executable that writes a fixed message and exits
    EmitStatic {
        /// The message the program writes to stdout
        #[arg(short, long, default_value = "hello from libSystem write()!\nSecond line.\n")]
        message: String,

        /// Output path
        #[arg(short, long, default_value = "test.x")]
        output: PathBuf,

        /// Signing identifier (defaults to the output file name)
        #[arg(long)]
        identifier: Option<String>,

        /// Verbosity level (0=quiet, 1=warnings, 2=info, 3=debug)
        #[arg(short, long, default_value = "1")]
        verbosity: u8,
    },

    /// Dump the structure of a Mach-O image
    Dump {
        /// The image to inspect
        file: PathBuf,

        /// Include hex dumps of every segment, section, and linkedit region
        #[arg(long)]
        raw: bool,

        /// Verbosity level (0=quiet, 1=warnings, 2=info, 3=debug)
        #[arg(short, long, default_value = "1")]
        verbosity: u8,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Emit {
            ir,
            output,
            identifier,
            verbosity,
        } => {
            setup_logging(verbosity);
            let ir_text = match ir {
                Some(path) => fs::read_to_string(&path).map_err(|e| machforge::Error::FileRead {
                    path: path.clone(),
                    source: e,
                })?,
                None => ir::REFERENCE_IR.to_string(),
            };
            cmd_emit(&ir_text, output, identifier)
        }
        Commands::EmitStatic {
            message,
            output,
            identifier,
            verbosity,
        } => {
            setup_logging(verbosity);
            let ir_text = ir::static_message_ir(message.as_bytes());
            cmd_emit(&ir_text, output, identifier)
        }
        Commands::Dump {
            file,
            raw,
            verbosity,
        } => {
            setup_logging(verbosity);
            cmd_dump(file, raw)
        }
    }
}

fn setup_logging(verbosity: u8) {
    let level = match verbosity {
        0 => Level::ERROR,
        1 => Level::WARN,
        2 => Level::INFO,
        _ => Level::DEBUG,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .without_time()
        .finish();

    tracing::subscriber::set_global_default(subscriber).ok();
}

fn cmd_emit(ir_text: &str, output: PathBuf, identifier: Option<String>) -> Result<()> {
    let identifier = identifier.unwrap_or_else(|| {
        output
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "a.out".to_string())
    });

    let program = ir::parse_program(ir_text).context("failed to parse IR")?;
    info!("parsed {} globals, {} operations", program.globals.len(), program.ops.len());
    for op in &program.ops {
        match op {
            ir::Operation::WriteGlobal { symbol, len } => info!("  write(@{symbol}, len={len})"),
            ir::Operation::PrintI64 { value } => info!("  print_i64({value})"),
            ir::Operation::ExitCode { code } => info!("  exit({code})"),
            ir::Operation::ReturnCode { code } => info!("  ret {code}"),
        }
    }

    machforge::write_image(&program, &identifier, &output)
        .with_context(|| format!("failed to emit {}", output.display()))?;

    info!(
        "wrote {} ({} bytes)",
        output.display(),
        machforge::emit::IMAGE_SIZE
    );
    Ok(())
}

fn cmd_dump(file: PathBuf, raw: bool) -> Result<()> {
    let data = fs::read(&file).map_err(|e| machforge::Error::FileRead {
        path: file.clone(),
        source: e,
    })?;
    println!("{}: {} bytes", file.display(), data.len());

    let macho = MachOContext::parse(&data)
        .with_context(|| format!("failed to parse {}", file.display()))?;

    println!("{}", macho.header);
    println!("ncmds: {}", macho.header.ncmds);
    println!("sizeofcmds: {}", macho.header.sizeofcmds);

    for (index, lc) in macho.load_commands.iter().enumerate() {
        print!("Load command {index:2}  ");
        match lc {
            LoadCommandInfo::Segment(seg) => {
                println!(
                    "LC_SEGMENT_64       {} {}/{}",
                    seg.command,
                    prot_str(seg.command.initprot),
                    prot_str(seg.command.maxprot)
                );
                for sect in &seg.sections {
                    println!("                  {}", sect.section);
                }
            }
            LoadCommandInfo::Symtab { command, .. } => {
                println!(
                    "LC_SYMTAB           {} symbols, strings at {:#x}+{:#x}",
                    command.nsyms, command.stroff, command.strsize
                );
            }
            LoadCommandInfo::Dysymtab { command, .. } => {
                println!(
                    "LC_DYSYMTAB         {} local, {} extdef, {} undef, {} indirect",
                    command.nlocalsym, command.nextdefsym, command.nundefsym, command.nindirectsyms
                );
            }
            LoadCommandInfo::LinkeditData { command, .. } => {
                println!(
                    "{:<19} {:#x}+{:#x}",
                    linkedit_command_name(command.cmd),
                    command.dataoff,
                    command.datasize
                );
            }
            LoadCommandInfo::Dylib { name, command, .. } => {
                println!(
                    "LC_LOAD_DYLIB       {} (compat {}, current {})",
                    name,
                    version_string(command.dylib.compatibility_version),
                    version_string(command.dylib.current_version)
                );
            }
            LoadCommandInfo::Dylinker { name, .. } => {
                println!("LC_LOAD_DYLINKER    {name}");
            }
            LoadCommandInfo::Uuid { command, .. } => {
                println!("LC_UUID             {}", command.uuid_string());
            }
            LoadCommandInfo::BuildVersion { command, tools, .. } => {
                print!(
                    "LC_BUILD_VERSION    platform {}, minos {}",
                    command.platform,
                    version_string(command.minos)
                );
                for tool in tools {
                    print!(", tool {} {}", tool.tool, version_string(tool.version));
                }
                println!();
            }
            LoadCommandInfo::SourceVersion { command, .. } => {
                println!("LC_SOURCE_VERSION   {:#x}", command.version);
            }
            LoadCommandInfo::Main { command, .. } => {
                println!("LC_MAIN             entryoff {:#x}", command.entryoff);
            }
            LoadCommandInfo::Unknown { cmd, cmdsize, .. } => {
                println!("unknown cmd {cmd:#x} ({cmdsize} bytes)");
                warn!("unknown load command {cmd:#x}");
            }
        }
    }

    dump_instructions(&macho, "__text")?;
    dump_instructions(&macho, "__stubs")?;
    dump_cstrings(&macho)?;
    dump_got(&macho)?;
    dump_symbols(&macho)?;
    dump_function_starts(&macho)?;

    if raw {
        dump_raw_regions(&macho)?;
    }

    Ok(())
}

fn linkedit_command_name(cmd: u32) -> &'static str {
    use machforge::macho::*;
    match cmd {
        LC_CODE_SIGNATURE => "LC_CODE_SIGNATURE",
        LC_FUNCTION_STARTS => "LC_FUNCTION_STARTS",
        LC_DATA_IN_CODE => "LC_DATA_IN_CODE",
        LC_DYLD_EXPORTS_TRIE => "LC_DYLD_EXPORTS_TRIE",
        LC_DYLD_CHAINED_FIXUPS => "LC_DYLD_CHAINED_FIXUPS",
        _ => "LC_?",
    }
}

/// Renders VM protection bits in the conventional rwx form.
fn prot_str(prot: u32) -> String {
    use machforge::macho::{VM_PROT_EXECUTE, VM_PROT_READ, VM_PROT_WRITE};
    format!(
        "{}{}{}",
        if prot & VM_PROT_READ != 0 { "r" } else { "-" },
        if prot & VM_PROT_WRITE != 0 { "w" } else { "-" },
        if prot & VM_PROT_EXECUTE != 0 { "x" } else { "-" },
    )
}

/// Renders a packed X.Y.Z version.
fn version_string(version: u32) -> String {
    format!(
        "{}.{}.{}",
        version >> 16,
        (version >> 8) & 0xFF,
        version & 0xFF
    )
}

/// Disassembles an instruction section of `__TEXT`.
fn dump_instructions(macho: &MachOContext, section: &str) -> Result<()> {
    let Some(seg) = macho.segment("__TEXT") else {
        return Ok(());
    };
    let Some(sect) = seg.section(section) else {
        return Ok(());
    };
    if !sect.section.has_instructions() {
        return Ok(());
    }

    println!("\n{}:", sect.full_name());
    let bytes = macho.section_bytes("__TEXT", section)?;
    for offset in (0..bytes.len().saturating_sub(3)).step_by(4) {
        let word = read_u32_le_at(bytes, offset);
        println!(
            "  {:#010x}:  {:08x}  {}",
            sect.section.addr + offset as u64,
            word,
            disassemble(word)
        );
    }
    Ok(())
}

/// Prints the NUL-separated contents of `__cstring`.
fn dump_cstrings(macho: &MachOContext) -> Result<()> {
    let Some(seg) = macho.segment("__TEXT") else {
        return Ok(());
    };
    if seg.section("__cstring").is_none() {
        return Ok(());
    }

    println!("\n__TEXT,__cstring:");
    let bytes = macho.section_bytes("__TEXT", "__cstring")?;
    for s in split_cstrings(bytes) {
        println!("  {:?}", String::from_utf8_lossy(s));
    }
    Ok(())
}

/// Prints the GOT slots.
fn dump_got(macho: &MachOContext) -> Result<()> {
    let Some(seg) = macho.segment("__DATA_CONST") else {
        return Ok(());
    };
    let Some(sect) = seg.section("__got") else {
        return Ok(());
    };

    println!("\n__DATA_CONST,__got:");
    let bytes = macho.section_bytes("__DATA_CONST", "__got")?;
    for offset in (0..bytes.len().saturating_sub(7)).step_by(8) {
        println!(
            "  {:#010x}:  {:#018x}",
            sect.section.addr + offset as u64,
            read_u64_le_at(bytes, offset)
        );
    }
    Ok(())
}

/// Prints the symbol table.
fn dump_symbols(macho: &MachOContext) -> Result<()> {
    let symbols = match macho.symbols() {
        Ok(symbols) => symbols,
        Err(_) => return Ok(()),
    };

    println!("\nsymbols:");
    for (name, nlist) in symbols {
        println!(
            "  {:#018x}  type {:#04x} sect {} desc {:#06x}  {}",
            nlist.n_value, nlist.n_type, nlist.n_sect, nlist.n_desc, name
        );
    }
    Ok(())
}

/// Decodes the function-starts ULEB128 stream.
fn dump_function_starts(macho: &MachOContext) -> Result<()> {
    let command = macho.load_commands.iter().find_map(|lc| match lc {
        LoadCommandInfo::LinkeditData { command, .. }
            if command.cmd == machforge::macho::LC_FUNCTION_STARTS =>
        {
            Some(*command)
        }
        _ => None,
    });
    let Some(command) = command else {
        return Ok(());
    };

    let mut bytes = macho.region_bytes(command.dataoff as usize, command.datasize as usize)?;
    println!("\nfunction starts:");
    let mut address = 0u64;
    while let Some((delta, consumed)) = read_uleb128(bytes) {
        if delta == 0 {
            break;
        }
        address += delta;
        println!("  {:#x}", address);
        bytes = &bytes[consumed..];
    }
    Ok(())
}

/// Hex dumps every segment, section, and linkedit region.
fn dump_raw_regions(macho: &MachOContext) -> Result<()> {
    for seg in macho.segments() {
        if seg.command.filesize == 0 {
            continue;
        }
        if seg.sections.is_empty() {
            print_segment_raw(macho, seg)?;
            continue;
        }
        for sect in &seg.sections {
            println!("\nraw {}:", sect.full_name());
            let bytes = macho.region_bytes(sect.section.offset as usize, sect.section.size as usize)?;
            hexdump(bytes, sect.section.addr);
        }
    }

    for lc in &macho.load_commands {
        if let LoadCommandInfo::LinkeditData { command, .. } = lc {
            if command.datasize == 0 {
                continue;
            }
            println!("\nraw {}:", linkedit_command_name(command.cmd));
            let bytes = macho.region_bytes(command.dataoff as usize, command.datasize as usize)?;
            hexdump(bytes, command.dataoff as u64);
        }
    }

    Ok(())
}

fn print_segment_raw(macho: &MachOContext, seg: &SegmentInfo) -> Result<()> {
    println!("\nraw {}:", seg.name());
    let bytes = macho.region_bytes(seg.command.fileoff as usize, seg.command.filesize as usize)?;
    hexdump(bytes, seg.command.vmaddr);
    Ok(())
}

/// Prints a 16-byte-per-line hex dump with an ASCII gutter.
fn hexdump(bytes: &[u8], base: u64) {
    for (row, chunk) in bytes.chunks(16).enumerate() {
        print!("  {:#010x}: ", base + row as u64 * 16);
        for i in 0..16 {
            match chunk.get(i) {
                Some(b) => print!("{b:02x} "),
                None => print!("   "),
            }
        }
        print!(" ");
        for &b in chunk {
            let c = if (0x20..0x7F).contains(&b) { b as char } else { '.' };
            print!("{c}");
        }
        println!();
    }
}
