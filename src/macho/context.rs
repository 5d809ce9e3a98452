//! Mach-O reader: header validation and load-command walking.

use std::collections::HashMap;

use zerocopy::FromBytes;

use crate::error::{Error, Result};
use crate::util::memchr_null;

use super::constants::*;
use super::structs::*;

// =============================================================================
// Segment Info
// =============================================================================

/// Parsed segment information.
#[derive(Debug, Clone)]
pub struct SegmentInfo {
    /// The segment command
    pub command: SegmentCommand64,
    /// Offset of the segment command in the file
    pub command_offset: usize,
    /// Sections in this segment
    pub sections: Vec<SectionInfo>,
}

impl SegmentInfo {
    /// Returns the segment name.
    pub fn name(&self) -> &str {
        self.command.name()
    }

    /// Returns a section by name.
    pub fn section(&self, name: &str) -> Option<&SectionInfo> {
        self.sections.iter().find(|s| s.section.name() == name)
    }
}

/// Parsed section information.
#[derive(Debug, Clone)]
pub struct SectionInfo {
    /// The section structure
    pub section: Section64,
    /// Offset of the section structure in the file
    pub struct_offset: usize,
}

impl SectionInfo {
    /// Returns the section name.
    pub fn name(&self) -> &str {
        self.section.name()
    }

    /// Returns the full name (segment,section).
    pub fn full_name(&self) -> String {
        format!("{},{}", self.section.segment_name(), self.section.name())
    }
}

// =============================================================================
// Load Command Info
// =============================================================================

/// Parsed load command information.
///
/// Unknown load commands are surfaced as [`LoadCommandInfo::Unknown`] and do
/// not halt iteration.
#[derive(Debug, Clone)]
#[allow(missing_docs)] // Variants are self-documenting via names
pub enum LoadCommandInfo {
    Segment(SegmentInfo),
    Symtab {
        command: SymtabCommand,
        offset: usize,
    },
    Dysymtab {
        command: DysymtabCommand,
        offset: usize,
    },
    LinkeditData {
        command: LinkeditDataCommand,
        offset: usize,
    },
    Dylib {
        command: DylibCommand,
        name: String,
        offset: usize,
    },
    Dylinker {
        command: DylinkerCommand,
        name: String,
        offset: usize,
    },
    Uuid {
        command: UuidCommand,
        offset: usize,
    },
    BuildVersion {
        command: BuildVersionCommand,
        tools: Vec<BuildToolVersion>,
        offset: usize,
    },
    SourceVersion {
        command: SourceVersionCommand,
        offset: usize,
    },
    Main {
        command: EntryPointCommand,
        offset: usize,
    },
    Unknown {
        cmd: u32,
        cmdsize: u32,
        offset: usize,
    },
}

impl LoadCommandInfo {
    /// Returns the load command offset.
    pub fn offset(&self) -> usize {
        match self {
            LoadCommandInfo::Segment(s) => s.command_offset,
            LoadCommandInfo::Symtab { offset, .. } => *offset,
            LoadCommandInfo::Dysymtab { offset, .. } => *offset,
            LoadCommandInfo::LinkeditData { offset, .. } => *offset,
            LoadCommandInfo::Dylib { offset, .. } => *offset,
            LoadCommandInfo::Dylinker { offset, .. } => *offset,
            LoadCommandInfo::Uuid { offset, .. } => *offset,
            LoadCommandInfo::BuildVersion { offset, .. } => *offset,
            LoadCommandInfo::SourceVersion { offset, .. } => *offset,
            LoadCommandInfo::Main { offset, .. } => *offset,
            LoadCommandInfo::Unknown { offset, .. } => *offset,
        }
    }
}

// =============================================================================
// Mach-O Context
// =============================================================================

/// A parsed Mach-O image.
///
/// Holds a copy of the raw bytes plus parsed load commands, with
/// bounds-checked accessors for segment, section, and LINKEDIT content.
#[derive(Debug)]
pub struct MachOContext {
    /// The Mach-O header
    pub header: MachHeader64,
    /// The raw image bytes
    pub data: Vec<u8>,
    /// Parsed load commands
    pub load_commands: Vec<LoadCommandInfo>,
    /// Segment lookup by name
    segment_indices: HashMap<String, usize>,
}

impl MachOContext {
    /// Parses a Mach-O image, validating the magic and CPU type.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < MachHeader64::SIZE {
            return Err(Error::buffer_too_small(MachHeader64::SIZE, data.len()));
        }

        let header = MachHeader64::read_from_prefix(data)
            .map_err(|_| Error::InvalidMachoMagic(0))?
            .0;

        if !header.is_valid() {
            return Err(Error::InvalidMachoMagic(header.magic));
        }
        if !header.is_arm64() {
            return Err(Error::UnsupportedCpuType(header.cputype));
        }

        let mut ctx = Self {
            header,
            data: data.to_vec(),
            load_commands: Vec::new(),
            segment_indices: HashMap::new(),
        };

        ctx.parse_load_commands()?;

        Ok(ctx)
    }

    /// Parses all load commands.
    fn parse_load_commands(&mut self) -> Result<()> {
        let mut offset = MachHeader64::SIZE;
        let end_offset = MachHeader64::SIZE + self.header.sizeofcmds as usize;

        for _ in 0..self.header.ncmds {
            if offset + LoadCommand::SIZE > end_offset
                || offset + LoadCommand::SIZE > self.data.len()
            {
                return Err(Error::LoadCommandOverflow { offset });
            }

            let lc = LoadCommand::read_from_prefix(&self.data[offset..])
                .map_err(|_| Error::parse(offset, "failed to parse load command"))?
                .0;

            if (lc.cmdsize as usize) < LoadCommand::SIZE
                || offset + lc.cmdsize as usize > self.data.len()
            {
                return Err(Error::LoadCommandOverflow { offset });
            }

            let cmd_data = &self.data[offset..offset + lc.cmdsize as usize];
            let cmd_info = parse_load_command(lc.cmd, cmd_data, offset)?;

            if let LoadCommandInfo::Segment(ref seg) = cmd_info {
                self.segment_indices
                    .insert(seg.name().to_string(), self.load_commands.len());
            }

            self.load_commands.push(cmd_info);
            offset += lc.cmdsize as usize;
        }

        Ok(())
    }

    /// Returns a segment by name.
    pub fn segment(&self, name: &str) -> Option<&SegmentInfo> {
        let index = *self.segment_indices.get(name)?;
        match &self.load_commands[index] {
            LoadCommandInfo::Segment(seg) => Some(seg),
            _ => None,
        }
    }

    /// Iterates over all segments in load-command order.
    pub fn segments(&self) -> impl Iterator<Item = &SegmentInfo> {
        self.load_commands.iter().filter_map(|lc| match lc {
            LoadCommandInfo::Segment(seg) => Some(seg),
            _ => None,
        })
    }

    /// Returns a bounds-checked byte region of the image.
    pub fn region_bytes(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let end = offset
            .checked_add(len)
            .ok_or_else(|| Error::buffer_too_small(usize::MAX, self.data.len()))?;
        if end > self.data.len() {
            return Err(Error::buffer_too_small(end, self.data.len()));
        }
        Ok(&self.data[offset..end])
    }

    /// Returns the file bytes of a named section.
    pub fn section_bytes(&self, segment: &str, section: &str) -> Result<&[u8]> {
        let seg = self.segment(segment).ok_or_else(|| Error::SectionNotFound {
            segment: segment.to_string(),
            section: section.to_string(),
        })?;
        let sect = seg.section(section).ok_or_else(|| Error::SectionNotFound {
            segment: segment.to_string(),
            section: section.to_string(),
        })?;
        self.region_bytes(sect.section.offset as usize, sect.section.size as usize)
    }

    /// Parses the symbol table into (name, entry) pairs.
    pub fn symbols(&self) -> Result<Vec<(String, Nlist64)>> {
        let symtab = self
            .load_commands
            .iter()
            .find_map(|lc| match lc {
                LoadCommandInfo::Symtab { command, .. } => Some(*command),
                _ => None,
            })
            .ok_or_else(|| Error::parse(0, "no LC_SYMTAB present"))?;

        let entries = self.region_bytes(
            symtab.symoff as usize,
            symtab.nsyms as usize * Nlist64::SIZE,
        )?;
        let strtab = self.region_bytes(symtab.stroff as usize, symtab.strsize as usize)?;

        let mut out = Vec::with_capacity(symtab.nsyms as usize);
        for chunk in entries.chunks_exact(Nlist64::SIZE) {
            let nlist = Nlist64::read_from_prefix(chunk)
                .map_err(|_| Error::parse(symtab.symoff as usize, "bad nlist entry"))?
                .0;
            let strx = nlist.n_strx as usize;
            let name = if strx < strtab.len() {
                let rest = &strtab[strx..];
                let end = memchr_null(rest);
                String::from_utf8_lossy(&rest[..end]).into_owned()
            } else {
                String::new()
            };
            out.push((name, nlist));
        }
        Ok(out)
    }
}

/// Splits a `__cstring` image on NUL boundaries.
pub fn split_cstrings(bytes: &[u8]) -> Vec<&[u8]> {
    let mut out = Vec::new();
    let mut rest = bytes;
    while !rest.is_empty() {
        let end = memchr_null(rest);
        out.push(&rest[..end]);
        if end >= rest.len() {
            break;
        }
        rest = &rest[end + 1..];
    }
    out
}

/// Parses a single load command.
fn parse_load_command(cmd: u32, data: &[u8], offset: usize) -> Result<LoadCommandInfo> {
    match cmd {
        LC_SEGMENT_64 => {
            let seg = SegmentCommand64::read_from_prefix(data)
                .map_err(|_| Error::parse(offset, "failed to parse segment command"))?
                .0;

            let mut sections = Vec::with_capacity(seg.nsects as usize);
            let mut sect_offset = SegmentCommand64::SIZE;

            for _ in 0..seg.nsects {
                if sect_offset + Section64::SIZE > data.len() {
                    return Err(Error::LoadCommandOverflow {
                        offset: offset + sect_offset,
                    });
                }
                let sect = Section64::read_from_prefix(&data[sect_offset..])
                    .map_err(|_| Error::parse(offset + sect_offset, "failed to parse section"))?
                    .0;

                sections.push(SectionInfo {
                    section: sect,
                    struct_offset: offset + sect_offset,
                });

                sect_offset += Section64::SIZE;
            }

            Ok(LoadCommandInfo::Segment(SegmentInfo {
                command: seg,
                command_offset: offset,
                sections,
            }))
        }

        LC_SYMTAB => {
            let command = SymtabCommand::read_from_prefix(data)
                .map_err(|_| Error::parse(offset, "failed to parse symtab command"))?
                .0;
            Ok(LoadCommandInfo::Symtab { command, offset })
        }

        LC_DYSYMTAB => {
            let command = DysymtabCommand::read_from_prefix(data)
                .map_err(|_| Error::parse(offset, "failed to parse dysymtab command"))?
                .0;
            Ok(LoadCommandInfo::Dysymtab { command, offset })
        }

        LC_CODE_SIGNATURE | LC_FUNCTION_STARTS | LC_DATA_IN_CODE | LC_DYLD_EXPORTS_TRIE
        | LC_DYLD_CHAINED_FIXUPS => {
            let command = LinkeditDataCommand::read_from_prefix(data)
                .map_err(|_| Error::parse(offset, "failed to parse linkedit data command"))?
                .0;
            Ok(LoadCommandInfo::LinkeditData { command, offset })
        }

        LC_LOAD_DYLIB => {
            let command = DylibCommand::read_from_prefix(data)
                .map_err(|_| Error::parse(offset, "failed to parse dylib command"))?
                .0;
            let name = embedded_name(data, command.dylib.name_offset as usize);
            Ok(LoadCommandInfo::Dylib {
                command,
                name,
                offset,
            })
        }

        LC_LOAD_DYLINKER => {
            let command = DylinkerCommand::read_from_prefix(data)
                .map_err(|_| Error::parse(offset, "failed to parse dylinker command"))?
                .0;
            let name = embedded_name(data, command.name_offset as usize);
            Ok(LoadCommandInfo::Dylinker {
                command,
                name,
                offset,
            })
        }

        LC_UUID => {
            let command = UuidCommand::read_from_prefix(data)
                .map_err(|_| Error::parse(offset, "failed to parse uuid command"))?
                .0;
            Ok(LoadCommandInfo::Uuid { command, offset })
        }

        LC_BUILD_VERSION => {
            let command = BuildVersionCommand::read_from_prefix(data)
                .map_err(|_| Error::parse(offset, "failed to parse build version command"))?
                .0;
            let mut tools = Vec::with_capacity(command.ntools as usize);
            let mut tool_offset = BuildVersionCommand::SIZE;
            for _ in 0..command.ntools {
                if tool_offset + BuildToolVersion::SIZE > data.len() {
                    break;
                }
                if let Ok((tool, _)) = BuildToolVersion::read_from_prefix(&data[tool_offset..]) {
                    tools.push(tool);
                }
                tool_offset += BuildToolVersion::SIZE;
            }
            Ok(LoadCommandInfo::BuildVersion {
                command,
                tools,
                offset,
            })
        }

        LC_SOURCE_VERSION => {
            let command = SourceVersionCommand::read_from_prefix(data)
                .map_err(|_| Error::parse(offset, "failed to parse source version command"))?
                .0;
            Ok(LoadCommandInfo::SourceVersion { command, offset })
        }

        LC_MAIN => {
            let command = EntryPointCommand::read_from_prefix(data)
                .map_err(|_| Error::parse(offset, "failed to parse entry point command"))?
                .0;
            Ok(LoadCommandInfo::Main { command, offset })
        }

        _ => {
            let lc = LoadCommand::read_from_prefix(data)
                .map_err(|_| Error::parse(offset, "failed to parse load command"))?
                .0;
            Ok(LoadCommandInfo::Unknown {
                cmd,
                cmdsize: lc.cmdsize,
                offset,
            })
        }
    }
}

/// Reads the NUL-terminated name embedded after a load command header.
fn embedded_name(data: &[u8], name_offset: usize) -> String {
    if name_offset >= data.len() {
        return String::new();
    }
    let rest = &data[name_offset..];
    let end = memchr_null(rest);
    String::from_utf8_lossy(&rest[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_bad_magic() {
        let mut data = vec![0u8; 64];
        data[..4].copy_from_slice(&0xCAFE_BABEu32.to_le_bytes());
        assert!(matches!(
            MachOContext::parse(&data),
            Err(Error::InvalidMachoMagic(_))
        ));
    }

    #[test]
    fn test_rejects_wrong_cpu() {
        let mut data = vec![0u8; 64];
        data[..4].copy_from_slice(&MH_MAGIC_64.to_le_bytes());
        data[4..8].copy_from_slice(&CPU_TYPE_X86_64.to_le_bytes());
        assert!(matches!(
            MachOContext::parse(&data),
            Err(Error::UnsupportedCpuType(_))
        ));
    }

    #[test]
    fn test_truncated_load_commands_fail() {
        let mut data = vec![0u8; MachHeader64::SIZE];
        data[..4].copy_from_slice(&MH_MAGIC_64.to_le_bytes());
        data[4..8].copy_from_slice(&CPU_TYPE_ARM64.to_le_bytes());
        // Claim one load command but provide no bytes for it.
        data[16..20].copy_from_slice(&1u32.to_le_bytes());
        data[20..24].copy_from_slice(&8u32.to_le_bytes());
        assert!(matches!(
            MachOContext::parse(&data),
            Err(Error::LoadCommandOverflow { .. })
        ));
    }

    #[test]
    fn test_split_cstrings() {
        let strings = split_cstrings(b"hello\0world\0");
        assert_eq!(strings, vec![b"hello".as_slice(), b"world".as_slice()]);
        assert_eq!(split_cstrings(b""), Vec::<&[u8]>::new());
    }
}
