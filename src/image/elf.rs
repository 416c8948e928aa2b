//! ELF32 reader for ARM executables
//!
//! Only the section headers are consulted. Every field is read through bounds checked
//! accessors, so a truncated or corrupt input yields an error rather than a panic.

use byteorder::{ByteOrder, LittleEndian};
use log::{info, trace};
use thiserror::Error;

use super::{ImageError, MemoryImage};

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

/// The size of an ELF32 file header
const HEADER_SIZE: usize = 52;

/// The size of an ELF32 section header
const SECTION_HEADER_SIZE: usize = 40;

const ET_EXEC: u16 = 0x02;
const EM_ARM: u16 = 0x28;
const SHT_NULL: u32 = 0;
const SHF_ALLOC: u32 = 0x2;

/// The sections that make up the flash image, in placement order
const FLASH_SECTIONS: [&str; 4] = [".text", ".ARM.extab", ".ARM.exidx", ".data"];

/// The section whose load image is placed directly after everything else
const DATA_SECTION: &str = ".data";

/// Errors that indicate what went wrong during parsing
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Missing ELF header")]
    MissingHeader,
    #[error("Input does not contain ELF magic header")]
    InvalidMagicHeader,
    #[error("Input ELF is 64-bit, only 32-bit is supported")]
    ElfIs64Bit,
    #[error("Input has an unsupported ELF version, expected 1")]
    InvalidElfVersion,
    #[error("Input endianness is unsupported, only little endian is supported")]
    UnsupportedEndianness,
    #[error("Input has an unsupported machine type, only ARM is supported")]
    UnsupportedMachineType,
    #[error("Input is an unsupported file type, only executable files are supported")]
    UnsupportedFileType,
    #[error("Section header entries are {} bytes, expected at least {}", _0, SECTION_HEADER_SIZE)]
    InvalidSectionHeaderSize(u16),
    #[error("Section name table index {} is out of range", _0)]
    InvalidStringTable(u16),
    #[error("{} bytes at offset {:#x} lie outside the {} byte input", len, offset, size)]
    OutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },
}

/// The ELF32 header fields needed to walk the section table
#[derive(Debug)]
pub struct Header {
    /// The program entry address
    entry_addr: u32,
    /// The section header offset
    sh_offset: u32,
    /// The size of a section header entry
    sh_entry_size: u16,
    /// The number of section header entries
    sh_entry_num: u16,
    /// The index of the section header that contains the names for the sections
    sh_str_idx: u16,
}

/// ELF32 Section Header
#[derive(Debug)]
pub struct SectionHeader {
    /// Offset to a string in the .shstrtab section with the name of this section
    name_offset: u32,
    /// The type of this section
    typ: u32,
    /// The attributes of this section
    flags: u32,
    /// Virtual address for this section, if it's to be loaded into memory
    virt_addr: u32,
    /// Offset to the section in the file image
    offset: u32,
    /// The size of the section in the file image, in bytes
    size: u32,
}

/// A named, allocatable section and its contents
#[derive(Debug)]
pub struct Section<'a> {
    pub name: String,
    pub address: u32,
    pub data: &'a [u8],
}

/// A simple ELF32 parser over an in-memory file
#[derive(Debug)]
pub struct ElfParser<'a> {
    data: &'a [u8],
}

impl<'a> ElfParser<'a> {
    pub fn new(data: &'a [u8]) -> ElfParser<'a> {
        ElfParser { data }
    }

    /// Returns `len` bytes at `offset`, or an error if they are not all within the input
    fn bytes(&self, offset: usize, len: usize) -> Result<&'a [u8], ParseError> {
        offset
            .checked_add(len)
            .and_then(|end| self.data.get(offset..end))
            .ok_or(ParseError::OutOfBounds {
                offset,
                len,
                size: self.data.len(),
            })
    }

    fn u16_at(&self, offset: usize) -> Result<u16, ParseError> {
        Ok(LittleEndian::read_u16(self.bytes(offset, 2)?))
    }

    fn u32_at(&self, offset: usize) -> Result<u32, ParseError> {
        Ok(LittleEndian::read_u32(self.bytes(offset, 4)?))
    }

    pub fn parse_header(&self) -> Result<Header, ParseError> {
        let ident = self
            .bytes(0, HEADER_SIZE)
            .map_err(|_| ParseError::MissingHeader)?;

        // Ensure that the header starts with the magic value
        if ident[0x0..0x4] != ELF_MAGIC {
            return Err(ParseError::InvalidMagicHeader);
        }

        // Only the 32-bit class is supported
        if ident[0x4] != 1 {
            return Err(ParseError::ElfIs64Bit);
        }

        if ident[0x5] != 1 {
            return Err(ParseError::UnsupportedEndianness);
        }

        if ident[0x6] != 1 {
            return Err(ParseError::InvalidElfVersion);
        }

        if self.u16_at(0x10)? != ET_EXEC {
            return Err(ParseError::UnsupportedFileType);
        }

        if self.u16_at(0x12)? != EM_ARM {
            return Err(ParseError::UnsupportedMachineType);
        }

        let header = Header {
            entry_addr: self.u32_at(0x18)?,
            sh_offset: self.u32_at(0x20)?,
            sh_entry_size: self.u16_at(0x2e)?,
            sh_entry_num: self.u16_at(0x30)?,
            sh_str_idx: self.u16_at(0x32)?,
        };

        if (header.sh_entry_size as usize) < SECTION_HEADER_SIZE {
            return Err(ParseError::InvalidSectionHeaderSize(header.sh_entry_size));
        }

        if header.sh_str_idx >= header.sh_entry_num {
            return Err(ParseError::InvalidStringTable(header.sh_str_idx));
        }

        trace!("{:?}", header);

        Ok(header)
    }

    /// Reads section header number `index`
    pub fn section_header(&self, header: &Header, index: u16) -> Result<SectionHeader, ParseError> {
        let base = (header.sh_offset as usize)
            .checked_add(index as usize * header.sh_entry_size as usize)
            .ok_or(ParseError::OutOfBounds {
                offset: header.sh_offset as usize,
                len: SECTION_HEADER_SIZE,
                size: self.data.len(),
            })?;

        // Validate the whole entry up front
        self.bytes(base, SECTION_HEADER_SIZE)?;

        Ok(SectionHeader {
            name_offset: self.u32_at(base)?,
            typ: self.u32_at(base + 0x4)?,
            flags: self.u32_at(base + 0x8)?,
            virt_addr: self.u32_at(base + 0xc)?,
            offset: self.u32_at(base + 0x10)?,
            size: self.u32_at(base + 0x14)?,
        })
    }

    /// Returns the NUL terminated name of `section` from the string table `strtab`
    fn section_name(&self, strtab: &SectionHeader, section: &SectionHeader) -> Result<String, ParseError> {
        let table = self.bytes(strtab.offset as usize, strtab.size as usize)?;
        let start = section.name_offset as usize;
        let name = table.get(start..).ok_or(ParseError::OutOfBounds {
            offset: strtab.offset as usize + start,
            len: 1,
            size: self.data.len(),
        })?;
        let end = name.iter().position(|&b| b == 0).unwrap_or(name.len());

        Ok(String::from_utf8_lossy(&name[..end]).into_owned())
    }

    /// Returns every non-empty, allocatable section
    pub fn sections(&self, header: &Header) -> Result<Vec<Section<'a>>, ParseError> {
        let strtab = self.section_header(header, header.sh_str_idx)?;
        let mut sections = Vec::new();

        for index in 0..header.sh_entry_num {
            if index == header.sh_str_idx {
                continue;
            }

            let section = self.section_header(header, index)?;

            if section.typ == SHT_NULL || section.size == 0 || section.flags & SHF_ALLOC == 0 {
                continue;
            }

            let name = self.section_name(&strtab, &section)?;
            let data = self.bytes(section.offset as usize, section.size as usize)?;

            trace!("Section {} at {:#010x}, {} bytes", name, section.virt_addr, section.size);

            sections.push(Section {
                name,
                address: section.virt_addr,
                data,
            });
        }

        Ok(sections)
    }
}

/// Lays out the flash sections of an ARM executable in an image of `capacity` bytes.
///
/// `.data` is placed right after the highest byte loaded before it, which is where the startup
/// code copies its initial values from.
pub fn from_bytes(bytes: &[u8], capacity: usize) -> Result<MemoryImage, ImageError> {
    let parser = ElfParser::new(bytes);
    let header = parser.parse_header()?;
    let sections = parser.sections(&header)?;
    let mut image = MemoryImage::new(capacity);

    trace!("Entry point {:#010x}", header.entry_addr);

    for &name in FLASH_SECTIONS.iter() {
        for section in sections.iter().filter(|section| section.name == name) {
            let address = if name == DATA_SECTION && !image.is_empty() {
                image.end_address() + 1
            } else {
                section.address
            };

            image.write(address, section.data)?;

            info!(
                "{:>12}  {:#010x} --> {:#010x}",
                section.name,
                address,
                image.end_address()
            );
        }
    }

    Ok(image)
}
