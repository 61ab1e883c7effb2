//! # ELF Parsing
//!
//! A bounds-checked reader for little-endian ELF32 (i386) and ELF64 (x86-64)
//! images. Headers are decoded field by field from their on-disk offsets, so
//! the input never needs to be aligned.

use alloc::vec::Vec;

use crate::BsdError;
use crate::bytes::{c_str, read_u8, read_u16_le, read_u32_le, read_u64_le, read_word_le, slice};

pub const EM_386: u16 = 3;
pub const EM_X86_64: u16 = 62;

pub const ET_REL: u16 = 1;
pub const ET_EXEC: u16 = 2;
pub const ET_DYN: u16 = 3;

pub const PT_LOAD: u32 = 1;
pub const PT_DYNAMIC: u32 = 2;

pub const SHT_PROGBITS: u32 = 1;
pub const SHT_SYMTAB: u32 = 2;
pub const SHT_STRTAB: u32 = 3;
pub const SHT_NOBITS: u32 = 8;

pub const SHF_ALLOC: u64 = 0x2;

const EI_MAGIC_BYTES: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELFCLASS32: u8 = 1;
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const EV_CURRENT: u8 = 1;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ElfError {
    #[error("Not an ELF image")]
    NotElf,
    #[error("Unsupported ELF class")]
    UnsupportedClass,
    #[error("Unsupported ELF byte order or version")]
    UnsupportedEncoding,
    #[error("Unsupported machine type {0}")]
    UnsupportedMachine(u16),
    #[error("Header table entries are smaller than the format requires")]
    BadEntrySize,
    #[error("The image is shorter than its headers declare")]
    Truncated,
}

impl From<ElfError> for BsdError {
    fn from(value: ElfError) -> Self {
        match value {
            ElfError::NotElf => Self::BadFormat("not an ELF image"),
            ElfError::UnsupportedClass => Self::BadFormat("unsupported ELF class"),
            ElfError::UnsupportedEncoding => Self::BadFormat("unsupported ELF encoding"),
            ElfError::UnsupportedMachine(_) => Self::BadFormat("unsupported ELF machine"),
            ElfError::BadEntrySize => Self::BadFormat("invalid ELF header table"),
            ElfError::Truncated => Self::ReadError("ELF image"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfClass {
    Elf32,
    Elf64,
}

impl ElfClass {
    #[must_use]
    pub const fn is_64(self) -> bool {
        matches!(self, Self::Elf64)
    }

    /// Native address size in bytes.
    #[must_use]
    pub const fn word_size(self) -> usize {
        match self {
            Self::Elf32 => 4,
            Self::Elf64 => 8,
        }
    }

    #[must_use]
    pub const fn ehdr_size(self) -> usize {
        match self {
            Self::Elf32 => 52,
            Self::Elf64 => 64,
        }
    }

    #[must_use]
    pub const fn phdr_size(self) -> usize {
        match self {
            Self::Elf32 => 32,
            Self::Elf64 => 56,
        }
    }

    #[must_use]
    pub const fn shdr_size(self) -> usize {
        match self {
            Self::Elf32 => 40,
            Self::Elf64 => 64,
        }
    }

    #[must_use]
    pub const fn sym_size(self) -> usize {
        match self {
            Self::Elf32 => 16,
            Self::Elf64 => 24,
        }
    }

    const fn machine(self) -> u16 {
        match self {
            Self::Elf32 => EM_386,
            Self::Elf64 => EM_X86_64,
        }
    }
}

/// Byte offsets of the header fields the loader rewrites.
pub mod offsets {
    use super::ElfClass;

    #[must_use]
    pub const fn e_phoff(class: ElfClass) -> usize {
        match class {
            ElfClass::Elf32 => 28,
            ElfClass::Elf64 => 32,
        }
    }

    #[must_use]
    pub const fn e_shoff(class: ElfClass) -> usize {
        match class {
            ElfClass::Elf32 => 32,
            ElfClass::Elf64 => 40,
        }
    }

    #[must_use]
    pub const fn e_phentsize(class: ElfClass) -> usize {
        match class {
            ElfClass::Elf32 => 42,
            ElfClass::Elf64 => 54,
        }
    }

    #[must_use]
    pub const fn e_phnum(class: ElfClass) -> usize {
        e_phentsize(class) + 2
    }

    #[must_use]
    pub const fn e_shstrndx(class: ElfClass) -> usize {
        match class {
            ElfClass::Elf32 => 50,
            ElfClass::Elf64 => 62,
        }
    }

    #[must_use]
    pub const fn sh_addr(class: ElfClass) -> usize {
        match class {
            ElfClass::Elf32 => 12,
            ElfClass::Elf64 => 16,
        }
    }

    #[must_use]
    pub const fn sh_offset(class: ElfClass) -> usize {
        match class {
            ElfClass::Elf32 => 16,
            ElfClass::Elf64 => 24,
        }
    }
}

/// Writes an address-sized little-endian value into a raw header copy.
///
/// # Errors
/// [`ElfError::Truncated`] when the field lies outside `buf`.
#[allow(clippy::cast_possible_truncation)]
pub fn put_word(buf: &mut [u8], off: usize, value: u64, class: ElfClass) -> Result<(), ElfError> {
    let n = class.word_size();
    let dst = buf.get_mut(off..off + n).ok_or(ElfError::Truncated)?;
    match class {
        ElfClass::Elf32 => dst.copy_from_slice(&(value as u32).to_le_bytes()),
        ElfClass::Elf64 => dst.copy_from_slice(&value.to_le_bytes()),
    }
    Ok(())
}

/// Writes a little-endian `u16` into a raw header copy.
///
/// # Errors
/// [`ElfError::Truncated`] when the field lies outside `buf`.
pub fn put_half(buf: &mut [u8], off: usize, value: u16) -> Result<(), ElfError> {
    buf.get_mut(off..off + 2)
        .ok_or(ElfError::Truncated)?
        .copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::struct_field_names)]
pub struct ElfHeader {
    pub class: ElfClass,
    pub e_type: u16,
    pub e_machine: u16,
    pub e_entry: u64,
    pub e_phoff: u64,
    pub e_shoff: u64,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramHeader {
    pub p_type: u32,
    pub offset: u64,
    pub vaddr: u64,
    pub paddr: u64,
    pub filesz: u64,
    pub memsz: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionHeader {
    pub name: u32,
    pub sh_type: u32,
    pub flags: u64,
    pub addr: u64,
    pub offset: u64,
    pub size: u64,
    pub link: u32,
    pub addralign: u64,
    pub entsize: u64,
}

impl SectionHeader {
    #[must_use]
    pub const fn is_alloc(&self) -> bool {
        self.flags & SHF_ALLOC != 0
    }
}

/// A validated ELF image.
pub struct ElfFile<'a> {
    bytes: &'a [u8],
    header: ElfHeader,
}

impl<'a> ElfFile<'a> {
    /// Whether `bytes` starts with the ELF magic.
    #[must_use]
    pub fn is_elf(bytes: &[u8]) -> bool {
        bytes.get(0..4) == Some(&EI_MAGIC_BYTES[..])
    }

    /// Parses and validates the file header.
    ///
    /// # Errors
    /// Rejects anything but little-endian x86 ELF.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, ElfError> {
        if !Self::is_elf(bytes) {
            return Err(ElfError::NotElf);
        }

        let class = match read_u8(bytes, 4) {
            Some(ELFCLASS32) => ElfClass::Elf32,
            Some(ELFCLASS64) => ElfClass::Elf64,
            _ => return Err(ElfError::UnsupportedClass),
        };
        if read_u8(bytes, 5) != Some(ELFDATA2LSB) || read_u8(bytes, 6) != Some(EV_CURRENT) {
            return Err(ElfError::UnsupportedEncoding);
        }
        if bytes.len() < class.ehdr_size() {
            return Err(ElfError::Truncated);
        }

        let half = |off| read_u16_le(bytes, off).ok_or(ElfError::Truncated);
        let wide = class.is_64();
        let word = |off| read_word_le(bytes, off, wide).ok_or(ElfError::Truncated);

        let (entry_at, phoff_at, shoff_at, rest_at) = match class {
            ElfClass::Elf32 => (24, 28, 32, 42),
            ElfClass::Elf64 => (24, 32, 40, 54),
        };

        let header = ElfHeader {
            class,
            e_type: half(16)?,
            e_machine: half(18)?,
            e_entry: word(entry_at)?,
            e_phoff: word(phoff_at)?,
            e_shoff: word(shoff_at)?,
            e_phentsize: half(rest_at)?,
            e_phnum: half(rest_at + 2)?,
            e_shentsize: half(rest_at + 4)?,
            e_shnum: half(rest_at + 6)?,
            e_shstrndx: half(rest_at + 8)?,
        };

        if header.e_machine != class.machine() {
            return Err(ElfError::UnsupportedMachine(header.e_machine));
        }
        if header.e_phnum != 0 && usize::from(header.e_phentsize) < class.phdr_size() {
            return Err(ElfError::BadEntrySize);
        }
        if header.e_shnum != 0 && usize::from(header.e_shentsize) < class.shdr_size() {
            return Err(ElfError::BadEntrySize);
        }

        Ok(Self { bytes, header })
    }

    #[inline]
    #[must_use]
    pub const fn header(&self) -> &ElfHeader {
        &self.header
    }

    #[inline]
    #[must_use]
    pub const fn class(&self) -> ElfClass {
        self.header.class
    }

    #[inline]
    #[must_use]
    pub const fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// The raw file header.
    #[must_use]
    pub fn raw_header(&self) -> &'a [u8] {
        &self.bytes[..self.class().ehdr_size()]
    }

    /// `size` bytes of file content at `offset`.
    ///
    /// # Errors
    /// [`ElfError::Truncated`] past the end of the file.
    pub fn data(&self, offset: u64, size: u64) -> Result<&'a [u8], ElfError> {
        slice(self.bytes, offset, size).ok_or(ElfError::Truncated)
    }

    fn table(&self, off: u64, entsize: u16, num: u16) -> Result<&'a [u8], ElfError> {
        let len = u64::from(entsize) * u64::from(num);
        self.data(off, len)
    }

    /// # Errors
    /// [`ElfError::Truncated`] when the table lies outside the file.
    pub fn program_headers(&self) -> Result<Vec<ProgramHeader>, ElfError> {
        let h = &self.header;
        let table = self.table(h.e_phoff, h.e_phentsize, h.e_phnum)?;
        let wide = h.class.is_64();

        let mut out = Vec::with_capacity(usize::from(h.e_phnum));
        for raw in table.chunks_exact(usize::from(h.e_phentsize.max(1))) {
            let u32_at = |off| read_u32_le(raw, off).ok_or(ElfError::Truncated);
            let word = |off| read_word_le(raw, off, wide).ok_or(ElfError::Truncated);
            let ph = if wide {
                ProgramHeader {
                    p_type: u32_at(0)?,
                    offset: word(8)?,
                    vaddr: word(16)?,
                    paddr: word(24)?,
                    filesz: word(32)?,
                    memsz: word(40)?,
                }
            } else {
                ProgramHeader {
                    p_type: u32_at(0)?,
                    offset: word(4)?,
                    vaddr: word(8)?,
                    paddr: word(12)?,
                    filesz: word(16)?,
                    memsz: word(20)?,
                }
            };
            out.push(ph);
        }
        Ok(out)
    }

    /// The raw section header table, `e_shnum * e_shentsize` bytes.
    ///
    /// # Errors
    /// [`ElfError::Truncated`] when the table lies outside the file.
    pub fn raw_section_headers(&self) -> Result<&'a [u8], ElfError> {
        let h = &self.header;
        self.table(h.e_shoff, h.e_shentsize, h.e_shnum)
    }

    /// # Errors
    /// [`ElfError::Truncated`] when the table lies outside the file.
    pub fn section_headers(&self) -> Result<Vec<SectionHeader>, ElfError> {
        let h = &self.header;
        let table = self.raw_section_headers()?;
        let wide = h.class.is_64();

        let mut out = Vec::with_capacity(usize::from(h.e_shnum));
        for raw in table.chunks_exact(usize::from(h.e_shentsize.max(1))) {
            let u32_at = |off| read_u32_le(raw, off).ok_or(ElfError::Truncated);
            let word = |off| read_word_le(raw, off, wide).ok_or(ElfError::Truncated);
            let sh = if wide {
                SectionHeader {
                    name: u32_at(0)?,
                    sh_type: u32_at(4)?,
                    flags: word(8)?,
                    addr: word(16)?,
                    offset: word(24)?,
                    size: word(32)?,
                    link: u32_at(40)?,
                    addralign: word(48)?,
                    entsize: word(56)?,
                }
            } else {
                SectionHeader {
                    name: u32_at(0)?,
                    sh_type: u32_at(4)?,
                    flags: word(8)?,
                    addr: word(12)?,
                    offset: word(16)?,
                    size: word(20)?,
                    link: u32_at(24)?,
                    addralign: word(32)?,
                    entsize: word(36)?,
                }
            };
            out.push(sh);
        }
        Ok(out)
    }

    /// Value of the symbol called `name` in the given symbol table.
    #[must_use]
    pub fn symbol_value(&self, symtab: &SectionHeader, strtab: &SectionHeader, name: &str) -> Option<u64> {
        let syms = self.data(symtab.offset, symtab.size).ok()?;
        let strs = self.data(strtab.offset, strtab.size).ok()?;
        let class = self.class();
        let entsize = usize::try_from(symtab.entsize)
            .ok()
            .filter(|&e| e >= class.sym_size())
            .unwrap_or(class.sym_size());

        syms.chunks_exact(entsize).find_map(|sym| {
            let st_name = usize::try_from(read_u32_le(sym, 0)?).ok()?;
            if c_str(strs, st_name)? != name.as_bytes() {
                return None;
            }
            match class {
                ElfClass::Elf32 => read_u32_le(sym, 4).map(u64::from),
                ElfClass::Elf64 => read_u64_le(sym, 8),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::images::ElfBuilder;

    #[test]
    fn parses_elf32_program_headers() {
        let image = ElfBuilder::elf32(0x0010_0000)
            .text(0x0010_0000, &[0x90; 16])
            .bss(0x0010_1000, 0x200)
            .build();
        let elf = ElfFile::parse(&image).unwrap();
        assert_eq!(elf.class(), ElfClass::Elf32);
        assert_eq!(elf.header().e_entry, 0x0010_0000);

        let phdrs = elf.program_headers().unwrap();
        assert_eq!(phdrs.len(), 2);
        assert_eq!(phdrs[0].p_type, PT_LOAD);
        assert_eq!(phdrs[0].filesz, 16);
        assert_eq!(phdrs[1].filesz, 0);
        assert_eq!(phdrs[1].memsz, 0x200);
    }

    #[test]
    fn rejects_wrong_machine_and_class() {
        let mut image = ElfBuilder::elf32(0x0010_0000).text(0x0010_0000, &[0; 4]).build();
        image[18] = 62;
        assert_eq!(
            ElfFile::parse(&image).err(),
            Some(ElfError::UnsupportedMachine(62))
        );

        image[4] = 3;
        assert_eq!(ElfFile::parse(&image).err(), Some(ElfError::UnsupportedClass));

        assert_eq!(ElfFile::parse(b"\x7fELF").err(), Some(ElfError::UnsupportedClass));
        assert_eq!(ElfFile::parse(b"MZ").err(), Some(ElfError::NotElf));
    }

    #[test]
    fn truncated_header_table_is_reported() {
        let image = ElfBuilder::elf64(0x0020_0000).text(0x0020_0000, &[0; 4]).build();
        let elf = ElfFile::parse(&image[..64]).unwrap();
        assert_eq!(elf.program_headers().err(), Some(ElfError::Truncated));
    }

    #[test]
    fn finds_symbols() {
        let image = ElfBuilder::elf64(0x0020_0000)
            .text(0x0020_0000, &[0; 4])
            .symbol("_DYNAMIC", 0xffff_ffff_8020_1000)
            .symbol("btext", 0xffff_ffff_8020_0000)
            .build();
        let elf = ElfFile::parse(&image).unwrap();
        let shdrs = elf.section_headers().unwrap();
        let symtab = shdrs.iter().find(|s| s.sh_type == SHT_SYMTAB).unwrap();
        let strtab = &shdrs[symtab.link as usize];
        assert_eq!(
            elf.symbol_value(symtab, strtab, "btext"),
            Some(0xffff_ffff_8020_0000)
        );
        assert_eq!(
            elf.symbol_value(symtab, strtab, "_DYNAMIC"),
            Some(0xffff_ffff_8020_1000)
        );
        assert_eq!(elf.symbol_value(symtab, strtab, "missing"), None);
    }
}
