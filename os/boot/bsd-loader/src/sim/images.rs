//! Builders for minimal kernel and module images.
//!
//! The images carry just enough structure for the loader: headers, segment
//! contents and, when symbols or sections are requested, a section table with
//! `.symtab`, `.strtab` and `.shstrtab`. Section headers always come last.

use alloc::string::{String, ToString};
use alloc::vec::Vec;

use crate::image::aout::{AOUT_HEADER_SIZE, ZMAGIC};
use crate::image::elf::{
    ET_EXEC, EM_386, EM_X86_64, ElfClass, PT_LOAD, SHT_NOBITS, SHT_STRTAB, SHT_SYMTAB,
};

/// `STB_GLOBAL`, `STT_FUNC`
const SYMBOL_INFO: u64 = 0x12;
/// `SHN_ABS`
const SHN_ABS: u64 = 0xfff1;

/// Appends the low `width` bytes of `value`, little-endian.
fn put(out: &mut Vec<u8>, value: u64, width: usize) {
    out.extend_from_slice(&value.to_le_bytes()[..width]);
}

fn pad_to(out: &mut Vec<u8>, align: usize) {
    out.resize(out.len().next_multiple_of(align.max(1)), 0);
}

#[derive(Debug, Clone)]
struct Program {
    p_type: u32,
    vaddr: u64,
    paddr: u64,
    data: Vec<u8>,
    memsz: u64,
}

#[derive(Debug, Clone)]
struct Section {
    name: String,
    sh_type: u32,
    flags: u64,
    align: u64,
    data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default)]
struct SectionHeader {
    name: u64,
    sh_type: u32,
    flags: u64,
    offset: u64,
    size: u64,
    link: u64,
    info: u64,
    align: u64,
    entsize: u64,
}

#[derive(Debug, Clone)]
pub struct ElfBuilder {
    class: ElfClass,
    e_type: u16,
    entry: u64,
    programs: Vec<Program>,
    sections: Vec<Section>,
    symbols: Vec<(String, u64)>,
}

impl ElfBuilder {
    #[must_use]
    pub fn elf32(entry: u32) -> Self {
        Self::new(ElfClass::Elf32, u64::from(entry))
    }

    #[must_use]
    pub const fn elf64(entry: u64) -> Self {
        Self::new(ElfClass::Elf64, entry)
    }

    const fn new(class: ElfClass, entry: u64) -> Self {
        Self {
            class,
            e_type: ET_EXEC,
            entry,
            programs: Vec::new(),
            sections: Vec::new(),
            symbols: Vec::new(),
        }
    }

    #[must_use]
    pub fn e_type(mut self, e_type: u16) -> Self {
        self.e_type = e_type;
        self
    }

    /// A loadable segment linked at its physical address.
    #[must_use]
    pub fn text(self, paddr: u64, data: &[u8]) -> Self {
        self.segment(paddr, paddr, data, data.len() as u64)
    }

    /// A loadable segment; bytes past `data` up to `memsz` are bss.
    #[must_use]
    pub fn segment(mut self, vaddr: u64, paddr: u64, data: &[u8], memsz: u64) -> Self {
        self.programs.push(Program {
            p_type: PT_LOAD,
            vaddr,
            paddr,
            data: data.to_vec(),
            memsz,
        });
        self
    }

    /// A loadable segment without file contents.
    #[must_use]
    pub fn bss(self, paddr: u64, size: u64) -> Self {
        self.segment(paddr, paddr, &[], size)
    }

    /// A program header of any type.
    #[must_use]
    pub fn program(mut self, p_type: u32, vaddr: u64, data: &[u8]) -> Self {
        self.programs.push(Program {
            p_type,
            vaddr,
            paddr: vaddr,
            data: data.to_vec(),
            memsz: data.len() as u64,
        });
        self
    }

    #[must_use]
    pub fn section(mut self, name: &str, sh_type: u32, flags: u64, align: u64, data: &[u8]) -> Self {
        self.sections.push(Section {
            name: name.to_string(),
            sh_type,
            flags,
            align,
            data: data.to_vec(),
        });
        self
    }

    #[must_use]
    pub fn symbol(mut self, name: &str, value: u64) -> Self {
        self.symbols.push((name.to_string(), value));
        self
    }

    #[must_use]
    pub fn build(self) -> Vec<u8> {
        let class = self.class;
        let word = class.word_size();
        let mut out = alloc::vec![0; class.ehdr_size()];

        let phoff = if self.programs.is_empty() { 0 } else { out.len() };
        out.resize(class.ehdr_size() + self.programs.len() * class.phdr_size(), 0);

        let mut phdrs = Vec::new();
        for program in &self.programs {
            pad_to(&mut out, 16);
            let offset = out.len() as u64;
            out.extend_from_slice(&program.data);
            self.put_phdr(&mut phdrs, program, offset);
        }
        out[phoff..phoff + phdrs.len()].copy_from_slice(&phdrs);

        let (shoff, shnum, shstrndx) = if self.sections.is_empty() && self.symbols.is_empty() {
            (0, 0, 0)
        } else {
            self.put_sections(&mut out)
        };

        let mut header = Vec::with_capacity(class.ehdr_size());
        header.extend_from_slice(b"\x7fELF");
        header.extend_from_slice(&[if class.is_64() { 2 } else { 1 }, 1, 1]);
        pad_to(&mut header, 16);
        put(&mut header, u64::from(self.e_type), 2);
        put(&mut header, u64::from(if class.is_64() { EM_X86_64 } else { EM_386 }), 2);
        put(&mut header, 1, 4);
        put(&mut header, self.entry, word);
        put(&mut header, phoff as u64, word);
        put(&mut header, shoff, word);
        put(&mut header, 0, 4);
        put(&mut header, class.ehdr_size() as u64, 2);
        put(&mut header, class.phdr_size() as u64, 2);
        put(&mut header, self.programs.len() as u64, 2);
        put(&mut header, class.shdr_size() as u64, 2);
        put(&mut header, shnum, 2);
        put(&mut header, shstrndx, 2);
        out[..header.len()].copy_from_slice(&header);
        out
    }

    fn put_phdr(&self, out: &mut Vec<u8>, program: &Program, offset: u64) {
        let word = self.class.word_size();
        let filesz = program.data.len() as u64;
        put(out, u64::from(program.p_type), 4);
        if self.class.is_64() {
            put(out, 0x7, 4);
        }
        for value in [offset, program.vaddr, program.paddr, filesz, program.memsz] {
            put(out, value, word);
        }
        if !self.class.is_64() {
            put(out, 0x7, 4);
        }
        put(out, 0x1000, word);
    }

    fn put_symbol(&self, out: &mut Vec<u8>, name: u64, value: u64, info: u64, shndx: u64) {
        put(out, name, 4);
        if self.class.is_64() {
            put(out, info, 1);
            put(out, 0, 1);
            put(out, shndx, 2);
            put(out, value, 8);
            put(out, 0, 8);
        } else {
            put(out, value, 4);
            put(out, 0, 4);
            put(out, info, 1);
            put(out, 0, 1);
            put(out, shndx, 2);
        }
    }

    fn put_shdr(&self, out: &mut Vec<u8>, sh: &SectionHeader) {
        let word = self.class.word_size();
        put(out, sh.name, 4);
        put(out, u64::from(sh.sh_type), 4);
        for value in [sh.flags, 0, sh.offset, sh.size] {
            put(out, value, word);
        }
        put(out, sh.link, 4);
        put(out, sh.info, 4);
        put(out, sh.align, word);
        put(out, sh.entsize, word);
    }

    /// Appends section contents and the section header table. Returns
    /// `(e_shoff, e_shnum, e_shstrndx)`.
    fn put_sections(&self, out: &mut Vec<u8>) -> (u64, u64, u64) {
        let word = self.class.word_size();
        let mut shstrtab = alloc::vec![0u8];
        let mut name = |n: &str| {
            let at = shstrtab.len() as u64;
            shstrtab.extend_from_slice(n.as_bytes());
            shstrtab.push(0);
            at
        };

        let mut headers = alloc::vec![SectionHeader::default()];
        for section in &self.sections {
            let offset = if section.sh_type == SHT_NOBITS {
                out.len() as u64
            } else {
                pad_to(out, usize::try_from(section.align).unwrap_or(1));
                let at = out.len() as u64;
                out.extend_from_slice(&section.data);
                at
            };
            headers.push(SectionHeader {
                name: name(&section.name),
                sh_type: section.sh_type,
                flags: section.flags,
                offset,
                size: section.data.len() as u64,
                align: section.align,
                ..SectionHeader::default()
            });
        }

        let mut strtab = alloc::vec![0u8];
        let mut symtab = Vec::new();
        self.put_symbol(&mut symtab, 0, 0, 0, 0);
        for (symbol, value) in &self.symbols {
            let at = strtab.len() as u64;
            strtab.extend_from_slice(symbol.as_bytes());
            strtab.push(0);
            self.put_symbol(&mut symtab, at, *value, SYMBOL_INFO, SHN_ABS);
        }

        let symtab_index = headers.len() as u64;
        pad_to(out, word);
        headers.push(SectionHeader {
            name: name(".symtab"),
            sh_type: SHT_SYMTAB,
            offset: out.len() as u64,
            size: symtab.len() as u64,
            link: symtab_index + 1,
            info: 1,
            align: word as u64,
            entsize: self.class.sym_size() as u64,
            ..SectionHeader::default()
        });
        out.extend_from_slice(&symtab);

        headers.push(SectionHeader {
            name: name(".strtab"),
            sh_type: SHT_STRTAB,
            offset: out.len() as u64,
            size: strtab.len() as u64,
            align: 1,
            ..SectionHeader::default()
        });
        out.extend_from_slice(&strtab);

        let shstrndx = headers.len() as u64;
        let shstrtab_name = name(".shstrtab");
        headers.push(SectionHeader {
            name: shstrtab_name,
            sh_type: SHT_STRTAB,
            offset: out.len() as u64,
            size: shstrtab.len() as u64,
            align: 1,
            ..SectionHeader::default()
        });
        out.extend_from_slice(&shstrtab);

        pad_to(out, word);
        let shoff = out.len() as u64;
        for sh in &headers {
            self.put_shdr(out, sh);
        }
        (shoff, headers.len() as u64, shstrndx)
    }
}

/// Builds 32-bit a.out images.
#[derive(Debug, Clone)]
pub struct AoutBuilder {
    magic: u16,
    entry: u32,
    text: Vec<u8>,
    data: Vec<u8>,
    bss: u32,
}

impl AoutBuilder {
    #[must_use]
    pub const fn new(magic: u16, entry: u32) -> Self {
        Self {
            magic,
            entry,
            text: Vec::new(),
            data: Vec::new(),
            bss: 0,
        }
    }

    #[must_use]
    pub fn text(mut self, bytes: &[u8]) -> Self {
        self.text = bytes.to_vec();
        self
    }

    #[must_use]
    pub fn data(mut self, bytes: &[u8]) -> Self {
        self.data = bytes.to_vec();
        self
    }

    #[must_use]
    pub fn bss(mut self, size: u32) -> Self {
        self.bss = size;
        self
    }

    #[must_use]
    pub fn build(self) -> Vec<u8> {
        let mut out = Vec::new();
        for word in [
            u64::from(self.magic),
            self.text.len() as u64,
            self.data.len() as u64,
            u64::from(self.bss),
            0,
            u64::from(self.entry),
            0,
            0,
        ] {
            put(&mut out, word, 4);
        }
        debug_assert_eq!(out.len(), AOUT_HEADER_SIZE);

        if self.magic == ZMAGIC {
            out.resize(0x1000, 0);
        }
        out.extend_from_slice(&self.text);
        out.extend_from_slice(&self.data);
        out
    }
}
