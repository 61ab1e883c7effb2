//! Kernel symbol tables.
//!
//! FreeBSD and NetBSD kernels find their own symbol table in memory right
//! after the image, in two different layouts:
//!
//! ```text
//! FreeBSD: [symsize][symtab][strsize][strtab]           (word-sized counts)
//! NetBSD:  [ehdr'][shdr' * n] [symtab] [strtab]          (rewritten ELF view)
//! ```

use bsd_bootinfo::{align_page, align_up};
use bsd_bootinfo::netbsd::SymtabInfo;
use log::debug;

use crate::arena::Arena;
use crate::image::elf::{ElfFile, SHT_STRTAB, SHT_SYMTAB, SectionHeader, offsets, put_half, put_word};
use crate::relocator::Relocator;
use crate::tags::{FreeBsdMeta, NetBsdInfo, TagList};
use crate::{BsdError, Result};

const DYNAMIC_SYMBOL: &str = "_DYNAMIC";

struct SymbolTables {
    symtab: SectionHeader,
    strtab: SectionHeader,
    symtab_index: usize,
    strtab_index: usize,
}

fn find_tables(elf: &ElfFile<'_>, shdrs: &[SectionHeader]) -> Result<Option<SymbolTables>> {
    let Some(symtab_index) = shdrs.iter().position(|s| s.sh_type == SHT_SYMTAB) else {
        return Ok(None);
    };
    let symtab = shdrs[symtab_index];
    let strtab_index = usize::try_from(symtab.link).map_err(|_| BsdError::BadFormat("symbol table link"))?;
    let strtab = *shdrs
        .get(strtab_index)
        .ok_or(BsdError::BadFormat("symbol table link"))?;
    if strtab.sh_type != SHT_STRTAB {
        debug!("symbol table links to section {strtab_index} of type {}", strtab.sh_type);
    }

    // Validate both tables are fully present in the file before placing anything.
    elf.data(symtab.offset, symtab.size)
        .map_err(|_| BsdError::ReadError("symbol table"))?;
    elf.data(strtab.offset, strtab.size)
        .map_err(|_| BsdError::ReadError("string table"))?;

    Ok(Some(SymbolTables {
        symtab,
        strtab,
        symtab_index,
        strtab_index,
    }))
}

fn to_usize(v: u64) -> Result<usize> {
    usize::try_from(v).map_err(|_| BsdError::OutOfMemory)
}

/// Adds the FreeBSD `ELFHDR`, `SSYM`, `ESYM` and optional `DYNAMIC` records
/// and places the symbol tables at `kern_end`. Returns the new `kern_end`.
///
/// # Errors
/// Fails when the symbol tables lie outside the file or cannot be placed.
pub fn load_freebsd<R: Relocator + ?Sized>(
    relocator: &mut R,
    elf: &ElfFile<'_>,
    tags: &mut TagList,
    kern_end: u64,
) -> Result<u64> {
    let class = elf.class();
    let wide = class.is_64();
    let word = class.word_size() as u64;

    tags.push_freebsd(&FreeBsdMeta::ElfHeader(elf.raw_header()))?;

    let shdrs = elf.section_headers()?;
    let Some(tables) = find_tables(elf, &shdrs)? else {
        debug!("kernel has no symbol table");
        return Ok(kern_end);
    };

    let symsize = tables.symtab.size;
    let strsize = tables.strtab.size;
    let chunk_size = align_up(symsize + strsize, word) + 2 * word;
    let symstart = align_up(kern_end, word);
    let symend = symstart + chunk_size;

    let chunk = relocator.alloc_chunk_addr(symstart, to_usize(chunk_size)?)?;
    let mut arena = Arena::new(relocator.chunk_mut(chunk)?, symstart);
    arena.write_word(symsize, wide)?;
    arena.write_bytes(elf.data(tables.symtab.offset, symsize)?)?;
    arena.write_word(strsize, wide)?;
    arena.write_bytes(elf.data(tables.strtab.offset, strsize)?)?;

    if let Some(dynamic) = elf.symbol_value(&tables.symtab, &tables.strtab, DYNAMIC_SYMBOL) {
        tags.push_freebsd(&FreeBsdMeta::Dynamic {
            value: dynamic,
            wide,
        })?;
    }
    tags.push_freebsd(&FreeBsdMeta::SymbolsStart {
        value: symstart,
        wide,
    })?;
    tags.push_freebsd(&FreeBsdMeta::SymbolsEnd {
        value: symend,
        wide,
    })?;

    debug!("symbols at [{symstart:#x}, {symend:#x})");
    Ok(align_page(symend))
}

/// Places the NetBSD symbol view at `kern_end` and adds a `SYMTAB` record.
/// Returns the new `kern_end`.
///
/// # Errors
/// Fails when the symbol tables lie outside the file or cannot be placed.
pub fn load_netbsd<R: Relocator + ?Sized>(
    relocator: &mut R,
    elf: &ElfFile<'_>,
    tags: &mut TagList,
    kern_end: u64,
) -> Result<u64> {
    let class = elf.class();
    let word = class.word_size() as u64;

    let shdrs = elf.section_headers()?;
    let Some(tables) = find_tables(elf, &shdrs)? else {
        debug!("kernel has no symbol table");
        return Ok(kern_end);
    };

    let ehdr_size = class.ehdr_size();
    let raw_shdrs = elf.raw_section_headers()?;
    let header_area = align_up((ehdr_size + raw_shdrs.len()) as u64, word);
    let symsize = tables.symtab.size;
    let strsize = tables.strtab.size;
    let sym_offset = header_area;
    let str_offset = header_area + align_up(symsize, word);
    let chunk_size = str_offset + align_up(strsize, word);

    let symstart = align_up(kern_end, word);
    let symend = symstart + chunk_size;

    let chunk = relocator.alloc_chunk_addr(symstart, to_usize(chunk_size)?)?;
    let mut arena = Arena::new(relocator.chunk_mut(chunk)?, symstart);

    // ELF header without program headers, with sections right after it.
    arena.write_bytes(elf.raw_header())?;
    {
        let ehdr = arena.slice_mut(0, ehdr_size)?;
        put_word(ehdr, offsets::e_phoff(class), 0, class)?;
        put_word(ehdr, offsets::e_shoff(class), ehdr_size as u64, class)?;
        put_half(ehdr, offsets::e_phentsize(class), 0)?;
        put_half(ehdr, offsets::e_phnum(class), 0)?;
        put_half(ehdr, offsets::e_shstrndx(class), 0)?;
    }

    let entsize = usize::from(elf.header().e_shentsize);
    for (i, raw) in raw_shdrs.chunks_exact(entsize).enumerate() {
        let at = arena.position();
        arena.write_bytes(raw)?;
        let offset = if i == tables.symtab_index {
            sym_offset
        } else if i == tables.strtab_index {
            str_offset
        } else {
            0
        };
        let shdr = arena.slice_mut(at, entsize)?;
        put_word(shdr, offsets::sh_offset(class), offset, class)?;
        put_word(shdr, offsets::sh_addr(class), offset, class)?;
    }

    arena.align_to(word)?;
    arena.write_bytes(elf.data(tables.symtab.offset, symsize)?)?;
    arena.align_to(word)?;
    arena.write_bytes(elf.data(tables.strtab.offset, strsize)?)?;

    #[allow(clippy::cast_possible_truncation)]
    let symtab = SymtabInfo {
        nsym: 1,
        ssym: symstart as u32,
        esym: symend as u32,
    };
    tags.push_netbsd(&NetBsdInfo::Symtab(symtab))?;

    debug!("symbols at [{symstart:#x}, {symend:#x})");
    Ok(align_page(symend))
}
