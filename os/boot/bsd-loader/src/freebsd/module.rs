//! FreeBSD modules.
//!
//! Every file handed to the kernel (the kernel itself, raw data files and
//! ELF modules) is described by a `NAME`, `TYPE`, `ADDR`, `SIZE` and optional
//! `ARGS` record group, followed by module specific metadata.

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::Write;

use bsd_bootinfo::align_page;
use bsd_bootinfo::freebsd::{
    MODINFO_ADDR, MODINFO_NAME, MODINFO_SIZE, MODINFO_TYPE, MODTYPE_ELF_MODULE,
    MODTYPE_ELF_MODULE_OBJ, MODTYPE_RAW, ZPOOL_CACHE,
};
use log::{debug, warn};

use crate::bytes::{c_str, read_u32_le};
use crate::image::elf::{
    ET_DYN, ET_REL, ElfClass, ElfFile, PT_DYNAMIC, PT_LOAD, SHT_NOBITS, offsets, put_word,
};
use crate::relocator::Relocator;
use crate::session::LoadedKernel;
use crate::tags::{FreeBsdMeta, TagList};
use crate::{BsdError, Result};

/// Describes a file placed at `addr`.
pub fn add_meta_module(
    tags: &mut TagList,
    filename: &str,
    kind: &str,
    args: &[&str],
    addr: u64,
    size: u64,
    wide: bool,
) -> Result<()> {
    let name = if kind == ZPOOL_CACHE {
        ZPOOL_CACHE
    } else {
        filename.rsplit('/').next().unwrap_or(filename)
    };

    tags.push_freebsd(&FreeBsdMeta::Name(name))?;
    tags.push_freebsd(&FreeBsdMeta::Type(kind))?;
    tags.push_freebsd(&FreeBsdMeta::Addr { value: addr, wide })?;
    tags.push_freebsd(&FreeBsdMeta::Size { value: size, wide })?;
    if !args.is_empty() {
        tags.push_freebsd(&FreeBsdMeta::Args(args))?;
    }
    Ok(())
}

/// Places `bytes` verbatim at `kern_end`.
///
/// A leading `type=TYPE` argument sets the module type, which defaults to `raw`.
///
/// # Errors
/// Fails when `kern_end` is not free.
pub fn load_raw<R: Relocator + ?Sized>(
    relocator: &mut R,
    kernel: &mut LoadedKernel,
    bytes: &[u8],
    path: &str,
    args: &[&str],
) -> Result<()> {
    if bytes.is_empty() {
        warn!("{path} is empty, not loading it");
        return Ok(());
    }

    let target = kernel.kern_end;
    let chunk = relocator.alloc_chunk_addr(target, bytes.len())?;
    relocator.chunk_mut(chunk)?.copy_from_slice(bytes);

    let (kind, args) = args
        .split_first()
        .and_then(|(first, rest)| Some((first.strip_prefix("type=")?, rest)))
        .unwrap_or((MODTYPE_RAW, args));

    let size = bytes.len() as u64;
    let wide = kernel.is_64bit();
    add_meta_module(&mut kernel.tags, path, kind, args, target, size, wide)?;
    kernel.advance_kern_end(align_page(target + size));

    debug!("{kind} module {path} at {target:#x}, {size} bytes");
    Ok(())
}

/// Loads an ELF module: a shared object for 32-bit kernels, a relocatable
/// object for 64-bit kernels.
///
/// # Errors
/// [`BsdError::BadFormat`] for a module whose class or type does not fit
/// the kernel.
pub fn load_elf<R: Relocator + ?Sized>(
    relocator: &mut R,
    kernel: &mut LoadedKernel,
    bytes: &[u8],
    path: &str,
    args: &[&str],
) -> Result<()> {
    if bytes.is_empty() {
        warn!("{path} is empty, not loading it");
        return Ok(());
    }

    let elf = ElfFile::parse(bytes)?;
    match (kernel.is_64bit(), elf.class()) {
        (false, ElfClass::Elf32) => load_shared(relocator, kernel, &elf, path, args),
        (true, ElfClass::Elf64) => load_object(relocator, kernel, &elf, path, args),
        _ => Err(BsdError::BadFormat("module class does not match the kernel")),
    }
}

fn to_usize(v: u64) -> Result<usize> {
    usize::try_from(v).map_err(|_| BsdError::OutOfMemory)
}

/// Places the loadable segments of a shared object at their link offsets
/// from a page boundary after the kernel.
fn load_shared<R: Relocator + ?Sized>(
    relocator: &mut R,
    kernel: &mut LoadedKernel,
    elf: &ElfFile<'_>,
    path: &str,
    args: &[&str],
) -> Result<()> {
    if elf.header().e_type != ET_DYN {
        return Err(BsdError::BadFormat("ELF module is not a shared object"));
    }

    let phdrs = elf.program_headers()?;
    let span = phdrs
        .iter()
        .filter(|ph| ph.p_type == PT_LOAD)
        .map(|ph| ph.vaddr.saturating_add(ph.memsz))
        .fold(elf.class().ehdr_size() as u64, u64::max);

    let mut segments = Vec::new();
    for ph in phdrs.iter().filter(|ph| ph.p_type == PT_LOAD) {
        if ph.filesz > ph.memsz {
            return Err(BsdError::BadFormat("segment file size exceeds memory size"));
        }
        let src = elf
            .data(ph.offset, ph.filesz)
            .map_err(|_| BsdError::ReadError("module segment"))?;
        segments.push((to_usize(ph.vaddr)?, src));
    }
    let section_headers = if elf.header().e_shnum == 0 {
        None
    } else {
        Some(elf.raw_section_headers()?)
    };

    // The chunk is only taken once every segment has been validated.
    let module = align_page(kernel.kern_end);
    let chunk = relocator.alloc_chunk_addr(module, to_usize(span)?)?;
    let buf = relocator.chunk_mut(chunk)?;
    buf.fill(0);
    for (dst, src) in segments {
        buf[dst..dst + src.len()].copy_from_slice(src);
    }

    let wide = false;
    add_meta_module(
        &mut kernel.tags,
        path,
        MODTYPE_ELF_MODULE,
        args,
        module,
        span,
        wide,
    )?;
    kernel
        .tags
        .push_freebsd(&FreeBsdMeta::ElfHeader(elf.raw_header()))?;
    if let Some(dynamic) = phdrs.iter().find(|ph| ph.p_type == PT_DYNAMIC) {
        kernel.tags.push_freebsd(&FreeBsdMeta::Dynamic {
            value: module + dynamic.vaddr,
            wide,
        })?;
    }
    if let Some(shdrs) = section_headers {
        kernel.tags.push_freebsd(&FreeBsdMeta::SectionHeaders(shdrs))?;
    }

    kernel.advance_kern_end(align_page(module + span));
    debug!("ELF module {path} at [{module:#x}, {:#x})", module + span);
    Ok(())
}

/// Packs the allocated sections of a relocatable object one after another,
/// honouring their alignment, and records the placement in a patched
/// section header table.
fn load_object<R: Relocator + ?Sized>(
    relocator: &mut R,
    kernel: &mut LoadedKernel,
    elf: &ElfFile<'_>,
    path: &str,
    args: &[&str],
) -> Result<()> {
    if elf.header().e_type != ET_REL {
        return Err(BsdError::BadFormat("ELF module is not a relocatable object"));
    }

    let class = elf.class();
    let shdrs = elf.section_headers()?;
    let placed = || {
        shdrs
            .iter()
            .enumerate()
            .filter(|(_, s)| s.size != 0 && s.is_alloc())
    };

    let module = align_page(kernel.kern_end);

    let mut size = 0u64;
    for (_, s) in placed() {
        size = bsd_bootinfo::align_up(size, s.addralign.max(1)) + s.size;
    }

    let mut shdr_table = elf.raw_section_headers()?.to_vec();
    let entsize = usize::from(elf.header().e_shentsize);

    let mut sections = Vec::new();
    let mut offset = 0u64;
    for (index, s) in placed() {
        offset = bsd_bootinfo::align_up(offset, s.addralign.max(1));
        let src = if s.sh_type == SHT_NOBITS {
            None
        } else {
            let data = elf
                .data(s.offset, s.size)
                .map_err(|_| BsdError::ReadError("module section"))?;
            Some(data)
        };
        let entry = shdr_table
            .get_mut(index * entsize..(index + 1) * entsize)
            .ok_or(BsdError::BadHeader)?;
        put_word(entry, offsets::sh_addr(class), module + offset, class)?;
        sections.push((to_usize(offset)?, to_usize(s.size)?, src));
        offset += s.size;
    }

    let chunk = relocator.alloc_chunk_addr(module, to_usize(size)?)?;
    let buf = relocator.chunk_mut(chunk)?;
    for (at, len, src) in sections {
        match src {
            Some(src) => buf[at..at + len].copy_from_slice(src),
            None => buf[at..at + len].fill(0),
        }
    }

    let end = module + offset;
    let wide = true;
    add_meta_module(
        &mut kernel.tags,
        path,
        MODTYPE_ELF_MODULE_OBJ,
        args,
        module,
        offset,
        wide,
    )?;
    kernel
        .tags
        .push_freebsd(&FreeBsdMeta::ElfHeader(elf.raw_header()))?;
    kernel
        .tags
        .push_freebsd(&FreeBsdMeta::SectionHeaders(&shdr_table))?;

    kernel.advance_kern_end(align_page(end));
    debug!("ELF object module {path} at [{module:#x}, {end:#x})");
    Ok(())
}

/// Formats the registered modules as a table.
#[must_use]
pub fn list(tags: &TagList) -> String {
    let mut out = format!("  {:<18}  {:<18}{:>14}{:>14}\n", "name", "type", "addr", "size");
    for tag in tags {
        let payload = tag.payload();
        // Writing into a String never fails.
        let _ = match tag.kind() {
            MODINFO_NAME | MODINFO_TYPE => {
                let text = c_str(payload, 0).unwrap_or(payload);
                write!(out, "  {:<18}", String::from_utf8_lossy(text))
            }
            MODINFO_ADDR => write!(out, "    0x{:08x}", read_u32_le(payload, 0).unwrap_or(0)),
            MODINFO_SIZE => writeln!(out, "    0x{:08x}", read_u32_le(payload, 0).unwrap_or(0)),
            _ => Ok(()),
        };
    }
    out
}
