//! # Kernel Image Loader
//!
//! Detects the kernel format, computes its physical span and places it with a
//! single relocator chunk.
//!
//! | Format | Span                                       | Entry                           |
//! |--------|--------------------------------------------|---------------------------------|
//! | a.out  | `entry & 0xF00000` (or `entry` for ZMAGIC) | `a_entry & 0xFFFFFF`            |
//! | ELF32  | `PT_LOAD`/`PT_DYNAMIC` by `p_paddr & 0xFFFFFF` | `e_entry & 0xFFFFFF`        |
//! | ELF64  | as ELF32                                   | FreeBSD: full 64 bits, others `& 0x0FFFFFFF` |

pub mod aout;
pub mod elf;

use bsd_bootinfo::{LEGACY_ADDRESS_MASK, LEGACY_ENTRY_MASK_64, MIN_LOAD_ADDRESS};
use log::debug;

use crate::relocator::{Chunk, Relocator};
use crate::{BsdError, KernelType, Result};
use elf::{ElfClass, ElfFile, PT_DYNAMIC, PT_LOAD};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Aout,
    Elf32,
    Elf64,
}

impl ImageFormat {
    #[must_use]
    pub const fn is_elf(self) -> bool {
        matches!(self, Self::Elf32 | Self::Elf64)
    }

    #[must_use]
    pub const fn is_64bit(self) -> bool {
        matches!(self, Self::Elf64)
    }
}

/// A placed kernel image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelImage {
    pub format: ImageFormat,
    /// Low 32 bits of the entry point.
    pub entry: u32,
    /// High 32 bits of the entry point; only set for 64-bit FreeBSD.
    pub entry_hi: u32,
    pub kern_start: u64,
    pub kern_end: u64,
    pub chunk: Chunk,
}

/// Places a kernel of any supported format.
///
/// ELF is probed first; anything else is treated as a.out.
///
/// # Errors
/// See [`BsdError`]; nothing stays allocated on failure beyond what the
/// session releases at unload.
pub fn load_kernel<R: Relocator + ?Sized>(
    relocator: &mut R,
    bytes: &[u8],
    os: KernelType,
    long_mode: bool,
) -> Result<KernelImage> {
    if ElfFile::is_elf(bytes) {
        let elf = ElfFile::parse(bytes)?;
        load_elf(relocator, &elf, os, long_mode)
    } else {
        aout::load(relocator, bytes)
    }
}

#[allow(clippy::cast_possible_truncation)]
fn load_elf<R: Relocator + ?Sized>(
    relocator: &mut R,
    elf: &ElfFile<'_>,
    os: KernelType,
    long_mode: bool,
) -> Result<KernelImage> {
    let e_entry = elf.header().e_entry;
    let (format, entry, entry_hi) = match elf.class() {
        ElfClass::Elf32 => (ImageFormat::Elf32, (e_entry & LEGACY_ADDRESS_MASK) as u32, 0),
        ElfClass::Elf64 if !long_mode => return Err(BsdError::UnsupportedCpu),
        ElfClass::Elf64 if os == KernelType::FreeBsd => {
            (ImageFormat::Elf64, e_entry as u32, (e_entry >> 32) as u32)
        }
        ElfClass::Elf64 => (ImageFormat::Elf64, (e_entry & LEGACY_ENTRY_MASK_64) as u32, 0),
    };

    let segments = elf.program_headers()?;
    let segments = segments
        .iter()
        .filter(|ph| ph.p_type == PT_LOAD || ph.p_type == PT_DYNAMIC);

    let mut span: Option<(u64, u64)> = None;
    for ph in segments.clone() {
        let start = ph.paddr & LEGACY_ADDRESS_MASK;
        let end = start
            .checked_add(ph.memsz)
            .ok_or(BsdError::BadFormat("segment exceeds the address space"))?;
        span = Some(match span {
            None => (start, end),
            Some((lo, hi)) => (lo.min(start), hi.max(end)),
        });
    }
    let (kern_start, kern_end) = span.ok_or(BsdError::BadFormat("no loadable segment"))?;

    if kern_start < MIN_LOAD_ADDRESS {
        return Err(BsdError::LoadAddressTooLow(kern_start));
    }

    let size = usize::try_from(kern_end - kern_start).map_err(|_| BsdError::OutOfMemory)?;
    let chunk = relocator.alloc_chunk_addr(kern_start, size)?;
    let buf = relocator.chunk_mut(chunk)?;

    for ph in segments {
        if ph.filesz > ph.memsz {
            return Err(BsdError::BadFormat("segment file size exceeds memory size"));
        }
        let src = elf
            .data(ph.offset, ph.filesz)
            .map_err(|_| BsdError::ReadError("kernel segment"))?;

        // Both fit: the span was computed from these very segments.
        let dst = ((ph.paddr & LEGACY_ADDRESS_MASK) - kern_start) as usize;
        let filesz = ph.filesz as usize;
        let memsz = ph.memsz as usize;
        buf[dst..dst + filesz].copy_from_slice(src);
        buf[dst + filesz..dst + memsz].fill(0);
    }

    debug!(
        "{format:?} kernel at [{kern_start:#x}, {kern_end:#x}), entry {:#x}",
        (u64::from(entry_hi) << 32) | u64::from(entry)
    );

    Ok(KernelImage {
        format,
        entry,
        entry_hi,
        kern_start,
        kern_end,
        chunk,
    })
}
