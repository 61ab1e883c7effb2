//! # FreeBSD Boot Protocol
//!
//! The kernel is entered with a pointer to a `modinfo` metadata list (`modulep`)
//! describing the kernel and every module, an environment block and, for
//! i386, the legacy `bootinfo` structure.
//!
//! ## Region at `kern_end`
//!
//! ```text
//! kern_end ─► [ environment  "a=1\0b=2\0\0" ]  page aligned, only if non-empty
//!             [ tag, tag, ..., SMAP, END     ]  ELF kernels; each tag padded to a word
//!             [ PML4 | PDPT | PD             ]  64-bit kernels
//! ```
//!
//! The `HOWTO`, `ENVP` and `KERNEND` records are placeholders until this region
//! has been laid out; their payloads are filled in while the tags are copied.

pub mod env;
pub mod module;

use bsd_bootinfo::freebsd::{
    BOOTINFO_SIZE, FreeBsdBootInfo, FreeBsdHowto, MODINFO_METADATA, MODINFOMD_ENVP,
    MODINFOMD_HOWTO, MODINFOMD_KERNEND, MODTYPE_KERNEL, MODTYPE_KERNEL64, TAG_HEADER_SIZE,
};
use bsd_bootinfo::{
    LONG_MODE_TRAMPOLINE_LIMIT, PAGE_SIZE, STACK_WINDOW_END, STACK_WINDOW_START, align_page,
    align_up,
};
use log::{debug, warn};

pub use module::add_meta_module;

use crate::arena::Arena;
use crate::bootdev::BiosDevice;
use crate::image::elf::ElfFile;
use crate::mmap::{self, MapFlavour};
use crate::pagetable::{self, PAGE_TABLE_PAGES};
use crate::platform::Platform;
use crate::relocator::{Cpu32State, Cpu64State, Preference, Relocator};
use crate::session::{Handoff, LoadedKernel, addr32};
use crate::tags::{FreeBsdMeta, Tag, TagList};
use crate::{BsdError, Result, symbols};

/// Offset of the `bootinfo` copy on the i386 entry stack, after nine words.
const BOOTINFO_OFFSET_32: u32 = 9 * 4;

/// Offset of the `bootinfo` copy on the amd64 entry stack, after three words.
const BOOTINFO_OFFSET_64: usize = 3 * 4;

/// Registers the kernel as the first module and, for ELF kernels, places its
/// symbols and adds the records patched at handoff.
///
/// # Errors
/// Fails when the symbol tables or a tag cannot be placed.
pub fn augment_kernel<R: Relocator + ?Sized>(
    relocator: &mut R,
    kernel: &mut LoadedKernel,
    bytes: &[u8],
    args: &[&str],
) -> Result<()> {
    kernel.advance_kern_end(align_page(kernel.kern_end));
    if !kernel.is_elf() {
        return Ok(());
    }

    let wide = kernel.is_64bit();
    let kind = if wide { MODTYPE_KERNEL64 } else { MODTYPE_KERNEL };
    add_meta_module(
        &mut kernel.tags,
        &kernel.path,
        kind,
        args,
        kernel.kern_start,
        kernel.kern_end - kernel.kern_start,
        wide,
    )?;

    let elf = ElfFile::parse(bytes)?;
    let end = symbols::load_freebsd(relocator, &elf, &mut kernel.tags, kernel.kern_end)?;
    kernel.advance_kern_end(end);

    kernel.tags.push_freebsd(&FreeBsdMeta::Howto)?;
    kernel.tags.push_freebsd(&FreeBsdMeta::Envp { wide })?;
    kernel.tags.push_freebsd(&FreeBsdMeta::Kernend { wide })?;
    Ok(())
}

/// Serialized size of `tag` including header and padding.
fn tag_size(tag: &Tag, word: u64) -> u64 {
    align_up(TAG_HEADER_SIZE as u64 + u64::from(tag.len()), word)
}

/// Values substituted into the placeholder records.
struct Patches {
    howto: u32,
    envp: u64,
    kern_end: u64,
}

fn write_tags<'t>(
    arena: &mut Arena<'_>,
    tags: impl Iterator<Item = &'t Tag>,
    word: u64,
    patches: &Patches,
) -> Result<()> {
    for tag in tags {
        arena.write_u32(tag.kind())?;
        arena.write_u32(tag.len())?;
        let at = arena.position();
        arena.write_bytes(tag.payload())?;

        let len = tag.payload().len();
        match tag.kind() {
            k if k == MODINFO_METADATA | MODINFOMD_HOWTO => {
                arena.patch_le(at, len, u64::from(patches.howto))?;
            }
            k if k == MODINFO_METADATA | MODINFOMD_ENVP => {
                arena.patch_le(at, len, patches.envp)?;
            }
            k if k == MODINFO_METADATA | MODINFOMD_KERNEND => {
                arena.patch_le(at, len, patches.kern_end)?;
            }
            _ => {}
        }
        arena.align_to(word)?;
    }
    Ok(())
}

fn to_usize(v: u64) -> Result<usize> {
    usize::try_from(v).map_err(|_| BsdError::OutOfMemory)
}

/// Lays out environment, metadata and page tables and builds the entry stack.
///
/// # Errors
/// [`BsdError::OutOfMemory`] when the metadata region or the stack cannot be
/// reserved; memory map errors are passed through.
#[allow(clippy::too_many_lines)]
pub fn prepare<R, P>(relocator: &mut R, kernel: &mut LoadedKernel, platform: &mut P) -> Result<Handoff>
where
    R: Relocator + ?Sized,
    P: Platform,
{
    let device = BiosDevice::probe(platform.kind(), &*platform);
    let bootdev = device.freebsd_bootdev();

    let mut bi = FreeBsdBootInfo::new();
    bi.bi_bios_dev = u8::try_from(device.biosdev).unwrap_or(u8::MAX);

    let wide = kernel.is_64bit();
    let word: u64 = if wide { 8 } else { 4 };

    kernel.advance_kern_end(align_page(kernel.kern_end));
    let base = kernel.kern_end;

    let environment = env::environment_block(&*platform);
    let mut size = 0u64;
    if !environment.is_empty() {
        size = align_page(base + environment.len() as u64 + 1) - base;
    }

    let mut trailer = TagList::new();
    if kernel.is_elf() {
        let smap = mmap::build_table(&*platform, MapFlavour::FreeBsd)?;
        trailer.push_freebsd(&FreeBsdMeta::Smap(&smap))?;
        trailer.push_freebsd(&FreeBsdMeta::End)?;

        let tags_len: u64 = kernel
            .tags
            .iter()
            .chain(trailer.iter())
            .map(|t| tag_size(t, word))
            .sum();
        size = align_page(base + size + tags_len) - base;
    }
    if wide {
        size += PAGE_TABLE_PAGES as u64 * PAGE_SIZE;
    }

    let region = relocator.alloc_chunk_addr(base, to_usize(size)?)?;
    kernel.advance_kern_end(base + size);
    let kern_end = kernel.kern_end;

    let mut arena = Arena::new(relocator.chunk_mut(region)?, base);

    let mut envp = 0;
    if !environment.is_empty() {
        envp = arena.address();
        arena.write_bytes(&environment)?;
        arena.write_u8(0)?;
    }

    let mut modulep = 0;
    if kernel.is_elf() {
        arena.align_to(word)?;
        modulep = arena.address();
        let patches = Patches {
            howto: kernel.bootflags,
            envp,
            kern_end,
        };
        write_tags(
            &mut arena,
            kernel.tags.iter().chain(trailer.iter()),
            word,
            &patches,
        )?;
    }

    bi.bi_envp = addr32(envp)?;
    bi.bi_kernend = addr32(kern_end)?;
    bi.bi_modulep = addr32(modulep)?;

    debug!("modulep {modulep:#x}, envp {envp:#x}, kern_end {kern_end:#x}");

    if let Err(e) = platform.set_mode("text") {
        warn!("cannot switch to text mode: {e}");
    }

    if wide {
        let table = align_page(arena.address());
        let offset = to_usize(table - base)?;
        let len = to_usize(PAGE_TABLE_PAGES as u64 * PAGE_SIZE)?;
        let pages = arena.slice_mut(offset, len)?;
        let cr3 = pagetable::fill_identity_gib(pages, table)?;

        let stack_size = BOOTINFO_OFFSET_64 + BOOTINFO_SIZE;
        let chunk = relocator.alloc_chunk_align(
            STACK_WINDOW_START,
            STACK_WINDOW_END,
            stack_size,
            4,
            Preference::None,
        )?;
        let stack = chunk.target();
        let mut frame = Arena::new(relocator.chunk_mut(chunk)?, stack);
        frame.write_u32(kernel.entry)?;
        frame.write_u32(bi.bi_modulep)?;
        frame.write_u32(bi.bi_kernend)?;
        frame.write_bytes(&bi.to_bytes())?;

        return Ok(Handoff::Boot64 {
            state: Cpu64State {
                rip: kernel.entry(),
                rsp: stack,
                cr3,
            },
            min: 0,
            max: LONG_MODE_TRAMPOLINE_LIMIT,
        });
    }

    let stack_size = BOOTINFO_OFFSET_32 as usize + BOOTINFO_SIZE;
    let chunk = relocator.alloc_chunk_align(
        STACK_WINDOW_START,
        STACK_WINDOW_END,
        stack_size,
        4,
        Preference::None,
    )?;
    let stack = addr32(chunk.target())?;
    let howto = FreeBsdHowto::from_bits_retain(kernel.bootflags) | FreeBsdHowto::BOOTINFO;

    let mut frame = Arena::new(relocator.chunk_mut(chunk)?, chunk.target());
    frame.write_u32(kernel.entry)?;
    frame.write_u32(howto.bits())?;
    frame.write_u32(bootdev)?;
    frame.write_u32(0)?;
    frame.write_u32(0)?;
    frame.write_u32(0)?;
    frame.write_u32(stack + BOOTINFO_OFFSET_32)?;
    frame.write_u32(bi.bi_modulep)?;
    frame.write_u32(bi.bi_kernend)?;
    frame.write_bytes(&bi.to_bytes())?;

    Ok(Handoff::Boot32(Cpu32State {
        eip: kernel.entry,
        esp: stack,
    }))
}
