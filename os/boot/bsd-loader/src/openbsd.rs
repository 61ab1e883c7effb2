//! # OpenBSD Boot Protocol
//!
//! Everything lives in one chunk at a fixed low address: the nine-word entry
//! stack followed by the `bootarg` records the kernel walks by size.
//!
//! ```text
//! 0x80000  entry | howto | bootdev | apiver | 0 | extmem | cnvmem | len | argbuf
//! 0x80024  MMAP { type 0, size, next } smap[..] {0}
//!          END  { type -1, size 12, next 0 }
//! ```

use bsd_bootinfo::OPENBSD_ARGS_ADDRESS;
use bsd_bootinfo::openbsd::{BOOTARG_APIVER, BOOTARG_END, BOOTARG_HEADER_SIZE, BOOTARG_MMAP, bootarg_header};
use log::{debug, warn};

use crate::arena::Arena;
use crate::mmap::{self, MapFlavour};
use crate::platform::Platform;
use crate::relocator::{Cpu32State, Relocator};
use crate::session::{Handoff, LoadedKernel, addr32};
use crate::{BsdError, Result};

/// Size of the entry stack in front of the arguments.
const STACK_SIZE: usize = 9 * 4;

/// KiB, saturating.
fn kib(bytes: u64) -> u32 {
    u32::try_from(bytes >> 10).unwrap_or(u32::MAX)
}

fn size32(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| BsdError::OutOfMemory)
}

/// # Errors
/// [`BsdError::OutOfMemory`] when `0x80000` is already taken.
pub fn prepare<R, P>(relocator: &mut R, kernel: &mut LoadedKernel, platform: &mut P) -> Result<Handoff>
where
    R: Relocator + ?Sized,
    P: Platform,
{
    let table = mmap::build_table(&*platform, MapFlavour::OpenBsd)?;
    let mmap_size = BOOTARG_HEADER_SIZE + table.len();
    let args_len = mmap_size + BOOTARG_HEADER_SIZE;

    let base = OPENBSD_ARGS_ADDRESS;
    let chunk = relocator.alloc_chunk_addr(base, STACK_SIZE + args_len)?;
    let argbuf = addr32(base)? + size32(STACK_SIZE)?;
    let end_record = argbuf + size32(mmap_size)?;

    let mut arena = Arena::new(relocator.chunk_mut(chunk)?, base);
    arena.write_u32(kernel.entry)?;
    arena.write_u32(kernel.bootflags)?;
    arena.write_u32(kernel.openbsd_bootdev)?;
    arena.write_u32(BOOTARG_APIVER)?;
    arena.write_u32(0)?;
    arena.write_u32(kib(mmap::upper_memory(&*platform)))?;
    arena.write_u32(kib(mmap::lower_memory(&*platform)))?;
    arena.write_u32(size32(args_len)?)?;
    arena.write_u32(argbuf)?;

    arena.write_bytes(&bootarg_header(BOOTARG_MMAP, size32(mmap_size)?, end_record))?;
    arena.write_bytes(&table)?;
    arena.write_bytes(&bootarg_header(
        BOOTARG_END,
        size32(BOOTARG_HEADER_SIZE)?,
        0,
    ))?;

    debug!(
        "{} memory map records, arguments at {argbuf:#x}",
        table.len() / bsd_bootinfo::smap::SMAP_ENTRY_SIZE
    );

    if let Err(e) = platform.set_mode("text") {
        warn!("cannot switch to text mode: {e}");
    }

    Ok(Handoff::Boot32(Cpu32State {
        eip: kernel.entry,
        esp: addr32(base)?,
    }))
}
