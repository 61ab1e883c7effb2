//! Readers for the structures a prepared handoff leaves in simulated memory.
//!
//! Each reader returns `(type, payload)` pairs, or `None` as soon as a record
//! runs outside the chunks granted so far.

use alloc::vec::Vec;

use bsd_bootinfo::freebsd::{MODINFO_END, TAG_HEADER_SIZE};
use bsd_bootinfo::netbsd::{BOOTINFO_HEADER_SIZE, BTINFO_HEADER_SIZE};
use bsd_bootinfo::openbsd::BOOTARG_HEADER_SIZE;

use super::SimRelocator;

/// Walks the FreeBSD module metadata at `modulep` up to and including the
/// end marker.
#[must_use]
pub fn freebsd_metadata(sim: &SimRelocator, modulep: u64, wide: bool) -> Option<Vec<(u32, Vec<u8>)>> {
    let word = if wide { 8 } else { 4 };
    let mut records = Vec::new();
    let mut at = modulep;
    loop {
        let kind = sim.read_u32(at)?;
        let len = usize::try_from(sim.read_u32(at + 4)?).ok()?;
        let payload_at = at + TAG_HEADER_SIZE as u64;
        records.push((kind, sim.read(payload_at, len)?.to_vec()));
        if kind == MODINFO_END {
            return Some(records);
        }
        at = (payload_at + len as u64).next_multiple_of(word);
    }
}

/// Walks `len` bytes of OpenBSD `bootarg` records starting at `addr`.
#[must_use]
pub fn openbsd_bootargs(sim: &SimRelocator, addr: u64, len: usize) -> Option<Vec<(u32, Vec<u8>)>> {
    let end = addr + len as u64;
    let header = BOOTARG_HEADER_SIZE as u64;
    let mut records = Vec::new();
    let mut at = addr;
    while at < end {
        let kind = sim.read_u32(at)?;
        let size = u64::from(sim.read_u32(at + 4)?);
        let payload = usize::try_from(size.checked_sub(header)?).ok()?;
        records.push((kind, sim.read(at + header, payload)?.to_vec()));
        at += size;
    }
    Some(records)
}

/// Follows the NetBSD `bootinfo` pointer array at `addr`.
#[must_use]
pub fn netbsd_bootinfo(sim: &SimRelocator, addr: u64) -> Option<Vec<(u32, Vec<u8>)>> {
    let count = u64::from(sim.read_u32(addr)?);
    let header = BTINFO_HEADER_SIZE as u64;
    (0..count)
        .map(|i| {
            let record = u64::from(sim.read_u32(addr + BOOTINFO_HEADER_SIZE as u64 + i * 4)?);
            let len = u64::from(sim.read_u32(record)?);
            let kind = sim.read_u32(record + 4)?;
            let payload = usize::try_from(len.checked_sub(header)?).ok()?;
            Some((kind, sim.read(record + header, payload)?.to_vec()))
        })
        .collect()
}
