use alloc::vec;
use alloc::vec::Vec;
use core::convert::Infallible;

use crate::bytes::read_u32_le;
use crate::relocator::{Chunk, Cpu32State, Cpu64State, Preference, Relocator, RelocatorError};
use crate::session::Handoff;

/// Highest address the simulated machine can hand out.
const ADDRESS_LIMIT: u64 = 1 << 32;

#[derive(Debug)]
struct Region {
    target: u64,
    data: Vec<u8>,
}

impl Region {
    const fn end(&self) -> u64 {
        self.target + self.data.len() as u64
    }

    const fn overlaps(&self, target: u64, end: u64) -> bool {
        target < self.end() && self.target < end
    }
}

/// A relocator backed by zero-filled host buffers.
///
/// Chunks live exactly at their target address. The mode switches only record
/// the requested CPU state and then fail, since there is no kernel to enter.
#[derive(Debug, Default)]
pub struct SimRelocator {
    regions: Vec<Region>,
    last_boot: Option<Handoff>,
}

impl SimRelocator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of chunks currently granted.
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.regions.len()
    }

    pub fn chunks(&self) -> impl Iterator<Item = Chunk> + '_ {
        self.regions
            .iter()
            .enumerate()
            .map(|(i, r)| Chunk::new(i, r.target, r.data.len()))
    }

    /// Bytes at `[addr, addr + len)`, provided they lie within a single chunk.
    #[must_use]
    pub fn read(&self, addr: u64, len: usize) -> Option<&[u8]> {
        let end = addr.checked_add(u64::try_from(len).ok()?)?;
        let region = self
            .regions
            .iter()
            .find(|r| r.target <= addr && end <= r.end())?;
        let start = usize::try_from(addr - region.target).ok()?;
        region.data.get(start..start + len)
    }

    #[must_use]
    pub fn read_u32(&self, addr: u64) -> Option<u32> {
        read_u32_le(self.read(addr, 4)?, 0)
    }

    /// CPU state of the most recent mode switch attempt.
    #[must_use]
    pub const fn last_boot(&self) -> Option<Handoff> {
        self.last_boot
    }

    fn is_free(&self, target: u64, size: usize) -> bool {
        let Some(end) = u64::try_from(size).ok().and_then(|s| target.checked_add(s)) else {
            return false;
        };
        end <= ADDRESS_LIMIT && !self.regions.iter().any(|r| r.overlaps(target, end))
    }

    fn grant(&mut self, target: u64, size: usize) -> Chunk {
        self.regions.push(Region {
            target,
            data: vec![0; size],
        });
        Chunk::new(self.regions.len() - 1, target, size)
    }
}

const fn align_down(value: u64, align: u64) -> u64 {
    value - value % align
}

impl Relocator for SimRelocator {
    fn release_all(&mut self) {
        self.regions.clear();
    }

    fn alloc_chunk_addr(&mut self, target: u64, size: usize) -> Result<Chunk, RelocatorError> {
        if !self.is_free(target, size) {
            return Err(RelocatorError::Unavailable { target, size });
        }
        Ok(self.grant(target, size))
    }

    fn alloc_chunk_align(
        &mut self,
        min: u64,
        max: u64,
        size: usize,
        align: u64,
        preference: Preference,
    ) -> Result<Chunk, RelocatorError> {
        let align = align.max(1);
        let max = max.min(ADDRESS_LIMIT);
        let len = u64::try_from(size).map_err(|_| RelocatorError::NoWindow { min, max, size })?;
        let fits = |at: &u64| *at >= min && at.checked_add(len).is_some_and(|end| end <= max);

        // Candidates hug either the window edges or existing chunks.
        let target = if preference == Preference::High {
            let below_max = max.checked_sub(len).map(|at| align_down(at, align));
            let below_chunks = self
                .regions
                .iter()
                .filter_map(|r| r.target.checked_sub(len))
                .map(|at| align_down(at, align));
            below_max
                .into_iter()
                .chain(below_chunks)
                .filter(fits)
                .filter(|&at| self.is_free(at, size))
                .max()
        } else {
            let above_min = min.next_multiple_of(align);
            let above_chunks = self.regions.iter().map(|r| r.end().next_multiple_of(align));
            core::iter::once(above_min)
                .chain(above_chunks)
                .filter(fits)
                .filter(|&at| self.is_free(at, size))
                .min()
        };

        let target = target.ok_or(RelocatorError::NoWindow { min, max, size })?;
        Ok(self.grant(target, size))
    }

    fn chunk_mut(&mut self, chunk: Chunk) -> Result<&mut [u8], RelocatorError> {
        match self.regions.get_mut(chunk.index()) {
            Some(r) if r.target == chunk.target() && r.data.len() == chunk.size() => {
                Ok(&mut r.data)
            }
            _ => Err(RelocatorError::InvalidChunk),
        }
    }

    fn boot32(&mut self, state: Cpu32State) -> Result<Infallible, RelocatorError> {
        log::info!("boot32: eip {:#x}, esp {:#x}", state.eip, state.esp);
        self.last_boot = Some(Handoff::Boot32(state));
        Err(RelocatorError::Handoff("simulated handoff returned"))
    }

    fn boot64(
        &mut self,
        state: Cpu64State,
        min: u64,
        max: u64,
    ) -> Result<Infallible, RelocatorError> {
        log::info!(
            "boot64: rip {:#x}, rsp {:#x}, cr3 {:#x}",
            state.rip,
            state.rsp,
            state.cr3
        );
        self.last_boot = Some(Handoff::Boot64 { state, min, max });
        Err(RelocatorError::Handoff("simulated handoff returned"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_chunks_must_not_overlap() {
        let mut sim = SimRelocator::new();
        let a = sim.alloc_chunk_addr(0x1000, 0x1000).unwrap();
        assert_eq!(a.end(), 0x2000);
        assert!(matches!(
            sim.alloc_chunk_addr(0x1800, 0x10),
            Err(RelocatorError::Unavailable { target: 0x1800, .. })
        ));
        assert!(sim.alloc_chunk_addr(0x2000, 0x10).is_ok());
        assert!(sim.alloc_chunk_addr(0xFFFF_FFF0, 0x20).is_err());
    }

    #[test]
    fn window_preferences() {
        let mut sim = SimRelocator::new();
        sim.alloc_chunk_addr(0x8_0000, 0x1000).unwrap();

        let high = sim
            .alloc_chunk_align(0x1_0000, 0x9_0000, 0x100, 16, Preference::High)
            .unwrap();
        assert_eq!(high.target(), 0x8_FF00);

        let low = sim
            .alloc_chunk_align(0x1_0001, 0x9_0000, 0x100, 16, Preference::Low)
            .unwrap();
        assert_eq!(low.target(), 0x1_0010);

        let between = sim
            .alloc_chunk_align(0x8_0000, 0x8_FF00, 0x80, 8, Preference::None)
            .unwrap();
        assert_eq!(between.target(), 0x8_1000);

        assert!(matches!(
            sim.alloc_chunk_align(0x8_0000, 0x8_1000, 1, 1, Preference::High),
            Err(RelocatorError::NoWindow { .. })
        ));
    }

    #[test]
    fn stale_handles_are_rejected() {
        let mut sim = SimRelocator::new();
        let chunk = sim.alloc_chunk_addr(0x10_0000, 8).unwrap();
        sim.chunk_mut(chunk).unwrap().copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(sim.read_u32(0x10_0004), Some(0x0807_0605));
        assert_eq!(sim.read(0x10_0006, 4), None);

        sim.release_all();
        assert_eq!(sim.chunk_count(), 0);
        assert!(matches!(sim.chunk_mut(chunk), Err(RelocatorError::InvalidChunk)));
    }
}
