//! # Relocator Interface
//!
//! The relocator owns physical memory for the duration of a load session. It
//! hands out non-overlapping chunks at fixed targets or within a window, and
//! finally performs the CPU mode switch into the kernel. Chunks may be staged
//! elsewhere and moved into place at handoff; the loader only ever addresses
//! them through [`Relocator::chunk_mut`] and their target address.

use core::convert::Infallible;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preference {
    None,
    Low,
    High,
}

/// Handle to a granted chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    index: usize,
    target: u64,
    size: usize,
}

impl Chunk {
    #[must_use]
    pub const fn new(index: usize, target: u64, size: usize) -> Self {
        Self {
            index,
            target,
            size,
        }
    }

    #[inline]
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Physical address the chunk occupies at handoff.
    #[inline]
    #[must_use]
    pub const fn target(&self) -> u64 {
        self.target
    }

    #[inline]
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Exclusive end address.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.target + self.size as u64
    }
}

/// Protected-mode register state at entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cpu32State {
    pub eip: u32,
    pub esp: u32,
}

/// Long-mode register state at entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cpu64State {
    pub rip: u64,
    pub rsp: u64,
    pub cr3: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum RelocatorError {
    #[error("Cannot allocate {size} bytes at {target:#x}")]
    Unavailable { target: u64, size: usize },
    #[error("Cannot allocate {size} bytes within [{min:#x}, {max:#x})")]
    NoWindow { min: u64, max: u64, size: usize },
    #[error("Unknown chunk handle")]
    InvalidChunk,
    #[error("Kernel handoff failed: {0}")]
    Handoff(&'static str),
}

pub trait Relocator {
    /// Releases every chunk granted so far.
    fn release_all(&mut self);

    /// Allocates `size` bytes at exactly `target`.
    fn alloc_chunk_addr(&mut self, target: u64, size: usize) -> Result<Chunk, RelocatorError>;

    /// Allocates `size` bytes somewhere in `[min, max)`, aligned to `align`.
    fn alloc_chunk_align(
        &mut self,
        min: u64,
        max: u64,
        size: usize,
        align: u64,
        preference: Preference,
    ) -> Result<Chunk, RelocatorError>;

    /// Writable view of a granted chunk.
    fn chunk_mut(&mut self, chunk: Chunk) -> Result<&mut [u8], RelocatorError>;

    /// Moves all chunks into place and enters the kernel in 32-bit protected mode.
    ///
    /// Only returns on failure.
    fn boot32(&mut self, state: Cpu32State) -> Result<Infallible, RelocatorError>;

    /// Moves all chunks into place and enters the kernel in long mode. The
    /// trampoline must live within `[min, max)`.
    ///
    /// Only returns on failure.
    fn boot64(&mut self, state: Cpu64State, min: u64, max: u64)
    -> Result<Infallible, RelocatorError>;
}
