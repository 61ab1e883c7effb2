//! # BSD Boot Interfaces
//!
//! Wire-level definitions of the three BSD boot protocols understood by the
//! loader: the constants, flag sets and record layouts a kernel expects to
//! find on its entry stack and in the metadata blobs the loader places in
//! physical memory.
//!
//! ## Overview
//!
//! FreeBSD, NetBSD and OpenBSD all descend from the same 4.4BSD boot blocks,
//! but their handoff contracts diverged long ago:
//!
//! | Protocol | Root structure | Metadata format |
//! |----------|----------------|-----------------|
//! | [`freebsd`] | `struct bootinfo` + `modulep` | `{type, len}` tags scanned sequentially |
//! | [`netbsd`] | `struct bootinfo` with a pointer array | `{len, type}` `btinfo` records |
//! | [`openbsd`] | `bootarg` list | `{type, size, next}` linked records |
//!
//! The BIOS memory map record ([`smap`]) is shared by all three.
//!
//! ## Layout Conventions
//!
//! All records are little-endian. Instead of transmuting `#[repr(C)]`
//! structures into byte buffers, every record exposes a `to_bytes` encoder
//! producing exactly the bytes the kernel reads, so the loader never depends
//! on host layout.
//!
//! ## Physical Memory Constraints
//!
//! ```text
//! 0x0000_0000 ┌─────────────────────────────────┐
//!             │ Real-mode IVT / BDA             │
//! 0x0001_0000 ├─────────────────────────────────┤ STACK_WINDOW_START
//!             │ Handoff stacks (FreeBSD/NetBSD) │
//! 0x0008_0000 ├─────────────────────────────────┤ OPENBSD_ARGS_ADDRESS
//!             │ OpenBSD stack + boot arguments  │
//! 0x0009_0000 ├─────────────────────────────────┤ STACK_WINDOW_END
//!             │ EBDA, VGA, option ROMs          │
//! 0x0010_0000 ├─────────────────────────────────┤ MIN_LOAD_ADDRESS (1 MiB)
//!             │ Kernel image, symbols, modules, │
//!             │ environment, metadata           │
//!             └─────────────────────────────────┘
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod freebsd;
pub mod netbsd;
pub mod openbsd;
pub mod smap;

/// Page granularity used for every alignment in the handoff layout.
pub const PAGE_SIZE: u64 = 4096;

/// Lowest physical address a kernel image may start at.
pub const MIN_LOAD_ADDRESS: u64 = 0x0010_0000; // 1 MiB

/// Lower bound of the window the 32/64-bit entry stacks are allocated in.
pub const STACK_WINDOW_START: u64 = 0x0001_0000;

/// Upper bound (exclusive) of the entry stack window.
pub const STACK_WINDOW_END: u64 = 0x0009_0000;

/// Fixed scratch buffer holding the OpenBSD stack and boot arguments.
pub const OPENBSD_ARGS_ADDRESS: u64 = 0x0008_0000;

/// Upper limit of the 64-bit relocator trampoline placement.
pub const LONG_MODE_TRAMPOLINE_LIMIT: u64 = 0x4000_0000;

/// Physical address mask applied to ELF segment addresses and 32-bit entries.
pub const LEGACY_ADDRESS_MASK: u64 = 0x00FF_FFFF;

/// Entry mask for non-FreeBSD 64-bit kernels.
pub const LEGACY_ENTRY_MASK_64: u64 = 0x0FFF_FFFF;

/// Conventional memory boundary used when reporting lower/upper memory sizes.
pub const CONVENTIONAL_MEMORY_END: u64 = 0x0010_0000;

/// Rounds `x` up to the next multiple of `a` (`a` must be a power of two).
#[inline]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> u64 {
    (x + (a - 1)) & !(a - 1)
}

/// Rounds `x` up to the next page boundary.
#[inline]
#[must_use]
pub const fn align_page(x: u64) -> u64 {
    align_up(x, PAGE_SIZE)
}

const _: () = {
    assert!(STACK_WINDOW_START < OPENBSD_ARGS_ADDRESS);
    assert!(OPENBSD_ARGS_ADDRESS < STACK_WINDOW_END);
    assert!(STACK_WINDOW_END < MIN_LOAD_ADDRESS);
    assert!(MIN_LOAD_ADDRESS.is_multiple_of(PAGE_SIZE));
};
