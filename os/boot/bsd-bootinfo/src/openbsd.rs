//! # OpenBSD Boot Interface
//!
//! OpenBSD's `boot()` receives its arguments on the stack, the last two being
//! the length and address of a chain of `bootarg` records. Each record is a
//! `{type, size, next}` header; `size` covers the header and payload.

use bitfield_struct::bitfield;
use bitflags::bitflags;

bitflags! {
    /// `RB_*` flags carried in the `howto` word.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct OpenBsdHowto: u32 {
        const ASKNAME = 1 << 0;
        const SINGLE = 1 << 1;
        const NOSYNC = 1 << 2;
        const HALT = 1 << 3;
        const INITNAME = 1 << 4;
        const DFLTROOT = 1 << 5;
        const KDB = 1 << 6;
        const RDONLY = 1 << 7;
        const DUMP = 1 << 8;
        const MINIROOT = 1 << 9;
        const CONFIG = 1 << 10;
        const TIMEBAD = 1 << 11;
        const POWERDOWN = 1 << 12;
        const SERCONS = 1 << 13;
        const USERREQ = 1 << 14;
    }
}

pub const BAPIV_ANCIENT: u32 = 0x0000_0000;
pub const BAPIV_VARS: u32 = 0x0000_0001;
pub const BAPIV_VECTOR: u32 = 0x0000_0002;
pub const BAPIV_ENV: u32 = 0x0000_0004;
pub const BAPIV_BMEMMAP: u32 = 0x0000_0008;

/// Boot API version announced on the entry stack.
pub const BOOTARG_APIVER: u32 = BAPIV_VECTOR | BAPIV_ENV | BAPIV_BMEMMAP;

pub const BOOTARG_MMAP: u32 = 0;
pub const BOOTARG_END: u32 = 0xffff_ffff;

/// Size of the `{type, size, next}` record header.
pub const BOOTARG_HEADER_SIZE: usize = 12;

pub const B_DEVMAGIC: u32 = 0xa000_0000;
pub const B_UNITSHIFT: u32 = 16;
pub const B_PARTSHIFT: u32 = 8;

/// Encodes a `bootarg` header.
#[must_use]
pub fn bootarg_header(ba_type: u32, ba_size: u32, ba_next: u32) -> [u8; BOOTARG_HEADER_SIZE] {
    let mut out = [0u8; BOOTARG_HEADER_SIZE];
    out[0..4].copy_from_slice(&ba_type.to_le_bytes());
    out[4..8].copy_from_slice(&ba_size.to_le_bytes());
    out[8..12].copy_from_slice(&ba_next.to_le_bytes());
    out
}

/// Decoded view of the OpenBSD `bootdev` word.
///
/// For inspection only; the loader encodes the word with the `B_*SHIFT`
/// constants.
#[bitfield(u32)]
pub struct OpenBsdBootDev {
    #[bits(8)]
    pub kind: u8,
    #[bits(8)]
    pub partition: u8,
    #[bits(4)]
    pub unit: u8,
    #[bits(4)]
    pub controller: u8,
    #[bits(4)]
    pub adaptor: u8,
    #[bits(4)]
    pub magic: u8,
}
