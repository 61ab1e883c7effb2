//! # NetBSD Boot Interface
//!
//! NetBSD's i386 kernel receives a `bootinfo` structure holding a count and
//! an array of physical pointers, each addressing one `btinfo` record. A
//! record starts with `{len, type}` where `len` includes the 8-byte header.

use bitflags::bitflags;

bitflags! {
    /// `RB_*` and `AB_*` flags carried in the `boothowto` word.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct NetBsdHowto: u32 {
        const ASKNAME = 1 << 0;
        const SINGLE = 1 << 1;
        const NOSYNC = 1 << 2;
        const HALT = 1 << 3;
        const INITNAME = 1 << 4;
        const KDB = 1 << 6;
        const RDONLY = 1 << 7;
        const DUMP = 1 << 8;
        const MINIROOT = 1 << 9;
        const STRING = 1 << 10;
        const USERCONFIG = 1 << 12;
        const AB_QUIET = 1 << 16;
        const AB_VERBOSE = 1 << 17;
        const AB_SILENT = 1 << 18;
        const AB_DEBUG = 1 << 19;
        const AB_NOSMP = 1 << 28;
        const AB_NOACPI = 1 << 29;
    }
}

pub const BTINFO_BOOTPATH: u32 = 0;
pub const BTINFO_ROOTDEVICE: u32 = 1;
pub const BTINFO_BOOTDISK: u32 = 3;
pub const BTINFO_CONSOLE: u32 = 6;
pub const BTINFO_SYMTAB: u32 = 8;
pub const BTINFO_MEMMAP: u32 = 9;
pub const BTINFO_BOOTWEDGE: u32 = 10;
pub const BTINFO_MODULES: u32 = 11;
pub const BTINFO_FRAMEBUF: u32 = 12;

/// Size of the `{len, type}` record header.
pub const BTINFO_HEADER_SIZE: usize = 8;

pub const MAX_BOOTPATH_LEN: usize = 80;
pub const MAX_ROOTDEVICE_LEN: usize = 16;
pub const CONSOLE_DEVNAME_LEN: usize = 16;
pub const CONSOLE_SIZE: usize = CONSOLE_DEVNAME_LEN + 8;
pub const FRAMEBUF_SIZE: usize = 48;
pub const SYMTAB_SIZE: usize = 12;

/// Size of `bi_count` in front of the `struct bootinfo` pointer array.
pub const BOOTINFO_HEADER_SIZE: usize = 4;

/// `btinfo_console`: device name plus serial address and speed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConsoleInfo {
    pub devname: [u8; CONSOLE_DEVNAME_LEN],
    pub addr: u32,
    pub speed: u32,
}

impl ConsoleInfo {
    /// Console named `name` (truncated to 15 bytes) with zero address/speed.
    #[must_use]
    pub fn named(name: &str) -> Self {
        let mut devname = [0u8; CONSOLE_DEVNAME_LEN];
        let n = name.len().min(CONSOLE_DEVNAME_LEN - 1);
        devname[..n].copy_from_slice(&name.as_bytes()[..n]);
        Self {
            devname,
            addr: 0,
            speed: 0,
        }
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; CONSOLE_SIZE] {
        let mut out = [0u8; CONSOLE_SIZE];
        out[..CONSOLE_DEVNAME_LEN].copy_from_slice(&self.devname);
        out[16..20].copy_from_slice(&self.addr.to_le_bytes());
        out[20..24].copy_from_slice(&self.speed.to_le_bytes());
        out
    }
}

/// `btinfo_framebuffer` without the common header.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FramebufferInfo {
    pub fbaddr: u64,
    pub flags: u32,
    pub width: u32,
    pub height: u32,
    pub pitch: u16,
    pub bpp: u8,
    pub red_mask_size: u8,
    pub green_mask_size: u8,
    pub blue_mask_size: u8,
    pub red_field_pos: u8,
    pub green_field_pos: u8,
    pub blue_field_pos: u8,
}

impl FramebufferInfo {
    #[must_use]
    pub fn to_bytes(&self) -> [u8; FRAMEBUF_SIZE] {
        let mut out = [0u8; FRAMEBUF_SIZE];
        out[0..8].copy_from_slice(&self.fbaddr.to_le_bytes());
        out[8..12].copy_from_slice(&self.flags.to_le_bytes());
        out[12..16].copy_from_slice(&self.width.to_le_bytes());
        out[16..20].copy_from_slice(&self.height.to_le_bytes());
        out[20..22].copy_from_slice(&self.pitch.to_le_bytes());
        out[22] = self.bpp;
        out[23] = self.red_mask_size;
        out[24] = self.green_mask_size;
        out[25] = self.blue_mask_size;
        out[26] = self.red_field_pos;
        out[27] = self.green_field_pos;
        out[28] = self.blue_field_pos;
        out
    }
}

/// `btinfo_symtab`: where the loader placed the kernel symbols.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct SymtabInfo {
    pub nsym: u32,
    pub ssym: u32,
    pub esym: u32,
}

impl SymtabInfo {
    #[must_use]
    pub fn to_bytes(&self) -> [u8; SYMTAB_SIZE] {
        let mut out = [0u8; SYMTAB_SIZE];
        out[0..4].copy_from_slice(&self.nsym.to_le_bytes());
        out[4..8].copy_from_slice(&self.ssym.to_le_bytes());
        out[8..12].copy_from_slice(&self.esym.to_le_bytes());
        out
    }
}
