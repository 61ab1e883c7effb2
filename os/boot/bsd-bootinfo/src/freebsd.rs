//! # FreeBSD Boot Interface
//!
//! FreeBSD kernels are entered with a `bootinfo` structure and a pointer to a
//! sequential metadata list (`modulep`). Every entry in the list is a
//! `{type: u32, len: u32}` header followed by `len` payload bytes, padded to
//! the kernel's pointer size. Module descriptors start with a `NAME` record;
//! kernel-wide metadata is tagged with [`MODINFO_METADATA`].

use bitfield_struct::bitfield;
use bitflags::bitflags;

bitflags! {
    /// `RB_*` flags carried in the `howto` word.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct FreeBsdHowto: u32 {
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
        const VERBOSE = 1 << 11;
        const SERIAL = 1 << 12;
        const CDROM = 1 << 13;
        const POWEROFF = 1 << 14;
        const GDB = 1 << 15;
        const MUTE = 1 << 16;
        const SELFTEST = 1 << 17;
        const PAUSE = 1 << 20;
        const QUIET = 1 << 21;
        const NOINTR = 1 << 28;
        /// Output on all consoles (`RB_MULTIPLE`).
        const DUAL = 1 << 29;
        /// Set by the loader: a `bootinfo` pointer is on the stack.
        const BOOTINFO = 1 << 31;
    }
}

pub const MODINFO_END: u32 = 0x0000;
pub const MODINFO_NAME: u32 = 0x0001;
pub const MODINFO_TYPE: u32 = 0x0002;
pub const MODINFO_ADDR: u32 = 0x0003;
pub const MODINFO_SIZE: u32 = 0x0004;
pub const MODINFO_EMPTY: u32 = 0x0005;
pub const MODINFO_ARGS: u32 = 0x0006;
pub const MODINFO_METADATA: u32 = 0x8000;

pub const MODINFOMD_AOUTEXEC: u32 = 0x0001;
pub const MODINFOMD_ELFHDR: u32 = 0x0002;
pub const MODINFOMD_SSYM: u32 = 0x0003;
pub const MODINFOMD_ESYM: u32 = 0x0004;
pub const MODINFOMD_DYNAMIC: u32 = 0x0005;
pub const MODINFOMD_ENVP: u32 = 0x0006;
pub const MODINFOMD_HOWTO: u32 = 0x0007;
pub const MODINFOMD_KERNEND: u32 = 0x0008;
pub const MODINFOMD_SHDR: u32 = 0x0009;
pub const MODINFOMD_SMAP: u32 = 0x1001;
pub const MODINFOMD_DEPLIST: u32 = 0x4001;

pub const MODTYPE_KERNEL: &str = "elf kernel";
pub const MODTYPE_KERNEL64: &str = "elf64 kernel";
pub const MODTYPE_ELF_MODULE: &str = "elf module";
pub const MODTYPE_ELF_MODULE_OBJ: &str = "elf obj module";
pub const MODTYPE_RAW: &str = "raw";

/// Module type that keeps its full path as the module name.
pub const ZPOOL_CACHE: &str = "/boot/zfs/zpool.cache";

/// Prefix of configuration variables exported into the kernel environment.
pub const ENV_PREFIX: &str = "kFreeBSD.";

pub const BOOTINFO_VERSION: u32 = 1;
pub const N_BIOS_GEOM: usize = 8;

/// Size of the `{type, len}` header preceding every metadata payload.
pub const TAG_HEADER_SIZE: usize = 8;

/// Size of the serialized [`FreeBsdBootInfo`].
pub const BOOTINFO_SIZE: usize = 84;

pub const B_DEVMAGIC: u32 = 0xa000_0000;
pub const B_SLICESHIFT: u32 = 20;
pub const B_UNITSHIFT: u32 = 16;
pub const B_PARTSHIFT: u32 = 8;

/// The i386 `struct bootinfo`.
#[derive(Debug, Clone, Default)]
pub struct FreeBsdBootInfo {
    pub bi_version: u32,
    pub bi_kernelname: u32,
    pub bi_nfs_diskless: u32,
    pub bi_n_bios_used: u32,
    pub bi_bios_geom: [u32; N_BIOS_GEOM],
    pub bi_size: u32,
    pub bi_memsizes_valid: u8,
    pub bi_bios_dev: u8,
    pub bi_basemem: u32,
    pub bi_extmem: u32,
    pub bi_symtab: u32,
    pub bi_esymtab: u32,
    /// End of the kernel and all loaded data.
    pub bi_kernend: u32,
    /// Environment block address, or zero.
    pub bi_envp: u32,
    /// Metadata list address.
    pub bi_modulep: u32,
}

impl FreeBsdBootInfo {
    /// A zeroed `bootinfo` with version and size filled in.
    #[must_use]
    pub fn new() -> Self {
        #[allow(clippy::cast_possible_truncation)]
        const SIZE: u32 = BOOTINFO_SIZE as u32;
        Self {
            bi_version: BOOTINFO_VERSION,
            bi_size: SIZE,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; BOOTINFO_SIZE] {
        let mut out = [0u8; BOOTINFO_SIZE];
        let mut put = |off: usize, v: u32| out[off..off + 4].copy_from_slice(&v.to_le_bytes());
        put(0, self.bi_version);
        put(4, self.bi_kernelname);
        put(8, self.bi_nfs_diskless);
        put(12, self.bi_n_bios_used);
        for (i, g) in self.bi_bios_geom.iter().enumerate() {
            put(16 + i * 4, *g);
        }
        put(48, self.bi_size);
        put(56, self.bi_basemem);
        put(60, self.bi_extmem);
        put(64, self.bi_symtab);
        put(68, self.bi_esymtab);
        put(72, self.bi_kernend);
        put(76, self.bi_envp);
        put(80, self.bi_modulep);
        out[52] = self.bi_memsizes_valid;
        out[53] = self.bi_bios_dev;
        out
    }
}

/// Decoded view of the FreeBSD `bootdev` word.
///
/// Layout (LSB→MSB): type, partition, unit, slice (1-based), magic.
///
/// For inspection only. The loader encodes the word with the `B_*SHIFT`
/// constants and wrapping arithmetic: a missing slice (`0xff + 1`) carries
/// into the unit field.
#[bitfield(u32)]
pub struct FreeBsdBootDev {
    #[bits(8)]
    pub kind: u8,
    #[bits(8)]
    pub partition: u8,
    #[bits(4)]
    pub unit: u8,
    #[bits(8)]
    pub slice: u8,
    #[bits(4)]
    pub magic: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootinfo_layout() {
        let mut bi = FreeBsdBootInfo::new();
        bi.bi_bios_dev = 0x80;
        bi.bi_kernend = 0x0060_0000;
        bi.bi_envp = 0x0050_0000;
        bi.bi_modulep = 0x0050_1000;
        let b = bi.to_bytes();
        assert_eq!(&b[0..4], &1u32.to_le_bytes());
        assert_eq!(&b[48..52], &84u32.to_le_bytes());
        assert_eq!(b[53], 0x80);
        assert_eq!(&b[72..76], &0x0060_0000u32.to_le_bytes());
        assert_eq!(&b[76..80], &0x0050_0000u32.to_le_bytes());
        assert_eq!(&b[80..84], &0x0050_1000u32.to_le_bytes());
    }

    #[test]
    fn bootdev_fields() {
        let word = B_DEVMAGIC + (1 << B_SLICESHIFT) + (2 << B_UNITSHIFT) + (3 << B_PARTSHIFT);
        let dev = FreeBsdBootDev::from_bits(word);
        assert_eq!(dev.magic(), 0xa);
        assert_eq!(dev.slice(), 1);
        assert_eq!(dev.unit(), 2);
        assert_eq!(dev.partition(), 3);
        assert_eq!(dev.kind(), 0);
    }

    #[test]
    fn howto_bits_match_reboot_h() {
        assert_eq!(FreeBsdHowto::BOOTINFO.bits(), 0x8000_0000);
        assert_eq!(FreeBsdHowto::DUAL.bits(), 0x2000_0000);
        assert_eq!(FreeBsdHowto::SERIAL.bits(), 0x1000);
    }
}
