//! # BIOS System Memory Map Records
//!
//! The INT 15h/E820 record layout, used verbatim by the FreeBSD `SMAP`
//! metadata, the NetBSD `MEMMAP` btinfo and the OpenBSD `bios_memmap`.

/// Serialized size of one [`SmapEntry`] (packed).
pub const SMAP_ENTRY_SIZE: usize = 20;

/// Region type as understood by the BSD kernels.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum SmapType {
    /// Usable RAM.
    Ram = 1,
    /// Reserved; never touched by the kernel.
    Reserved = 2,
    /// ACPI reclaimable.
    Acpi = 3,
    /// ACPI non-volatile storage.
    Nvs = 4,
}

impl SmapType {
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self as u32
    }
}

/// One packed `{addr: u64, size: u64, type: u32}` record.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SmapEntry {
    pub base: u64,
    pub length: u64,
    pub kind: SmapType,
}

impl SmapEntry {
    /// The all-zero record OpenBSD uses to terminate its memory map.
    pub const TERMINATOR: [u8; SMAP_ENTRY_SIZE] = [0; SMAP_ENTRY_SIZE];

    #[must_use]
    pub const fn new(base: u64, length: u64, kind: SmapType) -> Self {
        Self { base, length, kind }
    }

    /// Exclusive end address.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base.wrapping_add(self.length)
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; SMAP_ENTRY_SIZE] {
        let mut out = [0u8; SMAP_ENTRY_SIZE];
        out[0..8].copy_from_slice(&self.base.to_le_bytes());
        out[8..16].copy_from_slice(&self.length.to_le_bytes());
        out[16..20].copy_from_slice(&self.kind.as_u32().to_le_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_packed_little_endian() {
        let e = SmapEntry::new(0x1000, 0x2000, SmapType::Acpi);
        let b = e.to_bytes();
        assert_eq!(&b[0..8], &0x1000u64.to_le_bytes());
        assert_eq!(&b[8..16], &0x2000u64.to_le_bytes());
        assert_eq!(&b[16..20], &3u32.to_le_bytes());
        assert_eq!(e.end(), 0x3000);
    }
}
