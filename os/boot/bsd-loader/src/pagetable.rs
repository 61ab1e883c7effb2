//! # Handoff Page Table
//!
//! 64-bit FreeBSD kernels are entered in long mode with a throwaway page
//! table that identity maps the first GiB with 2 MiB pages. Three pages are
//! used, and every slot of each level points at the same next level, so the
//! same GiB appears at every 1 GiB-aligned virtual address. This is what lets
//! the kernel run from its high link address before it builds its own tables.
//!
//! ```text
//!  PML4[0..512] ──► PDPT[0..512] ──► PD[i] = i * 2 MiB | PS
//! ```

use bitfield_struct::bitfield;
use bsd_bootinfo::PAGE_SIZE;

/// Number of pages [`fill_identity_gib`] writes.
pub const PAGE_TABLE_PAGES: usize = 3;

const ENTRIES: usize = 512;
const HUGE_PAGE_SIZE: u64 = 2 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum PageTableError {
    #[error("Page table buffer holds {0} bytes, {PAGE_TABLE_PAGES} pages are required")]
    BufferTooSmall(usize),
    #[error("Page table base {0:#x} is not page aligned")]
    Misaligned(u64),
}

/// An entry at any level of the handoff table.
#[bitfield(u64)]
pub struct BootPageEntry {
    /// Present (bit 0).
    pub present: bool,
    /// Writable (bit 1).
    pub writable: bool,
    /// User (bit 2).
    pub user: bool,
    #[bits(4)]
    __res3_6: u8,
    /// Page Size (bit 7): set for 2 MiB leaves in the PD.
    pub page_size: bool,
    #[bits(4)]
    __res8_11: u8,
    /// Physical address bits 51:12.
    #[bits(40)]
    frame: u64,
    #[bits(12)]
    __res52_63: u16,
}

impl BootPageEntry {
    /// Non-leaf entry pointing at the table at `phys`.
    #[must_use]
    pub const fn table(phys: u64) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user(true)
            .with_frame(phys >> 12)
    }

    /// 2 MiB leaf mapping `phys`.
    #[must_use]
    pub const fn huge_page(phys: u64) -> Self {
        Self::table(phys).with_page_size(true)
    }

    /// Physical address the entry points at.
    #[must_use]
    pub const fn address(self) -> u64 {
        self.frame() << 12
    }
}

fn fill_level(page: &mut [u8], entry: impl Fn(u64) -> BootPageEntry) {
    for (i, slot) in page.chunks_exact_mut(8).take(ENTRIES).enumerate() {
        slot.copy_from_slice(&entry(i as u64).into_bits().to_le_bytes());
    }
}

/// Fills `buf`, which will live at physical address `phys`, with the
/// three-level identity map. Returns the address to load into CR3.
///
/// # Errors
/// [`PageTableError`] when `buf` is shorter than three pages or `phys` is not
/// page aligned.
pub fn fill_identity_gib(buf: &mut [u8], phys: u64) -> Result<u64, PageTableError> {
    if !phys.is_multiple_of(PAGE_SIZE) {
        return Err(PageTableError::Misaligned(phys));
    }
    let len = buf.len();
    let page = usize::try_from(PAGE_SIZE).map_err(|_| PageTableError::BufferTooSmall(len))?;
    let buf = buf
        .get_mut(..PAGE_TABLE_PAGES * page)
        .ok_or(PageTableError::BufferTooSmall(len))?;

    let (pml4, rest) = buf.split_at_mut(page);
    let (pdpt, pd) = rest.split_at_mut(page);

    let pdpt_phys = phys + PAGE_SIZE;
    let pd_phys = phys + 2 * PAGE_SIZE;

    fill_level(pml4, |_| BootPageEntry::table(pdpt_phys));
    fill_level(pdpt, |_| BootPageEntry::table(pd_phys));
    fill_level(pd, |i| BootPageEntry::huge_page(i * HUGE_PAGE_SIZE));

    log::trace!("handoff page table at {phys:#x}");
    Ok(phys)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(buf: &[u8], page: usize, index: usize) -> BootPageEntry {
        let off = page * 4096 + index * 8;
        BootPageEntry::from_bits(u64::from_le_bytes(buf[off..off + 8].try_into().unwrap()))
    }

    #[test]
    fn entry_bits() {
        assert_eq!(BootPageEntry::table(0x3000).into_bits(), 0x3007);
        assert_eq!(BootPageEntry::huge_page(0x0020_0000).into_bits(), 0x0020_0087);
        assert_eq!(BootPageEntry::huge_page(0x0020_0000).address(), 0x0020_0000);
    }

    #[test]
    fn identity_maps_first_gib_everywhere() {
        let mut buf = vec![0u8; 3 * 4096];
        let cr3 = fill_identity_gib(&mut buf, 0x0040_0000).unwrap();
        assert_eq!(cr3, 0x0040_0000);

        for i in [0, 1, 511] {
            assert_eq!(entry(&buf, 0, i).address(), 0x0040_1000);
            assert_eq!(entry(&buf, 1, i).address(), 0x0040_2000);
            assert!(!entry(&buf, 1, i).page_size());
        }

        let last = entry(&buf, 2, 511);
        assert!(last.page_size());
        assert!(last.present());
        assert_eq!(last.address(), 511 * 0x20_0000);
    }

    #[test]
    fn rejects_short_or_misaligned_buffers() {
        let mut buf = vec![0u8; 2 * 4096];
        assert!(matches!(
            fill_identity_gib(&mut buf, 0x1000),
            Err(PageTableError::BufferTooSmall(8192))
        ));
        let mut buf = vec![0u8; 3 * 4096];
        assert!(matches!(
            fill_identity_gib(&mut buf, 0x1010),
            Err(PageTableError::Misaligned(0x1010))
        ));
    }
}
