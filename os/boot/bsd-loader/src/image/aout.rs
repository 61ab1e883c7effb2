//! # a.out Images
//!
//! Legacy BSD kernels (and some current OpenBSD/NetBSD install kernels) still
//! ship as 32-bit a.out. Only the 32-bit header variant is supported.

use bsd_bootinfo::{LEGACY_ADDRESS_MASK, MIN_LOAD_ADDRESS, PAGE_SIZE, align_page};

use super::{ImageFormat, KernelImage};
use crate::bytes::read_u32_le;
use crate::relocator::Relocator;
use crate::{BsdError, Result};

pub const AOUT_HEADER_SIZE: usize = 32;

pub const OMAGIC: u16 = 0o407;
pub const NMAGIC: u16 = 0o410;
pub const ZMAGIC: u16 = 0o413;
pub const QMAGIC: u16 = 0o314;

/// Magic numbers of the 64-bit a.out header, which is never loadable.
const AOUT64_MAGICS: core::ops::RangeInclusive<u16> = 0x1001..=0x1003;

/// File offset of the text segment of a `ZMAGIC` image.
const ZMAGIC_TEXT_OFFSET: u64 = 0x1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AoutKind {
    Aout32,
    Aout64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AoutHeader {
    pub midmag: u32,
    pub text: u32,
    pub data: u32,
    pub bss: u32,
    pub syms: u32,
    pub entry: u32,
    pub trsize: u32,
    pub drsize: u32,
}

impl AoutHeader {
    /// Decodes the header, or `None` when `bytes` is too short.
    #[must_use]
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let word = |i: usize| read_u32_le(bytes, i * 4);
        Some(Self {
            midmag: word(0)?,
            text: word(1)?,
            data: word(2)?,
            bss: word(3)?,
            syms: word(4)?,
            entry: word(5)?,
            trsize: word(6)?,
            drsize: word(7)?,
        })
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn magic(&self) -> u16 {
        (self.midmag & 0xffff) as u16
    }

    #[must_use]
    pub fn kind(&self) -> Option<AoutKind> {
        match self.magic() {
            OMAGIC | NMAGIC | ZMAGIC | QMAGIC => Some(AoutKind::Aout32),
            m if AOUT64_MAGICS.contains(&m) => Some(AoutKind::Aout64),
            _ => None,
        }
    }
}

/// Places an a.out kernel.
///
/// # Errors
/// [`BsdError::BadHeader`] for truncated or 64-bit headers,
/// [`BsdError::BadFormat`] when the magic is not a.out at all.
pub fn load<R: Relocator + ?Sized>(relocator: &mut R, bytes: &[u8]) -> Result<KernelImage> {
    let header = AoutHeader::parse(bytes).ok_or(BsdError::BadHeader)?;
    match header.kind() {
        Some(AoutKind::Aout32) => {}
        Some(AoutKind::Aout64) => return Err(BsdError::BadHeader),
        None => return Err(BsdError::BadFormat("not an a.out or ELF image")),
    }

    let entry = u64::from(header.entry) & LEGACY_ADDRESS_MASK;
    let (load_addr, file_offset, align) = if header.magic() == ZMAGIC {
        (entry, ZMAGIC_TEXT_OFFSET, false)
    } else {
        (entry & 0x00F0_0000, AOUT_HEADER_SIZE as u64, true)
    };

    if load_addr < MIN_LOAD_ADDRESS {
        return Err(BsdError::LoadAddressTooLow(load_addr));
    }

    let image_len = u64::from(header.text) + u64::from(header.data);
    let load_end = load_addr + image_len;
    let mut kern_end = if align { align_page(load_end) } else { load_end };
    if header.bss != 0 {
        kern_end += u64::from(header.bss);
        if align {
            kern_end = align_page(kern_end);
        }
    }

    let size = usize::try_from(kern_end - load_addr).map_err(|_| BsdError::OutOfMemory)?;
    let image_len = usize::try_from(image_len).map_err(|_| BsdError::OutOfMemory)?;
    let src = crate::bytes::slice(bytes, file_offset, image_len as u64)
        .ok_or(BsdError::ReadError("a.out image"))?;

    let chunk = relocator.alloc_chunk_addr(load_addr, size)?;
    let buf = relocator.chunk_mut(chunk)?;
    buf[..image_len].copy_from_slice(src);
    buf[image_len..].fill(0);

    log::debug!(
        "a.out magic {:#o}, kernel at [{load_addr:#x}, {kern_end:#x}), entry {entry:#x}",
        header.magic()
    );
    debug_assert!(!align || kern_end.is_multiple_of(PAGE_SIZE));

    #[allow(clippy::cast_possible_truncation)]
    Ok(KernelImage {
        format: ImageFormat::Aout,
        entry: entry as u32,
        entry_hi: 0,
        kern_start: load_addr,
        kern_end,
        chunk,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimRelocator;
    use crate::sim::images::AoutBuilder;

    #[test]
    fn omagic_is_page_aligned() {
        let image = AoutBuilder::new(OMAGIC, 0x0010_0020)
            .text(&[0xAA; 0x30])
            .data(&[0xBB; 0x10])
            .bss(0x2000)
            .build();
        let mut relocator = SimRelocator::new();
        let loaded = load(&mut relocator, &image).unwrap();

        assert_eq!(loaded.kern_start, 0x0010_0000);
        assert_eq!(loaded.entry, 0x0010_0020);
        assert_eq!(loaded.kern_end, 0x0010_3000);
        assert!(loaded.kern_start <= u64::from(loaded.entry));
        assert!(u64::from(loaded.entry) < loaded.kern_end);

        let placed = relocator.read(0x0010_0000, 0x50).unwrap();
        assert_eq!(&placed[..0x30], &[0xAA; 0x30]);
        assert_eq!(&placed[0x30..0x40], &[0xBB; 0x10]);
        assert_eq!(&placed[0x40..], &[0; 0x10]);
    }

    #[test]
    fn zmagic_loads_at_entry_without_alignment() {
        let image = AoutBuilder::new(ZMAGIC, 0xF020_0000)
            .text(&[1; 0x100])
            .bss(0x10)
            .build();
        let mut relocator = SimRelocator::new();
        let loaded = load(&mut relocator, &image).unwrap();
        assert_eq!(loaded.kern_start, 0x0020_0000);
        assert_eq!(loaded.kern_end, 0x0020_0110);
        assert_eq!(relocator.read(0x0020_0000, 1).unwrap(), &[1]);
    }

    #[test]
    fn header_errors() {
        let mut relocator = SimRelocator::new();
        assert!(matches!(
            load(&mut relocator, &[0; 16]),
            Err(BsdError::BadHeader)
        ));

        let image = AoutBuilder::new(0x1002, 0x0010_0000).build();
        assert!(matches!(load(&mut relocator, &image), Err(BsdError::BadHeader)));

        let image = AoutBuilder::new(0o777, 0x0010_0000).build();
        assert!(matches!(
            load(&mut relocator, &image),
            Err(BsdError::BadFormat(_))
        ));
    }

    #[test]
    fn low_load_address_is_rejected() {
        let image = AoutBuilder::new(OMAGIC, 0x8000).text(&[0; 4]).build();
        let mut relocator = SimRelocator::new();
        assert!(matches!(
            load(&mut relocator, &image),
            Err(BsdError::LoadAddressTooLow(0))
        ));
    }

    #[test]
    fn truncated_text_is_a_read_error() {
        let mut image = AoutBuilder::new(OMAGIC, 0x0010_0000).text(&[0; 64]).build();
        image.truncate(40);
        let mut relocator = SimRelocator::new();
        assert!(matches!(
            load(&mut relocator, &image),
            Err(BsdError::ReadError(_))
        ));
    }
}
