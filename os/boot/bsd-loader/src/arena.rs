//! # Bump Cursor
//!
//! [`Arena`] serializes boot metadata into a relocator chunk. It tracks the
//! physical address the chunk will occupy at handoff, so pointers written into
//! the blob can be derived from the current position.

/// Errors raised by [`Arena`] writes.
#[derive(Debug, thiserror::Error)]
pub enum CursorError {
    #[error("Writing {len} bytes at offset {offset} exceeds the {capacity} byte buffer")]
    Overflow {
        offset: usize,
        len: usize,
        capacity: usize,
    },
}

/// Every write fails with [`CursorError::Overflow`] when it would run past
/// the end of the buffer; nothing is written in that case.
pub struct Arena<'a> {
    buf: &'a mut [u8],
    base: u64,
    pos: usize,
}

#[allow(clippy::missing_errors_doc)]
impl<'a> Arena<'a> {
    /// Creates a cursor over `buf`, which is located at physical address `base`.
    pub const fn new(buf: &'a mut [u8], base: u64) -> Self {
        Self { buf, base, pos: 0 }
    }

    #[inline]
    #[must_use]
    pub const fn position(&self) -> usize {
        self.pos
    }

    /// Physical address of the current position.
    #[inline]
    #[must_use]
    pub const fn address(&self) -> u64 {
        self.base + self.pos as u64
    }

    #[inline]
    #[must_use]
    pub const fn base(&self) -> u64 {
        self.base
    }

    fn range(&mut self, offset: usize, len: usize) -> Result<&mut [u8], CursorError> {
        let capacity = self.buf.len();
        let end = offset
            .checked_add(len)
            .filter(|&end| end <= capacity)
            .ok_or(CursorError::Overflow {
                offset,
                len,
                capacity,
            })?;
        Ok(&mut self.buf[offset..end])
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), CursorError> {
        self.range(self.pos, bytes.len())?.copy_from_slice(bytes);
        self.pos += bytes.len();
        Ok(())
    }

    pub fn write_u8(&mut self, value: u8) -> Result<(), CursorError> {
        self.write_bytes(&[value])
    }

    pub fn write_u32(&mut self, value: u32) -> Result<(), CursorError> {
        self.write_bytes(&value.to_le_bytes())
    }

    pub fn write_u64(&mut self, value: u64) -> Result<(), CursorError> {
        self.write_bytes(&value.to_le_bytes())
    }

    /// Writes `value` as a 64-bit word when `wide`, else truncated to 32 bits.
    #[allow(clippy::cast_possible_truncation)]
    pub fn write_word(&mut self, value: u64, wide: bool) -> Result<(), CursorError> {
        if wide {
            self.write_u64(value)
        } else {
            self.write_u32(value as u32)
        }
    }

    pub fn write_zeros(&mut self, len: usize) -> Result<(), CursorError> {
        self.range(self.pos, len)?.fill(0);
        self.pos += len;
        Ok(())
    }

    /// Zero-pads until the physical address is a multiple of `align`.
    pub fn align_to(&mut self, align: u64) -> Result<(), CursorError> {
        let target = bsd_bootinfo::align_up(self.address(), align);
        #[allow(clippy::cast_possible_truncation)]
        let pad = (target - self.address()) as usize;
        self.write_zeros(pad)
    }

    /// Overwrites `len` bytes at `offset` with the low bytes of `value`.
    pub fn patch_le(&mut self, offset: usize, len: usize, value: u64) -> Result<(), CursorError> {
        let bytes = value.to_le_bytes();
        let n = len.min(bytes.len());
        let dst = self.range(offset, len)?;
        dst.fill(0);
        dst[..n].copy_from_slice(&bytes[..n]);
        Ok(())
    }

    /// Mutable view of `len` bytes at `offset`.
    pub fn slice_mut(&mut self, offset: usize, len: usize) -> Result<&mut [u8], CursorError> {
        self.range(offset, len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_advance_and_track_addresses() {
        let mut buf = [0xAAu8; 32];
        let mut a = Arena::new(&mut buf, 0x1000);
        a.write_u32(0x1122_3344).unwrap();
        assert_eq!(a.position(), 4);
        assert_eq!(a.address(), 0x1004);
        a.write_word(0x5566_7788_99AA_BBCC, false).unwrap();
        a.align_to(16).unwrap();
        assert_eq!(a.address(), 0x1010);
        a.write_word(7, true).unwrap();
        assert_eq!(a.position(), 24);
        drop(a);

        assert_eq!(&buf[0..4], &0x1122_3344u32.to_le_bytes());
        assert_eq!(&buf[4..8], &0x99AA_BBCCu32.to_le_bytes());
        assert!(buf[8..16].iter().all(|&b| b == 0));
        assert_eq!(&buf[16..24], &7u64.to_le_bytes());
        assert_eq!(buf[24], 0xAA);
    }

    #[test]
    fn overflow_is_reported() {
        let mut buf = [0u8; 6];
        let mut a = Arena::new(&mut buf, 0);
        a.write_u32(1).unwrap();
        assert!(matches!(
            a.write_u32(2),
            Err(CursorError::Overflow {
                offset: 4,
                len: 4,
                capacity: 6
            })
        ));
        assert_eq!(a.position(), 4);
    }

    #[test]
    fn patch_writes_exactly_len_bytes() {
        let mut buf = [0xFFu8; 12];
        let mut a = Arena::new(&mut buf, 0);
        a.patch_le(2, 4, 0x0102_0304_0506_0708).unwrap();
        drop(a);
        assert_eq!(buf[..2], [0xFF, 0xFF]);
        assert_eq!(buf[2..6], [0x08, 0x07, 0x06, 0x05]);
        assert_eq!(buf[6], 0xFF);
    }
}
