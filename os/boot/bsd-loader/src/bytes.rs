//! Bounds-checked little-endian reads over untrusted image bytes.

#[inline]
pub fn read_u8(buf: &[u8], off: usize) -> Option<u8> {
    buf.get(off).copied()
}

#[inline]
pub fn read_u16_le(buf: &[u8], off: usize) -> Option<u16> {
    let end = off.checked_add(2)?;
    let s = buf.get(off..end)?;
    Some(u16::from_le_bytes([s[0], s[1]]))
}

#[inline]
pub fn read_u32_le(buf: &[u8], off: usize) -> Option<u32> {
    let end = off.checked_add(4)?;
    let s = buf.get(off..end)?;
    Some(u32::from_le_bytes([s[0], s[1], s[2], s[3]]))
}

#[inline]
pub fn read_u64_le(buf: &[u8], off: usize) -> Option<u64> {
    let end = off.checked_add(8)?;
    let s = buf.get(off..end)?;
    Some(u64::from_le_bytes([
        s[0], s[1], s[2], s[3], s[4], s[5], s[6], s[7],
    ]))
}

/// Reads a 32- or 64-bit word depending on `wide`.
#[inline]
pub fn read_word_le(buf: &[u8], off: usize, wide: bool) -> Option<u64> {
    if wide {
        read_u64_le(buf, off)
    } else {
        read_u32_le(buf, off).map(u64::from)
    }
}

/// Returns `buf[off..off + len]`, or `None` when the range leaves the buffer.
#[inline]
pub fn slice(buf: &[u8], off: u64, len: u64) -> Option<&[u8]> {
    let off = usize::try_from(off).ok()?;
    let len = usize::try_from(len).ok()?;
    let end = off.checked_add(len)?;
    buf.get(off..end)
}

/// Reads a NUL-terminated string starting at `off`.
pub fn c_str(buf: &[u8], off: usize) -> Option<&[u8]> {
    let tail = buf.get(off..)?;
    let len = tail.iter().position(|&b| b == 0)?;
    Some(&tail[..len])
}
