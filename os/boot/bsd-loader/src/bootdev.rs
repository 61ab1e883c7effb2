//! # Boot Device Encoding
//!
//! Legacy BSD kernels identify their root disk by a packed `bootdev` word
//! derived from the BIOS drive number and the BSD slice/partition.

use bsd_bootinfo::{freebsd, openbsd};

use crate::BsdError;
use crate::platform::{BootDisk, FirmwareKind};

/// Marker for a missing slice or partition.
pub const NONE: u32 = 0xff;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum NumberError {
    #[error("Unrecognized number")]
    Empty,
    #[error("Number out of range")]
    Overflow,
}

/// Parses an unsigned integer the way C `strtoul` does.
///
/// With `radix == 0` the base is taken from the prefix: `0x` selects
/// hexadecimal, a leading `0` octal, anything else decimal. Leading
/// whitespace is skipped. Returns the value and the unparsed remainder.
///
/// # Errors
/// [`NumberError::Empty`] without digits, [`NumberError::Overflow`] past `u64`.
pub fn parse_ulong(s: &str, radix: u32) -> Result<(u64, &str), NumberError> {
    let s = s.trim_start_matches([' ', '\t']);
    let bytes = s.as_bytes();

    let (radix, digits_at) = match radix {
        0 | 16
            if bytes.len() > 2
                && bytes[0] == b'0'
                && (bytes[1] | 0x20) == b'x'
                && bytes[2].is_ascii_hexdigit() =>
        {
            (16, 2)
        }
        0 if bytes.first() == Some(&b'0') => (8, 0),
        0 => (10, 0),
        r => (r, 0),
    };

    let digits = &s[digits_at..];
    let len = digits
        .bytes()
        .take_while(|b| char::from(*b).is_digit(radix))
        .count();
    if len == 0 {
        return Err(NumberError::Empty);
    }

    let mut value: u64 = 0;
    for b in digits[..len].bytes() {
        let d = u64::from(char::from(b).to_digit(radix).unwrap_or(0));
        value = value
            .checked_mul(u64::from(radix))
            .and_then(|v| v.checked_add(d))
            .ok_or(NumberError::Overflow)?;
    }
    Ok((value, &digits[len..]))
}

/// Slice and partition of a partition display name such as `"0a"` or `"1,a"`.
///
/// Never fails; missing components are [`NONE`].
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn parse_partition_name(name: &str) -> (u32, u32) {
    let mut slice = NONE;
    let mut part = NONE;
    let mut rest = name;

    if rest.as_bytes().first().is_some_and(u8::is_ascii_digit) {
        // Overflow is reported by strtoul as ULONG_MAX.
        let (value, tail) = parse_ulong(rest, 0).unwrap_or((u64::MAX, ""));
        slice = value as u32;
        rest = tail.strip_prefix(',').unwrap_or(tail);
    }

    if let Some(&c) = rest.as_bytes().first()
        && c.is_ascii_lowercase()
    {
        part = u32::from(c - b'a');
    }
    (slice, part)
}

/// BIOS drive and BSD partition of the device the loader booted from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BiosDevice {
    pub biosdev: u32,
    pub unit: u32,
    pub slice: u32,
    pub part: u32,
}

impl BiosDevice {
    pub fn probe<D: BootDisk + ?Sized>(firmware: FirmwareKind, disk: &D) -> Self {
        let biosdev = match firmware {
            FirmwareKind::PcBios => disk.bios_drive().map_or(NONE, u32::from),
            FirmwareKind::Efi => NONE,
        };
        let (slice, part) = disk.partition_name().map_or((NONE, NONE), parse_partition_name);
        Self {
            biosdev,
            unit: biosdev & 0x7f,
            slice,
            part,
        }
    }

    /// FreeBSD `bootdev`: magic, 1-based slice, unit and partition.
    #[must_use]
    pub const fn freebsd_bootdev(&self) -> u32 {
        freebsd::B_DEVMAGIC
            .wrapping_add(self.slice.wrapping_add(1).wrapping_shl(freebsd::B_SLICESHIFT))
            .wrapping_add(self.unit.wrapping_shl(freebsd::B_UNITSHIFT))
            .wrapping_add(self.part.wrapping_shl(freebsd::B_PARTSHIFT))
    }
}

/// OpenBSD `bootdev` from a root device of the form `wd<unit><partition>`.
///
/// # Errors
/// [`BsdError::BadArgument`] for any other form.
pub fn parse_openbsd_root(root: &str) -> Result<u32, BsdError> {
    const FORM: &str = "only device specifications of form wd<number><lowercase letter> are supported";

    let rest = root.strip_prefix("wd").ok_or(BsdError::BadArgument(FORM))?;
    let (unit, rest) = parse_ulong(rest, 10).map_err(|_| BsdError::BadArgument(FORM))?;
    let part = match rest.as_bytes().first() {
        Some(&c) if c.is_ascii_lowercase() => u32::from(c - b'a'),
        _ => return Err(BsdError::BadArgument(FORM)),
    };

    #[allow(clippy::cast_possible_truncation)]
    let unit = unit as u32;
    Ok(openbsd::B_DEVMAGIC
        .wrapping_add(unit.wrapping_shl(openbsd::B_UNITSHIFT))
        .wrapping_add(part.wrapping_shl(openbsd::B_PARTSHIFT)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bsd_bootinfo::freebsd::FreeBsdBootDev;
    use bsd_bootinfo::openbsd::OpenBsdBootDev;

    struct Disk(Option<u8>, Option<&'static str>);

    impl BootDisk for Disk {
        fn bios_drive(&self) -> Option<u8> {
            self.0
        }

        fn partition_name(&self) -> Option<&str> {
            self.1
        }
    }

    #[test]
    fn strtoul_prefixes() {
        assert_eq!(parse_ulong("0x3f8,9600", 0), Ok((0x3f8, ",9600")));
        assert_eq!(parse_ulong("017", 0), Ok((0o17, "")));
        assert_eq!(parse_ulong("42a", 0), Ok((42, "a")));
        assert_eq!(parse_ulong("0", 0), Ok((0, "")));
        assert_eq!(parse_ulong("0x", 0), Ok((0, "x")));
        assert_eq!(parse_ulong("a", 0), Err(NumberError::Empty));
        assert_eq!(
            parse_ulong("99999999999999999999999", 10),
            Err(NumberError::Overflow)
        );
    }

    #[test]
    fn partition_names() {
        assert_eq!(parse_partition_name("0a"), (0, 0));
        assert_eq!(parse_partition_name("1,a"), (1, 0));
        assert_eq!(parse_partition_name("2"), (2, NONE));
        assert_eq!(parse_partition_name("e"), (NONE, 4));
        assert_eq!(parse_partition_name("msdos1"), (NONE, 12));
        assert_eq!(parse_partition_name(""), (NONE, NONE));
        assert_eq!(parse_partition_name("A"), (NONE, NONE));
    }

    #[test]
    fn probe_uses_bios_drive_only_on_pc_bios() {
        let disk = Disk(Some(0x81), Some("0a"));
        let bios = BiosDevice::probe(FirmwareKind::PcBios, &disk);
        assert_eq!(bios.biosdev, 0x81);
        assert_eq!(bios.unit, 1);

        let efi = BiosDevice::probe(FirmwareKind::Efi, &disk);
        assert_eq!(efi.biosdev, 0xff);
        assert_eq!(efi.unit, 0x7f);
        assert_eq!((efi.slice, efi.part), (0, 0));
    }

    #[test]
    fn freebsd_bootdev_word() {
        let dev = BiosDevice {
            biosdev: 0x80,
            unit: 0,
            slice: 0,
            part: 0,
        };
        let word = dev.freebsd_bootdev();
        assert_eq!(word, 0xa010_0000);
        let decoded = FreeBsdBootDev::from_bits(word);
        assert_eq!(decoded.slice(), 1);
        assert_eq!(decoded.magic(), 0xa);
    }

    #[test]
    fn freebsd_bootdev_wraps_for_missing_slice() {
        let dev = BiosDevice {
            biosdev: 0xff,
            unit: 0x7f,
            slice: NONE,
            part: NONE,
        };
        let expected = 0xa000_0000u32
            .wrapping_add(0x100 << 20)
            .wrapping_add(0x7f << 16)
            .wrapping_add(0xff << 8);
        assert_eq!(dev.freebsd_bootdev(), expected);
    }

    #[test]
    fn openbsd_root_device() {
        let word = parse_openbsd_root("wd0a").unwrap();
        assert_eq!(word, 0xa000_0000);
        let word = parse_openbsd_root("wd1d").unwrap();
        let decoded = OpenBsdBootDev::from_bits(word);
        assert_eq!(decoded.unit(), 1);
        assert_eq!(decoded.partition(), 3);

        assert!(parse_openbsd_root("sd0a").is_err());
        assert!(parse_openbsd_root("wd0").is_err());
        assert!(parse_openbsd_root("wda").is_err());
    }
}
