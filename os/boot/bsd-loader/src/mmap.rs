//! # Memory Map Translation
//!
//! Converts the firmware memory map into the BIOS `SMAP` record format shared
//! by the BSD kernels. Adjacent regions of the same type are coalesced.
//!
//! Serialization runs in two passes over the firmware enumeration: the first
//! sizes the output, the second writes it with identical merge logic. Every
//! record of the second pass must equal the one sized in the first, otherwise
//! the firmware map changed underneath us and the table is rejected.
//!
//! ## Flavours
//!
//! | Flavour | Difference |
//! |---------|------------|
//! | FreeBSD | A leading `[0, min(first, 64 KiB))` RAM region is synthesized when the map does not start at 0. |
//! | NetBSD  | The table is prefixed with a `u32` record count. |
//! | OpenBSD | The table is terminated with an all-zero record. |

use alloc::vec::Vec;
use bsd_bootinfo::smap::{SMAP_ENTRY_SIZE, SmapEntry, SmapType};
use bsd_bootinfo::CONVENTIONAL_MEMORY_END;

use crate::platform::MemoryMapSource;

/// Size of the RAM region FreeBSD expects at address 0.
const FREEBSD_LOW_MEMORY: u64 = 0x1_0000;

/// Region classification reported by the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryKind {
    Available,
    Reserved,
    Acpi,
    Nvs,
    Code,
}

impl From<MemoryKind> for SmapType {
    fn from(value: MemoryKind) -> Self {
        match value {
            MemoryKind::Available => Self::Ram,
            MemoryKind::Acpi => Self::Acpi,
            MemoryKind::Nvs => Self::Nvs,
            MemoryKind::Reserved | MemoryKind::Code => Self::Reserved,
        }
    }
}

/// Receives regions from [`MemoryMapSource::for_each_region`].
pub trait RegionVisitor {
    fn visit(&mut self, base: u64, length: u64, kind: MemoryKind);
}

impl<F> RegionVisitor for F
where
    F: FnMut(u64, u64, MemoryKind),
{
    fn visit(&mut self, base: u64, length: u64, kind: MemoryKind) {
        self(base, length, kind);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapFlavour {
    FreeBsd,
    NetBsd,
    OpenBsd,
}

impl MapFlavour {
    const fn prefix_len(self) -> usize {
        match self {
            Self::NetBsd => 4,
            Self::FreeBsd | Self::OpenBsd => 0,
        }
    }

    const fn suffix_len(self) -> usize {
        match self {
            Self::OpenBsd => SMAP_ENTRY_SIZE,
            Self::FreeBsd | Self::NetBsd => 0,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MemoryMapError {
    #[error("Memory map passes disagree: {expected} records sized, {found} written")]
    Mismatch { expected: usize, found: usize },
    #[error("Memory map record {index} differs between passes")]
    Changed { index: usize },
    #[error("Out of memory")]
    OutOfMemory,
}

trait RecordSink {
    fn emit(&mut self, entry: SmapEntry);
}

/// Writes records that match the sizing pass; remembers the first that does not.
struct SliceWriter<'a> {
    expected: &'a [SmapEntry],
    out: &'a mut [u8],
    count: usize,
    changed: Option<usize>,
}

impl RecordSink for SliceWriter<'_> {
    fn emit(&mut self, entry: SmapEntry) {
        let off = self.count * SMAP_ENTRY_SIZE;
        if self.expected.get(self.count) != Some(&entry) {
            self.changed = self.changed.or(Some(self.count));
        } else if let Some(dst) = self.out.get_mut(off..off + SMAP_ENTRY_SIZE) {
            dst.copy_from_slice(&entry.to_bytes());
        }
        self.count += 1;
    }
}

impl RecordSink for Vec<SmapEntry> {
    fn emit(&mut self, entry: SmapEntry) {
        self.push(entry);
    }
}

/// Merges the firmware enumeration and forwards finished records to a sink.
struct Coalescer<S> {
    flavour: MapFlavour,
    first: bool,
    pending: Option<SmapEntry>,
    sink: S,
}

impl<S: RecordSink> Coalescer<S> {
    const fn new(flavour: MapFlavour, sink: S) -> Self {
        Self {
            flavour,
            first: true,
            pending: None,
            sink,
        }
    }

    fn push(&mut self, cur: SmapEntry) {
        if let Some(prev) = self.pending.as_mut()
            && prev.kind == cur.kind
            && prev.end() == cur.base
        {
            prev.length += cur.length;
            return;
        }
        if let Some(prev) = self.pending.replace(cur) {
            self.sink.emit(prev);
        }
    }

    fn finish(mut self) -> S {
        if let Some(prev) = self.pending.take() {
            self.sink.emit(prev);
        }
        self.sink
    }
}

impl<S: RecordSink> RegionVisitor for Coalescer<S> {
    fn visit(&mut self, base: u64, length: u64, kind: MemoryKind) {
        if self.first {
            self.first = false;
            if self.flavour == MapFlavour::FreeBsd && base != 0 {
                self.push(SmapEntry::new(
                    0,
                    base.min(FREEBSD_LOW_MEMORY),
                    SmapType::Ram,
                ));
            }
        }
        self.push(SmapEntry::new(base, length, kind.into()));
    }
}

fn run<M, S>(source: &M, flavour: MapFlavour, sink: S) -> S
where
    M: MemoryMapSource + ?Sized,
    S: RecordSink,
{
    let mut coalescer = Coalescer::new(flavour, sink);
    source.for_each_region(&mut coalescer);
    coalescer.finish()
}

/// The merged records, decoded.
pub fn merged_regions<M: MemoryMapSource + ?Sized>(source: &M, flavour: MapFlavour) -> Vec<SmapEntry> {
    run(source, flavour, Vec::new())
}

/// Writes the merged records into `out`, returning how many were produced.
///
/// `expected` holds the records of the sizing pass; `out` has room for
/// exactly those.
///
/// # Errors
/// [`MemoryMapError::Mismatch`] when the enumeration produces a different
/// number of records, [`MemoryMapError::Changed`] when a record differs.
pub fn write_records<M: MemoryMapSource + ?Sized>(
    source: &M,
    flavour: MapFlavour,
    expected: &[SmapEntry],
    out: &mut [u8],
) -> Result<usize, MemoryMapError> {
    let writer = SliceWriter {
        expected,
        out,
        count: 0,
        changed: None,
    };
    let writer = run(source, flavour, writer);
    if writer.count != expected.len() {
        return Err(MemoryMapError::Mismatch {
            expected: expected.len(),
            found: writer.count,
        });
    }
    match writer.changed {
        Some(index) => Err(MemoryMapError::Changed { index }),
        None => Ok(writer.count),
    }
}

/// A serialized table in the given flavour, including prefix and terminator.
///
/// # Errors
/// [`MemoryMapError::Mismatch`] or [`MemoryMapError::Changed`] when the two
/// enumerations disagree.
pub fn build_table<M: MemoryMapSource + ?Sized>(
    source: &M,
    flavour: MapFlavour,
) -> Result<Vec<u8>, MemoryMapError> {
    let sized = merged_regions(source, flavour);
    let count = sized.len();
    let prefix = flavour.prefix_len();
    let body = count * SMAP_ENTRY_SIZE;
    let len = prefix + body + flavour.suffix_len();

    let mut table = Vec::new();
    table
        .try_reserve_exact(len)
        .map_err(|_| MemoryMapError::OutOfMemory)?;
    table.resize(len, 0);

    write_records(source, flavour, &sized, &mut table[prefix..prefix + body])?;
    if flavour == MapFlavour::NetBsd {
        let count = u32::try_from(count).map_err(|_| MemoryMapError::OutOfMemory)?;
        table[..4].copy_from_slice(&count.to_le_bytes());
    }

    log::trace!("{count} entries in {flavour:?} memory map");
    Ok(table)
}

/// Bytes of conventional memory: the available region at 0, capped at 1 MiB.
pub fn lower_memory<M: MemoryMapSource + ?Sized>(source: &M) -> u64 {
    let mut lower = 0;
    source.for_each_region(&mut |base: u64, length: u64, kind: MemoryKind| {
        if kind == MemoryKind::Available && base == 0 {
            lower = length.min(CONVENTIONAL_MEMORY_END);
        }
    });
    lower
}

/// Bytes of extended memory: the part above 1 MiB of the available region
/// containing 1 MiB.
pub fn upper_memory<M: MemoryMapSource + ?Sized>(source: &M) -> u64 {
    let mut upper = 0;
    source.for_each_region(&mut |base: u64, length: u64, kind: MemoryKind| {
        let end = base.saturating_add(length);
        if kind == MemoryKind::Available
            && base <= CONVENTIONAL_MEMORY_END
            && end > CONVENTIONAL_MEMORY_END
        {
            upper = end - CONVENTIONAL_MEMORY_END;
        }
    });
    upper
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytes::{read_u32_le, read_u64_le};
    use core::cell::Cell;

    struct Regions(Vec<(u64, u64, MemoryKind)>);

    impl MemoryMapSource for Regions {
        fn for_each_region(&self, visitor: &mut dyn RegionVisitor) {
            for &(base, length, kind) in &self.0 {
                visitor.visit(base, length, kind);
            }
        }
    }

    /// Grows by one region on every enumeration.
    struct Growing(Cell<u64>);

    impl MemoryMapSource for Growing {
        fn for_each_region(&self, visitor: &mut dyn RegionVisitor) {
            let n = self.0.get();
            self.0.set(n + 1);
            for i in 0..=n {
                let kind = if i % 2 == 0 {
                    MemoryKind::Available
                } else {
                    MemoryKind::Reserved
                };
                visitor.visit(i * 0x1000, 0x1000, kind);
            }
        }
    }

    /// Moves the end of the first region on every enumeration.
    struct Shifting(Cell<u64>);

    impl MemoryMapSource for Shifting {
        fn for_each_region(&self, visitor: &mut dyn RegionVisitor) {
            let n = self.0.get();
            self.0.set(n + 1);
            visitor.visit(0, 0x9_f000 + n * 0x400, MemoryKind::Available);
            visitor.visit(0x10_0000, 0x10_0000, MemoryKind::Available);
        }
    }

    use MemoryKind::{Acpi, Available, Code, Reserved};

    #[test]
    fn adjacent_same_kind_regions_merge() {
        let map = Regions(vec![(0, 0x1000, Available), (0x1000, 0x1000, Available)]);
        let merged = merged_regions(&map, MapFlavour::OpenBsd);
        assert_eq!(merged, [SmapEntry::new(0, 0x2000, SmapType::Ram)]);
    }

    #[test]
    fn different_kinds_or_gaps_never_merge() {
        let map = Regions(vec![
            (0, 0x1000, Available),
            (0x1000, 0x1000, Acpi),
            (0x3000, 0x1000, Acpi),
        ]);
        assert_eq!(merged_regions(&map, MapFlavour::NetBsd).len(), 3);
    }

    #[test]
    fn code_and_reserved_collapse_to_reserved() {
        let map = Regions(vec![(0, 0x1000, Code), (0x1000, 0x1000, Reserved)]);
        let merged = merged_regions(&map, MapFlavour::NetBsd);
        assert_eq!(merged, [SmapEntry::new(0, 0x2000, SmapType::Reserved)]);
    }

    #[test]
    fn freebsd_synthesizes_low_memory() {
        let map = Regions(vec![(0x20000, 0x1000, Available)]);
        let merged = merged_regions(&map, MapFlavour::FreeBsd);
        assert_eq!(
            merged,
            [
                SmapEntry::new(0, 0x10000, SmapType::Ram),
                SmapEntry::new(0x20000, 0x1000, SmapType::Ram),
            ]
        );

        // The synthesized region is shorter when the map starts below 64 KiB,
        // and merges with a contiguous RAM region.
        let map = Regions(vec![(0x8000, 0x1000, Available)]);
        let merged = merged_regions(&map, MapFlavour::FreeBsd);
        assert_eq!(merged, [SmapEntry::new(0, 0x9000, SmapType::Ram)]);

        let map = Regions(vec![(0, 0x1000, Available)]);
        assert_eq!(merged_regions(&map, MapFlavour::FreeBsd).len(), 1);
    }

    #[test]
    fn passes_agree_regardless_of_order() {
        let map = Regions(vec![
            (0x10_0000, 0x10_0000, Available),
            (0, 0x9_fc00, Available),
            (0x9_fc00, 0x400, Reserved),
            (0x20_0000, 0x1000, Available),
        ]);
        let count = merged_regions(&map, MapFlavour::OpenBsd).len();
        let table = build_table(&map, MapFlavour::OpenBsd).unwrap();
        assert_eq!(table.len(), (count + 1) * SMAP_ENTRY_SIZE);
        // The last region follows a reserved record and stays separate.
        assert_eq!(count, 4);
    }

    #[test]
    fn netbsd_table_is_count_prefixed() {
        let map = Regions(vec![(0, 0x1000, Available), (0x1000, 0x1000, Reserved)]);
        let table = build_table(&map, MapFlavour::NetBsd).unwrap();
        assert_eq!(table.len(), 4 + 2 * SMAP_ENTRY_SIZE);
        assert_eq!(read_u32_le(&table, 0), Some(2));
        assert_eq!(read_u64_le(&table, 4 + SMAP_ENTRY_SIZE), Some(0x1000));
        assert_eq!(read_u32_le(&table, 4 + SMAP_ENTRY_SIZE + 16), Some(2));
    }

    #[test]
    fn openbsd_table_is_zero_terminated() {
        let map = Regions(vec![(0, 0x1000, Available)]);
        let table = build_table(&map, MapFlavour::OpenBsd).unwrap();
        assert_eq!(table.len(), 2 * SMAP_ENTRY_SIZE);
        assert_eq!(&table[SMAP_ENTRY_SIZE..], &SmapEntry::TERMINATOR);
    }

    #[test]
    fn changing_map_is_rejected() {
        let map = Growing(Cell::new(1));
        let err = build_table(&map, MapFlavour::FreeBsd).unwrap_err();
        assert!(matches!(
            err,
            MemoryMapError::Mismatch {
                expected: 2,
                found: 3
            }
        ));
    }

    #[test]
    fn moved_boundary_is_rejected() {
        let map = Shifting(Cell::new(0));
        let err = build_table(&map, MapFlavour::OpenBsd).unwrap_err();
        assert!(matches!(err, MemoryMapError::Changed { index: 0 }));

        let map = Shifting(Cell::new(0));
        let sized = merged_regions(&map, MapFlavour::OpenBsd);
        let mut out = vec![0; sized.len() * SMAP_ENTRY_SIZE];
        assert!(write_records(&map, MapFlavour::OpenBsd, &sized, &mut out).is_err());
        // Only the unchanged record was written.
        assert!(out[..SMAP_ENTRY_SIZE].iter().all(|&b| b == 0));
        assert_eq!(read_u64_le(&out, SMAP_ENTRY_SIZE), Some(0x10_0000));
    }

    #[test]
    fn freebsd_low_memory_is_capped() {
        let map = Regions(vec![(0x10_0000, 0x1000, Available)]);
        let merged = merged_regions(&map, MapFlavour::FreeBsd);
        assert_eq!(merged[0], SmapEntry::new(0, FREEBSD_LOW_MEMORY, SmapType::Ram));
    }

    #[test]
    fn lower_and_upper_memory() {
        let map = Regions(vec![
            (0, 0x9_fc00, Available),
            (0x9_fc00, 0x400, Reserved),
            (0x10_0000, 0x7f0_0000, Available),
        ]);
        assert_eq!(lower_memory(&map), 0x9_fc00);
        assert_eq!(upper_memory(&map), 0x7f0_0000);

        let map = Regions(vec![(0, 0x20_0000, Available)]);
        assert_eq!(lower_memory(&map), 0x10_0000);
        assert_eq!(upper_memory(&map), 0x10_0000);

        let map = Regions(vec![(0x1000, 0x1000, Available)]);
        assert_eq!(lower_memory(&map), 0);
        assert_eq!(upper_memory(&map), 0);
    }
}
