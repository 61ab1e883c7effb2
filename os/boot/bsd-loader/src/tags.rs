//! # Metadata Tags
//!
//! Boot metadata accumulates during a session as an ordered list of
//! `{type, payload}` records. Payload length is never padded in storage;
//! padding is the serializer's business.
//!
//! Tags are produced from typed descriptions ([`FreeBsdMeta`],
//! [`NetBsdInfo`]) and encoded only when appended.

use alloc::vec::Vec;
use bsd_bootinfo::freebsd::{
    MODINFO_ADDR, MODINFO_ARGS, MODINFO_END, MODINFO_METADATA, MODINFO_NAME, MODINFO_SIZE,
    MODINFO_TYPE, MODINFOMD_DYNAMIC, MODINFOMD_ELFHDR, MODINFOMD_ENVP, MODINFOMD_ESYM,
    MODINFOMD_HOWTO, MODINFOMD_KERNEND, MODINFOMD_SHDR, MODINFOMD_SMAP, MODINFOMD_SSYM,
};
use bsd_bootinfo::netbsd::{
    BTINFO_BOOTPATH, BTINFO_CONSOLE, BTINFO_FRAMEBUF, BTINFO_MEMMAP, BTINFO_ROOTDEVICE,
    BTINFO_SYMTAB, ConsoleInfo, FramebufferInfo, MAX_BOOTPATH_LEN, MAX_ROOTDEVICE_LEN, SymtabInfo,
};

use crate::BsdError;

/// One metadata record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    kind: u32,
    payload: Vec<u8>,
}

impl Tag {
    /// Creates a tag by copying `payload`.
    ///
    /// # Errors
    /// [`BsdError::OutOfMemory`] when the payload does not fit a 32-bit length.
    pub fn new(kind: u32, payload: &[u8]) -> Result<Self, BsdError> {
        let mut data = Vec::new();
        data.try_reserve_exact(payload.len())
            .map_err(|_| BsdError::OutOfMemory)?;
        data.extend_from_slice(payload);
        Ok(Self {
            kind,
            payload: data,
        })
    }

    #[inline]
    #[must_use]
    pub const fn kind(&self) -> u32 {
        self.kind
    }

    #[inline]
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn len(&self) -> u32 {
        self.payload.len() as u32
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Ordered, append-only tag collection owned by a session.
#[derive(Debug, Default)]
pub struct TagList {
    tags: Vec<Tag>,
}

impl TagList {
    #[must_use]
    pub const fn new() -> Self {
        Self { tags: Vec::new() }
    }

    /// Appends a record at the tail.
    ///
    /// # Errors
    /// [`BsdError::OutOfMemory`] when storage cannot grow; the list is left unchanged.
    pub fn append(&mut self, kind: u32, payload: &[u8]) -> Result<(), BsdError> {
        let tag = Tag::new(kind, payload)?;
        self.tags
            .try_reserve(1)
            .map_err(|_| BsdError::OutOfMemory)?;
        self.tags.push(tag);
        Ok(())
    }

    /// Encodes and appends a FreeBSD metadata record.
    ///
    /// # Errors
    /// [`BsdError::OutOfMemory`] when the payload does not fit a 32-bit length.
    pub fn push_freebsd(&mut self, meta: &FreeBsdMeta<'_>) -> Result<(), BsdError> {
        let (kind, payload) = meta.encode();
        self.append(kind, &payload)
    }

    /// Encodes and appends a NetBSD btinfo record.
    ///
    /// # Errors
    /// [`BsdError::OutOfMemory`] when the payload does not fit a 32-bit length.
    pub fn push_netbsd(&mut self, info: &NetBsdInfo<'_>) -> Result<(), BsdError> {
        let (kind, payload) = info.encode();
        self.append(kind, &payload)
    }

    pub fn clear(&mut self) {
        self.tags.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tags.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn iter(&self) -> core::slice::Iter<'_, Tag> {
        self.tags.iter()
    }
}

impl<'a> IntoIterator for &'a TagList {
    type Item = &'a Tag;
    type IntoIter = core::slice::Iter<'a, Tag>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// FreeBSD `modinfo` records.
///
/// Address-sized values are encoded as 32-bit or 64-bit words according to
/// `wide`, matching the kernel's pointer size.
#[derive(Debug, Clone)]
pub enum FreeBsdMeta<'a> {
    Name(&'a str),
    Type(&'a str),
    Addr { value: u64, wide: bool },
    Size { value: u64, wide: bool },
    /// Module arguments, joined with single spaces.
    Args(&'a [&'a str]),
    ElfHeader(&'a [u8]),
    SectionHeaders(&'a [u8]),
    SymbolsStart { value: u64, wide: bool },
    SymbolsEnd { value: u64, wide: bool },
    Dynamic { value: u64, wide: bool },
    /// Placeholder patched with the boot flags at handoff; always 4 bytes.
    Howto,
    /// Placeholder patched with the environment address at handoff.
    Envp { wide: bool },
    /// Placeholder patched with the final kernel end at handoff.
    Kernend { wide: bool },
    Smap(&'a [u8]),
    End,
}

#[allow(clippy::cast_possible_truncation)]
fn word(value: u64, wide: bool) -> Vec<u8> {
    if wide {
        value.to_le_bytes().to_vec()
    } else {
        (value as u32).to_le_bytes().to_vec()
    }
}

fn c_string(s: &str) -> Vec<u8> {
    let mut v = Vec::with_capacity(s.len() + 1);
    v.extend_from_slice(s.as_bytes());
    v.push(0);
    v
}

impl FreeBsdMeta<'_> {
    /// The record type and its encoded payload.
    #[must_use]
    pub fn encode(&self) -> (u32, Vec<u8>) {
        const MD: u32 = MODINFO_METADATA;
        match *self {
            Self::Name(name) => (MODINFO_NAME, c_string(name)),
            Self::Type(ty) => (MODINFO_TYPE, c_string(ty)),
            Self::Addr { value, wide } => (MODINFO_ADDR, word(value, wide)),
            Self::Size { value, wide } => (MODINFO_SIZE, word(value, wide)),
            Self::Args(args) => {
                let mut line = Vec::new();
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        line.push(b' ');
                    }
                    line.extend_from_slice(arg.as_bytes());
                }
                line.push(0);
                (MODINFO_ARGS, line)
            }
            Self::ElfHeader(ehdr) => (MD | MODINFOMD_ELFHDR, ehdr.to_vec()),
            Self::SectionHeaders(shdrs) => (MD | MODINFOMD_SHDR, shdrs.to_vec()),
            Self::SymbolsStart { value, wide } => (MD | MODINFOMD_SSYM, word(value, wide)),
            Self::SymbolsEnd { value, wide } => (MD | MODINFOMD_ESYM, word(value, wide)),
            Self::Dynamic { value, wide } => (MD | MODINFOMD_DYNAMIC, word(value, wide)),
            Self::Howto => (MD | MODINFOMD_HOWTO, word(0, false)),
            Self::Envp { wide } => (MD | MODINFOMD_ENVP, word(0, wide)),
            Self::Kernend { wide } => (MD | MODINFOMD_KERNEND, word(0, wide)),
            Self::Smap(table) => (MD | MODINFOMD_SMAP, table.to_vec()),
            Self::End => (MODINFO_END, Vec::new()),
        }
    }
}

/// NetBSD `btinfo` records.
#[derive(Debug, Clone)]
pub enum NetBsdInfo<'a> {
    /// Kernel file name; stored zero padded in 80 bytes.
    BootPath(&'a str),
    /// Root device name; stored zero padded in 16 bytes.
    RootDevice(&'a str),
    Console(&'a ConsoleInfo),
    Symtab(SymtabInfo),
    /// Count-prefixed memory map.
    MemoryMap(&'a [u8]),
    Framebuffer(&'a FramebufferInfo),
}

fn padded(s: &str, size: usize) -> Vec<u8> {
    let mut v = alloc::vec![0u8; size];
    let n = s.len().min(size - 1);
    v[..n].copy_from_slice(&s.as_bytes()[..n]);
    v
}

impl NetBsdInfo<'_> {
    #[must_use]
    pub fn encode(&self) -> (u32, Vec<u8>) {
        match *self {
            Self::BootPath(path) => (BTINFO_BOOTPATH, padded(path, MAX_BOOTPATH_LEN)),
            Self::RootDevice(dev) => (BTINFO_ROOTDEVICE, padded(dev, MAX_ROOTDEVICE_LEN)),
            Self::Console(console) => (BTINFO_CONSOLE, console.to_bytes().to_vec()),
            Self::Symtab(symtab) => (BTINFO_SYMTAB, symtab.to_bytes().to_vec()),
            Self::MemoryMap(table) => (BTINFO_MEMMAP, table.to_vec()),
            Self::Framebuffer(fb) => (BTINFO_FRAMEBUF, fb.to_bytes().to_vec()),
        }
    }
}
