//! # Load Session
//!
//! A [`Session`] owns the relocator and, once a kernel is loaded, everything
//! known about it. Loading replaces any previous kernel; a failed load leaves
//! the session empty.

use alloc::string::String;
use core::convert::Infallible;

use bsd_bootinfo::freebsd::FreeBsdHowto;
use bsd_bootinfo::netbsd::NetBsdHowto;
use bsd_bootinfo::openbsd::OpenBsdHowto;
use log::{debug, error, info};

use crate::image::{self, ImageFormat, KernelImage};
use crate::platform::Platform;
use crate::relocator::{Cpu32State, Cpu64State, Relocator};
use crate::tags::TagList;
use crate::{BsdError, Result, bootdev, freebsd, netbsd, openbsd};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelType {
    FreeBsd,
    NetBsd,
    OpenBsd,
}

/// State of the currently loaded kernel.
#[derive(Debug)]
pub struct LoadedKernel {
    pub(crate) os: KernelType,
    pub(crate) format: ImageFormat,
    pub(crate) entry: u32,
    pub(crate) entry_hi: u32,
    pub(crate) kern_start: u64,
    /// End of everything placed so far. Only grows.
    pub(crate) kern_end: u64,
    pub(crate) bootflags: u32,
    pub(crate) tags: TagList,
    pub(crate) path: String,
    /// OpenBSD `bootdev` from the root option, or 0.
    pub(crate) openbsd_bootdev: u32,
}

impl LoadedKernel {
    pub(crate) fn new(os: KernelType, image: &KernelImage, bootflags: u32, path: &str) -> Self {
        Self {
            os,
            format: image.format,
            entry: image.entry,
            entry_hi: image.entry_hi,
            kern_start: image.kern_start,
            kern_end: image.kern_end,
            bootflags,
            tags: TagList::new(),
            path: String::from(path),
            openbsd_bootdev: 0,
        }
    }

    #[must_use]
    pub const fn os(&self) -> KernelType {
        self.os
    }

    #[must_use]
    pub const fn format(&self) -> ImageFormat {
        self.format
    }

    #[must_use]
    pub const fn is_elf(&self) -> bool {
        self.format.is_elf()
    }

    #[must_use]
    pub const fn is_64bit(&self) -> bool {
        self.format.is_64bit()
    }

    /// Full entry point address.
    #[must_use]
    pub fn entry(&self) -> u64 {
        (u64::from(self.entry_hi) << 32) | u64::from(self.entry)
    }

    #[must_use]
    pub const fn kern_start(&self) -> u64 {
        self.kern_start
    }

    #[must_use]
    pub const fn kern_end(&self) -> u64 {
        self.kern_end
    }

    #[must_use]
    pub const fn bootflags(&self) -> u32 {
        self.bootflags
    }

    #[must_use]
    pub const fn tags(&self) -> &TagList {
        &self.tags
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Moves `kern_end` forward; never backwards.
    pub(crate) fn advance_kern_end(&mut self, end: u64) {
        debug_assert!(end >= self.kern_end, "kern_end must not shrink");
        self.kern_end = self.kern_end.max(end);
    }
}

/// CPU state and relocator constraints for the final jump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handoff {
    Boot32(Cpu32State),
    Boot64 {
        state: Cpu64State,
        /// The trampoline must live within `[min, max)`.
        min: u64,
        max: u64,
    },
}

impl Handoff {
    #[must_use]
    pub const fn is_protected_mode(&self) -> bool {
        matches!(self, Self::Boot32(_))
    }

    /// Initial stack pointer.
    #[must_use]
    pub fn stack_pointer(&self) -> u64 {
        match self {
            Self::Boot32(state) => u64::from(state.esp),
            Self::Boot64 { state, .. } => state.rsp,
        }
    }

    /// Initial instruction pointer.
    #[must_use]
    pub fn instruction_pointer(&self) -> u64 {
        match self {
            Self::Boot32(state) => u64::from(state.eip),
            Self::Boot64 { state, .. } => state.rip,
        }
    }
}

/// A physical address as seen by 32-bit code.
pub(crate) fn addr32(addr: u64) -> Result<u32> {
    u32::try_from(addr).map_err(|_| BsdError::OutOfMemory)
}

pub struct Session<R: Relocator> {
    relocator: R,
    loaded: Option<LoadedKernel>,
}

impl<R: Relocator> Session<R> {
    pub const fn new(relocator: R) -> Self {
        Self {
            relocator,
            loaded: None,
        }
    }

    #[must_use]
    pub fn kernel_type(&self) -> Option<KernelType> {
        self.loaded.as_ref().map(LoadedKernel::os)
    }

    #[must_use]
    pub const fn kernel(&self) -> Option<&LoadedKernel> {
        self.loaded.as_ref()
    }

    pub const fn relocator(&self) -> &R {
        &self.relocator
    }

    /// Drops the loaded kernel and releases every chunk. Does nothing when
    /// nothing is loaded.
    pub fn unload(&mut self) {
        if self.loaded.take().is_some() {
            debug!("unloading kernel");
        }
        self.relocator.release_all();
    }

    fn load_with<P, F>(
        &mut self,
        platform: &mut P,
        os: KernelType,
        path: &str,
        bootflags: u32,
        augment: F,
    ) -> Result<()>
    where
        P: Platform,
        F: FnOnce(&mut R, &mut LoadedKernel, &mut P, &[u8]) -> Result<()>,
    {
        self.unload();
        match Self::try_load(&mut self.relocator, platform, os, path, bootflags, augment) {
            Ok(kernel) => {
                info!(
                    "loaded {os:?} kernel {path} ({:?}) at [{:#x}, {:#x}), entry {:#x}",
                    kernel.format,
                    kernel.kern_start,
                    kernel.kern_end,
                    kernel.entry()
                );
                self.loaded = Some(kernel);
                Ok(())
            }
            Err(e) => {
                error!("failed to load {path}: {e}");
                self.unload();
                Err(e)
            }
        }
    }

    fn try_load<P, F>(
        relocator: &mut R,
        platform: &mut P,
        os: KernelType,
        path: &str,
        bootflags: u32,
        augment: F,
    ) -> Result<LoadedKernel>
    where
        P: Platform,
        F: FnOnce(&mut R, &mut LoadedKernel, &mut P, &[u8]) -> Result<()>,
    {
        let bytes = platform.read_file(path)?;
        let image = image::load_kernel(relocator, &bytes, os, platform.has_long_mode())?;
        let mut kernel = LoadedKernel::new(os, &image, bootflags, path);
        augment(relocator, &mut kernel, platform, &bytes)?;
        Ok(kernel)
    }

    /// Loads a FreeBSD kernel; `args` become the kernel's module arguments.
    ///
    /// # Errors
    /// See [`Session::load_netbsd`].
    pub fn load_freebsd<P: Platform>(
        &mut self,
        platform: &mut P,
        path: &str,
        howto: FreeBsdHowto,
        args: &[&str],
    ) -> Result<()> {
        self.load_with(
            platform,
            KernelType::FreeBsd,
            path,
            howto.bits(),
            |relocator, kernel, _, bytes| freebsd::augment_kernel(relocator, kernel, bytes, args),
        )
    }

    /// Loads an OpenBSD kernel. `root` is a `wd<unit><partition>` device.
    ///
    /// # Errors
    /// [`BsdError::BadArgument`] for a root other than `wdXY`, checked before
    /// anything is unloaded. Otherwise see [`Session::load_netbsd`].
    pub fn load_openbsd<P: Platform>(
        &mut self,
        platform: &mut P,
        path: &str,
        howto: OpenBsdHowto,
        root: Option<&str>,
    ) -> Result<()> {
        let bootdev = root.map_or(Ok(0), bootdev::parse_openbsd_root)?;
        self.load_with(
            platform,
            KernelType::OpenBsd,
            path,
            howto.bits(),
            |_, kernel, _, _| {
                kernel.openbsd_bootdev = bootdev;
                Ok(())
            },
        )
    }

    /// Loads a NetBSD kernel.
    ///
    /// # Errors
    /// Read, format and placement errors. The session is left empty.
    pub fn load_netbsd<P: Platform>(
        &mut self,
        platform: &mut P,
        path: &str,
        howto: NetBsdHowto,
        options: &netbsd::NetBsdOptions<'_>,
    ) -> Result<()> {
        self.load_with(
            platform,
            KernelType::NetBsd,
            path,
            howto.bits(),
            |relocator, kernel, platform, bytes| {
                netbsd::augment_kernel(relocator, kernel, &*platform, bytes, options)
            },
        )
    }

    fn freebsd_kernel(&mut self, needs_elf: bool) -> Result<&mut LoadedKernel> {
        let kernel = self
            .loaded
            .as_mut()
            .ok_or(BsdError::BadArgument("you need to load the kernel first"))?;
        if kernel.os != KernelType::FreeBsd {
            return Err(BsdError::BadArgument("only FreeBSD supports this command"));
        }
        if needs_elf && !kernel.is_elf() {
            return Err(BsdError::BadArgument("only ELF kernel supports module"));
        }
        Ok(kernel)
    }

    /// Imports `key=value` lines from `path` as `kFreeBSD.key` variables.
    ///
    /// # Errors
    /// [`BsdError::BadArgument`] unless a FreeBSD kernel is loaded.
    pub fn freebsd_loadenv<P: Platform>(&mut self, platform: &mut P, path: &str) -> Result<()> {
        self.freebsd_kernel(false)?;
        let bytes = platform.read_file(path)?;
        freebsd::env::import(platform, &bytes)
    }

    /// Loads a raw FreeBSD module. The first argument may be `type=TYPE`.
    ///
    /// # Errors
    /// [`BsdError::BadArgument`] unless a FreeBSD ELF kernel is loaded.
    pub fn freebsd_module<P: Platform>(
        &mut self,
        platform: &mut P,
        path: &str,
        args: &[&str],
    ) -> Result<()> {
        self.freebsd_kernel(true)?;
        let bytes = platform.read_file(path)?;
        let Some(kernel) = self.loaded.as_mut() else {
            return Err(BsdError::BadArgument("you need to load the kernel first"));
        };
        freebsd::module::load_raw(&mut self.relocator, kernel, &bytes, path, args)
    }

    /// Loads a FreeBSD ELF module.
    ///
    /// # Errors
    /// [`BsdError::BadArgument`] unless a FreeBSD ELF kernel is loaded, or
    /// [`BsdError::BadFormat`] when the module class or type does not fit the kernel.
    pub fn freebsd_module_elf<P: Platform>(
        &mut self,
        platform: &mut P,
        path: &str,
        args: &[&str],
    ) -> Result<()> {
        self.freebsd_kernel(true)?;
        let bytes = platform.read_file(path)?;
        let Some(kernel) = self.loaded.as_mut() else {
            return Err(BsdError::BadArgument("you need to load the kernel first"));
        };
        freebsd::module::load_elf(&mut self.relocator, kernel, &bytes, path, args)
    }

    /// Table of the kernel and the modules registered so far.
    ///
    /// # Errors
    /// [`BsdError::BadArgument`] unless a FreeBSD ELF kernel is loaded.
    pub fn freebsd_modules(&mut self) -> Result<String> {
        let kernel = self.freebsd_kernel(true)?;
        Ok(freebsd::module::list(&kernel.tags))
    }

    /// Places all boot metadata and returns the CPU state to enter the
    /// kernel with. Leaves the session loaded on failure.
    ///
    /// # Errors
    /// [`BsdError::BadArgument`] without a kernel, otherwise the builder's error.
    pub fn prepare_boot<P: Platform>(&mut self, platform: &mut P) -> Result<Handoff> {
        let kernel = self
            .loaded
            .as_mut()
            .ok_or(BsdError::BadArgument("you need to load the kernel first"))?;
        let relocator = &mut self.relocator;
        let handoff = match kernel.os {
            KernelType::FreeBsd => freebsd::prepare(relocator, kernel, platform)?,
            KernelType::OpenBsd => openbsd::prepare(relocator, kernel, platform)?,
            KernelType::NetBsd => netbsd::prepare(relocator, kernel, platform)?,
        };
        info!(
            "handoff: ip {:#x}, sp {:#x}, kern_end {:#x}",
            handoff.instruction_pointer(),
            handoff.stack_pointer(),
            kernel.kern_end
        );
        Ok(handoff)
    }

    /// Prepares the handoff, releases the firmware and enters the kernel.
    ///
    /// Only returns when preparation fails.
    ///
    /// # Panics
    /// Once firmware services are released there is nothing to return to; any
    /// failure from that point on panics.
    ///
    /// # Errors
    /// Whatever [`Session::prepare_boot`] returns.
    pub fn boot<P: Platform>(&mut self, platform: &mut P) -> Result<Infallible> {
        let handoff = self.prepare_boot(platform)?;

        if let Err(e) = platform.finish_boot_services() {
            fatal(&BsdError::from(e));
        }

        let result = match handoff {
            Handoff::Boot32(state) => self.relocator.boot32(state),
            Handoff::Boot64 { state, min, max } => self.relocator.boot64(state, min, max),
        };
        match result {
            Ok(never) => match never {},
            Err(e) => fatal(&BsdError::from(e)),
        }
    }
}

fn fatal(e: &BsdError) -> ! {
    error!("{e}");
    panic!("{e}");
}
