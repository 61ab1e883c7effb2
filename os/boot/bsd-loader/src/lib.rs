//! # BSD Kernel Loader
//!
//! Loads FreeBSD, NetBSD and OpenBSD kernels (a.out, ELF32 or ELF64) into
//! physical memory, assembles the protocol-specific boot metadata and hands
//! control to the kernel through a relocator.
//!
//! ## Flow
//!
//! ```text
//!  load command ──► image loader ──► OS augmentation ──► builder ──► relocator
//!   (Session)       (a.out / ELF)    (tags, symbols,     (bootinfo,   boot32 /
//!                                     modules, env)       stack)      boot64
//! ```
//!
//! A [`Session`] owns everything: the [`Relocator`] chunks allocated so far
//! and the loaded kernel's [`tags::TagList`]. Firmware services are reached
//! through the traits in [`platform`], so the same code runs against real
//! firmware or the host-side [`sim`] kit.
//!
//! ## Example
//!
//! ```
//! use bsd_loader::sim::{SimPlatform, SimRelocator, images::ElfBuilder};
//! use bsd_loader::{KernelType, Session, commands};
//!
//! let mut platform = SimPlatform::pc_default();
//! platform.add_file("/bsd", ElfBuilder::elf32(0x0010_0000).text(0x0010_0000, &[0x90; 64]).build());
//!
//! let mut session = Session::new(SimRelocator::new());
//! commands::execute(&mut session, &mut platform, &["kopenbsd", "/bsd"]).unwrap();
//! assert_eq!(session.kernel_type(), Some(KernelType::OpenBsd));
//!
//! let handoff = session.prepare_boot(&mut platform).unwrap();
//! assert!(handoff.is_protected_mode());
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::module_name_repetitions)]

extern crate alloc;

mod arena;
pub mod bootdev;
mod bytes;
pub mod commands;
mod error;
pub mod freebsd;
pub mod image;
pub mod mmap;
pub mod netbsd;
pub mod openbsd;
pub mod pagetable;
pub mod platform;
pub mod relocator;
mod session;
pub mod sim;
mod symbols;
pub mod tags;

pub use arena::{Arena, CursorError};
pub use error::BsdError;
pub use relocator::{Chunk, Cpu32State, Cpu64State, Preference, Relocator, RelocatorError};
pub use session::{Handoff, KernelType, LoadedKernel, Session};

/// Result alias used throughout the loader.
pub type Result<T, E = BsdError> = core::result::Result<T, E>;
