//! # Platform Services
//!
//! Everything the loader needs from the firmware environment, split into
//! narrow traits so each step only depends on what it uses. [`Platform`] is the
//! union, implemented automatically for any type providing all of them.

use alloc::string::String;
use alloc::vec::Vec;

use crate::mmap::RegionVisitor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareKind {
    PcBios,
    Efi,
}

/// Legacy COM port I/O bases.
pub const SERIAL_PORTS: [u16; 4] = [0x3f8, 0x2f8, 0x3e8, 0x2e8];

#[derive(Debug, thiserror::Error)]
pub enum FirmwareError {
    #[error("Cannot exit boot services")]
    ExitBootServices,
}

pub trait Firmware {
    fn kind(&self) -> FirmwareKind;

    /// Whether the CPU implements AMD64 long mode.
    fn has_long_mode(&self) -> bool;

    /// Releases firmware boot services. A no-op on PC BIOS.
    fn finish_boot_services(&mut self) -> Result<(), FirmwareError>;

    /// I/O base of serial port `unit`, or 0 when there is no such port.
    fn serial_port(&self, unit: u64) -> u16 {
        usize::try_from(unit)
            .ok()
            .and_then(|i| SERIAL_PORTS.get(i))
            .copied()
            .unwrap_or(0)
    }
}

/// The device the loader was started from.
pub trait BootDisk {
    /// BIOS drive number of the root device, when the firmware has one.
    fn bios_drive(&self) -> Option<u8>;

    /// Display name of the active partition, e.g. `"0a"` or `"1,a"`.
    fn partition_name(&self) -> Option<&str>;
}

/// Firmware memory map enumeration. Enumeration must be repeatable with
/// identical results while a handoff is being prepared.
pub trait MemoryMapSource {
    fn for_each_region(&self, visitor: &mut dyn RegionVisitor);
}

#[derive(Debug, thiserror::Error)]
pub enum EnvError {
    #[error("Invalid variable name")]
    InvalidName,
    #[error("Out of memory")]
    OutOfMemory,
}

/// Configuration variable store.
pub trait EnvStore {
    /// All variables in store order.
    fn variables(&self) -> impl Iterator<Item = (&str, &str)>;

    fn get(&self, name: &str) -> Option<&str>;

    fn set(&mut self, name: &str, value: &str) -> Result<(), EnvError>;
}

/// Active video mode as reported after a mode switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModeInfo {
    pub width: u32,
    pub height: u32,
    /// Bytes per scan line.
    pub pitch: u32,
    pub bpp: u8,
    pub red_mask_size: u8,
    pub red_field_pos: u8,
    pub green_mask_size: u8,
    pub green_field_pos: u8,
    pub blue_mask_size: u8,
    pub blue_field_pos: u8,
    pub framebuffer: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum VideoError {
    #[error("No video mode matches {0:?}")]
    NoMatchingMode(String),
    #[error("No graphical video mode is active")]
    NoMode,
    #[error("The adapter cannot change the DAC palette width")]
    Unsupported,
}

pub trait VideoOutput {
    /// Switches to the first mode in a `;`-separated list such as
    /// `"1024x768;800x600"` or `"text"`.
    fn set_mode(&mut self, spec: &str) -> Result<(), VideoError>;

    /// Describes the active graphical mode and releases the video driver.
    fn mode_info(&mut self) -> Result<ModeInfo, VideoError>;

    /// Requests a DAC palette width, returning the width actually set.
    fn set_dac_palette_width(&mut self, bits: u8) -> Result<u8, VideoError>;
}

#[derive(Debug, thiserror::Error)]
pub enum FileError {
    #[error("File not found")]
    NotFound,
    #[error("I/O error")]
    Io,
}

pub trait FileSystem {
    /// Reads a whole file, decompressing it transparently where applicable.
    fn read_file(&mut self, path: &str) -> Result<Vec<u8>, FileError>;
}

/// Every service the loader uses.
pub trait Platform:
    Firmware + BootDisk + MemoryMapSource + EnvStore + VideoOutput + FileSystem
{
}

impl<T> Platform for T where
    T: Firmware + BootDisk + MemoryMapSource + EnvStore + VideoOutput + FileSystem
{
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Bios;

    impl Firmware for Bios {
        fn kind(&self) -> FirmwareKind {
            FirmwareKind::PcBios
        }

        fn has_long_mode(&self) -> bool {
            false
        }

        fn finish_boot_services(&mut self) -> Result<(), FirmwareError> {
            Ok(())
        }
    }

    #[test]
    fn serial_port_table() {
        assert_eq!(Bios.serial_port(0), 0x3f8);
        assert_eq!(Bios.serial_port(1), 0x2f8);
        assert_eq!(Bios.serial_port(3), 0x2e8);
        assert_eq!(Bios.serial_port(4), 0);
        assert_eq!(Bios.serial_port(u64::MAX), 0);
    }
}
