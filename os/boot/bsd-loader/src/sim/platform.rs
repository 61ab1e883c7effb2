use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::vec;
use alloc::vec::Vec;

use crate::mmap::{MemoryKind, RegionVisitor};
use crate::platform::{
    BootDisk, EnvError, EnvStore, FileError, FileSystem, Firmware, FirmwareError, FirmwareKind,
    MemoryMapSource, ModeInfo, VideoError, VideoOutput,
};

/// Physical address of the simulated linear framebuffer.
const FRAMEBUFFER: u64 = 0xE000_0000;

const DEFAULT_DEPTH: u8 = 32;

/// Firmware services of an imaginary PC.
#[derive(Debug)]
pub struct SimPlatform {
    firmware: FirmwareKind,
    long_mode: bool,
    bios_drive: Option<u8>,
    partition: Option<String>,
    regions: Vec<(u64, u64, MemoryKind)>,
    env: BTreeMap<String, String>,
    files: BTreeMap<String, Vec<u8>>,
    active_mode: Option<String>,
    mode: Option<ModeInfo>,
    dac_switchable: bool,
    boot_services_finished: bool,
}

impl SimPlatform {
    /// A BIOS machine with 128 MiB of RAM booted from the first hard disk,
    /// partition `0a`.
    #[must_use]
    pub fn pc_default() -> Self {
        Self {
            firmware: FirmwareKind::PcBios,
            long_mode: true,
            bios_drive: Some(0x80),
            partition: Some("0a".to_string()),
            regions: vec![
                (0, 0x9_fc00, MemoryKind::Available),
                (0x9_fc00, 0x400, MemoryKind::Reserved),
                (0xf_0000, 0x1_0000, MemoryKind::Reserved),
                (0x10_0000, 0x07f0_0000, MemoryKind::Available),
            ],
            env: BTreeMap::new(),
            files: BTreeMap::new(),
            active_mode: None,
            mode: None,
            dac_switchable: true,
            boot_services_finished: false,
        }
    }

    pub const fn set_firmware(&mut self, kind: FirmwareKind) {
        self.firmware = kind;
    }

    pub const fn set_long_mode(&mut self, present: bool) {
        self.long_mode = present;
    }

    pub fn set_boot_disk(&mut self, drive: Option<u8>, partition: Option<&str>) {
        self.bios_drive = drive;
        self.partition = partition.map(ToString::to_string);
    }

    /// Replaces the memory map with `(base, length, kind)` regions.
    pub fn set_regions(&mut self, regions: &[(u64, u64, MemoryKind)]) {
        self.regions = regions.to_vec();
    }

    pub fn add_file(&mut self, path: &str, contents: Vec<u8>) {
        self.files.insert(path.to_string(), contents);
    }

    /// Whether the adapter honours DAC palette width changes.
    pub const fn set_dac_switchable(&mut self, switchable: bool) {
        self.dac_switchable = switchable;
    }

    /// The mode list entry that was last switched to.
    #[must_use]
    pub fn active_mode(&self) -> Option<&str> {
        self.active_mode.as_deref()
    }

    #[must_use]
    pub const fn boot_services_finished(&self) -> bool {
        self.boot_services_finished
    }
}

/// Decodes `WIDTHxHEIGHT[xDEPTH]`.
fn parse_mode(spec: &str) -> Option<ModeInfo> {
    let mut parts = spec.split('x');
    let width: u32 = parts.next()?.parse().ok()?;
    let height: u32 = parts.next()?.parse().ok()?;
    let bpp: u8 = match parts.next() {
        Some(depth) => depth.parse().ok()?,
        None => DEFAULT_DEPTH,
    };
    if parts.next().is_some() || width == 0 || height == 0 {
        return None;
    }

    // (size, position) for red, green and blue
    let [red, green, blue] = match bpp {
        32 | 24 => [(8, 16), (8, 8), (8, 0)],
        16 => [(5, 11), (6, 5), (5, 0)],
        15 => [(5, 10), (5, 5), (5, 0)],
        8 => [(0, 0); 3],
        _ => return None,
    };

    Some(ModeInfo {
        width,
        height,
        pitch: width.checked_mul(u32::from(bpp).div_ceil(8))?,
        bpp,
        red_mask_size: red.0,
        red_field_pos: red.1,
        green_mask_size: green.0,
        green_field_pos: green.1,
        blue_mask_size: blue.0,
        blue_field_pos: blue.1,
        framebuffer: FRAMEBUFFER,
    })
}

impl Firmware for SimPlatform {
    fn kind(&self) -> FirmwareKind {
        self.firmware
    }

    fn has_long_mode(&self) -> bool {
        self.long_mode
    }

    fn finish_boot_services(&mut self) -> Result<(), FirmwareError> {
        if self.boot_services_finished {
            return Err(FirmwareError::ExitBootServices);
        }
        self.boot_services_finished = true;
        Ok(())
    }
}

impl BootDisk for SimPlatform {
    fn bios_drive(&self) -> Option<u8> {
        self.bios_drive
    }

    fn partition_name(&self) -> Option<&str> {
        self.partition.as_deref()
    }
}

impl MemoryMapSource for SimPlatform {
    fn for_each_region(&self, visitor: &mut dyn RegionVisitor) {
        for &(base, length, kind) in &self.regions {
            visitor.visit(base, length, kind);
        }
    }
}

impl EnvStore for SimPlatform {
    fn variables(&self) -> impl Iterator<Item = (&str, &str)> {
        self.env.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    fn get(&self, name: &str) -> Option<&str> {
        self.env.get(name).map(String::as_str)
    }

    fn set(&mut self, name: &str, value: &str) -> Result<(), EnvError> {
        if name.is_empty() {
            return Err(EnvError::InvalidName);
        }
        self.env.insert(name.to_string(), value.to_string());
        Ok(())
    }
}

impl VideoOutput for SimPlatform {
    fn set_mode(&mut self, spec: &str) -> Result<(), VideoError> {
        for candidate in spec.split(';').map(str::trim) {
            let mode = if candidate == "text" {
                None
            } else if let Some(info) = parse_mode(candidate) {
                Some(info)
            } else {
                continue;
            };
            log::debug!("video mode {candidate}");
            self.mode = mode;
            self.active_mode = Some(candidate.to_string());
            return Ok(());
        }
        Err(VideoError::NoMatchingMode(spec.to_string()))
    }

    fn mode_info(&mut self) -> Result<ModeInfo, VideoError> {
        self.mode.ok_or(VideoError::NoMode)
    }

    fn set_dac_palette_width(&mut self, bits: u8) -> Result<u8, VideoError> {
        if self.dac_switchable {
            Ok(bits)
        } else {
            Err(VideoError::Unsupported)
        }
    }
}

impl FileSystem for SimPlatform {
    fn read_file(&mut self, path: &str) -> Result<Vec<u8>, FileError> {
        self.files.get(path).cloned().ok_or(FileError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_matching_mode_wins() {
        let mut platform = SimPlatform::pc_default();
        platform.set_mode("bogus;1024x768x16;text").unwrap();
        assert_eq!(platform.active_mode(), Some("1024x768x16"));

        let info = platform.mode_info().unwrap();
        assert_eq!((info.width, info.height, info.bpp), (1024, 768, 16));
        assert_eq!(info.pitch, 2048);
        assert_eq!((info.green_mask_size, info.green_field_pos), (6, 5));

        platform.set_mode("text").unwrap();
        assert!(matches!(platform.mode_info(), Err(VideoError::NoMode)));
        assert!(matches!(
            platform.set_mode("640x480x7"),
            Err(VideoError::NoMatchingMode(_))
        ));
    }

    #[test]
    fn boot_services_end_once() {
        let mut platform = SimPlatform::pc_default();
        assert!(platform.finish_boot_services().is_ok());
        assert!(platform.boot_services_finished());
        assert!(platform.finish_boot_services().is_err());
    }

    #[test]
    fn env_rejects_empty_names() {
        let mut platform = SimPlatform::pc_default();
        assert!(matches!(platform.set("", "x"), Err(EnvError::InvalidName)));
        platform.set("b", "2").unwrap();
        platform.set("a", "1").unwrap();
        assert_eq!(platform.variables().collect::<Vec<_>>(), [("a", "1"), ("b", "2")]);
    }
}
