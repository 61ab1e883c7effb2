//! # NetBSD Boot Protocol
//!
//! NetBSD reads its boot information through a `bootinfo` pointer array, one
//! entry per `btinfo` record. Records collected at load time (boot path, root
//! device, console, symbols) are joined at handoff by the memory map and,
//! when a graphical mode could be set, the framebuffer.

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use bsd_bootinfo::netbsd::{BOOTINFO_HEADER_SIZE, BTINFO_HEADER_SIZE, ConsoleInfo, FramebufferInfo};
use bsd_bootinfo::{STACK_WINDOW_END, STACK_WINDOW_START, align_up};
use log::{debug, warn};

use crate::arena::Arena;
use crate::bootdev::parse_ulong;
use crate::image::elf::ElfFile;
use crate::mmap::{self, MapFlavour};
use crate::platform::{EnvStore, Firmware, FirmwareKind, Platform, VideoError, VideoOutput};
use crate::relocator::{Cpu32State, Preference, Relocator};
use crate::session::{Handoff, LoadedKernel, addr32};
use crate::tags::{NetBsdInfo, Tag, TagList};
use crate::{BsdError, Result, symbols};

/// Speed of a serial console given without `,SPEED`.
pub const DEFAULT_SERIAL_SPEED: u32 = 9600;

/// Variable holding the preferred video mode.
pub const GFXPAYLOAD: &str = "gfxpayload";

const STACK_SIZE: usize = 7 * 4;

#[allow(clippy::cast_possible_truncation)]
const RECORD_HEADER: u32 = BTINFO_HEADER_SIZE as u32;

/// Kernel console selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Console<'a> {
    #[default]
    Pc,
    /// Serial console with an optional `[comUNIT|ADDR][,SPEED]` spec.
    Serial(Option<&'a str>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NetBsdOptions<'a> {
    pub root: Option<&'a str>,
    pub console: Console<'a>,
}

/// Builds the `com` console record from a `[comUNIT|ADDR][,SPEED]` spec.
///
/// # Errors
/// [`BsdError::BadArgument`] when a number does not parse.
pub fn serial_console<F: Firmware + ?Sized>(firmware: &F, spec: Option<&str>) -> Result<ConsoleInfo> {
    const INVALID: BsdError = BsdError::BadArgument("invalid serial console specification");

    let mut console = ConsoleInfo::named("com");
    console.addr = u32::from(firmware.serial_port(0));
    console.speed = DEFAULT_SERIAL_SPEED;

    let Some(spec) = spec else {
        return Ok(console);
    };

    let rest = if let Some(unit) = spec.strip_prefix("com") {
        let (unit, rest) = parse_ulong(unit, 0).map_err(|_| INVALID)?;
        console.addr = u32::from(firmware.serial_port(unit));
        rest
    } else {
        let (addr, rest) = parse_ulong(spec, 0).map_err(|_| INVALID)?;
        console.addr = u32::try_from(addr).map_err(|_| INVALID)?;
        rest
    };

    if let Some(speed) = rest.strip_prefix(',') {
        let (speed, _) = parse_ulong(speed, 0).map_err(|_| INVALID)?;
        console.speed = u32::try_from(speed).map_err(|_| INVALID)?;
    }
    Ok(console)
}

/// Adds the load-time records and, for ELF kernels, the symbol view.
///
/// # Errors
/// Fails on a malformed serial console spec or when the symbol view cannot
/// be placed.
pub fn augment_kernel<R, F>(
    relocator: &mut R,
    kernel: &mut LoadedKernel,
    firmware: &F,
    bytes: &[u8],
    options: &NetBsdOptions<'_>,
) -> Result<()>
where
    R: Relocator + ?Sized,
    F: Firmware + ?Sized,
{
    if kernel.is_elf() {
        let elf = ElfFile::parse(bytes)?;
        let end = symbols::load_netbsd(relocator, &elf, &mut kernel.tags, kernel.kern_end)?;
        kernel.advance_kern_end(end);
    }

    let name = kernel.path.rsplit('/').next().unwrap_or(&kernel.path);
    kernel.tags.push_netbsd(&NetBsdInfo::BootPath(name))?;

    if let Some(root) = options.root {
        kernel.tags.push_netbsd(&NetBsdInfo::RootDevice(root))?;
    }

    let console = match options.console {
        Console::Pc => ConsoleInfo::named("pc"),
        Console::Serial(spec) => serial_console(firmware, spec)?,
    };
    kernel.tags.push_netbsd(&NetBsdInfo::Console(&console))
}

/// Sets the video mode and describes the resulting framebuffer.
fn setup_video<P>(platform: &mut P) -> Result<FramebufferInfo, VideoError>
where
    P: Firmware + EnvStore + VideoOutput + ?Sized,
{
    let firmware = platform.kind();
    let default = match firmware {
        FirmwareKind::Efi => "800x600",
        FirmwareKind::PcBios => "text",
    };
    let spec = match platform.get(GFXPAYLOAD) {
        Some(mode) if !mode.is_empty() => format!("{mode};{default}"),
        _ => String::from(default),
    };

    platform.set_mode(&spec)?;
    let mode = platform.mode_info()?;

    let mut fb = FramebufferInfo {
        fbaddr: mode.framebuffer,
        flags: 0,
        width: mode.width,
        height: mode.height,
        pitch: u16::try_from(mode.pitch).unwrap_or(u16::MAX),
        bpp: mode.bpp,
        red_mask_size: mode.red_mask_size,
        green_mask_size: mode.green_mask_size,
        blue_mask_size: mode.blue_mask_size,
        red_field_pos: mode.red_field_pos,
        green_field_pos: mode.green_field_pos,
        blue_field_pos: mode.blue_field_pos,
    };

    // Packed VESA modes may report zero mask sizes.
    if firmware == FirmwareKind::PcBios && mode.bpp <= 8 {
        let width = platform.set_dac_palette_width(8).unwrap_or(6);
        fb.red_mask_size = width;
        fb.green_mask_size = width;
        fb.blue_mask_size = width;
    }

    Ok(fb)
}

/// Serialized size of `tag`: header, payload and padding.
fn record_size(tag: &Tag) -> u64 {
    align_up(BTINFO_HEADER_SIZE as u64 + u64::from(tag.len()), 4)
}

fn to_usize(v: u64) -> Result<usize> {
    usize::try_from(v).map_err(|_| BsdError::OutOfMemory)
}

/// # Errors
/// [`BsdError::OutOfMemory`] when the bootinfo blob or the stack cannot be
/// reserved.
pub fn prepare<R, P>(relocator: &mut R, kernel: &mut LoadedKernel, platform: &mut P) -> Result<Handoff>
where
    R: Relocator + ?Sized,
    P: Platform,
{
    let mut trailer = TagList::new();
    let memmap = mmap::build_table(&*platform, MapFlavour::NetBsd)?;
    trailer.push_netbsd(&NetBsdInfo::MemoryMap(&memmap))?;

    match setup_video(platform) {
        Ok(fb) => {
            debug!("framebuffer {}x{}x{} at {:#x}", fb.width, fb.height, fb.bpp, fb.fbaddr);
            trailer.push_netbsd(&NetBsdInfo::Framebuffer(&fb))?;
        }
        Err(e) => warn!("booting without a framebuffer: {e}"),
    }

    let records = || kernel.tags.iter().chain(trailer.iter());
    let count = records().count();
    let tags_len: u64 = records().map(record_size).sum();
    let size = tags_len + (BOOTINFO_HEADER_SIZE + count * 4) as u64;

    let base = align_up(kernel.kern_end, 4);
    let chunk = relocator.alloc_chunk_addr(base, to_usize(size)?)?;

    let mut arena = Arena::new(relocator.chunk_mut(chunk)?, base);
    let mut pointers = Vec::with_capacity(count);
    for tag in records() {
        pointers.push(addr32(arena.address())?);
        arena.write_u32(tag.len() + RECORD_HEADER)?;
        arena.write_u32(tag.kind())?;
        arena.write_bytes(tag.payload())?;
        arena.align_to(4)?;
    }

    let bootinfo = addr32(arena.address())?;
    arena.write_u32(u32::try_from(count).map_err(|_| BsdError::OutOfMemory)?)?;
    for pointer in pointers {
        arena.write_u32(pointer)?;
    }
    kernel.advance_kern_end(base + size);

    let chunk = relocator.alloc_chunk_align(
        STACK_WINDOW_START,
        STACK_WINDOW_END,
        STACK_SIZE,
        4,
        Preference::None,
    )?;
    let stack = addr32(chunk.target())?;

    let mut frame = Arena::new(relocator.chunk_mut(chunk)?, chunk.target());
    frame.write_u32(kernel.entry)?;
    frame.write_u32(kernel.bootflags)?;
    frame.write_u32(0)?;
    frame.write_u32(bootinfo)?;
    frame.write_u32(0)?;
    frame.write_u32(kib(mmap::upper_memory(&*platform)))?;
    frame.write_u32(kib(mmap::lower_memory(&*platform)))?;

    debug!("{count} btinfo records, bootinfo at {bootinfo:#x}");

    Ok(Handoff::Boot32(Cpu32State {
        eip: kernel.entry,
        esp: stack,
    }))
}

fn kib(bytes: u64) -> u32 {
    u32::try_from(bytes >> 10).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Session;
    use crate::sim::images::ElfBuilder;
    use crate::sim::{SimPlatform, SimRelocator, inspect};
    use bsd_bootinfo::netbsd::{
        BTINFO_BOOTPATH, BTINFO_CONSOLE, BTINFO_FRAMEBUF, BTINFO_MEMMAP, BTINFO_ROOTDEVICE,
        BTINFO_SYMTAB, NetBsdHowto,
    };

    #[test]
    fn serial_specs() {
        let platform = SimPlatform::pc_default();

        let c = serial_console(&platform, None).unwrap();
        assert_eq!((c.addr, c.speed), (0x3f8, 9600));
        assert_eq!(&c.devname[..4], b"com\0");

        let c = serial_console(&platform, Some("com1,115200")).unwrap();
        assert_eq!((c.addr, c.speed), (0x2f8, 115_200));

        let c = serial_console(&platform, Some("0x3e8")).unwrap();
        assert_eq!((c.addr, c.speed), (0x3e8, 9600));

        let c = serial_console(&platform, Some("com9")).unwrap();
        assert_eq!(c.addr, 0);

        assert!(matches!(
            serial_console(&platform, Some("comX")),
            Err(BsdError::BadArgument(_))
        ));
        assert!(matches!(
            serial_console(&platform, Some("com0,fast")),
            Err(BsdError::BadArgument(_))
        ));
    }

    fn boot(platform: &mut SimPlatform, options: &NetBsdOptions<'_>) -> (Session<SimRelocator>, Handoff) {
        platform.add_file(
            "/netbsd",
            ElfBuilder::elf32(0xC010_0000)
                .segment(0xC010_0000, 0x0010_0000, &[0x90; 0x200], 0x400)
                .symbol("start", 0xC010_0000)
                .build(),
        );
        let mut session = Session::new(SimRelocator::new());
        session
            .load_netbsd(platform, "/netbsd", NetBsdHowto::AB_VERBOSE, options)
            .unwrap();
        let handoff = session.prepare_boot(platform).unwrap();
        (session, handoff)
    }

    #[test]
    fn bios_text_mode_has_no_framebuffer() {
        let mut platform = SimPlatform::pc_default();
        let options = NetBsdOptions {
            root: Some("wd0a"),
            console: Console::Serial(Some("com0,38400")),
        };
        let (session, handoff) = boot(&mut platform, &options);

        let sim = session.relocator();
        let stack = handoff.stack_pointer();
        assert!((STACK_WINDOW_START..STACK_WINDOW_END).contains(&stack));
        assert_eq!(sim.read_u32(stack), Some(0x0010_0000));
        assert_eq!(sim.read_u32(stack + 4), Some(NetBsdHowto::AB_VERBOSE.bits()));
        assert_eq!(sim.read_u32(stack + 24), Some(0x9fc00 >> 10));

        let bootinfo = u64::from(sim.read_u32(stack + 12).unwrap());
        let records = inspect::netbsd_bootinfo(sim, bootinfo).unwrap();
        let kinds: Vec<u32> = records.iter().map(|r| r.0).collect();
        assert_eq!(
            kinds,
            [BTINFO_SYMTAB, BTINFO_BOOTPATH, BTINFO_ROOTDEVICE, BTINFO_CONSOLE, BTINFO_MEMMAP]
        );
        assert!(records[1].1.starts_with(b"netbsd\0"));
        assert_eq!(&records[3].1[16..24], &[0xf8, 3, 0, 0, 0x00, 0x96, 0, 0]);
        assert_eq!(crate::bytes::read_u32_le(&records[4].1, 0), Some(4));

        let kern_end = session.kernel().unwrap().kern_end();
        assert!(bootinfo < kern_end);
    }

    #[test]
    fn efi_framebuffer_and_gfxpayload() {
        let mut platform = SimPlatform::pc_default();
        platform.set_firmware(FirmwareKind::Efi);
        platform.set(GFXPAYLOAD, "1024x768").unwrap();
        let (session, handoff) = boot(&mut platform, &NetBsdOptions::default());

        assert_eq!(platform.active_mode(), Some("1024x768"));

        let sim = session.relocator();
        let bootinfo = u64::from(sim.read_u32(handoff.stack_pointer() + 12).unwrap());
        let records = inspect::netbsd_bootinfo(sim, bootinfo).unwrap();
        let (kind, fb) = records.last().unwrap();
        assert_eq!(*kind, BTINFO_FRAMEBUF);
        let fb = &fb[..];
        assert_eq!(crate::bytes::read_u32_le(fb, 12), Some(1024));
        assert_eq!(crate::bytes::read_u32_le(fb, 16), Some(768));
        assert_eq!(fb[22], 32);

        let console = records.iter().find(|r| r.0 == BTINFO_CONSOLE).unwrap();
        assert!(console.1.starts_with(b"pc\0"));
    }

    #[test]
    fn palette_modes_use_dac_width() {
        let mut platform = SimPlatform::pc_default();
        platform.set(GFXPAYLOAD, "640x480x8").unwrap();
        let fb = setup_video(&mut platform).unwrap();
        assert_eq!(fb.bpp, 8);
        assert_eq!(
            (fb.red_mask_size, fb.green_mask_size, fb.blue_mask_size),
            (8, 8, 8)
        );

        platform.set_dac_switchable(false);
        let fb = setup_video(&mut platform).unwrap();
        assert_eq!(fb.red_mask_size, 6);
    }
}
