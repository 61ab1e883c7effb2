use std::panic::{self, AssertUnwindSafe};

use bsd_bootinfo::freebsd::{
    MODINFO_ADDR, MODINFO_END, MODINFO_METADATA, MODINFO_NAME, MODINFO_SIZE, MODINFOMD_ENVP,
};
use bsd_bootinfo::netbsd::{BTINFO_CONSOLE, BTINFO_MEMMAP};
use bsd_bootinfo::openbsd::{BOOTARG_END, BOOTARG_MMAP};
use bsd_loader::sim::images::{AoutBuilder, ElfBuilder};
use bsd_loader::sim::{SimPlatform, SimRelocator, inspect};
use bsd_loader::{Handoff, KernelType, Session, commands};

fn run(session: &mut Session<SimRelocator>, platform: &mut SimPlatform, line: &str) {
    let argv: Vec<&str> = line.split_whitespace().collect();
    commands::execute(session, platform, &argv).unwrap();
}

fn word(bytes: &[u8]) -> u64 {
    match bytes.len() {
        4 => u64::from(u32::from_le_bytes(bytes.try_into().unwrap())),
        8 => u64::from_le_bytes(bytes.try_into().unwrap()),
        n => panic!("unexpected word size {n}"),
    }
}

#[test]
fn openbsd_minimal_kernel() {
    let mut platform = SimPlatform::pc_default();
    platform.add_file(
        "/bsd",
        ElfBuilder::elf32(0x0010_0000)
            .text(0x0010_0000, &[0x90; 64])
            .build(),
    );
    let mut session = Session::new(SimRelocator::new());
    run(&mut session, &mut platform, "kopenbsd -s --root=wd0a /bsd");

    let handoff = session.prepare_boot(&mut platform).unwrap();
    let Handoff::Boot32(state) = handoff else {
        panic!("OpenBSD enters in protected mode");
    };

    let sim = session.relocator();
    let esp = u64::from(state.esp);
    let stack: Vec<u32> = (0..9).map(|i| sim.read_u32(esp + i * 4).unwrap()).collect();
    assert_eq!(stack[0], state.eip);
    assert_eq!(stack[0], 0x0010_0000);

    let records =
        inspect::openbsd_bootargs(sim, u64::from(stack[8]), stack[7] as usize).unwrap();
    let kinds: Vec<u32> = records.iter().map(|r| r.0).collect();
    assert_eq!(kinds, [BOOTARG_MMAP, BOOTARG_END]);
    assert!(records[1].1.is_empty());
}

#[test]
fn freebsd_with_environment_and_module() {
    let mut platform = SimPlatform::pc_default();
    platform.add_file(
        "/boot/kernel/kernel",
        ElfBuilder::elf32(0x0010_0000)
            .text(0x0010_0000, &[0x90; 0x100])
            .symbol("btext", 0x0010_0000)
            .build(),
    );
    platform.add_file(
        "/boot/loader.conf",
        b"# defaults\nvfs.root.mountfrom=\"cd9660:/dev/cd0\"\n".to_vec(),
    );
    platform.add_file("/boot/mfsroot", vec![0x5A; 0x1800]);

    let mut session = Session::new(SimRelocator::new());
    run(&mut session, &mut platform, "kfreebsd -v /boot/kernel/kernel");
    run(&mut session, &mut platform, "kfreebsd_loadenv /boot/loader.conf");
    run(&mut session, &mut platform, "kfreebsd_module /boot/mfsroot type=mfs_root");
    assert_eq!(session.kernel_type(), Some(KernelType::FreeBsd));

    let handoff = session.prepare_boot(&mut platform).unwrap();
    let sim = session.relocator();
    let modulep = u64::from(sim.read_u32(handoff.stack_pointer() + 28).unwrap());
    let tags = inspect::freebsd_metadata(sim, modulep, false).unwrap();
    assert_eq!(tags.last().unwrap().0, MODINFO_END);

    let names: Vec<&[u8]> = tags
        .iter()
        .filter(|t| t.0 == MODINFO_NAME)
        .map(|t| &t.1[..])
        .collect();
    assert_eq!(names, [&b"kernel\0"[..], b"mfsroot\0"]);

    // The module's record group follows its name.
    let at = tags.iter().rposition(|t| t.0 == MODINFO_NAME).unwrap();
    let addr = tags[at..].iter().find(|t| t.0 == MODINFO_ADDR).unwrap();
    let size = tags[at..].iter().find(|t| t.0 == MODINFO_SIZE).unwrap();
    assert_eq!(word(&size.1), 0x1800);
    let placed = sim.read(word(&addr.1), 0x1800).unwrap();
    assert!(placed.iter().all(|&b| b == 0x5A));

    let envp = tags
        .iter()
        .find(|t| t.0 == MODINFO_METADATA | MODINFOMD_ENVP)
        .map(|t| word(&t.1))
        .unwrap();
    let env = sim.read(envp, 35).unwrap();
    assert_eq!(env, b"vfs.root.mountfrom=cd9660:/dev/cd0\0");
}

#[test]
fn netbsd_serial_console() {
    let mut platform = SimPlatform::pc_default();
    platform.add_file(
        "/netbsd",
        AoutBuilder::new(0o413, 0x0010_0000)
            .text(&[0x90; 0x200])
            .bss(0x100)
            .build(),
    );
    let mut session = Session::new(SimRelocator::new());
    run(&mut session, &mut platform, "knetbsd --serial=com1,115200 -r wd0a /netbsd");

    let handoff = session.prepare_boot(&mut platform).unwrap();
    let sim = session.relocator();
    let bootinfo = u64::from(sim.read_u32(handoff.stack_pointer() + 12).unwrap());
    let records = inspect::netbsd_bootinfo(sim, bootinfo).unwrap();

    let console = &records.iter().find(|r| r.0 == BTINFO_CONSOLE).unwrap().1;
    assert!(console.starts_with(b"com\0"));
    assert_eq!(u32::from_le_bytes(console[16..20].try_into().unwrap()), 0x2f8);
    assert_eq!(u32::from_le_bytes(console[20..24].try_into().unwrap()), 115_200);
    assert_eq!(records.last().unwrap().0, BTINFO_MEMMAP);
}

#[test]
fn freebsd_amd64_boot_reaches_the_relocator() {
    let mut platform = SimPlatform::pc_default();
    platform.add_file(
        "/boot/kernel/kernel",
        ElfBuilder::elf64(0xFFFF_FFFF_8020_0000)
            .segment(0xFFFF_FFFF_8020_0000, 0x0020_0000, &[0xF4; 0x80], 0x2000)
            .symbol("_DYNAMIC", 0xFFFF_FFFF_8020_0040)
            .build(),
    );
    let mut session = Session::new(SimRelocator::new());
    run(&mut session, &mut platform, "kfreebsd /boot/kernel/kernel");

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| session.boot(&mut platform)));
    assert!(outcome.is_err(), "the simulated handoff never enters a kernel");
    assert!(platform.boot_services_finished());

    let Some(Handoff::Boot64 { state, min, max }) = session.relocator().last_boot() else {
        panic!("FreeBSD amd64 enters in long mode");
    };
    assert_eq!(state.rip, 0xFFFF_FFFF_8020_0000);
    assert_eq!(min, 0);
    assert!(max <= 1 << 32);
    assert_eq!(state.cr3 % 4096, 0);
}

#[test]
fn elf64_kernel_needs_long_mode() {
    let mut platform = SimPlatform::pc_default();
    platform.set_long_mode(false);
    platform.add_file(
        "/boot/kernel/kernel",
        ElfBuilder::elf64(0x0020_0000).text(0x0020_0000, &[0; 16]).build(),
    );
    let mut session = Session::new(SimRelocator::new());
    let err = commands::execute(&mut session, &mut platform, &["kfreebsd", "/boot/kernel/kernel"]);
    assert!(matches!(err, Err(bsd_loader::BsdError::UnsupportedCpu)));
    assert_eq!(session.kernel_type(), None);
    assert_eq!(session.relocator().chunk_count(), 0);
}
