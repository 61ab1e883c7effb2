//! # Loader Commands
//!
//! The user-facing command surface. Each `k*bsd` command maps its boolean
//! switches onto the kernel's boot flags through a static table.
//!
//! Switches may be given as `--long`, `-s`, or clustered as `-sv`. Options
//! with a required value accept `--root=VAL`, `--root VAL`, `-rVAL` and
//! `-r VAL`; an optional value must be attached (`--serial=SPEC`, `-hSPEC`).
//! `--` ends option parsing.

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::Write;

use bsd_bootinfo::freebsd::FreeBsdHowto;
use bsd_bootinfo::netbsd::NetBsdHowto;
use bsd_bootinfo::openbsd::OpenBsdHowto;
use log::debug;

use crate::netbsd::{Console, NetBsdOptions};
use crate::platform::Platform;
use crate::relocator::Relocator;
use crate::{BsdError, Result, Session};

/// A boolean switch and the boot flag it sets.
#[derive(Debug, Clone, Copy)]
pub struct Switch {
    pub short: char,
    pub long: &'static str,
    pub flag: u32,
    pub help: &'static str,
}

/// A switch carrying a value.
#[derive(Debug, Clone, Copy)]
pub struct ValueOption {
    pub short: char,
    pub long: &'static str,
    /// The value may be omitted.
    pub optional: bool,
    pub help: &'static str,
}

const fn switch(short: char, long: &'static str, flag: u32, help: &'static str) -> Switch {
    Switch {
        short,
        long,
        flag,
        help,
    }
}

pub const FREEBSD_SWITCHES: &[Switch] = &[
    switch('D', "dual", FreeBsdHowto::DUAL.bits(), "Display output on all consoles."),
    switch('h', "serial", FreeBsdHowto::SERIAL.bits(), "Use serial console."),
    switch('a', "askname", FreeBsdHowto::ASKNAME.bits(), "Ask for file name to reboot from."),
    switch('C', "cdrom", FreeBsdHowto::CDROM.bits(), "Use CD-ROM as root."),
    switch('c', "config", FreeBsdHowto::CONFIG.bits(), "Invoke user configuration routing."),
    switch('d', "kdb", FreeBsdHowto::KDB.bits(), "Enter in KDB on boot."),
    switch('g', "gdb", FreeBsdHowto::GDB.bits(), "Use GDB remote debugger instead of DDB."),
    switch('m', "mute", FreeBsdHowto::MUTE.bits(), "Disable all boot output."),
    switch('n', "nointr", FreeBsdHowto::NOINTR.bits(), "Ignore keyboard interrupts."),
    switch('p', "pause", FreeBsdHowto::PAUSE.bits(), "Wait for keypress after every line of output."),
    switch('q', "quiet", FreeBsdHowto::QUIET.bits(), "Don't display boot diagnostic messages."),
    switch('r', "dfltroot", FreeBsdHowto::DFLTROOT.bits(), "Use compiled-in root device."),
    switch('s', "single", FreeBsdHowto::SINGLE.bits(), "Boot into single mode."),
    switch('v', "verbose", FreeBsdHowto::VERBOSE.bits(), "Boot with verbose messages."),
];

pub const OPENBSD_SWITCHES: &[Switch] = &[
    switch('a', "askname", OpenBsdHowto::ASKNAME.bits(), "Ask for file name to reboot from."),
    switch('b', "halt", OpenBsdHowto::HALT.bits(), "Don't reboot, just halt."),
    switch('c', "config", OpenBsdHowto::CONFIG.bits(), "Change configured devices."),
    switch('s', "single", OpenBsdHowto::SINGLE.bits(), "Boot into single mode."),
    switch('d', "kdb", OpenBsdHowto::KDB.bits(), "Enter in KDB on boot."),
];

pub const OPENBSD_OPTIONS: &[ValueOption] = &[ValueOption {
    short: 'r',
    long: "root",
    optional: false,
    help: "Set root device (wd<unit><partition>).",
}];

pub const NETBSD_SWITCHES: &[Switch] = &[
    switch('1', "no-smp", NetBsdHowto::AB_NOSMP.bits(), "Disable SMP."),
    switch('2', "no-acpi", NetBsdHowto::AB_NOACPI.bits(), "Disable ACPI."),
    switch('a', "askname", NetBsdHowto::ASKNAME.bits(), "Ask for file name to reboot from."),
    switch('b', "halt", NetBsdHowto::HALT.bits(), "Don't reboot, just halt."),
    switch('c', "config", NetBsdHowto::USERCONFIG.bits(), "Change configured devices."),
    switch('d', "kdb", NetBsdHowto::KDB.bits(), "Enter in KDB on boot."),
    switch('m', "miniroot", NetBsdHowto::MINIROOT.bits(), "Use miniroot."),
    switch('q', "quiet", NetBsdHowto::AB_QUIET.bits(), "Don't display boot diagnostic messages."),
    switch('s', "single", NetBsdHowto::SINGLE.bits(), "Boot into single mode."),
    switch('v', "verbose", NetBsdHowto::AB_VERBOSE.bits(), "Boot with verbose messages."),
    switch('x', "debug", NetBsdHowto::AB_DEBUG.bits(), "Boot with debug messages."),
    switch('z', "silent", NetBsdHowto::AB_SILENT.bits(), "Suppress normal output (warnings remain)."),
];

pub const NETBSD_OPTIONS: &[ValueOption] = &[
    ValueOption {
        short: 'r',
        long: "root",
        optional: false,
        help: "Set root device.",
    },
    ValueOption {
        short: 'h',
        long: "serial",
        optional: true,
        help: "Use serial console ([comUNIT|ADDR][,SPEED]).",
    },
];

/// Result of parsing a command line against a switch table.
#[derive(Debug, Default)]
pub struct Parsed<'a> {
    pub flags: u32,
    values: Vec<(char, Option<&'a str>)>,
    pub operands: Vec<&'a str>,
}

impl<'a> Parsed<'a> {
    /// Whether the value option `short` was given, with or without a value.
    #[must_use]
    pub fn is_set(&self, short: char) -> bool {
        self.values.iter().any(|(c, _)| *c == short)
    }

    /// The last value given for `short`.
    #[must_use]
    pub fn value(&self, short: char) -> Option<&'a str> {
        self.values
            .iter()
            .rev()
            .find(|(c, _)| *c == short)
            .and_then(|(_, v)| *v)
    }
}

const UNKNOWN: BsdError = BsdError::BadArgument("unknown switch");
const MISSING: BsdError = BsdError::BadArgument("missing option value");

/// Parses `args` (without the command name).
///
/// # Errors
/// [`BsdError::BadArgument`] for unknown switches, a value given to a plain
/// switch, or a missing required value.
pub fn parse<'a>(args: &[&'a str], switches: &[Switch], options: &[ValueOption]) -> Result<Parsed<'a>> {
    let mut parsed = Parsed::default();
    let mut rest = args.iter().copied();
    let mut only_operands = false;

    while let Some(arg) = rest.next() {
        if only_operands || arg == "-" || !arg.starts_with('-') {
            parsed.operands.push(arg);
            continue;
        }
        if arg == "--" {
            only_operands = true;
            continue;
        }

        if let Some(long) = arg.strip_prefix("--") {
            let (name, attached) = match long.split_once('=') {
                Some((name, value)) => (name, Some(value)),
                None => (long, None),
            };
            if let Some(sw) = switches.iter().find(|s| s.long == name) {
                if attached.is_some() {
                    return Err(BsdError::BadArgument("switch takes no value"));
                }
                parsed.flags |= sw.flag;
            } else if let Some(opt) = options.iter().find(|o| o.long == name) {
                let value = match attached {
                    Some(value) => Some(value),
                    None if opt.optional => None,
                    None => Some(rest.next().ok_or(MISSING)?),
                };
                parsed.values.push((opt.short, value));
            } else {
                debug!("unknown switch {arg}");
                return Err(UNKNOWN);
            }
            continue;
        }

        let cluster = &arg[1..];
        for (at, c) in cluster.char_indices() {
            if let Some(sw) = switches.iter().find(|s| s.short == c) {
                parsed.flags |= sw.flag;
                continue;
            }
            let Some(opt) = options.iter().find(|o| o.short == c) else {
                debug!("unknown switch -{c}");
                return Err(UNKNOWN);
            };
            let attached = &cluster[at + c.len_utf8()..];
            let value = if !attached.is_empty() {
                Some(attached)
            } else if opt.optional {
                None
            } else {
                Some(rest.next().ok_or(MISSING)?)
            };
            parsed.values.push((opt.short, value));
            break;
        }
    }

    Ok(parsed)
}

/// Usage text for a command, listing its switches.
#[must_use]
pub fn usage(command: &str) -> Option<String> {
    let (synopsis, switches, options): (&str, &[Switch], &[ValueOption]) = match command {
        "kfreebsd" => ("FILE [ARGS]", FREEBSD_SWITCHES, &[]),
        "kopenbsd" => ("FILE", OPENBSD_SWITCHES, OPENBSD_OPTIONS),
        "knetbsd" => ("FILE", NETBSD_SWITCHES, NETBSD_OPTIONS),
        "kfreebsd_loadenv" => ("FILE", &[], &[]),
        "kfreebsd_module" => ("[FILE [type=TYPE] [ARGS]]", &[], &[]),
        "kfreebsd_module_elf" => ("[FILE [ARGS]]", &[], &[]),
        _ => return None,
    };

    let mut out = format!("Usage: {command} [OPTIONS] {synopsis}\n");
    // Writing into a String never fails.
    for sw in switches {
        let _ = writeln!(out, "  -{}, --{:<12} {}", sw.short, sw.long, sw.help);
    }
    for opt in options {
        let _ = writeln!(out, "  -{}, --{:<12} {}", opt.short, opt.long, opt.help);
    }
    Some(out)
}

/// Runs one command line. Returns text to display, if any.
///
/// # Errors
/// Propagates argument and load errors; the session is left unloaded after a
/// failed kernel load.
pub fn execute<R, P>(session: &mut Session<R>, platform: &mut P, argv: &[&str]) -> Result<Option<String>>
where
    R: Relocator,
    P: Platform,
{
    const FILENAME: BsdError = BsdError::BadArgument("filename expected");

    let (&command, args) = argv.split_first().ok_or(BsdError::BadArgument("no command"))?;
    match command {
        "kfreebsd" => {
            let parsed = parse(args, FREEBSD_SWITCHES, &[])?;
            let (file, rest) = parsed.operands.split_first().ok_or(FILENAME)?;
            let howto = FreeBsdHowto::from_bits_retain(parsed.flags);
            session.load_freebsd(platform, file, howto, rest)?;
        }
        "kopenbsd" => {
            let parsed = parse(args, OPENBSD_SWITCHES, OPENBSD_OPTIONS)?;
            let file = parsed.operands.first().ok_or(FILENAME)?;
            let howto = OpenBsdHowto::from_bits_retain(parsed.flags);
            session.load_openbsd(platform, file, howto, parsed.value('r'))?;
        }
        "knetbsd" => {
            let parsed = parse(args, NETBSD_SWITCHES, NETBSD_OPTIONS)?;
            let file = parsed.operands.first().ok_or(FILENAME)?;
            let options = NetBsdOptions {
                root: parsed.value('r'),
                console: if parsed.is_set('h') {
                    Console::Serial(parsed.value('h'))
                } else {
                    Console::Pc
                },
            };
            let howto = NetBsdHowto::from_bits_retain(parsed.flags);
            session.load_netbsd(platform, file, howto, &options)?;
        }
        "kfreebsd_loadenv" => {
            let file = args.first().ok_or(FILENAME)?;
            session.freebsd_loadenv(platform, file)?;
        }
        "kfreebsd_module" => match args.split_first() {
            Some((file, rest)) => session.freebsd_module(platform, file, rest)?,
            None => return session.freebsd_modules().map(Some),
        },
        "kfreebsd_module_elf" => match args.split_first() {
            Some((file, rest)) => session.freebsd_module_elf(platform, file, rest)?,
            None => return session.freebsd_modules().map(Some),
        },
        _ => return Err(BsdError::BadArgument("unknown command")),
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KernelType;
    use crate::platform::EnvStore;
    use crate::sim::images::ElfBuilder;
    use crate::sim::{SimPlatform, SimRelocator};

    #[test]
    fn switch_forms() {
        let p = parse(&["-sv", "--dual", "/boot/kernel", "a=1"], FREEBSD_SWITCHES, &[]).unwrap();
        assert_eq!(
            FreeBsdHowto::from_bits_retain(p.flags),
            FreeBsdHowto::SINGLE | FreeBsdHowto::VERBOSE | FreeBsdHowto::DUAL
        );
        assert_eq!(p.operands, ["/boot/kernel", "a=1"]);

        let p = parse(&["--", "-s"], FREEBSD_SWITCHES, &[]).unwrap();
        assert_eq!(p.flags, 0);
        assert_eq!(p.operands, ["-s"]);

        assert!(matches!(
            parse(&["-Z"], FREEBSD_SWITCHES, &[]),
            Err(BsdError::BadArgument(_))
        ));
        assert!(matches!(
            parse(&["--single=yes"], FREEBSD_SWITCHES, &[]),
            Err(BsdError::BadArgument(_))
        ));
    }

    #[test]
    fn value_forms() {
        for args in [
            &["-rwd0a", "/bsd"][..],
            &["-r", "wd0a", "/bsd"],
            &["--root=wd0a", "/bsd"],
            &["--root", "wd0a", "/bsd"],
            &["-sr", "wd0a", "/bsd"],
        ] {
            let p = parse(args, OPENBSD_SWITCHES, OPENBSD_OPTIONS).unwrap();
            assert_eq!(p.value('r'), Some("wd0a"), "{args:?}");
            assert_eq!(p.operands, ["/bsd"]);
        }
        assert!(matches!(
            parse(&["/bsd", "-r"], OPENBSD_SWITCHES, OPENBSD_OPTIONS),
            Err(BsdError::BadArgument(_))
        ));
    }

    #[test]
    fn optional_values_must_be_attached() {
        let p = parse(&["-h", "/netbsd"], NETBSD_SWITCHES, NETBSD_OPTIONS).unwrap();
        assert!(p.is_set('h'));
        assert_eq!(p.value('h'), None);
        assert_eq!(p.operands, ["/netbsd"]);

        let p = parse(&["--serial=com1,115200", "-12"], NETBSD_SWITCHES, NETBSD_OPTIONS).unwrap();
        assert_eq!(p.value('h'), Some("com1,115200"));
        assert_eq!(
            NetBsdHowto::from_bits_retain(p.flags),
            NetBsdHowto::AB_NOSMP | NetBsdHowto::AB_NOACPI
        );
    }

    #[test]
    fn freebsd_command_sequence() {
        let mut platform = SimPlatform::pc_default();
        platform.add_file(
            "/boot/kernel/kernel",
            ElfBuilder::elf32(0x0010_0000).text(0x0010_0000, &[0x90; 128]).build(),
        );
        platform.add_file("/boot/loader.conf", b"boot_verbose=\"YES\"\n".to_vec());
        platform.add_file("/boot/mfsroot", alloc::vec![0xEE; 300]);
        let mut session = Session::new(SimRelocator::new());

        assert!(matches!(
            execute(&mut session, &mut platform, &["kfreebsd"]),
            Err(BsdError::BadArgument(_))
        ));
        execute(&mut session, &mut platform, &["kfreebsd", "-s", "/boot/kernel/kernel"]).unwrap();
        assert_eq!(session.kernel_type(), Some(KernelType::FreeBsd));
        assert_eq!(
            session.kernel().unwrap().bootflags(),
            FreeBsdHowto::SINGLE.bits()
        );

        execute(&mut session, &mut platform, &["kfreebsd_loadenv", "/boot/loader.conf"]).unwrap();
        assert_eq!(platform.get("kFreeBSD.boot_verbose"), Some("YES"));

        execute(
            &mut session,
            &mut platform,
            &["kfreebsd_module", "/boot/mfsroot", "type=mfs_root"],
        )
        .unwrap();

        let listing = execute(&mut session, &mut platform, &["kfreebsd_module"])
            .unwrap()
            .unwrap();
        let lines: Vec<&str> = listing.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("  kernel              elf kernel"));
        assert!(lines[2].starts_with("  mfsroot             mfs_root"));
        assert!(lines[2].ends_with("0x0000012c"));
    }

    #[test]
    fn unknown_command() {
        let mut platform = SimPlatform::pc_default();
        let mut session = Session::new(SimRelocator::new());
        assert!(matches!(
            execute(&mut session, &mut platform, &["linux", "/vmlinuz"]),
            Err(BsdError::BadArgument(_))
        ));
        assert!(usage("knetbsd").unwrap().contains("--serial"));
        assert!(usage("linux").is_none());
    }
}
