//! Runs loader commands against host files and prints the resulting handoff.
//!
//! The script holds one command per line, for example:
//!
//! ```text
//! set kFreeBSD.vfs.root.mountfrom=ufs:/dev/ada0p2
//! kfreebsd -v boot/kernel/kernel
//! kfreebsd_module boot/mfsroot type=mfs_root
//! boot
//! ```
//!
//! Operands naming an existing host file are made available to the loader
//! under the same path.

mod logger;

use std::error::Error;
use std::path::Path;
use std::{env, fs, io, process};

use bsd_loader::platform::{EnvStore, FirmwareKind};
use bsd_loader::sim::{SimPlatform, SimRelocator};
use bsd_loader::{Handoff, Session, commands};
use log::LevelFilter;

use crate::logger::HostLogger;

const USAGE: &str = "usage: bsd-dryrun [--efi] [--no-long-mode] [-v] [SCRIPT]";

struct Options {
    efi: bool,
    long_mode: bool,
    level: LevelFilter,
    script: Option<String>,
}

fn parse_args(args: impl Iterator<Item = String>) -> Result<Options, String> {
    let mut options = Options {
        efi: false,
        long_mode: true,
        level: LevelFilter::Info,
        script: None,
    };
    for arg in args {
        match arg.as_str() {
            "--efi" => options.efi = true,
            "--no-long-mode" => options.long_mode = false,
            "-v" => options.level = LevelFilter::Trace,
            _ if arg.starts_with('-') => return Err(format!("unknown option {arg}")),
            _ if options.script.is_none() => options.script = Some(arg),
            _ => return Err(String::from("only one script may be given")),
        }
    }
    Ok(options)
}

fn main() -> io::Result<()> {
    let options = parse_args(env::args().skip(1)).unwrap_or_else(|msg| {
        eprintln!("{msg}\n{USAGE}");
        process::exit(2);
    });
    HostLogger::new(options.level)
        .init()
        .map_err(|e| io::Error::other(e.to_string()))?;

    let script = match &options.script {
        Some(path) => fs::read_to_string(path)?,
        None => io::read_to_string(io::stdin())?,
    };

    let mut platform = SimPlatform::pc_default();
    if options.efi {
        platform.set_firmware(FirmwareKind::Efi);
    }
    platform.set_long_mode(options.long_mode);
    let mut session = Session::new(SimRelocator::new());

    for (n, line) in script.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Err(e) = run_line(&mut session, &mut platform, line) {
            eprintln!("line {}: {e}", n + 1);
            process::exit(1);
        }
    }
    Ok(())
}

fn run_line(
    session: &mut Session<SimRelocator>,
    platform: &mut SimPlatform,
    line: &str,
) -> Result<(), Box<dyn Error>> {
    let argv: Vec<&str> = line.split_whitespace().collect();
    match argv.as_slice() {
        ["set", assignment] => {
            let (name, value) = assignment.split_once('=').unwrap_or((*assignment, ""));
            platform.set(name, value)?;
        }
        ["boot"] => {
            let handoff = session.prepare_boot(platform)?;
            print_handoff(session, &handoff);
        }
        _ => {
            for operand in argv.iter().skip(1).filter(|a| !a.starts_with('-')) {
                if Path::new(operand).is_file() {
                    platform.add_file(operand, fs::read(operand)?);
                }
            }
            if let Some(listing) = commands::execute(session, platform, &argv)? {
                print!("{listing}");
            }
        }
    }
    Ok(())
}

fn print_handoff(session: &Session<SimRelocator>, handoff: &Handoff) {
    match handoff {
        Handoff::Boot32(state) => {
            println!("boot32 eip={:#010x} esp={:#010x}", state.eip, state.esp);
        }
        Handoff::Boot64 { state, min, max } => {
            println!(
                "boot64 rip={:#018x} rsp={:#010x} cr3={:#010x} trampoline=[{min:#x}, {max:#x})",
                state.rip, state.rsp, state.cr3
            );
        }
    }
    if let Some(kernel) = session.kernel() {
        println!(
            "kernel {} ({:?}) [{:#010x}, {:#010x})",
            kernel.path(),
            kernel.format(),
            kernel.kern_start(),
            kernel.kern_end()
        );
    }
    for chunk in session.relocator().chunks() {
        println!(
            "  chunk {:>2} [{:#010x}, {:#010x})",
            chunk.index(),
            chunk.target(),
            chunk.end()
        );
    }
}
