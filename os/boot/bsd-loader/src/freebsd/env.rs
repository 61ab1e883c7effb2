//! FreeBSD kernel environment.
//!
//! Variables named `kFreeBSD.<name>` in the loader's store are handed to the
//! kernel as a block of `name=value\0` strings. `kfreebsd_loadenv` fills the
//! store from a `loader.conf`-style file.

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use bsd_bootinfo::freebsd::ENV_PREFIX;

use crate::Result;
use crate::platform::EnvStore;

/// Splits one `key=value` line. Returns `None` for comments, lines without
/// `=` and lines with an empty key.
#[must_use]
pub fn parse_line(line: &str) -> Option<(&str, &str)> {
    let line = line.trim_end_matches(['\r', ' ', '\t']);
    let line = line.strip_suffix('"').unwrap_or(line);
    if line.starts_with('#') {
        return None;
    }
    let (key, value) = line.split_once('=')?;
    if key.is_empty() {
        return None;
    }
    Some((key, value.strip_prefix('"').unwrap_or(value)))
}

/// Sets `kFreeBSD.<key>` for every assignment in `bytes`.
///
/// # Errors
/// Fails when the store rejects a variable.
pub fn import<E: EnvStore>(env: &mut E, bytes: &[u8]) -> Result<()> {
    let text = String::from_utf8_lossy(bytes);
    let mut count = 0usize;
    for (key, value) in text.split('\n').filter_map(parse_line) {
        env.set(&format!("{ENV_PREFIX}{key}"), value)?;
        count += 1;
    }
    log::debug!("imported {count} kernel environment variables");
    Ok(())
}

/// The `name=value\0` block, without the final terminator. Empty when no
/// kernel variable is set.
#[must_use]
pub fn environment_block<E: EnvStore>(env: &E) -> Vec<u8> {
    let mut block = Vec::new();
    for (name, value) in env.variables() {
        let Some(name) = name.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        if name.is_empty() {
            continue;
        }
        block.extend_from_slice(name.as_bytes());
        block.push(b'=');
        block.extend_from_slice(value.as_bytes());
        block.push(0);
    }
    block
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimPlatform;

    #[test]
    fn line_parsing() {
        assert_eq!(parse_line("a=b"), Some(("a", "b")));
        assert_eq!(parse_line("a=\"quoted value\"\r"), Some(("a", "quoted value")));
        assert_eq!(parse_line("hint.uart.0.at=\"isa\"  \t"), Some(("hint.uart.0.at", "isa")));
        assert_eq!(parse_line("a==b"), Some(("a", "=b")));
        assert_eq!(parse_line("empty="), Some(("empty", "")));
        assert_eq!(parse_line("# a=b"), None);
        assert_eq!(parse_line("no assignment"), None);
        assert_eq!(parse_line("=value"), None);
        assert_eq!(parse_line(""), None);
    }

    #[test]
    fn import_sets_prefixed_variables() {
        let mut platform = SimPlatform::pc_default();
        import(
            &mut platform,
            b"# loader.conf\nvfs.root.mountfrom=\"ufs:/dev/ada0s1a\"\nboot_verbose=YES\r\n=ignored\n",
        )
        .unwrap();
        assert_eq!(
            platform.get("kFreeBSD.vfs.root.mountfrom"),
            Some("ufs:/dev/ada0s1a")
        );
        assert_eq!(platform.get("kFreeBSD.boot_verbose"), Some("YES"));
        assert_eq!(platform.variables().count(), 2);
    }

    #[test]
    fn block_contains_only_kernel_variables() {
        let mut platform = SimPlatform::pc_default();
        assert!(environment_block(&platform).is_empty());

        platform.set("kFreeBSD.a", "1").unwrap();
        platform.set("kFreeBSD.", "skipped").unwrap();
        platform.set("root", "hd0,msdos1").unwrap();
        platform.set("kFreeBSD.b", "two").unwrap();
        assert_eq!(environment_block(&platform), b"a=1\0b=two\0");
    }
}
