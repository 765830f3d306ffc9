//! The control channel: command parsing for the virtual `.command` file
//! and the client side used by `annexfs -c`.

use anyhow::{Context, bail};
use std::io::Write;
use std::path::Path;

use crate::classify::CONTROL_PATH;

/// A command delivered through the control file.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    Sync,
    Merge,
    Get(String),
}

/// Parses a control-file write into messages.
///
/// The payload is newline-delimited; unrecognised lines are ignored. The
/// caller reports the whole buffer as consumed regardless of the outcome.
pub fn parse_commands(data: &[u8]) -> Vec<ControlMessage> {
    let text = String::from_utf8_lossy(data);
    let mut messages = Vec::new();
    for line in text.lines() {
        let mut words = line.split_whitespace();
        match words.next() {
            Some("sync") => messages.push(ControlMessage::Sync),
            Some("merge") => messages.push(ControlMessage::Merge),
            Some("get") => {
                let pathspec = words.collect::<Vec<_>>().join(" ");
                if !pathspec.is_empty() {
                    messages.push(ControlMessage::Get(pathspec));
                }
            }
            _ => {}
        }
    }
    messages
}

/// Returns true if `mountpoint` appears as a mount target in the given
/// mount table (one `/proc/mounts` formatted entry per line).
fn mounted_in(table: &str, mountpoint: &Path) -> bool {
    let wanted = mountpoint.to_string_lossy();
    table
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .any(|target| target == wanted)
}

/// Delivers `command` to the mount at `mountpoint` by writing it into the
/// control file. Fails when the command is not one we understand or when
/// nothing is mounted there.
pub fn send_command(mountpoint: &Path, command: &str) -> anyhow::Result<()> {
    match command.split_whitespace().next() {
        Some("sync") | Some("merge") | Some("get") => {}
        _ => bail!("unknown command '{}'", command),
    }

    let table = std::fs::read_to_string("/proc/mounts").context("could not read the mount table")?;
    let mountpoint = mountpoint
        .canonicalize()
        .with_context(|| format!("invalid mountpoint '{}'", mountpoint.display()))?;
    if !mounted_in(&table, &mountpoint) {
        bail!("'{}' is not a mountpoint", mountpoint.display());
    }

    let control = mountpoint.join(CONTROL_PATH);
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .open(&control)
        .with_context(|| format!("could not open '{}'", control.display()))?;
    writeln!(file, "{}", command.trim_end()).context("could not write the command")?;
    Ok(())
}
