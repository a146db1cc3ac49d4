use std::path::Path;

use anyhow::{Context, Error};

use crate::dependencies::Dependency;

fn base_cmd(device: &Path) -> crate::dependencies::Command {
    let mut cmd = Dependency::Parted.cmd();
    cmd.arg("--script").arg(device);
    cmd
}

/// Creates a new, empty partition table of the given label type.
pub fn mklabel(device: &Path, label: &str) -> Result<(), Error> {
    base_cmd(device)
        .arg("mklabel")
        .arg(label)
        .run_and_check()
        .context(format!(
            "Failed to create '{label}' label on '{}'",
            device.display()
        ))
}

/// Creates a partition spanning [start_sector, end_sector], both inclusive.
///
/// GPT labels take a partition name; MBR labels take the "primary" keyword
/// in the same argument position.
pub fn mkpart(
    device: &Path,
    name: &str,
    start_sector: u64,
    end_sector: u64,
) -> Result<(), Error> {
    base_cmd(device)
        .arg("unit")
        .arg("s")
        .arg("mkpart")
        .arg(name)
        .arg(format!("{start_sector}s"))
        .arg(format!("{end_sector}s"))
        .run_and_check()
        .context(format!(
            "Failed to create partition '{name}' [{start_sector}s..{end_sector}s] on '{}'",
            device.display()
        ))
}

/// Sets or clears a partition flag, e.g. `set_flag(dev, 1, "esp", true)`.
pub fn set_flag(device: &Path, number: usize, flag: &str, on: bool) -> Result<(), Error> {
    base_cmd(device)
        .arg("set")
        .arg(number.to_string())
        .arg(flag)
        .arg(if on { "on" } else { "off" })
        .run_and_check()
        .context(format!(
            "Failed to set flag '{flag}' on partition {number} of '{}'",
            device.display()
        ))
}

/// Moves the end of partition `number` to `end_sector` without touching its
/// start. Generic fallback when delete+recreate is not possible.
pub fn resizepart(device: &Path, number: usize, end_sector: u64) -> Result<(), Error> {
    base_cmd(device)
        .arg("unit")
        .arg("s")
        .arg("resizepart")
        .arg(number.to_string())
        .arg(format!("{end_sector}s"))
        .run_and_check()
        .context(format!(
            "Failed to resize partition {number} of '{}' to end sector {end_sector}",
            device.display()
        ))
}
