use std::path::Path;

use anyhow::{Context, Error};

use crate::dependencies::Dependency;

/// Whether the NTFS clone tool is installed.
pub fn clone_tool_available() -> bool {
    Dependency::Ntfsclone.exists()
}

/// Clones an NTFS filesystem device-to-device, preserving the volume serial.
pub fn clone_filesystem(source: &Path, destination: &Path) -> Result<(), Error> {
    Dependency::Ntfsclone
        .cmd()
        .arg("--overwrite")
        .arg(destination)
        .arg(source)
        .run_and_check()
        .context(format!(
            "Failed to clone NTFS filesystem from '{}' to '{}'",
            source.display(),
            destination.display()
        ))
}

/// Checks NTFS consistency without modifying anything.
pub fn check(device: &Path) -> Result<(), Error> {
    Dependency::Ntfsresize
        .cmd()
        .arg("--check")
        .arg(device)
        .run_and_check()
        .context(format!("NTFS consistency check failed for '{}'", device.display()))
}

/// Grows the NTFS filesystem to fill its device.
pub fn grow(device: &Path) -> Result<(), Error> {
    Dependency::Ntfsresize
        .cmd()
        .arg("--force")
        .arg("--no-progress-bar")
        .arg(device)
        .run_and_check()
        .context(format!("Failed to grow NTFS filesystem on '{}'", device.display()))
}
