use std::path::Path;

use anyhow::{Context, Error};

use crate::dependencies::Dependency;

/// Clones an ext2/3/4 filesystem from one block device to another using raw
/// image mode. Only allocated blocks are copied, and the filesystem UUID is
/// carried over as part of the superblock.
pub fn clone_filesystem(source: &Path, destination: &Path) -> Result<(), Error> {
    Dependency::E2image
        .cmd()
        .arg("-ra") // raw, all-data mode for device-to-device copies
        .arg("-p") // progress on stderr, recorded in the command log
        .arg(source)
        .arg(destination)
        .run_and_check()
        .context(format!(
            "Failed to clone ext filesystem from '{}' to '{}'",
            source.display(),
            destination.display()
        ))
}
