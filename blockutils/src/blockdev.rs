use std::path::Path;

use anyhow::{Context, Error};

use crate::dependencies::Dependency;

/// Reads the size of a block device in bytes.
pub fn get_size_bytes(device: &Path) -> Result<u64, Error> {
    let output = Dependency::Blockdev
        .cmd()
        .arg("--getsize64")
        .arg(device)
        .output_and_check()
        .context(format!(
            "Failed to read size of device '{}'",
            device.display()
        ))?;

    output.trim().parse().context(format!(
        "Failed to parse blockdev output '{}' for '{}'",
        output.trim(),
        device.display()
    ))
}

/// Asks the kernel to re-read the partition table of `device`.
pub fn reread_partition_table(device: &Path) -> Result<(), Error> {
    Dependency::Partx
        .cmd()
        .arg("--update")
        .arg(device)
        .run_and_check()
        .context(format!(
            "Failed to re-read partition table for '{}'",
            device.display()
        ))
}
