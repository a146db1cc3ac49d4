use std::path::Path;

use anyhow::{Context, Error};

use crate::dependencies::Dependency;

/// Resizes the ext* filesystem on the block device to fill the entire device.
pub fn run(block_device_path: &Path) -> Result<(), Error> {
    Dependency::Resize2fs
        .cmd()
        .arg(block_device_path)
        .run_and_check()
        .context("Failed to execute resize2fs")
}
