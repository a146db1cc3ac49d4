use std::path::Path;

use anyhow::{Context, Error};

use crate::dependencies::Dependency;

/// Runs e2fsck, answering yes to every repair prompt.
pub fn fix(block_device_path: &Path) -> Result<(), Error> {
    Dependency::E2fsck
        .cmd()
        .arg("-f")
        .arg("-y")
        .arg(block_device_path)
        .run_and_check()
        .context("Failed to execute e2fsck")
}
