use std::path::Path;

use anyhow::{Context, Error};

use crate::{dependencies::Dependency, ident::BlockId};

/// Initializes a swap area, reusing `uuid` when the previous one is known.
pub fn run(device_path: &Path, uuid: Option<&BlockId>) -> Result<(), Error> {
    let mut cmd = Dependency::Mkswap.cmd();
    if let Some(uuid) = uuid {
        cmd.arg("--uuid").arg(uuid.to_string());
    }
    cmd.arg(device_path)
        .run_and_check()
        .context("Failed to execute mkswap")
}

/// Disables a swap device, ignoring failure when it was not active.
pub fn swapoff_best_effort(device_path: &Path) {
    let _ = Dependency::Swapoff.cmd().arg(device_path).output();
}
