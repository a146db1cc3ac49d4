use std::path::Path;

use anyhow::{Context, Error};

use crate::{dependencies::Dependency, ident::BlockId};

/// Whether the XFS copy tool is installed.
pub fn copy_tool_available() -> bool {
    Dependency::XfsCopy.exists()
}

/// Duplicates an XFS filesystem device-to-device. xfs_copy stamps the copy
/// with a fresh UUID; callers that need identity preserved reapply it with
/// [`set_uuid`] afterwards.
pub fn clone_filesystem(source: &Path, destination: &Path) -> Result<(), Error> {
    Dependency::XfsCopy
        .cmd()
        .arg(source)
        .arg(destination)
        .run_and_check()
        .context(format!(
            "Failed to copy XFS filesystem from '{}' to '{}'",
            source.display(),
            destination.display()
        ))
}

/// Assigns a filesystem UUID to the XFS filesystem on `device`.
pub fn set_uuid(fs_uuid: &BlockId, device: &Path) -> Result<(), Error> {
    Dependency::XfsAdmin
        .cmd()
        .arg("-U")
        .arg(fs_uuid.to_string())
        .arg(device)
        .run_and_check()
        .context(format!(
            "Failed to set XFS UUID on '{}'",
            device.display()
        ))
}

/// Checks XFS consistency without repairing.
pub fn check(device: &Path) -> Result<(), Error> {
    Dependency::XfsRepair
        .cmd()
        .arg("-n")
        .arg(device)
        .run_and_check()
        .context(format!("XFS consistency check failed for '{}'", device.display()))
}

/// Grows a mounted XFS filesystem to fill its device. XFS can only grow
/// online, so `mount_point` must be where the filesystem is mounted.
pub fn grow(mount_point: &Path) -> Result<(), Error> {
    Dependency::XfsGrowfs
        .cmd()
        .arg(mount_point)
        .run_and_check()
        .context(format!(
            "Failed to grow XFS filesystem mounted at '{}'",
            mount_point.display()
        ))
}
