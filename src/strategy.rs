use std::{cmp::min, path::Path};

use anyhow::{bail, Context, Error};
use log::{debug, info, warn};

use blockutils::{
    blkid, cryptsetup, dd, e2fsck, e2image, fatlabel, mkswap, mount, ntfs, resize2fs, tune2fs,
    xfs,
};

use crate::{
    error::CloneError,
    fstype::FsType,
    inspect::PartitionRecord,
    planner::MIB,
    table::SECTOR_SIZE,
};

/// One partition copy: a source record and the destination node it lands on.
#[derive(Debug)]
pub struct CloneOperation<'a> {
    pub source: &'a PartitionRecord,
    pub destination: &'a Path,
    pub destination_bytes: u64,
}

impl CloneOperation<'_> {
    /// Bytes a raw copy may move without running off either end.
    pub fn copy_bytes(&self) -> u64 {
        min(self.source.size_bytes, self.destination_bytes)
    }
}

/// Per-filesystem clone and resize behavior.
///
/// One static instance per supported filesystem; [`tool_for`] picks the
/// right one and [`execute`] wraps the common shrink logging and identity
/// verification around it.
pub trait FilesystemTool: Sync {
    fn strategy(&self) -> &'static str;

    fn clone_partition(&self, op: &CloneOperation) -> Result<(), CloneError>;

    /// Read-only (or at most self-repairing) consistency check before a
    /// resize touches the filesystem.
    fn check(&self, _device: &Path) -> Result<(), Error> {
        Ok(())
    }

    /// Grows the filesystem to fill `device`.
    fn grow(&self, device: &Path) -> Result<(), Error>;
}

/// Picks the clone/resize tool for a filesystem type.
pub fn tool_for(fs_type: Option<&FsType>) -> &'static dyn FilesystemTool {
    match fs_type {
        Some(FsType::Ext2 | FsType::Ext3 | FsType::Ext4) => &ExtTool,
        Some(FsType::Ntfs) => &NtfsTool,
        Some(FsType::Vfat) => &FatTool,
        Some(FsType::Xfs) => &XfsTool,
        Some(FsType::Luks) => &LuksTool,
        Some(FsType::Swap) => &SwapTool,
        Some(FsType::Other(_)) | None => &GenericTool,
    }
}

/// Clones one partition, logging intended shrinkage up front and verifying
/// identity afterwards. Returns the name of the strategy that ran.
pub fn execute(op: &CloneOperation) -> Result<&'static str, CloneError> {
    let tool = tool_for(op.source.fs_type.as_ref());

    let shrink = op.source.size_bytes.saturating_sub(op.destination_bytes);
    if shrink >= MIB {
        warn!(
            "'{}' loses {shrink} bytes on '{}'; data past the new end is dropped",
            op.source.device_path.display(),
            op.destination.display()
        );
    } else if shrink > 0 {
        debug!(
            "'{}' shrinks by {shrink} bytes of alignment slack",
            op.source.device_path.display()
        );
    }

    info!(
        "Cloning '{}' to '{}' with the {} strategy",
        op.source.device_path.display(),
        op.destination.display(),
        tool.strategy()
    );
    tool.clone_partition(op)?;

    verify_identity(op);
    Ok(tool.strategy())
}

/// Compares the destination's filesystem UUID against the source's. Identity
/// drift is reported but never fails a clone that already copied the data.
fn verify_identity(op: &CloneOperation) {
    let Some(expected) = &op.source.filesystem_uuid else {
        return;
    };

    let actual = match op.source.fs_type {
        Some(FsType::Luks) => cryptsetup::luks_uuid(op.destination).map(Some),
        _ => blkid::get_filesystem_uuid(op.destination),
    };

    match actual {
        Ok(Some(actual)) if actual == *expected => {
            debug!("'{}' kept UUID {expected}", op.destination.display());
        }
        Ok(actual) => warn!(
            "UUID of '{}' is {} but the source had {expected}",
            op.destination.display(),
            actual.map_or_else(|| "unset".to_string(), |a| a.to_string()),
        ),
        Err(e) => warn!(
            "Could not verify UUID of '{}': {e:#}",
            op.destination.display()
        ),
    }
}

/// Raw copy with one retry at a smaller block size.
fn block_copy(source: &Path, destination: &Path, count_bytes: u64) -> Result<(), Error> {
    if let Err(e) = dd::copy_bytes(source, destination, count_bytes, dd::BLOCK_SIZE) {
        warn!(
            "Block copy with {} byte blocks failed ({e:#}), retrying with {} byte blocks",
            dd::BLOCK_SIZE,
            dd::FALLBACK_BLOCK_SIZE
        );
        return dd::copy_bytes(source, destination, count_bytes, dd::FALLBACK_BLOCK_SIZE);
    }
    Ok(())
}

fn strategy_failed(op: &CloneOperation, strategy: &'static str, cause: Error) -> CloneError {
    CloneError::StrategyFailed {
        source_device: op.source.device_path.clone(),
        destination: op.destination.to_path_buf(),
        strategy,
        cause,
    }
}

/// ext2/3/4: e2image copies only allocated blocks and keeps the superblock
/// (UUID included); a raw copy is the fallback.
pub struct ExtTool;

impl FilesystemTool for ExtTool {
    fn strategy(&self) -> &'static str {
        "ext"
    }

    fn clone_partition(&self, op: &CloneOperation) -> Result<(), CloneError> {
        if let Err(e) = e2image::clone_filesystem(&op.source.device_path, op.destination) {
            warn!("e2image clone failed ({e:#}), falling back to a raw copy");
            block_copy(&op.source.device_path, op.destination, op.copy_bytes())
                .map_err(|cause| strategy_failed(op, self.strategy(), cause))?;

            // A truncated raw copy leaves a repairable filesystem; restamp
            // the UUID once e2fsck has had its say
            if let Some(uuid) = &op.source.filesystem_uuid {
                if let Err(e) = tune2fs::set_uuid(uuid, op.destination) {
                    warn!("Could not restamp ext UUID {uuid}: {e:#}");
                }
            }
        }
        Ok(())
    }

    fn check(&self, device: &Path) -> Result<(), Error> {
        e2fsck::fix(device)
    }

    fn grow(&self, device: &Path) -> Result<(), Error> {
        resize2fs::run(device)
    }
}

/// NTFS: ntfsclone preserves the volume serial; without it a raw copy works
/// but makes no identity promise.
pub struct NtfsTool;

impl FilesystemTool for NtfsTool {
    fn strategy(&self) -> &'static str {
        "ntfs"
    }

    fn clone_partition(&self, op: &CloneOperation) -> Result<(), CloneError> {
        if ntfs::clone_tool_available() {
            ntfs::clone_filesystem(&op.source.device_path, op.destination)
                .map_err(|cause| strategy_failed(op, self.strategy(), cause))
        } else {
            warn!("ntfsclone is not installed; raw copy does not guarantee the volume serial");
            block_copy(&op.source.device_path, op.destination, op.copy_bytes())
                .map_err(|cause| strategy_failed(op, self.strategy(), cause))
        }
    }

    fn check(&self, device: &Path) -> Result<(), Error> {
        ntfs::check(device)
    }

    fn grow(&self, device: &Path) -> Result<(), Error> {
        ntfs::grow(device)
    }
}

/// FAT: raw copy, then restamp the volume serial in case the copy was
/// truncated short of the backup boot sector.
pub struct FatTool;

impl FilesystemTool for FatTool {
    fn strategy(&self) -> &'static str {
        "fat"
    }

    fn clone_partition(&self, op: &CloneOperation) -> Result<(), CloneError> {
        block_copy(&op.source.device_path, op.destination, op.copy_bytes())
            .map_err(|cause| strategy_failed(op, self.strategy(), cause))?;

        if let Some(serial) = &op.source.filesystem_uuid {
            if let Err(e) = fatlabel::set_volume_id(serial, op.destination) {
                warn!("Could not restamp FAT volume id {serial}: {e:#}");
            }
        }
        Ok(())
    }

    fn grow(&self, _device: &Path) -> Result<(), Error> {
        bail!("growing FAT filesystems is not supported")
    }
}

/// XFS: xfs_copy when available (it regenerates the UUID, so the source one
/// is reapplied), raw copy otherwise.
pub struct XfsTool;

impl FilesystemTool for XfsTool {
    fn strategy(&self) -> &'static str {
        "xfs"
    }

    fn clone_partition(&self, op: &CloneOperation) -> Result<(), CloneError> {
        if xfs::copy_tool_available() {
            xfs::clone_filesystem(&op.source.device_path, op.destination)
                .map_err(|cause| strategy_failed(op, self.strategy(), cause))?;

            if let Some(uuid) = &op.source.filesystem_uuid {
                xfs::set_uuid(uuid, op.destination)
                    .map_err(|cause| strategy_failed(op, self.strategy(), cause))?;
            }
            Ok(())
        } else {
            block_copy(&op.source.device_path, op.destination, op.copy_bytes())
                .map_err(|cause| strategy_failed(op, self.strategy(), cause))
        }
    }

    fn check(&self, device: &Path) -> Result<(), Error> {
        xfs::check(device)
    }

    /// XFS only grows online, so the filesystem is mounted on a scratch
    /// directory for the duration.
    fn grow(&self, device: &Path) -> Result<(), Error> {
        let scratch = tempfile::tempdir().context("Failed to create a scratch mount point")?;
        mount::mount(device, scratch.path())?;

        let grown = xfs::grow(scratch.path());
        mount::umount_with_fallback(scratch.path())?;
        grown
    }
}

/// LUKS: opaque byte-exact copy of the whole container. The destination must
/// hold every source sector or the payload would be silently truncated.
pub struct LuksTool;

impl FilesystemTool for LuksTool {
    fn strategy(&self) -> &'static str {
        "luks"
    }

    fn clone_partition(&self, op: &CloneOperation) -> Result<(), CloneError> {
        if op.destination_bytes < op.source.size_bytes {
            return Err(CloneError::LuksDestinationTooSmall {
                source_device: op.source.device_path.clone(),
                source_sectors: op.source.size_bytes / SECTOR_SIZE,
                destination: op.destination.to_path_buf(),
                destination_sectors: op.destination_bytes / SECTOR_SIZE,
            });
        }

        block_copy(&op.source.device_path, op.destination, op.source.size_bytes)
            .map_err(|cause| strategy_failed(op, self.strategy(), cause))?;

        // The header must still parse after the copy
        cryptsetup::luks_dump(op.destination)
            .map_err(|cause| strategy_failed(op, self.strategy(), cause))
    }

    fn grow(&self, _device: &Path) -> Result<(), Error> {
        bail!("LUKS payloads grow through their open mapping, not the partition node")
    }
}

/// Swap: nothing worth copying; recreate the signature with the source UUID.
pub struct SwapTool;

impl FilesystemTool for SwapTool {
    fn strategy(&self) -> &'static str {
        "swap"
    }

    fn clone_partition(&self, op: &CloneOperation) -> Result<(), CloneError> {
        mkswap::run(op.destination, op.source.filesystem_uuid.as_ref())
            .map_err(|cause| strategy_failed(op, self.strategy(), cause))
    }

    fn grow(&self, device: &Path) -> Result<(), Error> {
        // mkswap writes a fresh signature spanning the whole device
        let uuid = blkid::get_filesystem_uuid(device)?;
        mkswap::run(device, uuid.as_ref())
    }
}

/// Unknown or absent filesystems: raw copy, no identity promise.
pub struct GenericTool;

impl FilesystemTool for GenericTool {
    fn strategy(&self) -> &'static str {
        "raw"
    }

    fn clone_partition(&self, op: &CloneOperation) -> Result<(), CloneError> {
        match &op.source.fs_type {
            Some(FsType::Other(name)) => {
                warn!("No dedicated strategy for '{name}', falling back to a raw copy")
            }
            _ => debug!(
                "No filesystem signature on '{}', copying raw",
                op.source.device_path.display()
            ),
        }
        block_copy(&op.source.device_path, op.destination, op.copy_bytes())
            .map_err(|cause| strategy_failed(op, self.strategy(), cause))
    }

    fn grow(&self, _device: &Path) -> Result<(), Error> {
        bail!("no grow tool for this filesystem")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inspect::tests::record;
    use std::path::PathBuf;

    #[test]
    fn test_tool_dispatch() {
        assert_eq!(tool_for(Some(&FsType::Ext2)).strategy(), "ext");
        assert_eq!(tool_for(Some(&FsType::Ext4)).strategy(), "ext");
        assert_eq!(tool_for(Some(&FsType::Ntfs)).strategy(), "ntfs");
        assert_eq!(tool_for(Some(&FsType::Vfat)).strategy(), "fat");
        assert_eq!(tool_for(Some(&FsType::Xfs)).strategy(), "xfs");
        assert_eq!(tool_for(Some(&FsType::Luks)).strategy(), "luks");
        assert_eq!(tool_for(Some(&FsType::Swap)).strategy(), "swap");
        assert_eq!(tool_for(Some(&FsType::Other("btrfs".into()))).strategy(), "raw");
        assert_eq!(tool_for(None).strategy(), "raw");
    }

    #[test]
    fn test_copy_bytes_is_bounded() {
        let source = record(1, 4096 * 1024, false);
        let destination = PathBuf::from("/dev/loop1p1");

        let shrinking = CloneOperation {
            source: &source,
            destination: &destination,
            destination_bytes: 1024 * 1024,
        };
        assert_eq!(shrinking.copy_bytes(), 1024 * 1024);

        let growing = CloneOperation {
            source: &source,
            destination: &destination,
            destination_bytes: 8192 * 1024,
        };
        assert_eq!(growing.copy_bytes(), 4096 * 1024);
    }

    #[test]
    fn test_luks_refuses_truncation() {
        // The guard fires before any external tool runs
        let mut source = record(1, 200 * 1024 * 1024, false);
        source.fs_type = Some(FsType::Luks);
        let destination = PathBuf::from("/dev/loop1p1");

        let op = CloneOperation {
            source: &source,
            destination: &destination,
            destination_bytes: 100 * 1024 * 1024,
        };
        let err = LuksTool.clone_partition(&op).unwrap_err();
        match err {
            CloneError::LuksDestinationTooSmall {
                source_sectors,
                destination_sectors,
                ..
            } => {
                assert_eq!(source_sectors, 409600);
                assert_eq!(destination_sectors, 204800);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
