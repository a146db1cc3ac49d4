use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Error};
use chrono::Utc;
use log::{info, warn};

use blockutils::{
    blkid, blockdev, cryptsetup, parted, qemu,
    session::BlockSession,
    sfdisk::{self, SfDisk, SfDiskLabel},
    udevadm,
};

use crate::{
    error::{ConnectionError, EngineError, PartitionTableError},
    fstype::FsType,
    inspect::{self, DiskSnapshot, PartitionRecord},
    layered::{self, CredentialSource, KeyFile, Prompt},
    planner, strategy, table,
};

#[derive(Debug)]
pub struct ResizeRequest {
    pub file: PathBuf,

    /// New virtual size in bytes. Must not be smaller than the current size.
    pub new_size: u64,

    /// Partition expected to receive the new space. Defaults to the last
    /// partition; anything else is refused.
    pub partition: Option<usize>,

    /// Keep a timestamped copy of the image before touching it.
    pub backup: bool,

    /// Passphrase file for an encrypted last partition. Prompts when absent.
    pub key_file: Option<PathBuf>,
}

/// Grows a disk image to `new_size` and extends its last partition (and the
/// filesystem inside) into the new space.
pub fn run(request: &ResizeRequest) -> Result<(), EngineError> {
    let image = qemu::image_info(&request.file)
        .map_err(|e| EngineError::step("inspect the image", e))?;

    if request.new_size < image.virtual_size {
        return Err(EngineError::ShrinkUnsupported {
            file: request.file.clone(),
            current_bytes: image.virtual_size,
            requested_bytes: request.new_size,
        });
    }
    if request.new_size == image.virtual_size {
        info!(
            "'{}' is already {} bytes, nothing to do",
            request.file.display(),
            request.new_size
        );
        return Ok(());
    }

    if request.backup {
        back_up(&request.file).map_err(|e| EngineError::step("back up the image", e))?;
    }

    info!(
        "Growing '{}' from {} to {} bytes",
        request.file.display(),
        image.virtual_size,
        request.new_size
    );
    qemu::resize_image(&request.file, image.format, request.new_size)
        .map_err(|e| EngineError::step("grow the image", e))?;

    let mut session =
        BlockSession::connect(&request.file, image.format).map_err(|cause| ConnectionError {
            file: request.file.clone(),
            cause,
        })?;

    let snapshot = inspect::snapshot(session.device())
        .map_err(|e| EngineError::step("inspect the partition table", e))?;

    let outcome = grow_into_new_space(&mut session, &snapshot, request);

    if let Err(e) = session.disconnect() {
        warn!("Session teardown reported: {e:#}");
    }
    outcome
}

fn grow_into_new_space(
    session: &mut BlockSession,
    snapshot: &DiskSnapshot,
    request: &ResizeRequest,
) -> Result<(), EngineError> {
    let Some(last) = snapshot.partitions.last() else {
        info!("The image has no partitions; only the virtual size changed");
        return Ok(());
    };

    if let Some(number) = request.partition {
        if number != last.number {
            return Err(PartitionTableError::NotLastPartition {
                number,
                last: last.number,
            }
            .into());
        }
    }

    grow_last_partition(session.device(), snapshot, last)
        .map_err(|e| EngineError::step("grow the last partition", e))?;

    let Some(node) = table::wait_for_node(session.device(), last.number) else {
        return Err(EngineError::step(
            "probe the resized partition",
            anyhow!(
                "partition {} never reappeared as a device node after the resize",
                last.number
            ),
        ));
    };
    match &last.fs_type {
        Some(FsType::Luks) => grow_encrypted(session, &node, request.key_file.as_deref()),
        Some(fs) if fs.is_ext() || matches!(fs, FsType::Xfs | FsType::Ntfs | FsType::Swap) => {
            grow_filesystem(fs, &node)
        }
        Some(fs) => {
            warn!("No grow tool for '{fs}'; the filesystem keeps its original size");
            Ok(())
        }
        None => {
            info!("The last partition has no filesystem signature, nothing to grow");
            Ok(())
        }
    }
}

/// Extends the last partition to the end of the (now larger) device.
///
/// GPT tables first move the backup header to the new device end, then the
/// partition is deleted and recreated at the same start so its entry GUID
/// and name can be restored. Any failure there falls back to an in-place
/// resizepart.
fn grow_last_partition(
    device: &Path,
    snapshot: &DiskSnapshot,
    last: &PartitionRecord,
) -> Result<(), Error> {
    let capacity = blockdev::get_size_bytes(device)?;
    let end_sector = usable_end_sector(capacity, snapshot.sector_size);
    let current_end = last.start_sector + last.size_bytes / snapshot.sector_size - 1;
    if end_sector <= current_end {
        info!("Partition {} already spans the usable space", last.number);
        return Ok(());
    }

    info!(
        "Extending partition {} from sector {current_end} to {end_sector}",
        last.number
    );

    match snapshot.label {
        SfDiskLabel::Gpt => {
            sfdisk::relocate_backup_header(device)?;
            if let Err(e) = recreate_last_partition(device, last, end_sector) {
                warn!("Delete-and-recreate failed ({e:#}), falling back to resizepart");
                parted::resizepart(device, last.number, end_sector)?;
            }
        }
        SfDiskLabel::Mbr => parted::resizepart(device, last.number, end_sector)?,
    }

    if let Err(e) = blockdev::reread_partition_table(device) {
        warn!("Partition table re-read failed: {e:#}");
    }
    let _ = udevadm::settle();
    Ok(())
}

/// Last addressable sector once the table reserve at the device end is held
/// back, in the device's own sector size.
fn usable_end_sector(capacity_bytes: u64, sector_size: u64) -> u64 {
    capacity_bytes.saturating_sub(planner::TABLE_RESERVE_BYTES) / sector_size - 1
}

fn recreate_last_partition(
    device: &Path,
    last: &PartitionRecord,
    end_sector: u64,
) -> Result<(), Error> {
    let disk = SfDisk::get_info(device)?;
    let entry = disk
        .partitions
        .iter()
        .find(|p| p.number == last.number)
        .context(format!("Partition {} is not in the table", last.number))?;
    entry.delete()?;

    let name = last.name.as_deref().unwrap_or("part");
    parted::mkpart(device, name, last.start_sector, end_sector)?;
    if last.is_efi {
        parted::set_flag(device, last.number, "esp", true)?;
    }
    if let Some(uuid) = &last.partition_uuid {
        sfdisk::set_partition_uuid(device, last.number, uuid)?;
    }
    Ok(())
}

fn grow_filesystem(fs: &FsType, node: &Path) -> Result<(), EngineError> {
    let tool = strategy::tool_for(Some(fs));
    tool.check(node)
        .map_err(|e| EngineError::step("check the filesystem", e))?;
    tool.grow(node)
        .map_err(|e| EngineError::step("grow the filesystem", e))?;
    info!("Grew the {fs} filesystem on '{}'", node.display());
    Ok(())
}

/// Opens the encrypted last partition, grows the mapping into the extended
/// partition, then grows whatever filesystem lives inside. The session owns
/// the mapping, so it is closed on teardown.
fn grow_encrypted(
    session: &mut BlockSession,
    node: &Path,
    key_file: Option<&Path>,
) -> Result<(), EngineError> {
    let credentials: Box<dyn CredentialSource> = match key_file {
        Some(path) => Box::new(KeyFile(path.to_path_buf())),
        None => Box::new(Prompt),
    };

    let payload = layered::open_luks(session, node, credentials.as_ref())?;
    let mapping = payload
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    cryptsetup::resize(&mapping)
        .map_err(|e| EngineError::step("grow the encrypted mapping", e))?;

    let inner = blkid::get_filesystem_type(&payload)
        .map_err(|e| EngineError::step("probe the decrypted payload", e))?
        .map(|t| FsType::parse(&t));

    match inner {
        Some(fs) if fs.is_ext() || matches!(fs, FsType::Xfs | FsType::Ntfs | FsType::Swap) => {
            grow_filesystem(&fs, &payload)
        }
        Some(FsType::Other(name)) if name == "LVM2_member" => {
            let volumes = layered::resolve_volume_group(session, &payload)
                .map_err(|e| EngineError::step("resolve the volume group", e))?;
            warn!(
                "The payload is an LVM physical volume with {} logical volumes; extend them \
                 from inside the guest",
                volumes.len()
            );
            Ok(())
        }
        Some(fs) => {
            warn!("No grow tool for '{fs}' inside the container");
            Ok(())
        }
        None => {
            warn!("The decrypted payload has no filesystem signature");
            Ok(())
        }
    }
}

fn back_up(file: &Path) -> Result<(), Error> {
    let backup = backup_path(file, &Utc::now().format("%Y%m%d-%H%M%S").to_string());
    info!("Backing up '{}' to '{}'", file.display(), backup.display());
    std::fs::copy(file, &backup).context(format!(
        "Failed to copy '{}' to '{}'",
        file.display(),
        backup.display()
    ))?;
    Ok(())
}

fn backup_path(file: &Path, timestamp: &str) -> PathBuf {
    PathBuf::from(format!("{}.{timestamp}.bak", file.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usable_end_sector_follows_sector_size() {
        let capacity = 8 * 1024 * 1024 * 1024u64;
        assert_eq!(usable_end_sector(capacity, 512), 16_769_023);
        assert_eq!(usable_end_sector(capacity, 4096), 2_096_127);
    }

    #[test]
    fn test_backup_path() {
        assert_eq!(
            backup_path(Path::new("/images/vm.qcow2"), "20260826-120000"),
            PathBuf::from("/images/vm.qcow2.20260826-120000.bak")
        );
    }
}
