use std::path::{Path, PathBuf};

use anyhow::{ensure, Context, Error};
use serde::Serialize;

use blockutils::{
    blkid, blockdev, cryptsetup,
    ident::BlockId,
    qemu::{self, ImageFormat},
    session::BlockSession,
    sfdisk::{SfDisk, SfDiskLabel},
};

use crate::fstype::FsType;

/// Everything the planner and clone stages need to know about one source
/// partition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartitionRecord {
    /// Partition number in the source table.
    pub number: usize,

    /// Device node the partition was inspected through.
    pub device_path: PathBuf,

    pub start_sector: u64,

    /// Partition size in bytes. Always nonzero.
    pub size_bytes: u64,

    pub fs_type: Option<FsType>,

    /// Whether this is an EFI system partition (by type GUID or MBR type).
    pub is_efi: bool,

    /// Filesystem UUID (or LUKS container UUID for encrypted partitions).
    pub filesystem_uuid: Option<BlockId>,

    /// GPT partition entry GUID. Absent on MBR tables.
    pub partition_uuid: Option<BlockId>,

    /// GPT partition name, when set.
    pub name: Option<String>,
}

/// Point-in-time view of a partitioned block device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiskSnapshot {
    pub device: PathBuf,
    pub label: SfDiskLabel,
    /// Disk label id: GPT disk GUID, or 0x-prefixed MBR identifier.
    pub disk_id: BlockId,
    pub capacity_bytes: u64,
    pub sector_size: u64,
    pub partitions: Vec<PartitionRecord>,
}

impl DiskSnapshot {
    /// Sum of all partition sizes in bytes.
    pub fn total_partition_bytes(&self) -> u64 {
        self.partitions.iter().map(|p| p.size_bytes).sum()
    }
}

/// Inspects the partition table and per-partition metadata of a block device.
pub fn snapshot(device: &Path) -> Result<DiskSnapshot, Error> {
    let disk = SfDisk::get_info(device)?;
    let capacity_bytes = blockdev::get_size_bytes(device)?;

    let mut partitions = Vec::with_capacity(disk.partitions.len());
    for part in &disk.partitions {
        ensure!(
            part.size > 0,
            "partition '{}' reports zero size",
            part.node.display()
        );

        let fs_type = blkid::get_filesystem_type(&part.node)?.map(|t| FsType::parse(&t));

        // LUKS containers report their UUID through the header, not blkid
        let filesystem_uuid = match fs_type {
            Some(FsType::Luks) => Some(cryptsetup::luks_uuid(&part.node)?),
            _ => blkid::get_filesystem_uuid(&part.node)?,
        };

        partitions.push(PartitionRecord {
            number: part.number,
            device_path: part.node.clone(),
            start_sector: part.start,
            size_bytes: part.size,
            fs_type,
            is_efi: part.is_efi(),
            filesystem_uuid,
            partition_uuid: part.id.clone(),
            name: part.name.clone(),
        });
    }

    Ok(DiskSnapshot {
        device: device.to_path_buf(),
        label: disk.label,
        disk_id: disk.id,
        capacity_bytes,
        sector_size: disk.sectorsize,
        partitions,
    })
}

/// Inspects a target that is either a block device or a disk image file.
///
/// Image files are connected for the duration of the inspection and torn
/// down before returning.
pub fn inspect_target(target: &Path, format: Option<ImageFormat>) -> Result<DiskSnapshot, Error> {
    if is_block_device(target) {
        return snapshot(target);
    }

    let format = match format {
        Some(format) => format,
        None => {
            qemu::image_info(target)
                .context(format!("Failed to probe image '{}'", target.display()))?
                .format
        }
    };

    let session = BlockSession::connect(target, format)?;
    let snap = snapshot(session.device());
    session.disconnect()?;
    snap
}

/// Whether `path` resolves to a block device node.
pub fn is_block_device(path: &Path) -> bool {
    use std::os::unix::fs::FileTypeExt;

    std::fs::metadata(path).is_ok_and(|m| m.file_type().is_block_device())
}

/// Renders a byte count the way humans read disk sizes.
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    #[test]
    fn test_human_size() {
        assert_eq!(human_size(0), "0 B");
        assert_eq!(human_size(512), "512 B");
        assert_eq!(human_size(1024), "1.0 KiB");
        assert_eq!(human_size(4 * 1024 * 1024), "4.0 MiB");
        // 512110190592 / 1024^3 = 476.94..., rounded to one decimal
        assert_eq!(human_size(512_110_190_592), "476.9 GiB");
    }

    #[test]
    fn test_total_partition_bytes() {
        let snap = DiskSnapshot {
            device: PathBuf::from("/dev/sda"),
            label: SfDiskLabel::Gpt,
            disk_id: BlockId::from("3E6494F9-91E1-426B-A25A-0A8101E464A4"),
            capacity_bytes: 100,
            sector_size: 512,
            partitions: vec![
                record(1, 8_388_608, true),
                record(2, 536_870_912, false),
            ],
        };
        assert_eq!(snap.total_partition_bytes(), 545_259_520);
    }

    pub(crate) fn record(number: usize, size_bytes: u64, is_efi: bool) -> PartitionRecord {
        PartitionRecord {
            number,
            device_path: PathBuf::from(format!("/dev/sda{number}")),
            start_sector: 2048,
            size_bytes,
            fs_type: None,
            is_efi,
            filesystem_uuid: None,
            partition_uuid: None,
            name: None,
        }
    }
}
