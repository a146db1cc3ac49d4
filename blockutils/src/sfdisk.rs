use std::path::{Path, PathBuf};

use anyhow::{Context, Error};
use serde::{Deserialize, Serialize};

use crate::{dependencies::Dependency, ident::BlockId};

#[derive(Debug, PartialEq, Deserialize)]
struct SfdiskOutput {
    partitiontable: SfDisk,
}

/// Partition table snapshot produced by `sfdisk -J`.
#[derive(Debug, PartialEq, Deserialize)]
pub struct SfDisk {
    /// Disk label type
    pub label: SfDiskLabel,

    /// Disk UUID (GPT GUID, or 0x-prefixed id for MBR)
    pub id: BlockId,

    /// Disk device path
    pub device: PathBuf,

    /// Disk size unit (always "sectors")
    pub unit: SfDiskUnit,

    /// First LBA
    pub firstlba: u64,

    /// Last LBA
    pub lastlba: u64,

    /// Sector size
    #[serde(default = "SfDisk::default_sectorsize")]
    pub sectorsize: u64,

    /// List of partitions
    #[serde(default)]
    pub partitions: Vec<SfPartition>,

    /// Disk capacity
    #[serde(skip)]
    pub capacity: u64,
}

impl SfDisk {
    fn default_sectorsize() -> u64 {
        512
    }
}

#[derive(Debug, PartialEq, Eq, Deserialize, Clone, Hash)]
pub struct SfPartition {
    /// Partition device path
    pub node: PathBuf,

    /// Partition start offset in sectors
    pub start: u64,

    /// Partition size in sectors
    #[serde(rename = "size")]
    pub size_sectors: u64,

    /// Partition type (GPT type GUID, or MBR hex type)
    #[serde(rename = "type")]
    pub partition_type: String,

    /// Partition UUID (absent on MBR)
    #[serde(rename = "uuid")]
    pub id: Option<BlockId>,

    /// Partition name
    pub name: Option<String>,

    /// Partition size in bytes
    #[serde(skip)]
    pub size: u64,

    /// Parent disk path
    #[serde(skip)]
    pub parent: PathBuf,

    /// Partition number in the partition table
    #[serde(skip)]
    pub number: usize,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Deserialize, Serialize)]
pub enum SfDiskLabel {
    #[serde(rename = "gpt")]
    Gpt,

    /// Master Boot Record
    #[serde(rename = "mbr", alias = "dos")]
    Mbr,
}

impl SfDiskLabel {
    /// Label name as understood by parted's mklabel.
    pub fn parted_name(&self) -> &'static str {
        match self {
            SfDiskLabel::Gpt => "gpt",
            SfDiskLabel::Mbr => "msdos",
        }
    }
}

#[derive(Debug, PartialEq, Deserialize)]
pub enum SfDiskUnit {
    #[serde(rename = "sectors")]
    Sectors,
}

/// GPT EFI System Partition type GUID.
pub const ESP_TYPE_GUID: &str = "C12A7328-F81F-11D2-BA4B-00A0C93EC93B";

/// MBR partition type byte for an EFI system partition.
pub const ESP_MBR_TYPE: &str = "ef";

impl SfDisk {
    pub fn get_info<S>(disk_path: S) -> Result<Self, Error>
    where
        S: AsRef<Path>,
    {
        let sfdisk_output_json = Dependency::Sfdisk
            .cmd()
            .arg("-J")
            .arg(disk_path.as_ref())
            .output_and_check()
            .context(format!(
                "Failed to fetch disk information for {}",
                disk_path.as_ref().display()
            ))?;

        SfDisk::parse_sfdisk_output(&sfdisk_output_json).context(format!(
            "Failed to extract disk information for {}",
            disk_path.as_ref().display()
        ))
    }

    fn parse_sfdisk_output(output: &str) -> Result<Self, Error> {
        let mut disk = serde_json::from_str::<SfdiskOutput>(output)
            .context("Failed to parse disk information")?
            .partitiontable;

        // Update capacity and partition sizes
        disk.capacity = (disk.lastlba - disk.firstlba + 1) * disk.sectorsize;
        disk.partitions.iter_mut().try_for_each(|part| {
            part.size = part.size_sectors * disk.sectorsize;
            part.parent = disk.device.clone();
            part.number = part
                .node
                .as_os_str()
                .to_string_lossy()
                .rsplit_once(|c: char| !c.is_ascii_digit())
                .map(|(_, n)| n)
                .context(format!(
                    "Failed to extract partition number from {}",
                    part.node.display()
                ))?
                .parse()
                .context(format!(
                    "Failed to parse partition number from {}",
                    part.node.display()
                ))?;
            Ok::<(), Error>(())
        })?;

        Ok(disk)
    }
}

impl SfPartition {
    /// Whether this entry is an EFI system partition, on either label type.
    pub fn is_efi(&self) -> bool {
        self.partition_type.eq_ignore_ascii_case(ESP_TYPE_GUID)
            || self.partition_type.eq_ignore_ascii_case(ESP_MBR_TYPE)
    }

    pub fn delete(&self) -> Result<(), Error> {
        Dependency::Sfdisk
            .cmd()
            .arg("--delete")
            .arg(&self.parent)
            .arg(self.number.to_string())
            .run_and_check()
            .context(format!(
                "Failed to delete partition {}",
                self.node.display()
            ))?;
        Ok(())
    }
}

/// Gets the id of the disk label, returning None when the disk has no id set.
pub fn get_disk_id(disk: &Path) -> Result<Option<BlockId>, Error> {
    let output = Dependency::Sfdisk
        .cmd()
        .arg("--disk-id")
        .arg(disk)
        .output()
        .context("Failed to execute sfdisk")?;

    let output_str = output.output();

    if output_str.trim().is_empty() {
        return Ok(None);
    }

    Ok(Some(BlockId::from(output_str.trim())))
}

/// Sets the disk label id (GPT disk GUID or MBR identifier).
pub fn set_disk_id(disk: &Path, id: &BlockId) -> Result<(), Error> {
    Dependency::Sfdisk
        .cmd()
        .arg("--disk-id")
        .arg(disk)
        .arg(id.to_string())
        .run_and_check()
        .context(format!(
            "Failed to set disk id '{id}' on '{}'",
            disk.display()
        ))
}

/// Sets the GPT partition GUID of partition `number` on `disk`.
///
/// sfdisk addresses partitions by index, so callers must only do this once
/// table geometry is final.
pub fn set_partition_uuid(disk: &Path, number: usize, id: &BlockId) -> Result<(), Error> {
    Dependency::Sfdisk
        .cmd()
        .arg("--part-uuid")
        .arg(disk)
        .arg(number.to_string())
        .arg(id.to_string())
        .run_and_check()
        .context(format!(
            "Failed to set partition uuid '{id}' on partition {number} of '{}'",
            disk.display()
        ))
}

/// Moves the GPT backup header to the end of the device. Required after the
/// backing device has grown, before the table can address the new space.
pub fn relocate_backup_header(disk: &Path) -> Result<(), Error> {
    Dependency::Sfdisk
        .cmd()
        .arg("--relocate")
        .arg("gpt-bak-std")
        .arg(disk)
        .run_and_check()
        .context(format!(
            "Failed to relocate GPT backup header on '{}'",
            disk.display()
        ))
}
