use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Error};
use log::{debug, info, warn};

use blockutils::{
    blkid, blockdev,
    ident::BlockId,
    lsblk, parted, repeat,
    session::partition_node,
    sfdisk::{self, SfDiskLabel},
    udevadm, wipefs,
};

use crate::{
    error::PartitionTableError,
    fstype::FsType,
    inspect::DiskSnapshot,
    planner::SizePlan,
};

pub const SECTOR_SIZE: u64 = 512;

/// 1MiB alignment, in sectors. Everything starts and ends on these
/// boundaries.
pub const ALIGNMENT_SECTORS: u64 = 2048;

const NODE_PROBE_ATTEMPTS: u32 = 10;
const NODE_PROBE_BACKOFF: Duration = Duration::from_secs(1);

/// One destination partition with its final geometry.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedPartition {
    /// Index into the source snapshot's partition list.
    pub source_index: usize,

    /// Partition number on the destination table (1-based, sequential).
    pub number: usize,

    pub start_sector: u64,
    pub size_sectors: u64,

    pub is_efi: bool,
    pub fs_type: Option<FsType>,

    /// Source partition entry GUID to reinject, GPT only.
    pub partition_uuid: Option<BlockId>,

    /// GPT partition name.
    pub name: String,
}

impl PlannedPartition {
    pub fn end_sector(&self) -> u64 {
        self.start_sector + self.size_sectors - 1
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_sectors * SECTOR_SIZE
    }
}

/// A partition created on the destination, with the device node it became
/// reachable through. `node` is None when the kernel never surfaced one.
#[derive(Debug)]
pub struct BuiltPartition {
    pub planned: PlannedPartition,
    pub node: Option<PathBuf>,
}

#[derive(Debug)]
pub struct BuiltTable {
    pub partitions: Vec<BuiltPartition>,
}

/// Computes the destination geometry for a size plan.
///
/// Partitions keep their source order and are renumbered sequentially.
/// Sizes round down to the alignment grid, except LUKS payloads which round
/// up so the container is never truncated by alignment alone.
pub fn layout(snapshot: &DiskSnapshot, plan: &SizePlan) -> Vec<PlannedPartition> {
    let mut next_start = ALIGNMENT_SECTORS;
    let mut planned = Vec::with_capacity(snapshot.partitions.len());

    for (index, (record, allocation)) in snapshot
        .partitions
        .iter()
        .zip(plan.allocations())
        .enumerate()
    {
        let sectors = allocation / SECTOR_SIZE;
        let size_sectors = if matches!(record.fs_type, Some(FsType::Luks)) {
            align_up(sectors)
        } else {
            align_down(sectors).max(ALIGNMENT_SECTORS)
        };

        let number = index + 1;
        planned.push(PlannedPartition {
            source_index: index,
            number,
            start_sector: next_start,
            size_sectors,
            is_efi: record.is_efi,
            fs_type: record.fs_type.clone(),
            partition_uuid: record.partition_uuid.clone(),
            name: record.name.clone().unwrap_or_else(|| format!("part{number}")),
        });

        next_start = align_up(next_start + size_sectors);
    }

    planned
}

/// Builds the planned table on `device`: wipe, label, create every
/// partition, wait for device nodes, then reinject source identifiers.
pub fn build(
    device: &std::path::Path,
    snapshot: &DiskSnapshot,
    planned: Vec<PlannedPartition>,
) -> Result<BuiltTable, PartitionTableError> {
    create_table(device, snapshot.label, &planned).map_err(|cause| {
        PartitionTableError::CreateFailed {
            device: device.to_path_buf(),
            cause,
        }
    })?;

    let partitions = planned
        .into_iter()
        .map(|p| {
            let node = wait_for_node(device, p.number);
            BuiltPartition { planned: p, node }
        })
        .collect::<Vec<_>>();

    // Identifiers go in last, once geometry is final: sfdisk addresses
    // partitions by index
    reinject_identity(device, snapshot, &partitions).map_err(|cause| {
        PartitionTableError::CreateFailed {
            device: device.to_path_buf(),
            cause,
        }
    })?;

    Ok(BuiltTable { partitions })
}

fn create_table(
    device: &std::path::Path,
    label: SfDiskLabel,
    planned: &[PlannedPartition],
) -> Result<(), Error> {
    info!(
        "Building a {} table with {} partitions on '{}'",
        label.parted_name(),
        planned.len(),
        device.display()
    );

    wipefs::all(device)?;
    parted::mklabel(device, label.parted_name())?;

    for p in planned {
        let name = match label {
            SfDiskLabel::Gpt => p.name.as_str(),
            SfDiskLabel::Mbr => "primary",
        };
        parted::mkpart(device, name, p.start_sector, p.end_sector())?;

        if p.is_efi {
            parted::set_flag(device, p.number, "esp", true)?;
        }
    }

    Ok(())
}

/// Waits for the kernel to surface the device node of partition `number`,
/// re-reading the table between probes. A missing node is not fatal for the
/// table; the partition is reported without one and skipped downstream.
pub(crate) fn wait_for_node(device: &std::path::Path, number: usize) -> Option<PathBuf> {
    wait_for_node_with_budget(device, number, NODE_PROBE_ATTEMPTS, NODE_PROBE_BACKOFF)
}

fn wait_for_node_with_budget(
    device: &std::path::Path,
    number: usize,
    attempts: u32,
    backoff: Duration,
) -> Option<PathBuf> {
    let node = partition_node(device, number);

    let appeared = repeat::poll_until(attempts, backoff, || {
        if lsblk::node_exists(&node) {
            return true;
        }
        debug!("Waiting for '{}' to appear", node.display());
        if let Err(e) = blockdev::reread_partition_table(device) {
            debug!("Partition table re-read failed: {e:#}");
        }
        let _ = udevadm::settle();
        lsblk::node_exists(&node)
    });

    if appeared {
        Some(node)
    } else {
        warn!(
            "Device node '{}' never appeared after {attempts} probes",
            node.display()
        );
        None
    }
}

fn reinject_identity(
    device: &std::path::Path,
    snapshot: &DiskSnapshot,
    partitions: &[BuiltPartition],
) -> Result<(), Error> {
    sfdisk::set_disk_id(device, &snapshot.disk_id)
        .context("Failed to restore the disk label id")?;

    if snapshot.label == SfDiskLabel::Gpt {
        for p in partitions {
            if let Some(uuid) = &p.planned.partition_uuid {
                sfdisk::set_partition_uuid(device, p.planned.number, uuid)?;
            }
        }
    }

    let _ = udevadm::settle();
    verify_identity(device, snapshot, partitions);
    Ok(())
}

/// Reads the identifiers back and reports drift. Mismatches are warnings;
/// the table itself is sound either way.
fn verify_identity(
    device: &std::path::Path,
    snapshot: &DiskSnapshot,
    partitions: &[BuiltPartition],
) {
    match sfdisk::get_disk_id(device) {
        Ok(Some(actual)) if actual == snapshot.disk_id => {}
        Ok(actual) => warn!(
            "Disk id of '{}' is {} but the source had {}",
            device.display(),
            actual.map_or_else(|| "unset".to_string(), |a| a.to_string()),
            snapshot.disk_id
        ),
        Err(e) => warn!("Could not read back the disk id: {e:#}"),
    }

    if snapshot.label != SfDiskLabel::Gpt {
        return;
    }
    for p in partitions {
        let (Some(expected), Some(node)) = (&p.planned.partition_uuid, &p.node) else {
            continue;
        };
        match blkid::get_partition_uuid(node) {
            Ok(Some(actual)) if actual == *expected => {}
            Ok(actual) => warn!(
                "Partition uuid of '{}' is {} but the source had {expected}",
                node.display(),
                actual.map_or_else(|| "unset".to_string(), |a| a.to_string()),
            ),
            Err(e) => warn!(
                "Could not read back the partition uuid of '{}': {e:#}",
                node.display()
            ),
        }
    }
}

fn align_down(sectors: u64) -> u64 {
    sectors / ALIGNMENT_SECTORS * ALIGNMENT_SECTORS
}

fn align_up(sectors: u64) -> u64 {
    sectors.div_ceil(ALIGNMENT_SECTORS) * ALIGNMENT_SECTORS
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{inspect::tests::record, planner};

    const MIB: u64 = 1024 * 1024;
    const GIB: u64 = 1024 * MIB;

    fn snapshot_of(partitions: Vec<crate::inspect::PartitionRecord>) -> DiskSnapshot {
        DiskSnapshot {
            device: "/dev/loop0".into(),
            label: SfDiskLabel::Gpt,
            disk_id: BlockId::from("3E6494F9-91E1-426B-A25A-0A8101E464A4"),
            capacity_bytes: 16 * GIB,
            sector_size: 512,
            partitions,
        }
    }

    #[test]
    fn test_layout_is_aligned_and_sequential() {
        let snap = snapshot_of(vec![
            record(1, 512 * MIB, true),
            record(3, 4 * GIB, false),
        ]);
        let plan = planner::plan(&snap.partitions, 16 * GIB).unwrap();
        let planned = layout(&snap, &plan);

        assert_eq!(planned.len(), 2);

        // renumbered sequentially regardless of source numbering
        assert_eq!(planned[0].number, 1);
        assert_eq!(planned[1].number, 2);

        assert_eq!(planned[0].start_sector, 2048);
        assert_eq!(planned[0].size_sectors, 512 * MIB / 512);
        assert_eq!(planned[1].start_sector % ALIGNMENT_SECTORS, 0);
        assert_eq!(planned[1].start_sector, 2048 + 512 * MIB / 512);
        assert_eq!(planned[1].end_sector(), planned[1].start_sector + 4 * GIB / 512 - 1);
    }

    #[test]
    fn test_layout_rounds_luks_up() {
        let mut luks = record(1, 0, false);
        luks.fs_type = Some(FsType::Luks);
        luks.size_bytes = 100 * MIB + 512; // one sector past the grid

        let mut plain = record(2, 0, false);
        plain.size_bytes = 100 * MIB + 512;

        let snap = snapshot_of(vec![luks, plain]);
        let plan = planner::plan(&snap.partitions, 16 * GIB).unwrap();
        let planned = layout(&snap, &plan);

        // LUKS rounds up to the next MiB, plain rounds down
        assert_eq!(planned[0].size_sectors, 101 * MIB / 512);
        assert_eq!(planned[1].size_sectors, 100 * MIB / 512);

        // the partition after the rounded-up LUKS still starts aligned
        assert_eq!(planned[1].start_sector % ALIGNMENT_SECTORS, 0);
    }

    #[test]
    fn test_layout_names_default() {
        let mut named = record(1, 8 * MIB, false);
        named.name = Some("rootfs".into());
        let snap = snapshot_of(vec![named, record(2, 8 * MIB, false)]);
        let plan = planner::plan(&snap.partitions, 16 * GIB).unwrap();
        let planned = layout(&snap, &plan);

        assert_eq!(planned[0].name, "rootfs");
        assert_eq!(planned[1].name, "part2");
    }

    #[test]
    fn test_wait_for_node_gives_up() {
        // A node that can never appear exhausts its probe budget
        let node = wait_for_node_with_budget(
            std::path::Path::new("/dev/blockclone-test-missing"),
            1,
            2,
            Duration::ZERO,
        );
        assert!(node.is_none());
    }

    #[test]
    fn test_alignment_helpers() {
        assert_eq!(align_down(2047), 0);
        assert_eq!(align_down(2048), 2048);
        assert_eq!(align_down(4097), 4096);
        assert_eq!(align_up(1), 2048);
        assert_eq!(align_up(2048), 2048);
        assert_eq!(align_up(2049), 4096);
    }
}
