use std::cmp::min;

use log::{debug, info};

use crate::{error::CapacityError, fstype::FsType, inspect::PartitionRecord};

pub const MIB: u64 = 1024 * 1024;

/// Space held back for partition table metadata (GPT headers, alignment
/// slack) when budgeting a destination.
pub const TABLE_RESERVE_BYTES: u64 = 4 * MIB;

/// Byte budget assigned to each source partition, in source table order.
#[derive(Debug, Clone, PartialEq)]
pub struct SizePlan {
    allocations: Vec<u64>,
}

impl SizePlan {
    pub fn allocations(&self) -> &[u64] {
        &self.allocations
    }

    pub fn total_bytes(&self) -> u64 {
        self.allocations.iter().sum()
    }
}

/// Whether a partition keeps its exact source size in every plan. A shrunk
/// ESP does not boot and a truncated LUKS container is unrecoverable.
fn is_preserved(partition: &PartitionRecord) -> bool {
    partition.is_efi || matches!(partition.fs_type, Some(FsType::Luks))
}

/// Plans how much of the destination each source partition receives.
///
/// When everything fits, every partition keeps its source size. When it does
/// not, EFI system and LUKS partitions keep their exact size and the rest
/// shrink proportionally, floored to 1MiB multiples with a 1MiB minimum. The
/// plan total never exceeds the usable destination space.
pub fn plan(
    partitions: &[PartitionRecord],
    destination_capacity: u64,
) -> Result<SizePlan, CapacityError> {
    let usable = destination_capacity.saturating_sub(TABLE_RESERVE_BYTES);
    if usable == 0 {
        return Err(CapacityError::NoUsableSpace {
            capacity_bytes: destination_capacity,
            reserve_bytes: TABLE_RESERVE_BYTES,
        });
    }

    let total: u64 = partitions.iter().map(|p| p.size_bytes).sum();
    if total <= usable {
        debug!("Source partitions ({total} bytes) fit in {usable} usable bytes, keeping sizes");
        return Ok(SizePlan {
            allocations: partitions.iter().map(|p| p.size_bytes).collect(),
        });
    }

    let preserved_total: u64 = partitions
        .iter()
        .filter(|p| is_preserved(p))
        .map(|p| p.size_bytes)
        .sum();
    if preserved_total > usable {
        return Err(CapacityError::PreservedExceedsCapacity {
            required_bytes: preserved_total,
            usable_bytes: usable,
        });
    }

    // total > usable >= preserved_total, so there is at least one byte to
    // shrink
    let shrinkable_total = total - preserved_total;
    let budget = usable - preserved_total;

    info!(
        "Source partitions ({total} bytes) exceed {usable} usable destination bytes, \
         shrinking proportionally"
    );

    let mut allocations: Vec<u64> = partitions
        .iter()
        .map(|p| {
            if is_preserved(p) {
                return p.size_bytes;
            }
            let scaled =
                (p.size_bytes as u128 * budget as u128 / shrinkable_total as u128) as u64;
            (scaled / MIB * MIB).max(MIB)
        })
        .collect();

    // The 1MiB floor can push a tight plan past the budget; shave the excess
    // off the largest shrinkable allocations, a MiB multiple at a time
    let mut planned_total: u64 = allocations.iter().sum();
    while planned_total > usable {
        let excess = planned_total - usable;
        let largest = allocations
            .iter_mut()
            .zip(partitions)
            .filter(|(allocation, p)| !is_preserved(*p) && **allocation > MIB)
            .map(|(allocation, _)| allocation)
            .max_by_key(|allocation| **allocation);
        let Some(largest) = largest else {
            return Err(CapacityError::MinimumsExceedCapacity {
                required_bytes: planned_total,
                usable_bytes: usable,
            });
        };

        let shave = min(*largest - MIB, excess.div_ceil(MIB) * MIB);
        *largest -= shave;
        planned_total -= shave;
    }

    Ok(SizePlan { allocations })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inspect::tests::record;

    const GIB: u64 = 1024 * MIB;

    #[test]
    fn test_identity_when_everything_fits() {
        let parts = [record(1, 512 * MIB, true), record(2, 4 * GIB, false)];
        let plan = plan(&parts, 8 * GIB).unwrap();
        assert_eq!(plan.allocations(), &[512 * MIB, 4 * GIB]);
        assert_eq!(plan.total_bytes(), 512 * MIB + 4 * GIB);
    }

    #[test]
    fn test_reserve_is_held_back() {
        // Exactly capacity-sized content does not fit once the table
        // reserve is subtracted
        let parts = [record(1, 8 * GIB, false)];
        let plan = plan(&parts, 8 * GIB).unwrap();
        assert_eq!(plan.allocations(), &[8 * GIB - 4 * MIB]);
    }

    #[test]
    fn test_proportional_shrink_keeps_ratios() {
        let parts = [record(1, 6 * GIB, false), record(2, 2 * GIB, false)];
        let plan = plan(&parts, 4 * GIB + 4 * MIB).unwrap();

        let allocs = plan.allocations();
        assert_eq!(allocs.len(), 2);
        // 3:1 ratio survives, floored to MiB multiples
        assert_eq!(allocs[0], 3 * GIB);
        assert_eq!(allocs[1], 1 * GIB);
        assert!(plan.total_bytes() <= 4 * GIB);
    }

    #[test]
    fn test_efi_never_shrinks() {
        let parts = [record(1, 512 * MIB, true), record(2, 8 * GIB, false)];
        let plan = plan(&parts, 4 * GIB).unwrap();

        let allocs = plan.allocations();
        assert_eq!(allocs[0], 512 * MIB);
        assert!(allocs[1] < 8 * GIB);
        assert!(allocs[0] + allocs[1] <= 4 * GIB - 4 * MIB);
    }

    #[test]
    fn test_efi_too_large_is_fatal() {
        let parts = [record(1, 2 * GIB, true), record(2, 2 * GIB, false)];
        let err = plan(&parts, 1 * GIB).unwrap_err();
        assert!(matches!(err, CapacityError::PreservedExceedsCapacity { .. }));
    }

    #[test]
    fn test_luks_never_shrinks() {
        let mut luks = record(1, 2 * GIB, false);
        luks.fs_type = Some(FsType::Luks);
        let parts = [luks, record(2, 6 * GIB, false)];

        let plan = plan(&parts, 4 * GIB + 4 * MIB).unwrap();
        assert_eq!(plan.allocations()[0], 2 * GIB);
        assert!(plan.allocations()[1] < 6 * GIB);
        assert!(plan.total_bytes() <= 4 * GIB);
    }

    #[test]
    fn test_luks_too_large_is_fatal() {
        let mut luks = record(1, 2 * GIB, false);
        luks.fs_type = Some(FsType::Luks);
        let parts = [luks, record(2, 1 * GIB, false)];

        let err = plan(&parts, 1 * GIB).unwrap_err();
        assert!(matches!(err, CapacityError::PreservedExceedsCapacity { .. }));
    }

    #[test]
    fn test_floor_excess_is_shaved() {
        // Three partitions floored up to 1MiB overshoot the 8MiB budget;
        // the excess comes out of the largest allocation
        let parts = [
            record(1, 1 * MIB, false),
            record(2, 1 * MIB, false),
            record(3, 1 * MIB, false),
            record(4, 61 * MIB, false),
        ];
        let plan = plan(&parts, 12 * MIB).unwrap();

        assert_eq!(plan.allocations(), &[MIB, MIB, MIB, 5 * MIB]);
        assert!(plan.total_bytes() <= 8 * MIB);
    }

    #[test]
    fn test_minimums_that_cannot_fit_are_fatal() {
        // Six 1MiB partitions cannot fit in 4MiB of usable space at any
        // shrink ratio
        let parts = [
            record(1, MIB, false),
            record(2, MIB, false),
            record(3, MIB, false),
            record(4, MIB, false),
            record(5, MIB, false),
            record(6, MIB, false),
        ];
        let err = plan(&parts, 8 * MIB).unwrap_err();
        assert!(matches!(err, CapacityError::MinimumsExceedCapacity { .. }));
    }

    #[test]
    fn test_minimum_floor() {
        // A tiny partition never shrinks below 1MiB
        let parts = [record(1, 8 * MIB, false), record(2, 8 * GIB, false)];
        let plan = plan(&parts, 1 * GIB).unwrap();
        assert!(plan.allocations()[0] >= MIB);
        assert_eq!(plan.allocations()[0] % MIB, 0);
    }

    #[test]
    fn test_no_usable_space() {
        let parts = [record(1, 8 * MIB, false)];
        let err = plan(&parts, 2 * MIB).unwrap_err();
        assert!(matches!(err, CapacityError::NoUsableSpace { .. }));
    }

    #[test]
    fn test_empty_disk() {
        let plan = plan(&[], 8 * GIB).unwrap();
        assert!(plan.allocations().is_empty());
        assert_eq!(plan.total_bytes(), 0);
    }
}
