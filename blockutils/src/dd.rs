use std::path::Path;

use anyhow::{Context, Error};

use crate::dependencies::Dependency;

/// 1MiB default copy block size.
pub const BLOCK_SIZE: u64 = 1024 * 1024;

/// 512KiB block size used on the single retry after a failed copy.
pub const FALLBACK_BLOCK_SIZE: u64 = 512 * 1024;

/// Copies exactly `count_bytes` from `source` to `destination` in blocks of
/// `block_size` bytes, syncing before dd exits.
pub fn copy_bytes(
    source: &Path,
    destination: &Path,
    count_bytes: u64,
    block_size: u64,
) -> Result<(), Error> {
    Dependency::Dd
        .cmd()
        .arg(format!("if={}", source.display()))
        .arg(format!("of={}", destination.display()))
        .arg(format!("bs={block_size}"))
        .arg(format!("count={count_bytes}"))
        .arg("iflag=count_bytes,fullblock")
        .arg("conv=fsync,nocreat")
        .run_and_check()
        .context(format!(
            "Failed to copy {count_bytes} bytes from '{}' to '{}'",
            source.display(),
            destination.display()
        ))
}
