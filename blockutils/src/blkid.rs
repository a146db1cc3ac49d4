use std::path::Path;

use anyhow::{Context, Error};

use crate::{dependencies::Dependency, ident::BlockId};

fn probe(device_path: impl AsRef<Path>, tag: &str) -> Result<Option<String>, Error> {
    // blkid exits non-zero when the tag is absent; that is not an error here
    let output = Dependency::Blkid
        .cmd()
        .arg("-o")
        .arg("value")
        .arg("-s")
        .arg(tag)
        .arg(device_path.as_ref())
        .output()
        .context("Failed to execute blkid")?;

    let value = output.output().trim().to_owned();
    if value.is_empty() {
        return Ok(None);
    }
    Ok(Some(value))
}

/// Gets the filesystem type reported by blkid, e.g. "ext4", "crypto_LUKS".
/// Returns None for devices without a recognizable signature.
pub fn get_filesystem_type(device_path: impl AsRef<Path>) -> Result<Option<String>, Error> {
    probe(device_path, "TYPE")
}

/// Gets the filesystem UUID. Returns None when no filesystem UUID is set.
pub fn get_filesystem_uuid(device_path: impl AsRef<Path>) -> Result<Option<BlockId>, Error> {
    Ok(probe(device_path, "UUID")?.map(BlockId::from))
}

/// Gets the partition entry UUID (GPT PARTUUID).
pub fn get_partition_uuid(device_path: impl AsRef<Path>) -> Result<Option<BlockId>, Error> {
    Ok(probe(device_path, "PARTUUID")?.map(BlockId::from))
}
