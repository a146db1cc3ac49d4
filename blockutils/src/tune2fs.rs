use std::path::Path;

use anyhow::{Context, Error};

use crate::{dependencies::Dependency, e2fsck, ident::BlockId};

/// Assigns a filesystem UUID to the ext* filesystem at block_device_path.
pub fn set_uuid(fs_uuid: &BlockId, block_device_path: &Path) -> Result<(), Error> {
    // tune2fs refuses to touch a dirty filesystem, so check it first
    e2fsck::fix(block_device_path)?;

    Dependency::Tune2fs
        .cmd()
        .arg("-U")
        .arg(fs_uuid.to_string())
        .arg(block_device_path)
        .run_and_check()
        .context("Failed to execute tune2fs")
}
