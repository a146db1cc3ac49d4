use std::path::Path;

use anyhow::{Context, Error};

use crate::{dependencies::Dependency, ident::BlockId};

/// Probes `device` for a LUKS header.
pub fn is_luks(device: &Path) -> Result<bool, Error> {
    let output = Dependency::Cryptsetup
        .cmd()
        .arg("isLuks")
        .arg(device)
        .output()
        .context("Failed to execute cryptsetup")?;

    Ok(output.success())
}

/// Reads the LUKS container UUID.
pub fn luks_uuid(device: &Path) -> Result<BlockId, Error> {
    let output = Dependency::Cryptsetup
        .cmd()
        .arg("luksUUID")
        .arg(device)
        .output_and_check()
        .context(format!(
            "Failed to read LUKS UUID of '{}'",
            device.display()
        ))?;

    Ok(BlockId::from(output.trim()))
}

/// Validates the LUKS header by dumping it. Used to re-check header
/// integrity after a byte copy.
pub fn luks_dump(device: &Path) -> Result<(), Error> {
    Dependency::Cryptsetup
        .cmd()
        .arg("luksDump")
        .arg(device)
        .run_and_check()
        .context(format!(
            "LUKS header validation failed for '{}'",
            device.display()
        ))
}

/// Opens a LUKS container under `mapping_name` using the given key file.
pub fn open(key_file: &Path, device: &Path, mapping_name: &str) -> Result<(), Error> {
    Dependency::Cryptsetup
        .cmd()
        .arg("luksOpen")
        .arg("--key-file")
        .arg(key_file)
        .arg(device)
        .arg(mapping_name)
        .run_and_check()
        .context(format!(
            "Failed to open encrypted device '{}' as '{mapping_name}'",
            device.display()
        ))
}

/// Closes an open LUKS mapping.
pub fn close(mapping_name: &str) -> Result<(), Error> {
    Dependency::Cryptsetup
        .cmd()
        .arg("luksClose")
        .arg(mapping_name)
        .run_and_check()
        .context(format!("Failed to close encrypted volume '{mapping_name}'"))
}

/// Grows an open mapping to fill its (resized) underlying partition.
pub fn resize(mapping_name: &str) -> Result<(), Error> {
    Dependency::Cryptsetup
        .cmd()
        .arg("resize")
        .arg(mapping_name)
        .run_and_check()
        .context(format!("Failed to resize encrypted volume '{mapping_name}'"))
}
