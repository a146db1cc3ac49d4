use std::path::Path;

use anyhow::{bail, Context, Error};

use crate::{dependencies::Dependency, ident::BlockId};

/// Sets the FAT volume ID (the `XXXX-XXXX` serial blkid reports as UUID).
pub fn set_volume_id(volume_id: &BlockId, device: &Path) -> Result<(), Error> {
    // fatlabel wants the serial as one unseparated hex word
    let serial = volume_id.to_string().replace('-', "");
    if serial.len() != 8 || !serial.chars().all(|c| c.is_ascii_hexdigit()) {
        bail!("'{volume_id}' is not a FAT volume id");
    }

    Dependency::Fatlabel
        .cmd()
        .arg("-i")
        .arg(device)
        .arg(serial)
        .run_and_check()
        .context(format!(
            "Failed to set FAT volume id on '{}'",
            device.display()
        ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_non_serial() {
        // only malformed ids are rejected before reaching fatlabel
        let err = set_volume_id(&BlockId::from("not-a-serial"), Path::new("/dev/null"))
            .unwrap_err();
        assert_eq!(err.to_string(), "'not-a-serial' is not a FAT volume id");

        let err = set_volume_id(
            &BlockId::from("6ba7b810-9dad-11d1-80b4-00c04fd430c8"),
            Path::new("/dev/null"),
        )
        .unwrap_err();
        assert!(err.to_string().ends_with("is not a FAT volume id"));
    }
}
