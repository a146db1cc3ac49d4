use std::path::{Path, PathBuf};

use anyhow::{Context, Error};
use log::{debug, warn};
use serde::Deserialize;

use crate::dependencies::Dependency;

#[derive(Debug, Deserialize)]
struct FindMntOutput {
    #[serde(default)]
    filesystems: Vec<MountEntry>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct MountEntry {
    pub target: PathBuf,
    pub source: PathBuf,
}

/// Lists every mount whose source device starts with `device_prefix`.
///
/// For a session on /dev/nbd0 this finds /dev/nbd0p1, /dev/nbd0p2 mounts as
/// well as the device itself.
pub fn mounts_under(device_prefix: &Path) -> Result<Vec<MountEntry>, Error> {
    // findmnt exits non-zero when there are no mounts at all; treat that as
    // an empty listing
    let output = Dependency::Findmnt
        .cmd()
        .arg("--json")
        .arg("--list")
        .arg("--output")
        .arg("TARGET,SOURCE")
        .output()
        .context("Failed to execute findmnt")?;

    if !output.success() {
        return Ok(Vec::new());
    }

    let prefix = device_prefix.to_string_lossy().into_owned();
    Ok(parse_findmnt_output(&output.output())?
        .into_iter()
        .filter(|entry| entry.source.to_string_lossy().starts_with(&prefix))
        .collect())
}

/// Mounts a block device on `mount_dir`.
pub fn mount(device: &Path, mount_dir: &Path) -> Result<(), Error> {
    Dependency::Mount
        .cmd()
        .arg(device)
        .arg(mount_dir)
        .run_and_check()
        .context(format!(
            "Failed to mount '{}' on '{}'",
            device.display(),
            mount_dir.display()
        ))
}

/// Unmounts `target`, escalating through the plain → forced → lazy chain.
pub fn umount_with_fallback(target: &Path) -> Result<(), Error> {
    let plain = Dependency::Umount.cmd().arg(target).run_and_check();
    if plain.is_ok() {
        return Ok(());
    }
    debug!(
        "Plain unmount of '{}' failed, retrying forced",
        target.display()
    );

    let forced = Dependency::Umount
        .cmd()
        .arg("--force")
        .arg(target)
        .run_and_check();
    if forced.is_ok() {
        return Ok(());
    }
    warn!(
        "Forced unmount of '{}' failed, falling back to lazy unmount",
        target.display()
    );

    Dependency::Umount
        .cmd()
        .arg("--lazy")
        .arg(target)
        .run_and_check()
        .context(format!("Failed to unmount '{}'", target.display()))
}

fn parse_findmnt_output(output: &str) -> Result<Vec<MountEntry>, Error> {
    Ok(serde_json::from_str::<FindMntOutput>(output)
        .context("Failed to parse findmnt output")?
        .filesystems)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_findmnt_output() {
        let output = indoc::indoc!(
            r#"
            {
               "filesystems": [
                  {
                     "target": "/",
                     "source": "/dev/sda2"
                  },{
                     "target": "/boot/efi",
                     "source": "/dev/sda1"
                  },{
                     "target": "/mnt/scratch",
                     "source": "/dev/nbd0p1"
                  }
               ]
            }
        "#
        );

        let mounts = parse_findmnt_output(output).unwrap();
        assert_eq!(mounts.len(), 3);
        assert_eq!(mounts[0].target, PathBuf::from("/"));
        assert_eq!(mounts[2].source, PathBuf::from("/dev/nbd0p1"));

        // prefix filtering mirrors mounts_under()
        let under_nbd0: Vec<_> = mounts
            .into_iter()
            .filter(|e| e.source.to_string_lossy().starts_with("/dev/nbd0"))
            .collect();
        assert_eq!(under_nbd0.len(), 1);
        assert_eq!(under_nbd0[0].target, PathBuf::from("/mnt/scratch"));
    }
}
