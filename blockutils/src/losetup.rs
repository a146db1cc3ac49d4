use std::path::{Path, PathBuf};

use anyhow::{Context, Error};
use serde::Deserialize;

use crate::dependencies::Dependency;

#[derive(Debug, Deserialize)]
struct LosetupOutput {
    #[serde(default)]
    loopdevices: Vec<LoopDevice>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LoopDevice {
    pub name: PathBuf,

    #[serde(rename = "back-file")]
    pub back_file: Option<PathBuf>,
}

/// Attaches `file` to a free loop device with partition scanning enabled,
/// returning the chosen device node.
pub fn attach(file: &Path) -> Result<PathBuf, Error> {
    let output = Dependency::Losetup
        .cmd()
        .arg("--find")
        .arg("--show")
        .arg("--partscan")
        .arg(file)
        .output_and_check()
        .context(format!("Failed to attach '{}'", file.display()))?;

    let node = output.trim();
    if node.is_empty() {
        anyhow::bail!(
            "losetup reported no device for '{}'",
            file.display()
        );
    }
    Ok(PathBuf::from(node))
}

/// Detaches a loop device.
pub fn detach(device: &Path) -> Result<(), Error> {
    Dependency::Losetup
        .cmd()
        .arg("--detach")
        .arg(device)
        .run_and_check()
        .context(format!("Failed to detach '{}'", device.display()))
}

/// Lists all current loop devices with their backing files.
pub fn list() -> Result<Vec<LoopDevice>, Error> {
    let output = Dependency::Losetup
        .cmd()
        .arg("--list")
        .arg("--json")
        .arg("--output")
        .arg("NAME,BACK-FILE")
        .output_and_check()
        .context("Failed to list loop devices")?;

    parse_losetup_output(&output)
}

/// Finds the loop devices currently backed by `file`.
pub fn find_by_backing_file(file: &Path) -> Result<Vec<LoopDevice>, Error> {
    let canonical = file.canonicalize().unwrap_or_else(|_| file.to_path_buf());
    Ok(list()?
        .into_iter()
        .filter(|dev| dev.back_file.as_deref() == Some(canonical.as_path()))
        .collect())
}

fn parse_losetup_output(output: &str) -> Result<Vec<LoopDevice>, Error> {
    if output.trim().is_empty() {
        // losetup prints nothing at all when no loop devices exist
        return Ok(Vec::new());
    }

    Ok(serde_json::from_str::<LosetupOutput>(output)
        .context("Failed to parse losetup output")?
        .loopdevices)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_losetup_output() {
        let output = indoc::indoc!(
            r#"
            {
               "loopdevices": [
                  {
                     "name": "/dev/loop0",
                     "back-file": "/var/lib/images/test.raw"
                  },{
                     "name": "/dev/loop7",
                     "back-file": null
                  }
               ]
            }
        "#
        );

        let devices = parse_losetup_output(output).unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].name, PathBuf::from("/dev/loop0"));
        assert_eq!(
            devices[0].back_file,
            Some(PathBuf::from("/var/lib/images/test.raw"))
        );
        assert_eq!(devices[1].back_file, None);

        assert!(parse_losetup_output("").unwrap().is_empty());
        assert!(parse_losetup_output("not json").is_err());
    }
}
