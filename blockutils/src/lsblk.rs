use std::path::{Path, PathBuf};

use anyhow::{Context, Error};
use log::warn;
use serde::Deserialize;

use crate::dependencies::Dependency;

const LSBLK_COLUMNS: &str = "NAME,SIZE,TYPE,MODEL,FSTYPE,PKNAME";

#[derive(Deserialize, Debug, Default, Clone, PartialEq)]
pub struct LsBlkOutput {
    pub blockdevices: Vec<BlockDevice>,
}

#[derive(Deserialize, Debug, Default, Clone, PartialEq)]
pub struct BlockDevice {
    pub name: PathBuf,
    pub size: u64,
    #[serde(rename = "type")]
    pub blkdev_type: String,
    pub model: Option<String>,
    pub fstype: Option<String>,
    #[serde(rename = "pkname")]
    pub parent_kernel_name: Option<PathBuf>,
    pub children: Option<Vec<BlockDevice>>,
}

impl BlockDevice {
    pub fn is_disk(&self) -> bool {
        self.blkdev_type == "disk"
    }

    pub fn is_partition(&self) -> bool {
        self.blkdev_type == "part"
    }
}

fn base_cmd() -> crate::dependencies::Command {
    let mut cmd = Dependency::Lsblk.cmd();
    cmd.arg("--json")
        .arg("--bytes")
        .arg("--paths")
        .arg("--output")
        .arg(LSBLK_COLUMNS);
    cmd
}

/// Lists the metadata of a single device (and its children).
pub fn get(device_path: impl AsRef<Path>) -> Result<Vec<BlockDevice>, Error> {
    let result = base_cmd()
        .arg(device_path.as_ref())
        .output_and_check()
        .context("Failed to execute lsblk")?;

    let parsed = parse_lsblk_output(&result);
    if parsed.is_err() {
        warn!("lsblk output: {}", result);
    }

    parsed
}

/// Lists every disk-type block device on the system.
pub fn list_disks() -> Result<Vec<BlockDevice>, Error> {
    let result = base_cmd()
        .output_and_check()
        .context("Failed to execute lsblk")?;

    Ok(parse_lsblk_output(&result)?
        .into_iter()
        .filter(BlockDevice::is_disk)
        .collect())
}

/// Whether `device_path` currently resolves to a block device node.
pub fn node_exists(device_path: impl AsRef<Path>) -> bool {
    base_cmd().arg(device_path.as_ref()).output().is_ok_and(|o| o.success())
}

fn parse_lsblk_output(output: &str) -> Result<Vec<BlockDevice>, Error> {
    let parsed: LsBlkOutput =
        serde_json::from_str(output).context("Failed to parse lsblk output")?;

    Ok(parsed.blockdevices)
}
