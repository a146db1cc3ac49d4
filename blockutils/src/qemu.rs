use std::path::Path;

use anyhow::{Context, Error};
use serde::Deserialize;
use strum_macros::{Display, EnumString, IntoStaticStr};

use crate::dependencies::Dependency;

/// Disk image formats understood by qemu-img/qemu-nbd.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Deserialize, Display, EnumString, IntoStaticStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ImageFormat {
    Raw,
    Qcow2,
    Vdi,
    Vhdx,
    Vmdk,
    Qed,
    Vpc,
}

impl ImageFormat {
    pub fn name(&self) -> &'static str {
        self.into()
    }
}

/// Subset of `qemu-img info --output=json`.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ImageInfo {
    pub format: ImageFormat,

    #[serde(rename = "virtual-size")]
    pub virtual_size: u64,

    #[serde(rename = "actual-size")]
    pub actual_size: Option<u64>,
}

/// Reads format and sizes of a disk image file.
pub fn image_info(file: &Path) -> Result<ImageInfo, Error> {
    let output = Dependency::QemuImg
        .cmd()
        .arg("info")
        .arg("--output=json")
        .arg(file)
        .output_and_check()
        .context(format!("Failed to inspect image '{}'", file.display()))?;

    parse_image_info(&output)
        .context(format!("Failed to parse image info for '{}'", file.display()))
}

fn parse_image_info(output: &str) -> Result<ImageInfo, Error> {
    serde_json::from_str(output).context("Failed to parse qemu-img output")
}

/// Creates a new image file of the given format and virtual size.
pub fn create_image(file: &Path, format: ImageFormat, size_bytes: u64) -> Result<(), Error> {
    Dependency::QemuImg
        .cmd()
        .arg("create")
        .arg("-f")
        .arg(format.name())
        .arg(file)
        .arg(size_bytes.to_string())
        .run_and_check()
        .context(format!(
            "Failed to create {format} image '{}' of {size_bytes} bytes",
            file.display()
        ))
}

/// Grows (or shrinks, with qemu's own safeguards) an image to `size_bytes`.
pub fn resize_image(file: &Path, format: ImageFormat, size_bytes: u64) -> Result<(), Error> {
    Dependency::QemuImg
        .cmd()
        .arg("resize")
        .arg("-f")
        .arg(format.name())
        .arg(file)
        .arg(size_bytes.to_string())
        .run_and_check()
        .context(format!(
            "Failed to resize image '{}' to {size_bytes} bytes",
            file.display()
        ))
}

/// Loads the nbd kernel module with partition support.
pub fn ensure_nbd_module() -> Result<(), Error> {
    Dependency::Modprobe
        .cmd()
        .arg("nbd")
        .arg("max_part=16")
        .run_and_check()
        .context("Failed to load the nbd kernel module")
}

/// Exposes `file` on the given /dev/nbdX node.
pub fn nbd_connect(device: &Path, file: &Path, format: ImageFormat) -> Result<(), Error> {
    Dependency::QemuNbd
        .cmd()
        .arg(format!("--connect={}", device.display()))
        .arg("--format")
        .arg(format.name())
        .arg(file)
        .run_and_check()
        .context(format!(
            "Failed to connect '{}' to '{}'",
            file.display(),
            device.display()
        ))
}

/// Disconnects a /dev/nbdX node.
pub fn nbd_disconnect(device: &Path) -> Result<(), Error> {
    Dependency::QemuNbd
        .cmd()
        .arg("--disconnect")
        .arg(device)
        .run_and_check()
        .context(format!("Failed to disconnect '{}'", device.display()))
}
