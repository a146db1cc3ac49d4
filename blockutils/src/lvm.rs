use std::path::{Path, PathBuf};

use anyhow::{Context, Error};
use serde::Deserialize;

use crate::dependencies::Dependency;

#[derive(Debug, Deserialize)]
struct LvmReportOutput<T> {
    report: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct PvReport {
    #[serde(default)]
    pv: Vec<PhysicalVolume>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct PhysicalVolume {
    pub pv_name: PathBuf,
    pub vg_name: String,
}

#[derive(Debug, Deserialize)]
struct LvReport {
    #[serde(default)]
    lv: Vec<LogicalVolume>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LogicalVolume {
    pub lv_name: String,
    pub vg_name: String,
    pub lv_size: String,
}

impl LogicalVolume {
    /// Device-mapper path of the logical volume.
    pub fn path(&self) -> PathBuf {
        PathBuf::from(format!("/dev/{}/{}", self.vg_name, self.lv_name))
    }
}

/// Reports the volume group a device belongs to, if any.
pub fn volume_group_of(device: &Path) -> Result<Option<String>, Error> {
    // pvs exits non-zero when the device is not a PV; only its output matters
    let output = Dependency::Pvs
        .cmd()
        .arg("--reportformat")
        .arg("json")
        .arg("--options")
        .arg("pv_name,vg_name")
        .arg(device)
        .output()
        .context("Failed to execute pvs")?;

    if !output.success() {
        return Ok(None);
    }

    let vgs = parse_pvs_output(&output.output())?;
    Ok(vgs.into_iter().next().map(|pv| pv.vg_name).filter(|vg| !vg.is_empty()))
}

/// Lists the logical volumes of a volume group.
pub fn logical_volumes(vg_name: &str) -> Result<Vec<LogicalVolume>, Error> {
    let output = Dependency::Lvs
        .cmd()
        .arg("--reportformat")
        .arg("json")
        .arg("--units")
        .arg("b")
        .arg("--options")
        .arg("lv_name,vg_name,lv_size")
        .arg(vg_name)
        .output_and_check()
        .context(format!("Failed to list logical volumes of '{vg_name}'"))?;

    parse_lvs_output(&output)
}

/// Activates all logical volumes of a volume group.
pub fn activate(vg_name: &str) -> Result<(), Error> {
    Dependency::Vgchange
        .cmd()
        .arg("--activate")
        .arg("y")
        .arg(vg_name)
        .run_and_check()
        .context(format!("Failed to activate volume group '{vg_name}'"))
}

/// Deactivates all logical volumes of a volume group.
pub fn deactivate(vg_name: &str) -> Result<(), Error> {
    Dependency::Vgchange
        .cmd()
        .arg("--activate")
        .arg("n")
        .arg(vg_name)
        .run_and_check()
        .context(format!("Failed to deactivate volume group '{vg_name}'"))
}

fn parse_pvs_output(output: &str) -> Result<Vec<PhysicalVolume>, Error> {
    let parsed: LvmReportOutput<PvReport> =
        serde_json::from_str(output).context("Failed to parse pvs output")?;

    Ok(parsed.report.into_iter().flat_map(|r| r.pv).collect())
}

fn parse_lvs_output(output: &str) -> Result<Vec<LogicalVolume>, Error> {
    let parsed: LvmReportOutput<LvReport> =
        serde_json::from_str(output).context("Failed to parse lvs output")?;

    Ok(parsed.report.into_iter().flat_map(|r| r.lv).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pvs_output() {
        let output = indoc::indoc!(
            r#"
            {
                "report": [
                    {
                        "pv": [
                            {"pv_name":"/dev/nbd0p3", "vg_name":"vg_system"}
                        ]
                    }
                ]
            }
        "#
        );

        let pvs = parse_pvs_output(output).unwrap();
        assert_eq!(pvs.len(), 1);
        assert_eq!(pvs[0].pv_name, PathBuf::from("/dev/nbd0p3"));
        assert_eq!(pvs[0].vg_name, "vg_system");

        assert!(parse_pvs_output(r#"{"report": []}"#).unwrap().is_empty());
    }

    #[test]
    fn test_parse_lvs_output() {
        let output = indoc::indoc!(
            r#"
            {
                "report": [
                    {
                        "lv": [
                            {"lv_name":"root", "vg_name":"vg_system", "lv_size":"32212254720B"},
                            {"lv_name":"home", "vg_name":"vg_system", "lv_size":"107374182400B"}
                        ]
                    }
                ]
            }
        "#
        );

        let lvs = parse_lvs_output(output).unwrap();
        assert_eq!(lvs.len(), 2);
        assert_eq!(lvs[0].lv_name, "root");
        assert_eq!(lvs[0].path(), PathBuf::from("/dev/vg_system/root"));
        assert_eq!(lvs[1].lv_size, "107374182400B");
    }
}
