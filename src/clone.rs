use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use log::{info, warn};

use blockutils::{
    blockdev,
    qemu::{self, ImageFormat},
    repeat,
    session::BlockSession,
    udevadm,
};

use crate::{
    error::{CloneError, ConnectionError, EngineError},
    inspect, planner,
    strategy::{self, CloneOperation},
    table,
};

/// Attempts per partition before giving up on it. A failed partition never
/// aborts the run; the summary carries the outcome.
const CLONE_ATTEMPTS: u32 = 2;
const CLONE_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub struct CloneRequest {
    pub source: PathBuf,
    pub destination: PathBuf,

    /// Format override for image files; otherwise probed (source) or derived
    /// from the file extension (destination created from scratch).
    pub image_format: Option<ImageFormat>,

    /// Virtual size of a destination image created from scratch. Defaults to
    /// the source capacity.
    pub new_image_size: Option<u64>,

    /// Destination device name, spelled out to allow overwriting a physical
    /// block device.
    pub confirm: Option<String>,
}

#[derive(Debug)]
pub struct PartitionReport {
    /// Destination partition number.
    pub number: usize,
    pub source: PathBuf,
    /// Strategy that succeeded, or why the partition was skipped.
    pub outcome: Result<&'static str, CloneError>,
}

#[derive(Debug)]
pub struct CloneSummary {
    pub reports: Vec<PartitionReport>,
}

impl CloneSummary {
    pub fn cloned(&self) -> usize {
        self.reports.iter().filter(|r| r.outcome.is_ok()).count()
    }

    pub fn total(&self) -> usize {
        self.reports.len()
    }
}

/// Clones every partition of the source onto the destination: plan sizes,
/// rebuild the table, then copy partition by partition.
///
/// Sessions for image files are torn down on every exit path.
pub fn run(request: &CloneRequest) -> Result<CloneSummary, EngineError> {
    let mut source_session: Option<BlockSession> = None;
    let source_device = resolve_source(request, &mut source_session)?;
    let source_capacity = blockdev::get_size_bytes(&source_device)
        .map_err(|e| EngineError::step("read the source capacity", e))?;

    let mut destination_session: Option<BlockSession> = None;
    let destination_device =
        resolve_destination(request, source_capacity, &mut destination_session)?;

    let snapshot = inspect::snapshot(&source_device)
        .map_err(|e| EngineError::step("inspect the source partition table", e))?;

    let summary = if snapshot.partitions.is_empty() {
        info!("'{}' has no partitions, nothing to clone", source_device.display());
        CloneSummary { reports: Vec::new() }
    } else {
        let capacity = blockdev::get_size_bytes(&destination_device)
            .map_err(|e| EngineError::step("read the destination capacity", e))?;

        let plan = planner::plan(&snapshot.partitions, capacity)?;
        let planned = table::layout(&snapshot, &plan);
        let built = table::build(&destination_device, &snapshot, planned)?;

        let reports = clone_partitions(&snapshot, &built);
        CloneSummary { reports }
    };

    let _ = udevadm::settle();
    disconnect(source_session);
    disconnect(destination_session);

    if summary.total() > 0 && summary.cloned() == 0 {
        return Err(EngineError::AllClonesFailed {
            total: summary.total(),
        });
    }

    info!(
        "Cloned {}/{} partitions from '{}' to '{}'",
        summary.cloned(),
        summary.total(),
        request.source.display(),
        request.destination.display()
    );
    Ok(summary)
}

fn clone_partitions(
    snapshot: &inspect::DiskSnapshot,
    built: &table::BuiltTable,
) -> Vec<PartitionReport> {
    built
        .partitions
        .iter()
        .map(|built_partition| {
            let record = &snapshot.partitions[built_partition.planned.source_index];

            let outcome = match &built_partition.node {
                None => Err(CloneError::DeviceNodeMissing {
                    number: built_partition.planned.number,
                }),
                Some(node) => {
                    let op = CloneOperation {
                        source: record,
                        destination: node,
                        destination_bytes: built_partition.planned.size_bytes(),
                    };
                    repeat::with_retries(CLONE_ATTEMPTS, CLONE_BACKOFF, |_| {
                        strategy::execute(&op)
                    })
                }
            };

            if let Err(e) = &outcome {
                warn!(
                    "Partition {} was not cloned: {e}",
                    built_partition.planned.number
                );
            }

            PartitionReport {
                number: built_partition.planned.number,
                source: record.device_path.clone(),
                outcome,
            }
        })
        .collect()
}

fn resolve_source(
    request: &CloneRequest,
    session: &mut Option<BlockSession>,
) -> Result<PathBuf, EngineError> {
    if inspect::is_block_device(&request.source) {
        return Ok(request.source.clone());
    }

    let format = image_format(&request.source, request.image_format)
        .map_err(|e| EngineError::step("probe the source image", e))?;

    let connected =
        BlockSession::connect(&request.source, format).map_err(|cause| ConnectionError {
            file: request.source.clone(),
            cause,
        })?;
    let device = connected.device().to_path_buf();
    *session = Some(connected);
    Ok(device)
}

fn resolve_destination(
    request: &CloneRequest,
    source_capacity: u64,
    session: &mut Option<BlockSession>,
) -> Result<PathBuf, EngineError> {
    let destination = &request.destination;

    if inspect::is_block_device(destination) {
        let token = destination
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if request.confirm.as_deref() != Some(token.as_str()) {
            return Err(EngineError::ConfirmationRequired {
                device: destination.clone(),
                token,
            });
        }
        info!(
            "Confirmed destructive write to physical device '{}'",
            destination.display()
        );
        return Ok(destination.clone());
    }

    let format = if destination.exists() {
        image_format(destination, request.image_format)
            .map_err(|e| EngineError::step("probe the destination image", e))?
    } else {
        let format = request
            .image_format
            .unwrap_or_else(|| format_from_extension(destination));
        let size = request.new_image_size.unwrap_or(source_capacity);
        info!(
            "Creating {format} destination image '{}' of {size} bytes",
            destination.display()
        );
        qemu::create_image(destination, format, size)
            .map_err(|e| EngineError::step("create the destination image", e))?;
        format
    };

    let connected = BlockSession::connect(destination, format).map_err(|cause| ConnectionError {
        file: destination.clone(),
        cause,
    })?;
    let device = connected.device().to_path_buf();
    *session = Some(connected);
    Ok(device)
}

fn image_format(file: &Path, requested: Option<ImageFormat>) -> Result<ImageFormat, anyhow::Error> {
    match requested {
        Some(format) => Ok(format),
        None => Ok(qemu::image_info(file)?.format),
    }
}

/// Best-effort format guess for an image that does not exist yet.
fn format_from_extension(path: &Path) -> ImageFormat {
    path.extension()
        .and_then(|ext| ext.to_str())
        .and_then(|ext| ext.parse().ok())
        .unwrap_or(ImageFormat::Raw)
}

fn disconnect(session: Option<BlockSession>) {
    if let Some(session) = session {
        if let Err(e) = session.disconnect() {
            warn!("Session teardown reported: {e:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_extension() {
        assert_eq!(format_from_extension(Path::new("a.qcow2")), ImageFormat::Qcow2);
        assert_eq!(format_from_extension(Path::new("a.vhdx")), ImageFormat::Vhdx);
        assert_eq!(format_from_extension(Path::new("a.vmdk")), ImageFormat::Vmdk);
        // anything unrecognized is treated as raw
        assert_eq!(format_from_extension(Path::new("a.img")), ImageFormat::Raw);
        assert_eq!(format_from_extension(Path::new("disk")), ImageFormat::Raw);
    }

    #[test]
    fn test_summary_counts() {
        let summary = CloneSummary {
            reports: vec![
                PartitionReport {
                    number: 1,
                    source: "/dev/loop0p1".into(),
                    outcome: Ok("ext"),
                },
                PartitionReport {
                    number: 2,
                    source: "/dev/loop0p2".into(),
                    outcome: Err(CloneError::DeviceNodeMissing { number: 2 }),
                },
            ],
        };
        assert_eq!(summary.total(), 2);
        assert_eq!(summary.cloned(), 1);
    }
}
