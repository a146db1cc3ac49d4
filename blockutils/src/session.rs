use std::{
    collections::HashSet,
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
    sync::Mutex,
    time::Duration,
};

use anyhow::{anyhow, bail, Context, Error};
use log::{debug, info, warn};
use nix::fcntl::{Flock, FlockArg};
use once_cell::sync::Lazy;

use crate::{
    blockdev, cryptsetup, losetup, lvm, mkswap, mount,
    qemu::{self, ImageFormat},
    repeat, udevadm,
};

/// Number of /dev/nbdX slots the nbd module is loaded with.
const NBD_SLOTS: usize = 16;

/// Connection attempts and the fixed sleep between them.
const CONNECT_ATTEMPTS: u32 = 3;
const CONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Lock file serializing slot selection across concurrent invocations. The
/// loop/NBD slot pool is the one resource genuinely shared between
/// processes, so pick-and-connect must be a single critical section.
const SLOT_LOCK_PATH: &str = "/run/lock/blockclone-session.lock";

/// Backing files with a live session in this process. A second session on
/// the same file would hand out a second device node for the same bytes.
static LIVE_SESSIONS: Lazy<Mutex<HashSet<PathBuf>>> = Lazy::new(|| Mutex::new(HashSet::new()));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionKind {
    Loop,
    Nbd,
}

/// A disk-image file exposed as a kernel block device.
///
/// The session exclusively owns its device node and every layered resource
/// opened under it (LUKS mappings, activated volume groups). Teardown runs
/// on every exit path: call [`BlockSession::disconnect`] to observe errors,
/// or let `Drop` clean up as a last resort.
#[derive(Debug)]
pub struct BlockSession {
    backing_file: PathBuf,
    device: PathBuf,
    format: ImageFormat,
    kind: SessionKind,
    /// Open LUKS mapping names, closed in reverse order on teardown.
    luks_mappings: Vec<String>,
    /// Activated volume groups, deactivated in reverse order on teardown.
    volume_groups: Vec<String>,
    active: bool,
}

impl BlockSession {
    /// Exposes `file` as a block device: loop for raw images, NBD for every
    /// other format. Retries up to 3 times with a 1s pause; a partial
    /// connection is always torn down before an error is returned.
    pub fn connect(file: &Path, format: ImageFormat) -> Result<Self, Error> {
        let backing_file = file
            .canonicalize()
            .context(format!("Failed to resolve image path '{}'", file.display()))?;

        let mut live = LIVE_SESSIONS
            .lock()
            .map_err(|_| anyhow!("Session registry poisoned"))?;
        if live.contains(&backing_file) {
            bail!(
                "A session for '{}' is already connected",
                backing_file.display()
            );
        }

        // Hold the inter-process lock across slot selection and connection
        let _slot_lock = acquire_slot_lock()?;

        let (device, kind) = match format {
            ImageFormat::Raw => (connect_loop(&backing_file)?, SessionKind::Loop),
            _ => (connect_nbd(&backing_file, format)?, SessionKind::Nbd),
        };

        if let Err(e) = udevadm::settle() {
            debug!("udev settle after connect failed: {e:#}");
        }

        live.insert(backing_file.clone());
        info!(
            "Connected '{}' as '{}'",
            backing_file.display(),
            device.display()
        );

        Ok(Self {
            backing_file,
            device,
            format,
            kind,
            luks_mappings: Vec::new(),
            volume_groups: Vec::new(),
            active: true,
        })
    }

    pub fn device(&self) -> &Path {
        &self.device
    }

    pub fn backing_file(&self) -> &Path {
        &self.backing_file
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    /// Registers an open LUKS mapping as owned by this session.
    pub fn adopt_luks_mapping(&mut self, mapping_name: String) {
        self.luks_mappings.push(mapping_name);
    }

    /// Registers an activated volume group as owned by this session.
    pub fn adopt_volume_group(&mut self, vg_name: String) {
        if !self.volume_groups.contains(&vg_name) {
            self.volume_groups.push(vg_name);
        }
    }

    /// Tears the session down, reporting any teardown error. Unconfirmed
    /// final disconnection is logged as a warning, not an error, so a stuck
    /// kernel device cannot fail an otherwise-finished operation.
    pub fn disconnect(mut self) -> Result<(), Error> {
        self.teardown()
    }

    /// Every stage is attempted even when an earlier one fails; the device
    /// must still be detached and the registry entry released. The first
    /// stage error is returned after teardown completes.
    fn teardown(&mut self) -> Result<(), Error> {
        if !self.active {
            return Ok(());
        }
        self.active = false;

        let mut first_error: Option<Error> = None;

        // Unmount everything under the session's device prefix first;
        // nothing layered can close while filesystems are mounted.
        match mount::mounts_under(&self.device) {
            Ok(entries) => {
                for entry in entries {
                    mkswap::swapoff_best_effort(&entry.source);
                    if let Err(e) = mount::umount_with_fallback(&entry.target) {
                        warn!("Failed to unmount '{}': {e:#}", entry.target.display());
                        first_error.get_or_insert(e);
                    }
                }
            }
            Err(e) => {
                warn!(
                    "Could not list mounts under '{}': {e:#}",
                    self.device.display()
                );
                first_error.get_or_insert(e);
            }
        }

        for vg in self.volume_groups.drain(..).rev() {
            if let Err(e) = lvm::deactivate(&vg) {
                warn!("Failed to deactivate volume group '{vg}': {e:#}");
                first_error.get_or_insert(e);
            }
        }

        for mapping in self.luks_mappings.drain(..).rev() {
            if let Err(e) = cryptsetup::close(&mapping) {
                warn!("Failed to close LUKS mapping '{mapping}': {e:#}");
                first_error.get_or_insert(e);
            }
        }

        let detach_result = repeat::with_retries(CONNECT_ATTEMPTS, CONNECT_BACKOFF, |_| {
            match self.kind {
                SessionKind::Loop => losetup::detach(&self.device),
                SessionKind::Nbd => qemu::nbd_disconnect(&self.device),
            }
        });

        if let Err(e) = detach_result {
            warn!(
                "Could not confirm disconnection of '{}' from '{}': {e:#}",
                self.device.display(),
                self.backing_file.display()
            );
        }

        if let Ok(mut live) = LIVE_SESSIONS.lock() {
            live.remove(&self.backing_file);
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                info!("Disconnected '{}'", self.backing_file.display());
                Ok(())
            }
        }
    }
}

impl Drop for BlockSession {
    fn drop(&mut self) {
        if self.active {
            if let Err(e) = self.teardown() {
                warn!(
                    "Teardown of session for '{}' failed: {e:#}",
                    self.backing_file.display()
                );
            }
        }
    }
}

/// Device node of partition `number` on `device`. Devices whose name ends
/// in a digit (loop0, nbd0, nvme0n1) take a `p` separator.
pub fn partition_node(device: &Path, number: usize) -> PathBuf {
    let name = device.to_string_lossy();
    if name.ends_with(|c: char| c.is_ascii_digit()) {
        PathBuf::from(format!("{name}p{number}"))
    } else {
        PathBuf::from(format!("{name}{number}"))
    }
}

fn acquire_slot_lock() -> Result<Flock<File>, Error> {
    let lock_file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(SLOT_LOCK_PATH)
        .context(format!("Failed to open lock file '{SLOT_LOCK_PATH}'"))?;

    Flock::lock(lock_file, FlockArg::LockExclusive)
        .map_err(|(_, errno)| anyhow!("Failed to lock '{SLOT_LOCK_PATH}': {errno}"))
}

fn connect_loop(file: &Path) -> Result<PathBuf, Error> {
    let existing = losetup::find_by_backing_file(file)?;
    if let Some(dev) = existing.first() {
        bail!(
            "'{}' is already attached to '{}'",
            file.display(),
            dev.name.display()
        );
    }

    repeat::with_retries(CONNECT_ATTEMPTS, CONNECT_BACKOFF, |attempt| {
        debug!(
            "Attaching '{}' to a loop device (attempt {attempt})",
            file.display()
        );
        let device = losetup::attach(file)?;

        match verify_readable(&device) {
            Ok(()) => Ok(device),
            Err(e) => {
                // Never leave a half-attached device behind
                if let Err(detach_err) = losetup::detach(&device) {
                    warn!(
                        "Failed to detach unhealthy device '{}': {detach_err:#}",
                        device.display()
                    );
                }
                Err(e)
            }
        }
    })
    .context(format!(
        "Failed to attach '{}' after {CONNECT_ATTEMPTS} attempts",
        file.display()
    ))
}

fn connect_nbd(file: &Path, format: ImageFormat) -> Result<PathBuf, Error> {
    qemu::ensure_nbd_module()?;

    repeat::with_retries(CONNECT_ATTEMPTS, CONNECT_BACKOFF, |attempt| {
        let device = free_nbd_slot()
            .context("No free NBD device slot available")?;
        debug!(
            "Connecting '{}' to '{}' (attempt {attempt})",
            file.display(),
            device.display()
        );

        qemu::nbd_connect(&device, file, format)?;

        match verify_nbd_alive(&device) {
            Ok(()) => Ok(device),
            Err(e) => {
                if let Err(disc_err) = qemu::nbd_disconnect(&device) {
                    warn!(
                        "Failed to disconnect unhealthy device '{}': {disc_err:#}",
                        device.display()
                    );
                }
                Err(e)
            }
        }
    })
    .context(format!(
        "Failed to connect '{}' after {CONNECT_ATTEMPTS} attempts",
        file.display()
    ))
}

/// Finds the first /dev/nbdX slot without a backing server process.
fn free_nbd_slot() -> Result<PathBuf, Error> {
    for index in 0..NBD_SLOTS {
        let device = PathBuf::from(format!("/dev/nbd{index}"));
        if device.exists() && !nbd_pid_path(&device).exists() {
            return Ok(device);
        }
    }
    bail!("All {NBD_SLOTS} NBD slots are in use");
}

fn nbd_pid_path(device: &Path) -> PathBuf {
    let name = device.file_name().unwrap_or_default().to_string_lossy();
    PathBuf::from(format!("/sys/block/{name}/pid"))
}

/// A connection is only live once the kernel reports a readable, nonzero
/// device size.
fn verify_readable(device: &Path) -> Result<(), Error> {
    let size = blockdev::get_size_bytes(device)?;
    if size == 0 {
        bail!("Device '{}' reports zero size", device.display());
    }
    Ok(())
}

fn verify_nbd_alive(device: &Path) -> Result<(), Error> {
    if !nbd_pid_path(device).exists() {
        bail!(
            "No server process backing '{}' after connect",
            device.display()
        );
    }
    verify_readable(device)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_node() {
        assert_eq!(
            partition_node(Path::new("/dev/loop0"), 1),
            PathBuf::from("/dev/loop0p1")
        );
        assert_eq!(
            partition_node(Path::new("/dev/nbd3"), 2),
            PathBuf::from("/dev/nbd3p2")
        );
        assert_eq!(
            partition_node(Path::new("/dev/nvme0n1"), 3),
            PathBuf::from("/dev/nvme0n1p3")
        );
        assert_eq!(
            partition_node(Path::new("/dev/sda"), 2),
            PathBuf::from("/dev/sda2")
        );
    }

    #[test]
    fn test_teardown_runs_every_stage() {
        let backing_file = PathBuf::from("/nonexistent/blockclone-teardown-test.img");
        LIVE_SESSIONS
            .lock()
            .unwrap()
            .insert(backing_file.clone());

        let session = BlockSession {
            backing_file: backing_file.clone(),
            device: PathBuf::from("/dev/blockclone-test-missing"),
            format: ImageFormat::Raw,
            kind: SessionKind::Loop,
            luks_mappings: vec!["blockclone-test-stale-mapping".to_string()],
            volume_groups: Vec::new(),
            active: true,
        };

        // The stale mapping cannot close, but teardown still reaches the
        // detach stage, releases the registry entry, and reports the error
        assert!(session.disconnect().is_err());
        assert!(!LIVE_SESSIONS.lock().unwrap().contains(&backing_file));
    }

    #[test]
    fn test_nbd_pid_path() {
        assert_eq!(
            nbd_pid_path(Path::new("/dev/nbd5")),
            PathBuf::from("/sys/block/nbd5/pid")
        );
    }
}
