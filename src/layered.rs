use std::{
    fs,
    io::{self, BufRead, Write},
    path::{Path, PathBuf},
    process,
    sync::atomic::{AtomicU64, Ordering},
};

use anyhow::{Context, Error};
use log::{debug, info};
use tempfile::NamedTempFile;

use blockutils::{cryptsetup, lvm, session::BlockSession, udevadm};

static MAPPING_SEQ: AtomicU64 = AtomicU64::new(0);

/// Supplies passphrases for encrypted devices.
pub trait CredentialSource {
    fn passphrase(&self, device: &Path) -> Result<Vec<u8>, Error>;
}

/// Reads the passphrase from a key file, bytes taken verbatim.
pub struct KeyFile(pub PathBuf);

impl CredentialSource for KeyFile {
    fn passphrase(&self, _device: &Path) -> Result<Vec<u8>, Error> {
        fs::read(&self.0).context(format!("Failed to read key file '{}'", self.0.display()))
    }
}

/// Prompts on the terminal, reading one line from stdin.
pub struct Prompt;

impl CredentialSource for Prompt {
    fn passphrase(&self, device: &Path) -> Result<Vec<u8>, Error> {
        eprint!("Passphrase for '{}': ", device.display());
        io::stderr().flush().context("Failed to flush stderr")?;

        let mut line = String::new();
        io::stdin()
            .lock()
            .read_line(&mut line)
            .context("Failed to read passphrase from stdin")?;

        Ok(line.trim_end_matches(['\r', '\n']).as_bytes().to_vec())
    }
}

/// Opens a LUKS container and hands the mapping to the session for teardown.
/// Returns the /dev/mapper path of the opened payload.
pub fn open_luks(
    session: &mut BlockSession,
    device: &Path,
    credentials: &dyn CredentialSource,
) -> Result<PathBuf, crate::error::CredentialError> {
    open_luks_inner(session, device, credentials).map_err(|cause| {
        crate::error::CredentialError {
            device: device.to_path_buf(),
            cause,
        }
    })
}

fn open_luks_inner(
    session: &mut BlockSession,
    device: &Path,
    credentials: &dyn CredentialSource,
) -> Result<PathBuf, Error> {
    anyhow::ensure!(
        cryptsetup::is_luks(device)?,
        "'{}' does not carry a LUKS header",
        device.display()
    );

    let mapping = mapping_name(process::id(), MAPPING_SEQ.fetch_add(1, Ordering::Relaxed));
    let secret = credentials.passphrase(device)?;
    let key_file = write_key_file(&secret)?;

    cryptsetup::open(key_file.path(), device, &mapping)?;
    session.adopt_luks_mapping(mapping.clone());

    let payload = PathBuf::from(format!("/dev/mapper/{mapping}"));
    info!(
        "Opened encrypted device '{}' as '{}'",
        device.display(),
        payload.display()
    );
    Ok(payload)
}

/// Activates the volume group backed by `device`, if there is one, and
/// returns its logical volumes. The session owns the deactivation.
pub fn resolve_volume_group(
    session: &mut BlockSession,
    device: &Path,
) -> Result<Vec<lvm::LogicalVolume>, Error> {
    let Some(vg_name) = lvm::volume_group_of(device)? else {
        return Ok(Vec::new());
    };

    debug!(
        "'{}' is a physical volume of '{vg_name}', activating",
        device.display()
    );
    lvm::activate(&vg_name)?;
    let _ = udevadm::settle();

    let volumes = lvm::logical_volumes(&vg_name)?;
    session.adopt_volume_group(vg_name);
    Ok(volumes)
}

/// Process-unique device-mapper name, so concurrent runs and repeated opens
/// never collide.
fn mapping_name(pid: u32, seq: u64) -> String {
    format!("blockclone-{pid}-{seq}")
}

/// Passphrases pass through a private temporary file; the command runner has
/// no stdin plumbing and the file never outlives the open call.
fn write_key_file(secret: &[u8]) -> Result<NamedTempFile, Error> {
    use std::os::unix::fs::PermissionsExt;

    let mut file = tempfile::Builder::new()
        .prefix("blockclone-key-")
        .tempfile()
        .context("Failed to create temporary key file")?;

    file.as_file()
        .set_permissions(fs::Permissions::from_mode(0o600))
        .context("Failed to restrict key file permissions")?;

    file.write_all(secret)
        .and_then(|_| file.flush())
        .context("Failed to write temporary key file")?;

    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapping_name() {
        assert_eq!(mapping_name(1234, 0), "blockclone-1234-0");
        assert_ne!(mapping_name(1234, 0), mapping_name(1234, 1));
    }

    #[test]
    fn test_key_file_source() {
        let mut backing = NamedTempFile::new().unwrap();
        backing.write_all(b"hunter2\n").unwrap();
        backing.flush().unwrap();

        let source = KeyFile(backing.path().to_path_buf());
        // key file bytes are not trimmed; trailing newlines are meaningful
        assert_eq!(
            source.passphrase(Path::new("/dev/loop0p2")).unwrap(),
            b"hunter2\n"
        );
    }

    #[test]
    fn test_key_file_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let file = write_key_file(b"secret").unwrap();
        let mode = file.as_file().metadata().unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(fs::read(file.path()).unwrap(), b"secret");
    }
}
