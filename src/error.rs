use std::path::PathBuf;

use thiserror::Error;

/// The destination cannot hold what the source requires.
///
/// Raised during planning, before anything is written.
#[derive(Debug, Error)]
pub enum CapacityError {
    #[error(
        "EFI system and LUKS partitions require {required_bytes} bytes but only \
         {usable_bytes} bytes are usable on the destination; neither is ever shrunk"
    )]
    PreservedExceedsCapacity {
        required_bytes: u64,
        usable_bytes: u64,
    },

    #[error(
        "even at 1MiB minimum sizes the plan needs {required_bytes} bytes but only \
         {usable_bytes} bytes are usable on the destination"
    )]
    MinimumsExceedCapacity {
        required_bytes: u64,
        usable_bytes: u64,
    },

    #[error(
        "destination capacity of {capacity_bytes} bytes does not even cover the \
         {reserve_bytes}-byte partition table reserve"
    )]
    NoUsableSpace {
        capacity_bytes: u64,
        reserve_bytes: u64,
    },
}

/// A disk image could not be exposed as a block device.
#[derive(Debug, Error)]
#[error("failed to expose '{file}' as a block device: {cause:#}")]
pub struct ConnectionError {
    pub file: PathBuf,
    pub cause: anyhow::Error,
}

#[derive(Debug, Error)]
pub enum PartitionTableError {
    /// Table construction failed partway; the destination label may already
    /// be wiped.
    #[error(
        "failed to build the partition table on '{device}' (the destination may be partially \
         wiped): {cause:#}"
    )]
    CreateFailed { device: PathBuf, cause: anyhow::Error },

    #[error(
        "only the last partition can be resized in place; partition {number} of {last} needs \
         an external relocation tool"
    )]
    NotLastPartition { number: usize, last: usize },
}

/// A single partition could not be cloned. Other partitions are unaffected.
#[derive(Debug, Error)]
pub enum CloneError {
    #[error(
        "LUKS container on '{source_device}' spans {source_sectors} sectors but \
         '{destination}' only has {destination_sectors}; refusing to truncate an encrypted \
         payload"
    )]
    LuksDestinationTooSmall {
        source_device: PathBuf,
        source_sectors: u64,
        destination: PathBuf,
        destination_sectors: u64,
    },

    #[error("partition {number} never appeared as a device node on the destination")]
    DeviceNodeMissing { number: usize },

    #[error(
        "failed to clone '{source_device}' to '{destination}' with the {strategy} strategy: \
         {cause:#}"
    )]
    StrategyFailed {
        source_device: PathBuf,
        destination: PathBuf,
        strategy: &'static str,
        cause: anyhow::Error,
    },
}

/// An encrypted device could not be opened with the provided credentials.
#[derive(Debug, Error)]
#[error("failed to open encrypted device '{device}': {cause:#}")]
pub struct CredentialError {
    pub device: PathBuf,
    pub cause: anyhow::Error,
}

/// Top-level failure of a clone or resize run.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Capacity(#[from] CapacityError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    PartitionTable(#[from] PartitionTableError),

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error("none of the {total} partitions could be cloned")]
    AllClonesFailed { total: usize },

    #[error(
        "'{device}' is a physical block device; pass --confirm {token} to allow overwriting it"
    )]
    ConfirmationRequired { device: PathBuf, token: String },

    #[error(
        "shrinking is not supported: '{file}' is {current_bytes} bytes, {requested_bytes} \
         bytes requested"
    )]
    ShrinkUnsupported {
        file: PathBuf,
        current_bytes: u64,
        requested_bytes: u64,
    },

    #[error("failed to {step}: {cause:#}")]
    Step { step: String, cause: anyhow::Error },
}

impl EngineError {
    /// Wraps an underlying failure of the named step.
    pub fn step(step: impl Into<String>, cause: anyhow::Error) -> Self {
        EngineError::Step {
            step: step.into(),
            cause,
        }
    }
}
