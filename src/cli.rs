use std::path::PathBuf;

use clap::{Parser, Subcommand};
use log::LevelFilter;

use blockutils::qemu::ImageFormat;

#[derive(Parser)]
#[command(
    name = "blockclone",
    about = "Partition-aware cloning and resizing of disk images and block devices",
    version
)]
pub struct Cli {
    /// Terminal log verbosity (off, error, warn, info, debug, trace).
    #[arg(short, long, global = true, default_value = "info")]
    pub verbosity: LevelFilter,

    /// Append-only JSON-lines log file recording every external command.
    #[arg(long, global = true, default_value = "/var/log/blockclone.log")]
    pub log_file: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List disk-type block devices on this system.
    List,

    /// Print the partition layout of a disk image or block device.
    Inspect {
        /// Disk image file or block device.
        target: PathBuf,

        /// Image format override; otherwise probed from the file.
        #[arg(long)]
        format: Option<ImageFormat>,

        /// Emit the snapshot as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Clone every partition of a source onto a destination.
    Clone {
        /// Source disk image or block device.
        source: PathBuf,

        /// Destination image (created if missing) or block device.
        destination: PathBuf,

        /// Image format override for image files.
        #[arg(long)]
        format: Option<ImageFormat>,

        /// Virtual size in bytes for a destination image created from
        /// scratch. Defaults to the source capacity.
        #[arg(long)]
        new_image_size: Option<u64>,

        /// Destination device name (e.g. "sdb"), spelled out to confirm a
        /// destructive write to a physical device.
        #[arg(long)]
        confirm: Option<String>,
    },

    /// Grow a disk image and its last partition to a new virtual size.
    Resize {
        /// Disk image file.
        file: PathBuf,

        /// New virtual size in bytes.
        new_size: u64,

        /// Partition number expected to grow; must be the last partition.
        #[arg(long)]
        partition: Option<usize>,

        /// Keep a timestamped copy of the image before touching it.
        #[arg(long)]
        backup: bool,

        /// Read the LUKS passphrase from this file instead of prompting.
        #[arg(long)]
        key_file: Option<PathBuf>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();

        let cli = Cli::parse_from(["blockclone", "list"]);
        assert_eq!(cli.verbosity, LevelFilter::Info);
        assert!(matches!(cli.command, Commands::List));

        let cli = Cli::parse_from([
            "blockclone",
            "-v",
            "debug",
            "clone",
            "source.qcow2",
            "/dev/sdb",
            "--confirm",
            "sdb",
        ]);
        assert_eq!(cli.verbosity, LevelFilter::Debug);
        match cli.command {
            Commands::Clone {
                source,
                destination,
                confirm,
                format,
                new_image_size,
            } => {
                assert_eq!(source, PathBuf::from("source.qcow2"));
                assert_eq!(destination, PathBuf::from("/dev/sdb"));
                assert_eq!(confirm.as_deref(), Some("sdb"));
                assert_eq!(format, None);
                assert_eq!(new_image_size, None);
            }
            _ => panic!("wrong subcommand"),
        }
    }

    #[test]
    fn test_resize_args() {
        let cli = Cli::parse_from([
            "blockclone",
            "resize",
            "vm.vhdx",
            "32212254720",
            "--backup",
            "--key-file",
            "/root/luks.key",
        ]);
        match cli.command {
            Commands::Resize {
                file,
                new_size,
                partition,
                backup,
                key_file,
            } => {
                assert_eq!(file, PathBuf::from("vm.vhdx"));
                assert_eq!(new_size, 32212254720);
                assert_eq!(partition, None);
                assert!(backup);
                assert_eq!(key_file, Some(PathBuf::from("/root/luks.key")));
            }
            _ => panic!("wrong subcommand"),
        }
    }

    #[test]
    fn test_image_format_value() {
        let cli = Cli::parse_from(["blockclone", "inspect", "disk.img", "--format", "qcow2"]);
        match cli.command {
            Commands::Inspect { format, json, .. } => {
                assert_eq!(format, Some(ImageFormat::Qcow2));
                assert!(!json);
            }
            _ => panic!("wrong subcommand"),
        }
    }
}
