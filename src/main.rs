use std::process::ExitCode;

use anyhow::Error;
use clap::Parser;
use log::error;

use blockclone::{
    cli::{Cli, Commands},
    clone::{self, CloneRequest},
    inspect::{self, human_size, DiskSnapshot},
    logging, resize,
    resize::ResizeRequest,
};
use blockutils::lsblk;

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = logging::init(cli.verbosity, &cli.log_file) {
        eprintln!("Failed to initialize logging: {e:#}");
        return ExitCode::FAILURE;
    }

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), Error> {
    match cli.command {
        Commands::List => list_disks(),

        Commands::Inspect {
            target,
            format,
            json,
        } => {
            let snapshot = inspect::inspect_target(&target, format)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                print_snapshot(&snapshot);
            }
            Ok(())
        }

        Commands::Clone {
            source,
            destination,
            format,
            new_image_size,
            confirm,
        } => {
            let summary = clone::run(&CloneRequest {
                source,
                destination,
                image_format: format,
                new_image_size,
                confirm,
            })?;

            for report in &summary.reports {
                match &report.outcome {
                    Ok(strategy) => println!(
                        "partition {}: cloned from {} ({strategy})",
                        report.number,
                        report.source.display()
                    ),
                    Err(e) => println!("partition {}: FAILED: {e}", report.number),
                }
            }
            println!("{}/{} partitions cloned", summary.cloned(), summary.total());
            Ok(())
        }

        Commands::Resize {
            file,
            new_size,
            partition,
            backup,
            key_file,
        } => {
            resize::run(&ResizeRequest {
                file,
                new_size,
                partition,
                backup,
                key_file,
            })?;
            Ok(())
        }
    }
}

fn list_disks() -> Result<(), Error> {
    for disk in lsblk::list_disks()? {
        println!(
            "{:<20} {:>10}  {}",
            disk.name.display(),
            human_size(disk.size),
            disk.model.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

fn print_snapshot(snapshot: &DiskSnapshot) {
    println!(
        "{}: {} {} label, id {}",
        snapshot.device.display(),
        human_size(snapshot.capacity_bytes),
        snapshot.label.parted_name(),
        snapshot.disk_id
    );

    for p in &snapshot.partitions {
        println!(
            "  {:<2} {:<24} {:>10}  {:<11} {:<4} uuid {}",
            p.number,
            p.device_path.display(),
            human_size(p.size_bytes),
            p.fs_type
                .as_ref()
                .map_or_else(|| "-".to_string(), |f| f.to_string()),
            if p.is_efi { "esp" } else { "" },
            p.filesystem_uuid
                .as_ref()
                .map_or_else(|| "-".to_string(), |u| u.to_string())
        );
    }
}
