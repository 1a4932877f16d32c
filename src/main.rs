use std::io::{self, Write};
use std::process;

use anyhow::Context;
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use structopt::StructOpt;

use espvault::backup::BackupEngine;
use espvault::catalog::{BackupMetadata, Catalog, Region};
use espvault::cli::{Command, Opts};
use espvault::config::Config;
use espvault::restore::{RestoreEngine, RestoreOptions};
use espvault::session::{DeviceSession, SerialSession};
use espvault::Error;

fn main() {
    pretty_env_logger::init_timed();

    let opts = Opts::from_args();

    if let Err(err) = run(opts) {
        log::error!("{:#}", err);
        process::exit(exit_code(&err));
    }
}

fn run(opts: Opts) -> Result<(), anyhow::Error> {
    let mut config = Config::load(opts.config.as_deref())?;

    if let Some(port) = &opts.port {
        config.port = port.clone();
    }
    if let Some(baud_rate) = opts.baud_rate {
        config.baud_rate = baud_rate;
    }
    if let Some(backup_dir) = &opts.backup_dir {
        config.backup_dir = backup_dir.clone();
    }

    match &opts.command {
        Command::ChipInfo => chip_info(&config),
        Command::FlashInfo => flash_info(&config),
        Command::Backup { partition } => backup(&config, partition.as_deref()),
        Command::BackupPartition {
            name,
            offset,
            length,
        } => backup_range(&config, name, *offset, *length),
        Command::List => list(&config),
        Command::Restore {
            backup_id,
            force,
            yes,
        } => restore(&config, backup_id, *force, *yes),
        Command::Delete { backup_id } => delete(&config, backup_id),
    }
}

/// Maps each failure class to its own exit code so scripts can branch on
/// the reason without parsing log output.
fn exit_code(err: &anyhow::Error) -> i32 {
    let class = err.chain().find_map(|cause| cause.downcast_ref::<Error>());

    match class {
        Some(Error::NotFound(_)) => 2,
        Some(Error::ChecksumMismatch { .. })
        | Some(Error::InvalidRange { .. })
        | Some(Error::UnknownPartition(_))
        | Some(Error::OverlappingPartitions { .. })
        | Some(Error::DuplicatePartition(_))
        | Some(Error::Catalog(_)) => 3,
        Some(Error::ChipMismatch { .. }) => 4,
        Some(Error::Connection { .. })
        | Some(Error::WrongBootMode)
        | Some(Error::Transfer { .. })
        | Some(Error::Serial(_))
        | Some(Error::Rom(_))
        | Some(Error::BadResponse) => 5,
        Some(Error::RestoreVerification { .. }) => 6,
        Some(Error::Declined) => 7,
        Some(Error::Cancelled) => 8,
        _ => 1,
    }
}

fn open_session(config: &Config) -> Result<SerialSession, anyhow::Error> {
    SerialSession::open(&config.port, config)
        .with_context(|| format!("could not bring {} into download mode", config.port))
}

fn chunk_bar() -> ProgressBar {
    let bar = ProgressBar::new(0);

    if let Ok(style) =
        ProgressStyle::default_bar().template("  {wide_bar} {pos}/{len} chunks {eta}  ")
    {
        bar.set_style(style.progress_chars("#>-"));
    }

    bar
}

fn chip_info(config: &Config) -> Result<(), anyhow::Error> {
    let session = open_session(config)?;
    let chip = session.chip_info();

    println!("Chip id:      {}", chip.chip_id);
    println!("Flash size:   {}", HumanBytes(chip.flash_size as u64));
    println!("SDK version:  {}", chip.sdk_version);

    Ok(())
}

fn flash_info(config: &Config) -> Result<(), anyhow::Error> {
    let session = open_session(config)?;
    let chip = session.chip_info();
    let table = config.partition_table();

    println!(
        "Flash size: {} ({} bytes)",
        HumanBytes(chip.flash_size as u64),
        chip.flash_size
    );
    println!();
    println!("{:<10} {:>12} {:>12}", "PARTITION", "OFFSET", "LENGTH");

    for entry in table.entries() {
        let fits = entry.offset as u64 + entry.length as u64 <= chip.flash_size as u64;

        println!(
            "{:<10} {:>#12x} {:>#12x}{}",
            entry.name,
            entry.offset,
            entry.length,
            if fits { "" } else { "  (outside flash)" }
        );
    }

    Ok(())
}

fn backup(config: &Config, partition: Option<&str>) -> Result<(), anyhow::Error> {
    let catalog = Catalog::open(&config.backup_dir)?;
    let table = config.partition_table();
    let mut session = open_session(config)?;

    let bar = chunk_bar();
    let progress_bar = bar.clone();
    let mut engine = BackupEngine::new(&catalog, &table, config.chunk_size).with_progress(
        move |done, total| {
            progress_bar.set_length(total);
            progress_bar.set_position(done);
        },
    );

    let metadata = match partition {
        Some(name) => engine.backup_partition(&mut session, name),
        None => engine.backup_full(&mut session),
    };

    bar.finish_and_clear();
    report_backup(&metadata?);

    Ok(())
}

fn backup_range(config: &Config, name: &str, offset: u32, length: u32) -> Result<(), anyhow::Error> {
    let catalog = Catalog::open(&config.backup_dir)?;
    let table = config.partition_table();
    let mut session = open_session(config)?;

    let bar = chunk_bar();
    let progress_bar = bar.clone();
    let mut engine = BackupEngine::new(&catalog, &table, config.chunk_size).with_progress(
        move |done, total| {
            progress_bar.set_length(total);
            progress_bar.set_position(done);
        },
    );

    let metadata = engine.backup_range(&mut session, Some(name), offset, length);

    bar.finish_and_clear();
    report_backup(&metadata?);

    Ok(())
}

fn report_backup(metadata: &BackupMetadata) {
    println!("{}", metadata.backup_id);
    println!(
        "  {} ({} bytes), md5 {}",
        HumanBytes(metadata.byte_size),
        metadata.byte_size,
        metadata.checksum
    );
}

fn list(config: &Config) -> Result<(), anyhow::Error> {
    let catalog = Catalog::open(&config.backup_dir)?;
    let entries = catalog.list()?;

    if entries.is_empty() {
        println!("No backups in {}", config.backup_dir.display());
        return Ok(());
    }

    println!(
        "{:<38} {:>10} {:<20} {}",
        "BACKUP ID", "SIZE", "CREATED", "REGIONS"
    );

    for metadata in entries {
        let regions: Vec<String> = metadata.regions.iter().map(describe_region).collect();

        println!(
            "{:<38} {:>10} {:<20} {}",
            metadata.backup_id,
            HumanBytes(metadata.byte_size).to_string(),
            metadata.created_at.format("%Y-%m-%d %H:%M:%S"),
            regions.join(", ")
        );
    }

    Ok(())
}

fn describe_region(region: &Region) -> String {
    match &region.name {
        Some(name) => name.clone(),
        None => format!("{:#x}+{:#x}", region.start, region.length),
    }
}

fn restore(config: &Config, backup_id: &str, force: bool, yes: bool) -> Result<(), anyhow::Error> {
    let catalog = Catalog::open(&config.backup_dir)?;
    let mut session = open_session(config)?;

    let bar = chunk_bar();
    let progress_bar = bar.clone();
    let mut engine = RestoreEngine::new(&catalog, config.chunk_size)
        .with_confirmation(move |metadata| yes || confirm_restore(metadata))
        .with_progress(move |done, total| {
            progress_bar.set_length(total);
            progress_bar.set_position(done);
        });

    let report = engine.run(&mut session, backup_id, RestoreOptions { force });

    bar.finish_and_clear();
    let report = report?;

    println!(
        "Restored {} ({} written, verified)",
        report.backup_id,
        HumanBytes(report.bytes_written)
    );

    Ok(())
}

/// Interactive consent prompt; anything but a literal `yes` declines.
fn confirm_restore(metadata: &BackupMetadata) -> bool {
    println!(
        "About to overwrite device flash with backup {} ({}, taken {}).",
        metadata.backup_id,
        HumanBytes(metadata.byte_size),
        metadata.created_at.format("%Y-%m-%d %H:%M:%S")
    );
    print!("Type 'yes' to continue: ");

    if io::stdout().flush().is_err() {
        return false;
    }

    let mut line = String::new();
    if io::stdin().read_line(&mut line).is_err() {
        return false;
    }

    line.trim().eq_ignore_ascii_case("yes")
}

fn delete(config: &Config, backup_id: &str) -> Result<(), anyhow::Error> {
    let catalog = Catalog::open(&config.backup_dir)?;

    catalog.delete(backup_id)?;
    println!("Deleted {}", backup_id);

    Ok(())
}
