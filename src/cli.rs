use std::path::PathBuf;

use structopt::StructOpt;

/// Back up, inspect and restore the flash of a device connected in
/// serial download mode.
#[derive(StructOpt, Debug)]
#[structopt(name = "espvault")]
pub struct Opts {
    #[structopt(subcommand)]
    pub command: Command,

    /// The serial device the target is attached to
    #[structopt(env = "SERIAL_PORT", short = "p", long = "port")]
    pub port: Option<String>,

    /// The serial baud rate for the download-mode link
    #[structopt(env = "BAUD_RATE", short = "b", long = "baud-rate")]
    pub baud_rate: Option<u32>,

    /// Path to a configuration file
    #[structopt(long = "config", parse(from_os_str))]
    pub config: Option<PathBuf>,

    /// Directory holding the backup catalog
    #[structopt(long = "backup-dir", parse(from_os_str))]
    pub backup_dir: Option<PathBuf>,
}

#[derive(StructOpt, Debug)]
pub enum Command {
    /// Print the connected chip's identity
    #[structopt(name = "chip-info")]
    ChipInfo,
    /// Print the flash size and the partition layout
    #[structopt(name = "flash-info")]
    FlashInfo,
    /// Capture the whole flash, or a single named partition
    Backup {
        /// Partition to capture instead of the whole flash
        #[structopt(long)]
        partition: Option<String>,
    },
    /// Capture an explicit range, bypassing the partition table
    #[structopt(name = "backup-partition")]
    BackupPartition {
        /// Label recorded in the backup's metadata
        name: String,
        /// Start offset (decimal or 0x-prefixed)
        #[structopt(parse(try_from_str = parse_int::parse))]
        offset: u32,
        /// Number of bytes (decimal or 0x-prefixed)
        #[structopt(parse(try_from_str = parse_int::parse))]
        length: u32,
    },
    /// List catalogued backups, newest first
    List,
    /// Write a catalogued backup back to the device
    Restore {
        backup_id: String,
        /// Downgrade a chip-id mismatch to a warning
        #[structopt(long)]
        force: bool,
        /// Answer the confirmation prompt affirmatively
        #[structopt(long)]
        yes: bool,
    },
    /// Remove a backup and its metadata from the catalog
    Delete { backup_id: String },
}
