use std::io;

use thiserror::Error;

use crate::session::RomError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("could not open serial port {port}: {source}")]
    Connection {
        port: String,
        #[source]
        source: serialport::Error,
    },

    #[error("device did not answer the download-mode handshake; hold BOOT while resetting and retry")]
    WrongBootMode,

    #[error("flash transfer failed at offset {offset:#010x} after {attempts} attempts: {source}")]
    Transfer {
        offset: u32,
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("checksum mismatch: expected {expected}, computed {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("chip mismatch: backup was taken from {expected} but the connected device reports {actual}")]
    ChipMismatch { expected: String, actual: String },

    #[error("restore verification failed: device bytes diverge at offset {offset:#010x}; the device is left with the last written data, no rollback is attempted")]
    RestoreVerification { offset: u32 },

    #[error("no backup with id {0}")]
    NotFound(String),

    #[error("catalog error: {0}")]
    Catalog(String),

    #[error("range {start:#010x}+{length:#x} does not fit a {flash_size} byte flash")]
    InvalidRange {
        start: u32,
        length: u32,
        flash_size: u32,
    },

    #[error("unknown partition {0:?}")]
    UnknownPartition(String),

    #[error("partitions {first:?} and {second:?} overlap")]
    OverlappingPartitions { first: String, second: String },

    #[error("duplicate partition name {0:?}")]
    DuplicatePartition(String),

    #[error("restore declined; nothing was written")]
    Declined,

    #[error("operation cancelled")]
    Cancelled,

    #[error("device reported: {0}")]
    Rom(#[from] RomError),

    #[error("invalid response from device")]
    BadResponse,

    #[error("serial I/O error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("metadata error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),
}
