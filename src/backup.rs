//! Chunked capture of flash contents into catalog artifacts.

use std::cell::Cell;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use chrono::Utc;
use log::{debug, info};
use uuid::Uuid;

use crate::catalog::{BackupMetadata, Catalog, Region, StagedArtifact, SCHEMA_VERSION};
use crate::error::{Error, Result};
use crate::partition::{check_range, PartitionTable};
use crate::progress::CancelToken;
use crate::session::DeviceSession;
use crate::verify;

/// Reads flash regions in fixed-size chunks and publishes the result.
///
/// Chunks stream into a staging file while a digest runs alongside; once
/// the last chunk lands the file is re-read, re-hashed and compared before
/// anything reaches the catalog. A failed or cancelled capture leaves no
/// trace: no staging file, no catalog entry.
pub struct BackupEngine<'a> {
    catalog: &'a Catalog,
    table: &'a PartitionTable,
    chunk_size: usize,
    progress: Option<Box<dyn FnMut(u64, u64) + 'a>>,
    cancel: CancelToken,
}

impl<'a> BackupEngine<'a> {
    pub fn new(catalog: &'a Catalog, table: &'a PartitionTable, chunk_size: usize) -> Self {
        BackupEngine {
            catalog,
            table,
            chunk_size: chunk_size.max(1),
            progress: None,
            cancel: CancelToken::new(),
        }
    }

    /// Installs a callback invoked between chunks with
    /// `(completed chunks, total chunks)`.
    pub fn with_progress(mut self, progress: impl FnMut(u64, u64) + 'a) -> Self {
        self.progress = Some(Box::new(progress));
        self
    }

    /// A handle that aborts the capture at the next chunk boundary.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Captures the entire declared flash range.
    pub fn backup_full(&mut self, session: &mut dyn DeviceSession) -> Result<BackupMetadata> {
        let flash_size = session.chip_info().flash_size;

        self.capture(
            session,
            vec![Region {
                name: None,
                start: 0,
                length: flash_size,
            }],
        )
    }

    /// Captures one named partition, resolved against the partition table.
    pub fn backup_partition(
        &mut self,
        session: &mut dyn DeviceSession,
        name: &str,
    ) -> Result<BackupMetadata> {
        let flash_size = session.chip_info().flash_size;
        let entry = self.table.resolve(name, flash_size)?.clone();

        self.capture(
            session,
            vec![Region {
                name: Some(entry.name),
                start: entry.offset,
                length: entry.length,
            }],
        )
    }

    /// Captures an explicit range, bypassing the named table. The range is
    /// still rejected before any device I/O when it does not fit the flash.
    pub fn backup_range(
        &mut self,
        session: &mut dyn DeviceSession,
        name: Option<&str>,
        offset: u32,
        length: u32,
    ) -> Result<BackupMetadata> {
        check_range(offset, length, session.chip_info().flash_size)?;

        self.capture(
            session,
            vec![Region {
                name: name.map(str::to_string),
                start: offset,
                length,
            }],
        )
    }

    fn capture(
        &mut self,
        session: &mut dyn DeviceSession,
        regions: Vec<Region>,
    ) -> Result<BackupMetadata> {
        let backup_id = Uuid::now_v7().to_string();
        let chip = session.chip_info().clone();

        let byte_size: u64 = regions.iter().map(|region| region.length as u64).sum();
        let total_chunks: u64 = regions
            .iter()
            .map(|region| self.chunks_in(region.length))
            .sum();

        info!(
            "capturing {} bytes in {} chunks as backup {}",
            byte_size, total_chunks, backup_id
        );

        let staging = self.catalog.staging_path(&backup_id);
        let mut sink = BufWriter::new(File::create(&staging)?);
        let guard = StagingGuard::new(staging.clone());

        let mut digest = verify::StreamDigest::new();
        let mut done_chunks = 0u64;
        self.report(0, total_chunks);

        for region in &regions {
            debug!(
                "reading region {:#010x}+{:#x}",
                region.start, region.length
            );

            let mut cursor = region.start as u64;
            let end = region.start as u64 + region.length as u64;

            while cursor < end {
                if self.cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }

                let len = ((end - cursor) as usize).min(self.chunk_size) as u32;
                let chunk = session.read_flash(cursor as u32, len)?;

                sink.write_all(&chunk)?;
                digest.update(&chunk);

                cursor += len as u64;
                done_chunks += 1;
                self.report(done_chunks, total_chunks);
            }
        }

        let file = sink.into_inner().map_err(|err| err.into_error())?;
        file.sync_all()?;
        drop(file);

        let metadata = BackupMetadata {
            schema_version: SCHEMA_VERSION,
            backup_id,
            chip,
            regions,
            checksum: digest.finish(),
            byte_size,
            created_at: Utc::now(),
        };

        // Re-read the staged bytes and compare digests before anything is
        // published; ownership of the file passes to the sealed artifact.
        let staged = StagedArtifact::seal(staging, metadata)?;
        guard.disarm();

        let metadata = self.catalog.register(staged)?;

        info!(
            "published backup {} ({} bytes, md5 {})",
            metadata.backup_id, metadata.byte_size, metadata.checksum
        );

        Ok(metadata)
    }

    fn chunks_in(&self, length: u32) -> u64 {
        (length as u64 + self.chunk_size as u64 - 1) / self.chunk_size as u64
    }

    fn report(&mut self, done: u64, total: u64) {
        if let Some(progress) = self.progress.as_mut() {
            progress(done, total);
        }
    }
}

/// Removes a half-written staging file on early exit.
struct StagingGuard {
    path: PathBuf,
    armed: Cell<bool>,
}

impl StagingGuard {
    fn new(path: PathBuf) -> StagingGuard {
        StagingGuard {
            path,
            armed: Cell::new(true),
        }
    }

    fn disarm(&self) {
        self.armed.set(false);
    }
}

impl Drop for StagingGuard {
    fn drop(&mut self) {
        if self.armed.get() {
            let _ = fs::remove_file(&self.path);
        }
    }
}
