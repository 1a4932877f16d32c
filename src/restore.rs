//! Restore of a catalogued backup onto a device.
//!
//! A restore walks a linear state machine with no cycles:
//! Validate, Confirm, Write, Verify, then Done, with Failed terminal and
//! reachable from every phase. The bootloader offers no rollback, so a
//! failure during Write or Verify leaves the device with whatever the last
//! successful chunk produced, and the error says exactly that instead of
//! pretending to undo it.

use std::fs::File;
use std::io::{BufReader, Read};

use log::{info, warn};

use crate::catalog::{BackupMetadata, Catalog, Region};
use crate::error::{Error, Result};
use crate::partition::check_range;
use crate::progress::CancelToken;
use crate::session::DeviceSession;
use crate::verify;

/// Phases of a restore run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Validate,
    Confirm,
    Write,
    Verify,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RestoreOptions {
    /// Downgrades a chip-id mismatch to a warning. The checksum check is
    /// never skipped, forced or not.
    pub force: bool,
}

/// Outcome of a completed restore.
#[derive(Debug)]
pub struct RestoreReport {
    pub backup_id: String,
    pub bytes_written: u64,
    /// Set when `force` carried the run past a chip-id mismatch.
    pub chip_mismatch: bool,
}

pub struct RestoreEngine<'a> {
    catalog: &'a Catalog,
    chunk_size: usize,
    confirm: Box<dyn FnMut(&BackupMetadata) -> bool + 'a>,
    progress: Option<Box<dyn FnMut(u64, u64) + 'a>>,
    cancel: CancelToken,
    phase: Phase,
}

impl<'a> RestoreEngine<'a> {
    /// A new engine with consent withheld: without an explicit confirmation
    /// callback every run ends in `Declined` before any device access.
    pub fn new(catalog: &'a Catalog, chunk_size: usize) -> Self {
        RestoreEngine {
            catalog,
            chunk_size: chunk_size.max(1),
            confirm: Box::new(|_| false),
            progress: None,
            cancel: CancelToken::new(),
            phase: Phase::Validate,
        }
    }

    /// Installs the consent callback asked during the Confirm phase.
    pub fn with_confirmation(mut self, confirm: impl FnMut(&BackupMetadata) -> bool + 'a) -> Self {
        self.confirm = Box::new(confirm);
        self
    }

    /// Installs a callback invoked between chunks with
    /// `(completed chunks, total chunks)` across the Write and Verify phases.
    pub fn with_progress(mut self, progress: impl FnMut(u64, u64) + 'a) -> Self {
        self.progress = Some(Box::new(progress));
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// The phase the last run ended in.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn run(
        &mut self,
        session: &mut dyn DeviceSession,
        backup_id: &str,
        options: RestoreOptions,
    ) -> Result<RestoreReport> {
        match self.drive(session, backup_id, options) {
            Ok(report) => {
                self.enter(Phase::Done);
                Ok(report)
            }
            Err(err) => {
                self.phase = Phase::Failed;
                Err(err)
            }
        }
    }

    fn drive(
        &mut self,
        session: &mut dyn DeviceSession,
        backup_id: &str,
        options: RestoreOptions,
    ) -> Result<RestoreReport> {
        self.enter(Phase::Validate);

        let metadata = self.catalog.find(backup_id)?;
        let artifact = self.catalog.artifact_path(backup_id);

        let actual = verify::digest_reader(File::open(&artifact)?)?;
        if !actual.eq_ignore_ascii_case(&metadata.checksum) {
            return Err(Error::ChecksumMismatch {
                expected: metadata.checksum,
                actual,
            });
        }

        let file_size = std::fs::metadata(&artifact)?.len();
        if file_size != metadata.byte_size {
            return Err(Error::Catalog(format!(
                "artifact for {} is {} bytes but metadata records {}",
                backup_id, file_size, metadata.byte_size
            )));
        }

        let live = session.chip_info().clone();
        let mut chip_mismatch = false;

        if metadata.chip.chip_id != live.chip_id {
            if options.force {
                warn!(
                    "chip mismatch: backup was taken from {} but the connected device reports {}; continuing because --force was given",
                    metadata.chip.chip_id, live.chip_id
                );
                chip_mismatch = true;
            } else {
                return Err(Error::ChipMismatch {
                    expected: metadata.chip.chip_id,
                    actual: live.chip_id,
                });
            }
        }

        for region in &metadata.regions {
            check_range(region.start, region.length, live.flash_size)?;
        }

        self.enter(Phase::Confirm);

        if !(self.confirm)(&metadata) {
            return Err(Error::Declined);
        }

        let chunks_per_pass: u64 = metadata
            .regions
            .iter()
            .map(|region| self.chunks_in(region.length))
            .sum();
        let total_chunks = chunks_per_pass * 2;
        let mut done_chunks = 0u64;
        self.report(0, total_chunks);

        self.enter(Phase::Write);

        let mut source = BufReader::new(File::open(&artifact)?);
        let mut bytes_written = 0u64;

        for region in &metadata.regions {
            bytes_written +=
                self.write_region(session, &mut source, region, &mut done_chunks, total_chunks)?;
        }

        self.enter(Phase::Verify);

        let mut source = BufReader::new(File::open(&artifact)?);

        for region in &metadata.regions {
            self.verify_region(session, &mut source, region, &mut done_chunks, total_chunks)?;
        }

        Ok(RestoreReport {
            backup_id: metadata.backup_id,
            bytes_written,
            chip_mismatch,
        })
    }

    /// Writes one region from the artifact stream in chunk-size transfers.
    fn write_region(
        &mut self,
        session: &mut dyn DeviceSession,
        source: &mut impl Read,
        region: &Region,
        done_chunks: &mut u64,
        total_chunks: u64,
    ) -> Result<u64> {
        let mut cursor = region.start as u64;
        let end = region.start as u64 + region.length as u64;
        let mut written = 0u64;

        while cursor < end {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let len = ((end - cursor) as usize).min(self.chunk_size);
            let mut chunk = vec![0u8; len];
            source.read_exact(&mut chunk)?;

            session.write_flash(cursor as u32, &chunk)?;

            cursor += len as u64;
            written += len as u64;
            *done_chunks += 1;
            self.report(*done_chunks, total_chunks);
        }

        Ok(written)
    }

    /// Reads one region back and compares it to the artifact stream,
    /// reporting the first divergent offset.
    fn verify_region(
        &mut self,
        session: &mut dyn DeviceSession,
        source: &mut impl Read,
        region: &Region,
        done_chunks: &mut u64,
        total_chunks: u64,
    ) -> Result<()> {
        let mut cursor = region.start as u64;
        let end = region.start as u64 + region.length as u64;

        while cursor < end {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let len = ((end - cursor) as usize).min(self.chunk_size);
            let mut expected = vec![0u8; len];
            source.read_exact(&mut expected)?;

            let device = session.read_flash(cursor as u32, len as u32)?;

            if device != expected {
                let diverged = device
                    .iter()
                    .zip(expected.iter())
                    .position(|(a, b)| a != b)
                    .unwrap_or(0);

                return Err(Error::RestoreVerification {
                    offset: cursor as u32 + diverged as u32,
                });
            }

            cursor += len as u64;
            *done_chunks += 1;
            self.report(*done_chunks, total_chunks);
        }

        Ok(())
    }

    fn chunks_in(&self, length: u32) -> u64 {
        (length as u64 + self.chunk_size as u64 - 1) / self.chunk_size as u64
    }

    fn enter(&mut self, phase: Phase) {
        self.phase = phase;
        info!("restore phase: {:?}", phase);
    }

    fn report(&mut self, done: u64, total: u64) {
        if let Some(progress) = self.progress.as_mut() {
            progress(done, total);
        }
    }
}
