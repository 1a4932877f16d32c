//! In-memory stand-in for a download-mode device.
//!
//! Backs the test suite and lets the engines run without hardware. Faults
//! are scripted per offset and consumed by the same retry machinery the
//! serial session uses, so retry exhaustion behaves identically.

use std::collections::HashMap;
use std::io;
use std::time::Duration;

use super::{DeviceSession, RetryPolicy};
use crate::chip::ChipInfo;
use crate::error::{Error, Result};
use crate::session::RomError;

pub struct SimulatedSession {
    chip: ChipInfo,
    flash: Vec<u8>,
    read_faults: HashMap<u32, u32>,
    write_faults: HashMap<u32, u32>,
    corrupt_writes: bool,
    reads: u64,
    writes: u64,
    retry: RetryPolicy,
}

impl SimulatedSession {
    pub fn new(chip_id: &str, flash: Vec<u8>) -> SimulatedSession {
        let chip = ChipInfo {
            chip_id: chip_id.to_string(),
            flash_size: flash.len() as u32,
            sdk_version: "1.0.0".to_string(),
        };

        SimulatedSession {
            chip,
            flash,
            read_faults: HashMap::new(),
            write_faults: HashMap::new(),
            corrupt_writes: false,
            reads: 0,
            writes: 0,
            retry: RetryPolicy {
                attempts: 3,
                backoff: Duration::from_millis(0),
            },
        }
    }

    /// A device whose flash holds a deterministic byte pattern.
    pub fn with_pattern(chip_id: &str, flash_size: u32) -> SimulatedSession {
        let flash = (0..flash_size)
            .map(|i| (i.wrapping_mul(31) >> 8) as u8 ^ i as u8)
            .collect();

        SimulatedSession::new(chip_id, flash)
    }

    pub fn set_retry(&mut self, retry: RetryPolicy) {
        self.retry = retry;
    }

    /// Makes the next `count` reads touching `offset` time out.
    pub fn fail_reads_at(&mut self, offset: u32, count: u32) {
        self.read_faults.insert(offset, count);
    }

    /// Makes the next `count` writes touching `offset` time out.
    pub fn fail_writes_at(&mut self, offset: u32, count: u32) {
        self.write_faults.insert(offset, count);
    }

    /// Flips the first byte of every subsequent write, leaving the transfer
    /// itself "successful". Exercises post-write verification.
    pub fn corrupt_writes(&mut self, corrupt: bool) {
        self.corrupt_writes = corrupt;
    }

    pub fn flash(&self) -> &[u8] {
        &self.flash
    }

    pub fn flash_mut(&mut self) -> &mut Vec<u8> {
        &mut self.flash
    }

    /// Transfers attempted so far, including retried ones.
    pub fn read_count(&self) -> u64 {
        self.reads
    }

    pub fn write_count(&self) -> u64 {
        self.writes
    }

    fn take_fault(faults: &mut HashMap<u32, u32>, offset: u32) -> bool {
        match faults.get_mut(&offset) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    fn transport_read(&mut self, offset: u32, length: u32) -> Result<Vec<u8>> {
        self.reads += 1;

        if Self::take_fault(&mut self.read_faults, offset) {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "simulated read timeout",
            )));
        }

        let end = offset as u64 + length as u64;
        if end > self.flash.len() as u64 {
            return Err(Error::Rom(RomError::FlashReadParam));
        }

        Ok(self.flash[offset as usize..end as usize].to_vec())
    }

    fn transport_write(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        self.writes += 1;

        if Self::take_fault(&mut self.write_faults, offset) {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "simulated write timeout",
            )));
        }

        let end = offset as u64 + data.len() as u64;
        if end > self.flash.len() as u64 {
            return Err(Error::Rom(RomError::FlashWriteParam));
        }

        self.flash[offset as usize..end as usize].copy_from_slice(data);

        if self.corrupt_writes && !data.is_empty() {
            self.flash[offset as usize] ^= 0xff;
        }

        Ok(())
    }
}

impl DeviceSession for SimulatedSession {
    fn chip_info(&self) -> &ChipInfo {
        &self.chip
    }

    fn read_flash(&mut self, offset: u32, length: u32) -> Result<Vec<u8>> {
        let retry = self.retry;

        retry.run(offset, self, |session| {
            session.transport_read(offset, length)
        })
    }

    fn write_flash(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        let retry = self.retry;

        retry.run(offset, self, |session| {
            session.transport_write(offset, data)
        })
    }
}
