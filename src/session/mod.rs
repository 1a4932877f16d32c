//! Device access boundary.
//!
//! A session owns its serial port exclusively for its whole lifetime, so at
//! most one backup or restore operation can be active against a device. The
//! session speaks in single offset-addressed transfers and knows nothing of
//! partitions; validating offsets and lengths is the caller's job.

pub mod protocol;
pub mod serial;
pub mod simulated;

use std::time::Duration;

use crate::chip::ChipInfo;
use crate::error::{Error, Result};

pub use protocol::RomError;
pub use serial::SerialSession;
pub use simulated::SimulatedSession;

/// Offset-addressed access to the flash of a device in download mode.
pub trait DeviceSession {
    /// The chip identity, read once when the session was opened.
    fn chip_info(&self) -> &ChipInfo;

    /// Reads `length` bytes starting at `offset` in a single transfer.
    fn read_flash(&mut self, offset: u32, length: u32) -> Result<Vec<u8>>;

    /// Writes `data` starting at `offset` in a single transfer.
    fn write_flash(&mut self, offset: u32, data: &[u8]) -> Result<()>;
}

/// Bounded retry budget applied to each individual transfer.
///
/// Transient failures are retried here and nowhere else; exhausting the
/// budget converts to a terminal [`Error::Transfer`] carrying the offset.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            backoff: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Runs `op` against `ctx` until it succeeds or the budget is spent,
    /// sleeping `backoff` between attempts.
    pub(crate) fn run<C, T>(
        &self,
        offset: u32,
        ctx: &mut C,
        mut op: impl FnMut(&mut C) -> Result<T>,
    ) -> Result<T> {
        let attempts = self.attempts.max(1);

        let mut source = match op(ctx) {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        for attempt in 2..=attempts {
            log::debug!(
                "transfer at {:#010x} failed ({}), attempt {}/{}",
                offset,
                source,
                attempt,
                attempts
            );
            std::thread::sleep(self.backoff);

            match op(ctx) {
                Ok(value) => return Ok(value),
                Err(err) => source = err,
            }
        }

        Err(Error::Transfer {
            offset,
            attempts,
            source: Box::new(source),
        })
    }
}
