use std::io::{Read, Write};

use log::{debug, trace};
use serialport::prelude::*;

use super::protocol::{self, ChipInfoReq, Command, FlashRead, FlashWrite};
use super::{DeviceSession, RetryPolicy};
use crate::chip::ChipInfo;
use crate::config::Config;
use crate::error::{Error, Result};

const HANDSHAKE_ATTEMPTS: u32 = 5;
const SYNC_LEN: usize = 32;

/// A live download-mode session over a serial port.
///
/// Opening the port, handshaking and reading the chip identity happen in
/// [`SerialSession::open`]; afterwards the session only issues framed
/// read/write commands. The port is owned exclusively until the session is
/// dropped.
pub struct SerialSession {
    port: Box<dyn serialport::SerialPort>,
    chip: ChipInfo,
    retry: RetryPolicy,
}

impl SerialSession {
    /// Opens `port_name` and negotiates download-mode communication.
    ///
    /// Fails with [`Error::Connection`] if the port cannot be opened or
    /// configured, and with [`Error::WrongBootMode`] if the device does not
    /// answer the handshake, usually because it booted its application
    /// instead of the bootloader.
    pub fn open(port_name: &str, config: &Config) -> Result<SerialSession> {
        let settings = SerialPortSettings {
            baud_rate: config.baud_rate,
            data_bits: DataBits::Eight,
            flow_control: FlowControl::None,
            parity: Parity::None,
            stop_bits: StopBits::One,
            timeout: config.timeout(),
        };

        debug!(
            "opening serial port {} at {} baud",
            port_name, config.baud_rate
        );

        let mut port = serialport::open_with_settings(port_name, &settings).map_err(|source| {
            Error::Connection {
                port: port_name.to_string(),
                source,
            }
        })?;

        handshake(&mut port)?;

        let retry = RetryPolicy {
            attempts: config.retry_attempts,
            backoff: config.retry_backoff(),
        };

        let chip = retry.run(0, &mut port, |port| {
            let req = ChipInfoReq.encode()?;
            port.write_all(&req)?;
            port.flush()?;

            let payload = protocol::read_payload(&mut **port)?;
            protocol::decode_chip_info(&payload)
        })?;

        debug!(
            "connected to {} ({} byte flash, loader {})",
            chip.chip_id, chip.flash_size, chip.sdk_version
        );

        Ok(SerialSession { port, chip, retry })
    }

    fn exchange_payload(&mut self, req: &[u8]) -> Result<Vec<u8>> {
        self.port.write_all(req)?;
        self.port.flush()?;

        protocol::read_payload(&mut self.port)
    }

    fn exchange_status(&mut self, req: &[u8]) -> Result<()> {
        self.port.write_all(req)?;
        self.port.flush()?;

        protocol::read_status(&mut self.port)
    }
}

/// Sends sync bytes until the bootloader acknowledges, bounded by
/// `HANDSHAKE_ATTEMPTS`. A device that never answers is not in download mode.
fn handshake(port: &mut Box<dyn serialport::SerialPort>) -> Result<()> {
    for attempt in 1..=HANDSHAKE_ATTEMPTS {
        trace!("handshake attempt {}/{}", attempt, HANDSHAKE_ATTEMPTS);

        port.write_all(&[protocol::SYNC_BYTE; SYNC_LEN])?;
        port.flush()?;

        let mut ack = [0u8; 2];
        match port.read_exact(&mut ack) {
            Ok(()) if &ack == protocol::ACK => {
                trace!("device entered download mode");
                return Ok(());
            }
            Ok(()) => trace!("unexpected handshake reply {:02x?}", ack),
            Err(err) => trace!("handshake read failed: {}", err),
        }
    }

    Err(Error::WrongBootMode)
}

impl DeviceSession for SerialSession {
    fn chip_info(&self) -> &ChipInfo {
        &self.chip
    }

    fn read_flash(&mut self, offset: u32, length: u32) -> Result<Vec<u8>> {
        let retry = self.retry;

        retry.run(offset, self, |session| {
            let req = FlashRead {
                offset,
                size: length,
            }
            .encode()?;

            let data = session.exchange_payload(&req)?;
            if data.len() != length as usize {
                trace!(
                    "short read at {:#010x}: wanted {}, got {}",
                    offset,
                    length,
                    data.len()
                );
                return Err(Error::BadResponse);
            }

            Ok(data)
        })
    }

    fn write_flash(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        let retry = self.retry;

        retry.run(offset, self, |session| {
            let req = FlashWrite { offset, data }.encode()?;

            session.exchange_status(&req)
        })
    }
}
