//! Framing for the download-mode command set.
//!
//! Requests are `[command id, 0x00, length as u16 le, body]`; the device
//! answers `OK` followed by an optional length-prefixed payload, or `FL`
//! followed by a 16-bit error code.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use num_enum::{FromPrimitive, IntoPrimitive};
use thiserror::Error;

use crate::chip::ChipInfo;
use crate::error::{Error, Result};

/// Byte repeated to keep the UART busy during the handshake.
pub const SYNC_BYTE: u8 = 0x55;
/// Positive status marker.
pub const ACK: &[u8; 2] = b"OK";
/// Negative status marker, followed by an error code.
pub const NACK: &[u8; 2] = b"FL";

/// Error codes the loader stub reports in a `FL` status.
#[repr(u16)]
#[derive(Error, Debug, Clone, Copy, Eq, PartialEq, IntoPrimitive, FromPrimitive)]
pub enum RomError {
    #[error("no error")]
    None = 0x0000,
    #[error("flash could not be initialized")]
    FlashInit = 0x0001,
    #[error("flash read parameters rejected")]
    FlashReadParam = 0x0002,
    #[error("flash read failed")]
    FlashRead = 0x0003,
    #[error("flash write parameters rejected")]
    FlashWriteParam = 0x0004,
    #[error("flash write failed")]
    FlashWrite = 0x0005,
    #[error("unknown command id")]
    CommandId = 0x0101,
    #[error("command length rejected")]
    CommandLength = 0x0102,
    #[error("command checksum rejected")]
    CommandCrc = 0x0103,
    #[error("unrecognized bootloader error")]
    #[num_enum(default)]
    Unknown = 0xffff,
}

/// A request that can be framed for the wire.
pub trait Command {
    const CMD_ID: u8;

    fn write_body<W: Write>(&self, writer: W) -> io::Result<()>;

    /// Frames the command: id, reserved byte, body length, body.
    fn encode(&self) -> io::Result<Vec<u8>> {
        let mut body = Vec::new();
        self.write_body(&mut body)?;

        let mut buf = Vec::with_capacity(4 + body.len());
        buf.write_u8(Self::CMD_ID)?;
        buf.write_u8(0)?;
        buf.write_u16::<LittleEndian>(body.len() as u16)?;
        buf.write_all(&body)?;

        Ok(buf)
    }
}

/// Requests the chip identity from the loader stub.
pub struct ChipInfoReq;

impl Command for ChipInfoReq {
    const CMD_ID: u8 = 0x10;

    fn write_body<W: Write>(&self, _writer: W) -> io::Result<()> {
        Ok(())
    }
}

/// Reads `size` bytes of flash starting at `offset`.
pub struct FlashRead {
    pub offset: u32,
    pub size: u32,
}

impl Command for FlashRead {
    const CMD_ID: u8 = 0x32;

    fn write_body<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u32::<LittleEndian>(self.offset)?;
        writer.write_u32::<LittleEndian>(self.size)?;

        Ok(())
    }
}

/// Writes `data` to flash starting at `offset`.
pub struct FlashWrite<'a> {
    pub offset: u32,
    pub data: &'a [u8],
}

impl<'a> Command for FlashWrite<'a> {
    const CMD_ID: u8 = 0x31;

    fn write_body<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u32::<LittleEndian>(self.offset)?;
        writer.write_all(self.data)?;

        Ok(())
    }
}

/// Reads a status marker, mapping `FL` codes to `Error::Rom`.
pub fn read_status<R: Read>(mut reader: R) -> Result<()> {
    let mut marker = [0u8; 2];
    reader.read_exact(&mut marker)?;

    if &marker == ACK {
        Ok(())
    } else if &marker == NACK {
        let code = reader.read_u16::<LittleEndian>()?;
        Err(Error::Rom(RomError::from(code)))
    } else {
        log::trace!("unexpected status marker {:02x?}", marker);
        Err(Error::BadResponse)
    }
}

/// Reads a status marker followed by a length-prefixed payload.
pub fn read_payload<R: Read>(mut reader: R) -> Result<Vec<u8>> {
    read_status(&mut reader)?;

    let len = reader.read_u16::<LittleEndian>()?;
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload)?;

    Ok(payload)
}

/// Decodes a `ChipInfoReq` payload: loader version, MAC, flash size.
pub fn decode_chip_info(payload: &[u8]) -> Result<ChipInfo> {
    if payload.len() < 14 {
        return Err(Error::BadResponse);
    }

    let mut reader = payload;
    let version = reader.read_u32::<LittleEndian>()?;

    let mut mac = [0u8; 6];
    reader.read_exact(&mut mac)?;

    let flash_size = reader.read_u32::<LittleEndian>()?;

    let chip_id = mac
        .iter()
        .map(|byte| format!("{:02x}", byte))
        .collect::<Vec<_>>()
        .join(":");
    let sdk_version = format!(
        "{}.{}.{}",
        (version >> 16) & 0xff,
        (version >> 8) & 0xff,
        version & 0xff
    );

    Ok(ChipInfo {
        chip_id,
        flash_size,
        sdk_version,
    })
}
