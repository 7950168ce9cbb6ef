//! The binary protocol spoken between host and bootloader.
//!
//! Request: `[len][cmd][payload..][crc32 LE]`, where `len` counts everything
//! after itself. Response: a lone NACK byte, or `[ACK][len][payload..]`.
use std::fmt;

use anyhow::Result;
use scroll::{LE, Pread, Pwrite};

use crate::constants::{ACK, CRC_LEN, NACK, commands};
use crate::integrity::Stm32Crc;

/// A decoded bootloader request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Command {
    /// Bootloader version, `[major, minor, patch]`.
    GetVersion,
    /// List of supported opcodes.
    GetHelp,
    /// Device identifier, 2 bytes LE.
    GetChipId,
    /// Current read-out protection level.
    GetRdpStatus,
    /// Branch to `address` after acknowledging.
    JumpToAddress { address: u32 },
    /// Erase `count` sectors from `sector`, or everything when `sector` is `0xFF`.
    EraseFlash { sector: u8, count: u8 },
    /// Program `data` at `address`. Flash must have been erased first.
    MemoryWrite { address: u32, data: Vec<u8> },
    /// Apply (`mode == 1`) or remove (`mode == 0`) write protection on the masked sectors.
    WriteProtect { sectors: u16, mode: u8 },
    MemoryRead { address: u32, len: u8 },
    /// Write protection mask of every sector.
    SectorStatus,
    OtpRead { block: u8 },
    /// Request a new read-out protection level. Level 2 is permanent.
    ChangeRopLevel { level: u8 },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown command 0x{0:02x}")]
    UnknownOpcode(u8),
    #[error("arguments of command 0x{opcode:02x} are truncated")]
    Truncated { opcode: u8 },
    #[error("command 0x{opcode:02x} declares {declared} data bytes but carries {actual}")]
    LengthMismatch {
        opcode: u8,
        declared: usize,
        actual: usize,
    },
}

impl Command {
    pub fn jump_to_address(address: u32) -> Self {
        Command::JumpToAddress { address }
    }

    pub fn erase_sectors(sector: u8, count: u8) -> Self {
        Command::EraseFlash { sector, count }
    }

    pub fn mass_erase() -> Self {
        Command::EraseFlash {
            sector: crate::constants::MASS_ERASE,
            count: 0,
        }
    }

    pub fn memory_write(address: u32, data: Vec<u8>) -> Self {
        Command::MemoryWrite { address, data }
    }

    pub fn memory_read(address: u32, len: u8) -> Self {
        Command::MemoryRead { address, len }
    }

    pub fn write_protect(sectors: u16, enable: bool) -> Self {
        Command::WriteProtect {
            sectors,
            mode: enable as u8,
        }
    }

    pub fn change_rop_level(level: u8) -> Self {
        Command::ChangeRopLevel { level }
    }

    pub fn opcode(&self) -> u8 {
        match self {
            Command::GetVersion => commands::GET_VERSION,
            Command::GetHelp => commands::GET_HELP,
            Command::GetChipId => commands::GET_CHIP_ID,
            Command::GetRdpStatus => commands::GET_RDP_STATUS,
            Command::JumpToAddress { .. } => commands::JUMP_TO_ADDRESS,
            Command::EraseFlash { .. } => commands::ERASE_FLASH,
            Command::MemoryWrite { .. } => commands::MEMORY_WRITE,
            Command::WriteProtect { .. } => commands::WRITE_PROTECT,
            Command::MemoryRead { .. } => commands::MEMORY_READ,
            Command::SectorStatus => commands::SECTOR_STATUS,
            Command::OtpRead { .. } => commands::OTP_READ,
            Command::ChangeRopLevel { .. } => commands::CHANGE_ROP_LEVEL,
        }
    }

    /// Decodes the arguments of `opcode`. Trailing bytes after the arguments are ignored.
    pub fn parse(opcode: u8, payload: &[u8]) -> Result<Self, ProtocolError> {
        let truncated = |_: scroll::Error| ProtocolError::Truncated { opcode };
        let cmd = match opcode {
            commands::GET_VERSION => Command::GetVersion,
            commands::GET_HELP => Command::GetHelp,
            commands::GET_CHIP_ID => Command::GetChipId,
            commands::GET_RDP_STATUS => Command::GetRdpStatus,
            commands::JUMP_TO_ADDRESS => Command::JumpToAddress {
                address: payload.pread_with(0, LE).map_err(truncated)?,
            },
            commands::ERASE_FLASH => Command::EraseFlash {
                sector: payload.pread(0).map_err(truncated)?,
                count: payload.pread(1).map_err(truncated)?,
            },
            commands::MEMORY_WRITE => {
                let address = payload.pread_with(0, LE).map_err(truncated)?;
                let declared = usize::from(payload.pread::<u8>(4).map_err(truncated)?);
                let data = &payload[5..];
                if declared != data.len() {
                    return Err(ProtocolError::LengthMismatch {
                        opcode,
                        declared,
                        actual: data.len(),
                    });
                }
                Command::MemoryWrite {
                    address,
                    data: data.to_vec(),
                }
            }
            commands::WRITE_PROTECT => Command::WriteProtect {
                sectors: payload.pread_with(0, LE).map_err(truncated)?,
                mode: payload.pread(2).map_err(truncated)?,
            },
            commands::MEMORY_READ => Command::MemoryRead {
                address: payload.pread_with(0, LE).map_err(truncated)?,
                len: payload.pread(4).map_err(truncated)?,
            },
            commands::SECTOR_STATUS => Command::SectorStatus,
            commands::OTP_READ => Command::OtpRead {
                block: payload.pread(0).map_err(truncated)?,
            },
            commands::CHANGE_ROP_LEVEL => Command::ChangeRopLevel {
                level: payload.pread(0).map_err(truncated)?,
            },
            other => return Err(ProtocolError::UnknownOpcode(other)),
        };
        Ok(cmd)
    }

    fn payload(&self) -> Result<Vec<u8>> {
        let payload = match self {
            Command::GetVersion
            | Command::GetHelp
            | Command::GetChipId
            | Command::GetRdpStatus
            | Command::SectorStatus => vec![],
            Command::JumpToAddress { address } => address.to_le_bytes().to_vec(),
            Command::EraseFlash { sector, count } => vec![*sector, *count],
            Command::MemoryWrite { address, data } => {
                anyhow::ensure!(
                    data.len() <= usize::from(u8::MAX),
                    "write of {} bytes does not fit a frame",
                    data.len()
                );
                let mut buf = vec![0u8; 4 + 1 + data.len()];
                buf.pwrite_with(*address, 0, LE)?;
                buf[4] = data.len() as u8;
                buf[5..].copy_from_slice(data);
                buf
            }
            Command::WriteProtect { sectors, mode } => {
                let mut buf = [0u8; 3];
                buf.pwrite_with(*sectors, 0, LE)?;
                buf[2] = *mode;
                buf.to_vec()
            }
            Command::MemoryRead { address, len } => {
                let mut buf = [0u8; 5];
                buf.pwrite_with(*address, 0, LE)?;
                buf[4] = *len;
                buf.to_vec()
            }
            Command::OtpRead { block } => vec![*block],
            Command::ChangeRopLevel { level } => vec![*level],
        };
        Ok(payload)
    }

    /// Encodes a complete request frame, CRC included.
    pub fn into_raw(self) -> Result<Vec<u8>> {
        let payload = self.payload()?;
        let len = 1 + payload.len() + CRC_LEN;
        anyhow::ensure!(len <= usize::from(u8::MAX), "frame of {} bytes is too long", len);

        let mut buf = Vec::with_capacity(1 + len);
        buf.push(len as u8);
        buf.push(self.opcode());
        buf.extend_from_slice(&payload);
        let crc = Stm32Crc::checksum(&buf[1..]);
        buf.extend_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }
}

/// Builds the bytes of an ACK response carrying `payload`.
pub fn ack(payload: &[u8]) -> Result<Vec<u8>> {
    anyhow::ensure!(
        payload.len() <= usize::from(u8::MAX),
        "reply of {} bytes does not fit",
        payload.len()
    );
    let mut buf = Vec::with_capacity(2 + payload.len());
    buf.push(ACK);
    buf.push(payload.len() as u8);
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Response to a Command, as seen by the host.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Response {
    Ack(Vec<u8>),
    /// The frame was corrupt or the command unknown.
    Nack,
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::Ack(data) => write!(f, "ACK[{}]", hex::encode(data)),
            Response::Nack => write!(f, "NACK"),
        }
    }
}

impl Response {
    pub fn is_ok(&self) -> bool {
        matches!(self, Response::Ack(_))
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            Response::Ack(payload) => payload,
            Response::Nack => &[],
        }
    }

    /// First payload byte, which most replies use as a status.
    pub fn status(&self) -> Option<u8> {
        self.payload().first().copied()
    }

    pub fn from_raw(raw: &[u8]) -> Result<Self> {
        match raw.first() {
            Some(&NACK) => Ok(Response::Nack),
            Some(&ACK) => {
                let len = usize::from(raw.pread::<u8>(1)?);
                let remain = &raw[2..];
                anyhow::ensure!(remain.len() == len, "Invalid response length");
                Ok(Response::Ack(remain.to_vec()))
            }
            Some(other) => anyhow::bail!("unexpected response byte 0x{:02x}", other),
            None => anyhow::bail!("empty response"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split(frame: &[u8]) -> (u8, &[u8], u32) {
        let len = usize::from(frame[0]);
        assert_eq!(frame.len(), len + 1);
        let body = &frame[1..];
        let crc = body.pread_with::<u32>(len - CRC_LEN, LE).unwrap();
        (body[0], &body[1..len - CRC_LEN], crc)
    }

    #[test]
    fn get_version_frame_layout() {
        let frame = Command::GetVersion.into_raw().unwrap();
        assert_eq!(frame.len(), 6);
        assert_eq!(frame[0], 5);
        assert_eq!(frame[1], commands::GET_VERSION);
        let (_, _, crc) = split(&frame);
        assert_eq!(crc, Stm32Crc::checksum(&[commands::GET_VERSION]));
    }

    #[test]
    fn encoded_commands_parse_back() {
        let cmds = [
            Command::jump_to_address(0x0800_8001),
            Command::erase_sectors(4, 3),
            Command::mass_erase(),
            Command::memory_write(0x0800_8000, vec![1, 2, 3]),
            Command::write_protect(0x0f0c, true),
            Command::memory_read(0x2000_0000, 64),
            Command::OtpRead { block: 3 },
            Command::change_rop_level(1),
            Command::SectorStatus,
        ];
        for cmd in cmds {
            let frame = cmd.clone().into_raw().unwrap();
            let (opcode, payload, _) = split(&frame);
            assert_eq!(Command::parse(opcode, payload), Ok(cmd));
        }
    }

    #[test]
    fn short_arguments_are_truncated() {
        assert_eq!(
            Command::parse(commands::JUMP_TO_ADDRESS, &[0, 0, 0]),
            Err(ProtocolError::Truncated {
                opcode: commands::JUMP_TO_ADDRESS
            })
        );
        assert!(Command::parse(commands::ERASE_FLASH, &[1]).is_err());
        assert!(Command::parse(commands::CHANGE_ROP_LEVEL, &[]).is_err());
        assert!(Command::parse(commands::MEMORY_WRITE, &[0, 0, 0, 8]).is_err());
    }

    #[test]
    fn write_length_must_match_data() {
        let payload = [0x00, 0x80, 0x00, 0x08, 4, 0xaa, 0xbb];
        assert_eq!(
            Command::parse(commands::MEMORY_WRITE, &payload),
            Err(ProtocolError::LengthMismatch {
                opcode: commands::MEMORY_WRITE,
                declared: 4,
                actual: 2
            })
        );
    }

    #[test]
    fn unknown_opcodes_are_rejected() {
        for opcode in (0..=u8::MAX).filter(|op| !commands::ALL.contains(op)) {
            assert_eq!(
                Command::parse(opcode, &[0; 8]),
                Err(ProtocolError::UnknownOpcode(opcode))
            );
        }
    }

    #[test]
    fn responses() {
        assert_eq!(Response::from_raw(&[NACK]).unwrap(), Response::Nack);
        let raw = ack(&[1, 1, 0]).unwrap();
        assert_eq!(raw, vec![ACK, 3, 1, 1, 0]);
        let resp = Response::from_raw(&raw).unwrap();
        assert!(resp.is_ok());
        assert_eq!(resp.payload(), &[1, 1, 0]);
        assert!(Response::from_raw(&[ACK, 2, 1]).is_err());
        assert!(Response::from_raw(&[0x42]).is_err());
    }

    #[test]
    fn oversized_write_is_refused() {
        assert!(Command::memory_write(0x0800_8000, vec![0; 256]).into_raw().is_err());
        // 1 + 5 + 250 + 4 > 255
        assert!(Command::memory_write(0x0800_8000, vec![0; 250]).into_raw().is_err());
    }
}
