//! Host side: drives a bootloader over a transport.

use anyhow::Result;
use indicatif::ProgressBar;
use scroll::{LE, Pread};

use crate::constants::{ACK, NACK, status};
use crate::device::Device;
use crate::flash::ProtectionLevel;
use crate::transport::{SerialTransport, Transport};
use crate::{Command, Response};

/// Data bytes per MEMORY_WRITE request; keeps frames inside the 200 byte receive buffer.
pub const WRITE_CHUNK: usize = 128;
/// Bytes per MEMORY_READ request.
pub const READ_CHUNK: usize = 128;

/// An OTP block as reported by the bootloader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtpBlock {
    pub locked: bool,
    pub data: Vec<u8>,
}

pub struct Flashing<T: Transport> {
    transport: T,
    /// Bootloader version, major/minor/patch
    version: [u8; 3],
    chip_id: u16,
}

impl Flashing<SerialTransport> {
    pub fn new_from_serial(port: Option<&str>, baudrate: u32) -> Result<Self> {
        let transport = match port {
            Some(port) => SerialTransport::open(port, baudrate)?,
            None => SerialTransport::open_any(baudrate)?,
        };
        Self::new(transport)
    }
}

impl<T: Transport> Flashing<T> {
    /// Identifies the bootloader on the other end of `transport`.
    pub fn new(mut transport: T) -> Result<Self> {
        let resp = transfer(&mut transport, Command::GetVersion)?;
        anyhow::ensure!(resp.is_ok(), "get_version failed");
        anyhow::ensure!(resp.payload().len() == 3, "malformed version: {:?}", resp);
        let mut version = [0u8; 3];
        version.copy_from_slice(resp.payload());

        let resp = transfer(&mut transport, Command::GetChipId)?;
        anyhow::ensure!(resp.is_ok(), "get_chip_id failed");
        let chip_id = resp.payload().pread_with::<u16>(0, LE)?;
        log::debug!("found bootloader {:?} on chip 0x{:04x}", version, chip_id);

        Ok(Flashing {
            transport,
            version,
            chip_id,
        })
    }

    pub fn version(&self) -> [u8; 3] {
        self.version
    }

    pub fn chip_id(&self) -> u16 {
        self.chip_id
    }

    pub fn into_inner(self) -> T {
        self.transport
    }

    pub fn transfer(&mut self, cmd: Command) -> Result<Response> {
        transfer(&mut self.transport, cmd)
    }

    pub fn dump_info(&mut self) -> Result<()> {
        log::info!(
            "Bootloader version: {}.{}.{}",
            self.version[0],
            self.version[1],
            self.version[2]
        );
        log::info!("Chip ID: 0x{:04x}", self.chip_id);
        log::info!("Supported commands: {}", hex::encode(self.help()?));
        log::info!("Read protection: {}", self.protection_level()?);
        log::info!("Write protected sectors: 0x{:04x}", self.sector_protection()?);
        Ok(())
    }

    pub fn help(&mut self) -> Result<Vec<u8>> {
        let resp = self.transfer(Command::GetHelp)?;
        anyhow::ensure!(resp.is_ok(), "get_help failed");
        Ok(resp.payload().to_vec())
    }

    pub fn protection_level(&mut self) -> Result<ProtectionLevel> {
        let resp = self.transfer(Command::GetRdpStatus)?;
        anyhow::ensure!(resp.is_ok(), "get_rdp_status failed");
        anyhow::ensure!(
            resp.status() == Some(status::ROP_LEVEL_READ_VALID),
            "device could not read its protection level"
        );
        let raw = resp.payload().pread::<u8>(1)?;
        ProtectionLevel::try_from(raw)
            .map_err(|level| anyhow::format_err!("unknown protection level {}", level))
    }

    /// Requests a new read-out protection level. Dropping from level 1 to 0 erases the chip.
    pub fn set_protection_level(&mut self, level: u8) -> Result<()> {
        let resp = self.transfer(Command::change_rop_level(level))?;
        anyhow::ensure!(resp.is_ok(), "change_rop_level failed");
        anyhow::ensure!(
            resp.status() == Some(status::ROP_LEVEL_CHANGE_VALID),
            "device refused protection level {}",
            level
        );
        log::info!("Protection level set to {}", level);
        Ok(())
    }

    pub fn sector_protection(&mut self) -> Result<u16> {
        let resp = self.transfer(Command::SectorStatus)?;
        anyhow::ensure!(resp.is_ok(), "get_sector_protection_status failed");
        anyhow::ensure!(
            resp.status() == Some(status::SECTOR_STATUS_VALID),
            "device could not read write protection"
        );
        Ok(resp.payload().pread_with::<u16>(1, LE)?)
    }

    pub fn write_protect(&mut self, sectors: u16, enable: bool) -> Result<()> {
        let resp = self.transfer(Command::write_protect(sectors, enable))?;
        anyhow::ensure!(resp.is_ok(), "write_protect failed");
        anyhow::ensure!(
            resp.status() == Some(status::WRITE_PROTECT_CHANGE_VALID),
            "device refused write protection change of 0x{:04x}",
            sectors
        );
        Ok(())
    }

    pub fn erase(&mut self, sector: u8, count: u8) -> Result<()> {
        self.erase_with(Command::erase_sectors(sector, count))?;
        log::info!("Erased {} sector(s) from sector {}", count, sector);
        Ok(())
    }

    pub fn mass_erase(&mut self) -> Result<()> {
        self.erase_with(Command::mass_erase())?;
        log::info!("Flash mass erased");
        Ok(())
    }

    fn erase_with(&mut self, cmd: Command) -> Result<()> {
        let resp = self.transfer(cmd)?;
        anyhow::ensure!(resp.is_ok(), "erase failed");
        match resp.status() {
            Some(status::SUCCESSFUL_ERASE) => Ok(()),
            Some(status::INVALID_SECTOR_NUMBER) => anyhow::bail!("invalid sector number"),
            _ => anyhow::bail!("erase failed on the device"),
        }
    }

    /// Writes at most one request worth of data. The area must be erased.
    pub fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<()> {
        let resp = self.transfer(Command::memory_write(address, data.to_vec()))?;
        anyhow::ensure!(resp.is_ok(), "memory_write failed");
        match resp.payload() {
            [status::FLASH_PAYLOAD_WRITE_PASSED, status::FLASH_LOCK_WRITE_PASSED] => Ok(()),
            [_, status::FLASH_LOCK_WRITE_FAILED] => {
                anyhow::bail!("flash lock failed writing at 0x{:08x}", address)
            }
            [_, _] => anyhow::bail!("write failed at 0x{:08x}", address),
            _ => anyhow::bail!("write of {} bytes at 0x{:08x} rejected", data.len(), address),
        }
    }

    pub fn read_memory(&mut self, address: u32, len: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            let chunk = (len - out.len()).min(READ_CHUNK);
            let at = address + out.len() as u32;
            let resp = self.transfer(Command::memory_read(at, chunk as u8))?;
            anyhow::ensure!(resp.is_ok(), "memory_read failed");
            anyhow::ensure!(
                resp.status() == Some(status::ADDRESS_IS_VALID),
                "cannot read {} bytes at 0x{:08x}",
                chunk,
                at
            );
            anyhow::ensure!(resp.payload().len() == 1 + chunk, "short read at 0x{:08x}", at);
            out.extend_from_slice(&resp.payload()[1..]);
        }
        Ok(out)
    }

    pub fn read_otp(&mut self, block: u8) -> Result<OtpBlock> {
        let resp = self.transfer(Command::OtpRead { block })?;
        anyhow::ensure!(resp.is_ok(), "otp_read failed");
        anyhow::ensure!(
            resp.status() == Some(status::OTP_READ_VALID),
            "no OTP block {}",
            block
        );
        let payload = resp.payload();
        Ok(OtpBlock {
            locked: payload.pread::<u8>(1)? != 0,
            data: payload[2..].to_vec(),
        })
    }

    /// Asks the bootloader to branch to `address`. The session ends on success.
    pub fn jump(&mut self, address: u32) -> Result<()> {
        let resp = self.transfer(Command::jump_to_address(address))?;
        anyhow::ensure!(resp.is_ok(), "jump_to_address failed");
        anyhow::ensure!(
            resp.status() == Some(status::ADDRESS_IS_VALID),
            "device refused to jump to 0x{:08x}",
            address
        );
        log::info!("Device jumped to 0x{:08x}", address);
        Ok(())
    }

    /// Erases the sectors covering `image`, then programs it at `address`.
    pub fn flash(&mut self, device: &Device, address: u32, image: &[u8]) -> Result<()> {
        anyhow::ensure!(!image.is_empty(), "empty firmware image");
        anyhow::ensure!(
            device.is_application_flash(address, image.len() as u32),
            "image of {} bytes at 0x{:08x} does not fit application flash",
            image.len(),
            address
        );
        let (first, count) = covering_sectors(device, address, image.len() as u32)?;
        self.erase(first, count)?;

        let bar = ProgressBar::new(image.len() as u64);
        for (i, chunk) in image.chunks(WRITE_CHUNK).enumerate() {
            let at = address + (i * WRITE_CHUNK) as u32;
            self.write_memory(at, chunk)?;
            bar.inc(chunk.len() as u64);
        }
        bar.finish();
        log::info!("Programmed {} bytes at 0x{:08x}", image.len(), address);
        Ok(())
    }

    pub fn verify(&mut self, address: u32, image: &[u8]) -> Result<()> {
        let read = self.read_memory(address, image.len())?;
        if let Some(offset) = read.iter().zip(image).position(|(a, b)| a != b) {
            anyhow::bail!("verify failed at 0x{:08x}", address + offset as u32);
        }
        log::info!("Verified {} bytes", image.len());
        Ok(())
    }
}

/// Sectors touched by `[address, address + len)`, as `(first, count)`.
pub fn covering_sectors(device: &Device, address: u32, len: u32) -> Result<(u8, u8)> {
    let start = u64::from(address);
    let end = start + u64::from(len);
    let touched: Vec<u8> = (0..device.sector_count())
        .filter(|&i| {
            device
                .sector_range(i, 1)
                .is_some_and(|r| r.start < end && start < r.end)
        })
        .collect();
    match (touched.first(), touched.last()) {
        (Some(&first), Some(&last)) => Ok((first, last - first + 1)),
        _ => anyhow::bail!("0x{:08x} is not in flash", address),
    }
}

fn transfer<T: Transport>(transport: &mut T, cmd: Command) -> Result<Response> {
    let req = cmd.into_raw()?;
    log::debug!("=> {}", hex::encode(&req));
    transport.write(&req)?;

    let mut head = [0u8; 1];
    anyhow::ensure!(transport.read_full(&mut head)? == 1, "no response from bootloader");
    let resp = match head[0] {
        NACK => Response::Nack,
        ACK => {
            let mut len = [0u8; 1];
            anyhow::ensure!(transport.read_full(&mut len)? == 1, "response length missing");
            let mut payload = vec![0u8; usize::from(len[0])];
            let n = transport.read_full(&mut payload)?;
            anyhow::ensure!(n == payload.len(), "Invalid response length");
            Response::Ack(payload)
        }
        other => anyhow::bail!("unexpected response byte 0x{:02x}", other),
    };
    log::debug!("<= {:?}", resp);
    Ok(resp)
}
