//! The command protocol engine: one request in, one response out.
use anyhow::Result;
use scroll::{LE, Pread};

use crate::constants::{
    CRC_LEN, ERASE_OK_SENTINEL, MASS_ERASE, MAX_REPLY_LEN, NACK, VERSION_MAJOR, VERSION_MINOR,
    VERSION_PATCH, commands, status,
};
use crate::device::Device;
use crate::flash::{EraseTarget, FlashController, FlashUnlock, ProtectionLevel};
use crate::integrity::{self, IntegrityChecker, Stm32Crc, Verification};
use crate::launcher::{Launch, Launcher};
use crate::protocol::{self, Command, ProtocolError};
use crate::transport::Transport;

/// Receive buffer for one request. The first slot holds the length byte.
pub struct FrameBuffer {
    buf: Box<[u8]>,
}

impl FrameBuffer {
    pub fn new(capacity: usize) -> Self {
        FrameBuffer {
            buf: vec![0u8; capacity].into_boxed_slice(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Longest `len` a request may declare.
    pub fn max_frame_len(&self) -> usize {
        self.buf.len().saturating_sub(1)
    }
}

/// Why a request was answered with a bare NACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackReason {
    CrcMismatch,
    UnknownOpcode(u8),
    /// Declared length cannot hold a command and its CRC, or overflows the buffer.
    BadLength(u8),
}

/// What [`Bootloader::process_one_request`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing received, or a zero length byte.
    Idle,
    /// The transport delivered fewer bytes than declared. Nothing was sent.
    Incomplete { expected: usize, received: usize },
    Nack(NackReason),
    /// An ACK carrying the handler's reply was sent.
    Replied { opcode: u8 },
    /// The reply was sent and control handed to the launcher.
    Launched(Launch),
}

struct Reply {
    payload: Vec<u8>,
    launch: Option<Launch>,
}

impl Reply {
    fn status(status: u8) -> Self {
        Reply {
            payload: vec![status],
            launch: None,
        }
    }
}

impl From<Vec<u8>> for Reply {
    fn from(payload: Vec<u8>) -> Self {
        Reply {
            payload,
            launch: None,
        }
    }
}

pub struct Bootloader<T, F, L, C = Stm32Crc> {
    device: Device,
    transport: T,
    flash: F,
    launcher: L,
    checker: C,
}

impl<T, F, L> Bootloader<T, F, L, Stm32Crc>
where
    T: Transport,
    F: FlashController,
    L: Launcher,
{
    pub fn new(device: Device, transport: T, flash: F, launcher: L) -> Self {
        Self::with_checker(device, transport, flash, launcher, Stm32Crc)
    }
}

impl<T, F, L, C> Bootloader<T, F, L, C>
where
    T: Transport,
    F: FlashController,
    L: Launcher,
    C: IntegrityChecker,
{
    pub fn with_checker(device: Device, transport: T, flash: F, launcher: L, checker: C) -> Self {
        Bootloader {
            device,
            transport,
            flash,
            launcher,
            checker,
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    /// A receive buffer sized for this device.
    pub fn new_buffer(&self) -> FrameBuffer {
        FrameBuffer::new(self.device.rx_buffer_len)
    }

    /// Serves requests until control is handed over or the transport fails.
    pub fn run(&mut self) -> Result<Launch> {
        let mut buffer = self.new_buffer();
        loop {
            if let Outcome::Launched(launch) = self.process_one_request(&mut buffer)? {
                return Ok(launch);
            }
        }
    }

    /// Starts the resident application if its vector table looks sane.
    pub fn launch_application(&mut self) -> Result<()> {
        let base = self.device.application_base;
        let mut vectors = [0u8; 8];
        self.flash.read(base, &mut vectors)?;
        let sp: u32 = vectors.pread_with(0, LE)?;
        let reset: u32 = vectors.pread_with(4, LE)?;
        log::debug!("application vectors: sp = 0x{:08x}, reset = 0x{:08x}", sp, reset);

        anyhow::ensure!(
            self.device.is_stack_top(sp),
            "no application: initial stack pointer 0x{:08x} is outside SRAM",
            sp
        );
        anyhow::ensure!(
            self.device.is_application_flash(reset & !1, 2),
            "no application: reset vector 0x{:08x} is outside application flash",
            reset
        );
        self.launcher.boot_application(base);
        Ok(())
    }

    /// Receives, checks and answers a single request.
    pub fn process_one_request(&mut self, buffer: &mut FrameBuffer) -> Result<Outcome> {
        buffer.buf.fill(0);
        let max_len = buffer.max_frame_len();

        if self.transport.read(&mut buffer.buf[..1])? == 0 {
            return Ok(Outcome::Idle);
        }
        let declared = buffer.buf[0];
        let len = usize::from(declared);
        if len == 0 {
            return Ok(Outcome::Idle);
        }

        if len > max_len {
            log::warn!("frame of {} bytes exceeds the {} byte buffer", len, max_len);
            self.discard(&mut buffer.buf[1..], len)?;
            return self.nack(NackReason::BadLength(declared));
        }

        let frame = &mut buffer.buf[1..=len];
        let received = self.transport.read_full(frame)?;
        if received < len {
            log::warn!("short frame: expected {} bytes, got {}", len, received);
            return Ok(Outcome::Incomplete {
                expected: len,
                received,
            });
        }
        log::debug!("=> {:02x}{}", declared, hex::encode(&frame[..]));

        if len < 1 + CRC_LEN {
            log::warn!("frame of {} bytes cannot hold a command", len);
            return self.nack(NackReason::BadLength(declared));
        }

        let (body, trailer) = frame.split_at(len - CRC_LEN);
        let host_crc: u32 = trailer.pread_with(0, LE)?;
        if integrity::verify(&mut self.checker, body, host_crc) == Verification::Failed {
            log::warn!("CRC verification failed");
            return self.nack(NackReason::CrcMismatch);
        }

        let opcode = body[0];
        let reply = match Command::parse(opcode, &body[1..]) {
            Ok(cmd) => self.dispatch(cmd)?,
            Err(ProtocolError::UnknownOpcode(op)) => {
                log::warn!("unknown command 0x{:02x}", op);
                return self.nack(NackReason::UnknownOpcode(op));
            }
            Err(e) => {
                log::warn!("{}", e);
                Reply::from(rejection(opcode))
            }
        };

        self.send_ack(&reply.payload)?;
        match reply.launch {
            Some(launch) => {
                match launch {
                    Launch::Jump(address) => self.launcher.jump(address),
                    Launch::Application(vector_table) => self.launcher.boot_application(vector_table),
                }
                Ok(Outcome::Launched(launch))
            }
            None => Ok(Outcome::Replied { opcode }),
        }
    }

    fn discard(&mut self, scratch: &mut [u8], mut remaining: usize) -> Result<()> {
        while remaining > 0 {
            let chunk = remaining.min(scratch.len());
            match self.transport.read_full(&mut scratch[..chunk])? {
                0 => break,
                n => remaining -= n,
            }
        }
        Ok(())
    }

    fn nack(&mut self, reason: NackReason) -> Result<Outcome> {
        log::debug!("<= {:02x}", NACK);
        self.transport.write(&[NACK])?;
        Ok(Outcome::Nack(reason))
    }

    fn send_ack(&mut self, payload: &[u8]) -> Result<()> {
        let raw = protocol::ack(payload)?;
        log::debug!("<= {}", hex::encode(&raw));
        self.transport.write(&raw)
    }

    fn dispatch(&mut self, cmd: Command) -> Result<Reply> {
        log::debug!("command: {:?}", cmd);
        let reply: Reply = match cmd {
            Command::GetVersion => vec![VERSION_MAJOR, VERSION_MINOR, VERSION_PATCH].into(),
            Command::GetHelp => commands::ALL.to_vec().into(),
            Command::GetChipId => self.device.chip_id.to_le_bytes().to_vec().into(),
            Command::GetRdpStatus => self.read_protection_level(),
            Command::JumpToAddress { address } => self.jump_to_address(address),
            Command::EraseFlash { sector, count } => {
                Reply::status(self.perform_flash_erase(sector, count))
            }
            Command::MemoryWrite { address, data } => self.memory_write(address, &data),
            Command::WriteProtect { sectors, mode } => {
                Reply::status(self.change_write_protection(sectors, mode))
            }
            Command::MemoryRead { address, len } => self.memory_read(address, len),
            Command::SectorStatus => self.sector_protection_status(),
            Command::OtpRead { block } => self.read_otp(block),
            Command::ChangeRopLevel { level } => {
                Reply::status(self.change_read_protection_level(level))
            }
        };
        Ok(reply)
    }

    fn read_protection_level(&mut self) -> Reply {
        match self.flash.protection_level() {
            Ok(level) => vec![status::ROP_LEVEL_READ_VALID, u8::from(level)].into(),
            Err(e) => {
                log::warn!("reading protection level: {}", e);
                Reply::status(status::ROP_LEVEL_READ_INVALID)
            }
        }
    }

    fn jump_to_address(&mut self, address: u32) -> Reply {
        if !self.device.validate_address(address).is_valid() {
            log::warn!("refusing to jump to 0x{:08x}", address);
            return Reply::status(status::ADDRESS_IS_INVALID);
        }
        Reply {
            payload: vec![status::ADDRESS_IS_VALID],
            launch: Some(Launch::Jump(address)),
        }
    }

    /// Erases the validated sector range, or everything for [`MASS_ERASE`].
    fn perform_flash_erase(&mut self, sector: u8, count: u8) -> u8 {
        let target = if sector == MASS_ERASE {
            log::warn!("mass erase requested, bootloader sectors included");
            EraseTarget::Mass
        } else {
            let max = u16::from(self.device.sector_count());
            let in_range = count > 0
                && u16::from(sector) < max
                && u16::from(sector) + u16::from(count) <= max;
            if !in_range {
                log::warn!("invalid erase of {} sectors from {}", count, sector);
                return status::INVALID_SECTOR_NUMBER;
            }
            if sector < self.device.bootloader_sectors() {
                log::warn!("sector {} holds the bootloader", sector);
                return status::INVALID_SECTOR_NUMBER;
            }
            EraseTarget::Sectors {
                first: sector,
                count,
            }
        };

        let mut flash = match FlashUnlock::acquire(&mut self.flash) {
            Ok(flash) => flash,
            Err(e) => {
                log::warn!("erase: {}", e);
                return status::UNSUCCESSFUL_ERASE;
            }
        };
        let result = flash.erase(target);
        let relocked = flash.release();

        if result != ERASE_OK_SENTINEL {
            log::warn!("erase of {:?} failed at sector {}", target, result);
            return status::UNSUCCESSFUL_ERASE;
        }
        if let Err(e) = relocked {
            log::warn!("erase: {}", e);
            return status::UNSUCCESSFUL_ERASE;
        }
        log::info!("Erased {:?}", target);
        status::SUCCESSFUL_ERASE
    }

    fn memory_write(&mut self, address: u32, data: &[u8]) -> Reply {
        if data.is_empty() {
            return Reply::status(status::FLASH_PAYLOAD_WRITE_FAILED);
        }
        if !self.device.is_application_flash(address, data.len() as u32) {
            log::warn!("refusing to write {} bytes at 0x{:08x}", data.len(), address);
            return Reply::status(status::ADDRESS_IS_INVALID);
        }

        let mut flash = match FlashUnlock::acquire(&mut self.flash) {
            Ok(flash) => flash,
            Err(e) => {
                log::warn!("write: {}", e);
                return vec![
                    status::FLASH_PAYLOAD_WRITE_FAILED,
                    status::FLASH_LOCK_WRITE_FAILED,
                ]
                .into();
            }
        };

        let mut payload_status = status::FLASH_PAYLOAD_WRITE_PASSED;
        for (offset, &byte) in data.iter().enumerate() {
            if let Err(e) = flash.program(address + offset as u32, byte) {
                log::warn!("write aborted: {}", e);
                payload_status = status::FLASH_PAYLOAD_WRITE_FAILED;
                break;
            }
        }

        let lock_status = match flash.release() {
            Ok(()) => status::FLASH_LOCK_WRITE_PASSED,
            Err(e) => {
                log::warn!("write: {}", e);
                status::FLASH_LOCK_WRITE_FAILED
            }
        };
        if payload_status == status::FLASH_PAYLOAD_WRITE_PASSED {
            log::info!("Wrote {} bytes at 0x{:08x}", data.len(), address);
        }
        vec![payload_status, lock_status].into()
    }

    fn change_write_protection(&mut self, sectors: u16, mode: u8) -> u8 {
        let enable = match mode {
            0 => false,
            1 => true,
            _ => return status::WRITE_PROTECT_CHANGE_INVALID,
        };
        let existing = (1u32 << self.device.sector_count()) - 1;
        if sectors == 0 || u32::from(sectors) & !existing != 0 {
            log::warn!("invalid write protection mask 0x{:04x}", sectors);
            return status::WRITE_PROTECT_CHANGE_INVALID;
        }
        match self.flash.set_write_protection(sectors, enable) {
            Ok(()) => {
                log::info!(
                    "Write protection {} for sectors 0x{:04x}",
                    if enable { "applied" } else { "removed" },
                    sectors
                );
                status::WRITE_PROTECT_CHANGE_VALID
            }
            Err(e) => {
                log::warn!("write protection: {}", e);
                status::WRITE_PROTECT_CHANGE_INVALID
            }
        }
    }

    fn memory_read(&mut self, address: u32, len: u8) -> Reply {
        let len = usize::from(len);
        if len == 0 || len >= MAX_REPLY_LEN || !self.device.is_readable(address, len as u32) {
            log::warn!("refusing to read {} bytes at 0x{:08x}", len, address);
            return Reply::status(status::ADDRESS_IS_INVALID);
        }
        let mut payload = vec![0u8; 1 + len];
        match self.flash.read(address, &mut payload[1..]) {
            Ok(()) => {
                payload[0] = status::ADDRESS_IS_VALID;
                payload.into()
            }
            Err(e) => {
                log::warn!("read: {}", e);
                Reply::status(status::ADDRESS_IS_INVALID)
            }
        }
    }

    fn sector_protection_status(&mut self) -> Reply {
        match self.flash.write_protection() {
            Ok(mask) => {
                let [lo, hi] = mask.to_le_bytes();
                vec![status::SECTOR_STATUS_VALID, lo, hi].into()
            }
            Err(e) => {
                log::warn!("reading write protection: {}", e);
                Reply::status(status::SECTOR_STATUS_INVALID)
            }
        }
    }

    fn read_otp(&mut self, block: u8) -> Reply {
        let Some((data, lock)) = self.device.otp_block(block) else {
            return Reply::status(status::OTP_READ_INVALID);
        };
        let mut payload = vec![0u8; 2 + self.device.otp.block_size as usize];
        let mut lock_byte = [0u8; 1];
        let read = self
            .flash
            .read(lock, &mut lock_byte)
            .and_then(|()| self.flash.read(data, &mut payload[2..]));
        match read {
            Ok(()) => {
                payload[0] = status::OTP_READ_VALID;
                payload[1] = (lock_byte[0] == 0x00) as u8;
                payload.into()
            }
            Err(e) => {
                log::warn!("OTP read: {}", e);
                Reply::status(status::OTP_READ_INVALID)
            }
        }
    }

    /// Never clamps or retries: an out-of-set level is refused before the hardware is touched.
    fn change_read_protection_level(&mut self, level: u8) -> u8 {
        let Ok(requested) = ProtectionLevel::try_from(level) else {
            log::warn!("invalid protection level {}", level);
            return status::ROP_LEVEL_CHANGE_INVALID;
        };
        if requested == ProtectionLevel::Level2 && !self.device.allow_irreversible_protection {
            log::warn!("{} is permanent and not enabled for this device", requested);
            return status::ROP_LEVEL_CHANGE_INVALID;
        }
        match self.flash.set_protection_level(requested) {
            Ok(()) => {
                log::info!("Protection changed to {}", requested);
                status::ROP_LEVEL_CHANGE_VALID
            }
            Err(e) => {
                log::warn!("changing protection level: {}", e);
                status::ROP_LEVEL_CHANGE_INVALID
            }
        }
    }
}

/// Reply to a command whose arguments could not be decoded.
fn rejection(opcode: u8) -> Vec<u8> {
    let status = match opcode {
        commands::JUMP_TO_ADDRESS | commands::MEMORY_READ => status::ADDRESS_IS_INVALID,
        commands::ERASE_FLASH => status::INVALID_SECTOR_NUMBER,
        commands::MEMORY_WRITE => status::FLASH_PAYLOAD_WRITE_FAILED,
        commands::WRITE_PROTECT => status::WRITE_PROTECT_CHANGE_INVALID,
        commands::OTP_READ => status::OTP_READ_INVALID,
        commands::CHANGE_ROP_LEVEL => status::ROP_LEVEL_CHANGE_INVALID,
        _ => return vec![],
    };
    vec![status]
}
