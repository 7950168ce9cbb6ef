//! In-memory flash controller with NOR semantics.
use crate::constants::ERASE_OK_SENTINEL;
use crate::device::Device;
use crate::flash::{EraseTarget, FlashController, FlashError, ProtectionLevel};

/// Calls made into the simulated controller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlashStats {
    pub unlocks: usize,
    pub locks: usize,
    pub erases: Vec<EraseTarget>,
    pub programs: usize,
    pub level_changes: Vec<ProtectionLevel>,
    pub write_protection_changes: usize,
}

impl FlashStats {
    /// Whether any primitive that alters flash or option bytes was called.
    pub fn mutated(&self) -> bool {
        !self.erases.is_empty()
            || self.programs > 0
            || !self.level_changes.is_empty()
            || self.write_protection_changes > 0
    }
}

struct Bank {
    base: u32,
    data: Vec<u8>,
}

impl Bank {
    fn slice_mut(&mut self, address: u32, len: usize) -> Option<&mut [u8]> {
        let offset = address.checked_sub(self.base)? as usize;
        self.data.get_mut(offset..offset.checked_add(len)?)
    }
}

/// Flash, SRAM and OTP of a [`Device`], kept in memory.
///
/// Programming can only clear bits, like real NOR flash; setting a bit back
/// requires an erase. Faults can be injected to exercise error paths.
pub struct SimulatedFlash {
    sectors: Vec<(u32, u32)>,
    flash: Bank,
    sram: Vec<Bank>,
    otp: Bank,
    otp_lock: Bank,
    locked: bool,
    level: ProtectionLevel,
    write_protected: u16,
    fail_unlock: bool,
    fail_lock: bool,
    fail_program_at: Option<u32>,
    fail_erase_of: Option<u8>,
    fail_option_read: bool,
    stats: FlashStats,
}

impl SimulatedFlash {
    /// Erased flash, zeroed SRAM, blank OTP, level 0 and no write protection.
    pub fn new(device: &Device) -> Self {
        let mut sectors = Vec::with_capacity(device.flash.sectors.len());
        let mut start = device.flash.base;
        for &size in &device.flash.sectors {
            sectors.push((start, size));
            start = start.wrapping_add(size);
        }
        let otp_len = usize::from(device.otp.blocks) * device.otp.block_size as usize;
        SimulatedFlash {
            sectors,
            flash: Bank {
                base: device.flash.base,
                data: vec![0xff; device.flash_size() as usize],
            },
            sram: device
                .sram
                .iter()
                .map(|bank| Bank {
                    base: bank.base,
                    data: vec![0; bank.size as usize],
                })
                .collect(),
            otp: Bank {
                base: device.otp.base,
                data: vec![0xff; otp_len],
            },
            otp_lock: Bank {
                base: device.otp.lock_base,
                data: vec![0xff; usize::from(device.otp.blocks)],
            },
            locked: true,
            level: ProtectionLevel::Level0,
            write_protected: 0,
            fail_unlock: false,
            fail_lock: false,
            fail_program_at: None,
            fail_erase_of: None,
            fail_option_read: false,
            stats: FlashStats::default(),
        }
    }

    pub fn stats(&self) -> &FlashStats {
        &self.stats
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn level(&self) -> ProtectionLevel {
        self.level
    }

    pub fn fail_unlock(&mut self, fail: bool) {
        self.fail_unlock = fail;
    }

    pub fn fail_lock(&mut self, fail: bool) {
        self.fail_lock = fail;
    }

    /// Make programming the byte at `address` report an error.
    pub fn fail_program_at(&mut self, address: Option<u32>) {
        self.fail_program_at = address;
    }

    /// Make erasing `sector` fail.
    pub fn fail_erase_of(&mut self, sector: Option<u8>) {
        self.fail_erase_of = sector;
    }

    /// Make reading the protection level and write protection mask fail.
    pub fn fail_option_read(&mut self, fail: bool) {
        self.fail_option_read = fail;
    }

    /// Places `data` in flash, SRAM or OTP directly, bypassing the controller.
    pub fn load(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError> {
        let dst = self
            .bank_mut(address, data.len())
            .ok_or(FlashError::Unmapped(address))?;
        dst.copy_from_slice(data);
        Ok(())
    }

    /// Locks an OTP block the way writing `0x00` to its lock byte does.
    pub fn lock_otp_block(&mut self, block: u8) -> Result<(), FlashError> {
        let address = self.otp_lock.base + u32::from(block);
        let byte = self
            .otp_lock
            .slice_mut(address, 1)
            .ok_or(FlashError::Unmapped(address))?;
        byte[0] = 0x00;
        Ok(())
    }

    /// Copy of `len` bytes at `address`, if mapped.
    pub fn contents(&mut self, address: u32, len: usize) -> Option<Vec<u8>> {
        self.bank_mut(address, len).map(|s| s.to_vec())
    }

    fn bank_mut(&mut self, address: u32, len: usize) -> Option<&mut [u8]> {
        let index = std::iter::once(&self.flash)
            .chain(self.sram.iter())
            .chain([&self.otp, &self.otp_lock])
            .position(|bank| {
                address >= bank.base
                    && (address - bank.base) as usize + len <= bank.data.len()
            })?;
        let bank = match index {
            0 => &mut self.flash,
            i if i <= self.sram.len() => &mut self.sram[i - 1],
            i if i == self.sram.len() + 1 => &mut self.otp,
            _ => &mut self.otp_lock,
        };
        bank.slice_mut(address, len)
    }

    fn sector_of(&self, address: u32) -> Option<u8> {
        self.sectors
            .iter()
            .position(|&(start, size)| {
                address >= start && u64::from(address) < u64::from(start) + u64::from(size)
            })
            .map(|i| i as u8)
    }

    fn erase_sector(&mut self, sector: u8) -> bool {
        if self.fail_erase_of == Some(sector) || self.write_protected & (1 << sector) != 0 {
            return false;
        }
        let Some(&(start, size)) = self.sectors.get(usize::from(sector)) else {
            return false;
        };
        match self.flash.slice_mut(start, size as usize) {
            Some(data) => {
                data.fill(0xff);
                true
            }
            None => false,
        }
    }
}

impl FlashController for SimulatedFlash {
    fn unlock(&mut self) -> Result<(), FlashError> {
        self.stats.unlocks += 1;
        if self.fail_unlock {
            return Err(FlashError::UnlockRejected);
        }
        self.locked = false;
        Ok(())
    }

    fn lock(&mut self) -> Result<(), FlashError> {
        self.stats.locks += 1;
        if self.fail_lock {
            return Err(FlashError::LockFailed);
        }
        self.locked = true;
        Ok(())
    }

    fn erase(&mut self, target: EraseTarget) -> u32 {
        self.stats.erases.push(target);
        let (first, count) = match target {
            EraseTarget::Mass => (0, self.sectors.len() as u8),
            EraseTarget::Sectors { first, count } => (first, count),
        };
        if self.locked {
            return u32::from(first);
        }
        if matches!(target, EraseTarget::Mass) && self.write_protected != 0 {
            return self.write_protected.trailing_zeros();
        }
        for sector in first..first.saturating_add(count) {
            if !self.erase_sector(sector) {
                return u32::from(sector);
            }
        }
        ERASE_OK_SENTINEL
    }

    fn program(&mut self, address: u32, value: u8) -> Result<(), FlashError> {
        self.stats.programs += 1;
        if self.locked {
            return Err(FlashError::Locked);
        }
        let sector = self.sector_of(address).ok_or(FlashError::Unmapped(address))?;
        if self.write_protected & (1 << sector) != 0 {
            return Err(FlashError::WriteProtected(sector));
        }
        if self.fail_program_at == Some(address) {
            return Err(FlashError::Program(address));
        }
        let cell = self
            .flash
            .slice_mut(address, 1)
            .ok_or(FlashError::Unmapped(address))?;
        let programmed = cell[0] & value;
        cell[0] = programmed;
        if programmed != value {
            return Err(FlashError::Program(address));
        }
        Ok(())
    }

    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        let src = self
            .bank_mut(address, buf.len())
            .ok_or(FlashError::Unmapped(address))?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn protection_level(&mut self) -> Result<ProtectionLevel, FlashError> {
        if self.fail_option_read {
            return Err(FlashError::OptionBytes);
        }
        Ok(self.level)
    }

    fn set_protection_level(&mut self, level: ProtectionLevel) -> Result<(), FlashError> {
        self.stats.level_changes.push(level);
        if self.level == ProtectionLevel::Level2 {
            return Err(FlashError::Irreversible);
        }
        if self.level == ProtectionLevel::Level1 && level == ProtectionLevel::Level0 {
            // regression to level 0 wipes the whole array
            self.flash.data.fill(0xff);
        }
        self.level = level;
        Ok(())
    }

    fn write_protection(&mut self) -> Result<u16, FlashError> {
        if self.fail_option_read {
            return Err(FlashError::OptionBytes);
        }
        Ok(self.write_protected)
    }

    fn set_write_protection(&mut self, sectors: u16, enable: bool) -> Result<(), FlashError> {
        self.stats.write_protection_changes += 1;
        if self.level == ProtectionLevel::Level2 {
            return Err(FlashError::OptionBytes);
        }
        if enable {
            self.write_protected |= sectors;
        } else {
            self.write_protected &= !sectors;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flash() -> SimulatedFlash {
        SimulatedFlash::new(&Device::builtin().unwrap())
    }

    #[test]
    fn programming_only_clears_bits() {
        let mut f = flash();
        f.unlock().unwrap();
        f.program(0x0800_8000, 0xf0).unwrap();
        f.program(0x0800_8000, 0x30).unwrap();
        assert_eq!(f.program(0x0800_8000, 0x0f), Err(FlashError::Program(0x0800_8000)));
        assert_eq!(f.contents(0x0800_8000, 1), Some(vec![0x00]));
    }

    #[test]
    fn locked_flash_refuses_changes() {
        let mut f = flash();
        assert_eq!(f.program(0x0800_8000, 0), Err(FlashError::Locked));
        assert_ne!(f.erase(EraseTarget::Sectors { first: 5, count: 1 }), ERASE_OK_SENTINEL);
    }

    #[test]
    fn erase_restores_sector() {
        let mut f = flash();
        f.load(0x0802_0000, &[0u8; 16]).unwrap();
        f.unlock().unwrap();
        assert_eq!(f.erase(EraseTarget::Sectors { first: 5, count: 1 }), ERASE_OK_SENTINEL);
        assert_eq!(f.contents(0x0802_0000, 16), Some(vec![0xff; 16]));
    }

    #[test]
    fn write_protected_sector_fails_erase() {
        let mut f = flash();
        f.set_write_protection(1 << 6, true).unwrap();
        f.unlock().unwrap();
        assert_eq!(f.erase(EraseTarget::Sectors { first: 5, count: 3 }), 6);
        assert_eq!(f.erase(EraseTarget::Mass), 6);
        assert_eq!(f.program(0x0804_0000, 0), Err(FlashError::WriteProtected(6)));
    }

    #[test]
    fn level_regression_wipes_flash() {
        let mut f = flash();
        f.load(0x0800_8000, &[0x12, 0x34]).unwrap();
        f.set_protection_level(ProtectionLevel::Level1).unwrap();
        assert_eq!(f.contents(0x0800_8000, 2), Some(vec![0x12, 0x34]));
        f.set_protection_level(ProtectionLevel::Level0).unwrap();
        assert_eq!(f.contents(0x0800_8000, 2), Some(vec![0xff, 0xff]));
    }

    #[test]
    fn level_two_is_final() {
        let mut f = flash();
        f.set_protection_level(ProtectionLevel::Level2).unwrap();
        assert_eq!(
            f.set_protection_level(ProtectionLevel::Level0),
            Err(FlashError::Irreversible)
        );
        assert_eq!(f.level(), ProtectionLevel::Level2);
    }

    #[test]
    fn reads_cover_ram_and_otp() {
        let mut f = flash();
        f.load(0x2000_0010, &[1, 2, 3]).unwrap();
        let mut buf = [0u8; 3];
        f.read(0x2000_0010, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3]);
        f.read(0x1fff_7800, &mut buf).unwrap();
        assert_eq!(buf, [0xff; 3]);
        assert_eq!(f.read(0x3000_0000, &mut buf), Err(FlashError::Unmapped(0x3000_0000)));
    }
}
