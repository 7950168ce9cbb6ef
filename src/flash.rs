//! Flash controller primitives and the scoped unlock discipline.
use std::{
    fmt,
    ops::{Deref, DerefMut},
};

/// Read-out protection (RDP) level. Level 2 cannot be left once entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProtectionLevel {
    Level0,
    Level1,
    Level2,
}

impl TryFrom<u8> for ProtectionLevel {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ProtectionLevel::Level0),
            1 => Ok(ProtectionLevel::Level1),
            2 => Ok(ProtectionLevel::Level2),
            other => Err(other),
        }
    }
}

impl From<ProtectionLevel> for u8 {
    fn from(level: ProtectionLevel) -> Self {
        match level {
            ProtectionLevel::Level0 => 0,
            ProtectionLevel::Level1 => 1,
            ProtectionLevel::Level2 => 2,
        }
    }
}

impl fmt::Display for ProtectionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RDP level {}", u8::from(*self))
    }
}

/// What an erase primitive call covers. Only ever built from validated arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EraseTarget {
    Mass,
    Sectors { first: u8, count: u8 },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FlashError {
    #[error("flash controller is locked")]
    Locked,
    #[error("flash unlock sequence rejected")]
    UnlockRejected,
    #[error("flash lock failed")]
    LockFailed,
    #[error("programming failed at 0x{0:08x}")]
    Program(u32),
    #[error("sector {0} is write protected")]
    WriteProtected(u8),
    #[error("address 0x{0:08x} is not backed by memory")]
    Unmapped(u32),
    #[error("read protection level 2 is permanent")]
    Irreversible,
    #[error("option byte operation failed")]
    OptionBytes,
}

/// Primitives exposed by the flash controller.
///
/// Programming and erasing require the controller to be unlocked; callers go
/// through [`FlashUnlock`] so that the lock is restored on every path.
pub trait FlashController {
    fn unlock(&mut self) -> Result<(), FlashError>;
    fn lock(&mut self) -> Result<(), FlashError>;

    /// Returns [`crate::constants::ERASE_OK_SENTINEL`] when every sector was
    /// erased, otherwise the number of the sector that failed.
    fn erase(&mut self, target: EraseTarget) -> u32;

    /// Programs one unit (a byte).
    fn program(&mut self, address: u32, value: u8) -> Result<(), FlashError>;

    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), FlashError>;

    fn protection_level(&mut self) -> Result<ProtectionLevel, FlashError>;
    fn set_protection_level(&mut self, level: ProtectionLevel) -> Result<(), FlashError>;

    /// Bit `n` set means sector `n` is write protected.
    fn write_protection(&mut self) -> Result<u16, FlashError>;
    fn set_write_protection(&mut self, sectors: u16, enable: bool) -> Result<(), FlashError>;
}

/// Unlocked flash controller, locked again when released or dropped.
pub struct FlashUnlock<'a, F: FlashController> {
    flash: &'a mut F,
    released: bool,
}

impl<'a, F: FlashController> FlashUnlock<'a, F> {
    pub fn acquire(flash: &'a mut F) -> Result<Self, FlashError> {
        if let Err(e) = flash.unlock() {
            // a rejected key sequence may leave the controller in either state
            if let Err(relock) = flash.lock() {
                log::warn!("relock after rejected unlock failed: {}", relock);
            }
            return Err(e);
        }
        Ok(FlashUnlock {
            flash,
            released: false,
        })
    }

    /// Locks the controller now and reports whether that worked.
    pub fn release(mut self) -> Result<(), FlashError> {
        self.released = true;
        self.flash.lock()
    }
}

impl<F: FlashController> Deref for FlashUnlock<'_, F> {
    type Target = F;

    fn deref(&self) -> &F {
        self.flash
    }
}

impl<F: FlashController> DerefMut for FlashUnlock<'_, F> {
    fn deref_mut(&mut self) -> &mut F {
        self.flash
    }
}

impl<F: FlashController> Drop for FlashUnlock<'_, F> {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.flash.lock() {
                log::error!("flash left unlocked: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Device, emulator::SimulatedFlash};

    fn flash() -> SimulatedFlash {
        SimulatedFlash::new(&Device::builtin().unwrap())
    }

    #[test]
    fn protection_level_conversions() {
        assert_eq!(ProtectionLevel::try_from(2), Ok(ProtectionLevel::Level2));
        assert_eq!(ProtectionLevel::try_from(3), Err(3));
        assert_eq!(u8::from(ProtectionLevel::Level1), 1);
        assert!(ProtectionLevel::Level0 < ProtectionLevel::Level2);
    }

    #[test]
    fn guard_relocks_on_drop() {
        let mut flash = flash();
        {
            let mut unlocked = FlashUnlock::acquire(&mut flash).unwrap();
            assert!(!unlocked.is_locked());
            unlocked.program(0x0800_8000, 0x12).unwrap();
        }
        assert!(flash.is_locked());
        assert_eq!(flash.stats().unlocks, 1);
        assert_eq!(flash.stats().locks, 1);
    }

    #[test]
    fn release_reports_lock_failure() {
        let mut flash = flash();
        flash.fail_lock(true);
        let unlocked = FlashUnlock::acquire(&mut flash).unwrap();
        assert_eq!(unlocked.release(), Err(FlashError::LockFailed));
        assert_eq!(flash.stats().locks, 1);
    }

    #[test]
    fn rejected_unlock_leaves_flash_locked() {
        let mut flash = flash();
        flash.fail_unlock(true);
        assert!(FlashUnlock::acquire(&mut flash).is_err());
        assert!(flash.is_locked());
    }

    #[test]
    fn rejected_unlock_with_failing_relock_reports_the_unlock_error() {
        let mut flash = flash();
        flash.fail_unlock(true);
        flash.fail_lock(true);
        assert_eq!(
            FlashUnlock::acquire(&mut flash).err(),
            Some(FlashError::UnlockRejected)
        );
        assert_eq!(flash.stats().locks, 1);
    }
}
