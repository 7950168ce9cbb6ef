//! Frame integrity checking.
use ::crc::{CRC_32_MPEG_2, Crc};

const STM32_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);

/// Computes the 32-bit CRC a host appends to every request.
pub trait IntegrityChecker {
    fn crc32(&mut self, data: &[u8]) -> u32;
}

/// Software model of the STM32 CRC unit.
///
/// The peripheral only accepts 32-bit words, so the bootloader feeds every
/// byte as its own word. The unit itself is CRC-32/MPEG-2, starting from
/// `0xFFFFFFFF` after each reset.
#[derive(Debug, Clone, Copy, Default)]
pub struct Stm32Crc;

impl Stm32Crc {
    pub fn checksum(data: &[u8]) -> u32 {
        let mut digest = STM32_CRC.digest();
        for &byte in data {
            digest.update(&u32::from(byte).to_be_bytes());
        }
        digest.finalize()
    }
}

impl IntegrityChecker for Stm32Crc {
    fn crc32(&mut self, data: &[u8]) -> u32 {
        Self::checksum(data)
    }
}

/// Whether a received frame may be acted upon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    Passed,
    Failed,
}

/// Recomputes the CRC over `data` and compares it with the one the host sent.
pub fn verify<C: IntegrityChecker>(checker: &mut C, data: &[u8], host_crc: u32) -> Verification {
    let local = checker.crc32(data);
    if local == host_crc {
        Verification::Passed
    } else {
        log::debug!("crc mismatch: host 0x{:08x}, local 0x{:08x}", host_crc, local);
        Verification::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_are_fed_as_words() {
        let word_fed = STM32_CRC.checksum(&[0, 0, 0, 0x10, 0, 0, 0, 0x2a]);
        assert_eq!(Stm32Crc::checksum(&[0x10, 0x2a]), word_fed);
    }

    #[test]
    fn empty_input_is_initial_value() {
        assert_eq!(Stm32Crc::checksum(&[]), 0xffff_ffff);
    }

    #[test]
    fn any_flipped_bit_fails_verification() {
        let frame = [0x15, 0x04, 0x01];
        let crc = Stm32Crc::checksum(&frame);
        assert_eq!(verify(&mut Stm32Crc, &frame, crc), Verification::Passed);
        for i in 0..frame.len() * 8 {
            let mut corrupt = frame;
            corrupt[i / 8] ^= 1 << (i % 8);
            assert_eq!(verify(&mut Stm32Crc, &corrupt, crc), Verification::Failed);
        }
        assert_eq!(verify(&mut Stm32Crc, &frame, crc ^ 1), Verification::Failed);
    }
}
