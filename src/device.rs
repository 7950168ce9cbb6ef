//! Device description: memory map, sector layout and bootloader placement.
use std::{fmt, ops::Range, path::Path};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::constants::{CRC_LEN, DEFAULT_RX_BUFFER_LEN, MAX_REPLY_LEN};

/// Describes the part the bootloader runs on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Value of the device identification register (DEV_ID).
    #[serde(deserialize_with = "parse_u16")]
    pub chip_id: u16,
    pub flash: FlashLayout,
    pub sram: Vec<SramBank>,
    pub otp: OtpLayout,
    /// Bytes at the start of flash occupied by the bootloader.
    #[serde(deserialize_with = "parse_address_and_offset")]
    pub bootloader_size: u32,
    /// Where the application's vector table lives.
    #[serde(deserialize_with = "parse_address_and_offset")]
    pub application_base: u32,
    #[serde(default = "default_rx_buffer_len")]
    pub rx_buffer_len: usize,
    /// Permit CHANGE_ROP_LEVEL to request level 2, which cannot be undone.
    #[serde(default)]
    pub allow_irreversible_protection: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlashLayout {
    #[serde(deserialize_with = "parse_address_and_offset")]
    pub base: u32,
    #[serde(deserialize_with = "parse_sizes")]
    pub sectors: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SramBank {
    pub name: String,
    #[serde(deserialize_with = "parse_address_and_offset")]
    pub base: u32,
    #[serde(deserialize_with = "parse_address_and_offset")]
    pub size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtpLayout {
    #[serde(deserialize_with = "parse_address_and_offset")]
    pub base: u32,
    #[serde(deserialize_with = "parse_address_and_offset")]
    pub lock_base: u32,
    pub blocks: u8,
    #[serde(deserialize_with = "parse_address_and_offset")]
    pub block_size: u32,
}

/// Classification of an address against the memory map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressKind {
    Invalid,
    Flash,
    /// SRAM bank, numbered from 1 in memory map order.
    Sram(u8),
}

impl AddressKind {
    pub fn is_valid(self) -> bool {
        self != AddressKind::Invalid
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(0x{:04x})", self.name, self.chip_id)
    }
}

impl Device {
    /// The STM32F407 description shipped with the crate.
    pub fn builtin() -> Result<Self> {
        Self::from_yaml(include_str!("../devices/stm32f407.yaml"))
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let device: Device = serde_yaml::from_str(raw)?;
        device.validate()?;
        log::debug!("Loaded device description: {}", device);
        Ok(device)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&raw)
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.flash.sectors.is_empty(), "flash has no sectors");
        anyhow::ensure!(
            self.flash.sectors.len() < usize::from(crate::constants::MASS_ERASE),
            "too many sectors: {}",
            self.flash.sectors.len()
        );
        anyhow::ensure!(
            self.flash.sectors.len() <= 16,
            "write protection mask only covers 16 sectors"
        );
        anyhow::ensure!(
            u64::from(self.flash.base) + self.flash_size() <= 1 << 32,
            "flash exceeds the address space"
        );
        for bank in &self.sram {
            anyhow::ensure!(
                u64::from(bank.base) + u64::from(bank.size) <= 1 << 32,
                "{} exceeds the address space",
                bank.name
            );
        }
        let otp_len = u64::from(self.otp.blocks) * u64::from(self.otp.block_size);
        anyhow::ensure!(
            u64::from(self.otp.base) + otp_len <= 1 << 32,
            "OTP area exceeds the address space"
        );
        anyhow::ensure!(
            u64::from(self.otp.lock_base) + u64::from(self.otp.blocks) <= 1 << 32,
            "OTP lock bytes exceed the address space"
        );
        anyhow::ensure!(
            self.sector_boundary(self.bootloader_size).is_some(),
            "bootloader size 0x{:x} does not end on a sector boundary",
            self.bootloader_size
        );
        anyhow::ensure!(
            self.is_application_flash(self.application_base, 8),
            "application base 0x{:08x} is not in application flash",
            self.application_base
        );
        anyhow::ensure!(
            self.otp.block_size as usize + 2 <= MAX_REPLY_LEN,
            "OTP block of {} bytes does not fit a reply",
            self.otp.block_size
        );
        anyhow::ensure!(
            (1 + 1 + CRC_LEN..=256).contains(&self.rx_buffer_len),
            "rx buffer length {} out of range",
            self.rx_buffer_len
        );
        Ok(())
    }

    pub fn flash_size(&self) -> u64 {
        self.flash.sectors.iter().map(|&s| u64::from(s)).sum()
    }

    pub fn flash_range(&self) -> Range<u64> {
        let base = u64::from(self.flash.base);
        base..base + self.flash_size()
    }

    pub fn sram_range(&self, bank: &SramBank) -> Range<u64> {
        u64::from(bank.base)..u64::from(bank.base) + u64::from(bank.size)
    }

    pub fn sector_count(&self) -> u8 {
        self.flash.sectors.len() as u8
    }

    /// Address range covered by `count` sectors starting at `first`.
    pub fn sector_range(&self, first: u8, count: u8) -> Option<Range<u64>> {
        let first = usize::from(first);
        let last = first.checked_add(usize::from(count))?;
        if count == 0 || last > self.flash.sectors.len() {
            return None;
        }
        let offset: u64 = self.flash.sectors[..first].iter().map(|&s| u64::from(s)).sum();
        let len: u64 = self.flash.sectors[first..last].iter().map(|&s| u64::from(s)).sum();
        let start = u64::from(self.flash.base) + offset;
        Some(start..start + len)
    }

    /// Number of sectors an offset from the flash base spans, if it falls exactly on a boundary.
    fn sector_boundary(&self, offset: u32) -> Option<usize> {
        let mut acc = 0u64;
        for (i, &size) in self.flash.sectors.iter().enumerate() {
            if acc == u64::from(offset) {
                return Some(i);
            }
            acc += u64::from(size);
        }
        (acc == u64::from(offset)).then_some(self.flash.sectors.len())
    }

    /// Flash occupied by the bootloader itself.
    pub fn bootloader_range(&self) -> Range<u64> {
        let base = u64::from(self.flash.base);
        base..base + u64::from(self.bootloader_size)
    }

    /// Sectors holding the bootloader; these are never erased sector by sector.
    pub fn bootloader_sectors(&self) -> u8 {
        self.sector_boundary(self.bootloader_size).unwrap_or(0) as u8
    }

    /// Classifies `address`, checking flash first and then each SRAM bank in order.
    pub fn validate_address(&self, address: u32) -> AddressKind {
        let address = u64::from(address);
        if self.flash_range().contains(&address) {
            return AddressKind::Flash;
        }
        self.sram
            .iter()
            .position(|bank| self.sram_range(bank).contains(&address))
            .map(|i| AddressKind::Sram(i as u8 + 1))
            .unwrap_or(AddressKind::Invalid)
    }

    /// Memory range of a region returned by [`Device::validate_address`].
    pub fn region(&self, kind: AddressKind) -> Option<Range<u64>> {
        match kind {
            AddressKind::Invalid => None,
            AddressKind::Flash => Some(self.flash_range()),
            AddressKind::Sram(n) => self
                .sram
                .get(usize::from(n).checked_sub(1)?)
                .map(|bank| self.sram_range(bank)),
        }
    }

    /// `[address, address + len)` lies inside a single known region.
    pub fn is_readable(&self, address: u32, len: u32) -> bool {
        let end = u64::from(address) + u64::from(len);
        len > 0
            && self
                .region(self.validate_address(address))
                .is_some_and(|region| end <= region.end)
    }

    /// `[address, address + len)` lies in flash and outside the bootloader.
    pub fn is_application_flash(&self, address: u32, len: u32) -> bool {
        let start = u64::from(address);
        let end = start + u64::from(len);
        let flash = self.flash_range();
        len > 0
            && flash.start <= start
            && end <= flash.end
            && !overlaps(&(start..end), &self.bootloader_range())
    }

    /// A stack pointer may sit one past the end of a bank, as it is pre-decremented.
    pub fn is_stack_top(&self, sp: u32) -> bool {
        let sp = u64::from(sp);
        self.sram
            .iter()
            .any(|bank| sp > u64::from(bank.base) && sp <= self.sram_range(bank).end)
    }

    pub fn otp_block(&self, block: u8) -> Option<(u32, u32)> {
        if block >= self.otp.blocks {
            return None;
        }
        let data = u32::from(block)
            .checked_mul(self.otp.block_size)
            .and_then(|offset| self.otp.base.checked_add(offset))?;
        let lock = self.otp.lock_base.checked_add(u32::from(block))?;
        Some((data, lock))
    }
}

pub(crate) fn overlaps(a: &Range<u64>, b: &Range<u64>) -> bool {
    a.start < b.end && b.start < a.end
}

fn default_rx_buffer_len() -> usize {
    DEFAULT_RX_BUFFER_LEN
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawNumber {
    Int(u64),
    Text(String),
}

/// Parses `0x` hex, decimal, or a `K`/`KB`/`KiB` multiple of 1024. `_` separators are ignored.
pub fn parse_number(s: &str) -> std::result::Result<u64, String> {
    let s = s.trim();
    let digits = s.replace('_', "");
    let err = |_| format!("error while parsing {:?}", s);
    if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).map_err(err)
    } else if let Some(kib) = digits
        .strip_suffix("KiB")
        .or_else(|| digits.strip_suffix("KB"))
        .or_else(|| digits.strip_suffix('K'))
    {
        kib.trim()
            .parse::<u64>()
            .map_err(err)?
            .checked_mul(1024)
            .ok_or_else(|| format!("{:?} is too large", s))
    } else {
        digits.parse().map_err(err)
    }
}

fn parse_raw_number(raw: RawNumber) -> std::result::Result<u64, String> {
    match raw {
        RawNumber::Int(n) => Ok(n),
        RawNumber::Text(s) => parse_number(&s),
    }
}

fn parse_address_and_offset<'de, D>(deserializer: D) -> std::result::Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = RawNumber::deserialize(deserializer)?;
    let n = parse_raw_number(raw).map_err(serde::de::Error::custom)?;
    u32::try_from(n).map_err(|_| serde::de::Error::custom(format!("0x{:x} exceeds 32 bits", n)))
}

fn parse_u16<'de, D>(deserializer: D) -> std::result::Result<u16, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = RawNumber::deserialize(deserializer)?;
    let n = parse_raw_number(raw).map_err(serde::de::Error::custom)?;
    u16::try_from(n).map_err(|_| serde::de::Error::custom(format!("0x{:x} exceeds 16 bits", n)))
}

fn parse_sizes<'de, D>(deserializer: D) -> std::result::Result<Vec<u32>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Vec<RawNumber> = Deserialize::deserialize(deserializer)?;
    raw.into_iter()
        .map(|r| {
            let n = parse_raw_number(r).map_err(serde::de::Error::custom)?;
            u32::try_from(n).map_err(|_| serde::de::Error::custom("sector size exceeds 32 bits"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f407() -> Device {
        Device::builtin().unwrap()
    }

    #[test]
    fn builtin_description_matches_stm32f407() {
        let dev = f407();
        assert_eq!(dev.chip_id, 0x413);
        assert_eq!(dev.sector_count(), 12);
        assert_eq!(dev.flash_size(), 1024 * 1024);
        assert_eq!(dev.bootloader_sectors(), 2);
        assert_eq!(dev.application_base, 0x0800_8000);
        assert_eq!(dev.otp_block(15), Some((0x1fff_79e0, 0x1fff_7a0f)));
        assert_eq!(dev.otp_block(16), None);
    }

    #[test]
    fn addresses_are_classified_in_priority_order() {
        let dev = f407();
        assert_eq!(dev.validate_address(0x0800_0000), AddressKind::Flash);
        assert_eq!(dev.validate_address(0x080f_ffff), AddressKind::Flash);
        assert_eq!(dev.validate_address(0x0810_0000), AddressKind::Invalid);
        assert_eq!(dev.validate_address(0x2000_0000), AddressKind::Sram(1));
        assert_eq!(dev.validate_address(0x2001_c000), AddressKind::Sram(2));
        assert_eq!(dev.validate_address(0x2001_ffff), AddressKind::Sram(2));
        assert_eq!(dev.validate_address(0x2002_0000), AddressKind::Invalid);
        assert_eq!(dev.validate_address(0x1000_0000), AddressKind::Sram(3));
        assert_eq!(dev.validate_address(0x1001_0000), AddressKind::Invalid);
        assert_eq!(dev.validate_address(0xffff_ffff), AddressKind::Invalid);
        assert_eq!(dev.validate_address(0), AddressKind::Invalid);
    }

    #[test]
    fn sector_ranges() {
        let dev = f407();
        assert_eq!(dev.sector_range(0, 1), Some(0x0800_0000..0x0800_4000));
        assert_eq!(dev.sector_range(4, 2), Some(0x0801_0000..0x0804_0000));
        assert_eq!(dev.sector_range(11, 1), Some(0x080e_0000..0x0810_0000));
        assert_eq!(dev.sector_range(11, 2), None);
        assert_eq!(dev.sector_range(3, 0), None);
    }

    #[test]
    fn write_targets_exclude_bootloader_and_ram() {
        let dev = f407();
        assert!(dev.is_application_flash(0x0800_8000, 16));
        assert!(!dev.is_application_flash(0x0800_7ff0, 32));
        assert!(!dev.is_application_flash(0x080f_fff0, 32));
        assert!(!dev.is_application_flash(0x2000_0000, 4));
        assert!(dev.is_readable(0x2000_0000, 4));
        assert!(!dev.is_readable(0x2001_bfff, 2));
    }

    #[test]
    fn sizes_accept_hex_and_kib() {
        let dev = Device::from_yaml(
            r#"
name: tiny
chip_id: 0x123
flash:
  base: 0x08000000
  sectors: [1KiB, "0x400", 2048]
sram:
  - { name: RAM, base: "0x20000000", size: 4KB }
otp: { base: 0, lock_base: 0, blocks: 0, block_size: 0 }
bootloader_size: 1K
application_base: "0x08000400"
"#,
        )
        .unwrap();
        assert_eq!(dev.chip_id, 0x123);
        assert_eq!(dev.flash.sectors, vec![1024, 1024, 2048]);
        assert_eq!(dev.rx_buffer_len, DEFAULT_RX_BUFFER_LEN);
        assert!(!dev.allow_irreversible_protection);
    }

    #[test]
    fn otp_must_fit_the_address_space() {
        let raw = include_str!("../devices/stm32f407.yaml").replace("base: \"0x1FFF7800\"", "base: \"0xFFFFFFF0\"");
        assert!(Device::from_yaml(&raw).is_err());
        let raw = include_str!("../devices/stm32f407.yaml").replace("lock_base: \"0x1FFF7A00\"", "lock_base: \"0xFFFFFFFA\"");
        assert!(Device::from_yaml(&raw).is_err());
    }

    #[test]
    fn otp_block_addresses_never_wrap() {
        let mut dev = f407();
        dev.otp.base = 0xffff_fff0;
        dev.otp.lock_base = 0xffff_ffff;
        assert_eq!(dev.otp_block(0), Some((0xffff_fff0, 0xffff_ffff)));
        assert_eq!(dev.otp_block(1), None);
    }

    #[test]
    fn numbers_in_every_notation() {
        assert_eq!(parse_number("0x0800_8000"), Ok(0x0800_8000));
        assert_eq!(parse_number("0X1f"), Ok(0x1f));
        assert_eq!(parse_number("128"), Ok(128));
        assert_eq!(parse_number("16K"), Ok(16 * 1024));
        assert_eq!(parse_number(" 2KiB "), Ok(2048));
        assert!(parse_number("0xg").is_err());
        assert!(parse_number("").is_err());
    }

    #[test]
    fn misaligned_bootloader_is_rejected() {
        let raw = include_str!("../devices/stm32f407.yaml").replace("bootloader_size: 32K", "bootloader_size: 20K");
        assert!(Device::from_yaml(&raw).is_err());
    }
}
