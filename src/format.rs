//! Firmware image formats
use std::borrow::Cow;
use std::path::Path;
use std::str;

use anyhow::Result;
use object::{
    Endianness,
    elf::{FileHeader32, PT_LOAD},
    read::elf::{FileHeader, ProgramHeader},
};

/// Value of erased flash, used to fill gaps between sections.
const ERASED: u8 = 0xff;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FirmwareFormat {
    PlainHex,
    IntelHex,
    ELF,
    Binary,
}

/// A contiguous image, and where it wants to live if the file says so.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Firmware {
    pub address: Option<u32>,
    pub data: Vec<u8>,
}

impl Firmware {
    fn raw(data: Vec<u8>) -> Self {
        Firmware {
            address: None,
            data,
        }
    }

    /// Load address, or `default` for formats that carry none.
    pub fn address_or(&self, default: u32) -> u32 {
        self.address.unwrap_or(default)
    }
}

pub fn read_firmware_from_file<P: AsRef<Path>>(path: P) -> Result<Firmware> {
    let p = path.as_ref();
    let raw = std::fs::read(p)?;
    anyhow::ensure!(!raw.is_empty(), "{} is empty", p.display());

    let format = guess_format(p, &raw);
    log::info!("Read {} as {:?} format", p.display(), format);
    match format {
        FirmwareFormat::PlainHex => read_hex(str::from_utf8(&raw)?).map(Firmware::raw),
        FirmwareFormat::IntelHex => read_ihex(str::from_utf8(&raw)?),
        FirmwareFormat::ELF => objcopy_binary(&raw),
        FirmwareFormat::Binary => Ok(Firmware::raw(raw)),
    }
}

pub fn guess_format(path: &Path, raw: &[u8]) -> FirmwareFormat {
    let ext = path
        .extension()
        .map(|s| s.to_string_lossy())
        .unwrap_or_default()
        .to_lowercase();
    if ["ihex", "ihe", "h86", "hex", "a43", "a90"].contains(&&*ext) {
        return FirmwareFormat::IntelHex;
    }

    let is_text = |c: u8| c.is_ascii_hexdigit() || c == b'\n' || c == b'\r';
    if raw.starts_with(&[0x7f, b'E', b'L', b'F']) {
        FirmwareFormat::ELF
    } else if raw.first() == Some(&b':') && raw.iter().all(|&c| is_text(c) || c == b':') {
        FirmwareFormat::IntelHex
    } else if !raw.is_empty() && raw.iter().all(|&c| is_text(c)) {
        FirmwareFormat::PlainHex
    } else {
        FirmwareFormat::Binary
    }
}

/// Hex digits, line breaks ignored.
pub fn read_hex(data: &str) -> Result<Vec<u8>> {
    let digits: String = data.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    Ok(hex::decode(digits)?)
}

pub fn read_ihex(data: &str) -> Result<Firmware> {
    use ihex::Record;

    let mut base_address = 0;

    let mut records = vec![];
    for record in ihex::Reader::new(data) {
        match record? {
            Record::Data { offset, value } => {
                records.push((base_address + offset as u32, value.into()));
            }
            Record::ExtendedSegmentAddress(address) => base_address = (address as u32) * 16,
            Record::ExtendedLinearAddress(address) => base_address = (address as u32) << 16,
            Record::EndOfFile
            | Record::StartSegmentAddress { .. }
            | Record::StartLinearAddress(_) => (),
        }
    }
    merge_sections(records)
}

/// Loadable segments of a 32-bit ELF, placed at their physical addresses.
pub fn objcopy_binary(elf_data: &[u8]) -> Result<Firmware> {
    match object::FileKind::parse(elf_data)? {
        object::FileKind::Elf32 => (),
        _ => anyhow::bail!("cannot read file as ELF32 format"),
    }
    let elf_header = FileHeader32::<Endianness>::parse(elf_data)?;
    let endian = elf_header.endian()?;

    let mut sections = vec![];
    for segment in elf_header.program_headers(endian, elf_data)? {
        if segment.p_type(endian) != PT_LOAD || segment.p_filesz(endian) == 0 {
            continue;
        }
        let p_paddr = segment.p_paddr(endian);
        let data = segment
            .data(endian, elf_data)
            .map_err(|_| anyhow::format_err!("Failed to access data for an ELF segment."))?;
        log::info!(
            "Found loadable segment at {:#010x} ({} bytes, virtual {:#010x})",
            p_paddr,
            data.len(),
            segment.p_vaddr(endian)
        );
        sections.push((p_paddr, Cow::Borrowed(data)));
    }

    anyhow::ensure!(!sections.is_empty(), "no loadable segments in ELF file");
    merge_sections(sections)
}

fn merge_sections(mut sections: Vec<(u32, Cow<[u8]>)>) -> Result<Firmware> {
    sections.sort_by_key(|(addr, _)| *addr);

    let Some(&(start_address, _)) = sections.first() else {
        anyhow::bail!("firmware contains no data");
    };
    let mut end_address = u64::from(start_address);
    for (addr, sect) in &sections {
        let addr = u64::from(*addr);
        anyhow::ensure!(
            addr >= end_address,
            "section at {:#010x} overlaps the previous one",
            addr
        );
        end_address = addr + sect.len() as u64;
    }
    anyhow::ensure!(
        end_address <= 1 << 32,
        "firmware extends past the end of the address space"
    );

    let mut binary = vec![ERASED; (end_address - u64::from(start_address)) as usize];
    for (addr, sect) in sections {
        let offset = (addr - start_address) as usize;
        binary[offset..offset + sect.len()].copy_from_slice(&sect);
    }
    log::debug!("firmware spans {:#010x}..{:#010x}", start_address, end_address);
    Ok(Firmware {
        address: Some(start_address),
        data: binary,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guesses_formats_from_content() {
        let p = Path::new("firmware");
        assert_eq!(guess_format(p, b"\x7fELF\x01\x01"), FirmwareFormat::ELF);
        assert_eq!(guess_format(p, b":0400000001020304F2\n"), FirmwareFormat::IntelHex);
        assert_eq!(guess_format(p, b"deadbeef\r\n0102\n"), FirmwareFormat::PlainHex);
        assert_eq!(guess_format(p, &[0x00, 0x80, 0x01, 0x20]), FirmwareFormat::Binary);
        assert_eq!(guess_format(Path::new("app.HEX"), b"deadbeef"), FirmwareFormat::IntelHex);
    }

    #[test]
    fn plain_hex_ignores_line_breaks() {
        assert_eq!(read_hex("dead\r\nbeef\n").unwrap(), vec![0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn intel_hex_keeps_its_address_and_fills_gaps() {
        let text = ":020000040800F2\n:0400000001020304F2\n:020006000506ED\n:00000001FF\n";
        let fw = read_ihex(text).unwrap();
        assert_eq!(fw.address, Some(0x0800_0000));
        assert_eq!(fw.data, vec![1, 2, 3, 4, 0xff, 0xff, 5, 6]);
        assert_eq!(fw.address_or(0x0800_8000), 0x0800_0000);
    }

    #[test]
    fn overlapping_sections_are_rejected() {
        let sections = vec![
            (0x100, Cow::Borrowed(&[1u8, 2, 3, 4][..])),
            (0x102, Cow::Borrowed(&[5u8][..])),
        ];
        assert!(merge_sections(sections).is_err());
    }

    #[test]
    fn raw_images_have_no_address() {
        let fw = Firmware::raw(vec![1, 2]);
        assert_eq!(fw.address_or(0x0800_8000), 0x0800_8000);
    }
}
