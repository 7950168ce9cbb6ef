use cbl::constants::{NACK, status};
use cbl::emulator::Emulator;
use cbl::launcher::Launch;
use cbl::transport::Transport;
use cbl::{Command, Device, Flashing, Outcome, ProtectionLevel};

const APP: u32 = 0x0800_8000;

fn session() -> Flashing<Emulator> {
    let emulator = Emulator::new(Device::builtin().unwrap());
    Flashing::new(emulator).unwrap()
}

#[test]
fn handshake() {
    let flashing = session();
    assert_eq!(flashing.version(), [1, 1, 0]);
    assert_eq!(flashing.chip_id(), 0x0413);
}

#[test]
fn dump_info() {
    let mut flashing = session();
    flashing.dump_info().unwrap();
    assert_eq!(flashing.help().unwrap().len(), 12);
}

#[test]
fn flash_and_verify_image() {
    let device = Device::builtin().unwrap();
    let image: Vec<u8> = (0..1000u32).map(|i| (i * 7) as u8).collect();
    let mut flashing = session();
    flashing.flash(&device, APP, &image).unwrap();
    flashing.verify(APP, &image).unwrap();

    let mut emulator = flashing.into_inner();
    assert_eq!(emulator.flash_mut().contents(APP, image.len()), Some(image));
    assert!(emulator.flash().is_locked());
    assert_eq!(emulator.flash().stats().erases.len(), 1);
}

#[test]
fn reflashing_erases_first() {
    let device = Device::builtin().unwrap();
    let mut flashing = session();
    flashing.flash(&device, APP, &[0x00; 64]).unwrap();
    flashing.flash(&device, APP, &[0xa5; 64]).unwrap();
    flashing.verify(APP, &[0xa5; 64]).unwrap();
}

#[test]
fn verify_detects_mismatch() {
    let device = Device::builtin().unwrap();
    let mut flashing = session();
    flashing.flash(&device, APP, &[1, 2, 3, 4]).unwrap();
    let err = flashing.verify(APP, &[1, 2, 0, 4]).unwrap_err();
    assert!(err.to_string().contains("0x08008002"), "{}", err);
}

#[test]
fn image_over_bootloader_is_refused_by_host() {
    let device = Device::builtin().unwrap();
    let mut flashing = session();
    assert!(flashing.flash(&device, 0x0800_0000, &[0; 16]).is_err());
    let emulator = flashing.into_inner();
    assert!(!emulator.flash().stats().mutated());
}

#[test]
fn device_rejections_surface_as_errors() {
    let mut flashing = session();
    assert!(flashing.erase(0, 1).is_err());
    assert!(flashing.write_memory(0x2000_0000, &[1]).is_err());
    assert!(flashing.read_memory(0x6000_0000, 4).is_err());
    assert!(flashing.jump(0xe000_0000).is_err());
    assert!(flashing.read_otp(16).is_err());
    assert!(flashing.set_protection_level(2).is_err());
}

#[test]
fn reads_span_several_requests() {
    let mut flashing = session();
    let pattern: Vec<u8> = (0..300u32).map(|i| i as u8).collect();
    let mut emulator = flashing.into_inner();
    emulator.flash_mut().load(0x2000_1000, &pattern).unwrap();
    flashing = Flashing::new(emulator).unwrap();
    assert_eq!(flashing.read_memory(0x2000_1000, 300).unwrap(), pattern);
}

#[test]
fn protection_round_trip() {
    let mut flashing = session();
    assert_eq!(flashing.protection_level().unwrap(), ProtectionLevel::Level0);
    flashing.write_protect(0x0810, true).unwrap();
    assert_eq!(flashing.sector_protection().unwrap(), 0x0810);
    flashing.write_protect(0x0800, false).unwrap();
    assert_eq!(flashing.sector_protection().unwrap(), 0x0010);

    flashing.set_protection_level(1).unwrap();
    assert_eq!(flashing.protection_level().unwrap(), ProtectionLevel::Level1);
}

#[test]
fn otp_lock_state() {
    let mut emulator = Emulator::new(Device::builtin().unwrap());
    emulator.flash_mut().lock_otp_block(3).unwrap();
    let mut flashing = Flashing::new(emulator).unwrap();

    let block = flashing.read_otp(3).unwrap();
    assert!(block.locked);
    assert_eq!(block.data, vec![0xff; 32]);
    assert!(!flashing.read_otp(2).unwrap().locked);
}

#[test]
fn jump_hands_over_control() {
    let mut flashing = session();
    flashing.jump(APP).unwrap();
    let emulator = flashing.into_inner();
    assert_eq!(emulator.launcher().last(), Some(Launch::Jump(APP)));
    assert_eq!(emulator.last_outcome(), Some(Outcome::Launched(Launch::Jump(APP))));
}

#[test]
fn corrupted_request_gets_bare_nack() {
    let mut emulator = Emulator::new(Device::builtin().unwrap());
    let mut raw = Command::erase_sectors(4, 1).into_raw().unwrap();
    raw[2] = 5;
    emulator.write(&raw).unwrap();

    let mut resp = [0u8; 4];
    assert_eq!(emulator.read(&mut resp).unwrap(), 1);
    assert_eq!(resp[0], NACK);
    assert!(emulator.flash().stats().erases.is_empty());

    // the link stays usable
    let mut flashing = Flashing::new(emulator).unwrap();
    flashing.erase(4, 1).unwrap();
    let resp = flashing.transfer(Command::erase_sectors(12, 1)).unwrap();
    assert_eq!(resp.status(), Some(status::INVALID_SECTOR_NUMBER));
}
