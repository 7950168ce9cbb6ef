/// Default receive buffer size, in bytes, including the length byte.
pub const DEFAULT_RX_BUFFER_LEN: usize = 200;

/// Size of the trailing CRC of a request frame.
pub const CRC_LEN: usize = 4;

/// Largest reply payload an ACK can carry (the length field is one byte).
pub const MAX_REPLY_LEN: usize = u8::MAX as usize;

pub const ACK: u8 = 0xcd;
pub const NACK: u8 = 0xab;

pub const VERSION_MAJOR: u8 = 1;
pub const VERSION_MINOR: u8 = 1;
pub const VERSION_PATCH: u8 = 0;

/// Sector argument requesting a mass erase.
pub const MASS_ERASE: u8 = 0xff;

/// Value returned by the erase primitive when every sector was erased.
pub const ERASE_OK_SENTINEL: u32 = 0xffff_ffff;

pub mod commands {
    pub const GET_VERSION: u8 = 0x10;
    pub const GET_HELP: u8 = 0x11;
    pub const GET_CHIP_ID: u8 = 0x12;
    pub const GET_RDP_STATUS: u8 = 0x13;
    pub const JUMP_TO_ADDRESS: u8 = 0x14;
    pub const ERASE_FLASH: u8 = 0x15;
    pub const MEMORY_WRITE: u8 = 0x16;
    pub const WRITE_PROTECT: u8 = 0x17;
    pub const MEMORY_READ: u8 = 0x18;
    pub const SECTOR_STATUS: u8 = 0x19;
    pub const OTP_READ: u8 = 0x20;
    pub const CHANGE_ROP_LEVEL: u8 = 0x21;

    /// Every opcode the bootloader answers, in ascending order.
    pub const ALL: [u8; 12] = [
        GET_VERSION,
        GET_HELP,
        GET_CHIP_ID,
        GET_RDP_STATUS,
        JUMP_TO_ADDRESS,
        ERASE_FLASH,
        MEMORY_WRITE,
        WRITE_PROTECT,
        MEMORY_READ,
        SECTOR_STATUS,
        OTP_READ,
        CHANGE_ROP_LEVEL,
    ];
}

/// Status bytes carried inside ACK replies.
pub mod status {
    pub const ADDRESS_IS_INVALID: u8 = 0x00;
    pub const ADDRESS_IS_VALID: u8 = 0x01;

    pub const INVALID_SECTOR_NUMBER: u8 = 0x00;
    pub const UNSUCCESSFUL_ERASE: u8 = 0x02;
    pub const SUCCESSFUL_ERASE: u8 = 0x03;

    pub const FLASH_PAYLOAD_WRITE_FAILED: u8 = 0x00;
    pub const FLASH_PAYLOAD_WRITE_PASSED: u8 = 0x01;

    pub const FLASH_LOCK_WRITE_FAILED: u8 = 0x00;
    pub const FLASH_LOCK_WRITE_PASSED: u8 = 0x01;

    pub const ROP_LEVEL_READ_INVALID: u8 = 0x00;
    pub const ROP_LEVEL_READ_VALID: u8 = 0x01;

    pub const ROP_LEVEL_CHANGE_INVALID: u8 = 0x00;
    pub const ROP_LEVEL_CHANGE_VALID: u8 = 0x01;

    pub const WRITE_PROTECT_CHANGE_INVALID: u8 = 0x00;
    pub const WRITE_PROTECT_CHANGE_VALID: u8 = 0x01;

    pub const SECTOR_STATUS_INVALID: u8 = 0x00;
    pub const SECTOR_STATUS_VALID: u8 = 0x01;

    pub const OTP_READ_INVALID: u8 = 0x00;
    pub const OTP_READ_VALID: u8 = 0x01;
}
