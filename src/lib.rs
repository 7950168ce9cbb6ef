//! Command protocol engine of a secondary bootloader for STM32F4 parts,
//! with a host side to drive it over a serial line.

pub mod bootloader;
pub mod constants;
pub mod device;
pub mod emulator;
pub mod flash;
pub mod flashing;
pub mod format;
pub mod integrity;
pub mod launcher;
pub mod protocol;
pub mod transport;

pub use self::bootloader::{Bootloader, FrameBuffer, NackReason, Outcome};
pub use self::device::Device;
pub use self::emulator::Emulator;
pub use self::flash::{FlashController, ProtectionLevel};
pub use self::flashing::Flashing;
pub use self::launcher::{Launch, Launcher};
pub use self::protocol::{Command, Response};
pub use self::transport::Transport;
