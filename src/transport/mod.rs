//! Abstract byte transport between host and bootloader.
use anyhow::Result;

pub use self::loopback::Loopback;
pub use self::serial::{DEFAULT_BAUDRATE, SerialTransport};

mod loopback;
mod serial;

/// Abstraction of the transport layer.
/// Might be a UART, SPI, CAN or an in-process pipe. Knows nothing about framing.
pub trait Transport {
    /// Reads at most `buf.len()` bytes. `Ok(0)` means nothing arrived in time.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
    fn write(&mut self, buf: &[u8]) -> Result<()>;

    /// Reads until `buf` is full or the transport runs dry, returning the count.
    fn read_full(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.read(&mut buf[filled..])? {
                0 => break,
                n => filled += n,
            }
        }
        Ok(filled)
    }
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        (**self).read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        (**self).write(buf)
    }
}
