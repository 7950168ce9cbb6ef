//! Serial Transportation.
use std::{
    io::{self, Read, Write},
    time::Duration,
};

use anyhow::{Context, Error, Result};
use serialport::SerialPort;

use super::Transport;

const SERIAL_TIMEOUT_MS: u64 = 1000;

pub const DEFAULT_BAUDRATE: u32 = 115200;

pub struct SerialTransport {
    serial_port: Box<dyn SerialPort>,
}

impl SerialTransport {
    pub fn scan_ports() -> Result<Vec<String>> {
        let ports = serialport::available_ports()?;
        Ok(ports.into_iter().map(|p| p.port_name).collect())
    }

    pub fn open(port: &str, baudrate: u32) -> Result<Self> {
        log::info!("Opening serial port: \"{}\" @ {} baud", port, baudrate);
        let serial_port = serialport::new(port, baudrate)
            .timeout(Duration::from_millis(SERIAL_TIMEOUT_MS))
            .open()
            .with_context(|| format!("opening serial port {}", port))?;
        Ok(SerialTransport { serial_port })
    }

    pub fn open_nth(nth: usize, baudrate: u32) -> Result<Self> {
        let ports = serialport::available_ports()?;

        match ports.get(nth) {
            Some(port) => Self::open(&port.port_name, baudrate),
            None => Err(Error::msg("No serial ports found!")),
        }
    }

    pub fn open_any(baudrate: u32) -> Result<Self> {
        Self::open_nth(0, baudrate)
    }
}

impl Transport for SerialTransport {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.serial_port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.serial_port.write_all(buf)?;
        self.serial_port.flush()?;
        Ok(())
    }
}
