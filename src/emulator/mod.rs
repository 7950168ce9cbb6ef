//! A bootloader running against simulated hardware.
//!
//! [`Emulator`] is itself a [`Transport`]: whatever the host writes is fed
//! to the engine, and reading returns the engine's responses. This lets the
//! host session talk to a device without any hardware or threads.
use std::collections::VecDeque;

use anyhow::Result;

pub use self::flash::{FlashStats, SimulatedFlash};

use crate::bootloader::{Bootloader, FrameBuffer, Outcome};
use crate::device::Device;
use crate::launcher::RecordingLauncher;
use crate::transport::{Loopback, Transport};

mod flash;

pub type EmulatedBootloader = Bootloader<Loopback, SimulatedFlash, RecordingLauncher>;

pub struct Emulator {
    bootloader: EmulatedBootloader,
    buffer: FrameBuffer,
    output: VecDeque<u8>,
    outcomes: Vec<Outcome>,
}

impl Emulator {
    pub fn new(device: Device) -> Self {
        let flash = SimulatedFlash::new(&device);
        let bootloader = Bootloader::new(device, Loopback::new(), flash, RecordingLauncher::default());
        let buffer = bootloader.new_buffer();
        Emulator {
            bootloader,
            buffer,
            output: VecDeque::new(),
            outcomes: Vec::new(),
        }
    }

    pub fn bootloader(&self) -> &EmulatedBootloader {
        &self.bootloader
    }

    pub fn flash(&self) -> &SimulatedFlash {
        self.bootloader.flash()
    }

    pub fn flash_mut(&mut self) -> &mut SimulatedFlash {
        self.bootloader.flash_mut()
    }

    pub fn launcher(&self) -> &RecordingLauncher {
        self.bootloader.launcher()
    }

    /// Outcome of every request processed so far.
    pub fn outcomes(&self) -> &[Outcome] {
        &self.outcomes
    }

    pub fn last_outcome(&self) -> Option<Outcome> {
        self.outcomes.last().copied()
    }

    /// Processes everything the host has sent.
    fn pump(&mut self) -> Result<()> {
        while self.bootloader.transport_mut().pending() > 0 {
            let outcome = self.bootloader.process_one_request(&mut self.buffer)?;
            self.outcomes.push(outcome);
            if let Outcome::Incomplete { .. } = outcome {
                break;
            }
        }
        let out = self.bootloader.transport_mut().take_output();
        self.output.extend(out);
        Ok(())
    }
}

impl Transport for Emulator {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.output.is_empty() {
            self.pump()?;
        }
        let n = buf.len().min(self.output.len());
        for (dst, src) in buf.iter_mut().zip(self.output.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.bootloader.transport_mut().feed(buf);
        Ok(())
    }
}
