//! Hand-over of control to code outside the bootloader.

/// Performs the control transfer once an address has been validated.
///
/// On hardware neither method returns: the core is reset to a new stack
/// pointer and program counter. Emulated launchers record the request instead.
pub trait Launcher {
    /// Branch to `address`, as requested by JUMP_TO_ADDRESS.
    fn jump(&mut self, address: u32);

    /// Start the application whose vector table is at `vector_table`.
    fn boot_application(&mut self, vector_table: u32);
}

/// A control transfer requested by the bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Launch {
    Jump(u32),
    Application(u32),
}

/// Launcher that remembers what it was asked to run.
#[derive(Debug, Default)]
pub struct RecordingLauncher {
    launches: Vec<Launch>,
}

impl RecordingLauncher {
    pub fn launches(&self) -> &[Launch] {
        &self.launches
    }

    pub fn last(&self) -> Option<Launch> {
        self.launches.last().copied()
    }
}

impl Launcher for RecordingLauncher {
    fn jump(&mut self, address: u32) {
        // Thumb state is selected by the low address bit
        log::info!("Jumping to 0x{:08x}", address | 1);
        self.launches.push(Launch::Jump(address));
    }

    fn boot_application(&mut self, vector_table: u32) {
        log::info!("Booting application, vector table at 0x{:08x}", vector_table);
        self.launches.push(Launch::Application(vector_table));
    }
}
