use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};

use cbl::emulator::SimulatedFlash;
use cbl::launcher::RecordingLauncher;
use cbl::transport::{DEFAULT_BAUDRATE, SerialTransport};
use cbl::{Bootloader, Device, Flashing};

#[derive(Parser)]
#[command(
    name = "cbl",
    version,
    about = "Host tool for the custom STM32F4 bootloader, and an emulated device to test it against"
)]
struct Cli {
    /// Serial port, the first one found when omitted
    #[arg(long, short, global = true)]
    port: Option<String>,
    #[arg(long, short, global = true, default_value_t = DEFAULT_BAUDRATE)]
    baudrate: u32,
    /// Device description in YAML, the built-in STM32F407 when omitted
    #[arg(long, global = true)]
    device: Option<PathBuf>,
    /// Turn on debug logs, including raw frames
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List serial ports
    List,
    /// Get info about the connected bootloader
    Info,
    /// Erase a range of flash sectors
    Erase { sector: u8, count: u8 },
    /// Erase all of flash
    MassErase,
    /// Erase, program and verify a firmware image
    Flash {
        /// The firmware: ELF, Intel HEX, plain hex or raw binary
        path: PathBuf,
        /// Load address for images that carry none, the application base when omitted
        #[arg(long, value_parser = parse_number)]
        address: Option<u32>,
        /// Jump to the image once it is verified
        #[arg(long)]
        run: bool,
    },
    /// Compare flash contents against a firmware image
    Verify {
        path: PathBuf,
        #[arg(long, value_parser = parse_number)]
        address: Option<u32>,
    },
    /// Dump memory
    Read {
        #[arg(value_parser = parse_number)]
        address: u32,
        #[arg(value_parser = parse_number)]
        length: u32,
        /// Save to a file instead of printing a hexdump
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Show or change sector write protection
    Protect {
        /// Sector bitmask, bit n for sector n
        #[arg(value_parser = parse_number)]
        sectors: Option<u32>,
        /// Remove protection instead of applying it
        #[arg(long)]
        remove: bool,
    },
    /// Show or change read-out protection
    Rdp {
        /// New level: 0, 1 or 2. Going from 1 to 0 erases the chip.
        level: Option<u8>,
    },
    /// Read a one-time-programmable block
    Otp { block: u8 },
    /// Branch to an address
    Jump {
        #[arg(value_parser = parse_number)]
        address: u32,
    },
    /// Serve the bootloader protocol on the serial port, backed by emulated flash
    Serve {
        /// Image preloaded at the application base
        #[arg(long)]
        image: Option<PathBuf>,
        /// Start the preloaded application instead of serving when it looks valid
        #[arg(long)]
        boot: bool,
    },
}

fn parse_number(s: &str) -> Result<u32, String> {
    let n = cbl::device::parse_number(s)?;
    u32::try_from(n).map_err(|_| format!("0x{:x} exceeds 32 bits", n))
}

fn connect(port: Option<&str>, baudrate: u32, device: &Device) -> Result<Flashing<SerialTransport>> {
    let flashing = Flashing::new_from_serial(port, baudrate)?;
    anyhow::ensure!(
        flashing.chip_id() == device.chip_id,
        "chip ID 0x{:04x} does not match {} (0x{:04x})",
        flashing.chip_id(),
        device.name,
        device.chip_id
    );
    Ok(flashing)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let _ = simplelog::TermLogger::init(
        if cli.verbose {
            simplelog::LevelFilter::Debug
        } else {
            simplelog::LevelFilter::Info
        },
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );

    let device = match &cli.device {
        Some(path) => Device::from_file(path)?,
        None => Device::builtin()?,
    };
    let (port, baudrate) = (cli.port.as_deref(), cli.baudrate);

    match cli.command {
        Commands::List => {
            for port in SerialTransport::scan_ports()? {
                println!("{}", port);
            }
        }
        Commands::Serve { image, boot } => serve(port, baudrate, device, image.as_deref(), boot)?,
        Commands::Info => connect(port, baudrate, &device)?.dump_info()?,
        Commands::Erase { sector, count } => connect(port, baudrate, &device)?.erase(sector, count)?,
        Commands::MassErase => connect(port, baudrate, &device)?.mass_erase()?,
        Commands::Flash { path, address, run } => {
            let firmware = cbl::format::read_firmware_from_file(path)?;
            let address = address.unwrap_or(firmware.address_or(device.application_base));
            log::info!("Firmware size: {}", firmware.data.len());
            let mut flashing = connect(port, baudrate, &device)?;
            flashing.flash(&device, address, &firmware.data)?;
            flashing.verify(address, &firmware.data)?;
            if run {
                flashing.jump(address)?;
            }
        }
        Commands::Verify { path, address } => {
            let firmware = cbl::format::read_firmware_from_file(path)?;
            let address = address.unwrap_or(firmware.address_or(device.application_base));
            connect(port, baudrate, &device)?.verify(address, &firmware.data)?;
        }
        Commands::Read {
            address,
            length,
            output,
        } => {
            let data = connect(port, baudrate, &device)?.read_memory(address, length as usize)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, &data)?;
                    log::info!("Saved {} bytes to {}", data.len(), path.display());
                }
                None => {
                    let mut dump = Vec::new();
                    hxdmp::hexdump(&data, &mut dump)?;
                    println!("{}", String::from_utf8_lossy(&dump));
                }
            }
        }
        Commands::Protect { sectors, remove } => {
            let mut flashing = connect(port, baudrate, &device)?;
            if let Some(sectors) = sectors {
                let sectors = u16::try_from(sectors)
                    .map_err(|_| anyhow::format_err!("sector mask 0x{:x} is too wide", sectors))?;
                flashing.write_protect(sectors, !remove)?;
            }
            log::info!("Write protected sectors: 0x{:04x}", flashing.sector_protection()?);
        }
        Commands::Rdp { level } => {
            let mut flashing = connect(port, baudrate, &device)?;
            if let Some(level) = level {
                flashing.set_protection_level(level)?;
            }
            log::info!("Read protection: {}", flashing.protection_level()?);
        }
        Commands::Otp { block } => {
            let otp = connect(port, baudrate, &device)?.read_otp(block)?;
            log::info!(
                "OTP block {}{}: {}",
                block,
                if otp.locked { " (locked)" } else { "" },
                hex::encode(&otp.data)
            );
        }
        Commands::Jump { address } => connect(port, baudrate, &device)?.jump(address)?,
    }

    Ok(())
}

fn serve(
    port: Option<&str>,
    baudrate: u32,
    device: Device,
    image: Option<&Path>,
    boot: bool,
) -> Result<()> {
    let transport = match port {
        Some(port) => SerialTransport::open(port, baudrate)?,
        None => SerialTransport::open_any(baudrate)?,
    };
    let mut flash = SimulatedFlash::new(&device);
    if let Some(path) = image {
        let firmware = cbl::format::read_firmware_from_file(path)?;
        let address = firmware.address_or(device.application_base);
        flash.load(address, &firmware.data)?;
        log::info!("Preloaded {} bytes at 0x{:08x}", firmware.data.len(), address);
    }

    let mut bootloader = Bootloader::new(device, transport, flash, RecordingLauncher::default());
    if boot {
        match bootloader.launch_application() {
            Ok(()) => return Ok(()),
            Err(e) => log::warn!("{}", e),
        }
    }
    log::info!("Serving {}", bootloader.device().name);
    let launch = bootloader.run()?;
    log::info!("Bootloader handed over control: {:?}", launch);
    Ok(())
}
