//! a33up - command-line firmware updater for A33G52x serial bootloaders.
//!
//! ## Features
//!
//! - Query the resident bootloader
//! - Erase flash ranges
//! - Flash raw binary images with progress and automatic verify
//! - Reboot into the application
//! - Serial port discovery
//!
//! Environment variables:
//!   A33UP_PORT  - Default serial port
//!   A33UP_BAUD  - Default baud rate (default: 115200)

use {
    a33boot::{
        Updater,
        port::{self, SerialConfig},
        protocol::crc::crc16_xmodem,
    },
    anyhow::{Context, Result, bail},
    clap::{Parser, Subcommand},
    console::style,
    env_logger::Env,
    indicatif::{ProgressBar, ProgressStyle},
    log::debug,
    std::{
        fs,
        path::PathBuf,
        sync::atomic::{AtomicBool, Ordering},
        time::Duration,
    },
};

/// a33up - firmware updater for A33G52x serial bootloaders.
#[derive(Parser)]
#[command(name = "a33up")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Serial port to use (e.g. /dev/ttyUSB0, COM3).
    #[arg(short, long, global = true, env = "A33UP_PORT")]
    port: Option<String>,

    /// Baud rate.
    #[arg(short, long, global = true, default_value = "115200", env = "A33UP_BAUD")]
    baud: u32,

    /// Per-command reply timeout in milliseconds.
    #[arg(long, global = true, default_value = "500")]
    timeout: u64,

    /// Verbose output level (-v, -vv, -vvv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Query loader version and board name.
    Query,

    /// Erase every flash sector overlapping an address range.
    Erase {
        /// Start address (decimal or 0x-prefixed hex).
        #[arg(value_parser = parse_u32)]
        addr: u32,

        /// Range length in bytes (decimal or 0x-prefixed hex).
        #[arg(value_parser = parse_u32)]
        len: u32,
    },

    /// Flash a raw binary image into the firmware region and verify it.
    Flash {
        /// Path to the binary image.
        image: PathBuf,

        /// Version string recorded with the image (max 32 bytes).
        #[arg(long, default_value = "V000000R0")]
        fw_version: String,

        /// Reboot into the application after a successful verify.
        #[arg(long)]
        reboot: bool,
    },

    /// Re-verify an already flashed image against a local binary.
    Verify {
        /// Path to the binary image the flash should match.
        image: PathBuf,

        /// Version string recorded with the image (max 32 bytes).
        #[arg(long, default_value = "V000000R0")]
        fw_version: String,
    },

    /// Reboot into the application (requires a verified image).
    Reboot,

    /// List the serial ports on this host.
    ListPorts,
}

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

fn parse_u32(s: &str) -> Result<u32, String> {
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else {
        s.parse()
    };
    parsed.map_err(|_| format!("invalid number: {s}"))
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        "error"
    } else {
        match verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(level)).init();
}

fn open_updater(cli: &Cli) -> Result<Updater<Box<dyn serialport::SerialPort>>> {
    let Some(name) = cli.port.as_deref() else {
        bail!("no serial port given; use --port or A33UP_PORT");
    };
    let port = port::open(&SerialConfig::new(name, cli.baud))
        .with_context(|| format!("opening {name}"))?;
    Ok(Updater::new(port).with_timeout(Duration::from_millis(cli.timeout)))
}

fn progress_bar(total: usize, quiet: bool) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(total as u64);
    bar.set_style(
        ProgressStyle::with_template("{bar:40.cyan/blue} {bytes}/{total_bytes} ({eta})")
            .expect("static template"),
    );
    bar
}

fn cmd_query(cli: &Cli) -> Result<()> {
    let mut updater = open_updater(cli)?;
    let info = updater.query().context("querying bootloader")?;
    println!("loader  : {}", info.version);
    println!("board   : {}", info.board);
    Ok(())
}

fn cmd_erase(cli: &Cli, addr: u32, len: u32) -> Result<()> {
    let mut updater = open_updater(cli)?;
    updater
        .erase(addr, len)
        .with_context(|| format!("erasing {addr:#010x}+{len:#x}"))?;
    if !cli.quiet {
        println!("{} erased {addr:#010x}+{len:#x}", style("ok").green());
    }
    Ok(())
}

fn cmd_flash(cli: &Cli, image_path: &PathBuf, fw_version: &str, reboot: bool) -> Result<()> {
    let image = fs::read(image_path)
        .with_context(|| format!("reading {}", image_path.display()))?;
    debug!("image is {} bytes", image.len());

    let mut updater = open_updater(cli)?;
    let info = updater.query().context("querying bootloader")?;
    if !cli.quiet {
        println!("loader {} on {}", info.version, info.board);
    }

    let bar = progress_bar(image.len(), cli.quiet);
    updater
        .flash_image(&image, fw_version, &mut |sent, _total| {
            bar.set_position(sent as u64);
        })
        .context("flashing image")?;
    bar.finish_and_clear();

    if !cli.quiet {
        println!(
            "{} flashed and verified {} bytes ({fw_version})",
            style("ok").green(),
            image.len()
        );
    }

    if reboot {
        updater.reboot().context("rebooting into application")?;
        if !cli.quiet {
            println!("{} application started", style("ok").green());
        }
    }
    Ok(())
}

fn cmd_verify(cli: &Cli, image_path: &PathBuf, fw_version: &str) -> Result<()> {
    let image = fs::read(image_path)
        .with_context(|| format!("reading {}", image_path.display()))?;
    if image.is_empty() {
        bail!("empty image file");
    }

    let crc = crc16_xmodem(&image);
    let mut updater = open_updater(cli)?;
    updater
        .verify(image.len() as u32, crc, fw_version)
        .context("verifying image")?;
    if !cli.quiet {
        println!(
            "{} image valid ({} bytes, CRC {crc:#06x})",
            style("ok").green(),
            image.len()
        );
    }
    Ok(())
}

fn cmd_reboot(cli: &Cli) -> Result<()> {
    let mut updater = open_updater(cli)?;
    updater.reboot().context("rebooting into application")?;
    if !cli.quiet {
        println!("{} application started", style("ok").green());
    }
    Ok(())
}

fn cmd_list_ports() -> Result<()> {
    let ports = port::list_ports().context("listing serial ports")?;
    if ports.is_empty() {
        println!("no serial ports found");
        return Ok(());
    }
    for info in ports {
        match info.port_type {
            serialport::SerialPortType::UsbPort(usb) => {
                println!(
                    "{}  usb {:04x}:{:04x} {}",
                    info.port_name,
                    usb.vid,
                    usb.pid,
                    usb.product.as_deref().unwrap_or("")
                );
            },
            _ => println!("{}", info.port_name),
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    ctrlc::set_handler(|| {
        INTERRUPTED.store(true, Ordering::Relaxed);
    })
    .context("installing Ctrl-C handler")?;
    a33boot::set_interrupt_checker(|| INTERRUPTED.load(Ordering::Relaxed));

    match &cli.command {
        Commands::Query => cmd_query(&cli),
        Commands::Erase { addr, len } => cmd_erase(&cli, *addr, *len),
        Commands::Flash {
            image,
            fw_version,
            reboot,
        } => cmd_flash(&cli, image, fw_version, *reboot),
        Commands::Verify { image, fw_version } => cmd_verify(&cli, image, fw_version),
        Commands::Reboot => cmd_reboot(&cli),
        Commands::ListPorts => cmd_list_ports(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_u32_decimal_and_hex() {
        assert_eq!(parse_u32("1024"), Ok(1024));
        assert_eq!(parse_u32("0x8400"), Ok(0x8400));
        assert_eq!(parse_u32("0X10"), Ok(0x10));
        assert!(parse_u32("0xZZ").is_err());
        assert!(parse_u32("").is_err());
    }
}
