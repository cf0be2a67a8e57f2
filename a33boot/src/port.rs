//! Native serial port plumbing using the `serialport` crate.
//!
//! The updater client only needs `Read + Write`, which
//! `serialport::SerialPort` trait objects already provide; this module
//! is the thin configuration and discovery layer on top.

use {
    crate::error::Result,
    log::debug,
    serialport::SerialPortInfo,
    std::time::Duration,
};

/// Serial port configuration. The bootloader always talks 8N1.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Read timeout. Kept short: the updater loops on its own reply
    /// deadline and treats port timeouts as "no bytes yet".
    pub timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: 115200,
            timeout: Duration::from_millis(20),
        }
    }
}

impl SerialConfig {
    /// Create a configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the read timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Open a serial port for updater use.
pub fn open(config: &SerialConfig) -> Result<Box<dyn serialport::SerialPort>> {
    debug!(
        "opening {} at {} baud",
        config.port_name, config.baud_rate
    );
    let port = serialport::new(&config.port_name, config.baud_rate)
        .timeout(config.timeout)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .flow_control(serialport::FlowControl::None)
        .open()?;
    Ok(port)
}

/// List the serial ports visible on this host.
pub fn list_ports() -> Result<Vec<SerialPortInfo>> {
    Ok(serialport::available_ports()?)
}
