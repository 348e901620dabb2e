//! Physical serial port access.
//!
//! Provides a trait-based abstraction over serial communication,
//! enabling both real hardware and scripted test peers.

use std::io::{Read, Write};
use std::thread;
use std::time::Duration;

use log::debug;
#[cfg(test)]
use mockall::automock;
use serialport::SerialPort;

use super::config::TransportConfig;
use super::error::{DfuError, DfuResult};

/// Byte-level access to one open serial connection.
pub trait SerialLink: Send {
    /// Write the whole buffer.
    fn write_all(&mut self, data: &[u8]) -> DfuResult<()>;

    /// Read whatever is available, waiting at most the port's poll interval.
    ///
    /// Returns `Ok(0)` when nothing arrived in time.
    fn read(&mut self, buffer: &mut [u8]) -> DfuResult<usize>;

    /// Drive the DTR control line.
    fn set_dtr(&mut self, level: bool) -> DfuResult<()>;

    /// A second handle to the same port, for the background reader.
    fn try_clone_link(&self) -> DfuResult<Box<dyn SerialLink>>;

    /// Release the port. Dropping the link also releases it.
    fn close(&mut self) -> DfuResult<()> {
        Ok(())
    }
}

/// Acquires a configured port from the host environment.
#[cfg_attr(test, automock)]
pub trait PortConnector: Send {
    fn connect(&self, config: &TransportConfig) -> DfuResult<Box<dyn SerialLink>>;
}

/// Opens real serial ports through the `serialport` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialPortConnector;

impl PortConnector for SerialPortConnector {
    fn connect(&self, config: &TransportConfig) -> DfuResult<Box<dyn SerialLink>> {
        let port = open_port(config)?;
        Ok(Box::new(NativeLink { port }))
    }
}

/// Open and configure a serial port for DFU communication.
///
/// Includes retry logic to handle transient connectivity failures during
/// USB device re-enumeration (e.g., right after entering bootloader mode).
fn open_port(config: &TransportConfig) -> DfuResult<Box<dyn SerialPort>> {
    const MAX_OPEN_RETRIES: u32 = 10;
    const RETRY_DELAY: Duration = Duration::from_millis(200);

    if config.port_name.is_empty() {
        return Err(DfuError::OpenFailed {
            port: String::new(),
            reason: "no serial port configured".to_string(),
        });
    }

    let normalized_name = normalize_port_name(&config.port_name);
    let flow_control = if config.flow_control {
        serialport::FlowControl::Hardware
    } else {
        serialport::FlowControl::None
    };

    let mut attempt = 0;
    loop {
        attempt += 1;

        let error = match serialport::new(&normalized_name, config.baud_rate)
            .timeout(config.read_poll_interval())
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(flow_control)
            .open()
        {
            Ok(port) => return Ok(port),
            Err(e) => e,
        };

        let err_str = error.to_string().to_lowercase();

        // Transient errors that may resolve after driver initialization:
        // - "not functioning": Windows driver not ready after USB re-enumeration
        // - "resource temporarily unavailable": Device briefly unavailable
        // - "interrupted": Operation interrupted, may succeed on retry
        let is_transient = err_str.contains("not functioning")
            || err_str.contains("temporarily unavailable")
            || err_str.contains("interrupted");

        if is_transient && attempt < MAX_OPEN_RETRIES {
            debug!(
                "[SERIAL] Transient open failure on {} (attempt {}): {}",
                normalized_name, attempt, error
            );
            thread::sleep(RETRY_DELAY);
            continue;
        }

        return Err(DfuError::OpenFailed {
            port: config.port_name.clone(),
            reason: describe_open_error(&error, &err_str),
        });
    }
}

fn describe_open_error(error: &serialport::Error, lowercase: &str) -> String {
    match error.kind() {
        serialport::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
            "permission denied".to_string()
        }
        serialport::ErrorKind::Io(std::io::ErrorKind::NotFound)
        | serialport::ErrorKind::NoDevice => "no such device".to_string(),
        _ if lowercase.contains("busy") || lowercase.contains("in use") => {
            "port is busy or in use by another application".to_string()
        }
        _ => error.to_string(),
    }
}

/// A port opened by [`SerialPortConnector`].
pub struct NativeLink {
    port: Box<dyn SerialPort>,
}

impl SerialLink for NativeLink {
    fn write_all(&mut self, data: &[u8]) -> DfuResult<()> {
        // Single write call - the OS handles USB packetization.
        self.port.write_all(data)?;
        Ok(())
    }

    fn read(&mut self, buffer: &mut [u8]) -> DfuResult<usize> {
        match self.port.read(buffer) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(DfuError::Io(e)),
        }
    }

    fn set_dtr(&mut self, level: bool) -> DfuResult<()> {
        self.port.write_data_terminal_ready(level)?;
        Ok(())
    }

    fn try_clone_link(&self) -> DfuResult<Box<dyn SerialLink>> {
        let port = self.port.try_clone()?;
        Ok(Box::new(NativeLink { port }))
    }

    fn close(&mut self) -> DfuResult<()> {
        self.port.flush()?;
        Ok(())
    }
}

/// Normalize a port name for cross-platform compatibility.
fn normalize_port_name(name: &str) -> String {
    #[cfg(target_os = "macos")]
    {
        // Prefer cu. over tty. for better compatibility
        if name.starts_with("/dev/tty.") {
            return name.replace("/dev/tty.", "/dev/cu.");
        }
    }

    #[cfg(target_os = "windows")]
    {
        // COM ports > 9 need \\.\\ prefix
        if let Some(number) = name.strip_prefix("COM") {
            if let Ok(n) = number.parse::<u32>() {
                if n > 9 {
                    return format!("\\\\.\\{}", name);
                }
            }
        }
    }

    name.to_string()
}
