//! Configuration constants and transport settings for the serial DFU protocol.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::DfuResult;

// ============================================================================
// Serial Communication
// ============================================================================

/// Baud rate for DFU communication with bootloader.
pub const DFU_BAUD_RATE: u32 = 115_200;

/// Poll interval of the background reader.
///
/// Bounds how long a stop request waits for a pending read to return.
pub const READ_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Delay after opening the port before touching any control line.
pub const SERIAL_PORT_OPEN_WAIT_TIME: Duration = Duration::from_millis(100);

/// How long DTR is held low during the reset sequence.
pub const DTR_LOW_TIME: Duration = Duration::from_millis(50);

/// Boot time allowed after DTR is raised again.
pub const DTR_RESET_WAIT_TIME: Duration = Duration::from_millis(100);

// ============================================================================
// DFU Protocol Timeouts
// ============================================================================

/// Default timeout waiting for ACK after sending a packet.
pub const ACK_PACKET_TIMEOUT: Duration = Duration::from_millis(5000);

/// Default ACK timeout for the validate request. The target often resets
/// first.
pub const VALIDATE_ACK_TIMEOUT: Duration = Duration::from_millis(2000);

/// Default ACK timeout for the activate request.
pub const ACTIVATE_ACK_TIMEOUT: Duration = Duration::from_millis(1000);

/// Interval between receive buffer polls while waiting for an ACK.
pub const ACK_POLL_INTERVAL: Duration = Duration::from_millis(10);

// ============================================================================
// Retry Configuration
// ============================================================================

/// Maximum number of transmission attempts for a single packet.
pub const MAX_PACKET_ATTEMPTS: u8 = 3;

// ============================================================================
// DFU Packet Configuration
// ============================================================================

/// Maximum firmware bytes carried by one data packet.
pub const DFU_PACKET_MAX_SIZE: usize = 512;

/// Largest payload the 12-bit header length field can describe.
pub const MAX_PAYLOAD_LEN: usize = 0x0FFF;

/// Sequence and ACK numbers are 3-bit values.
pub const SEQUENCE_MODULUS: u8 = 8;

// ============================================================================
// SLIP Protocol Constants
// ============================================================================

/// SLIP frame delimiter (END byte).
pub const SLIP_END: u8 = 0xC0;

/// SLIP escape byte.
pub const SLIP_ESC: u8 = 0xDB;

/// SLIP escaped END (0xC0 encoded as 0xDB 0xDC).
pub const SLIP_ESC_END: u8 = 0xDC;

/// SLIP escaped ESC (0xDB encoded as 0xDB 0xDD).
pub const SLIP_ESC_ESC: u8 = 0xDD;

// ============================================================================
// HCI Packet Constants
// ============================================================================

/// Bit position for data integrity check flag in header byte 0.
pub const HCI_DATA_INTEGRITY_CHECK_BIT: u8 = 6;

/// Bit position for reliable packet flag in header byte 0.
pub const HCI_RELIABLE_PACKET_BIT: u8 = 7;

/// HCI packet type for DFU data packets (goes in byte 1, bits 0-3).
pub const HCI_PACKET_TYPE_DFU: u8 = 14;

/// HCI packet type used by the bootloader for bare acknowledgements.
pub const HCI_PACKET_TYPE_ACK: u8 = 0;

// ============================================================================
// Flash Timing Constants (for erase/write wait times)
// ============================================================================

/// Flash page size in bytes.
pub const FLASH_PAGE_SIZE: usize = 4096;

/// Time to erase one flash page, in milliseconds.
pub const FLASH_PAGE_ERASE_TIME_MS: f64 = 89.7;

/// Time to write one 32-bit flash word, in milliseconds.
pub const FLASH_WORD_WRITE_TIME_MS: f64 = 0.1;

/// Time to write one flash page: `FLASH_PAGE_SIZE / 4 * FLASH_WORD_WRITE_TIME_MS`.
pub const FLASH_PAGE_WRITE_TIME_MS: f64 = 102.4;

/// Shortest erase wait, regardless of image size.
pub const MIN_ERASE_WAIT_MS: f64 = 500.0;

/// Number of data frames per flash page (8 frames = 4096 bytes = 1 page).
pub const FRAMES_PER_FLASH_PAGE: usize = FLASH_PAGE_SIZE / DFU_PACKET_MAX_SIZE;

/// Convert fractional milliseconds into a `Duration`.
pub fn millis_f64(ms: f64) -> Duration {
    Duration::from_secs_f64(ms / 1000.0)
}

/// Flash page write time as a `Duration`.
pub fn page_write_time() -> Duration {
    millis_f64(FLASH_PAGE_WRITE_TIME_MS)
}

// ============================================================================
// Transport Settings
// ============================================================================

/// Settings for one serial DFU connection.
///
/// Every field has a default, so a JSON file only needs to name what it
/// changes:
///
/// ```json
/// { "portName": "/dev/ttyACM0", "singleBank": true }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TransportConfig {
    /// Serial port path (e.g. "/dev/ttyACM0" or "COM3").
    pub port_name: String,

    /// Line speed.
    pub baud_rate: u32,

    /// Enable RTS/CTS hardware flow control.
    pub flow_control: bool,

    /// The target has a single firmware bank. Only affects activate timing.
    pub single_bank: bool,

    /// Skip the DTR reset sequence because the device already sits in its
    /// bootloader.
    pub skip_reset: bool,

    /// Default ACK timeout in milliseconds.
    pub ack_timeout_ms: u64,

    /// ACK timeout for the validate request, in milliseconds.
    pub validate_timeout_ms: u64,

    /// ACK timeout for the activate request, in milliseconds.
    pub activate_timeout_ms: u64,

    /// Background reader poll interval in milliseconds.
    pub read_poll_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: DFU_BAUD_RATE,
            flow_control: false,
            single_bank: false,
            skip_reset: false,
            ack_timeout_ms: ACK_PACKET_TIMEOUT.as_millis() as u64,
            validate_timeout_ms: VALIDATE_ACK_TIMEOUT.as_millis() as u64,
            activate_timeout_ms: ACTIVATE_ACK_TIMEOUT.as_millis() as u64,
            read_poll_ms: READ_POLL_INTERVAL.as_millis() as u64,
        }
    }
}

impl TransportConfig {
    /// Create a configuration for a port with default line settings.
    pub fn new(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            ..Default::default()
        }
    }

    /// Load settings from a JSON file.
    ///
    /// A missing or empty file yields the defaults.
    pub fn load(path: &Path) -> DfuResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)?;
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }

        Ok(serde_json::from_str(&contents)?)
    }

    /// Default ACK timeout.
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn validate_timeout(&self) -> Duration {
        Duration::from_millis(self.validate_timeout_ms)
    }

    pub fn activate_timeout(&self) -> Duration {
        Duration::from_millis(self.activate_timeout_ms)
    }

    /// Background reader poll interval.
    pub fn read_poll_interval(&self) -> Duration {
        Duration::from_millis(self.read_poll_ms.max(1))
    }
}
