//! DFU error types for the serial DFU transport.

use thiserror::Error;

/// Result type alias for DFU operations.
pub type DfuResult<T> = Result<T, DfuError>;

/// Errors that can occur during DFU operations.
#[derive(Debug, Error)]
pub enum DfuError {
    /// Serial port error from the serialport crate.
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Standard I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// ZIP archive error.
    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// JSON parsing error (manifest.json or a settings file).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// An operation needed an open transport.
    #[error("Transport is not open")]
    TransportNotOpen,

    /// The port could not be acquired or configured.
    #[error("Serial port '{port}' could not be opened: {reason}")]
    OpenFailed { port: String, reason: String },

    /// No acknowledgement arrived within the ACK timeout.
    #[error("Timeout waiting for ACK")]
    AckTimeout,

    /// A framed reply decoded to nothing.
    #[error("Received data too short to extract ACK number")]
    ShortResponse,

    /// A reply header was truncated or failed its checksum.
    #[error("Malformed packet header")]
    MalformedHeader,

    /// Every transmission attempt for one packet failed.
    #[error("Three failed tx attempts encountered on packet {sequence}")]
    ThreeFailedAttempts {
        sequence: u8,
        #[source]
        last: Box<DfuError>,
    },

    /// The connection dropped in the middle of an exchange.
    #[error("Serial device has been lost")]
    DeviceLost,

    /// Invalid SLIP escape sequence encountered during decoding.
    #[error("Invalid SLIP escape sequence")]
    InvalidSlipEscape,

    /// SLIP frame ended in the middle of an escape sequence.
    #[error("Incomplete SLIP frame")]
    IncompleteSlipFrame,

    /// Received ACK number did not follow the previous one.
    #[error("Sequence mismatch: expected ACK {expected}, got {actual}")]
    SequenceMismatch { expected: u8, actual: u8 },

    /// Packet size exceeds maximum allowed.
    #[error("Packet size {size} exceeds maximum {max_size}")]
    PacketTooLarge { size: usize, max_size: usize },

    /// Required file missing from the DFU package.
    #[error("Missing file in firmware package: {filename}")]
    MissingFile { filename: String },

    /// Invalid or malformed manifest.json.
    #[error("Invalid manifest: {reason}")]
    InvalidManifest { reason: String },

    /// Package digest differs from the one the caller expected.
    #[error("SHA-256 mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },
}

impl DfuError {
    /// Check if this error is retriable (transient errors that may succeed on retry).
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            DfuError::AckTimeout
                | DfuError::ShortResponse
                | DfuError::MalformedHeader
                | DfuError::InvalidSlipEscape
                | DfuError::IncompleteSlipFrame
                | DfuError::SequenceMismatch { .. }
                | DfuError::Io(_)
        )
    }

    /// Whether this error is what a target looks like after it reset itself.
    ///
    /// Validate and activate requests treat these as success.
    pub fn is_device_reset(&self) -> bool {
        match self {
            DfuError::AckTimeout | DfuError::DeviceLost | DfuError::TransportNotOpen => true,
            DfuError::ThreeFailedAttempts { last, .. } => last.is_device_reset(),
            _ => false,
        }
    }

    /// Get a user-friendly error code for support purposes.
    pub fn error_code(&self) -> &'static str {
        match self {
            DfuError::Serial(_) => "DFU-001",
            DfuError::Io(_) => "DFU-002",
            DfuError::Zip(_) => "DFU-003",
            DfuError::Json(_) => "DFU-004",
            DfuError::InvalidSlipEscape => "DFU-010",
            DfuError::IncompleteSlipFrame => "DFU-011",
            DfuError::MalformedHeader => "DFU-012",
            DfuError::ShortResponse => "DFU-013",
            DfuError::AckTimeout => "DFU-021",
            DfuError::ThreeFailedAttempts { .. } => "DFU-023",
            DfuError::MissingFile { .. } => "DFU-040",
            DfuError::InvalidManifest { .. } => "DFU-041",
            DfuError::DigestMismatch { .. } => "DFU-042",
            DfuError::DeviceLost => "DFU-051",
            DfuError::OpenFailed { .. } => "DFU-052",
            DfuError::TransportNotOpen => "DFU-055",
            DfuError::SequenceMismatch { .. } => "DFU-060",
            DfuError::PacketTooLarge { .. } => "DFU-061",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_is_retriable() {
        assert!(DfuError::AckTimeout.is_retriable());
        assert!(DfuError::MalformedHeader.is_retriable());
        assert!(DfuError::SequenceMismatch {
            expected: 3,
            actual: 5
        }
        .is_retriable());
        assert!(!DfuError::DeviceLost.is_retriable());
        assert!(!DfuError::TransportNotOpen.is_retriable());
    }

    #[test]
    fn test_device_reset_looks_through_retry_exhaustion() {
        let exhausted = DfuError::ThreeFailedAttempts {
            sequence: 4,
            last: Box::new(DfuError::AckTimeout),
        };
        assert!(exhausted.is_device_reset());

        let garbled = DfuError::ThreeFailedAttempts {
            sequence: 4,
            last: Box::new(DfuError::MalformedHeader),
        };
        assert!(!garbled.is_device_reset());
        assert!(!DfuError::ShortResponse.is_device_reset());
    }

    #[test]
    fn test_three_failed_attempts_keeps_cause() {
        use std::error::Error as _;

        let err = DfuError::ThreeFailedAttempts {
            sequence: 2,
            last: Box::new(DfuError::AckTimeout),
        };
        assert_eq!(
            err.to_string(),
            "Three failed tx attempts encountered on packet 2"
        );
        assert_eq!(err.source().unwrap().to_string(), "Timeout waiting for ACK");
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(DfuError::AckTimeout.error_code(), "DFU-021");
        assert_eq!(DfuError::DeviceLost.error_code(), "DFU-051");
    }
}
