//! SLIP (Serial Line Internet Protocol) byte stuffing.
//!
//! Implements the escaping of RFC 1055 for framing serial data packets.
//! See: https://datatracker.ietf.org/doc/html/rfc1055
//!
//! [`encode`] and [`decode`] work on frame bodies only; [`frame`] adds the
//! END delimiters and [`frame_span`] finds a frame in a receive buffer.

use super::config::{SLIP_END, SLIP_ESC, SLIP_ESC_END, SLIP_ESC_ESC};
use super::error::{DfuError, DfuResult};

/// Escape END and ESC bytes in `data`.
///
/// The output never contains a literal END byte.
pub fn encode(data: &[u8]) -> Vec<u8> {
    // Pre-allocate with some extra space for escapes
    let mut encoded = Vec::with_capacity(data.len() + data.len() / 8 + 2);

    for &byte in data {
        match byte {
            SLIP_END => {
                encoded.push(SLIP_ESC);
                encoded.push(SLIP_ESC_END);
            }
            SLIP_ESC => {
                encoded.push(SLIP_ESC);
                encoded.push(SLIP_ESC_ESC);
            }
            _ => encoded.push(byte),
        }
    }

    encoded
}

/// Undo [`encode`].
///
/// Literal END bytes are frame delimiters and are skipped.
pub fn decode(data: &[u8]) -> DfuResult<Vec<u8>> {
    let mut decoded = Vec::with_capacity(data.len());
    let mut escape_next = false;

    for &byte in data {
        if byte == SLIP_END {
            continue;
        }

        if escape_next {
            match byte {
                SLIP_ESC_END => decoded.push(SLIP_END),
                SLIP_ESC_ESC => decoded.push(SLIP_ESC),
                _ => return Err(DfuError::InvalidSlipEscape),
            }
            escape_next = false;
        } else if byte == SLIP_ESC {
            escape_next = true;
        } else {
            decoded.push(byte);
        }
    }

    // If we ended expecting an escape, the frame is incomplete
    if escape_next {
        return Err(DfuError::IncompleteSlipFrame);
    }

    Ok(decoded)
}

/// Stuff `data` and wrap it with one END delimiter on each side.
pub fn frame(data: &[u8]) -> Vec<u8> {
    let encoded = encode(data);

    let mut framed = Vec::with_capacity(encoded.len() + 2);
    framed.push(SLIP_END);
    framed.extend_from_slice(&encoded);
    framed.push(SLIP_END);
    framed
}

/// Number of END delimiters in `buffer`.
pub fn count_delimiters(buffer: &[u8]) -> usize {
    buffer.iter().filter(|&&b| b == SLIP_END).count()
}

/// The still-stuffed bytes between the first and the last END in `buffer`.
///
/// Returns `None` until at least two delimiters have arrived.
pub fn frame_span(buffer: &[u8]) -> Option<&[u8]> {
    let first = buffer.iter().position(|&b| b == SLIP_END)?;
    let last = buffer.iter().rposition(|&b| b == SLIP_END)?;
    if last > first {
        Some(&buffer[first + 1..last])
    } else {
        None
    }
}
