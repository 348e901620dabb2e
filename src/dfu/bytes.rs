//! Little-endian helpers and hex formatting for wire data.

use std::fmt;

/// Encode a `u16` as two little-endian bytes.
pub fn u16_le(value: u16) -> [u8; 2] {
    value.to_le_bytes()
}

/// Encode a `u32` as four little-endian bytes.
pub fn u32_le(value: u32) -> [u8; 4] {
    value.to_le_bytes()
}

/// Read a little-endian `u16` from the start of `data`.
pub fn read_u16_le(data: &[u8]) -> Option<u16> {
    let bytes: [u8; 2] = data.get(..2)?.try_into().ok()?;
    Some(u16::from_le_bytes(bytes))
}

/// Read a little-endian `u32` from the start of `data`.
pub fn read_u32_le(data: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = data.get(..4)?.try_into().ok()?;
    Some(u32::from_le_bytes(bytes))
}

/// Concatenate byte slices into one buffer.
pub fn concat(parts: &[&[u8]]) -> Vec<u8> {
    let len = parts.iter().map(|part| part.len()).sum();
    let mut out = Vec::with_capacity(len);
    for part in parts {
        out.extend_from_slice(part);
    }
    out
}

/// Displays a byte slice as space-separated uppercase hex, e.g. `C0 0E 01`.
pub struct HexBytes<'a>(pub &'a [u8]);

impl fmt::Display for HexBytes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}
