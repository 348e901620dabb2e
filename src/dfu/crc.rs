//! CRC16 used by the bootloader to check framed packets.
//!
//! The Nordic `crc16_compute` routine is CRC-16/CCITT-FALSE: polynomial
//! 0x1021, initial value 0xFFFF, no reflection, no final xor.

use crc16::{State, CCITT_FALSE};

/// Calculate the packet CRC over `data`.
pub fn crc16(data: &[u8]) -> u16 {
    State::<CCITT_FALSE>::calculate(data)
}
