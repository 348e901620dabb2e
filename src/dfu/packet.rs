//! HCI-based DFU packet encoding for the serial bootloader.
//!
//! Each DFU command is wrapped in an HCI packet with a 4-byte header, a
//! CRC16 trailer and SLIP encoding:
//!
//! ```text
//! [0xC0] SLIP( header[4] || payload[N] || crc16_le[2] ) [0xC0]
//! ```

use std::fmt;

use super::bytes::{concat, read_u16_le, read_u32_le, u16_le, u32_le};
use super::config::{
    HCI_DATA_INTEGRITY_CHECK_BIT, HCI_PACKET_TYPE_DFU, HCI_RELIABLE_PACKET_BIT, MAX_PAYLOAD_LEN,
    SEQUENCE_MODULUS,
};
use super::crc::crc16;
use super::error::{DfuError, DfuResult};
use super::slip;

// ============================================================================
// DFU Command Opcodes (as 4-byte integers)
// ============================================================================

/// Bootloader command carried in the first four payload bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PacketKind {
    /// Init packet (firmware.dat contents).
    Init = 1,
    /// Liveness check.
    Ping = 2,
    /// Start DFU with image type and sizes.
    Start = 3,
    /// Firmware data chunk.
    Data = 4,
    /// End of the data phase.
    StopData = 5,
    /// Ask the bootloader to validate the received image.
    ValidateFirmware = 6,
    /// Activate the new image and reset.
    ActivateAndReset = 7,
}

impl PacketKind {
    /// The 32-bit opcode sent on the wire.
    pub fn opcode(self) -> u32 {
        self as u32
    }

    /// Map an opcode back to its kind.
    pub fn from_opcode(opcode: u32) -> Option<Self> {
        match opcode {
            1 => Some(PacketKind::Init),
            2 => Some(PacketKind::Ping),
            3 => Some(PacketKind::Start),
            4 => Some(PacketKind::Data),
            5 => Some(PacketKind::StopData),
            6 => Some(PacketKind::ValidateFirmware),
            7 => Some(PacketKind::ActivateAndReset),
            _ => None,
        }
    }

    /// Infer the kind from the opcode at the start of a payload.
    pub fn from_payload(payload: &[u8]) -> Option<Self> {
        read_u32_le(payload).and_then(Self::from_opcode)
    }

    /// Name used in logs.
    pub fn name(self) -> &'static str {
        match self {
            PacketKind::Init => "INIT_PACKET",
            PacketKind::Ping => "PING",
            PacketKind::Start => "START_PACKET",
            PacketKind::Data => "DATA_PACKET",
            PacketKind::StopData => "STOP_DATA_PACKET",
            PacketKind::ValidateFirmware => "VALIDATE_FIRMWARE",
            PacketKind::ActivateAndReset => "ACTIVATE_AND_RESET",
        }
    }
}

/// DFU image type (which firmware components the update replaces).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DfuMode {
    SoftDevice = 1,
    Bootloader = 2,
    SoftDeviceBootloader = 3,
    Application = 4,
}

impl DfuMode {
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

// ============================================================================
// Sequence Number Management
// ============================================================================

/// 3-bit packet sequence counter owned by one transport session.
#[derive(Debug, Default, Clone)]
pub struct SequenceCounter {
    value: u8,
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance and return the sequence number for the next framed packet.
    ///
    /// After a reset the first packet carries sequence number 1.
    pub fn next(&mut self) -> u8 {
        self.value = (self.value + 1) % SEQUENCE_MODULUS;
        self.value
    }

    /// Most recently issued sequence number (0 after a reset).
    pub fn current(&self) -> u8 {
        self.value
    }

    pub fn reset(&mut self) {
        self.value = 0;
    }
}

// ============================================================================
// HCI Header
// ============================================================================

/// Decoded HCI packet header.
///
/// Format (4 bytes):
/// - Byte 0: seq(3) | ack(3) | data_integrity(1) | reliable(1)
/// - Byte 1: pkt_type(4) | len_low(4)
/// - Byte 2: len_high(8)
/// - Byte 3: header checksum, so that all four bytes sum to 0 mod 256
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HciHeader {
    pub sequence: u8,
    pub ack: u8,
    pub data_integrity: bool,
    pub reliable: bool,
    pub packet_type: u8,
    pub length: u16,
}

impl HciHeader {
    pub const LEN: usize = 4;

    /// Serialize into the four wire bytes.
    pub fn to_bytes(&self) -> [u8; 4] {
        let byte0 = (self.sequence & 0x07)
            | ((self.ack & 0x07) << 3)
            | (u8::from(self.data_integrity) << HCI_DATA_INTEGRITY_CHECK_BIT)
            | (u8::from(self.reliable) << HCI_RELIABLE_PACKET_BIT);
        let byte1 = (self.packet_type & 0x0F) | (((self.length & 0x000F) as u8) << 4);
        let byte2 = ((self.length & 0x0FF0) >> 4) as u8;
        let byte3 = header_checksum(byte0, byte1, byte2);

        [byte0, byte1, byte2, byte3]
    }

    /// Parse the first four bytes of a decoded packet.
    ///
    /// Fails with `MalformedHeader` on truncation or a bad header checksum.
    pub fn parse(data: &[u8]) -> DfuResult<Self> {
        let header = data.get(..Self::LEN).ok_or(DfuError::MalformedHeader)?;

        let sum = header.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
        if sum != 0 {
            return Err(DfuError::MalformedHeader);
        }

        Ok(Self {
            sequence: header[0] & 0x07,
            ack: (header[0] >> 3) & 0x07,
            data_integrity: (header[0] >> HCI_DATA_INTEGRITY_CHECK_BIT) & 0x01 == 1,
            reliable: (header[0] >> HCI_RELIABLE_PACKET_BIT) & 0x01 == 1,
            packet_type: header[1] & 0x0F,
            length: (u16::from(header[2]) << 4) | u16::from(header[1] >> 4),
        })
    }
}

/// Two's complement of the sum of the first three header bytes.
fn header_checksum(byte0: u8, byte1: u8, byte2: u8) -> u8 {
    byte0.wrapping_add(byte1).wrapping_add(byte2).wrapping_neg()
}

// ============================================================================
// Framing
// ============================================================================

/// Build a complete HCI frame ready for the wire.
///
/// The ACK field is always 0 when sending.
pub fn frame(
    sequence: u8,
    data_integrity: bool,
    reliable: bool,
    packet_type: u8,
    payload: &[u8],
) -> DfuResult<Vec<u8>> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(DfuError::PacketTooLarge {
            size: payload.len(),
            max_size: MAX_PAYLOAD_LEN,
        });
    }

    let header = HciHeader {
        sequence,
        ack: 0,
        data_integrity,
        reliable,
        packet_type,
        length: payload.len() as u16,
    };

    // CRC16 over header + payload, appended little-endian
    let mut data = concat(&[&header.to_bytes(), payload]);
    let crc = crc16(&data);
    data.extend_from_slice(&u16_le(crc));

    Ok(slip::frame(&data))
}

// ============================================================================
// Packets
// ============================================================================

/// A framed packet ready for transmission.
///
/// Retries send `wire` unchanged.
#[derive(Debug, Clone)]
pub struct Packet {
    kind: Option<PacketKind>,
    sequence: u8,
    payload: Vec<u8>,
    wire: Vec<u8>,
}

impl Packet {
    /// Frame `payload`, inferring its kind from the leading opcode.
    pub fn new(counter: &mut SequenceCounter, payload: Vec<u8>) -> DfuResult<Self> {
        let kind = PacketKind::from_payload(&payload);
        Self::build(counter, kind, payload)
    }

    /// Frame `payload` as an explicitly typed command.
    pub fn with_kind(
        counter: &mut SequenceCounter,
        kind: PacketKind,
        payload: Vec<u8>,
    ) -> DfuResult<Self> {
        Self::build(counter, Some(kind), payload)
    }

    fn build(
        counter: &mut SequenceCounter,
        kind: Option<PacketKind>,
        payload: Vec<u8>,
    ) -> DfuResult<Self> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(DfuError::PacketTooLarge {
                size: payload.len(),
                max_size: MAX_PAYLOAD_LEN,
            });
        }

        let sequence = counter.next();
        let wire = frame(sequence, true, true, HCI_PACKET_TYPE_DFU, &payload)?;

        Ok(Self {
            kind,
            sequence,
            payload,
            wire,
        })
    }

    pub fn kind(&self) -> Option<PacketKind> {
        self.kind
    }

    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Exact bytes to write to the serial port.
    pub fn wire_bytes(&self) -> &[u8] {
        &self.wire
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.kind.map_or("UNKNOWN", PacketKind::name);
        write!(
            f,
            "{} packet, {} bytes, seq={}",
            name,
            self.wire.len(),
            self.sequence
        )
    }
}

// ============================================================================
// DFU Command Payloads
// ============================================================================

/// Payload of a command that carries nothing but its opcode.
pub fn opcode_payload(kind: PacketKind) -> Vec<u8> {
    u32_le(kind.opcode()).to_vec()
}

/// StartDfu payload: `[START(4), mode(4), sd_size(4), bl_size(4), app_size(4)]`.
pub fn start_dfu_payload(
    mode: DfuMode,
    softdevice_size: u32,
    bootloader_size: u32,
    app_size: u32,
) -> Vec<u8> {
    concat(&[
        &u32_le(PacketKind::Start.opcode()),
        &u32_le(mode.as_u32()),
        &u32_le(softdevice_size),
        &u32_le(bootloader_size),
        &u32_le(app_size),
    ])
}

/// Init payload: `[INIT(4), init_data..., 0x0000(2)]`.
///
/// The bootloader expects the 2-byte zero padding.
pub fn init_payload(init_data: &[u8]) -> Vec<u8> {
    concat(&[&u32_le(PacketKind::Init.opcode()), init_data, &u16_le(0x0000)])
}

/// Firmware data payload: `[DATA(4), chunk...]`.
pub fn data_payload(chunk: &[u8]) -> Vec<u8> {
    concat(&[&u32_le(PacketKind::Data.opcode()), chunk])
}

// ============================================================================
// Response Parsing
// ============================================================================

/// Header fields of a reply read back from the bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckFrame {
    pub sequence: u8,
    pub ack: u8,
    pub packet_type: u8,
    pub length: u16,
    pub data_integrity: bool,
    pub reliable: bool,
    /// Trailing CRC16 matched. Always true when no CRC is carried.
    pub checksum_valid: bool,
}

impl AckFrame {
    /// Parse an already SLIP-decoded reply.
    pub fn parse(decoded: &[u8]) -> DfuResult<Self> {
        let header = HciHeader::parse(decoded)?;

        let checksum_valid = if header.data_integrity {
            let body_len = HciHeader::LEN + usize::from(header.length);
            match (decoded.get(..body_len), decoded.get(body_len..)) {
                (Some(body), Some(trailer)) => read_u16_le(trailer) == Some(crc16(body)),
                _ => false,
            }
        } else {
            true
        };

        Ok(Self {
            sequence: header.sequence,
            ack: header.ack,
            packet_type: header.packet_type,
            length: header.length,
            data_integrity: header.data_integrity,
            reliable: header.reliable,
            checksum_valid,
        })
    }
}

/// SLIP-decode the span between the first and last END in a receive buffer.
pub fn decode_reply(buffer: &[u8]) -> DfuResult<Vec<u8>> {
    let span = slip::frame_span(buffer).ok_or(DfuError::MalformedHeader)?;
    slip::decode(span)
}

/// Locate, decode and parse the reply in a raw receive buffer.
pub fn parse_ack(buffer: &[u8]) -> DfuResult<AckFrame> {
    AckFrame::parse(&decode_reply(buffer)?)
}

// ============================================================================
// Tests
// ============================================================================
