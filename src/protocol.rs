//! Wire format of the EMS RS485 protocol.
//!
//! The device speaks a Modbus-like dialect: every frame starts with the boot
//! marker `0xA5 0x5A`, followed by the device address, the function code, the
//! big-endian register address and register count, an optional big-endian
//! write payload and finally a little-endian CRC16 trailer.
//!
//! This module contains the pure frame codec: the checksum, the request
//! builders and the response parser. Nothing in here performs I/O.

use crc::{Crc, CRC_16_MODBUS};
use std::fmt;

/// Modbus RTU CRC (reflected polynomial `0xA001`, init `0xFFFF`).
const CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// The two bytes every frame starts with.
pub const BOOT_MARKER: [u8; 2] = [0xA5, 0x5A];

/// Function code for reading holding registers.
pub const FUNCTION_READ: u8 = 0x03;
/// Function code for writing registers.
pub const FUNCTION_WRITE: u8 = 0x10;

/// Length of the frame header: boot marker, address, function, register, count.
pub const HEADER_LEN: usize = 8;
/// Length of the CRC trailer.
pub const CRC_LEN: usize = 2;

/// Errors raised while validating a response frame.
///
/// All of them are recoverable; the transport session answers them with
/// another bus round trip.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("response too short: expected at least {expected} bytes, got {actual}")]
    Length { expected: usize, actual: usize },
    #[error("response header does not match the request")]
    HeaderMismatch,
    #[error("checksum mismatch: received {received:#06x}, calculated {calculated:#06x}")]
    Checksum { received: u16, calculated: u16 },
}

/// Computes the CRC16 checksum over `bytes`.
///
/// # Examples
///
/// ```
/// use ems_rs485_lib::protocol::checksum;
///
/// assert_eq!(checksum(b"123456789"), 0x4B37);
/// ```
pub fn checksum(bytes: &[u8]) -> u16 {
    CRC.checksum(bytes)
}

/// The RS485 address of the EMS on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Address(u8);

impl Address {
    /// The address the EMS ships with.
    pub const DEFAULT: Address = Address(0x01);
}

impl Default for Address {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl From<u8> for Address {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

impl std::ops::Deref for Address {
    type Target = u8;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

/// A contiguous block of registers read with a single request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterRange {
    pub address: u16,
    pub quantity: u16,
}

impl RegisterRange {
    pub const fn new(address: u16, quantity: u16) -> Self {
        Self { address, quantity }
    }

    /// Iterates over every register address of the range.
    pub fn addresses(&self) -> impl Iterator<Item = u16> {
        let start = self.address;
        (0..self.quantity).map(move |offset| start.wrapping_add(offset))
    }
}

/// An encoded request frame, ready to be put on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    bytes: Vec<u8>,
    count: u16,
}

impl Frame {
    /// The complete frame including the CRC trailer.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The first eight bytes, which the device echoes at the start of its response.
    pub fn header(&self) -> &[u8] {
        &self.bytes[..HEADER_LEN]
    }

    /// The function code of this frame.
    pub fn function(&self) -> u8 {
        self.bytes[3]
    }

    /// Number of register words the device answers with.
    ///
    /// A write is confirmed by a bare header echo, so zero words are expected.
    pub fn response_words(&self) -> u16 {
        if self.function() == FUNCTION_WRITE {
            0
        } else {
            self.count
        }
    }
}

fn encode_header(device: Address, function: u8, register: u16, count: u16) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(HEADER_LEN + CRC_LEN);
    bytes.extend_from_slice(&BOOT_MARKER);
    bytes.push(*device);
    bytes.push(function);
    bytes.extend_from_slice(&register.to_be_bytes());
    bytes.extend_from_slice(&count.to_be_bytes());
    bytes
}

fn append_crc(bytes: &mut Vec<u8>) {
    let crc = checksum(bytes);
    bytes.extend_from_slice(&crc.to_le_bytes());
}

/// Builds a "read holding registers" request.
pub fn build_read_frame(device: Address, register: u16, count: u16) -> Frame {
    let mut bytes = encode_header(device, FUNCTION_READ, register, count);
    append_crc(&mut bytes);
    Frame { bytes, count }
}

/// Builds a "write registers" request.
///
/// Unlike a read, the CRC covers the header *and* the data words.
pub fn build_write_frame(device: Address, register: u16, count: u16, data: &[u16]) -> Frame {
    let mut bytes = encode_header(device, FUNCTION_WRITE, register, count);
    for word in data {
        bytes.extend_from_slice(&word.to_be_bytes());
    }
    append_crc(&mut bytes);
    Frame { bytes, count }
}

/// Validates a raw response and extracts `count` register words.
///
/// Surplus bytes after the expected frame length are ignored.
pub fn parse_response(raw: &[u8], header: &[u8], count: u16) -> Result<Vec<u16>, FrameError> {
    let expected = HEADER_LEN + CRC_LEN + 2 * count as usize;
    if raw.len() < expected {
        return Err(FrameError::Length {
            expected,
            actual: raw.len(),
        });
    }
    let raw = &raw[..expected];
    if &raw[..HEADER_LEN] != header {
        return Err(FrameError::HeaderMismatch);
    }
    let (body, trailer) = raw.split_at(expected - CRC_LEN);
    let received = u16::from_le_bytes([trailer[0], trailer[1]]);
    let calculated = checksum(body);
    if received != calculated {
        return Err(FrameError::Checksum {
            received,
            calculated,
        });
    }
    Ok(body[HEADER_LEN..]
        .chunks_exact(2)
        .map(|word| u16::from_be_bytes([word[0], word[1]]))
        .collect())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use assert_matches::assert_matches;

    /// Builds the response a well-behaved device sends for `request`.
    pub(crate) fn device_response(request: &Frame, words: &[u16]) -> Vec<u8> {
        let mut bytes = request.header().to_vec();
        for word in words {
            bytes.extend_from_slice(&word.to_be_bytes());
        }
        append_crc(&mut bytes);
        bytes
    }

    #[test]
    fn checksum_reference_vectors() {
        assert_eq!(checksum(b"123456789"), 0x4B37);
        // Modbus RTU "read holding registers, slave 1, register 0, count 1".
        assert_eq!(checksum(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]), 0x0A84);
        assert_eq!(checksum(&[]), 0xFFFF);
    }

    #[test]
    fn read_frame_layout() {
        let frame = build_read_frame(Address::DEFAULT, 0x4001, 0x0010);
        let bytes = frame.as_bytes();
        assert_eq!(
            &bytes[..HEADER_LEN],
            &[0xA5, 0x5A, 0x01, 0x03, 0x40, 0x01, 0x00, 0x10]
        );
        assert_eq!(bytes.len(), HEADER_LEN + CRC_LEN);
        let crc = checksum(&bytes[..HEADER_LEN]);
        assert_eq!(&bytes[HEADER_LEN..], &crc.to_le_bytes());
        assert_eq!(frame.response_words(), 16);
        assert!(hex::encode(bytes).starts_with("a55a010340010010"));
    }

    #[test]
    fn write_frame_crc_covers_data() {
        let frame = build_write_frame(Address::DEFAULT, 0x302E, 1, &[1600]);
        let bytes = frame.as_bytes();
        assert_eq!(
            &bytes[..10],
            &[0xA5, 0x5A, 0x01, 0x10, 0x30, 0x2E, 0x00, 0x01, 0x06, 0x40]
        );
        let crc = checksum(&bytes[..10]);
        assert_eq!(&bytes[10..], &crc.to_le_bytes());
        assert_ne!(crc, checksum(frame.header()));
        assert_eq!(frame.response_words(), 0);
    }

    #[test]
    fn parse_echoed_read_response() {
        let request = build_read_frame(Address::from(0x07), 0x302D, 3);
        let response = device_response(&request, &[0x0001, 0xBEEF, 0x1234]);
        assert_eq!(
            parse_response(&response, request.header(), 3),
            Ok(vec![0x0001, 0xBEEF, 0x1234])
        );
    }

    #[test]
    fn parse_ignores_trailing_bytes() {
        let request = build_read_frame(Address::DEFAULT, 0x4016, 2);
        let mut response = device_response(&request, &[5, 6]);
        response.extend_from_slice(&[0x00, 0xFF, 0x13]);
        assert_eq!(
            parse_response(&response, request.header(), 2),
            Ok(vec![5, 6])
        );
    }

    #[test]
    fn parse_write_confirmation() {
        let request = build_write_frame(Address::DEFAULT, 0x303B, 1, &[1]);
        let response = device_response(&request, &[]);
        assert_eq!(
            parse_response(&response, request.header(), request.response_words()),
            Ok(vec![])
        );
    }

    #[test]
    fn parse_rejects_short_response() {
        let request = build_read_frame(Address::DEFAULT, 0x4001, 4);
        let response = device_response(&request, &[1, 2, 3]);
        assert_matches!(
            parse_response(&response, request.header(), 4),
            Err(FrameError::Length {
                expected: 18,
                actual: 16
            })
        );
        assert_matches!(
            parse_response(&[], request.header(), 4),
            Err(FrameError::Length { .. })
        );
    }

    #[test]
    fn parse_rejects_foreign_header() {
        let request = build_read_frame(Address::DEFAULT, 0x4001, 1);
        let other = build_read_frame(Address::DEFAULT, 0x4002, 1);
        let response = device_response(&other, &[42]);
        assert_matches!(
            parse_response(&response, request.header(), 1),
            Err(FrameError::HeaderMismatch)
        );
    }

    #[test]
    fn any_single_byte_corruption_is_detected() {
        let request = build_read_frame(Address::DEFAULT, 0x4016, 4);
        let response = device_response(&request, &[0x0001, 0x00FF, 0x8000, 0x1234]);
        for index in 0..response.len() {
            for flip in [0x01u8, 0x80, 0xFF] {
                let mut corrupted = response.clone();
                corrupted[index] ^= flip;
                let result = parse_response(&corrupted, request.header(), 4);
                if index < HEADER_LEN {
                    assert_matches!(result, Err(FrameError::HeaderMismatch));
                } else {
                    assert_matches!(result, Err(FrameError::Checksum { .. }));
                }
            }
        }
    }

    #[test]
    fn register_range_addresses() {
        let range = RegisterRange::new(0x403A, 3);
        assert_eq!(range.addresses().collect::<Vec<_>>(), [0x403A, 0x403B, 0x403C]);
    }
}
