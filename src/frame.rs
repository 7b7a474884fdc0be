//! Frame construction and integrity checks.
//!
//! Every frame on the bus has the layout
//! `[address] [command] [payload ...] [crc_lo] [crc_hi]`,
//! where the checksum is CRC-16/MODBUS over all preceding bytes.

use arrayvec::ArrayVec;
use crc::{Crc, CRC_16_MODBUS};

use crate::types::{Address, Command};

/// Largest frame the transport can capture.
pub const FRAME_CAPACITY: usize = 256;

/// Address, command and checksum.
pub const MIN_FRAME_LEN: usize = 4;

/// Bytes of a frame not available for payload.
pub(crate) const FRAME_OVERHEAD: usize = 4;

/// A complete protocol message, address through checksum.
pub type Frame = ArrayVec<u8, FRAME_CAPACITY>;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// CRC-16/MODBUS checksum, used in both directions on the bus.
pub fn crc16(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

/// Build a frame from its parts and append the checksum.
///
/// Panics if `payload` doesn't fit, callers check lengths up front.
pub fn encode(address: Address, command: Command, payload: &[u8]) -> Frame {
    let mut frame = Frame::new();
    frame.push(*address);
    frame.push(command.code());
    frame
        .try_extend_from_slice(payload)
        .expect("BUG: Frame buffer too small.");
    let crc = crc16(&frame);
    frame
        .try_extend_from_slice(&crc.to_le_bytes())
        .expect("BUG: Frame buffer too small.");
    frame
}

/// The trailing checksum of `frame`, read little-endian.
pub fn received_checksum(frame: &[u8]) -> Option<u16> {
    let (_, crc) = frame.split_at(frame.len().checked_sub(2)?);
    Some(u16::from_le_bytes([crc[0], crc[1]]))
}

/// The checksum `frame` should carry, computed over everything but the last two bytes.
pub fn expected_checksum(frame: &[u8]) -> Option<u16> {
    let covered = frame.len().checked_sub(2)?;
    Some(crc16(&frame[..covered]))
}

/// True if the trailing two bytes match the checksum of the rest of the frame.
pub fn verify_checksum(frame: &[u8]) -> bool {
    match (expected_checksum(frame), received_checksum(frame)) {
        (Some(expected), Some(received)) => expected == received,
        _ => false,
    }
}

/// Echo commands succeed when the node sends back exactly what it got.
pub fn matches_echo(request: &[u8], response: &[u8]) -> bool {
    request == response
}
