//! Request frame construction and response decoding.
//!
//! The dryve controller tunnels CANopen object-dictionary access through
//! Modbus TCP "encapsulated interface" telegrams (function 43, MEI type 13).
//! Every request and response shares a 19-byte header:
//!
//! ```text
//! [txn_hi, txn_lo, proto_hi, proto_lo, 0, len,   // Modbus TCP header
//!  0, 43, 13, rw, 0, 0,                          // unit, function, MEI, read/write
//!  idx_hi, idx_lo, sub_idx, 0, 0, 0, data_len,   // object address, byte count
//!  data...]
//! ```
//!
//! `len` counts the bytes following offset 5 and is back-patched once the
//! frame is complete.

use crate::error::{DriveError, Result};

/// Modbus function code for encapsulated interface transport.
pub const FUNCTION_CODE: u8 = 43;
/// MEI type for CANopen general reference.
pub const MEI_TYPE: u8 = 13;
/// Bytes preceding the data payload in both requests and responses.
pub const HEADER_LEN: usize = 19;
/// Offset of the Modbus length field.
pub const LENGTH_OFFSET: usize = 5;
/// Fixed read size for one response; the controller never sends more.
pub const RESPONSE_SIZE: usize = 24;

/// CANopen object indices used by the lift.
pub mod object {
    /// Manufacturer-specific homing status (bit 0 = homing attained).
    pub const HOMING_STATUS: u16 = 0x2014;
    pub const CONTROLWORD: u16 = 0x6040;
    pub const STATUSWORD: u16 = 0x6041;
    pub const MODES_OF_OPERATION: u16 = 0x6060;
    pub const MODES_OF_OPERATION_DISPLAY: u16 = 0x6061;
    pub const POSITION_ACTUAL: u16 = 0x6064;
    pub const VELOCITY_ACTUAL: u16 = 0x606C;
    pub const TARGET_POSITION: u16 = 0x607A;
    pub const PROFILE_VELOCITY: u16 = 0x6081;
    pub const PROFILE_ACCELERATION: u16 = 0x6083;
    pub const PROFILE_DECELERATION: u16 = 0x6084;
    /// Sub 1: feed, sub 2: shaft revolutions.
    pub const FEED_CONSTANT: u16 = 0x6092;
    pub const HOMING_METHOD: u16 = 0x6098;
    /// Sub 1: switch search speed, sub 2: zero search speed.
    pub const HOMING_SPEEDS: u16 = 0x6099;
    pub const HOMING_ACCELERATION: u16 = 0x609A;
    pub const DIGITAL_INPUTS: u16 = 0x60FD;
}

/// Controlword values for the CiA 402 transitions the lift uses.
pub mod controlword {
    pub const SHUTDOWN: u16 = 0x0006;
    pub const SWITCH_ON: u16 = 0x0007;
    pub const ENABLE_OPERATION: u16 = 0x000F;
    /// Enable operation plus "new set-point" / "homing start" (bit 4).
    pub const START: u16 = 0x001F;
    pub const FAULT_RESET: u16 = 0x0080;
}

/// Direction of an object-dictionary access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Access {
    Read = 0,
    Write = 1,
}

/// Build a raw request frame.
///
/// `data_len` is the byte count declared to the controller; for reads it is
/// the size of the expected reply and `data` is empty.
pub fn build_frame(
    access: Access,
    object: u16,
    sub_index: u8,
    data_len: u8,
    data: &[u8],
) -> Vec<u8> {
    let [idx_hi, idx_lo] = object.to_be_bytes();
    let mut frame = Vec::with_capacity(HEADER_LEN + data.len());
    frame.extend_from_slice(&[
        0,
        0,
        0,
        0,
        0,
        0,
        0,
        FUNCTION_CODE,
        MEI_TYPE,
        access as u8,
        0,
        0,
        idx_hi,
        idx_lo,
        sub_index,
        0,
        0,
        0,
        data_len,
    ]);
    frame.extend_from_slice(data);
    frame[LENGTH_OFFSET] = (frame.len() - (LENGTH_OFFSET + 1)) as u8;
    frame
}

/// Read request for `data_len` bytes of `object`/`sub_index`.
pub fn read_request(object: u16, sub_index: u8, data_len: u8) -> Vec<u8> {
    build_frame(Access::Read, object, sub_index, data_len, &[])
}

/// Write a signed 32-bit parameter (positions, speeds, accelerations).
pub fn write_i32(object: u16, sub_index: u8, value: i32) -> Vec<u8> {
    build_frame(Access::Write, object, sub_index, 4, &value.to_le_bytes())
}

pub fn write_u32(object: u16, sub_index: u8, value: u32) -> Vec<u8> {
    build_frame(Access::Write, object, sub_index, 4, &value.to_le_bytes())
}

pub fn write_u16(object: u16, sub_index: u8, value: u16) -> Vec<u8> {
    build_frame(Access::Write, object, sub_index, 2, &value.to_le_bytes())
}

pub fn write_i8(object: u16, sub_index: u8, value: i8) -> Vec<u8> {
    build_frame(Access::Write, object, sub_index, 1, &value.to_le_bytes())
}

/// Controlword write.
pub fn controlword_frame(value: u16) -> Vec<u8> {
    write_u16(object::CONTROLWORD, 0, value)
}

/// Statusword read.
pub fn statusword_request() -> Vec<u8> {
    read_request(object::STATUSWORD, 0, 2)
}

/// Little-endian 16-bit value in the last two bytes of a response.
///
/// Returns `None` for buffers shorter than two bytes.
pub fn decode_statusword(response: &[u8]) -> Option<u16> {
    match response {
        [.., low, high] => Some(u16::from(*low) | (u16::from(*high) << 8)),
        _ => None,
    }
}

/// Data bytes following the header of a response.
pub fn payload(response: &[u8], len: usize) -> Result<&[u8]> {
    response
        .get(HEADER_LEN..HEADER_LEN + len)
        .ok_or(DriveError::ShortResponse {
            expected: HEADER_LEN + len,
            actual: response.len(),
        })
}

pub fn payload_i32(response: &[u8]) -> Result<i32> {
    let bytes = payload(response, 4)?;
    Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

pub fn payload_u32(response: &[u8]) -> Result<u32> {
    let bytes = payload(response, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

pub fn payload_i8(response: &[u8]) -> Result<i8> {
    let bytes = payload(response, 1)?;
    Ok(bytes[0] as i8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_position_frame() {
        let target_position: i32 = 5000;
        let frame = build_frame(
            Access::Write,
            0x6064,
            0,
            4,
            &target_position.to_le_bytes(),
        );
        assert_eq!(frame[LENGTH_OFFSET] as usize, frame.len() - 6);
        assert_eq!(&frame[frame.len() - 4..], &[0x88, 0x13, 0x00, 0x00]);
        assert_eq!(&frame[12..14], &[0x60, 0x64]);
        assert_eq!(frame[9], 1);
    }

    #[test]
    fn test_statusword_request_layout() {
        assert_eq!(
            statusword_request(),
            vec![0, 0, 0, 0, 0, 13, 0, 43, 13, 0, 0, 0, 96, 65, 0, 0, 0, 0, 2]
        );
    }

    #[test]
    fn test_controlword_frames() {
        assert_eq!(
            controlword_frame(controlword::SHUTDOWN),
            vec![0, 0, 0, 0, 0, 15, 0, 43, 13, 1, 0, 0, 96, 64, 0, 0, 0, 0, 2, 6, 0]
        );
        assert_eq!(
            controlword_frame(controlword::FAULT_RESET),
            vec![0, 0, 0, 0, 0, 15, 0, 43, 13, 1, 0, 0, 96, 64, 0, 0, 0, 0, 2, 128, 0]
        );
    }

    #[test]
    fn test_mode_frame_is_single_byte() {
        let frame = write_i8(object::MODES_OF_OPERATION, 0, 6);
        assert_eq!(
            frame,
            vec![0, 0, 0, 0, 0, 14, 0, 43, 13, 1, 0, 0, 96, 96, 0, 0, 0, 0, 1, 6]
        );
    }

    #[test]
    fn test_negative_write_is_twos_complement() {
        let frame = write_i32(object::TARGET_POSITION, 0, -2);
        assert_eq!(&frame[HEADER_LEN..], &[0xFE, 0xFF, 0xFF, 0xFF]);
        assert_eq!(frame[18], 4);
    }

    #[test]
    fn test_decode_statusword() {
        const TAIL: [u8; 7] = [0x00, 0x01, 0x06, 0x21, 0x27, 0x80, 0xFF];
        for len in 2..=24usize {
            for (i, &low) in TAIL.iter().enumerate() {
                for &high in TAIL.iter().rev().skip(i % 3) {
                    let mut buf: Vec<u8> = (0..len).map(|b| (b * 37 + i) as u8).collect();
                    buf[len - 2] = low;
                    buf[len - 1] = high;
                    assert_eq!(
                        decode_statusword(&buf),
                        Some(u16::from_le_bytes([low, high])),
                        "len={len} low={low:#04x} high={high:#04x}"
                    );
                }
            }
        }
        assert_eq!(decode_statusword(&[0x27]), None);
        assert_eq!(decode_statusword(&[]), None);
    }

    #[test]
    fn test_payload_i32() {
        let mut response = read_request(object::POSITION_ACTUAL, 0, 4);
        response.extend_from_slice(&(-30000i32).to_le_bytes());
        assert_eq!(payload_i32(&response).unwrap(), -30000);

        let short = read_request(object::POSITION_ACTUAL, 0, 4);
        assert!(matches!(
            payload_i32(&short),
            Err(DriveError::ShortResponse {
                expected: 23,
                actual: 19
            })
        ));
    }
}
