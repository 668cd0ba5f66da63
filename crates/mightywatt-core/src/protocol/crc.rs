//! CRC-16/XMODEM
//!
//! Polynomial 0x1021, initial value 0, MSB first, no reflection, no final XOR.
//! Every frame carries it in both directions, low byte first.

use crc::{Crc, CRC_16_XMODEM};

const XMODEM: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Compute the CRC over `data`
pub fn crc16(data: &[u8]) -> u16 {
    XMODEM.checksum(data)
}

/// Append the CRC of `frame` to its end, low byte first
pub fn append_crc(frame: &mut Vec<u8>) {
    let crc = crc16(frame);
    frame.extend_from_slice(&crc.to_le_bytes());
}

/// Check a frame whose last two bytes are its CRC
pub fn verify_trailer(frame: &[u8]) -> Result<(), (u16, u16)> {
    if frame.len() < 2 {
        return Err((crc16(&[]), 0));
    }
    let (body, trailer) = frame.split_at(frame.len() - 2);
    let expected = crc16(body);
    let actual = u16::from_le_bytes([trailer[0], trailer[1]]);
    if expected == actual {
        Ok(())
    } else {
        Err((expected, actual))
    }
}
