// Header checksums for OMFS metadata blocks
// Body: CRC-16/CCITT, most significant bit first, initial value 0.
// Header: XOR of the first OMFS_XOR_COUNT bytes.

use super::constants::{HEADER_SIZE, OMFS_XOR_COUNT};

const CRC_CCITT_POLY: u16 = 0x1021;

/// CRC-16/CCITT with msb-first bit order (the XMODEM variant when seeded with 0).
pub fn crc_ccitt_msb(initial: u16, data: &[u8]) -> u16 {
    let mut crc = initial;

    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ CRC_CCITT_POLY;
            } else {
                crc <<= 1;
            }
        }
    }

    crc
}

/// XOR of the header bytes that precede the check byte.
pub fn header_xor(block: &[u8]) -> u8 {
    block[..OMFS_XOR_COUNT].iter().fold(0, |acc, b| acc ^ b)
}

/// CRC of the `body_size` bytes that follow the header, clamped to the buffer.
pub fn body_crc(block: &[u8], body_size: usize) -> u16 {
    let end = (HEADER_SIZE + body_size).min(block.len());
    crc_ccitt_msb(0, &block[HEADER_SIZE.min(end)..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc_check_value() {
        // Standard check input for CRC-16/XMODEM.
        assert_eq!(crc_ccitt_msb(0, b"123456789"), 0x31C3);
        assert_eq!(crc_ccitt_msb(0, &[]), 0);
    }

    #[test]
    fn test_crc_is_incremental() {
        let whole = crc_ccitt_msb(0, b"hello world");
        let split = crc_ccitt_msb(crc_ccitt_msb(0, b"hello "), b"world");
        assert_eq!(whole, split);
    }

    #[test]
    fn test_header_xor_covers_nineteen_bytes() {
        let mut block = [0u8; 24];
        block[0] = 0x0F;
        block[18] = 0xF0;
        block[19] = 0xAA; // the check byte itself is not covered
        block[23] = 0x55;
        assert_eq!(header_xor(&block), 0xFF);
    }

    #[test]
    fn test_body_crc_clamps_to_buffer() {
        let block = vec![0x11u8; 64];
        assert_eq!(body_crc(&block, 4096), crc_ccitt_msb(0, &block[24..]));
        assert_eq!(body_crc(&block, 8), crc_ccitt_msb(0, &block[24..32]));
    }
}
