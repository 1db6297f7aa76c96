// Byte order handling for OMFS volumes
// Volumes are big-endian on disk. A byte-swapped image stores every 32-bit
// word reversed; whole blocks are converted on their way in and out, so the
// structures and checksums only ever see the big-endian image.

use super::constants::OMFS_MAGIC;
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Endian {
    /// The native OMFS order.
    Big,
    /// Every 32-bit word byte-reversed.
    Little,
}

impl Endian {
    pub fn is_foreign(self) -> bool {
        self == Endian::Little
    }

    /// Order of a volume, judged by the raw superblock magic field.
    /// `None` when neither reading gives the OMFS magic.
    pub fn detect(raw_magic: &[u8]) -> Option<Self> {
        if BigEndian::read_u32(raw_magic) == OMFS_MAGIC {
            Some(Endian::Big)
        } else if LittleEndian::read_u32(raw_magic) == OMFS_MAGIC {
            Some(Endian::Little)
        } else {
            None
        }
    }

    /// Convert a buffer between its on-disk form and the big-endian image.
    /// The conversion is its own inverse. Trailing bytes short of a whole
    /// word are left as they are.
    pub fn convert(self, buf: &mut [u8]) {
        if self.is_foreign() {
            for word in buf.chunks_exact_mut(4) {
                word.reverse();
            }
        }
    }
}

pub fn read_u16(buf: &[u8], offset: usize) -> u16 {
    BigEndian::read_u16(&buf[offset..offset + 2])
}

pub fn read_u32(buf: &[u8], offset: usize) -> u32 {
    BigEndian::read_u32(&buf[offset..offset + 4])
}

pub fn read_u64(buf: &[u8], offset: usize) -> u64 {
    BigEndian::read_u64(&buf[offset..offset + 8])
}

pub fn write_u16(buf: &mut [u8], offset: usize, value: u16) {
    BigEndian::write_u16(&mut buf[offset..offset + 2], value)
}

pub fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    BigEndian::write_u32(&mut buf[offset..offset + 4], value)
}

pub fn write_u64(buf: &mut [u8], offset: usize, value: u64) {
    BigEndian::write_u64(&mut buf[offset..offset + 8], value)
}
