// OMFS on-disk constants
// All offsets are byte offsets from the start of the structure they belong to.

use static_assertions::const_assert;

pub const OMFS_MAGIC: u32 = 0xC299_3D87;
pub const OMFS_IMAGIC: u8 = 0xD2;

/// "No pointer" / end of chain / terminator marker.
pub const SENTINEL: u64 = !0;

// Inode type byte
pub const OMFS_DIR: u8 = b'D';
pub const OMFS_FILE: u8 = b'F';

// Header type byte
pub const OMFS_INODE_NORMAL: u8 = b'e';
pub const OMFS_INODE_CONTINUATION: u8 = b'c';
pub const OMFS_INODE_SYSTEM: u8 = b's';

pub const OMFS_SUPER_NAMELEN: usize = 64;
pub const OMFS_NAMELEN: usize = 256;

/// Start of the hash bucket array in a directory inode.
pub const OMFS_DIR_START: usize = 0x1b8;
/// Start of the extent table in a file inode.
pub const OMFS_EXTENT_START: usize = 0x1d0;
/// Start of the extent table in a continuation inode.
pub const OMFS_EXTENT_CONT: usize = 0x40;
/// Number of leading header bytes covered by the XOR check byte.
pub const OMFS_XOR_COUNT: usize = 19;

pub const OMFS_VERSION: u8 = 1;

/// Fill word written after the extent count.
pub const EXTENT_TABLE_FILL: u32 = 0x22;

// Superblock (block 0)
pub const SB_NAME: usize = 192;
pub const SB_ROOT_BLOCK: usize = 256;
pub const SB_NUM_BLOCKS: usize = 264;
pub const SB_MAGIC: usize = 272;
pub const SB_BLOCKSIZE: usize = 276;
pub const SB_MIRRORS: usize = 280;
pub const SB_SYS_BLOCKSIZE: usize = 284;
pub const SUPERBLOCK_SIZE: usize = 288;

// Header, at the start of every metadata block
pub const H_SELF: usize = 0;
pub const H_BODY_SIZE: usize = 8;
pub const H_CRC: usize = 12;
pub const H_VERSION: usize = 16;
pub const H_TYPE: usize = 17;
pub const H_MAGIC: usize = 18;
pub const H_CHECK_XOR: usize = 19;
pub const HEADER_SIZE: usize = 24;

// Root block
pub const R_NUM_BLOCKS: usize = 32;
pub const R_ROOT_DIR: usize = 40;
pub const R_BITMAP: usize = 48;
pub const R_BLOCKSIZE: usize = 56;
pub const R_CLUSTERSIZE: usize = 60;
pub const R_MIRRORS: usize = 64;
pub const R_NAME: usize = 72;
pub const ROOT_BLOCK_SIZE: usize = 336;

// Inode
pub const I_PARENT: usize = 24;
pub const I_SIBLING: usize = 32;
pub const I_CTIME: usize = 40;
pub const I_TYPE: usize = 83;
pub const I_FILL2: usize = 84;
pub const I_NAME: usize = 152;
pub const I_SIZE: usize = 408;
pub const INODE_SIZE: usize = 416;

// Extent table, relative to the table start
pub const E_NEXT: usize = 0;
pub const E_COUNT: usize = 8;
pub const E_FILL: usize = 12;
pub const E_ENTRIES: usize = 16;
pub const EXTENT_ENTRY_SIZE: usize = 16;

// Fixed block positions used by mkomfs
pub const MKFS_ROOT_BLOCK: u64 = 1;
pub const MKFS_ROOT_DIR: u64 = 3;
pub const MKFS_BITMAP: u64 = 5;

pub const MKFS_CLEAR_BYTE: u8 = b'z';

const_assert!(OMFS_XOR_COUNT == H_CHECK_XOR);
const_assert!(H_CRC + 2 <= OMFS_XOR_COUNT);
const_assert!(INODE_SIZE <= OMFS_DIR_START);
const_assert!(OMFS_DIR_START < OMFS_EXTENT_START);
const_assert!(I_NAME + OMFS_NAMELEN == I_SIZE);
const_assert!(R_NAME + OMFS_NAMELEN + 8 == ROOT_BLOCK_SIZE);
const_assert!(SB_NAME + OMFS_SUPER_NAMELEN == SB_ROOT_BLOCK);
