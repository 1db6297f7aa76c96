// OMFS on-disk structures
// Each structure is decoded once into typed fields. The raw buffer is kept so
// that fill and unknown bytes survive a decode/encode round trip.

use super::checksum::{body_crc, header_xor};
use super::constants::*;
use super::endian::{read_u16, read_u32, read_u64, write_u16, write_u32, write_u64, Endian};
use omfs_core::{FormatOptions, OmfsError};
use serde::Serialize;

fn decode_name(field: &[u8]) -> Vec<u8> {
    let len = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    field[..len].to_vec()
}

/// Write `name` followed by a NUL. Bytes after the NUL are left alone.
fn encode_name(field: &mut [u8], name: &[u8]) {
    let len = name.len().min(field.len() - 1);
    field[..len].copy_from_slice(&name[..len]);
    field[len] = 0;
}

fn too_short(block: u64, what: &str, len: usize, need: usize) -> OmfsError {
    OmfsError::Corrupt {
        block,
        detail: format!("{} needs {} bytes, buffer holds {}", what, need, len),
    }
}

/// Case folding used by the name hash: ASCII and Latin-1 capitals.
pub fn fold_name_byte(b: u8) -> u8 {
    match b {
        b'A'..=b'Z' => b + 32,
        0xC0..=0xDE if b != 0xD7 => b + 32,
        _ => b,
    }
}

/// Number of hash buckets in a directory for a given system block size.
pub fn bucket_count(sys_block_size: u32) -> usize {
    (sys_block_size as usize).saturating_sub(OMFS_DIR_START) / 8
}

/// Bucket index of `name` in a directory with `buckets` slots.
pub fn name_hash(name: &[u8], buckets: usize) -> usize {
    if buckets == 0 {
        return 0;
    }
    let hash = name
        .iter()
        .enumerate()
        .fold(0u32, |acc, (i, &b)| acc ^ ((fold_name_byte(b) as u32) << (i % 24)));
    hash as usize % buckets
}

/// Volume superblock, found at byte 0 of the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Superblock {
    #[serde(skip)]
    raw: Vec<u8>,
    pub endian: Endian,
    #[serde(serialize_with = "serialize_name")]
    pub name: Vec<u8>,
    pub root_block: u64,
    pub num_blocks: u64,
    pub magic: u32,
    pub block_size: u32,
    pub mirrors: u32,
    pub sys_block_size: u32,
}

fn serialize_name<S: serde::Serializer>(name: &[u8], s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&String::from_utf8_lossy(name))
}

impl Superblock {
    /// Superblock for a fresh volume.
    pub fn new(options: &FormatOptions, num_blocks: u64) -> Self {
        Self {
            raw: vec![0u8; SUPERBLOCK_SIZE],
            endian: Endian::Big,
            name: options.label.as_bytes().to_vec(),
            root_block: MKFS_ROOT_BLOCK,
            num_blocks,
            magic: OMFS_MAGIC,
            block_size: options.block_size,
            mirrors: options.mirrors,
            sys_block_size: options.sys_block_size(),
        }
    }

    /// Decode the on-disk superblock, detecting the byte order from the
    /// magic number.
    pub fn decode(buf: &[u8]) -> Result<Self, OmfsError> {
        if buf.len() < SUPERBLOCK_SIZE {
            return Err(too_short(0, "superblock", buf.len(), SUPERBLOCK_SIZE));
        }

        let magic = &buf[SB_MAGIC..SB_MAGIC + 4];
        let endian = Endian::detect(magic).ok_or(OmfsError::BadMagic(read_u32(buf, SB_MAGIC)))?;
        let mut raw = buf[..SUPERBLOCK_SIZE].to_vec();
        endian.convert(&mut raw);

        Ok(Self {
            endian,
            name: decode_name(&raw[SB_NAME..SB_NAME + OMFS_SUPER_NAMELEN]),
            root_block: read_u64(&raw, SB_ROOT_BLOCK),
            num_blocks: read_u64(&raw, SB_NUM_BLOCKS),
            magic: read_u32(&raw, SB_MAGIC),
            block_size: read_u32(&raw, SB_BLOCKSIZE),
            mirrors: read_u32(&raw, SB_MIRRORS),
            sys_block_size: read_u32(&raw, SB_SYS_BLOCKSIZE),
            raw,
        })
    }

    /// The superblock as it goes on disk, in the volume's byte order.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = self.raw.clone();
        encode_name(&mut buf[SB_NAME..SB_NAME + OMFS_SUPER_NAMELEN], &self.name);
        write_u64(&mut buf, SB_ROOT_BLOCK, self.root_block);
        write_u64(&mut buf, SB_NUM_BLOCKS, self.num_blocks);
        write_u32(&mut buf, SB_MAGIC, self.magic);
        write_u32(&mut buf, SB_BLOCKSIZE, self.block_size);
        write_u32(&mut buf, SB_MIRRORS, self.mirrors);
        write_u32(&mut buf, SB_SYS_BLOCKSIZE, self.sys_block_size);
        self.endian.convert(&mut buf);
        buf
    }

    /// Reject geometry the rest of the engine cannot work with.
    pub fn validate(&self) -> Result<(), OmfsError> {
        let bad = |msg: String| Err(OmfsError::Format(msg));

        if !self.block_size.is_power_of_two() || self.block_size < 512 {
            return bad(format!("block size {} is not a usable power of two", self.block_size));
        }
        if self.sys_block_size > self.block_size
            || (self.sys_block_size as usize) < OMFS_EXTENT_START + 2 * EXTENT_ENTRY_SIZE
        {
            return bad(format!(
                "system block size {} does not fit block size {}",
                self.sys_block_size, self.block_size
            ));
        }
        if self.mirrors == 0 || self.mirrors > omfs_core::MAX_MIRRORS {
            return bad(format!("mirror count {} out of range", self.mirrors));
        }
        if self.num_blocks == 0 || self.root_block >= self.num_blocks {
            return bad(format!(
                "root block {} outside a volume of {} blocks",
                self.root_block, self.num_blocks
            ));
        }
        Ok(())
    }

    pub fn label(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }

    pub fn bucket_count(&self) -> usize {
        bucket_count(self.sys_block_size)
    }

    /// Bytes of bitmap needed to cover every block.
    pub fn bitmap_bytes(&self) -> u64 {
        (self.num_blocks + 7) / 8
    }

    /// Blocks occupied by the persisted bitmap.
    pub fn bitmap_blocks(&self) -> u64 {
        let bs = self.block_size as u64;
        (self.bitmap_bytes() + bs - 1) / bs
    }
}

/// The header at the start of every metadata block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Header {
    pub self_block: u64,
    pub body_size: u32,
    pub crc: u16,
    pub version: u8,
    pub kind: u8,
    pub magic: u8,
    pub check_xor: u8,
}

impl Header {
    pub fn new(self_block: u64, body_size: u32, kind: u8) -> Self {
        Self {
            self_block,
            body_size,
            crc: 0,
            version: OMFS_VERSION,
            kind,
            magic: OMFS_IMAGIC,
            check_xor: 0,
        }
    }

    pub fn decode(buf: &[u8]) -> Self {
        Self {
            self_block: read_u64(buf, H_SELF),
            body_size: read_u32(buf, H_BODY_SIZE),
            crc: read_u16(buf, H_CRC),
            version: buf[H_VERSION],
            kind: buf[H_TYPE],
            magic: buf[H_MAGIC],
            check_xor: buf[H_CHECK_XOR],
        }
    }

    pub fn encode_into(&self, buf: &mut [u8]) {
        write_u64(buf, H_SELF, self.self_block);
        write_u32(buf, H_BODY_SIZE, self.body_size);
        write_u16(buf, H_CRC, self.crc);
        buf[H_VERSION] = self.version;
        buf[H_TYPE] = self.kind;
        buf[H_MAGIC] = self.magic;
        buf[H_CHECK_XOR] = self.check_xor;
    }

    /// Header plus declared body, in bytes.
    pub fn block_len(&self) -> usize {
        HEADER_SIZE + self.body_size as usize
    }
}

/// Store the body CRC, then the header XOR, into an encoded block.
pub fn seal(buf: &mut [u8]) {
    let body_size = read_u32(buf, H_BODY_SIZE) as usize;
    let crc = body_crc(buf, body_size);
    write_u16(buf, H_CRC, crc);
    buf[H_CHECK_XOR] = header_xor(buf);
}

pub fn xor_matches(buf: &[u8]) -> bool {
    buf[H_CHECK_XOR] == header_xor(buf)
}

pub fn crc_matches(buf: &[u8]) -> bool {
    let body_size = read_u32(buf, H_BODY_SIZE) as usize;
    read_u16(buf, H_CRC) == body_crc(buf, body_size)
}

/// The root block, pointed to by the superblock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RootBlock {
    #[serde(skip)]
    raw: Vec<u8>,
    pub header: Header,
    pub num_blocks: u64,
    pub root_dir: u64,
    pub bitmap: u64,
    pub block_size: u32,
    pub cluster_size: u32,
    pub mirrors: u64,
    #[serde(serialize_with = "serialize_name")]
    pub name: Vec<u8>,
}

impl RootBlock {
    pub fn new(options: &FormatOptions, num_blocks: u64) -> Self {
        Self {
            raw: vec![0u8; ROOT_BLOCK_SIZE],
            header: Header::new(
                MKFS_ROOT_BLOCK,
                (ROOT_BLOCK_SIZE - HEADER_SIZE) as u32,
                OMFS_INODE_SYSTEM,
            ),
            num_blocks,
            root_dir: MKFS_ROOT_DIR,
            bitmap: MKFS_BITMAP,
            block_size: options.block_size,
            cluster_size: options.cluster_size,
            mirrors: options.mirrors as u64,
            name: options.label.as_bytes().to_vec(),
        }
    }

    pub fn decode(buf: &[u8], block: u64) -> Result<Self, OmfsError> {
        if buf.len() < ROOT_BLOCK_SIZE {
            return Err(too_short(block, "root block", buf.len(), ROOT_BLOCK_SIZE));
        }
        let header = Header::decode(buf);
        let len = header.block_len().clamp(ROOT_BLOCK_SIZE, buf.len());

        Ok(Self {
            raw: buf[..len].to_vec(),
            header,
            num_blocks: read_u64(buf, R_NUM_BLOCKS),
            root_dir: read_u64(buf, R_ROOT_DIR),
            bitmap: read_u64(buf, R_BITMAP),
            block_size: read_u32(buf, R_BLOCKSIZE),
            cluster_size: read_u32(buf, R_CLUSTERSIZE),
            mirrors: read_u64(buf, R_MIRRORS),
            name: decode_name(&buf[R_NAME..R_NAME + OMFS_NAMELEN]),
        })
    }

    /// Field serialization only; checksums are whatever `header` holds.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = self.raw.clone();
        self.header.encode_into(&mut buf);
        write_u64(&mut buf, R_NUM_BLOCKS, self.num_blocks);
        write_u64(&mut buf, R_ROOT_DIR, self.root_dir);
        write_u64(&mut buf, R_BITMAP, self.bitmap);
        write_u32(&mut buf, R_BLOCKSIZE, self.block_size);
        write_u32(&mut buf, R_CLUSTERSIZE, self.cluster_size);
        write_u64(&mut buf, R_MIRRORS, self.mirrors);
        encode_name(&mut buf[R_NAME..R_NAME + OMFS_NAMELEN], &self.name);
        buf
    }

    /// Bytes as read from (or last written to) disk.
    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    pub fn has_bitmap(&self) -> bool {
        self.bitmap != SENTINEL
    }

    pub fn label(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }
}

/// One `(start block, block count)` allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExtentEntry {
    pub cluster: u64,
    pub blocks: u64,
}

impl ExtentEntry {
    pub fn terminator_for(allocations: &[ExtentEntry]) -> Self {
        let total = allocations
            .iter()
            .fold(0u64, |acc, e| acc.wrapping_add(e.blocks));
        Self {
            cluster: SENTINEL,
            blocks: !total,
        }
    }
}

/// Extent table of a file inode or a continuation block.
///
/// `count` is the count field as stored. `entries` holds the entries that
/// actually fit in the block, terminator included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtentTable {
    pub next: u64,
    pub count: u32,
    pub fill: u32,
    pub entries: Vec<ExtentEntry>,
}

impl ExtentTable {
    pub fn empty() -> Self {
        Self {
            next: SENTINEL,
            count: 1,
            fill: EXTENT_TABLE_FILL,
            entries: vec![ExtentEntry::terminator_for(&[])],
        }
    }

    /// Entries that fit in a table starting at `offset` of a `len` byte block.
    pub fn capacity(len: usize, offset: usize) -> usize {
        len.saturating_sub(offset + E_ENTRIES) / EXTENT_ENTRY_SIZE
    }

    pub fn decode(buf: &[u8], offset: usize) -> Self {
        let count = read_u32(buf, offset + E_COUNT);
        let fits = (count as usize).min(Self::capacity(buf.len(), offset));
        let entries = (0..fits)
            .map(|i| {
                let at = offset + E_ENTRIES + i * EXTENT_ENTRY_SIZE;
                ExtentEntry {
                    cluster: read_u64(buf, at),
                    blocks: read_u64(buf, at + 8),
                }
            })
            .collect();

        Self {
            next: read_u64(buf, offset + E_NEXT),
            count,
            fill: read_u32(buf, offset + E_FILL),
            entries,
        }
    }

    pub fn encode_into(&self, buf: &mut [u8], offset: usize) {
        write_u64(buf, offset + E_NEXT, self.next);
        write_u32(buf, offset + E_COUNT, self.count);
        write_u32(buf, offset + E_FILL, self.fill);
        for (i, entry) in self.entries.iter().enumerate() {
            let at = offset + E_ENTRIES + i * EXTENT_ENTRY_SIZE;
            write_u64(buf, at, entry.cluster);
            write_u64(buf, at + 8, entry.blocks);
        }
    }

    /// True when the stored count claims more entries than the block holds.
    pub fn is_truncated(&self) -> bool {
        self.count as usize > self.entries.len()
    }

    /// Every entry except the trailing terminator.
    pub fn allocations(&self) -> &[ExtentEntry] {
        match self.entries.split_last() {
            Some((_, rest)) => rest,
            None => &[],
        }
    }

    pub fn terminator(&self) -> Option<&ExtentEntry> {
        self.entries.last()
    }

    pub fn terminator_ok(&self) -> bool {
        !self.is_truncated()
            && self.terminator() == Some(&ExtentEntry::terminator_for(self.allocations()))
    }

    /// Blocks covered by the allocations of this table.
    pub fn total_blocks(&self) -> u64 {
        self.allocations()
            .iter()
            .fold(0u64, |acc, e| acc.saturating_add(e.blocks))
    }

    /// Add an allocation ahead of the terminator and refresh the terminator.
    pub fn push(&mut self, entry: ExtentEntry) {
        let mut allocations = self.allocations().to_vec();
        allocations.push(entry);
        let terminator = ExtentEntry::terminator_for(&allocations);
        allocations.push(terminator);
        self.count = allocations.len() as u32;
        self.entries = allocations;
    }
}

/// Type-specific part of an inode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum InodeBody {
    Directory { buckets: Vec<u64> },
    File { extents: ExtentTable },
    Continuation { extents: ExtentTable },
    System,
}

/// A metadata block: directory, file, continuation or system inode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Inode {
    #[serde(skip)]
    raw: Vec<u8>,
    pub header: Header,
    pub parent: u64,
    pub sibling: u64,
    pub ctime: u64,
    pub kind: u8,
    pub fill2: u32,
    #[serde(serialize_with = "serialize_name")]
    pub name: Vec<u8>,
    pub size: u64,
    pub body: InodeBody,
}

impl Inode {
    fn blank(block: u64, sys_block_size: u32, header_kind: u8) -> Self {
        Self {
            raw: vec![0u8; sys_block_size as usize],
            header: Header::new(block, sys_block_size - HEADER_SIZE as u32, header_kind),
            parent: SENTINEL,
            sibling: SENTINEL,
            ctime: 0,
            kind: 0,
            fill2: 1,
            name: Vec::new(),
            size: 0,
            body: InodeBody::System,
        }
    }

    /// Empty directory with every bucket unused.
    pub fn new_directory(block: u64, name: &[u8], sys_block_size: u32) -> Self {
        let mut inode = Self::blank(block, sys_block_size, OMFS_INODE_NORMAL);
        inode.kind = OMFS_DIR;
        inode.name = name.to_vec();
        inode.size = sys_block_size as u64;
        inode.body = InodeBody::Directory {
            buckets: vec![SENTINEL; bucket_count(sys_block_size)],
        };
        inode
    }

    /// Empty regular file.
    pub fn new_file(block: u64, name: &[u8], sys_block_size: u32) -> Self {
        let mut inode = Self::blank(block, sys_block_size, OMFS_INODE_NORMAL);
        inode.kind = OMFS_FILE;
        inode.name = name.to_vec();
        inode.body = InodeBody::File {
            extents: ExtentTable::empty(),
        };
        inode
    }

    pub fn new_continuation(block: u64, sys_block_size: u32) -> Self {
        let mut inode = Self::blank(block, sys_block_size, OMFS_INODE_CONTINUATION);
        inode.fill2 = 0;
        inode.body = InodeBody::Continuation {
            extents: ExtentTable::empty(),
        };
        inode
    }

    /// Decode a metadata block. The declared body size is clamped to the
    /// buffer; nothing here rejects a block for its contents.
    pub fn decode(buf: &[u8], block: u64) -> Result<Self, OmfsError> {
        if buf.len() < HEADER_SIZE {
            return Err(too_short(block, "inode header", buf.len(), HEADER_SIZE));
        }
        let header = Header::decode(buf);
        let len = header.block_len().min(buf.len());

        if header.kind == OMFS_INODE_CONTINUATION {
            let need = OMFS_EXTENT_CONT + E_ENTRIES;
            if buf.len() < need {
                return Err(too_short(block, "continuation block", buf.len(), need));
            }
            return Ok(Self {
                raw: buf.to_vec(),
                header,
                parent: SENTINEL,
                sibling: SENTINEL,
                ctime: 0,
                kind: 0,
                fill2: 0,
                name: Vec::new(),
                size: 0,
                body: InodeBody::Continuation {
                    extents: ExtentTable::decode(&buf[..len.max(need)], OMFS_EXTENT_CONT),
                },
            });
        }

        if buf.len() < INODE_SIZE {
            return Err(too_short(block, "inode", buf.len(), INODE_SIZE));
        }
        let kind = buf[I_TYPE];
        let body = match (header.kind, kind) {
            (OMFS_INODE_NORMAL, OMFS_DIR) => {
                let slots = len.saturating_sub(OMFS_DIR_START) / 8;
                InodeBody::Directory {
                    buckets: (0..slots)
                        .map(|i| read_u64(buf, OMFS_DIR_START + i * 8))
                        .collect(),
                }
            }
            (OMFS_INODE_NORMAL, OMFS_FILE) if len >= OMFS_EXTENT_START + E_ENTRIES => {
                InodeBody::File {
                    extents: ExtentTable::decode(&buf[..len], OMFS_EXTENT_START),
                }
            }
            _ => InodeBody::System,
        };

        Ok(Self {
            raw: buf.to_vec(),
            header,
            parent: read_u64(buf, I_PARENT),
            sibling: read_u64(buf, I_SIBLING),
            ctime: read_u64(buf, I_CTIME),
            kind,
            fill2: read_u32(buf, I_FILL2),
            name: decode_name(&buf[I_NAME..I_NAME + OMFS_NAMELEN]),
            size: read_u64(buf, I_SIZE),
            body,
        })
    }

    /// Field serialization of the whole buffer; checksums are whatever
    /// `header` holds.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = self.raw.clone();
        self.header.encode_into(&mut buf);

        if let InodeBody::Continuation { extents } = &self.body {
            extents.encode_into(&mut buf, OMFS_EXTENT_CONT);
            return buf;
        }

        write_u64(&mut buf, I_PARENT, self.parent);
        write_u64(&mut buf, I_SIBLING, self.sibling);
        write_u64(&mut buf, I_CTIME, self.ctime);
        buf[I_TYPE] = self.kind;
        write_u32(&mut buf, I_FILL2, self.fill2);
        encode_name(&mut buf[I_NAME..I_NAME + OMFS_NAMELEN], &self.name);
        write_u64(&mut buf, I_SIZE, self.size);

        match &self.body {
            InodeBody::Directory { buckets } => {
                for (i, slot) in buckets.iter().enumerate() {
                    write_u64(&mut buf, OMFS_DIR_START + i * 8, *slot);
                }
            }
            InodeBody::File { extents } => {
                extents.encode_into(&mut buf, OMFS_EXTENT_START);
            }
            InodeBody::Continuation { .. } | InodeBody::System => {}
        }
        buf
    }

    pub fn block(&self) -> u64 {
        self.header.self_block
    }

    /// Bytes as read from disk.
    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.body, InodeBody::Directory { .. })
    }

    pub fn is_file(&self) -> bool {
        matches!(self.body, InodeBody::File { .. })
    }

    pub fn name_lossy(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }

    pub fn buckets(&self) -> Option<&[u64]> {
        match &self.body {
            InodeBody::Directory { buckets } => Some(buckets),
            _ => None,
        }
    }

    pub fn buckets_mut(&mut self) -> Option<&mut Vec<u64>> {
        match &mut self.body {
            InodeBody::Directory { buckets } => Some(buckets),
            _ => None,
        }
    }

    pub fn extents(&self) -> Option<&ExtentTable> {
        match &self.body {
            InodeBody::File { extents } | InodeBody::Continuation { extents } => Some(extents),
            _ => None,
        }
    }

    pub fn extents_mut(&mut self) -> Option<&mut ExtentTable> {
        match &mut self.body {
            InodeBody::File { extents } | InodeBody::Continuation { extents } => Some(extents),
            _ => None,
        }
    }

    /// Extent table capacity of this block.
    pub fn extent_capacity(&self) -> usize {
        let len = self.header.block_len().min(self.raw.len());
        match self.body {
            InodeBody::File { .. } => ExtentTable::capacity(len, OMFS_EXTENT_START),
            InodeBody::Continuation { .. } => ExtentTable::capacity(len, OMFS_EXTENT_CONT),
            _ => 0,
        }
    }

    /// Bytes written to disk for this inode.
    pub fn disk_len(&self) -> usize {
        self.header.block_len().min(self.raw.len())
    }
}
