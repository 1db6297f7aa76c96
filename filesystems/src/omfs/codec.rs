// Block-level access to an OMFS volume
// Every structure read or written by the tools passes through here; the
// device handle is only touched with its lock held. Metadata blocks leave
// this module in the big-endian image whatever the volume's byte order.

use super::constants::{SENTINEL, SUPERBLOCK_SIZE};
use super::endian::Endian;
use super::structures::{seal, Header, Inode, InodeBody, RootBlock, Superblock};
use log::{debug, trace, warn};
use omfs_core::{BlockDevice, OmfsError};
use std::borrow::Cow;
use std::sync::{Mutex, MutexGuard};

/// Geometry-aware reader/writer over a block device.
pub struct Codec<D: BlockDevice> {
    device: Mutex<D>,
    endian: Endian,
    block_size: u32,
    sys_block_size: u32,
    mirrors: u32,
    num_blocks: u64,
    read_only: bool,
}

impl<D: BlockDevice> Codec<D> {
    /// Read and validate the superblock, then set up access with its geometry.
    pub fn open(mut device: D) -> Result<(Self, Superblock), OmfsError> {
        let buf = device.read_at(0, SUPERBLOCK_SIZE)?;
        let sb = Superblock::decode(&buf)?;
        sb.validate()?;

        debug!(
            "superblock: {} blocks of {} bytes, sys block {}, {} mirrors, {:?} endian",
            sb.num_blocks, sb.block_size, sb.sys_block_size, sb.mirrors, sb.endian
        );
        let needed = sb.num_blocks.saturating_mul(sb.block_size as u64);
        if needed > device.size() {
            warn!(
                "volume claims {} bytes but the device holds {}",
                needed,
                device.size()
            );
        }

        Ok((Self::with_geometry(device, &sb), sb))
    }

    /// Use the geometry of `sb` without reading anything from the device.
    pub fn with_geometry(device: D, sb: &Superblock) -> Self {
        Self {
            device: Mutex::new(device),
            endian: sb.endian,
            block_size: sb.block_size,
            sys_block_size: sb.sys_block_size,
            mirrors: sb.mirrors,
            num_blocks: sb.num_blocks,
            read_only: false,
        }
    }

    /// Refuse every later write with `ReadOnly`.
    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn sys_block_size(&self) -> u32 {
        self.sys_block_size
    }

    pub fn mirrors(&self) -> u32 {
        self.mirrors
    }

    pub fn num_blocks(&self) -> u64 {
        self.num_blocks
    }

    pub fn device_size(&self) -> Result<u64, OmfsError> {
        Ok(self.lock()?.size())
    }

    pub fn into_inner(self) -> Result<D, OmfsError> {
        self.device.into_inner().map_err(|_| OmfsError::LockPoisoned)
    }

    fn lock(&self) -> Result<MutexGuard<'_, D>, OmfsError> {
        self.device.lock().map_err(|_| OmfsError::LockPoisoned)
    }

    fn check_range(&self, block: u64, count: u64) -> Result<(), OmfsError> {
        if block == SENTINEL || block.saturating_add(count) > self.num_blocks {
            return Err(OmfsError::OutOfRange {
                block,
                total: self.num_blocks,
            });
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<(), OmfsError> {
        if self.read_only {
            return Err(OmfsError::ReadOnly);
        }
        Ok(())
    }

    fn offset(&self, block: u64) -> u64 {
        block * self.block_size as u64
    }

    fn read_converted(&self, block: u64, bytes: usize) -> Result<Vec<u8>, OmfsError> {
        let mut buf = self.lock()?.read_at(self.offset(block), bytes)?;
        self.endian.convert(&mut buf);
        Ok(buf)
    }

    /// Read one full block.
    pub fn read_block(&self, block: u64) -> Result<Vec<u8>, OmfsError> {
        self.check_range(block, 1)?;
        trace!("read block {}", block);
        self.read_converted(block, self.block_size as usize)
    }

    /// Read the system-block-sized prefix of a block, where metadata lives.
    pub fn read_sys_block(&self, block: u64) -> Result<Vec<u8>, OmfsError> {
        self.check_range(block, 1)?;
        trace!("read sys block {}", block);
        self.read_converted(block, self.sys_block_size as usize)
    }

    /// Read `bytes` starting at the beginning of `block`.
    pub fn read_region(&self, block: u64, bytes: usize) -> Result<Vec<u8>, OmfsError> {
        let span = (bytes as u64 + self.block_size as u64 - 1) / self.block_size as u64;
        self.check_range(block, span.max(1))?;
        trace!("read {} bytes from block {}", bytes, block);
        self.read_converted(block, bytes)
    }

    /// Write `data` at the start of `mirrors` consecutive blocks.
    pub fn write_block(&self, block: u64, data: &[u8], mirrors: u32) -> Result<(), OmfsError> {
        let wire = if self.endian.is_foreign() {
            let mut swapped = data.to_vec();
            self.endian.convert(&mut swapped);
            Cow::Owned(swapped)
        } else {
            Cow::Borrowed(data)
        };
        self.write_raw(block, &wire, mirrors)
    }

    fn write_raw(&self, block: u64, data: &[u8], mirrors: u32) -> Result<(), OmfsError> {
        self.check_writable()?;
        self.check_range(block, mirrors.max(1) as u64)?;

        let mut device = self.lock()?;
        for i in 0..mirrors.max(1) as u64 {
            trace!("write {} bytes to block {}", data.len(), block + i);
            device.write_at(self.offset(block + i), data)?;
        }
        Ok(())
    }

    /// Read a file data block exactly as stored.
    pub fn read_data(&self, block: u64) -> Result<Vec<u8>, OmfsError> {
        self.check_range(block, 1)?;
        trace!("read data block {}", block);
        self.lock()?.read_at(self.offset(block), self.block_size as usize)
    }

    /// Store file data at the start of `block`, byte for byte.
    pub fn write_data(&self, block: u64, data: &[u8]) -> Result<(), OmfsError> {
        self.write_raw(block, data, 1)
    }

    /// Overwrite `count` blocks with zeroes.
    pub fn clear_blocks(&self, start: u64, count: u64) -> Result<(), OmfsError> {
        self.check_writable()?;
        self.check_range(start, count)?;

        let zeroes = vec![0u8; self.block_size as usize];
        let mut device = self.lock()?;
        for block in start..start + count {
            device.write_at(self.offset(block), &zeroes)?;
        }
        Ok(())
    }

    /// Fill the whole device with `byte`, one sector-sized chunk at a time.
    pub fn fill_device(&self, byte: u8) -> Result<(), OmfsError> {
        self.check_writable()?;
        let mut device = self.lock()?;
        let size = device.size();
        let chunk = vec![byte; omfs_core::SECTOR_SIZE as usize * 64];

        debug!("filling {} bytes with {:#04x}", size, byte);
        let mut offset = 0u64;
        while offset < size {
            let len = (size - offset).min(chunk.len() as u64) as usize;
            device.write_at(offset, &chunk[..len])?;
            offset += len as u64;
        }
        Ok(())
    }

    pub fn read_superblock(&self) -> Result<Superblock, OmfsError> {
        let buf = self.lock()?.read_at(0, SUPERBLOCK_SIZE)?;
        Superblock::decode(&buf)
    }

    pub fn write_superblock(&self, sb: &Superblock) -> Result<(), OmfsError> {
        self.check_writable()?;
        trace!("write superblock");
        self.lock()?.write_at(0, &sb.encode())
    }

    pub fn read_root_block(&self, sb: &Superblock) -> Result<RootBlock, OmfsError> {
        let buf = self.read_sys_block(sb.root_block)?;
        RootBlock::decode(&buf, sb.root_block)
    }

    /// Write the root block to every mirror with fresh checksums.
    pub fn write_root_block(&self, root: &mut RootBlock) -> Result<(), OmfsError> {
        let mut buf = root.encode();
        seal(&mut buf);
        self.write_block(root.header.self_block, &buf, self.mirrors)?;
        root.header = Header::decode(&buf);
        Ok(())
    }

    pub fn read_inode(&self, block: u64) -> Result<Inode, OmfsError> {
        let buf = self.read_sys_block(block)?;
        Inode::decode(&buf, block)
    }

    /// Stamp the creation time, then write the inode to every mirror.
    pub fn write_inode(&self, inode: &mut Inode) -> Result<(), OmfsError> {
        if !matches!(inode.body, InodeBody::Continuation { .. }) {
            inode.ctime = chrono::Utc::now().timestamp_millis() as u64;
        }
        self.rewrite_inode(inode)
    }

    /// Write the inode as it is, recomputing only its checksums.
    pub fn rewrite_inode(&self, inode: &mut Inode) -> Result<(), OmfsError> {
        let mut buf = inode.encode();
        buf.truncate(inode.disk_len());
        seal(&mut buf);
        self.write_block(inode.block(), &buf, self.mirrors)?;
        inode.header = Header::decode(&buf);
        Ok(())
    }

    /// Flush the device's own buffers.
    pub fn sync(&self) -> Result<(), OmfsError> {
        if self.read_only {
            return Ok(());
        }
        self.lock()?.flush()
    }
}
