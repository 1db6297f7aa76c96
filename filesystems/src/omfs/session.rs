// An open OMFS volume
// Owns the device (through the codec), the parsed superblock and root block,
// and the free space map once it has been loaded.

use super::bitmap::FreeSpaceMap;
use super::check::compute_in_use;
use super::codec::Codec;
use super::constants::SENTINEL;
use super::structures::{RootBlock, Superblock};
use log::{debug, info};
use omfs_core::{BlockDevice, OmfsError};

pub struct Session<D: BlockDevice> {
    pub codec: Codec<D>,
    pub superblock: Superblock,
    pub root: RootBlock,
    free_space: Option<FreeSpaceMap>,
}

impl<D: BlockDevice> Session<D> {
    /// Read the superblock and root block and check that they describe a
    /// volume this device can hold.
    pub fn open(device: D) -> Result<Self, OmfsError> {
        let (codec, superblock) = Codec::open(device)?;
        let root = codec.read_root_block(&superblock)?;

        if root.root_dir == SENTINEL || root.root_dir >= superblock.num_blocks {
            return Err(OmfsError::Format(format!(
                "root directory pointer {:#x} is outside the volume",
                root.root_dir
            )));
        }
        if root.has_bitmap()
            && root.bitmap.saturating_add(superblock.bitmap_blocks()) > superblock.num_blocks
        {
            return Err(OmfsError::Format(format!(
                "bitmap at {:#x} runs past the end of the volume",
                root.bitmap
            )));
        }
        if superblock.endian.is_foreign() {
            info!("volume is stored word-swapped; keeping its byte order");
        }
        info!(
            "opened '{}': {} blocks, root directory at {}, bitmap at {}",
            superblock.label(),
            superblock.num_blocks,
            root.root_dir,
            if root.has_bitmap() {
                root.bitmap.to_string()
            } else {
                "none".to_string()
            }
        );

        Ok(Self {
            codec,
            superblock,
            root,
            free_space: None,
        })
    }

    /// Open without ever writing to the device.
    pub fn open_read_only(device: D) -> Result<Self, OmfsError> {
        let mut session = Self::open(device)?;
        session.codec.set_read_only(true);
        Ok(session)
    }

    pub fn mirrors(&self) -> u32 {
        self.superblock.mirrors
    }

    pub fn num_blocks(&self) -> u64 {
        self.superblock.num_blocks
    }

    pub fn bucket_count(&self) -> usize {
        self.superblock.bucket_count()
    }

    pub fn cluster_size(&self) -> u32 {
        self.root.cluster_size
    }

    /// Load the free space map: from disk when the volume has one, otherwise
    /// by walking the directory tree.
    pub fn load_bitmap(&mut self) -> Result<&mut FreeSpaceMap, OmfsError> {
        if self.free_space.is_none() {
            let map = if self.root.has_bitmap() {
                FreeSpaceMap::load(&self.codec, self.root.bitmap)?
            } else {
                debug!("no persisted bitmap; deriving one from the tree");
                FreeSpaceMap::derived(compute_in_use(self)?, self.superblock.block_size)
            };
            self.free_space = Some(map);
        }
        self.free_space
            .as_mut()
            .ok_or_else(|| OmfsError::Other("free space map unavailable".to_string()))
    }

    pub fn free_space(&self) -> Option<&FreeSpaceMap> {
        self.free_space.as_ref()
    }

    pub fn free_space_mut(&mut self) -> Option<&mut FreeSpaceMap> {
        self.free_space.as_mut()
    }

    pub fn set_free_space(&mut self, map: FreeSpaceMap) {
        self.free_space = Some(map);
    }

    /// Write back dirty bitmap blocks, if a map is loaded.
    pub fn flush_bitmap(&mut self) -> Result<(), OmfsError> {
        match self.free_space.as_mut() {
            Some(map) => map.flush(&self.codec),
            None => Ok(()),
        }
    }

    pub fn sync(&mut self) -> Result<(), OmfsError> {
        self.flush_bitmap()?;
        self.codec.sync()
    }

    pub fn into_device(self) -> Result<D, OmfsError> {
        self.codec.into_inner()
    }
}
