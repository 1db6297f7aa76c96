// OMFS volume creation
// Fixed layout: superblock in block 0, root block at 1, root directory at 3,
// free space bitmap from block 5. Root block and root directory each take
// `mirrors` consecutive blocks.

use super::bitmap::FreeSpaceMap;
use super::codec::Codec;
use super::constants::{MKFS_BITMAP, MKFS_CLEAR_BYTE, MKFS_ROOT_BLOCK, MKFS_ROOT_DIR, SENTINEL};
use super::structures::{Inode, RootBlock, Superblock};
use log::info;
use omfs_core::{BlockDevice, FormatOptions, OmfsError};
use serde::Serialize;

/// Blocks between the fixed structures.
const LAYOUT_GAP: u64 = MKFS_ROOT_DIR - MKFS_ROOT_BLOCK;

/// Geometry of a freshly created volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FormatSummary {
    pub label: String,
    pub num_blocks: u64,
    pub block_size: u32,
    pub sys_block_size: u32,
    pub cluster_size: u32,
    pub mirrors: u32,
    pub root_dir: u64,
    pub bitmap: u64,
    /// First block not taken by the fixed structures.
    pub first_free: u64,
    pub free_blocks: u64,
}

/// Lay out an empty volume on `device` and hand the device back.
pub fn create_filesystem<D: BlockDevice>(
    device: D,
    options: &FormatOptions,
) -> Result<D, OmfsError> {
    format_device(device, options).map(|(device, _)| device)
}

/// As `create_filesystem`, also describing what was written.
pub fn format_device<D: BlockDevice>(
    device: D,
    options: &FormatOptions,
) -> Result<(D, FormatSummary), OmfsError> {
    options.validate()?;
    if options.mirrors as u64 > LAYOUT_GAP {
        return Err(OmfsError::InvalidInput(format!(
            "the fixed layout leaves room for at most {} mirrors, not {}",
            LAYOUT_GAP, options.mirrors
        )));
    }

    let num_blocks = device.size() / options.block_size as u64;
    let superblock = Superblock::new(options, num_blocks);
    let first_free = MKFS_BITMAP + superblock.bitmap_blocks();
    if num_blocks <= first_free {
        return Err(OmfsError::InvalidInput(format!(
            "device holds {} blocks of {} bytes; at least {} are needed",
            num_blocks,
            options.block_size,
            first_free + 1
        )));
    }

    let codec = Codec::with_geometry(device, &superblock);
    if options.clear_device {
        codec.fill_device(MKFS_CLEAR_BYTE)?;
    }

    codec.write_superblock(&superblock)?;
    let mut root = RootBlock::new(options, num_blocks);
    codec.write_root_block(&mut root)?;

    let mut root_dir = Inode::new_directory(MKFS_ROOT_DIR, b"", superblock.sys_block_size);
    root_dir.parent = SENTINEL;
    codec.write_inode(&mut root_dir)?;

    let mut map = FreeSpaceMap::new(num_blocks, options.block_size, Some(MKFS_BITMAP));
    for block in 0..first_free {
        map.allocate_one(block);
    }
    // blocks that will never be touched again still have to be on disk
    map.replace_with(&map.bitmap().clone());
    map.flush(&codec)?;
    codec.sync()?;

    let summary = FormatSummary {
        label: options.label.clone(),
        num_blocks,
        block_size: options.block_size,
        sys_block_size: superblock.sys_block_size,
        cluster_size: options.cluster_size,
        mirrors: options.mirrors,
        root_dir: MKFS_ROOT_DIR,
        bitmap: MKFS_BITMAP,
        first_free,
        free_blocks: map.count_free(),
    };
    info!(
        "created '{}': {} blocks of {} bytes, {} free",
        summary.label, num_blocks, options.block_size, summary.free_blocks
    );

    Ok((codec.into_inner()?, summary))
}
