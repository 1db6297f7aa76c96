use crate::OmfsError;
use serde::{Deserialize, Serialize};

/// Largest mirror count the allocator can keep on an aligned run.
pub const MAX_MIRRORS: u32 = 8;

/// Smallest block size that leaves room for a file inode in a quarter block.
pub const MIN_BLOCK_SIZE: u32 = 2048;

pub const SECTOR_SIZE: u32 = 512;

/// Parameters for creating a new volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatOptions {
    /// Size of a data block in bytes. Metadata blocks are a quarter of this.
    pub block_size: u32,
    /// Blocks per cluster; data extents are allocated in cluster runs.
    pub cluster_size: u32,
    /// Number of consecutive copies written for each metadata block.
    pub mirrors: u32,
    pub label: String,
    /// Overwrite the whole device before laying out the volume.
    pub clear_device: bool,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            block_size: 8192,
            cluster_size: 8,
            mirrors: 2,
            label: "omfs".to_string(),
            clear_device: false,
        }
    }
}

impl FormatOptions {
    pub fn validate(&self) -> Result<(), OmfsError> {
        if !self.block_size.is_power_of_two() || self.block_size < MIN_BLOCK_SIZE {
            return Err(OmfsError::InvalidInput(format!(
                "block size {} must be a power of two of at least {}",
                self.block_size, MIN_BLOCK_SIZE
            )));
        }
        if !self.cluster_size.is_power_of_two() || self.cluster_size > 8 {
            return Err(OmfsError::InvalidInput(format!(
                "cluster size {} must be 1, 2, 4 or 8 blocks",
                self.cluster_size
            )));
        }
        if self.mirrors == 0 || self.mirrors > MAX_MIRRORS || !self.mirrors.is_power_of_two() {
            return Err(OmfsError::InvalidInput(format!(
                "mirror count {} must be a power of two between 1 and {}",
                self.mirrors, MAX_MIRRORS
            )));
        }
        if self.label.len() >= 64 {
            return Err(OmfsError::InvalidInput(format!(
                "label '{}' is longer than 63 bytes",
                self.label
            )));
        }
        Ok(())
    }

    /// Size of the metadata ("system") blocks for this block size.
    pub fn sys_block_size(&self) -> u32 {
        self.block_size / 4
    }
}

/// How a check run treats the problems it finds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckOptions {
    /// Suppress per-problem narration and decline every repair.
    pub quiet: bool,
    /// Accept every repair without asking.
    pub assume_yes: bool,
    /// Never write to the device, whatever the decision port answers.
    pub read_only: bool,
}

impl CheckOptions {
    pub fn validate(&self) -> Result<(), OmfsError> {
        if self.assume_yes && (self.quiet || self.read_only) {
            return Err(OmfsError::InvalidInput(
                "automatic repair cannot be combined with quiet or read-only mode".to_string(),
            ));
        }
        Ok(())
    }
}
