// Free space bitmap for OMFS block allocation
// One bit per block, set = in use. The in-memory copy is rounded up to whole
// blocks and each backing block carries a dirty bit until it is flushed.

use super::codec::Codec;
use log::{debug, trace};
use omfs_core::{BlockDevice, OmfsError};
use serde::Serialize;

/// Free bits per nibble value.
const NIBBLE_FREE: [u32; 16] = [4, 3, 3, 2, 3, 2, 2, 1, 3, 2, 2, 1, 2, 1, 1, 0];

/// Bits of the last meaningful byte that lie past the end of the volume.
fn padding_mask(size_bits: u64) -> u8 {
    match size_bits % 8 {
        0 => 0,
        used => !((1u8 << used) - 1),
    }
}

/// Bitmap for tracking block allocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    data: Vec<u8>,
    size_bits: u64,
}

/// A byte that differs between two bitmaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ByteMismatch {
    pub offset: u64,
    pub expected: u8,
    pub found: u8,
}

impl Bitmap {
    /// Create a bitmap with `size_bits` meaningful bits.
    pub fn new(size_bits: u64) -> Self {
        Self::with_capacity(size_bits, ((size_bits + 7) / 8) as usize)
    }

    /// Create a bitmap whose storage is `bytes` long (at least enough for the bits).
    pub fn with_capacity(size_bits: u64, bytes: usize) -> Self {
        let bytes = bytes.max(((size_bits + 7) / 8) as usize);
        Self {
            data: vec![0u8; bytes],
            size_bits,
        }
    }

    /// Wrap bytes read from disk.
    pub fn from_bytes(mut data: Vec<u8>, size_bits: u64) -> Self {
        let needed = ((size_bits + 7) / 8) as usize;
        if data.len() < needed {
            data.resize(needed, 0);
        }
        Self { data, size_bits }
    }

    pub fn len_bits(&self) -> u64 {
        self.size_bits
    }

    /// Bytes that hold meaningful bits.
    pub fn meaningful_bytes(&self) -> usize {
        ((self.size_bits + 7) / 8) as usize
    }

    /// Set a bit (mark as used)
    pub fn set(&mut self, index: u64) {
        if index >= self.size_bits {
            return;
        }
        self.data[(index >> 3) as usize] |= 1 << (index & 7);
    }

    /// Clear a bit (mark as free)
    pub fn clear(&mut self, index: u64) {
        if index >= self.size_bits {
            return;
        }
        self.data[(index >> 3) as usize] &= !(1 << (index & 7));
    }

    /// Check if a bit is set
    pub fn is_set(&self, index: u64) -> bool {
        if index >= self.size_bits {
            return false;
        }
        self.data[(index >> 3) as usize] & (1 << (index & 7)) != 0
    }

    /// Set a range of bits
    pub fn set_range(&mut self, start: u64, count: u64) {
        for i in start..start.saturating_add(count).min(self.size_bits) {
            self.set(i);
        }
    }

    /// Count free bits, ignoring padding past the last block.
    pub fn count_free(&self) -> u64 {
        let bytes = self.meaningful_bytes();
        let pad = padding_mask(self.size_bits);

        self.data[..bytes]
            .iter()
            .enumerate()
            .map(|(i, &b)| {
                let b = if i + 1 == bytes { b | pad } else { b };
                (NIBBLE_FREE[(b & 0xf) as usize] + NIBBLE_FREE[(b >> 4) as usize]) as u64
            })
            .sum()
    }

    /// First aligned run of `size` clear bits (size 1, 2, 4 or 8), marked set.
    pub fn claim_aligned(&mut self, size: u32) -> Option<u64> {
        let size = size as u64;
        if size == 0 || size > 8 || !size.is_power_of_two() {
            return None;
        }
        let mask = ((1u16 << size) - 1) as u8;

        let mut i = 0;
        while i + size <= self.size_bits {
            let m = mask << (i & 7);
            let byte = &mut self.data[(i >> 3) as usize];
            if *byte & m == 0 {
                *byte |= m;
                return Some(i);
            }
            i += size;
        }
        None
    }

    /// Bytes that differ from `found`, padding bits masked off.
    pub fn diff(&self, found: &Bitmap) -> Vec<ByteMismatch> {
        let bytes = self.meaningful_bytes();
        let pad = padding_mask(self.size_bits);

        (0..bytes)
            .filter_map(|i| {
                let keep = if i + 1 == bytes { !pad } else { 0xff };
                let expected = self.data[i] & keep;
                let other = found.data.get(i).copied().unwrap_or(0) & keep;
                (expected != other).then_some(ByteMismatch {
                    offset: i as u64,
                    expected,
                    found: other,
                })
            })
            .collect()
    }

    /// Get bitmap data as bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

/// The volume's allocation map plus write-back state.
pub struct FreeSpaceMap {
    map: Bitmap,
    dirty: Bitmap,
    block_size: u32,
    location: Option<u64>,
}

impl FreeSpaceMap {
    /// Empty map for `num_blocks`, persisted at `location` if given.
    pub fn new(num_blocks: u64, block_size: u32, location: Option<u64>) -> Self {
        let backing = Self::backing_blocks_for(num_blocks, block_size);
        Self {
            map: Bitmap::with_capacity(num_blocks, (backing * block_size as u64) as usize),
            dirty: Bitmap::new(backing),
            block_size,
            location,
        }
    }

    fn backing_blocks_for(num_blocks: u64, block_size: u32) -> u64 {
        let bytes = (num_blocks + 7) / 8;
        let bs = block_size as u64;
        ((bytes + bs - 1) / bs).max(1)
    }

    /// Read the persisted bitmap from `location`.
    pub fn load<D: BlockDevice>(codec: &Codec<D>, location: u64) -> Result<Self, OmfsError> {
        let num_blocks = codec.num_blocks();
        let block_size = codec.block_size();
        let backing = Self::backing_blocks_for(num_blocks, block_size);

        debug!("loading bitmap: {} block(s) at {}", backing, location);
        let data = codec.read_region(location, (backing * block_size as u64) as usize)?;
        Ok(Self {
            map: Bitmap::from_bytes(data, num_blocks),
            dirty: Bitmap::new(backing),
            block_size,
            location: Some(location),
        })
    }

    /// A map computed by walking the tree, with no on-disk copy.
    pub fn derived(map: Bitmap, block_size: u32) -> Self {
        let backing = Self::backing_blocks_for(map.len_bits(), block_size);
        Self {
            map,
            dirty: Bitmap::new(backing),
            block_size,
            location: None,
        }
    }

    pub fn bitmap(&self) -> &Bitmap {
        &self.map
    }

    pub fn location(&self) -> Option<u64> {
        self.location
    }

    pub fn backing_blocks(&self) -> u64 {
        self.dirty.len_bits()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.count_free() < self.dirty.len_bits()
    }

    pub fn is_backing_dirty(&self, index: u64) -> bool {
        self.dirty.is_set(index)
    }

    fn mark_dirty(&mut self, block: u64) {
        self.dirty.set((block >> 3) / self.block_size as u64);
    }

    pub fn count_free(&self) -> u64 {
        self.map.count_free()
    }

    pub fn is_allocated(&self, block: u64) -> bool {
        self.map.is_set(block)
    }

    /// Claim a specific block. False if it is taken or outside the volume.
    pub fn allocate_one(&mut self, block: u64) -> bool {
        if block >= self.map.len_bits() || self.map.is_set(block) {
            return false;
        }
        self.map.set(block);
        self.mark_dirty(block);
        true
    }

    /// Claim the first free aligned run of `size` blocks.
    pub fn allocate_run(&mut self, size: u32) -> Result<u64, OmfsError> {
        if !matches!(size, 1 | 2 | 4 | 8) {
            return Err(OmfsError::InvalidInput(format!(
                "allocation size {} is not 1, 2, 4 or 8",
                size
            )));
        }
        let start = self.map.claim_aligned(size).ok_or(OmfsError::NoSpace(size))?;
        for block in start..start + size as u64 {
            self.mark_dirty(block);
        }
        trace!("allocated {} block(s) at {}", size, start);
        Ok(start)
    }

    pub fn clear_range(&mut self, start: u64, count: u64) {
        for block in start..start.saturating_add(count).min(self.map.len_bits()) {
            self.map.clear(block);
            self.mark_dirty(block);
        }
    }

    /// Overwrite the whole map, e.g. with one rebuilt by traversal.
    pub fn replace_with(&mut self, map: &Bitmap) {
        let keep = self.map.as_bytes().len();
        let mut data = map.as_bytes().to_vec();
        data.resize(keep.max(data.len()), 0);
        self.map = Bitmap::from_bytes(data, map.len_bits());
        self.dirty.set_range(0, self.dirty.len_bits());
    }

    /// Write every dirty backing block. A dirty bit is only dropped once its
    /// block has been written.
    pub fn flush<D: BlockDevice>(&mut self, codec: &Codec<D>) -> Result<(), OmfsError> {
        let location = match self.location {
            Some(location) => location,
            None => return Ok(()),
        };

        let bs = self.block_size as usize;
        for index in 0..self.dirty.len_bits() {
            if !self.dirty.is_set(index) {
                continue;
            }
            let start = index as usize * bs;
            let chunk = &self.map.as_bytes()[start..start + bs];
            codec.write_block(location + index, chunk, 1)?;
            self.dirty.clear(index);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitmap_operations() {
        let mut bitmap = Bitmap::new(100);

        assert!(!bitmap.is_set(0));
        bitmap.set(0);
        assert!(bitmap.is_set(0));
        assert_eq!(bitmap.as_bytes()[0], 0x01);

        bitmap.set(9);
        assert_eq!(bitmap.as_bytes()[1], 0x02);

        bitmap.clear(0);
        assert!(!bitmap.is_set(0));

        bitmap.set_range(10, 5);
        for i in 10..15 {
            assert!(bitmap.is_set(i));
        }

        bitmap.set(100); // out of range, ignored
        assert_eq!(bitmap.count_free(), 100 - 6);
    }

    #[test]
    fn test_count_free_masks_padding() {
        let mut bitmap = Bitmap::with_capacity(12, 8192);
        assert_eq!(bitmap.count_free(), 12);
        bitmap.set(11);
        assert_eq!(bitmap.count_free(), 11);
    }

    #[test]
    fn test_claim_aligned_runs() {
        let mut bitmap = Bitmap::new(64);
        bitmap.set_range(0, 3);

        assert_eq!(bitmap.claim_aligned(1), Some(3));
        assert_eq!(bitmap.claim_aligned(2), Some(4));
        assert_eq!(bitmap.claim_aligned(8), Some(8));
        assert_eq!(bitmap.claim_aligned(4), Some(16));
        assert_eq!(bitmap.claim_aligned(3), None);

        // runs may not cross the end of the volume
        let mut small = Bitmap::new(6);
        assert_eq!(small.claim_aligned(8), None);
        assert_eq!(small.claim_aligned(4), Some(0));
        assert_eq!(small.claim_aligned(4), None);
    }

    #[test]
    fn test_diff_ignores_padding() {
        let computed = Bitmap::new(12);
        let mut found = Bitmap::from_bytes(vec![0x00, 0xF0], 12);
        assert!(computed.diff(&found).is_empty());

        found.set(3);
        let diff = computed.diff(&found);
        assert_eq!(
            diff,
            vec![ByteMismatch { offset: 0, expected: 0x00, found: 0x08 }]
        );
    }

    #[test]
    fn test_dirty_tracking() {
        let mut map = FreeSpaceMap::new(64 * 1024, 2048, Some(5));
        assert_eq!(map.backing_blocks(), 4);
        assert!(!map.is_dirty());

        assert!(map.allocate_one(3 * 2048 * 8 + 1));
        assert!(!map.allocate_one(3 * 2048 * 8 + 1));
        assert!(map.is_backing_dirty(3));
        assert!(!map.is_backing_dirty(0));

        map.clear_range(0, 1);
        assert!(map.is_backing_dirty(0));
        assert!(!map.allocate_one(64 * 1024));
    }

    #[test]
    fn test_allocate_run_no_space() {
        let mut map = FreeSpaceMap::new(16, 2048, None);
        assert_eq!(map.allocate_run(8).unwrap(), 0);
        assert_eq!(map.allocate_run(8).unwrap(), 8);
        assert!(matches!(map.allocate_run(1), Err(OmfsError::NoSpace(1))));
        assert!(map.allocate_run(3).is_err());
        assert_eq!(map.count_free(), 0);
    }

    #[test]
    fn test_replace_with_marks_everything_dirty() {
        let mut map = FreeSpaceMap::new(40_000, 2048, Some(5));
        let mut rebuilt = Bitmap::new(40_000);
        rebuilt.set_range(0, 10);

        map.replace_with(&rebuilt);
        assert_eq!(map.count_free(), 40_000 - 10);
        for i in 0..map.backing_blocks() {
            assert!(map.is_backing_dirty(i));
        }
        assert_eq!(map.bitmap().as_bytes().len(), 3 * 2048);
    }
}
