/// Devices with injectable failures, for exercising error paths.
use crate::{BlockDevice, MemoryDevice, OmfsError};
use std::collections::HashSet;

/// Wraps a [`MemoryDevice`] and fails selected operations.
#[derive(Debug, Clone, Default)]
pub struct FaultyDevice {
    inner: MemoryDevice,
    failing_writes: HashSet<u64>,
    failing_reads: HashSet<u64>,
    writes_left: Option<usize>,
    pub write_log: Vec<u64>,
}

impl FaultyDevice {
    pub fn new(inner: MemoryDevice) -> Self {
        Self {
            inner,
            ..Default::default()
        }
    }

    /// Fail any write starting at `offset`.
    pub fn fail_write_at(&mut self, offset: u64) {
        self.failing_writes.insert(offset);
    }

    /// Fail any read starting at `offset`.
    pub fn fail_read_at(&mut self, offset: u64) {
        self.failing_reads.insert(offset);
    }

    /// Allow `count` more writes, then fail every write after that.
    pub fn fail_after_writes(&mut self, count: usize) {
        self.writes_left = Some(count);
    }

    /// Make every write succeed again.
    pub fn heal(&mut self) {
        self.failing_writes.clear();
        self.failing_reads.clear();
        self.writes_left = None;
    }

    pub fn inner(&self) -> &MemoryDevice {
        &self.inner
    }

    pub fn into_inner(self) -> MemoryDevice {
        self.inner
    }
}

impl BlockDevice for FaultyDevice {
    fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>, OmfsError> {
        if self.failing_reads.contains(&offset) {
            return Err(OmfsError::ShortRead {
                offset,
                expected: len,
                actual: 0,
            });
        }
        self.inner.read_at(offset, len)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), OmfsError> {
        let exhausted = matches!(self.writes_left, Some(0));
        if exhausted || self.failing_writes.contains(&offset) {
            return Err(OmfsError::ShortWrite {
                offset,
                expected: data.len(),
                actual: 0,
            });
        }
        if let Some(left) = self.writes_left.as_mut() {
            *left -= 1;
        }
        self.write_log.push(offset);
        self.inner.write_at(offset, data)
    }

    fn flush(&mut self) -> Result<(), OmfsError> {
        self.inner.flush()
    }

    fn size(&self) -> u64 {
        self.inner.size()
    }
}
