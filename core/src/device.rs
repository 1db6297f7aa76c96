use crate::OmfsError;
use log::trace;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Random-access byte device holding a volume.
///
/// Offsets are absolute byte positions. Implementations report a read or
/// write that cannot be completed in full as `ShortRead`/`ShortWrite`.
pub trait BlockDevice {
    fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>, OmfsError>;
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), OmfsError>;
    fn flush(&mut self) -> Result<(), OmfsError>;
    fn size(&self) -> u64;
}

impl<D: BlockDevice + ?Sized> BlockDevice for &mut D {
    fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>, OmfsError> {
        (**self).read_at(offset, len)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), OmfsError> {
        (**self).write_at(offset, data)
    }

    fn flush(&mut self) -> Result<(), OmfsError> {
        (**self).flush()
    }

    fn size(&self) -> u64 {
        (**self).size()
    }
}

impl<D: BlockDevice + ?Sized> BlockDevice for Box<D> {
    fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>, OmfsError> {
        (**self).read_at(offset, len)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), OmfsError> {
        (**self).write_at(offset, data)
    }

    fn flush(&mut self) -> Result<(), OmfsError> {
        (**self).flush()
    }

    fn size(&self) -> u64 {
        (**self).size()
    }
}

/// A device node or image file.
pub struct FileDevice {
    file: File,
    path: PathBuf,
    size: u64,
    writable: bool,
}

impl FileDevice {
    /// Open an existing device or image for reading and writing.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, OmfsError> {
        Self::open_with(path.as_ref(), true)
    }

    /// Open an existing device or image without write access.
    pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Self, OmfsError> {
        Self::open_with(path.as_ref(), false)
    }

    fn open_with(path: &Path, writable: bool) -> Result<Self, OmfsError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(path)
            .map_err(|e| OmfsError::DeviceOpen(format!("{}: {}", path.display(), e)))?;

        // Block device nodes report a zero length in their metadata, so
        // measure by seeking to the end instead.
        let size = file.seek(SeekFrom::End(0))?;
        file.seek(SeekFrom::Start(0))?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
            size,
            writable,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

impl BlockDevice for FileDevice {
    fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>, OmfsError> {
        trace!("read {} bytes at {:#x} from {}", len, offset, self.path.display());
        self.file.seek(SeekFrom::Start(offset))?;

        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            match self.file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        if filled < len {
            return Err(OmfsError::ShortRead {
                offset,
                expected: len,
                actual: filled,
            });
        }
        Ok(buf)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), OmfsError> {
        if !self.writable {
            return Err(OmfsError::ReadOnly);
        }
        trace!("write {} bytes at {:#x} to {}", data.len(), offset, self.path.display());
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data).map_err(|e| match e.kind() {
            ErrorKind::WriteZero => OmfsError::ShortWrite {
                offset,
                expected: data.len(),
                actual: 0,
            },
            _ => OmfsError::Io(e),
        })?;

        let end = offset + data.len() as u64;
        if end > self.size {
            self.size = end;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), OmfsError> {
        if self.writable {
            self.file.flush()?;
            self.file.sync_data()?;
        }
        Ok(())
    }

    fn size(&self) -> u64 {
        self.size
    }
}

/// Volume image held entirely in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryDevice {
    data: Vec<u8>,
}

impl MemoryDevice {
    /// A zero-filled image of `size` bytes.
    pub fn new(size: usize) -> Self {
        Self { data: vec![0u8; size] }
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }

    fn span(&self, offset: u64, len: usize) -> Option<std::ops::Range<usize>> {
        let start = usize::try_from(offset).ok()?;
        let end = start.checked_add(len)?;
        (end <= self.data.len()).then_some(start..end)
    }
}

impl BlockDevice for MemoryDevice {
    fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>, OmfsError> {
        match self.span(offset, len) {
            Some(range) => Ok(self.data[range].to_vec()),
            None => Err(OmfsError::ShortRead {
                offset,
                expected: len,
                actual: self.data.len().saturating_sub(offset as usize),
            }),
        }
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), OmfsError> {
        match self.span(offset, data.len()) {
            Some(range) => {
                self.data[range].copy_from_slice(data);
                Ok(())
            }
            None => Err(OmfsError::ShortWrite {
                offset,
                expected: data.len(),
                actual: 0,
            }),
        }
    }

    fn flush(&mut self) -> Result<(), OmfsError> {
        Ok(())
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_memory_device_bounds() {
        let mut dev = MemoryDevice::new(1024);
        dev.write_at(1000, &[1, 2, 3]).unwrap();
        assert_eq!(dev.read_at(1000, 3).unwrap(), vec![1, 2, 3]);

        assert!(matches!(
            dev.read_at(1020, 8),
            Err(OmfsError::ShortRead { expected: 8, actual: 4, .. })
        ));
        assert!(matches!(
            dev.write_at(1023, &[0, 0]),
            Err(OmfsError::ShortWrite { .. })
        ));
    }

    #[test]
    fn test_file_device_round_trip() {
        let temp_file = NamedTempFile::new().unwrap();
        temp_file.as_file().set_len(64 * 1024).unwrap();

        let mut dev = FileDevice::open(temp_file.path()).unwrap();
        assert_eq!(dev.size(), 64 * 1024);

        dev.write_at(8192, b"omfs").unwrap();
        dev.flush().unwrap();
        assert_eq!(dev.read_at(8192, 4).unwrap(), b"omfs".to_vec());
        assert!(matches!(
            dev.read_at(64 * 1024 - 2, 4),
            Err(OmfsError::ShortRead { actual: 2, .. })
        ));
    }

    #[test]
    fn test_read_only_file_device_refuses_writes() {
        let temp_file = NamedTempFile::new().unwrap();
        temp_file.as_file().set_len(4096).unwrap();

        let mut dev = FileDevice::open_read_only(temp_file.path()).unwrap();
        assert!(!dev.is_writable());
        assert!(matches!(dev.write_at(0, &[1]), Err(OmfsError::ReadOnly)));
    }
}
