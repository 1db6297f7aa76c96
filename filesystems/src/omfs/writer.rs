// Creating directories and files on an OMFS volume
// New inodes take an aligned run of `mirrors` blocks and are linked at the
// head of their bucket chain. File data is allocated in cluster runs.

use super::constants::SENTINEL;
use super::session::Session;
use super::structures::{name_hash, ExtentEntry, Inode, InodeBody};
use log::debug;
use omfs_core::{BlockDevice, OmfsError};
use std::collections::HashSet;

pub struct Writer<'s, D: BlockDevice> {
    session: &'s mut Session<D>,
}

impl<'s, D: BlockDevice> Writer<'s, D> {
    /// Loads the free space map if the session has not done so yet.
    pub fn new(session: &'s mut Session<D>) -> Result<Self, OmfsError> {
        session.load_bitmap()?;
        Ok(Self { session })
    }

    pub fn root_dir(&self) -> u64 {
        self.session.root.root_dir
    }

    fn allocate(&mut self, size: u32) -> Result<u64, OmfsError> {
        self.session.load_bitmap()?.allocate_run(size)
    }

    pub fn create_dir(&mut self, parent: u64, name: &str) -> Result<u64, OmfsError> {
        self.create_inode(parent, name, true)
    }

    pub fn create_file(&mut self, parent: u64, name: &str) -> Result<u64, OmfsError> {
        self.create_inode(parent, name, false)
    }

    fn create_inode(&mut self, parent: u64, name: &str, dir: bool) -> Result<u64, OmfsError> {
        if name.is_empty() || name.len() >= super::constants::OMFS_NAMELEN {
            return Err(OmfsError::InvalidInput(format!("bad name '{}'", name)));
        }
        let codec = &self.session.codec;
        let mut parent_inode = codec.read_inode(parent)?;
        if !parent_inode.is_dir() {
            return Err(OmfsError::InvalidInput(format!(
                "block {:#x} is not a directory",
                parent
            )));
        }
        if self.lookup(parent, name)?.is_some() {
            return Err(OmfsError::InvalidInput(format!("'{}' already exists", name)));
        }

        let bucket = name_hash(name.as_bytes(), self.session.bucket_count());
        let block = self.allocate(self.session.mirrors())?;
        let sys = self.session.codec.sys_block_size();

        let mut inode = if dir {
            Inode::new_directory(block, name.as_bytes(), sys)
        } else {
            Inode::new_file(block, name.as_bytes(), sys)
        };
        inode.parent = parent;

        let head = parent_inode
            .buckets_mut()
            .and_then(|b| b.get_mut(bucket))
            .ok_or_else(|| OmfsError::Corrupt {
                block: parent,
                detail: format!("directory has no bucket {}", bucket),
            })?;
        inode.sibling = *head;
        *head = block;

        // the new inode goes to disk before anything points at it
        self.session.codec.write_inode(&mut inode)?;
        self.session.codec.write_inode(&mut parent_inode)?;
        self.session.flush_bitmap()?;

        debug!("created '{}' at {} in bucket {} of {}", name, block, bucket, parent);
        Ok(block)
    }

    /// Find `name` in directory `dir` by walking its bucket chain.
    pub fn lookup(&self, dir: u64, name: &str) -> Result<Option<u64>, OmfsError> {
        let codec = &self.session.codec;
        let dir_inode = codec.read_inode(dir)?;
        let bucket = name_hash(name.as_bytes(), self.session.bucket_count());
        let mut cur = match dir_inode.buckets().and_then(|b| b.get(bucket)) {
            Some(&head) => head,
            None => return Ok(None),
        };

        let mut seen = HashSet::new();
        while cur != SENTINEL && cur < codec.num_blocks() && seen.insert(cur) {
            let inode = codec.read_inode(cur)?;
            if inode.name == name.as_bytes() {
                return Ok(Some(cur));
            }
            cur = inode.sibling;
        }
        Ok(None)
    }

    /// Allocate one cluster of zeroed data blocks at the end of a file's
    /// extent chain, adding a continuation block when the last table is full.
    pub fn append_extent(&mut self, file: u64) -> Result<ExtentEntry, OmfsError> {
        let cluster = self.session.cluster_size();
        let mirrors = self.session.mirrors();
        let sys = self.session.codec.sys_block_size();

        let mut last = self.session.codec.read_inode(file)?;
        if !last.is_file() {
            return Err(OmfsError::InvalidInput(format!("block {:#x} is not a file", file)));
        }
        let mut seen = HashSet::new();
        loop {
            let next = last.extents().map(|t| t.next).unwrap_or(SENTINEL);
            if next == SENTINEL {
                break;
            }
            if !seen.insert(next) {
                return Err(OmfsError::Corrupt {
                    block: file,
                    detail: "extent chain loops".to_string(),
                });
            }
            last = self.session.codec.read_inode(next)?;
            if !matches!(last.body, InodeBody::Continuation { .. }) {
                return Err(OmfsError::Corrupt {
                    block: next,
                    detail: "extent chain leads to a non-continuation block".to_string(),
                });
            }
        }

        let start = self.allocate(cluster)?;
        self.session.codec.clear_blocks(start, cluster as u64)?;
        let extent = ExtentEntry {
            cluster: start,
            blocks: cluster as u64,
        };

        let used = last.extents().map(|t| t.entries.len()).unwrap_or(0);
        if used < last.extent_capacity() {
            if let Some(table) = last.extents_mut() {
                table.push(extent);
            }
            self.session.codec.write_inode(&mut last)?;
        } else {
            let block = self.allocate(mirrors)?;
            let mut cont = Inode::new_continuation(block, sys);
            if let Some(table) = cont.extents_mut() {
                table.push(extent);
            }
            self.session.codec.write_inode(&mut cont)?;
            if let Some(table) = last.extents_mut() {
                table.next = block;
            }
            self.session.codec.write_inode(&mut last)?;
            debug!("file {} continues in block {}", file, block);
        }

        self.session.flush_bitmap()?;
        Ok(extent)
    }

    /// Create a file holding `data`.
    pub fn write_file(&mut self, parent: u64, name: &str, data: &[u8]) -> Result<u64, OmfsError> {
        let block = self.create_file(parent, name)?;
        let block_size = self.session.codec.block_size() as usize;

        let mut written = 0;
        while written < data.len() {
            let extent = self.append_extent(block)?;
            for i in 0..extent.blocks {
                if written >= data.len() {
                    break;
                }
                let end = (written + block_size).min(data.len());
                self.session
                    .codec
                    .write_data(extent.cluster + i, &data[written..end])?;
                written = end;
            }
        }

        // append_extent rewrote the inode; pick up its current table
        let mut inode = self.session.codec.read_inode(block)?;
        inode.size = data.len() as u64;
        self.session.codec.write_inode(&mut inode)?;
        Ok(block)
    }

    /// Read back the contents of a file, `size` bytes long.
    pub fn read_file(&self, file: u64) -> Result<Vec<u8>, OmfsError> {
        let codec = &self.session.codec;
        let inode = codec.read_inode(file)?;
        let size = inode.size as usize;
        let mut data = Vec::with_capacity(size);

        let mut table = inode.extents().cloned();
        let mut seen = HashSet::new();
        while let Some(current) = table.take() {
            for extent in current.allocations() {
                for i in 0..extent.blocks {
                    if data.len() >= size {
                        break;
                    }
                    data.extend_from_slice(&codec.read_data(extent.cluster + i)?);
                }
            }
            if current.next != SENTINEL && seen.insert(current.next) {
                table = codec.read_inode(current.next)?.extents().cloned();
            }
        }
        data.truncate(size);
        Ok(data)
    }
}
