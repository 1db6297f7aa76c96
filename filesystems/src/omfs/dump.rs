// Structure dump of an OMFS volume
// Collects the volume geometry and one record per inode reached by the
// directory walk. Presentation is left to the caller's sink.

use super::dirscan::{walk, DirVisitor, Position, Visit, WalkSummary};
use super::session::Session;
use super::structures::Inode;
use omfs_core::{BlockDevice, OmfsError};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RecordKind {
    Directory,
    File,
    Other(u8),
}

/// One inode as seen by the walk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InodeRecord {
    pub name: Vec<u8>,
    pub kind: RecordKind,
    /// Self pointer stored in the header.
    pub self_block: u64,
    pub crc: u16,
    pub depth: usize,
    pub bucket: Option<usize>,
    pub parent: u64,
    /// Block the inode was read from.
    pub block: u64,
}

impl InodeRecord {
    fn new(pos: &Position, inode: &Inode) -> Self {
        let kind = if inode.is_dir() {
            RecordKind::Directory
        } else if inode.is_file() {
            RecordKind::File
        } else {
            RecordKind::Other(inode.kind)
        };
        Self {
            name: inode.name.clone(),
            kind,
            self_block: inode.header.self_block,
            crc: inode.header.crc,
            depth: pos.depth,
            bucket: pos.bucket,
            parent: pos.parent,
            block: pos.block,
        }
    }
}

/// Receives the dump as it is produced.
pub trait ReportSink {
    fn record(&mut self, record: InodeRecord);
}

impl ReportSink for Vec<InodeRecord> {
    fn record(&mut self, record: InodeRecord) {
        self.push(record);
    }
}

/// Superblock and root block fields shown ahead of the inode listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeSummary {
    pub label: String,
    pub magic: u32,
    pub root_block: u64,
    pub num_blocks: u64,
    pub block_size: u32,
    pub sys_block_size: u32,
    pub mirrors: u32,
    pub root_block_size: u32,
    pub cluster_size: u32,
    pub root_mirrors: u64,
}

impl VolumeSummary {
    pub fn new<D: BlockDevice>(session: &Session<D>) -> Self {
        let sb = &session.superblock;
        let root = &session.root;
        Self {
            label: sb.label(),
            magic: sb.magic,
            root_block: sb.root_block,
            num_blocks: sb.num_blocks,
            block_size: sb.block_size,
            sys_block_size: sb.sys_block_size,
            mirrors: sb.mirrors,
            root_block_size: root.block_size,
            cluster_size: root.cluster_size,
            root_mirrors: root.mirrors,
        }
    }
}

struct DumpVisitor<'a, S: ReportSink + ?Sized> {
    sink: &'a mut S,
}

impl<S: ReportSink + ?Sized> DirVisitor for DumpVisitor<'_, S> {
    fn visit_inode(&mut self, pos: &Position, inode: &Inode) -> Result<Visit, OmfsError> {
        self.sink.record(InodeRecord::new(pos, inode));
        Ok(Visit::Continue)
    }
}

/// Feed every inode under the root directory to `sink`, in walk order.
pub fn dump_tree<D, S>(session: &Session<D>, sink: &mut S) -> Result<WalkSummary, OmfsError>
where
    D: BlockDevice,
    S: ReportSink + ?Sized,
{
    let mut visitor = DumpVisitor { sink };
    walk(&session.codec, session.root.root_dir, &mut visitor)
}
