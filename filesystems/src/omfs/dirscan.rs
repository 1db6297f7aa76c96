// Directory tree traversal
// Walks the tree with an explicit stack of pending tasks, so stack use does
// not grow with the depth of the tree on disk. Every block is entered at
// most once; a second reference is reported as a loop.

use super::bitmap::Bitmap;
use super::codec::Codec;
use super::constants::SENTINEL;
use super::structures::Inode;
use log::{debug, trace};
use omfs_core::{BlockDevice, OmfsError};
use serde::Serialize;

/// The pointer that led the walk to a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Link {
    /// The root block's root directory pointer.
    Root,
    /// Slot `index` of directory `dir`.
    Bucket { dir: u64, index: usize },
    /// The sibling pointer of inode `owner`.
    Sibling { owner: u64 },
    /// The next pointer of the extent table in block `owner`.
    Continuation { owner: u64 },
}

/// Where an inode was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Position {
    /// Block the inode was read from.
    pub block: u64,
    /// Directory whose bucket chain holds it (`~0` for the root).
    pub parent: u64,
    /// Bucket index of the chain; `None` for the root directory.
    pub bucket: Option<usize>,
    pub depth: usize,
    pub via: Link,
}

/// What the walk should do after a visit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    Continue,
    /// Do not enter this directory, but keep following the chain.
    SkipChildren,
    /// Ignore the inode completely, its sibling pointer included.
    SkipAll,
    Stop,
}

pub trait DirVisitor {
    fn visit_inode(&mut self, pos: &Position, inode: &Inode) -> Result<Visit, OmfsError>;

    /// A pointer to a block the walk has already entered.
    fn visit_loop(&mut self, _pos: &Position) -> Result<Visit, OmfsError> {
        Ok(Visit::Continue)
    }

    /// A pointer past the end of the volume.
    fn visit_bad_pointer(&mut self, _pos: &Position) -> Result<Visit, OmfsError> {
        Ok(Visit::Continue)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalkSummary {
    pub inodes: u64,
    pub loops: u64,
    pub bad_pointers: u64,
    /// The visitor asked to stop before the tree was exhausted.
    pub stopped: bool,
}

/// Walk the tree under `root_dir` in pre-order: bucket chains in index
/// order, each chain in sibling order, each subdirectory before the next
/// entry of its chain.
pub fn walk<D, V>(codec: &Codec<D>, root_dir: u64, visitor: &mut V) -> Result<WalkSummary, OmfsError>
where
    D: BlockDevice,
    V: DirVisitor + ?Sized,
{
    let num_blocks = codec.num_blocks();
    let mut visited = Bitmap::new(num_blocks);
    let mut summary = WalkSummary::default();

    let mut pending = vec![Position {
        block: root_dir,
        parent: SENTINEL,
        bucket: None,
        depth: 0,
        via: Link::Root,
    }];

    while let Some(pos) = pending.pop() {
        let verdict = if pos.block >= num_blocks {
            summary.bad_pointers += 1;
            debug!("pointer {:#x} via {:?} is outside the volume", pos.block, pos.via);
            visitor.visit_bad_pointer(&pos)?
        } else if visited.is_set(pos.block) {
            summary.loops += 1;
            debug!("block {} reached again via {:?}", pos.block, pos.via);
            visitor.visit_loop(&pos)?
        } else {
            visited.set(pos.block);
            let inode = codec.read_inode(pos.block)?;
            summary.inodes += 1;
            trace!(
                "{:indent$}{} at {} (bucket {:?}, parent {:#x})",
                "",
                inode.name_lossy(),
                pos.block,
                pos.bucket,
                pos.parent,
                indent = pos.depth * 2
            );

            let verdict = visitor.visit_inode(&pos, &inode)?;
            if matches!(verdict, Visit::Continue | Visit::SkipChildren) {
                push_children(&mut pending, &pos, &inode, verdict == Visit::Continue);
            }
            verdict
        };

        if verdict == Visit::Stop {
            summary.stopped = true;
            break;
        }
    }

    Ok(summary)
}

/// Queue the sibling, then the buckets in reverse so bucket 0 pops first.
fn push_children(pending: &mut Vec<Position>, pos: &Position, inode: &Inode, enter: bool) {
    if pos.depth > 0 && inode.sibling != SENTINEL {
        pending.push(Position {
            block: inode.sibling,
            parent: pos.parent,
            bucket: pos.bucket,
            depth: pos.depth,
            via: Link::Sibling { owner: pos.block },
        });
    }

    if !enter {
        return;
    }
    if let Some(buckets) = inode.buckets() {
        for (index, &slot) in buckets.iter().enumerate().rev() {
            if slot == SENTINEL {
                continue;
            }
            pending.push(Position {
                block: slot,
                parent: pos.block,
                bucket: Some(index),
                depth: pos.depth + 1,
                via: Link::Bucket {
                    dir: pos.block,
                    index,
                },
            });
        }
    }
}
