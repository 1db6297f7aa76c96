// Repairs for faults found by the checker
// Every fault is reported to the decider before anything is asked. Structural
// repairs change the shape of the tree, so the walk that found them is stale
// afterwards and the run has to be restarted.

use super::bitmap::{Bitmap, FreeSpaceMap};
use super::codec::Codec;
use super::constants::SENTINEL;
use super::dirscan::{Link, Position};
use super::fault::{Fault, FaultKind};
use super::structures::{name_hash, Inode, RootBlock};
use log::{info, warn};
use omfs_core::{BlockDevice, OmfsError};
use serde::Serialize;
use std::collections::HashSet;

/// Answers repair questions. Implemented by the terminal front end and by
/// the fixed policies below.
pub trait Decider {
    /// Describe a fault to the operator.
    fn report(&mut self, fault: &Fault);

    /// Ask whether to go ahead with a repair.
    fn confirm(&mut self, question: &str) -> bool;
}

/// Declines every repair and says nothing.
#[derive(Debug, Default)]
pub struct AlwaysDecline;

impl Decider for AlwaysDecline {
    fn report(&mut self, _fault: &Fault) {}

    fn confirm(&mut self, _question: &str) -> bool {
        false
    }
}

/// Accepts every repair and says nothing.
#[derive(Debug, Default)]
pub struct AlwaysAccept;

impl Decider for AlwaysAccept {
    fn report(&mut self, _fault: &Fault) {}

    fn confirm(&mut self, _question: &str) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RepairOutcome {
    Declined,
    Fixed,
    /// The tree was changed; the current walk must not continue.
    RestartRequired,
    /// No repair exists for this fault (or for where it was found).
    Unsupported,
}

/// What a fault refers to, when the repair needs the decoded block.
#[derive(Debug, Clone, Copy)]
pub enum Subject<'a> {
    None,
    Inode(&'a Inode),
    Root(&'a RootBlock),
}

/// Which pointer of an owner block refers to the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Bucket(usize),
    Sibling,
    Next,
}

pub const QUESTION_DELETE: &str = "Delete the offending file?";
pub const QUESTION_CORRECT: &str = "Correct?";
pub const QUESTION_MOVE: &str = "Move it to the right bucket?";
pub const QUESTION_REBUILD: &str = "Rebuild?";

pub struct RepairEngine<'a, D: BlockDevice> {
    codec: &'a Codec<D>,
    bucket_count: usize,
}

impl<'a, D: BlockDevice> RepairEngine<'a, D> {
    pub fn new(codec: &'a Codec<D>, bucket_count: usize) -> Self {
        Self {
            codec,
            bucket_count,
        }
    }

    fn ask(&self, decider: &mut dyn Decider, question: &str) -> bool {
        !self.codec.is_read_only() && decider.confirm(question)
    }

    /// Report `fault`, then apply the matching repair if the decider agrees.
    pub fn handle(
        &self,
        fault: &Fault,
        subject: Subject<'_>,
        decider: &mut dyn Decider,
    ) -> Result<RepairOutcome, OmfsError> {
        decider.report(fault);

        match fault.kind {
            kind if kind.is_unlink() => {
                let pos = match fault.position {
                    Some(pos) if pos.via != Link::Root => pos,
                    _ => return Ok(RepairOutcome::Unsupported),
                };
                if !self.ask(decider, QUESTION_DELETE) {
                    return Ok(RepairOutcome::Declined);
                }
                if !self.unlink(&pos)? {
                    warn!("could not find the pointer to block {:#x}", pos.block);
                    return Ok(RepairOutcome::Unsupported);
                }
                Ok(RepairOutcome::RestartRequired)
            }
            FaultKind::HeaderXorMismatch | FaultKind::HeaderCrcMismatch => {
                // A block whose self pointer is wrong would be written elsewhere.
                let in_place = match subject {
                    Subject::Inode(inode) => inode.block() == fault.block,
                    Subject::Root(root) => root.header.self_block == fault.block,
                    Subject::None => false,
                };
                if !in_place {
                    return Ok(RepairOutcome::Unsupported);
                }
                if !self.ask(decider, QUESTION_CORRECT) {
                    return Ok(RepairOutcome::Declined);
                }
                match subject {
                    Subject::Inode(inode) => self.codec.rewrite_inode(&mut inode.clone())?,
                    Subject::Root(root) => self.codec.write_root_block(&mut root.clone())?,
                    Subject::None => {}
                }
                info!("rewrote checksums of block {:#x}", fault.block);
                Ok(RepairOutcome::Fixed)
            }
            FaultKind::HashMismatch => {
                let (pos, inode) = match (fault.position, subject) {
                    (Some(pos), Subject::Inode(inode)) if pos.via != Link::Root => (pos, inode),
                    _ => return Ok(RepairOutcome::Unsupported),
                };
                if !self.ask(decider, QUESTION_MOVE) {
                    return Ok(RepairOutcome::Declined);
                }
                if !self.relocate(&pos, inode)? {
                    return Ok(RepairOutcome::Unsupported);
                }
                Ok(RepairOutcome::RestartRequired)
            }
            _ => Ok(RepairOutcome::Unsupported),
        }
    }

    /// One decision for every differing bitmap byte; on acceptance the map is
    /// replaced with `computed` and flushed.
    pub fn rebuild_bitmap(
        &self,
        faults: &[Fault],
        map: &mut FreeSpaceMap,
        computed: &Bitmap,
        complete: bool,
        decider: &mut dyn Decider,
    ) -> Result<RepairOutcome, OmfsError> {
        for fault in faults {
            decider.report(fault);
        }
        if !complete {
            info!("not rebuilding the bitmap: parts of the tree were not scanned");
            return Ok(RepairOutcome::Unsupported);
        }
        if !self.ask(decider, QUESTION_REBUILD) {
            return Ok(RepairOutcome::Declined);
        }
        map.replace_with(computed);
        map.flush(self.codec)?;
        info!("rebuilt free space bitmap ({} free blocks)", map.count_free());
        Ok(RepairOutcome::Fixed)
    }

    /// Read the owner of `pos.via` and check it still points at the block.
    fn owner_of(&self, pos: &Position) -> Result<Option<(Inode, Slot)>, OmfsError> {
        let (owner, slot) = match pos.via {
            Link::Root => return Ok(None),
            Link::Bucket { dir, index } => (dir, Slot::Bucket(index)),
            Link::Sibling { owner } => (owner, Slot::Sibling),
            Link::Continuation { owner } => (owner, Slot::Next),
        };
        let inode = self.codec.read_inode(owner)?;
        Ok((read_slot(&inode, slot) == Some(pos.block)).then_some((inode, slot)))
    }

    /// Locate the pointer that leads to `pos.block`: the recorded link if it
    /// still holds, otherwise a search of the parent directory.
    pub fn resolve_link(&self, pos: &Position) -> Result<Option<(Inode, Slot)>, OmfsError> {
        if let Some(found) = self.owner_of(pos)? {
            return Ok(Some(found));
        }
        if matches!(pos.via, Link::Continuation { .. }) || pos.parent == SENTINEL {
            return Ok(None);
        }
        find_link(self.codec, pos.parent, pos.block, pos.bucket)
    }

    fn unlink(&self, pos: &Position) -> Result<bool, OmfsError> {
        let (mut owner, slot) = match self.resolve_link(pos)? {
            Some(found) => found,
            None => return Ok(false),
        };
        write_slot(&mut owner, slot, SENTINEL);
        self.codec.write_inode(&mut owner)?;
        self.codec.sync()?;
        info!("cut link {:?} of block {:#x} to {:#x}", slot, owner.block(), pos.block);
        Ok(true)
    }

    /// Move an inode from its chain to the head of the bucket its name hashes to.
    fn relocate(&self, pos: &Position, inode: &Inode) -> Result<bool, OmfsError> {
        let (mut owner, slot) = match self.resolve_link(pos)? {
            Some(found) => found,
            None => return Ok(false),
        };
        let bucket = name_hash(&inode.name, self.bucket_count);

        write_slot(&mut owner, slot, inode.sibling);
        self.codec.write_inode(&mut owner)?;

        // The owner may have been the parent itself, so read it afresh.
        let mut parent = self.codec.read_inode(pos.parent)?;
        let head = match parent.buckets_mut().and_then(|b| b.get_mut(bucket)) {
            Some(head) => head,
            None => return Ok(false),
        };
        let mut moved = inode.clone();
        moved.sibling = *head;
        *head = moved.block();

        self.codec.write_inode(&mut parent)?;
        self.codec.write_inode(&mut moved)?;
        self.codec.sync()?;
        info!(
            "moved '{}' ({:#x}) to bucket {} of {:#x}",
            inode.name_lossy(),
            moved.block(),
            bucket,
            pos.parent
        );
        Ok(true)
    }
}

fn read_slot(inode: &Inode, slot: Slot) -> Option<u64> {
    match slot {
        Slot::Bucket(index) => inode.buckets().and_then(|b| b.get(index).copied()),
        Slot::Sibling => Some(inode.sibling),
        Slot::Next => inode.extents().map(|t| t.next),
    }
}

fn write_slot(inode: &mut Inode, slot: Slot, value: u64) {
    match slot {
        Slot::Bucket(index) => {
            if let Some(entry) = inode.buckets_mut().and_then(|b| b.get_mut(index)) {
                *entry = value;
            }
        }
        Slot::Sibling => inode.sibling = value,
        Slot::Next => {
            if let Some(table) = inode.extents_mut() {
                table.next = value;
            }
        }
    }
}

/// Search directory `parent` for the pointer to `target`: the bucket slots
/// first, then each chain. `hint` is searched before the other buckets.
pub fn find_link<D: BlockDevice>(
    codec: &Codec<D>,
    parent: u64,
    target: u64,
    hint: Option<usize>,
) -> Result<Option<(Inode, Slot)>, OmfsError> {
    let dir = codec.read_inode(parent)?;
    let buckets = match dir.buckets() {
        Some(buckets) => buckets.to_vec(),
        None => return Ok(None),
    };

    let mut order: Vec<usize> = hint.into_iter().filter(|&i| i < buckets.len()).collect();
    order.extend((0..buckets.len()).filter(|&i| Some(i) != hint));

    let num_blocks = codec.num_blocks();
    for index in order {
        if buckets[index] == target {
            return Ok(Some((dir, Slot::Bucket(index))));
        }

        let mut seen = HashSet::new();
        let mut cur = buckets[index];
        while cur < num_blocks && seen.insert(cur) {
            let inode = codec.read_inode(cur)?;
            if inode.sibling == target {
                return Ok(Some((inode, Slot::Sibling)));
            }
            cur = inode.sibling;
        }
    }
    Ok(None)
}
