// Consistency checker for OMFS volumes
// Walks the tree, validates every inode and its extent chain, builds the set
// of blocks in use and compares it with the persisted free space bitmap.

use super::bitmap::{Bitmap, FreeSpaceMap};
use super::codec::Codec;
use super::constants::{OMFS_IMAGIC, OMFS_INODE_CONTINUATION, SENTINEL};
use super::dirscan::{walk, DirVisitor, Link, Position, Visit};
use super::fault::{Fault, FaultKind};
use super::repair::{Decider, RepairEngine, RepairOutcome, Subject};
use super::session::Session;
use super::structures::{crc_matches, name_hash, xor_matches, Inode, InodeBody};
use log::{debug, info};
use omfs_core::{BlockDevice, OmfsError};
use serde::Serialize;
use std::collections::HashSet;

/// Outcome of a check run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CheckReport {
    pub faults: Vec<Fault>,
    pub repaired: usize,
    pub declined: usize,
    pub inodes_checked: u64,
    /// The walk reached every inode it could find.
    pub traversal_complete: bool,
    /// A structural repair was made; the volume must be checked again.
    pub restart_required: bool,
    /// The persisted bitmap matches the tree (or was rebuilt to match).
    pub bitmap_ok: bool,
    pub free_blocks: Option<u64>,
}

impl CheckReport {
    pub fn is_success(&self) -> bool {
        self.traversal_complete && self.bitmap_ok && !self.restart_required
    }

    pub fn count(&self, kind: FaultKind) -> usize {
        self.faults.iter().filter(|f| f.kind == kind).count()
    }

    fn record(&mut self, fault: Fault, outcome: RepairOutcome) {
        match outcome {
            RepairOutcome::Fixed | RepairOutcome::RestartRequired => self.repaired += 1,
            RepairOutcome::Declined => self.declined += 1,
            RepairOutcome::Unsupported => {}
        }
        self.faults.push(fault);
    }
}

/// Mark an inode's mirrors and, for files, every block its extent chain
/// owns.
fn mark_extents<D: BlockDevice>(
    codec: &Codec<D>,
    inode: &Inode,
    in_use: &mut Bitmap,
) -> Result<(), OmfsError> {
    let mirrors = codec.mirrors() as u64;
    let num_blocks = codec.num_blocks();
    in_use.set_range(inode.block(), mirrors);

    let mut table = match inode.extents() {
        Some(table) => table.clone(),
        None => return Ok(()),
    };
    let mut seen = HashSet::new();
    loop {
        for extent in table.allocations() {
            in_use.set_range(extent.cluster, extent.blocks);
        }
        let next = table.next;
        if next == SENTINEL || next >= num_blocks || !seen.insert(next) {
            return Ok(());
        }
        in_use.set_range(next, mirrors);
        let cont = codec.read_inode(next)?;
        table = match cont.body {
            InodeBody::Continuation { extents } => extents,
            _ => return Ok(()),
        };
    }
}

/// Collects the blocks in use without judging anything.
struct InUseCollector<'a, D: BlockDevice> {
    codec: &'a Codec<D>,
    in_use: Bitmap,
}

impl<D: BlockDevice> DirVisitor for InUseCollector<'_, D> {
    fn visit_inode(&mut self, _pos: &Position, inode: &Inode) -> Result<Visit, OmfsError> {
        mark_extents(self.codec, inode, &mut self.in_use)?;
        Ok(Visit::Continue)
    }
}

/// Mark the reserved area and, if present, the bitmap's own blocks.
fn mark_fixed_areas<D: BlockDevice>(session: &Session<D>, in_use: &mut Bitmap) {
    in_use.set_range(0, session.root.root_dir);
    if session.root.has_bitmap() {
        in_use.set_range(session.root.bitmap, session.superblock.bitmap_blocks());
    }
}

/// The blocks the tree says are in use, as a bitmap.
pub fn compute_in_use<D: BlockDevice>(session: &Session<D>) -> Result<Bitmap, OmfsError> {
    let mut collector = InUseCollector {
        codec: &session.codec,
        in_use: Bitmap::new(session.num_blocks()),
    };
    walk(&session.codec, session.root.root_dir, &mut collector)?;
    let mut in_use = collector.in_use;
    mark_fixed_areas(session, &mut in_use);
    Ok(in_use)
}

struct CheckVisitor<'a, D: BlockDevice> {
    codec: &'a Codec<D>,
    engine: RepairEngine<'a, D>,
    decider: &'a mut dyn Decider,
    report: &'a mut CheckReport,
    bucket_count: usize,
    mirrors: u64,
    num_blocks: u64,
    /// Blocks covered by the mirrors of every inode seen so far.
    visited: Bitmap,
    in_use: Bitmap,
    /// Some subtree was not scanned, so `in_use` is incomplete.
    skipped: bool,
    restart: bool,
}

impl<'a, D: BlockDevice> CheckVisitor<'a, D> {
    fn handle(&mut self, fault: Fault, subject: Subject<'_>) -> Result<RepairOutcome, OmfsError> {
        debug!("{}", fault);
        let outcome = self.engine.handle(&fault, subject, &mut *self.decider)?;
        if outcome == RepairOutcome::RestartRequired {
            self.restart = true;
        }
        self.report.record(fault, outcome);
        Ok(outcome)
    }

    /// Handle a fault that makes the inode's place in the tree doubtful.
    /// `None` means keep checking the inode.
    fn structural(
        &mut self,
        fault: Fault,
        subject: Subject<'_>,
        pos: &Position,
    ) -> Result<Option<Visit>, OmfsError> {
        let outcome = self.handle(fault, subject)?;
        if outcome == RepairOutcome::RestartRequired {
            return Ok(Some(Visit::Stop));
        }
        if pos.depth == 0 {
            // Skipping the root would skip everything.
            return Ok(None);
        }
        Ok(Some(Visit::SkipChildren))
    }

    /// A broken link inside an extent chain. Whatever lies past it is unknown.
    fn broken_chain(&mut self, fault: Fault) -> Result<Visit, OmfsError> {
        let outcome = self.handle(fault, Subject::None)?;
        if outcome == RepairOutcome::RestartRequired {
            return Ok(Visit::Stop);
        }
        self.skipped = true;
        Ok(Visit::Continue)
    }

    /// XOR, then CRC unless the XOR repair already rewrote the block.
    fn check_checksums(&mut self, pos: &Position, inode: &Inode) -> Result<(), OmfsError> {
        let raw = inode.as_bytes();
        let mut rewritten = false;

        if !xor_matches(raw) {
            let fault = Fault::at(FaultKind::HeaderXorMismatch, pos).named(inode.name_lossy());
            rewritten = self.handle(fault, Subject::Inode(inode))? == RepairOutcome::Fixed;
        }
        if !rewritten && !crc_matches(raw) {
            let fault = Fault::at(FaultKind::HeaderCrcMismatch, pos).named(inode.name_lossy());
            self.handle(fault, Subject::Inode(inode))?;
        }
        Ok(())
    }

    /// Self pointer, parent pointer and hash bucket. Stops at the first
    /// problem found.
    fn check_placement(&mut self, pos: &Position, inode: &Inode) -> Result<Option<Visit>, OmfsError> {
        if inode.header.self_block != pos.block {
            let fault = Fault::at(FaultKind::SelfPointerMismatch, pos)
                .named(inode.name_lossy())
                .detail(format!("claims {:#x}", inode.header.self_block));
            if let Some(verdict) = self.structural(fault, Subject::Inode(inode), pos)? {
                return Ok(Some(verdict));
            }
        }

        if inode.parent != pos.parent {
            let fault = Fault::at(FaultKind::ParentPointerMismatch, pos)
                .named(inode.name_lossy())
                .detail(format!("points to {:#x}", inode.parent));
            if let Some(verdict) = self.structural(fault, Subject::Inode(inode), pos)? {
                return Ok(Some(verdict));
            }
        }

        if let Some(bucket) = pos.bucket {
            let wanted = name_hash(&inode.name, self.bucket_count);
            if wanted != bucket {
                let fault = Fault::at(FaultKind::HashMismatch, pos)
                    .named(inode.name_lossy())
                    .detail(format!("belongs in bucket {}", wanted));
                return self.structural(fault, Subject::Inode(inode), pos);
            }
        }
        Ok(None)
    }

    /// Validate a file's extent tables and mark what they own.
    fn check_extents(&mut self, pos: &Position, inode: &Inode) -> Result<Visit, OmfsError> {
        let mut table = match inode.extents() {
            Some(table) => table.clone(),
            None => return Ok(Visit::Continue),
        };
        let mut owner = inode.block();
        let mut seen = HashSet::new();

        loop {
            if table.is_truncated() {
                let fault = Fault::at(FaultKind::ExtentCount, pos)
                    .named(inode.name_lossy())
                    .detail(format!(
                        "block {:#x} claims {} extents, room for {}",
                        owner,
                        table.count,
                        table.entries.len()
                    ));
                self.handle(fault, Subject::None)?;
                // where the real entries end is unknown
                self.skipped = true;
                return Ok(Visit::Continue);
            }
            if !table.terminator_ok() {
                let fault = Fault::at(FaultKind::ExtentTerminator, pos)
                    .named(inode.name_lossy())
                    .detail(format!("in block {:#x}", owner));
                self.handle(fault, Subject::None)?;
            }

            for extent in table.allocations() {
                // the part inside the volume is still owned by this file
                self.in_use.set_range(extent.cluster, extent.blocks);
                let inside = matches!(
                    extent.cluster.checked_add(extent.blocks),
                    Some(end) if end <= self.num_blocks
                );
                if !inside {
                    let fault = Fault::at(FaultKind::ExtentRange, pos)
                        .named(inode.name_lossy())
                        .detail(format!("{} blocks at {:#x}", extent.blocks, extent.cluster));
                    self.handle(fault, Subject::None)?;
                }
            }

            let next = table.next;
            if next == SENTINEL {
                return Ok(Visit::Continue);
            }

            let cont_pos = Position {
                block: next,
                parent: inode.block(),
                bucket: pos.bucket,
                depth: pos.depth + 1,
                via: Link::Continuation { owner },
            };
            let broken = if next >= self.num_blocks {
                Some(FaultKind::PointerOutOfRange)
            } else if !seen.insert(next) || self.visited.is_set(next) {
                Some(FaultKind::Loop)
            } else {
                None
            };
            if let Some(kind) = broken {
                let fault = Fault::at(kind, &cont_pos).named(inode.name_lossy());
                return self.broken_chain(fault);
            }

            let cont = self.codec.read_inode(next)?;
            self.report.inodes_checked += 1;
            self.check_checksums(&cont_pos, &cont)?;

            if cont.header.kind != OMFS_INODE_CONTINUATION {
                let fault = Fault::at(FaultKind::InodeMagic, &cont_pos)
                    .named(inode.name_lossy())
                    .detail(format!("continuation has type {:#04x}", cont.header.kind));
                self.handle(fault, Subject::None)?;
                self.skipped = true;
                return Ok(Visit::Continue);
            }
            if cont.header.self_block != next {
                let fault = Fault::at(FaultKind::SelfPointerMismatch, &cont_pos)
                    .named(inode.name_lossy())
                    .detail(format!("continuation claims {:#x}", cont.header.self_block));
                return self.broken_chain(fault);
            }

            self.visited.set_range(next, self.mirrors);
            self.in_use.set_range(next, self.mirrors);
            table = match cont.body {
                InodeBody::Continuation { extents } => extents,
                _ => return Ok(Visit::Continue),
            };
            owner = next;
        }
    }
}

impl<D: BlockDevice> DirVisitor for CheckVisitor<'_, D> {
    fn visit_inode(&mut self, pos: &Position, inode: &Inode) -> Result<Visit, OmfsError> {
        self.report.inodes_checked += 1;
        debug!(
            "inode: {:indent$}{} {:#x} {:?} {:#x} {:#x}",
            "",
            inode.name_lossy(),
            inode.block(),
            pos.bucket,
            pos.parent,
            pos.block,
            indent = pos.depth * 2
        );

        if inode.header.block_len() > self.codec.sys_block_size() as usize {
            let fault = Fault::at(FaultKind::Insane, pos)
                .named(inode.name_lossy())
                .detail(format!("body size {}", inode.header.body_size));
            let outcome = self.handle(fault, Subject::None)?;
            if outcome == RepairOutcome::RestartRequired {
                return Ok(Visit::Stop);
            }
            self.skipped = true;
            return Ok(Visit::SkipAll);
        }

        if self.visited.is_set(pos.block) {
            let fault = Fault::at(FaultKind::Loop, pos).named(inode.name_lossy());
            let outcome = self.handle(fault, Subject::None)?;
            if outcome == RepairOutcome::RestartRequired {
                return Ok(Visit::Stop);
            }
            self.skipped = true;
            return Ok(Visit::SkipAll);
        }
        self.visited.set_range(pos.block, self.mirrors);
        self.in_use.set_range(pos.block, self.mirrors);

        self.check_checksums(pos, inode)?;

        if inode.header.magic != OMFS_IMAGIC {
            let fault = Fault::at(FaultKind::InodeMagic, pos)
                .named(inode.name_lossy())
                .detail(format!("{:#04x}", inode.header.magic));
            self.handle(fault, Subject::None)?;
        }

        let verdict = match self.check_placement(pos, inode)? {
            Some(Visit::Stop) => return Ok(Visit::Stop),
            Some(verdict) => verdict,
            None => Visit::Continue,
        };

        if self.check_extents(pos, inode)? == Visit::Stop {
            return Ok(Visit::Stop);
        }
        if verdict == Visit::SkipChildren && inode.is_dir() {
            self.skipped = true;
        }
        Ok(verdict)
    }

    fn visit_loop(&mut self, pos: &Position) -> Result<Visit, OmfsError> {
        let fault = Fault::at(FaultKind::Loop, pos);
        Ok(self.structural(fault, Subject::None, pos)?.unwrap_or(Visit::Continue))
    }

    fn visit_bad_pointer(&mut self, pos: &Position) -> Result<Visit, OmfsError> {
        let fault = Fault::at(FaultKind::PointerOutOfRange, pos);
        Ok(self.structural(fault, Subject::None, pos)?.unwrap_or(Visit::Continue))
    }
}

/// Checksums of the root block, and its mirror count against the superblock.
fn check_root_block<D: BlockDevice>(
    session: &Session<D>,
    decider: &mut dyn Decider,
    report: &mut CheckReport,
) -> Result<(), OmfsError> {
    let engine = RepairEngine::new(&session.codec, session.bucket_count());
    let root = &session.root;
    let raw = root.as_bytes();
    let block = session.superblock.root_block;

    let mut rewritten = false;
    if !xor_matches(raw) {
        let fault = Fault::new(FaultKind::HeaderXorMismatch, block).detail("root block");
        debug!("{}", fault);
        let outcome = engine.handle(&fault, Subject::Root(root), decider)?;
        rewritten = outcome == RepairOutcome::Fixed;
        report.record(fault, outcome);
    }
    if !rewritten && !crc_matches(raw) {
        let fault = Fault::new(FaultKind::HeaderCrcMismatch, block).detail("root block");
        debug!("{}", fault);
        let outcome = engine.handle(&fault, Subject::Root(root), decider)?;
        report.record(fault, outcome);
    }

    if session.superblock.mirrors as u64 != root.mirrors {
        let fault = Fault::new(FaultKind::MirrorCount, block).detail(format!(
            "superblock says {}, root block says {}",
            session.superblock.mirrors, root.mirrors
        ));
        debug!("{}", fault);
        let outcome = engine.handle(&fault, Subject::None, decider)?;
        report.record(fault, outcome);
    }
    Ok(())
}

/// Check the whole volume, asking `decider` about every repair.
///
/// Stops early with `restart_required` set once a structural repair has
/// been made.
pub fn check_filesystem<D: BlockDevice>(
    session: &mut Session<D>,
    decider: &mut dyn Decider,
) -> Result<CheckReport, OmfsError> {
    let mut report = CheckReport::default();

    check_root_block(session, decider, &mut report)?;

    let persisted = if session.root.has_bitmap() {
        Some(FreeSpaceMap::load(&session.codec, session.root.bitmap)?)
    } else {
        None
    };

    let num_blocks = session.num_blocks();
    let (in_use, skipped, restart, summary) = {
        let mut visitor = CheckVisitor {
            codec: &session.codec,
            engine: RepairEngine::new(&session.codec, session.bucket_count()),
            decider: &mut *decider,
            report: &mut report,
            bucket_count: session.bucket_count(),
            mirrors: session.mirrors() as u64,
            num_blocks,
            visited: Bitmap::new(num_blocks),
            in_use: Bitmap::new(num_blocks),
            skipped: false,
            restart: false,
        };
        let summary = walk(&session.codec, session.root.root_dir, &mut visitor)?;
        (visitor.in_use, visitor.skipped, visitor.restart, summary)
    };

    report.restart_required = restart;
    report.traversal_complete = !summary.stopped;
    if summary.stopped {
        info!("scan stopped after {} inodes", report.inodes_checked);
        return Ok(report);
    }

    let mut computed = in_use;
    mark_fixed_areas(session, &mut computed);

    match persisted {
        Some(mut map) => {
            let differences = computed.diff(map.bitmap());
            if differences.is_empty() {
                report.bitmap_ok = true;
            } else {
                let location = session.root.bitmap;
                let faults: Vec<Fault> = differences
                    .into_iter()
                    .map(|m| Fault::bitmap_byte(m, location))
                    .collect();
                info!("free space bitmap differs in {} byte(s)", faults.len());

                let engine = RepairEngine::new(&session.codec, session.bucket_count());
                let outcome = engine.rebuild_bitmap(&faults, &mut map, &computed, !skipped, decider)?;
                report.bitmap_ok = outcome == RepairOutcome::Fixed;
                for fault in faults {
                    report.record(fault, outcome);
                }
            }
            report.free_blocks = Some(map.count_free());
            session.set_free_space(map);
        }
        None => {
            report.bitmap_ok = true;
            if !skipped {
                let map = FreeSpaceMap::derived(computed, session.superblock.block_size);
                report.free_blocks = Some(map.count_free());
                session.set_free_space(map);
            }
        }
    }

    info!(
        "checked {} inodes: {} fault(s), {} repaired, {} declined",
        report.inodes_checked,
        report.faults.len(),
        report.repaired,
        report.declined
    );
    Ok(report)
}
