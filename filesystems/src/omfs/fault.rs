// Problems found by the consistency checker

use super::bitmap::ByteMismatch;
use super::dirscan::Position;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FaultKind {
    HeaderXorMismatch,
    HeaderCrcMismatch,
    SelfPointerMismatch,
    ParentPointerMismatch,
    HashMismatch,
    Loop,
    Insane,
    BitmapMismatch,
    InodeMagic,
    ExtentCount,
    ExtentTerminator,
    ExtentRange,
    MirrorCount,
    PointerOutOfRange,
}

impl FaultKind {
    pub fn message(&self) -> &'static str {
        match self {
            FaultKind::HeaderXorMismatch => "header XOR is incorrect",
            FaultKind::HeaderCrcMismatch => "header CRC is incorrect",
            FaultKind::SelfPointerMismatch => "self pointer is wrong",
            FaultKind::ParentPointerMismatch => "parent pointer is wrong",
            FaultKind::HashMismatch => "file is in the wrong hash bucket",
            FaultKind::Loop => "block is reachable more than once",
            FaultKind::Insane => "inode is totally busted",
            FaultKind::BitmapMismatch => "free space bitmap is inconsistent",
            FaultKind::InodeMagic => "inode magic number is wrong",
            FaultKind::ExtentCount => "extent count is out of range",
            FaultKind::ExtentTerminator => "extent terminator checksum does not add up",
            FaultKind::ExtentRange => "extent lies outside the volume",
            FaultKind::MirrorCount => "mirror count differs between superblock and root block",
            FaultKind::PointerOutOfRange => "pointer lies outside the volume",
        }
    }

    /// Faults repaired by cutting the link to the block.
    pub fn is_unlink(&self) -> bool {
        matches!(
            self,
            FaultKind::SelfPointerMismatch
                | FaultKind::ParentPointerMismatch
                | FaultKind::Loop
                | FaultKind::Insane
                | FaultKind::PointerOutOfRange
        )
    }

    /// Faults after which the inode's subtree cannot be trusted.
    pub fn is_structural(&self) -> bool {
        self.is_unlink() || *self == FaultKind::HashMismatch
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// One detected problem, with enough context to repair it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Fault {
    pub kind: FaultKind,
    /// Block the problem was found in.
    pub block: u64,
    /// Inode name, when the block decoded as one.
    pub name: Option<String>,
    /// How the walk reached the block; `None` for volume-level faults.
    pub position: Option<Position>,
    /// Differing bitmap byte, for `BitmapMismatch`.
    pub bitmap: Option<ByteMismatch>,
    pub detail: String,
}

impl Fault {
    pub fn new(kind: FaultKind, block: u64) -> Self {
        Self {
            kind,
            block,
            name: None,
            position: None,
            bitmap: None,
            detail: String::new(),
        }
    }

    pub fn at(kind: FaultKind, pos: &Position) -> Self {
        Self {
            position: Some(*pos),
            ..Self::new(kind, pos.block)
        }
    }

    pub fn named(mut self, name: String) -> Self {
        self.name = Some(name);
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }

    pub fn bitmap_byte(mismatch: ByteMismatch, location: u64) -> Self {
        Self {
            bitmap: Some(mismatch),
            ..Self::new(FaultKind::BitmapMismatch, location)
        }
        .detail(format!(
            "byte {:#x}: computed {:#04x}, on disk {:#04x}",
            mismatch.offset, mismatch.expected, mismatch.found
        ))
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "Inode {:#x} ({}): {}", self.block, name, self.kind)?,
            None => write!(f, "Block {:#x}: {}", self.block, self.kind)?,
        }
        if let Some(pos) = &self.position {
            if let Some(bucket) = pos.bucket {
                write!(f, " [parent {:#x}, bucket {}]", pos.parent, bucket)?;
            }
        }
        if !self.detail.is_empty() {
            write!(f, " ({})", self.detail)?;
        }
        Ok(())
    }
}
