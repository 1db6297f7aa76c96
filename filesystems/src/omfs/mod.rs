// OMFS: Optimized MPEG Filesystem
// Block-mirrored volumes with hash-bucket directories and extent-mapped files.

pub mod bitmap;
pub mod check;
pub mod checksum;
pub mod codec;
pub mod constants;
pub mod dirscan;
pub mod dump;
pub mod endian;
pub mod fault;
pub mod formatter;
pub mod repair;
pub mod session;
pub mod structures;
pub mod writer;

pub use bitmap::{Bitmap, ByteMismatch, FreeSpaceMap};
pub use check::{check_filesystem, compute_in_use, CheckReport};
pub use codec::Codec;
pub use dirscan::{walk, DirVisitor, Link, Position, Visit, WalkSummary};
pub use dump::{dump_tree, InodeRecord, RecordKind, ReportSink, VolumeSummary};
pub use endian::Endian;
pub use fault::{Fault, FaultKind};
pub use formatter::{create_filesystem, format_device, FormatSummary};
pub use repair::{AlwaysAccept, AlwaysDecline, Decider, RepairEngine, RepairOutcome};
pub use session::Session;
pub use structures::{name_hash, ExtentEntry, ExtentTable, Header, Inode, InodeBody, RootBlock, Superblock};
pub use writer::Writer;
