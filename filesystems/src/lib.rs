// OMFS on-disk format, checker, repair engine and volume creation
pub mod omfs;

pub use omfs::{
    check_filesystem, create_filesystem, dump_tree, format_device, AlwaysAccept, AlwaysDecline,
    CheckReport, Decider, Fault, FaultKind, FormatSummary, InodeRecord, RecordKind,
    RepairOutcome, ReportSink, Session, VolumeSummary, Writer,
};
