// Shared plumbing for the omfsck, omfsdump and mkomfs binaries

use omfs_core::CheckOptions;
use omfs_filesystems::omfs::constants::SENTINEL;
use omfs_filesystems::{
    AlwaysAccept, AlwaysDecline, CheckReport, Decider, Fault, InodeRecord, RecordKind, ReportSink,
    VolumeSummary,
};
use std::io::{self, BufRead, Write};

pub const EXIT_OK: i32 = 0;
/// A structural repair was made; the check has to be run again.
pub const EXIT_RESTART: i32 = 1;
pub const EXIT_OPEN_FAILED: i32 = 2;
pub const EXIT_CHECK_FAILED: i32 = 3;

pub const RESTART_MESSAGE: &str = "Made changes; re-run omfsck to continue scan";

/// Default log filter for the command line flags. Quiet runs only let
/// errors through.
pub fn default_log_level(verbose: u8, quiet: bool) -> &'static str {
    match verbose {
        0 if quiet => "error",
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// Logging goes to stderr at `default_level`; `RUST_LOG` takes precedence.
pub fn init_logging(default_level: &str) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp(None)
        .init();
}

/// Prints each fault and asks on the terminal.
pub struct TerminalDecider<R: BufRead, W: Write> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> TerminalDecider<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }
}

impl<R: BufRead, W: Write> Decider for TerminalDecider<R, W> {
    fn report(&mut self, fault: &Fault) {
        let _ = writeln!(self.output, "{}", fault);
    }

    fn confirm(&mut self, question: &str) -> bool {
        let _ = write!(self.output, "{} [y/N] ", question);
        let _ = self.output.flush();

        let mut line = String::new();
        let yes = match self.input.read_line(&mut line) {
            Ok(_) => line.trim_start().starts_with(['y', 'Y']),
            Err(_) => false,
        };
        let _ = writeln!(self.output, "{}", if yes { "Okay." } else { "Skipping." });
        yes
    }
}

/// Accepts every repair, narrating each one.
pub struct AssumeYes<W: Write> {
    output: W,
    inner: AlwaysAccept,
}

impl<W: Write> AssumeYes<W> {
    pub fn new(output: W) -> Self {
        Self {
            output,
            inner: AlwaysAccept,
        }
    }
}

impl<W: Write> Decider for AssumeYes<W> {
    fn report(&mut self, fault: &Fault) {
        let _ = writeln!(self.output, "{}", fault);
    }

    fn confirm(&mut self, question: &str) -> bool {
        let _ = writeln!(self.output, "{} yes", question);
        self.inner.confirm(question)
    }
}

/// Pick the decision policy for a check run. Narration goes to `output`.
pub fn decider_for(options: &CheckOptions, output: Box<dyn Write>) -> Box<dyn Decider> {
    if options.quiet {
        Box::new(AlwaysDecline)
    } else if options.assume_yes {
        Box::new(AssumeYes::new(output))
    } else {
        Box::new(TerminalDecider::new(io::stdin().lock(), output))
    }
}

/// Exit status for a finished check.
pub fn exit_code(report: &CheckReport) -> i32 {
    if report.restart_required {
        EXIT_RESTART
    } else if report.is_success() {
        EXIT_OK
    } else {
        EXIT_CHECK_FAILED
    }
}

/// The closing line of an omfsck run.
pub fn outcome_message(report: &CheckReport) -> String {
    if report.restart_required {
        RESTART_MESSAGE.to_string()
    } else if !report.is_success() {
        "File system check failed".to_string()
    } else if report.declined > 0 {
        format!(
            "File system check successful; {} problem(s) left unrepaired",
            report.declined
        )
    } else {
        "File system check successful".to_string()
    }
}

/// Printable bytes as they are, anything else as `\xNN`.
pub fn escape_name(name: &[u8]) -> String {
    let mut out = String::with_capacity(name.len());
    for &b in name {
        if b.is_ascii_graphic() || b == b' ' {
            out.push(b as char);
        } else {
            out.push_str(&format!("\\x{:02x}", b));
        }
    }
    out
}

pub fn format_summary(summary: &VolumeSummary) -> Vec<String> {
    vec![
        format!("Filesystem volume name: {}", summary.label),
        format!("Filesystem magic number: {:#x}", summary.magic),
        format!("First block: {:#x}", summary.root_block),
        format!("Block count: {:#x}", summary.num_blocks),
        format!("Block size: {}", summary.block_size),
        format!("Inode block size: {}", summary.sys_block_size),
        format!("Mirrors: {}", summary.mirrors),
        String::new(),
        format!("Root block size: {}", summary.root_block_size),
        format!("Cluster size: {}", summary.cluster_size),
        format!("Root mirrors: {}", summary.root_mirrors),
    ]
}

/// One listing line per inode, indented two columns per level.
pub fn format_record(record: &InodeRecord) -> String {
    let marker = if record.kind == RecordKind::Directory { '/' } else { ' ' };
    let bucket = match record.bucket {
        Some(bucket) => bucket.to_string(),
        None => "-1".to_string(),
    };
    let parent = if record.parent == SENTINEL {
        "-".to_string()
    } else {
        format!("{:x}", record.parent)
    };
    format!(
        "inode: {:indent$}{}{} s:{:x} h:{} c:{} p:{} b:{:x}",
        "",
        escape_name(&record.name),
        marker,
        record.self_block,
        bucket,
        record.crc,
        parent,
        record.block,
        indent = (record.depth * 2).max(1)
    )
}

/// Writes each record as a listing line.
pub struct ListingSink<W: Write> {
    output: W,
    pub error: Option<io::Error>,
}

impl<W: Write> ListingSink<W> {
    pub fn new(output: W) -> Self {
        Self { output, error: None }
    }
}

impl<W: Write> ReportSink for ListingSink<W> {
    fn record(&mut self, record: InodeRecord) {
        if self.error.is_none() {
            if let Err(e) = writeln!(self.output, "{}", format_record(&record)) {
                self.error = Some(e);
            }
        }
    }
}
