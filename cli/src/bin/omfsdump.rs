use anyhow::Context;
use clap::Parser;
use omfs_cli::{
    default_log_level, format_summary, init_logging, ListingSink, EXIT_CHECK_FAILED,
    EXIT_OPEN_FAILED,
};
use omfs_core::FileDevice;
use omfs_filesystems::{dump_tree, Session, VolumeSummary};
use std::io::{self, Write};
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(name = "omfsdump")]
#[command(about = "Print the structure of an OMFS filesystem", long_about = None)]
struct Cli {
    /// Device or image file holding the volume
    device: PathBuf,
    /// Raise the log level (repeat for more)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn run(device: FileDevice) -> anyhow::Result<()> {
    let session = Session::open_read_only(device).context("could not read the volume")?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    for line in format_summary(&VolumeSummary::new(&session)) {
        writeln!(out, "{}", line)?;
    }

    let mut sink = ListingSink::new(&mut out);
    let walked = dump_tree(&session, &mut sink).context("directory scan failed")?;
    if let Some(e) = sink.error.take() {
        return Err(e.into());
    }
    log::info!(
        "{} inodes, {} loop(s), {} bad pointer(s)",
        walked.inodes,
        walked.loops,
        walked.bad_pointers
    );
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    init_logging(default_log_level(cli.verbose, false));

    let device = match FileDevice::open_read_only(&cli.device) {
        Ok(device) => device,
        Err(e) => {
            eprintln!("omfsdump: {}", e);
            process::exit(EXIT_OPEN_FAILED);
        }
    };

    if let Err(e) = run(device) {
        eprintln!("omfsdump: {:#}", e);
        process::exit(EXIT_CHECK_FAILED);
    }
}
