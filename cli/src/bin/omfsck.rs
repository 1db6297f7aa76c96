use anyhow::Context;
use clap::Parser;
use log::info;
use omfs_cli::{
    decider_for, default_log_level, exit_code, init_logging, outcome_message, EXIT_CHECK_FAILED,
    EXIT_OPEN_FAILED,
};
use omfs_core::{CheckOptions, FileDevice};
use omfs_filesystems::{check_filesystem, Session};
use std::io::{self, Write};
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(name = "omfsck")]
#[command(about = "Check and repair an OMFS filesystem", long_about = None)]
struct Cli {
    /// Device or image file holding the volume
    device: PathBuf,
    /// Report nothing and repair nothing
    #[arg(short, long)]
    quiet: bool,
    /// Answer yes to every repair
    #[arg(short = 'y', long = "yes", conflicts_with_all = ["quiet", "read_only"])]
    assume_yes: bool,
    /// Open the device read-only; every repair is declined
    #[arg(short = 'n', long)]
    read_only: bool,
    /// Print the check report as JSON on stdout
    #[arg(long)]
    json: bool,
    /// Raise the log level (repeat for more)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn run(cli: &Cli, device: FileDevice) -> anyhow::Result<i32> {
    let options = CheckOptions {
        quiet: cli.quiet,
        assume_yes: cli.assume_yes,
        read_only: cli.read_only,
    };
    options.validate()?;

    let mut session = if options.read_only {
        Session::open_read_only(device)
    } else {
        Session::open(device)
    }
    .context("cannot read the superblock or root block")?;

    // keep stdout clean for the report when it is JSON
    let narration: Box<dyn Write> = if cli.json {
        Box::new(io::stderr())
    } else {
        Box::new(io::stdout())
    };
    let mut decider = decider_for(&options, narration);
    let report = check_filesystem(&mut session, decider.as_mut()).context("scan failed")?;
    session.sync().context("flushing changes")?;

    info!(
        "{} inodes, {} fault(s), {} free blocks",
        report.inodes_checked,
        report.faults.len(),
        report
            .free_blocks
            .map(|n| n.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    );

    let code = exit_code(&report);
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", outcome_message(&report));
    }
    Ok(code)
}

fn main() {
    let cli = Cli::parse();
    init_logging(default_log_level(cli.verbose, cli.quiet));

    let opened = if cli.read_only {
        FileDevice::open_read_only(&cli.device)
    } else {
        FileDevice::open(&cli.device)
    };
    let device = match opened {
        Ok(device) => device,
        Err(e) => {
            eprintln!("omfsck: {}", e);
            process::exit(EXIT_OPEN_FAILED);
        }
    };

    match run(&cli, device) {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("omfsck: {:#}", e);
            process::exit(EXIT_CHECK_FAILED);
        }
    }
}
