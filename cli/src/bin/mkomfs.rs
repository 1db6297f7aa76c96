use anyhow::Context;
use clap::Parser;
use omfs_cli::{default_log_level, init_logging, EXIT_CHECK_FAILED, EXIT_OPEN_FAILED};
use omfs_core::{BlockDevice, FileDevice, FormatOptions, SECTOR_SIZE};
use omfs_filesystems::format_device;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(name = "mkomfs")]
#[command(about = "Create an OMFS filesystem", long_about = None)]
struct Cli {
    /// Device or image file to format
    device: PathBuf,
    /// Block size in bytes
    #[arg(short = 'b', long, default_value_t = 8192)]
    block_size: u32,
    /// Blocks per cluster
    #[arg(short = 'c', long, default_value_t = 8)]
    cluster_size: u32,
    /// Overwrite the whole device first
    #[arg(short = 'x', long)]
    clear: bool,
    /// Volume label
    #[arg(short = 'l', long, default_value = "omfs")]
    label: String,
    /// Do not ask for confirmation
    #[arg(short = 'f', long)]
    force: bool,
    /// Raise the log level (repeat for more)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn confirmed() -> io::Result<bool> {
    print!("Warning: this could kill some important data; Are you sure? ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim_start().starts_with('y'))
}

fn run(cli: &Cli, device: FileDevice) -> anyhow::Result<()> {
    let options = FormatOptions {
        block_size: cli.block_size,
        cluster_size: cli.cluster_size,
        label: cli.label.clone(),
        clear_device: cli.clear,
        ..Default::default()
    };
    options.validate()?;

    let (_, summary) = format_device(device, &options).context("formatting failed")?;
    println!(
        "Created '{}': {} blocks of {} bytes, {} free",
        summary.label, summary.num_blocks, summary.block_size, summary.free_blocks
    );
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    init_logging(default_log_level(cli.verbose, false));

    let device = match FileDevice::open(&cli.device) {
        Ok(device) => device,
        Err(e) => {
            eprintln!("mkomfs: {}", e);
            process::exit(EXIT_OPEN_FAILED);
        }
    };

    println!(
        "Creating a new fs on dev {} ({} blks)",
        cli.device.display(),
        device.size() / SECTOR_SIZE as u64
    );
    if !cli.force {
        match confirmed() {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                eprintln!("mkomfs: {}", e);
                process::exit(EXIT_CHECK_FAILED);
            }
        }
    }

    if let Err(e) = run(&cli, device) {
        eprintln!("mkomfs: {:#}", e);
        process::exit(EXIT_CHECK_FAILED);
    }
}
