//! ymuploader CLI - upload a firmware image to a device over YMODEM.

use anyhow::{Context, Result};
use clap::Parser;
use console::style;
use env_logger::Env;
use indicatif::{ProgressBar, ProgressStyle};
use std::fs::File;
use std::path::PathBuf;
use ymuploader::protocol::{DialectFlags, FileInfo};
use ymuploader::{DeviceCoordinator, YmodemSender};

/// ymuploader - upload firmware to a device over YMODEM.
#[derive(Parser)]
#[command(name = "ymuploader")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Serial port the device is attached to.
    #[arg(short, long, env = "YMUPLOADER_PORT")]
    port: String,

    /// Path to the firmware image to upload.
    #[arg(short, long)]
    file: PathBuf,

    /// Fallback tool name for environments where this uploader is one of
    /// several candidates (informational only; unused by the core path).
    #[arg(short, long)]
    tool: Option<String>,

    /// Verbose output level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level)).init();

    if let Err(e) = run(&cli) {
        println!("{} {e:#}", style("Upload Failed:").red().bold());
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<()> {
    if let Some(tool) = &cli.tool {
        log::debug!("ignoring -t/--tool={tool}, no external tool fallback in this build");
    }

    let file = File::open(&cli.file)
        .with_context(|| format!("failed to open firmware file {}", cli.file.display()))?;
    let length = file
        .metadata()
        .with_context(|| format!("failed to stat {}", cli.file.display()))?
        .len();
    let name = cli
        .file
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("firmware.bin")
        .to_string();

    println!("{} {}", style("Connecting to").cyan(), cli.port);
    let coordinator = DeviceCoordinator::new(&cli.port);
    let mut port = coordinator.ensure_dfu().context("enter dfu mode fail")?;

    println!(
        "{} device in boot mode, starting YMODEM transfer",
        style("✓").green()
    );

    let bar = ProgressBar::new(length);
    #[allow(clippy::unwrap_used)] // Static template string, unwrap is safe
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{bar:40.cyan/blue} {bytes}/{total_bytes} ({eta})")
            .unwrap()
            .progress_chars("=>-"),
    );

    let info = FileInfo::new(name, length);
    let mut sender = YmodemSender::new(&mut port);
    sender
        .send(file, &info, DialectFlags::default(), |p| {
            bar.set_position(p.sent_bytes as u64);
        })
        .context("Upload Failed")?;

    bar.finish_with_message("done");
    println!("{}", style("Upload complete").green().bold());

    Ok(())
}
