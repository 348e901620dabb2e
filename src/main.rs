//! keyflash CLI - reflash programmable keyboards over their serial DFU
//! bootloader.

use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use env_logger::Env;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};

use keyflash::dfu::{
    read_firmware_zip, ActivationOutcome, DfuError, DfuEvent, DfuSession, EventKind,
    FirmwarePackage, TransportConfig,
};

/// keyflash - flash keyboard firmware packages through a Nordic serial
/// bootloader.
///
/// Environment variables:
///   KEYFLASH_PORT  - Default serial port
///   KEYFLASH_BAUD  - Default baud rate (default: 115200)
///   RUST_LOG       - Log filter (overrides -v/-q)
#[derive(Parser)]
#[command(name = "keyflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress progress and informational output).
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Serial connection options shared by all commands.
#[derive(Args)]
struct ConnectionArgs {
    /// Serial port of the bootloader.
    #[arg(short, long, env = "KEYFLASH_PORT")]
    port: Option<String>,

    /// Baud rate.
    #[arg(short, long, env = "KEYFLASH_BAUD")]
    baud: Option<u32>,

    /// Do not toggle DTR; the device already sits in its bootloader.
    #[arg(long)]
    skip_reset: bool,

    /// JSON settings file; flags override its values.
    #[arg(long = "config", value_name = "PATH")]
    config_path: Option<PathBuf>,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Flash a DFU package (.zip with manifest.json).
    Flash {
        /// Path to the firmware package.
        package: PathBuf,

        #[command(flatten)]
        connection: ConnectionArgs,

        /// Enable RTS/CTS hardware flow control.
        #[arg(long)]
        flow_control: bool,

        /// The target has a single firmware bank.
        #[arg(long)]
        single_bank: bool,

        /// Expected SHA-256 of the package file.
        #[arg(long, value_name = "HEX")]
        sha256: Option<String>,
    },

    /// Check that a bootloader answers on the port.
    Ping {
        #[command(flatten)]
        connection: ConnectionArgs,
    },
}

impl ConnectionArgs {
    /// Settings file (or defaults) with command-line overrides applied.
    fn transport_config(&self) -> Result<TransportConfig> {
        let mut config = match &self.config_path {
            Some(path) => load_config(path)?,
            None => TransportConfig::default(),
        };

        if let Some(port) = &self.port {
            config.port_name = port.clone();
        }
        if let Some(baud) = self.baud {
            config.baud_rate = baud;
        }
        if self.skip_reset {
            config.skip_reset = true;
        }

        if config.port_name.is_empty() {
            bail!("No serial port given (use --port or KEYFLASH_PORT)");
        }
        Ok(config)
    }
}

fn load_config(path: &Path) -> Result<TransportConfig> {
    TransportConfig::load(path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 1 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!("keyflash v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Flash {
            package,
            connection,
            flow_control,
            single_bank,
            sha256,
        } => {
            let mut config = connection.transport_config()?;
            config.flow_control |= flow_control;
            config.single_bank |= single_bank;
            cmd_flash(&package, config, sha256.as_deref(), cli.quiet).await
        }
        Commands::Ping { connection } => cmd_ping(connection.transport_config()?).await,
    }
}

async fn cmd_flash(
    package_path: &Path,
    config: TransportConfig,
    expected_sha256: Option<&str>,
    quiet: bool,
) -> Result<()> {
    let package = read_firmware_zip(package_path)
        .with_context(|| format!("Failed to read package {}", package_path.display()))?;

    if let Some(expected) = expected_sha256 {
        package.verify_digest(expected).map_err(report)?;
        info!("Package digest verified");
    }
    debug!("Package SHA-256: {}", package.sha256);

    let manifest = &package.manifest;
    if let Some(version) = manifest.dfu_version {
        debug!("Manifest DFU version: {}", version);
    }
    if let Some(device_type) = manifest.device_type {
        info!("Package targets device type 0x{:04X}", device_type);
    }
    if let Some(crc) = manifest.firmware_crc16 {
        debug!("Manifest application CRC16: 0x{:04X}", crc);
    }

    for image in &package.images {
        info!(
            "{}: {:?} image, {} bytes",
            image.bin_file,
            image.mode,
            image.firmware_data.len()
        );
    }

    let pb = progress_bar(quiet);

    // Forward events from the blocking session to the progress bar
    let (tx, rx) = mpsc::channel::<DfuEvent>();
    let forwarder = {
        let pb = pb.clone();
        thread::spawn(move || {
            while let Ok(event) = rx.recv() {
                match event {
                    DfuEvent::Progress {
                        percent, message, ..
                    } => {
                        pb.set_position(u64::from(percent));
                        pb.set_message(message);
                    }
                    DfuEvent::Timeout { message } | DfuEvent::Error { message } => {
                        pb.println(format!("warning: {}", message));
                    }
                }
            }
        })
    };

    let result = tokio::task::spawn_blocking(move || run_update(config, package, tx))
        .await
        .context("DFU task panicked")?;

    // Wait for progress forwarding to complete
    if forwarder.join().is_err() {
        warn!("Progress forwarding thread panicked");
    }

    match result {
        Ok(outcomes) => {
            pb.finish_with_message("Update complete");
            for outcome in outcomes {
                if outcome == ActivationOutcome::DeviceReset {
                    info!("Device reset before acknowledging activation");
                }
            }
            Ok(())
        }
        Err(err) => {
            pb.abandon_with_message("Update failed");
            Err(report(err))
        }
    }
}

/// Flash every image of the package, reconnecting between images.
fn run_update(
    config: TransportConfig,
    package: FirmwarePackage,
    events: mpsc::Sender<DfuEvent>,
) -> Result<Vec<ActivationOutcome>, DfuError> {
    let mut session = DfuSession::serial(config);
    for kind in [EventKind::Progress, EventKind::Timeout, EventKind::Error] {
        let events = events.clone();
        session.on(kind, move |event| {
            let _ = events.send(event.clone());
        });
    }
    drop(events);

    let mut outcomes = Vec::with_capacity(package.images.len());
    for (index, image) in package.images.iter().enumerate() {
        session.open()?;
        let outcome = session.flash_image(image)?;
        let activate_wait = session.activate_wait_time();
        session.close();
        outcomes.push(outcome);

        let is_last = index + 1 == package.images.len();
        if let (false, Some(wait)) = (is_last, activate_wait) {
            info!(
                "Waiting {:.1} s for the device to activate {}",
                wait.as_secs_f64(),
                image.bin_file
            );
            session.transport().pause(wait);
        }
    }

    Ok(outcomes)
}

async fn cmd_ping(config: TransportConfig) -> Result<()> {
    let port = config.port_name.clone();

    let answered = tokio::task::spawn_blocking(move || -> Result<bool, DfuError> {
        let mut session = DfuSession::serial(config);
        session.open()?;
        let answered = session.send_ping();
        session.close();
        Ok(answered)
    })
    .await
    .context("Ping task panicked")?
    .map_err(report)?;

    if answered {
        info!("Bootloader on {} answered", port);
        Ok(())
    } else {
        warn!("No answer from {}", port);
        bail!("Bootloader on {} did not answer", port)
    }
}

fn progress_bar(quiet: bool) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new(100);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    pb
}

/// Attach the support code to a library error.
fn report(err: DfuError) -> anyhow::Error {
    let code = err.error_code();
    anyhow::Error::new(err).context(format!("DFU failed [{}]", code))
}
