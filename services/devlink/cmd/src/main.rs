//! devlink command line.
//!
//! Lists, uploads, deletes and creates files on a device that speaks the
//! devlink frame protocol over a USB CDC serial port or a serial-over-TCP
//! bridge.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use devlink_session::{
    connect_tcp, open_device, CancellationToken, IoStream, Link, LinkError, UploadProgress,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::DevlinkConfig;
use logging::LinkLogFormatter;

/// Host-side client for the devlink serial file protocol
#[derive(Parser, Debug)]
#[command(name = "devlink", version, about = "File access to a device over a serial link")]
struct Args {
    /// Serial device path, e.g. /dev/ttyACM0
    #[arg(long, conflicts_with = "connect")]
    device: Option<PathBuf>,

    /// Serial port speed; USB CDC devices ignore it
    #[arg(long)]
    baud: Option<u32>,

    /// Serial bridge address, e.g. 127.0.0.1:7000
    #[arg(long)]
    connect: Option<String>,

    /// Configuration file path
    #[arg(long, default_value = "devlink.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Response timeout for single-frame requests, e.g. 2s
    #[arg(long)]
    timeout: Option<humantime::Duration>,

    /// Max payload assumed until the device reports one
    #[arg(long)]
    max_payload: Option<u32>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Cmd {
    /// Check that the device answers
    Ping,
    /// Query the device's max payload
    Info,
    /// List a directory
    Ls {
        /// Directory on the device
        #[arg(default_value = "/")]
        path: String,
        /// Print entries as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete a file
    Rm {
        /// File on the device
        path: String,
    },
    /// Create a directory
    Mkdir {
        /// Directory on the device
        path: String,
    },
    /// Upload a local file
    Put {
        /// File to send
        local: PathBuf,
        /// Destination path on the device
        remote: String,
    },
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("warn")
        .add_directive(format!("devlink={}", args.log_level).parse()?)
        .add_directive(format!("devlink_session={}", args.log_level).parse()?)
        .add_directive(format!("devlink_wire={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .event_format(LinkLogFormatter::new(logging::color_supported()))
        .init();

    debug!("Starting devlink v{}", env!("CARGO_PKG_VERSION"));

    let mut config = DevlinkConfig::load_from_file(&args.config)?;
    apply_args(&mut config, &args);

    let stream = open_transport(&config).await?;
    info!("Connected to {}", stream.describe());
    let link = Link::open(stream, config.link.clone());

    let outcome = run(&link, args.command).await;
    debug!("Link stats: {}", link.stats());
    outcome
}

/// Command-line flags win over file and environment
fn apply_args(config: &mut DevlinkConfig, args: &Args) {
    if let Some(device) = &args.device {
        config.device = Some(device.clone());
        config.connect = None;
    }
    if let Some(baud) = args.baud {
        config.baud_rate = baud;
    }
    if let Some(connect) = &args.connect {
        config.connect = Some(connect.clone());
        config.device = None;
    }
    if let Some(timeout) = args.timeout {
        config.link.response_timeout = timeout.into();
    }
    if let Some(max_payload) = args.max_payload {
        config.link.default_max_payload = max_payload;
    }
}

async fn open_transport(config: &DevlinkConfig) -> Result<IoStream> {
    match (&config.device, &config.connect) {
        (Some(device), connect) => {
            if connect.is_some() {
                warn!("Both a device and a bridge are configured, using device {:?}", device);
            }
            open_device(device, config.baud_rate)
                .await
                .with_context(|| format!("Failed to open device {:?}", device))
        }
        (None, Some(addr)) => connect_tcp(addr.as_str())
            .await
            .with_context(|| format!("Failed to connect to bridge {}", addr)),
        (None, None) => bail!("No transport configured; pass --device or --connect"),
    }
}

async fn run(link: &Link, command: Cmd) -> Result<()> {
    match command {
        Cmd::Ping => {
            let rtt = link.ping().await.context("Ping failed")?;
            println!("pong in {}", humantime::format_duration(round_to_micros(rtt)));
        }
        Cmd::Info => {
            let max_payload = link.info().await.context("Info failed")?;
            println!("max payload: {} bytes", max_payload);
        }
        Cmd::Ls { path, json } => {
            let entries = link
                .list(&path)
                .await
                .with_context(|| format!("Failed to list {}", path))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                for entry in &entries {
                    if entry.is_dir() {
                        println!("{:>12}  {}/", "-", entry.name);
                    } else {
                        println!("{:>12}  {}", entry.size, entry.name);
                    }
                }
            }
        }
        Cmd::Rm { path } => {
            link.delete(&path)
                .await
                .with_context(|| format!("Failed to delete {}", path))?;
        }
        Cmd::Mkdir { path } => {
            link.mkdir(&path)
                .await
                .with_context(|| format!("Failed to create {}", path))?;
        }
        Cmd::Put { local, remote } => put(link, &local, &remote).await?,
    }
    Ok(())
}

async fn put(link: &Link, local: &Path, remote: &str) -> Result<()> {
    let data = tokio::fs::read(local)
        .await
        .with_context(|| format!("Failed to read {:?}", local))?;

    if let Err(e) = link.info().await {
        warn!(
            "Info failed, uploading with max payload {}: {}",
            link.max_payload(),
            e
        );
    }

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after the current chunk");
            on_interrupt.cancel();
        }
    });

    let mut shown = 0;
    let result = link
        .upload(
            remote,
            &data,
            |progress: UploadProgress| {
                let tenths = (progress.fraction() * 10.0).floor() as u32;
                if tenths > shown {
                    shown = tenths;
                    eprintln!(
                        "{:>3}%  {} / {} bytes",
                        tenths * 10,
                        progress.confirmed_offset,
                        progress.total_len
                    );
                }
            },
            &cancel,
        )
        .await;
    watcher.abort();

    match result {
        Ok(report) => {
            println!(
                "uploaded {} bytes to {} in {} ({} chunks, {} retries)",
                report.bytes,
                remote,
                humantime::format_duration(round_to_millis(report.elapsed)),
                report.chunks,
                report.retries
            );
            Ok(())
        }
        Err(e) => {
            // Nothing reached the device, or nothing more can.
            if !matches!(
                e,
                LinkError::Config(_) | LinkError::Wire(_) | LinkError::Closed | LinkError::Transport(_)
            ) {
                link.remove_partial(remote).await;
            }
            Err(e).with_context(|| format!("Upload of {:?} to {} failed", local, remote))
        }
    }
}

fn round_to_millis(d: Duration) -> Duration {
    Duration::from_millis(d.as_millis() as u64)
}

fn round_to_micros(d: Duration) -> Duration {
    Duration::from_micros(d.as_micros() as u64)
}
