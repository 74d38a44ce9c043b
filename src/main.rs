//! echolog: segmented audio recorder supervising ffmpeg.
//!
//! Usage:
//!   echolog start --session <NAME> [OPTIONS]   Record until stopped
//!   echolog devices                            List capture sources
//!   echolog files                              List recorded sessions

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use echolog::audio::{parse_chunk_sequence, Codec};
use echolog::config::TEST_SEGMENT_SECS;
use echolog::device::pick_default;
use echolog::{
    Config, DeviceResolver, PulseDeviceResolver, SessionController, SessionSummary, StopReason,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, Level};

#[derive(Parser)]
#[command(
    name = "echolog",
    about = "Record system audio into timed segments with a durable session log",
    version
)]
struct Cli {
    /// Config file (TOML); defaults to ~/.config/echolog/config.toml if present
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start recording; runs until Ctrl+C, SIGTERM or the time limit
    Start(StartArgs),

    /// List available capture sources
    Devices,

    /// List recorded sessions and their chunks
    Files {
        /// Output directory (defaults to the configured one)
        #[arg(short, long)]
        output_dir: Option<String>,
    },
}

#[derive(clap::Args)]
struct StartArgs {
    /// Session name
    #[arg(short, long)]
    session: String,

    /// Root output directory
    #[arg(short, long)]
    output_dir: Option<String>,

    /// Segment length in seconds
    #[arg(long)]
    segment_duration: Option<u64>,

    /// Stop after this long: 90, 45m, 1h30m
    #[arg(short, long)]
    time_limit: Option<String>,

    /// immediate or end_segment
    #[arg(long)]
    boundary: Option<String>,

    /// Capture source, or `auto`
    #[arg(short, long)]
    device: Option<String>,

    /// flac, mp3, opus or wav
    #[arg(long)]
    format: Option<String>,

    #[arg(long)]
    log_level: Option<String>,

    /// size, time or off
    #[arg(long)]
    log_rotation: Option<String>,

    #[arg(long)]
    log_max_bytes: Option<u64>,

    #[arg(long)]
    log_backup_count: Option<u32>,

    /// Short 60 second segments for trying things out
    #[arg(long)]
    test: bool,

    /// Print the summary as JSON
    #[arg(long)]
    json: bool,
}

impl StartArgs {
    /// CLI flags as `section.key=value` config overrides
    fn overrides(&self) -> Vec<(String, String)> {
        let segment_duration = if self.test {
            Some(TEST_SEGMENT_SECS)
        } else {
            self.segment_duration
        };

        let pairs = [
            ("recording.output_dir", self.output_dir.clone()),
            ("recording.segment_duration", segment_duration.map(|s| s.to_string())),
            ("recording.format", self.format.clone()),
            ("audio.device", self.device.clone()),
            ("limits.time_limit", self.time_limit.clone()),
            ("limits.boundary", self.boundary.clone()),
            ("logging.level", self.log_level.clone()),
            ("logging.rotation", self.log_rotation.clone()),
            ("logging.max_bytes", self.log_max_bytes.map(|b| b.to_string())),
            ("logging.backup_count", self.log_backup_count.map(|n| n.to_string())),
        ];

        pairs
            .into_iter()
            .filter_map(|(key, value)| value.map(|v| (key.to_string(), v)))
            .collect()
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::INFO })
        .init();

    match cli.command {
        Commands::Start(args) => start(cli.config.as_deref(), args).await,
        Commands::Devices => devices().await,
        Commands::Files { output_dir } => files(cli.config.as_deref(), output_dir),
    }
}

async fn start(config_path: Option<&Path>, args: StartArgs) -> Result<ExitCode> {
    let overrides = args.overrides();
    let cfg = Config::load_with_overrides(config_path, &overrides)?;
    let session_config = cfg
        .to_session_config(&args.session, &overrides)
        .context("invalid recording configuration")?;

    let controller = SessionController::new(Arc::new(PulseDeviceResolver));
    let handle = controller.start(session_config).await?;

    info!("Recording {} into {}", handle.session_id(), handle.session_dir().display());
    if let Some(log) = handle.log_path() {
        info!("Session log: {}", log.display());
    }
    info!("Press Ctrl+C to stop recording...");

    let summary = tokio::select! {
        summary = handle.wait() => summary,
        _ = shutdown_signal() => {
            info!("Stopping...");
            handle.stop(StopReason::Signal).await
        }
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }

    Ok(if summary.reason.is_error() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

/// Ctrl+C, or SIGTERM on unix
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn print_summary(summary: &SessionSummary) {
    println!();
    println!("Session {} ({:?})", summary.session_id, summary.final_state);
    println!("  Reason:   {}", summary.reason);
    println!("  Duration: {:.1}s", summary.duration_secs);
    println!("  Chunks:   {}", summary.chunk_count());
    for chunk in &summary.chunks {
        println!(
            "    {:>3}  {}  {:.2} MB",
            chunk.sequence,
            chunk.file_name(),
            chunk.size_bytes.unwrap_or(0) as f64 / 1_048_576.0
        );
    }
    println!("  Total:    {:.2} MB", summary.total_bytes as f64 / 1_048_576.0);
    if let Some(exit) = summary.exit {
        println!("  Encoder:  {exit}");
    }
    if let Some(log) = &summary.log_path {
        println!("  Log:      {}", log.display());
    }
}

async fn devices() -> Result<ExitCode> {
    let devices = PulseDeviceResolver.list().await?;
    if devices.is_empty() {
        println!("No capture sources found");
        return Ok(ExitCode::FAILURE);
    }

    let default = pick_default(&devices).map(|d| d.name.clone());
    for device in &devices {
        let marker = if Some(&device.name) == default.as_ref() { "*" } else { " " };
        println!("{marker} {:<4} {:<60} {}", device.id, device.name, device.status);
    }
    println!();
    println!("* = used by --device auto");
    Ok(ExitCode::SUCCESS)
}

fn files(config_path: Option<&Path>, output_dir: Option<String>) -> Result<ExitCode> {
    let overrides: Vec<(String, String)> = output_dir
        .map(|dir| vec![("recording.output_dir".to_string(), dir)])
        .unwrap_or_default();
    let cfg = Config::load_with_overrides(config_path, &overrides)?;
    let root = cfg.output_dir();
    let codec: Codec = cfg.recording.format.parse()?;

    let mut sessions: Vec<PathBuf> = match std::fs::read_dir(&root) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            println!("No recordings in {}", root.display());
            return Ok(ExitCode::SUCCESS);
        }
        Err(e) => return Err(e).with_context(|| format!("cannot read {}", root.display())),
    };
    sessions.sort();

    for dir in sessions {
        let Some(session_id) = dir.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        let mut chunks: Vec<(u32, String, u64)> = std::fs::read_dir(&dir)?
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().into_owned();
                let seq = parse_chunk_sequence(&name, &session_id, codec)?;
                let size = e.metadata().map(|m| m.len()).unwrap_or(0);
                Some((seq, name, size))
            })
            .collect();
        chunks.sort_by_key(|(seq, _, _)| *seq);

        println!("{session_id}");
        for (_, name, size) in &chunks {
            println!("  {name}  {:.2} MB", *size as f64 / 1_048_576.0);
        }
        if chunks.is_empty() {
            println!("  (no {codec} chunks)");
        }
    }

    Ok(ExitCode::SUCCESS)
}
