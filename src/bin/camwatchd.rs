//! camwatch worker daemon
//!
//! Runs the stream registry behind the HTTP control surface until SIGTERM
//! or SIGINT, then stops every stream and drains the server.
//!
//! # Usage
//!
//! ```bash
//! # Start the worker (foreground)
//! camwatchd start
//!
//! # Start the worker (background) with a config file
//! camwatchd start -d --config /etc/camwatch/camwatch.toml
//!
//! # Stop the worker
//! camwatchd stop
//!
//! # Check worker status
//! camwatchd status
//! ```

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use camwatchd::alert::AlertDispatcher;
use camwatchd::capture::FfmpegCaptureSource;
use camwatchd::detector::HttpDetector;
use camwatchd::snapshot::FfmpegSnapshotStore;
use camwatchd::{server, Config, FrameProcessor, StreamRegistry};

/// camwatch worker - concurrent camera stream sessions
#[derive(Parser, Debug)]
#[command(name = "camwatchd", version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the worker
    Start {
        /// Run as a background daemon (fork to background)
        #[arg(short = 'd', long)]
        daemon: bool,

        /// Config file (defaults to ./camwatch.toml if present)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Stop the running worker
    Stop,
    /// Show worker status
    Status {
        /// Config file used to report the listen address
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn state_dir() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("camwatch")
}

fn pid_file_path() -> PathBuf {
    state_dir().join("camwatchd.pid")
}

fn log_file_path() -> PathBuf {
    state_dir().join("camwatchd.log")
}

fn read_pid() -> Option<u32> {
    let path = pid_file_path();
    let mut file = File::open(&path).ok()?;
    let mut contents = String::new();
    file.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

fn write_pid() -> Result<()> {
    let path = pid_file_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create state directory")?;
    }
    let mut file = File::create(&path).context("Failed to create PID file")?;
    write!(file, "{}", process::id()).context("Failed to write PID")?;
    Ok(())
}

fn remove_pid_file() {
    let _ = fs::remove_file(pid_file_path());
}

fn is_process_running(pid: u32) -> bool {
    PathBuf::from(format!("/proc/{pid}")).exists()
}

fn is_daemon_running() -> Option<u32> {
    if let Some(pid) = read_pid() {
        if is_process_running(pid) {
            return Some(pid);
        }
        remove_pid_file();
    }
    None
}

fn stop_daemon(pid: u32) -> Result<()> {
    let pid = libc::pid_t::try_from(pid).context("PID out of range")?;
    // SAFETY: kill(2) has no memory-safety preconditions.
    let result = unsafe { libc::kill(pid, libc::SIGTERM) };
    if result != 0 {
        bail!("Failed to send SIGTERM to process {pid}");
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    let command = args.command.unwrap_or(Command::Start {
        daemon: false,
        config: None,
    });

    match command {
        Command::Start { daemon, config } => {
            if let Some(pid) = is_daemon_running() {
                eprintln!("Worker is already running (PID {pid})");
                eprintln!("Use 'camwatchd stop' to stop it first.");
                process::exit(1);
            }

            // Load before daemonizing so config errors reach the terminal.
            let (config, sources) = Config::load(config.as_deref()).context("Failed to load configuration")?;

            if daemon {
                daemonize()?;
            }

            write_pid()?;

            let result = run_daemon(config, sources.file, sources.env_overrides);

            remove_pid_file();

            result
        }
        Command::Stop => {
            if let Some(pid) = is_daemon_running() {
                println!("Stopping worker (PID {pid})...");
                stop_daemon(pid)?;

                for _ in 0..50 {
                    if !is_process_running(pid) {
                        println!("Worker stopped.");
                        return Ok(());
                    }
                    std::thread::sleep(std::time::Duration::from_millis(100));
                }

                eprintln!("Worker did not stop within 5 seconds.");
                process::exit(1);
            } else {
                println!("Worker is not running.");
                Ok(())
            }
        }
        Command::Status { config } => {
            if let Some(pid) = is_daemon_running() {
                println!("Worker is running (PID {pid})");

                if let Ok((config, _)) = Config::load(config.as_deref()) {
                    println!("Health: http://{}/health", config.bind_addr());
                }
                println!("Log: {}", log_file_path().display());

                Ok(())
            } else {
                println!("Worker is not running.");
                process::exit(1);
            }
        }
    }
}

fn daemonize() -> Result<()> {
    use daemonize::Daemonize;

    let log_path = log_file_path();

    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }

    let stdout = File::create(&log_path).context("Failed to create log file for stdout")?;
    let stderr = stdout
        .try_clone()
        .context("Failed to create log file for stderr")?;

    // Relative storage and config paths stay relative to the launch directory.
    let cwd = std::env::current_dir().context("Failed to read working directory")?;

    Daemonize::new()
        .working_directory(cwd)
        .stdout(stdout)
        .stderr(stderr)
        .start()
        .context("Failed to daemonize")?;

    Ok(())
}

#[tokio::main]
async fn run_daemon(config: Config, config_file: Option<PathBuf>, env_overrides: Vec<String>) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("camwatchd=info".parse()?)
                .add_directive("camwatch_core=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        config_file = ?config_file,
        env_overrides = ?env_overrides,
        backend_url = %config.backend_url,
        port = config.port,
        max_streams = config.max_streams,
        "camwatch worker starting"
    );

    fs::create_dir_all(&config.storage_path).with_context(|| {
        format!(
            "Failed to create storage directory {}",
            config.storage_path.display()
        )
    })?;

    let registry = build_registry(&config)?;

    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let listener = server::bind(&config.bind_addr()).await?;
    let router = server::router(registry.clone(), &config.storage_path);
    let mut server_task = tokio::spawn(server::serve(listener, router, cancel_token.clone()));

    tokio::select! {
        _ = cancel_token.cancelled() => {}
        result = &mut server_task => {
            // The server only returns on its own if it failed.
            registry.shutdown_all(config.shutdown_grace()).await;
            return match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.into()),
                Err(e) => Err(anyhow::anyhow!("server task failed: {e}")),
            };
        }
    }

    info!("Shutting down worker");
    registry.shutdown_all(config.shutdown_grace()).await;

    match tokio::time::timeout(config.shutdown_grace(), server_task).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => error!(error = %e, "Server error during shutdown"),
        Ok(Err(e)) => error!(error = %e, "Server task failed"),
        Err(_) => warn!("Server did not drain within the shutdown grace, forcing exit"),
    }

    info!("camwatch worker stopped");
    Ok(())
}

fn build_registry(config: &Config) -> Result<StreamRegistry> {
    let detector = HttpDetector::new(config.detector_url.clone(), config.detector_timeout())
        .context("Failed to create detector client")?;
    let alerts = AlertDispatcher::new(&config.backend_url, config.alert_timeout())
        .context("Failed to create alert client")?;
    let snapshots = FfmpegSnapshotStore::new(
        config.ffmpeg_path.clone(),
        config.storage_path.clone(),
        config.snapshot_timeout(),
    );
    let capture = FfmpegCaptureSource::new(
        config.ffmpeg_path.clone(),
        config.frame_width,
        config.frame_height,
        config.capture_read_timeout(),
    );

    let processor = FrameProcessor::new(Arc::new(detector), Arc::new(snapshots), Arc::new(alerts))
        .with_throttle(config.alert_throttle());

    info!(
        snapshots = %storage_display(&config.storage_path),
        publishing = config.publish_enabled,
        "Stream registry ready"
    );

    Ok(StreamRegistry::new(
        config.registry_config(),
        Arc::new(capture),
        Arc::new(processor),
    ))
}

fn storage_display(path: &Path) -> String {
    fs::canonicalize(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .display()
        .to_string()
}

async fn wait_for_shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT");
        }
    }

    Ok(())
}
