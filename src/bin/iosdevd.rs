//! iosdev daemon - device watcher and relay server
//!
//! This binary watches attached devices and serves device lists, port
//! forwards, syslog streams and app installs to `iosdev` clients.
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon (foreground)
//! iosdevd start
//!
//! # Start the daemon (background/daemonized)
//! iosdevd start -d
//!
//! # Serve simulated devices described in a TOML file
//! iosdevd start --simulate devices.toml
//!
//! # Stop the daemon
//! iosdevd stop
//!
//! # Check daemon status
//! iosdevd status
//!
//! # Custom socket path and debug logging
//! IOSDEV_SOCKET=/run/iosdev.sock RUST_LOG=iosdevd=debug iosdevd start
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

use iosdevd::backend::sim::{SimBackend, SimConfig};
use iosdevd::backend::DeviceBackend;
use iosdevd::server::DaemonServer;
use iosdevd::{DaemonConfig, DeviceWatcher};

/// iosdev daemon - iOS device watcher
#[derive(Parser, Debug)]
#[command(name = "iosdevd", version, about)]
struct Args {
    /// Config file (defaults to the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Socket path, overriding config and IOSDEV_SOCKET
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Start the daemon
    Start {
        /// Run as a background daemon (fork to background)
        #[arg(short = 'd', long)]
        daemon: bool,

        /// Serve simulated devices from a TOML description
        #[arg(long, value_name = "FILE")]
        simulate: Option<PathBuf>,
    },
    /// Stop the running daemon
    Stop,
    /// Show daemon status
    Status,
}

fn state_dir() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("iosdev")
}

fn pid_file_path() -> PathBuf {
    state_dir().join("iosdevd.pid")
}

fn log_file_path() -> PathBuf {
    state_dir().join("iosdevd.log")
}

fn read_pid() -> Option<u32> {
    let mut file = File::open(pid_file_path()).ok()?;
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
    let Ok(pid) = i32::try_from(pid) else {
        bail!("Invalid PID {pid}");
    };
    let result = unsafe { libc::kill(pid, libc::SIGTERM) };
    if result != 0 {
        bail!("Failed to send SIGTERM to process {pid}");
    }
    Ok(())
}

fn load_config(args: &Args, simulate: Option<PathBuf>) -> Result<DaemonConfig> {
    let mut config = DaemonConfig::load(args.config.as_deref()).context("Failed to load config")?;
    if let Some(socket) = &args.socket {
        config.socket_path = socket.clone();
    }
    if simulate.is_some() {
        config.simulate = simulate;
    }
    Ok(config)
}

fn main() -> Result<()> {
    let args = Args::parse();

    let command = args.command.clone().unwrap_or(Command::Start {
        daemon: false,
        simulate: None,
    });

    match command {
        Command::Start { daemon, simulate } => {
            if let Some(pid) = is_daemon_running() {
                eprintln!("Daemon is already running (PID {pid})");
                eprintln!("Use 'iosdevd stop' to stop it first.");
                process::exit(1);
            }

            let config = load_config(&args, simulate)?;

            if daemon {
                daemonize()?;
            }

            write_pid()?;
            let result = run_daemon(config);
            remove_pid_file();
            result
        }
        Command::Stop => {
            if let Some(pid) = is_daemon_running() {
                println!("Stopping daemon (PID {pid})...");
                stop_daemon(pid)?;

                for _ in 0..50 {
                    if !is_process_running(pid) {
                        println!("Daemon stopped.");
                        return Ok(());
                    }
                    std::thread::sleep(std::time::Duration::from_millis(100));
                }

                eprintln!("Daemon did not stop within 5 seconds.");
                process::exit(1);
            } else {
                println!("Daemon is not running.");
                Ok(())
            }
        }
        Command::Status => {
            if let Some(pid) = is_daemon_running() {
                println!("Daemon is running (PID {pid})");
                let config = load_config(&args, None)?;
                if config.socket_path.exists() {
                    println!("Socket: {}", config.socket_path.display());
                }
                Ok(())
            } else {
                println!("Daemon is not running.");
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

    Daemonize::new()
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr)
        .start()
        .context("Failed to daemonize")?;

    Ok(())
}

fn backend(simulate: Option<&Path>) -> Result<Arc<dyn DeviceBackend>> {
    match simulate {
        Some(path) => {
            let sim = SimConfig::load(path).context("Failed to load simulated devices")?;
            info!(path = %path.display(), devices = sim.devices.len(), "Using simulated devices");
            Ok(Arc::new(SimBackend::from_config(sim)))
        }
        None => {
            warn!("No device library linked; serving an empty simulated backend");
            Ok(Arc::new(SimBackend::from_config(SimConfig::default())))
        }
    }
}

#[tokio::main]
async fn run_daemon(config: DaemonConfig) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("iosdevd=info".parse()?)
                .add_directive("iosdev_core=info".parse()?)
                .add_directive("iosdev_protocol=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        "iosdev daemon starting"
    );

    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let backend = backend(config.simulate.as_deref())?;
    let watcher_config = config.watcher;
    let watcher = tokio::task::block_in_place(|| DeviceWatcher::start(backend, watcher_config))
        .context("Failed to start device watcher")?;
    let watcher = Arc::new(watcher);
    info!(devices = watcher.list().len(), "Device watcher started");

    let server = DaemonServer::new(&config.socket_path, Arc::clone(&watcher), cancel_token);
    info!(socket = %config.socket_path.display(), "Starting server");

    let result = server.run().await;
    watcher.shutdown();

    if let Err(e) = result {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("iosdev daemon stopped");
    Ok(())
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
