//! iosdev - command-line client for the iosdev daemon
//!
//! # Usage
//!
//! ```text
//! iosdev list [--json]          # Attached devices
//! iosdev watch                  # Print the device list on every change
//! iosdev forward <udid> <port>  # Stream lines from a device port
//! iosdev syslog <udid>          # Stream the device log
//! iosdev install <udid> <app>   # Install an app bundle
//! ```

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use iosdev_core::{DeviceId, DeviceView};
use iosdev_protocol::{ClientMessage, DaemonMessage};
use iosdevd::client::{ClientConfig, DaemonClient};
use iosdevd::DaemonConfig;

// ============================================================================
// CLI Arguments
// ============================================================================

/// iosdev - watch devices, forward ports and stream device logs
#[derive(Parser, Debug)]
#[command(name = "iosdev", version, about)]
struct Args {
    /// Daemon socket path (defaults to config, then IOSDEV_SOCKET)
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List attached devices
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Print the device list whenever it changes
    Watch,
    /// Relay lines from a TCP port on the device
    Forward { udid: String, port: u16 },
    /// Stream the device log
    Syslog { udid: String },
    /// Install an app bundle on the device
    Install { udid: String, app: PathBuf },
}

// ============================================================================
// Output
// ============================================================================

fn print_table(devices: &[DeviceView]) {
    if devices.is_empty() {
        println!("No devices attached.");
        return;
    }

    println!(
        "{:<42} {:<24} {:<10} {:<12} INTERFACES",
        "UDID", "NAME", "VERSION", "MODEL"
    );
    for device in devices {
        let interfaces: Vec<&str> = device.interfaces.iter().map(|t| t.label()).collect();
        println!(
            "{:<42} {:<24} {:<10} {:<12} {}",
            device.udid,
            device.properties.name,
            device.properties.product_version,
            device.properties.product_type,
            interfaces.join(", ")
        );
    }
}

// ============================================================================
// Commands
// ============================================================================

async fn list(client: &mut DaemonClient, json: bool) -> Result<()> {
    let devices = match client.request(&ClientMessage::list_devices()).await? {
        DaemonMessage::DeviceList { devices } => devices,
        other => bail!("Unexpected reply to list: {other:?}"),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
    } else {
        print_table(&devices);
    }
    Ok(())
}

async fn watch(client: &mut DaemonClient) -> Result<()> {
    client.expect_ok(&ClientMessage::watch()).await?;

    loop {
        let message = tokio::select! {
            message = client.recv() => message?,
            _ = tokio::signal::ctrl_c() => {
                client.expect_ok(&ClientMessage::unwatch()).await?;
                return Ok(());
            }
        };

        match message {
            Some(DaemonMessage::DevicesChanged { devices }) => {
                print_table(&devices);
                println!();
            }
            Some(other) => debug!(message = ?other, "Ignoring message"),
            None => bail!("Daemon closed the connection"),
        }
    }
}

/// Prints relay lines until the stream ends or Ctrl-C.
async fn stream(client: &mut DaemonClient, start: ClientMessage, stop: ClientMessage) -> Result<()> {
    client.expect_ok(&start).await?;

    loop {
        let message = tokio::select! {
            message = client.recv() => message?,
            _ = tokio::signal::ctrl_c() => {
                client.expect_ok(&stop).await?;
                return Ok(());
            }
        };

        match message {
            Some(DaemonMessage::RelayData { line, .. }) => println!("{line}"),
            Some(DaemonMessage::RelayEnd { .. }) => return Ok(()),
            Some(other) => debug!(message = ?other, "Ignoring message"),
            None => bail!("Daemon closed the connection"),
        }
    }
}

async fn install(client: &mut DaemonClient, udid: DeviceId, app: PathBuf) -> Result<()> {
    let app = app
        .canonicalize()
        .with_context(|| format!("App bundle not found: {}", app.display()))?;
    client
        .expect_ok(&ClientMessage::install(udid.clone(), app.clone()))
        .await?;
    println!("Installed {} on {udid}", app.display());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("iosdev=warn".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let socket_path = match args.socket {
        Some(socket) => socket,
        None => {
            DaemonConfig::load(None)
                .context("Failed to load config")?
                .socket_path
        }
    };
    let config = ClientConfig {
        socket_path,
        client_id: Some("iosdev-cli".to_string()),
        ..Default::default()
    };

    let mut client = DaemonClient::connect(&config)
        .await
        .context("Is the daemon running? Start it with 'iosdevd start'")?;

    let result = match args.command {
        Command::List { json } => list(&mut client, json).await,
        Command::Watch => watch(&mut client).await,
        Command::Forward { udid, port } => {
            let udid = DeviceId::new(udid);
            stream(
                &mut client,
                ClientMessage::start_forward(udid.clone(), port),
                ClientMessage::stop_forward(udid, port),
            )
            .await
        }
        Command::Syslog { udid } => {
            let udid = DeviceId::new(udid);
            stream(
                &mut client,
                ClientMessage::start_syslog(udid.clone()),
                ClientMessage::stop_syslog(udid),
            )
            .await
        }
        Command::Install { udid, app } => install(&mut client, DeviceId::new(udid), app).await,
    };

    if let Err(e) = client.disconnect().await {
        debug!(error = %e, "Disconnect failed");
    }

    result
}
