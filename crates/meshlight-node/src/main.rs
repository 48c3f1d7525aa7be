//! Meshlight - command-line controller for BLE mesh lighting gateways
//!
//! Connects to one gateway, issues a single command to a sub-device and
//! reports the outcome, or streams controller events until Ctrl-C.

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use uuid::Uuid;

use meshlight_ble::{BleTransport, CommandHandle, MeshConfig, MeshController};
use meshlight_protocol::parse_hex;

#[derive(Parser, Debug)]
#[command(name = "meshlight")]
#[command(about = "Control BLE mesh lights through their gateway")]
struct Args {
    /// Gateway BLE address or advertised name
    #[arg(long, short)]
    device: Option<String>,

    /// JSON configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Vendor GATT service UUID
    #[arg(long)]
    service_uuid: Option<Uuid>,

    /// Write characteristic UUID
    #[arg(long)]
    write_char: Option<Uuid>,

    /// Notify characteristic UUID
    #[arg(long)]
    notify_char: Option<Uuid>,

    /// Enable verbose logging
    #[arg(long, short)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// List nearby BLE peripherals
    Scan {
        /// How long to scan
        #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
        duration: Duration,
    },
    /// Switch a sub-device on or off
    Power {
        /// Sub-device address (0 = all)
        address: u8,
        /// Requested state
        state: PowerState,
    },
    /// Set a sub-device's brightness
    Brightness {
        /// Sub-device address (0 = all)
        address: u8,
        /// Level 0-255
        #[arg(value_parser = clap::value_parser!(i32).range(0..=255))]
        level: i32,
    },
    /// Ask a sub-device for its state
    Query {
        /// Sub-device address
        address: u8,
    },
    /// Write raw hex bytes to the gateway
    Raw {
        /// Frame bytes, e.g. "02 03 b4 b9"
        hex: String,
    },
    /// Print controller events until Ctrl-C
    Watch,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum PowerState {
    On,
    Off,
}

impl From<PowerState> for bool {
    fn from(state: PowerState) -> Self {
        state == PowerState::On
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();

    // Initialize logging; RUST_LOG wins over --verbose
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = load_config(&args)?;

    let ok = match args.command {
        Command::Scan { duration } => scan(duration).await?,
        command => execute(config, command).await?,
    };

    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

/// Load the configuration file, then apply command-line overrides
fn load_config(args: &Args) -> anyhow::Result<MeshConfig> {
    let mut config = match &args.config {
        Some(path) => MeshConfig::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => MeshConfig::default(),
    };

    if let Some(device) = &args.device {
        config.device.address = device.clone();
    }
    if let Some(uuid) = args.service_uuid {
        config.device.service_uuid = uuid;
    }
    if let Some(uuid) = args.write_char {
        config.device.write_char_uuid = uuid;
    }
    if let Some(uuid) = args.notify_char {
        config.device.notify_char_uuid = uuid;
    }

    config.validate()?;
    Ok(config)
}

#[cfg(feature = "ble")]
async fn scan(duration: Duration) -> anyhow::Result<bool> {
    info!("Scanning for {}", humantime::format_duration(duration));
    let devices = meshlight_ble::scan(duration).await?;
    for device in &devices {
        let rssi = device
            .rssi
            .map(|r| format!("{} dBm", r))
            .unwrap_or_else(|| "-".to_string());
        println!("{}  {:<24}  {}", device.address, device.name, rssi);
    }
    info!("Found {} devices", devices.len());
    Ok(true)
}

#[cfg(not(feature = "ble"))]
async fn scan(_duration: Duration) -> anyhow::Result<bool> {
    anyhow::bail!("built without BLE support; rebuild with --features ble")
}

#[cfg(feature = "ble")]
async fn execute(config: MeshConfig, command: Command) -> anyhow::Result<bool> {
    let transport = meshlight_ble::BtleplugTransport::new(config.device.clone())?;
    run(transport, &config, command).await
}

#[cfg(not(feature = "ble"))]
async fn execute(_config: MeshConfig, _command: Command) -> anyhow::Result<bool> {
    anyhow::bail!("built without BLE support; rebuild with --features ble")
}

/// Connect, run one command, and shut the controller down
#[cfg_attr(not(feature = "ble"), allow(dead_code))]
async fn run<T: BleTransport>(
    transport: T,
    config: &MeshConfig,
    command: Command,
) -> anyhow::Result<bool> {
    let (controller, handle) = MeshController::new(transport, config)?;
    let task = tokio::spawn(controller.run());

    handle
        .connect()
        .await
        .with_context(|| format!("connecting to {}", config.device.address))?;

    let ok = match command {
        Command::Power { address, state } => {
            report(handle.set_power(address, state.into()).await?).await
        }
        Command::Brightness { address, level } => {
            report(handle.set_brightness(address, level).await?).await
        }
        Command::Query { address } => {
            let ok = report(handle.query_state(address).await?).await;
            if let Some(device) = handle.sub_device(address).await? {
                println!("{}", serde_json::to_string_pretty(&device)?);
            }
            ok
        }
        Command::Raw { hex } => {
            let bytes = parse_hex(&hex)?;
            let len = bytes.len();
            handle.write_raw(bytes).await?;
            println!("wrote {} bytes", len);
            true
        }
        Command::Watch => {
            let mut events = handle.subscribe();
            info!("Watching events, Ctrl-C to stop");
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = events.recv() => match event {
                        Ok(event) => println!("{}", serde_json::to_string(&event)?),
                        Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event stream lagged"),
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            true
        }
        Command::Scan { .. } => anyhow::bail!("scan does not use a gateway connection"),
    };

    handle.shutdown().await?;
    task.await??;
    Ok(ok)
}

/// Wait for a command's outcome and print it
#[cfg_attr(not(feature = "ble"), allow(dead_code))]
async fn report(command: CommandHandle) -> bool {
    let tag = command.tag();
    let address = command.address();
    let outcome = command.outcome().await;
    println!("command {} to {}: {}", tag, address, outcome);
    outcome.is_success()
}
