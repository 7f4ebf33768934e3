//! CLI entry point for instrument-bus
//!
//! Provides:
//! - `ports`: list serial ports on this machine
//! - `send`: one command to one device, printing the reply
//! - `poll`: load a configuration and poll every enabled device on an interval
//!
//! # Usage
//!
//! ```bash
//! instrument-bus send --endpoint /dev/ttyUSB0 --address 6 --protocol gen "MV?"
//! instrument-bus send --endpoint tcp://10.0.0.5:4001 --address 17 --protocol modbus-rtu "03 00 6B 00 03"
//! instrument-bus poll --config config/instrument_bus.toml --interval 2s
//! ```

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures::future::join_all;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};

use instrument_bus::config::{BusConfig, DeviceDefinition, LoggingConfig};
use instrument_bus::logging::init_logging;
use instrument_bus::{AsyncSession, Endpoint, ProtocolKind, Registry, SessionOptions};

#[derive(Parser)]
#[command(name = "instrument-bus")]
#[command(about = "Request/response access to serial and TCP lab instruments", long_about = None)]
struct Cli {
    /// Log level when no configuration file sets one
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List serial ports
    Ports,

    /// Send one command and print the reply
    Send {
        /// Endpoint: serial path, `tcp://host:port` or `host:port`
        #[arg(long)]
        endpoint: Endpoint,

        /// Device address on the link
        #[arg(long, default_value = "1")]
        address: u16,

        /// Framing policy
        #[arg(long, value_enum, default_value = "gen")]
        protocol: ProtocolKind,

        /// Enable checksums
        #[arg(long)]
        checksum: bool,

        /// Serial baud rate
        #[arg(long, default_value = "9600")]
        baud: u32,

        /// Read timeout ceiling, e.g. `500ms`
        #[arg(long, default_value = "500ms", value_parser = humantime::parse_duration)]
        read_timeout: Duration,

        /// Command text; hex bytes for Modbus-RTU
        command: String,
    },

    /// Poll every enabled device from a configuration file
    Poll {
        /// Configuration file (TOML)
        #[arg(long, default_value = instrument_bus::config::DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Time between poll cycles
        #[arg(long, default_value = "1s", value_parser = humantime::parse_duration)]
        interval: Duration,

        /// Stop after this many cycles
        #[arg(long)]
        count: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Ports => {
            init_logging(&LoggingConfig {
                level: cli.log_level,
                json: false,
            })?;
            list_ports()
        }
        Commands::Send {
            endpoint,
            address,
            protocol,
            checksum,
            baud,
            read_timeout,
            command,
        } => {
            init_logging(&LoggingConfig {
                level: cli.log_level,
                json: false,
            })?;
            let options = SessionOptions::default()
                .with_checksum(checksum)
                .with_baud_rate(baud)
                .with_read_timeout(read_timeout)
                .with_read_retries(0);
            send_once(endpoint, address, protocol, options, &command).await
        }
        Commands::Poll {
            config,
            interval,
            count,
        } => {
            let config = BusConfig::load_from(&config)
                .with_context(|| format!("loading {}", config.display()))?;
            init_logging(&config.logging)?;
            poll_loop(config, interval, count).await
        }
    }
}

#[cfg(feature = "serial")]
fn list_ports() -> Result<()> {
    let ports = serialport::available_ports().context("enumerating serial ports")?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        let detail = match port.port_type {
            serialport::SerialPortType::UsbPort(usb) => format!(
                "USB {:04x}:{:04x} {}",
                usb.vid,
                usb.pid,
                usb.product.unwrap_or_default()
            ),
            serialport::SerialPortType::PciPort => "PCI".to_string(),
            serialport::SerialPortType::BluetoothPort => "Bluetooth".to_string(),
            serialport::SerialPortType::Unknown => String::new(),
        };
        println!("{}\t{}", port.port_name, detail);
    }
    Ok(())
}

#[cfg(not(feature = "serial"))]
fn list_ports() -> Result<()> {
    bail!(instrument_bus::BusError::SerialFeatureDisabled)
}

/// Parse `03 00 6B 00 03` (spaces optional) into bytes.
fn parse_hex(text: &str) -> Result<Vec<u8>> {
    let digits: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    if digits.len() % 2 != 0 {
        bail!("odd number of hex digits in {text:?}");
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .with_context(|| format!("invalid hex byte {:?}", &digits[i..i + 2]))
        })
        .collect()
}

async fn send_once(
    endpoint: Endpoint,
    address: u16,
    protocol: ProtocolKind,
    options: SessionOptions,
    command: &str,
) -> Result<()> {
    let payload = match protocol {
        ProtocolKind::ModbusRtu => parse_hex(command)?,
        _ => command.as_bytes().to_vec(),
    };

    let registry = Arc::new(Registry::new());
    let framing = protocol.build(options.checksum);
    let mut session = AsyncSession::connect(registry, endpoint, address, framing, options).await;
    if !session.is_ready() {
        let cause = session
            .last_error()
            .map(ToString::to_string)
            .unwrap_or_else(|| "unknown".into());
        session.close().await;
        bail!("device did not initialise: {cause}");
    }
    if let Some(identity) = session.identity() {
        info!(identity, "Connected");
    }

    let ok = session.send_command(&payload).await;
    let result = if ok {
        match protocol {
            ProtocolKind::ModbusRtu => println!("{:02X?}", session.response()),
            _ => println!("{}", session.response_text()),
        }
        Ok(())
    } else {
        let cause = session
            .last_error()
            .map(ToString::to_string)
            .unwrap_or_else(|| "unknown".into());
        Err(anyhow::anyhow!("command failed: {cause}"))
    };
    session.close().await;
    result
}

struct PolledDevice {
    definition: DeviceDefinition,
    session: AsyncSession,
}

async fn poll_device(device: &mut PolledDevice) {
    let id = device.definition.id.as_str();
    if !device.session.poll().await {
        if let Some(err) = device.session.last_error() {
            warn!(device = id, error = %err, "Device not ready");
        }
        return;
    }
    let Some(command) = device.definition.poll_command.as_deref() else {
        return;
    };
    match device.session.query(command.as_bytes()).await {
        Some(reply) => println!("{id}\t{reply}"),
        None => warn!(
            device = id,
            error = %device.session.last_error().map(ToString::to_string).unwrap_or_default(),
            "Poll command failed"
        ),
    }
}

async fn poll_loop(config: BusConfig, interval: Duration, count: Option<u64>) -> Result<()> {
    let registry = Arc::new(Registry::new());
    let mut devices: Vec<PolledDevice> = config
        .enabled_devices()
        .map(|definition| {
            let options = definition.session_options(&config.defaults);
            let protocol = definition.protocol.build(options.checksum);
            PolledDevice {
                session: AsyncSession::new(
                    Arc::clone(&registry),
                    definition.endpoint.clone(),
                    definition.address,
                    protocol,
                    options,
                ),
                definition: definition.clone(),
            }
        })
        .collect();

    if devices.is_empty() {
        bail!("no enabled devices in configuration");
    }
    info!(devices = devices.len(), interval = ?interval, "Polling");

    let mut ticker = tokio::time::interval(interval);
    let mut cycles = 0u64;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }

        // Sessions on one endpoint serialise on its lock; separate endpoints run concurrently.
        join_all(devices.iter_mut().map(poll_device)).await;

        cycles += 1;
        if count.is_some_and(|limit| cycles >= limit) {
            break;
        }
    }

    for device in &mut devices {
        device.session.close().await;
    }
    Ok(())
}
