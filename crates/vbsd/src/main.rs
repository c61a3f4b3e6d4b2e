//! vbsd - Vehicle Bus Service Daemon
//!
//! Owns the shared CAN/J1708 transceiver and prints every bus event as a
//! JSON line on stdout until interrupted.
//!
//! # Usage
//!
//! Resume the buses enabled in the saved state:
//! ```bash
//! ./vbsd --config vbs.toml run
//! ```
//!
//! Listen on CAN, discovering the bitrate:
//! ```bash
//! ./vbsd can --bitrate 250000 --auto-detect --filter 0x18FEF100:0x1FFFFF00
//! ```
//!
//! Without a config file the mock transport is used.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use vbs_bus::{can_request_from_port, CanStartRequest, VbsConfig, VehicleBusService};
use vbs_core::{parse_can_id, HardwareFilter, DEFAULT_BITRATE};

#[derive(Parser, Debug)]
#[command(name = "vbsd")]
#[command(author, version, about = "Vehicle bus service daemon")]
struct Cli {
    /// Configuration file (TOML or YAML)
    #[arg(short, long, env = "VBS_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resume the buses enabled in the saved state
    Run,

    /// Start the CAN bus
    Can {
        /// Starting bitrate
        #[arg(short, long, default_value_t = DEFAULT_BITRATE)]
        bitrate: u32,

        /// Cycle candidate bitrates until traffic is seen
        #[arg(long)]
        auto_detect: bool,

        /// Trust the bitrate and start in normal mode
        #[arg(long)]
        skip_verify: bool,

        /// Acceptance filter as ID:MASK (extended), may be repeated
        #[arg(short, long, value_parser = parse_filter)]
        filter: Vec<HardwareFilter>,

        /// Take filters and settings from this configured port
        #[arg(long)]
        port: Option<String>,

        /// Load flow-control records from this configured port
        #[arg(long, value_name = "PORT")]
        flow_control: Option<String>,
    },

    /// Start the J1708 bus
    J1708,
}

fn parse_filter(s: &str) -> Result<HardwareFilter, String> {
    let (id, mask) = s
        .split_once(':')
        .ok_or_else(|| format!("expected ID:MASK, got '{}'", s))?;
    let id = parse_can_id(id).map_err(|e| e.to_string())?;
    let mask = parse_can_id(mask).map_err(|e| e.to_string())?;
    Ok(HardwareFilter::extended(id, mask))
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "vbsd=info,vbs_bus=debug".into());

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json().with_writer(std::io::stderr)).init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<VbsConfig> {
    match path {
        Some(path) => {
            info!("Loading config from: {}", path.display());
            VbsConfig::load(path).with_context(|| format!("loading {}", path.display()))
        }
        None => {
            info!("No config file provided, using mock transport");
            Ok(VbsConfig::default())
        }
    }
}

fn can_request(
    config: &VbsConfig,
    bitrate: u32,
    auto_detect: bool,
    skip_verify: bool,
    filter: Vec<HardwareFilter>,
    port: Option<&str>,
    flow_control: Option<&str>,
) -> Result<CanStartRequest> {
    let mut request = match port {
        Some(name) => {
            let port = config
                .port(name)
                .with_context(|| format!("no port named '{}' in config", name))?;
            can_request_from_port(port, false)?
        }
        None => CanStartRequest {
            bitrate,
            auto_detect,
            skip_verify,
            filters: filter.clone(),
            flow_controls: Vec::new(),
        },
    };

    // Explicit flags win over the port definition
    if port.is_some() {
        request.auto_detect |= auto_detect;
        request.skip_verify |= skip_verify;
        if !filter.is_empty() {
            request.filters = filter;
        }
    }

    if let Some(name) = flow_control {
        let port = config
            .port(name)
            .with_context(|| format!("no port named '{}' in config", name))?;
        request.flow_controls = port.flow_control_records()?;
        info!(port = %name, records = request.flow_controls.len(), "Using flow controls");
    }

    if request.filters.is_empty() {
        bail!("at least one --filter ID:MASK is required");
    }
    Ok(request)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.json_logs);

    info!("Starting vbsd (Vehicle Bus Service Daemon)");

    let config = load_config(cli.config.as_ref())?;
    let service = VehicleBusService::new(config.clone())?;
    let mut events = service.subscribe();

    match cli.command {
        Command::Run => service.start_from_state()?,
        Command::Can {
            bitrate,
            auto_detect,
            skip_verify,
            filter,
            port,
            flow_control,
        } => {
            let request = can_request(
                &config,
                bitrate,
                auto_detect,
                skip_verify,
                filter,
                port.as_deref(),
                flow_control.as_deref(),
            )?;
            service.start_can(request)?;
        }
        Command::J1708 => service.start_j1708()?,
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => println!("{}", serde_json::to_string(&event)?),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event output lagging"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    service.stop_all();
    Ok(())
}
