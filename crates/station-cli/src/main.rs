//! diag-station - command-line front end for the test station diagnostics
//!
//! Loads the station configuration, opens the CAN bus and runs one
//! diagnostic procedure or a battery voltage stream against the ECU.

mod commands;
mod config;
mod output;
mod sink;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use station_uds::procedures::Settings;
use station_uds::{transport, Bus, CancellationToken, SessionType};
use tracing::{debug, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::commands::Station;
use crate::config::{BackendArg, Overrides};
use crate::output::{OutputContext, OutputFormat};

#[derive(Parser)]
#[command(name = "diag-station")]
#[command(author, version, about = "UDS diagnostics over CAN for the vehicle test station")]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, env = "DIAG_STATION_CONFIG")]
    config: Option<PathBuf>,

    /// CAN channel (e.g. can0, vcan0, virtual)
    #[arg(long, global = true, env = "DIAG_STATION_CHANNEL")]
    channel: Option<String>,

    /// CAN bitrate in bit/s
    #[arg(long, global = true, env = "DIAG_STATION_BITRATE")]
    bitrate: Option<u32>,

    /// CAN backend
    #[arg(long, global = true, value_enum, env = "DIAG_STATION_BACKEND")]
    backend: Option<BackendArg>,

    /// Output format
    #[arg(short, long, global = true, value_enum, default_value = "text", env = "DIAG_STATION_OUTPUT")]
    output: OutputFormat,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    /// Minimal output (for scripting)
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Verbose logging (frame traces)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read the VIN (extended session, then DID 0xF190)
    Vin,

    /// Read the battery voltage once (DID 0xE142)
    Voltage,

    /// Stream the battery voltage until Ctrl+C
    Monitor {
        /// Stop after this many samples
        #[arg(long)]
        count: Option<u64>,
    },

    /// Probe every configured ECU with TesterPresent
    EcuCheck {
        /// Per-ECU response timeout, overriding the configured value
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Change diagnostic session
    Session {
        /// Session type: default, programming, extended
        #[arg(value_name = "TYPE")]
        session_type: SessionType,
    },

    /// Send TesterPresent to the configured ECU
    TesterPresent,

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();

    let out = OutputContext::new(cli.output, cli.no_color, cli.quiet);

    match run(cli, &out).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            out.error(&format!("Error: {:#}", e));
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, out: &OutputContext) -> Result<()> {
    let overrides = Overrides {
        channel: cli.channel.clone(),
        bitrate: cli.bitrate,
        backend: cli.backend,
    };
    let (config, source) = config::load(cli.config.as_deref(), &overrides)?;

    if let Commands::Config = cli.command {
        return commands::show_config(&config, source.as_deref(), out);
    }

    let settings = Settings::from_config(&config).context("Invalid station configuration")?;
    let adapter = transport::open(&config.can)
        .await
        .with_context(|| format!("Failed to open CAN channel {}", config.can.channel))?;
    let bus = Bus::new(adapter);
    debug!(bus = bus.label(), "Bus opened");

    let cancel = CancellationToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || handler_token.cancel()).context("Failed to install Ctrl+C handler")?;

    let station = Station {
        bus,
        settings,
        config,
        cancel,
    };

    let result = match cli.command {
        Commands::Vin => commands::vin(&station, out).await,
        Commands::Voltage => commands::voltage(&station, out).await,
        Commands::Monitor { count } => commands::monitor(&station, count, out).await,
        Commands::EcuCheck { timeout_ms } => commands::ecu_check(&station, timeout_ms, out).await,
        Commands::Session { session_type } => commands::session(&station, session_type, out).await,
        Commands::TesterPresent => commands::tester_present(&station, out).await,
        Commands::Config => Ok(()),
    };

    if let Err(e) = station.bus.close().await {
        warn!(error = %e, "Failed to close bus");
    }
    result
}
