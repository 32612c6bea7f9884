//! # hwbroker Binary
//!
//! Loads `broker.toml`, resolves the board catalog, binds the client
//! socket and serves until SIGINT/SIGTERM.
//!
//! # Usage
//!
//! ```bash
//! # Defaults (/etc/hwbroker/broker.toml, board discovered by model)
//! hwbroker
//!
//! # Explicit board descriptor and socket
//! hwbroker --board /etc/hwbroker/boards/rpi3.toml --socket /tmp/hwbroker.sock
//!
//! # Verbose JSON logs
//! hwbroker -v --json
//! ```

use clap::Parser;
use hwbroker::service;
use hwbroker_common::catalog::BoardCatalog;
use hwbroker_common::config::BrokerConfig;
use hwbroker_common::consts::DEFAULT_CONFIG_PATH;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tokio::net::UnixListener;
use tracing::{Level, error, info, warn};
use tracing_subscriber::EnvFilter;

/// hwbroker - exclusive hardware I/O access for unprivileged clients
#[derive(Parser, Debug)]
#[command(name = "hwbroker")]
#[command(author = "RTS007")]
#[command(version)]
#[command(about = "Privileged broker for board GPIO/I2C/PWM/ADC/UART/SPI access")]
#[command(long_about = None)]
struct Args {
    /// Path to broker configuration (broker.toml). Missing file means defaults.
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override the listening socket path
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Board descriptor to load instead of model discovery
    #[arg(short, long)]
    board: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format
    #[arg(long)]
    json: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    if let Err(e) = run().await {
        error!("Broker startup failed: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => {
            setup_tracing(&args, &config);
            config
        }
        Err(e) => {
            // The configured level is unknown; log at the default one.
            setup_tracing(&args, &BrokerConfig::default());
            return Err(e);
        }
    };
    info!("hwbroker v{} starting...", env!("CARGO_PKG_VERSION"));

    let catalog = match &config.board.descriptor {
        Some(path) => {
            info!("Loading board descriptor {:?}", path);
            BoardCatalog::load(path)?
        }
        None => {
            info!(
                "Discovering board from {:?} in {:?}",
                config.board.model_path, config.board.descriptor_dir
            );
            BoardCatalog::discover(&config.board.descriptor_dir, &config.board.model_path)?
        }
    };
    info!(
        "Board catalog: {} ({} entries)",
        catalog.model().unwrap_or("unnamed"),
        catalog.len()
    );

    let listener = bind(&config.broker.socket_path, config.broker.socket_mode)?;
    info!("Listening on {}", config.broker.socket_path.display());

    service::run(&config, catalog, listener).await?;

    if let Err(e) = fs::remove_file(&config.broker.socket_path) {
        warn!("Socket cleanup failed: {}", e);
    }
    info!("hwbroker shutdown complete");
    Ok(())
}

/// Load `broker.toml` and apply the command line overrides.
fn load_config(args: &Args) -> Result<BrokerConfig, Box<dyn std::error::Error>> {
    let mut config = BrokerConfig::load_or_default(&args.config)?;
    if let Some(socket) = args.socket.clone() {
        config.broker.socket_path = socket;
    }
    if let Some(board) = args.board.clone() {
        config.board.descriptor = Some(board);
    }
    config.validate()?;
    Ok(config)
}

/// Bind the client socket, replacing a stale one.
fn bind(path: &Path, mode: u32) -> io::Result<UnixListener> {
    match fs::remove_file(path) {
        Ok(()) => warn!("Removed stale socket {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    let listener = UnixListener::bind(path)?;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(listener)
}

/// Setup tracing subscriber from CLI flags, falling back to the
/// configured level.
fn setup_tracing(args: &Args, config: &BrokerConfig) {
    let filter = if args.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.shared.log_level.as_directive()))
    };

    if args.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
