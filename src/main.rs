//! Device update agent - main entry point

use clap::{Parser, Subcommand};
use du_agent::agent::DeviceAgent;
use du_agent::clock::system_clock;
use du_agent::config::AgentConfig;
use du_agent::observability::logging::{parse_level, parse_spans_flag};
use du_agent::observability::{init_logging, LogFormat};
use du_agent::state_store::{AgentStateStore, ProvisioningStore};
use du_agent::transport::mqtt::{ConnectSettings, RumqttcEngine};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, Level};

/// Device update agent
#[derive(Parser)]
#[command(name = "du-agent")]
#[command(about = "Device update agent over MQTT v5")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "DU_AGENT_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace) unless LOG_LEVEL is set
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent until SIGINT or SIGTERM
    Run,
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_cli_logging(cli.verbose);

    info!("Starting du-agent v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_agent(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn init_cli_logging(verbose: u8) {
    let level = match (std::env::var("LOG_LEVEL"), verbose) {
        (Ok(level), _) => parse_level(&level),
        (Err(_), 0) => Level::INFO,
        (Err(_), 1) => Level::DEBUG,
        (Err(_), _) => Level::TRACE,
    };
    let format = LogFormat::parse(&std::env::var("LOG_FORMAT").unwrap_or_default());
    let spans = parse_spans_flag(&std::env::var("LOG_SPANS").unwrap_or_default());
    init_logging(level, format, spans);
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<AgentConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(AgentConfig::load_from_file(path)?);
    }

    for path_str in ["du-agent.toml", "config/du-agent.toml"] {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(AgentConfig::load_from_file(&path)?);
        }
    }

    Err("no configuration file found; pass -c/--config or create du-agent.toml".into())
}

async fn run_agent(config: AgentConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(match &config.agent.state_file {
        Some(path) => {
            info!("Agent state persisted to {}", path.display());
            AgentStateStore::open(path)?
        }
        None => AgentStateStore::in_memory(),
    });

    let device_id = store
        .get_external_device_id()
        .or_else(|| config.agent.device_id.clone())
        .ok_or("no external device id configured or provisioned")?;
    info!("Running as device '{}'", device_id);

    let engine = RumqttcEngine::new(ConnectSettings::from_config(&config, &device_id));
    let mut agent = DeviceAgent::new(&config, engine, store, system_clock())?;

    agent.run(shutdown_signal()).await;
    Ok(())
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down gracefully..."),
        _ = terminate => info!("Received SIGTERM, shutting down gracefully..."),
    }
}

fn handle_config_command(config: &AgentConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("{}", toml::to_string_pretty(config)?);
    }
    info!("Configuration is valid");
    Ok(())
}
