use clap::{Parser, Subcommand};
use pushprobe_agent::{Agent, AgentOptions};
use pushprobe_controller::{Controller, ControllerError};
use pushprobe_core::{
    AccountInfo, ControllerConfig, CoreError, HostCommander, MetadataConfig, ProbeConfig,
    SystemClock,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "pushprobe", about = "Push-notification delivery-latency probing fleet")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the fleet controller
    Controller {
        /// Path to the JSON controller configuration
        #[arg(long, default_value = "config.json")]
        config: String,
        /// Directory for TLS material
        #[arg(long, default_value = "./data")]
        data_dir: String,
    },
    /// Run a probe agent
    Agent {
        /// Path to a JSON MetadataConfig, bypassing project-metadata
        /// discovery
        #[arg(long)]
        config: Option<String>,
        /// JSON-encoded probe assignment for a direct launch
        #[arg(long)]
        probes: Option<String>,
        /// JSON-encoded account information for a direct launch
        #[arg(long)]
        account: Option<String>,
        /// Where the certificate bundle is written
        #[arg(long, default_value = "cert.pem")]
        cert_path: String,
    },
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Controller { config, data_dir } => run_controller(&config, &data_dir).await,
        Commands::Agent {
            config,
            probes,
            account,
            cert_path,
        } => run_agent(config.as_deref(), probes.as_deref(), account.as_deref(), &cert_path).await,
    }
}

/// Wait for either SIGINT (ctrl-c) or SIGTERM, returning which one fired.
async fn shutdown_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    }
}

async fn run_controller(config_path: &str, data_dir: &str) -> miette::Result<()> {
    info!("Starting pushprobe controller");

    let raw = std::fs::read_to_string(config_path).map_err(|e| {
        ControllerError::invalid_config(
            format!("could not read config file '{}': {}", config_path, e),
            "Pass --config with the path to a JSON controller configuration",
        )
    })?;
    let config: ControllerConfig = serde_json::from_str(&raw).map_err(|e| {
        ControllerError::invalid_config(
            format!("could not parse '{}': {}", config_path, e),
            "Check the file against the documented ControllerConfig schema",
        )
    })?;

    let controller = Arc::new(Controller::new(
        config,
        Arc::new(HostCommander),
        Arc::new(SystemClock),
    ));

    let server = controller
        .init_server(&PathBuf::from(data_dir))
        .await
        .map_err(|e| miette::miette!("Controller boot failed: {}", e))?;

    let token = CancellationToken::new();
    let server_token = token.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run(server_token).await {
            error!("Control-plane server error: {}", e);
        }
    });

    controller
        .init_probes()
        .await
        .map_err(|e| miette::miette!("Fleet provisioning failed: {}", e))?;

    // A signal flips the shutdown intent; agents observe it on their next
    // ping and the supervisor drives every VM to stopped.
    let signal_controller = controller.clone();
    tokio::spawn(async move {
        let sig = shutdown_signal().await;
        info!("Received {}, shutting the fleet down...", sig);
        signal_controller.shutdown();
    });

    controller.monitor().await;

    token.cancel();
    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), server_handle).await;

    info!("Shutdown complete");
    Ok(())
}

async fn run_agent(
    config_path: Option<&str>,
    probes: Option<&str>,
    account: Option<&str>,
    cert_path: &str,
) -> miette::Result<()> {
    info!("Starting pushprobe agent");

    let metadata: Option<MetadataConfig> = match config_path {
        Some(path) => {
            let raw = std::fs::read_to_string(path).map_err(|e| {
                CoreError::invalid_config(format!("could not read config file '{}': {}", path, e))
            })?;
            Some(serde_json::from_str(&raw).map_err(|e| {
                CoreError::invalid_config(format!("invalid agent configuration in '{}': {}", path, e))
            })?)
        }
        None => None,
    };

    let probes: Option<Vec<ProbeConfig>> = match probes {
        Some(raw) => Some(serde_json::from_str(raw).map_err(|e| {
            CoreError::invalid_config(format!("invalid --probes value: {}", e))
        })?),
        None => None,
    };
    let account: Option<AccountInfo> = match account {
        Some(raw) => Some(serde_json::from_str(raw).map_err(|e| {
            CoreError::invalid_config(format!("invalid --account value: {}", e))
        })?),
        None => None,
    };

    let agent = Agent::new(Arc::new(HostCommander), Arc::new(SystemClock));
    let opts = AgentOptions {
        cert_path: PathBuf::from(cert_path),
        metadata,
        probes,
        account,
    };

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        let sig = shutdown_signal().await;
        info!("Received {}, stopping agent...", sig);
        signal_token.cancel();
    });

    agent
        .run(opts, shutdown)
        .await
        .map_err(|e| miette::miette!("Agent failed: {}", e))?;

    info!("Agent exited cleanly");
    Ok(())
}
