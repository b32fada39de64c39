use anyhow::Context;
use clap::{Parser, Subcommand};
use shell_bridge::config::GatewayConfig;
use shell_bridge::gateway::{self, GatewayState, LoginDefaults};
use shell_bridge::inventory::ConfigInventory;
use shell_bridge::ssh::SshConnector;
use shell_bridge::{logging, SessionRegistry};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;

#[derive(Parser, Debug)]
#[command(
    name = "shell-gateway",
    version,
    about = "WebSocket gateway between browser terminals and server shells"
)]
struct Cli {
    /// Path to configuration file (also settable via SHELL_GATEWAY_CONFIG env var)
    #[arg(short, long, env = "SHELL_GATEWAY_CONFIG")]
    config: Option<PathBuf>,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Seal a root password with the configured credential_key for a [[servers]] entry
    SealPassword {
        /// Password to seal (if not provided, reads one line from stdin)
        #[arg(short, long)]
        password: Option<String>,
    },
    /// Validate configuration file
    CheckConfig,
}

fn load_config(cli: &Cli) -> anyhow::Result<GatewayConfig> {
    let mut config = match &cli.config {
        Some(path) => GatewayConfig::load(path)?,
        None => GatewayConfig::from_env()?,
    };
    if let Some(level) = &cli.log_level {
        config.log_level = level.clone();
    }
    Ok(config)
}

fn seal_password(config: &GatewayConfig, password: Option<String>) -> anyhow::Result<()> {
    let key = config
        .credential_key_bytes()?
        .context("credential_key must be configured to seal passwords")?;
    let password = match password {
        Some(p) => p,
        None => {
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line)?;
            line.trim_end_matches(['\r', '\n']).to_string()
        }
    };
    if password.is_empty() {
        anyhow::bail!("password must not be empty");
    }
    println!("{}", shell_bridge::crypto::seal_hex(&key, &password)?);
    Ok(())
}

async fn run(config: GatewayConfig) -> anyhow::Result<()> {
    let inventory = Arc::new(ConfigInventory::from_config(&config)?);
    log::info!("Loaded {} server(s) from configuration", inventory.len());
    if config.fallback_key_path.is_none() {
        log::warn!("No fallback_key_path configured; only stored root passwords will be tried");
    }

    let registry = SessionRegistry::new(
        Arc::new(SshConnector::new()),
        config.connect_timeout(),
        config.output_buffer,
    );
    let state = GatewayState::new(
        registry.clone(),
        inventory.clone(),
        inventory,
        LoginDefaults::from_config(&config),
    );

    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("binding {}", config.listen))?;

    let shutdown = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Could not listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
        log::info!("Shutting down, closing {} live shell(s)", registry.live_count());
        registry.shutdown().await;
    };
    gateway::serve(listener, state, shutdown).await?;
    log::info!("Gateway stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Some(Command::SealPassword { password }) => seal_password(&config, password),
        Some(Command::CheckConfig) => {
            println!(
                "Configuration OK: listen {}, {} server(s)",
                config.listen,
                config.servers.len()
            );
            Ok(())
        }
        None => {
            logging::init(&config.log_level);
            run(config).await
        }
    }
}
