use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use facetalk_core::config::Config;

mod logging;

#[derive(Parser)]
#[command(
    name = "facetalk",
    about = "Real-time talking-avatar conversations over WebSocket",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the session gateway
    Serve {
        /// Port to listen on (default: 8000)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show configuration summary and whether a gateway is running
    Status,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Check the configuration for problems
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(Config::default_path);
    let config = Config::load(&config_path)?;

    logging::init_logging(config.logging.as_ref(), cli.verbose);

    match cli.command {
        Commands::Serve { port } => serve(config, port).await?,
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&config)?;
                println!("{json}");
            }
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate();
                for w in &warnings {
                    println!("warning: {w}");
                }
                for e in &errors {
                    println!("error: {e}");
                }
                if !errors.is_empty() {
                    anyhow::bail!("{} configuration error(s)", errors.len());
                }
                println!("Configuration OK ({})", config_path.display());
            }
        },
        Commands::Status => status(&config, &config_path).await,
    }

    Ok(())
}

async fn serve(config: Config, port: Option<u16>) -> anyhow::Result<()> {
    let port = port.unwrap_or_else(|| config.gateway_port());

    let (warnings, errors) = config.validate();
    for w in &warnings {
        tracing::warn!("{w}");
    }
    if !errors.is_empty() {
        for e in &errors {
            tracing::error!("{e}");
        }
        anyhow::bail!("Refusing to start with an invalid configuration");
    }

    let state = facetalk_gateway::GatewayState::from_config(config)?;

    #[cfg(feature = "metrics")]
    let state = {
        let handle = facetalk_gateway::metrics::install_prometheus_recorder()?;
        state.with_metrics(handle)
    };

    tracing::info!("Starting facetalk gateway on port {port}");
    facetalk_gateway::start_gateway(Arc::new(state), port).await
}

async fn status(config: &Config, config_path: &std::path::Path) {
    let port = config.gateway_port();
    println!("Facetalk v{}", env!("CARGO_PKG_VERSION"));
    println!("Config: {}", config_path.display());
    println!("Gateway port: {port}");
    println!("Avatars: {}", config.avatars_dir().display());
    println!("Media: {}", config.storage_dir().display());
    println!(
        "Cache: {} entries max, stage timeout {}s",
        config.cache_max_entries(),
        config.stage_timeout().as_secs()
    );

    let url = format!("http://127.0.0.1:{port}/health");
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build();
    let health = match client {
        Ok(client) => match client.get(&url).send().await {
            Ok(resp) => resp.json::<serde_json::Value>().await.ok(),
            Err(_) => None,
        },
        Err(_) => None,
    };

    match health {
        Some(body) => println!(
            "Status: running ({} active sessions)",
            body["sessions"].as_u64().unwrap_or(0)
        ),
        None => println!("Status: not running"),
    }
}
