use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use canvas_sync_client::{DirectorySnapshotStore, MemorySurface, SnapshotStore, SyncAdapter};
use canvas_sync_core::config::{Config, LoggingConfig};
use canvas_sync_relay::RelayState;

#[derive(Parser)]
#[command(
    name = "canvas-sync",
    about = "Live two-way sync between design canvases and automation agents",
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
    /// Start the relay server
    Relay {
        /// Port to listen on (default: 8765)
        #[arg(long)]
        port: Option<u16>,

        /// Address to bind (default: 127.0.0.1)
        #[arg(long)]
        bind: Option<String>,

        /// Acknowledge every relayed mutation back to its sender
        #[arg(long)]
        ack: bool,
    },

    /// Run a headless in-memory client connected to a relay
    Client {
        /// Relay WebSocket URL (default: ws://127.0.0.1:8765/ws)
        #[arg(long)]
        url: Option<String>,

        /// Role announced in the handshake
        #[arg(long)]
        role: Option<String>,
    },

    /// Call an automation tool on a running relay
    Invoke {
        /// Tool name, e.g. create_node or get_design_schema
        tool: String,

        /// Tool arguments as JSON
        #[arg(long)]
        args: Option<String>,

        /// Relay HTTP base URL (default: from config)
        #[arg(long)]
        url: Option<String>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show relay status
    Status,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Check the configuration for problems
    Validate,
    /// Write the effective configuration (with defaults) to the config file
    Init,
}

fn init_logging(logging: &LoggingConfig, verbose: bool) {
    let level = if verbose {
        "debug".to_string()
    } else {
        logging.level.clone().unwrap_or_else(|| "info".to_string())
    };

    let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));
    for directive in &logging.filters {
        match directive.parse() {
            Ok(directive) => filter = filter.add_directive(directive),
            Err(e) => eprintln!("Ignoring log filter '{directive}': {e}"),
        }
    }

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match (logging.format.as_str(), logging.output.as_str()) {
        ("json", "stdout") => builder.json().with_writer(std::io::stdout).init(),
        ("json", _) => builder.json().with_writer(std::io::stderr).init(),
        (_, "stdout") => builder.with_writer(std::io::stdout).init(),
        _ => builder.with_writer(std::io::stderr).init(),
    }
}

fn relay_base_url(config: &Config) -> String {
    let relay = config.relay();
    let host = match relay.bind.as_str() {
        "0.0.0.0" | "::" => "127.0.0.1",
        bind => bind,
    };
    format!("http://{host}:{}", relay.port)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load config
    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(Config::config_path);

    let config = Config::load(&config_path)?;

    init_logging(&config.logging(), cli.verbose);

    match cli.command {
        Commands::Relay { port, bind, ack } => {
            let mut relay = config.relay();
            if let Some(port) = port {
                relay.port = port;
            }
            if let Some(bind) = bind {
                relay.bind = bind;
            }
            relay.acknowledge_mutations |= ack;

            let (warnings, errors) = Config {
                relay: Some(relay.clone()),
                ..Config::default()
            }
            .validate();
            for warning in &warnings {
                tracing::warn!("{warning}");
            }
            if !errors.is_empty() {
                anyhow::bail!("invalid relay configuration: {}", errors.join("; "));
            }

            tracing::info!(
                "Starting Canvas Sync relay on {}:{} (request timeout {}s)",
                relay.bind,
                relay.port,
                relay.request_timeout_secs
            );
            let state = Arc::new(RelayState::new(relay));
            canvas_sync_relay::start_relay(state).await?;
        }
        Commands::Client { url, role } => {
            let mut client = config.client();
            if let Some(url) = url {
                client.relay_url = url;
            }
            if let Some(role) = role {
                client.role = role;
            }

            let store_dir = client.store_dir();
            tracing::info!(
                "Starting headless client for {} (snapshots in {})",
                client.relay_url,
                store_dir.display()
            );
            let store: Arc<dyn SnapshotStore> = Arc::new(DirectorySnapshotStore::new(store_dir));
            let adapter = Arc::new(SyncAdapter::new(MemorySurface::new(), client, Some(store)));

            let cancel = CancellationToken::new();
            let runner = adapter.clone();
            let token = cancel.clone();
            let handle = tokio::spawn(async move { runner.run(token).await });

            tokio::signal::ctrl_c().await?;
            tracing::info!("Shutdown signal received");
            cancel.cancel();
            handle.await?;
        }
        Commands::Invoke { tool, args, url } => {
            let args: serde_json::Value = match args {
                Some(raw) => serde_json::from_str(&raw)
                    .map_err(|e| anyhow::anyhow!("--args is not valid JSON: {e}"))?,
                None => serde_json::json!({}),
            };
            let base = url.unwrap_or_else(|| relay_base_url(&config));

            let resp = reqwest::Client::new()
                .post(format!("{base}/tools/{tool}"))
                .json(&args)
                .send()
                .await?;
            let status = resp.status();
            let body: serde_json::Value = resp.json().await?;

            if !status.is_success() {
                let message = body["error"].as_str().unwrap_or("unknown error");
                anyhow::bail!("{tool} failed ({status}): {message}");
            }
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&config)?;
                println!("{json}");
            }
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate();
                for warning in &warnings {
                    println!("warning: {warning}");
                }
                for error in &errors {
                    println!("error: {error}");
                }
                if !errors.is_empty() {
                    anyhow::bail!("{} configuration error(s)", errors.len());
                }
                println!("Config OK: {}", config_path.display());
            }
            ConfigAction::Init => {
                let effective = Config {
                    relay: Some(config.relay()),
                    client: Some(config.client()),
                    logging: Some(config.logging()),
                };
                if let Some(parent) = config_path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                effective.save(&config_path)?;
                println!("Wrote {}", config_path.display());
            }
        },
        Commands::Status => {
            let base = relay_base_url(&config);
            println!("Canvas Sync v{}", env!("CARGO_PKG_VERSION"));
            println!("Config: {}", config_path.display());
            println!("Relay: {base}");

            let client = reqwest::Client::builder()
                .timeout(Duration::from_secs(2))
                .build()?;
            match client.get(format!("{base}/health")).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let health: serde_json::Value = resp.json().await?;
                    println!(
                        "Status: running (v{}, {} connection(s), {} node(s), {} pending request(s))",
                        health["version"].as_str().unwrap_or("?"),
                        health["connections"],
                        health["nodes"],
                        health["pending_requests"],
                    );
                }
                Ok(resp) => println!("Status: unhealthy ({})", resp.status()),
                Err(_) => println!("Status: not running"),
            }
        }
    }

    Ok(())
}
