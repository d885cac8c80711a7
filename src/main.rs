//! Held Mock Server - CLI entry point.

use anyhow::Result;
use clap::Parser;
use held_mock_server::{HeldMockServer, ServerConfig, StubRegistry};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(
    name = "held-mock-server",
    about = "Gated mock server - request stubbing with caller-controlled response release",
    version
)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "held-mock-server.yaml")]
    config: PathBuf,

    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:7878")]
    listen: SocketAddr,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: Level,

    /// Print the default configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Print default config if requested
    if args.print_config {
        let default_config = include_str!("../demos/default-config.yaml");
        println!("{}", default_config);
        return Ok(());
    }

    // Load configuration
    let config = if args.config.exists() {
        info!(path = ?args.config, "Loading configuration");
        ServerConfig::from_file(&args.config)?
    } else if args.validate {
        anyhow::bail!("Configuration file not found: {:?}", args.config);
    } else {
        info!("Using default configuration (no stubs)");
        ServerConfig::default()
    };

    // Validate and exit if requested
    if args.validate {
        config.validate()?;
        println!(
            "Configuration is valid ({} stubs defined)",
            config.stubs.len()
        );
        return Ok(());
    }

    // Build the registry and install the configured stubs
    let mut registry = StubRegistry::new(config.settings.clone());
    if let Some(default_reply) = config.default_reply.clone() {
        registry = registry.with_default_reply(default_reply);
    }
    let registry = Arc::new(registry);
    for stub in &config.stubs {
        registry.install(stub).await?;
    }

    let server = HeldMockServer::bind(args.listen, Arc::clone(&registry)).await?;
    info!(
        uri = %server.uri(),
        "Ready; held stubs release via POST <uri>/__held/release/<id>"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    drop(server);

    Ok(())
}
