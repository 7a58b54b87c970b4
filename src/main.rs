//! fsmhub - home-automation rules engine
//!
//! Drives per-entity state machines from bus events, with live reload of
//! the rule document and durable state snapshots.

use clap::{Parser, Subcommand};
use fsmhub_bus::LocalBus;
use fsmhub_core::CoreError;
use fsmhub_server::{Config, RuleLoader, ServerError, Service, ServiceHandle};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fsmhub")]
#[command(about = "Home-automation rules engine")]
#[command(version)]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, env = "FSMHUB_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the service (default)
    Run,

    /// Render and validate the rule document, then exit
    Check,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            return Err(e.into());
        }
    };

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config).await,
        Commands::Check => check(&config),
    }
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!("Starting fsmhub");
    tracing::info!("  Rules: {}", config.rules.path.display());
    tracing::info!("  Data directory: {}", config.storage.data_dir.display());
    tracing::info!("  Scripts: {}", config.scripts.dir.display());
    tracing::info!("  Devices: {}", config.devices.len());

    let bus = LocalBus::shared();
    let service = match Service::new(&config, bus) {
        Ok(service) => service,
        Err(e) => {
            tracing::error!("Failed to start: {}", e);
            return Err(e.into());
        }
    };

    let handle = service.handle();
    tokio::spawn(watch_signals(handle));

    service.run().await?;

    tracing::info!("fsmhub stopped");
    Ok(())
}

fn check(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let loader = RuleLoader::new(&config.rules.path, Arc::new(config.devices.clone()));

    match loader.load() {
        Ok(rules) => {
            println!(
                "{}: {} automata, {} expressions (checksum {})",
                loader.path().display(),
                rules.len(),
                rules.expression_count(),
                rules.checksum()
            );
            Ok(())
        }
        Err(ServerError::Core(CoreError::Compile(errors))) => {
            eprintln!("{}: {} error(s)", loader.path().display(), errors.len());
            for error in errors.errors() {
                eprintln!("  {}", error);
            }
            Err("invalid rule document".into())
        }
        Err(e) => Err(e.into()),
    }
}

/// Ctrl-C and SIGTERM stop the service; SIGHUP reloads the rules.
async fn watch_signals(handle: ServiceHandle) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut hangup, mut terminate) =
            match (signal(SignalKind::hangup()), signal(SignalKind::terminate())) {
                (Ok(hangup), Ok(terminate)) => (hangup, terminate),
                (Err(e), _) | (_, Err(e)) => {
                    tracing::warn!("Failed to install signal handlers: {}", e);
                    tokio::signal::ctrl_c().await.ok();
                    handle.shutdown();
                    return;
                }
            };

        loop {
            tokio::select! {
                _ = hangup.recv() => {
                    tracing::info!("Received SIGHUP, reloading rules");
                    handle.reload();
                }
                _ = terminate.recv() => break,
                _ = tokio::signal::ctrl_c() => break,
            }
        }
    }

    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await.ok();

    tracing::info!("Received shutdown signal, stopping service...");
    handle.shutdown();
}
