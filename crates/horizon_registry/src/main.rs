//! Horizon server registry entry point
//!
//! Loads configuration, sets up logging and runs the registry HTTP API until
//! a termination signal arrives.

mod cli;
mod config;
mod logging;

use anyhow::{anyhow, Context, Result};
use cli::CliArgs;
use config::AppConfig;
use server_registry::{RegistryConfig, ServerRegistry};
use std::sync::Arc;
use tracing::{error, info};

// ============================================================================
// Application
// ============================================================================

pub struct Application {
    registry_config: RegistryConfig,
    registry: Arc<ServerRegistry>,
}

impl Application {
    /// Builds the application from file, environment and command-line settings.
    pub async fn new(args: CliArgs) -> Result<Self> {
        // Load configuration first (before logging setup)
        let mut config = AppConfig::load_from_file(&args.config_path).await?;

        if let Some(log_level) = args.log_level {
            config.logging.level = log_level;
        }
        if args.json_logs {
            config.logging.json_format = true;
        }

        config
            .validate()
            .map_err(|e| anyhow!("Configuration validation failed: {}", e))?;

        logging::setup_logging(&config.logging, args.json_logs)?;
        display_banner();

        let mut registry_config = config.to_registry_config()?;
        registry_config.apply_env();
        if let Some(bind_address) = args.bind_address {
            registry_config.bind_address = bind_address
                .parse()
                .with_context(|| format!("Invalid bind address: {}", bind_address))?;
        }

        let registry = ServerRegistry::open(registry_config.clone()).await?;
        info!("📂 Config: {}", args.config_path.display());

        Ok(Self {
            registry_config,
            registry: Arc::new(registry),
        })
    }

    /// Runs until a termination signal or a fatal server error.
    pub async fn run(self) -> Result<()> {
        info!("📋 Configuration Summary:");
        info!("  🌐 Bind address: {}", self.registry_config.bind_address);
        info!(
            "  ⏱️ Timeouts: soft {}s, hard {}s",
            self.registry_config.soft_timeout.as_secs(),
            self.registry_config.hard_timeout.as_secs()
        );
        info!(
            "  🧹 Sweep interval: {}s",
            self.registry_config.sweep_interval.as_secs()
        );
        info!(
            "  👥 Default capacity: {} | Region: {}",
            self.registry_config.default_capacity, self.registry_config.default_region
        );
        match &self.registry_config.persistence_dir {
            Some(dir) => info!("  💾 Persistence: {}", dir.display()),
            None => info!("  💾 Persistence: disabled"),
        }

        let mut server_handle = {
            let registry = self.registry.clone();
            tokio::spawn(async move { registry.start().await })
        };

        tokio::select! {
            signal = shutdown_signal() => {
                match signal {
                    Ok(name) => {
                        info!("📡 Received {}", name);
                        self.registry.shutdown();
                    }
                    Err(e) => error!("❌ Failed to install signal handlers, running until the server exits: {}", e),
                }
                server_handle
                    .await
                    .context("Registry task panicked")?
                    .context("Registry stopped with an error")?;
            }
            result = &mut server_handle => {
                result
                    .context("Registry task panicked")?
                    .context("Registry stopped with an error")?;
            }
        }

        info!("✅ Horizon server registry shut down cleanly");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    let app = match Application::new(args).await {
        Ok(app) => app,
        Err(e) => {
            eprintln!("❌ Failed to start server registry: {:?}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = app.run().await {
        error!("❌ Application error: {:?}", e);
        std::process::exit(1);
    }

    Ok(())
}

/// Resolves with the name of the first termination signal delivered.
#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    Ok(tokio::select! {
        _ = interrupt.recv() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
    })
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("Ctrl+C")
}

fn display_banner() {
    let version = option_env!("CARGO_PKG_VERSION").unwrap_or("UNK");
    info!("╔══════════════════════════════════════════╗");
    info!("║        🌟 HORIZON SERVER REGISTRY 🌟      ║");
    info!("║                 v{:<24}║", version);
    info!("║                                          ║");
    info!("║  📡 Registration + Heartbeats            ║");
    info!("║  🔎 Discovery + Join Admission           ║");
    info!("║  🧹 Two-Stage Eviction                   ║");
    info!("╚══════════════════════════════════════════╝");
}
