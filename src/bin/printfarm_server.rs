// src/bin/printfarm_server.rs
//! Printer farm server: loads the device registry, polls every printer and
//! streams status updates to browser clients over WebSocket.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use futures_util::future::join_all;

use printfarm::engine::{EngineConfig, StatusEngine};
use printfarm::hub::SubscriberHub;
use printfarm::registry::DeviceRegistry;
use printfarm::server::{self, ServerConfig, ServerState};

#[derive(Parser, Debug)]
#[command(name = "printfarm_server", version, about = "Live status server for a 3D printer farm")]
struct Args {
    /// Address to listen on
    #[arg(long, env = "PRINTFARM_HOST", default_value = "127.0.0.1")]
    host: IpAddr,

    #[arg(long, env = "PRINTFARM_PORT", default_value_t = 8000)]
    port: u16,

    /// JSON file holding registered printers
    #[arg(long, env = "PRINTFARM_REGISTRY", default_value = "printers.json")]
    registry: PathBuf,

    /// Built frontend (index.html and static/)
    #[arg(long, env = "PRINTFARM_FRONTEND_DIR", default_value = "frontend/build")]
    frontend_dir: PathBuf,

    /// Polling period in milliseconds
    #[arg(long, env = "PRINTFARM_TICK_MS", default_value_t = 1000)]
    tick_ms: u64,

    /// Minimum seconds between filament samples per printer
    #[arg(long, env = "PRINTFARM_FILAMENT_SECS", default_value_t = 10)]
    filament_secs: u64,

    /// Open the dashboard in the default browser after startup
    #[arg(long, env = "PRINTFARM_OPEN_BROWSER")]
    open_browser: bool,
}

impl Args {
    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            tick_interval: Duration::from_millis(self.tick_ms.max(1)),
            filament_interval: Duration::from_secs(self.filament_secs),
            ..EngineConfig::default()
        }
    }

    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.host,
            port: self.port,
            frontend_dir: self.frontend_dir.clone(),
            open_browser: self.open_browser,
            ..ServerConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let registry = Arc::new(
        DeviceRegistry::load(&args.registry)
            .with_context(|| format!("loading printer registry {}", args.registry.display()))?,
    );

    let drivers = registry.drivers().await;
    let results = join_all(drivers.iter().map(|(_, driver)| driver.connect())).await;
    for ((id, _), result) in drivers.iter().zip(results) {
        match result {
            Ok(()) => log::info!("[{}] Connected", id),
            Err(e) => log::warn!("[{}] Connect failed, will keep polling: {}", id, e),
        }
    }

    let hub = Arc::new(SubscriberHub::new());
    let (engine, handle) = StatusEngine::new(Arc::clone(&registry), hub.clone(), args.engine_config());
    let engine_task = tokio::spawn(engine.run());

    let state = ServerState {
        registry,
        hub,
        engine: handle.clone(),
    };
    // Stopping the engine closes every subscriber, which lets open
    // WebSocket connections finish so the graceful shutdown can complete.
    let shutdown = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
        log::info!("Shutdown requested");
        handle.shutdown();
    };

    server::serve(state, &args.server_config(), shutdown)
        .await
        .context("running HTTP server")?;

    if let Err(e) = engine_task.await {
        log::error!("Status engine task failed: {}", e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_browser_is_opt_in() {
        let args = Args::try_parse_from(["printfarm_server"]).unwrap();
        assert!(!args.server_config().open_browser);

        let args =
            Args::try_parse_from(["printfarm_server", "--open-browser", "--port", "9000"]).unwrap();
        let config = args.server_config();
        assert!(config.open_browser);
        assert_eq!(config.port, 9000);
    }
}
