//! VoxBridge server binary.
//!
//! Usage: voxbridge-server <config.json>
//!
//! Loads the bridge configuration, initialises tracing, and serves provider
//! connections until interrupted. Configuration or bind failures exit the
//! process; everything after startup is call-scoped.

use std::env;
use tracing::info;
use tracing_subscriber::EnvFilter;

use voxbridge::{BridgeConfig, VoxBridge};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <config.json>", args[0]);
        std::process::exit(1);
    }

    let config = match BridgeConfig::from_file(&args[1]) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load config {}: {e}", args[1]);
            std::process::exit(1);
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("voxbridge starting: provider={}", config.provider.provider_type);
    info!(
        "listening on ws://{}:{}{}",
        config.provider.listen_host, config.provider.listen_port, config.provider.listen_path
    );
    if config.pipeline_mode() {
        info!(
            "pipeline mode: stt={}, llm={}, tts={}",
            config.pipeline.stt.provider, config.pipeline.llm.provider, config.pipeline.tts.provider
        );
    } else {
        info!("bot endpoint: {}", config.bot.url);
    }

    let bridge = VoxBridge::new(config);
    bridge.run().await?;
    Ok(())
}
