//! LoM Engine - fault-management engine daemon.
//!
//! Serves plugin clients over the framed binding and the line-delimited
//! JSON-RPC binding, both feeding one engine instance.

mod publisher;
mod sequence;
mod server;

use anyhow::Result;
use clap::Parser;
use lom_core::config::TransportConfig;
use lom_core::{AbortSignal, ConfigStore, EngineBuilder};
use publisher::LogPublisher;
use sequence::StandaloneSequence;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "lom-engine")]
#[command(about = "LoM fault-management engine")]
struct Args {
    /// Directory holding actions.conf.json and globals.conf.json
    #[arg(long, default_value = "/usr/share/lom")]
    config_dir: PathBuf,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port of the length-prefixed binding (0 = auto-assign)
    #[arg(long, default_value_t = TransportConfig::BINARY_PORT)]
    binary_port: u16,

    /// Port of the JSON-RPC binding (0 = auto-assign)
    #[arg(long, default_value_t = TransportConfig::JSONRPC_PORT)]
    jsonrpc_port: u16,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting LoM engine");
    info!("Config directory: {}", args.config_dir.display());

    let config = Arc::new(ConfigStore::load(&args.config_dir)?);
    let publisher = Arc::new(LogPublisher);
    let sequence = StandaloneSequence::new(publisher.clone());

    let (engine, handle) = EngineBuilder::new(config.clone(), Box::new(sequence), publisher)
        .global_config(config.clone())
        .build();

    let abort = AbortSignal::new();
    let engine_task = tokio::spawn(engine.run(abort.clone()));

    let mut listeners =
        server::start_listeners(&args.host, args.binary_port, args.jsonrpc_port, handle).await?;

    // Ports for supervisors and tests to read (intentional stdout)
    println!("BINARY_PORT={}", listeners.binary_port());
    println!("JSONRPC_PORT={}", listeners.jsonrpc_port());

    wait_for_shutdown(&config).await?;
    info!("Shutdown signal received, stopping");

    listeners.shutdown();
    abort.abort();
    if let Err(e) = engine_task.await? {
        error!("Engine stopped with error: {}", e);
        return Err(e.into());
    }

    Ok(())
}

/// Wait for ctrl-c, reloading the configuration on every SIGHUP.
#[cfg(unix)]
async fn wait_for_shutdown(config: &ConfigStore) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => return Ok(result?),
            _ = hangup.recv() => match config.reload() {
                Ok(count) => info!("Configuration reloaded, {} action(s) configured", count),
                Err(e) => error!("Configuration reload failed, keeping previous: {}", e),
            },
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_config: &ConfigStore) -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
