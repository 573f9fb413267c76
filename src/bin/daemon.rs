//! filerelay daemon
//!
//! Runs the relay pipeline on its schedule until interrupted.

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;

use filerelay::config::RelayConfig;
use filerelay::logging::init_logging;
use filerelay::sync::build_engine;
use filerelay::VERSION;

#[derive(Parser, Debug)]
#[command(name = "filerelay-daemon")]
#[command(about = "Collect remote files, forward them and clean up behind them")]
#[command(version)]
struct Args {
    /// Configuration file
    #[arg(
        short,
        long,
        env = "FILERELAY_CONFIG",
        default_value = "~/.config/filerelay/filerelay.toml"
    )]
    config: String,

    /// Log level (overrides the config file)
    #[arg(long, env = "FILERELAY_LOG_LEVEL")]
    log_level: Option<String>,

    /// Run a single tick, print its report and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Expand ~ in path
    let config_path = shellexpand::tilde(&args.config).to_string();
    let mut config = RelayConfig::load(&config_path)
        .with_context(|| format!("loading configuration from {}", config_path))?;
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    let _log_guard = init_logging(&config.logging)?;
    tracing::info!(version = VERSION, config = %config_path, "starting filerelay");

    let engine = build_engine(&config).context("building relay pipeline")?;

    if args.once {
        let report = engine.tick().await.context("tick failed")?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_stop_signal().await;
        tracing::info!("stop requested, finishing current tick");
        let _ = stop_tx.send(true);
    });

    engine.run(stop_rx).await?;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_stop_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "cannot listen for SIGTERM");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_stop_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
