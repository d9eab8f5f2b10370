//! pmm-bot: Avellaneda-Stoikov market maker for Polymarket binary markets.
//!
//! Usage:
//!   pmm-bot [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>      Config file path (default: config/bot.toml)
//!   --log-level <LEVEL>      Override the configured log level
//!   --dry-run                Log mutating exchange calls instead of executing

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use pmm_bot::config::Config;
use pmm_bot::engine::Engine;
use pmm_market::clob::{ApiCredentials, ClobClient, ClobClientConfig};

/// CLI arguments.
#[derive(Parser, Debug)]
#[command(name = "pmm-bot")]
#[command(about = "Avellaneda-Stoikov market maker for Polymarket binary markets")]
#[command(version)]
struct Args {
    /// Config file path.
    #[arg(short, long, default_value = "config/bot.toml")]
    config: PathBuf,

    /// Override the configured log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Log mutating exchange calls instead of executing them.
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    // Load .env if present; only complain about real IO problems.
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Warning: failed to load .env file: {e}");
        }
    }

    let args = Args::parse();

    let mut cfg = Config::from_file(&args.config)
        .with_context(|| format!("failed to load config from {:?}", args.config))?;
    cfg.apply_env_overrides();
    if args.dry_run {
        cfg.dry_run = true;
    }
    if let Some(level) = args.log_level {
        cfg.log_level = level;
    }
    cfg.validate().context("invalid configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cfg.log_level.clone())),
        )
        .init();

    info!(
        dry_run = cfg.dry_run,
        config = %args.config.display(),
        "starting pmm-bot"
    );

    let credentials = cfg.api.api_key.as_ref().map(|key| ApiCredentials {
        api_key: key.clone(),
        secret: cfg.api.api_secret.clone().unwrap_or_default(),
        passphrase: cfg.api.api_passphrase.clone().unwrap_or_default(),
    });
    let client = Arc::new(
        ClobClient::new(ClobClientConfig {
            base_url: cfg.api.clob_base_url.clone(),
            credentials,
            dry_run: cfg.dry_run,
        })
        .context("failed to build CLOB client")?,
    );

    let engine = Arc::new(Engine::new(cfg, client).context("failed to build engine")?);

    // SIGINT/SIGTERM trigger a graceful shutdown.
    {
        let engine = engine.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("shutdown signal received");
            engine.trigger_shutdown();
        });
    }

    if let Err(e) = engine.run().await {
        error!(error = %e, "engine exited with error");
        return Err(e);
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(sig) => sig,
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                let _ = ctrl_c.await;
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
