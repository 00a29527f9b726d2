use anyhow::{Context, Result};
use std::env;
use time::UtcOffset;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use garden_hub::config::{self, Config};
use garden_hub::scheduler::format_utc_offset;
use garden_hub::Garden;

fn main() -> Result<()> {
    // ── Logging ─────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Config file ─────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "garden.toml".to_string());
    let mut cfg = config::load(&config_path)?;
    info!(
        path = %config_path,
        channels = cfg.channels.len(),
        rules = cfg.rules.len(),
        schedules = cfg.schedules.len(),
        "config loaded"
    );

    // The local offset can only be read while the process is single-threaded.
    if cfg.scheduler.utc_offset.is_none() && cfg.scheduler.timezone.is_none() {
        match UtcOffset::current_local_offset() {
            Ok(local) => cfg.scheduler.utc_offset = Some(format_utc_offset(local)),
            Err(e) => warn!("local utc offset unavailable ({e}), scheduling in UTC"),
        }
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;
    runtime.block_on(run(cfg))
}

async fn run(cfg: Config) -> Result<()> {
    // ── Components ──────────────────────────────────────────────────
    let garden = Garden::build(&cfg).await?;
    let tasks = garden.start().await;

    // ── Run until Ctrl-C ────────────────────────────────────────────
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("shutdown requested");
    garden.shutdown(tasks).await;

    Ok(())
}
