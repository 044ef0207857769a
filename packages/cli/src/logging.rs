// ABOUTME: tracing-subscriber setup for the kubedock binary
// ABOUTME: RUST_LOG wins when set and valid, otherwise the configured log level applies

use anyhow::{anyhow, Result};
use kubedock_config::constants::RUST_LOG;
use kubedock_config::Config;
use tracing_subscriber::EnvFilter;

const FALLBACK_DIRECTIVE: &str = "info";

pub fn env_filter(rust_log: Option<&str>, log_level: &str) -> EnvFilter {
    rust_log
        .filter(|s| !s.trim().is_empty())
        .and_then(|s| EnvFilter::try_new(s).ok())
        .or_else(|| EnvFilter::try_new(log_level).ok())
        .unwrap_or_else(|| EnvFilter::new(FALLBACK_DIRECTIVE))
}

pub fn init(config: &Config) -> Result<()> {
    let rust_log = std::env::var(RUST_LOG).ok();
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(rust_log.as_deref(), &config.log_level))
        .with_target(false)
        .compact()
        .try_init()
        .map_err(|e| anyhow!("Failed to install log subscriber: {}", e))
}
