// ABOUTME: Configuration crate for kubedock
// ABOUTME: Exposes environment variable names and the typed Config loaded from them

pub mod config;
pub mod constants;

pub use config::{Config, ConfigError, ImagePullPolicy};
