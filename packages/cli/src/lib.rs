// ABOUTME: Shared bootstrap for the kubedock binary
// ABOUTME: Logging setup, store and cluster wiring, container lookup and output formatting

pub mod format;
pub mod logging;
pub mod runtime;

pub use runtime::Runtime;
