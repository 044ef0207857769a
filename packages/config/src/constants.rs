// ABOUTME: Environment variable name constants
// ABOUTME: Centralized definitions of all environment variable names read by kubedock

// Cluster Configuration
pub const KUBEDOCK_NAMESPACE: &str = "KUBEDOCK_NAMESPACE";
pub const KUBEDOCK_IMAGE_PULL_POLICY: &str = "KUBEDOCK_IMAGE_PULL_POLICY";

// Storage Configuration
pub const KUBEDOCK_DATABASE_URL: &str = "KUBEDOCK_DATABASE_URL";

// Lifecycle Timeouts
pub const KUBEDOCK_READY_TIMEOUT_SECS: &str = "KUBEDOCK_READY_TIMEOUT_SECS";
pub const KUBEDOCK_DELETE_TIMEOUT_SECS: &str = "KUBEDOCK_DELETE_TIMEOUT_SECS";
pub const KUBEDOCK_POLL_INTERVAL_MS: &str = "KUBEDOCK_POLL_INTERVAL_MS";

// Reaper Configuration
pub const KUBEDOCK_REAPER_MAX_AGE_SECS: &str = "KUBEDOCK_REAPER_MAX_AGE_SECS";

// Logging
pub const KUBEDOCK_LOG_LEVEL: &str = "KUBEDOCK_LOG_LEVEL";
pub const RUST_LOG: &str = "RUST_LOG";
