//! Bridge configuration.
//!
//! Every knob has a safe default so the core runs with zero
//! configuration; `from_env` layers environment overrides on top.

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub host: String,
    pub port: u16,
    /// Deadline for each issued call.
    pub call_timeout: Duration,
    /// Bound on a single satellite connect attempt.
    pub connect_timeout: Duration,
    /// Initial reconnect backoff; doubles per consecutive failure.
    pub backoff_base: Duration,
    /// Backoff saturation point.
    pub backoff_cap: Duration,
    /// Consecutive connect failures before the peer-unreachable signal.
    pub unreachable_threshold: u32,
    /// Directory holding the session token file.
    pub token_dir: PathBuf,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 47807,
            call_timeout: Duration::from_millis(8000),
            connect_timeout: Duration::from_millis(2000),
            backoff_base: Duration::from_millis(200),
            backoff_cap: Duration::from_millis(5000),
            unreachable_threshold: 3,
            token_dir: std::env::temp_dir(),
        }
    }
}

impl BridgeConfig {
    /// Defaults overridden by `PATCHBAY_HOST`, `PATCHBAY_PORT` and
    /// `PATCHBAY_CALL_TIMEOUT_MS` where set and parseable.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(host) = std::env::var("PATCHBAY_HOST") {
            if !host.is_empty() {
                config.host = host;
            }
        }
        if let Ok(port) = std::env::var("PATCHBAY_PORT") {
            match port.parse() {
                Ok(p) => config.port = p,
                Err(_) => tracing::warn!(%port, "Ignoring unparseable PATCHBAY_PORT"),
            }
        }
        if let Ok(ms) = std::env::var("PATCHBAY_CALL_TIMEOUT_MS") {
            match ms.parse() {
                Ok(v) => config.call_timeout = Duration::from_millis(v),
                Err(_) => tracing::warn!(%ms, "Ignoring unparseable PATCHBAY_CALL_TIMEOUT_MS"),
            }
        }

        config
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
