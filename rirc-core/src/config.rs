//! Tunables for the connection core.
//!
//! Everything here has a default; a TOML file only needs to name the values
//! it changes.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::Backoff;
use crate::error::IoError;

/// Top-level configuration for an [`IoContext`](crate::IoContext).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IoConfig {
    /// Reconnect backoff.
    pub reconnect: ReconnectConfig,
    /// Keepalive / ping escalation.
    pub ping: PingConfig,
    /// Connect worker timeouts.
    pub connect: ConnectConfig,
    /// Capacity and buffer limits.
    pub limits: LimitsConfig,
}

/// Reconnect backoff settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay before the first retry, in milliseconds.
    pub base_ms: u64,
    /// Multiplier applied per failed attempt.
    pub factor: u32,
    /// Upper bound on the delay, in milliseconds.
    pub max_ms: u64,
}

/// Ping escalation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PingConfig {
    /// Silence longer than this counts as one missed keepalive, in milliseconds.
    pub interval_ms: u64,
    /// Highest ping count reported before the link is declared dead.
    pub ceiling: u32,
}

/// Connect worker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectConfig {
    /// Per-candidate TCP connect timeout, in milliseconds.
    pub timeout_ms: u64,
    /// TLS handshake timeout, in milliseconds.
    pub handshake_timeout_ms: u64,
    /// How long a cancel waits for the worker to confirm, in milliseconds.
    pub cancel_wait_ms: u64,
}

/// Capacity and buffer limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Registry capacity.
    pub max_connections: usize,
    /// Outbound bytes queued per connection before writes fail.
    pub send_queue_bytes: usize,
    /// Bytes read per socket read call.
    pub read_chunk_bytes: usize,
    /// Longest the loop sleeps without any timer due, in milliseconds.
    pub max_idle_ms: u64,
    /// Runtime threads available to connect workers.
    pub worker_threads: usize,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectConfig::default(),
            ping: PingConfig::default(),
            connect: ConnectConfig::default(),
            limits: LimitsConfig::default(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_ms: 4_000,
            factor: 2,
            max_ms: 86_400_000,
        }
    }
}

impl Default for PingConfig {
    fn default() -> Self {
        Self {
            interval_ms: 60_000,
            ceiling: 5,
        }
    }
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            handshake_timeout_ms: 10_000,
            cancel_wait_ms: 2_000,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: 8,
            send_queue_bytes: 64 * 1024,
            read_chunk_bytes: 4096,
            max_idle_ms: 1_000,
            worker_threads: 2,
        }
    }
}

// ── Accessors ────────────────────────────────────────────────────

impl IoConfig {
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.reconnect.base_ms),
            self.reconnect.factor,
            Duration::from_millis(self.reconnect.max_ms),
        )
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping.interval_ms.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect.timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.connect.handshake_timeout_ms)
    }

    pub fn cancel_wait(&self) -> Duration {
        Duration::from_millis(self.connect.cancel_wait_ms)
    }

    pub fn max_idle(&self) -> Duration {
        Duration::from_millis(self.limits.max_idle_ms.max(1))
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl IoConfig {
    /// Parse a TOML document; missing keys keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, IoError> {
        Ok(toml::from_str(text)?)
    }

    /// Load from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_toml_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Write the default config to a file.
    pub fn write_default(path: &Path) -> Result<(), IoError> {
        let text = toml::to_string_pretty(&Self::default())?;
        std::fs::write(path, text).map_err(|e| IoError::Config(e.to_string()))
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let text = toml::to_string_pretty(&IoConfig::default()).unwrap();
        assert!(text.contains("base_ms"));
        assert!(text.contains("max_connections"));
    }

    #[test]
    fn partial_document_keeps_defaults() {
        let cfg = IoConfig::from_toml_str(
            r#"
            [ping]
            interval_ms = 50

            [limits]
            max_connections = 2
            "#,
        )
        .unwrap();
        assert_eq!(cfg.ping.interval_ms, 50);
        assert_eq!(cfg.ping.ceiling, 5);
        assert_eq!(cfg.limits.max_connections, 2);
        assert_eq!(cfg.reconnect, ReconnectConfig::default());
    }

    #[test]
    fn backoff_from_config() {
        let cfg = IoConfig::default();
        let backoff = cfg.backoff();
        assert_eq!(backoff.delay(0), Duration::from_secs(4));
        assert_eq!(backoff.delay(1), Duration::from_secs(8));
        assert_eq!(backoff.max(), Duration::from_secs(86_400));
    }

    #[test]
    fn invalid_document_is_an_error() {
        let err = IoConfig::from_toml_str("[ping]\ninterval_ms = \"soon\"").unwrap_err();
        assert!(matches!(err, IoError::Config(_)));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = IoConfig::load(Path::new("/nonexistent/rirc.toml"));
        assert_eq!(cfg, IoConfig::default());
    }
}
