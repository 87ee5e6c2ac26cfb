//! Terminal client configuration.

use std::path::Path;

use rirc_core::{Flags, IoConfig};
use serde::{Deserialize, Serialize};

/// Top-level configuration for the terminal client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Server to connect to.
    pub server: ServerConfig,
    /// Registration identity.
    pub identity: IdentityConfig,
    /// Connection core tunables.
    pub io: IoConfig,
    /// Logging.
    pub logging: LoggingConfig,
}

/// Server endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    /// Empty picks 6697 with TLS and 6667 without.
    pub port: String,
    pub tls: bool,
    /// "disabled", "optional" or "required".
    pub verify: String,
    /// "any", "ipv4" or "ipv6".
    pub family: String,
}

/// Nick and user sent on registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub nick: String,
    pub username: String,
    pub realname: String,
}

/// Logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level, overridden by `RUST_LOG`.
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            identity: IdentityConfig::default(),
            io: IoConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "irc.libera.chat".into(),
            port: String::new(),
            tls: true,
            verify: "required".into(),
            family: "any".into(),
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            nick: "rirc".into(),
            username: "rirc".into(),
            realname: concat!("rirc v", env!("CARGO_PKG_VERSION")).into(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".into(),
        }
    }
}

// ── Flags ────────────────────────────────────────────────────────

impl ServerConfig {
    /// Connection flags for this endpoint.
    pub fn flags(&self) -> Result<Flags, String> {
        let mut flags = match self.family.as_str() {
            "any" | "" => Flags::IPV_UNSPEC,
            "ipv4" => Flags::IPV_4,
            "ipv6" => Flags::IPV_6,
            other => return Err(format!("unknown address family '{other}'")),
        };

        if !self.tls {
            return Ok(flags | Flags::TLS_DISABLED);
        }

        flags |= Flags::TLS_ENABLED;
        flags |= match self.verify.as_str() {
            "disabled" => Flags::TLS_VRFY_DISABLED,
            "optional" => Flags::TLS_VRFY_OPTIONAL,
            "required" | "" => Flags::TLS_VRFY_REQUIRED,
            other => return Err(format!("unknown verification policy '{other}'")),
        };
        Ok(flags)
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl CliConfig {
    /// Load from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let text = toml::to_string_pretty(&CliConfig::default()).unwrap();
        assert!(text.contains("irc.libera.chat"));
        assert!(text.contains("[io.reconnect]"));
    }

    #[test]
    fn nested_core_settings_parse() {
        let cfg: CliConfig = toml::from_str(
            r#"
            [server]
            host = "irc.oftc.net"
            tls = false

            [io.ping]
            ceiling = 2
            "#,
        )
        .unwrap();
        assert_eq!(cfg.server.host, "irc.oftc.net");
        assert_eq!(cfg.io.ping.ceiling, 2);
        assert_eq!(cfg.identity.nick, "rirc");
    }

    #[test]
    fn flags_from_server_settings() {
        let server = ServerConfig::default();
        assert_eq!(
            server.flags().unwrap(),
            Flags::IPV_UNSPEC | Flags::TLS_ENABLED | Flags::TLS_VRFY_REQUIRED
        );

        let server = ServerConfig {
            tls: false,
            family: "ipv6".into(),
            ..Default::default()
        };
        assert_eq!(server.flags().unwrap(), Flags::IPV_6 | Flags::TLS_DISABLED);

        let server = ServerConfig {
            verify: "sometimes".into(),
            ..Default::default()
        };
        assert!(server.flags().is_err());
    }
}
