use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::ws::connection::ConnectionLimits;

/// Parley messenger server
#[derive(Parser, Serialize, Deserialize, Clone, Debug)]
#[command(name = "parley-server", version, about = "Parley messenger server")]
pub struct Config {
    /// Port to listen on
    #[arg(long, env = "PARLEY_PORT", default_value = "8080")]
    pub port: u16,

    /// Bind address
    #[arg(long, env = "PARLEY_BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: String,

    /// Path to TOML config file
    #[arg(long, default_value = "./parley.toml")]
    pub config: String,

    /// Enable structured JSON logging (for Docker/production)
    #[arg(long, env = "PARLEY_JSON_LOGS")]
    pub json_logs: bool,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    pub generate_config: bool,

    /// Data directory for persistent state (DB, keys)
    #[arg(long, env = "PARLEY_DATA_DIR", default_value = "./data")]
    pub data_dir: String,

    /// Connection hub tuning (loaded from [hub] section in TOML)
    #[arg(skip)]
    #[serde(default)]
    pub hub: Option<HubConfig>,

    /// Difference endpoint limits (loaded from [sync] section in TOML)
    #[arg(skip)]
    #[serde(default)]
    pub sync: Option<SyncConfig>,
}

/// Per-connection queues and keepalive timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Outbound frames buffered per connection before it is shed (default: 256)
    #[serde(default = "default_send_queue_capacity")]
    pub send_queue_capacity: usize,

    /// Register/unregister/inbound events buffered for the hub loop (default: 1024)
    #[serde(default = "default_inbound_queue_capacity")]
    pub inbound_queue_capacity: usize,

    /// Seconds without any inbound frame before a connection is dropped (default: 60)
    #[serde(default = "default_pong_wait")]
    pub pong_wait_secs: u64,

    /// Seconds between keepalive pings, must be below pong_wait_secs (default: 30)
    #[serde(default = "default_ping_period")]
    pub ping_period_secs: u64,

    /// Seconds allowed for a single frame write (default: 10)
    #[serde(default = "default_write_wait")]
    pub write_wait_secs: u64,

    /// Largest inbound frame accepted, in bytes (default: 512 KiB)
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            send_queue_capacity: 256,
            inbound_queue_capacity: 1024,
            pong_wait_secs: 60,
            ping_period_secs: 30,
            write_wait_secs: 10,
            max_frame_bytes: 512 * 1024,
        }
    }
}

fn default_send_queue_capacity() -> usize {
    256
}

fn default_inbound_queue_capacity() -> usize {
    1024
}

fn default_pong_wait() -> u64 {
    60
}

fn default_ping_period() -> u64 {
    30
}

fn default_write_wait() -> u64 {
    10
}

fn default_max_frame_bytes() -> usize {
    512 * 1024
}

impl HubConfig {
    /// Runtime limits for each connection.
    /// A ping period that does not fit inside the pong wait falls back to half of it.
    pub fn limits(&self) -> ConnectionLimits {
        let pong_wait = self.pong_wait_secs.max(1);
        let ping_period = if self.ping_period_secs == 0 || self.ping_period_secs >= pong_wait {
            let fallback_ms = pong_wait * 500;
            tracing::warn!(
                ping_period_secs = self.ping_period_secs,
                pong_wait_secs = pong_wait,
                fallback_ms = fallback_ms,
                "ping_period_secs must be below pong_wait_secs, using half of pong_wait_secs"
            );
            Duration::from_millis(fallback_ms)
        } else {
            Duration::from_secs(self.ping_period_secs)
        };

        ConnectionLimits {
            send_queue_capacity: self.send_queue_capacity.max(1),
            ping_period,
            pong_wait: Duration::from_secs(pong_wait),
            write_wait: Duration::from_secs(self.write_wait_secs.max(1)),
            max_frame_bytes: self.max_frame_bytes,
        }
    }
}

/// Page sizes for the difference endpoints.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Limit used when the request omits one (default: 100)
    #[serde(default = "default_limit")]
    pub default_limit: i64,

    /// Cap for /sync/difference (default: 1000)
    #[serde(default = "default_max_difference_limit")]
    pub max_difference_limit: i64,

    /// Cap for /sync/channel/{id}/difference (default: 500)
    #[serde(default = "default_max_channel_difference_limit")]
    pub max_channel_difference_limit: i64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            default_limit: 100,
            max_difference_limit: 1000,
            max_channel_difference_limit: 500,
        }
    }
}

fn default_limit() -> i64 {
    100
}

fn default_max_difference_limit() -> i64 {
    1000
}

fn default_max_channel_difference_limit() -> i64 {
    500
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            bind_address: "0.0.0.0".to_string(),
            config: "./parley.toml".to_string(),
            json_logs: false,
            generate_config: false,
            data_dir: "./data".to_string(),
            hub: None,
            sync: None,
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (PARLEY_*) < CLI args
    pub fn load() -> Result<Self, figment::Error> {
        let cli = Config::parse();
        let config_path = cli.config.clone();

        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed("PARLEY_").split("__"))
            .merge(Serialized::defaults(cli))
            .extract()
    }

    pub fn hub_config(&self) -> HubConfig {
        self.hub.clone().unwrap_or_default()
    }

    pub fn sync_config(&self) -> SyncConfig {
        self.sync.unwrap_or_default()
    }
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# Parley Messenger Server Configuration
# Place this file at ./parley.toml or specify with --config <path>
# All settings can be overridden via environment variables (PARLEY_PORT,
# PARLEY_HUB__SEND_QUEUE_CAPACITY, etc.) or CLI flags (--port, etc.)

# Server port (default: 8080)
# port = 8080

# Bind address (default: 0.0.0.0 — all interfaces)
# bind_address = "0.0.0.0"

# Enable structured JSON logging for Docker/production
# json_logs = false

# Data directory for SQLite database and JWT signing key
# data_dir = "./data"

# ---- Connection Hub ----
# [hub]

# Outbound frames buffered per connection; a connection that falls this far
# behind is disconnected
# send_queue_capacity = 256

# Events buffered for the hub's coordinating loop
# inbound_queue_capacity = 1024

# Keepalive: drop a connection after pong_wait_secs of silence and ping it
# every ping_period_secs (must be lower than pong_wait_secs)
# pong_wait_secs = 60
# ping_period_secs = 30

# Per-frame write timeout
# write_wait_secs = 10

# Largest inbound WebSocket frame in bytes (512 KiB)
# max_frame_bytes = 524288

# ---- Sync ----
# [sync]
# default_limit = 100
# max_difference_limit = 1000
# max_channel_difference_limit = 500
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load_toml(toml: &str) -> Config {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::string(toml))
            .extract()
            .unwrap()
    }

    #[test]
    fn template_parses_to_defaults() {
        let config = load_toml(&generate_config_template());
        assert_eq!(config.port, 8080);
        assert_eq!(config.hub_config().send_queue_capacity, 256);
        assert_eq!(config.sync_config().max_difference_limit, 1000);
    }

    #[test]
    fn partial_sections_keep_field_defaults() {
        let config = load_toml("port = 9000\n[hub]\nsend_queue_capacity = 8\n");
        assert_eq!(config.port, 9000);
        let hub = config.hub_config();
        assert_eq!(hub.send_queue_capacity, 8);
        assert_eq!(hub.pong_wait_secs, 60);
        assert_eq!(hub.limits().ping_period, Duration::from_secs(30));
    }

    #[test]
    fn ping_period_falls_back_to_half_of_pong_wait() {
        let hub = HubConfig {
            pong_wait_secs: 20,
            ping_period_secs: 25,
            ..HubConfig::default()
        };
        let limits = hub.limits();
        assert_eq!(limits.ping_period, Duration::from_secs(10));
        assert_eq!(limits.pong_wait, Duration::from_secs(20));
    }
}
