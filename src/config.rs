//! # Configuration Management
//!
//! Centralized configuration for the transport core.
//!
//! This module provides structured configuration for the listener, packet
//! limits, admission control, rate limiting, and per-connection behavior.
//! The core reads no environment variables and persists no state; a
//! [`TransportConfig`] is built here and injected into the listener
//! constructor.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//!
//! ## Security Considerations
//! - The default packet ceiling (32 KiB) bounds per-frame allocations
//! - Idle and drain deadlines prevent slowloris-style resource pinning
//! - Admission settings are locked before the listener starts

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Wire header size in bytes; no frame may declare less.
pub const HEADER_SIZE: usize = 22;

/// Default ceiling for a whole frame (header + payload).
pub const DEFAULT_MAX_PACKET_SIZE: usize = 32 * 1024;

/// Payload size above which the arena allocates directly on the heap and
/// registers the allocation for deferred reclamation.
pub const DEFAULT_HEAP_ALLOC_THRESHOLD: usize = 1024;

/// Main configuration structure containing all recognized settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct TransportConfig {
    /// Listener configuration
    #[serde(default)]
    pub listener: ListenerConfig,

    /// Packet size limits
    #[serde(default)]
    pub packet: PacketConfig,

    /// IP admission configuration
    #[serde(default)]
    pub admission: AdmissionConfig,

    /// Rate limiter criterion configuration
    #[serde(default)]
    pub ratelimit: RateLimitConfig,

    /// Per-connection behavior
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl TransportConfig {
    /// Read and parse a TOML configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("config file {}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(format!("config TOML: {e}")))
    }

    /// Render the configuration as TOML, the shape `from_toml` accepts.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(format!("config render: {e}")))
    }

    /// Defaults with a closure of tweaks applied.
    pub fn default_with_overrides(mutator: impl FnOnce(&mut Self)) -> Self {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Collect every misconfiguration across all sections. An empty list
    /// means the configuration is usable.
    pub fn validate(&self) -> Vec<String> {
        self.listener
            .validate()
            .into_iter()
            .chain(self.packet.validate())
            .chain(self.admission.validate())
            .chain(self.ratelimit.validate())
            .chain(self.connection.validate())
            .chain(self.logging.validate())
            .collect()
    }

    /// Like [`validate`](Self::validate), but any finding is an error.
    pub fn validate_strict(&self) -> Result<()> {
        let findings = self.validate();
        if findings.is_empty() {
            return Ok(());
        }
        Err(Error::Config(findings.join("; ")))
    }
}

/// Listener configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Local endpoint to bind (e.g., "127.0.0.1:7420")
    pub bind: String,

    /// Maximum number of concurrent connections
    pub max_connections: usize,

    /// Timeout for graceful shutdown before connections are forced closed
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind: String::from("127.0.0.1:7420"),
            max_connections: 1000,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl ListenerConfig {
    /// Check this section for unusable values.
    pub fn validate(&self) -> Vec<String> {
        let mut findings = Vec::new();

        if self.bind.is_empty() {
            findings.push("listener.bind is empty".into());
        } else if self.bind.parse::<std::net::SocketAddr>().is_err() {
            findings.push(format!(
                "listener.bind '{}' is not a host:port endpoint",
                self.bind
            ));
        }

        if self.max_connections == 0 {
            findings.push("listener.max_connections of 0 accepts nobody".into());
        } else if self.max_connections > 100_000 {
            findings.push(format!(
                "listener.max_connections of {} likely exceeds file-descriptor limits",
                self.max_connections
            ));
        }

        if self.shutdown_timeout < Duration::from_secs(1) {
            findings.push("listener.shutdown_timeout under 1s cannot drain connections".into());
        } else if self.shutdown_timeout > Duration::from_secs(60) {
            findings.push("listener.shutdown_timeout over 60s stalls restarts".into());
        }

        findings
    }
}

/// Packet size limits
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PacketConfig {
    /// Maximum allowed frame size in bytes, header included
    pub max_size: usize,

    /// Payload size above which the arena allocates directly on the heap
    pub heap_alloc_threshold: usize,
}

impl Default for PacketConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_PACKET_SIZE,
            heap_alloc_threshold: DEFAULT_HEAP_ALLOC_THRESHOLD,
        }
    }
}

impl PacketConfig {
    /// Check this section for unusable values.
    pub fn validate(&self) -> Vec<String> {
        let mut findings = Vec::new();

        if self.max_size < HEADER_SIZE {
            findings.push(format!(
                "packet.max_size of {} is below the {HEADER_SIZE}-byte header",
                self.max_size
            ));
        } else if self.max_size > 16 * 1024 * 1024 {
            findings.push(format!(
                "packet.max_size of {} invites memory exhaustion; keep it under 16 MiB",
                self.max_size
            ));
        }

        if self.heap_alloc_threshold == 0 {
            findings.push("packet.heap_alloc_threshold of 0 sends every payload to the heap tier".into());
        } else if self.heap_alloc_threshold > self.max_size {
            findings.push("packet.heap_alloc_threshold exceeds packet.max_size".into());
        }

        findings
    }
}

/// IP admission configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Default ban duration in minutes applied when a criterion reports a
    /// violation or `try_ban` is called without an explicit expiry
    pub ban_minutes: u64,

    /// Interval between purges of expired bans and stale criterion state
    #[serde(with = "duration_secs", rename = "purge_interval_seconds")]
    pub purge_interval: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            ban_minutes: 30,
            purge_interval: Duration::from_secs(60),
        }
    }
}

impl AdmissionConfig {
    /// Check this section for unusable values.
    pub fn validate(&self) -> Vec<String> {
        let mut findings = Vec::new();

        if self.ban_minutes == 0 {
            findings.push("admission.ban_minutes of 0 makes every ban a no-op".into());
        }

        if self.purge_interval.is_zero() {
            findings.push("admission.purge_interval_seconds of 0 spins the purge task".into());
        } else if self.purge_interval > Duration::from_secs(3600) {
            findings.push("admission.purge_interval_seconds over an hour lets expired bans pile up".into());
        }

        findings
    }

    /// Ban duration as a [`Duration`]
    pub fn ban_time(&self) -> Duration {
        Duration::from_secs(self.ban_minutes * 60)
    }
}

/// Rate limiter criterion configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Requests allowed inside the sliding window
    pub max_requests: usize,

    /// Sliding window length in milliseconds
    pub window_ms: u64,

    /// Lockout applied after the threshold is breached, in seconds
    pub lockout_seconds: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window_ms: 1000,
            lockout_seconds: 60,
        }
    }
}

impl RateLimitConfig {
    /// Check this section for unusable values.
    pub fn validate(&self) -> Vec<String> {
        let mut findings = Vec::new();

        if self.max_requests == 0 {
            findings.push("ratelimit.max_requests of 0 locks out every caller".into());
        }

        if self.window_ms == 0 {
            findings.push("ratelimit.window_ms of 0 makes the window empty".into());
        } else if self.window_ms > 3_600_000 {
            findings.push("ratelimit.window_ms over an hour retains needless history".into());
        }

        findings
    }
}

/// Per-connection behavior
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Close the connection when no bytes arrive for this long
    #[serde(with = "duration_secs", rename = "idle_timeout_seconds")]
    pub idle_timeout: Duration,

    /// Tx queue depth at which the read task pauses
    pub tx_highwater: usize,

    /// Tx queue depth at which a paused read task resumes
    pub tx_lowwater: usize,

    /// How long a send may wait on a saturated tx queue before the
    /// connection closes with a backpressure disposition
    #[serde(with = "duration_millis")]
    pub tx_drain_deadline: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(120),
            tx_highwater: 256,
            tx_lowwater: 64,
            tx_drain_deadline: Duration::from_secs(5),
        }
    }
}

impl ConnectionConfig {
    /// Check this section for unusable values.
    pub fn validate(&self) -> Vec<String> {
        let mut findings = Vec::new();

        if self.idle_timeout < Duration::from_secs(1) {
            findings.push("connection.idle_timeout_seconds under 1s closes healthy peers".into());
        } else if self.idle_timeout > Duration::from_secs(86_400) {
            findings.push("connection.idle_timeout_seconds over a day pins dead sockets".into());
        }

        if self.tx_highwater == 0 {
            findings.push("connection.tx_highwater of 0 leaves no room to send".into());
        } else if self.tx_highwater > 1_000_000 {
            findings.push(format!(
                "connection.tx_highwater of {} buffers unbounded memory per peer",
                self.tx_highwater
            ));
        }

        if self.tx_lowwater >= self.tx_highwater {
            findings.push(format!(
                "connection.tx_lowwater ({}) must sit below tx_highwater ({})",
                self.tx_lowwater, self.tx_highwater
            ));
        }

        if self.tx_drain_deadline < Duration::from_millis(10) {
            findings.push("connection.tx_drain_deadline under 10ms trips on scheduler jitter".into());
        }

        findings
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("framewire"),
            log_level: Level::INFO,
            log_to_console: true,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Check this section for unusable values.
    pub fn validate(&self) -> Vec<String> {
        let mut findings = Vec::new();

        if self.app_name.is_empty() {
            findings.push("logging.app_name is empty".into());
        } else if self.app_name.len() > 64 {
            findings.push(format!(
                "logging.app_name of {} characters will not fit log line prefixes",
                self.app_name.len()
            ));
        }

        findings
    }
}

/// `Duration` as a bare millisecond count in TOML.
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        u64::deserialize(de).map(Duration::from_millis)
    }
}

/// `Duration` as a bare second count in TOML.
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        u64::deserialize(de).map(Duration::from_secs)
    }
}

/// `tracing::Level` as its lowercase name in TOML.
mod log_level_serde {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S: Serializer>(level: &Level, ser: S) -> Result<S::Ok, S::Error> {
        ser.collect_str(&level.to_string().to_lowercase())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Level, D::Error> {
        let text = String::deserialize(de)?;
        Level::from_str(&text).map_err(|_| D::Error::custom(format!("unknown log level '{text}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate_clean() {
        let config = TransportConfig::default();
        let errors = config.validate();
        assert!(errors.is_empty(), "default config invalid: {errors:?}");
    }

    #[test]
    fn toml_roundtrip() {
        let config = TransportConfig::default();
        let rendered = config.to_toml().unwrap();
        let parsed = TransportConfig::from_toml(&rendered).unwrap();
        assert_eq!(parsed.listener.bind, config.listener.bind);
        assert_eq!(parsed.packet.max_size, config.packet.max_size);
        assert_eq!(parsed.connection.tx_highwater, config.connection.tx_highwater);
    }

    #[test]
    fn recognized_keys_parse() {
        let toml = r#"
            [listener]
            bind = "0.0.0.0:9100"
            max_connections = 64

            [packet]
            max_size = 16384
            heap_alloc_threshold = 512

            [admission]
            ban_minutes = 5
            purge_interval_seconds = 30

            [ratelimit]
            max_requests = 3
            window_ms = 1000
            lockout_seconds = 60

            [connection]
            idle_timeout_seconds = 15
            tx_highwater = 4
            tx_lowwater = 2
            tx_drain_deadline = 250
        "#;
        let config = TransportConfig::from_toml(toml).unwrap();
        assert_eq!(config.listener.max_connections, 64);
        assert_eq!(config.packet.max_size, 16384);
        assert_eq!(config.admission.ban_minutes, 5);
        assert_eq!(config.ratelimit.max_requests, 3);
        assert_eq!(config.connection.tx_highwater, 4);
        assert_eq!(config.connection.tx_drain_deadline, Duration::from_millis(250));
    }

    #[test]
    fn lowwater_above_highwater_rejected() {
        let config = TransportConfig::default_with_overrides(|c| {
            c.connection.tx_highwater = 2;
            c.connection.tx_lowwater = 8;
        });
        assert!(config.validate_strict().is_err());
    }

    #[test]
    fn max_size_below_header_rejected() {
        let config = TransportConfig::default_with_overrides(|c| {
            c.packet.max_size = HEADER_SIZE - 1;
        });
        assert!(!config.validate().is_empty());
    }
}
