//! SFU Controller configuration.
//!
//! Configuration is loaded from environment variables. Every variable has a
//! default; values that are present but unparseable are rejected rather than
//! silently replaced.

use std::collections::HashMap;
use std::env;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default WebSocket signaling bind address.
pub const DEFAULT_SIGNALING_BIND_ADDRESS: &str = "0.0.0.0:3000";

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Default deadline for a single media engine call, in milliseconds.
pub const DEFAULT_ENGINE_TIMEOUT_MS: u64 = 10_000;

/// Default lifetime of a room nobody joins, in milliseconds.
pub const DEFAULT_EMPTY_ROOM_TTL_MS: u64 = 30_000;

/// Default maximum concurrent signaling connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10_000;

/// Default maximum size of one inbound signaling frame, in bytes.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 65_536;

/// Default capacity of each connection's outbound queue.
pub const DEFAULT_OUTBOUND_BUFFER: usize = 256;

/// Default IP the media engine listens on for RTC traffic.
pub const DEFAULT_RTC_LISTEN_IP: &str = "127.0.0.1";

/// Default number of media engine workers.
pub const DEFAULT_WORKERS: usize = 1;

/// Default RTC port range.
pub const DEFAULT_RTC_MIN_PORT: u16 = 10_000;
pub const DEFAULT_RTC_MAX_PORT: u16 = 59_999;

/// Default SFU instance ID prefix.
pub const DEFAULT_SFU_ID_PREFIX: &str = "sfu";

/// SFU Controller configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// WebSocket signaling bind address (default: "0.0.0.0:3000").
    pub signaling_bind_address: String,

    /// Health endpoint bind address (default: "0.0.0.0:8081").
    pub health_bind_address: String,

    /// Unique identifier for this SFU instance.
    pub sfu_id: String,

    /// Deadline for each media engine call (default: 10s).
    pub engine_timeout: Duration,

    /// How long a created room may go unjoined before it is released
    /// (default: 30s).
    pub empty_room_ttl: Duration,

    /// Maximum concurrent signaling connections (must be > 0).
    pub max_connections: usize,

    /// Maximum inbound frame size in bytes.
    pub max_message_size: usize,

    /// Per-connection outbound queue capacity (must be > 0).
    pub outbound_buffer: usize,

    /// IP the media engine binds for ICE/DTLS/RTP.
    pub rtc_listen_ip: IpAddr,

    /// Address announced in ICE candidates when behind NAT.
    pub rtc_announced_address: Option<String>,

    /// Number of media engine workers (must be > 0).
    pub workers: usize,

    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let signaling_bind_address = vars
            .get("SFU_SIGNALING_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_SIGNALING_BIND_ADDRESS.to_string());

        let health_bind_address = vars
            .get("SFU_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let engine_timeout_ms: u64 =
            parse_var(vars, "SFU_ENGINE_TIMEOUT_MS", DEFAULT_ENGINE_TIMEOUT_MS)?;
        if engine_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "SFU_ENGINE_TIMEOUT_MS must be greater than 0".to_string(),
            ));
        }

        let empty_room_ttl_ms: u64 =
            parse_var(vars, "SFU_EMPTY_ROOM_TTL_MS", DEFAULT_EMPTY_ROOM_TTL_MS)?;
        if empty_room_ttl_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "SFU_EMPTY_ROOM_TTL_MS must be greater than 0".to_string(),
            ));
        }

        let max_connections = parse_positive(vars, "SFU_MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS)?;
        let max_message_size =
            parse_positive(vars, "SFU_MAX_MESSAGE_SIZE", DEFAULT_MAX_MESSAGE_SIZE)?;
        let outbound_buffer = parse_positive(vars, "SFU_OUTBOUND_BUFFER", DEFAULT_OUTBOUND_BUFFER)?;
        let workers = parse_positive(vars, "SFU_WORKERS", DEFAULT_WORKERS)?;

        let rtc_listen_ip = match vars.get("SFU_RTC_LISTEN_IP") {
            Some(raw) => raw.parse().map_err(|_| {
                ConfigError::InvalidValue(format!("SFU_RTC_LISTEN_IP is not an IP address: {raw}"))
            })?,
            None => IpAddr::from_str(DEFAULT_RTC_LISTEN_IP)
                .map_err(|e| ConfigError::InvalidValue(e.to_string()))?,
        };

        let rtc_announced_address = vars
            .get("SFU_RTC_ANNOUNCED_ADDRESS")
            .filter(|s| !s.is_empty())
            .cloned();

        let rtc_min_port = parse_var(vars, "SFU_RTC_MIN_PORT", DEFAULT_RTC_MIN_PORT)?;
        let rtc_max_port = parse_var(vars, "SFU_RTC_MAX_PORT", DEFAULT_RTC_MAX_PORT)?;
        if rtc_min_port > rtc_max_port {
            return Err(ConfigError::InvalidValue(format!(
                "SFU_RTC_MIN_PORT ({rtc_min_port}) exceeds SFU_RTC_MAX_PORT ({rtc_max_port})"
            )));
        }

        // Generate SFU instance ID
        let sfu_id = vars.get("SFU_ID").cloned().unwrap_or_else(|| {
            let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_SFU_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        Ok(Config {
            signaling_bind_address,
            health_bind_address,
            sfu_id,
            engine_timeout: Duration::from_millis(engine_timeout_ms),
            empty_room_ttl: Duration::from_millis(empty_room_ttl_ms),
            max_connections,
            max_message_size,
            outbound_buffer,
            rtc_listen_ip,
            rtc_announced_address,
            workers,
            rtc_min_port,
            rtc_max_port,
        })
    }
}

fn parse_var<T: FromStr>(
    vars: &HashMap<String, String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{name} is not a valid number: {raw}"))),
        None => Ok(default),
    }
}

fn parse_positive(
    vars: &HashMap<String, String>,
    name: &str,
    default: usize,
) -> Result<usize, ConfigError> {
    let value = parse_var(vars, name, default)?;
    if value == 0 {
        return Err(ConfigError::InvalidValue(format!(
            "{name} must be greater than 0"
        )));
    }
    Ok(value)
}
