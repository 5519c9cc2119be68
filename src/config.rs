//! Environment-driven configuration for the collector

use std::time::Duration;

use url::Url;

use crate::{Error, Result};

/// Default cloud API base URL
const DEFAULT_API_BASE: &str = "https://api.wattline.io/apiservice/api/v1";

/// Default realtime stream base URL
const DEFAULT_STREAM_BASE: &str = "wss://rt.wattline.io";

/// Collector configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Cloud API settings
    pub api: ApiConfig,

    /// Realtime stream settings
    pub stream: StreamConfig,

    /// Device descriptor lookup settings
    pub lookup: LookupConfig,

    /// HTTP polling settings
    pub poll: PollConfig,

    /// `InfluxDB` sink settings
    pub influx: InfluxConfig,
}

/// Cloud API settings
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Account email (from `WATTLINE_API_EMAIL`)
    pub email: String,

    /// Account password (from `WATTLINE_API_PASSWORD`)
    pub password: String,

    /// REST API base URL
    pub api_base: Url,

    /// WebSocket stream base URL
    pub stream_base: Url,
}

/// Realtime stream settings
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// How long a read may block before the socket is checked for staleness
    pub heartbeat_interval: Duration,

    /// Silence longer than this marks the session stale
    pub heartbeat_timeout: Duration,

    /// First reconnect delay after an unexpected disconnect
    pub reconnect_delay_initial: Duration,

    /// Ceiling for the doubling reconnect delay
    pub reconnect_delay_cap: Duration,

    /// Connection attempts before a connect failure becomes fatal
    pub max_retries: u32,

    /// Base multiplier for the connect retry backoff
    pub backoff_factor: u32,

    /// Planned session lifetime before a deliberate reconnect
    pub rotation_interval: Duration,
}

/// Device descriptor lookup settings
#[derive(Debug, Clone)]
pub struct LookupConfig {
    /// How long a cached descriptor stays fresh
    pub cache_ttl: Duration,

    /// Number of concurrent lookup workers
    pub workers: usize,

    /// Pause between consecutive lookups on one worker
    pub delay: Duration,
}

/// HTTP polling settings
#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Monitor status poll period
    pub status_interval: Duration,

    /// Device inventory poll period
    pub inventory_interval: Duration,

    /// Timeline poll period
    pub timeline_interval: Duration,
}

/// `InfluxDB` sink settings
#[derive(Debug, Clone)]
pub struct InfluxConfig {
    /// Server base URL (from `WATTLINE_INFLUXDB_URL`)
    pub url: Url,

    /// API token (from `WATTLINE_INFLUXDB_TOKEN`)
    pub token: String,

    /// Organization name (from `WATTLINE_INFLUXDB_ORG`)
    pub org: String,

    /// Bucket name (from `WATTLINE_INFLUXDB_BUCKET`)
    pub bucket: String,
}

impl Config {
    /// Load collector configuration from the environment
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` when a required variable is unset or a URL
    /// value does not parse.
    pub fn from_env() -> Result<Self> {
        let mut missing = Vec::new();
        let email = require("WATTLINE_API_EMAIL", &mut missing);
        let password = require("WATTLINE_API_PASSWORD", &mut missing);
        let influx_url = require("WATTLINE_INFLUXDB_URL", &mut missing);
        let influx_token = require("WATTLINE_INFLUXDB_TOKEN", &mut missing);
        let influx_org = require("WATTLINE_INFLUXDB_ORG", &mut missing);
        let influx_bucket = require("WATTLINE_INFLUXDB_BUCKET", &mut missing);

        if !missing.is_empty() {
            return Err(Error::Config(format!(
                "missing required environment variables: {}",
                missing.join(", ")
            )));
        }

        let api = ApiConfig {
            email,
            password,
            api_base: env_url("WATTLINE_API_BASE", DEFAULT_API_BASE)?,
            stream_base: env_url("WATTLINE_STREAM_BASE", DEFAULT_STREAM_BASE)?,
        };

        let stream = StreamConfig {
            heartbeat_interval: env_secs("WATTLINE_WS_HEARTBEAT_INTERVAL", 10),
            heartbeat_timeout: env_secs("WATTLINE_WS_HEARTBEAT_TIMEOUT", 30),
            reconnect_delay_initial: env_secs("WATTLINE_WS_RECONNECT_DELAY_INITIAL", 5),
            reconnect_delay_cap: env_secs("WATTLINE_WS_RECONNECT_DELAY_CAP", 60),
            max_retries: env_u32("WATTLINE_WS_MAX_RETRIES", 3),
            backoff_factor: env_u32("WATTLINE_WS_BACKOFF_FACTOR", 1),
            rotation_interval: env_secs("WATTLINE_WS_ROTATION_INTERVAL", 840),
        };

        let lookup = LookupConfig {
            cache_ttl: env_secs("WATTLINE_CACHE_TTL", 120),
            workers: env_count("WATTLINE_LOOKUP_WORKERS", 4),
            delay: env_secs_f64("WATTLINE_LOOKUP_DELAY", 0.5),
        };

        let poll = PollConfig {
            status_interval: env_secs("WATTLINE_STATUS_POLL_INTERVAL", 60),
            inventory_interval: env_secs("WATTLINE_INVENTORY_POLL_INTERVAL", 3600),
            timeline_interval: env_secs("WATTLINE_TIMELINE_POLL_INTERVAL", 60),
        };

        let influx = InfluxConfig {
            url: influx_url.parse().map_err(|e| {
                Error::Config(format!(
                    "WATTLINE_INFLUXDB_URL is not a valid URL ({influx_url}): {e}"
                ))
            })?,
            token: influx_token,
            org: influx_org,
            bucket: influx_bucket,
        };

        Ok(Self {
            api,
            stream,
            lookup,
            poll,
            influx,
        })
    }

    /// Log the resolved configuration with secrets masked
    pub fn log_summary(&self) {
        tracing::info!(
            email = %self.api.email,
            password = %obscure(&self.api.password),
            api_base = %self.api.api_base,
            stream_base = %self.api.stream_base,
            "api configuration"
        );
        tracing::info!(
            heartbeat_interval_secs = self.stream.heartbeat_interval.as_secs(),
            heartbeat_timeout_secs = self.stream.heartbeat_timeout.as_secs(),
            reconnect_delay_initial_secs = self.stream.reconnect_delay_initial.as_secs(),
            reconnect_delay_cap_secs = self.stream.reconnect_delay_cap.as_secs(),
            max_retries = self.stream.max_retries,
            backoff_factor = self.stream.backoff_factor,
            rotation_interval_secs = self.stream.rotation_interval.as_secs(),
            "stream configuration"
        );
        tracing::info!(
            cache_ttl_secs = self.lookup.cache_ttl.as_secs(),
            workers = self.lookup.workers,
            delay_secs = self.lookup.delay.as_secs_f64(),
            "lookup configuration"
        );
        tracing::info!(
            status_interval_secs = self.poll.status_interval.as_secs(),
            inventory_interval_secs = self.poll.inventory_interval.as_secs(),
            timeline_interval_secs = self.poll.timeline_interval.as_secs(),
            "poll configuration"
        );
        tracing::info!(
            url = %self.influx.url,
            token = %obscure(&self.influx.token),
            org = %self.influx.org,
            bucket = %self.influx.bucket,
            "influxdb configuration"
        );
    }
}

/// Read a required variable, recording its name when unset or empty
fn require(name: &'static str, missing: &mut Vec<&'static str>) -> String {
    match std::env::var(name) {
        Ok(value) if !value.is_empty() => value,
        _ => {
            missing.push(name);
            String::new()
        }
    }
}

fn env_url(name: &'static str, default: &str) -> Result<Url> {
    let raw = std::env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse()
        .map_err(|e| Error::Config(format!("{name} is not a valid URL ({raw}): {e}")))
}

fn env_secs(name: &str, default: u64) -> Duration {
    parse_secs(std::env::var(name).ok(), default)
}

fn env_secs_f64(name: &str, default: f64) -> Duration {
    parse_secs_f64(std::env::var(name).ok(), default)
}

fn env_u32(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_count(name: &str, default: usize) -> usize {
    parse_count(std::env::var(name).ok(), default)
}

fn parse_secs(raw: Option<String>, default: u64) -> Duration {
    Duration::from_secs(raw.and_then(|s| s.parse().ok()).unwrap_or(default))
}

fn parse_secs_f64(raw: Option<String>, default: f64) -> Duration {
    let secs = raw
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v >= 0.0)
        .unwrap_or(default);
    Duration::from_secs_f64(secs)
}

fn parse_count(raw: Option<String>, default: usize) -> usize {
    raw.and_then(|s| s.parse().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

/// Mask a secret, keeping the first and last two characters when long enough
fn obscure(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() > 4 {
        let head: String = chars[..2].iter().collect();
        let tail: String = chars[chars.len() - 2..].iter().collect();
        format!("{head}{}{tail}", "*".repeat(chars.len() - 4))
    } else {
        "*".repeat(chars.len())
    }
}
