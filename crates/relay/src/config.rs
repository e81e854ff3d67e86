// Relay server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development.

use std::{net::SocketAddr, time::Duration};

const DEFAULT_PORT: u16 = 3001;
const DEFAULT_PRESENCE_TTL_SECS: u64 = 3600;
const TEST_PRESENCE_TTL_SECS: u64 = 60;
const DEFAULT_KEEPALIVE_INTERVAL_MS: u64 = 20_000;
const DEFAULT_UPDATE_RETRY_DELAY_MS: u64 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Core relay server configuration.
///
/// Constructed via [`RelayConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// Log filter directive (e.g. `info`, `quire_relay=debug`).
    pub log_filter: String,
    pub log_format: LogFormat,
    /// Presence store/bus location. `None` selects the in-process backend.
    pub redis_url: Option<String>,
    /// Sliding expiry applied to every presence entry on join and refresh.
    pub presence_ttl: Duration,
    pub keepalive_interval: Duration,
    /// How long updates are held before the peer channel is marked connected.
    pub update_retry_delay: Duration,
    /// Seed document `"1"` with sample text at startup.
    pub seed_sample_doc: bool,
    /// Comma-separated browser origins for the HTTP routes. `None` or `*`
    /// allows any origin.
    pub cors_origins: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::from_env_fn(|_| Err(std::env::VarError::NotPresent))
    }
}

impl RelayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `QUIRE_RELAY_HOST` | `0.0.0.0` |
    /// | `QUIRE_RELAY_PORT` | `3001` |
    /// | `QUIRE_RELAY_LOG_FILTER` | `info` |
    /// | `QUIRE_RELAY_LOG_FORMAT` | `text` (`json` for structured output) |
    /// | `QUIRE_RELAY_REDIS_URL` | *(none, in-memory presence)* |
    /// | `QUIRE_RELAY_PRESENCE_TTL_SECS` | `3600` |
    /// | `QUIRE_RELAY_KEEPALIVE_INTERVAL_MS` | `20000` |
    /// | `QUIRE_RELAY_UPDATE_RETRY_DELAY_MS` | `1000` |
    /// | `QUIRE_RELAY_SEED_SAMPLE_DOC` | `true` |
    /// | `QUIRE_RELAY_CORS_ORIGINS` | *(none, any origin)* |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("QUIRE_RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 =
            env("QUIRE_RELAY_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(DEFAULT_PORT);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let log_filter = env("QUIRE_RELAY_LOG_FILTER").unwrap_or_else(|_| "info".into());
        let log_format = match env("QUIRE_RELAY_LOG_FORMAT") {
            Ok(value) if value.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        let redis_url = env("QUIRE_RELAY_REDIS_URL").ok().filter(|url| !url.trim().is_empty());

        let millis = |key: &str, default: u64| {
            Duration::from_millis(
                env(key).ok().and_then(|v| v.parse().ok()).filter(|v| *v > 0).unwrap_or(default),
            )
        };
        let presence_ttl = Duration::from_secs(
            env("QUIRE_RELAY_PRESENCE_TTL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|v| *v > 0)
                .unwrap_or(DEFAULT_PRESENCE_TTL_SECS),
        );
        let keepalive_interval =
            millis("QUIRE_RELAY_KEEPALIVE_INTERVAL_MS", DEFAULT_KEEPALIVE_INTERVAL_MS);
        let update_retry_delay =
            millis("QUIRE_RELAY_UPDATE_RETRY_DELAY_MS", DEFAULT_UPDATE_RETRY_DELAY_MS);

        let seed_sample_doc = env("QUIRE_RELAY_SEED_SAMPLE_DOC")
            .ok()
            .and_then(|v| parse_bool(&v))
            .unwrap_or(true);

        let cors_origins =
            env("QUIRE_RELAY_CORS_ORIGINS").ok().filter(|origins| !origins.trim().is_empty());

        Self {
            listen_addr,
            log_filter,
            log_format,
            redis_url,
            presence_ttl,
            keepalive_interval,
            update_retry_delay,
            seed_sample_doc,
            cors_origins,
        }
    }

    /// Reference configuration for tests: in-memory presence, 60 s TTL,
    /// ephemeral port.
    pub fn for_tests() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            redis_url: None,
            presence_ttl: Duration::from_secs(TEST_PRESENCE_TTL_SECS),
            ..Self::default()
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
