//! Hub configuration loading.
//!
//! Device endpoints resolve in priority order: command-line arguments,
//! then the `HUB_DEVICES` environment variable (comma-separated), then the
//! `devices` list in the TOML file.  An empty list is permitted — the hub
//! then runs with only its local components.
//!
//! Every other key has a default, so the config file itself is optional.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Default config path when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/parambus/hub.toml";

/// Environment variable carrying a comma-separated device endpoint list.
pub const DEVICES_ENV_VAR: &str = "HUB_DEVICES";

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// Validated hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Remote device endpoints, `IP` or `IP:PORT`.
    pub devices: Vec<String>,
    /// Port for the hub's own protocol server.
    pub server_port: u16,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub reconnect_delay: Duration,
    /// Politeness pacer between discovery requests.
    pub discovery_delay: Duration,
    /// Pacer between subscribe requests.
    pub subscribe_delay: Duration,
    /// Per-request timeout on device sessions.
    pub request_timeout: Duration,
    /// Fallback log filter when `RUST_LOG` is not set.
    pub log_level: String,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
            server_port: 8080,
            ping_interval: Duration::from_secs(20),
            ping_timeout: Duration::from_secs(20),
            reconnect_delay: Duration::from_secs(5),
            discovery_delay: Duration::from_millis(50),
            subscribe_delay: Duration::from_millis(20),
            request_timeout: Duration::from_secs(10),
            log_level: "info".to_owned(),
        }
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    devices: Option<Vec<String>>,
    server_port: Option<u16>,
    ping_interval_secs: Option<u64>,
    ping_timeout_secs: Option<u64>,
    reconnect_delay_secs: Option<u64>,
    discovery_delay_ms: Option<u64>,
    subscribe_delay_ms: Option<u64>,
    request_timeout_secs: Option<u64>,
    log_level: Option<String>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load configuration, merging the TOML file (if present), the environment,
/// and the CLI device list.
///
/// `cli_devices` wins over `HUB_DEVICES`, which wins over the file.
pub fn load_config(path: &Path, cli_devices: &[String]) -> Result<HubConfig, ConfigError> {
    let raw = if path.exists() {
        let toml_str = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::Io(format!("reading config file '{}': {}", path.display(), e))
        })?;
        toml::from_str(&toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?
    } else {
        RawConfig::default()
    };

    let env_devices = std::env::var(DEVICES_ENV_VAR).ok();
    Ok(merge(raw, env_devices.as_deref(), cli_devices))
}

/// Load configuration from a TOML string (for tests).
pub fn load_config_from_str(
    toml_str: &str,
    env_devices: Option<&str>,
    cli_devices: &[String],
) -> Result<HubConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;
    Ok(merge(raw, env_devices, cli_devices))
}

fn merge(raw: RawConfig, env_devices: Option<&str>, cli_devices: &[String]) -> HubConfig {
    let defaults = HubConfig::default();

    let devices = if !cli_devices.is_empty() {
        cli_devices.to_vec()
    } else if let Some(env) = env_devices {
        env.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToOwned::to_owned)
            .collect()
    } else {
        raw.devices.unwrap_or_default()
    };

    HubConfig {
        devices,
        server_port: raw.server_port.unwrap_or(defaults.server_port),
        ping_interval: raw
            .ping_interval_secs
            .map_or(defaults.ping_interval, Duration::from_secs),
        ping_timeout: raw
            .ping_timeout_secs
            .map_or(defaults.ping_timeout, Duration::from_secs),
        reconnect_delay: raw
            .reconnect_delay_secs
            .map_or(defaults.reconnect_delay, Duration::from_secs),
        discovery_delay: raw
            .discovery_delay_ms
            .map_or(defaults.discovery_delay, Duration::from_millis),
        subscribe_delay: raw
            .subscribe_delay_ms
            .map_or(defaults.subscribe_delay, Duration::from_millis),
        request_timeout: raw
            .request_timeout_secs
            .map_or(defaults.request_timeout, Duration::from_secs),
        log_level: raw.log_level.unwrap_or(defaults.log_level),
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
}
