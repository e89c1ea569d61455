//! Configuration – reads/writes `limo.toml`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use limo_cockpit::CockpitSettings;
use limo_middleware::{BusSettings, RouterSettings};
use limo_perception::Quantizer;
use limo_types::LimoError;

/// File name used when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "limo.toml";

/// Store host used by `--dockerized` (the compose service name).
pub const DOCKER_REDIS_HOST: &str = "redis";

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format {other:?}")),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Sections
// ─────────────────────────────────────────────────────────────────────────────

/// `[redis]` – the key-value store / message bus.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_host")]
    pub host: String,
    #[serde(default = "default_redis_port")]
    pub port: u16,
    #[serde(default = "default_redis_user")]
    pub user: String,
    /// Stored as plain text; the file is written owner-only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default)]
    pub database: i64,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    #[serde(default = "default_pool_wait_ms")]
    pub pool_wait_ms: u64,
}

impl std::fmt::Debug for RedisConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field(
                "password",
                if self.password.is_none() { &"<not set>" } else { &"<redacted>" },
            )
            .field("database", &self.database)
            .field("pool_size", &self.pool_size)
            .field("pool_wait_ms", &self.pool_wait_ms)
            .finish()
    }
}

impl RedisConfig {
    pub fn bus_settings(&self) -> BusSettings {
        BusSettings {
            host: self.host.clone(),
            port: self.port,
            user: self.user.clone(),
            password: self.password.clone(),
            database: self.database,
            pool_size: self.pool_size,
            pool_wait: Duration::from_millis(self.pool_wait_ms),
            ..BusSettings::default()
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: default_redis_host(),
            port: default_redis_port(),
            user: default_redis_user(),
            password: None,
            database: 0,
            pool_size: default_pool_size(),
            pool_wait_ms: default_pool_wait_ms(),
        }
    }
}

/// `[webserver]` – where consoles connect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebServerConfig {
    #[serde(default = "default_web_host")]
    pub host: String,
    #[serde(default = "default_web_port")]
    pub port: u16,
}

impl Default for WebServerConfig {
    fn default() -> Self {
        Self {
            host: default_web_host(),
            port: default_web_port(),
        }
    }
}

/// `[fleet]` – liveness, map grid and console behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetConfig {
    #[serde(default = "default_keep_alive_timeout_ms")]
    pub keep_alive_timeout_ms: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    /// Physical size of one map grid cell, in metres.
    #[serde(default = "default_cell_size")]
    pub cell_size: f64,
    #[serde(default = "default_max_points_per_frame")]
    pub max_points_per_frame: usize,
    #[serde(default = "default_connect_retry_delay_ms")]
    pub connect_retry_delay_ms: u64,
    #[serde(default = "default_echo_ttl_ms")]
    pub echo_ttl_ms: u64,
    #[serde(default = "default_true")]
    pub per_robot_channels: bool,
}

impl FleetConfig {
    pub fn keep_alive_timeout(&self) -> Duration {
        Duration::from_millis(self.keep_alive_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_millis(self.connect_retry_delay_ms)
    }

    pub fn router_settings(&self) -> RouterSettings {
        RouterSettings {
            quantizer: Quantizer::new(self.cell_size),
            max_points_per_frame: self.max_points_per_frame,
            per_robot_channels: self.per_robot_channels,
        }
    }

    pub fn cockpit_settings(&self) -> CockpitSettings {
        CockpitSettings {
            max_points_per_frame: self.max_points_per_frame,
            echo_ttl: Duration::from_millis(self.echo_ttl_ms),
        }
    }
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            keep_alive_timeout_ms: default_keep_alive_timeout_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            cell_size: default_cell_size(),
            max_points_per_frame: default_max_points_per_frame(),
            connect_retry_delay_ms: default_connect_retry_delay_ms(),
            echo_ttl_ms: default_echo_ttl_ms(),
            per_robot_channels: true,
        }
    }
}

/// Persisted control-center configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub log_format: LogFormat,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub webserver: WebServerConfig,
    #[serde(default)]
    pub fleet: FleetConfig,
}

fn default_redis_host() -> String {
    "localhost".to_string()
}
fn default_redis_port() -> u16 {
    6379
}
fn default_redis_user() -> String {
    "default".to_string()
}
fn default_pool_size() -> u32 {
    8
}
fn default_pool_wait_ms() -> u64 {
    1000
}
fn default_web_host() -> String {
    "0.0.0.0".to_string()
}
fn default_web_port() -> u16 {
    8080
}
fn default_keep_alive_timeout_ms() -> u64 {
    10_000
}
fn default_sweep_interval_ms() -> u64 {
    1000
}
fn default_cell_size() -> f64 {
    limo_perception::DEFAULT_CELL_SIZE
}
fn default_max_points_per_frame() -> usize {
    limo_middleware::DEFAULT_MAX_POINTS_PER_FRAME
}
fn default_connect_retry_delay_ms() -> u64 {
    5000
}
fn default_echo_ttl_ms() -> u64 {
    5000
}
fn default_true() -> bool {
    true
}

// ─────────────────────────────────────────────────────────────────────────────
// Load / save
// ─────────────────────────────────────────────────────────────────────────────

/// Where [`load_or_init`] got its configuration from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigOrigin {
    /// Read from an existing file.
    File,
    /// Defaults, freshly written to the file.
    Defaults,
}

/// Load `path`, or write the defaults there first when it is missing or
/// `reset` is set.  Environment overrides are applied after the file is
/// read and never written back.
///
/// Runs before tracing is initialised, so it reports what happened through
/// the returned [`ConfigOrigin`] instead of logging.
pub fn load_or_init(path: &Path, reset: bool) -> Result<(Config, ConfigOrigin), LimoError> {
    let existing = if reset { None } else { load_from(path)? };
    let (mut cfg, origin) = match existing {
        Some(cfg) => (cfg, ConfigOrigin::File),
        None => {
            let cfg = Config::default();
            save_to(&cfg, path)?;
            (cfg, ConfigOrigin::Defaults)
        }
    };
    apply_env_overrides(&mut cfg);
    Ok((cfg, origin))
}

/// Load the config from `path`.  Returns `None` if the file does not exist.
pub fn load_from(path: &Path) -> Result<Option<Config>, LimoError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|e| {
        LimoError::Config(format!("failed to read config at {}: {e}", path.display()))
    })?;
    let cfg: Config = toml::from_str(&raw)
        .map_err(|e| LimoError::Config(format!("failed to parse config: {e}")))?;
    Ok(Some(cfg))
}

/// Apply `LIMO_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `LIMO_REDIS_HOST` | `redis.host` |
/// | `LIMO_REDIS_PORT` | `redis.port` |
/// | `LIMO_REDIS_PASSWORD` | `redis.password` |
/// | `LIMO_WEB_HOST` | `webserver.host` |
/// | `LIMO_WEB_PORT` | `webserver.port` |
/// | `LIMO_KEEP_ALIVE_TIMEOUT_MS` | `fleet.keep_alive_timeout_ms` |
/// | `LIMO_LOG_FORMAT` | `log_format` |
///
/// Values that do not parse are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    apply_overrides_from(cfg, |name| std::env::var(name).ok());
}

/// Override source extracted for testability without mutating the process
/// environment.
pub(crate) fn apply_overrides_from(cfg: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("LIMO_REDIS_HOST") {
        cfg.redis.host = v;
    }
    if let Some(v) = var("LIMO_REDIS_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.redis.port = port;
    }
    if let Some(v) = var("LIMO_REDIS_PASSWORD") {
        cfg.redis.password = (!v.is_empty()).then_some(v);
    }
    if let Some(v) = var("LIMO_WEB_HOST") {
        cfg.webserver.host = v;
    }
    if let Some(v) = var("LIMO_WEB_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.webserver.port = port;
    }
    if let Some(v) = var("LIMO_KEEP_ALIVE_TIMEOUT_MS")
        && let Ok(ms) = v.parse::<u64>()
    {
        cfg.fleet.keep_alive_timeout_ms = ms;
    }
    if let Some(v) = var("LIMO_LOG_FORMAT")
        && let Ok(format) = v.parse::<LogFormat>()
    {
        cfg.log_format = format;
    }
}

/// Save the config to `path`, creating its directory if necessary.
pub fn save_to(cfg: &Config, path: &Path) -> Result<(), LimoError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|e| LimoError::Config(format!("failed to create config directory: {e}")))?;
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| LimoError::Config(format!("failed to serialize config: {e}")))?;
    // Owner-only read/write (rw-------) on Unix; the file may hold the
    // store password.
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| {
                LimoError::Config(format!("failed to write config at {}: {e}", path.display()))
            })?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(|e| {
        LimoError::Config(format!("failed to write config at {}: {e}", path.display()))
    })?;
    Ok(())
}
