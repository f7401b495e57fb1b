//! Agent configuration
//!
//! A single YAML file with `${VAR}` environment expansion, defaults for
//! every optional field, and validation that fails fast at startup.
//! Read-only commands (`status`, `db stats`, `db compact`) skip shipper
//! validation so they work without an API key.

use santamon_core::duration::{serde_dur, serde_opt_dur};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {1}", .0.display())]
    Io(PathBuf, std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub agent: AgentConfig,
    pub spool: SpoolConfig,
    pub rules: RulesConfig,
    pub state: StateConfig,
    pub shipper: ShipperConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Host identifier reported on signals; defaults to the hostname.
    pub id: String,
    pub state_dir: PathBuf,
    pub log_level: String,
    /// Decoder/evaluator worker tasks.
    pub workers: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            state_dir: PathBuf::from("/var/lib/santamon"),
            log_level: "info".to_string(),
            workers: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpoolConfig {
    /// Telemetry files are published into `<spool_dir>/new`.
    pub spool_dir: PathBuf,
    /// Decoded files move here; absent means delete after decode.
    pub archive_dir: Option<PathBuf>,
    #[serde(with = "serde_dur")]
    pub stability_wait: Duration,
    #[serde(with = "serde_dur")]
    pub check_interval: Duration,
    pub max_pending_files: usize,
    pub channel_buffer: usize,
    pub decoder: DecoderConfig,
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            spool_dir: PathBuf::from("/var/db/sensor/spool"),
            archive_dir: None,
            stability_wait: Duration::from_secs(2),
            check_interval: Duration::from_secs(1),
            max_pending_files: 10_000,
            channel_buffer: 100,
            decoder: DecoderConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    pub max_file_size: u64,
    pub max_decompressed_size: u64,
    /// Maximum decompressed/compressed expansion ratio.
    pub max_decompression_rate: u64,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            max_file_size: 100 * 1024 * 1024,
            max_decompressed_size: 500 * 1024 * 1024,
            max_decompression_rate: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    /// Rule file or directory tree of YAML files.
    pub path: PathBuf,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/etc/santamon/rules.yaml"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub db_path: PathBuf,
    /// Fsync on every write; durable but slower.
    pub sync_writes: bool,
    #[serde(with = "serde_dur")]
    pub compact_interval: Duration,
    pub first_seen: FirstSeenConfig,
    pub windows: WindowsConfig,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("/var/lib/santamon/state.db"),
            sync_writes: false,
            compact_interval: Duration::from_secs(24 * 3600),
            first_seen: FirstSeenConfig::default(),
            windows: WindowsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FirstSeenConfig {
    pub max_entries: u64,
    pub eviction: String,
}

impl Default for FirstSeenConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            eviction: "lru".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowsConfig {
    #[serde(with = "serde_dur")]
    pub gc_interval: Duration,
    pub max_events: usize,
}

impl Default for WindowsConfig {
    fn default() -> Self {
        Self {
            gc_interval: Duration::from_secs(60),
            max_events: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShipperConfig {
    pub endpoint: String,
    pub api_key: String,
    pub batch_size: usize,
    #[serde(with = "serde_dur")]
    pub flush_interval: Duration,
    #[serde(with = "serde_dur")]
    pub timeout: Duration,
    pub retry: RetryConfig,
    /// Trigger an immediate flush when a signal is enqueued. Defaults on for
    /// low-latency alerting.
    pub flush_on_enqueue: Option<bool>,
    pub tls_skip_verify: bool,
    pub heartbeat: HeartbeatConfig,
}

impl Default for ShipperConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: String::new(),
            batch_size: 100,
            flush_interval: Duration::from_secs(30),
            timeout: Duration::from_secs(10),
            retry: RetryConfig::default(),
            flush_on_enqueue: None,
            tls_skip_verify: false,
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

impl ShipperConfig {
    pub fn flush_on_enqueue(&self) -> bool {
        self.flush_on_enqueue.unwrap_or(true)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    /// "exponential" or "linear".
    pub backoff: String,
    #[serde(with = "serde_dur")]
    pub initial: Duration,
    #[serde(with = "serde_dur")]
    pub max: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: "exponential".to_string(),
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub enabled: bool,
    #[serde(with = "serde_opt_dur")]
    pub interval: Option<Duration>,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: None,
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        self.interval.unwrap_or(Duration::from_secs(30))
    }
}

impl Config {
    /// Load and validate the full configuration.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::load_with_options(path, false)
    }

    /// Load without shipper validation, for status/db commands.
    pub fn load_read_only(path: &Path) -> Result<Self, ConfigError> {
        Self::load_with_options(path, true)
    }

    pub fn load_with_options(path: &Path, skip_shipper: bool) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        Self::parse(&raw, skip_shipper)
    }

    pub fn parse(raw: &str, skip_shipper: bool) -> Result<Self, ConfigError> {
        let expanded = expand_env(raw);
        let mut cfg: Config = serde_yaml::from_str(&expanded)?;
        cfg.apply_defaults();
        cfg.validate(skip_shipper)?;
        Ok(cfg)
    }

    fn apply_defaults(&mut self) {
        if self.agent.id.is_empty() {
            self.agent.id = hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "unknown-host".to_string());
        }
        if self.agent.workers == 0 {
            self.agent.workers = 2;
        }
    }

    pub fn validate(&self, skip_shipper: bool) -> Result<(), ConfigError> {
        if self.agent.id.is_empty() {
            return Err(invalid("agent.id is required"));
        }
        if self.agent.id.len() > 255 {
            return Err(invalid("agent.id too long (max 255 characters)"));
        }
        if !matches!(
            self.agent.log_level.to_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            return Err(invalid(format!(
                "invalid log level: {}",
                self.agent.log_level
            )));
        }
        if !self.agent.state_dir.is_absolute() {
            return Err(invalid("agent.state_dir must be an absolute path"));
        }

        if !self.spool.spool_dir.is_absolute() {
            return Err(invalid("spool.spool_dir must be an absolute path"));
        }
        if self.spool.stability_wait > Duration::from_secs(60) {
            return Err(invalid("spool.stability_wait too large (max 60s)"));
        }
        if self.spool.channel_buffer == 0 {
            return Err(invalid("spool.channel_buffer must be positive"));
        }
        if self.spool.decoder.max_decompression_rate == 0 {
            return Err(invalid("spool.decoder.max_decompression_rate must be positive"));
        }

        if !self.rules.path.is_absolute() {
            return Err(invalid("rules.path must be an absolute path"));
        }

        if !self.state.db_path.is_absolute() {
            return Err(invalid("state.db_path must be an absolute path"));
        }
        if self.state.first_seen.max_entries == 0 {
            return Err(invalid("state.first_seen.max_entries must be positive"));
        }
        if self.state.first_seen.max_entries > 1_000_000 {
            return Err(invalid("state.first_seen.max_entries too large (max 1000000)"));
        }
        if self.state.first_seen.eviction != "lru" {
            return Err(invalid("state.first_seen.eviction must be 'lru'"));
        }
        if self.state.windows.max_events == 0 {
            return Err(invalid("state.windows.max_events must be positive"));
        }
        if self.state.windows.max_events > 100_000 {
            return Err(invalid("state.windows.max_events too large (max 100000)"));
        }

        if skip_shipper {
            return Ok(());
        }

        if self.shipper.endpoint.is_empty() {
            return Err(invalid("shipper.endpoint is required"));
        }
        let url = reqwest::Url::parse(&self.shipper.endpoint)
            .map_err(|e| invalid(format!("shipper.endpoint invalid URL: {}", e)))?;
        if url.scheme() == "http" {
            let host = url.host_str().unwrap_or("");
            if !matches!(host, "localhost" | "127.0.0.1" | "::1" | "[::1]") {
                return Err(invalid(
                    "shipper.endpoint must use HTTPS (not HTTP) for remote hosts",
                ));
            }
        } else if url.scheme() != "https" {
            return Err(invalid("shipper.endpoint must be an http(s) URL"));
        }
        if self.shipper.api_key.is_empty() {
            return Err(invalid("shipper.api_key is required"));
        }
        if self.shipper.api_key.len() < 16 {
            return Err(invalid("shipper.api_key too short (min 16 characters)"));
        }
        if self.shipper.batch_size == 0 {
            return Err(invalid("shipper.batch_size must be positive"));
        }
        if self.shipper.batch_size > 10_000 {
            return Err(invalid("shipper.batch_size too large (max 10000)"));
        }
        if self.shipper.timeout.is_zero() {
            return Err(invalid("shipper.timeout must be positive"));
        }
        if self.shipper.retry.max_attempts > 10 {
            return Err(invalid("shipper.retry.max_attempts too large (max 10)"));
        }
        if !matches!(self.shipper.retry.backoff.as_str(), "exponential" | "linear") {
            return Err(invalid(
                "shipper.retry.backoff must be 'exponential' or 'linear'",
            ));
        }

        Ok(())
    }
}

/// Expand `${VAR}` references from the process environment. Unknown
/// variables expand to the empty string, matching common env-expansion
/// behavior for config files.
fn expand_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        match rest[start + 2..].find('}') {
            Some(end) => {
                let name = &rest[start + 2..start + 2 + end];
                if let Ok(value) = std::env::var(name) {
                    out.push_str(&value);
                }
                rest = &rest[start + 2 + end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                return out;
            }
        }
    }
    out.push_str(rest);
    out
}
