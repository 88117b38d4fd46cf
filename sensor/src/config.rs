use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "FLOWMAP_CONFIG";

/// Looked up in the working directory when the variable is unset.
pub const DEFAULT_CONFIG_FILE: &str = "flowmap.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Complete configuration shared by the agent and the reconcile tool
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Expiring store connection
    #[serde(default)]
    pub store: StoreConfig,

    /// Packet capture and duplicate suppression
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Deferred write workers
    #[serde(default)]
    pub writer: WriterConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Periodic counters in the log
    #[serde(default)]
    pub stats: StatsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store URL, `redis://host:port/db`, or `memory://` for an in-process store
    #[serde(default = "default_store_address")]
    pub address: String,

    /// Expiry applied to every written key (seconds)
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Bytes read per frame, enough for the network header and the port pair
    #[serde(default = "default_snaplen")]
    pub snaplen: usize,

    /// Frames with either endpoint in one of these networks are skipped
    #[serde(default)]
    pub ignore: Vec<IpNet>,

    #[serde(default)]
    pub recency: RecencyConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecencyConfig {
    /// Minimum seconds between bucket rotations
    #[serde(default = "default_cycle_secs")]
    pub cycle_secs: u64,

    /// Generations of keys kept
    #[serde(default = "default_buckets")]
    pub buckets: usize,

    /// Lookups between rotation checks
    #[serde(default = "default_frequency")]
    pub frequency: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriterConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Pending write units; submissions beyond this are dropped
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    /// How long shutdown waits for queued writes before cancelling them
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Optional log file in addition to the console
    #[serde(default)]
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsConfig {
    /// 0 disables the stats line
    #[serde(default)]
    pub interval_secs: u64,
}

// Default value functions
fn default_store_address() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

fn default_grace_period_secs() -> u64 {
    900
}

fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_snaplen() -> usize {
    128
}

fn default_cycle_secs() -> u64 {
    30
}

fn default_buckets() -> usize {
    3
}

fn default_frequency() -> u64 {
    10
}

fn default_workers() -> usize {
    1
}

fn default_queue_depth() -> usize {
    4096
}

fn default_drain_timeout_secs() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            address: default_store_address(),
            grace_period_secs: default_grace_period_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self { snaplen: default_snaplen(), ignore: Vec::new(), recency: RecencyConfig::default() }
    }
}

impl Default for RecencyConfig {
    fn default() -> Self {
        Self { cycle_secs: default_cycle_secs(), buckets: default_buckets(), frequency: default_frequency() }
    }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self { workers: default_workers(), queue_depth: default_queue_depth(), drain_timeout_secs: default_drain_timeout_secs() }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level(), file: None }
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self { interval_secs: 0 }
    }
}

impl StoreConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl RecencyConfig {
    pub fn cycle(&self) -> Duration {
        Duration::from_secs(self.cycle_secs)
    }
}

impl WriterConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

impl StatsConfig {
    pub fn interval(&self) -> Option<Duration> {
        (self.interval_secs > 0).then(|| Duration::from_secs(self.interval_secs))
    }
}

impl AgentConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: AgentConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// `$FLOWMAP_CONFIG` if set, else `./flowmap.toml` if it exists.
    pub fn locate() -> Option<PathBuf> {
        Self::locate_with(std::env::var_os(CONFIG_ENV).map(PathBuf::from), Path::new("."))
    }

    fn locate_with(from_env: Option<PathBuf>, dir: &Path) -> Option<PathBuf> {
        if let Some(path) = from_env.filter(|p| !p.as_os_str().is_empty()) {
            return Some(path);
        }
        let candidate = dir.join(DEFAULT_CONFIG_FILE);
        candidate.is_file().then_some(candidate)
    }

    /// Loads the located file, or defaults when there is none. The path
    /// actually used is returned alongside.
    pub fn load() -> Result<(Self, Option<PathBuf>), ConfigError> {
        match Self::locate() {
            Some(path) => Ok((Self::from_file(&path)?, Some(path))),
            None => Ok((Self::default(), None)),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.address.is_empty() {
            return Err(ConfigError::ValidationError("store address cannot be empty".to_string()));
        }

        if self.store.grace_period_secs == 0 {
            return Err(ConfigError::ValidationError("grace_period_secs must be > 0".to_string()));
        }

        // Enough for an IPv6 header plus the ports of the transport header.
        if self.capture.snaplen < 44 {
            return Err(ConfigError::ValidationError("snaplen must be >= 44".to_string()));
        }

        if self.capture.recency.buckets < 2 {
            return Err(ConfigError::ValidationError("recency buckets must be >= 2".to_string()));
        }

        if self.capture.recency.frequency == 0 {
            return Err(ConfigError::ValidationError("recency frequency must be > 0".to_string()));
        }

        if self.writer.workers == 0 || self.writer.queue_depth == 0 {
            return Err(ConfigError::ValidationError("writer workers and queue_depth must be > 0".to_string()));
        }

        if self.writer.drain_timeout_secs == 0 {
            return Err(ConfigError::ValidationError("writer drain_timeout_secs must be > 0".to_string()));
        }

        if self.logging.level.parse::<log::LevelFilter>().is_err() {
            return Err(ConfigError::ValidationError(format!("unknown log level '{}'", self.logging.level)));
        }

        Ok(())
    }

    /// Save configuration to a TOML file
    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let contents =
            toml::to_string_pretty(self).map_err(|e| ConfigError::ValidationError(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}
