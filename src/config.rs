use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::billing::{BillingRates, DEFAULT_BLOCK_MINUTES, DEFAULT_FEE_PER_BLOCK};
use crate::sessions::model::{Settings, DEFAULT_DURATION_MINUTES};
use crate::sessions::sweeper::DEFAULT_SWEEP_INTERVAL_SECS;

/// Example configuration written by `playtime config init`
pub const EXAMPLE_CONFIG: &str = include_str!("../example-config.toml");

/// Name of the session store inside the data directory
pub const STORE_FILE_NAME: &str = "sessions.json";

/// Server daemon configuration
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ListenConfig,
    #[serde(default)]
    pub sweeper: SweeperConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub sessions: SessionDefaults,
    #[serde(default)]
    pub billing: BillingConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ListenConfig {
    /// Address the HTTP API listens on
    #[serde(default = "default_bind")]
    pub bind: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SweeperConfig {
    /// Seconds between expiry sweeps
    #[serde(default = "default_sweep_interval")]
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Defaults to the platform data directory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SessionDefaults {
    /// Seed for the Settings record when the store has none yet
    #[serde(default = "default_duration")]
    pub default_duration_minutes: u32,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BillingConfig {
    #[serde(default = "default_fee_per_block")]
    pub fee_per_block: u64,
    #[serde(default = "default_block_minutes")]
    pub block_minutes: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct AuditConfig {
    /// JSON-lines audit file; audit entries go to the log when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_bind() -> String {
    "127.0.0.1:4000".to_string()
}

fn default_sweep_interval() -> u64 {
    DEFAULT_SWEEP_INTERVAL_SECS
}

fn default_duration() -> u32 {
    DEFAULT_DURATION_MINUTES
}

fn default_fee_per_block() -> u64 {
    DEFAULT_FEE_PER_BLOCK
}

fn default_block_minutes() -> u32 {
    DEFAULT_BLOCK_MINUTES
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self { bind: default_bind() }
    }
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sweep_interval(),
        }
    }
}

impl Default for SessionDefaults {
    fn default() -> Self {
        Self {
            default_duration_minutes: default_duration(),
        }
    }
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            fee_per_block: default_fee_per_block(),
            block_minutes: default_block_minutes(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// Load `path` if given, else the default location, else built-in defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }

        match default_config_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: ServerConfig =
            toml::from_str(content).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let toml = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, toml)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.bind_addr()?;

        if self.sweeper.interval_secs == 0 {
            anyhow::bail!("sweeper.interval_secs must be greater than 0");
        }
        if self.sessions.default_duration_minutes == 0 {
            anyhow::bail!("sessions.default_duration_minutes must be greater than 0");
        }
        if self.billing.fee_per_block == 0 {
            anyhow::bail!("billing.fee_per_block must be greater than 0");
        }
        if self.billing.block_minutes == 0 {
            anyhow::bail!("billing.block_minutes must be greater than 0");
        }
        if self.logging.level.parse::<tracing::Level>().is_err() {
            anyhow::bail!("Unknown logging.level: {}", self.logging.level);
        }

        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.server
            .bind
            .parse()
            .with_context(|| format!("Invalid server.bind address: {}", self.server.bind))
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.storage.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => project_dirs()
                .map(|dirs| dirs.data_dir().to_path_buf())
                .context("Could not determine a data directory; set storage.data_dir"),
        }
    }

    pub fn store_path(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join(STORE_FILE_NAME))
    }

    pub fn default_settings(&self) -> Settings {
        Settings {
            default_duration_minutes: self.sessions.default_duration_minutes,
        }
    }

    pub fn billing_rates(&self) -> BillingRates {
        BillingRates {
            fee_per_block: self.billing.fee_per_block,
            block_minutes: self.billing.block_minutes,
        }
    }
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("", "", "playtime")
}

/// Platform default config location
pub fn default_config_path() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().join("config.toml"))
}
