//! Configuration management for unattendedd.
//!
//! Loads settings from /etc/unattended/config.toml (or the path given with
//! `--config`). Every field has a default; the file itself must exist.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};
use unattended_common::{UnattendedError, VersionFormat, DEFAULT_VERSION_FORMAT};

/// Config file path
pub const CONFIG_PATH: &str = "/etc/unattended/config.toml";

/// How a staged update is applied to the running application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateStrategy {
    /// Ask the application over the coordination channel first
    Prompt,
    /// Stop and relaunch immediately
    #[default]
    Restart,
    /// Stage and switch, never restart automatically
    Off,
}

impl UpdateStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateStrategy::Prompt => "prompt",
            UpdateStrategy::Restart => "restart",
            UpdateStrategy::Off => "off",
        }
    }
}

impl fmt::Display for UpdateStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UpdateStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "prompt" => Ok(UpdateStrategy::Prompt),
            "restart" => Ok(UpdateStrategy::Restart),
            "off" => Ok(UpdateStrategy::Off),
            other => Err(format!("unknown update strategy '{}'", other)),
        }
    }
}

/// How often the update cycle runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateInterval {
    /// Once, when the supervisor starts
    Startup,
    Hourly,
    #[default]
    Daily,
}

impl UpdateInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateInterval::Startup => "startup",
            UpdateInterval::Hourly => "hourly",
            UpdateInterval::Daily => "daily",
        }
    }

    /// Repeat period, `None` when the cycle only runs at startup
    pub fn period(&self) -> Option<Duration> {
        match self {
            UpdateInterval::Startup => None,
            UpdateInterval::Hourly => Some(Duration::from_secs(60 * 60)),
            UpdateInterval::Daily => Some(Duration::from_secs(24 * 60 * 60)),
        }
    }
}

impl fmt::Display for UpdateInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UpdateInterval {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "startup" => Ok(UpdateInterval::Startup),
            "hourly" => Ok(UpdateInterval::Hourly),
            "daily" => Ok(UpdateInterval::Daily),
            other => Err(format!("unknown update interval '{}'", other)),
        }
    }
}

/// The managed application
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Root directory holding all version directories
    #[serde(default = "default_base_path")]
    pub base_path: PathBuf,

    /// Executable name inside each version directory
    #[serde(default = "default_filename")]
    pub filename: String,

    /// Command-line parameters, split on whitespace
    #[serde(default)]
    pub parameters: String,

    /// strftime pattern for the date part of version directories
    #[serde(default = "default_version_format")]
    pub version_format: String,
}

fn default_base_path() -> PathBuf {
    PathBuf::from(".")
}

fn default_filename() -> String {
    "app".to_string()
}

fn default_version_format() -> String {
    DEFAULT_VERSION_FORMAT.to_string()
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            base_path: default_base_path(),
            filename: default_filename(),
            parameters: String::new(),
            version_format: default_version_format(),
        }
    }
}

/// Update behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatesConfig {
    /// prompt | restart | off
    #[serde(default = "default_strategy")]
    pub strategy: String,

    /// startup | hourly | daily
    #[serde(default = "default_interval")]
    pub interval: String,

    /// Omaha track sent with each check
    #[serde(default = "default_channel")]
    pub channel: String,

    /// Timeout for one update-check round trip
    #[serde(default = "default_check_timeout")]
    pub check_timeout_secs: u64,

    /// Timeout for one package download
    #[serde(default = "default_download_timeout")]
    pub download_timeout_secs: u64,
}

fn default_strategy() -> String {
    "prompt".to_string()
}

fn default_interval() -> String {
    "daily".to_string()
}

fn default_channel() -> String {
    unattended_common::omaha::DEFAULT_CHANNEL.to_string()
}

fn default_check_timeout() -> u64 {
    30
}

fn default_download_timeout() -> u64 {
    600
}

impl Default for UpdatesConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            interval: default_interval(),
            channel: default_channel(),
            check_timeout_secs: default_check_timeout(),
            download_timeout_secs: default_download_timeout(),
        }
    }
}

impl UpdatesConfig {
    /// Resolved strategy. Unknown values fall back to `restart`, loudly.
    pub fn strategy(&self) -> UpdateStrategy {
        self.strategy.parse().unwrap_or_else(|e| {
            warn!(
                "{}; falling back to '{}'. Fix the configuration to silence this warning",
                e,
                UpdateStrategy::default()
            );
            UpdateStrategy::default()
        })
    }

    /// Resolved interval. Unknown values fall back to `daily`, loudly.
    pub fn interval(&self) -> UpdateInterval {
        self.interval.parse().unwrap_or_else(|e| {
            warn!("{}; falling back to '{}'", e, UpdateInterval::default());
            UpdateInterval::default()
        })
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.check_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}

/// Managed process supervision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Seconds between liveness checks of the managed process
    #[serde(default = "default_liveness_interval")]
    pub liveness_interval_secs: u64,

    /// Grace period after `Exit` before the process is killed
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
}

fn default_liveness_interval() -> u64 {
    5
}

fn default_stop_timeout() -> u64 {
    10
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            liveness_interval_secs: default_liveness_interval(),
            stop_timeout_secs: default_stop_timeout(),
        }
    }
}

impl SupervisorConfig {
    pub fn liveness_interval(&self) -> Duration {
        Duration::from_secs(self.liveness_interval_secs.max(1))
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

/// Full daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Client id reported to the update server (Omaha `bootid`)
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Directory holding the `.uum` update manifests
    #[serde(default = "default_configuration_directory")]
    pub configuration_directory: PathBuf,

    #[serde(default)]
    pub target: TargetConfig,

    #[serde(default)]
    pub updates: UpdatesConfig,

    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

fn default_client_id() -> String {
    "defaultclient".to_string()
}

fn default_configuration_directory() -> PathBuf {
    PathBuf::from("/etc/unattended/manifests")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client_id: default_client_id(),
            configuration_directory: default_configuration_directory(),
            target: TargetConfig::default(),
            updates: UpdatesConfig::default(),
            supervisor: SupervisorConfig::default(),
        }
    }
}

impl Config {
    /// Load and validate config from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config = Self::from_toml(&content)
            .with_context(|| format!("Invalid config {}", path.display()))?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Startup checks that do not depend on the version directories
    pub fn validate(&self) -> Result<()> {
        if !self.configuration_directory.is_dir() {
            return Err(UnattendedError::ConfigDirectoryMissing(
                self.configuration_directory.clone(),
            )
            .into());
        }
        self.version_format()?;
        if self.target.filename.trim().is_empty() {
            anyhow::bail!("target.filename must not be empty");
        }
        Ok(())
    }

    pub fn version_format(&self) -> Result<VersionFormat> {
        Ok(VersionFormat::new(&self.target.version_format)?)
    }

    /// Render the defaults, used to seed a fresh installation
    pub fn default_toml() -> Result<String> {
        Ok(toml::to_string_pretty(&Config::default())?)
    }
}
