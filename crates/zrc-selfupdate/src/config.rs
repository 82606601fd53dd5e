//! Configuration structures for the self-update pipeline.
//!
//! Defines where releases are fetched from, how often, where updates are
//! staged, and how the swap helper is launched.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::version::Version;

/// Main update configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// Application name, used for the asset name and staging file name
    #[serde(default = "default_app_name")]
    pub app_name: String,

    /// Version of the running application
    #[serde(default = "default_current_version")]
    pub current_version: String,

    /// Releases endpoint; `/latest` is appended
    #[serde(default = "default_releases_endpoint")]
    pub releases_endpoint: String,

    /// Asset name to download (empty = platform executable name)
    #[serde(default)]
    pub asset_name: Option<String>,

    /// Interval between background checks in minutes
    #[serde(default = "default_check_interval")]
    pub check_interval_minutes: u64,

    /// Whether to check once right after startup
    #[serde(default = "default_true")]
    pub check_on_startup: bool,

    /// Network configuration
    #[serde(default)]
    pub network: NetworkConfig,

    /// Staging configuration
    #[serde(default)]
    pub staging: StagingConfig,

    /// Replacement configuration
    #[serde(default)]
    pub replace: ReplaceConfig,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            current_version: default_current_version(),
            releases_endpoint: default_releases_endpoint(),
            asset_name: None,
            check_interval_minutes: default_check_interval(),
            check_on_startup: true,
            network: NetworkConfig::default(),
            staging: StagingConfig::default(),
            replace: ReplaceConfig::default(),
        }
    }
}

impl UpdateConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check that the configuration is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.app_name.trim().is_empty() {
            return Err(ConfigError::Invalid("app_name must not be empty".to_string()));
        }
        if self.releases_endpoint.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "releases_endpoint must not be empty".to_string(),
            ));
        }
        if self.check_interval_minutes == 0 {
            return Err(ConfigError::Invalid(
                "check_interval_minutes must be at least 1".to_string(),
            ));
        }
        self.current_version()?;
        Ok(())
    }

    /// Parsed version of the running application.
    pub fn current_version(&self) -> Result<Version, ConfigError> {
        Version::parse(&self.current_version).map_err(|e| {
            ConfigError::Invalid(format!(
                "current_version {:?}: {}",
                self.current_version, e
            ))
        })
    }

    /// URL of the latest release descriptor.
    pub fn latest_release_url(&self) -> String {
        format!("{}/latest", self.releases_endpoint.trim_end_matches('/'))
    }

    /// Asset name matching this platform.
    pub fn asset_name(&self) -> String {
        match &self.asset_name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => platform_executable_name(&self.app_name),
        }
    }

    /// Background poll interval.
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_minutes.max(1) * 60)
    }
}

/// Executable file name of `app_name` on this platform.
pub fn platform_executable_name(app_name: &str) -> String {
    if cfg!(target_os = "windows") {
        format!("{}.exe", app_name)
    } else {
        app_name.to_string()
    }
}

/// Network configuration for the feed and downloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,

    /// Read timeout for streaming in seconds
    #[serde(default = "default_read_timeout")]
    pub read_timeout_seconds: u64,

    /// User agent sent to the feed (empty = crate default)
    #[serde(default)]
    pub user_agent: Option<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_seconds: default_connect_timeout(),
            read_timeout_seconds: default_read_timeout(),
            user_agent: None,
        }
    }
}

impl NetworkConfig {
    /// User agent, falling back to `zrc-selfupdate/<version>`.
    pub fn user_agent(&self) -> String {
        match &self.user_agent {
            Some(agent) if !agent.is_empty() => agent.clone(),
            _ => format!("zrc-selfupdate/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Staging directory configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StagingConfig {
    /// Directory for staged updates (empty = default location)
    #[serde(default)]
    pub update_dir: Option<PathBuf>,
}

impl StagingConfig {
    /// Get the update directory, using the default if not specified.
    pub fn update_dir(&self, app_name: &str) -> Option<PathBuf> {
        match &self.update_dir {
            Some(dir) => Some(dir.clone()),
            None => default_update_dir(app_name),
        }
    }
}

/// Helper launch configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplaceConfig {
    /// Path to the helper executable (empty = next to the current executable)
    #[serde(default)]
    pub helper_path: Option<PathBuf>,

    /// How long the helper waits for the client to exit before swapping anyway
    #[serde(default = "default_wait_timeout")]
    pub wait_timeout_secs: u64,

    /// Whether the helper restarts the client after a successful swap
    #[serde(default = "default_true")]
    pub relaunch: bool,
}

impl Default for ReplaceConfig {
    fn default() -> Self {
        Self {
            helper_path: None,
            wait_timeout_secs: default_wait_timeout(),
            relaunch: true,
        }
    }
}

impl ReplaceConfig {
    /// Helper wait timeout.
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }
}

// Default value functions for serde
fn default_app_name() -> String {
    "zrc-desktop".to_string()
}

fn default_current_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_releases_endpoint() -> String {
    "https://api.github.com/repos/zippyremote/zrc/releases".to_string()
}

fn default_check_interval() -> u64 {
    60 // the feed allows ~60 unauthenticated requests per hour
}

fn default_true() -> bool {
    true
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_read_timeout() -> u64 {
    60
}

fn default_wait_timeout() -> u64 {
    30
}

/// Default per-user update directory.
fn default_update_dir(app_name: &str) -> Option<PathBuf> {
    directories::ProjectDirs::from("io", "zippyremote", app_name)
        .map(|dirs| dirs.data_local_dir().join("updates"))
}
