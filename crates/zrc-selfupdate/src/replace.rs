//! Handing a staged update to the swap helper.
//!
//! A running executable cannot reliably overwrite itself, so the client
//! copies the helper binary into the update directory, starts it detached
//! and exits. The helper (see [`crate::helper`]) waits for the exit, swaps
//! the files and relaunches.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::{platform_executable_name, UpdateConfig};
use crate::error::ApplyError;
use crate::process::spawn_detached;
use crate::staging::{ApplyMarker, StagingArea};

/// Name of the helper binary shipped next to the client.
pub const HELPER_BINARY_NAME: &str = "zrc-update-helper";

/// A helper that has been started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchedHelper {
    /// Pid of the helper process
    pub pid: u32,
    /// Path of the helper copy that is running
    pub helper_path: PathBuf,
}

/// Installs a staged binary once the current process exits.
#[async_trait]
pub trait Installer: Send + Sync {
    /// Start whatever will install `staged`. The caller is expected to exit
    /// soon after this returns `Ok`.
    async fn launch(&self, staged: &Path) -> Result<LaunchedHelper, ApplyError>;
}

/// Installer that launches the detached `zrc-update-helper`.
pub struct HelperInstaller {
    staging: StagingArea,
    helper_source: Option<PathBuf>,
    target: Option<PathBuf>,
    wait_timeout: Duration,
    relaunch: bool,
}

impl HelperInstaller {
    /// Create an installer with default settings.
    pub fn new(staging: StagingArea) -> Self {
        Self {
            staging,
            helper_source: None,
            target: None,
            wait_timeout: Duration::from_secs(30),
            relaunch: true,
        }
    }

    /// Create an installer from the `[replace]` configuration.
    pub fn from_config(config: &UpdateConfig, staging: StagingArea) -> Self {
        Self {
            helper_source: config.replace.helper_path.clone(),
            wait_timeout: config.replace.wait_timeout(),
            relaunch: config.replace.relaunch,
            ..Self::new(staging)
        }
    }

    /// Use the helper binary at `path`.
    pub fn with_helper_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.helper_source = Some(path.into());
        self
    }

    /// Replace `path` instead of the current executable.
    pub fn with_target(mut self, path: impl Into<PathBuf>) -> Self {
        self.target = Some(path.into());
        self
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    pub fn with_relaunch(mut self, relaunch: bool) -> Self {
        self.relaunch = relaunch;
        self
    }

    /// Executable that will be replaced.
    pub fn target(&self) -> Result<PathBuf, ApplyError> {
        match &self.target {
            Some(path) => Ok(path.clone()),
            None => std::env::current_exe().map_err(|e| ApplyError::CurrentExe(e.to_string())),
        }
    }

    /// Helper binary that will be copied and launched.
    pub fn helper_source(&self) -> Result<PathBuf, ApplyError> {
        if let Some(path) = &self.helper_source {
            return Ok(path.clone());
        }
        let exe = std::env::current_exe().map_err(|e| ApplyError::CurrentExe(e.to_string()))?;
        let dir = exe
            .parent()
            .ok_or_else(|| ApplyError::CurrentExe(format!("{:?} has no parent", exe)))?;
        Ok(dir.join(platform_executable_name(HELPER_BINARY_NAME)))
    }

    /// Command line that starts `helper` for one swap.
    pub fn helper_command(&self, helper: &Path, original: &Path, staged: &Path) -> Command {
        let mut command = Command::new(helper);
        command
            .arg("--parent-pid")
            .arg(std::process::id().to_string())
            .arg("--original")
            .arg(original)
            .arg("--staged")
            .arg(staged)
            .arg("--timeout-secs")
            .arg(self.wait_timeout.as_secs().to_string())
            .arg("--marker")
            .arg(self.staging.marker_path())
            .arg("--outcome")
            .arg(self.staging.outcome_path())
            .arg("--log-file")
            .arg(self.staging.helper_log_path());
        if !self.relaunch {
            command.arg("--no-relaunch");
        }
        if let Some(dir) = original.parent().filter(|d| !d.as_os_str().is_empty()) {
            command.current_dir(dir);
        }
        command
    }
}

#[async_trait]
impl Installer for HelperInstaller {
    async fn launch(&self, staged: &Path) -> Result<LaunchedHelper, ApplyError> {
        match tokio::fs::metadata(staged).await {
            Ok(meta) if meta.is_file() && meta.len() > 0 => {}
            _ => return Err(ApplyError::StagedMissing(staged.to_path_buf())),
        }

        let source = self.helper_source()?;
        if !tokio::fs::try_exists(&source).await.unwrap_or(false) {
            return Err(ApplyError::HelperNotFound(source));
        }
        let original = self.target()?;

        tokio::fs::create_dir_all(self.staging.dir()).await?;
        let helper_copy = self.staging.helper_copy_path(std::process::id());
        tokio::fs::copy(&source, &helper_copy).await?;
        set_executable(&helper_copy).await?;
        debug!("Copied update helper to {:?}", helper_copy);

        let mut command = self.helper_command(&helper_copy, &original, staged);
        let child = spawn_detached(&mut command).map_err(|e| ApplyError::Spawn(e.to_string()))?;
        let pid = child.id();
        info!("Launched update helper {} for {:?}", pid, original);

        let marker = ApplyMarker {
            helper_pid: pid,
            parent_pid: std::process::id(),
            helper_path: helper_copy.clone(),
            original,
            staged: staged.to_path_buf(),
            created_at: Utc::now(),
        };
        // The helper is already running; without a marker the next startup
        // cleanup treats its files as orphaned, which is still safe.
        if let Err(e) = self.staging.write_marker(&marker) {
            warn!("Could not write apply marker: {}", e);
        }

        Ok(LaunchedHelper {
            pid,
            helper_path: helper_copy,
        })
    }
}

#[cfg(unix)]
async fn set_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await
}

#[cfg(not(unix))]
async fn set_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
