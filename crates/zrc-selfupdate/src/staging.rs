//! Staging directory layout and startup cleanup.
//!
//! Everything the updater leaves on disk lives in one per-user directory:
//!
//! ```text
//! <update_dir>/
//!   <app>-update[.exe]        staged binary, ready to install
//!   <app>-update[.exe].part   download in flight
//!   helper-<pid>[.exe]        copy of the swap helper
//!   apply.json                written when the helper is launched
//!   last-apply.json           written by the helper when a swap fails
//!   update-helper.log         helper log
//! ```
//!
//! [`StagingArea::cleanup_orphans`] runs once at startup. It must never
//! delete files a helper is still working with, so a live helper (or a
//! marker it cannot read) leaves the directory untouched.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{platform_executable_name, UpdateConfig};
use crate::download::partial_path;
use crate::error::StagingError;
use crate::process::is_process_running;

/// Marker file written after the helper has been launched.
pub const MARKER_FILE: &str = "apply.json";

/// Outcome file written by the helper when a swap fails.
pub const OUTCOME_FILE: &str = "last-apply.json";

/// Log file of the helper process.
pub const HELPER_LOG_FILE: &str = "update-helper.log";

/// File name prefix of helper copies.
pub const HELPER_PREFIX: &str = "helper-";

/// A marker older than this is treated as abandoned even if its pid is alive.
const MARKER_MAX_AGE_MINUTES: i64 = 60;

/// Record of a launched helper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyMarker {
    /// Pid of the helper process
    pub helper_pid: u32,
    /// Pid of the client that launched it
    pub parent_pid: u32,
    /// Path of the helper copy
    pub helper_path: PathBuf,
    /// Executable being replaced
    pub original: PathBuf,
    /// Staged binary
    pub staged: PathBuf,
    /// Launch time
    pub created_at: DateTime<Utc>,
}

/// Result of a swap attempt, as recorded by the helper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyOutcome {
    /// Whether the swap succeeded
    pub succeeded: bool,
    /// Failure description
    #[serde(default)]
    pub error: Option<String>,
    /// Executable the helper tried to replace
    pub original: PathBuf,
    /// When the helper finished
    pub finished_at: DateTime<Utc>,
}

impl ApplyOutcome {
    /// Outcome of a failed swap.
    pub fn failed(original: &Path, error: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            error: Some(error.into()),
            original: original.to_path_buf(),
            finished_at: Utc::now(),
        }
    }
}

/// Why cleanup left the directory alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupSkipped {
    /// A helper is still running
    HelperRunning { pid: u32 },
    /// The marker exists but cannot be read
    UnreadableMarker,
}

/// What [`StagingArea::cleanup_orphans`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Files that were deleted
    pub removed: Vec<PathBuf>,
    /// Set when cleanup was skipped
    pub skipped: Option<CleanupSkipped>,
    /// Failure recorded by the helper on a previous run
    pub previous_failure: Option<ApplyOutcome>,
}

/// The per-user update directory.
#[derive(Debug, Clone)]
pub struct StagingArea {
    dir: PathBuf,
    app_name: String,
}

impl StagingArea {
    /// Create a staging area rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>, app_name: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            app_name: app_name.into(),
        }
    }

    /// Create the staging area described by `config`.
    pub fn from_config(config: &UpdateConfig) -> Result<Self, StagingError> {
        let dir = config
            .staging
            .update_dir(&config.app_name)
            .ok_or(StagingError::NoDataDir)?;
        Ok(Self::new(dir, config.app_name.clone()))
    }

    /// The update directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Where a downloaded update is staged.
    pub fn staging_path(&self) -> PathBuf {
        self.dir
            .join(platform_executable_name(&format!("{}-update", self.app_name)))
    }

    /// Temp file used while the staged binary downloads.
    pub fn partial_path(&self) -> PathBuf {
        partial_path(&self.staging_path())
    }

    pub fn marker_path(&self) -> PathBuf {
        self.dir.join(MARKER_FILE)
    }

    pub fn outcome_path(&self) -> PathBuf {
        self.dir.join(OUTCOME_FILE)
    }

    pub fn helper_log_path(&self) -> PathBuf {
        self.dir.join(HELPER_LOG_FILE)
    }

    /// Path for the helper copy launched by process `pid`.
    pub fn helper_copy_path(&self, pid: u32) -> PathBuf {
        self.dir
            .join(platform_executable_name(&format!("{}{}", HELPER_PREFIX, pid)))
    }

    /// Create the update directory if needed.
    pub fn ensure_dir(&self) -> Result<(), StagingError> {
        fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    /// Delete the staged binary and any partial download.
    pub fn discard_staged(&self) -> Result<Vec<PathBuf>, StagingError> {
        let mut removed = Vec::new();
        remove_if_exists(&self.staging_path(), &mut removed)?;
        remove_if_exists(&self.partial_path(), &mut removed)?;
        Ok(removed)
    }

    /// Record a launched helper.
    pub fn write_marker(&self, marker: &ApplyMarker) -> Result<(), StagingError> {
        self.ensure_dir()?;
        let json = serde_json::to_vec_pretty(marker)?;
        fs::write(self.marker_path(), json)?;
        Ok(())
    }

    /// Read the helper marker, if any.
    pub fn read_marker(&self) -> Result<Option<ApplyMarker>, StagingError> {
        read_json(&self.marker_path())
    }

    /// Read the outcome of the last swap attempt, if any.
    pub fn read_outcome(&self) -> Result<Option<ApplyOutcome>, StagingError> {
        read_json(&self.outcome_path())
    }

    /// Remove files abandoned by an earlier run.
    ///
    /// Skips everything when a helper from the marker is still running or
    /// the marker is unreadable. Otherwise deletes the staged binary, partial
    /// downloads, helper copies and the marker, and reports a failure the
    /// helper recorded on its last run. A missing directory is a no-op.
    pub fn cleanup_orphans(&self) -> Result<CleanupReport, StagingError> {
        let mut report = CleanupReport::default();

        if !self.dir.exists() {
            debug!("No update directory at {:?}, nothing to clean", self.dir);
            return Ok(report);
        }

        match self.read_marker() {
            Ok(Some(marker)) => {
                let age = Utc::now().signed_duration_since(marker.created_at);
                if age < ChronoDuration::minutes(MARKER_MAX_AGE_MINUTES)
                    && is_process_running(marker.helper_pid, Some(HELPER_PREFIX))
                {
                    info!(
                        "Update helper {} is still running, leaving staging files",
                        marker.helper_pid
                    );
                    report.skipped = Some(CleanupSkipped::HelperRunning {
                        pid: marker.helper_pid,
                    });
                    return Ok(report);
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!("Unreadable apply marker, leaving staging files: {}", e);
                report.skipped = Some(CleanupSkipped::UnreadableMarker);
                return Ok(report);
            }
        }

        self.remove_all(&mut report)?;

        match self.read_outcome() {
            Ok(Some(outcome)) => {
                if !outcome.succeeded {
                    warn!(
                        "Previous update of {:?} failed: {}",
                        outcome.original,
                        outcome.error.as_deref().unwrap_or("unknown error")
                    );
                    report.previous_failure = Some(outcome);
                }
                remove_if_exists(&self.outcome_path(), &mut report.removed)?;
            }
            Ok(None) => {}
            Err(e) => {
                warn!("Discarding unreadable apply outcome: {}", e);
                remove_if_exists(&self.outcome_path(), &mut report.removed)?;
            }
        }

        if !report.removed.is_empty() {
            info!("Removed {} orphaned update file(s)", report.removed.len());
        }
        Ok(report)
    }

    /// Remove every staged file regardless of markers.
    pub fn force_cleanup(&self) -> Result<CleanupReport, StagingError> {
        let mut report = CleanupReport::default();
        if !self.dir.exists() {
            return Ok(report);
        }
        self.remove_all(&mut report)?;
        remove_if_exists(&self.outcome_path(), &mut report.removed)?;
        Ok(report)
    }

    fn remove_all(&self, report: &mut CleanupReport) -> Result<(), StagingError> {
        remove_if_exists(&self.staging_path(), &mut report.removed)?;
        remove_if_exists(&self.partial_path(), &mut report.removed)?;

        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let is_helper = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(HELPER_PREFIX))
                .unwrap_or(false);
            if !is_helper || !path.is_file() {
                continue;
            }
            // A helper copy that is still mapped cannot be removed on Windows
            if let Err(e) = remove_if_exists(&path, &mut report.removed) {
                warn!("Could not remove helper copy {:?}: {}", path, e);
            }
        }

        remove_if_exists(&self.marker_path(), &mut report.removed)?;
        Ok(())
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, StagingError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn remove_if_exists(path: &Path, removed: &mut Vec<PathBuf>) -> Result<(), StagingError> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!("Removed {:?}", path);
            removed.push(path.to_path_buf());
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn area(temp_dir: &TempDir) -> StagingArea {
        StagingArea::new(temp_dir.path().join("updates"), "rdp")
    }

    fn marker(area: &StagingArea, helper_pid: u32, created_at: DateTime<Utc>) -> ApplyMarker {
        ApplyMarker {
            helper_pid,
            parent_pid: 1,
            helper_path: area.helper_copy_path(helper_pid),
            original: PathBuf::from("/opt/rdp/rdp"),
            staged: area.staging_path(),
            created_at,
        }
    }

    #[test]
    fn test_paths() {
        let area = StagingArea::new("/data/updates", "rdp");
        let exe = if cfg!(target_os = "windows") { ".exe" } else { "" };
        assert_eq!(
            area.staging_path(),
            PathBuf::from(format!("/data/updates/rdp-update{}", exe))
        );
        assert_eq!(
            area.partial_path(),
            PathBuf::from(format!("/data/updates/rdp-update{}.part", exe))
        );
        assert_eq!(
            area.helper_copy_path(42),
            PathBuf::from(format!("/data/updates/helper-42{}", exe))
        );
        assert_eq!(area.marker_path(), PathBuf::from("/data/updates/apply.json"));
    }

    #[test]
    fn test_cleanup_missing_dir_is_ok() {
        let temp_dir = TempDir::new().unwrap();
        let area = area(&temp_dir);

        let report = area.cleanup_orphans().unwrap();
        assert_eq!(report, CleanupReport::default());
        assert!(area.force_cleanup().is_ok());
    }

    #[test]
    fn test_cleanup_empty_dir_is_ok() {
        let temp_dir = TempDir::new().unwrap();
        let area = area(&temp_dir);
        area.ensure_dir().unwrap();

        let report = area.cleanup_orphans().unwrap();
        assert!(report.removed.is_empty());
        assert!(report.skipped.is_none());
    }

    #[test]
    fn test_cleanup_removes_orphans_and_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let area = area(&temp_dir);
        area.ensure_dir().unwrap();
        fs::write(area.staging_path(), b"staged").unwrap();
        fs::write(area.partial_path(), b"part").unwrap();
        fs::write(area.helper_copy_path(999_999), b"helper").unwrap();
        fs::write(area.helper_log_path(), b"log").unwrap();

        let report = area.cleanup_orphans().unwrap();
        assert_eq!(report.removed.len(), 3);
        assert!(!area.staging_path().exists());
        assert!(!area.partial_path().exists());
        assert!(!area.helper_copy_path(999_999).exists());
        assert!(area.helper_log_path().exists());

        let again = area.cleanup_orphans().unwrap();
        assert!(again.removed.is_empty());
    }

    #[test]
    fn test_cleanup_with_dead_helper_marker() {
        let temp_dir = TempDir::new().unwrap();
        let area = area(&temp_dir);
        fs::create_dir_all(area.dir()).unwrap();
        fs::write(area.staging_path(), b"staged").unwrap();
        // u32::MAX is never a live pid
        area.write_marker(&marker(&area, u32::MAX, Utc::now())).unwrap();

        let report = area.cleanup_orphans().unwrap();
        assert!(report.skipped.is_none());
        assert!(!area.staging_path().exists());
        assert!(!area.marker_path().exists());
    }

    #[test]
    fn test_cleanup_skips_when_marker_unreadable() {
        let temp_dir = TempDir::new().unwrap();
        let area = area(&temp_dir);
        area.ensure_dir().unwrap();
        fs::write(area.staging_path(), b"staged").unwrap();
        fs::write(area.marker_path(), b"{ not json").unwrap();

        let report = area.cleanup_orphans().unwrap();
        assert_eq!(report.skipped, Some(CleanupSkipped::UnreadableMarker));
        assert!(area.staging_path().exists());
        assert!(area.marker_path().exists());
    }

    #[test]
    fn test_cleanup_ignores_live_pid_with_other_name() {
        let temp_dir = TempDir::new().unwrap();
        let area = area(&temp_dir);
        area.ensure_dir().unwrap();
        fs::write(area.staging_path(), b"staged").unwrap();
        // The test runner is alive but is not a helper
        area.write_marker(&marker(&area, std::process::id(), Utc::now()))
            .unwrap();

        let report = area.cleanup_orphans().unwrap();
        assert!(report.skipped.is_none());
        assert!(!area.staging_path().exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_cleanup_leaves_files_while_helper_runs() {
        let temp_dir = TempDir::new().unwrap();
        let area = area(&temp_dir);
        area.ensure_dir().unwrap();
        fs::write(area.staging_path(), b"staged").unwrap();

        let helper_copy = area.helper_copy_path(1);
        fs::copy("/bin/sleep", &helper_copy).unwrap();
        let mut child = std::process::Command::new(&helper_copy)
            .arg("30")
            .spawn()
            .unwrap();

        // The process name only changes once exec has completed
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while !is_process_running(child.id(), Some(HELPER_PREFIX)) {
            assert!(std::time::Instant::now() < deadline, "helper never started");
            std::thread::sleep(std::time::Duration::from_millis(20));
        }

        let mut live = marker(&area, child.id(), Utc::now());
        live.helper_path = helper_copy.clone();
        area.write_marker(&live).unwrap();

        let report = area.cleanup_orphans();
        let _ = child.kill();
        let _ = child.wait();

        let report = report.unwrap();
        assert_eq!(
            report.skipped,
            Some(CleanupSkipped::HelperRunning { pid: child.id() })
        );
        assert!(report.removed.is_empty());
        assert!(area.staging_path().exists());
        assert!(area.marker_path().exists());
        assert!(helper_copy.exists());
    }

    #[test]
    fn test_cleanup_reports_previous_failure_once() {
        let temp_dir = TempDir::new().unwrap();
        let area = area(&temp_dir);
        area.ensure_dir().unwrap();
        let outcome = ApplyOutcome::failed(Path::new("/opt/rdp/rdp"), "permission denied");
        fs::write(area.outcome_path(), serde_json::to_vec(&outcome).unwrap()).unwrap();

        let report = area.cleanup_orphans().unwrap();
        assert_eq!(report.previous_failure, Some(outcome));
        assert!(!area.outcome_path().exists());

        let again = area.cleanup_orphans().unwrap();
        assert!(again.previous_failure.is_none());
    }

    #[test]
    fn test_force_cleanup_ignores_marker() {
        let temp_dir = TempDir::new().unwrap();
        let area = area(&temp_dir);
        area.ensure_dir().unwrap();
        fs::write(area.staging_path(), b"staged").unwrap();
        fs::write(area.marker_path(), b"garbage").unwrap();

        area.force_cleanup().unwrap();
        assert!(!area.staging_path().exists());
        assert!(!area.marker_path().exists());
    }

    #[test]
    fn test_discard_staged() {
        let temp_dir = TempDir::new().unwrap();
        let area = area(&temp_dir);
        assert!(area.discard_staged().unwrap().is_empty());

        area.ensure_dir().unwrap();
        fs::write(area.staging_path(), b"staged").unwrap();
        assert_eq!(area.discard_staged().unwrap(), vec![area.staging_path()]);
        assert!(!area.staging_path().exists());
    }

    #[test]
    fn test_marker_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let area = area(&temp_dir);
        let written = marker(&area, 1234, Utc::now());
        area.write_marker(&written).unwrap();
        assert_eq!(area.read_marker().unwrap(), Some(written));
    }
}
