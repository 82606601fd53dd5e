//! Swap logic run by the detached update helper.
//!
//! The helper starts after the client has asked it to, waits for the client
//! to exit, then moves the staged binary over the client's executable and
//! starts it again. The original executable is only ever replaced by a
//! rename of a complete copy, so at every point either the original or the
//! staged binary is runnable.

use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::error::HelperError;
use crate::process::{spawn_detached, wait_for_exit};
use crate::staging::{ApplyOutcome, HELPER_PREFIX};

/// How often the helper checks whether the client has exited.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Attempts made to rename over a locked executable.
const REPLACE_ATTEMPTS: u32 = 6;

/// First backoff between rename attempts; doubled after each attempt.
const REPLACE_BACKOFF: Duration = Duration::from_millis(200);

/// Inputs of one swap.
#[derive(Debug, Clone)]
pub struct HelperArgs {
    /// Pid of the client to wait for
    pub parent_pid: u32,
    /// Executable to replace
    pub original: PathBuf,
    /// Staged binary to install
    pub staged: PathBuf,
    /// Upper bound on waiting for the client to exit
    pub wait_timeout: Duration,
    /// Marker to delete once done
    pub marker: Option<PathBuf>,
    /// Where to record a failure
    pub outcome: Option<PathBuf>,
    /// Whether to start the updated executable
    pub relaunch: bool,
}

impl HelperArgs {
    /// Arguments with default timeout and relaunch enabled.
    pub fn new(parent_pid: u32, original: impl Into<PathBuf>, staged: impl Into<PathBuf>) -> Self {
        Self {
            parent_pid,
            original: original.into(),
            staged: staged.into(),
            wait_timeout: Duration::from_secs(30),
            marker: None,
            outcome: None,
            relaunch: true,
        }
    }
}

/// Run the whole swap: wait, replace, clean up, relaunch.
///
/// On failure the original and the staged binary are left in place and the
/// error is written to `args.outcome`.
pub fn run(args: &HelperArgs) -> Result<(), HelperError> {
    info!(
        "Update helper started: parent={}, original={:?}, staged={:?}",
        args.parent_pid, args.original, args.staged
    );

    if wait_for_exit(args.parent_pid, args.wait_timeout, EXIT_POLL_INTERVAL) {
        debug!("Parent process {} has exited", args.parent_pid);
    } else {
        warn!(
            "Parent process {} still running after {:?}, replacing anyway",
            args.parent_pid, args.wait_timeout
        );
    }

    if let Err(e) = replace_executable(&args.original, &args.staged) {
        error!("Update failed: {}", e);
        if let Some(outcome) = &args.outcome {
            write_outcome(outcome, &ApplyOutcome::failed(&args.original, e.to_string()));
        }
        return Err(e);
    }

    info!("Replaced {:?} with staged update", args.original);
    remove_quietly(&args.staged);
    if let Some(outcome) = &args.outcome {
        remove_quietly(outcome);
    }
    if let Some(marker) = &args.marker {
        remove_quietly(marker);
    }

    let relaunched = if args.relaunch {
        relaunch(&args.original)
    } else {
        Ok(())
    };

    remove_self();
    relaunched
}

/// Replace `original` with the contents of `staged`.
///
/// The staged binary is copied to `<original>.new` beside the original and
/// then renamed over it, retrying while the target is locked. The staged
/// file itself is not modified.
pub fn replace_executable(original: &Path, staged: &Path) -> Result<(), HelperError> {
    match fs::metadata(staged) {
        Ok(meta) if meta.is_file() && meta.len() > 0 => {}
        _ => return Err(HelperError::StagedMissing(staged.to_path_buf())),
    }

    let incoming = sibling_with_suffix(original, ".new");
    fs::copy(staged, &incoming).map_err(|source| HelperError::Copy {
        path: incoming.clone(),
        source,
    })?;

    if let Err(source) = set_executable(&incoming) {
        remove_quietly(&incoming);
        return Err(HelperError::Copy {
            path: incoming,
            source,
        });
    }

    if let Err(source) = rename_with_retry(&incoming, original) {
        remove_quietly(&incoming);
        return Err(HelperError::Replace {
            path: original.to_path_buf(),
            source,
        });
    }

    Ok(())
}

/// Start `path` detached from the helper.
pub fn relaunch(path: &Path) -> Result<(), HelperError> {
    let mut command = Command::new(path);
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        command.current_dir(dir);
    }

    spawn_detached(&mut command)
        .map(|child| info!("Relaunched {:?} as pid {}", path, child.id()))
        .map_err(|source| HelperError::Relaunch {
            path: path.to_path_buf(),
            source,
        })
}

fn rename_with_retry(from: &Path, to: &Path) -> io::Result<()> {
    let mut attempt = 0;
    loop {
        match fs::rename(from, to) {
            Ok(()) => return Ok(()),
            Err(e) if attempt + 1 < REPLACE_ATTEMPTS && is_retryable(&e) => {
                let delay = REPLACE_BACKOFF * 2u32.pow(attempt);
                debug!(
                    "Rename to {:?} failed ({}), retrying in {:?}",
                    to, e, delay
                );
                std::thread::sleep(delay);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn is_retryable(err: &io::Error) -> bool {
    // Windows reports a running or scanned executable as a sharing violation
    err.kind() == ErrorKind::PermissionDenied
        || (cfg!(windows) && matches!(err.raw_os_error(), Some(32) | Some(33)))
}

fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

#[cfg(unix)]
fn set_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}

fn write_outcome(path: &Path, outcome: &ApplyOutcome) {
    let result = serde_json::to_vec_pretty(outcome)
        .map_err(io::Error::from)
        .and_then(|json| fs::write(path, json));
    if let Err(e) = result {
        warn!("Could not record update outcome at {:?}: {}", path, e);
    }
}

fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != ErrorKind::NotFound {
            warn!("Could not remove {:?}: {}", path, e);
        }
    }
}

/// Delete the running helper copy. Only copies made for a single update are
/// removed; Windows refuses while the image is mapped, and the next startup
/// cleanup picks it up instead.
fn remove_self() {
    let Ok(exe) = std::env::current_exe() else {
        return;
    };
    let is_copy = exe
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with(HELPER_PREFIX))
        .unwrap_or(false);
    if is_copy {
        remove_quietly(&exe);
    }
}
