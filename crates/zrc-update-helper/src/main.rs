use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;
use zrc_selfupdate::helper::{self, HelperArgs};

#[derive(Parser, Debug)]
#[command(name = "zrc-update-helper")]
#[command(about = "Swaps in a staged ZRC binary after the client exits")]
struct Args {
    /// Pid of the client to wait for
    #[arg(long)]
    parent_pid: u32,

    /// Executable to replace
    #[arg(long)]
    original: PathBuf,

    /// Staged binary to install
    #[arg(long)]
    staged: PathBuf,

    /// Seconds to wait for the client to exit before replacing anyway
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,

    /// Apply marker to remove when done
    #[arg(long)]
    marker: Option<PathBuf>,

    /// File to record a failed swap in
    #[arg(long)]
    outcome: Option<PathBuf>,

    /// Log file (appended)
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Do not start the updated executable
    #[arg(long)]
    no_relaunch: bool,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl From<&Args> for HelperArgs {
    fn from(args: &Args) -> Self {
        HelperArgs {
            parent_pid: args.parent_pid,
            original: args.original.clone(),
            staged: args.staged.clone(),
            wait_timeout: Duration::from_secs(args.timeout_secs),
            marker: args.marker.clone(),
            outcome: args.outcome.clone(),
            relaunch: !args.no_relaunch,
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    // Keeps the file writer flushing until exit
    let _guard = init_logging(&args);

    match helper::run(&HelperArgs::from(&args)) {
        Ok(()) => {
            info!("Update applied");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Update not applied: {:#}", anyhow::Error::new(e));
            ExitCode::FAILURE
        }
    }
}

/// Log to stderr and, when `--log-file` is usable, to that file as well.
fn init_logging(args: &Args) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "zrc_update_helper={},zrc_selfupdate={}",
            args.log_level, args.log_level
        ))
    });

    let (writer, guard, file_error) = match args.log_file.as_deref().map(file_writer) {
        Some(Ok((writer, guard))) => (Some(writer), Some(guard), None),
        Some(Err(e)) => (None, None, Some(e)),
        None => (None, None, None),
    };
    let file_layer = writer.map(|writer| {
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(writer)
    });

    if let Err(e) = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()
    {
        eprintln!("zrc-update-helper: installing log subscriber: {}", e);
    }

    if let Some(e) = file_error {
        warn!("Logging to stderr only: {:#}", e);
    }

    guard
}

fn file_writer(path: &Path) -> anyhow::Result<(NonBlocking, WorkerGuard)> {
    let dir = path
        .parent()
        .filter(|d| !d.as_os_str().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let name = path
        .file_name()
        .context("log file path has no file name")?;
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("creating log directory {}", dir.display()))?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(name.to_string_lossy())
        .build(&dir)
        .with_context(|| format!("opening log file {}", path.display()))?;
    Ok(tracing_appender::non_blocking(appender))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_command_line() {
        let args = Args::try_parse_from([
            "zrc-update-helper",
            "--parent-pid",
            "4242",
            "--original",
            "/opt/rdp/rdp",
            "--staged",
            "/data/updates/rdp-update",
            "--timeout-secs",
            "5",
            "--marker",
            "/data/updates/apply.json",
            "--outcome",
            "/data/updates/last-apply.json",
            "--log-file",
            "/data/updates/update-helper.log",
            "--no-relaunch",
        ])
        .unwrap();

        let helper_args = HelperArgs::from(&args);
        assert_eq!(helper_args.parent_pid, 4242);
        assert_eq!(helper_args.original, PathBuf::from("/opt/rdp/rdp"));
        assert_eq!(helper_args.wait_timeout, Duration::from_secs(5));
        assert_eq!(
            helper_args.marker,
            Some(PathBuf::from("/data/updates/apply.json"))
        );
        assert!(!helper_args.relaunch);
    }

    #[test]
    fn test_defaults() {
        let args = Args::try_parse_from([
            "zrc-update-helper",
            "--parent-pid",
            "1",
            "--original",
            "rdp",
            "--staged",
            "rdp-update",
        ])
        .unwrap();

        let helper_args = HelperArgs::from(&args);
        assert_eq!(helper_args.wait_timeout, Duration::from_secs(30));
        assert!(helper_args.relaunch);
        assert!(helper_args.outcome.is_none());
    }

    #[test]
    fn test_log_file_without_name_is_rejected() {
        assert!(file_writer(Path::new("/")).is_err());
    }

    #[test]
    fn test_log_file_in_unwritable_location_is_rejected() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let blocker = temp_dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();

        assert!(file_writer(&blocker.join("update-helper.log")).is_err());
    }

    #[test]
    fn test_log_file_writer_creates_directory() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let dir = temp_dir.path().join("logs");

        let (_writer, _guard) = file_writer(&dir.join("update-helper.log")).unwrap();
        assert!(dir.is_dir());
    }

    #[test]
    fn test_required_arguments() {
        assert!(Args::try_parse_from(["zrc-update-helper", "--parent-pid", "1"]).is_err());
    }
}
