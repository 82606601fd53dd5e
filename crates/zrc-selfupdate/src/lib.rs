//! # zrc-selfupdate
//!
//! In-place self-update for the ZRC desktop client.
//!
//! This crate handles:
//! - Comparing release versions of any length (`v0.3`, `1.2.3.4`)
//! - Polling a GitHub-style release feed for the latest release
//! - Downloading the new binary into a staging directory with progress
//! - Handing the staged binary to a detached helper that swaps it in once
//!   the client has exited, then relaunches the client
//! - Cleaning up staging files abandoned by an interrupted update
//! - A state machine the UI can observe and drive
//!
//! ## Safety of the swap
//!
//! The running executable is only ever replaced by renaming a complete copy
//! over it, and the staged binary is kept until that rename succeeds. If any
//! step fails the client keeps running the old version.
//!
//! ## Usage
//!
//! ```no_run
//! use zrc_selfupdate::{UpdateConfig, UpdateManager, UpdateState};
//!
//! # async fn run() -> Result<(), zrc_selfupdate::UpdateError> {
//! let config = UpdateConfig::default();
//! let handle = UpdateManager::new(&config)?.start();
//!
//! handle.check_now().await?;
//! let mut states = handle.subscribe();
//! while states.changed().await.is_ok() {
//!     match &*states.borrow() {
//!         UpdateState::Available(release) => println!("{} is available", release.version),
//!         UpdateState::Applying => break, // exit so the helper can swap the binary
//!         other => println!("{}", other),
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod download;
pub mod error;
pub mod helper;
pub mod manager;
pub mod notify;
pub mod process;
#[cfg(test)]
mod proptests;
pub mod release;
pub mod replace;
pub mod staging;
pub mod state;
pub mod version;

// Re-export main types for convenience
pub use config::{NetworkConfig, ReplaceConfig, StagingConfig, UpdateConfig};
pub use download::{DownloadOutcome, DownloadProgress, Downloader, DownloaderConfig};
pub use error::{
    ApplyError, CheckError, ConfigError, DownloadError, HelperError, ParseError, StagingError,
    UpdateError,
};
pub use helper::HelperArgs;
pub use manager::{UpdateCommand, UpdateHandle, UpdateManager};
pub use notify::{LogNotifier, NotificationContent, UpdateNotifier};
pub use release::{ReleaseClient, ReleaseInfo, ReleaseSource};
pub use replace::{HelperInstaller, Installer, LaunchedHelper};
pub use staging::{ApplyMarker, ApplyOutcome, CleanupReport, CleanupSkipped, StagingArea};
pub use state::{TransitionError, UpdateEvent, UpdateState};
pub use version::{is_newer, Version};
