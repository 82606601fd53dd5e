//! Update state machine.
//!
//! [`UpdateState::apply`] is a pure function from the current state and an
//! event to the next state. Only the manager actor holds an `UpdateState`
//! and only through `apply`, so every change the UI can observe is one of
//! the transitions listed here:
//!
//! ```text
//! Idle / CheckFailed --CheckCompleted(Some)------------> Available
//! Idle / CheckFailed --CheckCompleted(None)------------> Idle
//! Idle / CheckFailed --CheckFailed{user_initiated}-----> CheckFailed
//! Idle / CheckFailed --CheckFailed{background}---------> unchanged
//! Available          --Accepted------------------------> Downloading
//! Available          --Dismissed-----------------------> Idle
//! Downloading        --Progress------------------------> Downloading
//! Downloading        --DownloadCompleted---------------> ReadyToInstall
//! Downloading        --DownloadFailed------------------> Error
//! Downloading        --DownloadCancelled---------------> Available
//! ReadyToInstall     --InstallConfirmed----------------> Applying
//! ReadyToInstall     --Dismissed-----------------------> Idle
//! Error / CheckFailed --Retry--------------------------> Idle
//! any but Applying   --Failed--------------------------> Error
//! ```
//!
//! `Applying` is terminal: the process is about to exit.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::download::DownloadProgress;
use crate::release::ReleaseInfo;

/// What the updater is doing, as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum UpdateState {
    /// Nothing to report
    #[default]
    Idle,
    /// A check the user asked for failed
    CheckFailed(String),
    /// A newer release is available
    Available(ReleaseInfo),
    /// The release is being downloaded
    Downloading {
        release: ReleaseInfo,
        progress: DownloadProgress,
    },
    /// The release is staged and can be installed
    ReadyToInstall {
        release: ReleaseInfo,
        staged_path: PathBuf,
    },
    /// The helper has been launched; the application should exit
    Applying,
    /// Download or install failed
    Error(String),
}

/// Input to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateEvent {
    /// A check finished; `Some` when a newer release exists
    CheckCompleted(Option<ReleaseInfo>),
    /// A check failed
    CheckFailed { reason: String, user_initiated: bool },
    /// User chose to download the available release
    Accepted,
    /// Bytes arrived
    Progress(DownloadProgress),
    /// Download finished and was moved to the staging path
    DownloadCompleted(PathBuf),
    /// Download failed
    DownloadFailed(String),
    /// Download was cancelled
    DownloadCancelled,
    /// User confirmed installation and the helper is running
    InstallConfirmed,
    /// User declined the available or staged release
    Dismissed,
    /// Unrecoverable failure outside a download
    Failed(String),
    /// User acknowledged an error
    Retry,
}

/// Rejected transition. The state is left unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("event {event} is not valid in state {state}")]
    Invalid {
        state: &'static str,
        event: &'static str,
    },

    #[error("update is being applied, ignoring {event}")]
    Terminal { event: &'static str },
}

impl UpdateState {
    /// Compute the state that follows `event`.
    pub fn apply(&self, event: &UpdateEvent) -> Result<UpdateState, TransitionError> {
        use UpdateEvent as E;
        use UpdateState as S;

        let next = match (self, event) {
            (S::Applying, _) => {
                return Err(TransitionError::Terminal {
                    event: event.name(),
                })
            }

            (_, E::Failed(reason)) => S::Error(reason.clone()),

            (S::Idle | S::CheckFailed(_), E::CheckCompleted(Some(release))) => {
                S::Available(release.clone())
            }
            (S::Idle | S::CheckFailed(_), E::CheckCompleted(None)) => S::Idle,
            (
                S::Idle | S::CheckFailed(_),
                E::CheckFailed {
                    reason,
                    user_initiated: true,
                },
            ) => S::CheckFailed(reason.clone()),
            (
                S::Idle | S::CheckFailed(_),
                E::CheckFailed {
                    user_initiated: false,
                    ..
                },
            ) => self.clone(),

            (S::Available(release), E::Accepted) => S::Downloading {
                release: release.clone(),
                progress: DownloadProgress::new(0, release.size),
            },
            (S::Available(_), E::Dismissed) => S::Idle,

            (S::Downloading { release, .. }, E::Progress(progress)) => S::Downloading {
                release: release.clone(),
                progress: *progress,
            },
            (S::Downloading { release, .. }, E::DownloadCompleted(path)) => S::ReadyToInstall {
                release: release.clone(),
                staged_path: path.clone(),
            },
            (S::Downloading { .. }, E::DownloadFailed(reason)) => S::Error(reason.clone()),
            (S::Downloading { release, .. }, E::DownloadCancelled) => {
                S::Available(release.clone())
            }

            (S::ReadyToInstall { .. }, E::InstallConfirmed) => S::Applying,
            (S::ReadyToInstall { .. }, E::Dismissed) => S::Idle,

            (S::Error(_) | S::CheckFailed(_), E::Retry) => S::Idle,

            _ => {
                return Err(TransitionError::Invalid {
                    state: self.name(),
                    event: event.name(),
                })
            }
        };

        Ok(next)
    }

    /// Variant name, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            UpdateState::Idle => "Idle",
            UpdateState::CheckFailed(_) => "CheckFailed",
            UpdateState::Available(_) => "Available",
            UpdateState::Downloading { .. } => "Downloading",
            UpdateState::ReadyToInstall { .. } => "ReadyToInstall",
            UpdateState::Applying => "Applying",
            UpdateState::Error(_) => "Error",
        }
    }

    /// Release this state refers to, if any.
    pub fn release(&self) -> Option<&ReleaseInfo> {
        match self {
            UpdateState::Available(release)
            | UpdateState::Downloading { release, .. }
            | UpdateState::ReadyToInstall { release, .. } => Some(release),
            _ => None,
        }
    }

    /// Whether a new check may start from this state.
    pub fn accepts_check(&self) -> bool {
        matches!(self, UpdateState::Idle | UpdateState::CheckFailed(_))
    }

    pub fn is_downloading(&self) -> bool {
        matches!(self, UpdateState::Downloading { .. })
    }
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateState::Idle => write!(f, "Up to date"),
            UpdateState::CheckFailed(reason) => write!(f, "Update check failed: {}", reason),
            UpdateState::Available(release) => write!(f, "Update {} available", release.version),
            UpdateState::Downloading { release, progress } => {
                write!(f, "Downloading {}: {}", release.version, progress)
            }
            UpdateState::ReadyToInstall { release, .. } => {
                write!(f, "Update {} ready to install", release.version)
            }
            UpdateState::Applying => write!(f, "Installing update"),
            UpdateState::Error(reason) => write!(f, "Update failed: {}", reason),
        }
    }
}

impl UpdateEvent {
    /// Variant name, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            UpdateEvent::CheckCompleted(_) => "CheckCompleted",
            UpdateEvent::CheckFailed { .. } => "CheckFailed",
            UpdateEvent::Accepted => "Accepted",
            UpdateEvent::Progress(_) => "Progress",
            UpdateEvent::DownloadCompleted(_) => "DownloadCompleted",
            UpdateEvent::DownloadFailed(_) => "DownloadFailed",
            UpdateEvent::DownloadCancelled => "DownloadCancelled",
            UpdateEvent::InstallConfirmed => "InstallConfirmed",
            UpdateEvent::Dismissed => "Dismissed",
            UpdateEvent::Failed(_) => "Failed",
            UpdateEvent::Retry => "Retry",
        }
    }
}
