//! Update manager.
//!
//! [`UpdateManager::start`] cleans the staging directory and spawns a single
//! task that owns the [`UpdateState`]. The UI talks to it through an
//! [`UpdateHandle`]: commands go in over an `mpsc` channel and every state
//! change comes back out through a `watch` channel. Checks and downloads run
//! as separate tasks and report back over the manager's own event queue, so
//! nothing but the manager task ever changes the state.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::UpdateConfig;
use crate::download::{DownloadProgress, Downloader, DownloaderConfig};
use crate::error::{CheckError, DownloadError, UpdateError};
use crate::notify::{LogNotifier, NotificationContent, NotificationGate, UpdateNotifier};
use crate::release::{ReleaseClient, ReleaseInfo, ReleaseSource};
use crate::replace::{HelperInstaller, Installer};
use crate::staging::StagingArea;
use crate::state::{UpdateEvent, UpdateState};
use crate::version::Version;

/// Capacity of the command channel.
const COMMAND_CHANNEL_SIZE: usize = 16;

/// Capacity of the internal event channel. Progress events beyond this are
/// dropped; completion events wait for room.
const EVENT_CHANNEL_SIZE: usize = 64;

/// Requests from the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateCommand {
    /// Check the feed now
    CheckNow,
    /// Download the available release
    Accept,
    /// Cancel the running download
    Cancel,
    /// Install the staged release; the application should exit afterwards
    Confirm,
    /// Decline the available or staged release
    Dismiss,
    /// Acknowledge an error
    Retry,
    /// Stop the manager
    Shutdown,
}

/// Results reported to the manager task by its background tasks.
#[derive(Debug)]
enum ManagerEvent {
    CheckFinished {
        result: Result<Option<ReleaseInfo>, CheckError>,
        user_initiated: bool,
    },
    Progress(DownloadProgress),
    DownloadFinished(Result<PathBuf, DownloadError>),
}

/// Cloneable handle to a running [`UpdateManager`].
#[derive(Debug, Clone)]
pub struct UpdateHandle {
    commands: mpsc::Sender<UpdateCommand>,
    state: watch::Receiver<UpdateState>,
}

impl UpdateHandle {
    /// Send a command to the manager.
    pub async fn send(&self, command: UpdateCommand) -> Result<(), UpdateError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| UpdateError::ManagerStopped)
    }

    /// Check the feed now. Failures are shown as `CheckFailed`.
    pub async fn check_now(&self) -> Result<(), UpdateError> {
        self.send(UpdateCommand::CheckNow).await
    }

    /// Start downloading the available release.
    pub async fn accept(&self) -> Result<(), UpdateError> {
        self.send(UpdateCommand::Accept).await
    }

    /// Cancel the running download.
    pub async fn cancel(&self) -> Result<(), UpdateError> {
        self.send(UpdateCommand::Cancel).await
    }

    /// Launch the helper for the staged release.
    pub async fn confirm(&self) -> Result<(), UpdateError> {
        self.send(UpdateCommand::Confirm).await
    }

    pub async fn dismiss(&self) -> Result<(), UpdateError> {
        self.send(UpdateCommand::Dismiss).await
    }

    pub async fn retry(&self) -> Result<(), UpdateError> {
        self.send(UpdateCommand::Retry).await
    }

    /// Stop the manager and wait until it has exited. A running download is
    /// cancelled.
    pub async fn shutdown(&self) -> Result<(), UpdateError> {
        self.send(UpdateCommand::Shutdown).await?;
        let mut state = self.state.clone();
        while state.changed().await.is_ok() {}
        Ok(())
    }

    /// Current state.
    pub fn snapshot(&self) -> UpdateState {
        self.state.borrow().clone()
    }

    /// Receiver notified on every state change.
    pub fn subscribe(&self) -> watch::Receiver<UpdateState> {
        self.state.clone()
    }
}

/// Update manager.
///
/// Built from an [`UpdateConfig`]; every collaborator can be replaced before
/// [`start`](Self::start).
pub struct UpdateManager {
    source: Arc<dyn ReleaseSource>,
    downloader: Arc<Downloader>,
    installer: Arc<dyn Installer>,
    notifier: Arc<dyn UpdateNotifier>,
    staging: StagingArea,
    current_version: Version,
    app_name: String,
    check_interval: Duration,
    check_on_startup: bool,
}

impl UpdateManager {
    /// Create a manager with the default feed client, downloader and helper
    /// installer.
    pub fn new(config: &UpdateConfig) -> Result<Self, UpdateError> {
        config.validate()?;

        let staging = StagingArea::from_config(config)?;
        let source = ReleaseClient::from_config(config)?;
        let downloader = Downloader::with_config(DownloaderConfig::from(&config.network))?;
        let installer = HelperInstaller::from_config(config, staging.clone());

        Ok(Self {
            source: Arc::new(source),
            downloader: Arc::new(downloader),
            installer: Arc::new(installer),
            notifier: Arc::new(LogNotifier),
            staging,
            current_version: config.current_version()?,
            app_name: config.app_name.clone(),
            check_interval: config.check_interval(),
            check_on_startup: config.check_on_startup,
        })
    }

    /// Use a different release feed.
    pub fn with_source(mut self, source: Arc<dyn ReleaseSource>) -> Self {
        self.source = source;
        self
    }

    /// Use a different installer.
    pub fn with_installer(mut self, installer: Arc<dyn Installer>) -> Self {
        self.installer = installer;
        self
    }

    /// Use a different notifier.
    pub fn with_notifier(mut self, notifier: Arc<dyn UpdateNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Override the poll interval.
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn staging(&self) -> &StagingArea {
        &self.staging
    }

    pub fn current_version(&self) -> &Version {
        &self.current_version
    }

    /// Clean up after earlier runs and start the manager task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self) -> UpdateHandle {
        let mut state = UpdateState::Idle;

        match self.staging.cleanup_orphans() {
            Ok(report) => {
                if let Some(failure) = report.previous_failure {
                    let reason = format!(
                        "previous update failed: {}",
                        failure.error.unwrap_or_else(|| "unknown error".to_string())
                    );
                    if let Ok(next) = state.apply(&UpdateEvent::Failed(reason)) {
                        state = next;
                    }
                }
            }
            Err(e) => warn!("Staging cleanup failed: {}", e),
        }

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let (state_tx, state_rx) = watch::channel(state.clone());

        info!(
            "Update manager started (version {}, interval {:?})",
            self.current_version, self.check_interval
        );

        let task = ManagerTask {
            state,
            state_tx,
            event_tx,
            checking: false,
            download_cancel: None,
            rate_limited_until: None,
            gate: NotificationGate::new(),
            manager: self,
        };
        tokio::spawn(task.run(command_rx, event_rx));

        UpdateHandle {
            commands: command_tx,
            state: state_rx,
        }
    }
}

/// The single owner of the update state.
struct ManagerTask {
    state: UpdateState,
    state_tx: watch::Sender<UpdateState>,
    event_tx: mpsc::Sender<ManagerEvent>,
    checking: bool,
    download_cancel: Option<CancellationToken>,
    rate_limited_until: Option<DateTime<Utc>>,
    gate: NotificationGate,
    manager: UpdateManager,
}

impl ManagerTask {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<UpdateCommand>,
        mut events: mpsc::Receiver<ManagerEvent>,
    ) {
        let period = self.manager.check_interval;
        let first_tick = if self.manager.check_on_startup {
            Instant::now()
        } else {
            Instant::now() + period
        };
        let mut ticker = interval_at(first_tick, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(UpdateCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                Some(event) = events.recv() => self.handle_event(event),
                _ = ticker.tick() => self.scheduled_check(),
            }
        }

        if let Some(cancel) = self.download_cancel.take() {
            cancel.cancel();
        }
        info!("Update manager stopped");
    }

    async fn handle_command(&mut self, command: UpdateCommand) {
        debug!("Update command: {:?}", command);

        match command {
            UpdateCommand::CheckNow => {
                if self.checking {
                    debug!("Check already in progress");
                } else if !self.state.accepts_check() {
                    debug!("Ignoring check in state {}", self.state.name());
                } else {
                    self.spawn_check(true);
                }
            }
            UpdateCommand::Accept => {
                if self.transition(UpdateEvent::Accepted) {
                    if let Some(release) = self.state.release().cloned() {
                        self.spawn_download(release);
                    }
                }
            }
            UpdateCommand::Cancel => match &self.download_cancel {
                // The state changes once the download task has cleaned up
                Some(cancel) => cancel.cancel(),
                None => debug!("No download to cancel"),
            },
            UpdateCommand::Confirm => self.confirm().await,
            UpdateCommand::Dismiss => {
                let staged = matches!(self.state, UpdateState::ReadyToInstall { .. });
                if self.transition(UpdateEvent::Dismissed) && staged {
                    if let Err(e) = self.manager.staging.discard_staged() {
                        warn!("Could not remove dismissed update: {}", e);
                    }
                }
            }
            UpdateCommand::Retry => {
                self.transition(UpdateEvent::Retry);
            }
            UpdateCommand::Shutdown => {}
        }
    }

    fn handle_event(&mut self, event: ManagerEvent) {
        match event {
            ManagerEvent::CheckFinished {
                result,
                user_initiated,
            } => {
                self.checking = false;
                self.check_finished(result, user_initiated);
            }
            ManagerEvent::Progress(progress) => {
                if self.state.is_downloading() {
                    self.transition(UpdateEvent::Progress(progress));
                }
            }
            ManagerEvent::DownloadFinished(result) => {
                self.download_cancel = None;
                let event = match result {
                    Ok(path) => {
                        info!("Update staged at {:?}", path);
                        UpdateEvent::DownloadCompleted(path)
                    }
                    Err(DownloadError::Cancelled) => {
                        info!("Update download cancelled");
                        UpdateEvent::DownloadCancelled
                    }
                    Err(e) => {
                        error!("Update download failed: {}", e);
                        UpdateEvent::DownloadFailed(e.to_string())
                    }
                };
                self.transition(event);
            }
        }
    }

    fn check_finished(
        &mut self,
        result: Result<Option<ReleaseInfo>, CheckError>,
        user_initiated: bool,
    ) {
        match result {
            Ok(found) => {
                self.rate_limited_until = None;
                match &found {
                    Some(release) => info!("Update available: {}", release.version),
                    None => debug!("No newer release than {}", self.manager.current_version),
                }
                if self.transition(UpdateEvent::CheckCompleted(found)) {
                    self.notify_available();
                }
            }
            Err(e) => {
                if let CheckError::RateLimited { reset_at } = &e {
                    self.rate_limited_until = *reset_at;
                    warn!("Release feed rate limited until {:?}", reset_at);
                } else {
                    warn!("Update check failed: {}", e);
                }
                self.transition(UpdateEvent::CheckFailed {
                    reason: e.to_string(),
                    user_initiated,
                });
            }
        }
    }

    fn notify_available(&self) {
        if let UpdateState::Available(release) = &self.state {
            if self.gate.should_notify(&release.version) {
                let content = NotificationContent::from_release(&self.manager.app_name, release);
                self.manager.notifier.update_available(&content);
            }
        }
    }

    fn scheduled_check(&mut self) {
        if self.checking || !self.state.accepts_check() {
            return;
        }
        if let Some(until) = self.rate_limited_until {
            if Utc::now() < until {
                debug!("Skipping scheduled check until rate limit resets at {}", until);
                return;
            }
            self.rate_limited_until = None;
        }
        self.spawn_check(false);
    }

    fn spawn_check(&mut self, user_initiated: bool) {
        self.checking = true;
        let source = Arc::clone(&self.manager.source);
        let current = self.manager.current_version.clone();
        let events = self.event_tx.clone();

        debug!("Checking for updates (user initiated: {})", user_initiated);
        tokio::spawn(async move {
            let result = source
                .fetch_latest()
                .await
                .map(|release| release.version.is_newer(&current).then_some(release));
            let _ = events
                .send(ManagerEvent::CheckFinished {
                    result,
                    user_initiated,
                })
                .await;
        });
    }

    fn spawn_download(&mut self, release: ReleaseInfo) {
        let cancel = CancellationToken::new();
        self.download_cancel = Some(cancel.clone());

        let downloader = Arc::clone(&self.manager.downloader);
        let dest = self.manager.staging.staging_path();
        let events = self.event_tx.clone();

        info!("Downloading {} from {}", release.version, release.download_url);
        tokio::spawn(async move {
            let result = download_release(&downloader, &release, &dest, &events, &cancel).await;
            let _ = events.send(ManagerEvent::DownloadFinished(result)).await;
        });
    }

    async fn confirm(&mut self) {
        let staged = match &self.state {
            UpdateState::ReadyToInstall { staged_path, .. } => staged_path.clone(),
            other => {
                warn!("Ignoring install confirmation in state {}", other.name());
                return;
            }
        };

        match self.manager.installer.launch(&staged).await {
            Ok(helper) => {
                info!("Update helper {} running, application should exit", helper.pid);
                self.transition(UpdateEvent::InstallConfirmed);
            }
            Err(e) => {
                error!("Could not start update helper: {}", e);
                self.transition(UpdateEvent::Failed(e.to_string()));
            }
        }
    }

    /// Apply `event`, publish the new state and report whether it was
    /// accepted.
    fn transition(&mut self, event: UpdateEvent) -> bool {
        match self.state.apply(&event) {
            Ok(next) => {
                if next.name() != self.state.name() {
                    info!("Update state: {} -> {}", self.state.name(), next.name());
                }
                self.state = next;
                self.state_tx.send_replace(self.state.clone());
                true
            }
            Err(e) => {
                warn!("{}", e);
                false
            }
        }
    }
}

async fn download_release(
    downloader: &Downloader,
    release: &ReleaseInfo,
    dest: &std::path::Path,
    events: &mpsc::Sender<ManagerEvent>,
    cancel: &CancellationToken,
) -> Result<PathBuf, DownloadError> {
    let expected_sha256 = match &release.checksum_url {
        Some(url) => tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            checksum = downloader.fetch_checksum(url) => Some(checksum?),
        },
        None => None,
    };

    let progress_events = events.clone();
    let outcome = downloader
        .download(
            &release.download_url,
            dest,
            release.size,
            expected_sha256,
            move |progress| {
                // Coalescable: a full queue only drops an intermediate update
                let _ = progress_events.try_send(ManagerEvent::Progress(progress));
            },
            cancel,
        )
        .await?;

    Ok(outcome.path)
}
