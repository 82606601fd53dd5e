//! Update notifications.
//!
//! The manager calls an [`UpdateNotifier`] when a release first becomes
//! available. The host application plugs in its own notifier (tray balloon,
//! toast, in-app banner); [`LogNotifier`] only logs. [`NotificationGate`]
//! keeps repeated polls from announcing the same version twice.

use std::sync::Mutex;

use tracing::info;

use crate::release::ReleaseInfo;
use crate::version::Version;

/// Longest release-notes summary shown in a notification.
const SUMMARY_MAX_CHARS: usize = 200;

/// Text of an update notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationContent {
    /// Title of the notification
    pub title: String,
    /// Body text of the notification
    pub body: String,
    /// Version being offered
    pub version: Version,
    /// First paragraph of the release notes, truncated
    pub release_notes_summary: String,
}

impl NotificationContent {
    /// Create notification content for `release`.
    pub fn from_release(app_name: &str, release: &ReleaseInfo) -> Self {
        let title = format!("Update Available: {}", release.version);
        let mut body = format!(
            "A new version of {} is available.\n\nVersion: {}",
            app_name, release.version
        );
        if let Some(size) = release.size {
            body.push_str(&format!("\nSize: {:.1} MB", size as f64 / (1024.0 * 1024.0)));
        }

        Self {
            title,
            body,
            version: release.version.clone(),
            release_notes_summary: summarize_release_notes(&release.release_notes),
        }
    }
}

/// Receives update notifications.
pub trait UpdateNotifier: Send + Sync {
    /// A newer release is available.
    fn update_available(&self, content: &NotificationContent);
}

/// Notifier that writes to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl UpdateNotifier for LogNotifier {
    fn update_available(&self, content: &NotificationContent) {
        info!("{}: {}", content.title, content.release_notes_summary);
    }
}

/// Lets each version through once.
#[derive(Debug, Default)]
pub struct NotificationGate {
    last_notified: Mutex<Option<Version>>,
}

impl NotificationGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true the first time `version` is seen, or when it differs
    /// from the last version let through.
    pub fn should_notify(&self, version: &Version) -> bool {
        let mut last = match self.last_notified.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if last.as_ref() == Some(version) {
            return false;
        }
        *last = Some(version.clone());
        true
    }
}

/// First paragraph of `notes`, cut at a word boundary if too long.
fn summarize_release_notes(notes: &str) -> String {
    let first_para = notes.split("\n\n").next().unwrap_or(notes).trim();

    match first_para.char_indices().nth(SUMMARY_MAX_CHARS) {
        None => first_para.to_string(),
        Some((cut, _)) => {
            let truncated = &first_para[..cut];
            match truncated.rfind(' ') {
                Some(last_space) => format!("{}...", &truncated[..last_space]),
                None => format!("{}...", truncated),
            }
        }
    }
}
