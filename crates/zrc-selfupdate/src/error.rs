//! Error types for the self-update pipeline.
//!
//! Each stage has its own error enum so callers can react to the exact
//! failure (a rate-limited check is handled very differently from a full
//! disk). [`UpdateError`] aggregates them for code that only needs to
//! report.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// A version string could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// Nothing left to parse after stripping the prefix
    #[error("empty version string")]
    Empty,

    /// A dot-separated component is empty or not a non-negative integer
    #[error("invalid version component {component:?} in {input:?}")]
    InvalidComponent { input: String, component: String },
}

/// Errors from checking the release feed.
#[derive(Debug, Clone, Error)]
pub enum CheckError {
    /// Transport failure or unexpected HTTP status
    #[error("network error: {0}")]
    Network(String),

    /// Feed refused the request (HTTP 403/429)
    #[error("release feed rate limit exceeded")]
    RateLimited {
        /// When the feed says the quota resets, if it said so
        reset_at: Option<DateTime<Utc>>,
    },

    /// Release has no asset for this platform
    #[error("release has no asset named {expected}")]
    NoMatchingAsset { expected: String },

    /// Release tag is not a version
    #[error("release tag is not a valid version: {0}")]
    ParseFailed(#[from] ParseError),

    /// Body was not the expected release JSON
    #[error("invalid release response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for CheckError {
    fn from(err: reqwest::Error) -> Self {
        CheckError::Network(err.to_string())
    }
}

/// Errors from downloading a release asset.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Transport failure or non-success HTTP status
    #[error("network error: {0}")]
    Network(String),

    /// Local filesystem failure (disk full, permission denied)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Caller cancelled the download
    #[error("download cancelled")]
    Cancelled,

    /// Stream ended before the advertised length arrived
    #[error("download incomplete: expected {expected} bytes, got {actual}")]
    Incomplete { expected: u64, actual: u64 },

    /// Downloaded bytes do not match the published SHA-256
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
}

impl From<reqwest::Error> for DownloadError {
    fn from(err: reqwest::Error) -> Self {
        DownloadError::Network(err.to_string())
    }
}

/// Errors launching the swap helper from the running client.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// Helper executable does not exist
    #[error("update helper not found at {0}")]
    HelperNotFound(PathBuf),

    /// Staged binary is missing or empty
    #[error("staged update missing or empty: {0}")]
    StagedMissing(PathBuf),

    /// Path of the running executable is unknown
    #[error("cannot determine current executable: {0}")]
    CurrentExe(String),

    /// Helper process could not be started
    #[error("failed to launch update helper: {0}")]
    Spawn(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors inside the detached helper while swapping binaries.
#[derive(Debug, Error)]
pub enum HelperError {
    /// Staged binary is missing or empty
    #[error("staged update missing or empty: {0}")]
    StagedMissing(PathBuf),

    /// New binary could not be copied next to the original
    #[error("failed to copy staged binary to {path}: {source}")]
    Copy {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// New binary could not be moved over the original
    #[error("failed to replace {path}: {source}")]
    Replace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Updated binary could not be started
    #[error("failed to relaunch {path}: {source}")]
    Relaunch {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the staging directory.
#[derive(Debug, Error)]
pub enum StagingError {
    /// Update directory could not be determined
    #[error("no per-user data directory available")]
    NoDataDir,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Marker or outcome file is malformed
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Configuration is unreadable or invalid.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML could not be parsed
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML could not be written
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A field holds an unusable value
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Any error the update pipeline can produce.
#[derive(Debug, Error)]
pub enum UpdateError {
    /// Version parsing error
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// Release check error
    #[error(transparent)]
    Check(#[from] CheckError),

    /// Download error
    #[error(transparent)]
    Download(#[from] DownloadError),

    /// Helper launch error
    #[error(transparent)]
    Apply(#[from] ApplyError),

    /// Helper swap error
    #[error(transparent)]
    Helper(#[from] HelperError),

    /// Staging directory error
    #[error(transparent)]
    Staging(#[from] StagingError),

    /// Configuration error
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// HTTP client could not be built
    #[error("HTTP client error: {0}")]
    HttpClient(String),

    /// The manager task is no longer running
    #[error("update manager has stopped")]
    ManagerStopped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_rate_limited() {
        let err = CheckError::RateLimited { reset_at: None };
        assert_eq!(err.to_string(), "release feed rate limit exceeded");
    }

    #[test]
    fn display_parse_failed_wraps_parse_error() {
        let err: CheckError = ParseError::Empty.into();
        assert_eq!(err.to_string(), "release tag is not a valid version: empty version string");
    }

    #[test]
    fn from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: DownloadError = io_err.into();
        assert!(matches!(err, DownloadError::Io(_)));
        assert!(err.to_string().contains("denied"));
    }

    #[test]
    fn update_error_is_transparent() {
        let err: UpdateError = DownloadError::Cancelled.into();
        assert_eq!(err.to_string(), "download cancelled");
    }
}
