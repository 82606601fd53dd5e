//! Release feed client.
//!
//! Fetches the latest release descriptor from a GitHub-style releases API
//! and picks the asset built for this platform. The feed is unauthenticated
//! and rate limited, so the client performs exactly one request per call and
//! never retries on its own.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::UpdateConfig;
use crate::error::{CheckError, UpdateError};
use crate::version::Version;

/// Suffix of the optional checksum asset published next to a binary.
const CHECKSUM_SUFFIX: &str = ".sha256";

/// A release as seen by the updater.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseInfo {
    /// Raw tag name, e.g. `v0.3.1`
    pub tag: String,
    /// Parsed tag
    pub version: Version,
    /// Download URL of the platform asset
    pub download_url: String,
    /// Name of the platform asset
    pub asset_name: String,
    /// When the release was published
    pub published_at: Option<DateTime<Utc>>,
    /// Asset size reported by the feed
    pub size: Option<u64>,
    /// Release notes (markdown)
    pub release_notes: String,
    /// URL of `<asset>.sha256`, when published
    pub checksum_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GitHubRelease {
    tag_name: String,
    #[serde(default)]
    published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    assets: Vec<GitHubAsset>,
}

#[derive(Debug, Deserialize)]
struct GitHubAsset {
    name: String,
    browser_download_url: String,
    #[serde(default)]
    size: Option<u64>,
}

/// Source of release descriptors.
///
/// Implemented by [`ReleaseClient`]; the manager only depends on this trait.
#[async_trait]
pub trait ReleaseSource: Send + Sync {
    /// Fetch the latest published release.
    async fn fetch_latest(&self) -> Result<ReleaseInfo, CheckError>;
}

/// HTTP client for the release feed.
pub struct ReleaseClient {
    client: reqwest::Client,
    latest_url: String,
    asset_name: String,
}

impl ReleaseClient {
    /// Create a client for `latest_url` selecting `asset_name`.
    pub fn new(
        latest_url: impl Into<String>,
        asset_name: impl Into<String>,
        user_agent: &str,
        timeout: Duration,
    ) -> Result<Self, UpdateError> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| UpdateError::HttpClient(e.to_string()))?;

        Ok(Self {
            client,
            latest_url: latest_url.into(),
            asset_name: asset_name.into(),
        })
    }

    /// Create a client from the update configuration.
    pub fn from_config(config: &UpdateConfig) -> Result<Self, UpdateError> {
        Self::new(
            config.latest_release_url(),
            config.asset_name(),
            &config.network.user_agent(),
            Duration::from_secs(config.network.connect_timeout_seconds),
        )
    }

    /// Name of the asset this client selects.
    pub fn asset_name(&self) -> &str {
        &self.asset_name
    }

    /// Fetch the latest release descriptor.
    ///
    /// # Errors
    ///
    /// - [`CheckError::Network`] on transport failure or unexpected status
    /// - [`CheckError::RateLimited`] on HTTP 403 or 429
    /// - [`CheckError::InvalidResponse`] if the body is not release JSON
    /// - [`CheckError::ParseFailed`] if the tag is not a version
    /// - [`CheckError::NoMatchingAsset`] if no asset matches this platform
    pub async fn fetch_latest(&self) -> Result<ReleaseInfo, CheckError> {
        debug!("Fetching latest release from {}", self.latest_url);

        let response = self
            .client
            .get(&self.latest_url)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::FORBIDDEN || status == StatusCode::TOO_MANY_REQUESTS {
            let reset_at = rate_limit_reset(response.headers());
            warn!("Release feed rate limited (status {}), reset at {:?}", status, reset_at);
            return Err(CheckError::RateLimited { reset_at });
        }
        if !status.is_success() {
            return Err(CheckError::Network(format!(
                "unexpected status {} from release feed",
                status.as_u16()
            )));
        }

        let body = response.bytes().await?;
        let release: GitHubRelease = serde_json::from_slice(&body)
            .map_err(|e| CheckError::InvalidResponse(e.to_string()))?;

        select_release(release, &self.asset_name)
    }

    /// Fetch the latest release and return it only if it is newer than `current`.
    pub async fn check(&self, current: &Version) -> Result<Option<ReleaseInfo>, CheckError> {
        let release = self.fetch_latest().await?;
        if release.version.is_newer(current) {
            info!("Update available: {} -> {}", current, release.version);
            Ok(Some(release))
        } else {
            debug!(
                "No update available (current: {}, latest: {})",
                current, release.version
            );
            Ok(None)
        }
    }
}

#[async_trait]
impl ReleaseSource for ReleaseClient {
    async fn fetch_latest(&self) -> Result<ReleaseInfo, CheckError> {
        ReleaseClient::fetch_latest(self).await
    }
}

/// Turn a feed release into a [`ReleaseInfo`] for `asset_name`.
fn select_release(release: GitHubRelease, asset_name: &str) -> Result<ReleaseInfo, CheckError> {
    let version = Version::parse(&release.tag_name)?;

    let asset = release
        .assets
        .iter()
        .find(|a| a.name == asset_name)
        .ok_or_else(|| CheckError::NoMatchingAsset {
            expected: asset_name.to_string(),
        })?;

    let checksum_name = format!("{}{}", asset_name, CHECKSUM_SUFFIX);
    let checksum_url = release
        .assets
        .iter()
        .find(|a| a.name == checksum_name)
        .map(|a| a.browser_download_url.clone());

    Ok(ReleaseInfo {
        tag: release.tag_name.clone(),
        version,
        download_url: asset.browser_download_url.clone(),
        asset_name: asset.name.clone(),
        published_at: release.published_at,
        size: asset.size.filter(|&s| s > 0),
        release_notes: release.body.clone().unwrap_or_default(),
        checksum_url,
    })
}

/// Parse the `x-ratelimit-reset` header (Unix seconds).
fn rate_limit_reset(headers: &reqwest::header::HeaderMap) -> Option<DateTime<Utc>> {
    headers
        .get("x-ratelimit-reset")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<i64>().ok())
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn release_json(tag: &str) -> serde_json::Value {
        json!({
            "tag_name": tag,
            "published_at": "2024-05-01T12:00:00Z",
            "body": "Bug fixes",
            "assets": [
                {"name": "rdp.exe", "browser_download_url": "https://example.com/rdp.exe", "size": 1024},
                {"name": "rdp.exe.sha256", "browser_download_url": "https://example.com/rdp.exe.sha256", "size": 64},
                {"name": "rdp", "browser_download_url": "https://example.com/rdp", "size": 2048}
            ]
        })
    }

    async fn client_for(server: &MockServer, asset: &str) -> ReleaseClient {
        ReleaseClient::new(
            format!("{}/releases/latest", server.uri()),
            asset,
            "zrc-selfupdate-test",
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn test_select_release_picks_platform_asset() {
        let release: GitHubRelease = serde_json::from_value(release_json("v0.3.1")).unwrap();
        let info = select_release(release, "rdp.exe").unwrap();

        assert_eq!(info.tag, "v0.3.1");
        assert_eq!(info.version, Version::parse("0.3.1").unwrap());
        assert_eq!(info.download_url, "https://example.com/rdp.exe");
        assert_eq!(info.size, Some(1024));
        assert_eq!(info.release_notes, "Bug fixes");
        assert_eq!(
            info.checksum_url.as_deref(),
            Some("https://example.com/rdp.exe.sha256")
        );
        assert!(info.published_at.is_some());
    }

    #[test]
    fn test_select_release_without_checksum() {
        let release: GitHubRelease = serde_json::from_value(release_json("v0.3.1")).unwrap();
        let info = select_release(release, "rdp").unwrap();
        assert!(info.checksum_url.is_none());
    }

    #[test]
    fn test_select_release_no_matching_asset() {
        let release: GitHubRelease = serde_json::from_value(release_json("v0.3.1")).unwrap();
        let err = select_release(release, "rdp-macos").unwrap_err();
        assert!(matches!(err, CheckError::NoMatchingAsset { expected } if expected == "rdp-macos"));
    }

    #[test]
    fn test_select_release_bad_tag() {
        let release: GitHubRelease = serde_json::from_value(release_json("nightly")).unwrap();
        let err = select_release(release, "rdp").unwrap_err();
        assert!(matches!(err, CheckError::ParseFailed(_)));
    }

    #[tokio::test]
    async fn test_fetch_latest_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/releases/latest"))
            .and(header("accept", "application/vnd.github+json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(release_json("v0.3.1")))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, "rdp").await;
        let info = client.fetch_latest().await.unwrap();
        assert_eq!(info.version, Version::parse("0.3.1").unwrap());
        assert_eq!(info.asset_name, "rdp");
    }

    #[tokio::test]
    async fn test_fetch_latest_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/releases/latest"))
            .respond_with(
                ResponseTemplate::new(429).insert_header("x-ratelimit-reset", "1714564800"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, "rdp").await;
        match client.fetch_latest().await {
            Err(CheckError::RateLimited { reset_at }) => {
                assert_eq!(reset_at.map(|t| t.timestamp()), Some(1714564800));
            }
            other => panic!("expected RateLimited, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fetch_latest_forbidden_is_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let client = client_for(&server, "rdp").await;
        assert!(matches!(
            client.fetch_latest().await,
            Err(CheckError::RateLimited { reset_at: None })
        ));
    }

    #[tokio::test]
    async fn test_fetch_latest_server_error_is_network() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = client_for(&server, "rdp").await;
        assert!(matches!(
            client.fetch_latest().await,
            Err(CheckError::Network(_))
        ));
    }

    #[tokio::test]
    async fn test_fetch_latest_invalid_json() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let client = client_for(&server, "rdp").await;
        assert!(matches!(
            client.fetch_latest().await,
            Err(CheckError::InvalidResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_fetch_latest_connection_refused_is_network() {
        let client = ReleaseClient::new(
            "http://127.0.0.1:9/releases/latest",
            "rdp",
            "zrc-selfupdate-test",
            Duration::from_secs(2),
        )
        .unwrap();
        assert!(matches!(
            client.fetch_latest().await,
            Err(CheckError::Network(_))
        ));
    }

    #[tokio::test]
    async fn test_check_only_returns_newer() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(release_json("0.2.9")))
            .mount(&server)
            .await;

        let client = client_for(&server, "rdp").await;
        let current = Version::parse("0.3.0").unwrap();
        assert!(client.check(&current).await.unwrap().is_none());

        let older = Version::parse("0.2.0").unwrap();
        assert!(client.check(&older).await.unwrap().is_some());
    }
}
