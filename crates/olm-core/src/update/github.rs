//! GitHub Releases as an update source.

use reqwest::header::{ACCEPT, HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;

use super::source::RemoteVersion;
use crate::download::USER_AGENT_VALUE;
use crate::error::{CoreError, Result};

/// GitHub API base URL.
const GITHUB_API_URL: &str = "https://api.github.com";

/// Release data from the GitHub API.
#[derive(Debug, Clone, Deserialize)]
pub struct GitHubRelease {
    /// Tag such as `v1.2.0`.
    pub tag_name: String,

    /// Release notes in markdown.
    #[serde(default)]
    pub body: Option<String>,

    /// Pre-release flag.
    #[serde(default)]
    pub prerelease: bool,

    /// Attached files.
    #[serde(default)]
    pub assets: Vec<GitHubAsset>,
}

impl GitHubRelease {
    /// Version without the `v` prefix.
    #[must_use]
    pub fn version(&self) -> &str {
        self.tag_name.strip_prefix('v').unwrap_or(&self.tag_name)
    }

    /// First fully uploaded `.zip` asset.
    #[must_use]
    pub fn update_asset(&self) -> Option<&GitHubAsset> {
        self.assets
            .iter()
            .find(|asset| asset.is_uploaded() && asset.name.to_lowercase().ends_with(".zip"))
    }

    /// Describe this release as an update.
    pub fn into_remote_version(self) -> Result<RemoteVersion> {
        let asset = self.update_asset().ok_or_else(|| {
            CoreError::Config(format!("release {} has no uploaded .zip asset", self.tag_name))
        })?;

        Ok(RemoteVersion {
            version: self.version().to_string(),
            download_url: asset.browser_download_url.clone(),
            release_notes: self.body.clone().unwrap_or_default(),
            file_size: asset.size,
            expected_hash: asset.digest.clone().filter(|d| d.starts_with("sha256:")),
            force_update: false,
        })
    }
}

/// Release asset.
#[derive(Debug, Clone, Deserialize)]
pub struct GitHubAsset {
    /// File name.
    pub name: String,

    /// Direct download URL.
    pub browser_download_url: String,

    /// `uploaded` once complete.
    #[serde(default)]
    pub state: String,

    /// `sha256:<hex>` when GitHub has computed it.
    #[serde(default)]
    pub digest: Option<String>,

    /// Size in bytes.
    #[serde(default)]
    pub size: u64,
}

impl GitHubAsset {
    /// True once the upload finished.
    #[must_use]
    pub fn is_uploaded(&self) -> bool {
        self.state == "uploaded"
    }
}

/// Minimal REST client for release lookups.
#[derive(Debug, Clone)]
pub struct GitHubClient {
    client: reqwest::Client,
    api_url: String,
}

impl GitHubClient {
    /// Client for `api.github.com`.
    pub fn new() -> Result<Self> {
        Self::with_api_url(GITHUB_API_URL)
    }

    /// Client for another API root.
    pub fn with_api_url(api_url: impl Into<String>) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/vnd.github+json"),
        );
        headers.insert(
            "X-GitHub-Api-Version",
            HeaderValue::from_static("2022-11-28"),
        );
        headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| CoreError::Network(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Latest published release of `owner/repo`.
    pub async fn latest_release(&self, owner: &str, repo: &str) -> Result<GitHubRelease> {
        let url = format!("{}/repos/{}/{}/releases/latest", self.api_url, owner, repo);
        tracing::debug!("Fetching latest release from {}", url);

        let response = self.client.get(&url).send().await?;
        let status = response.status();

        if status == reqwest::StatusCode::FORBIDDEN
            && response
                .headers()
                .get("x-ratelimit-remaining")
                .is_some_and(|remaining| remaining.to_str().unwrap_or("1") == "0")
        {
            return Err(CoreError::Api("GitHub API rate limit exceeded".to_string()));
        }

        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(CoreError::Api(format!(
                "no releases found for {owner}/{repo}"
            )));
        }

        if !status.is_success() {
            return Err(CoreError::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }

        Ok(response.json().await?)
    }
}
