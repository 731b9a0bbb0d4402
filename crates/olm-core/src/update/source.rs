//! Where update metadata comes from.

use std::path::{Path, PathBuf};

use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::github::GitHubClient;
use crate::error::{CoreError, Result};
use crate::persist;

/// Metadata file name served by local and HTTP sources.
pub const VERSION_FILE: &str = "version.json";

/// Latest release as described by an update source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteVersion {
    /// Release version.
    pub version: String,
    /// Package URL, or a file path for local sources.
    #[serde(default)]
    pub download_url: String,
    /// Release notes.
    #[serde(default)]
    pub release_notes: String,
    /// Declared package size. Zero means unknown.
    #[serde(default)]
    pub file_size: u64,
    /// Package digest, `algo:hex` or bare hex.
    #[serde(default, alias = "md5", skip_serializing_if = "Option::is_none")]
    pub expected_hash: Option<String>,
    /// Offer the update even when it is not newer or was skipped.
    #[serde(default)]
    pub force_update: bool,
}

impl RemoteVersion {
    /// Declared size, `None` when unknown.
    #[must_use]
    pub fn declared_size(&self) -> Option<u64> {
        (self.file_size > 0).then_some(self.file_size)
    }

    /// Expected digest, `None` when blank.
    #[must_use]
    pub fn digest(&self) -> Option<&str> {
        self.expected_hash
            .as_deref()
            .map(str::trim)
            .filter(|hash| !hash.is_empty())
    }
}

/// A configured update source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateSource {
    /// Directory holding `version.json` and the package.
    Local(PathBuf),
    /// Server publishing `version.json`.
    Http(String),
    /// GitHub repository releases.
    GitHub {
        /// Repository owner.
        owner: String,
        /// Repository name.
        repo: String,
    },
}

impl UpdateSource {
    /// Classify a configured source string.
    pub fn parse(source: &str) -> Result<Self> {
        let source = source.trim();
        if source.is_empty() {
            return Err(CoreError::Config("no update source configured".to_string()));
        }

        if source.starts_with("http://") || source.starts_with("https://") {
            let url = Url::parse(source)
                .map_err(|e| CoreError::Config(format!("invalid update source '{source}': {e}")))?;

            if url.host_str() == Some("github.com") {
                let mut segments = url
                    .path_segments()
                    .into_iter()
                    .flatten()
                    .filter(|s| !s.is_empty());
                return match (segments.next(), segments.next()) {
                    (Some(owner), Some(repo)) => Ok(Self::GitHub {
                        owner: owner.to_string(),
                        repo: repo.trim_end_matches(".git").to_string(),
                    }),
                    _ => Err(CoreError::Config(format!(
                        "GitHub source must name a repository: '{source}'"
                    ))),
                };
            }
            return Ok(Self::Http(source.to_string()));
        }

        Ok(Self::Local(PathBuf::from(source)))
    }

    /// True for directory sources.
    #[must_use]
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }

    /// Fetch the latest release description.
    pub async fn fetch(&self, http: &reqwest::Client, github: &GitHubClient) -> Result<RemoteVersion> {
        match self {
            Self::Local(dir) => read_local(dir),
            Self::Http(url) => fetch_http(http, url).await,
            Self::GitHub { owner, repo } => github.latest_release(owner, repo).await?.into_remote_version(),
        }
    }
}

fn read_local(dir: &Path) -> Result<RemoteVersion> {
    let file = dir.join(VERSION_FILE);
    debug!("Reading local update metadata from {}", file.display());

    let mut remote: RemoteVersion = persist::read_json(&file)?
        .ok_or_else(|| CoreError::Config(format!("version file not found: {}", file.display())))?;

    if remote.download_url.trim().is_empty() {
        return Err(CoreError::Config(format!(
            "{} does not name a download_url",
            file.display()
        )));
    }
    let package = PathBuf::from(&remote.download_url);
    if package.is_relative() {
        remote.download_url = dir.join(package).to_string_lossy().into_owned();
    }
    Ok(remote)
}

async fn fetch_http(http: &reqwest::Client, source: &str) -> Result<RemoteVersion> {
    let url = if source.ends_with(".json") {
        source.to_string()
    } else {
        format!("{}/{}", source.trim_end_matches('/'), VERSION_FILE)
    };
    debug!("Fetching update metadata from {}", url);

    let response = http.get(&url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(CoreError::HttpStatus {
            status: status.as_u16(),
            url,
        });
    }

    let mut remote: RemoteVersion = response.json().await?;
    if remote.download_url.trim().is_empty() {
        return Err(CoreError::Config(format!("{url} does not name a download_url")));
    }

    let base = Url::parse(&url).map_err(|e| CoreError::Config(e.to_string()))?;
    remote.download_url = base
        .join(&remote.download_url)
        .map_err(|e| CoreError::Config(format!("invalid download_url: {e}")))?
        .to_string();
    Ok(remote)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_sources() {
        assert_eq!(
            UpdateSource::parse("https://github.com/acme/olm.git").unwrap(),
            UpdateSource::GitHub {
                owner: "acme".to_string(),
                repo: "olm".to_string()
            }
        );
        assert_eq!(
            UpdateSource::parse("https://updates.example.com/olm/").unwrap(),
            UpdateSource::Http("https://updates.example.com/olm/".to_string())
        );
        assert!(UpdateSource::parse("/srv/updates").unwrap().is_local());
        assert!(UpdateSource::parse("  ").is_err());
        assert!(UpdateSource::parse("https://github.com/acme").is_err());
    }

    #[test]
    fn test_local_source_resolves_relative_package() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(VERSION_FILE),
            r#"{"version":"1.3.0","download_url":"olm_1.3.0.zip","md5":"5d41402abc4b2a76b9719d911017c592"}"#,
        )
        .unwrap();

        let remote = read_local(dir.path()).unwrap();
        assert_eq!(remote.version, "1.3.0");
        assert_eq!(
            PathBuf::from(&remote.download_url),
            dir.path().join("olm_1.3.0.zip")
        );
        assert_eq!(remote.digest(), Some("5d41402abc4b2a76b9719d911017c592"));
        assert_eq!(remote.declared_size(), None);
    }

    #[test]
    fn test_local_source_requires_url() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(VERSION_FILE), r#"{"version":"1.3.0"}"#).unwrap();
        assert!(matches!(read_local(dir.path()), Err(CoreError::Config(_))));
    }
}
