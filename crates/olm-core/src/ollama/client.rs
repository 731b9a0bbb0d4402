//! Model server REST client.

use async_stream::try_stream;
use futures_util::{Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::debug;

use super::types::{ModelInfo, ModelList, PullEvent, RunningModel};
use crate::config::ServerSettings;
use crate::download::USER_AGENT_VALUE;
use crate::error::{CoreError, Result};

/// Client for an Ollama-compatible API rooted at `http://host:port/api`.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
}

impl OllamaClient {
    /// Create a client for the configured server.
    pub fn new(server: &ServerSettings) -> Result<Self> {
        Self::with_base_url(server.api_base())
    }

    /// Create a client for an explicit API base URL.
    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| CoreError::Network(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// API base URL.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint)
    }

    /// List installed models.
    pub async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let list: ModelList<ModelInfo> = self.get_json("tags").await?;
        Ok(list.models)
    }

    /// List models currently loaded in memory.
    pub async fn running_models(&self) -> Result<Vec<RunningModel>> {
        let list: ModelList<RunningModel> = self.get_json("ps").await?;
        Ok(list.models)
    }

    /// Digest of the installed model called `name`, if any.
    pub async fn installed_digest(&self, name: &str) -> Result<Option<String>> {
        let models = self.list_models().await?;
        Ok(models
            .into_iter()
            .find(|m| m.matches(name))
            .map(|m| m.digest)
            .filter(|d| !d.is_empty()))
    }

    /// True when the server answers `GET /tags`.
    pub async fn check_connection(&self) -> bool {
        match self.client.get(self.url("tags")).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("Model server unreachable: {}", e);
                false
            }
        }
    }

    /// Total disk usage of installed models in bytes.
    pub async fn disk_usage(&self) -> Result<u64> {
        Ok(self.list_models().await?.iter().map(|m| m.size).sum())
    }

    /// Total GPU memory held by loaded models in bytes.
    pub async fn vram_usage(&self) -> Result<u64> {
        Ok(self.running_models().await?.iter().map(|m| m.size_vram).sum())
    }

    /// Delete an installed model.
    pub async fn delete_model(&self, name: &str) -> Result<()> {
        let url = self.url("delete");
        let response = self
            .client
            .delete(&url)
            .json(&json!({ "name": name, "model": name }))
            .send()
            .await?;
        check_status(response, &url).await?;
        tracing::info!("Deleted model {}", name);
        Ok(())
    }

    /// Unload a model from memory by generating with `keep_alive: 0`.
    pub async fn unload_model(&self, name: &str) -> Result<()> {
        let url = self.url("generate");
        let response = self
            .client
            .post(&url)
            .json(&json!({ "model": name, "keep_alive": 0 }))
            .send()
            .await?;
        check_status(response, &url).await?;
        tracing::info!("Unloaded model {}", name);
        Ok(())
    }

    /// Start a pull and return its event stream.
    ///
    /// Lines that are not valid JSON are skipped. The stream ends when the
    /// server closes the response.
    pub fn pull_stream(&self, name: &str) -> impl Stream<Item = Result<PullEvent>> + Send + 'static {
        let client = self.client.clone();
        let url = self.url("pull");
        let body = json!({ "name": name, "model": name, "stream": true });

        try_stream! {
            debug!("Requesting {}", url);
            let response = client.post(&url).json(&body).send().await?;
            let response = check_status(response, &url).await?;

            let mut bytes = response.bytes_stream();
            let mut buffer: Vec<u8> = Vec::new();

            while let Some(chunk) = bytes.next().await {
                buffer.extend_from_slice(&chunk?);
                while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    if let Some(event) = parse_line(&line) {
                        yield event;
                    }
                }
            }

            if let Some(event) = parse_line(&buffer) {
                yield event;
            }
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T> {
        let url = self.url(endpoint);
        let response = self.client.get(&url).send().await?;
        let response = check_status(response, &url).await?;
        Ok(response.json().await?)
    }
}

fn parse_line(line: &[u8]) -> Option<PullEvent> {
    let text = std::str::from_utf8(line).ok()?.trim();
    if text.is_empty() {
        return None;
    }
    match serde_json::from_str(text) {
        Ok(event) => Some(event),
        Err(e) => {
            debug!("Skipping malformed pull line: {}", e);
            None
        }
    }
}

/// Turn a non-success response into an error, preferring the server's
/// `{"error": ...}` body.
async fn check_status(response: reqwest::Response, url: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string));

    match message {
        Some(message) if !status.is_server_error() => Err(CoreError::Api(message)),
        _ => Err(CoreError::HttpStatus {
            status: status.as_u16(),
            url: url.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trimmed() {
        let client = OllamaClient::with_base_url("http://localhost:11434/api/").unwrap();
        assert_eq!(client.url("tags"), "http://localhost:11434/api/tags");
    }

    #[test]
    fn test_parse_line_skips_garbage() {
        assert!(parse_line(b"not json\n").is_none());
        assert!(parse_line(b"   \n").is_none());
        assert_eq!(
            parse_line(b"{\"status\":\"success\"}\n").map(|e| e.status),
            Some("success".to_string())
        );
    }
}
