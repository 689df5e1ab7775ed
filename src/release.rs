//! Release hosting: the `ReleaseClient` seam and its GitHub implementation.

use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::error::StageError;

/// Opaque credential for the release host. Never printed.
#[derive(Clone)]
pub struct SecretToken(String);

impl SecretToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretToken(***)")
    }
}

impl fmt::Display for SecretToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Release {
    pub id: u64,
    pub tag_name: String,
    #[serde(default)]
    pub upload_url: String,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ReleaseAsset {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub size: u64,
}

pub trait ReleaseClient: Send + Sync {
    fn find_release(&self, token: &SecretToken, tag: &str) -> Result<Option<Release>, StageError>;
    fn create_release(&self, token: &SecretToken, tag: &str) -> Result<Release, StageError>;
    fn delete_asset(&self, token: &SecretToken, asset: &ReleaseAsset) -> Result<(), StageError>;
    fn rename_asset(
        &self,
        token: &SecretToken,
        asset: &ReleaseAsset,
        name: &str,
    ) -> Result<ReleaseAsset, StageError>;
    fn upload_asset(
        &self,
        token: &SecretToken,
        release: &Release,
        name: &str,
        path: &Path,
    ) -> Result<ReleaseAsset, StageError>;
}

pub const DEFAULT_GITHUB_API: &str = "https://api.github.com";

pub struct GitHubReleaseClient {
    client: Client,
    api_url: String,
    repository: String,
}

impl GitHubReleaseClient {
    pub fn new(api_url: &str, repository: &str) -> Result<Self, StageError> {
        let client = Client::builder()
            .user_agent(concat!("tagpipe/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|err| StageError::tool(format!("Failed to build HTTP client: {err}")))?;
        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            repository: repository.to_string(),
        })
    }

    fn authorized(&self, request: RequestBuilder, token: &SecretToken) -> RequestBuilder {
        request
            .bearer_auth(token.expose())
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
    }

    fn send(&self, request: RequestBuilder, action: &str) -> Result<Response, StageError> {
        request.send().map_err(|err| http_error(action, err))
    }
}

impl ReleaseClient for GitHubReleaseClient {
    fn find_release(&self, token: &SecretToken, tag: &str) -> Result<Option<Release>, StageError> {
        let url = format!(
            "{}/repos/{}/releases/tags/{}",
            self.api_url, self.repository, tag
        );
        let response = self.send(
            self.authorized(self.client.get(&url), token),
            "look up release",
        )?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!(tag, "No release exists for tag");
            return Ok(None);
        }
        parse_json(response, "look up release").map(Some)
    }

    fn create_release(&self, token: &SecretToken, tag: &str) -> Result<Release, StageError> {
        let url = format!("{}/repos/{}/releases", self.api_url, self.repository);
        let body = json!({
            "tag_name": tag,
            "name": tag,
            "draft": false,
            "prerelease": false,
        });
        let response = self.send(
            self.authorized(self.client.post(&url).json(&body), token),
            "create release",
        )?;
        let release: Release = parse_json(response, "create release")?;
        info!(tag, release_id = release.id, "Release created");
        Ok(release)
    }

    fn delete_asset(&self, token: &SecretToken, asset: &ReleaseAsset) -> Result<(), StageError> {
        let url = format!(
            "{}/repos/{}/releases/assets/{}",
            self.api_url, self.repository, asset.id
        );
        let response = self.send(
            self.authorized(self.client.delete(&url), token),
            "delete asset",
        )?;
        check_status(response, "delete asset").map(|_| ())
    }

    fn rename_asset(
        &self,
        token: &SecretToken,
        asset: &ReleaseAsset,
        name: &str,
    ) -> Result<ReleaseAsset, StageError> {
        let url = format!(
            "{}/repos/{}/releases/assets/{}",
            self.api_url, self.repository, asset.id
        );
        let response = self.send(
            self.authorized(self.client.patch(&url).json(&json!({ "name": name })), token),
            "rename asset",
        )?;
        parse_json(response, "rename asset")
    }

    fn upload_asset(
        &self,
        token: &SecretToken,
        release: &Release,
        name: &str,
        path: &Path,
    ) -> Result<ReleaseAsset, StageError> {
        let bytes = fs::read(path).map_err(|err| {
            StageError::tool(format!("Failed to read artifact {}: {err}", path.display()))
        })?;
        let url = upload_endpoint(release, &self.api_url, &self.repository);
        let request = self
            .client
            .post(&url)
            .query(&[("name", name)])
            .header("Content-Type", "application/octet-stream")
            .body(bytes);
        let response = self.send(self.authorized(request, token), "upload asset")?;
        parse_json(response, "upload asset")
    }
}

/// The release's upload URL with its `{?name,label}` template stripped, or
/// the uploads host derived from the API URL when the release has none.
fn upload_endpoint(release: &Release, api_url: &str, repository: &str) -> String {
    if let Some((base, _)) = release.upload_url.split_once('{') {
        return base.to_string();
    }
    if !release.upload_url.is_empty() {
        return release.upload_url.clone();
    }
    let uploads = api_url.replacen("://api.", "://uploads.", 1);
    format!("{uploads}/repos/{repository}/releases/{}/assets", release.id)
}

fn http_error(action: &str, err: reqwest::Error) -> StageError {
    StageError::transient(format!("Failed to {action}: {err}"))
}

fn check_status(response: Response, action: &str) -> Result<Response, StageError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    Err(classify_status(status, action).with_diagnostic(body))
}

fn parse_json<T: DeserializeOwned>(
    response: Response,
    action: &str,
) -> Result<T, StageError> {
    let response = check_status(response, action)?;
    response
        .json::<T>()
        .map_err(|err| StageError::tool(format!("Failed to {action}: unexpected response: {err}")))
}

/// Maps an HTTP failure onto the stage error taxonomy.
pub fn classify_status(status: StatusCode, action: &str) -> StageError {
    match status.as_u16() {
        401 | 403 => StageError::configuration(
            "release.token_env",
            format!("Failed to {action}: authentication rejected (HTTP {status})"),
        ),
        408 | 429 | 500..=599 => {
            StageError::transient(format!("Failed to {action}: HTTP {status}"))
        }
        _ => StageError::tool(format!("Failed to {action}: HTTP {status}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn token_never_formats_its_value() {
        let token = SecretToken::new("ghp_supersecret");
        assert_eq!(format!("{token}"), "***");
        assert!(!format!("{token:?}").contains("supersecret"));
        assert_eq!(token.expose(), "ghp_supersecret");
    }

    #[test]
    fn upload_template_is_stripped() {
        let release = Release {
            id: 7,
            tag_name: "v1.0".into(),
            upload_url: "https://uploads.github.com/repos/o/r/releases/7/assets{?name,label}"
                .into(),
            assets: Vec::new(),
        };
        assert_eq!(
            upload_endpoint(&release, DEFAULT_GITHUB_API, "o/r"),
            "https://uploads.github.com/repos/o/r/releases/7/assets"
        );

        let bare = Release {
            upload_url: String::new(),
            ..release
        };
        assert_eq!(
            upload_endpoint(&bare, DEFAULT_GITHUB_API, "o/r"),
            "https://uploads.github.com/repos/o/r/releases/7/assets"
        );
    }

    #[test]
    fn status_codes_map_to_error_kinds() {
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED, "upload").kind,
            ErrorKind::Configuration
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY, "upload").kind,
            ErrorKind::TransientInfrastructure
        );
        assert_eq!(
            classify_status(StatusCode::UNPROCESSABLE_ENTITY, "upload").kind,
            ErrorKind::ToolInvocation
        );
    }
}
