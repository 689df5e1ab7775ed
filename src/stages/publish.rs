use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, bail};
use tracing::{info, warn};

use crate::error::StageError;
use crate::pipeline::{Artifact, ContextDelta, PipelineContext, Stage, StageParameters, StageRole};
use crate::recipe::ExistingAssetPolicy;
use crate::release::{Release, ReleaseAsset, ReleaseClient, SecretToken};
use crate::retry::{RetryPolicy, Sleeper, retry_transient};

use super::{EnvLookup, StageServices, reject_unknown, take_string};

/// Suffix of the temporary asset a replacement is uploaded under.
const STAGING_SUFFIX: &str = ".replacing";

/// Where an artifact goes: the release for `tag`, authorised by `token`.
#[derive(Debug, Clone)]
pub struct ReleaseTarget {
    pub tag: String,
    pub artifact_paths: Vec<PathBuf>,
    pub token: SecretToken,
}

impl ReleaseTarget {
    pub fn new(tag: impl Into<String>, artifact: &Artifact, token: SecretToken) -> Self {
        Self {
            tag: tag.into(),
            artifact_paths: vec![artifact.path.clone()],
            token,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOutcome {
    /// `false` when the asset was already present and the policy said to keep it.
    pub uploaded: bool,
    pub release_id: u64,
    pub assets: Vec<ReleaseAsset>,
}

pub struct Publisher<'a> {
    client: &'a dyn ReleaseClient,
    retry: &'a RetryPolicy,
    sleeper: &'a dyn Sleeper,
    on_existing: ExistingAssetPolicy,
}

impl<'a> Publisher<'a> {
    pub fn new(
        client: &'a dyn ReleaseClient,
        retry: &'a RetryPolicy,
        sleeper: &'a dyn Sleeper,
        on_existing: ExistingAssetPolicy,
    ) -> Self {
        Self {
            client,
            retry,
            sleeper,
            on_existing,
        }
    }

    /// Attach `artifact` to the release for `target.tag`, creating the
    /// release when the tag has none yet.
    pub fn publish(
        &self,
        target: &ReleaseTarget,
        artifact: &Artifact,
    ) -> Result<PublishOutcome, StageError> {
        check_artifact(artifact)?;
        if !target.artifact_paths.contains(&artifact.path) {
            return Err(StageError::configuration(
                "release",
                format!(
                    "{} is not among the release target's artifacts",
                    artifact.path.display()
                ),
            ));
        }

        let release = self.release_for(target)?;
        let name = artifact.file_name();
        let mut assets = release.assets.clone();

        if let Some(existing) = assets.iter().position(|asset| asset.name == name) {
            match self.on_existing {
                ExistingAssetPolicy::Reject => {
                    return Err(StageError::configuration(
                        "release.on_existing",
                        format!(
                            "Release {} already has an asset named '{name}'",
                            target.tag
                        ),
                    ));
                }
                ExistingAssetPolicy::Skip => {
                    warn!(asset = %name, "Asset already published, leaving it in place");
                    return Ok(PublishOutcome {
                        uploaded: false,
                        release_id: release.id,
                        assets,
                    });
                }
                ExistingAssetPolicy::Replace => {
                    let old = assets.remove(existing);
                    let replacement = self.replace(target, &release, &mut assets, old, artifact)?;
                    assets.push(replacement);
                    return Ok(PublishOutcome {
                        uploaded: true,
                        release_id: release.id,
                        assets,
                    });
                }
            }
        }

        let uploaded = self.upload(target, &release, &name, artifact)?;
        info!(asset = %name, release_id = release.id, "Asset published");
        assets.push(uploaded);
        Ok(PublishOutcome {
            uploaded: true,
            release_id: release.id,
            assets,
        })
    }

    /// Uploads the new asset under a staging name and only then swaps it in,
    /// so a failed upload leaves the published asset untouched.
    fn replace(
        &self,
        target: &ReleaseTarget,
        release: &Release,
        assets: &mut Vec<ReleaseAsset>,
        old: ReleaseAsset,
        artifact: &Artifact,
    ) -> Result<ReleaseAsset, StageError> {
        let staging = format!("{}{STAGING_SUFFIX}", old.name);
        if let Some(leftover) = assets.iter().position(|asset| asset.name == staging) {
            let leftover = assets.remove(leftover);
            warn!(asset = %staging, "Removing staged asset from an earlier run");
            self.retried("delete asset", |_| {
                self.client.delete_asset(&target.token, &leftover)
            })?;
        }

        let staged = self.upload(target, release, &staging, artifact)?;
        self.retried("delete asset", |_| self.client.delete_asset(&target.token, &old))?;
        let replaced = self.retried("rename asset", |_| {
            self.client.rename_asset(&target.token, &staged, &old.name)
        })?;
        info!(asset = %old.name, release_id = release.id, "Replaced existing asset");
        Ok(replaced)
    }

    fn upload(
        &self,
        target: &ReleaseTarget,
        release: &Release,
        name: &str,
        artifact: &Artifact,
    ) -> Result<ReleaseAsset, StageError> {
        let uploaded = self.retried("upload asset", |attempt| {
            info!(asset = %name, attempt, size_bytes = artifact.size_bytes, "Uploading asset");
            self.client
                .upload_asset(&target.token, release, name, &artifact.path)
        })?;
        // A short write is stored under the asset name, so retrying would collide with it.
        if uploaded.size != 0 && uploaded.size != artifact.size_bytes {
            return Err(StageError::tool(format!(
                "Release host stored {} bytes for '{name}', expected {}",
                uploaded.size, artifact.size_bytes
            )));
        }
        Ok(uploaded)
    }

    fn release_for(&self, target: &ReleaseTarget) -> Result<Release, StageError> {
        let found = self.retried("look up release", |_| {
            self.client.find_release(&target.token, &target.tag)
        })?;
        match found {
            Some(release) => Ok(release),
            None => self.retried("create release", |_| {
                self.client.create_release(&target.token, &target.tag)
            }),
        }
    }

    fn retried<T>(
        &self,
        operation: &str,
        op: impl FnMut(u32) -> Result<T, StageError>,
    ) -> Result<T, StageError> {
        retry_transient(self.retry, self.sleeper, operation, op).map(|retried| retried.value)
    }
}

/// The artifact on disk must still be the one the packager measured.
fn check_artifact(artifact: &Artifact) -> Result<(), StageError> {
    let meta = fs::metadata(&artifact.path).map_err(|err| {
        StageError::tool(format!(
            "Artifact {} is not readable: {err}",
            artifact.path.display()
        ))
    })?;
    if !meta.is_file() || meta.len() != artifact.size_bytes {
        return Err(StageError::tool(format!(
            "Artifact {} changed after packaging ({} bytes recorded, {} on disk)",
            artifact.path.display(),
            artifact.size_bytes,
            meta.len()
        )));
    }
    Ok(())
}

fn parse_policy(value: &str) -> Result<ExistingAssetPolicy> {
    Ok(match value.trim().to_lowercase().as_str() {
        "reject" => ExistingAssetPolicy::Reject,
        "replace" => ExistingAssetPolicy::Replace,
        "skip" => ExistingAssetPolicy::Skip,
        other => bail!("parameter 'on_existing' must be reject, replace or skip, got '{other}'"),
    })
}

pub(crate) struct PublishStage {
    token_env: String,
    on_existing: ExistingAssetPolicy,
    retry: RetryPolicy,
    client: Arc<dyn ReleaseClient>,
    sleeper: Arc<dyn Sleeper>,
    env_lookup: EnvLookup,
}

impl PublishStage {
    pub(crate) fn from_params(mut params: StageParameters, services: &StageServices) -> Result<Self> {
        let on_existing = match take_string(&mut params, "on_existing") {
            Some(value) => parse_policy(&value)?,
            None => services.release.on_existing,
        };
        reject_unknown(params, "publish")?;
        Ok(Self {
            token_env: services.release.token_env.clone(),
            on_existing,
            retry: services.retry.clone(),
            client: services.releases.clone(),
            sleeper: services.sleeper.clone(),
            env_lookup: services.env_lookup.clone(),
        })
    }

    fn token(&self) -> Result<SecretToken, StageError> {
        (self.env_lookup)(&self.token_env)
            .filter(|value| !value.trim().is_empty())
            .map(SecretToken::new)
            .ok_or_else(|| {
                StageError::configuration(
                    "release.token_env",
                    format!("Environment variable {} is not set", self.token_env),
                )
            })
    }
}

impl Stage for PublishStage {
    fn name(&self) -> &'static str {
        "publish"
    }

    fn role(&self) -> StageRole {
        StageRole::Publish
    }

    fn execute(&self, ctx: &PipelineContext) -> Result<ContextDelta, StageError> {
        let artifact = ctx.artifact().ok_or_else(|| {
            StageError::configuration(
                "pipeline.publish",
                "Nothing to publish: no earlier stage produced an artifact",
            )
        })?;
        let target = ReleaseTarget::new(&ctx.trigger().tag, artifact, self.token()?);
        let publisher = Publisher::new(
            self.client.as_ref(),
            &self.retry,
            self.sleeper.as_ref(),
            self.on_existing,
        );
        let outcome = publisher.publish(&target, artifact)?;
        Ok(ContextDelta::new()
            .with("publish.uploaded", outcome.uploaded)
            .with("publish.release_id", outcome.release_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::path::Path;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::tempdir;

    #[derive(Default)]
    struct NoSleep;

    impl Sleeper for NoSleep {
        fn sleep(&self, _duration: Duration) {}
    }

    #[derive(Default)]
    struct FakeHost {
        release: Mutex<Option<Release>>,
        upload_failures: Mutex<Vec<StageError>>,
        /// Size reported for stored uploads instead of the file's length.
        stored_size: Option<u64>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeHost {
        fn with_release(assets: Vec<ReleaseAsset>) -> Self {
            let host = Self::default();
            *host.release.lock().unwrap() = Some(Release {
                id: 11,
                tag_name: "v2.3.1".into(),
                upload_url: String::new(),
                assets,
            });
            host
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl ReleaseClient for FakeHost {
        fn find_release(&self, _token: &SecretToken, _tag: &str) -> Result<Option<Release>, StageError> {
            self.calls.lock().unwrap().push("find".into());
            Ok(self.release.lock().unwrap().clone())
        }

        fn create_release(&self, _token: &SecretToken, tag: &str) -> Result<Release, StageError> {
            self.calls.lock().unwrap().push(format!("create {tag}"));
            let release = Release {
                id: 42,
                tag_name: tag.to_string(),
                upload_url: String::new(),
                assets: Vec::new(),
            };
            *self.release.lock().unwrap() = Some(release.clone());
            Ok(release)
        }

        fn delete_asset(&self, _token: &SecretToken, asset: &ReleaseAsset) -> Result<(), StageError> {
            self.calls.lock().unwrap().push(format!("delete {}", asset.name));
            Ok(())
        }

        fn rename_asset(
            &self,
            _token: &SecretToken,
            asset: &ReleaseAsset,
            name: &str,
        ) -> Result<ReleaseAsset, StageError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("rename {} -> {name}", asset.name));
            Ok(ReleaseAsset {
                name: name.to_string(),
                ..asset.clone()
            })
        }

        fn upload_asset(
            &self,
            _token: &SecretToken,
            _release: &Release,
            name: &str,
            path: &Path,
        ) -> Result<ReleaseAsset, StageError> {
            self.calls.lock().unwrap().push(format!("upload {name}"));
            if let Some(err) = self.upload_failures.lock().unwrap().pop() {
                return Err(err);
            }
            Ok(ReleaseAsset {
                id: 99,
                name: name.to_string(),
                size: self
                    .stored_size
                    .unwrap_or_else(|| fs::metadata(path).unwrap().len()),
            })
        }
    }

    fn artifact(dir: &Path) -> Artifact {
        let path = dir.join("SRTTranslator");
        fs::write(&path, b"binary").unwrap();
        Artifact {
            path,
            size_bytes: 6,
            sha256: "unused".into(),
        }
    }

    fn publish(host: &FakeHost, policy: ExistingAssetPolicy, artifact: &Artifact) -> Result<PublishOutcome, StageError> {
        let retry = RetryPolicy::default();
        let target = ReleaseTarget::new("v2.3.1", artifact, SecretToken::new("t"));
        Publisher::new(host, &retry, &NoSleep, policy).publish(&target, artifact)
    }

    #[test]
    fn creates_release_when_tag_has_none() {
        let temp = tempdir().unwrap();
        let host = FakeHost::default();
        let outcome = publish(&host, ExistingAssetPolicy::Reject, &artifact(temp.path())).unwrap();
        assert!(outcome.uploaded);
        assert_eq!(outcome.release_id, 42);
        assert_eq!(outcome.assets.len(), 1);
        assert_eq!(host.calls(), vec!["find", "create v2.3.1", "upload SRTTranslator"]);
    }

    #[test]
    fn existing_asset_policies() {
        let temp = tempdir().unwrap();
        let artifact = artifact(temp.path());
        let existing = || {
            vec![ReleaseAsset {
                id: 5,
                name: "SRTTranslator".into(),
                size: 3,
            }]
        };

        let host = FakeHost::with_release(existing());
        let err = publish(&host, ExistingAssetPolicy::Reject, &artifact).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Configuration);
        assert_eq!(err.field.as_deref(), Some("release.on_existing"));

        let host = FakeHost::with_release(existing());
        let outcome = publish(&host, ExistingAssetPolicy::Skip, &artifact).unwrap();
        assert!(!outcome.uploaded);
        assert_eq!(host.calls(), vec!["find"]);

        let host = FakeHost::with_release(existing());
        let outcome = publish(&host, ExistingAssetPolicy::Replace, &artifact).unwrap();
        assert!(outcome.uploaded);
        assert_eq!(outcome.assets[0].id, 99);
        assert_eq!(outcome.assets[0].name, "SRTTranslator");
        assert_eq!(
            host.calls(),
            vec![
                "find",
                "upload SRTTranslator.replacing",
                "delete SRTTranslator",
                "rename SRTTranslator.replacing -> SRTTranslator",
            ]
        );
    }

    #[test]
    fn failed_replacement_keeps_published_asset() {
        let temp = tempdir().unwrap();
        let artifact = artifact(temp.path());
        let host = FakeHost::with_release(vec![
            ReleaseAsset {
                id: 5,
                name: "SRTTranslator".into(),
                size: 3,
            },
            ReleaseAsset {
                id: 6,
                name: "SRTTranslator.replacing".into(),
                size: 2,
            },
        ]);
        host.upload_failures
            .lock()
            .unwrap()
            .push(StageError::tool("Failed to upload asset: HTTP 422"));

        let err = publish(&host, ExistingAssetPolicy::Replace, &artifact).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ToolInvocation);
        assert_eq!(
            host.calls(),
            vec![
                "find",
                "delete SRTTranslator.replacing",
                "upload SRTTranslator.replacing",
            ]
        );
    }

    #[test]
    fn short_upload_is_not_reported_as_retryable() {
        let temp = tempdir().unwrap();
        let host = FakeHost {
            stored_size: Some(2),
            ..FakeHost::with_release(Vec::new())
        };
        let err = publish(&host, ExistingAssetPolicy::Reject, &artifact(temp.path())).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ToolInvocation);
        assert!(err.message.contains("stored 2 bytes"));
        assert_eq!(host.calls(), vec!["find", "upload SRTTranslator"]);
    }

    #[test]
    fn transient_upload_failures_are_retried() {
        let temp = tempdir().unwrap();
        let host = FakeHost::with_release(Vec::new());
        host.upload_failures
            .lock()
            .unwrap()
            .push(StageError::transient("HTTP 502"));
        let outcome = publish(&host, ExistingAssetPolicy::Reject, &artifact(temp.path())).unwrap();
        assert!(outcome.uploaded);
        assert_eq!(
            host.calls(),
            vec!["find", "upload SRTTranslator", "upload SRTTranslator"]
        );
    }

    #[test]
    fn modified_artifact_is_not_uploaded() {
        let temp = tempdir().unwrap();
        let mut artifact = artifact(temp.path());
        artifact.size_bytes = 1024;
        let host = FakeHost::default();
        let err = publish(&host, ExistingAssetPolicy::Reject, &artifact).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ToolInvocation);
        assert!(host.calls().is_empty());
    }

    #[test]
    fn policy_parameter_is_validated() {
        assert_eq!(parse_policy("Replace").unwrap(), ExistingAssetPolicy::Replace);
        assert!(parse_policy("overwrite").is_err());
    }
}
