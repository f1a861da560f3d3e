//! Skiff core types: artifacts, build results, plugin contracts.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

pub mod output;
pub mod proc;

pub use output::Output;

/// Labels attached to runtime objects after a deploy.
pub type Labels = HashMap<String, String>;

/// Fixed label namespace for everything skiff stamps onto cluster objects.
pub const LABEL_PREFIX: &str = "skiff.dev";

/// Docker build descriptor.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DockerArtifact {
    /// Dockerfile path relative to the workspace.
    #[serde(default = "default_dockerfile")]
    pub dockerfile_path: String,
    #[serde(default)]
    pub build_args: HashMap<String, String>,
}

fn default_dockerfile() -> String {
    "Dockerfile".to_string()
}

/// Bazel build descriptor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BazelArtifact {
    /// Bazel target producing a container image tarball, e.g. "//app:image.tar".
    pub target: String,
}

/// Kaniko build descriptor. The context is staged in a GCS bucket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KanikoArtifact {
    #[serde(default = "default_dockerfile")]
    pub dockerfile_path: String,
    pub bucket: String,
}

/// How an artifact is built.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ArtifactType {
    Docker(DockerArtifact),
    Bazel(BazelArtifact),
    Kaniko(KanikoArtifact),
}

/// A buildable unit. Identity is `image_name`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Artifact {
    /// Logical image identifier, registry-qualified or bare.
    pub image_name: String,
    /// Root directory of the artifact's sources.
    pub workspace: PathBuf,
    pub artifact_type: ArtifactType,
    /// Glob patterns; a change set fully matched by these is synced in place
    /// instead of rebuilt.
    #[serde(default)]
    pub sync_patterns: Vec<String>,
}

impl Artifact {
    /// Every workspace must resolve to an existing directory before the
    /// first build touches it.
    pub fn check_workspace(&self) -> Result<()> {
        if !self.workspace.is_dir() {
            anyhow::bail!(
                "workspace {} for image {} is not a directory",
                self.workspace.display(),
                self.image_name
            );
        }
        Ok(())
    }
}

/// Produced by a builder: one fully-qualified tag per artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildResult {
    pub image_name: String,
    pub tag: String,
}

/// One Kubernetes object that a deploy applied, as parsed back out of the
/// manifest stream. Feeds the post-deploy labeler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeployedResource {
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

/// Session options carried from the CLI into the runner.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub config_file: PathBuf,
    pub namespace: Option<String>,
    pub kube_context: Option<String>,
    /// Forces a literal tag, overriding the configured tag policy.
    pub custom_tag: Option<String>,
    /// Only watch artifacts whose image name contains one of these.
    pub watch: Vec<String>,
    pub tail: bool,
    /// Ring the terminal bell when a build+deploy round completes.
    pub notification: bool,
}

/// Typed error kinds that cross the pipeline boundary. Transient failures
/// inside the dev loop stay as logged `anyhow` errors; these escape it.
#[derive(Debug, thiserror::Error)]
pub enum SkiffError {
    #[error("building {image_name}")]
    Build {
        image_name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("deploying")]
    Deploy(#[source] anyhow::Error),

    /// Sentinel: the top-level configuration file changed and the session
    /// must be restarted with a freshly loaded configuration.
    #[error("configuration changed")]
    ConfigurationChanged,

    #[error("watching files")]
    Watch(#[source] anyhow::Error),
}

impl SkiffError {
    /// True when `err` is (or wraps) the reload sentinel.
    pub fn is_reload(err: &anyhow::Error) -> bool {
        matches!(
            err.downcast_ref::<SkiffError>(),
            Some(SkiffError::ConfigurationChanged)
        )
    }
}

/// Builds a set of artifacts, tagging each result with the given tagger.
#[async_trait]
pub trait Builder: Send + Sync {
    async fn build(
        &self,
        token: &CancellationToken,
        out: &Output,
        tagger: &dyn Tagger,
        artifacts: &[Artifact],
    ) -> Result<Vec<BuildResult>>;

    fn labels(&self) -> Labels;
}

/// Applies build results to a cluster and knows how to take them down again.
#[async_trait]
pub trait Deployer: Send + Sync {
    async fn deploy(
        &self,
        token: &CancellationToken,
        out: &Output,
        builds: &[BuildResult],
    ) -> Result<Vec<DeployedResource>>;

    async fn cleanup(&self, token: &CancellationToken, out: &Output) -> Result<()>;

    /// Files whose change requires a redeploy (manifests, charts, ...).
    fn dependencies(&self) -> Result<Vec<PathBuf>>;

    fn labels(&self) -> Labels;
}

/// Pure tag generation: `(workspace, image_name, digest) -> tag`.
pub trait Tagger: Send + Sync {
    fn generate(&self, workspace: &Path, image_name: &str, digest: &str) -> Result<String>;

    fn labels(&self) -> Labels;
}

/// In-place file placement into running pods whose containers run `image`.
#[async_trait]
pub trait Syncer: Send + Sync {
    async fn copy(&self, image: &str, files: &[PathBuf]) -> Result<()>;

    async fn delete(&self, image: &str, files: &[PathBuf]) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reload_sentinel_survives_anyhow() {
        let err: anyhow::Error = SkiffError::ConfigurationChanged.into();
        assert!(SkiffError::is_reload(&err));

        let other: anyhow::Error = SkiffError::Deploy(anyhow::anyhow!("boom")).into();
        assert!(!SkiffError::is_reload(&other));

        let plain = anyhow::anyhow!("unrelated");
        assert!(!SkiffError::is_reload(&plain));
    }

    #[test]
    fn workspace_check_rejects_missing_dir() {
        let a = Artifact {
            image_name: "img".into(),
            workspace: PathBuf::from("/definitely/not/here"),
            artifact_type: ArtifactType::Docker(DockerArtifact::default()),
            sync_patterns: vec![],
        };
        assert!(a.check_workspace().is_err());
    }
}
