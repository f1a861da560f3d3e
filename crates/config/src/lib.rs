//! Configuration file schema and loading.
//!
//! The file is versioned YAML. `buildType`, `deployType` and `tagPolicy` are
//! exactly-one-of unions: they deserialize as structs of options and resolve
//! to enums, rejecting zero or multiple set variants at load time.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use skiff_core::{Artifact, ArtifactType, BazelArtifact, DockerArtifact, KanikoArtifact};
use tracing::debug;

pub const API_VERSION: &str = "skiff/v1alpha1";
pub const KIND: &str = "Config";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing configuration")]
    Parse(#[from] serde_yaml::Error),

    #[error("unsupported apiVersion {found:?} (expected {API_VERSION:?})")]
    ApiVersion { found: String },

    #[error("unsupported kind {found:?} (expected {KIND:?})")]
    Kind { found: String },

    #[error("{union}: exactly one variant must be set, found none")]
    MissingVariant { union: &'static str },

    #[error("{union}: exactly one variant must be set, found {found}")]
    MultipleVariants { union: &'static str, found: usize },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
    pub api_version: String,
    pub kind: String,
    pub build: BuildConfig,
    pub deploy: DeployConfig,
}

// No deny_unknown_fields here: serde does not support it together with
// flattened union fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildConfig {
    #[serde(default)]
    pub tag_policy: TagPolicyFields,
    #[serde(default)]
    pub artifacts: Vec<ArtifactConfig>,
    #[serde(flatten)]
    pub build_type: BuildTypeFields,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployConfig {
    #[serde(flatten)]
    pub deploy_type: DeployTypeFields,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ArtifactConfig {
    pub image_name: String,
    #[serde(default = "default_workspace")]
    pub workspace: PathBuf,
    #[serde(default)]
    pub sync: Vec<String>,
    #[serde(default)]
    pub docker: Option<DockerArtifact>,
    #[serde(default)]
    pub bazel: Option<BazelArtifact>,
    #[serde(default)]
    pub kaniko: Option<KanikoArtifact>,
}

fn default_workspace() -> PathBuf {
    PathBuf::from(".")
}

impl ArtifactConfig {
    /// An artifact with no descriptor defaults to a plain docker build.
    fn resolve(&self) -> Result<Artifact, ConfigError> {
        let set = [
            self.docker.is_some(),
            self.bazel.is_some(),
            self.kaniko.is_some(),
        ]
        .iter()
        .filter(|b| **b)
        .count();
        if set > 1 {
            return Err(ConfigError::MultipleVariants {
                union: "artifact type",
                found: set,
            });
        }
        let artifact_type = if let Some(d) = &self.docker {
            ArtifactType::Docker(d.clone())
        } else if let Some(b) = &self.bazel {
            ArtifactType::Bazel(b.clone())
        } else if let Some(k) = &self.kaniko {
            ArtifactType::Kaniko(k.clone())
        } else {
            ArtifactType::Docker(DockerArtifact::default())
        };
        Ok(Artifact {
            image_name: self.image_name.clone(),
            workspace: self.workspace.clone(),
            artifact_type,
            sync_patterns: self.sync.clone(),
        })
    }
}

// ---- buildType ----

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildTypeFields {
    #[serde(default)]
    pub local: Option<LocalBuild>,
    #[serde(default)]
    pub google_cloud_build: Option<GoogleCloudBuild>,
    #[serde(default)]
    pub kaniko: Option<KanikoBuild>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BuildType {
    Local(LocalBuild),
    GoogleCloudBuild(GoogleCloudBuild),
    Kaniko(KanikoBuild),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LocalBuild {
    /// When unset, pushing is decided from the kube context (local clusters
    /// such as minikube or docker-desktop skip the push).
    #[serde(default)]
    pub skip_push: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GoogleCloudBuild {
    #[serde(default)]
    pub project_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct KanikoBuild {
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub pull_secret_name: Option<String>,
}

impl BuildTypeFields {
    pub fn resolve(&self) -> Result<BuildType, ConfigError> {
        resolve_union(
            "buildType",
            [
                self.local.clone().map(BuildType::Local),
                self.google_cloud_build
                    .clone()
                    .map(BuildType::GoogleCloudBuild),
                self.kaniko.clone().map(BuildType::Kaniko),
            ],
        )
    }
}

// ---- deployType ----

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployTypeFields {
    #[serde(default)]
    pub kubectl: Option<KubectlDeploy>,
    #[serde(default)]
    pub helm: Option<HelmDeploy>,
    #[serde(default)]
    pub kustomize: Option<KustomizeDeploy>,
    #[serde(default)]
    pub kompose: Option<KomposeDeploy>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeployType {
    Kubectl(KubectlDeploy),
    Helm(HelmDeploy),
    Kustomize(KustomizeDeploy),
    Kompose(KomposeDeploy),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct KubectlDeploy {
    #[serde(default)]
    pub manifests: Vec<String>,
    /// Live objects pulled with `kubectl get -o yaml`, named `namespace:name`.
    #[serde(default)]
    pub remote_manifests: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct HelmDeploy {
    #[serde(default)]
    pub releases: Vec<HelmRelease>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct HelmRelease {
    pub name: String,
    pub chart_path: PathBuf,
    /// values key -> artifact image name; the deployed value is the built tag.
    #[serde(default)]
    pub values: HashMap<String, String>,
    #[serde(default)]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct KustomizeDeploy {
    #[serde(default = "default_kustomize_path")]
    pub path: PathBuf,
}

fn default_kustomize_path() -> PathBuf {
    PathBuf::from(".")
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct KomposeDeploy {
    #[serde(default = "default_compose_file")]
    pub compose_file: PathBuf,
}

fn default_compose_file() -> PathBuf {
    PathBuf::from("docker-compose.yml")
}

impl DeployTypeFields {
    pub fn resolve(&self) -> Result<DeployType, ConfigError> {
        resolve_union(
            "deployType",
            [
                self.kubectl.clone().map(DeployType::Kubectl),
                self.helm.clone().map(DeployType::Helm),
                self.kustomize.clone().map(DeployType::Kustomize),
                self.kompose.clone().map(DeployType::Kompose),
            ],
        )
    }
}

// ---- tagPolicy ----

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagPolicyFields {
    #[serde(default)]
    pub git_commit: Option<GitCommitPolicy>,
    #[serde(default)]
    pub sha256: Option<Sha256Policy>,
    #[serde(default)]
    pub date_time: Option<DateTimePolicy>,
    #[serde(default)]
    pub env_template: Option<EnvTemplatePolicy>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TagPolicy {
    GitCommit,
    Sha256,
    DateTime(DateTimePolicy),
    EnvTemplate(EnvTemplatePolicy),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct GitCommitPolicy {}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Sha256Policy {}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DateTimePolicy {
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EnvTemplatePolicy {
    pub template: String,
}

impl TagPolicyFields {
    pub fn resolve(&self) -> Result<TagPolicy, ConfigError> {
        resolve_union(
            "tagPolicy",
            [
                self.git_commit.clone().map(|_| TagPolicy::GitCommit),
                self.sha256.clone().map(|_| TagPolicy::Sha256),
                self.date_time.clone().map(TagPolicy::DateTime),
                self.env_template.clone().map(TagPolicy::EnvTemplate),
            ],
        )
    }
}

fn resolve_union<T, const N: usize>(
    union: &'static str,
    variants: [Option<T>; N],
) -> Result<T, ConfigError> {
    let mut found: Vec<T> = variants.into_iter().flatten().collect();
    match found.len() {
        0 => Err(ConfigError::MissingVariant { union }),
        1 => Ok(found.remove(0)),
        n => Err(ConfigError::MultipleVariants { union, found: n }),
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let data = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::parse(&data)
    }

    pub fn parse(data: &str) -> Result<Config, ConfigError> {
        let cfg: Config = serde_yaml::from_str(data)?;
        if cfg.api_version != API_VERSION {
            return Err(ConfigError::ApiVersion {
                found: cfg.api_version,
            });
        }
        if cfg.kind != KIND {
            return Err(ConfigError::Kind { found: cfg.kind });
        }
        // Validate the unions eagerly so a broken file fails at load, not
        // mid-session.
        cfg.build.build_type.resolve()?;
        cfg.build.tag_policy.resolve()?;
        cfg.deploy.deploy_type.resolve()?;
        for a in &cfg.build.artifacts {
            a.resolve()?;
        }
        debug!(artifacts = cfg.build.artifacts.len(), "configuration parsed");
        Ok(cfg)
    }

    pub fn artifacts(&self) -> Result<Vec<Artifact>, ConfigError> {
        self.build.artifacts.iter().map(|a| a.resolve()).collect()
    }
}
