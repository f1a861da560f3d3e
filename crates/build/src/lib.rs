//! Builders: local docker, Google Cloud Build and kaniko. Each consumes the
//! dirty artifact set, produces tagged build results and reports per-stage
//! labels.

#![forbid(unsafe_code)]

use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use skiff_core::{
    proc, Artifact, ArtifactType, BuildResult, Builder, Labels, Output, SkiffError, Tagger,
    LABEL_PREFIX,
};

pub mod bazel;
pub mod docker;
pub mod tag;

fn builder_labels(name: &str) -> Labels {
    let mut labels = Labels::new();
    labels.insert(format!("{}/builder", LABEL_PREFIX), name.to_string());
    labels
}

/// The watch dependency set of an artifact: the files whose change dirties
/// it. Computed fresh on every poll tick so Dockerfile edits re-shape the
/// set without re-registration.
pub async fn dependencies_for(artifact: &Artifact) -> Result<Vec<PathBuf>> {
    match &artifact.artifact_type {
        ArtifactType::Docker(d) => docker::dependencies(&artifact.workspace, d),
        ArtifactType::Kaniko(k) => docker::dependencies(
            &artifact.workspace,
            &skiff_core::DockerArtifact {
                dockerfile_path: k.dockerfile_path.clone(),
                build_args: Default::default(),
            },
        ),
        ArtifactType::Bazel(b) => bazel::dependencies(&artifact.workspace, b).await,
    }
}

fn build_error(artifact: &Artifact, source: anyhow::Error) -> anyhow::Error {
    SkiffError::Build {
        image_name: artifact.image_name.clone(),
        source,
    }
    .into()
}

/// Builds with the docker daemon on this machine. Pushing is skipped for
/// local clusters unless the configuration decides otherwise.
pub struct LocalBuilder {
    skip_push: Option<bool>,
    kube_context: Option<String>,
}

impl LocalBuilder {
    pub fn new(skip_push: Option<bool>, kube_context: Option<String>) -> Self {
        Self {
            skip_push,
            kube_context,
        }
    }

    fn should_push(&self) -> bool {
        match self.skip_push {
            Some(skip) => !skip,
            None => !is_local_cluster(self.kube_context.as_deref()),
        }
    }
}

fn is_local_cluster(context: Option<&str>) -> bool {
    match context {
        Some(ctx) => {
            ctx == "minikube"
                || ctx == "docker-desktop"
                || ctx == "docker-for-desktop"
                || ctx.starts_with("kind-")
        }
        None => false,
    }
}

#[async_trait]
impl Builder for LocalBuilder {
    async fn build(
        &self,
        token: &CancellationToken,
        out: &Output,
        tagger: &dyn Tagger,
        artifacts: &[Artifact],
    ) -> Result<Vec<BuildResult>> {
        let mut results = Vec::with_capacity(artifacts.len());
        for artifact in artifacts {
            if token.is_cancelled() {
                bail!("build cancelled");
            }
            let result = self
                .build_one(out, tagger, artifact)
                .await
                .map_err(|e| build_error(artifact, e))?;
            results.push(result);
        }
        Ok(results)
    }

    fn labels(&self) -> Labels {
        builder_labels("local")
    }
}

impl LocalBuilder {
    async fn build_one(
        &self,
        out: &Output,
        tagger: &dyn Tagger,
        artifact: &Artifact,
    ) -> Result<BuildResult> {
        artifact.check_workspace()?;
        out.write_line(&format!("Building [{}]...", artifact.image_name));

        match &artifact.artifact_type {
            ArtifactType::Docker(d) => {
                docker::build(&artifact.workspace, d, &artifact.image_name, out).await?;
            }
            ArtifactType::Bazel(b) => {
                let tarball = bazel::build(&artifact.workspace, b, out).await?;
                let loaded = docker::load(&tarball).await?;
                docker::retag(&loaded, &artifact.image_name).await?;
            }
            ArtifactType::Kaniko(_) => {
                bail!("kaniko artifacts require the kaniko builder");
            }
        }

        let digest = docker::digest(&artifact.image_name).await?;
        let tag = tagger.generate(&artifact.workspace, &artifact.image_name, &digest)?;
        docker::retag(&artifact.image_name, &tag).await?;
        if self.should_push() {
            docker::push(&tag, out).await?;
        }
        info!(image = %artifact.image_name, tag = %tag, "built");
        Ok(BuildResult {
            image_name: artifact.image_name.clone(),
            tag,
        })
    }
}

/// Submits each workspace to Google Cloud Build.
pub struct GoogleCloudBuildBuilder {
    project_id: Option<String>,
}

impl GoogleCloudBuildBuilder {
    pub fn new(project_id: Option<String>) -> Self {
        Self { project_id }
    }
}

#[async_trait]
impl Builder for GoogleCloudBuildBuilder {
    async fn build(
        &self,
        token: &CancellationToken,
        out: &Output,
        tagger: &dyn Tagger,
        artifacts: &[Artifact],
    ) -> Result<Vec<BuildResult>> {
        let mut results = Vec::with_capacity(artifacts.len());
        for artifact in artifacts {
            if token.is_cancelled() {
                bail!("build cancelled");
            }
            artifact.check_workspace().map_err(|e| build_error(artifact, e))?;
            // The digest only exists after the remote build; tag from the
            // workspace state instead.
            let tag = tagger
                .generate(&artifact.workspace, &artifact.image_name, "")
                .map_err(|e| build_error(artifact, e))?;

            let mut cmd = Command::new("gcloud");
            cmd.arg("builds")
                .arg("submit")
                .arg(&artifact.workspace)
                .arg("--tag")
                .arg(&tag);
            if let Some(project) = &self.project_id {
                cmd.arg("--project").arg(project);
            }
            proc::run_forwarding(cmd, out)
                .await
                .context("gcloud builds submit")
                .map_err(|e| build_error(artifact, e))?;

            info!(image = %artifact.image_name, tag = %tag, "built remotely");
            results.push(BuildResult {
                image_name: artifact.image_name.clone(),
                tag,
            });
        }
        Ok(results)
    }

    fn labels(&self) -> Labels {
        builder_labels("google-cloud-build")
    }
}

/// Builds in-cluster with kaniko: the context tarball is staged in the
/// artifact's GCS bucket and a kaniko pod pushes the result.
pub struct KanikoBuilder {
    namespace: String,
    pull_secret_name: Option<String>,
}

impl KanikoBuilder {
    pub fn new(namespace: Option<String>, pull_secret_name: Option<String>) -> Self {
        Self {
            namespace: namespace.unwrap_or_else(|| "default".to_string()),
            pull_secret_name,
        }
    }
}

#[async_trait]
impl Builder for KanikoBuilder {
    async fn build(
        &self,
        token: &CancellationToken,
        out: &Output,
        tagger: &dyn Tagger,
        artifacts: &[Artifact],
    ) -> Result<Vec<BuildResult>> {
        let mut results = Vec::with_capacity(artifacts.len());
        for artifact in artifacts {
            if token.is_cancelled() {
                bail!("build cancelled");
            }
            let result = self
                .build_one(token, out, tagger, artifact)
                .await
                .map_err(|e| build_error(artifact, e))?;
            results.push(result);
        }
        Ok(results)
    }

    fn labels(&self) -> Labels {
        builder_labels("kaniko")
    }
}

impl KanikoBuilder {
    async fn build_one(
        &self,
        token: &CancellationToken,
        out: &Output,
        tagger: &dyn Tagger,
        artifact: &Artifact,
    ) -> Result<BuildResult> {
        use k8s_openapi::api::core::v1::Pod;
        use kube::api::{Api, DeleteParams, PostParams};

        artifact.check_workspace()?;
        let kaniko = match &artifact.artifact_type {
            ArtifactType::Kaniko(k) => k,
            _ => bail!("kaniko builder only builds kaniko artifacts"),
        };
        let tag = tagger.generate(&artifact.workspace, &artifact.image_name, "")?;

        // Stage the build context.
        let staging = tempfile::NamedTempFile::new().context("creating context tempfile")?;
        let context_object = format!(
            "gs://{}/skiff/context-{}.tar.gz",
            kaniko.bucket,
            sanitize(&artifact.image_name)
        );
        let mut tar = Command::new("tar");
        tar.arg("-C")
            .arg(&artifact.workspace)
            .arg("-czf")
            .arg(staging.path())
            .arg(".");
        proc::run_forwarding(tar, out).await.context("archiving build context")?;
        let mut upload = Command::new("gsutil");
        upload.arg("cp").arg(staging.path()).arg(&context_object);
        proc::run_forwarding(upload, out)
            .await
            .context("uploading build context")?;

        // Run the kaniko pod to completion.
        let client = skiff_kube::client().await?;
        let api: Api<Pod> = Api::namespaced(client, &self.namespace);
        let pod_name = format!("kaniko-{}", sanitize(&artifact.image_name));
        let pod = self.kaniko_pod(&pod_name, kaniko, &context_object, &tag)?;
        let _ = api.delete(&pod_name, &DeleteParams::default()).await; // leftover from a failed run
        api.create(&PostParams::default(), &pod)
            .await
            .context("creating kaniko pod")?;

        let outcome = self.await_pod(token, &api, &pod_name, out).await;
        if let Err(e) = api.delete(&pod_name, &DeleteParams::default()).await {
            warn!(pod = %pod_name, error = %e, "deleting kaniko pod failed");
        }
        outcome?;

        info!(image = %artifact.image_name, tag = %tag, "built with kaniko");
        Ok(BuildResult {
            image_name: artifact.image_name.clone(),
            tag,
        })
    }

    fn kaniko_pod(
        &self,
        pod_name: &str,
        kaniko: &skiff_core::KanikoArtifact,
        context_object: &str,
        destination: &str,
    ) -> Result<k8s_openapi::api::core::v1::Pod> {
        let mut container = serde_json::json!({
            "name": "kaniko",
            "image": "gcr.io/kaniko-project/executor:latest",
            "args": [
                format!("--dockerfile={}", kaniko.dockerfile_path),
                format!("--context={}", context_object),
                format!("--destination={}", destination),
            ],
        });
        if self.pull_secret_name.is_some() {
            container["volumeMounts"] = serde_json::json!([
                { "name": "kaniko-secret", "mountPath": "/secret" }
            ]);
            container["env"] = serde_json::json!([
                { "name": "GOOGLE_APPLICATION_CREDENTIALS", "value": "/secret/kaniko-secret.json" }
            ]);
        }
        let mut spec = serde_json::json!({
            "restartPolicy": "Never",
            "containers": [container],
        });
        if let Some(secret) = &self.pull_secret_name {
            spec["volumes"] = serde_json::json!([
                { "name": "kaniko-secret", "secret": { "secretName": secret } }
            ]);
        }
        serde_json::from_value(serde_json::json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": { "name": pod_name },
            "spec": spec,
        }))
        .map_err(|e| anyhow!("building kaniko pod spec: {}", e))
    }

    async fn await_pod(
        &self,
        token: &CancellationToken,
        api: &kube::api::Api<k8s_openapi::api::core::v1::Pod>,
        pod_name: &str,
        out: &Output,
    ) -> Result<()> {
        let timeout: u64 = std::env::var("SKIFF_KANIKO_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(600);
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(timeout);

        loop {
            if token.is_cancelled() {
                bail!("build cancelled");
            }
            if std::time::Instant::now() >= deadline {
                bail!("kaniko build timed out after {}s", timeout);
            }
            let pod = api.get(pod_name).await.context("polling kaniko pod")?;
            let phase = pod
                .status
                .as_ref()
                .and_then(|s| s.phase.clone())
                .unwrap_or_default();
            match phase.as_str() {
                "Succeeded" => {
                    self.fetch_logs(api, pod_name, out).await;
                    return Ok(());
                }
                "Failed" => {
                    self.fetch_logs(api, pod_name, out).await;
                    bail!("kaniko pod failed");
                }
                _ => tokio::time::sleep(std::time::Duration::from_secs(2)).await,
            }
        }
    }

    async fn fetch_logs(
        &self,
        api: &kube::api::Api<k8s_openapi::api::core::v1::Pod>,
        pod_name: &str,
        out: &Output,
    ) {
        match api.logs(pod_name, &kube::api::LogParams::default()).await {
            Ok(logs) => {
                for line in logs.lines() {
                    out.write_line(line);
                }
            }
            Err(e) => warn!(pod = %pod_name, error = %e, "fetching kaniko logs failed"),
        }
    }
}

fn sanitize(image: &str) -> String {
    image
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_cluster_detection() {
        assert!(is_local_cluster(Some("minikube")));
        assert!(is_local_cluster(Some("docker-desktop")));
        assert!(is_local_cluster(Some("kind-dev")));
        assert!(!is_local_cluster(Some("gke_project_zone_cluster")));
        assert!(!is_local_cluster(None));
    }

    #[test]
    fn push_policy_prefers_explicit_config() {
        assert!(!LocalBuilder::new(Some(true), Some("gke_x".into())).should_push());
        assert!(LocalBuilder::new(Some(false), Some("minikube".into())).should_push());
        assert!(!LocalBuilder::new(None, Some("minikube".into())).should_push());
        assert!(LocalBuilder::new(None, Some("gke_x".into())).should_push());
    }

    #[test]
    fn sanitize_produces_pod_safe_names() {
        assert_eq!(sanitize("gcr.io/p/app"), "gcr-io-p-app");
    }
}
