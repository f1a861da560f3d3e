//! Deployers. Each produces a manifest stream, runs it through the image
//! rewrite against the latest build results and hands it to the cluster;
//! `cleanup` takes the same stream down again.

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use globset::{Glob, GlobSetBuilder};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use walkdir::WalkDir;

use skiff_core::{
    proc, BuildResult, DeployedResource, Deployer, Labels, Output, SkiffError, LABEL_PREFIX,
};
use skiff_kube::Kubectl;
use skiff_manifest::ManifestList;

fn deployer_labels(name: &str) -> Labels {
    let mut labels = Labels::new();
    labels.insert(format!("{}/deployer", LABEL_PREFIX), name.to_string());
    labels
}

async fn apply_manifests(
    kubectl: &Kubectl,
    out: &Output,
    manifests: ManifestList,
    builds: &[BuildResult],
) -> Result<Vec<DeployedResource>> {
    let rewritten = manifests.replace_images(builds);
    if rewritten.is_empty() {
        debug!("no manifests to apply");
        return Ok(vec![]);
    }
    kubectl
        .apply(&rewritten.to_string(), out)
        .await
        .map_err(|e| anyhow::Error::from(SkiffError::Deploy(e)))?;
    Ok(rewritten.resources())
}

/// Expand manifest path globs against the working directory. Glob hits that
/// are not json/yaml are refused unless named explicitly.
fn manifest_files(working_dir: &Path, patterns: &[String]) -> Result<Vec<PathBuf>> {
    let mut set = GlobSetBuilder::new();
    for pattern in patterns {
        set.add(Glob::new(pattern).with_context(|| format!("bad manifest pattern {:?}", pattern))?);
    }
    let set = set.build()?;

    let mut files = Vec::new();
    for entry in WalkDir::new(working_dir).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(working_dir).unwrap_or(entry.path());
        if !set.is_match(rel) {
            continue;
        }
        if !is_kubernetes_format(rel) && !patterns.iter().any(|p| Path::new(p) == rel) {
            info!(
                file = %rel.display(),
                "refusing to deploy non {{json, yaml}} file; name it explicitly to include it"
            );
            continue;
        }
        files.push(entry.path().to_path_buf());
    }
    files.sort();
    Ok(files)
}

fn is_kubernetes_format(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml") | Some("json")
    )
}

/// Applies plain manifests with `kubectl apply`.
pub struct KubectlDeployer {
    working_dir: PathBuf,
    manifests: Vec<String>,
    remote_manifests: Vec<String>,
    kubectl: Kubectl,
}

impl KubectlDeployer {
    pub fn new(
        working_dir: PathBuf,
        manifests: Vec<String>,
        remote_manifests: Vec<String>,
        kubectl: Kubectl,
    ) -> Self {
        Self {
            working_dir,
            manifests,
            remote_manifests,
            kubectl,
        }
    }

    async fn read_manifests(&self) -> Result<ManifestList> {
        let mut list = ManifestList::default();
        for file in manifest_files(&self.working_dir, &self.manifests)? {
            let buf = std::fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
            for doc in ManifestList::from_bytes(&buf).into_iter() {
                list.push(doc);
            }
        }
        for name in &self.remote_manifests {
            let buf = self
                .kubectl
                .get_yaml(name)
                .await
                .with_context(|| format!("getting remote manifest {}", name))?;
            list.push(buf);
        }
        Ok(list)
    }
}

#[async_trait]
impl Deployer for KubectlDeployer {
    async fn deploy(
        &self,
        _token: &CancellationToken,
        out: &Output,
        builds: &[BuildResult],
    ) -> Result<Vec<DeployedResource>> {
        let manifests = self.read_manifests().await?;
        apply_manifests(&self.kubectl, out, manifests, builds).await
    }

    async fn cleanup(&self, _token: &CancellationToken, out: &Output) -> Result<()> {
        let manifests = self.read_manifests().await?;
        if manifests.is_empty() {
            return Ok(());
        }
        self.kubectl.delete(&manifests.to_string(), out).await
    }

    fn dependencies(&self) -> Result<Vec<PathBuf>> {
        manifest_files(&self.working_dir, &self.manifests)
    }

    fn labels(&self) -> Labels {
        deployer_labels("kubectl")
    }
}

/// Renders with `kustomize build` and applies the output.
pub struct KustomizeDeployer {
    path: PathBuf,
    kubectl: Kubectl,
}

impl KustomizeDeployer {
    pub fn new(path: PathBuf, kubectl: Kubectl) -> Self {
        Self { path, kubectl }
    }

    async fn render(&self) -> Result<ManifestList> {
        let mut cmd = tokio::process::Command::new("kustomize");
        cmd.arg("build").arg(&self.path);
        let stdout = proc::run_capture(cmd).await.context("kustomize build")?;
        Ok(ManifestList::from_bytes(&stdout))
    }
}

#[async_trait]
impl Deployer for KustomizeDeployer {
    async fn deploy(
        &self,
        _token: &CancellationToken,
        out: &Output,
        builds: &[BuildResult],
    ) -> Result<Vec<DeployedResource>> {
        let manifests = self.render().await?;
        apply_manifests(&self.kubectl, out, manifests, builds).await
    }

    async fn cleanup(&self, _token: &CancellationToken, out: &Output) -> Result<()> {
        let manifests = self.render().await?;
        if manifests.is_empty() {
            return Ok(());
        }
        self.kubectl.delete(&manifests.to_string(), out).await
    }

    fn dependencies(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in WalkDir::new(&self.path).into_iter().filter_map(|e| e.ok()) {
            if entry.file_type().is_file() {
                files.push(entry.path().to_path_buf());
            }
        }
        files.sort();
        Ok(files)
    }

    fn labels(&self) -> Labels {
        deployer_labels("kustomize")
    }
}

/// One `helm upgrade --install` per configured release. Image values are
/// overridden with the built tags.
pub struct HelmDeployer {
    releases: Vec<HelmRelease>,
    kube_context: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HelmRelease {
    pub name: String,
    pub chart_path: PathBuf,
    /// values key -> artifact image name
    pub values: std::collections::HashMap<String, String>,
    pub namespace: Option<String>,
}

impl HelmDeployer {
    pub fn new(releases: Vec<HelmRelease>, kube_context: Option<String>) -> Self {
        Self {
            releases,
            kube_context,
        }
    }

    fn helm(&self, release: &HelmRelease) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new("helm");
        if let Some(ctx) = &self.kube_context {
            cmd.arg("--kube-context").arg(ctx);
        }
        if let Some(ns) = &release.namespace {
            cmd.arg("--namespace").arg(ns);
        }
        cmd
    }
}

#[async_trait]
impl Deployer for HelmDeployer {
    async fn deploy(
        &self,
        _token: &CancellationToken,
        out: &Output,
        builds: &[BuildResult],
    ) -> Result<Vec<DeployedResource>> {
        let mut deployed = Vec::new();
        for release in &self.releases {
            let mut cmd = self.helm(release);
            cmd.arg("upgrade")
                .arg("--install")
                .arg(&release.name)
                .arg(&release.chart_path);
            for (key, image_name) in &release.values {
                let tag = builds
                    .iter()
                    .find(|b| &b.image_name == image_name)
                    .map(|b| b.tag.clone())
                    .unwrap_or_else(|| image_name.clone());
                cmd.arg("--set-string").arg(format!("{}={}", key, tag));
            }
            proc::run_forwarding(cmd, out)
                .await
                .with_context(|| format!("helm upgrade {}", release.name))
                .map_err(|e| anyhow::Error::from(SkiffError::Deploy(e)))?;

            // Parse the release's rendered manifest for the labeler.
            let mut get = self.helm(release);
            get.arg("get").arg("manifest").arg(&release.name);
            if let Ok(stdout) = proc::run_capture(get).await {
                deployed.extend(ManifestList::from_bytes(&stdout).resources());
            }
        }
        Ok(deployed)
    }

    async fn cleanup(&self, _token: &CancellationToken, out: &Output) -> Result<()> {
        for release in &self.releases {
            let mut cmd = self.helm(release);
            cmd.arg("delete").arg(&release.name);
            proc::run_forwarding(cmd, out)
                .await
                .with_context(|| format!("helm delete {}", release.name))?;
        }
        Ok(())
    }

    fn dependencies(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for release in &self.releases {
            for entry in WalkDir::new(&release.chart_path).into_iter().filter_map(|e| e.ok()) {
                if entry.file_type().is_file() {
                    files.push(entry.path().to_path_buf());
                }
            }
        }
        files.sort();
        files.dedup();
        Ok(files)
    }

    fn labels(&self) -> Labels {
        deployer_labels("helm")
    }
}

/// Converts a compose file with `kompose` and applies the result.
pub struct KomposeDeployer {
    compose_file: PathBuf,
    kubectl: Kubectl,
}

impl KomposeDeployer {
    pub fn new(compose_file: PathBuf, kubectl: Kubectl) -> Self {
        Self {
            compose_file,
            kubectl,
        }
    }

    async fn render(&self) -> Result<ManifestList> {
        let mut cmd = tokio::process::Command::new("kompose");
        cmd.arg("convert")
            .arg("-f")
            .arg(&self.compose_file)
            .arg("--stdout");
        let stdout = proc::run_capture(cmd).await.context("kompose convert")?;
        Ok(ManifestList::from_bytes(&stdout))
    }
}

#[async_trait]
impl Deployer for KomposeDeployer {
    async fn deploy(
        &self,
        _token: &CancellationToken,
        out: &Output,
        builds: &[BuildResult],
    ) -> Result<Vec<DeployedResource>> {
        let manifests = self.render().await?;
        apply_manifests(&self.kubectl, out, manifests, builds).await
    }

    async fn cleanup(&self, _token: &CancellationToken, out: &Output) -> Result<()> {
        let manifests = self.render().await?;
        if manifests.is_empty() {
            return Ok(());
        }
        self.kubectl.delete(&manifests.to_string(), out).await
    }

    fn dependencies(&self) -> Result<Vec<PathBuf>> {
        Ok(vec![self.compose_file.clone()])
    }

    fn labels(&self) -> Labels {
        deployer_labels("kompose")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, rel: &str, contents: &str) {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    #[test]
    fn manifest_globs_expand_and_filter() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "k8s/app.yaml", "kind: Pod");
        write(dir.path(), "k8s/svc.yml", "kind: Service");
        write(dir.path(), "k8s/notes.txt", "not a manifest");

        let files = manifest_files(dir.path(), &["k8s/*".to_string()]).unwrap();
        assert_eq!(
            files,
            vec![dir.path().join("k8s/app.yaml"), dir.path().join("k8s/svc.yml")]
        );
    }

    #[test]
    fn explicitly_named_files_bypass_the_format_filter() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "deploy.custom", "kind: Pod");

        let files = manifest_files(dir.path(), &["deploy.custom".to_string()]).unwrap();
        assert_eq!(files, vec![dir.path().join("deploy.custom")]);
    }

    #[test]
    fn kubectl_dependencies_are_the_manifest_files() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "k8s/app.yaml", "kind: Pod");
        let deployer = KubectlDeployer::new(
            dir.path().to_path_buf(),
            vec!["k8s/*.yaml".to_string()],
            vec![],
            Kubectl::default(),
        );
        assert_eq!(
            deployer.dependencies().unwrap(),
            vec![dir.path().join("k8s/app.yaml")]
        );
    }
}
