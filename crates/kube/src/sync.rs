//! In-place file sync into running pods, bypassing the build+deploy cycle.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use tracing::info;

use skiff_core::{proc, Output, Syncer};

use crate::Kubectl;

/// Places files with `kubectl cp` and removes them with `kubectl exec rm`.
pub struct KubectlSyncer {
    kubectl: Kubectl,
}

impl KubectlSyncer {
    pub fn new(kubectl: Kubectl) -> Self {
        Self { kubectl }
    }

    /// Every (pod, container) whose image field starts with `image`.
    async fn matching_containers(&self, image: &str) -> Result<Vec<(String, String, String)>> {
        let client = crate::client().await?;
        let api: Api<Pod> = match &self.kubectl.namespace {
            Some(ns) => Api::namespaced(client, ns),
            None => Api::all(client),
        };
        let pods = api
            .list(&ListParams::default())
            .await
            .context("listing pods for sync")?;

        let mut out = Vec::new();
        for pod in pods.items {
            let Some(pod_name) = pod.metadata.name.clone() else {
                continue;
            };
            let namespace = pod.metadata.namespace.clone().unwrap_or_default();
            for container in pod.spec.as_ref().map(|s| s.containers.as_slice()).unwrap_or(&[]) {
                let matched = container
                    .image
                    .as_deref()
                    .map(|i| i.starts_with(image))
                    .unwrap_or(false);
                if matched {
                    out.push((namespace.clone(), pod_name.clone(), container.name.clone()));
                }
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl Syncer for KubectlSyncer {
    async fn copy(&self, image: &str, files: &[PathBuf]) -> Result<()> {
        let targets = self.matching_containers(image).await?;
        info!(image = %image, files = files.len(), pods = targets.len(), "syncing files");
        let out = Output::sink();
        for (namespace, pod, container) in &targets {
            for file in files {
                let file = path_str(file)?;
                let dest = format!("{}/{}:{}", namespace, pod, file);
                let cmd = self.kubectl.command(&["cp", file, &dest, "-c", container]);
                proc::run_forwarding(cmd, &out)
                    .await
                    .with_context(|| format!("copying {} into {}", file, pod))?;
            }
        }
        Ok(())
    }

    async fn delete(&self, image: &str, files: &[PathBuf]) -> Result<()> {
        let targets = self.matching_containers(image).await?;
        info!(image = %image, files = files.len(), pods = targets.len(), "deleting synced files");
        let out = Output::sink();
        for (_, pod, container) in &targets {
            for file in files {
                let file = path_str(file)?;
                let cmd = self
                    .kubectl
                    .command(&["exec", pod, "-c", container, "--", "rm", "-rf", file]);
                proc::run_forwarding(cmd, &out)
                    .await
                    .with_context(|| format!("deleting {} from {}", file, pod))?;
            }
        }
        Ok(())
    }
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .with_context(|| format!("non-utf8 path {:?}", path))
}
