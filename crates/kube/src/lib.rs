//! Kubernetes-side services that run in lock-step with the dev loop: the
//! image list, log aggregation, port-forwarding, in-place file sync and the
//! post-deploy labeler. Imperative cluster actions go through the `kubectl`
//! binary; watches and log streams use the API client.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use kube::Client;
use tokio::process::Command;
use tokio::sync::OnceCell;

use skiff_core::{proc, Output};

pub mod forward;
pub mod image_list;
pub mod labels;
pub mod logs;
pub mod sync;

pub use forward::PortForwarder;
pub use image_list::{ImageEvent, ImageList};
pub use logs::LogAggregator;
pub use sync::KubectlSyncer;

// One client per process; TLS and kubeconfig setup are not cheap.
static KUBE_CLIENT: OnceCell<Client> = OnceCell::const_new();

pub async fn client() -> Result<Client> {
    KUBE_CLIENT
        .get_or_try_init(|| async {
            Client::try_default()
                .await
                .context("creating kubernetes client")
        })
        .await
        .map(|c| c.clone())
}

/// Thin wrapper over the `kubectl` binary. The configured context and
/// namespace are forwarded to every invocation.
#[derive(Debug, Clone, Default)]
pub struct Kubectl {
    pub context: Option<String>,
    pub namespace: Option<String>,
}

impl Kubectl {
    pub fn new(context: Option<String>, namespace: Option<String>) -> Self {
        Self { context, namespace }
    }

    pub fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new("kubectl");
        if let Some(ctx) = &self.context {
            cmd.arg("--context").arg(ctx);
        }
        if let Some(ns) = &self.namespace {
            cmd.arg("--namespace").arg(ns);
        }
        cmd.args(args);
        cmd
    }

    /// `kubectl apply -f -` with the manifest stream on stdin.
    pub async fn apply(&self, manifests: &str, out: &Output) -> Result<()> {
        proc::run_with_stdin(self.command(&["apply", "-f", "-"]), manifests.as_bytes(), out)
            .await
            .context("kubectl apply")
    }

    /// `kubectl delete -f -` with the manifest stream on stdin.
    pub async fn delete(&self, manifests: &str, out: &Output) -> Result<()> {
        proc::run_with_stdin(self.command(&["delete", "-f", "-"]), manifests.as_bytes(), out)
            .await
            .context("kubectl delete")
    }

    /// Fetch a live object as YAML. `name` may carry a `namespace:name`
    /// prefix; colons inside resource names are unsupported by this syntax.
    pub async fn get_yaml(&self, name: &str) -> Result<Vec<u8>> {
        let mut scoped = self.clone();
        let name = match name.split_once(':') {
            Some((ns, rest)) => {
                scoped.namespace = Some(ns.to_string());
                rest
            }
            None => name,
        };
        proc::run_capture(scoped.command(&["get", name, "-o", "yaml"]))
            .await
            .context("kubectl get")
    }
}
