//! Port-forwarding: one `kubectl port-forward` subprocess per
//! `(container, port)` key, re-established when a newer pod generation
//! arrives, torn down with the session.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, WatchParams};
use kube::core::WatchEvent;
use metrics::counter;
use tokio::process::Child;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use skiff_core::Output;

use crate::image_list::ImageList;
use crate::Kubectl;

type ForwardKey = (String, i32); // (container, port)

struct Entry {
    resource_version: u64,
    pod_name: String,
    child: Option<Child>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Start,
    Replace,
    Skip,
}

/// The decision table. At most one live entry per key; a strictly greater
/// resource version supersedes.
#[derive(Default)]
struct ForwardTable {
    entries: HashMap<ForwardKey, Entry>,
}

impl ForwardTable {
    fn decide(&self, key: &ForwardKey, resource_version: u64) -> Decision {
        match self.entries.get(key) {
            None => Decision::Start,
            Some(entry) if resource_version > entry.resource_version => Decision::Replace,
            Some(_) => Decision::Skip,
        }
    }

    fn terminate(&mut self, key: &ForwardKey) {
        if let Some(mut entry) = self.entries.remove(key) {
            debug!(pod = %entry.pod_name, container = %key.0, port = key.1, "terminating port-forward");
            if let Some(child) = entry.child.as_mut() {
                let _ = child.start_kill();
            }
        }
    }

    fn insert(&mut self, key: ForwardKey, entry: Entry) {
        self.entries.insert(key, entry);
    }

    fn terminate_all(&mut self) {
        for (key, mut entry) in self.entries.drain() {
            debug!(pod = %entry.pod_name, container = %key.0, port = key.1, "terminating port-forward");
            if let Some(child) = entry.child.as_mut() {
                let _ = child.start_kill();
            }
        }
    }
}

pub struct PortForwarder {
    out: Arc<Output>,
    images: ImageList,
    kubectl: Kubectl,
    table: Arc<Mutex<ForwardTable>>,
}

impl PortForwarder {
    pub fn new(out: Arc<Output>, images: ImageList, kubectl: Kubectl) -> Self {
        Self {
            out,
            images,
            kubectl,
            table: Arc::new(Mutex::new(ForwardTable::default())),
        }
    }

    /// Spawn the pod watch. Self-heals with backoff; ends with the session
    /// token, terminating every active forward.
    pub fn start(&self, session: &CancellationToken) {
        let token = session.clone();
        let out = Arc::clone(&self.out);
        let images = self.images.clone();
        let kubectl = self.kubectl.clone();
        let table = Arc::clone(&self.table);
        tokio::spawn(async move {
            let backoff_max: u64 = std::env::var("SKIFF_WATCH_BACKOFF_MAX_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(30);
            let mut backoff: u64 = 1;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    res = watch_pods(&out, &images, &kubectl, &table) => {
                        match res {
                            Ok(()) => backoff = 1,
                            Err(e) => {
                                warn!(error = %e, "pod watch failed; will backoff and restart");
                                counter!("pod_watch_errors_total", 1u64);
                            }
                        }
                    }
                }
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(std::time::Duration::from_secs(backoff)) => {}
                }
                backoff = (backoff * 2).min(backoff_max);
            }
            table.lock().unwrap().terminate_all();
            info!("port-forwarder stopped");
        });
    }
}

async fn watch_pods(
    out: &Output,
    images: &ImageList,
    kubectl: &Kubectl,
    table: &Mutex<ForwardTable>,
) -> Result<()> {
    let client = crate::client().await?;
    let api: Api<Pod> = match &kubectl.namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };
    let stream = api.watch(&WatchParams::default(), "0").await?;
    futures::pin_mut!(stream);
    while let Some(event) = stream.try_next().await? {
        match event {
            // Pods are never ready for forwarding at add time.
            WatchEvent::Added(_) => {}
            WatchEvent::Modified(pod) => forward_pod(out, images, kubectl, table, &pod),
            WatchEvent::Deleted(_) | WatchEvent::Bookmark(_) => {}
            WatchEvent::Error(e) => {
                warn!(code = e.code, message = %e.message, "pod watch error event");
                break;
            }
        }
    }
    Ok(())
}

fn forward_pod(
    out: &Output,
    images: &ImageList,
    kubectl: &Kubectl,
    table: &Mutex<ForwardTable>,
    pod: &Pod,
) {
    let selected = pod
        .spec
        .as_ref()
        .map(|s| {
            s.containers
                .iter()
                .any(|c| c.image.as_deref().map(|i| images.selects(i)).unwrap_or(false))
        })
        .unwrap_or(false);
    let running = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .map(|p| p == "Running")
        .unwrap_or(false);
    if !selected || !running || pod.metadata.deletion_timestamp.is_some() {
        return;
    }

    let Some(pod_name) = pod.metadata.name.clone() else {
        return;
    };
    let resource_version = match pod
        .metadata
        .resource_version
        .as_deref()
        .and_then(|rv| rv.parse::<u64>().ok())
    {
        Some(rv) => rv,
        None => {
            warn!(pod = %pod_name, "pod has no numeric resourceVersion; skipping forward");
            return;
        }
    };

    let containers = pod
        .spec
        .as_ref()
        .map(|s| s.containers.as_slice())
        .unwrap_or(&[]);
    for container in containers {
        for port in container.ports.as_deref().unwrap_or(&[]) {
            let key = (container.name.clone(), port.container_port);
            let mut table = table.lock().unwrap();
            match table.decide(&key, resource_version) {
                Decision::Skip => continue,
                Decision::Replace => table.terminate(&key),
                Decision::Start => {}
            }

            let child = spawn_forward(kubectl, &pod_name, port.container_port);
            match child {
                Ok(child) => {
                    out.write_line(&format!(
                        "Port forwarding {} {} -> {}",
                        pod_name, port.container_port, port.container_port
                    ));
                    counter!("port_forwards_total", 1u64);
                    table.insert(
                        key,
                        Entry {
                            resource_version,
                            pod_name: pod_name.clone(),
                            child: Some(child),
                        },
                    );
                }
                Err(e) => warn!(pod = %pod_name, port = port.container_port, error = %e, "port-forward failed to start"),
            }
        }
    }
}

fn spawn_forward(kubectl: &Kubectl, pod_name: &str, port: i32) -> Result<Child> {
    let port = port.to_string();
    let mut cmd = kubectl.command(&["port-forward", &format!("pod/{}", pod_name), &port, &port]);
    cmd.stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .kill_on_drop(true);
    Ok(cmd.spawn()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(rv: u64) -> Entry {
        Entry {
            resource_version: rv,
            pod_name: "pod".into(),
            child: None,
        }
    }

    #[test]
    fn first_sighting_starts_a_forward() {
        let table = ForwardTable::default();
        assert_eq!(table.decide(&("web".into(), 8080), 5), Decision::Start);
    }

    #[test]
    fn same_generation_is_skipped() {
        let mut table = ForwardTable::default();
        table.insert(("web".into(), 8080), entry(5));
        assert_eq!(table.decide(&("web".into(), 8080), 5), Decision::Skip);
        assert_eq!(table.decide(&("web".into(), 8080), 4), Decision::Skip);
    }

    #[test]
    fn newer_generation_replaces() {
        let mut table = ForwardTable::default();
        table.insert(("web".into(), 8080), entry(5));
        assert_eq!(table.decide(&("web".into(), 8080), 6), Decision::Replace);
    }

    #[test]
    fn keys_are_per_container_and_port() {
        let mut table = ForwardTable::default();
        table.insert(("web".into(), 8080), entry(5));
        assert_eq!(table.decide(&("web".into(), 9090), 5), Decision::Start);
        assert_eq!(table.decide(&("sidecar".into(), 8080), 5), Decision::Start);
    }

    #[test]
    fn at_most_one_entry_per_key_after_replace() {
        let mut table = ForwardTable::default();
        let key: ForwardKey = ("web".into(), 8080);
        table.insert(key.clone(), entry(5));
        assert_eq!(table.decide(&key, 7), Decision::Replace);
        table.terminate(&key);
        table.insert(key.clone(), entry(7));
        assert_eq!(table.entries.len(), 1);
        assert_eq!(table.entries.get(&key).unwrap().resource_version, 7);
    }
}
