//! Post-deploy labeling: stamps every applied runtime object with the
//! session's labels through the dynamic API. Transient API-server errors are
//! retried a fixed number of times per object.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use anyhow::{anyhow, Result};
use kube::api::{Api, Patch, PatchParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::discovery::{Discovery, Scope};
use kube::Client;
use once_cell::sync::Lazy;
use tracing::warn;

use skiff_core::{DeployedResource, Labels, LABEL_PREFIX};

// The object may not have propagated to the API server yet when the apply
// returns.
const TRIES: usize = 3;
const SLEEP: Duration = Duration::from_millis(300);

/// Label every deployed resource. Failures are logged per object, never
/// propagated; labeling is decoration, not part of the deploy.
pub async fn apply_labels(labels: &Labels, namespace: Option<&str>, resources: &[DeployedResource]) {
    let client = match crate::client().await {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "skipping labels: no kubernetes client");
            return;
        }
    };

    let mut all = Labels::new();
    all.insert(format!("{}/managed", LABEL_PREFIX), "true".to_string());
    all.extend(labels.clone());

    for resource in resources {
        let mut last_err = None;
        for _ in 0..TRIES {
            match label_one(client.clone(), &all, namespace, resource).await {
                Ok(()) => {
                    last_err = None;
                    break;
                }
                Err(e) => {
                    last_err = Some(e);
                    tokio::time::sleep(SLEEP).await;
                }
            }
        }
        if let Some(e) = last_err {
            warn!(kind = %resource.kind, name = %resource.name, error = %e, "labeling runtime object failed");
        }
    }
}

async fn label_one(
    client: Client,
    labels: &Labels,
    default_namespace: Option<&str>,
    resource: &DeployedResource,
) -> Result<()> {
    let gvk = gvk_of(resource);
    let (ar, namespaced) = find_api_resource(client.clone(), &gvk).await?;
    let api: Api<DynamicObject> = if namespaced {
        let ns = resource
            .namespace
            .as_deref()
            .or(default_namespace)
            .unwrap_or("default");
        Api::namespaced_with(client, ns, &ar)
    } else {
        Api::all_with(client, &ar)
    };
    let patch = serde_json::json!({ "metadata": { "labels": labels } });
    api.patch(&resource.name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

fn gvk_of(resource: &DeployedResource) -> GroupVersionKind {
    let (group, version) = match resource.api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), resource.api_version.clone()),
    };
    GroupVersionKind {
        group,
        version,
        kind: resource.kind.clone(),
    }
}

// Discovery cache: GVK key -> (ApiResource, namespaced)
static DISCOVERY_CACHE: Lazy<RwLock<HashMap<String, (ApiResource, bool)>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

fn gvk_key(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        format!("{}/{}", gvk.version, gvk.kind)
    } else {
        format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)
    }
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    let key = gvk_key(gvk);
    if let Some(hit) = DISCOVERY_CACHE.read().unwrap().get(&key).cloned() {
        return Ok(hit);
    }
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                DISCOVERY_CACHE
                    .write()
                    .unwrap()
                    .insert(key, (ar.clone(), namespaced));
                return Ok((ar, namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}", key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gvk_of_splits_grouped_api_versions() {
        let r = DeployedResource {
            api_version: "apps/v1".into(),
            kind: "Deployment".into(),
            namespace: None,
            name: "web".into(),
        };
        let gvk = gvk_of(&r);
        assert_eq!(gvk.group, "apps");
        assert_eq!(gvk.version, "v1");
        assert_eq!(gvk.kind, "Deployment");
    }

    #[test]
    fn gvk_of_handles_core_group() {
        let r = DeployedResource {
            api_version: "v1".into(),
            kind: "Service".into(),
            namespace: None,
            name: "svc".into(),
        };
        let gvk = gvk_of(&r);
        assert_eq!(gvk.group, "");
        assert_eq!(gvk.version, "v1");
        assert_eq!(gvk_key(&gvk), "v1/Service");
    }
}
