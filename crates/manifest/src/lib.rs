//! Multi-document manifest streams and the image-reference rewrite pass.
//!
//! Documents are opaque byte slices split on `\n---` boundaries. The rewrite
//! walks each document as a generic YAML tree, so CRDs and anything else the
//! cluster serves are transformed without a resource schema.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::fmt;

use serde_yaml::Value;
use skiff_core::{BuildResult, DeployedResource};
use tracing::{info, warn};

pub mod image;

struct Replacement {
    tag: String,
    found: bool,
}

/// Ordered sequence of YAML documents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestList(Vec<Vec<u8>>);

impl ManifestList {
    pub fn from_bytes(buf: &[u8]) -> Self {
        let mut docs = Vec::new();
        for part in split_documents(buf) {
            docs.push(part.to_vec());
        }
        Self(docs)
    }

    pub fn push(&mut self, doc: Vec<u8>) {
        self.0.push(doc);
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|d| d.iter().all(u8::is_ascii_whitespace))
    }

    /// Replace every non-fully-qualified `image` value whose base name has a
    /// build result with that result's tag. Never fails on manifest shape:
    /// documents that do not parse are emitted unchanged with a warning.
    pub fn replace_images(&self, builds: &[BuildResult]) -> ManifestList {
        let mut replacements: HashMap<String, Replacement> = builds
            .iter()
            .map(|b| {
                (
                    b.image_name.clone(),
                    Replacement {
                        tag: b.tag.clone(),
                        found: false,
                    },
                )
            })
            .collect();

        let mut out = ManifestList::default();
        for doc in &self.0 {
            if doc.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            let mut value: Value = match serde_yaml::from_slice(doc) {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "manifest document did not parse; leaving it unchanged");
                    out.push(doc.clone());
                    continue;
                }
            };
            if value.is_null() {
                continue;
            }
            replace_in_node(&mut value, &mut replacements);
            match serde_yaml::to_string(&value) {
                Ok(s) => out.push(s.into_bytes()),
                Err(e) => {
                    warn!(error = %e, "re-emitting manifest document failed; leaving it unchanged");
                    out.push(doc.clone());
                }
            }
        }

        for (name, replacement) in &replacements {
            if !replacement.found {
                warn!(image = %name, "image is configured but not used by any manifest");
            }
        }

        out
    }

    /// Parse out the identity of every resource, for post-deploy labeling.
    pub fn resources(&self) -> Vec<DeployedResource> {
        let mut out = Vec::new();
        for doc in &self.0 {
            let value: Value = match serde_yaml::from_slice(doc) {
                Ok(v) => v,
                Err(_) => continue,
            };
            let get = |key: &str| {
                value
                    .get(key)
                    .and_then(Value::as_str)
                    .map(|s| s.to_string())
            };
            let meta = value.get("metadata");
            let name = meta
                .and_then(|m| m.get("name"))
                .and_then(Value::as_str)
                .map(|s| s.to_string());
            match (get("apiVersion"), get("kind"), name) {
                (Some(api_version), Some(kind), Some(name)) => out.push(DeployedResource {
                    api_version,
                    kind,
                    namespace: meta
                        .and_then(|m| m.get("namespace"))
                        .and_then(Value::as_str)
                        .map(|s| s.to_string()),
                    name,
                }),
                _ => {}
            }
        }
        out
    }
}

impl IntoIterator for ManifestList {
    type Item = Vec<u8>;
    type IntoIter = std::vec::IntoIter<Vec<u8>>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl fmt::Display for ManifestList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for doc in &self.0 {
            let trimmed = String::from_utf8_lossy(doc);
            let trimmed = trimmed.trim();
            if trimmed.is_empty() {
                continue;
            }
            if !first {
                f.write_str("\n---\n")?;
            }
            first = false;
            f.write_str(trimmed)?;
        }
        Ok(())
    }
}

fn split_documents(buf: &[u8]) -> Vec<&[u8]> {
    let sep = b"\n---";
    let mut parts = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i + sep.len() <= buf.len() {
        if &buf[i..i + sep.len()] == sep {
            parts.push(&buf[start..i]);
            start = i + sep.len();
            i = start;
        } else {
            i += 1;
        }
    }
    parts.push(&buf[start..]);
    parts
}

fn replace_in_node(node: &mut Value, replacements: &mut HashMap<String, Replacement>) {
    match node {
        Value::Sequence(seq) => {
            for item in seq.iter_mut() {
                replace_in_node(item, replacements);
            }
        }
        Value::Mapping(map) => {
            for (key, value) in map.iter_mut() {
                if key.as_str() != Some("image") {
                    replace_in_node(value, replacements);
                    continue;
                }
                let Some(image) = value.as_str() else {
                    warn!("non-string image value; skipping");
                    continue;
                };
                let parsed = match image::parse(image) {
                    Ok(p) => p,
                    Err(_) => {
                        warn!(image = %image, "could not parse image reference; skipping");
                        continue;
                    }
                };
                if parsed.fully_qualified {
                    info!(image = %image, "not replacing fully qualified image");
                    continue;
                }
                if let Some(replacement) = replacements.get_mut(&parsed.base_name) {
                    *value = Value::String(replacement.tag.clone());
                    replacement.found = true;
                }
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builds(pairs: &[(&str, &str)]) -> Vec<BuildResult> {
        pairs
            .iter()
            .map(|(n, t)| BuildResult {
                image_name: n.to_string(),
                tag: t.to_string(),
            })
            .collect()
    }

    const POD: &str = "apiVersion: v1\nkind: Pod\nmetadata:\n  name: app\nspec:\n  containers:\n  - name: app\n    image: myapp\n  - name: sidecar\n    image: registry/other@sha256:abc123\n";

    #[test]
    fn rewrites_matching_images_and_keeps_qualified_ones() {
        let list = ManifestList::from_bytes(POD.as_bytes());
        let out = list.replace_images(&builds(&[("myapp", "myapp:abc")])).to_string();
        assert!(out.contains("image: myapp:abc"), "out={}", out);
        assert!(out.contains("registry/other@sha256:abc123"), "out={}", out);
    }

    #[test]
    fn untouched_image_values_stay_byte_identical() {
        let input = "apiVersion: v1\nkind: Pod\nmetadata:\n  name: app\nspec:\n  containers:\n  - name: app\n    image: elsewhere/unrelated\n";
        let list = ManifestList::from_bytes(input.as_bytes());
        let out = list.replace_images(&builds(&[("myapp", "myapp:abc")])).to_string();
        assert!(out.contains("image: elsewhere/unrelated"), "out={}", out);
    }

    #[test]
    fn transform_is_idempotent() {
        let list = ManifestList::from_bytes(POD.as_bytes());
        let b = builds(&[("myapp", "myapp:abc")]);
        let once = list.replace_images(&b);
        let twice = once.replace_images(&b);
        assert_eq!(once.to_string(), twice.to_string());
    }

    #[test]
    fn multiple_documents_keep_order_and_separator() {
        let input = format!("{}---\napiVersion: v1\nkind: Service\nmetadata:\n  name: svc\n", POD);
        let list = ManifestList::from_bytes(input.as_bytes());
        let out = list.replace_images(&builds(&[("myapp", "myapp:v2")])).to_string();
        let docs: Vec<&str> = out.split("\n---\n").collect();
        assert_eq!(docs.len(), 2);
        assert!(docs[0].contains("kind: Pod"));
        assert!(docs[1].contains("kind: Service"));
    }

    #[test]
    fn empty_documents_are_elided() {
        let input = "\n---\napiVersion: v1\nkind: Pod\nmetadata:\n  name: app\n---\n   \n";
        let list = ManifestList::from_bytes(input.as_bytes());
        let out = list.replace_images(&[]).to_string();
        assert_eq!(out.matches("kind: Pod").count(), 1);
        assert!(!out.starts_with("---"));
        assert!(!out.trim_end().ends_with("---"));
    }

    #[test]
    fn unparseable_document_is_emitted_unchanged() {
        let input = "apiVersion: v1\nkind: Pod\n\tmangled: [unclosed\n";
        let list = ManifestList::from_bytes(input.as_bytes());
        let out = list.replace_images(&[]).to_string();
        assert_eq!(out, input.trim());
    }

    #[test]
    fn non_string_image_is_skipped() {
        let input = "spec:\n  image: 42\n";
        let list = ManifestList::from_bytes(input.as_bytes());
        let out = list.replace_images(&builds(&[("42", "nope")])).to_string();
        assert!(out.contains("image: 42"), "out={}", out);
    }

    #[test]
    fn resources_parse_identity() {
        let input = format!(
            "{}---\napiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: web\n  namespace: prod\n",
            POD
        );
        let list = ManifestList::from_bytes(input.as_bytes());
        let res = list.resources();
        assert_eq!(res.len(), 2);
        assert_eq!(res[1].kind, "Deployment");
        assert_eq!(res[1].namespace.as_deref(), Some("prod"));
        assert_eq!(res[1].name, "web");
    }
}
