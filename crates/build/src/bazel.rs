//! Bazel helpers: source-file dependency queries and image tarball builds.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::process::Command;
use tracing::debug;

use skiff_core::{proc, BazelArtifact, Output};

/// Source files of the target, resolved against the workspace. External
/// repository labels are not local files and are skipped. Queries can take
/// seconds on a real dependency graph, so this never blocks the runtime.
pub async fn dependencies(workspace: &Path, artifact: &BazelArtifact) -> Result<Vec<PathBuf>> {
    let query = format!("kind(\"source file\", deps({}))", artifact.target);
    let mut cmd = Command::new("bazel");
    cmd.arg("query")
        .arg("--noimplicit_deps")
        .arg(&query)
        .arg("--output=label")
        .current_dir(workspace);
    let stdout = proc::run_capture(cmd).await.context("bazel query")?;

    let mut paths = Vec::new();
    for label in String::from_utf8_lossy(&stdout).lines() {
        let label = label.trim();
        if label.is_empty() || label.starts_with('@') {
            continue;
        }
        if let Some(rel) = label_to_path(label) {
            paths.push(workspace.join(rel));
        }
    }
    paths.sort();
    debug!(target = %artifact.target, files = paths.len(), "bazel dependencies");
    Ok(paths)
}

/// `//pkg/sub:file.go` -> `pkg/sub/file.go`
fn label_to_path(label: &str) -> Option<String> {
    let stripped = label.strip_prefix("//")?;
    Some(match stripped.split_once(':') {
        Some(("", file)) => file.to_string(),
        Some((pkg, file)) => format!("{}/{}", pkg, file),
        None => stripped.to_string(),
    })
}

/// Build the tarball target and return its path under bazel-bin.
pub async fn build(workspace: &Path, artifact: &BazelArtifact, out: &Output) -> Result<PathBuf> {
    let mut cmd = Command::new("bazel");
    cmd.arg("build").arg(&artifact.target).current_dir(workspace);
    proc::run_forwarding(cmd, out).await.context("bazel build")?;
    Ok(workspace.join("bazel-bin").join(
        artifact
            .target
            .trim_start_matches("//")
            .replace(':', "/"),
    ))
}
