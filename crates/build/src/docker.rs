//! Docker helpers: Dockerfile dependency parsing and `docker` subprocess
//! invocations.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSetBuilder};
use tokio::process::Command;
use tracing::debug;
use walkdir::WalkDir;

use skiff_core::{proc, DockerArtifact, Output};

/// Source paths an image build depends on: every ADD/COPY source expanded
/// against the workspace, plus the Dockerfile itself.
pub fn dependencies(workspace: &Path, artifact: &DockerArtifact) -> Result<Vec<PathBuf>> {
    let dockerfile = workspace.join(&artifact.dockerfile_path);
    let contents = std::fs::read_to_string(&dockerfile)
        .with_context(|| format!("reading {}", dockerfile.display()))?;

    let mut sources: Vec<String> = Vec::new();
    for line in join_continued_lines(&contents) {
        let trimmed = line.trim();
        let mut tokens = trimmed.split_whitespace();
        let Some(instruction) = tokens.next() else {
            continue;
        };
        if !instruction.eq_ignore_ascii_case("add") && !instruction.eq_ignore_ascii_case("copy") {
            continue;
        }
        let args: Vec<&str> = tokens.filter(|t| !t.starts_with("--")).collect();
        if args.len() < 2 {
            continue;
        }
        // Last argument is the in-image destination.
        for src in &args[..args.len() - 1] {
            if src.starts_with("http://") || src.starts_with("https://") {
                continue;
            }
            sources.push((*src).to_string());
        }
    }

    let mut out: BTreeSet<PathBuf> = BTreeSet::new();
    out.insert(dockerfile);
    for src in &sources {
        expand_source(workspace, src, &mut out)?;
    }
    debug!(files = out.len(), "dockerfile dependencies");
    Ok(out.into_iter().collect())
}

fn join_continued_lines(contents: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for line in contents.lines() {
        let line = line.trim_end();
        if let Some(stripped) = line.strip_suffix('\\') {
            current.push_str(stripped);
            current.push(' ');
        } else {
            current.push_str(line);
            out.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

fn expand_source(workspace: &Path, src: &str, out: &mut BTreeSet<PathBuf>) -> Result<()> {
    let has_glob = src.contains(['*', '?', '[']);
    if has_glob {
        let glob = Glob::new(src).with_context(|| format!("bad pattern {:?}", src))?;
        let set = GlobSetBuilder::new().add(glob).build()?;
        for entry in WalkDir::new(workspace).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry.path().strip_prefix(workspace).unwrap_or(entry.path());
            if set.is_match(rel) {
                out.insert(entry.path().to_path_buf());
            }
        }
        return Ok(());
    }

    let path = workspace.join(src);
    if path.is_dir() {
        for entry in WalkDir::new(&path).into_iter().filter_map(|e| e.ok()) {
            if entry.file_type().is_file() {
                out.insert(entry.path().to_path_buf());
            }
        }
    } else {
        // Missing sources still register so their creation shows up as a
        // change.
        out.insert(path);
    }
    Ok(())
}

pub async fn build(
    workspace: &Path,
    artifact: &DockerArtifact,
    image: &str,
    out: &Output,
) -> Result<()> {
    let mut cmd = Command::new("docker");
    cmd.arg("build").arg(workspace);
    cmd.arg("-f").arg(workspace.join(&artifact.dockerfile_path));
    cmd.arg("-t").arg(image);
    for (key, value) in &artifact.build_args {
        cmd.arg("--build-arg").arg(format!("{}={}", key, value));
    }
    proc::run_forwarding(cmd, out).await.context("docker build")
}

/// Content digest of a local image, `sha256:...`.
pub async fn digest(image: &str) -> Result<String> {
    let mut cmd = Command::new("docker");
    cmd.args(["image", "inspect", "--format", "{{.Id}}", image]);
    let stdout = proc::run_capture(cmd).await.context("docker inspect")?;
    let id = String::from_utf8_lossy(&stdout).trim().to_string();
    if id.is_empty() {
        bail!("no digest for image {}", image);
    }
    Ok(id)
}

pub async fn retag(from: &str, to: &str) -> Result<()> {
    let mut cmd = Command::new("docker");
    cmd.args(["tag", from, to]);
    proc::run_capture(cmd).await.context("docker tag")?;
    Ok(())
}

pub async fn push(image: &str, out: &Output) -> Result<()> {
    let mut cmd = Command::new("docker");
    cmd.args(["push", image]);
    proc::run_forwarding(cmd, out).await.context("docker push")
}

/// `docker load` an image tarball and return the loaded reference.
pub async fn load(tarball: &Path) -> Result<String> {
    let mut cmd = Command::new("docker");
    cmd.arg("load").arg("-i").arg(tarball);
    let stdout = proc::run_capture(cmd).await.context("docker load")?;
    let text = String::from_utf8_lossy(&stdout);
    for line in text.lines() {
        if let Some(reference) = line.strip_prefix("Loaded image: ") {
            return Ok(reference.trim().to_string());
        }
    }
    bail!("docker load produced no image reference");
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
    fn parses_copy_and_add_sources() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "Dockerfile", "FROM scratch\nCOPY main.go /app/\nADD web /srv\n");
        write(dir.path(), "main.go", "package main");
        write(dir.path(), "web/index.html", "<html/>");
        write(dir.path(), "web/js/app.js", "//");

        let deps = dependencies(
            dir.path(),
            &DockerArtifact {
                dockerfile_path: "Dockerfile".into(),
                build_args: Default::default(),
            },
        )
        .unwrap();
        assert!(deps.contains(&dir.path().join("Dockerfile")));
        assert!(deps.contains(&dir.path().join("main.go")));
        assert!(deps.contains(&dir.path().join("web/index.html")));
        assert!(deps.contains(&dir.path().join("web/js/app.js")));
    }

    #[test]
    fn expands_globs_and_skips_flags_and_urls() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "Dockerfile",
            "FROM scratch\nCOPY --chown=app *.txt /data/\nADD https://example.com/x /x\n",
        );
        write(dir.path(), "a.txt", "a");
        write(dir.path(), "b.txt", "b");
        write(dir.path(), "c.md", "c");

        let deps = dependencies(
            dir.path(),
            &DockerArtifact {
                dockerfile_path: "Dockerfile".into(),
                build_args: Default::default(),
            },
        )
        .unwrap();
        assert!(deps.contains(&dir.path().join("a.txt")));
        assert!(deps.contains(&dir.path().join("b.txt")));
        assert!(!deps.contains(&dir.path().join("c.md")));
        assert!(!deps.iter().any(|p| p.to_string_lossy().contains("example.com")));
    }

    #[test]
    fn continued_lines_are_joined() {
        let joined = join_continued_lines("COPY a \\\n  b \\\n  /dst\nRUN true\n");
        assert_eq!(joined[0], "COPY a   b   /dst");
        assert_eq!(joined[1], "RUN true");
    }
}
