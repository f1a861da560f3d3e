//! Tag generation policies. Taggers are pure beyond construction:
//! `(workspace, image_name, digest) -> fully qualified tag`.

use std::path::Path;

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};

use skiff_core::{Labels, Tagger, LABEL_PREFIX};

fn policy_labels(name: &str) -> Labels {
    let mut labels = Labels::new();
    labels.insert(format!("{}/tag-policy", LABEL_PREFIX), name.to_string());
    labels
}

/// Tags with the image's content digest.
pub struct ChecksumTagger;

impl Tagger for ChecksumTagger {
    fn generate(&self, _workspace: &Path, image_name: &str, digest: &str) -> Result<String> {
        let checksum = digest.trim_start_matches("sha256:");
        if checksum.is_empty() {
            return Ok(format!("{}:latest", image_name));
        }
        Ok(format!("{}:{}", image_name, checksum))
    }

    fn labels(&self) -> Labels {
        policy_labels("sha256")
    }
}

/// Tags with the current git commit of the workspace; a dirty tree appends a
/// suffix derived from the status output so two dirty states do not collide.
pub struct GitCommitTagger;

impl Tagger for GitCommitTagger {
    fn generate(&self, workspace: &Path, image_name: &str, _digest: &str) -> Result<String> {
        let commit = git_output(workspace, &["rev-parse", "--short", "HEAD"])
            .context("reading git commit")?;
        let status = git_output(workspace, &["status", "--porcelain"])
            .context("reading git status")?;
        if status.is_empty() {
            Ok(format!("{}:{}", image_name, commit))
        } else {
            let mut hasher = Sha256::new();
            hasher.update(status.as_bytes());
            let state = format!("{:x}", hasher.finalize());
            Ok(format!("{}:{}-dirty-{}", image_name, commit, &state[..8]))
        }
    }

    fn labels(&self) -> Labels {
        policy_labels("git-commit")
    }
}

fn git_output(workspace: &Path, args: &[&str]) -> Result<String> {
    let output = std::process::Command::new("git")
        .arg("-C")
        .arg(workspace)
        .args(args)
        .output()
        .context("running git")?;
    if !output.status.success() {
        bail!(
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Tags with the wall clock at build time.
pub struct DateTimeTagger {
    format: String,
    utc: bool,
}

impl DateTimeTagger {
    /// `timezone` accepts "UTC" or "Local" (the default).
    pub fn new(format: Option<String>, timezone: Option<String>) -> Result<Self> {
        let utc = match timezone.as_deref() {
            None | Some("Local") => false,
            Some("UTC") => true,
            Some(other) => bail!("unsupported timezone {:?} (use UTC or Local)", other),
        };
        Ok(Self {
            format: format.unwrap_or_else(|| "%Y-%m-%d_%H-%M-%S".to_string()),
            utc,
        })
    }
}

impl Tagger for DateTimeTagger {
    fn generate(&self, _workspace: &Path, image_name: &str, _digest: &str) -> Result<String> {
        let stamp = if self.utc {
            chrono::Utc::now().format(&self.format).to_string()
        } else {
            chrono::Local::now().format(&self.format).to_string()
        };
        Ok(format!("{}:{}", image_name, stamp))
    }

    fn labels(&self) -> Labels {
        policy_labels("date-time")
    }
}

/// Tags from a user template over the process environment. `{{IMAGE_NAME}}`
/// and `{{DIGEST}}` are built in; every other `{{NAME}}` resolves to an
/// environment variable.
pub struct EnvTemplateTagger {
    template: String,
}

impl EnvTemplateTagger {
    pub fn new(template: &str) -> Result<Self> {
        // Fail at construction, not at first build.
        expand(template, "image", "digest", |_| Ok(String::new()))
            .context("validating tag template")?;
        Ok(Self {
            template: template.to_string(),
        })
    }
}

impl Tagger for EnvTemplateTagger {
    fn generate(&self, _workspace: &Path, image_name: &str, digest: &str) -> Result<String> {
        expand(&self.template, image_name, digest, |name| {
            std::env::var(name).with_context(|| format!("tag template variable {} is not set", name))
        })
    }

    fn labels(&self) -> Labels {
        policy_labels("env-template")
    }
}

fn expand(
    template: &str,
    image_name: &str,
    digest: &str,
    lookup: impl Fn(&str) -> Result<String>,
) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            bail!("unterminated {{{{ in tag template");
        };
        let name = after[..end].trim();
        match name {
            "IMAGE_NAME" => out.push_str(image_name),
            "DIGEST" => out.push_str(digest),
            _ => out.push_str(&lookup(name)?),
        }
        rest = &after[end + 2..];
    }
    if rest.contains("}}") {
        bail!("unbalanced }}}} in tag template");
    }
    out.push_str(rest);
    Ok(out)
}

/// A literal tag, forced from the command line. Overrides the configured
/// policy.
pub struct CustomTagger {
    tag: String,
}

impl CustomTagger {
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
        }
    }
}

impl Tagger for CustomTagger {
    fn generate(&self, _workspace: &Path, image_name: &str, _digest: &str) -> Result<String> {
        Ok(format!("{}:{}", image_name, self.tag))
    }

    fn labels(&self) -> Labels {
        policy_labels("custom")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn ws() -> PathBuf {
        PathBuf::from(".")
    }

    #[test]
    fn checksum_strips_digest_prefix() {
        let tag = ChecksumTagger.generate(&ws(), "myapp", "sha256:abc123").unwrap();
        assert_eq!(tag, "myapp:abc123");
    }

    #[test]
    fn checksum_without_digest_falls_back_to_latest() {
        let tag = ChecksumTagger.generate(&ws(), "myapp", "").unwrap();
        assert_eq!(tag, "myapp:latest");
    }

    #[test]
    fn custom_is_literal() {
        let tag = CustomTagger::new("v42").generate(&ws(), "myapp", "ignored").unwrap();
        assert_eq!(tag, "myapp:v42");
    }

    #[test]
    fn env_template_expands_builtins_and_env() {
        std::env::set_var("SKIFF_TAG_TEST_SUFFIX", "blue");
        let tagger = EnvTemplateTagger::new("{{IMAGE_NAME}}:{{SKIFF_TAG_TEST_SUFFIX}}").unwrap();
        let tag = tagger.generate(&ws(), "myapp", "").unwrap();
        assert_eq!(tag, "myapp:blue");
    }

    #[test]
    fn env_template_missing_var_fails_at_generate() {
        let tagger = EnvTemplateTagger::new("{{IMAGE_NAME}}:{{SKIFF_TAG_TEST_UNSET}}").unwrap();
        assert!(tagger.generate(&ws(), "myapp", "").is_err());
    }

    #[test]
    fn env_template_rejects_unbalanced_braces() {
        assert!(EnvTemplateTagger::new("{{IMAGE_NAME").is_err());
        assert!(EnvTemplateTagger::new("IMAGE}}").is_err());
    }

    #[test]
    fn date_time_uses_format() {
        let tagger = DateTimeTagger::new(Some("%Y".to_string()), Some("UTC".to_string())).unwrap();
        let tag = tagger.generate(&ws(), "myapp", "").unwrap();
        let year = tag.strip_prefix("myapp:").unwrap();
        assert_eq!(year.len(), 4);
        assert!(year.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn date_time_rejects_unknown_timezone() {
        assert!(DateTimeTagger::new(None, Some("Mars/Olympus".to_string())).is_err());
    }
}
