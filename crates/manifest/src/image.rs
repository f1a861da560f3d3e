//! Container image reference parsing.

use anyhow::{bail, Result};

/// Parsed form of an image reference string.
///
/// `base_name` is the repository path including any registry prefix, without
/// tag or digest. A reference is fully qualified when it pins a digest or an
/// explicit non-`latest` tag; such references are never rewritten.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: Option<String>,
    pub base_name: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
    pub fully_qualified: bool,
}

pub fn parse(image: &str) -> Result<ImageReference> {
    if image.is_empty() || image.contains(char::is_whitespace) {
        bail!("invalid image reference: {:?}", image);
    }

    let (remainder, digest) = match image.split_once('@') {
        Some((r, d)) => {
            if !d.starts_with("sha256:") {
                bail!("invalid digest in image reference: {:?}", image);
            }
            (r, Some(d.to_string()))
        }
        None => (image, None),
    };

    // A ':' after the last '/' separates the tag; before it, it belongs to a
    // registry host:port.
    let slash = remainder.rfind('/');
    let tag_colon = match remainder.rfind(':') {
        Some(i) if slash.map(|s| i > s).unwrap_or(true) => Some(i),
        _ => None,
    };
    let (base_name, tag) = match tag_colon {
        Some(i) => (
            remainder[..i].to_string(),
            Some(remainder[i + 1..].to_string()),
        ),
        None => (remainder.to_string(), None),
    };
    if base_name.is_empty() || tag.as_deref() == Some("") {
        bail!("invalid image reference: {:?}", image);
    }

    // The first path component is a registry when it looks like a host.
    let registry = match base_name.split_once('/') {
        Some((head, _)) if head.contains('.') || head.contains(':') || head == "localhost" => {
            Some(head.to_string())
        }
        _ => None,
    };

    let fully_qualified =
        digest.is_some() || tag.as_deref().map(|t| t != "latest").unwrap_or(false);

    Ok(ImageReference {
        registry,
        base_name,
        tag,
        digest,
        fully_qualified,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_name() {
        let r = parse("myapp").unwrap();
        assert_eq!(r.base_name, "myapp");
        assert_eq!(r.registry, None);
        assert_eq!(r.tag, None);
        assert_eq!(r.digest, None);
        assert!(!r.fully_qualified);
    }

    #[test]
    fn latest_tag_is_not_fully_qualified() {
        let r = parse("myapp:latest").unwrap();
        assert_eq!(r.base_name, "myapp");
        assert_eq!(r.tag.as_deref(), Some("latest"));
        assert!(!r.fully_qualified);
    }

    #[test]
    fn explicit_tag_is_fully_qualified() {
        let r = parse("gcr.io/project/app:v1.2").unwrap();
        assert_eq!(r.base_name, "gcr.io/project/app");
        assert_eq!(r.registry.as_deref(), Some("gcr.io"));
        assert_eq!(r.tag.as_deref(), Some("v1.2"));
        assert!(r.fully_qualified);
    }

    #[test]
    fn digest_is_fully_qualified() {
        let r = parse("registry/other@sha256:abc123").unwrap();
        assert_eq!(r.base_name, "registry/other");
        assert_eq!(r.digest.as_deref(), Some("sha256:abc123"));
        assert!(r.fully_qualified);
    }

    #[test]
    fn registry_with_port_keeps_tag_separate() {
        let r = parse("localhost:5000/app:dev").unwrap();
        assert_eq!(r.base_name, "localhost:5000/app");
        assert_eq!(r.registry.as_deref(), Some("localhost:5000"));
        assert_eq!(r.tag.as_deref(), Some("dev"));
        assert!(r.fully_qualified);
    }

    #[test]
    fn port_without_tag_is_not_a_tag() {
        let r = parse("localhost:5000/app").unwrap();
        assert_eq!(r.base_name, "localhost:5000/app");
        assert_eq!(r.tag, None);
        assert!(!r.fully_qualified);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse("").is_err());
        assert!(parse("has space").is_err());
        assert!(parse("app:").is_err());
        assert!(parse("app@md5:zz").is_err());
    }
}
