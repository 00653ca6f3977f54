//! Image reference parsing and relocation.
//!
//! Accepted forms:
//! - `registry.example.com/namespace/repo:tag`
//! - `registry.example.com:5000/repo@sha256:<hex>`
//! - `repo:tag@sha256:<hex>` (tag kept for display, digest used for fetches)
//! - `namespace/repo` and `repo` (Docker Hub, `library/` prefix for the latter)

use std::fmt;

use crate::manifest::split_digest;

pub const DEFAULT_REGISTRY: &str = "docker.io";
const DEFAULT_TAG: &str = "latest";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ImageReference {
    pub fn parse(input: &str) -> Result<Self, String> {
        let input = input.trim();
        if input.is_empty() {
            return Err("empty image reference".to_string());
        }

        let (name, digest) = match input.split_once('@') {
            Some((name, digest)) => {
                split_digest(digest)?;
                (name, Some(digest.to_string()))
            }
            None => (input, None),
        };

        let (name, tag) = split_tag(name);
        if let Some(tag) = tag {
            if tag.is_empty() {
                return Err(format!("empty tag in {input}"));
            }
        }

        let (registry, repository) = split_registry(name);
        if repository.is_empty() {
            return Err(format!("empty repository in {input}"));
        }
        if repository
            .split('/')
            .any(|c| c.is_empty() || c.chars().any(|ch| ch.is_ascii_uppercase()))
        {
            return Err(format!("invalid repository name in {input}"));
        }

        let tag = match (&digest, tag) {
            (_, Some(tag)) => Some(tag.to_string()),
            (None, None) => Some(DEFAULT_TAG.to_string()),
            (Some(_), None) => None,
        };

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Tag or digest used on the manifests endpoint. A digest wins when both
    /// are present.
    pub fn manifest_reference(&self) -> &str {
        self.digest
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or(DEFAULT_TAG)
    }

    /// Base URL of the registry API for this reference.
    pub fn registry_url(&self) -> String {
        registry_url(&self.registry)
    }

    /// Same repository pinned to `digest`, tag dropped.
    pub fn with_digest(&self, digest: &str) -> Self {
        Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: None,
            digest: Some(digest.to_string()),
        }
    }

    /// Moves the repository under `target` (`registry[/prefix]`), keeping
    /// the tag and digest.
    pub fn relocate(&self, target: &str) -> Result<Self, String> {
        let target = target.trim().trim_end_matches('/');
        if target.is_empty() {
            return Err("empty relocation target".to_string());
        }

        let (registry, prefix) = match target.split_once('/') {
            Some((host, prefix)) if looks_like_registry(host) => {
                (host.to_string(), Some(prefix.to_string()))
            }
            Some(_) => (DEFAULT_REGISTRY.to_string(), Some(target.to_string())),
            None if looks_like_registry(target) => (target.to_string(), None),
            None => (DEFAULT_REGISTRY.to_string(), Some(target.to_string())),
        };

        let repository = match prefix {
            Some(prefix) => format!("{prefix}/{}", self.repository),
            None => self.repository.clone(),
        };

        Ok(Self {
            registry,
            repository,
            tag: self.tag.clone(),
            digest: self.digest.clone(),
        })
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

pub fn registry_url(registry: &str) -> String {
    if registry == DEFAULT_REGISTRY {
        return "https://registry-1.docker.io".to_string();
    }

    let host = match registry.strip_prefix('[') {
        Some(rest) => rest.split(']').next().map(|h| format!("[{h}]")).unwrap_or_default(),
        None => registry.split(':').next().unwrap_or(registry).to_string(),
    };
    if matches!(host.as_str(), "localhost" | "127.0.0.1" | "[::1]") {
        format!("http://{registry}")
    } else {
        format!("https://{registry}")
    }
}

fn looks_like_registry(component: &str) -> bool {
    component.contains('.')
        || component.contains(':')
        || component == "localhost"
        || component.starts_with('[')
}

/// Splits off a trailing `:tag`, leaving a `host:port` prefix alone.
fn split_tag(name: &str) -> (&str, Option<&str>) {
    let last_slash = name.rfind('/');
    match name.rfind(':') {
        Some(colon) if last_slash.is_none_or(|slash| colon > slash) => {
            (&name[..colon], Some(&name[colon + 1..]))
        }
        _ => (name, None),
    }
}

fn split_registry(name: &str) -> (String, String) {
    match name.split_once('/') {
        Some((first, rest)) if looks_like_registry(first) => (first.to_string(), rest.to_string()),
        Some(_) => (DEFAULT_REGISTRY.to_string(), name.to_string()),
        None => (DEFAULT_REGISTRY.to_string(), format!("library/{name}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn docker_hub_short_names() {
        let r = ImageReference::parse("ubuntu").unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "library/ubuntu");
        assert_eq!(r.tag.as_deref(), Some("latest"));

        let r = ImageReference::parse("deislabs/example:v1").unwrap();
        assert_eq!(r.repository, "deislabs/example");
        assert_eq!(r.manifest_reference(), "v1");
    }

    #[test]
    fn registry_with_port_and_digest() {
        let r = ImageReference::parse(&format!("localhost:5000/app@{DIGEST}")).unwrap();
        assert_eq!(r.registry, "localhost:5000");
        assert_eq!(r.repository, "app");
        assert_eq!(r.tag, None);
        assert_eq!(r.manifest_reference(), DIGEST);
        assert_eq!(r.registry_url(), "http://localhost:5000");
    }

    #[test]
    fn tag_and_digest_together() {
        let r = ImageReference::parse(&format!("ghcr.io/org/app:1.0@{DIGEST}")).unwrap();
        assert_eq!(r.tag.as_deref(), Some("1.0"));
        assert_eq!(r.manifest_reference(), DIGEST);
        assert_eq!(r.to_string(), format!("ghcr.io/org/app:1.0@{DIGEST}"));
    }

    #[test]
    fn rejects_malformed_references() {
        assert!(ImageReference::parse("").is_err());
        assert!(ImageReference::parse("app@sha256:abc").is_err());
        assert!(ImageReference::parse("ghcr.io/").is_err());
        assert!(ImageReference::parse("Upper/case").is_err());
        assert!(ImageReference::parse("app:").is_err());
    }

    #[test]
    fn registry_urls() {
        assert_eq!(registry_url("docker.io"), "https://registry-1.docker.io");
        assert_eq!(registry_url("127.0.0.1:8080"), "http://127.0.0.1:8080");
        assert_eq!(registry_url("[::1]:5000"), "http://[::1]:5000");
        assert_eq!(registry_url("ghcr.io"), "https://ghcr.io");
    }

    #[test]
    fn relocation_keeps_original_repository_path() {
        let r = ImageReference::parse("docker.io/library/nginx:1.25").unwrap();

        let moved = r.relocate("registry.example.com/mirror").unwrap();
        assert_eq!(moved.to_string(), "registry.example.com/mirror/library/nginx:1.25");

        let moved = r.relocate("localhost:5000").unwrap();
        assert_eq!(moved.to_string(), "localhost:5000/library/nginx:1.25");

        assert_eq!(r.to_string(), "docker.io/library/nginx:1.25");
        assert!(r.relocate(" ").is_err());
    }
}
