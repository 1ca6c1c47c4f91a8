//! Image reference parsing.

use std::str::FromStr;

use kiln_common::{KilnError, KilnResult};

/// A parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry hostname.
    pub registry: String,
    /// Repository name.
    pub repository: String,
    /// Tag or digest.
    pub reference: ImageTag,
}

/// Image tag or digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageTag {
    /// A tag (e.g., "latest"). Tags are mutable.
    Tag(String),
    /// A digest (e.g., "sha256:abc123..."). Digests are immutable.
    Digest(String),
}

impl ImageReference {
    /// Default registry.
    pub const DEFAULT_REGISTRY: &'static str = "docker.io";
    /// Default tag.
    pub const DEFAULT_TAG: &'static str = "latest";

    /// Parse an image reference string.
    ///
    /// Examples:
    /// - `alpine` -> docker.io/library/alpine:latest
    /// - `myuser/myapp:v2` -> docker.io/myuser/myapp:v2
    /// - `ghcr.io/org/app@sha256:...` -> ghcr.io/org/app@sha256:...
    pub fn parse(reference: &str) -> KilnResult<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(KilnError::InvalidReference {
                reference: reference.to_string(),
            });
        }

        let (name, tag) = if let Some(idx) = reference.find('@') {
            let (name, digest) = reference.split_at(idx);
            (name, ImageTag::Digest(digest[1..].to_string()))
        } else if let Some(idx) = reference.rfind(':') {
            // A ':' followed by a '/' belongs to a registry port, not a tag.
            let potential_tag = &reference[idx + 1..];
            if potential_tag.contains('/') {
                (reference, ImageTag::Tag(Self::DEFAULT_TAG.to_string()))
            } else {
                let (name, tag) = reference.split_at(idx);
                (name, ImageTag::Tag(tag[1..].to_string()))
            }
        } else {
            (reference, ImageTag::Tag(Self::DEFAULT_TAG.to_string()))
        };

        if name.is_empty() {
            return Err(KilnError::InvalidReference {
                reference: reference.to_string(),
            });
        }

        let (registry, repository) = if let Some(first_slash) = name.find('/') {
            let potential_registry = &name[..first_slash];
            if potential_registry.contains('.')
                || potential_registry.contains(':')
                || potential_registry == "localhost"
            {
                (
                    potential_registry.to_string(),
                    name[first_slash + 1..].to_string(),
                )
            } else {
                // A Docker Hub user/repo.
                (Self::DEFAULT_REGISTRY.to_string(), name.to_string())
            }
        } else {
            // Official image (e.g., "alpine" -> "library/alpine").
            (
                Self::DEFAULT_REGISTRY.to_string(),
                format!("library/{}", name),
            )
        };

        Ok(Self {
            registry,
            repository,
            reference: tag,
        })
    }

    /// Whether this reference pins by mutable tag rather than digest.
    #[must_use]
    pub fn is_tag(&self) -> bool {
        matches!(self.reference, ImageTag::Tag(_))
    }

    /// The tag or digest string, without its separator.
    #[must_use]
    pub fn reference_str(&self) -> &str {
        match &self.reference {
            ImageTag::Tag(t) => t,
            ImageTag::Digest(d) => d,
        }
    }

    /// Registry and repository without tag or digest.
    #[must_use]
    pub fn name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// A child reference pinning the same repository to a digest. Used when
    /// narrowing an image index to one platform's manifest.
    #[must_use]
    pub fn with_digest(&self, digest: &str) -> Self {
        Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            reference: ImageTag::Digest(digest.to_string()),
        }
    }

    /// Base URL of the registry's HTTP API.
    #[must_use]
    pub fn registry_url(&self) -> String {
        if self.registry == Self::DEFAULT_REGISTRY {
            // Docker Hub's API lives on a different host than its short name.
            "https://registry-1.docker.io".to_string()
        } else {
            format!("https://{}", self.registry)
        }
    }

    /// Get the full reference string.
    #[must_use]
    pub fn full_reference(&self) -> String {
        let tag = match &self.reference {
            ImageTag::Tag(t) => format!(":{}", t),
            ImageTag::Digest(d) => format!("@{}", d),
        };
        format!("{}/{}{}", self.registry, self.repository, tag)
    }
}

impl FromStr for ImageReference {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple() {
        let ref_ = ImageReference::parse("alpine").unwrap();
        assert_eq!(ref_.registry, "docker.io");
        assert_eq!(ref_.repository, "library/alpine");
        assert!(matches!(ref_.reference, ImageTag::Tag(t) if t == "latest"));
    }

    #[test]
    fn parse_with_tag() {
        let ref_ = ImageReference::parse("registry.access.redhat.com/ubi8/python-39:1").unwrap();
        assert_eq!(ref_.registry, "registry.access.redhat.com");
        assert_eq!(ref_.repository, "ubi8/python-39");
        assert!(ref_.is_tag());
    }

    #[test]
    fn parse_with_digest() {
        let ref_ = ImageReference::parse("ghcr.io/org/app@sha256:deadbeef").unwrap();
        assert_eq!(ref_.registry, "ghcr.io");
        assert_eq!(ref_.repository, "org/app");
        assert!(!ref_.is_tag());
        assert_eq!(ref_.reference_str(), "sha256:deadbeef");
    }

    #[test]
    fn parse_registry_with_port() {
        let ref_ = ImageReference::parse("localhost:5000/app").unwrap();
        assert_eq!(ref_.registry, "localhost:5000");
        assert_eq!(ref_.repository, "app");
        assert!(matches!(ref_.reference, ImageTag::Tag(t) if t == "latest"));
    }

    #[test]
    fn with_digest_narrows() {
        let ref_ = ImageReference::parse("ghcr.io/org/app:v1").unwrap();
        let child = ref_.with_digest("sha256:deadbeef");
        assert_eq!(child.full_reference(), "ghcr.io/org/app@sha256:deadbeef");
    }

    #[test]
    fn parse_empty_is_error() {
        assert!(ImageReference::parse("").is_err());
        assert!(ImageReference::parse(":tag").is_err());
    }
}
