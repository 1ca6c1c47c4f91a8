//! Registry retrieval: manifests, indexes, configs and labels.

use std::collections::HashMap;

use kiln_common::{KilnError, KilnResult};
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use crate::reference::ImageReference;

const ACCEPT_MANIFEST: &str = "application/vnd.oci.image.index.v1+json, \
     application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.oci.image.manifest.v1+json, \
     application/vnd.docker.distribution.manifest.v2+json";

/// Registry client for image metadata retrieval.
pub struct RegistryClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    // Some registries use access_token
    access_token: Option<String>,
}

/// Content descriptor.
#[derive(Debug, Clone, Deserialize)]
pub struct Descriptor {
    /// Media type.
    #[serde(rename = "mediaType", default)]
    pub media_type: Option<String>,
    /// Content digest.
    pub digest: String,
    /// Content size.
    #[serde(default)]
    pub size: u64,
}

/// Platform of one entry in an image index.
#[derive(Debug, Clone, Deserialize)]
pub struct EntryPlatform {
    /// Operating system.
    #[serde(default)]
    pub os: String,
    /// CPU architecture.
    #[serde(default)]
    pub architecture: String,
    /// Architecture variant, when present.
    #[serde(default)]
    pub variant: Option<String>,
}

/// One per-platform manifest referenced by an image index.
#[derive(Debug, Clone, Deserialize)]
pub struct IndexEntry {
    /// Media type.
    #[serde(rename = "mediaType", default)]
    pub media_type: Option<String>,
    /// Manifest digest.
    pub digest: String,
    /// Target platform of the referenced manifest.
    #[serde(default)]
    pub platform: Option<EntryPlatform>,
}

/// A multi-architecture image index.
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestIndex {
    /// Per-platform manifests.
    pub manifests: Vec<IndexEntry>,
}

/// A single-architecture image manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct ImageManifest {
    /// Config descriptor.
    pub config: Descriptor,
    /// Layer descriptors.
    #[serde(default)]
    pub layers: Vec<Descriptor>,
}

/// Either an index or a single-architecture manifest.
#[derive(Debug, Clone)]
pub enum Manifest {
    /// Multi-architecture index.
    Index(ManifestIndex),
    /// Single-architecture manifest.
    Image(ImageManifest),
}

/// Image config file (the `config` blob of a manifest).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageConfigFile {
    /// CPU architecture.
    #[serde(default)]
    pub architecture: String,
    /// Operating system.
    #[serde(default)]
    pub os: String,
    /// Runtime configuration, including labels.
    #[serde(default)]
    pub config: RuntimeConfig,
}

/// Runtime configuration embedded in an image config.
///
/// The same shape appears in registry config blobs and in daemon inspect
/// responses (both current `Config` and legacy `ContainerConfig`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuntimeConfig {
    /// Image labels.
    #[serde(rename = "Labels", default)]
    pub labels: Option<HashMap<String, String>>,
    /// Environment assignments.
    #[serde(rename = "Env", default)]
    pub env: Option<Vec<String>>,
    /// Entrypoint.
    #[serde(rename = "Entrypoint", default)]
    pub entrypoint: Option<Vec<String>>,
}

/// `os/architecture` of the invoking process, in registry vocabulary.
#[must_use]
pub fn host_platform() -> String {
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    };
    format!("{}/{}", std::env::consts::OS, arch)
}

fn entry_matches(entry: &IndexEntry, platform: &str) -> bool {
    entry.platform.as_ref().is_some_and(|p| {
        format!("{}/{}", p.os, p.architecture).to_lowercase() == platform
    })
}

impl RegistryClient {
    /// Create a client against a registry base URL.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            token: None,
        }
    }

    /// Create a client for the registry a reference points at.
    #[must_use]
    pub fn for_reference(reference: &ImageReference) -> Self {
        Self::new(reference.registry_url())
    }

    /// Authenticated GET with a single token-challenge retry.
    async fn get_authed(
        &mut self,
        repository: &str,
        url: &str,
        accept: Option<&str>,
    ) -> KilnResult<reqwest::Response> {
        let mut challenged = false;
        loop {
            let mut request = self.client.get(url);
            if let Some(accept) = accept {
                request = request.header("Accept", accept);
            }
            if let Some(token) = &self.token {
                request = request.bearer_auth(token);
            }
            let response = request.send().await.map_err(|e| KilnError::Registry {
                message: format!("request to {} failed: {}", url, e),
            })?;

            if response.status() == StatusCode::UNAUTHORIZED && !challenged {
                challenged = true;
                self.authenticate(repository, &response).await?;
                continue;
            }
            if !response.status().is_success() {
                return Err(KilnError::Registry {
                    message: format!("registry returned {} for {}", response.status(), url),
                });
            }
            return Ok(response);
        }
    }

    /// Fetch the manifest (or index) stored under `version` (a tag or digest).
    pub async fn fetch_manifest(
        &mut self,
        reference: &ImageReference,
        version: &str,
    ) -> KilnResult<Manifest> {
        let url = format!(
            "{}/v2/{}/manifests/{}",
            self.base_url, reference.repository, version
        );
        tracing::debug!(url = %url, "Fetching manifest");

        let text = self
            .get_authed(&reference.repository, &url, Some(ACCEPT_MANIFEST))
            .await?
            .text()
            .await
            .map_err(|e| KilnError::Registry {
                message: format!("cannot read manifest body: {}", e),
            })?;

        let value: serde_json::Value = serde_json::from_str(&text)?;
        if value.get("manifests").is_some() {
            Ok(Manifest::Index(serde_json::from_value(value)?))
        } else {
            Ok(Manifest::Image(serde_json::from_value(value)?))
        }
    }

    /// Fetch the config blob a manifest points at.
    pub async fn fetch_config(
        &mut self,
        reference: &ImageReference,
        manifest: &ImageManifest,
    ) -> KilnResult<ImageConfigFile> {
        let url = format!(
            "{}/v2/{}/blobs/{}",
            self.base_url, reference.repository, manifest.config.digest
        );
        tracing::debug!(url = %url, "Fetching image config");

        let text = self
            .get_authed(&reference.repository, &url, None)
            .await?
            .text()
            .await
            .map_err(|e| KilnError::Registry {
                message: format!("cannot read config body: {}", e),
            })?;

        Ok(serde_json::from_str(&text)?)
    }

    /// Labels of the image a reference points at.
    ///
    /// An index is narrowed to the host platform's entry (or the first entry
    /// when no platform matches) before the config is read. An image without
    /// labels yields an empty map.
    pub async fn image_labels(
        &mut self,
        reference: &ImageReference,
    ) -> KilnResult<HashMap<String, String>> {
        let manifest = self
            .fetch_manifest(reference, reference.reference_str())
            .await?;

        let image = match manifest {
            Manifest::Image(image) => image,
            Manifest::Index(index) => {
                let host = host_platform();
                let entry = index
                    .manifests
                    .iter()
                    .find(|e| entry_matches(e, &host))
                    .or_else(|| index.manifests.first())
                    .ok_or_else(|| KilnError::Registry {
                        message: format!("image index for {} is empty", reference),
                    })?;
                match self.fetch_manifest(reference, &entry.digest).await? {
                    Manifest::Image(image) => image,
                    Manifest::Index(_) => {
                        return Err(KilnError::Registry {
                            message: format!("nested image index in {}", reference),
                        });
                    }
                }
            }
        };

        let config = self.fetch_config(reference, &image).await?;
        Ok(config.config.labels.unwrap_or_default())
    }

    /// Narrow a reference to the manifest matching `platform`
    /// (lower-cased `os/architecture`).
    ///
    /// A single-architecture image resolves to itself when its config matches
    /// the requested platform. No match is fatal.
    pub async fn resolve_platform(
        &mut self,
        reference: &ImageReference,
        platform: &str,
    ) -> KilnResult<ImageReference> {
        match self
            .fetch_manifest(reference, reference.reference_str())
            .await?
        {
            Manifest::Index(index) => index
                .manifests
                .iter()
                .find(|e| entry_matches(e, platform))
                .map(|e| reference.with_digest(&e.digest))
                .ok_or_else(|| KilnError::Registry {
                    message: format!("no manifest for platform {:?} in {}", platform, reference),
                }),
            Manifest::Image(image) => {
                let config = self.fetch_config(reference, &image).await?;
                let actual = format!("{}/{}", config.os, config.architecture).to_lowercase();
                if actual == platform {
                    Ok(reference.clone())
                } else {
                    Err(KilnError::Registry {
                        message: format!(
                            "image {} is {}, not requested platform {:?}",
                            reference, actual, platform
                        ),
                    })
                }
            }
        }
    }

    async fn authenticate(
        &mut self,
        repository: &str,
        response: &reqwest::Response,
    ) -> KilnResult<()> {
        let auth_header = response
            .headers()
            .get("Www-Authenticate")
            .ok_or_else(|| KilnError::Registry {
                message: "missing Www-Authenticate header".to_string(),
            })?
            .to_str()
            .map_err(|_| KilnError::Registry {
                message: "invalid Www-Authenticate header".to_string(),
            })?;

        tracing::debug!(header = auth_header, "Authenticating");

        // Parse Bearer realm="...",service="...",scope="..."
        let mut params = HashMap::new();
        for part in auth_header.trim_start_matches("Bearer ").split(',') {
            if let Some((key, value)) = part.split_once('=') {
                params.insert(key.trim(), value.trim().trim_matches('"'));
            }
        }

        let realm = params.get("realm").ok_or_else(|| KilnError::Registry {
            message: "missing realm in Www-Authenticate".to_string(),
        })?;
        let service = params.get("service").ok_or_else(|| KilnError::Registry {
            message: "missing service in Www-Authenticate".to_string(),
        })?;
        let scope = params
            .get("scope")
            .map(|s| (*s).to_string())
            .unwrap_or_else(|| format!("repository:{}:pull", repository));

        let url = format!("{}?service={}&scope={}", realm, service, scope);
        tracing::debug!(url = %url, "Requesting token");

        let token_resp: TokenResponse = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| KilnError::Registry {
                message: format!("failed to request token: {}", e),
            })?
            .json()
            .await
            .map_err(|e| KilnError::Registry {
                message: format!("failed to parse token response: {}", e),
            })?;

        self.token = Some(token_resp.token.or(token_resp.access_token).ok_or_else(
            || KilnError::Registry {
                message: "no token in response".to_string(),
            },
        )?);

        Ok(())
    }
}
