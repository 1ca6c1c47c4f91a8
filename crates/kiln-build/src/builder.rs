//! Build pipeline orchestration.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use kiln_common::{EnvVar, KilnError, KilnResult, interpolate};
use kiln_image::daemon::{BuildImageOptions, DaemonClient, ImageInspect};
use kiln_image::reference::ImageReference;
use kiln_image::registry::RegistryClient;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::archive;
use crate::cachemount;
use crate::config::{AssembleConfig, DEFAULT_SCRIPTS_URL};
use crate::ignore::IgnoreLink;
use crate::progress::{self, ProgressSink};
use crate::scripts;
use crate::strategy::AssembleStrategy;

/// Default Node.js builder, shared by the node, nodejs and typescript
/// runtimes.
pub const DEFAULT_NODE_BUILDER: &str = "registry.access.redhat.com/ubi8/nodejs-20-minimal";
/// Default Quarkus builder.
pub const DEFAULT_QUARKUS_BUILDER: &str = "registry.access.redhat.com/ubi8/openjdk-21";
/// Default Python builder.
pub const DEFAULT_PYTHON_BUILDER: &str = "registry.access.redhat.com/ubi8/python-39";
/// Default Go builder.
pub const DEFAULT_GO_BUILDER: &str = "registry.access.redhat.com/ubi8/go-toolset";

/// Default builder images indexed by runtime identifier. Built once at
/// startup, read-only thereafter.
pub static DEFAULT_BUILDER_IMAGES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("go", DEFAULT_GO_BUILDER),
        ("node", DEFAULT_NODE_BUILDER),
        ("nodejs", DEFAULT_NODE_BUILDER),
        ("python", DEFAULT_PYTHON_BUILDER),
        ("quarkus", DEFAULT_QUARKUS_BUILDER),
        ("typescript", DEFAULT_NODE_BUILDER),
    ])
});

/// Whether an image is one of the static defaults.
#[must_use]
pub fn is_default_builder_image(image: &str) -> bool {
    DEFAULT_BUILDER_IMAGES.values().any(|v| *v == image)
}

/// A build target platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    /// Operating system.
    pub os: String,
    /// CPU architecture.
    pub architecture: String,
}

impl Platform {
    /// Parse an `os/architecture` pair.
    pub fn parse(spec: &str) -> KilnResult<Self> {
        match spec.split_once('/') {
            Some((os, arch)) if !os.is_empty() && !arch.is_empty() && !arch.contains('/') => {
                Ok(Self {
                    os: os.to_string(),
                    architecture: arch.to_string(),
                })
            }
            _ => Err(KilnError::Config {
                message: format!("invalid platform {:?}, expected os/architecture", spec),
            }),
        }
    }

    /// Lower-cased, slash-joined form used against image indexes.
    #[must_use]
    pub fn pair(&self) -> String {
        format!("{}/{}", self.os, self.architecture).to_lowercase()
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.pair())
    }
}

/// One build request. Immutable input, created by the caller.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    /// Source tree root.
    pub source_root: PathBuf,
    /// Declared runtime identifier (e.g. "python").
    pub runtime: String,
    /// Tag for the output image.
    pub image: String,
    /// Explicit builder image, overriding the runtime default.
    pub builder_image: Option<String>,
    /// Requested target platforms. At most one is supported.
    pub platforms: Vec<Platform>,
    /// Build-time environment assignments.
    pub build_envs: Vec<EnvVar>,
}

/// The daemon capabilities the pipeline consumes: local image inspection and
/// build submission. Injected so tests can substitute a double.
#[async_trait]
pub trait ImageDaemon: Send + Sync {
    /// Inspect a locally stored image; a missing image is
    /// [`KilnError::ImageNotFound`].
    async fn inspect_image(&self, reference: &str) -> KilnResult<ImageInspect>;

    /// Submit a build context stream; returns the progress byte stream.
    async fn build_image(
        &self,
        context: BoxStream<'static, KilnResult<Bytes>>,
        options: &BuildImageOptions,
    ) -> KilnResult<BoxStream<'static, KilnResult<Bytes>>>;
}

#[async_trait]
impl ImageDaemon for DaemonClient {
    async fn inspect_image(&self, reference: &str) -> KilnResult<ImageInspect> {
        DaemonClient::inspect_image(self, reference).await
    }

    async fn build_image(
        &self,
        context: BoxStream<'static, KilnResult<Bytes>>,
        options: &BuildImageOptions,
    ) -> KilnResult<BoxStream<'static, KilnResult<Bytes>>> {
        let body = reqwest::Body::wrap_stream(context);
        let response = DaemonClient::build_image(self, body, options).await?;
        Ok(response
            .bytes_stream()
            .map_err(|e| KilnError::Daemon {
                message: format!("progress stream failed: {}", e),
            })
            .boxed())
    }
}

/// Resolve the concrete builder image for a request.
///
/// An explicit override is used verbatim; otherwise the runtime's static
/// default applies. Exactly one requested platform narrows the reference
/// within the image's index; more than one is rejected before any network
/// call; zero passes the reference through unchanged.
pub async fn resolve_builder_image(request: &BuildRequest) -> KilnResult<String> {
    if request.platforms.len() > 1 {
        return Err(KilnError::Config {
            message: "only a single target platform is supported".to_string(),
        });
    }

    let image = match &request.builder_image {
        Some(image) => image.clone(),
        None => {
            if request.runtime.is_empty() {
                return Err(KilnError::Config {
                    message: "runtime required to choose a default builder image".to_string(),
                });
            }
            DEFAULT_BUILDER_IMAGES
                .get(request.runtime.as_str())
                .map(ToString::to_string)
                .ok_or_else(|| KilnError::Config {
                    message: format!(
                        "no default builder image for {:?} runtime",
                        request.runtime
                    ),
                })?
        }
    };

    if let [platform] = request.platforms.as_slice() {
        let reference = ImageReference::parse(&image)?;
        let mut registry = RegistryClient::for_reference(&reference);
        let narrowed = registry
            .resolve_platform(&reference, &platform.pair())
            .await
            .map_err(|e| KilnError::Registry {
                message: format!(
                    "cannot get platform image reference for {:?}: {}",
                    platform.pair(),
                    e
                ),
            })?;
        return Ok(narrowed.full_reference());
    }

    Ok(image)
}

/// Builds function images through the assemble engine.
pub struct Builder {
    verbose: bool,
    strategy: Arc<dyn AssembleStrategy>,
    daemon: Arc<dyn ImageDaemon>,
}

impl Builder {
    /// Create a builder with injected engine and daemon capabilities.
    pub fn new(strategy: Arc<dyn AssembleStrategy>, daemon: Arc<dyn ImageDaemon>) -> Self {
        Self {
            verbose: false,
            strategy,
            daemon,
        }
    }

    /// Toggle verbose output.
    #[must_use]
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Run the full pipeline for one request.
    pub async fn build(&self, request: &BuildRequest) -> KilnResult<()> {
        let builder_image = resolve_builder_image(request).await?;
        tracing::info!(image = %request.image, builder = %builder_image, "Building");

        // Lives for the whole build; the engine reads the linked file.
        let _ignore_link = IgnoreLink::acquire(&request.source_root)?;

        let tmp = tempfile::Builder::new().prefix("kiln-build").tempdir()?;

        // Label discovery must precede the engine run: the discovered URL is
        // part of the engine's configuration.
        let script_url = scripts::script_url(self.daemon.as_ref(), &builder_image).await?;

        let mut config = AssembleConfig::new(
            &request.source_root,
            request.image.as_str(),
            builder_image.as_str(),
            tmp.path().join("Dockerfile"),
        );
        config.quiet = !self.verbose;
        if !script_url.is_empty() && script_url != DEFAULT_SCRIPTS_URL {
            // The sentinel is a no-op fallback; copying it would shadow
            // script overrides shipped in the source tree.
            config.scripts_url = Some(script_url);
        }
        config.environment = interpolate(&request.build_envs)?;

        let violations = config.validate();
        if !violations.is_empty() {
            for violation in &violations {
                tracing::error!("{violation}");
            }
            return Err(KilnError::Config {
                message: format!(
                    "unable to build: {} configuration error(s)",
                    violations.len()
                ),
            });
        }

        let outcome = self.strategy.build(&config).await?;
        if self.verbose {
            for message in &outcome.messages {
                eprintln!("{message}");
            }
        }

        if config.as_dockerfile.exists() {
            cachemount::patch_dockerfile(&config.as_dockerfile, &config.source.path)?;
        }

        let exclude = Regex::new(&config.exclude_pattern).map_err(|e| KilnError::Config {
            message: format!("invalid exclusion pattern: {}", e),
        })?;
        let context = archive::tar_stream(tmp.path().to_path_buf(), exclude);

        let options = BuildImageOptions::new(&request.image);
        let progress_stream = self.daemon.build_image(context, &options).await?;

        let sink = ProgressSink::for_verbosity(self.verbose);
        progress::relay(progress_stream, sink).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(platforms: Vec<Platform>) -> BuildRequest {
        BuildRequest {
            source_root: PathBuf::from("/src/app"),
            runtime: "python".to_string(),
            image: "example.com/app:latest".to_string(),
            builder_image: None,
            platforms,
            build_envs: Vec::new(),
        }
    }

    #[tokio::test]
    async fn python_runtime_resolves_to_static_default() {
        let image = resolve_builder_image(&request(Vec::new())).await.unwrap();
        assert_eq!(image, DEFAULT_PYTHON_BUILDER);
    }

    #[tokio::test]
    async fn explicit_builder_image_wins() {
        let mut req = request(Vec::new());
        req.builder_image = Some("quay.io/org/custom:1".to_string());
        let image = resolve_builder_image(&req).await.unwrap();
        assert_eq!(image, "quay.io/org/custom:1");
    }

    #[tokio::test]
    async fn multiple_platforms_are_rejected() {
        let req = request(vec![
            Platform::parse("linux/amd64").unwrap(),
            Platform::parse("linux/arm64").unwrap(),
        ]);
        let err = resolve_builder_image(&req).await.unwrap_err();
        assert!(err.to_string().contains("single target platform"));
    }

    #[tokio::test]
    async fn unknown_runtime_is_rejected() {
        let mut req = request(Vec::new());
        req.runtime = "cobol".to_string();
        let err = resolve_builder_image(&req).await.unwrap_err();
        assert!(err.to_string().contains("cobol"));
    }

    #[tokio::test]
    async fn empty_runtime_is_rejected() {
        let mut req = request(Vec::new());
        req.runtime = String::new();
        assert!(resolve_builder_image(&req).await.is_err());
    }

    #[test]
    fn node_spellings_share_one_default() {
        assert_eq!(
            DEFAULT_BUILDER_IMAGES.get("node"),
            DEFAULT_BUILDER_IMAGES.get("nodejs")
        );
        assert_eq!(
            DEFAULT_BUILDER_IMAGES.get("node"),
            DEFAULT_BUILDER_IMAGES.get("typescript")
        );
    }

    #[test]
    fn platform_pair_is_lowercased() {
        let platform = Platform::parse("Linux/AMD64").unwrap();
        assert_eq!(platform.pair(), "linux/amd64");
        assert!(Platform::parse("linux").is_err());
        assert!(Platform::parse("linux/arm/v7").is_err());
    }
}
