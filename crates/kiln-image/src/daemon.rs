//! Docker-compatible daemon client.
//!
//! Two operations are consumed by the build pipeline: image inspection (for
//! label discovery) and build submission (a streamed tar context in, a
//! newline-delimited JSON progress stream out).

use kiln_common::{KilnError, KilnResult};
use reqwest::{Client, StatusCode, header};
use serde::Deserialize;

use crate::registry::RuntimeConfig;

/// Default daemon endpoint when neither `KILN_HOST` nor a tcp `DOCKER_HOST`
/// is set.
pub const DEFAULT_DAEMON_HOST: &str = "http://localhost:2375";

/// Client for a Docker-compatible daemon HTTP API.
pub struct DaemonClient {
    client: Client,
    base_url: String,
}

/// Daemon image-inspect response, reduced to the metadata the pipeline reads.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageInspect {
    /// Image ID.
    #[serde(rename = "Id", default)]
    pub id: String,
    /// Image configuration.
    #[serde(rename = "Config", default)]
    pub config: Option<RuntimeConfig>,
    /// Legacy container configuration, kept for backward compatibility.
    #[serde(rename = "ContainerConfig", default)]
    pub container_config: Option<RuntimeConfig>,
}

/// Options for a build submission.
#[derive(Debug, Clone)]
pub struct BuildImageOptions {
    /// Tag for the built image.
    pub tag: String,
    /// Always pull parent/base layers.
    pub pull_parent: bool,
    /// Use the BuildKit build engine.
    pub buildkit: bool,
}

impl BuildImageOptions {
    /// Options for one pipeline submission: always pull parents, BuildKit on.
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            pull_parent: true,
            buildkit: true,
        }
    }
}

impl DaemonClient {
    /// Create a client against a daemon base URL.
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Resolve the daemon endpoint from the environment.
    ///
    /// `KILN_HOST` wins; a `DOCKER_HOST` of the form `tcp://host:port` is
    /// honored next; otherwise [`DEFAULT_DAEMON_HOST`].
    #[must_use]
    pub fn from_env() -> Self {
        if let Ok(host) = std::env::var("KILN_HOST") {
            return Self::new(host);
        }
        if let Ok(host) = std::env::var("DOCKER_HOST") {
            if let Some(rest) = host.strip_prefix("tcp://") {
                return Self::new(format!("http://{}", rest));
            }
        }
        Self::new(DEFAULT_DAEMON_HOST)
    }

    /// Inspect a locally stored image.
    ///
    /// A missing image surfaces as [`KilnError::ImageNotFound`], the signal
    /// callers use to fall back to registry retrieval.
    pub async fn inspect_image(&self, reference: &str) -> KilnResult<ImageInspect> {
        let url = format!("{}/images/{}/json", self.base_url, reference);
        tracing::debug!(url = %url, "Inspecting image");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| KilnError::Daemon {
                message: format!("inspect request failed: {}", e),
            })?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(KilnError::ImageNotFound {
                reference: reference.to_string(),
            });
        }
        if !response.status().is_success() {
            return Err(KilnError::Daemon {
                message: format!("inspect of {} returned {}", reference, response.status()),
            });
        }

        response.json().await.map_err(|e| KilnError::Daemon {
            message: format!("cannot parse inspect response: {}", e),
        })
    }

    /// Submit a build context and return the daemon's progress stream.
    ///
    /// The body is streamed as `application/x-tar`; progress arrives as
    /// newline-delimited JSON on the response body.
    pub async fn build_image(
        &self,
        context: reqwest::Body,
        options: &BuildImageOptions,
    ) -> KilnResult<reqwest::Response> {
        let mut query: Vec<(&str, &str)> = vec![("t", options.tag.as_str())];
        if options.pull_parent {
            query.push(("pull", "1"));
        }
        if options.buildkit {
            query.push(("version", "2"));
        }

        let url = format!("{}/build", self.base_url);
        tracing::debug!(url = %url, tag = %options.tag, "Submitting build");

        let response = self
            .client
            .post(&url)
            .query(&query)
            .header(header::CONTENT_TYPE, "application/x-tar")
            .body(context)
            .send()
            .await
            .map_err(|e| KilnError::Daemon {
                message: format!("build submission failed: {}", e),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(KilnError::Daemon {
                message: format!("build returned {}: {}", status, body.trim()),
            });
        }

        Ok(response)
    }
}
