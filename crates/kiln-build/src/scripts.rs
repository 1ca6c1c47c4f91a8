//! Scripts-URL discovery.
//!
//! Builder images may advertise where the engine's override scripts live via
//! a well-known label. The local daemon is consulted first; only when it does
//! not know the image at all does retrieval go directly to the registry.

use kiln_common::{KilnError, KilnResult};
use kiln_image::daemon::ImageInspect;
use kiln_image::reference::ImageReference;
use kiln_image::registry::RegistryClient;

use crate::builder::{ImageDaemon, is_default_builder_image};

/// Label advertising the engine's script-bundle location.
pub const SCRIPTS_URL_LABEL: &str = "io.openshift.s2i.scripts-url";

/// Discover the scripts URL advertised by an image.
///
/// An absent label is not an error: the empty string means "use the engine's
/// default". Only a daemon-side "not found" triggers the registry fallback;
/// every other failure is fatal.
pub async fn script_url(daemon: &dyn ImageDaemon, image: &str) -> KilnResult<String> {
    match daemon.inspect_image(image).await {
        Ok(inspect) => Ok(label_from_inspect(&inspect).unwrap_or_default()),
        Err(KilnError::ImageNotFound { .. }) => registry_script_url(image).await,
        Err(err) => Err(err),
    }
}

/// Label lookup across both metadata schemas: the image config first, then
/// the legacy container config.
fn label_from_inspect(inspect: &ImageInspect) -> Option<String> {
    for config in [&inspect.config, &inspect.container_config] {
        if let Some(url) = config
            .as_ref()
            .and_then(|c| c.labels.as_ref())
            .and_then(|labels| labels.get(SCRIPTS_URL_LABEL))
        {
            return Some(url.clone());
        }
    }
    None
}

/// Tags are mutable and can point to a different artifact than the expected
/// one; the static defaults are exempt from the warning.
fn should_warn_mutable_tag(reference: &ImageReference, image: &str) -> bool {
    reference.is_tag() && !is_default_builder_image(image)
}

async fn registry_script_url(image: &str) -> KilnResult<String> {
    let reference = ImageReference::parse(image)?;
    if should_warn_mutable_tag(&reference, image) {
        tracing::warn!(
            image,
            "image referenced by tag which is discouraged: tags are mutable and can point to a different artifact than the expected one"
        );
    }

    let mut registry = RegistryClient::for_reference(&reference);
    let labels = registry.image_labels(&reference).await?;
    Ok(labels.get(SCRIPTS_URL_LABEL).cloned().unwrap_or_default())
}
