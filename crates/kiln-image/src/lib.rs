//! # kiln-image
//!
//! Container image plumbing for Kiln:
//! - Image reference parsing
//! - Registry retrieval (manifests, indexes, configs, labels)
//! - Platform narrowing within multi-architecture indexes
//! - Docker-compatible daemon client (inspect, build submission)

#![warn(missing_docs)]

pub mod daemon;
pub mod reference;
pub mod registry;

pub use daemon::{BuildImageOptions, DaemonClient, ImageInspect};
pub use reference::{ImageReference, ImageTag};
pub use registry::RegistryClient;
