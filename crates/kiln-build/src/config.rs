//! Assemble engine configuration.

use std::path::PathBuf;

use kiln_common::EnvVar;
use regex::Regex;

/// The engine's own built-in scripts location.
///
/// A discovered scripts-URL label equal to this value is a no-op fallback and
/// must not be copied into the config: doing so would shadow script overrides
/// shipped in the source tree. The engine and this constant must agree.
pub const DEFAULT_SCRIPTS_URL: &str = "image:///usr/libexec/s2i";

/// Paths excluded from the build: VCS metadata, env files, local state and
/// dependency caches. Applied both to the engine invocation and to the
/// archive walk, anchored to path segment boundaries.
pub const EXCLUDE_PATTERN: &str = r"(^|/)\.git|\.env|\.kiln|node_modules(/|$)";

/// Image pull policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PullPolicy {
    /// Always pull.
    Always,
    /// Pull only when the image is absent locally.
    #[default]
    IfNotPresent,
    /// Never pull.
    Never,
}

impl PullPolicy {
    /// Engine flag spelling.
    #[must_use]
    pub const fn as_flag(self) -> &'static str {
        match self {
            Self::Always => "always",
            Self::IfNotPresent => "if-not-present",
            Self::Never => "never",
        }
    }
}

/// Kind of source the engine builds from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceKind {
    /// A local directory.
    #[default]
    Local,
}

/// Source location handed to the engine.
#[derive(Debug, Clone)]
pub struct SourceDescriptor {
    /// Source kind.
    pub kind: SourceKind,
    /// Source root path.
    pub path: PathBuf,
}

/// The full parameter set for one assemble engine invocation.
///
/// Constructed once per build and validated before use. After the engine
/// runs, only the emitted instructions file on disk is rewritten (by the
/// cache-mount patcher), never this value.
#[derive(Debug, Clone)]
pub struct AssembleConfig {
    /// Source location.
    pub source: SourceDescriptor,
    /// Tag for the output image.
    pub tag: String,
    /// Builder image reference.
    pub builder_image: String,
    /// Pull policy for the builder image.
    pub builder_pull_policy: PullPolicy,
    /// Pull policy for the previous build's image.
    pub previous_image_pull_policy: PullPolicy,
    /// Pull policy for the runtime image.
    pub runtime_image_pull_policy: PullPolicy,
    /// Build-time environment, already interpolated.
    pub environment: Vec<EnvVar>,
    /// Exclusion regular expression.
    pub exclude_pattern: String,
    /// Scripts-URL override discovered from image labels.
    pub scripts_url: Option<String>,
    /// Path where the engine writes its build instructions file.
    pub as_dockerfile: PathBuf,
    /// Preserve symlinks instead of following them.
    pub keep_symlinks: bool,
    /// Force filesystem copy over other source acquisition methods.
    pub force_copy: bool,
    /// Suppress engine output.
    pub quiet: bool,
}

impl AssembleConfig {
    /// Configuration with the fixed defaults: local source, `IfNotPresent`
    /// pull policies, the standard exclusion pattern.
    pub fn new(
        source_root: impl Into<PathBuf>,
        tag: impl Into<String>,
        builder_image: impl Into<String>,
        as_dockerfile: impl Into<PathBuf>,
    ) -> Self {
        Self {
            source: SourceDescriptor {
                kind: SourceKind::Local,
                path: source_root.into(),
            },
            tag: tag.into(),
            builder_image: builder_image.into(),
            builder_pull_policy: PullPolicy::default(),
            previous_image_pull_policy: PullPolicy::default(),
            runtime_image_pull_policy: PullPolicy::default(),
            environment: Vec::new(),
            exclude_pattern: EXCLUDE_PATTERN.to_string(),
            scripts_url: None,
            as_dockerfile: as_dockerfile.into(),
            keep_symlinks: false,
            force_copy: false,
            quiet: true,
        }
    }

    /// Collect every violation in this configuration.
    ///
    /// Returns all problems rather than the first one, so the caller can
    /// report the batch and fail once.
    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if !self.source.path.is_dir() {
            errors.push(format!(
                "source {} is not a directory",
                self.source.path.display()
            ));
        }
        if self.tag.is_empty() {
            errors.push("output image tag is required".to_string());
        }
        if self.builder_image.is_empty() {
            errors.push("builder image is required".to_string());
        }
        if let Err(err) = Regex::new(&self.exclude_pattern) {
            errors.push(format!(
                "exclusion pattern {:?} is invalid: {}",
                self.exclude_pattern, err
            ));
        }
        for var in &self.environment {
            if var.name.is_empty() {
                errors.push(format!(
                    "environment assignment with empty name (value {:?})",
                    var.value
                ));
            }
        }

        errors
    }
}
