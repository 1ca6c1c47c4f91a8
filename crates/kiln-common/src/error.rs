//! Common error types for the Kiln build pipeline.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`KilnError`].
pub type KilnResult<T> = Result<T, KilnError>;

/// Errors surfaced by the Kiln build pipeline.
///
/// [`KilnError::ImageNotFound`] is the one recoverable signal: callers may
/// fall back to registry retrieval when a local inspect reports it. Every
/// other variant aborts the build.
#[derive(Error, Diagnostic, Debug)]
pub enum KilnError {
    /// Image is not present in the local daemon.
    #[error("Image not found: {reference}")]
    #[diagnostic(code(kiln::image::not_found))]
    ImageNotFound {
        /// The image reference that was not found.
        reference: String,
    },

    /// Image reference could not be parsed.
    #[error("Invalid image reference: {reference}")]
    #[diagnostic(
        code(kiln::image::invalid_reference),
        help("Use forms like 'alpine:3.19', 'ghcr.io/org/app:v1' or 'repo@sha256:...'")
    )]
    InvalidReference {
        /// The offending reference string.
        reference: String,
    },

    /// Configuration error (bad request, failed validation).
    #[error("Configuration error: {message}")]
    #[diagnostic(code(kiln::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// Registry transport or protocol error.
    #[error("Registry error: {message}")]
    #[diagnostic(code(kiln::registry))]
    Registry {
        /// The error message.
        message: String,
    },

    /// Daemon transport or protocol error.
    #[error("Daemon error: {message}")]
    #[diagnostic(code(kiln::daemon))]
    Daemon {
        /// The error message.
        message: String,
    },

    /// The assemble engine reported a failure.
    #[error("Assemble failed: {message}")]
    #[diagnostic(code(kiln::assemble))]
    Assemble {
        /// The engine's error output.
        message: String,
    },

    /// The daemon reported a build failure through the progress protocol.
    #[error("Build failed: {message}")]
    #[diagnostic(code(kiln::build_failed))]
    BuildFailed {
        /// The error embedded in the progress stream.
        message: String,
    },

    /// A symbolic link in the build context points outside the build root.
    #[error("Link {path} points outside source root")]
    #[diagnostic(code(kiln::archive::link_escape))]
    LinkEscape {
        /// The in-archive path of the offending link.
        path: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(kiln::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(kiln::serialization))]
    Serialization(String),
}

impl From<serde_json::Error> for KilnError {
    fn from(err: serde_json::Error) -> Self {
        KilnError::Serialization(err.to_string())
    }
}
