//! Ignore-file bridge.
//!
//! Kiln's own exclusion file is `.kilnignore`; the assemble engine reads
//! `.s2iignore`. For the duration of one build the engine's name is provided
//! as a symlink to ours, unless the user already maintains both.

use std::path::{Path, PathBuf};

use kiln_common::KilnResult;

/// Kiln's exclusion file.
pub const IGNORE_FILE: &str = ".kilnignore";
/// The engine's exclusion file.
pub const ENGINE_IGNORE_FILE: &str = ".s2iignore";

/// Scoped compatibility symlink, removed when dropped.
#[derive(Debug)]
pub struct IgnoreLink {
    link: Option<PathBuf>,
}

impl IgnoreLink {
    /// Bridge the two ignore-file conventions for one build.
    ///
    /// Creates `.s2iignore -> ./.kilnignore` when only `.kilnignore` exists.
    /// When both exist the engine's lookup order applies: `.s2iignore` wins
    /// and a warning is emitted instead of linking.
    pub fn acquire(source_root: &Path) -> KilnResult<Self> {
        let primary = source_root.join(IGNORE_FILE);
        let engine = source_root.join(ENGINE_IGNORE_FILE);

        if !primary.exists() {
            return Ok(Self { link: None });
        }
        if engine.exists() {
            tracing::warn!(
                "an existing {} was detected, using it with preference over {}",
                ENGINE_IGNORE_FILE,
                IGNORE_FILE
            );
            return Ok(Self { link: None });
        }

        #[cfg(unix)]
        std::os::unix::fs::symlink(Path::new("./.kilnignore"), &engine)?;
        #[cfg(windows)]
        std::os::windows::fs::symlink_file(Path::new(".kilnignore"), &engine)?;

        Ok(Self { link: Some(engine) })
    }
}

impl Drop for IgnoreLink {
    fn drop(&mut self) {
        if let Some(link) = self.link.take() {
            let _ = std::fs::remove_file(link);
        }
    }
}
