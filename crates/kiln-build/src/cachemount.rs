//! Cache-mount patching of the engine's emitted Dockerfile.
//!
//! The assemble step downloads dependencies on every build unless its
//! artifact directory persists. Rewriting the emitted `RUN ...assemble`
//! instruction to carry a cache mount keyed by the source tree makes
//! repeated builds of the same tree reuse one artifact cache.

use std::path::Path;

use kiln_common::KilnResult;
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

const CACHE_TARGET: &str = "/tmp/artifacts/";
const CACHE_UID: u32 = 1001;

static ASSEMBLE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"RUN (.*assemble)").unwrap());

/// Cache-mount identifier for a source tree.
///
/// The first 8 bytes of the SHA-256 of the absolute source-root path,
/// hex-encoded: unique per tree, stable across repeated builds of it.
pub fn cache_id(source_root: &Path) -> KilnResult<String> {
    let absolute = std::path::absolute(source_root)?;
    let digest = Sha256::digest(absolute.to_string_lossy().as_bytes());
    Ok(hex::encode(&digest[..8]))
}

/// Prepend a cache-mount directive to every assemble invocation in the
/// instructions file. Whole-file replace.
pub fn patch_dockerfile(path: &Path, source_root: &Path) -> KilnResult<()> {
    let data = std::fs::read_to_string(path)?;
    let mount = format!(
        "--mount=type=cache,target={},uid={},id={}",
        CACHE_TARGET,
        CACHE_UID,
        cache_id(source_root)?
    );
    let replacement = format!("RUN {} \\\n    $1", mount);
    let patched = ASSEMBLE_RUN.replace_all(&data, replacement.as_str());
    std::fs::write(path, patched.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn cache_id_is_stable() {
        let a = cache_id(Path::new("/src/app")).unwrap();
        let b = cache_id(Path::new("/src/app")).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn cache_id_differs_per_tree() {
        let a = cache_id(Path::new("/src/app")).unwrap();
        let b = cache_id(Path::new("/src/other")).unwrap();
        assert_ne!(a, b);
    }

    proptest! {
        #[test]
        fn distinct_roots_get_distinct_ids(a in "/[a-z]{1,12}/[a-z]{1,12}", b in "/[a-z]{1,12}/[a-z]{1,12}") {
            prop_assume!(a != b);
            prop_assert_ne!(
                cache_id(Path::new(&a)).unwrap(),
                cache_id(Path::new(&b)).unwrap()
            );
        }
    }

    #[test]
    fn assemble_run_is_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let dockerfile = dir.path().join("Dockerfile");
        std::fs::write(
            &dockerfile,
            "FROM builder:1\nRUN /usr/libexec/s2i/assemble\nCMD run\n",
        )
        .unwrap();

        patch_dockerfile(&dockerfile, Path::new("/src/app")).unwrap();

        let patched = std::fs::read_to_string(&dockerfile).unwrap();
        let id = cache_id(Path::new("/src/app")).unwrap();
        let expected = format!(
            "FROM builder:1\nRUN --mount=type=cache,target=/tmp/artifacts/,uid=1001,id={} \\\n    /usr/libexec/s2i/assemble\nCMD run\n",
            id
        );
        assert_eq!(patched, expected);
    }

    #[test]
    fn files_without_assemble_are_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let dockerfile = dir.path().join("Dockerfile");
        let original = "FROM builder:1\nRUN echo hello\n";
        std::fs::write(&dockerfile, original).unwrap();

        patch_dockerfile(&dockerfile, Path::new("/src/app")).unwrap();

        assert_eq!(std::fs::read_to_string(&dockerfile).unwrap(), original);
    }
}
