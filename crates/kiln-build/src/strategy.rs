//! Pluggable assemble engine boundary.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use kiln_common::{KilnError, KilnResult};

use crate::config::AssembleConfig;

/// Result of a successful engine run.
#[derive(Debug, Clone, Default)]
pub struct AssembleOutcome {
    /// Human-readable messages emitted by the engine.
    pub messages: Vec<String>,
}

/// The pluggable assemble engine.
///
/// The pipeline holds this as an injected dependency and does not know how
/// assembly is implemented; tests inject a double returning canned results.
#[async_trait]
pub trait AssembleStrategy: Send + Sync {
    /// Run the engine against a validated configuration.
    async fn build(&self, config: &AssembleConfig) -> KilnResult<AssembleOutcome>;
}

/// Engine implementation driving an external s2i-compatible executable in
/// as-dockerfile mode.
pub struct CommandStrategy {
    program: PathBuf,
}

impl CommandStrategy {
    /// Default executable name, resolved via `PATH`.
    pub const DEFAULT_PROGRAM: &'static str = "s2i";

    /// Create a strategy for a specific executable.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for CommandStrategy {
    fn default() -> Self {
        Self::new(Self::DEFAULT_PROGRAM)
    }
}

/// Command-line rendering of a configuration.
fn command_args(config: &AssembleConfig) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "build".into(),
        config.source.path.clone().into(),
        config.builder_image.clone().into(),
        config.tag.clone().into(),
        "--as-dockerfile".into(),
        config.as_dockerfile.clone().into(),
        "--exclude".into(),
        config.exclude_pattern.clone().into(),
        "--pull-policy".into(),
        config.builder_pull_policy.as_flag().into(),
    ];
    if let Some(url) = &config.scripts_url {
        args.push("--scripts-url".into());
        args.push(url.clone().into());
    }
    if config.force_copy {
        args.push("--copy".into());
    }
    if config.keep_symlinks {
        args.push("--keep-symlinks".into());
    }
    if config.quiet {
        args.push("--quiet".into());
    }
    for var in &config.environment {
        args.push("--env".into());
        args.push(format!("{}={}", var.name, var.value).into());
    }
    args
}

#[async_trait]
impl AssembleStrategy for CommandStrategy {
    async fn build(&self, config: &AssembleConfig) -> KilnResult<AssembleOutcome> {
        let args = command_args(config);
        tracing::debug!(program = %self.program.display(), ?args, "Invoking assemble engine");

        let output = tokio::process::Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| KilnError::Assemble {
                message: format!("cannot run {}: {}", self.program.display(), e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr = stderr.trim();
            return Err(KilnError::Assemble {
                message: if stderr.is_empty() {
                    format!("engine exited with {}", output.status)
                } else {
                    stderr.to_string()
                },
            });
        }

        let messages = String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(ToString::to_string)
            .collect();

        Ok(AssembleOutcome { messages })
    }
}
