//! Integration tests for the build pipeline, using engine and daemon doubles.

use std::collections::HashMap;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use kiln_build::builder::{
    BuildRequest, Builder, DEFAULT_PYTHON_BUILDER, ImageDaemon, Platform,
};
use kiln_build::cachemount;
use kiln_build::config::{AssembleConfig, DEFAULT_SCRIPTS_URL, PullPolicy};
use kiln_build::scripts::SCRIPTS_URL_LABEL;
use kiln_build::strategy::{AssembleOutcome, AssembleStrategy};
use kiln_common::{EnvVar, KilnError, KilnResult};
use kiln_image::daemon::{BuildImageOptions, ImageInspect};
use kiln_image::registry::RuntimeConfig;

/// Engine double: captures the configuration and emulates as-dockerfile
/// output, including files the exclusion pattern must keep out of the
/// submitted context.
struct FakeStrategy {
    captured: Mutex<Option<AssembleConfig>>,
    fail: bool,
}

impl FakeStrategy {
    fn new() -> Self {
        Self {
            captured: Mutex::new(None),
            fail: false,
        }
    }

    fn failing() -> Self {
        Self {
            captured: Mutex::new(None),
            fail: true,
        }
    }

    fn captured(&self) -> Option<AssembleConfig> {
        self.captured.lock().unwrap().clone()
    }
}

#[async_trait]
impl AssembleStrategy for FakeStrategy {
    async fn build(&self, config: &AssembleConfig) -> KilnResult<AssembleOutcome> {
        *self.captured.lock().unwrap() = Some(config.clone());
        if self.fail {
            return Err(KilnError::Assemble {
                message: "assemble exploded".to_string(),
            });
        }

        let out_dir = config.as_dockerfile.parent().unwrap();
        std::fs::write(
            &config.as_dockerfile,
            "FROM builder\nRUN /usr/libexec/s2i/assemble\n",
        )?;
        std::fs::create_dir_all(out_dir.join("src"))?;
        std::fs::write(out_dir.join("src/main.py"), "print()")?;
        std::fs::create_dir_all(out_dir.join("node_modules"))?;
        std::fs::write(out_dir.join("node_modules/x.js"), "x")?;
        std::fs::create_dir_all(out_dir.join(".git"))?;
        std::fs::write(out_dir.join(".git/config"), "[core]")?;

        Ok(AssembleOutcome {
            messages: vec!["---> Assembling".to_string()],
        })
    }
}

/// Daemon double: serves canned labels, collects the submitted context and
/// replies with a canned progress stream.
struct FakeDaemon {
    labels: HashMap<String, String>,
    progress_lines: Vec<String>,
    context: Mutex<Vec<u8>>,
    built: AtomicBool,
}

impl FakeDaemon {
    fn new(labels: HashMap<String, String>, progress_lines: Vec<String>) -> Self {
        Self {
            labels,
            progress_lines,
            context: Mutex::new(Vec::new()),
            built: AtomicBool::new(false),
        }
    }

    fn succeeding(labels: HashMap<String, String>) -> Self {
        Self::new(labels, vec!["{\"stream\":\"Successfully built\\n\"}\n".to_string()])
    }

    fn was_built(&self) -> bool {
        self.built.load(Ordering::SeqCst)
    }

    fn context(&self) -> Vec<u8> {
        self.context.lock().unwrap().clone()
    }
}

#[async_trait]
impl ImageDaemon for FakeDaemon {
    async fn inspect_image(&self, _reference: &str) -> KilnResult<ImageInspect> {
        Ok(ImageInspect {
            id: "sha256:test".to_string(),
            config: Some(RuntimeConfig {
                labels: Some(self.labels.clone()),
                ..RuntimeConfig::default()
            }),
            container_config: None,
        })
    }

    async fn build_image(
        &self,
        mut context: BoxStream<'static, KilnResult<Bytes>>,
        _options: &BuildImageOptions,
    ) -> KilnResult<BoxStream<'static, KilnResult<Bytes>>> {
        self.built.store(true, Ordering::SeqCst);
        let mut bytes = Vec::new();
        while let Some(chunk) = context.next().await {
            bytes.extend_from_slice(&chunk?);
        }
        *self.context.lock().unwrap() = bytes;

        let lines = self.progress_lines.clone();
        Ok(
            futures::stream::iter(lines.into_iter().map(|l| Ok::<_, KilnError>(Bytes::from(l))))
                .boxed(),
        )
    }
}

fn request(source_root: &std::path::Path) -> BuildRequest {
    BuildRequest {
        source_root: source_root.to_path_buf(),
        runtime: "python".to_string(),
        image: "example.com/app:v1".to_string(),
        builder_image: None,
        platforms: Vec::new(),
        build_envs: Vec::new(),
    }
}

fn sentinel_labels() -> HashMap<String, String> {
    HashMap::from([(SCRIPTS_URL_LABEL.to_string(), DEFAULT_SCRIPTS_URL.to_string())])
}

#[tokio::test]
async fn pipeline_builds_and_filters_context() {
    let source = tempfile::tempdir().unwrap();
    std::fs::write(source.path().join("main.py"), "print()").unwrap();

    let strategy = Arc::new(FakeStrategy::new());
    let daemon = Arc::new(FakeDaemon::succeeding(sentinel_labels()));
    let mut req = request(source.path());
    req.build_envs.push(EnvVar::new("PIP_INDEX_URL", "https://mirror"));

    Builder::new(strategy.clone(), daemon.clone())
        .build(&req)
        .await
        .unwrap();

    // The engine received the resolved default image with default pull
    // policies; the sentinel label did not become an override.
    let config = strategy.captured().unwrap();
    assert_eq!(config.builder_image, DEFAULT_PYTHON_BUILDER);
    assert_eq!(config.builder_pull_policy, PullPolicy::IfNotPresent);
    assert_eq!(config.previous_image_pull_policy, PullPolicy::IfNotPresent);
    assert_eq!(config.runtime_image_pull_policy, PullPolicy::IfNotPresent);
    assert!(config.scripts_url.is_none());
    assert!(config.quiet);
    assert!(
        config
            .environment
            .contains(&EnvVar::new("PIP_INDEX_URL", "https://mirror"))
    );

    // The submitted context is filtered and the Dockerfile is patched.
    let bytes = daemon.context();
    let mut archive = tar::Archive::new(&bytes[..]);
    let mut names = Vec::new();
    let mut dockerfile = String::new();
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        let name = entry.path().unwrap().to_string_lossy().into_owned();
        if name == "Dockerfile" {
            entry.read_to_string(&mut dockerfile).unwrap();
        }
        names.push(name);
    }
    assert!(names.contains(&"Dockerfile".to_string()));
    assert!(names.contains(&"src/main.py".to_string()));
    assert!(names.iter().all(|n| !n.contains("node_modules")));
    assert!(names.iter().all(|n| !n.contains(".git")));

    let id = cachemount::cache_id(source.path()).unwrap();
    assert!(dockerfile.contains(&format!(
        "RUN --mount=type=cache,target=/tmp/artifacts/,uid=1001,id={id}"
    )));
    assert!(dockerfile.contains("/usr/libexec/s2i/assemble"));
}

#[tokio::test]
async fn discovered_label_overrides_scripts_url() {
    let source = tempfile::tempdir().unwrap();
    std::fs::write(source.path().join("main.py"), "print()").unwrap();

    let labels = HashMap::from([(
        SCRIPTS_URL_LABEL.to_string(),
        "image:///opt/custom-scripts".to_string(),
    )]);
    let strategy = Arc::new(FakeStrategy::new());
    let daemon = Arc::new(FakeDaemon::succeeding(labels));

    Builder::new(strategy.clone(), daemon)
        .build(&request(source.path()))
        .await
        .unwrap();

    assert_eq!(
        strategy.captured().unwrap().scripts_url.as_deref(),
        Some("image:///opt/custom-scripts")
    );
}

#[tokio::test]
async fn multiple_platforms_never_reach_the_daemon() {
    let source = tempfile::tempdir().unwrap();

    let strategy = Arc::new(FakeStrategy::new());
    let daemon = Arc::new(FakeDaemon::succeeding(sentinel_labels()));
    let mut req = request(source.path());
    req.platforms = vec![
        Platform::parse("linux/amd64").unwrap(),
        Platform::parse("linux/arm64").unwrap(),
    ];

    let err = Builder::new(strategy.clone(), daemon.clone())
        .build(&req)
        .await
        .unwrap_err();

    assert!(err.to_string().contains("single target platform"));
    assert!(strategy.captured().is_none());
    assert!(!daemon.was_built());
}

#[tokio::test]
async fn engine_failure_aborts_before_submission() {
    let source = tempfile::tempdir().unwrap();
    std::fs::write(source.path().join("main.py"), "print()").unwrap();

    let strategy = Arc::new(FakeStrategy::failing());
    let daemon = Arc::new(FakeDaemon::succeeding(sentinel_labels()));

    let err = Builder::new(strategy, daemon.clone())
        .build(&request(source.path()))
        .await
        .unwrap_err();

    assert!(matches!(err, KilnError::Assemble { .. }));
    assert!(!daemon.was_built());
}

#[tokio::test]
async fn embedded_progress_error_is_the_terminal_error() {
    let source = tempfile::tempdir().unwrap();
    std::fs::write(source.path().join("main.py"), "print()").unwrap();

    let strategy = Arc::new(FakeStrategy::new());
    let daemon = Arc::new(FakeDaemon::new(
        sentinel_labels(),
        vec!["{\"errorDetail\":{\"message\":\"executor failed running\"}}\n".to_string()],
    ));

    let err = Builder::new(strategy, daemon)
        .build(&request(source.path()))
        .await
        .unwrap_err();

    assert!(matches!(err, KilnError::BuildFailed { ref message } if message.contains("executor")));
}

#[tokio::test]
async fn invalid_configuration_is_reported_in_aggregate() {
    // A source root that does not exist fails validation before the engine
    // runs.
    let strategy = Arc::new(FakeStrategy::new());
    let daemon = Arc::new(FakeDaemon::succeeding(sentinel_labels()));
    let req = request(std::path::Path::new("/kiln/does/not/exist"));

    let err = Builder::new(strategy.clone(), daemon.clone())
        .build(&req)
        .await
        .unwrap_err();

    assert!(matches!(err, KilnError::Config { .. }));
    assert!(strategy.captured().is_none());
    assert!(!daemon.was_built());
}
