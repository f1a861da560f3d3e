//! Dev-loop scenarios driven by scripted plugin and watcher doubles.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use skiff_core::{
    Artifact, ArtifactType, BuildResult, Builder, DeployedResource, Deployer, DockerArtifact,
    Labels, Output, RunOptions, SkiffError, Syncer, Tagger,
};
use skiff_runner::Runner;
use skiff_watch::{ChangeHandler, DepSource, TickHandler, WatchEvents, Watcher, WatcherFactory};

fn artifact(name: &str) -> Artifact {
    Artifact {
        image_name: name.into(),
        workspace: PathBuf::from("."),
        artifact_type: ArtifactType::Docker(DockerArtifact::default()),
        sync_patterns: vec![],
    }
}

fn artifact_with_sync(name: &str, patterns: &[&str]) -> Artifact {
    let mut a = artifact(name);
    a.sync_patterns = patterns.iter().map(|s| s.to_string()).collect();
    a
}

fn modified(paths: &[&str]) -> WatchEvents {
    WatchEvents {
        added: vec![],
        modified: paths.iter().map(PathBuf::from).collect(),
        deleted: vec![],
    }
}

/// Pops one scripted outcome per call; an exhausted script succeeds. Tags
/// carry the build round so merges are observable.
#[derive(Default)]
struct TestBuilder {
    script: Mutex<VecDeque<Option<String>>>,
    rounds: AtomicUsize,
    built: Mutex<Vec<Vec<BuildResult>>>,
}

impl TestBuilder {
    fn failing_times(script: &[Option<&str>]) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.iter().map(|o| o.map(|s| s.to_string())).collect()),
            ..Default::default()
        })
    }

    fn ok() -> Arc<Self> {
        Self::failing_times(&[])
    }
}

#[async_trait]
impl Builder for TestBuilder {
    async fn build(
        &self,
        _token: &CancellationToken,
        _out: &Output,
        _tagger: &dyn Tagger,
        artifacts: &[Artifact],
    ) -> Result<Vec<BuildResult>> {
        if let Some(Some(msg)) = self.script.lock().unwrap().pop_front() {
            return Err(anyhow!("{}", msg));
        }
        let round = self.rounds.fetch_add(1, Ordering::SeqCst) + 1;
        let results: Vec<BuildResult> = artifacts
            .iter()
            .map(|a| BuildResult {
                image_name: a.image_name.clone(),
                tag: format!("{}:{}", a.image_name, round),
            })
            .collect();
        self.built.lock().unwrap().push(results.clone());
        Ok(results)
    }

    fn labels(&self) -> Labels {
        Labels::new()
    }
}

#[derive(Default)]
struct TestDeployer {
    script: Mutex<VecDeque<Option<String>>>,
    deployed: Mutex<Vec<Vec<BuildResult>>>,
}

impl TestDeployer {
    fn failing_times(script: &[Option<&str>]) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.iter().map(|o| o.map(|s| s.to_string())).collect()),
            ..Default::default()
        })
    }

    fn ok() -> Arc<Self> {
        Self::failing_times(&[])
    }
}

#[async_trait]
impl Deployer for TestDeployer {
    async fn deploy(
        &self,
        _token: &CancellationToken,
        _out: &Output,
        builds: &[BuildResult],
    ) -> Result<Vec<DeployedResource>> {
        if let Some(Some(msg)) = self.script.lock().unwrap().pop_front() {
            return Err(anyhow!("{}", msg));
        }
        self.deployed.lock().unwrap().push(builds.to_vec());
        Ok(vec![])
    }

    async fn cleanup(&self, _token: &CancellationToken, _out: &Output) -> Result<()> {
        Ok(())
    }

    fn dependencies(&self) -> Result<Vec<PathBuf>> {
        Ok(vec![])
    }

    fn labels(&self) -> Labels {
        Labels::new()
    }
}

struct FixedTagger;

impl Tagger for FixedTagger {
    fn generate(&self, _w: &std::path::Path, image_name: &str, _d: &str) -> Result<String> {
        Ok(format!("{}:tag", image_name))
    }

    fn labels(&self) -> Labels {
        Labels::new()
    }
}

#[derive(Default)]
struct TestSyncer {
    copied: Mutex<Vec<(String, Vec<PathBuf>)>>,
    deleted: Mutex<Vec<(String, Vec<PathBuf>)>>,
}

#[async_trait]
impl Syncer for TestSyncer {
    async fn copy(&self, image: &str, files: &[PathBuf]) -> Result<()> {
        self.copied.lock().unwrap().push((image.into(), files.to_vec()));
        Ok(())
    }

    async fn delete(&self, image: &str, files: &[PathBuf]) -> Result<()> {
        self.deleted.lock().unwrap().push((image.into(), files.to_vec()));
        Ok(())
    }
}

/// Scripted registry: fires the given (component, events) pairs per tick,
/// then the tick itself, exactly like the production poll loop would.
struct TestWatcher {
    ticks: Vec<Vec<(usize, WatchEvents)>>,
    run_error: Option<String>,
    handlers: Vec<ChangeHandler>,
}

#[async_trait]
impl Watcher for TestWatcher {
    async fn register(&mut self, _deps: DepSource, on_change: ChangeHandler) -> Result<()> {
        self.handlers.push(on_change);
        Ok(())
    }

    async fn run(
        &mut self,
        _token: CancellationToken,
        _poll_interval: Duration,
        mut on_tick: TickHandler,
    ) -> Result<()> {
        for tick in std::mem::take(&mut self.ticks) {
            for (component, events) in tick {
                let _ = (self.handlers[component])(events).await;
            }
            on_tick().await?;
        }
        match self.run_error.take() {
            Some(msg) => Err(anyhow!("{}", msg)),
            None => Ok(()),
        }
    }
}

fn scripted_watcher(ticks: Vec<Vec<(usize, WatchEvents)>>, run_error: Option<&str>) -> WatcherFactory {
    let slot = Mutex::new(Some(TestWatcher {
        ticks,
        run_error: run_error.map(|s| s.to_string()),
        handlers: vec![],
    }));
    Box::new(move || {
        Box::new(slot.lock().unwrap().take().expect("one watcher per session")) as Box<dyn Watcher>
    })
}

struct Session {
    builder: Arc<TestBuilder>,
    deployer: Arc<TestDeployer>,
    syncer: Arc<TestSyncer>,
    runner: Runner,
}

fn session(
    builder: Arc<TestBuilder>,
    deployer: Arc<TestDeployer>,
    watcher: WatcherFactory,
) -> Session {
    let syncer = Arc::new(TestSyncer::default());
    let runner = Runner::new(
        builder.clone(),
        deployer.clone(),
        Arc::new(FixedTagger),
        syncer.clone(),
        watcher,
        RunOptions {
            config_file: PathBuf::from("skiff.yaml"),
            ..Default::default()
        },
        Output::sink(),
    );
    Session {
        builder,
        deployer,
        syncer,
        runner,
    }
}

#[tokio::test]
async fn first_build_failure_is_fatal() {
    let mut s = session(
        TestBuilder::failing_times(&[Some("no daemon")]),
        TestDeployer::ok(),
        scripted_watcher(vec![], None),
    );
    let err = s
        .runner
        .dev(&CancellationToken::new(), &[artifact("a")])
        .await
        .unwrap_err();
    assert!(format!("{:#}", err).contains("first build failed"));
    assert!(s.deployer.deployed.lock().unwrap().is_empty());
}

#[tokio::test]
async fn first_deploy_failure_is_fatal() {
    let mut s = session(
        TestBuilder::ok(),
        TestDeployer::failing_times(&[Some("apply refused")]),
        scripted_watcher(vec![], None),
    );
    let err = s
        .runner
        .dev(&CancellationToken::new(), &[artifact("a")])
        .await
        .unwrap_err();
    assert!(format!("{:#}", err).contains("first deploy failed"));
}

#[tokio::test]
async fn subsequent_build_failure_keeps_the_loop_alive() {
    // One artifact: components are [artifact, deployer, config].
    let mut s = session(
        TestBuilder::failing_times(&[None, Some("compiler exploded")]),
        TestDeployer::ok(),
        scripted_watcher(vec![vec![(0, modified(&["main.go"]))]], None),
    );
    s.runner
        .dev(&CancellationToken::new(), &[artifact("a")])
        .await
        .expect("loop survives a failed rebuild");

    // Only the first deploy happened and its tags are unchanged.
    let deploys = s.deployer.deployed.lock().unwrap();
    assert_eq!(deploys.len(), 1);
    assert_eq!(deploys[0][0].tag, "a:1");
}

#[tokio::test]
async fn subsequent_deploy_failure_keeps_the_loop_alive() {
    let mut s = session(
        TestBuilder::ok(),
        TestDeployer::failing_times(&[None, Some("apply refused")]),
        scripted_watcher(vec![vec![(0, modified(&["main.go"]))]], None),
    );
    s.runner
        .dev(&CancellationToken::new(), &[artifact("a")])
        .await
        .expect("loop survives a failed redeploy");
    assert_eq!(s.deployer.deployed.lock().unwrap().len(), 1);
    assert_eq!(s.builder.built.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn watch_failure_ends_the_loop() {
    let mut s = session(
        TestBuilder::ok(),
        TestDeployer::ok(),
        scripted_watcher(vec![], Some("watch broke")),
    );
    let err = s
        .runner
        .dev(&CancellationToken::new(), &[artifact("a")])
        .await
        .unwrap_err();
    assert!(format!("{:#}", err).contains("watch broke"));
}

#[tokio::test]
async fn all_dirty_artifacts_rebuild_and_redeploy() {
    let mut s = session(
        TestBuilder::ok(),
        TestDeployer::ok(),
        scripted_watcher(
            vec![vec![
                (0, modified(&["a/main.go"])),
                (1, modified(&["b/main.go"])),
            ]],
            None,
        ),
    );
    s.runner
        .dev(&CancellationToken::new(), &[artifact("a"), artifact("b")])
        .await
        .expect("dev");

    let built = s.builder.built.lock().unwrap();
    assert_eq!(built.len(), 2);
    assert_eq!(built[1].len(), 2);
    let deploys = s.deployer.deployed.lock().unwrap();
    assert_eq!(deploys.len(), 2);
    assert_eq!(deploys[1].len(), 2);
}

#[tokio::test]
async fn partial_rebuild_still_deploys_the_full_set() {
    // Two artifacts: components are [a, b, deployer, config]. Dirty only a.
    let mut s = session(
        TestBuilder::ok(),
        TestDeployer::ok(),
        scripted_watcher(vec![vec![(0, modified(&["a/main.go"]))]], None),
    );
    s.runner
        .dev(&CancellationToken::new(), &[artifact("a"), artifact("b")])
        .await
        .expect("dev");

    let deploys = s.deployer.deployed.lock().unwrap();
    assert_eq!(deploys.len(), 2);
    // Second deploy carries the fresh a and the previous b.
    assert_eq!(
        deploys[1],
        vec![
            BuildResult {
                image_name: "a".into(),
                tag: "a:2".into()
            },
            BuildResult {
                image_name: "b".into(),
                tag: "b:1".into()
            },
        ]
    );
}

#[tokio::test]
async fn fully_matched_changes_sync_instead_of_rebuilding() {
    let mut s = session(
        TestBuilder::ok(),
        TestDeployer::ok(),
        scripted_watcher(vec![vec![(0, modified(&["static/index.html"]))]], None),
    );
    s.runner
        .dev(
            &CancellationToken::new(),
            &[artifact_with_sync("web", &["static/*.html"])],
        )
        .await
        .expect("dev");

    let copied = s.syncer.copied.lock().unwrap();
    assert_eq!(
        *copied,
        vec![("web".to_string(), vec![PathBuf::from("static/index.html")])]
    );
    // No rebuild, no second deploy.
    assert_eq!(s.builder.built.lock().unwrap().len(), 1);
    assert_eq!(s.deployer.deployed.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn sync_emits_status_line() {
    let syncer = Arc::new(TestSyncer::default());
    let (out, buf) = Output::buffer();
    let mut runner = Runner::new(
        TestBuilder::ok(),
        TestDeployer::ok(),
        Arc::new(FixedTagger),
        syncer,
        scripted_watcher(vec![vec![(0, modified(&["static/index.html"]))]], None),
        RunOptions {
            config_file: PathBuf::from("skiff.yaml"),
            ..Default::default()
        },
        out,
    );
    runner
        .dev(
            &CancellationToken::new(),
            &[artifact_with_sync("web", &["static/*.html"])],
        )
        .await
        .expect("dev");
    let text = String::from_utf8(buf.lock().unwrap().clone()).unwrap();
    assert!(text.contains("Synced files."), "output: {}", text);
}

#[tokio::test]
async fn deployer_dependency_changes_trigger_redeploy_without_build() {
    // One artifact: deployer component is index 1.
    let mut s = session(
        TestBuilder::ok(),
        TestDeployer::ok(),
        scripted_watcher(vec![vec![(1, modified(&["k8s/app.yaml"]))]], None),
    );
    s.runner
        .dev(&CancellationToken::new(), &[artifact("a")])
        .await
        .expect("dev");
    assert_eq!(s.builder.built.lock().unwrap().len(), 1);
    assert_eq!(s.deployer.deployed.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn configuration_change_returns_the_reload_sentinel() {
    // One artifact: config component is index 2.
    let mut s = session(
        TestBuilder::ok(),
        TestDeployer::ok(),
        scripted_watcher(vec![vec![(2, modified(&["skiff.yaml"]))]], None),
    );
    let err = s
        .runner
        .dev(&CancellationToken::new(), &[artifact("a")])
        .await
        .unwrap_err();
    assert!(SkiffError::is_reload(&err));
}

#[tokio::test]
async fn reload_takes_priority_over_dirty_artifacts() {
    let mut s = session(
        TestBuilder::ok(),
        TestDeployer::ok(),
        scripted_watcher(
            vec![vec![
                (0, modified(&["main.go"])),
                (2, modified(&["skiff.yaml"])),
            ]],
            None,
        ),
    );
    let err = s
        .runner
        .dev(&CancellationToken::new(), &[artifact("a")])
        .await
        .unwrap_err();
    assert!(SkiffError::is_reload(&err));
    // The dirty artifact never rebuilt.
    assert_eq!(s.builder.built.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn watch_filter_skips_unmatched_artifacts() {
    // With the filter, only "match-me" is registered; component 0 is that
    // artifact and component 1 is the deployer.
    let builder = TestBuilder::ok();
    let deployer = TestDeployer::ok();
    let syncer = Arc::new(TestSyncer::default());
    let mut runner = Runner::new(
        builder.clone(),
        deployer.clone(),
        Arc::new(FixedTagger),
        syncer,
        scripted_watcher(vec![vec![(0, modified(&["x"]))]], None),
        RunOptions {
            config_file: PathBuf::from("skiff.yaml"),
            watch: vec!["match".into()],
            ..Default::default()
        },
        Output::sink(),
    );
    runner
        .dev(
            &CancellationToken::new(),
            &[artifact("other"), artifact("match-me")],
        )
        .await
        .expect("dev");

    // The fired component was match-me, so the rebuild covers only it.
    let built = builder.built.lock().unwrap();
    assert_eq!(built.len(), 2);
    assert_eq!(built[1].len(), 1);
    assert_eq!(built[1][0].image_name, "match-me");
}

#[tokio::test]
async fn run_once_builds_and_deploys() {
    let mut s = session(TestBuilder::ok(), TestDeployer::ok(), scripted_watcher(vec![], None));
    s.runner
        .run(&CancellationToken::new(), &[artifact("a")])
        .await
        .expect("run");
    assert_eq!(s.builder.built.lock().unwrap().len(), 1);
    assert_eq!(s.deployer.deployed.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn run_once_propagates_build_errors() {
    let mut s = session(
        TestBuilder::failing_times(&[Some("no daemon")]),
        TestDeployer::ok(),
        scripted_watcher(vec![], None),
    );
    let err = s
        .runner
        .run(&CancellationToken::new(), &[artifact("a")])
        .await
        .unwrap_err();
    assert!(format!("{:#}", err).contains("build step"));
}
