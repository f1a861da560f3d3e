//! The pipeline runner: one-shot build+deploy and the continuous dev loop.
//!
//! The runner holds one value per plugin capability and never downcasts.
//! Build and deploy are strictly serialized on the runner; the poll loop,
//! log aggregator and port-forwarder run as background tasks re-targeted
//! after every successful deploy.

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use skiff_build::tag::{
    ChecksumTagger, CustomTagger, DateTimeTagger, EnvTemplateTagger, GitCommitTagger,
};
use skiff_build::{GoogleCloudBuildBuilder, KanikoBuilder, LocalBuilder};
use skiff_config::{BuildType, Config, DeployType, TagPolicy};
use skiff_core::{
    Artifact, BuildResult, Builder, Deployer, DeployedResource, Labels, Output, RunOptions,
    SkiffError, Syncer, Tagger,
};
use skiff_deploy::{HelmDeployer, KomposeDeployer, KubectlDeployer, KustomizeDeployer};
use skiff_kube::{ImageList, Kubectl, KubectlSyncer, LogAggregator, PortForwarder};
use skiff_watch::{ChangeHandler, DepSource, PollWatcher, TickHandler, Watcher, WatcherFactory};

pub mod changes;

use changes::ChangeSet;

fn poll_interval() -> Duration {
    let ms = std::env::var("SKIFF_POLL_MS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1000);
    Duration::from_millis(ms)
}

pub struct Runner {
    builder: Arc<dyn Builder>,
    deployer: Arc<dyn Deployer>,
    tagger: Arc<dyn Tagger>,
    syncer: Arc<dyn Syncer>,
    watch_factory: WatcherFactory,
    opts: RunOptions,
    out: Arc<Output>,
    /// Latest-known tag per image; a partial rebuild still deploys the full
    /// set.
    builds: Arc<Mutex<Vec<BuildResult>>>,
}

impl Runner {
    pub fn new(
        builder: Arc<dyn Builder>,
        deployer: Arc<dyn Deployer>,
        tagger: Arc<dyn Tagger>,
        syncer: Arc<dyn Syncer>,
        watch_factory: WatcherFactory,
        opts: RunOptions,
        out: Arc<Output>,
    ) -> Self {
        Self {
            builder,
            deployer,
            tagger,
            syncer,
            watch_factory,
            opts,
            out,
            builds: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Select one implementation per capability from the loaded
    /// configuration.
    pub fn for_config(opts: RunOptions, cfg: &Config, out: Arc<Output>) -> Result<Runner> {
        let kubectl = Kubectl::new(opts.kube_context.clone(), opts.namespace.clone());

        let tagger: Arc<dyn Tagger> = match &opts.custom_tag {
            Some(tag) => Arc::new(CustomTagger::new(tag)),
            None => match cfg.build.tag_policy.resolve()? {
                TagPolicy::GitCommit => Arc::new(GitCommitTagger),
                TagPolicy::Sha256 => Arc::new(ChecksumTagger),
                TagPolicy::DateTime(p) => Arc::new(DateTimeTagger::new(p.format, p.timezone)?),
                TagPolicy::EnvTemplate(p) => Arc::new(EnvTemplateTagger::new(&p.template)?),
            },
        };

        let builder: Arc<dyn Builder> = match cfg.build.build_type.resolve()? {
            BuildType::Local(l) => {
                Arc::new(LocalBuilder::new(l.skip_push, opts.kube_context.clone()))
            }
            BuildType::GoogleCloudBuild(g) => Arc::new(GoogleCloudBuildBuilder::new(g.project_id)),
            BuildType::Kaniko(k) => Arc::new(KanikoBuilder::new(k.namespace, k.pull_secret_name)),
        };

        let working_dir = opts
            .config_file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        let deployer: Arc<dyn Deployer> = match cfg.deploy.deploy_type.resolve()? {
            DeployType::Kubectl(k) => Arc::new(KubectlDeployer::new(
                working_dir,
                k.manifests,
                k.remote_manifests,
                kubectl.clone(),
            )),
            DeployType::Kustomize(k) => Arc::new(KustomizeDeployer::new(k.path, kubectl.clone())),
            DeployType::Helm(h) => Arc::new(HelmDeployer::new(
                h.releases
                    .into_iter()
                    .map(|r| skiff_deploy::HelmRelease {
                        name: r.name,
                        chart_path: r.chart_path,
                        values: r.values,
                        namespace: r.namespace,
                    })
                    .collect(),
                opts.kube_context.clone(),
            )),
            DeployType::Kompose(k) => {
                Arc::new(KomposeDeployer::new(k.compose_file, kubectl.clone()))
            }
        };

        let syncer: Arc<dyn Syncer> = Arc::new(KubectlSyncer::new(kubectl));

        Ok(Self::new(
            builder,
            deployer,
            tagger,
            syncer,
            Box::new(|| Box::new(PollWatcher::new()) as Box<dyn Watcher>),
            opts,
            out,
        ))
    }

    fn labels(&self) -> Labels {
        let mut labels = Labels::new();
        labels.extend(self.builder.labels());
        labels.extend(self.deployer.labels());
        labels.extend(self.tagger.labels());
        labels
    }

    /// With `--watch` filters, only artifacts whose image name contains one
    /// of the given substrings are watched.
    fn should_watch(&self, artifact: &Artifact) -> bool {
        watch_filter_matches(&self.opts.watch, &artifact.image_name)
    }

    /// One-shot build, printing the produced tags.
    pub async fn build_artifacts(
        &self,
        token: &CancellationToken,
        artifacts: &[Artifact],
    ) -> Result<Vec<BuildResult>> {
        let results = self
            .builder
            .build(token, &self.out, self.tagger.as_ref(), artifacts)
            .await
            .context("build step")?;
        for result in &results {
            self.out
                .write_line(&format!("{} -> {}", result.image_name, result.tag));
        }
        Ok(results)
    }

    /// Build, deploy and (optionally) stream logs until cancelled.
    pub async fn run(&mut self, token: &CancellationToken, artifacts: &[Artifact]) -> Result<()> {
        let results = self
            .builder
            .build(token, &self.out, self.tagger.as_ref(), artifacts)
            .await
            .context("build step")?;
        merge_into(&self.builds, results);
        let table = self.builds.lock().unwrap().clone();
        let deployed = self
            .deployer
            .deploy(token, &self.out, &table)
            .await
            .context("deploy step")?;

        let images = ImageList::new();
        finish_deploy(
            &images,
            &self.labels(),
            self.opts.namespace.as_deref(),
            &table,
            &deployed,
            &self.out,
            self.opts.notification,
        )
        .await;

        if self.opts.tail {
            let logger = LogAggregator::new(
                Arc::clone(&self.out),
                images.clone(),
                self.opts.namespace.clone(),
            );
            logger.start(token);
            token.cancelled().await;
        }
        Ok(())
    }

    /// Run the deployer's cleanup.
    pub async fn cleanup(&self, token: &CancellationToken) -> Result<()> {
        self.deployer
            .cleanup(token, &self.out)
            .await
            .context("cleaning up")
    }

    /// The dev loop: watch, then build+deploy dirty artifacts until the
    /// session is cancelled or the configuration file changes.
    pub async fn dev(&mut self, token: &CancellationToken, artifacts: &[Artifact]) -> Result<()> {
        let images = ImageList::new();
        let kubectl = Kubectl::new(self.opts.kube_context.clone(), self.opts.namespace.clone());
        let logger = Arc::new(LogAggregator::new(
            Arc::clone(&self.out),
            images.clone(),
            self.opts.namespace.clone(),
        ));
        let forwarder = PortForwarder::new(Arc::clone(&self.out), images.clone(), kubectl);

        let changed = Arc::new(Mutex::new(ChangeSet::default()));
        let mut watcher = (self.watch_factory)();

        for artifact in artifacts.iter().filter(|a| self.should_watch(a)) {
            let deps: DepSource = {
                let artifact = artifact.clone();
                Box::new(move || {
                    let artifact = artifact.clone();
                    Box::pin(async move { skiff_build::dependencies_for(&artifact).await })
                })
            };
            let on_change = self.artifact_handler(artifact, &changed);
            watcher
                .register(deps, on_change)
                .await
                .with_context(|| format!("watching files for artifact {}", artifact.image_name))?;
        }

        {
            let deployer = Arc::clone(&self.deployer);
            let changed = Arc::clone(&changed);
            watcher
                .register(
                    Box::new(move || {
                        let deployer = Arc::clone(&deployer);
                        Box::pin(async move { deployer.dependencies() })
                    }),
                    Box::new(move |_events| {
                        changed.lock().unwrap().needs_redeploy = true;
                        Box::pin(async { anyhow::Ok(()) })
                    }),
                )
                .await
                .context("watching files for deployer")?;
        }

        {
            let config_file = self.opts.config_file.clone();
            let changed = Arc::clone(&changed);
            watcher
                .register(
                    Box::new(move || {
                        let config_file = config_file.clone();
                        Box::pin(async move { anyhow::Ok(vec![config_file]) })
                    }),
                    Box::new(move |_events| {
                        changed.lock().unwrap().needs_reload = true;
                        Box::pin(async { anyhow::Ok(()) })
                    }),
                )
                .await
                .context("watching configuration file")?;
        }

        // First run; failures here are fatal.
        let results = self
            .builder
            .build(token, &self.out, self.tagger.as_ref(), artifacts)
            .await
            .context("exiting dev mode because the first build failed")?;
        merge_into(&self.builds, results);
        let table = self.builds.lock().unwrap().clone();
        let deployed = self
            .deployer
            .deploy(token, &self.out, &table)
            .await
            .context("exiting dev mode because the first deploy failed")?;
        finish_deploy(
            &images,
            &self.labels(),
            self.opts.namespace.as_deref(),
            &table,
            &deployed,
            &self.out,
            self.opts.notification,
        )
        .await;

        logger.start(token);
        forwarder.start(token);

        let ctx = Arc::new(TickCtx {
            builder: Arc::clone(&self.builder),
            deployer: Arc::clone(&self.deployer),
            tagger: Arc::clone(&self.tagger),
            out: Arc::clone(&self.out),
            builds: Arc::clone(&self.builds),
            changed,
            images,
            logger,
            token: token.clone(),
            labels: self.labels(),
            namespace: self.opts.namespace.clone(),
            notification: self.opts.notification,
        });
        let on_tick: TickHandler = {
            let ctx = Arc::clone(&ctx);
            Box::new(move || {
                let ctx = Arc::clone(&ctx);
                Box::pin(async move { tick(ctx).await })
            })
        };

        self.out.write_line("Watching for changes...");
        watcher.run(token.clone(), poll_interval(), on_tick).await
    }

    /// Sync handler: a change set fully covered by the artifact's sync
    /// patterns is placed into running pods inline; anything else marks the
    /// artifact dirty for the tick decision.
    fn artifact_handler(
        &self,
        artifact: &Artifact,
        changed: &Arc<Mutex<ChangeSet>>,
    ) -> ChangeHandler {
        let artifact = artifact.clone();
        let syncer = Arc::clone(&self.syncer);
        let out = Arc::clone(&self.out);
        let changed = Arc::clone(changed);
        Box::new(move |events| -> BoxFuture<'static, Result<()>> {
            match changes::should_sync(&artifact, &events) {
                Ok(true) => {
                    let artifact = artifact.clone();
                    let syncer = Arc::clone(&syncer);
                    let out = Arc::clone(&out);
                    Box::pin(async move {
                        let mut to_copy = events.added.clone();
                        to_copy.extend(events.modified.iter().cloned());
                        syncer
                            .copy(&artifact.image_name, &to_copy)
                            .await
                            .context("copying files")?;
                        syncer
                            .delete(&artifact.image_name, &events.deleted)
                            .await
                            .context("deleting files")?;
                        out.write_line("Synced files.");
                        counter!("syncs_total", 1u64);
                        Ok(())
                    })
                }
                Ok(false) => {
                    changed.lock().unwrap().add_dirty(&artifact);
                    Box::pin(async { anyhow::Ok(()) })
                }
                Err(e) => Box::pin(async move { Err::<(), _>(e).context("checking sync files") }),
            }
        })
    }
}

struct TickCtx {
    builder: Arc<dyn Builder>,
    deployer: Arc<dyn Deployer>,
    tagger: Arc<dyn Tagger>,
    out: Arc<Output>,
    builds: Arc<Mutex<Vec<BuildResult>>>,
    changed: Arc<Mutex<ChangeSet>>,
    images: ImageList,
    logger: Arc<LogAggregator>,
    token: CancellationToken,
    labels: Labels,
    namespace: Option<String>,
    notification: bool,
}

/// The on-tick decision: reload > dirty artifacts > redeploy. Build output
/// is never interleaved with container logs; the aggregator stays muted on
/// failed rounds so the status line is what the developer sees.
async fn tick(ctx: Arc<TickCtx>) -> Result<()> {
    let pending = ctx.changed.lock().unwrap().take();
    ctx.logger.mute();
    let mut round_ok = true;

    if pending.needs_reload {
        ctx.logger.stop();
        return Err(SkiffError::ConfigurationChanged.into());
    }

    if !pending.dirty.is_empty() {
        counter!("dev_builds_total", 1u64);
        info!(artifacts = pending.dirty.len(), "rebuilding dirty artifacts");
        match ctx
            .builder
            .build(&ctx.token, &ctx.out, ctx.tagger.as_ref(), &pending.dirty)
            .await
        {
            Ok(results) => {
                merge_into(&ctx.builds, results);
                round_ok = deploy_current(&ctx).await;
            }
            Err(e) => {
                warn!(error = %e, "skipping deploy due to build error");
                round_ok = false;
            }
        }
    } else if pending.needs_redeploy {
        round_ok = deploy_current(&ctx).await;
    }

    ctx.out.write_line("Watching for changes...");
    if round_ok {
        ctx.logger.unmute();
    }
    Ok(())
}

async fn deploy_current(ctx: &TickCtx) -> bool {
    counter!("dev_deploys_total", 1u64);
    let table = ctx.builds.lock().unwrap().clone();
    match ctx.deployer.deploy(&ctx.token, &ctx.out, &table).await {
        Ok(deployed) => {
            finish_deploy(
                &ctx.images,
                &ctx.labels,
                ctx.namespace.as_deref(),
                &table,
                &deployed,
                &ctx.out,
                ctx.notification,
            )
            .await;
            true
        }
        Err(e) => {
            warn!(error = %e, "skipping deploy due to error");
            false
        }
    }
}

/// Post-deploy bookkeeping: label applied objects, then broadcast the tags
/// so the log aggregator and port-forwarder re-target. The broadcast
/// happens-after the deploy it corresponds to.
async fn finish_deploy(
    images: &ImageList,
    labels: &Labels,
    namespace: Option<&str>,
    table: &[BuildResult],
    deployed: &[DeployedResource],
    out: &Output,
    notification: bool,
) {
    skiff_kube::labels::apply_labels(labels, namespace, deployed).await;
    for build in table {
        images.add(&build.tag);
    }
    if notification {
        out.write_raw("\u{0007}");
    }
}

/// An empty filter list watches everything.
pub fn watch_filter_matches(filters: &[String], image_name: &str) -> bool {
    filters.is_empty() || filters.iter().any(|expr| image_name.contains(expr.as_str()))
}

fn merge_into(builds: &Mutex<Vec<BuildResult>>, new: Vec<BuildResult>) {
    let mut table = builds.lock().unwrap();
    let merged = merge_with_previous(new, &table);
    *table = merged;
}

/// New results overwrite previous ones by image name; untouched images keep
/// their previous tag.
pub fn merge_with_previous(new: Vec<BuildResult>, previous: &[BuildResult]) -> Vec<BuildResult> {
    let mut merged: Vec<BuildResult> = Vec::with_capacity(new.len() + previous.len());
    for result in new {
        match merged.iter_mut().find(|m| m.image_name == result.image_name) {
            Some(existing) => *existing = result,
            None => merged.push(result),
        }
    }
    for prev in previous {
        if !merged.iter().any(|m| m.image_name == prev.image_name) {
            merged.push(prev.clone());
        }
    }
    merged
}
