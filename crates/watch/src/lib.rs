//! Polling file watcher: snapshots dependency sets, diffs them each tick and
//! drives registered change handlers.
//!
//! Polling is deliberate: dependency sets are computed (a Dockerfile parse,
//! a deployer's manifest glob) and may change between ticks, so every tick
//! re-invokes the dependency thunk before re-statting. Kernel notification
//! APIs cannot watch a set that does not exist yet.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Paths that changed between two ticks, coalesced. Sorted for stable
/// handler input.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchEvents {
    pub added: Vec<PathBuf>,
    pub modified: Vec<PathBuf>,
    pub deleted: Vec<PathBuf>,
}

impl WatchEvents {
    pub fn has_changed(&self) -> bool {
        !(self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty())
    }

    /// added ∪ modified ∪ deleted
    pub fn all(&self) -> Vec<PathBuf> {
        let mut out = Vec::with_capacity(self.added.len() + self.modified.len() + self.deleted.len());
        out.extend(self.added.iter().cloned());
        out.extend(self.modified.iter().cloned());
        out.extend(self.deleted.iter().cloned());
        out
    }
}

/// Thunk producing the component's current dependency path set. Dependency
/// listing may shell out (a bazel query, a manifest glob), so it yields a
/// future instead of blocking the poll loop.
pub type DepSource = Box<dyn Fn() -> BoxFuture<'static, Result<Vec<PathBuf>>> + Send>;

/// Invoked with the coalesced diff whenever a tick observes one.
pub type ChangeHandler = Box<dyn FnMut(WatchEvents) -> BoxFuture<'static, Result<()>> + Send>;

/// Invoked once per tick after all handlers, when at least one fired.
pub type TickHandler = Box<dyn FnMut() -> BoxFuture<'static, Result<()>> + Send>;

/// Watch registry contract. The poll implementation is the only production
/// one; tests drive the runner with scripted implementations.
#[async_trait]
pub trait Watcher: Send {
    async fn register(&mut self, deps: DepSource, on_change: ChangeHandler) -> Result<()>;

    async fn run(
        &mut self,
        token: CancellationToken,
        poll_interval: Duration,
        on_tick: TickHandler,
    ) -> Result<()>;
}

pub type WatcherFactory = Box<dyn Fn() -> Box<dyn Watcher> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileState {
    mtime: Option<SystemTime>,
    len: u64,
}

type FileSnapshot = HashMap<PathBuf, FileState>;

struct Component {
    deps: DepSource,
    on_change: ChangeHandler,
    snapshot: FileSnapshot,
}

/// The production registry: components fire in registration order within a
/// tick; cancellation is observed between ticks only.
#[derive(Default)]
pub struct PollWatcher {
    components: Vec<Component>,
}

impl PollWatcher {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Watcher for PollWatcher {
    async fn register(&mut self, deps: DepSource, on_change: ChangeHandler) -> Result<()> {
        let paths = deps().await.context("listing watch dependencies")?;
        let snapshot = stat_paths(&paths);
        debug!(files = snapshot.len(), "watch component registered");
        self.components.push(Component {
            deps,
            on_change,
            snapshot,
        });
        Ok(())
    }

    async fn run(
        &mut self,
        token: CancellationToken,
        poll_interval: Duration,
        mut on_tick: TickHandler,
    ) -> Result<()> {
        loop {
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                _ = tokio::time::sleep(poll_interval) => {}
            }

            let mut fired = false;
            for component in self.components.iter_mut() {
                let paths = (component.deps)().await.context("listing watch dependencies")?;
                let next = stat_paths(&paths);
                let events = diff(&component.snapshot, &next);
                if events.has_changed() {
                    fired = true;
                    counter!("watch_events_total", 1u64);
                    debug!(
                        added = events.added.len(),
                        modified = events.modified.len(),
                        deleted = events.deleted.len(),
                        "files changed"
                    );
                    if let Err(e) = (component.on_change)(events).await {
                        warn!(error = %e, "change handler failed");
                    }
                }
                component.snapshot = next;
            }

            counter!("watch_ticks_total", 1u64);
            if fired {
                on_tick().await?;
            }
        }
    }
}

/// Stat every path; paths that cannot be statted are treated as absent so a
/// later successful stat shows up as an addition.
fn stat_paths(paths: &[PathBuf]) -> FileSnapshot {
    let mut snapshot = FileSnapshot::with_capacity(paths.len());
    for path in paths {
        if let Ok(meta) = std::fs::metadata(path) {
            snapshot.insert(
                path.clone(),
                FileState {
                    mtime: meta.modified().ok(),
                    len: meta.len(),
                },
            );
        }
    }
    snapshot
}

fn diff(old: &FileSnapshot, new: &FileSnapshot) -> WatchEvents {
    let mut events = WatchEvents::default();
    for (path, state) in new {
        match old.get(path) {
            None => events.added.push(path.clone()),
            Some(prev) if prev != state => events.modified.push(path.clone()),
            Some(_) => {}
        }
    }
    for path in old.keys() {
        if !new.contains_key(path) {
            events.deleted.push(path.clone());
        }
    }
    events.added.sort();
    events.modified.sort();
    events.deleted.sort();
    events
}
