//! Change accumulation between poll ticks, and the sync predicate that
//! decides between an in-place sync and a rebuild.

use std::path::Path;

use anyhow::{Context, Result};
use globset::{Glob, GlobSetBuilder};
use skiff_core::Artifact;
use skiff_watch::WatchEvents;

/// State carried across handler invocations within one tick. Taken (and so
/// reset) when the tick acts on it.
#[derive(Default)]
pub struct ChangeSet {
    pub dirty: Vec<Artifact>,
    pub needs_redeploy: bool,
    pub needs_reload: bool,
}

impl ChangeSet {
    pub fn add_dirty(&mut self, artifact: &Artifact) {
        if !self.dirty.iter().any(|a| a.image_name == artifact.image_name) {
            self.dirty.push(artifact.clone());
        }
    }

    pub fn take(&mut self) -> ChangeSet {
        std::mem::take(self)
    }
}

/// True when the artifact's sync patterns fully cover the change set:
/// non-empty patterns and every changed path (including deletions) matches
/// at least one. Anything less requires a rebuild.
pub fn should_sync(artifact: &Artifact, events: &WatchEvents) -> Result<bool> {
    if !events.has_changed() || artifact.sync_patterns.is_empty() {
        return Ok(false);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in &artifact.sync_patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("bad sync pattern {:?}", pattern))?);
    }
    let set = builder.build().context("building sync pattern set")?;

    for path in events.all() {
        let rel: &Path = path.strip_prefix(&artifact.workspace).unwrap_or(&path);
        if !set.is_match(rel) {
            return Ok(false);
        }
    }
    Ok(true)
}
