//! Concurrent set of image references the streaming services care about.
//! Membership changes fan out over a broadcast channel so the log
//! aggregator and port-forwarder can re-target without polling.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageEvent {
    Added(String),
    Removed(String),
}

#[derive(Clone)]
pub struct ImageList {
    inner: Arc<Mutex<HashSet<String>>>,
    tx: broadcast::Sender<ImageEvent>,
}

impl Default for ImageList {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageList {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Mutex::new(HashSet::new())),
            tx,
        }
    }

    /// Returns true when the image was not present before. Broadcasts only
    /// on actual insertion.
    pub fn add(&self, image: &str) -> bool {
        let inserted = self.inner.lock().unwrap().insert(image.to_string());
        if inserted {
            let _ = self.tx.send(ImageEvent::Added(image.to_string()));
        }
        inserted
    }

    pub fn remove(&self, image: &str) -> bool {
        let removed = self.inner.lock().unwrap().remove(image);
        if removed {
            let _ = self.tx.send(ImageEvent::Removed(image.to_string()));
        }
        removed
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ImageEvent> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> HashSet<String> {
        self.inner.lock().unwrap().clone()
    }

    /// True when a container image field belongs to a tracked image: tracked
    /// entries are tags like `myapp:abc`, container fields may also carry a
    /// digest suffix.
    pub fn selects(&self, container_image: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .iter()
            .any(|tracked| container_image.starts_with(tracked.as_str()))
    }
}
