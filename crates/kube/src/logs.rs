//! Log aggregation: follows logs of every pod whose container image is in
//! the image list, multiplexing colorized lines into the session sink.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use futures::{Stream, StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams, LogParams, WatchParams};
use kube::core::WatchEvent;
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use skiff_core::Output;

use crate::image_list::{ImageEvent, ImageList};

/// Fixed ANSI palette; a pod's color is derived from the image name so it is
/// stable across restarts.
const PALETTE: [u8; 7] = [36, 32, 35, 33, 34, 91, 96];

#[derive(Debug, Clone, Copy)]
pub struct ColorPicker;

impl ColorPicker {
    pub fn pick(image: &str) -> u8 {
        let sum = image.bytes().fold(0usize, |acc, b| acc.wrapping_add(b as usize));
        PALETTE[sum % PALETTE.len()]
    }

    pub fn colorize(code: u8, text: &str) -> String {
        format!("\x1b[{}m{}\x1b[0m", code, text)
    }
}

/// Output gate. While muted, lines are dropped, not queued, so unmuting
/// never replays a build's worth of container noise.
pub struct Sink {
    out: Arc<Output>,
    muted: AtomicBool,
}

impl Sink {
    pub fn new(out: Arc<Output>) -> Arc<Self> {
        Arc::new(Self {
            out,
            muted: AtomicBool::new(false),
        })
    }

    pub fn mute(&self) {
        self.muted.store(true, Ordering::SeqCst);
    }

    pub fn unmute(&self) {
        self.muted.store(false, Ordering::SeqCst);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    fn write_line(&self, line: &str) {
        if !self.is_muted() {
            self.out.write_line(line);
        }
    }
}

type FollowKey = (String, String); // (pod, container)

struct Follow {
    image: String,
    token: CancellationToken,
}

struct Inner {
    sink: Arc<Sink>,
    images: ImageList,
    namespace: Option<String>,
    follows: Mutex<HashMap<FollowKey, Follow>>,
}

pub struct LogAggregator {
    inner: Arc<Inner>,
    stop: CancellationToken,
}

impl LogAggregator {
    pub fn new(out: Arc<Output>, images: ImageList, namespace: Option<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                sink: Sink::new(out),
                images,
                namespace,
                follows: Mutex::new(HashMap::new()),
            }),
            stop: CancellationToken::new(),
        }
    }

    pub fn mute(&self) {
        self.inner.sink.mute();
    }

    pub fn unmute(&self) {
        self.inner.sink.unmute();
    }

    pub fn is_muted(&self) -> bool {
        self.inner.sink.is_muted()
    }

    /// Spawn the pod watch and the image-list subscription. Both tasks heal
    /// themselves with backoff while the session lives; `stop` or the
    /// session token ends them.
    pub fn start(&self, session: &CancellationToken) {
        let token = self.stop.clone();
        let session = session.clone();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::select! {
                _ = session.cancelled() => {}
                _ = token.cancelled() => {}
                _ = run(inner.clone()) => {}
            }
            inner.cancel_all();
            info!("log aggregator stopped");
        });
    }

    /// Ends every follow and the pod watch.
    pub fn stop(&self) {
        self.stop.cancel();
    }
}

impl Inner {
    fn cancel_all(&self) {
        let mut follows = self.follows.lock().unwrap();
        for (_, follow) in follows.drain() {
            follow.token.cancel();
        }
    }

    fn cancel_image(&self, image: &str) {
        let mut follows = self.follows.lock().unwrap();
        follows.retain(|key, follow| {
            if follow.image == image {
                debug!(pod = %key.0, container = %key.1, "ending follow for removed image");
                follow.token.cancel();
                false
            } else {
                true
            }
        });
    }

    async fn follow(&self, api: Api<Pod>, key: FollowKey, token: CancellationToken) {
        use tokio_util::compat::FuturesAsyncReadCompatExt;
        use tokio_util::io::ReaderStream;

        let (pod, container) = &key;
        let mut lp = LogParams::default();
        lp.follow = true;
        lp.container = Some(container.clone());
        lp.tail_lines = Some(
            std::env::var("SKIFF_LOG_TAIL_LINES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
        );

        info!(pod = %pod, container = %container, "following logs");
        let reader = match api.log_stream(pod, &lp).await {
            Ok(r) => r,
            Err(e) => {
                warn!(pod = %pod, container = %container, error = %e, "log stream failed to open");
                return;
            }
        };
        let stream = ReaderStream::new(reader.compat());
        let color = ColorPicker::pick(pod);
        let prefix = ColorPicker::colorize(color, &format!("[{} {}]", pod, container));
        pump_lines(stream, &self.sink, &prefix, token).await;
        debug!(pod = %pod, container = %container, "follow ended");
    }
}

async fn run(inner: Arc<Inner>) {
    let images_task = {
        let inner = Arc::clone(&inner);
        async move {
            let mut rx = inner.images.subscribe();
            loop {
                match rx.recv().await {
                    Ok(ImageEvent::Added(_)) => {
                        if let Ok(api) = pod_api(&inner.namespace).await {
                            rescan(&inner, &api).await;
                        }
                    }
                    Ok(ImageEvent::Removed(image)) => inner.cancel_image(&image),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "image events lagged; rescanning");
                        if let Ok(api) = pod_api(&inner.namespace).await {
                            rescan(&inner, &api).await;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
        }
    };

    let watch_task = {
        let inner = Arc::clone(&inner);
        async move {
            let backoff_max: u64 = std::env::var("SKIFF_WATCH_BACKOFF_MAX_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(30);
            let mut backoff: u64 = 1;
            loop {
                match watch_pods(&inner).await {
                    Ok(()) => backoff = 1,
                    Err(e) => {
                        warn!(error = %e, "pod watch failed; will backoff and restart");
                        counter!("pod_watch_errors_total", 1u64);
                    }
                }
                tokio::time::sleep(std::time::Duration::from_secs(backoff)).await;
                backoff = (backoff * 2).min(backoff_max);
            }
        }
    };

    tokio::join!(images_task, watch_task);
}

async fn pod_api(namespace: &Option<String>) -> Result<Api<Pod>> {
    let client = crate::client().await?;
    Ok(match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    })
}

async fn rescan(inner: &Arc<Inner>, api: &Api<Pod>) {
    match api.list(&ListParams::default()).await {
        Ok(pods) => {
            for pod in pods.items.iter() {
                consider(inner, api, pod);
            }
        }
        Err(e) => warn!(error = %e, "pod list failed"),
    }
}

/// Start follows for any container of `pod` whose image is tracked.
fn consider(inner: &Arc<Inner>, api: &Api<Pod>, pod: &Pod) {
    if pod.metadata.deletion_timestamp.is_some() {
        return;
    }
    let Some(pod_name) = pod.metadata.name.clone() else {
        return;
    };
    let containers = pod
        .spec
        .as_ref()
        .map(|s| s.containers.as_slice())
        .unwrap_or(&[]);
    for container in containers {
        let Some(image) = container.image.clone() else {
            continue;
        };
        if !inner.images.selects(&image) {
            continue;
        }
        let key = (pod_name.clone(), container.name.clone());
        let mut follows = inner.follows.lock().unwrap();
        if follows.contains_key(&key) {
            continue;
        }
        let token = CancellationToken::new();
        follows.insert(
            key.clone(),
            Follow {
                image: image.clone(),
                token: token.clone(),
            },
        );
        drop(follows);

        counter!("log_follows_total", 1u64);
        let this = Arc::clone(inner);
        let api = api.clone();
        tokio::spawn(async move {
            this.follow(api, key.clone(), token).await;
            this.follows.lock().unwrap().remove(&key);
        });
    }
}

async fn watch_pods(inner: &Arc<Inner>) -> Result<()> {
    let api = pod_api(&inner.namespace).await?;
    rescan(inner, &api).await;

    let stream = api.watch(&WatchParams::default(), "0").await?;
    futures::pin_mut!(stream);
    while let Some(event) = stream.try_next().await? {
        match event {
            WatchEvent::Added(pod) | WatchEvent::Modified(pod) => consider(inner, &api, &pod),
            WatchEvent::Deleted(_) | WatchEvent::Bookmark(_) => {}
            WatchEvent::Error(e) => {
                warn!(code = e.code, message = %e.message, "pod watch error event");
                break;
            }
        }
    }
    Ok(())
}

/// Consume a byte stream, split into lines and write each through the sink
/// with the colored prefix. Flushes the final partial line on end.
async fn pump_lines<S, E>(stream: S, sink: &Sink, prefix: &str, token: CancellationToken)
where
    S: Stream<Item = std::result::Result<bytes::Bytes, E>>,
    E: std::fmt::Display,
{
    let stream = stream.fuse();
    futures::pin_mut!(stream);
    let mut buf = bytes::BytesMut::new();
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            next = stream.next() => {
                match next {
                    Some(Ok(chunk)) => {
                        buf.extend_from_slice(&chunk);
                        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                            let line = buf.split_to(pos);
                            let _ = buf.split_to(1); // drop '\n'
                            if let Ok(s) = std::str::from_utf8(&line) {
                                sink.write_line(&format!("{} {}", prefix, s));
                            }
                        }
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "log stream error");
                        break;
                    }
                    None => break,
                }
            }
        }
    }
    if !buf.is_empty() {
        if let Ok(s) = std::str::from_utf8(&buf) {
            sink.write_line(&format!("{} {}", prefix, s));
        }
    }
}
