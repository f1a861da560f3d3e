use std::path::PathBuf;
use std::time::Duration;

use skiff_watch::{DepSource, PollWatcher, WatchEvents, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn write(path: &PathBuf, contents: &str) {
    std::fs::write(path, contents).expect("write");
}

fn static_deps(paths: Vec<PathBuf>) -> DepSource {
    Box::new(move || {
        let paths = paths.clone();
        Box::pin(async move { Ok(paths) })
    })
}

#[tokio::test]
async fn tick_reports_coalesced_changes_and_fires_on_tick_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let file_a = dir.path().join("a.txt");
    let file_b = dir.path().join("b.txt");
    write(&file_a, "1");

    let (change_tx, mut change_rx) = mpsc::unbounded_channel::<WatchEvents>();
    let (tick_tx, mut tick_rx) = mpsc::unbounded_channel::<()>();

    let mut watcher = PollWatcher::new();
    watcher
        .register(
            static_deps(vec![file_a.clone(), file_b.clone()]),
            Box::new(move |events| {
                let tx = change_tx.clone();
                Box::pin(async move {
                    let _ = tx.send(events);
                    Ok(())
                })
            }),
        )
        .await
        .expect("register");

    // Two changes between ticks coalesce into one event: b appears and a
    // changes size.
    write(&file_a, "22");
    write(&file_b, "1");

    let token = CancellationToken::new();
    let run_token = token.clone();
    let handle = tokio::spawn(async move {
        watcher
            .run(
                run_token,
                Duration::from_millis(30),
                Box::new(move || {
                    let tx = tick_tx.clone();
                    Box::pin(async move {
                        let _ = tx.send(());
                        Ok(())
                    })
                }),
            )
            .await
    });

    let events = tokio::time::timeout(Duration::from_secs(5), change_rx.recv())
        .await
        .expect("no event before timeout")
        .expect("channel open");
    assert_eq!(events.added, vec![dir.path().join("b.txt")]);
    assert_eq!(events.modified, vec![dir.path().join("a.txt")]);
    assert!(events.deleted.is_empty());

    tokio::time::timeout(Duration::from_secs(5), tick_rx.recv())
        .await
        .expect("no tick before timeout")
        .expect("channel open");

    token.cancel();
    let res = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("run did not stop")
        .expect("join");
    assert!(res.is_ok());
}

#[tokio::test]
async fn deleted_files_are_reported() {
    let dir = tempfile::tempdir().expect("tempdir");
    let file = dir.path().join("gone.txt");
    write(&file, "x");

    let (change_tx, mut change_rx) = mpsc::unbounded_channel::<WatchEvents>();
    let mut watcher = PollWatcher::new();
    watcher
        .register(
            static_deps(vec![file.clone()]),
            Box::new(move |events| {
                let tx = change_tx.clone();
                Box::pin(async move {
                    let _ = tx.send(events);
                    Ok(())
                })
            }),
        )
        .await
        .expect("register");

    let token = CancellationToken::new();
    let run_token = token.clone();
    let handle = tokio::spawn(async move {
        watcher
            .run(
                run_token,
                Duration::from_millis(30),
                Box::new(|| Box::pin(async { Ok(()) })),
            )
            .await
    });

    std::fs::remove_file(&file).expect("remove");

    let events = tokio::time::timeout(Duration::from_secs(5), change_rx.recv())
        .await
        .expect("no event before timeout")
        .expect("channel open");
    assert_eq!(events.deleted, vec![file]);

    token.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
}

#[tokio::test]
async fn dep_source_error_aborts_the_run() {
    let mut watcher = PollWatcher::new();
    // DepSource is Fn, not FnMut; keep the call counter in an atomic.
    let calls = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
    let deps: DepSource = Box::new(move || {
        let n = calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Box::pin(async move {
            if n == 0 {
                Ok(Vec::new())
            } else {
                Err(anyhow::anyhow!("dependency listing broke"))
            }
        })
    });

    watcher
        .register(deps, Box::new(|_| Box::pin(async { Ok(()) })))
        .await
        .expect("register");

    let token = CancellationToken::new();
    let res = tokio::time::timeout(
        Duration::from_secs(5),
        watcher.run(
            token,
            Duration::from_millis(10),
            Box::new(|| Box::pin(async { Ok(()) })),
        ),
    )
    .await
    .expect("run did not end");
    assert!(res.is_err());
}

#[tokio::test]
async fn handler_errors_do_not_abort_the_run() {
    let dir = tempfile::tempdir().expect("tempdir");
    let file = dir.path().join("f.txt");
    write(&file, "1");

    let (tick_tx, mut tick_rx) = mpsc::unbounded_channel::<()>();
    let mut watcher = PollWatcher::new();
    watcher
        .register(
            static_deps(vec![file.clone()]),
            Box::new(|_| Box::pin(async { Err(anyhow::anyhow!("handler failed")) })),
        )
        .await
        .expect("register");

    let token = CancellationToken::new();
    let run_token = token.clone();
    let handle = tokio::spawn(async move {
        watcher
            .run(
                run_token,
                Duration::from_millis(30),
                Box::new(move || {
                    let tx = tick_tx.clone();
                    Box::pin(async move {
                        let _ = tx.send(());
                        Ok(())
                    })
                }),
            )
            .await
    });

    write(&file, "22");

    // The tick still fires even though the handler errored.
    tokio::time::timeout(Duration::from_secs(5), tick_rx.recv())
        .await
        .expect("no tick before timeout")
        .expect("channel open");

    token.cancel();
    let res = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("run did not stop")
        .expect("join");
    assert!(res.is_ok());
}
