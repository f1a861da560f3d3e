//! Subprocess helpers. External binaries are the primary interface to
//! clusters and build tools, so their output is forwarded line by line into
//! the session's output sink.

use std::process::Stdio;

use anyhow::{anyhow, Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::debug;

use crate::Output;

/// Run `cmd`, streaming stdout and stderr into `out`. Fails on a non-zero
/// exit status.
pub async fn run_forwarding(cmd: Command, out: &Output) -> Result<()> {
    run_inner(cmd, None, out).await
}

/// Run `cmd` with `stdin` piped in, streaming output into `out`.
pub async fn run_with_stdin(cmd: Command, stdin: &[u8], out: &Output) -> Result<()> {
    run_inner(cmd, Some(stdin), out).await
}

/// Run `cmd` and capture stdout. Stderr is attached to the error on failure.
pub async fn run_capture(mut cmd: Command) -> Result<Vec<u8>> {
    debug!(cmd = ?cmd.as_std(), "running");
    let output = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .with_context(|| format!("spawning {:?}", cmd.as_std().get_program()))?;
    if !output.status.success() {
        return Err(anyhow!(
            "{:?} exited with {}: {}",
            cmd.as_std().get_program(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(output.stdout)
}

async fn run_inner(mut cmd: Command, stdin: Option<&[u8]>, out: &Output) -> Result<()> {
    debug!(cmd = ?cmd.as_std(), "running");
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });

    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawning {:?}", cmd.as_std().get_program()))?;

    if let Some(bytes) = stdin {
        let mut w = child.stdin.take().ok_or_else(|| anyhow!("stdin missing"))?;
        w.write_all(bytes).await.context("writing stdin")?;
        drop(w);
    }

    let stdout = child.stdout.take().ok_or_else(|| anyhow!("stdout missing"))?;
    let stderr = child.stderr.take().ok_or_else(|| anyhow!("stderr missing"))?;

    // Both pumps borrow the shared sink; lines stay whole because the sink
    // serializes writers.
    let pump_out = async {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            out.write_line(&line);
        }
    };
    let pump_err = async {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            out.write_line(&line);
        }
    };

    let (status, _, _) = tokio::join!(child.wait(), pump_out, pump_err);
    let status = status.context("waiting for child")?;
    if !status.success() {
        return Err(anyhow!(
            "{:?} exited with {}",
            cmd.as_std().get_program(),
            status
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn forwards_stdout_lines() {
        let (out, buf) = Output::buffer();
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo one; echo two 1>&2"]);
        run_forwarding(cmd, &out).await.expect("ok");
        let got = String::from_utf8(buf.lock().unwrap().clone()).unwrap();
        assert!(got.contains("one"));
        assert!(got.contains("two"));
    }

    #[tokio::test]
    async fn nonzero_exit_is_an_error() {
        let out = Output::sink();
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "exit 3"]);
        assert!(run_forwarding(cmd, &out).await.is_err());
    }

    #[tokio::test]
    async fn stdin_is_piped_through() {
        let (out, buf) = Output::buffer();
        let cmd = {
            let mut c = Command::new("cat");
            c.arg("-");
            c
        };
        run_with_stdin(cmd, b"piped\n", &out).await.expect("ok");
        let got = String::from_utf8(buf.lock().unwrap().clone()).unwrap();
        assert!(got.contains("piped"));
    }

    #[tokio::test]
    async fn capture_returns_stdout_and_errors_carry_stderr() {
        let mut ok = Command::new("sh");
        ok.args(["-c", "printf hello"]);
        assert_eq!(run_capture(ok).await.unwrap(), b"hello");

        let mut bad = Command::new("sh");
        bad.args(["-c", "echo oops 1>&2; exit 1"]);
        let err = run_capture(bad).await.unwrap_err().to_string();
        assert!(err.contains("oops"), "err={}", err);
    }
}
