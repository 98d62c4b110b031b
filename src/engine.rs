//! The external compute engine, reduced to a five-operation contract.
//!
//! The slave loop is the sole owner of the engine handle and drives it
//! synchronously: open, put the payloads, evaluate one fixed expression, get
//! the results back, and (eventually) close. Everything that crosses this
//! boundary is an opaque byte blob.

use std::process::Stdio;

use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

/// The contract the slave loop requires of a compute engine.
///
/// A real interpreter wrapper implements this over whatever IPC it has;
/// [`ProcessEngine`] ships a stdio-pipe implementation, tests use a mock.
pub trait Engine {
    /// Starts the engine from its configured launch command. Idempotence is
    /// not required; the caller tracks whether the engine is up.
    async fn open(&mut self, cmd: &str) -> Result<()>;

    /// Stores a named blob inside the engine.
    async fn put(&mut self, name: &str, blob: &[u8]) -> Result<()>;

    /// Evaluates an expression inside the engine.
    async fn eval(&mut self, expr: &str) -> Result<()>;

    /// Retrieves a named blob from the engine.
    async fn get(&mut self, name: &str) -> Result<Bytes>;

    /// Shuts the engine down, forcefully if necessary.
    async fn close(&mut self) -> Result<()>;
}

/// An engine driven over the child process's stdin/stdout.
///
/// Requests are `put <name> <len>`, `eval <len>`, `get <name>`, or `quit`,
/// each on one line with `len` payload bytes following; replies are
/// `ok <len>` or `err <len>` lines with `len` payload bytes following.
#[derive(Default)]
pub struct ProcessEngine {
    proc: Option<EngineProc>,
}

struct EngineProc {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl ProcessEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn proc(&mut self) -> Result<&mut EngineProc> {
        self.proc.as_mut().ok_or_else(|| anyhow!("engine is not running"))
    }

    async fn request(&mut self, header: &str, payload: &[u8]) -> Result<Bytes> {
        let proc = self.proc()?;

        proc.stdin
            .write_all(header.as_bytes())
            .await
            .context("writing engine request")?;
        proc.stdin
            .write_all(payload)
            .await
            .context("writing engine payload")?;
        proc.stdin.flush().await.context("flushing engine stdin")?;

        let mut line = String::new();
        proc.stdout
            .read_line(&mut line)
            .await
            .context("reading engine reply")?;
        if line.is_empty() {
            bail!("engine closed its stdout");
        }

        let mut parts = line.split_whitespace();
        let verb = parts.next().unwrap_or("");
        let len: usize = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| anyhow!("malformed engine reply: {line:?}"))?;

        let mut body = vec![0u8; len];
        proc.stdout
            .read_exact(&mut body)
            .await
            .context("reading engine reply payload")?;

        match verb {
            "ok" => Ok(body.into()),
            "err" => bail!("engine error: {}", String::from_utf8_lossy(&body)),
            _ => bail!("malformed engine reply: {line:?}"),
        }
    }
}

impl Engine for ProcessEngine {
    async fn open(&mut self, cmd: &str) -> Result<()> {
        let mut words = cmd.split_whitespace();
        let program = words.next().ok_or_else(|| anyhow!("empty engine command"))?;

        let mut child = Command::new(program)
            .args(words)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning engine {program:?}"))?;

        // Panic safety: both pipes were requested above, so take() succeeds
        // on a freshly spawned child.
        let stdin = child.stdin.take().unwrap();
        let stdout = BufReader::new(child.stdout.take().unwrap());

        debug!(pid = child.id(), %cmd, "engine started");
        self.proc = Some(EngineProc {
            child,
            stdin,
            stdout,
        });
        Ok(())
    }

    async fn put(&mut self, name: &str, blob: &[u8]) -> Result<()> {
        self.request(&format!("put {name} {}\n", blob.len()), blob)
            .await
            .map(|_| ())
    }

    async fn eval(&mut self, expr: &str) -> Result<()> {
        self.request(&format!("eval {}\n", expr.len()), expr.as_bytes())
            .await
            .map(|_| ())
    }

    async fn get(&mut self, name: &str) -> Result<Bytes> {
        self.request(&format!("get {name}\n"), &[]).await
    }

    async fn close(&mut self) -> Result<()> {
        let Some(mut proc) = self.proc.take() else {
            return Ok(());
        };

        // Ask nicely, then reap; kill_on_drop covers an engine that ignores
        // the quit.
        let _ = proc.stdin.write_all(b"quit\n").await;
        let _ = proc.stdin.flush().await;
        drop(proc.stdin);

        match tokio::time::timeout(std::time::Duration::from_secs(5), proc.child.wait()).await {
            Ok(status) => {
                debug!(?status, "engine exited");
            },
            Err(_) => {
                warn!("engine ignored quit; killing");
                proc.child.kill().await.context("killing engine")?;
            },
        }

        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::mock::MockEngine;
    use super::*;

    #[tokio::test]
    async fn test_mock_reverses_argin() {
        let mut eng = MockEngine::default();
        eng.open("mock").await.unwrap();
        eng.put("argin", b"abc").await.unwrap();
        eng.put("options", b"xyz").await.unwrap();
        eng.eval("[argout, options] = peerexec(argin, options)")
            .await
            .unwrap();
        assert_eq!(eng.get("argout").await.unwrap().as_ref(), b"cba");
        assert_eq!(eng.get("options").await.unwrap().as_ref(), b"xyz");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_engine_spawn_failure() {
        let mut eng = ProcessEngine::new();
        assert!(eng
            .open("/nonexistent/definitely-not-an-engine")
            .await
            .is_err());
        // close after a failed open is a no-op
        eng.close().await.unwrap();
    }
}
