//! Child-process transport: newline-delimited JSON-RPC over stdio (§4.7).

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex, Notify};
use tracing::{debug, warn};

use funnel_protocol::TransportError;

use crate::base::{BaseClientTransport, ClientTransportOps, SinkSlot, TransportSink};
use crate::config::ReconnectionPolicy;
use crate::correlator::MessageCorrelator;

/// §4.7's grace period between `SIGTERM` and the `SIGKILL` escalation.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Matches the line a Node `--inspect-brk` child writes once its debugger is
/// ready, e.g. `Debugger listening on ws://127.0.0.1:9229/...`.
const DEBUGGER_LISTENING_PREFIX: &str = "Debugger listening on ";

/// The stdio half of a transport: spawns `command`, writes requests to its
/// stdin, and reads newline-delimited JSON-RPC frames from its stdout.
///
/// The spawned `Child` is owned exclusively by a background task so its
/// `wait()` future can double as both exit detection and the mechanism
/// `close_connection` uses to tear it down; there is no `Mutex<Child>` to
/// contend on.
pub struct StdioOps {
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    stdin: Mutex<Option<ChildStdin>>,
    closing: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    shutdown_done: Mutex<Option<oneshot::Receiver<()>>>,
    sink: Arc<SinkSlot>,
}

impl StdioOps {
    /// Builds an unstarted stdio transport for `command args...`, with `env`
    /// merged on top of the inherited environment.
    pub fn new(command: impl Into<String>, args: Vec<String>, env: HashMap<String, String>) -> Self {
        Self {
            command: command.into(),
            args,
            env,
            stdin: Mutex::new(None),
            closing: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
            shutdown_done: Mutex::new(None),
            sink: Arc::new(SinkSlot::new()),
        }
    }

    fn spawn_stdout_reader(&self, stdout: tokio::process::ChildStdout, sink: Arc<SinkSlot>) {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        sink.ingest(line.as_bytes());
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!(error = %err, "stdout read failed");
                        break;
                    }
                }
            }
        });
    }

    fn spawn_stderr_reader(&self, stderr: tokio::process::ChildStderr) {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(url) = line.strip_prefix(DEBUGGER_LISTENING_PREFIX) {
                    tracing::info!(url, "child process debugger listening");
                } else {
                    debug!(target: "stdio_child_stderr", "{line}");
                }
            }
        });
    }

    /// Owns `child` for its entire lifetime: races its natural exit against
    /// a shutdown request from `close_connection`, escalating to a kill if
    /// the process doesn't exit within the grace period.
    fn spawn_lifecycle(
        child: Child,
        sink: Arc<SinkSlot>,
        closing: Arc<AtomicBool>,
        shutdown: Arc<Notify>,
        done_tx: oneshot::Sender<()>,
    ) {
        tokio::spawn(async move {
            let mut child = child;
            tokio::select! {
                status = child.wait() => {
                    if !closing.swap(true, Ordering::SeqCst) {
                        let message = match status {
                            Ok(status) => format!("child process exited unexpectedly: {status}"),
                            Err(err) => format!("failed to wait on child process: {err}"),
                        };
                        sink.report_error(TransportError::ConnectionReset(message));
                    }
                }
                _ = shutdown.notified() => {
                    closing.store(true, Ordering::SeqCst);
                    send_sigterm(&child);
                    if tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await.is_err() {
                        let _ = child.start_kill();
                        let _ = child.wait().await;
                    }
                }
            }
            let _ = done_tx.send(());
        });
    }
}

/// Sends `SIGTERM` to `child`, giving it a chance to exit cleanly before the
/// grace period elapses and `start_kill` escalates to `SIGKILL`. A no-op if
/// the child has already exited or (on non-Unix targets) unsupported.
#[cfg(unix)]
fn send_sigterm(child: &Child) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn send_sigterm(_child: &Child) {}

#[async_trait]
impl ClientTransportOps for StdioOps {
    async fn connect(&self) -> Result<(), TransportError> {
        let mut command = Command::new(&self.command);
        command
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|err| TransportError::ConnectionFailed(err.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::ConnectionFailed("child stdin not piped".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::ConnectionFailed("child stdout not piped".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TransportError::ConnectionFailed("child stderr not piped".to_string()))?;

        self.closing.store(false, Ordering::SeqCst);
        *self.stdin.lock().await = Some(stdin);

        self.spawn_stdout_reader(stdout, self.sink.clone());
        self.spawn_stderr_reader(stderr);

        let (done_tx, done_rx) = oneshot::channel();
        *self.shutdown_done.lock().await = Some(done_rx);
        Self::spawn_lifecycle(
            child,
            self.sink.clone(),
            self.closing.clone(),
            self.shutdown.clone(),
            done_tx,
        );

        Ok(())
    }

    async fn send_message(&self, mut bytes: Vec<u8>) -> Result<(), TransportError> {
        bytes.push(b'\n');
        let mut guard = self.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            return Err(TransportError::ConnectionFailed(
                "stdio transport not connected".to_string(),
            ));
        };
        stdin
            .write_all(&bytes)
            .await
            .map_err(|err| TransportError::ConnectionReset(err.to_string()))?;
        stdin
            .flush()
            .await
            .map_err(|err| TransportError::ConnectionReset(err.to_string()))
    }

    async fn close_connection(&self) {
        self.closing.store(true, Ordering::SeqCst);
        // Dropping stdin first gives well-behaved servers a chance to exit
        // on EOF before the grace period escalates to a kill.
        self.stdin.lock().await.take();
        self.shutdown.notify_one();
        if let Some(done_rx) = self.shutdown_done.lock().await.take() {
            let _ = done_rx.await;
        }
    }
}

/// Constructs a fully-wired stdio transport: the `BaseClientTransport` and
/// its `StdioOps` are bound together so the background read loop can feed
/// frames back through the correlator.
pub fn build(
    command: impl Into<String>,
    args: Vec<String>,
    env: HashMap<String, String>,
    correlator: MessageCorrelator,
    reconnect_policy: ReconnectionPolicy,
) -> Arc<BaseClientTransport<StdioOps>> {
    let ops = StdioOps::new(command, args, env);
    let sink = ops.sink.clone();
    let base = Arc::new(BaseClientTransport::new(
        ops,
        correlator,
        Arc::new(crate::reconnect::ReconnectionManager::new(reconnect_policy)),
        None,
    ));
    sink.bind(base.clone() as Arc<dyn TransportSink>);
    base
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_a_line_through_cat() {
        let correlator = MessageCorrelator::new(Duration::from_secs(5));
        let transport = build(
            "cat",
            vec![],
            HashMap::new(),
            correlator,
            ReconnectionPolicy::disabled(),
        );
        transport.start().await.expect("cat should spawn");

        let mut events = transport.subscribe();
        let response = serde_json::json!({"jsonrpc":"2.0","id":1,"result":"pong"});
        transport
            .send_non_request(&funnel_protocol::JsonRpcMessage::parse(response.to_string().as_bytes()).unwrap())
            .await
            .expect("write to cat's stdin");

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("event within timeout")
            .expect("event channel open");
        // `cat` echoes our own frame back as if it were the remote's
        // response to request id 1, which the correlator has no pending
        // entry for, so it is dropped rather than emitted as an event; we
        // only assert that no spurious Error event fired.
        assert!(!matches!(event, crate::base::TransportEvent::Error(_)));

        transport.close().await;
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn close_sends_sigterm_before_grace_period_elapses() {
        let correlator = MessageCorrelator::new(Duration::from_secs(5));
        let transport = build(
            "sh",
            vec![
                "-c".to_string(),
                "trap 'exit 0' TERM; while :; do sleep 1; done".to_string(),
            ],
            HashMap::new(),
            correlator,
            ReconnectionPolicy::disabled(),
        );
        transport.start().await.expect("sh should spawn");

        let start = std::time::Instant::now();
        transport.close().await;
        // The child ignores stdin EOF and only exits on its `TERM` trap, so
        // this only returns quickly if `SIGTERM` was actually sent; without
        // it shutdown would stall until the `SIGKILL` escalation.
        assert!(start.elapsed() < SHUTDOWN_GRACE);
    }

    #[tokio::test]
    async fn connect_failure_on_missing_binary_is_connection_failed() {
        let correlator = MessageCorrelator::new(Duration::from_secs(5));
        let transport = build(
            "definitely-not-a-real-binary-xyz",
            vec![],
            HashMap::new(),
            correlator,
            ReconnectionPolicy::disabled(),
        );
        let err = transport.start().await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectionFailed(_)));
    }
}
