//! Child-process transport: newline-delimited JSON over the child's stdio.

use std::ffi::OsStr;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::RenderError;
use super::bridge::{RendererBridge, WorkerLink};
use super::protocol::{WorkerCommand, WorkerEvent};

/// Spawn `program args…` as a renderer worker. The child must run
/// [`super::serve_stdio`]; its stderr is inherited for logging.
pub fn spawn_process<P, I, S>(program: P, args: I) -> Result<RendererBridge, RenderError>
where
    P: AsRef<OsStr>,
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| RenderError::Init(format!("failed to spawn renderer process: {err}")))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| RenderError::Init("renderer stdin unavailable".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| RenderError::Init("renderer stdout unavailable".to_string()))?;
    let pid = child.id();

    let (command_tx, mut command_rx) = mpsc::unbounded_channel::<WorkerCommand>();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (kill_tx, kill_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        let mut stdin = stdin;
        while let Some(command) = command_rx.recv().await {
            let mut line = match serde_json::to_vec(&command) {
                Ok(line) => line,
                Err(err) => {
                    warn!(error = %err, "Failed to encode renderer command");
                    continue;
                }
            };
            line.push(b'\n');
            if let Err(err) = stdin.write_all(&line).await {
                warn!(error = %err, "Renderer stdin closed");
                break;
            }
            if let Err(err) = stdin.flush().await {
                warn!(error = %err, "Renderer stdin flush failed");
                break;
            }
        }
    });

    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => match serde_json::from_str::<WorkerEvent>(&line) {
                    Ok(event) => {
                        if event_tx.send(event).is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!(error = %err, "Ignoring malformed renderer event"),
                },
                Ok(None) => break,
                Err(err) => {
                    warn!(error = %err, "Renderer stdout failed");
                    break;
                }
            }
        }
        debug!("Renderer stdout closed");
    });

    tokio::spawn(async move {
        let killed = tokio::select! {
            status = child.wait() => {
                match status {
                    Ok(status) => info!(?pid, %status, "Renderer process exited"),
                    Err(err) => warn!(?pid, error = %err, "Failed to wait for renderer process"),
                }
                false
            }
            _ = kill_rx => true,
        };
        if killed && let Err(err) = child.kill().await {
            warn!(?pid, error = %err, "Failed to kill renderer process");
        }
    });

    debug!(?pid, "Spawned renderer process");
    Ok(RendererBridge::start(WorkerLink {
        commands: command_tx,
        events: event_rx,
        kill: Some(kill_tx),
    }))
}
