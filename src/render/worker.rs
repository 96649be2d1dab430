//! Worker side of the renderer: the command loop plus its two hosts, a
//! dedicated OS thread and a child process speaking JSON lines on stdio.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tracing::{debug, error, warn};

use super::RenderError;
use super::bridge::{RendererBridge, WorkerLink};
use super::origin::{Origin, OriginFactory};
use super::protocol::{WorkerCommand, WorkerEvent};

const THREAD_NAME: &str = "next-boost-renderer";

/// Process commands until `Shutdown` or until the command stream ends.
///
/// Renders run concurrently on the worker's runtime.
pub(crate) async fn run_worker<F>(
    factory: F,
    mut commands: mpsc::UnboundedReceiver<WorkerCommand>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) where
    F: OriginFactory,
{
    let mut origin: Option<Arc<dyn Origin>> = None;

    while let Some(command) = commands.recv().await {
        match command {
            WorkerCommand::Init { args } => {
                let event = match factory.create(args).await {
                    Ok(created) => {
                        origin = Some(created);
                        WorkerEvent::Ready
                    }
                    Err(err) => WorkerEvent::InitFailed {
                        error: err.to_string(),
                    },
                };
                if events.send(event).is_err() {
                    break;
                }
            }
            WorkerCommand::Render { id, request } => {
                let Some(origin) = origin.clone() else {
                    let _ = events.send(WorkerEvent::Failed {
                        id,
                        error: "renderer not initialized".to_string(),
                    });
                    continue;
                };
                let events = events.clone();
                // the render runs in its own task so a panicking origin still answers
                let render = tokio::spawn(async move { origin.handle(request).await });
                tokio::spawn(async move {
                    let event = match render.await {
                        Ok(Ok(result)) => WorkerEvent::Rendered { id, result },
                        Ok(Err(err)) => WorkerEvent::Failed {
                            id,
                            error: err.to_string(),
                        },
                        Err(err) => {
                            warn!(%id, error = %err, "Render task aborted");
                            WorkerEvent::Failed {
                                id,
                                error: panic_message(err),
                            }
                        }
                    };
                    let _ = events.send(event);
                });
            }
            WorkerCommand::Shutdown => {
                debug!("Renderer worker shutting down");
                break;
            }
        }
    }
}

fn panic_message(err: JoinError) -> String {
    if !err.is_panic() {
        return "render cancelled".to_string();
    }
    let payload = err.into_panic();
    let detail = payload
        .downcast_ref::<&str>()
        .map(|message| (*message).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned());
    match detail {
        Some(detail) => format!("renderer panicked: {detail}"),
        None => "renderer panicked".to_string(),
    }
}

/// Run the renderer on a dedicated OS thread with its own current-thread runtime.
pub fn spawn_thread<F>(factory: F) -> Result<RendererBridge, RenderError>
where
    F: OriginFactory + 'static,
{
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    std::thread::Builder::new()
        .name(THREAD_NAME.to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    error!(error = %err, "Failed to build renderer runtime");
                    return;
                }
            };
            runtime.block_on(run_worker(factory, command_rx, event_tx));
        })
        .map_err(|err| RenderError::Init(format!("failed to spawn renderer thread: {err}")))?;

    Ok(RendererBridge::start(WorkerLink {
        commands: command_tx,
        events: event_rx,
        kill: None,
    }))
}

/// Worker-process entry point: read commands from stdin, write events to stdout.
///
/// Returns when stdin closes or a `Shutdown` command arrives.
pub async fn serve_stdio<F>(factory: F) -> Result<(), RenderError>
where
    F: OriginFactory,
{
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<WorkerEvent>();

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(event) = event_rx.recv().await {
            let mut line = match serde_json::to_vec(&event) {
                Ok(line) => line,
                Err(err) => {
                    error!(error = %err, "Failed to encode renderer event");
                    continue;
                }
            };
            line.push(b'\n');
            if let Err(err) = stdout.write_all(&line).await {
                return Err(RenderError::Transport(format!("stdout write failed: {err}")));
            }
            if let Err(err) = stdout.flush().await {
                return Err(RenderError::Transport(format!("stdout flush failed: {err}")));
            }
        }
        Ok(())
    });

    let reader = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => match serde_json::from_str::<WorkerCommand>(&line) {
                    Ok(command) => {
                        if command_tx.send(command).is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!(error = %err, "Ignoring malformed renderer command"),
                },
                Ok(None) => break,
                Err(err) => {
                    warn!(error = %err, "Renderer stdin failed");
                    break;
                }
            }
        }
    });

    run_worker(factory, command_rx, event_tx).await;
    reader.abort();

    match writer.await {
        Ok(result) => result,
        Err(err) => Err(RenderError::Transport(format!("stdout writer panicked: {err}"))),
    }
}
