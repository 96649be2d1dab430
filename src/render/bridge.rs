use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};
use uuid::Uuid;

use super::RenderError;
use super::mailbox::PendingRenders;
use super::protocol::{RenderRequest, RenderResult, WorkerCommand, WorkerEvent};
use crate::cache::lock::mutex_lock;

const SOURCE: &str = "render::bridge";

type InitSlot = Arc<Mutex<Option<oneshot::Sender<Result<(), RenderError>>>>>;

/// Transport endpoints of a running worker.
pub(crate) struct WorkerLink {
    pub(crate) commands: mpsc::UnboundedSender<WorkerCommand>,
    pub(crate) events: mpsc::UnboundedReceiver<WorkerEvent>,
    /// Forcibly terminates the worker when fired. Thread workers stop on `Shutdown`.
    pub(crate) kill: Option<oneshot::Sender<()>>,
}

/// Handle to an isolated renderer.
///
/// Renders are correlated by id, so any number may be outstanding at once. When
/// the worker goes away every outstanding and later render fails with
/// [`RenderError::WorkerExited`].
pub struct RendererBridge {
    commands: mpsc::UnboundedSender<WorkerCommand>,
    pending: PendingRenders,
    init_slot: InitSlot,
    init_sent: AtomicBool,
    kill: Mutex<Option<oneshot::Sender<()>>>,
}

impl RendererBridge {
    pub(crate) fn start(link: WorkerLink) -> Self {
        let pending = PendingRenders::new();
        let init_slot: InitSlot = Arc::new(Mutex::new(None));
        tokio::spawn(pump_events(link.events, pending.clone(), init_slot.clone()));

        Self {
            commands: link.commands,
            pending,
            init_slot,
            init_sent: AtomicBool::new(false),
            kill: Mutex::new(link.kill),
        }
    }

    /// Send startup arguments and wait until the worker reports ready.
    pub async fn init(&self, args: serde_json::Value) -> Result<(), RenderError> {
        if self.init_sent.swap(true, Ordering::AcqRel) {
            return Err(RenderError::Protocol("renderer already initialized".to_string()));
        }
        if self.pending.is_closed() {
            return Err(RenderError::WorkerExited("renderer closed before init".to_string()));
        }

        let (tx, rx) = oneshot::channel();
        *mutex_lock(&self.init_slot, SOURCE, "init") = Some(tx);
        if self.pending.is_closed() && mutex_lock(&self.init_slot, SOURCE, "init").take().is_some() {
            return Err(RenderError::WorkerExited("renderer closed before init".to_string()));
        }

        self.commands
            .send(WorkerCommand::Init { args })
            .map_err(|_| RenderError::WorkerExited("renderer closed before init".to_string()))?;

        rx.await
            .map_err(|_| RenderError::WorkerExited("renderer closed during init".to_string()))?
    }

    pub async fn render(&self, request: RenderRequest) -> Result<RenderResult, RenderError> {
        let id = Uuid::new_v4();
        let pending = self.pending.register(id)?;

        debug!(%id, method = %request.method, path = %request.path, "Dispatching render");
        self.commands
            .send(WorkerCommand::Render { id, request })
            .map_err(|_| RenderError::WorkerExited("renderer command channel closed".to_string()))?;

        pending.outcome().await
    }

    /// Terminate the worker. Outstanding renders fail once it is gone.
    pub fn kill(&self) {
        let _ = self.commands.send(WorkerCommand::Shutdown);
        if let Some(kill) = mutex_lock(&self.kill, SOURCE, "kill").take() {
            let _ = kill.send(());
        }
    }

    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.pending.is_closed()
    }
}

impl Drop for RendererBridge {
    fn drop(&mut self) {
        self.kill();
    }
}

async fn pump_events(
    mut events: mpsc::UnboundedReceiver<WorkerEvent>,
    pending: PendingRenders,
    init_slot: InitSlot,
) {
    let resolve_init = |outcome: Result<(), RenderError>| {
        if let Some(waiter) = mutex_lock(&init_slot, SOURCE, "resolve_init").take() {
            let _ = waiter.send(outcome);
        }
    };

    while let Some(event) = events.recv().await {
        match event {
            WorkerEvent::Ready => resolve_init(Ok(())),
            WorkerEvent::InitFailed { error } => resolve_init(Err(RenderError::Init(error))),
            WorkerEvent::Rendered { id, result } => {
                if !pending.deliver(&id, Ok(result)) {
                    debug!(%id, "Discarding render for a caller that went away");
                }
            }
            WorkerEvent::Failed { id, error } => {
                if !pending.deliver(&id, Err(RenderError::Origin(error))) {
                    debug!(%id, "Discarding failure for a caller that went away");
                }
            }
        }
    }

    let outstanding = pending.len();
    if outstanding > 0 {
        error!(outstanding, "Renderer exited with renders outstanding");
    } else {
        info!("Renderer exited");
    }
    pending.fail_all("renderer worker exited");
    resolve_init(Err(RenderError::WorkerExited(
        "renderer worker exited".to_string(),
    )));
}
