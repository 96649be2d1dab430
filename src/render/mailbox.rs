use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use tokio::sync::oneshot;
use uuid::Uuid;

use super::RenderError;
use super::protocol::RenderResult;

pub(crate) type RenderOutcome = Result<RenderResult, RenderError>;

/// Outstanding renders keyed by correlation id.
///
/// Once [`PendingRenders::fail_all`] runs the mailbox stays closed: every
/// waiting caller is woken with the failure and new registrations are refused.
#[derive(Default, Clone)]
pub(crate) struct PendingRenders {
    inner: Arc<DashMap<Uuid, oneshot::Sender<RenderOutcome>>>,
    closed: Arc<AtomicBool>,
    reason: Arc<std::sync::OnceLock<String>>,
}

impl PendingRenders {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register `id` and obtain the receiver for its outcome.
    pub(crate) fn register(&self, id: Uuid) -> Result<PendingRender, RenderError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(self.exited());
        }

        let (tx, rx) = oneshot::channel();
        self.inner.insert(id, tx);

        // fail_all may have drained between the check and the insert.
        if self.closed.load(Ordering::Acquire) {
            self.inner.remove(&id);
            return Err(self.exited());
        }

        Ok(PendingRender {
            id,
            receiver: rx,
            pending: self.clone(),
        })
    }

    /// Resolve the caller waiting on `id`. Returns `false` for unknown ids.
    pub(crate) fn deliver(&self, id: &Uuid, outcome: RenderOutcome) -> bool {
        match self.inner.remove(id) {
            Some((_id, sender)) => {
                let _ = sender.send(outcome);
                true
            }
            None => false,
        }
    }

    pub(crate) fn fail_all(&self, reason: &str) {
        let _ = self.reason.set(reason.to_string());
        self.closed.store(true, Ordering::Release);

        let ids: Vec<Uuid> = self.inner.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            self.deliver(&id, Err(RenderError::WorkerExited(reason.to_string())));
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.len()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn exited(&self) -> RenderError {
        RenderError::WorkerExited(
            self.reason
                .get()
                .cloned()
                .unwrap_or_else(|| "renderer closed".to_string()),
        )
    }
}

/// A registered render. Dropping it before the outcome arrives forgets the id.
pub(crate) struct PendingRender {
    id: Uuid,
    receiver: oneshot::Receiver<RenderOutcome>,
    pending: PendingRenders,
}

impl PendingRender {
    pub(crate) async fn outcome(mut self) -> RenderOutcome {
        let receiver = &mut self.receiver;
        match receiver.await {
            Ok(outcome) => outcome,
            Err(_) => Err(self.pending.exited()),
        }
    }
}

impl Drop for PendingRender {
    fn drop(&mut self) {
        self.pending.inner.remove(&self.id);
    }
}
