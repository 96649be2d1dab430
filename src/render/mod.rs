//! Isolated page rendering.
//!
//! The [`RendererBridge`] hands [`RenderRequest`]s to a worker running in its own
//! execution context, either a dedicated OS thread ([`spawn_thread`]) or a child
//! process ([`spawn_process`] talking to [`serve_stdio`]), and matches responses
//! back to callers by correlation id.

mod bridge;
mod mailbox;
mod origin;
mod process;
mod protocol;
mod worker;

pub use bridge::RendererBridge;
pub use origin::{Origin, OriginFactory, UpstreamFactory, UpstreamOrigin};
pub use process::spawn_process;
pub use protocol::{HeaderList, RenderRequest, RenderResult, WorkerCommand, WorkerEvent};
pub use worker::{serve_stdio, spawn_thread};

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum RenderError {
    #[error("renderer failed to initialize: {0}")]
    Init(String),
    #[error("origin failed to render: {0}")]
    Origin(String),
    #[error("renderer worker exited: {0}")]
    WorkerExited(String),
    #[error("renderer transport failed: {0}")]
    Transport(String),
    #[error("renderer protocol violation: {0}")]
    Protocol(String),
}
