//! Long-running background tasks: the broker consumer and the fallback sweeper.

pub mod event_worker;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::error;

pub use event_worker::{EventWorker, WorkerStats};

/// Handle to control and join a background task.
#[derive(Debug)]
pub struct WorkerHandle {
    name: &'static str,
    shutdown: mpsc::Sender<()>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    pub(crate) fn new(name: &'static str, shutdown: mpsc::Sender<()>, join: JoinHandle<()>) -> Self {
        Self {
            name,
            shutdown,
            join,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Request graceful shutdown and wait for the task to stop.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(()).await;
        if let Err(e) = self.join.await {
            error!(worker = self.name, error = ?e, "background task panicked");
        }
    }
}
