//! Background worker plumbing shared by the publisher, consumer and optimizer.

use tokio::task::JoinHandle;
use tracing::warn;

use crate::cancel::{Cancellation, CancellationSource};

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    name: &'static str,
    shutdown: CancellationSource,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Spawn `run` on the current tokio runtime, handing it the token that
    /// [`WorkerHandle::shutdown`] triggers.
    pub fn spawn<F, Fut>(name: &'static str, run: F) -> Self
    where
        F: FnOnce(Cancellation) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let shutdown = CancellationSource::new();
        let join = tokio::spawn(run(shutdown.token()));
        Self {
            name,
            shutdown,
            join: Some(join),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Request graceful shutdown and wait for the worker to stop.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(join) = self.join.take() {
            if let Err(err) = join.await {
                warn!(worker = self.name, error = %err, "worker task ended abnormally");
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        // Dropping without `shutdown()` still stops the loop at its next check.
        self.shutdown.cancel();
    }
}
