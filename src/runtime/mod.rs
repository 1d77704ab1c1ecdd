//! Runtime adapters: the spawn seam and the tokio implementation.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// A future boxed for dynamic dispatch through [`Spawn`].
pub type BoxedTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Abstraction for spawning engine tasks on a runtime.
pub trait Spawn: Send + Sync {
    /// Spawn a task to run to completion in the background.
    fn spawn(&self, task: BoxedTask);
}

/// Shared handle to a spawner.
pub type SharedSpawner = Arc<dyn Spawn>;

/// Tokio-based spawner that executes tasks on a tokio runtime.
pub struct TokioSpawner {
    handle: tokio::runtime::Handle,
    /// Keeps an owned runtime alive for spawners constructed with one.
    _runtime: Option<Arc<tokio::runtime::Runtime>>,
}

impl TokioSpawner {
    /// Create a spawner from a tokio runtime handle.
    #[must_use]
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self {
            handle,
            _runtime: None,
        }
    }

    /// Spawner bound to the ambient tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a tokio runtime context.
    #[must_use]
    pub fn current() -> Self {
        Self::new(tokio::runtime::Handle::current())
    }

    /// Spawner owning a fresh multi-threaded runtime sized to the machine.
    ///
    /// # Errors
    ///
    /// Returns the I/O error from building the runtime.
    pub fn owned_runtime() -> Result<Self, std::io::Error> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(num_cpus::get())
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        Ok(Self {
            handle,
            _runtime: Some(Arc::new(runtime)),
        })
    }
}

impl Spawn for TokioSpawner {
    fn spawn(&self, task: BoxedTask) {
        self.handle.spawn(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn current_spawner_runs_tasks() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let spawner = TokioSpawner::current();
        let (tx, rx) = tokio::sync::oneshot::channel();
        spawner.spawn(Box::pin(async move {
            flag.store(true, Ordering::SeqCst);
            let _ = tx.send(());
        }));
        rx.await.unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }
}
