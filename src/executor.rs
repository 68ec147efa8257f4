use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::{ProfileError, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Handle to the designated UI executor.
///
/// Jobs run one at a time, in the order they were dispatched, so every
/// store mutation and listener invocation issued through the executor
/// observes a single total order. Handles are cheap to clone.
#[derive(Clone)]
pub struct UiExecutor {
    sender: mpsc::UnboundedSender<Job>,
}

/// Receiving side of a [`UiExecutor`]; drains the queue until every
/// handle has been dropped.
pub struct UiLoop {
    receiver: mpsc::UnboundedReceiver<Job>,
}

impl UiExecutor {
    pub fn new() -> (Self, UiLoop) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, UiLoop { receiver })
    }

    /// Create an executor and start its loop on the current tokio runtime.
    pub fn spawn() -> (Self, JoinHandle<()>) {
        let (executor, ui_loop) = Self::new();
        let handle = tokio::spawn(ui_loop.run());
        (executor, handle)
    }

    /// Enqueue a job without waiting for it.
    pub fn dispatch<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.sender
            .send(Box::new(job))
            .map_err(|_| Self::stopped())
    }

    /// Enqueue a job and wait for its result.
    pub async fn run<F, R>(&self, job: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.dispatch(move || {
            // the waiting side may have been dropped
            let _ = tx.send(job());
        })?;
        rx.await.map_err(|_| Self::stopped())
    }

    fn stopped() -> ProfileError {
        ProfileError::Executor("ui executor has stopped".to_owned())
    }
}

impl UiLoop {
    pub async fn run(mut self) {
        log::debug!("executor: ui loop started");
        while let Some(job) = self.receiver.recv().await {
            job();
        }
        log::debug!("executor: ui loop finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn jobs_run_in_dispatch_order() {
        let (executor, _handle) = UiExecutor::spawn();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..10 {
            let seen = seen.clone();
            executor
                .dispatch(move || seen.lock().unwrap().push(i))
                .unwrap();
        }
        executor.run(|| ()).await.unwrap();

        assert_eq!(*seen.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn run_returns_the_job_result() {
        let (executor, _handle) = UiExecutor::spawn();
        assert_eq!(executor.run(|| 6 * 7).await.unwrap(), 42);
    }

    #[tokio::test]
    async fn dispatch_fails_once_the_loop_is_gone() {
        let (executor, ui_loop) = UiExecutor::new();
        drop(ui_loop);

        assert!(matches!(
            executor.dispatch(|| ()),
            Err(ProfileError::Executor(_))
        ));
        assert!(matches!(
            executor.run(|| ()).await,
            Err(ProfileError::Executor(_))
        ));
    }
}
