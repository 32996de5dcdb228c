#![forbid(unsafe_code)]

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;

/// Owned handle for a spawned timer or request; aborting is idempotent and
/// also happens on drop, so replacing a handle cancels the task it held.
#[derive(Debug)]
pub struct ScheduledTask {
    task: Option<JoinHandle<()>>,
}

impl ScheduledTask {
    pub fn spawn<F>(fut: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self { task: Some(tokio::spawn(fut)) }
    }

    /// Run `fut` after `delay`.
    pub fn after<F>(delay: Duration, fut: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self::spawn(async move {
            tokio::time::sleep(delay).await;
            fut.await;
        })
    }

    pub fn cancel(&mut self) {
        if let Some(h) = self.task.take() {
            h.abort();
        }
    }

    pub fn is_finished(&self) -> bool { self.task.as_ref().map_or(true, |t| t.is_finished()) }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) { self.cancel(); }
}
