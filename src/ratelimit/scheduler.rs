//! Deferred task scheduling for queue releases.

use std::time::Duration;
use tokio::runtime::Handle;

use crate::error::{GuardError, Result};

/// A unit of deferred work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// "Run this after N milliseconds" primitive used by the admission limiter.
///
/// Implementations must never block the caller and must run every scheduled
/// task exactly once.
pub trait Scheduler: Send + Sync + 'static {
    /// Run `task` once `delay` has elapsed.
    fn schedule(&self, delay: Duration, task: Task);
}

/// Scheduler backed by tokio timers.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    /// Create a scheduler on the given runtime.
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Create a scheduler on the runtime of the calling context.
    pub fn current() -> Result<Self> {
        Handle::try_current().map(Self::new).map_err(|e| {
            GuardError::Config(format!("no tokio runtime available for timers: {}", e))
        })
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: Task) {
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            task();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;
    use tokio::time::Instant;

    #[test]
    fn test_current_requires_runtime() {
        assert!(matches!(TokioScheduler::current(), Err(GuardError::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_runs_after_delay() {
        let scheduler = TokioScheduler::current().unwrap();
        let (tx, rx) = oneshot::channel();
        let start = Instant::now();

        scheduler.schedule(
            Duration::from_millis(250),
            Box::new(move || {
                let _ = tx.send(Instant::now());
            }),
        );

        let fired_at = rx.await.unwrap();
        assert!(fired_at - start >= Duration::from_millis(250));
    }
}
