//! Per-app task group
//!
//! Every background task belonging to one app runs inside a [`Lifecycle`]. The
//! group shares one cancellation token (the app's termination signal), keeps
//! the first error that stopped it, and can be awaited until every task has
//! returned.

use crate::error::AppError;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

#[derive(Debug, Default)]
pub struct Lifecycle {
    token: CancellationToken,
    tracker: TaskTracker,
    cause: Mutex<Option<AppError>>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` in the group. An `Err` result stops the whole group with
    /// that error as the cause (unless an earlier cause exists).
    pub fn spawn<F>(self: &Arc<Self>, task: F)
    where
        F: Future<Output = Result<(), AppError>> + Send + 'static,
    {
        let lifecycle = Arc::clone(self);
        self.tracker.spawn(async move {
            if let Err(e) = task.await {
                lifecycle.kill(e);
            }
        });
    }

    /// Stop the group. The first cause recorded wins.
    pub fn kill(&self, cause: AppError) {
        {
            let mut slot = self.cause.lock();
            if slot.is_none() {
                *slot = Some(cause);
            }
        }
        self.token.cancel();
    }

    pub fn is_dying(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the group has been told to stop
    pub async fn dying(&self) {
        self.token.cancelled().await
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Why the group stopped. Without a recorded cause this is a generic kill.
    pub fn err(&self) -> AppError {
        self.cause.lock().clone().unwrap_or(AppError::Killed {
            reason: "app is shutting down".to_string(),
        })
    }

    /// Wait for every task in the group to return
    pub async fn wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_first_cause_wins() {
        let lifecycle = Lifecycle::new();
        lifecycle.kill(AppError::DiedBeforeBoot);
        lifecycle.kill(AppError::UnknownApp);

        assert!(lifecycle.is_dying());
        assert!(matches!(lifecycle.err(), AppError::DiedBeforeBoot));
    }

    #[tokio::test]
    async fn test_task_error_stops_group() {
        let lifecycle = Arc::new(Lifecycle::new());
        let observed = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&observed);
        let watcher = Arc::clone(&lifecycle);
        lifecycle.spawn(async move {
            watcher.dying().await;
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });
        lifecycle.spawn(async {
            Err(AppError::UnexpectedExit {
                last_line: "boom".to_string(),
            })
        });

        tokio::time::timeout(Duration::from_secs(5), lifecycle.wait())
            .await
            .expect("group should finish");

        assert!(observed.load(Ordering::SeqCst));
        assert!(matches!(lifecycle.err(), AppError::UnexpectedExit { .. }));
    }

    #[tokio::test]
    async fn test_ok_tasks_do_not_stop_group() {
        let lifecycle = Arc::new(Lifecycle::new());
        lifecycle.spawn(async { Ok(()) });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!lifecycle.is_dying());
    }
}
