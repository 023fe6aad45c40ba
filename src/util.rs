use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Mutex;

use tokio::task::JoinHandle;
use tracing::error;

/// Runs an application callback, logging instead of unwinding into the engine if it panics.
pub(crate) fn call_guarded(what: &str, f: impl FnOnce()) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(f)) {
        let msg = panic
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
            .unwrap_or("unknown panic");
        error!("{} callback panicked: {}", what, msg);
    }
}

/// Tasks spawned on behalf of one owner, aborted together when the owner is torn down.
#[derive(Debug, Default)]
pub(crate) struct WorkerSet {
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerSet {
    pub(crate) fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let task = tokio::spawn(fut);
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    pub(crate) fn abort_all(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn panics_are_contained() {
        let ran = AtomicBool::new(false);
        call_guarded("test", || panic!("boom"));
        call_guarded("test", || ran.store(true, Ordering::SeqCst));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn abort_all_cancels_pending_workers() {
        let workers = WorkerSet::default();
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        workers.spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            flag.store(true, Ordering::SeqCst);
        });
        tokio::task::yield_now().await;
        workers.abort_all();
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }
}
