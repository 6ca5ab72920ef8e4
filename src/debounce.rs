//! Pending-operation queue and its retriggerable flush timer.

use crate::operation::Operation;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Operations appended by the watcher thread, drained by the flush timer.
#[derive(Clone, Default)]
pub struct PendingOps {
    inner: Arc<Mutex<Vec<Operation>>>,
}

impl PendingOps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> parking_lot::MutexGuard<'_, Vec<Operation>> {
        self.inner.lock()
    }

    /// Swap the queue for an empty one, unless another thread holds it.
    /// `Some(empty vec)` means uncontended but nothing queued.
    pub fn try_drain(&self) -> Option<Vec<Operation>> {
        self.inner.try_lock().map(|mut q| std::mem::take(&mut *q))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Fires a flush once `delay` has passed since the last `touch`.
pub struct Debouncer {
    trigger: Arc<Notify>,
    task: JoinHandle<()>,
}

impl Debouncer {
    /// Start the timer task on the current runtime. Flushed batches go to
    /// `out` in enqueue order; the task ends when `out` is closed.
    pub fn spawn(delay: Duration, pending: PendingOps, out: mpsc::UnboundedSender<Vec<Operation>>) -> Self {
        let trigger = Arc::new(Notify::new());
        let armed = trigger.clone();
        let task = tokio::spawn(async move {
            loop {
                armed.notified().await;
                loop {
                    tokio::select! {
                        _ = armed.notified() => continue,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    match pending.try_drain() {
                        Some(batch) => {
                            if !batch.is_empty() {
                                debug!("flushing {} operation(s)", batch.len());
                                if out.send(batch).is_err() {
                                    return;
                                }
                            }
                            break;
                        }
                        None => trace!("queue busy, re-arming flush"),
                    }
                }
            }
        });
        Self { trigger, task }
    }

    /// (Re)arm the deadline.
    pub fn touch(&self) {
        self.trigger.notify_one();
    }

    pub fn cancel(&self) {
        self.task.abort();
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
