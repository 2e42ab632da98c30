//! Background worker handles for the per-device dispatch loops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::error::Elapsed;

/// Handle to one device's dispatch task.
///
/// Spawns the task on construction and shuts it down gracefully on drop:
/// the running flag flips, the worker is woken so it can observe the flag,
/// and the join handle is awaited off to the side.
pub(crate) struct DeviceWorkerHandle {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    notifier: Arc<Notify>,
}

impl DeviceWorkerHandle {
    pub fn new<F>(task: F) -> Self
    where
        F: FnOnce(Arc<AtomicBool>, Arc<Notify>) -> JoinHandle<()>,
    {
        let running = Arc::new(AtomicBool::new(true));
        let notifier = Arc::new(Notify::new());
        let handle = task(running.clone(), notifier.clone());
        Self {
            running,
            handle: Some(handle),
            notifier,
        }
    }

    /// Wakes the worker to look at its queues.
    pub fn notify(&self) {
        self.notifier.notify_one();
    }

    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.notifier.notify_one();
        if let Some(handle) = self.handle.take() {
            // Outside a runtime there is nothing left to reap the task on;
            // the runtime that owned it has already torn it down.
            if let Ok(rt) = tokio::runtime::Handle::try_current() {
                rt.spawn(async move {
                    let _ = handle.await;
                });
            }
        }
    }
}

impl Drop for DeviceWorkerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Waits for a wake-up, bounded so the loop can periodically re-check its
/// running flag and queue state.
pub(crate) async fn timeout_await_notifier(notifier: &Notify) -> Result<(), Elapsed> {
    tokio::time::timeout(Duration::from_millis(100), notifier.notified()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use tokio::time;

    #[tokio::test]
    async fn worker_processes_notifications() {
        let wakeups = Arc::new(AtomicU32::new(0));
        let wakeups_clone = wakeups.clone();

        let worker = DeviceWorkerHandle::new(|running, notifier| {
            tokio::spawn(async move {
                while running.load(Ordering::SeqCst) {
                    notifier.notified().await;
                    wakeups_clone.fetch_add(1, Ordering::SeqCst);
                }
            })
        });

        time::sleep(Duration::from_millis(20)).await;
        worker.notify();
        time::sleep(Duration::from_millis(20)).await;
        assert_eq!(wakeups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn drop_stops_the_worker() {
        let stopped = Arc::new(AtomicBool::new(false));
        let stopped_clone = stopped.clone();

        {
            let worker = DeviceWorkerHandle::new(|running, notifier| {
                tokio::spawn(async move {
                    while running.load(Ordering::SeqCst) {
                        notifier.notified().await;
                    }
                    stopped_clone.store(true, Ordering::SeqCst);
                })
            });
            worker.notify();
            time::sleep(Duration::from_millis(20)).await;
        }

        time::sleep(Duration::from_millis(50)).await;
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[test]
    fn drop_outside_a_runtime_does_not_panic() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let worker = rt.block_on(async {
            DeviceWorkerHandle::new(|running, notifier| {
                tokio::spawn(async move {
                    while running.load(Ordering::SeqCst) {
                        notifier.notified().await;
                    }
                })
            })
        });
        drop(rt);
        drop(worker);
    }

    #[tokio::test]
    async fn repeated_shutdown_is_harmless() {
        let mut worker = DeviceWorkerHandle::new(|running, _notifier| {
            tokio::spawn(async move {
                while running.load(Ordering::SeqCst) {
                    time::sleep(Duration::from_millis(5)).await;
                }
            })
        });
        worker.shutdown();
        worker.shutdown();
        assert!(!worker.running.load(Ordering::SeqCst));
    }
}
