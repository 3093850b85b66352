use anyhow::Result;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{error, warn};

use crate::utils::metrics::METRICS;

/// Tasks get this long to observe the shutdown signal before they are
/// aborted; shutdown flushes get the same budget each.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

type ShutdownFlush = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

/// Tracks the node's background tasks, the shutdown signal they watch, and
/// the final flushes (peer table persistence, late metrics) that must run
/// only after every task has drained.
pub struct ServiceHandle {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<Result<()>>)>,
    flushes: Vec<(&'static str, ShutdownFlush)>,
}

impl ServiceHandle {
    /// Create the handle plus the receiver tasks clone to observe shutdown.
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = Self { shutdown_tx, tasks: Vec::new(), flushes: Vec::new() };
        (handle, shutdown_rx)
    }

    /// Track a background task. The name shows up in drain diagnostics, so
    /// a stuck subsystem is identifiable from the shutdown log alone.
    pub fn attach(&mut self, name: &'static str, task: JoinHandle<Result<()>>) {
        self.tasks.push((name, task));
    }

    pub fn attach_all(&mut self, name: &'static str, tasks: Vec<JoinHandle<Result<()>>>) {
        for task in tasks {
            self.attach(name, task);
        }
    }

    /// Register a final flush to run once all tasks are gone, in
    /// registration order. Single-writer resources (the peer store) rely on
    /// this ordering: their writer task has already drained.
    pub fn on_shutdown<F, Fut>(&mut self, name: &'static str, flush: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.flushes.push((name, Box::new(move || Box::pin(flush()))));
    }

    /// Signal shutdown, drain every task (aborting any that ignore the
    /// signal past the drain budget), then run the registered flushes.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);

        for (name, task) in self.tasks {
            let abort = task.abort_handle();
            match timeout(DRAIN_TIMEOUT, task).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => {
                    METRICS.inc("node.shutdown_task_failed");
                    error!("{} task failed: {:#}", name, e);
                }
                Ok(Err(e)) => {
                    METRICS.inc("node.shutdown_task_failed");
                    error!("{} task panicked: {}", name, e);
                }
                Err(_) => {
                    METRICS.inc("node.shutdown_task_stuck");
                    warn!("{} task ignored shutdown for {:?}; aborting", name, DRAIN_TIMEOUT);
                    abort.abort();
                }
            }
        }

        for (name, flush) in self.flushes {
            if timeout(DRAIN_TIMEOUT, flush()).await.is_err() {
                METRICS.inc("node.shutdown_flush_stuck");
                warn!("{} flush did not finish within {:?}", name, DRAIN_TIMEOUT);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_shutdown_signals_and_drains_tasks() {
        let (mut svc, mut rx) = ServiceHandle::new();
        let order = Arc::new(AtomicUsize::new(0));
        let task_seen = order.clone();
        svc.attach(
            "watcher",
            tokio::spawn(async move {
                let _ = rx.changed().await;
                task_seen.store(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        svc.shutdown().await.unwrap();
        assert_eq!(order.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_flushes_run_after_tasks_in_order() {
        let (mut svc, mut rx) = ServiceHandle::new();
        let order = Arc::new(AtomicUsize::new(0));

        let task_seen = order.clone();
        svc.attach(
            "writer",
            tokio::spawn(async move {
                let _ = rx.changed().await;
                task_seen.store(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        let first = order.clone();
        svc.on_shutdown("first flush", move || async move {
            // the writer task has already drained
            assert_eq!(first.load(Ordering::SeqCst), 1);
            first.store(2, Ordering::SeqCst);
        });
        let second = order.clone();
        svc.on_shutdown("second flush", move || async move {
            assert_eq!(second.load(Ordering::SeqCst), 2);
            second.store(3, Ordering::SeqCst);
        });

        svc.shutdown().await.unwrap();
        assert_eq!(order.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_failed_task_does_not_block_shutdown() {
        let (mut svc, _rx) = ServiceHandle::new();
        svc.attach(
            "broken",
            tokio::spawn(async move { Err(anyhow::anyhow!("boom")) }),
        );
        svc.shutdown().await.unwrap();
    }
}
