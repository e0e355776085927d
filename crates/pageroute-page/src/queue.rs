//! Strictly FIFO navigation queue.

use futures::future::BoxFuture;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

struct QueuedNavigation {
    target: String,
    task: BoxFuture<'static, ()>,
    done: oneshot::Sender<()>,
}

/// Runs one navigation at a time, in submission order.
#[derive(Debug, Clone)]
pub struct NavigationQueue {
    tx: mpsc::UnboundedSender<QueuedNavigation>,
    depth: Arc<AtomicUsize>,
}

impl std::fmt::Debug for QueuedNavigation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedNavigation")
            .field("target", &self.target)
            .finish()
    }
}

impl NavigationQueue {
    /// Create the queue and spawn its runner.
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<QueuedNavigation>();
        let depth = Arc::new(AtomicUsize::new(0));
        let runner_depth = Arc::clone(&depth);

        tokio::spawn(async move {
            while let Some(navigation) = rx.recv().await {
                trace!(target = %navigation.target, "Running navigation");
                navigation.task.await;
                runner_depth.fetch_sub(1, Ordering::SeqCst);
                let _ = navigation.done.send(());
            }
        });

        Self { tx, depth }
    }

    /// Append a navigation. The receiver fires once it has run.
    pub fn push<F>(&self, target: impl Into<String>, task: F) -> oneshot::Receiver<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let (done, finished) = oneshot::channel();
        self.depth.fetch_add(1, Ordering::SeqCst);
        let navigation = QueuedNavigation {
            target: target.into(),
            task: Box::pin(task),
            done,
        };
        if self.tx.send(navigation).is_err() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
        }
        finished
    }

    /// Navigations queued or running.
    pub fn pending(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    /// Wait until everything queued so far has run.
    pub async fn idle(&self) {
        let _ = self.push("idle", async {}).await;
    }
}

impl Default for NavigationQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[tokio::test]
    async fn test_runs_in_submission_order() {
        let queue = NavigationQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for (name, delay) in [("slow", 30), ("fast", 0), ("medium", 10)] {
            let log = Arc::clone(&log);
            queue.push(name, async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                log.lock().unwrap().push(name);
            });
        }

        queue.idle().await;
        assert_eq!(*log.lock().unwrap(), vec!["slow", "fast", "medium"]);
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn test_completion_receiver() {
        let queue = NavigationQueue::new();
        let done = queue.push("/a", async {});
        assert!(done.await.is_ok());
    }
}
