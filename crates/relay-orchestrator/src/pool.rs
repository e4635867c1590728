//! Bounded worker pool: jobs are boxed futures consumed by N workers.
//! Submission backpressures once the queue is full; shutdown is cooperative
//! through a cancellation token.

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

struct Job {
    label: String,
    task: BoxFuture<'static, ()>,
}

pub struct WorkerPool {
    tx: mpsc::Sender<Job>,
    cancel: CancellationToken,
}

impl WorkerPool {
    pub fn new(workers: usize, queue_depth: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Job>(queue_depth.max(1));
        let rx = std::sync::Arc::new(tokio::sync::Mutex::new(rx));
        let cancel = CancellationToken::new();

        let mut set = JoinSet::new();
        for worker_id in 0..workers.max(1) {
            let rx = rx.clone();
            let cancel = cancel.clone();
            set.spawn(async move {
                loop {
                    let job = {
                        let mut rx = rx.lock().await;
                        tokio::select! {
                            job = rx.recv() => job,
                            _ = cancel.cancelled() => None,
                        }
                    };
                    let Some(job) = job else { break };
                    debug!(worker_id, label = %job.label, "job started");
                    job.task.await;
                    debug!(worker_id, label = %job.label, "job finished");
                }
            });
        }
        // Workers run for the lifetime of the pool; the JoinSet is detached
        // and torn down with the runtime.
        set.detach_all();

        info!(workers, queue_depth, "worker pool started");
        Self { tx, cancel }
    }

    pub async fn submit<F>(&self, label: &str, task: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tx
            .send(Job {
                label: label.to_string(),
                task: Box::pin(task),
            })
            .await
            .map_err(|_| anyhow::anyhow!("worker pool is shut down"))
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn jobs_run_concurrently_up_to_pool_size() {
        let pool = WorkerPool::new(4, 16);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let counter = counter.clone();
            pool.submit("bump", async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn shutdown_closes_the_queue() {
        let pool = WorkerPool::new(2, 4);
        pool.shutdown();
        // once every worker has observed the cancellation and dropped its
        // receiver handle, submission fails
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(pool.submit("late", async {}).await.is_err());
    }
}
