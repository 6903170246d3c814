//! Execution policies for work that touches the script engine.
//!
//! The HTTP engine serves connections concurrently but the script engine
//! can only run one thing at a time. Every unit of script-touching work is
//! handed to a [`Runner`], which decides how units are serialized.

use std::panic::AssertUnwindSafe;
use std::sync::OnceLock;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error};

/// A unit of work.
pub type Job = BoxFuture<'static, ()>;

/// Runs units of work one at a time.
///
/// `run` resolves once the job has completed.
#[async_trait]
pub trait Runner: Send + Sync {
    async fn run(&self, job: Job);
}

/// Serializes jobs behind a single lock. Order between waiting callers is
/// whatever order they acquire the lock in.
#[derive(Default)]
pub struct SyncRunner {
    lock: Mutex<()>,
}

impl SyncRunner {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Runner for SyncRunner {
    async fn run(&self, job: Job) {
        let _guard = self.lock.lock().await;
        job.await;
    }
}

type Submission = (Job, oneshot::Sender<()>);

/// Runs jobs on a single worker task in submission order.
///
/// The worker is spawned on the current tokio runtime the first time a job
/// is submitted.
#[derive(Default)]
pub struct LoopRunner {
    queue: OnceLock<mpsc::UnboundedSender<Submission>>,
}

impl LoopRunner {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self) -> &mpsc::UnboundedSender<Submission> {
        self.queue.get_or_init(|| {
            let (tx, mut rx) = mpsc::unbounded_channel::<Submission>();
            tokio::spawn(async move {
                while let Some((job, done)) = rx.recv().await {
                    if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                        error!("job panicked on the loop runner");
                    }
                    let _ = done.send(());
                }
                debug!("loop runner stopped");
            });
            tx
        })
    }
}

#[async_trait]
impl Runner for LoopRunner {
    async fn run(&self, job: Job) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.sender().send((job, done_tx)).is_err() {
            error!("loop runner is gone, job dropped");
            return;
        }
        let _ = done_rx.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex as StdMutex};
    use std::time::Duration;

    async fn assert_exclusive(runner: Arc<dyn Runner>) {
        let inside = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let runner = runner.clone();
            let inside = inside.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                runner
                    .run(Box::pin(async move {
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }))
                    .await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_sync_runner_is_exclusive() {
        assert_exclusive(Arc::new(SyncRunner::new())).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_loop_runner_is_exclusive() {
        assert_exclusive(Arc::new(LoopRunner::new())).await;
    }

    #[tokio::test]
    async fn test_loop_runner_keeps_submission_order() {
        let runner = LoopRunner::new();
        let seen = Arc::new(StdMutex::new(Vec::new()));

        let mut waits = Vec::new();
        for i in 0..5 {
            let seen = seen.clone();
            waits.push(runner.run(Box::pin(async move {
                seen.lock().unwrap().push(i);
            })));
        }
        futures::future::join_all(waits).await;

        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_loop_runner_survives_panics() {
        let runner = LoopRunner::new();
        runner.run(Box::pin(async { panic!("boom") })).await;

        let ran = Arc::new(AtomicU32::new(0));
        let flag = ran.clone();
        runner
            .run(Box::pin(async move {
                flag.store(1, Ordering::SeqCst);
            }))
            .await;

        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
