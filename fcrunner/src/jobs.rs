use std::future::Future;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A tracked background task.
struct Job {
    name: String,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Bounded set of background tasks plus a wait-group for blocking work.
///
/// Detached jobs (guest servers, tracers, host servers) are registered with
/// their cancellation token so shutdown can stop and await them. Blocking
/// jobs go into the wait-group, which callers join before reporting that
/// an operation has completed.
pub struct JobTracker {
    capacity: usize,
    jobs: Mutex<Vec<Job>>,
    waited: Mutex<JoinSet<()>>,
}

impl JobTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            jobs: Mutex::new(Vec::new()),
            waited: Mutex::new(JoinSet::new()),
        }
    }

    /// Spawn a detached job. Fails when the tracker is at capacity.
    pub async fn spawn<F>(
        &self,
        name: impl Into<String>,
        cancel: CancellationToken,
        fut: F,
    ) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let mut jobs = self.jobs.lock().await;
        jobs.retain(|job| !job.handle.is_finished());
        if jobs.len() >= self.capacity {
            bail!(
                "too many background jobs ({}), cannot start {}",
                self.capacity,
                name
            );
        }
        debug!(job = %name, "spawning background job");
        let handle = tokio::spawn(fut);
        jobs.push(Job {
            name,
            cancel,
            handle,
        });
        Ok(())
    }

    /// Number of detached jobs still running.
    pub async fn active(&self) -> usize {
        let mut jobs = self.jobs.lock().await;
        jobs.retain(|job| !job.handle.is_finished());
        jobs.len()
    }

    /// Add a blocking job to the wait-group.
    pub async fn track_waited<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.waited.lock().await.spawn(fut);
    }

    /// Wait until every job in the wait-group has finished.
    pub async fn join_waited(&self) {
        let mut waited = self.waited.lock().await;
        while let Some(result) = waited.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "blocking job panicked");
            }
        }
    }

    /// Cancel every detached job and wait up to `timeout` for all jobs,
    /// blocking ones included. Anything still running afterwards is aborted.
    pub async fn shutdown(&self, timeout: Duration) {
        let jobs: Vec<Job> = std::mem::take(&mut *self.jobs.lock().await);
        for job in &jobs {
            job.cancel.cancel();
        }

        let deadline = tokio::time::Instant::now() + timeout;
        for mut job in jobs {
            match tokio::time::timeout_at(deadline, &mut job.handle).await {
                Ok(Ok(())) => debug!(job = %job.name, "background job stopped"),
                Ok(Err(e)) => warn!(job = %job.name, error = %e, "background job panicked"),
                Err(_) => {
                    warn!(job = %job.name, "background job did not stop in time, aborting");
                    job.handle.abort();
                }
            }
        }

        let mut waited = self.waited.lock().await;
        let drained = tokio::time::timeout_at(deadline, async {
            while waited.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(remaining = waited.len(), "blocking jobs did not finish in time, aborting");
            waited.abort_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_spawn_respects_capacity() {
        let tracker = JobTracker::new(2);
        for i in 0..2 {
            let token = CancellationToken::new();
            let t = token.clone();
            tracker
                .spawn(format!("job-{i}"), token, async move { t.cancelled().await })
                .await
                .unwrap();
        }
        let err = tracker
            .spawn("job-2", CancellationToken::new(), async {})
            .await
            .unwrap_err();
        assert!(err.to_string().contains("too many background jobs"));
        tracker.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_finished_jobs_free_capacity() {
        let tracker = JobTracker::new(1);
        tracker
            .spawn("quick", CancellationToken::new(), async {})
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(tracker.active().await, 0);
        tracker
            .spawn("next", CancellationToken::new(), async {})
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_join_waited_waits_for_all() {
        let tracker = JobTracker::new(4);
        let count = Arc::new(AtomicUsize::new(0));
        for delay in [10u64, 50, 100] {
            let count = count.clone();
            tracker
                .track_waited(async move {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    count.fetch_add(1, Ordering::SeqCst);
                })
                .await;
        }
        tracker.join_waited().await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_and_aborts_stragglers() {
        let tracker = JobTracker::new(4);
        let stopped = Arc::new(AtomicUsize::new(0));

        let token = CancellationToken::new();
        let t = token.clone();
        let s = stopped.clone();
        tracker
            .spawn("cooperative", token, async move {
                t.cancelled().await;
                s.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();
        tracker
            .spawn("stubborn", CancellationToken::new(), std::future::pending())
            .await
            .unwrap();

        let start = tokio::time::Instant::now();
        tracker.shutdown(Duration::from_millis(100)).await;
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.active().await, 0);
    }
}
