// Copyright 2022 LEXUGE
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! A bounded, non-blocking pool of reusable worker tasks.
//!
//! Submission never waits: when every worker is busy the caller gets an error
//! back synchronously and must treat the query as dropped. Idle workers stick
//! around for a minute so bursts reuse warm tasks instead of spawning.

use futures::future::BoxFuture;
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex,
};
use thiserror::Error;
use tokio::{sync::mpsc, time::timeout};
use tokio_util::task::TaskTracker;

/// How long an idle worker waits for the next job before exiting.
const IDLE_EXPIRY: std::time::Duration = std::time::Duration::from_secs(60);

/// Errors returned by [`TaskPool::try_submit`].
#[derive(Debug, Error)]
pub enum PoolError {
    /// Every worker was busy; the job was not accepted.
    #[error("task pool exhausted: all {0} workers are busy")]
    Exhausted(usize),

    /// The pool has been released by a server shutdown.
    #[error("task pool is closed")]
    Closed,
}

type Job = BoxFuture<'static, ()>;

struct Inner {
    max_workers: usize,
    running: AtomicUsize,
    idle: Mutex<Vec<mpsc::Sender<Job>>>,
    closed: AtomicBool,
}

/// Handle to a worker pool. Cheap to clone.
#[derive(Clone)]
pub struct TaskPool {
    inner: Arc<Inner>,
}

impl TaskPool {
    /// Create a pool that runs at most `max_workers` jobs concurrently.
    pub fn new(max_workers: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                max_workers,
                running: AtomicUsize::new(0),
                idle: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Hand a job to an idle worker, or spawn one if the pool is below
    /// capacity. Fails synchronously when saturated.
    pub fn try_submit<F>(&self, job: F) -> Result<(), PoolError>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut job: Job = Box::pin(job);
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }

        // Expired workers leave dead senders behind in the idle list; skip
        // over them until a live worker takes the job.
        loop {
            let tx = self.inner.idle.lock().expect("task pool poisoned").pop();
            match tx {
                Some(tx) => match tx.try_send(job) {
                    Ok(()) => return Ok(()),
                    Err(e) => job = e.into_inner(),
                },
                None => break,
            }
        }

        let spawned = self
            .inner
            .running
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.inner.max_workers).then_some(n + 1)
            });
        if spawned.is_err() {
            return Err(PoolError::Exhausted(self.inner.max_workers));
        }

        let inner = self.inner.clone();
        tokio::spawn(async move {
            job.await;
            loop {
                if inner.closed.load(Ordering::Acquire) {
                    break;
                }
                let (tx, mut rx) = mpsc::channel::<Job>(1);
                inner.idle.lock().expect("task pool poisoned").push(tx);
                match timeout(IDLE_EXPIRY, rx.recv()).await {
                    Ok(Some(job)) => job.await,
                    // Pool released: the idle list was drained and our sender
                    // dropped.
                    Ok(None) => break,
                    // Expired. A submitter may have grabbed the sender right
                    // at the deadline, so drain once before leaving.
                    Err(_) => match rx.try_recv() {
                        Ok(job) => job.await,
                        _ => break,
                    },
                }
            }
            inner.running.fetch_sub(1, Ordering::AcqRel);
        });
        Ok(())
    }

    /// Like [`try_submit`](Self::try_submit), but accounted in `tracker` so a
    /// shutdown can wait for the job. A rejected job releases its tracker
    /// slot immediately.
    pub fn try_submit_tracked<F>(&self, tracker: &TaskTracker, job: F) -> Result<(), PoolError>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.try_submit(tracker.track_future(job))
    }

    /// Number of workers currently alive (busy or idle).
    pub fn workers(&self) -> usize {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Release the pool: no new jobs are accepted and idle workers exit.
    /// Busy workers finish their current job.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner
            .idle
            .lock()
            .expect("task pool poisoned")
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn saturation_fails_synchronously() {
        let pool = TaskPool::new(2);
        let (tx1, rx1) = oneshot::channel::<()>();
        let (tx2, rx2) = oneshot::channel::<()>();

        pool.try_submit(async move {
            let _ = rx1.await;
        })
        .unwrap();
        pool.try_submit(async move {
            let _ = rx2.await;
        })
        .unwrap();

        match pool.try_submit(async {}) {
            Err(PoolError::Exhausted(2)) => {}
            other => panic!("expected exhaustion, got {:?}", other),
        }

        tx1.send(()).unwrap();
        tx2.send(()).unwrap();
    }

    #[tokio::test]
    async fn workers_are_reused() {
        let pool = TaskPool::new(4);
        let (tx, rx) = oneshot::channel::<()>();
        pool.try_submit(async move {
            tx.send(()).unwrap();
        })
        .unwrap();
        rx.await.unwrap();

        // Give the worker a beat to park itself, then reuse it.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let before = pool.workers();
        let (tx, rx) = oneshot::channel::<()>();
        pool.try_submit(async move {
            tx.send(()).unwrap();
        })
        .unwrap();
        rx.await.unwrap();
        assert_eq!(pool.workers(), before);
    }

    #[tokio::test]
    async fn tracker_accounts_for_accepted_jobs() {
        let pool = TaskPool::new(4);
        let tracker = TaskTracker::new();
        let (tx, rx) = oneshot::channel::<()>();

        assert_ok!(pool.try_submit_tracked(&tracker, async move {
            let _ = rx.await;
        }));

        tracker.close();
        tokio::select! {
            _ = tracker.wait() => panic!("tracker drained with a job in flight"),
            _ = tokio::time::sleep(Duration::from_millis(50)) => {}
        }

        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), tracker.wait())
            .await
            .expect("tracker did not drain");
    }

    #[tokio::test]
    async fn closed_pool_rejects_jobs() {
        let pool = TaskPool::new(1);
        pool.close();
        assert!(matches!(pool.try_submit(async {}), Err(PoolError::Closed)));
    }
}
