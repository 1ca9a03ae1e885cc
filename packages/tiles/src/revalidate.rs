//! Bounded background revalidation queue.
//!
//! Stale tiles are refreshed by a fixed pool of workers reading from a
//! bounded channel. A key is accepted once until its job has finished, so
//! a burst of stale hits on one tile schedules a single refresh. When the
//! channel is full new jobs are rejected rather than buffered.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use async_trait::async_trait;
use ticket_map_tiles_models::{DatasetVersion, TileKey};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::signal::Signal;

/// One tile to regenerate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevalidationJob {
    pub key: TileKey,
    /// Dataset version the stale tile was served for.
    pub version: DatasetVersion,
}

/// Result of offering a job to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    Queued,
    /// The key is already queued or being refreshed.
    Duplicate,
    Full,
    /// The queue has been shut down.
    Closed,
}

/// Performs revalidation jobs.
#[async_trait]
pub trait Revalidate: Send + Sync + 'static {
    /// Refreshes one tile. Implementations log their own failures; the
    /// signal fires when the queue shuts down.
    async fn revalidate(self: Arc<Self>, job: RevalidationJob, signal: Signal);
}

type SharedReceiver = Arc<tokio::sync::Mutex<mpsc::Receiver<RevalidationJob>>>;

pub struct RevalidationQueue {
    tx: Mutex<Option<mpsc::Sender<RevalidationJob>>>,
    queued: Arc<Mutex<HashSet<TileKey>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl RevalidationQueue {
    /// Spawns `workers` tasks draining a channel of `capacity` jobs.
    ///
    /// Workers hold `handler` weakly and drop jobs once it is gone.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    #[must_use]
    pub fn start<H: Revalidate>(handler: Weak<H>, capacity: usize, workers: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let rx: SharedReceiver = Arc::new(tokio::sync::Mutex::new(rx));
        let queued = Arc::new(Mutex::new(HashSet::new()));
        let shutdown = CancellationToken::new();

        let handles = (0..workers.max(1))
            .map(|id| {
                tokio::spawn(run_worker(
                    id,
                    handler.clone(),
                    Arc::clone(&rx),
                    Arc::clone(&queued),
                    shutdown.clone(),
                ))
            })
            .collect();

        Self {
            tx: Mutex::new(Some(tx)),
            queued,
            workers: Mutex::new(handles),
            shutdown,
        }
    }

    pub fn schedule(&self, job: RevalidationJob) -> ScheduleOutcome {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = tx.as_ref() else {
            return ScheduleOutcome::Closed;
        };

        let mut queued = self.queued.lock().unwrap_or_else(PoisonError::into_inner);
        if !queued.insert(job.key) {
            return ScheduleOutcome::Duplicate;
        }
        match tx.try_send(job) {
            Ok(()) => ScheduleOutcome::Queued,
            Err(TrySendError::Full(job)) => {
                queued.remove(&job.key);
                ScheduleOutcome::Full
            }
            Err(TrySendError::Closed(job)) => {
                queued.remove(&job.key);
                ScheduleOutcome::Closed
            }
        }
    }

    /// Keys queued or being refreshed.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Stops accepting jobs, cancels running ones and waits for every
    /// worker to exit. Jobs still in the channel are dropped.
    pub async fn shutdown(&self) {
        drop(self.tx.lock().unwrap_or_else(PoisonError::into_inner).take());
        self.shutdown.cancel();

        let workers = std::mem::take(
            &mut *self
                .workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for worker in workers {
            if let Err(e) = worker.await {
                log::warn!("Revalidation worker ended abnormally: {e}");
            }
        }
        self.queued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

async fn run_worker<H: Revalidate>(
    id: usize,
    handler: Weak<H>,
    rx: SharedReceiver,
    queued: Arc<Mutex<HashSet<TileKey>>>,
    shutdown: CancellationToken,
) {
    loop {
        let job = {
            let mut rx = rx.lock().await;
            tokio::select! {
                () = shutdown.cancelled() => None,
                job = rx.recv() => job,
            }
        };
        let Some(job) = job else {
            break;
        };

        if let Some(handler) = handler.upgrade() {
            log::trace!("Worker {id} revalidating {} ({})", job.key, job.version);
            handler
                .revalidate(job, Signal::from_token(shutdown.child_token()))
                .await;
        }
        queued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&job.key);
    }
    log::debug!("Revalidation worker {id} stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use ticket_map_tiles_models::Dataset;
    use tokio::sync::Semaphore;

    use super::*;

    /// Blocks every job until a permit is released.
    struct Gate {
        started: mpsc::UnboundedSender<TileKey>,
        release: Semaphore,
        done: AtomicUsize,
    }

    #[async_trait]
    impl Revalidate for Gate {
        async fn revalidate(self: Arc<Self>, job: RevalidationJob, signal: Signal) {
            let _ = self.started.send(job.key);
            tokio::select! {
                permit = self.release.acquire() => {
                    if let Ok(permit) = permit {
                        permit.forget();
                    }
                }
                _ = signal.aborted() => {}
            }
            self.done.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn gate() -> (Arc<Gate>, mpsc::UnboundedReceiver<TileKey>) {
        let (started, rx) = mpsc::unbounded_channel();
        let gate = Arc::new(Gate {
            started,
            release: Semaphore::new(0),
            done: AtomicUsize::new(0),
        });
        (gate, rx)
    }

    fn job(x: u32) -> RevalidationJob {
        RevalidationJob {
            key: TileKey::new(Dataset::ParkingTickets, 12, x, 1500),
            version: DatasetVersion(1),
        }
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        for _ in 0..200 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn rejects_duplicates_and_overflow() {
        let (gate, mut started) = gate();
        let queue = RevalidationQueue::start(Arc::downgrade(&gate), 1, 1);

        assert_eq!(queue.schedule(job(1)), ScheduleOutcome::Queued);
        assert_eq!(started.recv().await, Some(job(1).key));

        assert_eq!(queue.schedule(job(2)), ScheduleOutcome::Queued);
        assert_eq!(queue.schedule(job(3)), ScheduleOutcome::Full);
        // Still in flight.
        assert_eq!(queue.schedule(job(1)), ScheduleOutcome::Duplicate);
        assert_eq!(queue.pending(), 2);

        gate.release.add_permits(2);
        wait_until(|| queue.pending() == 0).await;
        assert_eq!(gate.done.load(Ordering::SeqCst), 2);

        assert_eq!(queue.schedule(job(1)), ScheduleOutcome::Queued);
        gate.release.add_permits(1);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_cancels_running_jobs() {
        let (gate, mut started) = gate();
        let queue = RevalidationQueue::start(Arc::downgrade(&gate), 4, 2);

        assert_eq!(queue.schedule(job(7)), ScheduleOutcome::Queued);
        started.recv().await;

        tokio::time::timeout(Duration::from_secs(5), queue.shutdown())
            .await
            .unwrap();
        assert_eq!(gate.done.load(Ordering::SeqCst), 1);
        assert_eq!(queue.schedule(job(8)), ScheduleOutcome::Closed);
    }

    #[tokio::test]
    async fn dropped_handler_discards_jobs() {
        let (gate, _started) = gate();
        let queue = RevalidationQueue::start(Arc::downgrade(&gate), 4, 1);
        drop(gate);

        assert_eq!(queue.schedule(job(3)), ScheduleOutcome::Queued);
        wait_until(|| queue.pending() == 0).await;
        queue.shutdown().await;
    }
}
