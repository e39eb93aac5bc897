//! Single-consumer FIFO job queue.
//!
//! The queue owns a piece of state `S` (the board) and runs one boxed async
//! job at a time against `&mut S`. A job's whole future, including whatever
//! it awaits, finishes before the next job is polled, so two callers can
//! never interleave their commands to the engine.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

use crate::error::QueueError;

type Job<S> = Box<dyn for<'a> FnOnce(&'a mut S) -> BoxFuture<'a, ()> + Send>;

struct QueueEntry<S> {
    seq: u64,
    enqueued_at: Instant,
    job: Job<S>,
}

struct Entries<S> {
    jobs: VecDeque<QueueEntry<S>>,
    next_seq: u64,
    closed: bool,
}

struct Shared<S> {
    entries: Mutex<Entries<S>>,
    notify: Notify,
    executing: AtomicBool,
    completed: AtomicU64,
}

pub struct CommandQueue<S> {
    shared: Arc<Shared<S>>,
    runner: JoinHandle<()>,
}

impl<S: Send + 'static> CommandQueue<S> {
    /// Spawns the runner task; must be called inside a tokio runtime.
    pub fn new(state: S) -> Self {
        let shared = Arc::new(Shared {
            entries: Mutex::new(Entries {
                jobs: VecDeque::new(),
                next_seq: 0,
                closed: false,
            }),
            notify: Notify::new(),
            executing: AtomicBool::new(false),
            completed: AtomicU64::new(0),
        });
        let runner = tokio::spawn(drain(shared.clone(), state));
        Self { shared, runner }
    }

    /// Appends a job and returns the channel its result arrives on.
    pub fn enqueue<T, F>(&self, job: F) -> Result<oneshot::Receiver<T>, QueueError>
    where
        T: Send + 'static,
        F: for<'a> FnOnce(&'a mut S) -> BoxFuture<'a, T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job = boxed(move |state: &mut S| {
            async move {
                let value = job(state).await;
                let _ = tx.send(value);
            }
            .boxed()
        });

        {
            let mut entries = self.shared.entries.lock();
            if entries.closed {
                return Err(QueueError::Closed);
            }
            entries.next_seq += 1;
            let seq = entries.next_seq;
            entries.jobs.push_back(QueueEntry {
                seq,
                enqueued_at: Instant::now(),
                job,
            });
            trace!(seq, depth = entries.jobs.len(), "enqueued job");
        }
        self.shared.notify.notify_one();
        Ok(rx)
    }

    /// Enqueues a job and waits for its result.
    pub async fn run<T, F>(&self, job: F) -> Result<T, QueueError>
    where
        T: Send + 'static,
        F: for<'a> FnOnce(&'a mut S) -> BoxFuture<'a, T> + Send + 'static,
    {
        self.enqueue(job)?.await.map_err(|_| QueueError::Discarded)
    }

    /// Drops every job that has not started yet. Their callers see
    /// [`QueueError::Discarded`]. The running job, if any, is left alone.
    pub fn clear(&self) -> usize {
        let dropped: Vec<QueueEntry<S>> = self.shared.entries.lock().jobs.drain(..).collect();
        let count = dropped.len();
        if count > 0 {
            debug!(count, "cleared command queue");
        }
        count
    }

    /// Refuses new jobs. Jobs already queued still run.
    pub fn close(&self) {
        self.shared.entries.lock().closed = true;
        self.shared.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.entries.lock().closed
    }

    /// Jobs waiting for their turn, not counting the running one.
    pub fn depth(&self) -> usize {
        self.shared.entries.lock().jobs.len()
    }

    pub fn is_executing(&self) -> bool {
        self.shared.executing.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> u64 {
        self.shared.completed.load(Ordering::SeqCst)
    }
}

impl<S> Drop for CommandQueue<S> {
    fn drop(&mut self) {
        self.runner.abort();
    }
}

fn boxed<S, F>(job: F) -> Job<S>
where
    F: for<'a> FnOnce(&'a mut S) -> BoxFuture<'a, ()> + Send + 'static,
{
    Box::new(job)
}

async fn drain<S: Send + 'static>(shared: Arc<Shared<S>>, mut state: S) {
    loop {
        let (next, closed) = {
            let mut entries = shared.entries.lock();
            (entries.jobs.pop_front(), entries.closed)
        };
        let Some(entry) = next else {
            if closed {
                debug!("command queue closed, runner exiting");
                return;
            }
            shared.notify.notified().await;
            continue;
        };

        let QueueEntry {
            seq,
            enqueued_at,
            job,
        } = entry;
        trace!(seq, waited = ?enqueued_at.elapsed(), "running job");

        shared.executing.store(true, Ordering::SeqCst);
        let outcome = AssertUnwindSafe(async { job(&mut state).await })
            .catch_unwind()
            .await;
        shared.executing.store(false, Ordering::SeqCst);
        shared.completed.fetch_add(1, Ordering::SeqCst);

        if outcome.is_err() {
            error!(seq, "queued job panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_jobs_run_in_order_without_overlap() {
        let queue = Arc::new(CommandQueue::new(Vec::<(u32, Instant, Instant)>::new()));

        let mut handles = Vec::new();
        for n in 0..5u32 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                queue
                    .run(move |spans: &mut Vec<(u32, Instant, Instant)>| {
                        async move {
                            let start = Instant::now();
                            tokio::time::sleep(Duration::from_millis(5 * (5 - n as u64))).await;
                            spans.push((n, start, Instant::now()));
                        }
                        .boxed()
                    })
                    .await
            }));
            // Stagger submission so arrival order is well defined.
            tokio::task::yield_now().await;
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let spans = queue
            .run(|spans: &mut Vec<(u32, Instant, Instant)>| {
                let copy = spans.clone();
                async move { copy }.boxed()
            })
            .await
            .unwrap();

        let order: Vec<u32> = spans.iter().map(|(n, _, _)| *n).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
        for pair in spans.windows(2) {
            assert!(pair[0].2 <= pair[1].1, "job spans overlap");
        }
        assert!(queue.completed() >= 5);
    }

    #[tokio::test]
    async fn test_run_returns_job_value() {
        let queue = CommandQueue::new(41u32);
        let value = queue
            .run(|n: &mut u32| {
                *n += 1;
                let value = *n;
                async move { value }.boxed()
            })
            .await;
        assert_eq!(value, Ok(42));
    }

    #[tokio::test]
    async fn test_clear_discards_waiting_jobs() {
        let queue = CommandQueue::new(());
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let blocker = queue
            .enqueue(move |_: &mut ()| {
                async move {
                    let _ = release_rx.await;
                }
                .boxed()
            })
            .unwrap();
        let waiting = queue.enqueue(|_: &mut ()| async { 7 }.boxed()).unwrap();

        // Let the runner pick up the blocker.
        while !queue.is_executing() {
            tokio::task::yield_now().await;
        }
        assert_eq!(queue.depth(), 1);
        assert_eq!(queue.clear(), 1);
        assert!(waiting.await.is_err());

        release_tx.send(()).unwrap();
        assert!(blocker.await.is_ok());
    }

    #[tokio::test]
    async fn test_closed_queue_fails_fast() {
        let queue = CommandQueue::new(());
        queue.close();
        assert!(queue.is_closed());
        let result = queue.run(|_: &mut ()| async {}.boxed()).await;
        assert_eq!(result, Err(QueueError::Closed));
    }

    #[tokio::test]
    async fn test_panicking_job_does_not_stall_queue() {
        let queue = CommandQueue::new(0u32);
        let failed = queue
            .run(|_: &mut u32| {
                async {
                    let boom: Option<()> = None;
                    boom.expect("boom")
                }
                .boxed()
            })
            .await;
        assert_eq!(failed, Err(QueueError::Discarded));

        let after = queue
            .run(|n: &mut u32| {
                *n += 1;
                let value = *n;
                async move { value }.boxed()
            })
            .await;
        assert_eq!(after, Ok(1));
    }
}
