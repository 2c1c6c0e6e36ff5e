//! Bounded-parallel FIFO task queue with per-id deduplication and cooperative shutdown.
//!
//! Mirrors `binzume/gotask`'s `TaskQueue`: a single dispatch loop alternates between acquiring a
//! concurrency credit and dequeuing the next job, handing each accepted job to its own worker.
//! Unlike a Go unbuffered channel, `tokio::sync::mpsc` has no zero-capacity mode, so the queue's
//! advertised buffer slots are modeled with a dedicated [`Semaphore`] that the dispatch loop tops
//! up by exactly one permit right before it attempts to receive the next job, and which posters
//! consume (and `forget`, so it isn't auto-returned) before they hand a job to the channel. With
//! `queue_len == 0` this reproduces a true rendezvous handoff: a post only succeeds while the
//! dispatch loop is actively waiting to receive.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch, Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// A handle registered with the queue for a posted job. Destroyed (dropped from the queue's
/// id registry) once the job completes.
#[derive(Debug)]
pub struct QueueEntry {
    id: String,
    done_rx: watch::Receiver<bool>,
}

impl QueueEntry {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Blocks until the job backing this entry has completed.
    pub async fn wait(&self) {
        let mut rx = self.done_rx.clone();
        if *rx.borrow() {
            return;
        }
        let _ = rx.changed().await;
    }
}

struct Inner {
    tx: mpsc::UnboundedSender<Job>,
    entries: Mutex<HashMap<String, Arc<QueueEntry>>>,
    concurrency: Arc<Semaphore>,
    buffer: Arc<Semaphore>,
    /// Counts the dispatch loop (1, while running) plus every job currently in flight. `wait()`
    /// blocks until this reaches zero.
    pending: Arc<AtomicI64>,
    pending_notify: Arc<Notify>,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<Inner>,
}

impl TaskQueue {
    /// Creates a new queue with `parallel` concurrent workers and an advertised buffer depth of
    /// `queue_len` (which may legally be zero), and starts its dispatch loop immediately.
    pub fn new(parallel: usize, queue_len: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            tx,
            entries: Mutex::new(HashMap::new()),
            concurrency: Arc::new(Semaphore::new(parallel.max(1))),
            buffer: Arc::new(Semaphore::new(queue_len)),
            pending: Arc::new(AtomicI64::new(1)),
            pending_notify: Arc::new(Notify::new()),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(Self::dispatch_loop(inner.clone(), rx));

        TaskQueue { inner }
    }

    async fn dispatch_loop(inner: Arc<Inner>, mut rx: mpsc::UnboundedReceiver<Job>) {
        loop {
            let permit = tokio::select! {
                _ = inner.shutdown.cancelled() => break,
                acquired = inner.concurrency.clone().acquire_owned() => {
                    match acquired {
                        Ok(p) => p,
                        Err(_) => break,
                    }
                }
            };

            // Advertise exactly one buffer slot before we attempt to dequeue. A poster must win
            // this slot (and `forget` it) before its job can reach the channel.
            inner.buffer.add_permits(1);

            let job = tokio::select! {
                _ = inner.shutdown.cancelled() => {
                    drop(permit);
                    break;
                }
                received = rx.recv() => {
                    match received {
                        Some(job) => job,
                        None => {
                            drop(permit);
                            break;
                        }
                    }
                }
            };

            inner.pending.fetch_add(1, Ordering::SeqCst);
            let pending = inner.pending.clone();
            let pending_notify = inner.pending_notify.clone();
            tokio::spawn(async move {
                job.await;
                drop(permit);
                pending.fetch_sub(1, Ordering::SeqCst);
                pending_notify.notify_one();
            });
        }

        debug!("task queue dispatch loop exiting");
        inner.pending.fetch_sub(1, Ordering::SeqCst);
        inner.pending_notify.notify_one();
    }

    fn try_reserve_slot(&self) -> bool {
        match self.inner.buffer.try_acquire() {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    async fn reserve_slot_blocking(&self) -> bool {
        match self.inner.buffer.acquire().await {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    /// Enqueues `job` anonymously. If `block`, waits for a free buffer slot; otherwise returns
    /// `false` immediately on backpressure.
    pub async fn post(&self, job: Job, block: bool) -> bool {
        let reserved = if block {
            self.reserve_slot_blocking().await
        } else {
            self.try_reserve_slot()
        };
        if !reserved {
            return false;
        }
        self.inner.tx.send(job).is_ok()
    }

    fn wrap_job(&self, job: Job, id: String, done_tx: watch::Sender<bool>) -> Job {
        let queue = self.clone();
        Box::pin(async move {
            job.await;
            let _ = done_tx.send(true);
            if !id.is_empty() {
                if let Ok(mut guard) = queue.inner.entries.lock() {
                    guard.remove(&id);
                }
            }
        })
    }

    async fn add_task_state(
        &self,
        job: Job,
        id: String,
        block: bool,
    ) -> (Option<Arc<QueueEntry>>, bool) {
        let mut guard = self.inner.entries.lock().expect("entries mutex poisoned");
        if !id.is_empty() {
            if let Some(existing) = guard.get(&id) {
                return (Some(existing.clone()), false);
            }
        }

        let (done_tx, done_rx) = watch::channel(false);
        let entry = Arc::new(QueueEntry {
            id: id.clone(),
            done_rx,
        });
        if !id.is_empty() {
            guard.insert(id.clone(), entry.clone());
        }

        let wrapped = self.wrap_job(job, id.clone(), done_tx);

        if !block {
            let reserved = self.try_reserve_slot();
            if !reserved || self.inner.tx.send(wrapped).is_err() {
                guard.remove(&id);
                return (None, false);
            }
            return (Some(entry), true);
        }

        // Must release the registration lock before a potentially long blocking reservation, or
        // we'd deadlock against other callers trying to register/look up ids.
        drop(guard);
        if !self.reserve_slot_blocking().await || self.inner.tx.send(wrapped).is_err() {
            self.inner
                .entries
                .lock()
                .expect("entries mutex poisoned")
                .remove(&id);
            return (None, false);
        }
        (Some(entry), true)
    }

    /// Enqueues `job` under `id`, blocking until a buffer slot is free. If an entry with `id` is
    /// already registered, returns it with `accepted = false` and does not enqueue again.
    pub async fn post_with_id(&self, job: Job, id: impl Into<String>) -> (Option<Arc<QueueEntry>>, bool) {
        self.add_task_state(job, id.into(), true).await
    }

    /// As [`Self::post_with_id`], but non-blocking: on a full buffer the id registration is
    /// released and `(None, false)` is returned.
    pub async fn try_post_with_id(
        &self,
        job: Job,
        id: impl Into<String>,
    ) -> (Option<Arc<QueueEntry>>, bool) {
        self.add_task_state(job, id.into(), false).await
    }

    /// Cancels the queue's dispatch loop. In-flight jobs are allowed to finish; pending (not yet
    /// dequeued) posts are abandoned.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Blocks until the dispatch loop has exited and every started job has finished.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.pending_notify.notified();
            if self.inner.pending.load(Ordering::SeqCst) <= 0 {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn counting_job(counter: Arc<AtomicU32>) -> Job {
        Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn runs_posted_jobs() {
        let queue = TaskQueue::new(4, 10);
        let count = Arc::new(AtomicU32::new(0));

        let (e1, _) = queue
            .try_post_with_id(counting_job(count.clone()), "")
            .await;
        let (e2, _) = queue
            .try_post_with_id(counting_job(count.clone()), "")
            .await;
        let (e3, _) = queue
            .try_post_with_id(counting_job(count.clone()), "")
            .await;

        e1.unwrap().wait().await;
        e2.unwrap().wait().await;
        e3.unwrap().wait().await;

        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected_while_first_is_registered() {
        let queue = TaskQueue::new(4, 10);
        let count_a = Arc::new(AtomicU32::new(0));
        let count_b = Arc::new(AtomicU32::new(0));

        let gate = Arc::new(tokio::sync::Notify::new());
        let gate_a1 = gate.clone();
        let gate_a2 = gate.clone();
        let gate_b = gate.clone();
        let ca = count_a.clone();
        let cb = count_b.clone();

        let (e1, accepted1) = queue
            .try_post_with_id(
                Box::pin(async move {
                    ca.fetch_add(1, Ordering::SeqCst);
                    gate_a1.notified().await;
                }),
                "TaskA",
            )
            .await;
        let (e2, accepted2) = queue
            .try_post_with_id(
                Box::pin(async move {
                    gate_a2.notified().await;
                }),
                "TaskA",
            )
            .await;
        let (e3, accepted3) = queue
            .try_post_with_id(
                Box::pin(async move {
                    cb.fetch_add(1, Ordering::SeqCst);
                    gate_b.notified().await;
                }),
                "TaskB",
            )
            .await;

        assert!(accepted1);
        assert!(!accepted2);
        assert!(accepted3);
        assert_eq!(e1.as_ref().unwrap().id(), e2.as_ref().unwrap().id());

        gate.notify_waiters();
        e1.unwrap().wait().await;
        e3.unwrap().wait().await;

        assert_eq!(count_a.load(Ordering::SeqCst), 1);
        assert_eq!(count_b.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_buffer_rejects_second_post_until_first_completes() {
        let queue = TaskQueue::new(1, 0);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let notify = Arc::new(Notify::new());
        let waiter = notify.clone();
        let (e1, accepted1) = queue
            .try_post_with_id(Box::pin(async move { waiter.notified().await }), "")
            .await;
        assert!(accepted1);
        assert!(e1.is_some());

        tokio::time::sleep(Duration::from_millis(10)).await;

        let (e2, accepted2) = queue.try_post_with_id(Box::pin(async {}), "").await;
        assert!(!accepted2);
        assert!(e2.is_none());

        notify.notify_waiters();
    }

    #[tokio::test]
    async fn wait_returns_only_after_inflight_jobs_finish() {
        let queue = TaskQueue::new(4, 10);
        let started = Arc::new(Notify::new());
        let finished = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let started_tx = started.clone();
        let finished_flag = finished.clone();
        queue
            .try_post_with_id(
                Box::pin(async move {
                    started_tx.notify_one();
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    finished_flag.store(true, Ordering::SeqCst);
                }),
                "",
            )
            .await;

        started.notified().await;
        queue.shutdown();
        queue.wait().await;

        assert!(finished.load(Ordering::SeqCst));
    }
}
