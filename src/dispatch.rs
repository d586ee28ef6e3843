//! Worker pool running message handlers off the I/O thread.
//!
//! Work is submitted from the I/O loop together with a completion callback.
//! Workers run the body, park the finished item on a shared list and wake the
//! I/O loop through a single [`Notify`]. The I/O loop then drains every
//! finished item in one go with [`DispatchQueue::run_completions`], so the
//! callbacks always execute on the I/O thread.
//!
//! Cancellation is cooperative: [`WorkItem::is_cancelled`] is a flag that the
//! body may poll. An item cancelled before a worker picks it up never runs
//! its body at all.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tracing::{debug, error, warn};

/// Dispatch queue errors. Both are fatal for the engine.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Dispatch queue is closed")]
    Closed,
}

/// How a work item ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The body ran to completion.
    Finished,
    /// Cancelled before a worker started it. The body never ran.
    Cancelled,
    /// The body panicked. The worker survived.
    Panicked,
}

impl Completion {
    pub fn was_cancelled(self) -> bool {
        self == Completion::Cancelled
    }
}

/// A unit of work tracked by the queue from submission until its completion
/// callback has run.
#[derive(Debug)]
pub struct WorkItem<T> {
    seq: u64,
    payload: T,
    cancelled: AtomicBool,
}

impl<T> WorkItem<T> {
    pub fn payload(&self) -> &T {
        &self.payload
    }

    /// Submission sequence number, unique per queue.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

type WorkFn<T> = Box<dyn FnOnce(&WorkItem<T>) + Send>;
type AfterFn<T> = Box<dyn FnOnce(&WorkItem<T>, Completion) + Send>;

struct Job<T> {
    item: Arc<WorkItem<T>>,
    work: WorkFn<T>,
    after: AfterFn<T>,
}

struct Done<T> {
    item: Arc<WorkItem<T>>,
    after: AfterFn<T>,
    completion: Completion,
}

struct Lists<T> {
    pending: VecDeque<Job<T>>,
    /// Started items, including finished ones whose callback has not run yet.
    in_flight: Vec<Arc<WorkItem<T>>>,
    finished: Vec<Done<T>>,
    closed: bool,
}

struct Shared<T> {
    lists: Mutex<Lists<T>>,
    available: Condvar,
    wake: Notify,
    next_seq: AtomicU64,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, Lists<T>> {
        self.lists.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Thread pool with pending/in-flight bookkeeping and cooperative
/// cancellation.
pub struct DispatchQueue<T> {
    shared: Arc<Shared<T>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Send + Sync + 'static> DispatchQueue<T> {
    /// Start a queue backed by `workers` threads (at least one).
    pub fn new(workers: usize) -> Result<Self, DispatchError> {
        let shared = Arc::new(Shared {
            lists: Mutex::new(Lists {
                pending: VecDeque::new(),
                in_flight: Vec::new(),
                finished: Vec::new(),
                closed: false,
            }),
            available: Condvar::new(),
            wake: Notify::new(),
            next_seq: AtomicU64::new(1),
        });

        let queue = Self {
            shared,
            workers: Mutex::new(Vec::new()),
        };

        for n in 0..workers.max(1) {
            let shared = Arc::clone(&queue.shared);
            let handle = std::thread::Builder::new()
                .name(format!("tags-lsp-worker-{}", n))
                .spawn(move || worker_loop(shared))
                .map_err(DispatchError::Spawn)?;
            queue.lock_workers().push(handle);
        }

        debug!("Dispatch queue started with {} workers", workers.max(1));
        Ok(queue)
    }

    /// Enqueue `work`; `after` runs on the thread calling
    /// [`run_completions`](Self::run_completions) once the item is done.
    pub fn submit<W, A>(&self, payload: T, work: W, after: A) -> Result<Arc<WorkItem<T>>, DispatchError>
    where
        W: FnOnce(&WorkItem<T>) + Send + 'static,
        A: FnOnce(&WorkItem<T>, Completion) + Send + 'static,
    {
        let item = Arc::new(WorkItem {
            seq: self.shared.next_seq.fetch_add(1, Ordering::Relaxed),
            payload,
            cancelled: AtomicBool::new(false),
        });

        {
            let mut lists = self.shared.lock();
            if lists.closed {
                return Err(DispatchError::Closed);
            }
            lists.pending.push_back(Job {
                item: Arc::clone(&item),
                work: Box::new(work),
                after: Box::new(after),
            });
        }

        self.shared.available.notify_one();
        Ok(item)
    }

    /// Set the cancellation flag of `item`.
    pub fn cancel(&self, item: &WorkItem<T>) {
        item.cancel();
    }

    /// Cancel the first tracked item matching `predicate`, checking
    /// in-flight items before pending ones. Returns whether one matched.
    pub fn cancel_where<P>(&self, predicate: P) -> bool
    where
        P: Fn(&WorkItem<T>) -> bool,
    {
        let lists = self.shared.lock();
        let found = lists
            .in_flight
            .iter()
            .map(Arc::as_ref)
            .chain(lists.pending.iter().map(|job| job.item.as_ref()))
            .find(|item| predicate(item));

        match found {
            Some(item) => {
                item.cancel();
                true
            }
            None => false,
        }
    }

    /// Items queued but not started plus items started whose completion
    /// callback has not run yet.
    pub fn pending_and_in_flight(&self) -> usize {
        let lists = self.shared.lock();
        lists.pending.len() + lists.in_flight.len()
    }

    /// Resolves once at least one item has finished since the last drain.
    pub fn notified(&self) -> Notified<'_> {
        self.shared.wake.notified()
    }

    /// Run the completion callback of every finished item. Returns how many
    /// ran. No lock is held while a callback executes.
    pub fn run_completions(&self) -> usize {
        let finished = std::mem::take(&mut self.shared.lock().finished);
        let count = finished.len();

        for Done {
            item,
            after,
            completion,
        } in finished
        {
            after(&item, completion);
            self.shared
                .lock()
                .in_flight
                .retain(|tracked| !Arc::ptr_eq(tracked, &item));
        }

        count
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Stop accepting work, drop pending items and join the workers.
    ///
    /// Workers still busy after a short grace period are detached.
    pub fn shutdown(&self) {
        let dropped = {
            let mut lists = self.shared.lock();
            if lists.closed {
                return;
            }
            lists.closed = true;
            std::mem::take(&mut lists.pending)
        };
        self.shared.available.notify_all();

        if !dropped.is_empty() {
            debug!("Dropped {} pending work items at shutdown", dropped.len());
        }
        drop(dropped);

        const QUICK_CHECK_INTERVAL: Duration = Duration::from_millis(10);
        const MAX_QUICK_CHECKS: u32 = 10;

        let mut handles = std::mem::take(&mut *self.lock_workers());
        for _ in 0..MAX_QUICK_CHECKS {
            let (done, running): (Vec<_>, Vec<_>) =
                handles.into_iter().partition(|h| h.is_finished());
            for handle in done {
                if handle.join().is_err() {
                    warn!("Worker thread panicked during shutdown");
                }
            }
            handles = running;
            if handles.is_empty() {
                debug!("Dispatch queue shut down gracefully");
                return;
            }
            std::thread::sleep(QUICK_CHECK_INTERVAL);
        }

        debug!(
            "{} workers still running after {}ms - detaching",
            handles.len(),
            QUICK_CHECK_INTERVAL.as_millis() * MAX_QUICK_CHECKS as u128
        );
    }

    fn lock_workers(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Drop for DispatchQueue<T> {
    fn drop(&mut self) {
        let mut lists = self.shared.lock();
        if !lists.closed {
            lists.closed = true;
            lists.pending.clear();
            drop(lists);
            self.shared.available.notify_all();
        }
    }
}

fn worker_loop<T>(shared: Arc<Shared<T>>) {
    loop {
        let job = {
            let mut lists = shared.lock();
            loop {
                if lists.closed {
                    return;
                }
                if let Some(job) = lists.pending.pop_front() {
                    lists.in_flight.push(Arc::clone(&job.item));
                    break job;
                }
                lists = shared
                    .available
                    .wait(lists)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };

        let Job { item, work, after } = job;

        let completion = if item.is_cancelled() {
            Completion::Cancelled
        } else {
            match catch_unwind(AssertUnwindSafe(|| work(&item))) {
                Ok(()) => Completion::Finished,
                Err(panic_info) => {
                    let panic_msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
                        (*s).to_string()
                    } else if let Some(s) = panic_info.downcast_ref::<String>() {
                        s.clone()
                    } else {
                        "Unknown panic in work item".to_string()
                    };
                    error!("Worker caught panic in item {}: {}", item.seq, panic_msg);
                    Completion::Panicked
                }
            }
        };

        shared.lock().finished.push(Done {
            item,
            after,
            completion,
        });
        shared.wake.notify_one();
    }
}
