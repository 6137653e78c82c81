//! Fixed-size worker pool shared by the thread-based backends.
//!
//! Workers pull jobs from one mutex-guarded FIFO and park on a condition
//! variable while it is empty. Every job is handed to the same handler.
//!
//! # Shutdown
//!
//! Dropping the pool sets the stop flag, wakes every worker and joins them.
//! A worker exits only once the stop flag is set *and* the queue is empty,
//! so jobs that were queued before shutdown still run.
//!
//! # Panics in jobs
//!
//! A panicking job is caught and logged and the worker moves on to the next
//! job. Whatever the job had not done before panicking (for a backend job,
//! usually running its completion callback) stays undone.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

struct PoolState<J> {
    jobs: VecDeque<J>,
    stop: bool,
}

struct Shared<J> {
    state: Mutex<PoolState<J>>,
    available: Condvar,
}

/// A pool of named worker threads executing jobs of type `J`.
pub struct WorkerPool<J: Send + 'static> {
    shared: Arc<Shared<J>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl<J: Send + 'static> WorkerPool<J> {
    /// Spawns `worker_count` threads (at least one) named `{name}-{index}`,
    /// each running `handler` on the jobs it dequeues.
    ///
    /// # Panics
    ///
    /// Panics if the OS refuses to spawn a thread.
    pub fn new<F>(name: &str, worker_count: usize, handler: F) -> Self
    where
        F: Fn(J) + Send + Sync + 'static,
    {
        let worker_count = worker_count.max(1);
        let shared = Arc::new(Shared {
            state: Mutex::new(PoolState {
                jobs: VecDeque::new(),
                stop: false,
            }),
            available: Condvar::new(),
        });
        let handler = Arc::new(handler);

        let workers = (0..worker_count)
            .map(|index| {
                let shared = Arc::clone(&shared);
                let handler = Arc::clone(&handler);
                thread::Builder::new()
                    .name(format!("{name}-{index}"))
                    .spawn(move || Self::worker_loop(&shared, &*handler))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        tracing::debug!(pool = name, worker_count, "worker pool started");

        Self { shared, workers }
    }

    /// Queues a job and wakes one idle worker.
    pub fn submit(&self, job: J) {
        self.shared
            .state
            .lock()
            .expect("worker pool lock poisoned")
            .jobs
            .push_back(job);
        self.shared.available.notify_one();
    }

    /// Number of worker threads.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    fn worker_loop(shared: &Shared<J>, handler: &(dyn Fn(J) + Send + Sync)) {
        loop {
            let job = {
                let mut state = shared.state.lock().expect("worker pool lock poisoned");
                loop {
                    if let Some(job) = state.jobs.pop_front() {
                        break job;
                    }
                    if state.stop {
                        return;
                    }
                    state = shared
                        .available
                        .wait(state)
                        .expect("worker pool lock poisoned");
                }
            };
            if panic::catch_unwind(AssertUnwindSafe(|| handler(job))).is_err() {
                tracing::error!(
                    worker = thread::current().name().unwrap_or("unnamed"),
                    "worker pool job panicked"
                );
            }
        }
    }
}

impl<J: Send + 'static> Drop for WorkerPool<J> {
    fn drop(&mut self) {
        self.shared
            .state
            .lock()
            .expect("worker pool lock poisoned")
            .stop = true;
        self.shared.available.notify_all();

        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
