//! Front-end request queue.
//!
//! A [`Queue`] buffers requests until [`Queue::submit_all`] hands the whole
//! batch to its backend, counts what is in flight, and collects finished
//! requests for [`Queue::take_completed`].
//!
//! # Ordering
//!
//! A completion is recorded (statistics, hook, completed list) before the
//! in-flight counter is decremented with `AcqRel`. The decrement that reaches
//! zero notifies waiters while holding the wait lock, so [`Queue::wait_all`]
//! cannot miss the wakeup and observes every recorded completion.
//!
//! # Lifetime
//!
//! Dropping a `Queue` does not wait for in-flight requests. The bookkeeping
//! the callbacks touch is reference-counted and stays valid, but request
//! buffers must outlive their completion callbacks.

use std::mem;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::backend::Backend;
use crate::request::{Request, RequestStatus};

/// Observer invoked on the backend thread for each completion.
pub type CompletionHook = Arc<dyn Fn(&Request) + Send + Sync>;

/// Running totals since the queue was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Requests that reached a terminal status.
    pub completed: u64,
    /// The `IoError` subset of `completed`.
    pub failed: u64,
    /// Sum of `bytes_transferred` over successful requests.
    pub bytes_transferred: u64,
}

#[derive(Default)]
struct Lists {
    pending: Vec<Request>,
    completed: Vec<Request>,
}

#[derive(Default)]
struct Shared {
    lists: Mutex<Lists>,
    in_flight: AtomicUsize,
    wait_lock: Mutex<()>,
    drained: Condvar,
    completed: AtomicU64,
    failed: AtomicU64,
    bytes_transferred: AtomicU64,
}

impl Shared {
    fn record(&self, req: Request, hook: Option<&CompletionHook>) {
        debug_assert!(req.status.is_terminal(), "backend completed a pending request");

        self.completed.fetch_add(1, Ordering::Relaxed);
        match req.status {
            RequestStatus::Ok => {
                self.bytes_transferred
                    .fetch_add(req.bytes_transferred as u64, Ordering::Relaxed);
            }
            RequestStatus::IoError => {
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
            RequestStatus::Pending => {}
        }

        if let Some(hook) = hook {
            hook(&req);
        }
        self.lists
            .lock()
            .expect("queue lists lock poisoned")
            .completed
            .push(req);

        if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _guard = self.wait_lock.lock().expect("queue wait lock poisoned");
            self.drained.notify_all();
        }
    }
}

/// Batches requests onto a shared [`Backend`].
pub struct Queue {
    backend: Arc<dyn Backend>,
    shared: Arc<Shared>,
}

impl Queue {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            shared: Arc::new(Shared::default()),
        }
    }

    /// Buffers `request` until the next [`submit_all`](Self::submit_all).
    ///
    /// The request's status is reset to `Pending`.
    pub fn enqueue(&self, mut request: Request) {
        request.status = RequestStatus::Pending;
        request.errno_value = 0;
        request.bytes_transferred = 0;
        self.shared
            .lists
            .lock()
            .expect("queue lists lock poisoned")
            .pending
            .push(request);
    }

    /// Hands every buffered request to the backend. Returns how many were
    /// submitted.
    pub fn submit_all(&self) -> usize {
        self.submit_batch(None)
    }

    /// Like [`submit_all`](Self::submit_all), additionally running `hook` on
    /// the backend thread for each completion of this batch, before it is
    /// counted as finished.
    pub fn submit_all_with<F>(&self, hook: F) -> usize
    where
        F: Fn(&Request) + Send + Sync + 'static,
    {
        self.submit_batch(Some(Arc::new(hook)))
    }

    fn submit_batch(&self, hook: Option<CompletionHook>) -> usize {
        let batch = mem::take(
            &mut self
                .shared
                .lists
                .lock()
                .expect("queue lists lock poisoned")
                .pending,
        );
        let count = batch.len();
        if count == 0 {
            return 0;
        }

        // Counted up front so a fast completion cannot drive the counter
        // through zero while the rest of the batch is still being handed off.
        self.shared.in_flight.fetch_add(count, Ordering::AcqRel);

        for request in batch {
            let shared = Arc::clone(&self.shared);
            let hook = hook.clone();
            self.backend.submit(
                request,
                Box::new(move |done| shared.record(done, hook.as_ref())),
            );
        }

        tracing::trace!(backend = self.backend.name(), count, "submitted batch");
        count
    }

    /// Blocks until no submitted request is in flight.
    pub fn wait_all(&self) {
        let mut guard = self.shared.wait_lock.lock().expect("queue wait lock poisoned");
        while self.shared.in_flight.load(Ordering::Acquire) != 0 {
            guard = self
                .shared
                .drained
                .wait(guard)
                .expect("queue wait lock poisoned");
        }
    }

    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    /// Requests buffered but not yet submitted.
    pub fn pending(&self) -> usize {
        self.shared
            .lists
            .lock()
            .expect("queue lists lock poisoned")
            .pending
            .len()
    }

    /// Removes and returns every finished request, in completion order.
    pub fn take_completed(&self) -> Vec<Request> {
        mem::take(
            &mut self
                .shared
                .lists
                .lock()
                .expect("queue lists lock poisoned")
                .completed,
        )
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            completed: self.shared.completed.load(Ordering::Acquire),
            failed: self.shared.failed.load(Ordering::Acquire),
            bytes_transferred: self.shared.bytes_transferred.load(Ordering::Acquire),
        }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("backend", &self.backend.name())
            .field("in_flight", &self.in_flight())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
