//! io_uring backend.
//!
//! One worker thread owns the ring. Submissions are parked in a pending
//! list; the worker swaps out the whole list, prepares one SQE per request,
//! submits the batch with a single syscall and reaps completions until the
//! batch is drained. Each in-flight request sits in a slot of a per-batch
//! slab and the slot index travels through the ring as the SQE user data.
//!
//! Host memory only.

use std::io;
use std::mem;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use io_uring::{IoUring, cqueue, opcode, squeue, types};

use crate::backend::{self, Backend, CompletionCallback, Rejection};
use crate::request::{Request, RequestOp};
use crate::{report_error, report_request_error};

const SUBSYSTEM: &str = "io_uring";

/// Ring sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingBackendConfig {
    /// Submission/completion queue entries. Zero is treated as 1.
    pub entries: u32,
}

impl Default for RingBackendConfig {
    fn default() -> Self {
        Self { entries: 256 }
    }
}

/// Ring creation failure.
#[derive(Debug, thiserror::Error)]
pub enum RingSetupError {
    #[error("io_uring setup failed: {0}")]
    Setup(#[source] io::Error),

    #[error("failed to spawn io_uring worker: {0}")]
    Spawn(#[source] io::Error),
}

impl RingSetupError {
    pub fn errno(&self) -> i32 {
        match self {
            Self::Setup(e) | Self::Spawn(e) => backend::errno_of(e),
        }
    }
}

type Pending = (Request, CompletionCallback);

struct RingState {
    pending: Vec<Pending>,
    stop: bool,
}

struct Shared {
    state: Mutex<RingState>,
    wakeup: Condvar,
}

/// Executes requests through a Linux io_uring.
///
/// If the ring cannot be created, [`RingBackend::new`] still returns a usable
/// backend whose requests all fail with `EINVAL`. Use
/// [`RingBackend::try_new`] to observe the setup error instead.
pub struct RingBackend {
    shared: Arc<Shared>,
    worker: Option<thread::JoinHandle<()>>,
    entries: u32,
    ring_available: bool,
}

impl RingBackend {
    /// Creates the backend, degrading to fail-every-request on setup errors.
    ///
    /// # Panics
    ///
    /// Panics if the worker thread cannot be spawned.
    pub fn new(config: RingBackendConfig) -> Self {
        let entries = config.entries.max(1);
        let ring = match build_ring(entries) {
            Ok(ring) => Some(ring),
            Err(e) => {
                report_error!(
                    SUBSYSTEM,
                    "io_uring_queue_init",
                    format!("failed to initialize io_uring ring: {e}"),
                    e.errno()
                );
                tracing::warn!(entries, error = %e, "io_uring unavailable, requests will fail");
                None
            }
        };
        Self::start(entries, ring).expect("failed to spawn io_uring worker")
    }

    /// Creates the backend, returning the setup error if the ring cannot be
    /// created.
    pub fn try_new(config: RingBackendConfig) -> Result<Self, RingSetupError> {
        let entries = config.entries.max(1);
        let ring = build_ring(entries)?;
        Self::start(entries, Some(ring))
    }

    fn start(entries: u32, ring: Option<IoUring>) -> Result<Self, RingSetupError> {
        let shared = Arc::new(Shared {
            state: Mutex::new(RingState {
                pending: Vec::new(),
                stop: false,
            }),
            wakeup: Condvar::new(),
        });
        let ring_available = ring.is_some();

        let worker = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("dstorage-uring".to_owned())
                .spawn(move || worker_loop(&shared, ring))
                .map_err(RingSetupError::Spawn)?
        };

        tracing::debug!(entries, ring_available, "io_uring backend started");

        Ok(Self {
            shared,
            worker: Some(worker),
            entries,
            ring_available,
        })
    }

    /// Submission queue size the ring was created with.
    pub fn entries(&self) -> u32 {
        self.entries
    }

    /// False when the ring could not be created.
    pub fn is_ring_available(&self) -> bool {
        self.ring_available
    }

    /// Hands several requests to the worker at once so they share one
    /// submission batch.
    pub fn submit_batch(&self, batch: impl IntoIterator<Item = Pending>) {
        self.shared
            .state
            .lock()
            .expect("ring state lock poisoned")
            .pending
            .extend(batch);
        self.shared.wakeup.notify_one();
    }
}

impl std::fmt::Debug for RingBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBackend")
            .field("entries", &self.entries)
            .field("ring_available", &self.ring_available)
            .finish_non_exhaustive()
    }
}

impl Backend for RingBackend {
    fn name(&self) -> &'static str {
        SUBSYSTEM
    }

    fn submit(&self, request: Request, on_complete: CompletionCallback) {
        self.submit_batch(std::iter::once((request, on_complete)));
    }
}

impl Drop for RingBackend {
    fn drop(&mut self) {
        self.shared.state.lock().expect("ring state lock poisoned").stop = true;
        self.shared.wakeup.notify_all();

        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("io_uring worker panicked");
            }
        }

        // Only reachable if the worker died before draining.
        let leftovers = mem::take(
            &mut self
                .shared
                .state
                .lock()
                .expect("ring state lock poisoned")
                .pending,
        );
        for (req, on_complete) in leftovers {
            backend::reject(
                SUBSYSTEM,
                req,
                Rejection {
                    errno: libc::ECANCELED,
                    operation: "shutdown",
                    detail: "backend shut down before the request was submitted",
                },
                on_complete,
            );
        }
    }
}

fn build_ring(entries: u32) -> Result<IoUring, RingSetupError> {
    IoUring::builder()
        .setup_clamp()
        .build(entries)
        .map_err(RingSetupError::Setup)
}

fn worker_loop(shared: &Shared, mut ring: Option<IoUring>) {
    loop {
        let batch = {
            let mut state = shared.state.lock().expect("ring state lock poisoned");
            while state.pending.is_empty() && !state.stop {
                state = shared
                    .wakeup
                    .wait(state)
                    .expect("ring state lock poisoned");
            }
            if state.pending.is_empty() {
                return;
            }
            mem::take(&mut state.pending)
        };

        match ring.as_mut() {
            Some(active) => {
                if let Err(e) = run_batch(active, batch) {
                    // Outstanding work was failed inside `run_batch`; the
                    // ring itself is no longer trustworthy.
                    tracing::warn!(error = %e, "io_uring disabled after fatal ring error");
                    ring = None;
                }
            }
            None => {
                for (req, on_complete) in batch {
                    backend::reject(
                        SUBSYSTEM,
                        req,
                        Rejection {
                            errno: libc::EINVAL,
                            operation: "submit",
                            detail: "io_uring ring is not available",
                        },
                        on_complete,
                    );
                }
            }
        }
    }
}

struct InFlight {
    req: Request,
    on_complete: CompletionCallback,
}

/// Prepares, submits and reaps one batch.
///
/// Returns an error only for ring-level failures after which the ring must
/// not be used again; every request of the batch has been completed by then.
fn run_batch(ring: &mut IoUring, batch: Vec<Pending>) -> io::Result<()> {
    let mut slots: Vec<Option<InFlight>> = Vec::with_capacity(batch.len());

    for (req, on_complete) in batch {
        if let Err(rejection) = validate(&req) {
            backend::reject(SUBSYSTEM, req, rejection, on_complete);
            continue;
        }

        let entry = prepare(&req).user_data(slots.len() as u64);
        // SAFETY: the buffer behind `entry` belongs to `req`, whose caller
        // keeps it alive until the completion callback runs, and `req` is
        // held in `slots` until its CQE is reaped.
        #[allow(unsafe_code)]
        let pushed = unsafe { ring.submission().push(&entry) };

        if pushed.is_err() {
            backend::reject(
                SUBSYSTEM,
                req,
                Rejection {
                    errno: libc::EBUSY,
                    operation: "io_uring_get_sqe",
                    detail: "submission queue is full",
                },
                on_complete,
            );
            continue;
        }
        slots.push(Some(InFlight { req, on_complete }));
    }

    let mut outstanding = slots.len();
    if outstanding == 0 {
        return Ok(());
    }

    if let Err(e) = retry_eintr(|| ring.submit_and_wait(outstanding)) {
        let errno = backend::errno_of(&e);
        report_error!(SUBSYSTEM, "io_uring_submit", format!("submission failed: {e}"), errno);
        fail_outstanding(&mut slots, errno);
        return Err(e);
    }

    while outstanding > 0 {
        let completions: Vec<cqueue::Entry> = ring.completion().collect();

        if completions.is_empty() {
            if let Err(e) = retry_eintr(|| ring.submit_and_wait(1)) {
                let errno = backend::errno_of(&e);
                report_error!(
                    SUBSYSTEM,
                    "io_uring_wait_cqe",
                    format!("failed waiting for completion: {e}"),
                    errno
                );
                fail_outstanding(&mut slots, errno);
                return Err(e);
            }
            continue;
        }

        for cqe in completions {
            let Some(slot) = usize::try_from(cqe.user_data())
                .ok()
                .and_then(|index| slots.get_mut(index))
                .and_then(Option::take)
            else {
                tracing::warn!(user_data = cqe.user_data(), "completion for unknown slot");
                continue;
            };
            outstanding -= 1;
            finish(slot, cqe.result());
        }
    }

    Ok(())
}

fn validate(req: &Request) -> Result<(), Rejection> {
    backend::validate(req, false)?;
    if u32::try_from(req.size).is_err() {
        return Err(Rejection {
            errno: libc::EINVAL,
            operation: "submit",
            detail: "request exceeds the maximum size of one ring operation",
        });
    }
    Ok(())
}

fn prepare(req: &Request) -> squeue::Entry {
    let fd = types::Fd(req.fd);
    // Checked by `validate`.
    let len = u32::try_from(req.size).unwrap_or(u32::MAX);

    match req.op {
        RequestOp::Read => {
            let dst = req.dst.map_or(std::ptr::null_mut(), |p| p.as_ptr());
            opcode::Read::new(fd, dst, len).offset(req.offset).build()
        }
        RequestOp::Write => {
            let src = req.src.map_or(std::ptr::null(), |p| p.as_ptr().cast_const());
            opcode::Write::new(fd, src, len).offset(req.offset).build()
        }
    }
}

fn finish(slot: InFlight, result: i32) {
    let InFlight {
        mut req,
        on_complete,
    } = slot;

    match usize::try_from(result) {
        Ok(bytes) => {
            if req.op == RequestOp::Read {
                if let Some(dst) = req.dst {
                    // SAFETY: the kernel has finished writing `bytes` bytes
                    // into the caller's buffer and no longer references it.
                    #[allow(unsafe_code)]
                    let filled = unsafe { dst.as_mut_slice(bytes) };
                    backend::apply_transform(req.compression, filled);
                }
            }
            req.complete_ok(bytes);
        }
        Err(_) => {
            let errno = -result;
            let detail = io::Error::from_raw_os_error(errno).to_string();
            let operation = match req.op {
                RequestOp::Read => "read",
                RequestOp::Write => "write",
            };
            report_request_error!(SUBSYSTEM, operation, detail, &req, errno);
            req.complete_err(errno);
        }
    }

    on_complete(req);
}

fn fail_outstanding(slots: &mut [Option<InFlight>], errno: i32) {
    for InFlight {
        mut req,
        on_complete,
    } in slots.iter_mut().filter_map(Option::take)
    {
        req.complete_err(errno);
        on_complete(req);
    }
}

fn retry_eintr(mut op: impl FnMut() -> io::Result<usize>) -> io::Result<usize> {
    loop {
        match op() {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            result => return result,
        }
    }
}
