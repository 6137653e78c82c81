//! Helpers shared by the unit tests.

use std::io::Write;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::backend::Backend;
use crate::report::{ErrorContext, set_error_callback};
use crate::request::Request;

static CALLBACK_LOCK: Mutex<()> = Mutex::new(());

/// Serializes tests that install the process-wide error callback.
pub(crate) fn callback_guard() -> MutexGuard<'static, ()> {
    CALLBACK_LOCK.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Collects every report delivered while installed.
///
/// Other tests run concurrently and may report through the same callback,
/// so assertions filter by a field unique to the test (usually the request
/// offset).
#[derive(Clone, Default)]
pub(crate) struct CapturedErrors {
    reports: Arc<Mutex<Vec<ErrorContext>>>,
}

impl CapturedErrors {
    pub(crate) fn install() -> Self {
        let captured = Self::default();
        let sink = Arc::clone(&captured.reports);
        set_error_callback(move |ctx| {
            sink.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(ctx.clone());
        });
        captured
    }

    pub(crate) fn all(&self) -> Vec<ErrorContext> {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn matching_offset(&self, offset: u64) -> Vec<ErrorContext> {
        self.all()
            .into_iter()
            .filter(|ctx| ctx.request.is_some_and(|req| req.offset == offset))
            .collect()
    }
}

/// Temp file pre-filled with `contents`.
pub(crate) fn file_with(contents: &[u8]) -> std::fs::File {
    let mut file = tempfile::tempfile().expect("create temp file");
    file.write_all(contents).expect("fill temp file");
    file
}

/// Submits one request directly to `backend` and waits for its callback.
pub(crate) fn run_one(backend: &dyn Backend, request: Request) -> Request {
    let (tx, rx) = mpsc::channel();
    backend.submit(
        request,
        Box::new(move |done| {
            tx.send(done).expect("test receiver alive");
        }),
    );
    rx.recv_timeout(Duration::from_secs(10))
        .expect("completion callback fired")
}
