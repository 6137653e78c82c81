//! CPU backend: positional I/O on a fixed worker pool.

use crate::backend::{self, Backend, CompletionCallback};
use crate::pool::WorkerPool;
use crate::request::Request;

const SUBSYSTEM: &str = "cpu";

/// Executes requests with blocking `pread`/`pwrite` on worker threads.
///
/// Host memory only. Reads may request [`Compression::FakeUppercase`],
/// which is applied to the bytes actually read.
///
/// [`Compression::FakeUppercase`]: crate::Compression::FakeUppercase
pub struct CpuBackend {
    pool: WorkerPool<(Request, CompletionCallback)>,
}

impl CpuBackend {
    /// Creates a backend with `worker_count` threads (0 is treated as 1).
    pub fn new(worker_count: usize) -> Self {
        Self {
            pool: WorkerPool::new("dstorage-cpu", worker_count, |(req, on_complete)| {
                execute(req, on_complete);
            }),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.pool.worker_count()
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new(1)
    }
}

impl std::fmt::Debug for CpuBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuBackend")
            .field("worker_count", &self.worker_count())
            .finish()
    }
}

impl Backend for CpuBackend {
    fn name(&self) -> &'static str {
        SUBSYSTEM
    }

    fn submit(&self, request: Request, on_complete: CompletionCallback) {
        self.pool.submit((request, on_complete));
    }
}

fn execute(mut req: Request, on_complete: CompletionCallback) {
    if let Err(rejection) = backend::validate(&req, false) {
        backend::reject(SUBSYSTEM, req, rejection, on_complete);
        return;
    }

    backend::execute_host_io(SUBSYSTEM, &mut req);
    on_complete(req);
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use crate::request::{Compression, GpuBuffer, MemoryKind, RequestStatus};
    use crate::test_support::{CapturedErrors, callback_guard, file_with, run_one};
    use std::os::fd::AsRawFd;
    use std::thread;

    #[test]
    fn read_returns_requested_bytes() {
        let file = file_with(b"hello from the cpu backend");
        let backend = CpuBackend::new(2);

        let mut buf = [0u8; 4];
        let done = run_one(&backend, unsafe { Request::read(file.as_raw_fd(), 6, &mut buf) });

        assert_eq!(done.status, RequestStatus::Ok);
        assert_eq!(done.bytes_transferred, 4);
        assert_eq!(&buf, b"from");
    }

    #[test]
    fn short_read_transforms_only_bytes_read() {
        let file = file_with(b"tail");
        let backend = CpuBackend::new(1);

        let mut buf = *b"xxxxxxxx";
        let req = unsafe { Request::read(file.as_raw_fd(), 0, &mut buf) }
            .with_compression(Compression::FakeUppercase);
        let done = run_one(&backend, req);

        assert!(done.is_ok());
        assert_eq!(done.bytes_transferred, 4);
        assert_eq!(&buf, b"TAILxxxx");
    }

    #[test]
    fn write_then_read_round_trips() {
        let file = tempfile::tempfile().unwrap();
        let backend = CpuBackend::new(2);
        let payload = b"round trip payload";

        let wrote = run_one(&backend, unsafe { Request::write(file.as_raw_fd(), 10, payload) });
        assert!(wrote.is_ok());
        assert_eq!(wrote.bytes_transferred, payload.len());

        let mut back = vec![0u8; payload.len()];
        let read = run_one(&backend, unsafe { Request::read(file.as_raw_fd(), 10, &mut back) });
        assert!(read.is_ok());
        assert_eq!(back, payload);
    }

    #[test]
    fn invalid_fd_fails_with_ebadf_and_reports() {
        let _guard = callback_guard();
        let captured = CapturedErrors::install();
        let backend = CpuBackend::new(1);

        let mut buf = [0u8; 16];
        let mut req = unsafe { Request::read(-1, 0, &mut buf) };
        req.offset = 901_001;
        let done = run_one(&backend, req);

        assert_eq!(done.status, RequestStatus::IoError);
        assert_eq!(done.errno_value, libc::EBADF);
        assert_eq!(done.bytes_transferred, 0);

        let reports = captured.matching_offset(901_001);
        assert!(!reports.is_empty());
        assert_eq!(reports[0].subsystem, "cpu");
        assert_eq!(reports[0].errno_value, libc::EBADF);
        assert!(reports[0].has_request());
    }

    #[test]
    fn gdeflate_read_is_not_supported() {
        let _guard = callback_guard();
        let captured = CapturedErrors::install();
        let file = file_with(b"compressed?");
        let backend = CpuBackend::new(1);

        let mut buf = [0u8; 11];
        let req = unsafe { Request::read(file.as_raw_fd(), 0, &mut buf) }
            .with_compression(Compression::GDeflate);
        let done = run_one(&backend, req);

        assert_eq!(done.status, RequestStatus::IoError);
        assert_eq!(done.errno_value, libc::ENOTSUP);
        assert_eq!(done.bytes_transferred, 0);
        assert_eq!(buf, [0u8; 11], "no bytes are delivered for an unsupported codec");

        let report = captured
            .all()
            .into_iter()
            .find(|ctx| ctx.operation == "decompression")
            .expect("decompression failure reported");
        assert_eq!(report.subsystem, "cpu");
        assert_eq!(report.errno_value, libc::ENOTSUP);
    }

    #[test]
    fn gpu_memory_is_rejected() {
        let backend = CpuBackend::new(1);
        let req = Request::read_to_gpu(0, 0, 8, GpuBuffer::new(1).unwrap(), 0);
        let done = run_one(&backend, req);

        assert_eq!(done.status, RequestStatus::IoError);
        assert_eq!(done.errno_value, libc::EINVAL);
    }

    #[test]
    fn memory_kind_of_the_unused_side_is_ignored() {
        let file = tempfile::tempfile().unwrap();
        let backend = CpuBackend::new(1);

        let mut write = unsafe { Request::write(file.as_raw_fd(), 0, b"host side") };
        write.dst_memory = MemoryKind::Gpu;
        let wrote = run_one(&backend, write);
        assert!(wrote.is_ok());
        assert_eq!(wrote.bytes_transferred, 9);

        let mut buf = [0u8; 9];
        let mut read = unsafe { Request::read(file.as_raw_fd(), 0, &mut buf) };
        read.src_memory = MemoryKind::Gpu;
        let done = run_one(&backend, read);
        assert!(done.is_ok());
        assert_eq!(&buf, b"host side");
    }

    #[test]
    fn read_of_directory_reports_pread() {
        let _guard = callback_guard();
        let captured = CapturedErrors::install();
        let backend = CpuBackend::new(1);

        // A directory descriptor is valid but cannot be read from.
        let dir = std::fs::File::open(std::env::temp_dir()).unwrap();
        let mut buf = [0u8; 8];
        let mut req = unsafe { Request::read(dir.as_raw_fd(), 0, &mut buf) };
        req.offset = 901_002;
        let done = run_one(&backend, req);

        assert_eq!(done.status, RequestStatus::IoError);
        assert_eq!(done.errno_value, libc::EISDIR);
        let reports = captured.matching_offset(901_002);
        assert_eq!(reports[0].operation, "pread");
    }

    #[test]
    fn callbacks_run_off_the_submitting_thread() {
        let file = file_with(b"abc");
        let backend = CpuBackend::new(1);
        let caller = thread::current().id();

        let (tx, rx) = std::sync::mpsc::channel();
        let mut buf = [0u8; 3];
        backend.submit(
            unsafe { Request::read(file.as_raw_fd(), 0, &mut buf) },
            Box::new(move |_| tx.send(thread::current().id()).unwrap()),
        );

        let worker = rx.recv().unwrap();
        assert_ne!(worker, caller);
    }
}
