//! Execution backend trait and the pieces every backend shares.
//!
//! The [`Backend`] trait is the only seam between the [`Queue`](crate::Queue)
//! and an execution strategy. Implementations:
//!
//! - [`CpuBackend`](crate::CpuBackend): worker pool doing `pread`/`pwrite`
//! - [`RingBackend`](crate::RingBackend): one thread driving an io_uring
//! - [`GpuStagingBackend`](crate::GpuStagingBackend): worker pool moving
//!   bytes between files and device buffers through staging memory
//!
//! # Contract
//!
//! `submit` never blocks on I/O and never runs the callback on the calling
//! thread. Before the callback runs, the backend sets a terminal status and,
//! on failure, `errno_value` with `bytes_transferred = 0`. Each failure is
//! also reported through the [error channel](crate::report).

use std::fs::File;
use std::io;
use std::mem::ManuallyDrop;
use std::os::fd::{FromRawFd, RawFd};
use std::os::unix::fs::FileExt;

use crate::report_request_error;
use crate::request::{Compression, Request, RequestOp};

/// Invoked exactly once with the finished request.
pub type CompletionCallback = Box<dyn FnOnce(Request) + Send + 'static>;

/// An execution strategy for [`Request`]s.
pub trait Backend: Send + Sync {
    /// Subsystem name used in error reports.
    fn name(&self) -> &'static str;

    /// Accepts `request` for asynchronous execution.
    fn submit(&self, request: Request, on_complete: CompletionCallback);
}

/// Why a request was refused before any I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Rejection {
    pub errno: i32,
    pub operation: &'static str,
    pub detail: &'static str,
}

impl Rejection {
    const fn new(errno: i32, operation: &'static str, detail: &'static str) -> Self {
        Self {
            errno,
            operation,
            detail,
        }
    }
}

/// Checks `req` against the rules every backend enforces.
///
/// `gpu_memory` says whether the backend can move bytes to or from device
/// buffers.
pub(crate) fn validate(req: &Request, gpu_memory: bool) -> Result<(), Rejection> {
    if req.fd < 0 {
        return Err(Rejection::new(libc::EBADF, "submit", "invalid file descriptor"));
    }
    if req.size == 0 {
        return Err(Rejection::new(
            libc::EINVAL,
            "submit",
            "zero-length request is not allowed",
        ));
    }
    if req.targets_gpu() && !gpu_memory {
        return Err(Rejection::new(
            libc::EINVAL,
            "submit",
            "GPU memory requested on a host-only backend",
        ));
    }

    match (req.op, req.targets_gpu()) {
        (RequestOp::Read, false) if req.dst.is_none() => {
            return Err(Rejection::new(
                libc::EINVAL,
                "submit",
                "read request missing destination buffer",
            ));
        }
        (RequestOp::Write, false) if req.src.is_none() => {
            return Err(Rejection::new(
                libc::EINVAL,
                "submit",
                "write request missing source buffer",
            ));
        }
        (_, true) if req.gpu_buffer.is_none() => {
            return Err(Rejection::new(
                libc::EINVAL,
                "submit",
                "GPU buffer handle is null",
            ));
        }
        _ => {}
    }

    match (req.op, req.compression) {
        (RequestOp::Write, Compression::FakeUppercase | Compression::GDeflate) => Err(
            Rejection::new(
                libc::ENOTSUP,
                "submit",
                "compression is not supported for write requests",
            ),
        ),
        (RequestOp::Read, Compression::GDeflate) => Err(Rejection::new(
            libc::ENOTSUP,
            "decompression",
            "GDeflate is not implemented",
        )),
        _ => Ok(()),
    }
}

/// Reports `rejection`, fails `req` and completes it.
pub(crate) fn reject(
    subsystem: &'static str,
    mut req: Request,
    rejection: Rejection,
    on_complete: CompletionCallback,
) {
    report_request_error!(
        subsystem,
        rejection.operation,
        rejection.detail,
        &req,
        rejection.errno
    );
    req.complete_err(rejection.errno);
    on_complete(req);
}

/// Maps an I/O error to an errno, defaulting to `EIO`.
pub(crate) fn errno_of(err: &io::Error) -> i32 {
    err.raw_os_error().unwrap_or(libc::EIO)
}

/// Runs `f` with a `File` view of a caller-owned descriptor without taking
/// ownership of it.
fn with_borrowed_fd<R>(fd: RawFd, f: impl FnOnce(&File) -> R) -> R {
    debug_assert!(fd >= 0, "descriptor validated before I/O");
    // SAFETY: `fd` is non-negative and owned by the caller for the duration
    // of the request; `ManuallyDrop` keeps us from closing it.
    #[allow(unsafe_code)]
    let file = ManuallyDrop::new(unsafe { File::from_raw_fd(fd) });
    f(&file)
}

/// Positional read that keeps going until `buf` is full or end-of-file.
///
/// Returns the number of bytes read.
pub(crate) fn pread_full(fd: RawFd, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    with_borrowed_fd(fd, |file| {
        let mut filled = 0;
        while filled < buf.len() {
            match file.read_at(&mut buf[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    })
}

/// Positional write of the whole of `buf`.
///
/// Returns the number of bytes written.
pub(crate) fn pwrite_full(fd: RawFd, buf: &[u8], offset: u64) -> io::Result<usize> {
    with_borrowed_fd(fd, |file| {
        let mut written = 0;
        while written < buf.len() {
            match file.write_at(&buf[written..], offset + written as u64) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(written)
    })
}

/// Applies the read-side transform for `compression` in place.
///
/// Only called with the bytes actually read.
pub(crate) fn apply_transform(compression: Compression, bytes: &mut [u8]) {
    if compression == Compression::FakeUppercase {
        bytes.make_ascii_uppercase();
    }
}

/// Host-to-host positional I/O, shared by the CPU and GPU-staging backends.
///
/// `req` must have passed [`validate`]. Only the memory kind of the side the
/// op uses matters; the other side is ignored.
pub(crate) fn execute_host_io(subsystem: &'static str, req: &mut Request) {
    debug_assert!(!req.targets_gpu());

    match req.op {
        RequestOp::Read => {
            let Some(dst) = req.dst else {
                req.complete_err(libc::EINVAL);
                return;
            };
            // SAFETY: the caller keeps `dst` alive and exclusive for `size`
            // bytes until completion (see `Request::read`).
            #[allow(unsafe_code)]
            let buf = unsafe { dst.as_mut_slice(req.size) };

            match pread_full(req.fd, buf, req.offset) {
                Ok(n) => {
                    apply_transform(req.compression, &mut buf[..n]);
                    req.complete_ok(n);
                }
                Err(e) => {
                    let errno = errno_of(&e);
                    report_request_error!(subsystem, "pread", e.to_string(), req, errno);
                    req.complete_err(errno);
                }
            }
        }
        RequestOp::Write => {
            let Some(src) = req.src else {
                req.complete_err(libc::EINVAL);
                return;
            };
            // SAFETY: the caller keeps `src` alive and unmodified for `size`
            // bytes until completion (see `Request::write`).
            #[allow(unsafe_code)]
            let buf = unsafe { src.as_slice(req.size) };

            match pwrite_full(req.fd, buf, req.offset) {
                Ok(n) => req.complete_ok(n),
                Err(e) => {
                    let errno = errno_of(&e);
                    report_request_error!(subsystem, "pwrite", e.to_string(), req, errno);
                    req.complete_err(errno);
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use crate::request::GpuBuffer;
    use std::os::fd::AsRawFd;
    use test_case::test_case;

    fn host_read(fd: RawFd, size: usize, buf: &mut [u8]) -> Request {
        let mut req = unsafe { Request::read(fd, 0, buf) };
        req.size = size;
        req
    }

    #[test_case(-1, 8 => Some(libc::EBADF); "negative fd")]
    #[test_case(3, 0 => Some(libc::EINVAL); "zero size")]
    #[test_case(3, 8 => None; "valid")]
    fn validates_fd_and_size(fd: RawFd, size: usize) -> Option<i32> {
        let mut buf = [0u8; 8];
        validate(&host_read(fd, size, &mut buf), false)
            .err()
            .map(|r| r.errno)
    }

    #[test]
    fn missing_host_buffers_are_rejected() {
        let read = Request {
            fd: 3,
            size: 4,
            ..Request::default()
        };
        assert_eq!(validate(&read, false).unwrap_err().errno, libc::EINVAL);

        let write = Request {
            fd: 3,
            size: 4,
            op: RequestOp::Write,
            ..Request::default()
        };
        assert_eq!(validate(&write, true).unwrap_err().errno, libc::EINVAL);
    }

    #[test]
    fn gpu_requests_need_gpu_capable_backend_and_handle() {
        let upload = Request::read_to_gpu(3, 0, 16, GpuBuffer::new(1).unwrap(), 0);
        assert_eq!(validate(&upload, false).unwrap_err().errno, libc::EINVAL);
        assert!(validate(&upload, true).is_ok());

        let mut no_handle = upload.clone();
        no_handle.gpu_buffer = None;
        assert_eq!(validate(&no_handle, true).unwrap_err().errno, libc::EINVAL);
    }

    #[test_case(RequestOp::Write, Compression::FakeUppercase => Some(libc::ENOTSUP); "write uppercase")]
    #[test_case(RequestOp::Write, Compression::GDeflate => Some(libc::ENOTSUP); "write gdeflate")]
    #[test_case(RequestOp::Read, Compression::GDeflate => Some(libc::ENOTSUP); "read gdeflate")]
    #[test_case(RequestOp::Read, Compression::FakeUppercase => None; "read uppercase")]
    #[test_case(RequestOp::Write, Compression::None => None; "plain write")]
    fn validates_compression(op: RequestOp, compression: Compression) -> Option<i32> {
        let mut buf = [0u8; 4];
        let req = match op {
            RequestOp::Read => unsafe { Request::read(3, 0, &mut buf) },
            RequestOp::Write => unsafe { Request::write(3, 0, &buf) },
        }
        .with_compression(compression);
        validate(&req, false).err().map(|r| r.errno)
    }

    #[test]
    fn gdeflate_rejection_names_decompression() {
        let mut buf = [0u8; 4];
        let req = unsafe { Request::read(3, 0, &mut buf) }.with_compression(Compression::GDeflate);
        assert_eq!(validate(&req, true).unwrap_err().operation, "decompression");
    }

    #[test]
    fn fake_uppercase_only_touches_ascii_lowercase() {
        let mut bytes = *b"lowercase text 123 \xff\xe9 MiXeD";
        apply_transform(Compression::FakeUppercase, &mut bytes);
        assert_eq!(&bytes, b"LOWERCASE TEXT 123 \xff\xe9 MIXED");

        let mut untouched = *b"keep me";
        apply_transform(Compression::None, &mut untouched);
        assert_eq!(&untouched, b"keep me");
    }

    #[test]
    fn pread_full_stops_at_end_of_file() {
        let mut file = tempfile::tempfile().unwrap();
        std::io::Write::write_all(&mut file, b"0123456789").unwrap();

        let mut buf = [0u8; 8];
        let n = pread_full(file.as_raw_fd(), &mut buf, 6).unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf[..4], b"6789");
    }

    #[test]
    fn pwrite_full_writes_at_offset() {
        let file = tempfile::tempfile().unwrap();
        let n = pwrite_full(file.as_raw_fd(), b"abc", 4).unwrap();
        assert_eq!(n, 3);

        let mut buf = [0xAAu8; 7];
        let read = pread_full(file.as_raw_fd(), &mut buf, 0).unwrap();
        assert_eq!(read, 7);
        assert_eq!(&buf, b"\0\0\0\0abc");
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn fake_uppercase_is_idempotent_per_byte_map(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
                let mut once = bytes.clone();
                apply_transform(Compression::FakeUppercase, &mut once);
                let mut twice = once.clone();
                apply_transform(Compression::FakeUppercase, &mut twice);
                prop_assert_eq!(&once, &twice);

                for (before, after) in bytes.iter().zip(&once) {
                    prop_assert_eq!(*after, before.to_ascii_uppercase());
                }
            }
        }
    }
}
