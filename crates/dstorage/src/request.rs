//! Request and status model.
//!
//! A [`Request`] describes one positional read or write against a raw file
//! descriptor. It is plain data: it moves into a backend on submission and
//! comes back, with a terminal [`RequestStatus`], through the completion
//! callback.
//!
//! # Buffer ownership
//!
//! Host buffers are carried as raw pointers ([`HostPtr`]). The runtime never
//! owns them; the caller keeps every attached buffer alive, unaliased and at
//! least `size` bytes long until the request's completion callback has run.
//! The constructors that attach host buffers are `unsafe` for that reason.
//! GPU buffers are opaque [`GpuBuffer`] handles that the runtime passes to
//! the transfer device unchanged.

use std::os::fd::RawFd;
use std::ptr::NonNull;

/// Direction of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RequestOp {
    /// File to memory.
    #[default]
    Read,
    /// Memory to file.
    Write,
}

impl RequestOp {
    /// Short lowercase name used in diagnostics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
        }
    }
}

/// Which side of a transfer lives in device memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MemoryKind {
    #[default]
    Host,
    Gpu,
}

/// Post-read transform requested for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Compression {
    /// Bytes are delivered as stored.
    #[default]
    None,
    /// Demo transform: ASCII lowercase is mapped to uppercase.
    FakeUppercase,
    /// Block-compressed GPU format. Not implemented; always fails with
    /// `ENOTSUP`.
    GDeflate,
}

/// Lifecycle state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RequestStatus {
    #[default]
    Pending,
    Ok,
    IoError,
}

impl RequestStatus {
    /// Returns true for `Ok` and `IoError`.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Raw pointer to caller-owned host memory.
///
/// `HostPtr` is `Send` and `Sync` so that requests can cross into backend
/// worker threads. Soundness rests on the contract documented on the
/// [`Request`] constructors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostPtr(NonNull<u8>);

// SAFETY: the pointer is only dereferenced by the backend that owns the
// request, and the caller guarantees exclusive, live access until the
// completion callback fires.
#[allow(unsafe_code)]
unsafe impl Send for HostPtr {}
// SAFETY: see `Send` above; the runtime never dereferences a `HostPtr` from
// two threads at once.
#[allow(unsafe_code)]
unsafe impl Sync for HostPtr {}

impl HostPtr {
    /// Wraps a raw pointer. Returns `None` for null.
    pub fn new(ptr: *mut u8) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    /// Wraps a read-only pointer. The runtime only reads through pointers
    /// used as write sources.
    pub fn from_const(ptr: *const u8) -> Option<Self> {
        NonNull::new(ptr.cast_mut()).map(Self)
    }

    pub fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    /// Reborrows `len` bytes as a mutable slice.
    ///
    /// # Safety
    ///
    /// The memory must be live, writable, at least `len` bytes long and not
    /// accessed through any other path for the lifetime of the slice.
    #[allow(unsafe_code)]
    pub(crate) unsafe fn as_mut_slice<'a>(self, len: usize) -> &'a mut [u8] {
        // SAFETY: upheld by the caller.
        unsafe { std::slice::from_raw_parts_mut(self.0.as_ptr(), len) }
    }

    /// Reborrows `len` bytes as a shared slice.
    ///
    /// # Safety
    ///
    /// The memory must be live, at least `len` bytes long and not written
    /// through any other path for the lifetime of the slice.
    #[allow(unsafe_code)]
    pub(crate) unsafe fn as_slice<'a>(self, len: usize) -> &'a [u8] {
        // SAFETY: upheld by the caller.
        unsafe { std::slice::from_raw_parts(self.0.as_ptr(), len) }
    }
}

/// Opaque device-buffer handle (for Vulkan, the raw `VkBuffer`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GpuBuffer(u64);

impl GpuBuffer {
    /// Wraps a raw handle. Returns `None` for the null handle.
    pub fn new(raw: u64) -> Option<Self> {
        (raw != 0).then_some(Self(raw))
    }

    pub fn as_raw(self) -> u64 {
        self.0
    }
}

/// One I/O operation and, once completed, its outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub fd: RawFd,
    pub offset: u64,
    pub size: usize,
    pub op: RequestOp,
    /// Destination for host reads.
    pub dst: Option<HostPtr>,
    /// Source for host writes.
    pub src: Option<HostPtr>,
    pub gpu_buffer: Option<GpuBuffer>,
    pub gpu_offset: u64,
    pub dst_memory: MemoryKind,
    pub src_memory: MemoryKind,
    pub compression: Compression,
    pub status: RequestStatus,
    /// Platform errno; meaningful only when `status == IoError`.
    pub errno_value: i32,
    pub bytes_transferred: usize,
    /// Caller-defined correlation value, passed through unchanged.
    pub tag: u64,
}

impl Default for Request {
    fn default() -> Self {
        Self {
            fd: -1,
            offset: 0,
            size: 0,
            op: RequestOp::Read,
            dst: None,
            src: None,
            gpu_buffer: None,
            gpu_offset: 0,
            dst_memory: MemoryKind::Host,
            src_memory: MemoryKind::Host,
            compression: Compression::None,
            status: RequestStatus::Pending,
            errno_value: 0,
            bytes_transferred: 0,
            tag: 0,
        }
    }
}

impl Request {
    /// Reads `dst.len()` bytes at `offset` into `dst`.
    ///
    /// # Safety
    ///
    /// `dst` must stay alive and must not be read or written by anyone else
    /// until the completion callback for this request has run.
    #[allow(unsafe_code)]
    pub unsafe fn read(fd: RawFd, offset: u64, dst: &mut [u8]) -> Self {
        Self {
            fd,
            offset,
            size: dst.len(),
            op: RequestOp::Read,
            dst: HostPtr::new(dst.as_mut_ptr()),
            ..Self::default()
        }
    }

    /// Writes all of `src` at `offset`.
    ///
    /// # Safety
    ///
    /// `src` must stay alive and must not be written by anyone else until the
    /// completion callback for this request has run.
    #[allow(unsafe_code)]
    pub unsafe fn write(fd: RawFd, offset: u64, src: &[u8]) -> Self {
        Self {
            fd,
            offset,
            size: src.len(),
            op: RequestOp::Write,
            src: HostPtr::from_const(src.as_ptr()),
            ..Self::default()
        }
    }

    /// Reads `size` bytes at `offset` into `buffer` at `gpu_offset`.
    pub fn read_to_gpu(
        fd: RawFd,
        offset: u64,
        size: usize,
        buffer: GpuBuffer,
        gpu_offset: u64,
    ) -> Self {
        Self {
            fd,
            offset,
            size,
            op: RequestOp::Read,
            gpu_buffer: Some(buffer),
            gpu_offset,
            dst_memory: MemoryKind::Gpu,
            ..Self::default()
        }
    }

    /// Writes `size` bytes from `buffer` at `gpu_offset` to the file at
    /// `offset`.
    pub fn write_from_gpu(
        fd: RawFd,
        offset: u64,
        size: usize,
        buffer: GpuBuffer,
        gpu_offset: u64,
    ) -> Self {
        Self {
            fd,
            offset,
            size,
            op: RequestOp::Write,
            gpu_buffer: Some(buffer),
            gpu_offset,
            src_memory: MemoryKind::Gpu,
            ..Self::default()
        }
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_tag(mut self, tag: u64) -> Self {
        self.tag = tag;
        self
    }

    /// True when the request touches device memory on its memory side.
    pub fn targets_gpu(&self) -> bool {
        match self.op {
            RequestOp::Read => self.dst_memory == MemoryKind::Gpu,
            RequestOp::Write => self.src_memory == MemoryKind::Gpu,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == RequestStatus::Ok
    }

    /// Marks the request successful.
    pub(crate) fn complete_ok(&mut self, bytes: usize) {
        self.status = RequestStatus::Ok;
        self.errno_value = 0;
        self.bytes_transferred = bytes;
    }

    /// Marks the request failed with `errno`.
    pub(crate) fn complete_err(&mut self, errno: i32) {
        self.status = RequestStatus::IoError;
        self.errno_value = errno;
        self.bytes_transferred = 0;
    }

    /// Key fields embedded into error reports.
    pub fn snapshot(&self) -> RequestSnapshot {
        RequestSnapshot {
            fd: self.fd,
            offset: self.offset,
            size: self.size,
            op: self.op,
            dst_memory: self.dst_memory,
            src_memory: self.src_memory,
        }
    }
}

/// Copy of the identifying fields of a [`Request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestSnapshot {
    pub fd: RawFd,
    pub offset: u64,
    pub size: usize,
    pub op: RequestOp,
    pub dst_memory: MemoryKind,
    pub src_memory: MemoryKind,
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;

    #[test]
    fn default_request_is_pending_and_invalid() {
        let req = Request::default();
        assert_eq!(req.fd, -1);
        assert_eq!(req.size, 0);
        assert_eq!(req.status, RequestStatus::Pending);
        assert!(!req.status.is_terminal());
    }

    #[test]
    fn host_constructors_capture_buffer_and_size() {
        let mut dst = [0u8; 16];
        let src = b"payload";

        let read = unsafe { Request::read(3, 128, &mut dst) };
        assert_eq!(read.size, 16);
        assert_eq!(read.op, RequestOp::Read);
        assert_eq!(read.dst.map(HostPtr::as_ptr), Some(dst.as_mut_ptr()));
        assert!(read.src.is_none());
        assert!(!read.targets_gpu());

        let write = unsafe { Request::write(3, 0, src) };
        assert_eq!(write.size, src.len());
        assert_eq!(write.op, RequestOp::Write);
        assert!(write.dst.is_none());
        assert!(write.src.is_some());
    }

    #[test]
    fn gpu_constructors_set_memory_kind() {
        let buffer = GpuBuffer::new(7).unwrap();

        let upload = Request::read_to_gpu(4, 0, 64, buffer, 256);
        assert_eq!(upload.dst_memory, MemoryKind::Gpu);
        assert_eq!(upload.src_memory, MemoryKind::Host);
        assert!(upload.targets_gpu());

        let download = Request::write_from_gpu(4, 0, 64, buffer, 0);
        assert_eq!(download.src_memory, MemoryKind::Gpu);
        assert!(download.targets_gpu());
    }

    #[test]
    fn null_handles_are_rejected() {
        assert!(GpuBuffer::new(0).is_none());
        assert!(HostPtr::new(std::ptr::null_mut()).is_none());
    }

    #[test]
    fn completion_helpers_set_terminal_state() {
        let mut req = Request::default();
        req.complete_ok(42);
        assert!(req.is_ok());
        assert_eq!(req.bytes_transferred, 42);

        req.complete_err(libc::EIO);
        assert_eq!(req.status, RequestStatus::IoError);
        assert_eq!(req.errno_value, libc::EIO);
        assert_eq!(req.bytes_transferred, 0);
    }
}
