//! GPU-staging backend.
//!
//! Routes each request by direction and memory kind:
//!
//! - host ↔ file: same positional I/O as the CPU backend
//! - file → GPU: read into a mapped staging buffer, then a fenced
//!   staging-to-device copy at `gpu_offset`
//! - GPU → file: fenced device-to-staging copy, then a positional write from
//!   the mapped staging buffer
//!
//! Staging buffers are released on every path, including failures, by
//! [`Staging`]'s `Drop`.

mod device;
mod emulated;
#[cfg(feature = "vulkan")]
mod vulkan;

use std::io;
use std::ptr::NonNull;
use std::sync::Arc;
use std::time::Duration;

pub use device::{BufferCopy, CopyDirection, DeviceError, StagingAllocation, TransferDevice};
pub use emulated::{EmulatedDevice, Fault};
#[cfg(feature = "vulkan")]
pub use vulkan::{BorrowedVulkan, VulkanDevice, VulkanInitError};

use crate::backend::{self, Backend, CompletionCallback, Rejection};
use crate::pool::WorkerPool;
use crate::request::{GpuBuffer, Request, RequestOp};
use crate::{report_error, report_request_error};

const SUBSYSTEM: &str = "gpu";

/// Default bound on a single fence wait.
pub const DEFAULT_FENCE_TIMEOUT: Duration = Duration::from_secs(1);

/// Construction parameters for [`GpuStagingBackend`].
#[derive(Clone)]
pub struct GpuBackendConfig {
    /// Device to transfer through. When `None`, a Vulkan device is created
    /// if the `vulkan` feature is enabled and one is available.
    pub device: Option<Arc<dyn TransferDevice>>,
    pub worker_count: usize,
    pub fence_timeout: Duration,
}

impl Default for GpuBackendConfig {
    fn default() -> Self {
        Self {
            device: None,
            worker_count: 1,
            fence_timeout: DEFAULT_FENCE_TIMEOUT,
        }
    }
}

impl std::fmt::Debug for GpuBackendConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuBackendConfig")
            .field("device", &self.device.as_ref().map(|d| d.name()))
            .field("worker_count", &self.worker_count)
            .field("fence_timeout", &self.fence_timeout)
            .finish()
    }
}

#[derive(Clone)]
struct Executor {
    device: Option<Arc<dyn TransferDevice>>,
    fence_timeout: Duration,
}

/// Moves bytes between files and device buffers through staging memory.
///
/// Without a device every request fails with `EINVAL`.
pub struct GpuStagingBackend {
    pool: WorkerPool<(Request, CompletionCallback)>,
    device_name: Option<&'static str>,
}

impl GpuStagingBackend {
    pub fn new(config: GpuBackendConfig) -> Self {
        let device = config.device.or_else(default_device);
        let device_name = device.as_ref().map(|d| d.name());
        if device.is_none() {
            report_error!(
                SUBSYSTEM,
                "device_init",
                "no transfer device available",
                libc::EINVAL
            );
            tracing::warn!("GPU staging backend has no device, requests will fail");
        }

        let executor = Executor {
            device,
            fence_timeout: config.fence_timeout,
        };
        let pool = WorkerPool::new(
            "dstorage-gpu",
            config.worker_count,
            move |(req, on_complete)| executor.execute(req, on_complete),
        );

        tracing::debug!(
            device = device_name.unwrap_or("none"),
            worker_count = pool.worker_count(),
            fence_timeout_ms = config.fence_timeout.as_millis(),
            "GPU staging backend started"
        );

        Self { pool, device_name }
    }

    /// Shortcut for a backend over `device` with default settings.
    pub fn with_device(device: Arc<dyn TransferDevice>) -> Self {
        Self::new(GpuBackendConfig {
            device: Some(device),
            ..GpuBackendConfig::default()
        })
    }

    pub fn has_device(&self) -> bool {
        self.device_name.is_some()
    }

    pub fn worker_count(&self) -> usize {
        self.pool.worker_count()
    }
}

impl std::fmt::Debug for GpuStagingBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuStagingBackend")
            .field("device", &self.device_name)
            .field("worker_count", &self.worker_count())
            .finish()
    }
}

impl Backend for GpuStagingBackend {
    fn name(&self) -> &'static str {
        SUBSYSTEM
    }

    fn submit(&self, request: Request, on_complete: CompletionCallback) {
        self.pool.submit((request, on_complete));
    }
}

#[cfg(feature = "vulkan")]
fn default_device() -> Option<Arc<dyn TransferDevice>> {
    VulkanDevice::create()
        .ok()
        .map(|device| Arc::new(device) as Arc<dyn TransferDevice>)
}

#[cfg(not(feature = "vulkan"))]
fn default_device() -> Option<Arc<dyn TransferDevice>> {
    None
}

/// A failed staging step.
enum StagingFailure {
    Device(DeviceError),
    Io(&'static str, io::Error),
}

impl From<DeviceError> for StagingFailure {
    fn from(e: DeviceError) -> Self {
        Self::Device(e)
    }
}

impl StagingFailure {
    fn report_and_fail(self, req: &mut Request) {
        let (operation, errno, detail) = match self {
            Self::Device(e) => (e.operation(), e.errno(), e.to_string()),
            Self::Io(operation, e) => (operation, backend::errno_of(&e), e.to_string()),
        };
        report_request_error!(SUBSYSTEM, operation, detail, req, errno);
        req.complete_err(errno);
    }
}

impl Executor {
    fn execute(&self, mut req: Request, on_complete: CompletionCallback) {
        if let Err(rejection) = backend::validate(&req, true) {
            backend::reject(SUBSYSTEM, req, rejection, on_complete);
            return;
        }
        let Some(device) = self.device.as_deref() else {
            backend::reject(
                SUBSYSTEM,
                req,
                Rejection {
                    errno: libc::EINVAL,
                    operation: "handle_request",
                    detail: "transfer device not initialized",
                },
                on_complete,
            );
            return;
        };

        match (req.op, req.gpu_buffer.filter(|_| req.targets_gpu())) {
            (_, None) => backend::execute_host_io(SUBSYSTEM, &mut req),
            (RequestOp::Read, Some(buffer)) => {
                match file_to_gpu(device, self.fence_timeout, &req, buffer) {
                    Ok(bytes) => req.complete_ok(bytes),
                    Err(failure) => failure.report_and_fail(&mut req),
                }
            }
            (RequestOp::Write, Some(buffer)) => {
                match gpu_to_file(device, self.fence_timeout, &req, buffer) {
                    Ok(bytes) => req.complete_ok(bytes),
                    Err(failure) => failure.report_and_fail(&mut req),
                }
            }
        }

        on_complete(req);
    }
}

/// Reads the file range into staging memory and copies the bytes read into
/// `buffer`. Returns the number of bytes transferred.
fn file_to_gpu(
    device: &dyn TransferDevice,
    fence_timeout: Duration,
    req: &Request,
    buffer: GpuBuffer,
) -> Result<usize, StagingFailure> {
    let mut staging = Staging::allocate(device, req.size)?;

    let read = {
        let mut mapped = staging.map()?;
        let bytes = mapped.as_mut_slice();
        let read = backend::pread_full(req.fd, bytes, req.offset)
            .map_err(|e| StagingFailure::Io("pread", e))?;
        backend::apply_transform(req.compression, &mut bytes[..read]);
        read
    };

    if read > 0 {
        staging.copy(
            &BufferCopy {
                direction: CopyDirection::StagingToDevice,
                staging: staging.id(),
                device_buffer: buffer,
                device_offset: req.gpu_offset,
                size: read,
            },
            fence_timeout,
        )?;
    }
    Ok(read)
}

/// Copies `req.size` bytes of `buffer` into staging memory and writes them
/// to the file. Returns the number of bytes written.
fn gpu_to_file(
    device: &dyn TransferDevice,
    fence_timeout: Duration,
    req: &Request,
    buffer: GpuBuffer,
) -> Result<usize, StagingFailure> {
    let mut staging = Staging::allocate(device, req.size)?;

    staging.copy(
        &BufferCopy {
            direction: CopyDirection::DeviceToStaging,
            staging: staging.id(),
            device_buffer: buffer,
            device_offset: req.gpu_offset,
            size: req.size,
        },
        fence_timeout,
    )?;

    let mapped = staging.map()?;
    backend::pwrite_full(req.fd, mapped.as_slice(), req.offset)
        .map_err(|e| StagingFailure::Io("pwrite", e))
}

/// Owns one staging allocation and releases it on drop.
struct Staging<'d> {
    device: &'d dyn TransferDevice,
    allocation: StagingAllocation,
    // Set when a copy may still be running on the device.
    in_flight: bool,
}

impl<'d> Staging<'d> {
    fn allocate(device: &'d dyn TransferDevice, size: usize) -> Result<Self, DeviceError> {
        Ok(Self {
            device,
            allocation: device.allocate_staging(size)?,
            in_flight: false,
        })
    }

    fn id(&self) -> u64 {
        self.allocation.id()
    }

    fn map(&self) -> Result<Mapped<'_>, DeviceError> {
        let ptr = self.device.map_staging(&self.allocation)?;
        Ok(Mapped {
            device: self.device,
            allocation: &self.allocation,
            ptr,
        })
    }

    fn copy(&mut self, copy: &BufferCopy, fence_timeout: Duration) -> Result<(), DeviceError> {
        let result = self.device.copy_buffer(copy, fence_timeout);
        if matches!(result, Err(DeviceError::FenceTimeout(_))) {
            self.in_flight = true;
        }
        result
    }
}

impl Drop for Staging<'_> {
    fn drop(&mut self) {
        if self.in_flight {
            if let Err(e) = self.device.wait_idle() {
                tracing::warn!(error = %e, "wait for device idle failed before staging release");
            }
        }
        self.device.release_staging(&self.allocation);
    }
}

/// A mapped view of a staging buffer; unmaps on drop.
struct Mapped<'s> {
    device: &'s dyn TransferDevice,
    allocation: &'s StagingAllocation,
    ptr: NonNull<u8>,
}

impl Mapped<'_> {
    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: `TransferDevice` guarantees the mapping covers
        // `allocation.size()` bytes until unmapped, and `Mapped` is the only
        // view of it.
        #[allow(unsafe_code)]
        unsafe {
            std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.allocation.size())
        }
    }

    fn as_slice(&self) -> &[u8] {
        // SAFETY: as in `as_mut_slice`.
        #[allow(unsafe_code)]
        unsafe {
            std::slice::from_raw_parts(self.ptr.as_ptr(), self.allocation.size())
        }
    }
}

impl Drop for Mapped<'_> {
    fn drop(&mut self) {
        self.device.unmap_staging(self.allocation);
    }
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use crate::request::{Compression, MemoryKind, RequestStatus};
    use crate::test_support::{CapturedErrors, callback_guard, file_with, run_one};
    use std::os::fd::AsRawFd;
    use test_case::test_case;

    fn emulated() -> (Arc<EmulatedDevice>, GpuStagingBackend) {
        let device = Arc::new(EmulatedDevice::new());
        let backend = GpuStagingBackend::with_device(device.clone());
        (device, backend)
    }

    #[test]
    fn file_to_gpu_lands_at_gpu_offset() {
        let (device, backend) = emulated();
        let file = file_with(b"....texture bytes....");
        let buffer = device.create_buffer(32);

        let done = run_one(
            &backend,
            Request::read_to_gpu(file.as_raw_fd(), 4, 13, buffer, 8),
        );

        assert_eq!(done.status, RequestStatus::Ok);
        assert_eq!(done.bytes_transferred, 13);
        assert_eq!(device.read_buffer(buffer, 8, 13).unwrap(), b"texture bytes");
        assert_eq!(device.read_buffer(buffer, 0, 8).unwrap(), [0u8; 8]);
        assert_eq!(device.live_staging(), 0);
    }

    #[test]
    fn file_to_gpu_applies_fake_uppercase_to_bytes_read() {
        let (device, backend) = emulated();
        let file = file_with(b"shader");
        let buffer = device.create_buffer(16);
        device.write_buffer(buffer, 0, &[b'#'; 16]).unwrap();

        let req = Request::read_to_gpu(file.as_raw_fd(), 0, 12, buffer, 0)
            .with_compression(Compression::FakeUppercase);
        let done = run_one(&backend, req);

        assert!(done.is_ok());
        assert_eq!(done.bytes_transferred, 6);
        assert_eq!(device.read_buffer(buffer, 0, 8).unwrap(), b"SHADER##");
    }

    #[test]
    fn gpu_to_file_writes_device_bytes() {
        let (device, backend) = emulated();
        let file = tempfile::tempfile().unwrap();
        let buffer = device.create_buffer(16);
        device.write_buffer(buffer, 4, b"readback").unwrap();

        let done = run_one(
            &backend,
            Request::write_from_gpu(file.as_raw_fd(), 2, 8, buffer, 4),
        );
        assert!(done.is_ok());
        assert_eq!(done.bytes_transferred, 8);

        let mut on_disk = [0u8; 10];
        let n = backend::pread_full(file.as_raw_fd(), &mut on_disk, 0).unwrap();
        assert_eq!(n, 10);
        assert_eq!(&on_disk, b"\0\0readback");
        assert_eq!(device.live_staging(), 0);
    }

    #[test]
    fn host_requests_match_cpu_backend() {
        let (_device, backend) = emulated();
        let file = file_with(b"host path through gpu backend");
        let cpu = crate::CpuBackend::new(1);

        let mut via_gpu = [0u8; 9];
        let mut via_cpu = [0u8; 9];
        let gpu_done = run_one(&backend, unsafe {
            Request::read(file.as_raw_fd(), 5, &mut via_gpu)
        }
        .with_compression(Compression::FakeUppercase));
        let cpu_done = run_one(&cpu, unsafe {
            Request::read(file.as_raw_fd(), 5, &mut via_cpu)
        }
        .with_compression(Compression::FakeUppercase));

        assert_eq!(gpu_done.status, cpu_done.status);
        assert_eq!(gpu_done.bytes_transferred, cpu_done.bytes_transferred);
        assert_eq!(via_gpu, via_cpu);
        assert_eq!(&via_gpu, b"PATH THRO");
    }

    #[test]
    fn gdeflate_read_is_not_supported() {
        let (device, backend) = emulated();
        let file = file_with(b"packed");
        let buffer = device.create_buffer(8);

        let to_gpu = run_one(
            &backend,
            Request::read_to_gpu(file.as_raw_fd(), 0, 6, buffer, 0)
                .with_compression(Compression::GDeflate),
        );
        assert_eq!(to_gpu.errno_value, libc::ENOTSUP);
        assert_eq!(device.read_buffer(buffer, 0, 8).unwrap(), [0u8; 8]);
        assert_eq!(device.staging_allocations(), 0);

        let mut buf = [0u8; 6];
        let to_host = run_one(
            &backend,
            unsafe { Request::read(file.as_raw_fd(), 0, &mut buf) }
                .with_compression(Compression::GDeflate),
        );
        assert_eq!(to_host.status, RequestStatus::IoError);
        assert_eq!(to_host.errno_value, libc::ENOTSUP);
        assert_eq!(buf, [0u8; 6]);
    }

    #[test]
    fn memory_kind_of_the_unused_side_is_ignored() {
        let (device, backend) = emulated();
        let file = file_with(b"plain host bytes");

        let mut buf = [0u8; 5];
        let mut read = unsafe { Request::read(file.as_raw_fd(), 6, &mut buf) };
        read.src_memory = MemoryKind::Gpu;
        let done = run_one(&backend, read);

        assert!(done.is_ok());
        assert_eq!(&buf, b"host ");
        assert_eq!(device.staging_allocations(), 0);
    }

    #[test_case(Fault::Allocation, RequestOp::Read => (libc::ENOMEM, "create_staging_buffer"); "upload alloc")]
    #[test_case(Fault::Map, RequestOp::Read => (libc::EIO, "map_staging"); "upload map")]
    #[test_case(Fault::Copy, RequestOp::Read => (libc::EIO, "copy_buffer"); "upload copy")]
    #[test_case(Fault::FenceTimeout, RequestOp::Read => (libc::EIO, "fence_wait"); "upload fence")]
    #[test_case(Fault::Allocation, RequestOp::Write => (libc::ENOMEM, "create_staging_buffer"); "download alloc")]
    #[test_case(Fault::Copy, RequestOp::Write => (libc::EIO, "copy_buffer"); "download copy")]
    #[test_case(Fault::Map, RequestOp::Write => (libc::EIO, "map_staging"); "download map")]
    #[test_case(Fault::FenceTimeout, RequestOp::Write => (libc::EIO, "fence_wait"); "download fence")]
    fn staging_faults_fail_cleanly(fault: Fault, op: RequestOp) -> (i32, &'static str) {
        let _guard = callback_guard();
        let captured = CapturedErrors::install();
        let (device, backend) = emulated();
        let file = file_with(&[b'z'; 64]);
        let buffer = device.create_buffer(64);
        device.fail_next(fault);

        // Reads start inside the file so the upload reaches the device copy.
        // The size identifies this case's report.
        let size = 40 + fault as usize * 2 + op as usize;
        let req = match op {
            RequestOp::Read => Request::read_to_gpu(file.as_raw_fd(), 0, size, buffer, 0),
            RequestOp::Write => Request::write_from_gpu(file.as_raw_fd(), 0, size, buffer, 0),
        };
        let done = run_one(&backend, req);

        assert_eq!(done.status, RequestStatus::IoError);
        assert_eq!(done.bytes_transferred, 0);
        assert_eq!(device.live_staging(), 0, "staging released on failure");
        if fault == Fault::FenceTimeout {
            assert_eq!(device.wait_idle_calls(), 1);
        }

        let reports: Vec<_> = captured
            .all()
            .into_iter()
            .filter(|ctx| ctx.subsystem == "gpu")
            .filter(|ctx| ctx.request.is_some_and(|r| r.size == size))
            .collect();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].errno_value, done.errno_value);
        (done.errno_value, reports[0].operation.clone().leak())
    }

    #[test]
    fn missing_device_fails_every_request_with_einval() {
        let backend = GpuStagingBackend::new(GpuBackendConfig {
            device: None,
            ..GpuBackendConfig::default()
        });
        if backend.has_device() {
            // A real Vulkan device was found.
            return;
        }
        let file = file_with(b"data");

        let mut buf = [0u8; 4];
        let host = run_one(&backend, unsafe { Request::read(file.as_raw_fd(), 0, &mut buf) });
        assert_eq!(host.errno_value, libc::EINVAL);

        let upload = run_one(
            &backend,
            Request::read_to_gpu(file.as_raw_fd(), 0, 4, GpuBuffer::new(9).unwrap(), 0),
        );
        assert_eq!(upload.status, RequestStatus::IoError);
        assert_eq!(upload.errno_value, libc::EINVAL);
    }

    #[test]
    fn validation_precedes_device_check() {
        let backend = GpuStagingBackend::new(GpuBackendConfig::default());
        let done = run_one(
            &backend,
            Request::read_to_gpu(-1, 0, 4, GpuBuffer::new(9).unwrap(), 0),
        );
        assert_eq!(done.errno_value, libc::EBADF);
    }

    #[test]
    fn unknown_device_buffer_is_einval() {
        let (device, backend) = emulated();
        let file = file_with(b"abcd");

        let done = run_one(
            &backend,
            Request::read_to_gpu(file.as_raw_fd(), 0, 4, GpuBuffer::new(0xdead).unwrap(), 0),
        );
        assert_eq!(done.errno_value, libc::EINVAL);
        assert_eq!(device.live_staging(), 0);
    }

    #[test]
    fn pread_failure_reports_real_errno() {
        let (device, backend) = emulated();
        let dir = std::fs::File::open(std::env::temp_dir()).unwrap();
        let buffer = device.create_buffer(8);

        let done = run_one(&backend, Request::read_to_gpu(dir.as_raw_fd(), 0, 8, buffer, 0));
        assert_eq!(done.errno_value, libc::EISDIR);
        assert_eq!(device.live_staging(), 0);
    }
}
