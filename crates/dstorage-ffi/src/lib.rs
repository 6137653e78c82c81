//! # dstorage FFI
//!
//! C-compatible Foreign Function Interface for the dstorage runtime.
//!
//! Conventions:
//!
//! - Handles (`DsBackend`, `DsQueue`) are opaque and created by `ds_make_*`
//!   / `ds_queue_create`, then freed with the matching `*_release`
//! - NULL handles are tolerated everywhere: the call does nothing and returns
//!   a neutral value
//! - Enumerations cross the boundary as small integers (`DS_*` constants)
//!
//! ## Request Lifetime
//!
//! A `DsRequest` passed to `ds_queue_enqueue` is written back in place when
//! it completes (`status`, `errno_value`, `bytes_transferred`). It and the
//! buffers it points to must stay valid and untouched until then, i.e.
//! until its completion callback has run or `ds_queue_wait_all` returned.
//!
//! ## Thread Safety
//!
//! Queues and backends may be used from several threads. Completion
//! callbacks run on backend worker threads.

#![allow(unsafe_code)]

use std::os::raw::{c_int, c_void};
use std::sync::Arc;

use dstorage::gpu::{GpuBackendConfig, GpuStagingBackend};
use dstorage::{
    Backend, Compression, CpuBackend, GpuBuffer, HostPtr, MemoryKind, Queue, Request,
    RequestOp, RequestStatus,
};

pub const DS_REQUEST_OP_READ: u32 = 0;
pub const DS_REQUEST_OP_WRITE: u32 = 1;

pub const DS_REQUEST_MEMORY_HOST: u32 = 0;
pub const DS_REQUEST_MEMORY_GPU: u32 = 1;

pub const DS_COMPRESSION_NONE: u32 = 0;
pub const DS_COMPRESSION_FAKE_UPPERCASE: u32 = 1;
pub const DS_COMPRESSION_GDEFLATE: u32 = 2;

pub const DS_REQUEST_PENDING: u32 = 0;
pub const DS_REQUEST_OK: u32 = 1;
pub const DS_REQUEST_IO_ERROR: u32 = 2;

/// C mirror of [`Request`].
///
/// `gpu_buffer` is an opaque device handle; 0 means none.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct DsRequest {
    pub fd: c_int,
    pub offset: u64,
    pub size: usize,
    pub dst: *mut c_void,
    pub src: *const c_void,
    pub gpu_buffer: u64,
    pub gpu_offset: u64,
    pub op: u32,
    pub dst_memory: u32,
    pub src_memory: u32,
    pub compression: u32,
    pub status: u32,
    pub errno_value: c_int,
    pub bytes_transferred: usize,
}

impl Default for DsRequest {
    fn default() -> Self {
        Self {
            fd: -1,
            offset: 0,
            size: 0,
            dst: std::ptr::null_mut(),
            src: std::ptr::null(),
            gpu_buffer: 0,
            gpu_offset: 0,
            op: DS_REQUEST_OP_READ,
            dst_memory: DS_REQUEST_MEMORY_HOST,
            src_memory: DS_REQUEST_MEMORY_HOST,
            compression: DS_COMPRESSION_NONE,
            status: DS_REQUEST_PENDING,
            errno_value: 0,
            bytes_transferred: 0,
        }
    }
}

/// io_uring backend parameters.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct DsIoUringBackendConfig {
    pub entries: u32,
}

/// A field of a [`DsRequest`] holds a value outside its enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid {field} value {value}")]
pub struct ConversionError {
    pub field: &'static str,
    pub value: u32,
}

impl ConversionError {
    pub fn errno(&self) -> c_int {
        libc::EINVAL
    }
}

/// Completion callback: the finished request and the `user_data` passed to
/// `ds_queue_submit_all`.
pub type DsCompletionCallback = Option<unsafe extern "C" fn(*mut DsRequest, *mut c_void)>;

/// Opaque backend handle.
pub struct DsBackend {
    inner: Arc<dyn Backend>,
}

/// Opaque queue handle.
pub struct DsQueue {
    inner: Queue,
}

fn op_from_raw(value: u32) -> Result<RequestOp, ConversionError> {
    match value {
        DS_REQUEST_OP_READ => Ok(RequestOp::Read),
        DS_REQUEST_OP_WRITE => Ok(RequestOp::Write),
        _ => Err(ConversionError { field: "op", value }),
    }
}

fn memory_from_raw(field: &'static str, value: u32) -> Result<MemoryKind, ConversionError> {
    match value {
        DS_REQUEST_MEMORY_HOST => Ok(MemoryKind::Host),
        DS_REQUEST_MEMORY_GPU => Ok(MemoryKind::Gpu),
        _ => Err(ConversionError { field, value }),
    }
}

fn compression_from_raw(value: u32) -> Result<Compression, ConversionError> {
    match value {
        DS_COMPRESSION_NONE => Ok(Compression::None),
        DS_COMPRESSION_FAKE_UPPERCASE => Ok(Compression::FakeUppercase),
        DS_COMPRESSION_GDEFLATE => Ok(Compression::GDeflate),
        _ => Err(ConversionError {
            field: "compression",
            value,
        }),
    }
}

fn status_to_raw(status: RequestStatus) -> u32 {
    match status {
        RequestStatus::Pending => DS_REQUEST_PENDING,
        RequestStatus::Ok => DS_REQUEST_OK,
        RequestStatus::IoError => DS_REQUEST_IO_ERROR,
    }
}

/// Builds the core request for `raw`, tagged with `raw`'s address so the
/// completion can be written back.
pub fn to_request(raw: &DsRequest) -> Result<Request, ConversionError> {
    Ok(Request {
        fd: raw.fd,
        offset: raw.offset,
        size: raw.size,
        op: op_from_raw(raw.op)?,
        dst: HostPtr::new(raw.dst.cast()),
        src: HostPtr::from_const(raw.src.cast()),
        gpu_buffer: GpuBuffer::new(raw.gpu_buffer),
        gpu_offset: raw.gpu_offset,
        dst_memory: memory_from_raw("dst_memory", raw.dst_memory)?,
        src_memory: memory_from_raw("src_memory", raw.src_memory)?,
        compression: compression_from_raw(raw.compression)?,
        tag: std::ptr::from_ref(raw) as u64,
        ..Request::default()
    })
}

/// Copies the outcome of `done` into `raw`.
pub fn apply_completion(raw: &mut DsRequest, done: &Request) {
    raw.status = status_to_raw(done.status);
    raw.errno_value = done.errno_value;
    raw.bytes_transferred = done.bytes_transferred;
}

fn into_handle(backend: Arc<dyn Backend>) -> *mut DsBackend {
    Box::into_raw(Box::new(DsBackend { inner: backend }))
}

/// `user_data` is only handed back to the caller's callback.
#[derive(Clone, Copy)]
struct UserData(*mut c_void);

// SAFETY: the pointer is never dereferenced here; the C caller owns its
// thread-safety.
unsafe impl Send for UserData {}
unsafe impl Sync for UserData {}

impl UserData {
    fn get(self) -> *mut c_void {
        self.0
    }
}

/// Create a CPU backend with `worker_count` threads (0 is treated as 1).
///
/// # Safety
/// - Caller must call `ds_backend_release()` to free the backend
#[no_mangle]
pub unsafe extern "C" fn ds_make_cpu_backend(worker_count: usize) -> *mut DsBackend {
    into_handle(Arc::new(CpuBackend::new(worker_count)))
}

/// Create an io_uring backend.
///
/// A NULL `config` selects the default ring size. If the ring cannot be
/// set up the backend is still returned and fails every request.
///
/// # Safety
/// - `config` must be NULL or valid
/// - Caller must call `ds_backend_release()` to free the backend
#[cfg(target_os = "linux")]
#[no_mangle]
pub unsafe extern "C" fn ds_make_io_uring_backend(
    config: *const DsIoUringBackendConfig,
) -> *mut DsBackend {
    use dstorage::{RingBackend, RingBackendConfig};

    let config = if config.is_null() {
        RingBackendConfig::default()
    } else {
        RingBackendConfig {
            entries: (*config).entries,
        }
    };
    into_handle(Arc::new(RingBackend::new(config)))
}

/// Create a GPU-staging backend over the default transfer device.
///
/// Without a usable device, requests fail with `EINVAL`.
///
/// # Safety
/// - Caller must call `ds_backend_release()` to free the backend
#[no_mangle]
pub unsafe extern "C" fn ds_make_gpu_backend(worker_count: usize) -> *mut DsBackend {
    into_handle(Arc::new(GpuStagingBackend::new(GpuBackendConfig {
        worker_count,
        ..GpuBackendConfig::default()
    })))
}

/// Caller-owned Vulkan objects for [`ds_make_vulkan_backend`].
///
/// Dispatchable handles (`instance`, `physical_device`, `device`, `queue`)
/// are passed as the pointers Vulkan hands out. `command_pool` is a
/// non-dispatchable handle; 0 asks the backend to create its own.
#[cfg(feature = "vulkan")]
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct DsVulkanBackendConfig {
    pub instance: *mut c_void,
    pub physical_device: *mut c_void,
    pub device: *mut c_void,
    pub queue: *mut c_void,
    pub queue_family_index: u32,
    pub command_pool: u64,
    pub worker_count: usize,
}

/// Create a GPU-staging backend on caller-owned Vulkan objects.
///
/// The instance, device and queue are never destroyed by the backend.
/// Returns NULL if `config` or any of its dispatchable handles is NULL,
/// or if the Vulkan loader cannot be opened.
///
/// # Safety
/// - `config` must be NULL or valid
/// - The handles must come from the system Vulkan loader and outlive the
///   backend and every queue created from it
/// - `queue` must belong to `queue_family_index`, and the caller must not
///   submit to it while the backend is live
/// - Caller must call `ds_backend_release()` to free the backend
#[cfg(feature = "vulkan")]
#[no_mangle]
pub unsafe extern "C" fn ds_make_vulkan_backend(
    config: *const DsVulkanBackendConfig,
) -> *mut DsBackend {
    use ash::vk::{self, Handle};
    use dstorage::gpu::{BorrowedVulkan, VulkanDevice};

    if config.is_null() {
        return std::ptr::null_mut();
    }
    let config = *config;
    if config.instance.is_null()
        || config.physical_device.is_null()
        || config.device.is_null()
        || config.queue.is_null()
    {
        tracing::error!("ds_make_vulkan_backend: NULL Vulkan handle in config");
        return std::ptr::null_mut();
    }

    let entry = match ash::Entry::load() {
        Ok(entry) => entry,
        Err(e) => {
            tracing::error!(error = %e, "ds_make_vulkan_backend: Vulkan loader unavailable");
            return std::ptr::null_mut();
        }
    };
    let instance = ash::Instance::load(
        entry.static_fn(),
        vk::Instance::from_raw(config.instance as u64),
    );
    let device = ash::Device::load(
        instance.fp_v1_0(),
        vk::Device::from_raw(config.device as u64),
    );
    let borrowed = BorrowedVulkan {
        instance,
        physical_device: vk::PhysicalDevice::from_raw(config.physical_device as u64),
        device,
        queue: vk::Queue::from_raw(config.queue as u64),
        queue_family_index: config.queue_family_index,
        command_pool: (config.command_pool != 0)
            .then(|| vk::CommandPool::from_raw(config.command_pool)),
    };

    match VulkanDevice::from_borrowed(borrowed) {
        Ok(device) => into_handle(Arc::new(GpuStagingBackend::new(GpuBackendConfig {
            device: Some(Arc::new(device.with_loader(entry))),
            worker_count: config.worker_count,
            ..GpuBackendConfig::default()
        }))),
        Err(e) => {
            tracing::error!(error = %e, "ds_make_vulkan_backend: device setup failed");
            std::ptr::null_mut()
        }
    }
}

/// Release a backend handle.
///
/// Queues created from it keep the backend alive until they are released.
///
/// # Safety
/// - `backend` must be NULL or a handle from a `ds_make_*` function
/// - After this call, `backend` is invalid and must not be used
#[no_mangle]
pub unsafe extern "C" fn ds_backend_release(backend: *mut DsBackend) {
    if backend.is_null() {
        return;
    }
    drop(Box::from_raw(backend));
}

/// Create a queue that submits to `backend`.
///
/// # Safety
/// - `backend` must be NULL or a valid backend handle
/// - Caller must call `ds_queue_release()` to free the queue
#[no_mangle]
pub unsafe extern "C" fn ds_queue_create(backend: *mut DsBackend) -> *mut DsQueue {
    if backend.is_null() {
        return std::ptr::null_mut();
    }
    let backend = Arc::clone(&(*backend).inner);
    Box::into_raw(Box::new(DsQueue {
        inner: Queue::new(backend),
    }))
}

/// Release a queue handle.
///
/// Does not wait for in-flight requests; call `ds_queue_wait_all()` first.
///
/// # Safety
/// - `queue` must be NULL or a handle from `ds_queue_create()`
/// - After this call, `queue` is invalid and must not be used
#[no_mangle]
pub unsafe extern "C" fn ds_queue_release(queue: *mut DsQueue) {
    if queue.is_null() {
        return;
    }
    drop(Box::from_raw(queue));
}

/// Buffer `request` until the next `ds_queue_submit_all()`.
///
/// # Returns
/// - 0 on success
/// - `EINVAL` if `queue` or `request` is NULL or `request` carries an
///   out-of-range enumeration value; the request is then marked failed
///   and is not enqueued
///
/// # Safety
/// - `queue` and `request` must be NULL or valid
/// - `request` and its buffers must outlive its completion
#[no_mangle]
pub unsafe extern "C" fn ds_queue_enqueue(queue: *mut DsQueue, request: *mut DsRequest) -> c_int {
    if queue.is_null() || request.is_null() {
        return libc::EINVAL;
    }
    let raw = &mut *request;
    match to_request(raw) {
        Ok(req) => {
            raw.status = DS_REQUEST_PENDING;
            raw.errno_value = 0;
            raw.bytes_transferred = 0;
            (*queue).inner.enqueue(req);
            0
        }
        Err(e) => {
            tracing::warn!(error = %e, "rejected request at the C boundary");
            raw.status = DS_REQUEST_IO_ERROR;
            raw.errno_value = e.errno();
            raw.bytes_transferred = 0;
            e.errno()
        }
    }
}

/// Submit every buffered request.
///
/// For each completion the `DsRequest` is updated in place, then `callback`
/// (if not NULL) is invoked with it and `user_data` on a backend thread.
///
/// # Returns
/// - Number of requests submitted
///
/// # Safety
/// - `queue` must be NULL or valid
/// - `callback` must be safe to call from any thread
#[no_mangle]
pub unsafe extern "C" fn ds_queue_submit_all(
    queue: *mut DsQueue,
    callback: DsCompletionCallback,
    user_data: *mut c_void,
) -> usize {
    if queue.is_null() {
        return 0;
    }
    let user_data = UserData(user_data);
    (*queue).inner.submit_all_with(move |done| {
        let raw = done.tag as *mut DsRequest;
        // SAFETY: the tag is the address of the caller's DsRequest, which
        // must stay valid until this completion.
        unsafe {
            apply_completion(&mut *raw, done);
            if let Some(callback) = callback {
                callback(raw, user_data.get());
            }
        }
    })
}

/// Block until every submitted request has completed.
///
/// # Safety
/// - `queue` must be NULL or valid
#[no_mangle]
pub unsafe extern "C" fn ds_queue_wait_all(queue: *mut DsQueue) {
    if queue.is_null() {
        return;
    }
    let queue = &(*queue).inner;
    queue.wait_all();
    // Results were already written back through the tags.
    drop(queue.take_completed());
}

/// Number of submitted requests that have not completed.
///
/// # Safety
/// - `queue` must be NULL or valid
#[no_mangle]
pub unsafe extern "C" fn ds_queue_in_flight(queue: *const DsQueue) -> usize {
    if queue.is_null() {
        return 0;
    }
    (*queue).inner.in_flight()
}

/// Requests completed since the queue was created.
///
/// # Safety
/// - `queue` must be NULL or valid
#[no_mangle]
pub unsafe extern "C" fn ds_queue_total_completed(queue: *const DsQueue) -> u64 {
    if queue.is_null() {
        return 0;
    }
    (*queue).inner.stats().completed
}

/// Requests that completed with `DS_REQUEST_IO_ERROR`.
///
/// # Safety
/// - `queue` must be NULL or valid
#[no_mangle]
pub unsafe extern "C" fn ds_queue_total_failed(queue: *const DsQueue) -> u64 {
    if queue.is_null() {
        return 0;
    }
    (*queue).inner.stats().failed
}

/// Bytes moved by successful requests.
///
/// # Safety
/// - `queue` must be NULL or valid
#[no_mangle]
pub unsafe extern "C" fn ds_queue_total_bytes_transferred(queue: *const DsQueue) -> u64 {
    if queue.is_null() {
        return 0;
    }
    (*queue).inner.stats().bytes_transferred
}
