//! Transfer-device abstraction used by the staging backend.

use std::ptr::NonNull;
use std::time::Duration;

use crate::request::GpuBuffer;

/// Errors raised by a [`TransferDevice`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    #[error("staging allocation of {size} bytes failed: {reason}")]
    Allocation { size: usize, reason: String },

    #[error("failed to map staging memory: {0}")]
    Map(String),

    #[error("buffer copy failed: {0}")]
    Copy(String),

    #[error("fence not signalled within {0:?}")]
    FenceTimeout(Duration),

    #[error("unknown device buffer {0:#x}")]
    UnknownBuffer(u64),

    #[error("range {offset}+{len} exceeds buffer of {capacity} bytes")]
    OutOfRange {
        offset: u64,
        len: usize,
        capacity: usize,
    },

    #[error("device failure: {0}")]
    Device(String),
}

impl DeviceError {
    /// Errno recorded on the failed request.
    pub fn errno(&self) -> i32 {
        match self {
            Self::Allocation { .. } => libc::ENOMEM,
            Self::UnknownBuffer(_) | Self::OutOfRange { .. } => libc::EINVAL,
            Self::Map(_) | Self::Copy(_) | Self::FenceTimeout(_) | Self::Device(_) => libc::EIO,
        }
    }

    /// Step name used as the report operation.
    pub fn operation(&self) -> &'static str {
        match self {
            Self::Allocation { .. } => "create_staging_buffer",
            Self::Map(_) => "map_staging",
            Self::Copy(_) | Self::UnknownBuffer(_) | Self::OutOfRange { .. } => "copy_buffer",
            Self::FenceTimeout(_) => "fence_wait",
            Self::Device(_) => "device",
        }
    }
}

/// A host-visible, host-coherent staging buffer owned by a device.
#[derive(Debug, PartialEq, Eq)]
pub struct StagingAllocation {
    id: u64,
    size: usize,
}

impl StagingAllocation {
    /// Wraps a device-specific identifier. Only device implementations
    /// create allocations.
    pub fn new(id: u64, size: usize) -> Self {
        Self { id, size }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

/// Direction of a staging copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyDirection {
    StagingToDevice,
    DeviceToStaging,
}

/// One fenced copy between a staging buffer and a device buffer.
///
/// The staging side always starts at offset 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferCopy {
    pub direction: CopyDirection,
    pub staging: u64,
    pub device_buffer: GpuBuffer,
    pub device_offset: u64,
    pub size: usize,
}

/// Device operations needed to move bytes between files and device buffers.
///
/// # Safety
///
/// Implementors must guarantee that the pointer returned by
/// [`map_staging`](Self::map_staging) addresses `staging.size()` writable
/// bytes that stay valid and are not touched by the device until the
/// matching [`unmap_staging`](Self::unmap_staging).
#[allow(unsafe_code)]
pub unsafe trait TransferDevice: Send + Sync {
    /// Device name for diagnostics.
    fn name(&self) -> &'static str;

    fn allocate_staging(&self, size: usize) -> Result<StagingAllocation, DeviceError>;

    fn map_staging(&self, staging: &StagingAllocation) -> Result<NonNull<u8>, DeviceError>;

    fn unmap_staging(&self, staging: &StagingAllocation);

    /// Records, submits and fences one copy, blocking the calling thread for
    /// at most `fence_timeout`.
    ///
    /// On [`DeviceError::FenceTimeout`] the copy may still be running; the
    /// caller must call [`wait_idle`](Self::wait_idle) before releasing the
    /// staging buffer.
    fn copy_buffer(&self, copy: &BufferCopy, fence_timeout: Duration) -> Result<(), DeviceError>;

    fn release_staging(&self, staging: &StagingAllocation);

    /// Blocks until the device has finished all submitted work.
    fn wait_idle(&self) -> Result<(), DeviceError>;
}
