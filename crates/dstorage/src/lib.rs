//! # dstorage: asynchronous storage I/O runtime
//!
//! Callers describe positional reads and writes as [`Request`]s, buffer them
//! in a [`Queue`], and submit them in batches to a [`Backend`]. Backends run
//! the I/O off the calling thread and hand each request back, with a
//! terminal status, exactly once.
//!
//! - **[`CpuBackend`]**: fixed worker pool doing blocking `pread`/`pwrite`
//! - **[`RingBackend`]** (Linux): one thread batching requests through an
//!   io_uring
//! - **[`GpuStagingBackend`]**: worker pool moving bytes between files and
//!   device buffers through host-visible staging memory
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                    Queue                     │
//! │  enqueue → submit_all → wait_all / take_...  │
//! └──────────────────────┬───────────────────────┘
//!                        │ Arc<dyn Backend>
//!      ┌─────────────────┼──────────────────┐
//! ┌────┴─────┐    ┌──────┴──────┐    ┌──────┴───────┐
//! │   Cpu    │    │    Ring     │    │  GpuStaging  │
//! │ (pool)   │    │ (io_uring)  │    │ (pool+fence) │
//! └──────────┘    └─────────────┘    └──────┬───────┘
//!                                    dyn TransferDevice
//! ```
//!
//! Failures are encoded into the request (`status`, `errno_value`) and also
//! reported through the process-wide [error channel](report).
//!
//! # Features
//!
//! - `vulkan`: build [`gpu::VulkanDevice`] on `ash`

mod backend;
mod cpu;
pub mod gpu;
mod pool;
mod queue;
pub mod report;
mod request;
#[cfg(target_os = "linux")]
mod ring;
pub mod runtime;

pub use backend::{Backend, CompletionCallback};
pub use cpu::CpuBackend;
pub use gpu::{GpuBackendConfig, GpuStagingBackend};
pub use queue::{CompletionHook, Queue, QueueStats};
pub use report::{
    ErrorCallback, ErrorContext, Location, clear_error_callback, set_error_callback,
};
pub use request::{
    Compression, GpuBuffer, HostPtr, MemoryKind, Request, RequestOp, RequestSnapshot,
    RequestStatus,
};
#[cfg(target_os = "linux")]
pub use ring::{RingBackend, RingBackendConfig, RingSetupError};

pub use dstorage_config as config;

#[cfg(test)]
mod test_support;
