//! Builds backends and queues from [`DstorageConfig`].

use std::sync::Arc;

use dstorage_config::{BackendKind, DstorageConfig};

use crate::backend::Backend;
use crate::cpu::CpuBackend;
use crate::gpu::{GpuBackendConfig, GpuStagingBackend};
use crate::queue::Queue;

/// Constructs the backend selected by `config.backend.kind`.
///
/// `io-uring` falls back to the CPU backend on platforms without io_uring.
/// The GPU backend is built without an explicit device, so it uses Vulkan
/// when that feature is enabled and a device is available.
pub fn backend_from_config(config: &DstorageConfig) -> Arc<dyn Backend> {
    match config.backend.kind {
        BackendKind::Cpu => Arc::new(CpuBackend::new(config.cpu.worker_count)),
        BackendKind::IoUring => ring_backend(config),
        BackendKind::Gpu => Arc::new(GpuStagingBackend::new(GpuBackendConfig {
            device: None,
            worker_count: config.gpu.worker_count,
            fence_timeout: config.gpu.fence_timeout(),
        })),
    }
}

/// A [`Queue`] over a fresh backend built from `config`.
pub fn queue_from_config(config: &DstorageConfig) -> Queue {
    Queue::new(backend_from_config(config))
}

#[cfg(target_os = "linux")]
fn ring_backend(config: &DstorageConfig) -> Arc<dyn Backend> {
    use crate::ring::{RingBackend, RingBackendConfig};

    Arc::new(RingBackend::new(RingBackendConfig {
        entries: config.ring.entries,
    }))
}

#[cfg(not(target_os = "linux"))]
fn ring_backend(config: &DstorageConfig) -> Arc<dyn Backend> {
    tracing::warn!("io_uring is only available on Linux, using the CPU backend");
    Arc::new(CpuBackend::new(config.cpu.worker_count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use dstorage_config::BackendConfig;

    #[test]
    fn builds_cpu_backend() {
        assert_eq!(backend_from_config(&DstorageConfig::cpu(2)).name(), "cpu");
    }

    #[test]
    fn builds_ring_backend() {
        let expected = if cfg!(target_os = "linux") { "io_uring" } else { "cpu" };
        assert_eq!(backend_from_config(&DstorageConfig::io_uring(8)).name(), expected);
    }

    #[test]
    fn builds_gpu_backend() {
        let config = DstorageConfig {
            backend: BackendConfig {
                kind: BackendKind::Gpu,
            },
            ..DstorageConfig::default()
        };
        assert_eq!(backend_from_config(&config).name(), "gpu");
    }

    #[test]
    fn queue_from_config_uses_backend() {
        let queue = queue_from_config(&DstorageConfig::cpu(1));
        assert_eq!(queue.backend().name(), "cpu");
        assert_eq!(queue.in_flight(), 0);
    }
}
