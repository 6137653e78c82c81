//! Transfer device emulated in host memory.
//!
//! Device buffers and staging buffers are plain heap allocations. Copies
//! complete synchronously. Faults can be queued to make the next matching
//! step fail, which is how the staging backend's failure paths are tested
//! without a GPU.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::Mutex;
use std::time::Duration;

use super::device::{BufferCopy, CopyDirection, DeviceError, StagingAllocation, TransferDevice};
use crate::request::GpuBuffer;

/// A step that can be made to fail once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    Allocation,
    Map,
    Copy,
    FenceTimeout,
}

#[derive(Default)]
struct State {
    next_id: u64,
    buffers: HashMap<u64, Vec<u8>>,
    // Boxed so mapped pointers survive map growth.
    staging: HashMap<u64, Box<[u8]>>,
    faults: Vec<Fault>,
    staging_allocations: usize,
    wait_idle_calls: usize,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn take_fault(&mut self, fault: Fault) -> bool {
        match self.faults.iter().position(|f| *f == fault) {
            Some(index) => {
                self.faults.remove(index);
                true
            }
            None => false,
        }
    }
}

/// RAM-backed [`TransferDevice`].
#[derive(Default)]
pub struct EmulatedDevice {
    state: Mutex<State>,
}

impl EmulatedDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a zero-filled device buffer of `size` bytes.
    pub fn create_buffer(&self, size: usize) -> GpuBuffer {
        let mut state = self.lock();
        let id = state.next_id();
        state.buffers.insert(id, vec![0; size]);
        GpuBuffer::new(id).expect("emulated ids start at 1")
    }

    pub fn destroy_buffer(&self, buffer: GpuBuffer) {
        self.lock().buffers.remove(&buffer.as_raw());
    }

    /// Uploads `data` into `buffer` at `offset`, bypassing staging.
    pub fn write_buffer(
        &self,
        buffer: GpuBuffer,
        offset: u64,
        data: &[u8],
    ) -> Result<(), DeviceError> {
        let mut state = self.lock();
        let target = state
            .buffers
            .get_mut(&buffer.as_raw())
            .ok_or(DeviceError::UnknownBuffer(buffer.as_raw()))?;
        let range = checked_range(offset, data.len(), target.len())?;
        target[range].copy_from_slice(data);
        Ok(())
    }

    /// Reads `len` bytes of `buffer` starting at `offset`.
    pub fn read_buffer(
        &self,
        buffer: GpuBuffer,
        offset: u64,
        len: usize,
    ) -> Result<Vec<u8>, DeviceError> {
        let state = self.lock();
        let source = state
            .buffers
            .get(&buffer.as_raw())
            .ok_or(DeviceError::UnknownBuffer(buffer.as_raw()))?;
        let range = checked_range(offset, len, source.len())?;
        Ok(source[range].to_vec())
    }

    /// Makes the next occurrence of `fault` fail. Faults queue up.
    pub fn fail_next(&self, fault: Fault) {
        self.lock().faults.push(fault);
    }

    /// Staging buffers allocated and not yet released.
    pub fn live_staging(&self) -> usize {
        self.lock().staging.len()
    }

    /// Staging buffers allocated over the device's lifetime.
    pub fn staging_allocations(&self) -> usize {
        self.lock().staging_allocations
    }

    pub fn wait_idle_calls(&self) -> usize {
        self.lock().wait_idle_calls
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("emulated device lock poisoned")
    }
}

impl std::fmt::Debug for EmulatedDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("EmulatedDevice")
            .field("buffers", &state.buffers.len())
            .field("live_staging", &state.staging.len())
            .finish_non_exhaustive()
    }
}

fn checked_range(
    offset: u64,
    len: usize,
    capacity: usize,
) -> Result<std::ops::Range<usize>, DeviceError> {
    let out_of_range = DeviceError::OutOfRange {
        offset,
        len,
        capacity,
    };
    let start = usize::try_from(offset).map_err(|_| out_of_range.clone())?;
    match start.checked_add(len) {
        Some(end) if end <= capacity => Ok(start..end),
        _ => Err(out_of_range),
    }
}

// SAFETY: staging memory is a boxed slice of exactly `size` bytes that is
// only freed by `release_staging`, and copies never run concurrently with a
// mapping because the backend unmaps before copying.
#[allow(unsafe_code)]
unsafe impl TransferDevice for EmulatedDevice {
    fn name(&self) -> &'static str {
        "emulated"
    }

    fn allocate_staging(&self, size: usize) -> Result<StagingAllocation, DeviceError> {
        let mut state = self.lock();
        if state.take_fault(Fault::Allocation) {
            return Err(DeviceError::Allocation {
                size,
                reason: "injected allocation failure".to_owned(),
            });
        }
        let id = state.next_id();
        state.staging.insert(id, vec![0; size].into_boxed_slice());
        state.staging_allocations += 1;
        Ok(StagingAllocation::new(id, size))
    }

    fn map_staging(&self, staging: &StagingAllocation) -> Result<NonNull<u8>, DeviceError> {
        let mut state = self.lock();
        if state.take_fault(Fault::Map) {
            return Err(DeviceError::Map("injected map failure".to_owned()));
        }
        let memory = state
            .staging
            .get_mut(&staging.id())
            .ok_or_else(|| DeviceError::Map(format!("unknown staging buffer {}", staging.id())))?;
        NonNull::new(memory.as_mut_ptr())
            .ok_or_else(|| DeviceError::Map("null staging memory".to_owned()))
    }

    fn unmap_staging(&self, _staging: &StagingAllocation) {}

    fn copy_buffer(&self, copy: &BufferCopy, fence_timeout: Duration) -> Result<(), DeviceError> {
        let mut state = self.lock();
        if state.take_fault(Fault::Copy) {
            return Err(DeviceError::Copy("injected copy failure".to_owned()));
        }
        if state.take_fault(Fault::FenceTimeout) {
            return Err(DeviceError::FenceTimeout(fence_timeout));
        }

        let State {
            buffers, staging, ..
        } = &mut *state;
        let staged = staging
            .get_mut(&copy.staging)
            .ok_or_else(|| DeviceError::Copy(format!("unknown staging buffer {}", copy.staging)))?;
        let device = buffers
            .get_mut(&copy.device_buffer.as_raw())
            .ok_or(DeviceError::UnknownBuffer(copy.device_buffer.as_raw()))?;

        let staged_range = checked_range(0, copy.size, staged.len())?;
        let device_range = checked_range(copy.device_offset, copy.size, device.len())?;
        match copy.direction {
            CopyDirection::StagingToDevice => {
                device[device_range].copy_from_slice(&staged[staged_range]);
            }
            CopyDirection::DeviceToStaging => {
                staged[staged_range].copy_from_slice(&device[device_range]);
            }
        }
        Ok(())
    }

    fn release_staging(&self, staging: &StagingAllocation) {
        self.lock().staging.remove(&staging.id());
    }

    fn wait_idle(&self) -> Result<(), DeviceError> {
        self.lock().wait_idle_calls += 1;
        Ok(())
    }
}
