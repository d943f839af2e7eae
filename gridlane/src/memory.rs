//! Device allocations and per plan kernel stack frames.

use std::{
    collections::HashMap,
    sync::Arc,
    thread::{self, ThreadId},
};

use parking_lot::Mutex;

use crate::{
    backend::Driver,
    error::{BackendError, ErrorStatus, RuntimeError},
    ExecutionPlanId,
};

/// Allocation in device memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceBuffer {
    pub address: u64,
    pub bytes: usize,
}

/// Hands out device memory and keeps count of what is left
#[derive(Debug)]
pub struct BufferProvider {
    driver: Arc<Driver>,
    total_bytes: u64,
    // Bytes currently allocated
    used: Mutex<u64>,
}

impl BufferProvider {
    pub fn new(driver: Arc<Driver>, total_bytes: u64) -> BufferProvider {
        BufferProvider { driver, total_bytes, used: Mutex::new(0) }
    }

    pub fn allocate(&self, bytes: usize) -> Result<DeviceBuffer, BackendError> {
        let mut used = self.used.lock();
        let free = self.total_bytes - *used;
        if bytes as u64 > free {
            return Err(BackendError {
                status: ErrorStatus::MemoryAllocation,
                context: format!("Allocation of {bytes} B exceeds free memory of {free} B.").into(),
            });
        }
        let address = self.driver.allocate(bytes)?;
        *used += bytes as u64;
        Ok(DeviceBuffer { address, bytes })
    }

    pub fn deallocate(&self, buffer: DeviceBuffer) -> Result<(), BackendError> {
        self.driver.deallocate(buffer.address)?;
        let mut used = self.used.lock();
        *used = used.saturating_sub(buffer.bytes as u64);
        Ok(())
    }

    pub fn free_bytes(&self) -> u64 {
        self.total_bytes - *self.used.lock()
    }

    /// Address of element `offset` of size `element_size` inside the region starting at `dest`
    pub const fn map_on_device_memory_region(dest: u64, offset: u64, element_size: u64) -> u64 {
        dest + offset * element_size
    }
}

/// Kernel stack frames of execution plans on one device.
///
/// Frames are keyed like streams, by plan and calling thread, so a frame is only
/// ever written and read by the operations of a single stream.
#[derive(Debug)]
pub struct MemoryManager {
    provider: Arc<BufferProvider>,
    frames: Mutex<HashMap<(ExecutionPlanId, ThreadId), DeviceBuffer>>,
}

impl MemoryManager {
    pub fn new(provider: Arc<BufferProvider>) -> MemoryManager {
        MemoryManager { provider, frames: Mutex::new(HashMap::new()) }
    }

    /// Device address of the calling thread's kernel stack frame for `plan`, at least `bytes` long.
    ///
    /// The frame is reused between launches. When it is too small, `drain` is called
    /// before the old frame is freed, it must wait for every queued operation that
    /// still uses the frame.
    pub fn kernel_stack_frame(
        &self,
        plan: ExecutionPlanId,
        bytes: usize,
        drain: impl FnOnce() -> Result<(), RuntimeError>,
    ) -> Result<u64, RuntimeError> {
        let key = (plan, thread::current().id());
        let current = self.frames.lock().get(&key).copied();
        if let Some(frame) = current {
            if frame.bytes >= bytes {
                return Ok(frame.address);
            }
            drain()?;
            // A concurrent release may already have freed it
            let old = self.frames.lock().remove(&key);
            if let Some(old) = old {
                self.provider.deallocate(old)?;
            }
        }
        let frame = self.provider.allocate(bytes)?;
        self.frames.lock().insert(key, frame);
        Ok(frame.address)
    }

    /// Frees the frames of every thread of `plan`.
    ///
    /// Operations using them must have completed. All frames are freed even if some
    /// fail, the first error is returned.
    pub fn release_kernel_stack_frames(&self, plan: ExecutionPlanId) -> Result<(), BackendError> {
        let released: Vec<DeviceBuffer> = {
            let mut frames = self.frames.lock();
            let keys: Vec<_> = frames.keys().filter(|(p, _)| *p == plan).copied().collect();
            keys.iter().filter_map(|key| frames.remove(key)).collect()
        };
        let mut result = Ok(());
        for frame in released {
            if let Err(err) = self.provider.deallocate(frame) {
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }

    /// Number of live frames over all plans and threads
    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DummyDriver;

    fn provider(total: u64) -> Arc<BufferProvider> {
        Arc::new(BufferProvider::new(Arc::new(Driver::Dummy(DummyDriver::new(256))), total))
    }

    #[test]
    fn allocation_tracks_free_bytes() {
        let provider = provider(1000);
        let a = provider.allocate(600).unwrap();
        assert_eq!(provider.free_bytes(), 400);
        let err = provider.allocate(401).unwrap_err();
        assert_eq!(err.status, ErrorStatus::MemoryAllocation);
        provider.deallocate(a).unwrap();
        assert_eq!(provider.free_bytes(), 1000);
        assert_eq!(BufferProvider::map_on_device_memory_region(0x100, 3, 8), 0x118);
    }

    fn no_drain() -> Result<(), RuntimeError> {
        panic!("frame should not be reallocated");
    }

    #[test]
    fn stack_frame_grows_and_is_released() {
        let provider = provider(1 << 20);
        let manager = MemoryManager::new(provider.clone());
        let first = manager.kernel_stack_frame(ExecutionPlanId(1), 64, no_drain).unwrap();
        assert_eq!(manager.kernel_stack_frame(ExecutionPlanId(1), 32, no_drain).unwrap(), first);
        let other = manager.kernel_stack_frame(ExecutionPlanId(2), 64, no_drain).unwrap();
        assert_ne!(other, first);
        let mut drained = false;
        let grown = manager
            .kernel_stack_frame(ExecutionPlanId(1), 4096, || {
                drained = true;
                Ok(())
            })
            .unwrap();
        assert!(drained);
        assert_ne!(grown, first);
        assert_eq!(provider.free_bytes(), (1 << 20) - 4096 - 64);
        manager.release_kernel_stack_frames(ExecutionPlanId(1)).unwrap();
        manager.release_kernel_stack_frames(ExecutionPlanId(1)).unwrap();
        assert_eq!(manager.len(), 1);
        assert_eq!(provider.free_bytes(), (1 << 20) - 64);
    }

    #[test]
    fn failed_drain_keeps_the_old_frame() {
        let provider = provider(1 << 20);
        let manager = MemoryManager::new(provider.clone());
        let first = manager.kernel_stack_frame(ExecutionPlanId(1), 16, no_drain).unwrap();
        let err = manager
            .kernel_stack_frame(ExecutionPlanId(1), 64, || Err(RuntimeError::resource_exhaustion("busy")))
            .unwrap_err();
        assert!(!err.is_recoverable());
        assert_eq!(manager.kernel_stack_frame(ExecutionPlanId(1), 16, no_drain).unwrap(), first);
        assert_eq!(provider.free_bytes(), (1 << 20) - 16);
    }

    #[test]
    fn threads_get_their_own_frames() {
        let provider = provider(1 << 20);
        let manager = MemoryManager::new(provider);
        let plan = ExecutionPlanId(1);
        let main = manager.kernel_stack_frame(plan, 16, no_drain).unwrap();
        let worker =
            std::thread::scope(|s| s.spawn(|| manager.kernel_stack_frame(plan, 16, no_drain).unwrap()).join().unwrap());
        assert_ne!(main, worker);
        assert_eq!(manager.len(), 2);
        manager.release_kernel_stack_frames(plan).unwrap();
        assert!(manager.is_empty());
    }
}
