//! Backend agnostic access to native drivers.
//!
//! `Driver` is an enum that dispatches calls to the appropriate backend.
//! Native objects (streams, events, modules, functions) cross this boundary
//! as opaque `NativeHandle`s, device memory as plain `u64` addresses.

// Because I don't want to write a trait object for every native call

use std::sync::Arc;

use crate::{
    config::RuntimeConfig,
    device::Device,
    error::{BackendError, ErrorStatus},
};

pub use cuda::{CUDAConfig, CUDADriver};
pub use dummy::{DummyConfig, DummyDriver, DummyLaunch};
pub use nvml::NvmlPowerMetric;

mod cuda;
mod dummy;
mod nvml;

/// Opaque native object, a pointer for the CUDA driver, an id for the dummy backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NativeHandle(pub(crate) usize);

impl NativeHandle {
    pub const NULL: NativeHandle = NativeHandle(0);

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    pub(crate) fn from_ptr<T>(ptr: *mut T) -> NativeHandle {
        NativeHandle(ptr as usize)
    }

    pub(crate) fn as_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }
}

/// Native events recorded before and after one enqueued operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventPair {
    pub before: NativeHandle,
    pub after: NativeHandle,
}

impl EventPair {
    pub const fn is_valid(&self) -> bool {
        !self.before.is_null() && !self.after.is_null()
    }
}

/// JIT options accepted by module loading, values match the CUDA driver API
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum JitOption {
    CU_JIT_MAX_REGISTERS = 0,
    CU_JIT_THREADS_PER_BLOCK = 1,
    CU_JIT_OPTIMIZATION_LEVEL = 7,
    CU_JIT_TARGET_FROM_CUCONTEXT = 8,
    CU_JIT_TARGET = 9,
    CU_JIT_FALLBACK_STRATEGY = 10,
    CU_JIT_GENERATE_DEBUG_INFO = 11,
    CU_JIT_LOG_VERBOSE = 12,
    CU_JIT_GENERATE_LINE_INFO = 13,
    CU_JIT_CACHE_MODE = 14,
    CU_JIT_FAST_COMPILE = 16,
}

impl JitOption {
    pub const ALL: [JitOption; 11] = [
        JitOption::CU_JIT_MAX_REGISTERS,
        JitOption::CU_JIT_THREADS_PER_BLOCK,
        JitOption::CU_JIT_OPTIMIZATION_LEVEL,
        JitOption::CU_JIT_TARGET_FROM_CUCONTEXT,
        JitOption::CU_JIT_TARGET,
        JitOption::CU_JIT_FALLBACK_STRATEGY,
        JitOption::CU_JIT_GENERATE_DEBUG_INFO,
        JitOption::CU_JIT_LOG_VERBOSE,
        JitOption::CU_JIT_GENERATE_LINE_INFO,
        JitOption::CU_JIT_CACHE_MODE,
        JitOption::CU_JIT_FAST_COMPILE,
    ];

    pub fn from_name(name: &str) -> Option<JitOption> {
        Self::ALL.into_iter().find(|option| option.name() == name)
    }

    pub const fn name(self) -> &'static str {
        match self {
            JitOption::CU_JIT_MAX_REGISTERS => "CU_JIT_MAX_REGISTERS",
            JitOption::CU_JIT_THREADS_PER_BLOCK => "CU_JIT_THREADS_PER_BLOCK",
            JitOption::CU_JIT_OPTIMIZATION_LEVEL => "CU_JIT_OPTIMIZATION_LEVEL",
            JitOption::CU_JIT_TARGET_FROM_CUCONTEXT => "CU_JIT_TARGET_FROM_CUCONTEXT",
            JitOption::CU_JIT_TARGET => "CU_JIT_TARGET",
            JitOption::CU_JIT_FALLBACK_STRATEGY => "CU_JIT_FALLBACK_STRATEGY",
            JitOption::CU_JIT_GENERATE_DEBUG_INFO => "CU_JIT_GENERATE_DEBUG_INFO",
            JitOption::CU_JIT_LOG_VERBOSE => "CU_JIT_LOG_VERBOSE",
            JitOption::CU_JIT_GENERATE_LINE_INFO => "CU_JIT_GENERATE_LINE_INFO",
            JitOption::CU_JIT_CACHE_MODE => "CU_JIT_CACHE_MODE",
            JitOption::CU_JIT_FAST_COMPILE => "CU_JIT_FAST_COMPILE",
        }
    }
}

/// Native driver of one device
#[derive(Debug)]
#[allow(clippy::upper_case_acronyms)]
pub enum Driver {
    CUDA(CUDADriver),
    Dummy(DummyDriver),
}

/// Enumerates devices of every enabled backend.
///
/// Backends that fail to initialize are skipped, the error is printed when `debug_dev` is set.
pub fn initialize_backends(config: &RuntimeConfig) -> Result<Vec<(Device, Arc<Driver>)>, BackendError> {
    let debug_dev = config.debug_dev();
    let mut devices = Vec::new();
    let dummy_config = config.dummy.clone().unwrap_or_default();
    match dummy::initialize_device(&dummy_config, debug_dev) {
        Ok(found) => devices.extend(found),
        Err(err) => {
            if debug_dev {
                log::info!("{err}");
            }
        }
    }
    let cuda_config = config.cuda.clone().unwrap_or_default();
    match cuda::initialize_device(&cuda_config, debug_dev) {
        Ok(found) => devices.extend(found),
        Err(err) => {
            if debug_dev {
                log::info!("{err}");
            }
        }
    }
    if devices.is_empty() {
        return Err(BackendError {
            status: ErrorStatus::Initialization,
            context: "All backends failed to initialize or were configured out.".into(),
        });
    }
    Ok(devices)
}

impl Driver {
    pub fn name(&self) -> &'static str {
        match self {
            Driver::CUDA(_) => "CUDA",
            Driver::Dummy(_) => "Dummy",
        }
    }

    /// Returns the dummy backend, used by tests to inspect what was executed
    pub fn as_dummy(&self) -> Option<&DummyDriver> {
        match self {
            Driver::Dummy(dummy) => Some(dummy),
            Driver::CUDA(_) => None,
        }
    }

    pub(crate) fn create_stream(&self) -> Result<NativeHandle, BackendError> {
        match self {
            Driver::CUDA(cuda) => cuda.create_stream(),
            Driver::Dummy(dummy) => dummy.create_stream(),
        }
    }

    pub(crate) fn destroy_stream(&self, stream: NativeHandle) -> Result<(), BackendError> {
        match self {
            Driver::CUDA(cuda) => cuda.destroy_stream(stream),
            Driver::Dummy(dummy) => dummy.destroy_stream(stream),
        }
    }

    pub(crate) fn synchronize_stream(&self, stream: NativeHandle) -> Result<(), BackendError> {
        match self {
            Driver::CUDA(cuda) => cuda.synchronize_stream(stream),
            Driver::Dummy(dummy) => dummy.synchronize_stream(stream),
        }
    }

    /// Future work on `stream` waits until `event` completes, the host does not block
    pub(crate) fn stream_wait_event(&self, stream: NativeHandle, event: NativeHandle) -> Result<(), BackendError> {
        match self {
            Driver::CUDA(cuda) => cuda.stream_wait_event(stream, event),
            Driver::Dummy(dummy) => dummy.stream_wait_event(stream, event),
        }
    }

    /// Creates a native event and records it on `stream`
    pub(crate) fn record_event(&self, stream: NativeHandle) -> Result<NativeHandle, BackendError> {
        match self {
            Driver::CUDA(cuda) => cuda.record_event(stream),
            Driver::Dummy(dummy) => dummy.record_event(stream),
        }
    }

    /// Returns true once all work recorded before the event completed
    pub(crate) fn query_event(&self, event: NativeHandle) -> Result<bool, BackendError> {
        match self {
            Driver::CUDA(cuda) => cuda.query_event(event),
            Driver::Dummy(dummy) => dummy.query_event(event),
        }
    }

    pub(crate) fn synchronize_event(&self, event: NativeHandle) -> Result<(), BackendError> {
        match self {
            Driver::CUDA(cuda) => cuda.synchronize_event(event),
            Driver::Dummy(dummy) => dummy.synchronize_event(event),
        }
    }

    /// Elapsed time between two completed events in nanoseconds
    pub(crate) fn elapsed_time(&self, before: NativeHandle, after: NativeHandle) -> Result<u64, BackendError> {
        match self {
            Driver::CUDA(cuda) => cuda.elapsed_time(before, after),
            Driver::Dummy(dummy) => dummy.elapsed_time(before, after),
        }
    }

    pub(crate) fn destroy_event(&self, event: NativeHandle) -> Result<(), BackendError> {
        match self {
            Driver::CUDA(cuda) => cuda.destroy_event(event),
            Driver::Dummy(dummy) => dummy.destroy_event(event),
        }
    }

    pub(crate) fn allocate(&self, bytes: usize) -> Result<u64, BackendError> {
        match self {
            Driver::CUDA(cuda) => cuda.allocate(bytes),
            Driver::Dummy(dummy) => dummy.allocate(bytes),
        }
    }

    pub(crate) fn deallocate(&self, address: u64) -> Result<(), BackendError> {
        match self {
            Driver::CUDA(cuda) => cuda.deallocate(address),
            Driver::Dummy(dummy) => dummy.deallocate(address),
        }
    }

    /// # Safety
    /// `src` must be valid for `bytes` reads until the copy completes on `stream`.
    pub(crate) unsafe fn copy_host_to_device(
        &self,
        dst: u64,
        src: *const u8,
        bytes: usize,
        stream: NativeHandle,
    ) -> Result<(), BackendError> {
        match self {
            Driver::CUDA(cuda) => unsafe { cuda.copy_host_to_device(dst, src, bytes, stream) },
            Driver::Dummy(dummy) => unsafe { dummy.copy_host_to_device(dst, src, bytes, stream) },
        }
    }

    /// # Safety
    /// `dst` must be valid for `bytes` writes until the copy completes on `stream`.
    pub(crate) unsafe fn copy_device_to_host(
        &self,
        dst: *mut u8,
        src: u64,
        bytes: usize,
        stream: NativeHandle,
    ) -> Result<(), BackendError> {
        match self {
            Driver::CUDA(cuda) => unsafe { cuda.copy_device_to_host(dst, src, bytes, stream) },
            Driver::Dummy(dummy) => unsafe { dummy.copy_device_to_host(dst, src, bytes, stream) },
        }
    }

    pub(crate) fn load_module(&self, binary: &[u8], options: &[(JitOption, i64)]) -> Result<NativeHandle, BackendError> {
        match self {
            Driver::CUDA(cuda) => cuda.load_module(binary, options),
            Driver::Dummy(dummy) => dummy.load_module(binary, options),
        }
    }

    pub(crate) fn module_function(&self, module: NativeHandle, name: &str) -> Result<NativeHandle, BackendError> {
        match self {
            Driver::CUDA(cuda) => cuda.module_function(module, name),
            Driver::Dummy(dummy) => dummy.module_function(module, name),
        }
    }

    pub(crate) fn unload_module(&self, module: NativeHandle) -> Result<(), BackendError> {
        match self {
            Driver::CUDA(cuda) => cuda.unload_module(module),
            Driver::Dummy(dummy) => dummy.unload_module(module),
        }
    }

    /// Block size giving maximum occupancy for `function`
    pub(crate) fn max_potential_block_size(&self, function: NativeHandle) -> Result<u32, BackendError> {
        match self {
            Driver::CUDA(cuda) => cuda.max_potential_block_size(function),
            Driver::Dummy(dummy) => dummy.max_potential_block_size(function),
        }
    }

    pub(crate) fn launch_kernel(
        &self,
        function: NativeHandle,
        grid: [u32; 3],
        block: [u32; 3],
        stream: NativeHandle,
        args: &[u8],
    ) -> Result<(), BackendError> {
        match self {
            Driver::CUDA(cuda) => cuda.launch_kernel(function, grid, block, stream, args),
            Driver::Dummy(dummy) => dummy.launch_kernel(function, grid, block, stream, args),
        }
    }
}
