//! Accelerator execution runtime.
//!
//! Owns device command streams, synchronizes them through recyclable events,
//! caches loaded kernel binaries per execution plan and computes launch geometry.

use std::sync::Arc;

mod backend;
mod code_cache;
mod config;
mod context;
mod device;
mod error;
mod event;
mod kernel_args;
mod memory;
mod module;
mod profiler;
mod scheduler;
mod stream;
mod stream_table;

pub use backend::{
    CUDAConfig, CUDADriver, Driver, DummyConfig, DummyDriver, DummyLaunch, EventPair, JitOption, NativeHandle,
    NvmlPowerMetric,
};
pub use code_cache::{parse_jit_flags, CodeCache};
pub use config::{RuntimeConfig, DEFAULT_EVENT_WINDOW};
pub use context::{DeviceContext, EventHandle, LaunchDescriptor, LaunchDimensions};
pub use device::{ByteOrder, Device};
pub use error::{Bailout, BailoutKind, BackendError, ErrorStatus, Fatal, FatalKind, RuntimeError};
pub use event::{Event, EventDescriptor, EventId, EventPool, EventStatus};
pub use kernel_args::{marshal, KernelArg};
pub use memory::{BufferProvider, DeviceBuffer, MemoryManager};
pub use module::Module;
pub use profiler::{MetricProfiler, NoProfiler, PowerMetric, Profiler, ProfilerType};
pub use scheduler::{calculate_block_size, Scheduler};
pub use stream::{HostElement, Stream};
pub use stream_table::StreamTable;

/// Identifies one independent activation of the runtime, the unit of resource isolation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExecutionPlanId(pub u64);

impl std::fmt::Display for ExecutionPlanId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("#{}", self.0))
    }
}

/// Enumerates every device of every enabled backend and wraps it in a context.
///
/// Power sampling through NVML is attached to CUDA devices when profiling is enabled
/// and the library loads.
pub fn initialize_devices(config: &RuntimeConfig) -> Result<Vec<Arc<DeviceContext>>, RuntimeError> {
    let devices = backend::initialize_backends(config).map_err(|err| {
        if config.debug_dev() {
            log::info!("{err}");
        }
        RuntimeError::NoDeviceAvailable
    })?;
    let contexts = devices
        .into_iter()
        .map(|(device, driver)| {
            if config.debug_dev() {
                log::info!(
                    "{} device {device}, {} threads per block, {} MiB",
                    driver.name(),
                    device.max_threads_per_block,
                    device.total_memory / (1024 * 1024)
                );
            }
            let ordinal = device.ordinal;
            let is_cuda = matches!(*driver, Driver::CUDA(_));
            let context = DeviceContext::new(device, driver, config.clone());
            if is_cuda && config.profiler() {
                match NvmlPowerMetric::new(ordinal) {
                    Ok(power) => return Arc::new(context.with_power_metric(Box::new(power))),
                    Err(err) => {
                        if config.debug_dev() {
                            log::info!("Power metric unavailable: {err}");
                        }
                    }
                }
            }
            Arc::new(context)
        })
        .collect();
    Ok(contexts)
}
