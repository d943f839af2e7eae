//! Per device entry point of the runtime.
//!
//! A `DeviceContext` is shared by every thread and execution plan that uses its
//! device. Streams, code caches and kernel stack frames are kept per plan, so
//! resetting one plan never touches another.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;

use crate::{
    backend::{Driver, EventPair},
    code_cache::CodeCache,
    config::RuntimeConfig,
    device::{ByteOrder, Device},
    error::RuntimeError,
    event::{EventId, EventStatus},
    kernel_args::{marshal, KernelArg},
    memory::{BufferProvider, DeviceBuffer, MemoryManager},
    module::Module,
    profiler::{MetricProfiler, NoProfiler, PowerMetric, Profiler, ProfilerType},
    scheduler::Scheduler,
    stream::{HostElement, Stream},
    stream_table::StreamTable,
    ExecutionPlanId,
};

/// How a kernel should be launched, filled in by the launch planner
#[derive(Debug, Clone, Default)]
pub struct LaunchDescriptor {
    pub kernel_name: String,
    /// Task the launch belongs to, used as the profiler key
    pub task: String,
    pub dimensions: usize,
    pub global_work: Vec<u64>,
    /// User defined block size
    pub local_work: Option<Vec<u64>>,
    /// User defined grid, only honored together with `local_work`
    pub grid_override: Option<[u32; 3]>,
    /// Serial tasks run on a single thread
    pub parallel: bool,
    /// If non zero, replaces every global work entry
    pub batch_threads: u64,
    /// Log the block and grid of this launch
    pub thread_info: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchDimensions {
    pub block: [u32; 3],
    pub grid: [u32; 3],
}

/// Event bound to the stream that produced it
#[derive(Debug, Clone)]
pub struct EventHandle {
    stream: Arc<Mutex<Stream>>,
    id: EventId,
}

impl EventHandle {
    pub fn id(&self) -> EventId {
        self.id
    }

    /// Blocks until the event completed
    pub fn wait_on(&self) -> Result<(), RuntimeError> {
        self.stream.lock().wait_event(self.id)
    }

    /// Device time of the operation in nanoseconds
    pub fn elapsed_time(&self) -> Result<u64, RuntimeError> {
        self.stream.lock().elapsed_time(self.id)
    }

    pub fn status(&self) -> EventStatus {
        self.stream.lock().event_status(self.id)
    }

    /// Host time spent issuing the operation in nanoseconds
    pub fn dispatch_time(&self) -> Option<u64> {
        self.stream.lock().dispatch_time(self.id)
    }

    /// `None` once the event was recycled
    pub fn native_pair(&self) -> Option<EventPair> {
        self.stream.lock().event_pair(self.id)
    }
}

pub struct DeviceContext {
    device: Arc<Device>,
    driver: Arc<Driver>,
    config: RuntimeConfig,
    scheduler: Scheduler,
    buffers: Arc<BufferProvider>,
    memory: MemoryManager,
    stream_tables: Mutex<BTreeMap<ExecutionPlanId, Arc<StreamTable>>>,
    code_caches: Mutex<BTreeMap<ExecutionPlanId, Arc<CodeCache>>>,
    plan_ids: Mutex<BTreeSet<ExecutionPlanId>>,
    profiler: Arc<dyn Profiler>,
    power: Option<Box<dyn PowerMetric>>,
    was_reset: AtomicBool,
}

impl std::fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceContext")
            .field("device", &self.device)
            .field("driver", &self.driver.name())
            .field("plan_ids", &*self.plan_ids.lock())
            .field("was_reset", &self.was_reset.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl DeviceContext {
    pub fn new(device: Device, driver: Arc<Driver>, config: RuntimeConfig) -> DeviceContext {
        let device = Arc::new(device);
        let buffers = Arc::new(BufferProvider::new(driver.clone(), device.total_memory));
        let profiler: Arc<dyn Profiler> =
            if config.profiler() { Arc::new(MetricProfiler::new()) } else { Arc::new(NoProfiler) };
        DeviceContext {
            scheduler: Scheduler::new(&device),
            memory: MemoryManager::new(buffers.clone()),
            buffers,
            device,
            driver,
            config,
            stream_tables: Mutex::new(BTreeMap::new()),
            code_caches: Mutex::new(BTreeMap::new()),
            plan_ids: Mutex::new(BTreeSet::new()),
            profiler,
            power: None,
            was_reset: AtomicBool::new(false),
        }
    }

    /// Replaces the profiler, metrics are only written when profiling is enabled in the config
    pub fn with_profiler(mut self, profiler: Arc<dyn Profiler>) -> DeviceContext {
        self.profiler = profiler;
        self
    }

    pub fn with_power_metric(mut self, power: Box<dyn PowerMetric>) -> DeviceContext {
        self.power = Some(power);
        self
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.device.byte_order
    }

    pub fn driver(&self) -> &Arc<Driver> {
        &self.driver
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn profiler(&self) -> &Arc<dyn Profiler> {
        &self.profiler
    }

    /// Current board power draw in milliwatts, if a power metric is attached
    pub fn power_usage(&self) -> Option<u64> {
        self.power.as_ref().and_then(|power| power.power_usage_mw())
    }

    fn stream_table(&self, plan: ExecutionPlanId) -> Arc<StreamTable> {
        let table = self.stream_tables.lock().entry(plan).or_insert_with(|| Arc::new(StreamTable::new(plan))).clone();
        self.plan_ids.lock().insert(plan);
        table
    }

    /// Stream of the calling thread for `plan`, created on first use
    pub fn stream(&self, plan: ExecutionPlanId) -> Result<Arc<Mutex<Stream>>, RuntimeError> {
        self.stream_table(plan).get(&self.device, &self.driver, &self.config)
    }

    pub fn stream_if_present(&self, plan: ExecutionPlanId) -> Option<Arc<Mutex<Stream>>> {
        let table = self.stream_tables.lock().get(&plan).cloned();
        table.and_then(|table| table.stream_if_present(&self.device))
    }

    /// Number of live streams of `plan` on this device
    pub fn stream_count(&self, plan: ExecutionPlanId) -> usize {
        self.stream_tables.lock().get(&plan).map_or(0, |table| table.len())
    }

    pub fn registered_plan_ids(&self) -> Vec<ExecutionPlanId> {
        self.plan_ids.lock().iter().copied().collect()
    }

    /// Computes the geometry, writes the arguments into the plan's kernel stack frame and
    /// launches `module` on the calling thread's stream.
    pub fn enqueue_kernel_launch(
        &self,
        plan: ExecutionPlanId,
        module: &Module,
        descriptor: &LaunchDescriptor,
        args: &[KernelArg],
    ) -> Result<EventId, RuntimeError> {
        let kernel_max_threads =
            module.potential_block_size_max_occupancy(&self.driver)?.min(self.device.max_threads_per_block);
        let LaunchDimensions { block, grid } = self.scheduler.launch_dimensions(descriptor, kernel_max_threads)?;
        if descriptor.thread_info || self.config.thread_info() || self.config.debug_sched() {
            log::info!(
                "{} on {}: global {:?}, block {block:?}, grid {grid:?}",
                module.kernel_name(),
                self.device,
                descriptor.global_work
            );
        }

        let stream = self.stream(plan)?;
        let mut stream = stream.lock();
        let frame_bytes = Device::ARG_SLOT_BYTES * (args.len() + 1);
        // Frames belong to this thread's stream, earlier launches on it may still read the old one
        let frame = self.memory.kernel_stack_frame(plan, frame_bytes, || stream.sync())?;
        let blob = marshal(args, frame, self.device.byte_order);

        let copy_in = stream.enqueue_async_write(frame, blob.len(), blob.as_slice(), 0, &[])?;
        let launch = stream.enqueue_kernel_launch(module, &blob, grid, block)?;

        if self.config.profiler() {
            let task = descriptor.task.as_str();
            if let Some(dispatch) = stream.dispatch_time(copy_in) {
                self.profiler.add_value_to_metric(ProfilerType::CopyInTime, task, dispatch);
            }
            self.profiler.add_value_to_metric(ProfilerType::TotalCopyInSizeBytes, task, blob.len() as u64);
            if let Some(milliwatts) = self.power_usage() {
                self.profiler.set_task_power_usage(ProfilerType::PowerUsageMw, task, milliwatts);
            }
            let kernel_time = stream.elapsed_time(launch)?;
            let dispatch_time = stream.dispatch_time(launch).unwrap_or(0);
            self.profiler.add_to_timer(ProfilerType::TotalKernelTime, kernel_time);
            self.profiler.add_to_timer(ProfilerType::TotalDispatchKernelTime, dispatch_time);
            self.profiler.set_task_timer(ProfilerType::TaskKernelTime, task, kernel_time);
        }
        Ok(launch)
    }

    fn profile_transfer(&self, stream: &Stream, id: EventId) {
        if self.config.profiler() {
            if let Some(dispatch) = stream.dispatch_time(id) {
                self.profiler.add_to_timer(ProfilerType::TotalDispatchDataTransfersTime, dispatch);
            }
        }
    }

    /// Copies device memory into `dst` and returns once the data arrived
    pub fn read_buffer<T: HostElement>(
        &self,
        plan: ExecutionPlanId,
        address: u64,
        length: usize,
        dst: &mut [T],
        host_offset: usize,
        wait: &[EventId],
    ) -> Result<EventId, RuntimeError> {
        let stream = self.stream(plan)?;
        let mut stream = stream.lock();
        let id = stream.enqueue_read(address, length, dst, host_offset, wait)?;
        self.profile_transfer(&stream, id);
        Ok(id)
    }

    pub fn write_buffer<T: HostElement>(
        &self,
        plan: ExecutionPlanId,
        address: u64,
        length: usize,
        src: &[T],
        host_offset: usize,
        wait: &[EventId],
    ) -> Result<EventId, RuntimeError> {
        let stream = self.stream(plan)?;
        let mut stream = stream.lock();
        let id = stream.enqueue_write(address, length, src, host_offset, wait)?;
        self.profile_transfer(&stream, id);
        Ok(id)
    }

    /// # Safety
    /// `dst` must stay alive and untouched until the returned event completed.
    pub unsafe fn enqueue_read_buffer<T: HostElement>(
        &self,
        plan: ExecutionPlanId,
        address: u64,
        length: usize,
        dst: &mut [T],
        host_offset: usize,
        wait: &[EventId],
    ) -> Result<EventId, RuntimeError> {
        let stream = self.stream(plan)?;
        let mut stream = stream.lock();
        let id = unsafe { stream.enqueue_async_read(address, length, dst, host_offset, wait) }?;
        self.profile_transfer(&stream, id);
        Ok(id)
    }

    pub fn enqueue_write_buffer<T: HostElement>(
        &self,
        plan: ExecutionPlanId,
        address: u64,
        length: usize,
        src: &[T],
        host_offset: usize,
        wait: &[EventId],
    ) -> Result<EventId, RuntimeError> {
        let stream = self.stream(plan)?;
        let mut stream = stream.lock();
        let id = stream.enqueue_async_write(address, length, src, host_offset, wait)?;
        self.profile_transfer(&stream, id);
        Ok(id)
    }

    /// # Safety
    /// `host + host_offset` must be valid for `length` bytes of writes.
    pub unsafe fn read_buffer_raw(
        &self,
        plan: ExecutionPlanId,
        address: u64,
        length: usize,
        host: *mut u8,
        host_offset: usize,
        wait: &[EventId],
    ) -> Result<EventId, RuntimeError> {
        let stream = self.stream(plan)?;
        let mut stream = stream.lock();
        unsafe { stream.enqueue_read_raw(address, length, host, host_offset, wait) }
    }

    /// # Safety
    /// `host + host_offset` must be valid for `length` bytes of reads until the returned event completed.
    pub unsafe fn write_buffer_raw(
        &self,
        plan: ExecutionPlanId,
        address: u64,
        length: usize,
        host: *const u8,
        host_offset: usize,
        wait: &[EventId],
    ) -> Result<EventId, RuntimeError> {
        let stream = self.stream(plan)?;
        let mut stream = stream.lock();
        unsafe { stream.enqueue_write_raw(address, length, host, host_offset, wait) }
    }

    /// # Safety
    /// `host + host_offset` must be valid for `length` bytes of writes until the returned event completed.
    pub unsafe fn enqueue_read_buffer_raw(
        &self,
        plan: ExecutionPlanId,
        address: u64,
        length: usize,
        host: *mut u8,
        host_offset: usize,
        wait: &[EventId],
    ) -> Result<EventId, RuntimeError> {
        let stream = self.stream(plan)?;
        let mut stream = stream.lock();
        unsafe { stream.enqueue_async_read_raw(address, length, host, host_offset, wait) }
    }

    /// # Safety
    /// `host + host_offset` must be valid for `length` bytes of reads until the returned event completed.
    pub unsafe fn enqueue_write_buffer_raw(
        &self,
        plan: ExecutionPlanId,
        address: u64,
        length: usize,
        host: *const u8,
        host_offset: usize,
        wait: &[EventId],
    ) -> Result<EventId, RuntimeError> {
        let stream = self.stream(plan)?;
        let mut stream = stream.lock();
        unsafe { stream.enqueue_async_write_raw(address, length, host, host_offset, wait) }
    }

    pub fn enqueue_barrier(&self, plan: ExecutionPlanId, wait: Option<&[EventId]>) -> Result<EventId, RuntimeError> {
        self.stream(plan)?.lock().enqueue_barrier(wait)
    }

    /// Streams execute in order, so a marker is a barrier
    pub fn enqueue_marker(&self, plan: ExecutionPlanId, wait: Option<&[EventId]>) -> Result<EventId, RuntimeError> {
        self.enqueue_barrier(plan, wait)
    }

    /// Later work of `plan` on the calling thread waits for `event` on the device
    pub fn enqueue_wait_for(&self, plan: ExecutionPlanId, event: &EventHandle) -> Result<(), RuntimeError> {
        // Recycled events completed long ago
        let Some(pair) = event.native_pair() else {
            return Ok(());
        };
        self.stream(plan)?.lock().wait_for(pair)
    }

    pub fn resolve_event(&self, plan: ExecutionPlanId, id: EventId) -> Result<EventHandle, RuntimeError> {
        Ok(EventHandle { stream: self.stream(plan)?, id })
    }

    pub fn wait_events(&self, plan: ExecutionPlanId, ids: &[EventId]) -> Result<(), RuntimeError> {
        self.stream(plan)?.lock().wait_events(ids)
    }

    pub fn retain_event(&self, plan: ExecutionPlanId, id: EventId) -> Result<(), RuntimeError> {
        self.stream(plan)?.lock().retain_event(id);
        Ok(())
    }

    pub fn release_event(&self, plan: ExecutionPlanId, id: EventId) -> Result<(), RuntimeError> {
        self.stream(plan)?.lock().release_event(id);
        Ok(())
    }

    pub fn sync(&self, plan: ExecutionPlanId) -> Result<(), RuntimeError> {
        self.stream(plan)?.lock().sync()
    }

    pub fn flush_events(&self, plan: ExecutionPlanId) -> Result<(), RuntimeError> {
        self.sync(plan)
    }

    /// CUDA has no flush, this synchronizes
    pub fn flush(&self, plan: ExecutionPlanId) -> Result<(), RuntimeError> {
        self.sync(plan)
    }

    /// Synchronizes the calling thread's stream only if it exists
    pub fn sync_if_needed(&self, plan: ExecutionPlanId) -> Result<(), RuntimeError> {
        match self.stream_if_present(plan) {
            Some(stream) => stream.lock().sync(),
            None => Ok(()),
        }
    }

    pub fn dump_events(&self, plan: ExecutionPlanId) -> Result<(), RuntimeError> {
        let stream = self.stream(plan)?;
        let events = stream.lock().events();
        log::info!("Found {} events on device {}:", events.len(), self.device.name);
        for (id, descriptor, status) in events {
            log::info!("  slot {} gen {}: {descriptor} {status:?}", id.slot(), id.generation());
        }
        Ok(())
    }

    /// Code cache of `plan`, created on first use
    pub fn code_cache(&self, plan: ExecutionPlanId) -> Arc<CodeCache> {
        let cache = self
            .code_caches
            .lock()
            .entry(plan)
            .or_insert_with(|| Arc::new(CodeCache::new(plan, self.driver.clone(), self.config.debug_asm())))
            .clone();
        self.plan_ids.lock().insert(plan);
        cache
    }

    /// Loads `binary` for `plan`, returns the cached module if `kernel_name` was installed before.
    ///
    /// Without `flags` the JIT flags of the runtime config are used.
    pub fn install_code(
        &self,
        plan: ExecutionPlanId,
        kernel_name: &str,
        binary: &[u8],
        entry_point: &str,
        flags: Option<&str>,
        debug_dump: bool,
    ) -> Result<Arc<Module>, RuntimeError> {
        let flags = flags.unwrap_or(self.config.jit_flags());
        self.code_cache(plan).install_source(kernel_name, binary, entry_point, flags, debug_dump)
    }

    pub fn installed_code(&self, plan: ExecutionPlanId, kernel_name: &str) -> Option<Arc<Module>> {
        let cache = self.code_caches.lock().get(&plan).cloned();
        cache.and_then(|cache| cache.cached_code(kernel_name))
    }

    pub fn is_cached(&self, plan: ExecutionPlanId, kernel_name: &str) -> bool {
        let cache = self.code_caches.lock().get(&plan).cloned();
        cache.is_some_and(|cache| cache.is_cached(kernel_name))
    }

    /// Destroys the calling thread's stream of `plan`
    pub fn destroy_stream(&self, plan: ExecutionPlanId) -> Result<(), RuntimeError> {
        let table = self.stream_tables.lock().get(&plan).cloned();
        match table {
            Some(table) => table.remove_current(&self.device),
            None => Ok(()),
        }
    }

    /// Releases everything `plan` holds on this device.
    ///
    /// Streams of every thread are destroyed, the kernel stack frames are freed and
    /// cached modules are unloaded. Handles obtained before the reset must not be
    /// used afterwards. Other plans are not affected.
    pub fn reset(&self, plan: ExecutionPlanId) -> Result<(), RuntimeError> {
        let mut result = Ok(());
        let mut keep_first = |r: Result<(), RuntimeError>| {
            if let Err(err) = r {
                if result.is_ok() {
                    result = Err(err);
                }
            }
        };
        let table = self.stream_tables.lock().get(&plan).cloned();
        if let Some(table) = table {
            keep_first(table.cleanup(&self.device));
            if table.is_empty() {
                self.stream_tables.lock().remove(&plan);
            }
        }
        self.plan_ids.lock().remove(&plan);
        keep_first(self.memory.release_kernel_stack_frames(plan).map_err(RuntimeError::from));
        let cache = self.code_caches.lock().remove(&plan);
        if let Some(cache) = cache {
            keep_first(cache.reset());
        }
        self.was_reset.store(true, Ordering::Release);
        if self.config.debug_dev() {
            log::info!("Reset plan {plan} on device {}", self.device);
        }
        result
    }

    pub fn was_reset(&self) -> bool {
        self.was_reset.load(Ordering::Acquire)
    }

    pub fn set_reset_to_false(&self) {
        self.was_reset.store(false, Ordering::Release);
    }

    pub fn allocate(&self, bytes: usize) -> Result<DeviceBuffer, RuntimeError> {
        Ok(self.buffers.allocate(bytes)?)
    }

    pub fn deallocate(&self, buffer: DeviceBuffer) -> Result<(), RuntimeError> {
        Ok(self.buffers.deallocate(buffer)?)
    }

    pub fn free_bytes(&self) -> u64 {
        self.buffers.free_bytes()
    }

    /// Number of kernel stack frames on this device, one per plan and launching thread
    pub fn kernel_stack_frames(&self) -> usize {
        self.memory.len()
    }
}
