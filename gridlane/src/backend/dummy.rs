//! Simulated device.
//!
//! Operations are queued per stream and executed in FIFO order when something
//! synchronizes on them, the same way a real device drains its queues. Memory
//! lives on the host and time is a virtual nanosecond clock advanced by every
//! executed operation.

use std::{
    collections::{BTreeMap, VecDeque},
    sync::Arc,
};

use nanoserde::DeJson;
use parking_lot::Mutex;

use super::{Driver, JitOption, NativeHandle};
use crate::{
    device::{ByteOrder, Device},
    error::{BackendError, ErrorStatus},
};

#[derive(Default, Debug, Clone, DeJson)]
pub struct DummyConfig {
    pub enabled: bool,
    /// Number of simulated devices, defaults to one
    pub devices: Option<usize>,
    pub max_threads_per_block: Option<u32>,
    /// Block size reported by the occupancy query
    pub occupancy_block_size: Option<u32>,
    pub total_memory: Option<u64>,
}

/// One kernel launch as seen by the simulated device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DummyLaunch {
    pub function: String,
    pub grid: [u32; 3],
    pub block: [u32; 3],
    pub args: Vec<u8>,
    pub stream: NativeHandle,
}

#[derive(Debug)]
pub struct DummyDriver {
    occupancy_block_size: u32,
    state: Mutex<DummyState>,
}

#[derive(Debug)]
enum DummyOp {
    Record(NativeHandle),
    CopyH2D { dst: u64, data: Vec<u8> },
    // Host pointer stored as address, written when the op executes
    CopyD2H { dst: usize, src: u64, bytes: usize },
    Launch(DummyLaunch),
    Wait(NativeHandle),
}

#[derive(Debug)]
struct DummyEvent {
    stream: NativeHandle,
    timestamp: Option<u64>,
}

#[derive(Debug, Default)]
struct DummyState {
    next_handle: usize,
    next_address: u64,
    clock: u64,
    streams: BTreeMap<NativeHandle, VecDeque<DummyOp>>,
    events: BTreeMap<NativeHandle, DummyEvent>,
    buffers: BTreeMap<u64, Vec<u8>>,
    modules: BTreeMap<NativeHandle, Vec<u8>>,
    functions: BTreeMap<NativeHandle, (NativeHandle, String)>,
    module_loads: usize,
    jit_options: Vec<Vec<(JitOption, i64)>>,
    launches: Vec<DummyLaunch>,
}

pub(super) fn initialize_device(
    config: &DummyConfig,
    debug_dev: bool,
) -> Result<Vec<(Device, Arc<Driver>)>, BackendError> {
    if !config.enabled {
        return Err(BackendError { status: ErrorStatus::Initialization, context: "Dummy configured out.".into() });
    }
    if debug_dev {
        log::info!("Using dummy backend");
    }
    let max_threads_per_block = config.max_threads_per_block.unwrap_or(1024);
    let devices = (0..config.devices.unwrap_or(1))
        .map(|index| {
            let device = Device {
                index,
                ordinal: index as u32,
                name: format!("Dummy device {index}"),
                byte_order: ByteOrder::LittleEndian,
                max_threads_per_block,
                max_block_extents: [1024, 1024, 64],
                max_grid_extents: [i32::MAX as u32, 65535, 65535],
                total_memory: config.total_memory.unwrap_or(1024 * 1024 * 1024),
            };
            let driver = DummyDriver::new(config.occupancy_block_size.unwrap_or(max_threads_per_block));
            (device, Arc::new(Driver::Dummy(driver)))
        })
        .collect();
    Ok(devices)
}

fn not_found(status: ErrorStatus, what: &str, handle: NativeHandle) -> BackendError {
    BackendError { status, context: format!("Dummy {what} {handle:?} does not exist.").into() }
}

impl DummyState {
    fn handle(&mut self) -> NativeHandle {
        self.next_handle += 1;
        NativeHandle(self.next_handle)
    }

    fn region(&mut self, address: u64, bytes: usize) -> Result<&mut [u8], BackendError> {
        let Some((&base, buffer)) = self.buffers.range_mut(..=address).next_back() else {
            return Err(BackendError { status: ErrorStatus::MemoryCopyH2D, context: "Unmapped address.".into() });
        };
        let offset = (address - base) as usize;
        if offset + bytes > buffer.len() {
            return Err(BackendError {
                status: ErrorStatus::MemoryCopyH2D,
                context: format!("Copy of {bytes} bytes at {address:#x} is out of bounds.").into(),
            });
        }
        Ok(&mut buffer[offset..offset + bytes])
    }

    /// Executes queued operations of `stream`, stops right after `until` is recorded
    fn drain(&mut self, stream: NativeHandle, until: Option<NativeHandle>) -> Result<(), BackendError> {
        loop {
            let Some(op) = self.streams.get_mut(&stream).and_then(VecDeque::pop_front) else {
                return Ok(());
            };
            match op {
                DummyOp::Record(event) => {
                    self.clock += 1;
                    if let Some(e) = self.events.get_mut(&event) {
                        e.timestamp = Some(self.clock);
                    }
                    if until == Some(event) {
                        return Ok(());
                    }
                }
                DummyOp::CopyH2D { dst, data } => {
                    self.region(dst, data.len())?.copy_from_slice(&data);
                    self.clock += data.len() as u64;
                }
                DummyOp::CopyD2H { dst, src, bytes } => {
                    let region = self.region(src, bytes)?;
                    // Safety: the caller of copy_device_to_host keeps dst alive until this op executes
                    unsafe { std::ptr::copy_nonoverlapping(region.as_ptr(), dst as *mut u8, bytes) };
                    self.clock += bytes as u64;
                }
                DummyOp::Launch(launch) => {
                    let threads: u64 = launch.grid.iter().chain(&launch.block).map(|&x| u64::from(x)).product();
                    self.clock += threads;
                    self.launches.push(launch);
                }
                DummyOp::Wait(event) => self.complete(event)?,
            }
        }
    }

    fn complete(&mut self, event: NativeHandle) -> Result<(), BackendError> {
        let Some(e) = self.events.get(&event) else {
            // Destroyed events were waited on before destruction
            return Ok(());
        };
        if e.timestamp.is_none() {
            let stream = e.stream;
            self.drain(stream, Some(event))?;
        }
        Ok(())
    }

    fn enqueue(&mut self, stream: NativeHandle, op: DummyOp) -> Result<(), BackendError> {
        let Some(queue) = self.streams.get_mut(&stream) else {
            return Err(not_found(ErrorStatus::StreamSync, "stream", stream));
        };
        queue.push_back(op);
        Ok(())
    }
}

impl DummyDriver {
    pub fn new(occupancy_block_size: u32) -> DummyDriver {
        DummyDriver {
            occupancy_block_size,
            state: Mutex::new(DummyState { next_address: 0x1000_0000, ..Default::default() }),
        }
    }

    /// How many times a module was loaded
    pub fn module_loads(&self) -> usize {
        self.state.lock().module_loads
    }

    /// JIT options passed to every module load, in order
    pub fn jit_options(&self) -> Vec<Vec<(JitOption, i64)>> {
        self.state.lock().jit_options.clone()
    }

    /// Kernel launches that already executed, in execution order
    pub fn launches(&self) -> Vec<DummyLaunch> {
        self.state.lock().launches.clone()
    }

    pub fn live_events(&self) -> usize {
        self.state.lock().events.len()
    }

    pub fn live_streams(&self) -> usize {
        self.state.lock().streams.len()
    }

    pub fn live_modules(&self) -> usize {
        self.state.lock().modules.len()
    }

    pub fn live_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }

    /// Number of operations still waiting in the queue of `stream`
    pub fn pending_ops(&self, stream: NativeHandle) -> usize {
        self.state.lock().streams.get(&stream).map_or(0, VecDeque::len)
    }

    /// Timestamp at which the event was reached, `None` while it is still queued
    pub fn event_timestamp(&self, event: NativeHandle) -> Option<u64> {
        self.state.lock().events.get(&event).and_then(|e| e.timestamp)
    }

    pub(super) fn create_stream(&self) -> Result<NativeHandle, BackendError> {
        let mut state = self.state.lock();
        let stream = state.handle();
        state.streams.insert(stream, VecDeque::new());
        Ok(stream)
    }

    pub(super) fn destroy_stream(&self, stream: NativeHandle) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        // Work already enqueued still runs to completion
        state.drain(stream, None)?;
        match state.streams.remove(&stream) {
            Some(_) => Ok(()),
            None => Err(not_found(ErrorStatus::StreamDestruction, "stream", stream)),
        }
    }

    pub(super) fn synchronize_stream(&self, stream: NativeHandle) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        if !state.streams.contains_key(&stream) {
            return Err(not_found(ErrorStatus::StreamSync, "stream", stream));
        }
        state.drain(stream, None)
    }

    pub(super) fn stream_wait_event(&self, stream: NativeHandle, event: NativeHandle) -> Result<(), BackendError> {
        self.state.lock().enqueue(stream, DummyOp::Wait(event))
    }

    pub(super) fn record_event(&self, stream: NativeHandle) -> Result<NativeHandle, BackendError> {
        let mut state = self.state.lock();
        let event = state.handle();
        state.enqueue(stream, DummyOp::Record(event))?;
        state.events.insert(event, DummyEvent { stream, timestamp: None });
        Ok(event)
    }

    pub(super) fn query_event(&self, event: NativeHandle) -> Result<bool, BackendError> {
        match self.state.lock().events.get(&event) {
            Some(e) => Ok(e.timestamp.is_some()),
            None => Err(not_found(ErrorStatus::EventQuery, "event", event)),
        }
    }

    pub(super) fn synchronize_event(&self, event: NativeHandle) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        if !state.events.contains_key(&event) {
            return Err(not_found(ErrorStatus::EventSync, "event", event));
        }
        state.complete(event)
    }

    pub(super) fn elapsed_time(&self, before: NativeHandle, after: NativeHandle) -> Result<u64, BackendError> {
        let state = self.state.lock();
        let timestamp = |event| {
            state.events.get(&event).and_then(|e: &DummyEvent| e.timestamp).ok_or_else(|| BackendError {
                status: ErrorStatus::EventQuery,
                context: format!("Dummy event {event:?} has not completed.").into(),
            })
        };
        Ok(timestamp(after)?.saturating_sub(timestamp(before)?))
    }

    pub(super) fn destroy_event(&self, event: NativeHandle) -> Result<(), BackendError> {
        match self.state.lock().events.remove(&event) {
            Some(_) => Ok(()),
            None => Err(not_found(ErrorStatus::EventDestruction, "event", event)),
        }
    }

    pub(super) fn allocate(&self, bytes: usize) -> Result<u64, BackendError> {
        let mut state = self.state.lock();
        let address = state.next_address;
        state.next_address += (bytes.max(1) as u64).div_ceil(256) * 256;
        state.buffers.insert(address, vec![0; bytes]);
        Ok(address)
    }

    pub(super) fn deallocate(&self, address: u64) -> Result<(), BackendError> {
        match self.state.lock().buffers.remove(&address) {
            Some(_) => Ok(()),
            None => Err(BackendError {
                status: ErrorStatus::MemoryDeallocation,
                context: format!("Dummy address {address:#x} was not allocated.").into(),
            }),
        }
    }

    pub(super) unsafe fn copy_host_to_device(
        &self,
        dst: u64,
        src: *const u8,
        bytes: usize,
        stream: NativeHandle,
    ) -> Result<(), BackendError> {
        let data = unsafe { std::slice::from_raw_parts(src, bytes) }.to_vec();
        self.state.lock().enqueue(stream, DummyOp::CopyH2D { dst, data })
    }

    pub(super) unsafe fn copy_device_to_host(
        &self,
        dst: *mut u8,
        src: u64,
        bytes: usize,
        stream: NativeHandle,
    ) -> Result<(), BackendError> {
        self.state.lock().enqueue(stream, DummyOp::CopyD2H { dst: dst as usize, src, bytes })
    }

    pub(super) fn load_module(&self, binary: &[u8], options: &[(JitOption, i64)]) -> Result<NativeHandle, BackendError> {
        let mut state = self.state.lock();
        state.module_loads += 1;
        state.jit_options.push(options.to_vec());
        if binary.iter().all(|&b| b == 0 || b.is_ascii_whitespace()) {
            return Err(BackendError { status: ErrorStatus::ModuleLoad, context: "Empty module binary.".into() });
        }
        let module = state.handle();
        state.modules.insert(module, binary.to_vec());
        Ok(module)
    }

    pub(super) fn module_function(&self, module: NativeHandle, name: &str) -> Result<NativeHandle, BackendError> {
        let mut state = self.state.lock();
        let Some(binary) = state.modules.get(&module) else {
            return Err(not_found(ErrorStatus::ModuleLoad, "module", module));
        };
        if !String::from_utf8_lossy(binary).contains(name) {
            return Err(BackendError {
                status: ErrorStatus::ModuleLoad,
                context: format!("Entry point {name} not found in module.").into(),
            });
        }
        let function = state.handle();
        state.functions.insert(function, (module, name.into()));
        Ok(function)
    }

    pub(super) fn unload_module(&self, module: NativeHandle) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.functions.retain(|_, (m, _)| *m != module);
        match state.modules.remove(&module) {
            Some(_) => Ok(()),
            None => Err(not_found(ErrorStatus::ModuleUnload, "module", module)),
        }
    }

    pub(super) fn max_potential_block_size(&self, function: NativeHandle) -> Result<u32, BackendError> {
        if !self.state.lock().functions.contains_key(&function) {
            return Err(not_found(ErrorStatus::OccupancyQuery, "function", function));
        }
        Ok(self.occupancy_block_size)
    }

    pub(super) fn launch_kernel(
        &self,
        function: NativeHandle,
        grid: [u32; 3],
        block: [u32; 3],
        stream: NativeHandle,
        args: &[u8],
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        let Some((_, name)) = state.functions.get(&function) else {
            return Err(not_found(ErrorStatus::KernelLaunch, "function", function));
        };
        let launch = DummyLaunch { function: name.clone(), grid, block, args: args.to_vec(), stream };
        state.enqueue(stream, DummyOp::Launch(launch))
    }

    /// Reads device memory directly, bypassing every stream
    pub fn read_memory(&self, address: u64, bytes: usize) -> Option<Vec<u8>> {
        self.state.lock().region(address, bytes).ok().map(|region| region.to_vec())
    }
}
