//! Ordered command queue of one thread for one execution plan on one device.

use std::{sync::Arc, time::Instant};

use crate::{
    backend::{Driver, EventPair, NativeHandle},
    config::RuntimeConfig,
    device::Device,
    error::{BackendError, RuntimeError},
    event::{EventDescriptor, EventId, EventPool, EventStatus},
    module::Module,
    ExecutionPlanId,
};

mod private {
    pub trait Sealed {}
}

/// Element type of host arrays that can be transferred.
///
/// Implemented for plain numeric types without padding, so any slice of them
/// can be viewed as bytes.
pub trait HostElement: private::Sealed + Copy + 'static {
    const READ: EventDescriptor;
    const WRITE: EventDescriptor;
}

macro_rules! host_element {
    ($t:ty, $read:ident, $write:ident) => {
        impl private::Sealed for $t {}
        impl HostElement for $t {
            const READ: EventDescriptor = EventDescriptor::$read;
            const WRITE: EventDescriptor = EventDescriptor::$write;
        }
    };
}

host_element!(i8, ReadByte, WriteByte);
host_element!(u8, ReadByte, WriteByte);
host_element!(i16, ReadShort, WriteShort);
// Chars are 16 bit code units and travel as shorts
host_element!(u16, ReadShort, WriteShort);
host_element!(i32, ReadInt, WriteInt);
host_element!(i64, ReadLong, WriteLong);
host_element!(f32, ReadFloat, WriteFloat);
host_element!(f64, ReadDouble, WriteDouble);
host_element!(half::f16, ReadHalf, WriteHalf);

fn bytes_of<T: HostElement>(data: &[T]) -> &[u8] {
    unsafe { std::slice::from_raw_parts(data.as_ptr().cast(), std::mem::size_of_val(data)) }
}

fn bytes_of_mut<T: HostElement>(data: &mut [T]) -> &mut [u8] {
    unsafe { std::slice::from_raw_parts_mut(data.as_mut_ptr().cast(), std::mem::size_of_val(data)) }
}

#[track_caller]
fn check_host_range(host_bytes: usize, length: usize, host_offset: usize) {
    assert!(
        host_offset.checked_add(length).is_some_and(|end| end <= host_bytes),
        "Transfer of {length} bytes at host offset {host_offset} exceeds host buffer of {host_bytes} bytes."
    );
}

#[derive(Debug)]
pub struct Stream {
    plan: ExecutionPlanId,
    device: Arc<Device>,
    driver: Arc<Driver>,
    handle: NativeHandle,
    events: EventPool,
    destroyed: bool,
}

impl Stream {
    pub fn new(
        plan: ExecutionPlanId,
        device: Arc<Device>,
        driver: Arc<Driver>,
        config: &RuntimeConfig,
    ) -> Result<Stream, RuntimeError> {
        let handle = driver.create_stream()?;
        if handle.is_null() {
            log::error!("Driver returned a null stream for plan {plan} on device {device}.");
            return Err(RuntimeError::driver_integrity(format!("null stream on device {device}")));
        }
        if config.debug_dev() {
            log::info!("Created stream {handle:?} for plan {plan} on device {device}");
        }
        let events = EventPool::new(config.event_window(), config.circular_events(), config.debug_events());
        Ok(Stream { plan, device, driver, handle, events, destroyed: false })
    }

    pub fn plan(&self) -> ExecutionPlanId {
        self.plan
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn handle(&self) -> NativeHandle {
        self.handle
    }

    pub fn event_pool(&self) -> &EventPool {
        &self.events
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    #[track_caller]
    fn check_active(&self) {
        assert!(
            !self.destroyed,
            "Stream of plan {} on device {} used after it was destroyed.",
            self.plan, self.device
        );
    }

    /// Records an event pair around `op` and registers it in the window.
    ///
    /// The slot is reserved before `op` is issued. Once `op` is queued it may
    /// reference host memory of the caller or `staging`, so every later failure
    /// drains the stream before returning.
    fn record(
        &mut self,
        descriptor: EventDescriptor,
        staging: Option<Vec<u8>>,
        op: impl FnOnce(&Driver, NativeHandle) -> Result<(), BackendError>,
    ) -> Result<EventId, RuntimeError> {
        let driver = self.driver.as_ref();
        let slot = self.events.reserve(driver)?;
        let before = driver.record_event(self.handle)?;
        let begin = Instant::now();
        if let Err(err) = op(driver, self.handle) {
            let _ = driver.destroy_event(before);
            return Err(err.into());
        }
        let dispatch_time = begin.elapsed().as_nanos() as u64;
        let pair = match driver.record_event(self.handle) {
            Ok(after) => EventPair { before, after },
            Err(err) => {
                self.abandon(EventPair { before, after: NativeHandle::NULL });
                return Err(err.into());
            }
        };
        if let Err(err) = EventPool::check_pair(pair, descriptor) {
            self.abandon(pair);
            return Err(err);
        }
        Ok(self.events.commit(slot, pair, descriptor, staging, dispatch_time))
    }

    /// Waits for issued work that could not be tracked and destroys its events
    fn abandon(&self, pair: EventPair) {
        if let Err(err) = self.driver.synchronize_stream(self.handle) {
            log::error!("Failed to drain stream {:?} of plan {} after a failed enqueue: {err}", self.handle, self.plan);
        }
        for event in [pair.before, pair.after] {
            if !event.is_null() {
                let _ = self.driver.destroy_event(event);
            }
        }
    }

    /// Blocks the host until every event in `wait` completed
    fn wait_host(&mut self, wait: &[EventId]) -> Result<(), RuntimeError> {
        self.wait_events(wait)
    }

    /// Makes later work on this stream depend on `wait` without blocking the host
    fn wait_device(&mut self, wait: &[EventId]) -> Result<(), RuntimeError> {
        for &id in wait {
            if let Some(event) = self.events.resolve(id) {
                if !event.is_completed() {
                    self.driver.stream_wait_event(self.handle, event.pair().after)?;
                }
            }
        }
        Ok(())
    }

    /// Makes later work on this stream wait for an event recorded on another stream
    pub fn wait_for(&mut self, pair: EventPair) -> Result<(), RuntimeError> {
        self.check_active();
        if !pair.is_valid() {
            return Err(RuntimeError::driver_integrity(format!("invalid event handles {pair:?}")));
        }
        self.driver.stream_wait_event(self.handle, pair.after)?;
        Ok(())
    }

    pub fn enqueue_kernel_launch(
        &mut self,
        module: &Module,
        args: &[u8],
        grid: [u32; 3],
        block: [u32; 3],
    ) -> Result<EventId, RuntimeError> {
        self.check_active();
        assert!(
            grid.iter().chain(&block).all(|&d| d > 0),
            "Kernel {} launched with grid {grid:?} and block {block:?}, every dimension must be positive.",
            module.kernel_name()
        );
        assert!(!module.is_invalidated(), "Kernel {} was launched after its code cache was reset.", module.kernel_name());
        let function = module.function();
        self.record(EventDescriptor::ParallelKernel, None, |driver, stream| {
            driver.launch_kernel(function, grid, block, stream, args)
        })
    }

    /// Reads `length` bytes at `address` into `dst` starting at byte `host_offset`.
    ///
    /// Waits for `wait` before issuing and returns once the data arrived.
    pub fn enqueue_read<T: HostElement>(
        &mut self,
        address: u64,
        length: usize,
        dst: &mut [T],
        host_offset: usize,
        wait: &[EventId],
    ) -> Result<EventId, RuntimeError> {
        self.check_active();
        let bytes = bytes_of_mut(dst);
        check_host_range(bytes.len(), length, host_offset);
        self.wait_host(wait)?;
        let host = bytes[host_offset..].as_mut_ptr();
        let id = self.record(T::READ, None, |driver, stream| unsafe {
            driver.copy_device_to_host(host, address, length, stream)
        })?;
        self.finish_read(id)
    }

    /// Like [`Stream::enqueue_read`], for a raw host pointer.
    ///
    /// # Safety
    /// `host + host_offset` must be valid for `length` bytes of writes.
    pub unsafe fn enqueue_read_raw(
        &mut self,
        address: u64,
        length: usize,
        host: *mut u8,
        host_offset: usize,
        wait: &[EventId],
    ) -> Result<EventId, RuntimeError> {
        self.check_active();
        self.wait_host(wait)?;
        let host = unsafe { host.add(host_offset) };
        let id = self.record(EventDescriptor::ReadRaw, None, |driver, stream| unsafe {
            driver.copy_device_to_host(host, address, length, stream)
        })?;
        self.finish_read(id)
    }

    /// Blocks until a synchronous read landed, the destination is only borrowed until then
    fn finish_read(&mut self, id: EventId) -> Result<EventId, RuntimeError> {
        if let Err(err) = self.wait_event(id) {
            if let Err(sync) = self.driver.synchronize_stream(self.handle) {
                log::error!("Failed to drain stream {:?} of plan {} after a failed read: {sync}", self.handle, self.plan);
            }
            return Err(err);
        }
        Ok(id)
    }

    /// Issues a read and returns immediately, `wait` becomes a device side dependency.
    ///
    /// # Safety
    /// `dst` must stay alive and untouched until the returned event completed.
    pub unsafe fn enqueue_async_read<T: HostElement>(
        &mut self,
        address: u64,
        length: usize,
        dst: &mut [T],
        host_offset: usize,
        wait: &[EventId],
    ) -> Result<EventId, RuntimeError> {
        self.check_active();
        let bytes = bytes_of_mut(dst);
        check_host_range(bytes.len(), length, host_offset);
        self.wait_device(wait)?;
        let host = bytes[host_offset..].as_mut_ptr();
        self.record(T::READ, None, |driver, stream| unsafe { driver.copy_device_to_host(host, address, length, stream) })
    }

    /// # Safety
    /// `host + host_offset` must be valid for `length` bytes of writes until the returned event completed.
    pub unsafe fn enqueue_async_read_raw(
        &mut self,
        address: u64,
        length: usize,
        host: *mut u8,
        host_offset: usize,
        wait: &[EventId],
    ) -> Result<EventId, RuntimeError> {
        self.check_active();
        self.wait_device(wait)?;
        let host = unsafe { host.add(host_offset) };
        self.record(EventDescriptor::ReadRaw, None, |driver, stream| unsafe {
            driver.copy_device_to_host(host, address, length, stream)
        })
    }

    /// Writes `length` bytes of `src` starting at byte `host_offset` to `address`.
    ///
    /// Waits for `wait` before issuing. The bytes are staged, `src` is free to change
    /// as soon as this returns.
    pub fn enqueue_write<T: HostElement>(
        &mut self,
        address: u64,
        length: usize,
        src: &[T],
        host_offset: usize,
        wait: &[EventId],
    ) -> Result<EventId, RuntimeError> {
        self.check_active();
        let bytes = bytes_of(src);
        check_host_range(bytes.len(), length, host_offset);
        self.wait_host(wait)?;
        self.staged_write(T::WRITE, address, bytes[host_offset..host_offset + length].to_vec())
    }

    /// Staged write that returns without waiting, `wait` becomes a device side dependency
    pub fn enqueue_async_write<T: HostElement>(
        &mut self,
        address: u64,
        length: usize,
        src: &[T],
        host_offset: usize,
        wait: &[EventId],
    ) -> Result<EventId, RuntimeError> {
        self.check_active();
        let bytes = bytes_of(src);
        check_host_range(bytes.len(), length, host_offset);
        self.wait_device(wait)?;
        self.staged_write(T::WRITE, address, bytes[host_offset..host_offset + length].to_vec())
    }

    fn staged_write(&mut self, descriptor: EventDescriptor, address: u64, staging: Vec<u8>) -> Result<EventId, RuntimeError> {
        // Moving the Vec into the event slot does not move its heap buffer
        let host = staging.as_ptr();
        let length = staging.len();
        self.record(descriptor, Some(staging), |driver, stream| unsafe {
            driver.copy_host_to_device(address, host, length, stream)
        })
    }

    /// # Safety
    /// `host + host_offset` must be valid for `length` bytes of reads until the returned event completed.
    pub unsafe fn enqueue_write_raw(
        &mut self,
        address: u64,
        length: usize,
        host: *const u8,
        host_offset: usize,
        wait: &[EventId],
    ) -> Result<EventId, RuntimeError> {
        self.check_active();
        self.wait_host(wait)?;
        let host = unsafe { host.add(host_offset) };
        self.record(EventDescriptor::WriteRaw, None, |driver, stream| unsafe {
            driver.copy_host_to_device(address, host, length, stream)
        })
    }

    /// # Safety
    /// `host + host_offset` must be valid for `length` bytes of reads until the returned event completed.
    pub unsafe fn enqueue_async_write_raw(
        &mut self,
        address: u64,
        length: usize,
        host: *const u8,
        host_offset: usize,
        wait: &[EventId],
    ) -> Result<EventId, RuntimeError> {
        self.check_active();
        self.wait_device(wait)?;
        let host = unsafe { host.add(host_offset) };
        self.record(EventDescriptor::WriteRaw, None, |driver, stream| unsafe {
            driver.copy_host_to_device(address, host, length, stream)
        })
    }

    /// Waits for `wait`, or for the whole stream when none are given, then
    /// registers an empty barrier event later work can depend on.
    pub fn enqueue_barrier(&mut self, wait: Option<&[EventId]>) -> Result<EventId, RuntimeError> {
        self.check_active();
        match wait {
            Some(events) if !events.is_empty() => self.wait_events(events)?,
            _ => self.sync()?,
        }
        self.record(EventDescriptor::SyncBarrier, None, |_, _| Ok(()))
    }

    /// Blocks until everything enqueued so far completed
    pub fn sync(&mut self) -> Result<(), RuntimeError> {
        self.check_active();
        self.driver.synchronize_stream(self.handle)?;
        Ok(())
    }

    pub fn wait_events(&mut self, ids: &[EventId]) -> Result<(), RuntimeError> {
        for &id in ids {
            self.wait_event(id)?;
        }
        Ok(())
    }

    /// Blocks until the event completed, recycled events completed long ago
    pub fn wait_event(&mut self, id: EventId) -> Result<(), RuntimeError> {
        let driver = self.driver.as_ref();
        if let Some(event) = self.events.resolve_mut(id) {
            event.wait(driver)?;
        }
        Ok(())
    }

    pub fn event_status(&self, id: EventId) -> EventStatus {
        match self.events.resolve(id) {
            Some(event) => event.status(&self.driver),
            None => EventStatus::Complete,
        }
    }

    /// Device execution time of the event in nanoseconds, waits for it first
    pub fn elapsed_time(&mut self, id: EventId) -> Result<u64, RuntimeError> {
        let driver = self.driver.as_ref();
        match self.events.resolve_mut(id) {
            Some(event) => Ok(event.elapsed_time(driver)?),
            None => Err(EventPool::stale(id).into()),
        }
    }

    /// Host time spent issuing the operation in nanoseconds
    pub fn dispatch_time(&self, id: EventId) -> Option<u64> {
        self.events.resolve(id).map(|event| event.dispatch_time())
    }

    /// Native handles of a live event, used to chain work across streams
    pub fn event_pair(&self, id: EventId) -> Option<EventPair> {
        self.events.resolve(id).map(|event| event.pair())
    }

    pub fn retain_event(&mut self, id: EventId) {
        self.events.retain(id);
    }

    pub fn release_event(&mut self, id: EventId) {
        self.events.release(id);
    }

    /// Every live event with its current status
    pub fn events(&self) -> Vec<(EventId, EventDescriptor, EventStatus)> {
        self.events
            .events()
            .into_iter()
            .map(|(id, event)| (id, event.descriptor(), event.status(&self.driver)))
            .collect()
    }

    /// Waits on and destroys every event of this stream
    pub fn reset(&mut self) -> Result<(), RuntimeError> {
        self.check_active();
        self.events.reset(&self.driver)?;
        Ok(())
    }

    /// Releases the native stream, calling it twice is a no-op
    pub fn destroy(&mut self) -> Result<(), RuntimeError> {
        if self.destroyed {
            return Ok(());
        }
        let reset = self.events.reset(&self.driver);
        let destroyed = self.driver.destroy_stream(self.handle);
        self.destroyed = true;
        reset?;
        destroyed?;
        Ok(())
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if let Err(err) = self.destroy() {
            log::warn!("Failed to destroy stream of plan {}: {err}", self.plan);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{backend::DummyDriver, error::FatalKind};

    fn stream(window: usize) -> Stream {
        stream_with(RuntimeConfig { event_window: Some(window), ..Default::default() })
    }

    fn stream_with(config: RuntimeConfig) -> Stream {
        let device = Arc::new(Device {
            index: 0,
            ordinal: 0,
            name: "test".into(),
            byte_order: crate::device::ByteOrder::LittleEndian,
            max_threads_per_block: 1024,
            max_block_extents: [1024, 1024, 64],
            max_grid_extents: [65535; 3],
            total_memory: 1 << 20,
        });
        let driver = Arc::new(Driver::Dummy(DummyDriver::new(256)));
        Stream::new(ExecutionPlanId(7), device, driver, &config).unwrap()
    }

    #[test]
    fn staged_write_then_read() {
        let mut stream = stream(8);
        let address = stream.driver.allocate(64).unwrap();
        let src: Vec<i32> = (0..16).collect();
        let mut dst = vec![0i32; 16];
        let write = stream.enqueue_write(address, 64, &src, 0, &[]).unwrap();
        assert_eq!(stream.event_status(write), EventStatus::Queued);
        stream.enqueue_read(address, 32, &mut dst, 16, &[write]).unwrap();
        assert_eq!(&dst[4..12], &src[..8]);
        assert!(dst[..4].iter().all(|&x| x == 0));
        assert_eq!(stream.event_status(write), EventStatus::Complete);
    }

    #[test]
    fn async_write_waits_on_device() {
        let mut stream = stream(8);
        let address = stream.driver.allocate(8).unwrap();
        let first = stream.enqueue_write(address, 8, &[1.5f64], 0, &[]).unwrap();
        let second = stream.enqueue_async_write(address, 8, &[2.5f64], 0, &[first]).unwrap();
        let dummy = stream.driver.as_dummy().unwrap();
        assert!(dummy.pending_ops(stream.handle()) > 0);
        stream.wait_event(second).unwrap();
        let mut out = [0f64];
        stream.enqueue_read(address, 8, &mut out, 0, &[]).unwrap();
        assert_eq!(out, [2.5]);
    }

    #[test]
    fn barrier_without_events_syncs_stream() {
        let mut stream = stream(8);
        let address = stream.driver.allocate(4).unwrap();
        let write = stream.enqueue_write(address, 4, &[3u8, 1, 4, 1], 0, &[]).unwrap();
        let barrier = stream.enqueue_barrier(None).unwrap();
        assert_eq!(stream.event_status(write), EventStatus::Complete);
        let events = stream.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1], (barrier, EventDescriptor::SyncBarrier, EventStatus::Queued));
    }

    // a, b, c on one stream complete in issue order
    #[test]
    fn operations_complete_in_order() {
        let mut stream = stream(16);
        let address = stream.driver.allocate(12).unwrap();
        let ids: Vec<EventId> = (0..3u32)
            .map(|i| stream.enqueue_write(address + 4 * u64::from(i), 4, &[i as i32], 0, &[]).unwrap())
            .collect();
        stream.wait_event(ids[1]).unwrap();
        assert_eq!(stream.event_status(ids[0]), EventStatus::Complete);
        assert_eq!(stream.event_status(ids[1]), EventStatus::Complete);
        assert_ne!(stream.event_status(ids[2]), EventStatus::Complete);
        stream.sync().unwrap();
        let dummy = stream.driver.as_dummy().unwrap();
        let finished: Vec<u64> =
            ids.iter().map(|&id| dummy.event_timestamp(stream.event_pair(id).unwrap().after).unwrap()).collect();
        assert!(finished.windows(2).all(|w| w[0] < w[1]));
        assert!(stream.elapsed_time(ids[2]).unwrap() > 0);
    }

    // A read that cannot be tracked must not leave a copy into the caller's slice behind
    #[test]
    fn full_window_issues_nothing() {
        let config = RuntimeConfig { event_window: Some(2), circular_events: Some(false), ..Default::default() };
        let mut stream = stream_with(config);
        let address = stream.driver.allocate(16).unwrap();
        stream.enqueue_barrier(None).unwrap();
        stream.enqueue_barrier(None).unwrap();
        let driver = stream.driver.clone();
        let dummy = driver.as_dummy().unwrap();
        let (pending, live) = (dummy.pending_ops(stream.handle()), dummy.live_events());
        {
            let mut dst = vec![0i32; 4];
            let err = stream.enqueue_read(address, 16, &mut dst, 0, &[]).unwrap_err();
            assert_eq!(err.fatal_kind(), Some(FatalKind::ResourceExhaustion));
        }
        let err = stream.enqueue_write(address, 4, &[1i32], 0, &[]).unwrap_err();
        assert_eq!(err.fatal_kind(), Some(FatalKind::ResourceExhaustion));
        assert_eq!(dummy.pending_ops(stream.handle()), pending);
        assert_eq!(dummy.live_events(), live);
        stream.sync().unwrap();
        assert_eq!(dummy.read_memory(address, 16), Some(vec![0; 16]));
    }

    #[test]
    #[should_panic(expected = "used after it was destroyed")]
    fn enqueue_after_destroy_panics() {
        let mut stream = stream(4);
        stream.destroy().unwrap();
        let _ = stream.enqueue_barrier(None);
    }

    #[test]
    #[should_panic(expected = "exceeds host buffer")]
    fn read_past_host_buffer_panics() {
        let mut stream = stream(4);
        let address = stream.driver.allocate(64).unwrap();
        let mut dst = [0u16; 4];
        let _ = stream.enqueue_read(address, 8, &mut dst, 4, &[]);
    }

    #[test]
    fn destroy_releases_native_objects() {
        let mut stream = stream(4);
        let driver = stream.driver.clone();
        for _ in 0..6 {
            stream.enqueue_barrier(None).unwrap();
        }
        assert_eq!(driver.as_dummy().unwrap().live_events(), 8);
        stream.destroy().unwrap();
        stream.destroy().unwrap();
        assert_eq!(driver.as_dummy().unwrap().live_events(), 0);
        assert_eq!(driver.as_dummy().unwrap().live_streams(), 0);
    }
}
