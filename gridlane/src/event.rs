//! Recyclable device events.
//!
//! Every enqueued operation is bracketed by two native events. The pair lives in a
//! fixed size window of slots owned by the stream. Once the cursor moves past a slot
//! the event in it may be recycled, unless the slot was retained.

use std::fmt::Display;

use crate::{
    backend::{Driver, EventPair},
    error::{BackendError, ErrorStatus, RuntimeError},
};

/// Handle of an event inside one stream's window.
///
/// The generation changes every time the slot is reused, so a handle to a recycled
/// event can be told apart from the event currently stored in the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId {
    slot: u32,
    generation: u32,
}

impl EventId {
    pub const fn slot(self) -> usize {
        self.slot as usize
    }

    pub const fn generation(self) -> u32 {
        self.generation
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    Queued,
    Running,
    Complete,
    Error,
}

/// What kind of operation an event stands for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventDescriptor {
    ParallelKernel,
    SyncBarrier,
    ReadByte,
    ReadShort,
    ReadInt,
    ReadLong,
    ReadFloat,
    ReadDouble,
    ReadHalf,
    ReadRaw,
    WriteByte,
    WriteShort,
    WriteInt,
    WriteLong,
    WriteFloat,
    WriteDouble,
    WriteHalf,
    WriteRaw,
}

impl Display for EventDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            EventDescriptor::ParallelKernel => "kernel - parallel",
            EventDescriptor::SyncBarrier => "sync - barrier",
            EventDescriptor::ReadByte => "readToHost - byte[]",
            EventDescriptor::ReadShort => "readToHost - short[]",
            EventDescriptor::ReadInt => "readToHost - int[]",
            EventDescriptor::ReadLong => "readToHost - long[]",
            EventDescriptor::ReadFloat => "readToHost - float[]",
            EventDescriptor::ReadDouble => "readToHost - double[]",
            EventDescriptor::ReadHalf => "readToHost - half[]",
            EventDescriptor::ReadRaw => "readToHost - pointer",
            EventDescriptor::WriteByte => "writeToDevice - byte[]",
            EventDescriptor::WriteShort => "writeToDevice - short[]",
            EventDescriptor::WriteInt => "writeToDevice - int[]",
            EventDescriptor::WriteLong => "writeToDevice - long[]",
            EventDescriptor::WriteFloat => "writeToDevice - float[]",
            EventDescriptor::WriteDouble => "writeToDevice - double[]",
            EventDescriptor::WriteHalf => "writeToDevice - half[]",
            EventDescriptor::WriteRaw => "writeToDevice - pointer",
        })
    }
}

/// Native event pair of one enqueued operation
#[derive(Debug)]
pub struct Event {
    pair: EventPair,
    descriptor: EventDescriptor,
    generation: u32,
    completed: bool,
    // Host bytes of a staged write, kept alive until the copy completed
    staging: Option<Vec<u8>>,
    dispatch_time: u64,
}

impl Event {
    pub const fn descriptor(&self) -> EventDescriptor {
        self.descriptor
    }

    pub const fn pair(&self) -> EventPair {
        self.pair
    }

    /// Host time spent issuing the native call, in nanoseconds
    pub const fn dispatch_time(&self) -> u64 {
        self.dispatch_time
    }

    pub const fn is_completed(&self) -> bool {
        self.completed
    }

    /// Blocks until the operation completed
    pub(crate) fn wait(&mut self, driver: &Driver) -> Result<(), BackendError> {
        if !self.completed {
            driver.synchronize_event(self.pair.after)?;
            self.completed = true;
            self.staging = None;
        }
        Ok(())
    }

    pub(crate) fn status(&self, driver: &Driver) -> EventStatus {
        if self.completed {
            return EventStatus::Complete;
        }
        match driver.query_event(self.pair.after) {
            Ok(true) => EventStatus::Complete,
            Ok(false) => match driver.query_event(self.pair.before) {
                Ok(true) => EventStatus::Running,
                Ok(false) => EventStatus::Queued,
                Err(_) => EventStatus::Error,
            },
            Err(_) => EventStatus::Error,
        }
    }

    /// Device time between the start and the end of the operation in nanoseconds
    pub(crate) fn elapsed_time(&mut self, driver: &Driver) -> Result<u64, BackendError> {
        self.wait(driver)?;
        driver.elapsed_time(self.pair.before, self.pair.after)
    }

    fn destroy(self, driver: &Driver) -> Result<(), BackendError> {
        let before = driver.destroy_event(self.pair.before);
        driver.destroy_event(self.pair.after)?;
        before
    }
}

/// Bitset of retained slots
#[derive(Debug)]
struct RetainSet {
    words: Vec<u64>,
    capacity: usize,
}

impl RetainSet {
    fn new(capacity: usize) -> RetainSet {
        RetainSet { words: vec![0; capacity.div_ceil(64)], capacity }
    }

    fn contains(&self, index: usize) -> bool {
        index < self.capacity && (self.words[index / 64] >> (index % 64)) & 1 == 1
    }

    fn insert(&mut self, index: usize) {
        self.words[index / 64] |= 1 << (index % 64);
    }

    fn remove(&mut self, index: usize) {
        self.words[index / 64] &= !(1 << (index % 64));
    }

    fn clear(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
    }

    fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// First clear index at or after `from`, `capacity` if there is none
    fn next_clear(&self, from: usize) -> usize {
        let mut i = from;
        while i < self.capacity {
            // Bits below i count as set
            let word = self.words[i / 64] | ((1u64 << (i % 64)) - 1);
            if word != u64::MAX {
                return ((i / 64) * 64 + (!word).trailing_zeros() as usize).min(self.capacity);
            }
            i = (i / 64 + 1) * 64;
        }
        self.capacity
    }
}

/// Fixed window of event slots owned by one stream
#[derive(Debug)]
pub struct EventPool {
    slots: Vec<Option<Event>>,
    generations: Vec<u32>,
    retained: RetainSet,
    cursor: usize,
    circular: bool,
    high_water: usize,
    debug: bool,
}

impl EventPool {
    pub fn new(capacity: usize, circular: bool, debug: bool) -> EventPool {
        assert!(capacity > 0, "Event window needs at least one slot.");
        EventPool {
            slots: (0..capacity).map(|_| None).collect(),
            generations: vec![0; capacity],
            retained: RetainSet::new(capacity),
            cursor: 0,
            circular,
            high_water: 0,
            debug,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of events currently held
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn retained(&self) -> usize {
        self.retained.count()
    }

    /// Stores a freshly recorded event pair.
    ///
    /// Retained slots are skipped. A non retained event already in the chosen
    /// slot is waited on and destroyed before it is overwritten.
    pub fn register(
        &mut self,
        driver: &Driver,
        pair: EventPair,
        descriptor: EventDescriptor,
        staging: Option<Vec<u8>>,
        dispatch_time: u64,
    ) -> Result<EventId, RuntimeError> {
        Self::check_pair(pair, descriptor)?;
        let slot = self.reserve(driver)?;
        Ok(self.commit(slot, pair, descriptor, staging, dispatch_time))
    }

    /// Fails with a driver integrity error if either handle is null
    pub fn check_pair(pair: EventPair, descriptor: EventDescriptor) -> Result<(), RuntimeError> {
        if !pair.is_valid() {
            log::error!("Driver returned invalid event handles {pair:?} for {descriptor}.");
            return Err(RuntimeError::driver_integrity(format!(
                "invalid event handles {pair:?} for {descriptor}"
            )));
        }
        Ok(())
    }

    /// Finds the slot the next event goes to and frees it.
    ///
    /// Retained slots are skipped. A non retained event already in the slot is
    /// waited on and destroyed. The slot stays empty until [`EventPool::commit`],
    /// an empty slot is handed out again by the next call.
    pub fn reserve(&mut self, driver: &Driver) -> Result<usize, RuntimeError> {
        if self.cursor >= self.capacity() || self.retained.contains(self.cursor) {
            self.find_next_slot()?;
        }
        let slot = self.cursor;
        debug_assert!(!self.retained.contains(slot));
        if let Some(old) = self.slots[slot].as_mut() {
            if self.debug {
                log::debug!("Recycling event slot {slot} holding {}", old.descriptor);
            }
            // Still owned by the slot if this fails
            old.wait(driver)?;
        }
        if let Some(old) = self.slots[slot].take() {
            old.destroy(driver)?;
        }
        Ok(slot)
    }

    /// Stores a valid pair in a slot returned by [`EventPool::reserve`]
    pub fn commit(
        &mut self,
        slot: usize,
        pair: EventPair,
        descriptor: EventDescriptor,
        staging: Option<Vec<u8>>,
        dispatch_time: u64,
    ) -> EventId {
        debug_assert!(pair.is_valid());
        assert!(
            self.slots[slot].is_none() && !self.retained.contains(slot),
            "Event slot {slot} was not reserved."
        );
        let generation = self.generations[slot].wrapping_add(1);
        self.generations[slot] = generation;
        self.slots[slot] = Some(Event { pair, descriptor, generation, completed: false, staging, dispatch_time });
        self.high_water = self.high_water.max(slot + 1);
        self.advance(slot);
        EventId { slot: slot as u32, generation }
    }

    fn advance(&mut self, from: usize) {
        let next = self.retained.next_clear(from + 1);
        self.cursor = if self.circular && next >= self.capacity() { 0 } else { next };
    }

    fn find_next_slot(&mut self) -> Result<(), RuntimeError> {
        let capacity = self.capacity();
        let mut next = self.retained.next_clear(self.cursor.saturating_add(1));
        if next >= capacity && self.circular {
            next = self.retained.next_clear(0);
        }
        if next >= capacity {
            let retained = self.retained.count();
            log::error!("Event window is full (retained={retained}, capacity={capacity}).");
            return Err(RuntimeError::resource_exhaustion(format!(
                "event window is full (retained={retained}, capacity={capacity})"
            )));
        }
        self.cursor = next;
        Ok(())
    }

    /// Pins the slot so `register` skips it until released
    pub fn retain(&mut self, id: EventId) {
        assert!(self.resolve(id).is_some(), "Retaining event {id:?} that was already recycled.");
        self.retained.insert(id.slot());
    }

    pub fn release(&mut self, id: EventId) {
        if self.resolve(id).is_some() {
            self.retained.remove(id.slot());
        }
    }

    pub fn is_retained(&self, id: EventId) -> bool {
        self.resolve(id).is_some() && self.retained.contains(id.slot())
    }

    /// Event behind `id`, `None` once its slot was recycled or the pool reset
    pub fn resolve(&self, id: EventId) -> Option<&Event> {
        self.slots.get(id.slot())?.as_ref().filter(|event| event.generation == id.generation)
    }

    pub fn resolve_mut(&mut self, id: EventId) -> Option<&mut Event> {
        self.slots.get_mut(id.slot())?.as_mut().filter(|event| event.generation == id.generation)
    }

    /// All held events up to the highest slot ever used
    pub fn events(&self) -> Vec<(EventId, &Event)> {
        self.slots[..self.high_water]
            .iter()
            .enumerate()
            .filter_map(|(slot, event)| {
                event.as_ref().map(|e| (EventId { slot: slot as u32, generation: e.generation }, e))
            })
            .collect()
    }

    /// Waits on and destroys every held event and rewinds the window
    pub fn reset(&mut self, driver: &Driver) -> Result<(), BackendError> {
        let mut result = Ok(());
        for slot in &mut self.slots {
            if let Some(mut event) = slot.take() {
                // Destroyed even if the wait failed
                let waited = event.wait(driver);
                let status = waited.and(event.destroy(driver));
                if let Err(err) = status {
                    if result.is_ok() {
                        result = Err(err);
                    }
                }
            }
        }
        self.retained.clear();
        self.cursor = 0;
        self.high_water = 0;
        result
    }

    pub(crate) fn stale(id: EventId) -> BackendError {
        BackendError {
            status: ErrorStatus::InvalidEvent,
            context: format!("Event {id:?} was recycled.").into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::{DummyDriver, NativeHandle},
        error::FatalKind,
    };
    use rand::{rngs::SmallRng, Rng, SeedableRng};

    fn driver() -> (Driver, NativeHandle) {
        let driver = Driver::Dummy(DummyDriver::new(256));
        let stream = driver.create_stream().unwrap();
        (driver, stream)
    }

    fn pair(driver: &Driver, stream: NativeHandle) -> EventPair {
        EventPair { before: driver.record_event(stream).unwrap(), after: driver.record_event(stream).unwrap() }
    }

    #[test]
    fn fifth_register_recycles_first_slot() {
        let (driver, stream) = driver();
        let mut pool = EventPool::new(4, true, false);
        let ids: Vec<EventId> = (0..4)
            .map(|_| pool.register(&driver, pair(&driver, stream), EventDescriptor::ParallelKernel, None, 0).unwrap())
            .collect();
        assert_eq!(ids.iter().map(|id| id.slot()).collect::<Vec<_>>(), [0, 1, 2, 3]);
        let first = pool.resolve(ids[0]).unwrap().pair();
        let fifth = pool.register(&driver, pair(&driver, stream), EventDescriptor::SyncBarrier, None, 0).unwrap();
        assert_eq!(fifth.slot(), 0);
        assert!(pool.resolve(ids[0]).is_none());
        // The recycled pair was destroyed, only the four newer pairs and the fifth remain
        assert!(driver.query_event(first.after).is_err());
        assert_eq!(driver.as_dummy().unwrap().live_events(), 8);
    }

    #[test]
    fn retained_slot_is_skipped() {
        let (driver, stream) = driver();
        let mut pool = EventPool::new(3, true, false);
        let a = pool.register(&driver, pair(&driver, stream), EventDescriptor::WriteInt, None, 0).unwrap();
        pool.retain(a);
        for _ in 0..5 {
            let id = pool.register(&driver, pair(&driver, stream), EventDescriptor::ReadInt, None, 0).unwrap();
            assert_ne!(id.slot(), a.slot());
        }
        assert!(pool.resolve(a).is_some());
        pool.release(a);
        let reused = (0..3)
            .map(|_| pool.register(&driver, pair(&driver, stream), EventDescriptor::ReadInt, None, 0).unwrap())
            .any(|id| id.slot() == a.slot());
        assert!(reused);
        assert!(pool.resolve(a).is_none());
    }

    #[test]
    fn window_full_without_circular_reuse() {
        let (driver, stream) = driver();
        let mut pool = EventPool::new(2, false, false);
        pool.register(&driver, pair(&driver, stream), EventDescriptor::WriteByte, None, 0).unwrap();
        pool.register(&driver, pair(&driver, stream), EventDescriptor::WriteByte, None, 0).unwrap();
        let err = pool.register(&driver, pair(&driver, stream), EventDescriptor::WriteByte, None, 0).unwrap_err();
        assert_eq!(err.fatal_kind(), Some(FatalKind::ResourceExhaustion));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn window_full_when_everything_retained() {
        let (driver, stream) = driver();
        let mut pool = EventPool::new(2, true, false);
        for _ in 0..2 {
            let id = pool.register(&driver, pair(&driver, stream), EventDescriptor::WriteLong, None, 0).unwrap();
            pool.retain(id);
        }
        let err = pool.register(&driver, pair(&driver, stream), EventDescriptor::WriteLong, None, 0).unwrap_err();
        assert!(err.to_string().contains("retained=2, capacity=2"));
    }

    #[test]
    fn null_handle_is_fatal() {
        let (driver, stream) = driver();
        let mut pool = EventPool::new(2, true, false);
        let bad = EventPair { before: driver.record_event(stream).unwrap(), after: NativeHandle::NULL };
        let err = pool.register(&driver, bad, EventDescriptor::ParallelKernel, None, 0).unwrap_err();
        assert_eq!(err.fatal_kind(), Some(FatalKind::DriverIntegrity));
        assert!(pool.is_empty());
    }

    #[test]
    fn failed_recycle_keeps_the_old_event() {
        let (driver, stream) = driver();
        let mut pool = EventPool::new(1, true, false);
        let first = pool.register(&driver, pair(&driver, stream), EventDescriptor::WriteInt, None, 0).unwrap();
        let old = pool.resolve(first).unwrap().pair();
        // Lost behind the pool's back, waiting on it fails
        driver.destroy_event(old.after).unwrap();
        assert!(pool.reserve(&driver).is_err());
        assert_eq!(pool.resolve(first).map(Event::pair), Some(old));
        assert!(driver.query_event(old.before).is_ok());
        // Reset still destroys what is left
        assert!(pool.reset(&driver).is_err());
        assert!(driver.query_event(old.before).is_err());
        assert!(pool.is_empty());
    }

    #[test]
    fn reserved_slot_is_handed_out_again() {
        let (driver, stream) = driver();
        let mut pool = EventPool::new(2, false, false);
        let slot = pool.reserve(&driver).unwrap();
        assert_eq!(pool.reserve(&driver).unwrap(), slot);
        let id = pool.commit(slot, pair(&driver, stream), EventDescriptor::ReadRaw, None, 0);
        assert_eq!(id.slot(), slot);
        assert_eq!(pool.reserve(&driver).unwrap(), 1);
    }

    #[test]
    fn reset_is_idempotent() {
        let (driver, stream) = driver();
        let mut pool = EventPool::new(8, true, false);
        let ids: Vec<_> = (0..5)
            .map(|_| pool.register(&driver, pair(&driver, stream), EventDescriptor::ReadFloat, None, 0).unwrap())
            .collect();
        pool.retain(ids[2]);
        assert_eq!(pool.events().len(), 5);
        pool.reset(&driver).unwrap();
        pool.reset(&driver).unwrap();
        assert!(pool.is_empty());
        assert_eq!(pool.retained(), 0);
        assert_eq!(driver.as_dummy().unwrap().live_events(), 0);
        let id = pool.register(&driver, pair(&driver, stream), EventDescriptor::ReadFloat, None, 0).unwrap();
        assert_eq!(id.slot(), 0);
        assert_ne!(id, ids[0]);
    }

    #[test]
    fn next_clear_crosses_words() {
        let mut set = RetainSet::new(130);
        (0..128).for_each(|i| set.insert(i));
        assert_eq!(set.next_clear(0), 128);
        set.insert(128);
        set.insert(129);
        assert_eq!(set.next_clear(5), 130);
        set.remove(64);
        assert_eq!(set.next_clear(3), 64);
        assert_eq!(set.count(), 129);
    }

    // Random register, retain and release sequences never touch a retained event
    #[test]
    fn retained_events_survive_random_sequences() {
        let mut rng = SmallRng::seed_from_u64(0x5eed);
        for capacity in [1usize, 2, 3, 7, 16, 65] {
            let (driver, stream) = driver();
            let mut pool = EventPool::new(capacity, true, false);
            let mut live: Vec<EventId> = Vec::new();
            let mut retained: Vec<(EventId, EventPair)> = Vec::new();
            for _ in 0..400 {
                match rng.gen_range(0..4) {
                    0 | 1 => {
                        match pool.register(&driver, pair(&driver, stream), EventDescriptor::ReadByte, None, 0) {
                            Ok(id) => live.push(id),
                            Err(err) => {
                                assert_eq!(err.fatal_kind(), Some(FatalKind::ResourceExhaustion));
                                assert_eq!(retained.len(), capacity);
                            }
                        }
                    }
                    2 => {
                        live.retain(|id| pool.resolve(*id).is_some());
                        if !live.is_empty() {
                            let id = live[rng.gen_range(0..live.len())];
                            if !pool.is_retained(id) {
                                pool.retain(id);
                                retained.push((id, pool.resolve(id).unwrap().pair()));
                            }
                        }
                    }
                    _ => {
                        if !retained.is_empty() {
                            let (id, _) = retained.swap_remove(rng.gen_range(0..retained.len()));
                            pool.release(id);
                        }
                    }
                }
                for (id, pair) in &retained {
                    let event = pool.resolve(*id).expect("retained event was recycled");
                    assert_eq!(event.pair(), *pair);
                    assert!(driver.query_event(pair.after).is_ok());
                }
            }
        }
    }
}
