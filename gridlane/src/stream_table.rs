use std::{
    collections::{hash_map::Entry, HashMap},
    sync::Arc,
    thread::ThreadId,
};

use parking_lot::Mutex;

use crate::{
    backend::Driver, config::RuntimeConfig, device::Device, error::RuntimeError, stream::Stream,
    ExecutionPlanId,
};

/// Streams of one execution plan, one per device and calling thread
#[derive(Debug)]
pub struct StreamTable {
    plan: ExecutionPlanId,
    streams: Mutex<HashMap<(usize, ThreadId), Arc<Mutex<Stream>>>>,
}

impl StreamTable {
    pub fn new(plan: ExecutionPlanId) -> StreamTable {
        StreamTable { plan, streams: Mutex::new(HashMap::new()) }
    }

    pub fn plan(&self) -> ExecutionPlanId {
        self.plan
    }

    /// Stream of the calling thread on `device`, created on first use.
    ///
    /// The lookup and the creation happen under one lock, so racing threads
    /// can never create two streams for the same key.
    pub fn get(
        &self,
        device: &Arc<Device>,
        driver: &Arc<Driver>,
        config: &RuntimeConfig,
    ) -> Result<Arc<Mutex<Stream>>, RuntimeError> {
        let key = (device.index, std::thread::current().id());
        match self.streams.lock().entry(key) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let stream = Stream::new(self.plan, device.clone(), driver.clone(), config)?;
                Ok(entry.insert(Arc::new(Mutex::new(stream))).clone())
            }
        }
    }

    /// Stream of the calling thread on `device` if it was already created
    pub fn stream_if_present(&self, device: &Device) -> Option<Arc<Mutex<Stream>>> {
        self.streams.lock().get(&(device.index, std::thread::current().id())).cloned()
    }

    /// Destroys the calling thread's stream on `device` and forgets it
    pub fn remove_current(&self, device: &Device) -> Result<(), RuntimeError> {
        let removed = self.streams.lock().remove(&(device.index, std::thread::current().id()));
        match removed {
            Some(stream) => stream.lock().destroy(),
            None => Ok(()),
        }
    }

    /// Destroys and forgets every stream on `device`, of every thread.
    ///
    /// All streams are destroyed even if some fail, the first error is returned.
    pub fn cleanup(&self, device: &Device) -> Result<(), RuntimeError> {
        let removed: Vec<Arc<Mutex<Stream>>> = {
            let mut streams = self.streams.lock();
            let keys: Vec<(usize, ThreadId)> =
                streams.keys().filter(|(index, _)| *index == device.index).copied().collect();
            keys.iter().filter_map(|key| streams.remove(key)).collect()
        };
        let mut result = Ok(());
        for stream in removed {
            if let Err(err) = stream.lock().destroy() {
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }

    /// Number of live streams over all devices
    pub fn len(&self) -> usize {
        self.streams.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
