use std::collections::BTreeMap;

use parking_lot::Mutex;

/// Metrics written by the runtime, all times are in nanoseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProfilerType {
    CopyInTime,
    TotalCopyInSizeBytes,
    TotalDispatchDataTransfersTime,
    TotalKernelTime,
    TaskKernelTime,
    TotalDispatchKernelTime,
    PowerUsageMw,
}

/// Sink for timers and counters produced while dispatching work
pub trait Profiler: Send + Sync {
    fn set_timer(&self, metric: ProfilerType, value: u64);

    fn timer(&self, metric: ProfilerType) -> u64;

    /// Adds `value` to a timer in one step
    fn add_to_timer(&self, metric: ProfilerType, value: u64);

    fn add_value_to_metric(&self, metric: ProfilerType, task: &str, value: u64);

    fn set_task_timer(&self, metric: ProfilerType, task: &str, value: u64);

    fn set_task_power_usage(&self, metric: ProfilerType, task: &str, milliwatts: u64);
}

/// Used when profiling is disabled
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProfiler;

impl Profiler for NoProfiler {
    fn set_timer(&self, _: ProfilerType, _: u64) {}

    fn timer(&self, _: ProfilerType) -> u64 {
        0
    }

    fn add_to_timer(&self, _: ProfilerType, _: u64) {}

    fn add_value_to_metric(&self, _: ProfilerType, _: &str, _: u64) {}

    fn set_task_timer(&self, _: ProfilerType, _: &str, _: u64) {}

    fn set_task_power_usage(&self, _: ProfilerType, _: &str, _: u64) {}
}

/// Keeps every metric in memory
#[derive(Debug, Default)]
pub struct MetricProfiler {
    timers: Mutex<BTreeMap<ProfilerType, u64>>,
    task_metrics: Mutex<BTreeMap<(ProfilerType, String), u64>>,
}

impl MetricProfiler {
    pub fn new() -> MetricProfiler {
        MetricProfiler::default()
    }

    /// Value recorded for one task, zero if nothing was recorded
    pub fn task_metric(&self, metric: ProfilerType, task: &str) -> u64 {
        self.task_metrics.lock().get(&(metric, task.into())).copied().unwrap_or(0)
    }
}

impl Profiler for MetricProfiler {
    fn set_timer(&self, metric: ProfilerType, value: u64) {
        self.timers.lock().insert(metric, value);
    }

    fn timer(&self, metric: ProfilerType) -> u64 {
        self.timers.lock().get(&metric).copied().unwrap_or(0)
    }

    fn add_to_timer(&self, metric: ProfilerType, value: u64) {
        *self.timers.lock().entry(metric).or_insert(0) += value;
    }

    fn add_value_to_metric(&self, metric: ProfilerType, task: &str, value: u64) {
        *self.task_metrics.lock().entry((metric, task.into())).or_insert(0) += value;
    }

    fn set_task_timer(&self, metric: ProfilerType, task: &str, value: u64) {
        self.task_metrics.lock().insert((metric, task.into()), value);
    }

    fn set_task_power_usage(&self, metric: ProfilerType, task: &str, milliwatts: u64) {
        self.task_metrics.lock().insert((metric, task.into()), milliwatts);
    }
}

/// Instantaneous power draw of a device
pub trait PowerMetric: Send + Sync {
    fn power_usage_mw(&self) -> Option<u64>;
}
