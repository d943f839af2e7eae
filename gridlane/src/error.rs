use std::fmt::Display;

/// Errors returned by the runtime.
///
/// Bailouts are recoverable, the caller is expected to fall back to a non accelerated
/// execution path. Fatal errors mean the pool or the native driver is in a state
/// the runtime can not continue from.
#[derive(Debug)]
pub enum RuntimeError {
    /// Recoverable failure, candidate for host fallback
    Bailout(Bailout),
    /// Non recoverable failure
    Fatal(Fatal),
    /// Native driver call failed
    Backend(BackendError),
    /// All backends failed to initialize or were configured out
    NoDeviceAvailable,
}

/// Kind of recoverable failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BailoutKind {
    /// Malformed or unsupported compiler flags
    Configuration,
    /// Native module load failed
    Compilation,
    /// Launch geometry could not be computed
    Scheduling,
}

#[derive(Debug)]
pub struct Bailout {
    pub kind: BailoutKind,
    pub context: Box<str>,
}

/// Kind of fatal failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalKind {
    /// Event window is full and no slot can be recycled
    ResourceExhaustion,
    /// Native layer returned a null or invalid handle
    DriverIntegrity,
}

#[derive(Debug)]
pub struct Fatal {
    pub kind: FatalKind,
    pub context: Box<str>,
}

fn with_location(e: impl Into<String>, location: &std::panic::Location<'_>) -> Box<str> {
    let mut e: String = e.into();
    e.push_str(&format!(", {}:{}:{}", location.file(), location.line(), location.column()));
    e.into()
}

impl RuntimeError {
    /// Malformed compiler flags
    #[track_caller]
    pub fn configuration(e: impl Into<String>) -> Self {
        let context = with_location(e, std::panic::Location::caller());
        Self::Bailout(Bailout { kind: BailoutKind::Configuration, context })
    }

    /// Module failed to load
    #[track_caller]
    pub fn compilation(e: impl Into<String>) -> Self {
        let context = with_location(e, std::panic::Location::caller());
        Self::Bailout(Bailout { kind: BailoutKind::Compilation, context })
    }

    /// Launch dimensions could not be computed
    #[track_caller]
    pub fn scheduling(e: impl Into<String>) -> Self {
        let context = with_location(e, std::panic::Location::caller());
        Self::Bailout(Bailout { kind: BailoutKind::Scheduling, context })
    }

    /// Event window exhausted
    #[track_caller]
    pub fn resource_exhaustion(e: impl Into<String>) -> Self {
        let context = with_location(e, std::panic::Location::caller());
        Self::Fatal(Fatal { kind: FatalKind::ResourceExhaustion, context })
    }

    /// Native driver handed back something unusable
    #[track_caller]
    pub fn driver_integrity(e: impl Into<String>) -> Self {
        let context = with_location(e, std::panic::Location::caller());
        Self::Fatal(Fatal { kind: FatalKind::DriverIntegrity, context })
    }

    /// True only for bailouts, the caller may retry on the host
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Bailout(_))
    }

    pub fn bailout_kind(&self) -> Option<BailoutKind> {
        match self {
            Self::Bailout(b) => Some(b.kind),
            _ => None,
        }
    }

    pub fn fatal_kind(&self) -> Option<FatalKind> {
        match self {
            Self::Fatal(f) => Some(f.kind),
            _ => None,
        }
    }
}

impl Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeError::Bailout(b) => f.write_fmt(format_args!("Bailout {:?}: {}", b.kind, b.context)),
            RuntimeError::Fatal(e) => f.write_fmt(format_args!("Fatal {:?}: {}", e.kind, e.context)),
            RuntimeError::Backend(e) => f.write_fmt(format_args!("Backend {e}")),
            RuntimeError::NoDeviceAvailable => f.write_str("No available device"),
        }
    }
}

impl std::error::Error for RuntimeError {}

#[derive(Debug)]
pub struct BackendError {
    pub status: ErrorStatus,
    pub context: Box<str>,
}

impl From<BackendError> for RuntimeError {
    fn from(value: BackendError) -> Self {
        RuntimeError::Backend(value)
    }
}

impl Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{:?}: {}", self.status, self.context))
    }
}

impl std::error::Error for BackendError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorStatus {
    /// Dynamic library was not found on the disk
    DyLibNotFound,
    /// Backend initialization failure
    Initialization,
    /// Backend deinitialization failure
    Deinitialization,
    /// Failed to enumerate devices
    DeviceEnumeration,
    /// Failed to query device for information
    DeviceQuery,
    /// Failed to allocate memory
    MemoryAllocation,
    /// Failed to deallocate memory
    MemoryDeallocation,
    /// Failed to copy memory to device
    MemoryCopyH2D,
    /// Failed to copy memory to host
    MemoryCopyD2H,
    /// Failed to create stream
    StreamCreation,
    /// Failed to synchronize stream
    StreamSync,
    /// Failed to destroy stream
    StreamDestruction,
    /// Failed to create event
    EventCreation,
    /// Failed to record event on stream
    EventRecord,
    /// Failed to query event status or timing
    EventQuery,
    /// Failed to wait for event
    EventSync,
    /// Failed to destroy event
    EventDestruction,
    /// Failed to load module
    ModuleLoad,
    /// Failed to unload module
    ModuleUnload,
    /// Failed to launch kernel
    KernelLaunch,
    /// Failed to query kernel occupancy
    OccupancyQuery,
    /// Event id does not refer to a live event
    InvalidEvent,
}
